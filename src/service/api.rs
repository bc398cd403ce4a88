use crate::store::event::parse_details;
use crate::store::{AddOutcome, Event, EventStore, StoreError};
use axum::{
    extract::{rejection::JsonRejection, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use chrono::DateTime;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

const ERROR_PREFIX: &str = "events.Errors";

/// Shared state for the RPC handlers
pub struct ServiceState {
    pub store: EventStore,
    pub upload_now: mpsc::Sender<()>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct AddRequest {
    /// JSON object text; empty or `null` means no details.
    pub details: String,
    #[serde(rename = "type")]
    pub event_type: String,
    /// Unix nanoseconds.
    pub timestamp: i64,
}

#[derive(Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct AddResult {
    pub key: Option<u64>,
    pub suppressed: bool,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct KeyRequest {
    pub key: u64,
}

/// Legacy `Queue` call: raw description bytes plus a Unix-nanosecond time.
#[derive(Debug, Serialize, Deserialize)]
pub struct QueueRequest {
    pub details: Vec<u8>,
    pub timestamp: i64,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct RpcResult<T> {
    pub result: T,
}

/// Structured error returned to RPC callers.
#[derive(Debug, Serialize, Deserialize)]
pub struct RpcErrorBody {
    pub name: String,
    pub message: String,
}

#[derive(Debug)]
pub enum ServiceError {
    InvalidArgs(String),
    NotFound(u64),
    Failed { op: &'static str, message: String },
}

impl ServiceError {
    fn store(op: &'static str, e: StoreError) -> Self {
        match e {
            StoreError::NotFound(key) => ServiceError::NotFound(key),
            StoreError::Format(e) => ServiceError::InvalidArgs(e.to_string()),
            other => ServiceError::Failed {
                op,
                message: other.to_string(),
            },
        }
    }
}

impl IntoResponse for ServiceError {
    fn into_response(self) -> Response {
        let (status, name, message) = match self {
            ServiceError::InvalidArgs(msg) => (
                StatusCode::BAD_REQUEST,
                format!("{}.InvalidArgs", ERROR_PREFIX),
                msg,
            ),
            ServiceError::NotFound(key) => (
                StatusCode::NOT_FOUND,
                format!("{}.NotFound", ERROR_PREFIX),
                format!("no key {} found", key),
            ),
            ServiceError::Failed { op, message } => (
                StatusCode::INTERNAL_SERVER_ERROR,
                format!("{}.{}Failed", ERROR_PREFIX, op),
                message,
            ),
        };

        (status, Json(RpcErrorBody { name, message })).into_response()
    }
}

impl From<JsonRejection> for ServiceError {
    fn from(rejection: JsonRejection) -> Self {
        ServiceError::InvalidArgs(rejection.body_text())
    }
}

type RpcResponse<T> = Result<Json<RpcResult<T>>, ServiceError>;

fn ok<T>(result: T) -> RpcResponse<T> {
    Ok(Json(RpcResult { result }))
}

/// POST /Add
pub async fn add(
    State(state): State<Arc<ServiceState>>,
    payload: Result<Json<AddRequest>, JsonRejection>,
) -> RpcResponse<AddResult> {
    let Json(request) = payload?;
    let details = parse_details(&request.details)
        .map_err(|e| ServiceError::InvalidArgs(format!("invalid details JSON: {}", e)))?;
    let event = Event::new(
        request.event_type,
        details,
        DateTime::from_timestamp_nanos(request.timestamp),
    );

    info!(event_type = %event.event_type(), "Adding new event");
    match state.store.add(event).await {
        Ok(AddOutcome::Stored(key)) => ok(AddResult {
            key: Some(key),
            suppressed: false,
        }),
        Ok(AddOutcome::Suppressed) => ok(AddResult {
            key: None,
            suppressed: true,
        }),
        Err(e) => {
            warn!(error = %e, "Failed to add event");
            Err(ServiceError::store("Add", e))
        }
    }
}

/// POST /Queue
pub async fn queue(
    State(state): State<Arc<ServiceState>>,
    payload: Result<Json<QueueRequest>, JsonRejection>,
) -> RpcResponse<()> {
    let Json(request) = payload?;
    debug!(bytes = request.details.len(), "Queueing legacy event");
    state
        .store
        .queue_legacy(
            request.details,
            DateTime::from_timestamp_nanos(request.timestamp),
        )
        .await
        .map_err(|e| ServiceError::store("Queue", e))?;
    ok(())
}

/// POST /Get
pub async fn get(
    State(state): State<Arc<ServiceState>>,
    payload: Result<Json<KeyRequest>, JsonRejection>,
) -> RpcResponse<String> {
    let Json(request) = payload?;
    let event = state
        .store
        .get(request.key)
        .await
        .map_err(|e| ServiceError::store("Get", e))?;
    ok(event)
}

/// POST /GetKeys
pub async fn get_keys(State(state): State<Arc<ServiceState>>) -> RpcResponse<Vec<u64>> {
    let keys = state
        .store
        .get_keys()
        .await
        .map_err(|e| ServiceError::store("GetKeys", e))?;
    ok(keys)
}

/// POST /Delete
pub async fn delete(
    State(state): State<Arc<ServiceState>>,
    payload: Result<Json<KeyRequest>, JsonRejection>,
) -> RpcResponse<()> {
    let Json(request) = payload?;
    state
        .store
        .delete(request.key)
        .await
        .map_err(|e| ServiceError::store("Delete", e))?;
    ok(())
}

/// POST /RequestUploadNow. Only signals the upload runner.
pub async fn request_upload_now(State(state): State<Arc<ServiceState>>) -> RpcResponse<()> {
    match state.upload_now.try_send(()) {
        Ok(()) | Err(mpsc::error::TrySendError::Full(())) => ok(()),
        Err(mpsc::error::TrySendError::Closed(())) => Err(ServiceError::Failed {
            op: "RequestUploadNow",
            message: "upload runner is not running".to_string(),
        }),
    }
}

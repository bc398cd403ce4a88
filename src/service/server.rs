use super::api::{add, delete, get, get_keys, queue, request_upload_now, ServiceState};
use axum::{routing::post, Router};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower::ServiceBuilder;
use tower_http::trace::TraceLayer;
use tracing::info;

pub fn router(state: Arc<ServiceState>) -> Router {
    Router::new()
        .route("/Add", post(add))
        .route("/Queue", post(queue))
        .route("/Get", post(get))
        .route("/GetKeys", post(get_keys))
        .route("/Delete", post(delete))
        .route("/RequestUploadNow", post(request_upload_now))
        .route("/UploadEvents", post(request_upload_now))
        .layer(ServiceBuilder::new().layer(TraceLayer::new_for_http()))
        .with_state(state)
}

/// Serve the RPC front on an already bound listener until `cancel` fires
pub async fn serve(
    listener: TcpListener,
    state: Arc<ServiceState>,
    cancel: CancellationToken,
) -> Result<(), std::io::Error> {
    axum::serve(listener, router(state))
        .with_graceful_shutdown(async move {
            cancel.cancelled().await;
            info!("Event service shutting down gracefully");
        })
        .await
}

/// Start the local event service
pub async fn start_server(
    listen_addr: SocketAddr,
    state: Arc<ServiceState>,
    cancel: CancellationToken,
) -> Result<(), std::io::Error> {
    if !listen_addr.ip().is_loopback() {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidInput,
            format!("event service must listen on a loopback address, got {}", listen_addr),
        ));
    }

    info!(addr = %listen_addr, "Starting event service");

    let listener = TcpListener::bind(listen_addr).await?;
    serve(listener, state, cancel).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{EventStore, RateLimiter};
    use axum::body::{to_bytes, Body};
    use axum::http::{Request, StatusCode};
    use serde_json::{json, Value};
    use tokio::sync::mpsc;
    use tower::ServiceExt;

    async fn setup() -> (Router, EventStore, mpsc::Receiver<()>) {
        let store = EventStore::in_memory(RateLimiter::default()).await.unwrap();
        let (tx, rx) = mpsc::channel(1);
        let state = Arc::new(ServiceState {
            store: store.clone(),
            upload_now: tx,
        });
        (router(state), store, rx)
    }

    async fn call(app: &Router, path: &str, body: Value) -> (StatusCode, Value) {
        let request = Request::builder()
            .method("POST")
            .uri(path)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap();
        let response = app.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let value = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap()
        };
        (status, value)
    }

    #[tokio::test]
    async fn test_add_get_delete() {
        let (app, _store, _rx) = setup().await;

        let (status, body) = call(
            &app,
            "/Add",
            json!({"details": "{\"unit\":\"x\"}", "type": "systemError", "timestamp": 1_000_000_000i64}),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["result"]["suppressed"], false);
        let key = body["result"]["key"].as_u64().unwrap();

        let (status, body) = call(&app, "/GetKeys", json!({})).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["result"], json!([key]));

        let (status, body) = call(&app, "/Get", json!({ "key": key })).await;
        assert_eq!(status, StatusCode::OK);
        let event: Value = serde_json::from_str(body["result"].as_str().unwrap()).unwrap();
        assert_eq!(event["description"]["type"], "systemError");
        assert_eq!(event["description"]["details"]["unit"], "x");
        assert_eq!(event["Timestamp"], "1970-01-01T00:00:01Z");

        let (status, _) = call(&app, "/Delete", json!({ "key": key })).await;
        assert_eq!(status, StatusCode::OK);
        let (status, _) = call(&app, "/Delete", json!({ "key": key })).await;
        assert_eq!(status, StatusCode::OK);
    }

    #[tokio::test]
    async fn test_missing_key_is_not_found() {
        let (app, _store, _rx) = setup().await;
        let (status, body) = call(&app, "/Get", json!({"key": 42})).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["name"], "events.Errors.NotFound");
    }

    #[tokio::test]
    async fn test_bad_details_are_invalid_args() {
        let (app, store, _rx) = setup().await;
        let (status, body) = call(
            &app,
            "/Add",
            json!({"details": "{oops", "type": "t", "timestamp": 0}),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["name"], "events.Errors.InvalidArgs");

        let (status, body) = call(&app, "/Add", json!({"type": "t"})).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["name"], "events.Errors.InvalidArgs");

        assert!(store.get_keys().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_upload_now_notifies() {
        let (app, _store, mut rx) = setup().await;

        let (status, _) = call(&app, "/RequestUploadNow", json!({})).await;
        assert_eq!(status, StatusCode::OK);
        let (status, _) = call(&app, "/UploadEvents", json!({})).await;
        assert_eq!(status, StatusCode::OK);

        assert!(rx.try_recv().is_ok());
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_upload_now_without_runner_fails() {
        let (app, _store, rx) = setup().await;
        drop(rx);

        let (status, body) = call(&app, "/RequestUploadNow", json!({})).await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(body["name"], "events.Errors.RequestUploadNowFailed");
    }

    #[tokio::test]
    async fn test_legacy_queue() {
        let (app, store, _rx) = setup().await;
        let description = br#"{"description":{"type":"audioBait","details":{}}}"#.to_vec();

        let (status, _) = call(
            &app,
            "/Queue",
            json!({"details": description, "timestamp": 5_000_000_000i64}),
        )
        .await;
        assert_eq!(status, StatusCode::OK);

        let records = store.legacy_records().await.unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].timestamps[0].timestamp(), 5);
    }

    #[tokio::test]
    async fn test_rejects_non_loopback_listen_address() {
        let store = EventStore::in_memory(RateLimiter::default()).await.unwrap();
        let (tx, _rx) = mpsc::channel(1);
        let state = Arc::new(ServiceState {
            store,
            upload_now: tx,
        });

        let addr: SocketAddr = "0.0.0.0:0".parse().unwrap();
        let result = start_server(addr, state, CancellationToken::new()).await;
        assert_eq!(
            result.unwrap_err().kind(),
            std::io::ErrorKind::InvalidInput
        );
    }
}

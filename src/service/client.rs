use super::api::{AddRequest, AddResult, KeyRequest, QueueRequest, RpcErrorBody, RpcResult};
use crate::store::Event;
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{Map, Value};
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::debug;

const MAX_WAIT: Duration = Duration::from_secs(10);
const RETRY_DELAY: Duration = Duration::from_millis(500);

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("JSON serialization/deserialization failed: {0}")]
    Json(#[from] serde_json::Error),

    #[error("{name}: {message}")]
    Rpc { name: String, message: String },

    #[error("event service not available within {0:?}")]
    Unavailable(Duration),

    #[error("timestamp is outside the representable range")]
    Timestamp,
}

impl ClientError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, ClientError::Rpc { name, .. } if name.ends_with(".NotFound"))
    }
}

pub type Result<T> = std::result::Result<T, ClientError>;

/// Client for the local event service, used by producers on the device.
#[derive(Debug, Clone)]
pub struct EventClient {
    base_url: String,
    client: reqwest::Client,
    max_wait: Duration,
}

impl EventClient {
    pub fn new(base_url: impl Into<String>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()?;
        Ok(Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            client,
            max_wait: MAX_WAIT,
        })
    }

    /// How long calls keep retrying while the service is not reachable.
    pub fn with_max_wait(mut self, max_wait: Duration) -> Self {
        self.max_wait = max_wait;
        self
    }

    async fn call<B, T>(&self, method: &str, body: &B) -> Result<T>
    where
        B: Serialize + ?Sized,
        T: DeserializeOwned,
    {
        let url = format!("{}/{}", self.base_url, method);
        let started = Instant::now();

        let response = loop {
            match self.client.post(&url).json(body).send().await {
                Ok(response) => break response,
                Err(e) if e.is_connect() => {
                    if started.elapsed() > self.max_wait {
                        return Err(ClientError::Unavailable(self.max_wait));
                    }
                    debug!(method = method, "Event service not reachable, retrying");
                    tokio::time::sleep(RETRY_DELAY).await;
                }
                Err(e) => return Err(e.into()),
            }
        };

        if !response.status().is_success() {
            let status = response.status();
            let text = response.text().await?;
            return Err(match serde_json::from_str::<RpcErrorBody>(&text) {
                Ok(body) => ClientError::Rpc {
                    name: body.name,
                    message: body.message,
                },
                Err(_) => ClientError::Rpc {
                    name: format!("http.{}", status.as_u16()),
                    message: text,
                },
            });
        }

        let result: RpcResult<T> = response.json().await?;
        Ok(result.result)
    }

    pub async fn add(
        &self,
        event_type: &str,
        details: &Map<String, Value>,
        timestamp: DateTime<Utc>,
    ) -> Result<AddResult> {
        let request = AddRequest {
            details: serde_json::to_string(details)?,
            event_type: event_type.to_string(),
            timestamp: timestamp.timestamp_nanos_opt().ok_or(ClientError::Timestamp)?,
        };
        self.call("Add", &request).await
    }

    /// Legacy call taking the serialized `{"description":{..}}` bytes.
    pub async fn queue(&self, description: &[u8], timestamp: DateTime<Utc>) -> Result<()> {
        let request = QueueRequest {
            details: description.to_vec(),
            timestamp: timestamp.timestamp_nanos_opt().ok_or(ClientError::Timestamp)?,
        };
        self.call("Queue", &request).await
    }

    pub async fn get(&self, key: u64) -> Result<String> {
        self.call("Get", &KeyRequest { key }).await
    }

    pub async fn get_event(&self, key: u64) -> Result<Event> {
        let raw = self.get(key).await?;
        Ok(Event::from_json(raw.as_bytes())?)
    }

    pub async fn get_keys(&self) -> Result<Vec<u64>> {
        self.call("GetKeys", &serde_json::json!({})).await
    }

    pub async fn delete(&self, key: u64) -> Result<()> {
        self.call("Delete", &KeyRequest { key }).await
    }

    pub async fn upload_now(&self) -> Result<()> {
        self.call("RequestUploadNow", &serde_json::json!({})).await
    }
}

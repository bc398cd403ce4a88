use super::api_client::check_status;
use super::transport::TransportError;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;
use uuid::Uuid;

/// Handshake and messaging steps of a long-range radio link.
#[async_trait]
pub trait RadioLink: Send + Sync {
    /// Starts joining the network; completion is observed via `is_joined`.
    async fn join(&self) -> Result<(), TransportError>;

    async fn is_joined(&self) -> Result<bool, TransportError>;

    async fn send(&self, id: Uuid, payload: &Value) -> Result<(), TransportError>;

    /// Whether the gateway acknowledged message `id`.
    async fn is_delivered(&self, id: Uuid) -> Result<bool, TransportError>;
}

#[derive(Debug, Deserialize)]
struct JoinStatus {
    joined: bool,
}

#[derive(Debug, Deserialize)]
struct DeliveryStatus {
    delivered: bool,
}

#[derive(Debug, Serialize)]
struct OutgoingMessage<'a> {
    id: Uuid,
    payload: &'a Value,
}

/// Talks to a local radio daemon over HTTP.
pub struct HttpRadioLink {
    base_url: String,
    client: reqwest::Client,
}

impl HttpRadioLink {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self, TransportError> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            client,
        })
    }
}

#[async_trait]
impl RadioLink for HttpRadioLink {
    async fn join(&self) -> Result<(), TransportError> {
        let url = format!("{}/join", self.base_url);
        let response = self.client.post(&url).send().await?;
        check_status(response).await?;
        Ok(())
    }

    async fn is_joined(&self) -> Result<bool, TransportError> {
        let url = format!("{}/status", self.base_url);
        let response = check_status(self.client.get(&url).send().await?).await?;
        let status: JoinStatus = response.json().await?;
        Ok(status.joined)
    }

    async fn send(&self, id: Uuid, payload: &Value) -> Result<(), TransportError> {
        let url = format!("{}/messages", self.base_url);
        let response = self
            .client
            .post(&url)
            .json(&OutgoingMessage { id, payload })
            .send()
            .await?;
        check_status(response).await?;
        Ok(())
    }

    async fn is_delivered(&self, id: Uuid) -> Result<bool, TransportError> {
        let url = format!("{}/messages/{}", self.base_url, id);
        let response = check_status(self.client.get(&url).send().await?).await?;
        let status: DeliveryStatus = response.json().await?;
        Ok(status.delivered)
    }
}

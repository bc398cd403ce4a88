use super::transport::TransportError;
use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, info};

const API_BASE_PATH: &str = "/api/v1";

/// The remote collection API as seen by the upload runner.
#[async_trait]
pub trait RemoteApi: Send + Sync {
    /// Reports every occurrence of one description in a single call.
    async fn report_event(
        &self,
        description: &str,
        times: &[DateTime<Utc>],
    ) -> Result<(), TransportError>;
}

/// Builds the request body: the description object with the occurrence
/// times injected as `dateTimes`.
pub fn report_body(description: &str, times: &[DateTime<Utc>]) -> Result<Value, TransportError> {
    let mut body: Map<String, Value> = serde_json::from_str(description)
        .map_err(|e| TransportError::Permanent(format!("malformed event description: {}", e)))?;

    let date_times = times
        .iter()
        .map(|t| Value::String(t.to_rfc3339_opts(SecondsFormat::Secs, true)))
        .collect();
    body.insert("dateTimes".to_string(), Value::Array(date_times));

    Ok(Value::Object(body))
}

/// Maps a non-2xx response to a classified error: 4xx is permanent,
/// anything else temporary.
pub async fn check_status(response: reqwest::Response) -> Result<reqwest::Response, TransportError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let body = response.text().await.unwrap_or_default();
    let message = format!("HTTP request failed ({}): {}", status.as_u16(), body);
    if status.is_client_error() {
        Err(TransportError::Permanent(message))
    } else {
        Err(TransportError::Temporary(message))
    }
}

#[derive(Debug, Clone)]
pub struct ApiCredentials {
    pub server_url: String,
    pub device_name: String,
    pub group: Option<String>,
    pub password: String,
}

#[derive(Debug, Serialize)]
struct AuthRequest<'a> {
    devicename: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    groupname: Option<&'a str>,
    password: &'a str,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    #[serde(default)]
    success: bool,
    #[serde(default)]
    messages: Vec<String>,
    #[serde(default)]
    token: String,
}

/// HTTP client for the remote API. Authenticates lazily and keeps the
/// token until the server answers 401.
pub struct HttpApiClient {
    credentials: ApiCredentials,
    client: reqwest::Client,
    token: Mutex<Option<String>>,
}

impl HttpApiClient {
    pub fn new(credentials: ApiCredentials, timeout: Duration) -> Result<Self, TransportError> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            credentials: ApiCredentials {
                server_url: credentials.server_url.trim_end_matches('/').to_string(),
                ..credentials
            },
            client,
            token: Mutex::new(None),
        })
    }

    async fn authenticate(&self) -> Result<String, TransportError> {
        let url = format!("{}/authenticate_device", self.credentials.server_url);
        let request = AuthRequest {
            devicename: &self.credentials.device_name,
            groupname: self.credentials.group.as_deref(),
            password: &self.credentials.password,
        };

        let response = self.client.post(&url).json(&request).send().await?;
        let response = check_status(response).await?;
        let token: TokenResponse = response
            .json()
            .await
            .map_err(|e| TransportError::Temporary(format!("invalid token response: {}", e)))?;

        if !token.success || token.token.is_empty() {
            let message = token
                .messages
                .first()
                .cloned()
                .unwrap_or_else(|| "unknown".to_string());
            return Err(TransportError::Permanent(format!(
                "failed getting new token: {}",
                message
            )));
        }

        info!(device = %self.credentials.device_name, "Authenticated with remote API");
        Ok(token.token)
    }

    async fn token(&self) -> Result<String, TransportError> {
        let mut cached = self.token.lock().await;
        if let Some(token) = cached.as_ref() {
            return Ok(token.clone());
        }
        let token = self.authenticate().await?;
        *cached = Some(token.clone());
        Ok(token)
    }
}

#[async_trait]
impl RemoteApi for HttpApiClient {
    async fn report_event(
        &self,
        description: &str,
        times: &[DateTime<Utc>],
    ) -> Result<(), TransportError> {
        let body = report_body(description, times)?;
        let token = self.token().await?;

        let url = format!("{}{}/events", self.credentials.server_url, API_BASE_PATH);
        let response = self
            .client
            .post(&url)
            .header(reqwest::header::AUTHORIZATION, token)
            .json(&body)
            .send()
            .await?;

        if response.status() == reqwest::StatusCode::UNAUTHORIZED {
            *self.token.lock().await = None;
        }
        check_status(response).await?;

        debug!(events = times.len(), "Reported event group");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_report_body_injects_date_times() {
        let times = vec![
            Utc.timestamp_nanos(1_600_000_000_500_000_000),
            Utc.timestamp_opt(1_600_000_060, 0).unwrap(),
        ];
        let body = report_body(
            r#"{"description":{"type":"t","details":{"a":1}}}"#,
            &times,
        )
        .unwrap();

        assert_eq!(body["description"]["type"], "t");
        assert_eq!(
            body["dateTimes"],
            serde_json::json!(["2020-09-13T12:26:40Z", "2020-09-13T12:27:40Z"])
        );
    }

    #[test]
    fn test_malformed_description_is_permanent() {
        let result = report_body("not json", &[]);
        assert!(matches!(result, Err(TransportError::Permanent(_))));

        let result = report_body("[1,2]", &[]);
        assert!(matches!(result, Err(TransportError::Permanent(_))));
    }
}

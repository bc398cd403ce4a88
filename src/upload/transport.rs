use super::api_client::{report_body, RemoteApi};
use super::batcher::EventGroup;
use super::connectivity::{ConnectionGuard, ConnectionRequester, RetryPolicy};
use super::radio::RadioLink;
use async_trait::async_trait;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info};
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum TransportError {
    /// The remote rejected the request; retrying the same payload won't help.
    #[error("permanent failure: {0}")]
    Permanent(String),

    #[error("temporary failure: {0}")]
    Temporary(String),

    /// The transport could not be brought up.
    #[error("transport unavailable: {0}")]
    Unavailable(String),
}

impl TransportError {
    pub fn is_permanent(&self) -> bool {
        matches!(self, TransportError::Permanent(_))
    }
}

impl From<reqwest::Error> for TransportError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_builder() {
            TransportError::Permanent(e.to_string())
        } else {
            TransportError::Temporary(e.to_string())
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportKind {
    Wifi,
    LongRange,
    Cellular,
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TransportKind::Wifi => "wifi",
            TransportKind::LongRange => "long-range",
            TransportKind::Cellular => "cellular",
        };
        f.write_str(name)
    }
}

/// An established link. Dropping it releases whatever was acquired.
#[derive(Default)]
pub struct Session<'a> {
    _connection: Option<ConnectionGuard<'a>>,
}

/// One delivery path to the remote API.
#[async_trait]
pub trait Transport: Send + Sync {
    fn kind(&self) -> TransportKind;

    async fn establish<'a>(&'a self) -> Result<Session<'a>, TransportError>;

    async fn deliver(&self, group: &EventGroup) -> Result<(), TransportError>;

    /// Whether a non-permanent delivery failure should hand the remaining
    /// groups to the next transport instead of retrying on this one.
    fn yields_on_failure(&self) -> bool {
        false
    }
}

/// Remote API over the IP link, either WiFi or the cellular modem.
pub struct ApiTransport {
    kind: TransportKind,
    api: Arc<dyn RemoteApi>,
    cellular: Option<(Arc<ConnectionRequester>, RetryPolicy)>,
}

impl ApiTransport {
    /// WiFi was already confirmed working, so establishing is a no-op.
    pub fn wifi(api: Arc<dyn RemoteApi>) -> Self {
        Self {
            kind: TransportKind::Wifi,
            api,
            cellular: None,
        }
    }

    pub fn cellular(
        api: Arc<dyn RemoteApi>,
        requester: Arc<ConnectionRequester>,
        policy: RetryPolicy,
    ) -> Self {
        Self {
            kind: TransportKind::Cellular,
            api,
            cellular: Some((requester, policy)),
        }
    }
}

#[async_trait]
impl Transport for ApiTransport {
    fn kind(&self) -> TransportKind {
        self.kind
    }

    async fn establish<'a>(&'a self) -> Result<Session<'a>, TransportError> {
        let Some((requester, policy)) = &self.cellular else {
            return Ok(Session::default());
        };

        let guard = requester.acquire();
        requester
            .wait_until_up_loop(policy)
            .await
            .map_err(|e| TransportError::Unavailable(e.to_string()))?;

        Ok(Session {
            _connection: Some(guard),
        })
    }

    async fn deliver(&self, group: &EventGroup) -> Result<(), TransportError> {
        self.api.report_event(&group.description, &group.times).await
    }
}

/// Timeouts for the radio handshake and delivery confirmation.
#[derive(Debug, Clone)]
pub struct LongRangeSettings {
    pub join_timeout: Duration,
    pub delivery_timeout: Duration,
    pub poll_interval: Duration,
}

impl Default for LongRangeSettings {
    fn default() -> Self {
        Self {
            join_timeout: Duration::from_secs(60),
            delivery_timeout: Duration::from_secs(120),
            poll_interval: Duration::from_secs(2),
        }
    }
}

/// Low-bandwidth radio path. Joining and every delivery are bounded by
/// their own timeouts.
pub struct LongRangeTransport {
    link: Arc<dyn RadioLink>,
    settings: LongRangeSettings,
}

impl LongRangeTransport {
    pub fn new(link: Arc<dyn RadioLink>, settings: LongRangeSettings) -> Self {
        Self { link, settings }
    }

    async fn wait_for<F, Fut>(
        &self,
        timeout: Duration,
        what: &str,
        mut check: F,
    ) -> Result<(), TransportError>
    where
        F: FnMut() -> Fut + Send,
        Fut: std::future::Future<Output = Result<bool, TransportError>> + Send,
    {
        let poll = async {
            loop {
                if check().await? {
                    return Ok(());
                }
                tokio::time::sleep(self.settings.poll_interval).await;
            }
        };
        tokio::time::timeout(timeout, poll)
            .await
            .map_err(|_| {
                TransportError::Temporary(format!("{} not confirmed within {:?}", what, timeout))
            })?
    }
}

#[async_trait]
impl Transport for LongRangeTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::LongRange
    }

    fn yields_on_failure(&self) -> bool {
        true
    }

    async fn establish<'a>(&'a self) -> Result<Session<'a>, TransportError> {
        self.link
            .join()
            .await
            .map_err(|e| TransportError::Unavailable(format!("join failed: {}", e)))?;

        self.wait_for(self.settings.join_timeout, "radio join", move || self.link.is_joined())
            .await
            .map_err(|e| TransportError::Unavailable(e.to_string()))?;

        info!("Long range radio joined");
        Ok(Session::default())
    }

    async fn deliver(&self, group: &EventGroup) -> Result<(), TransportError> {
        let payload = report_body(&group.description, &group.times)?;
        let id = Uuid::new_v4();

        self.link.send(id, &payload).await?;
        debug!(message_id = %id, events = group.len(), "Sent group over radio");

        self.wait_for(self.settings.delivery_timeout, "radio delivery", move || {
            self.link.is_delivered(id)
        })
        .await
    }
}

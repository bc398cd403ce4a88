//! Burst guard in front of the event store's write path.

use super::event::{Event, OFFLOADED_RECORDING_EVENT_TYPE, RATE_LIMIT_EVENT_TYPE};
use chrono::{DateTime, Utc};
use serde_json::{Map, Value};
use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{debug, warn};

pub const DEFAULT_WINDOW: Duration = Duration::from_secs(3 * 60);
pub const DEFAULT_THRESHOLD: u32 = 5;

/// Outcome of passing one event through the limiter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Allow,
    /// The burst just reached the threshold: drop the event and write one alert.
    SuppressAndAlert,
    Suppress,
}

impl Verdict {
    pub fn is_suppressed(self) -> bool {
        !matches!(self, Verdict::Allow)
    }
}

/// Supplies the deployment tag attached to rate-limit alerts.
pub trait EnvironmentSource: Send + Sync {
    fn environment(&self) -> Option<String>;
}

pub struct StaticEnvironment(pub Option<String>);

impl EnvironmentSource for StaticEnvironment {
    fn environment(&self) -> Option<String> {
        self.0.clone()
    }
}

/// Reads the tag from a file on each alert, trimmed. A missing or empty
/// file means no tag.
pub struct FileEnvironment {
    path: PathBuf,
}

impl FileEnvironment {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl EnvironmentSource for FileEnvironment {
    fn environment(&self) -> Option<String> {
        match std::fs::read_to_string(&self.path) {
            Ok(contents) => {
                let tag = contents.trim();
                (!tag.is_empty()).then(|| tag.to_string())
            }
            Err(e) => {
                if e.kind() != std::io::ErrorKind::NotFound {
                    warn!(path = %self.path.display(), error = %e, "Failed to read environment file");
                }
                None
            }
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct BurstState {
    last: DateTime<Utc>,
    count: u32,
}

/// Per-type burst counter. State lives in memory only and starts empty on
/// every process start.
pub struct RateLimiter {
    window: Duration,
    threshold: u32,
    exempt: HashSet<String>,
    environment: Arc<dyn EnvironmentSource>,
    state: Mutex<HashMap<String, BurstState>>,
}

impl RateLimiter {
    pub fn new(window: Duration, threshold: u32) -> Self {
        Self {
            window,
            threshold,
            exempt: [OFFLOADED_RECORDING_EVENT_TYPE, RATE_LIMIT_EVENT_TYPE]
                .into_iter()
                .map(String::from)
                .collect(),
            environment: Arc::new(StaticEnvironment(None)),
            state: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_exempt_types<I, S>(mut self, types: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.exempt.extend(types.into_iter().map(Into::into));
        self
    }

    pub fn with_environment(mut self, source: Arc<dyn EnvironmentSource>) -> Self {
        self.environment = source;
        self
    }

    pub fn is_exempt(&self, event_type: &str) -> bool {
        self.exempt.contains(event_type)
    }

    /// Records the event and decides whether it may be written.
    pub fn check(&self, event: &Event) -> Verdict {
        let event_type = event.event_type();
        if self.is_exempt(event_type) {
            return Verdict::Allow;
        }

        let mut state = self
            .state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());

        let Some(burst) = state.get_mut(event_type) else {
            state.insert(
                event_type.to_string(),
                BurstState {
                    last: event.timestamp,
                    count: 0,
                },
            );
            return Verdict::Allow;
        };

        let gap = (event.timestamp - burst.last)
            .abs()
            .to_std()
            .unwrap_or(Duration::MAX);
        if gap <= self.window {
            burst.count = burst.count.saturating_add(1);
        } else {
            burst.count = 0;
        }
        burst.last = event.timestamp;

        let verdict = if burst.count == self.threshold {
            Verdict::SuppressAndAlert
        } else if burst.count > self.threshold {
            Verdict::Suppress
        } else {
            Verdict::Allow
        };

        if verdict.is_suppressed() {
            debug!(
                event_type = %event_type,
                count = burst.count,
                "Suppressing rate limited event"
            );
        }
        verdict
    }

    /// Builds the alert written when `suppressed`'s burst hits the threshold.
    pub fn alert_for(&self, suppressed: &Event) -> Event {
        let mut details = Map::new();
        details.insert(
            "type".to_string(),
            Value::String(suppressed.event_type().to_string()),
        );
        if let Some(environment) = self.environment.environment() {
            details.insert("environment".to_string(), Value::String(environment));
        }
        Event::new(RATE_LIMIT_EVENT_TYPE, details, suppressed.timestamp)
    }
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new(DEFAULT_WINDOW, DEFAULT_THRESHOLD)
    }
}

use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    pub store: StoreConfig,
    pub upload: UploadConfig,
    pub rate_limit: RateLimitConfig,
    pub api: Option<ApiConfig>,
    pub connectivity: ConnectivityConfig,
    pub long_range: Option<LongRangeConfig>,
    pub service: ServiceConfig,
    pub power_off: PowerOffConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct StoreConfig {
    pub path: PathBuf,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("/var/lib/event-reporter.db"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct UploadConfig {
    #[serde(with = "humantime_serde")]
    pub interval: Duration,
    pub batch_size: usize,
}

impl Default for UploadConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(30 * 60),
            batch_size: 100,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RateLimitConfig {
    #[serde(with = "humantime_serde")]
    pub window: Duration,
    pub threshold: u32,
    /// Types never limited, on top of `offloadedRecording` and `rateLimit`.
    pub exempt_types: Vec<String>,
    /// Deployment tag attached to rate-limit alerts.
    pub environment: Option<String>,
    /// File holding the tag; read when `environment` is unset.
    pub environment_file: Option<PathBuf>,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            window: Duration::from_secs(3 * 60),
            threshold: 5,
            exempt_types: Vec::new(),
            environment: None,
            environment_file: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ApiConfig {
    pub server_url: String,
    #[serde(default)]
    pub group: Option<String>,
    /// Defaults to the hostname.
    #[serde(default)]
    pub device_name: Option<String>,
    pub password: String,
    #[serde(default = "default_api_timeout", with = "humantime_serde")]
    pub timeout: Duration,
}

fn default_api_timeout() -> Duration {
    Duration::from_secs(60)
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ConnectivityConfig {
    pub wifi_interface: String,
    pub ping_hosts: Vec<String>,
    #[serde(with = "humantime_serde")]
    pub ping_timeout: Duration,
    /// How long one attempt waits for the link to come up.
    #[serde(with = "humantime_serde")]
    pub timeout: Duration,
    #[serde(with = "humantime_serde")]
    pub retry_interval: Duration,
    pub max_retries: u32,
    #[serde(with = "humantime_serde")]
    pub max_retry_interval: Duration,
    /// Interval between modem stay-on requests.
    #[serde(with = "humantime_serde")]
    pub request_interval: Duration,
    /// Interval between connectivity-restored checks.
    #[serde(with = "humantime_serde")]
    pub monitor_interval: Duration,
    /// Command asking the modem to stay on; empty disables requests.
    pub stay_on_command: Vec<String>,
}

impl Default for ConnectivityConfig {
    fn default() -> Self {
        Self {
            wifi_interface: "wlan0".to_string(),
            ping_hosts: vec!["8.8.8.8".to_string(), "8.8.4.4".to_string()],
            ping_timeout: Duration::from_secs(5),
            timeout: Duration::from_secs(2 * 60),
            retry_interval: Duration::from_secs(10 * 60),
            max_retries: 3,
            max_retry_interval: Duration::from_secs(2 * 60 * 60),
            request_interval: Duration::from_secs(20),
            monitor_interval: Duration::from_secs(30),
            stay_on_command: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LongRangeConfig {
    /// Base URL of the local radio daemon.
    pub url: String,
    #[serde(default = "default_join_timeout", with = "humantime_serde")]
    pub join_timeout: Duration,
    #[serde(default = "default_delivery_timeout", with = "humantime_serde")]
    pub delivery_timeout: Duration,
    #[serde(default = "default_radio_poll_interval", with = "humantime_serde")]
    pub poll_interval: Duration,
}

fn default_join_timeout() -> Duration {
    Duration::from_secs(60)
}

fn default_delivery_timeout() -> Duration {
    Duration::from_secs(120)
}

fn default_radio_poll_interval() -> Duration {
    Duration::from_secs(2)
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ServiceConfig {
    pub listen: SocketAddr,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            listen: SocketAddr::from(([127, 0, 0, 1], 7120)),
        }
    }
}

impl ServiceConfig {
    pub fn url(&self) -> String {
        format!("http://{}", self.listen)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PowerOffConfig {
    /// File holding the Unix-nanosecond time the device last powered off.
    pub marker_file: PathBuf,
}

impl Default for PowerOffConfig {
    fn default() -> Self {
        Self {
            marker_file: PathBuf::from("/etc/cacophony/powered-off-time"),
        }
    }
}

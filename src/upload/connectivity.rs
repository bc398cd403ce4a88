use async_trait::async_trait;
use futures::stream::{FuturesUnordered, StreamExt};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::process::Command;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

#[derive(Debug, Error)]
pub enum ConnectivityError {
    #[error("no connection within {0:?}")]
    Timeout(Duration),

    #[error("no connection made after {attempts} attempts")]
    NoConnection { attempts: u32 },

    #[error("command `{command}` failed: {message}")]
    Command { command: String, message: String },
}

/// Answers "is there a working internet connection right now".
#[async_trait]
pub trait ConnectivityProbe: Send + Sync {
    /// The WiFi interface is up and reaches the internet.
    async fn wifi_has_internet(&self) -> bool;

    /// Any interface reaches the internet.
    async fn has_internet(&self) -> bool;
}

/// Asks the modem daemon to keep the cellular link powered.
#[async_trait]
pub trait ModemControl: Send + Sync {
    async fn request_stay_on(&self) -> Result<(), ConnectivityError>;
}

/// Probe backed by `ip` and `ping`.
pub struct SystemProbe {
    wifi_interface: String,
    ping_hosts: Vec<String>,
    ping_timeout: Duration,
}

impl SystemProbe {
    pub fn new(wifi_interface: String, ping_hosts: Vec<String>, ping_timeout: Duration) -> Self {
        Self {
            wifi_interface,
            ping_hosts,
            ping_timeout,
        }
    }

    async fn interface_up(&self) -> bool {
        match Command::new("ip")
            .args(["a", "show", &self.wifi_interface])
            .output()
            .await
        {
            Ok(output) => String::from_utf8_lossy(&output.stdout).contains("state UP"),
            Err(e) => {
                debug!(error = %e, "Failed to run ip");
                false
            }
        }
    }

    async fn ping(&self, interface: Option<&str>, host: &str) -> bool {
        let mut cmd = Command::new("ping");
        if let Some(interface) = interface {
            cmd.args(["-I", interface]);
        }
        cmd.args(["-n", "-q", "-c1"])
            .arg(format!("-w{}", self.ping_timeout.as_secs().max(1)))
            .arg(host)
            .stdout(std::process::Stdio::null())
            .stderr(std::process::Stdio::null())
            .kill_on_drop(true);

        matches!(cmd.status().await, Ok(status) if status.success())
    }

    /// True as soon as any host answers; false when all fail or the timeout passes.
    async fn ping_any(&self, interface: Option<&str>) -> bool {
        let mut pings: FuturesUnordered<_> = self
            .ping_hosts
            .iter()
            .map(|host| self.ping(interface, host))
            .collect();

        let first_success = async {
            while let Some(ok) = pings.next().await {
                if ok {
                    return true;
                }
            }
            false
        };

        tokio::time::timeout(self.ping_timeout, first_success)
            .await
            .unwrap_or(false)
    }
}

#[async_trait]
impl ConnectivityProbe for SystemProbe {
    async fn wifi_has_internet(&self) -> bool {
        self.interface_up().await && self.ping_any(Some(&self.wifi_interface)).await
    }

    async fn has_internet(&self) -> bool {
        self.ping_any(None).await
    }
}

/// Runs a configured command to request the modem stays on. No command
/// means there is no modem to talk to.
pub struct CommandModem {
    command: Vec<String>,
}

impl CommandModem {
    pub fn new(command: Vec<String>) -> Self {
        Self { command }
    }
}

#[async_trait]
impl ModemControl for CommandModem {
    async fn request_stay_on(&self) -> Result<(), ConnectivityError> {
        let Some((program, args)) = self.command.split_first() else {
            return Ok(());
        };

        let output = Command::new(program)
            .args(args)
            .output()
            .await
            .map_err(|e| ConnectivityError::Command {
                command: program.clone(),
                message: e.to_string(),
            })?;

        if !output.status.success() {
            return Err(ConnectivityError::Command {
                command: program.clone(),
                message: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        Ok(())
    }
}

/// Bounds for acquiring a connection.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// How long one attempt waits for the link.
    pub timeout: Duration,
    /// Wait before the first retry; grows ×1.5 per retry.
    pub retry_interval: Duration,
    pub max_retries: u32,
    pub max_retry_interval: Duration,
    /// How often an attempt re-checks the link.
    pub poll_interval: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(2 * 60),
            retry_interval: Duration::from_secs(10 * 60),
            max_retries: 3,
            max_retry_interval: Duration::from_secs(2 * 60 * 60),
            poll_interval: Duration::from_secs(1),
        }
    }
}

pub fn next_retry_interval(current: Duration, max: Duration) -> Duration {
    current.mul_f64(1.5).min(max)
}

/// Keeps asking the modem to stay on while someone needs the connection.
pub struct ConnectionRequester {
    probe: Arc<dyn ConnectivityProbe>,
    modem: Arc<dyn ModemControl>,
    request_interval: Duration,
    active: watch::Sender<bool>,
}

impl ConnectionRequester {
    pub fn new(
        probe: Arc<dyn ConnectivityProbe>,
        modem: Arc<dyn ModemControl>,
        request_interval: Duration,
    ) -> Self {
        let (active, _) = watch::channel(false);
        Self {
            probe,
            modem,
            request_interval,
            active,
        }
    }

    pub fn start(&self) {
        self.active.send_replace(true);
    }

    pub fn stop(&self) {
        self.active.send_replace(false);
    }

    pub fn is_active(&self) -> bool {
        *self.active.borrow()
    }

    /// Starts requesting; requests stop when the guard drops.
    pub fn acquire(&self) -> ConnectionGuard<'_> {
        self.start();
        ConnectionGuard { requester: self }
    }

    /// Sends a stay-on request every `request_interval` while active and
    /// WiFi is not carrying traffic.
    pub async fn run(&self, cancel: CancellationToken) {
        let mut active = self.active.subscribe();
        loop {
            let requesting = *active.borrow_and_update();
            if requesting {
                if !self.probe.wifi_has_internet().await {
                    if let Err(e) = self.modem.request_stay_on().await {
                        warn!(error = %e, "Failed to request modem stay on");
                    }
                }
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    _ = active.changed() => {}
                    _ = tokio::time::sleep(self.request_interval) => {}
                }
            } else {
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    changed = active.changed() => {
                        if changed.is_err() {
                            return;
                        }
                    }
                }
            }
        }
    }

    /// Polls until the link is up or `timeout` passes.
    pub async fn wait_until_up(
        &self,
        timeout: Duration,
        poll_interval: Duration,
    ) -> Result<(), ConnectivityError> {
        let poll = async {
            loop {
                if self.probe.has_internet().await {
                    return;
                }
                tokio::time::sleep(poll_interval).await;
            }
        };
        tokio::time::timeout(timeout, poll)
            .await
            .map_err(|_| ConnectivityError::Timeout(timeout))
    }

    /// Repeats [`wait_until_up`](Self::wait_until_up) with growing pauses.
    /// Requests stop during each pause to save power.
    pub async fn wait_until_up_loop(&self, policy: &RetryPolicy) -> Result<(), ConnectivityError> {
        let mut retry = 0;
        let mut retry_after = policy.retry_interval;
        loop {
            if self
                .wait_until_up(policy.timeout, policy.poll_interval)
                .await
                .is_ok()
            {
                return Ok(());
            }
            if retry >= policy.max_retries {
                return Err(ConnectivityError::NoConnection {
                    attempts: retry + 1,
                });
            }
            retry += 1;

            self.stop();
            info!(retry_in = ?retry_after, attempt = retry, "Connection failed, retrying");
            tokio::time::sleep(retry_after).await;
            retry_after = next_retry_interval(retry_after, policy.max_retry_interval);
            self.start();
        }
    }
}

/// Held while a cycle needs the connection.
pub struct ConnectionGuard<'a> {
    requester: &'a ConnectionRequester,
}

impl Drop for ConnectionGuard<'_> {
    fn drop(&mut self) {
        self.requester.stop();
    }
}

/// Fires `restored` each time the probe goes from no internet to internet.
pub async fn run_connectivity_monitor(
    probe: Arc<dyn ConnectivityProbe>,
    interval: Duration,
    restored: mpsc::Sender<()>,
    cancel: CancellationToken,
) {
    let mut was_up = probe.has_internet().await;
    loop {
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = tokio::time::sleep(interval) => {}
        }

        let up = probe.has_internet().await;
        if up && !was_up {
            info!("Connectivity restored");
            let _ = restored.try_send(());
        }
        was_up = up;
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    #[derive(Default)]
    pub(crate) struct FakeProbe {
        pub wifi: AtomicBool,
        pub internet: AtomicBool,
        pub checks: AtomicUsize,
    }

    impl FakeProbe {
        pub fn new(wifi: bool, internet: bool) -> Self {
            Self {
                wifi: AtomicBool::new(wifi),
                internet: AtomicBool::new(internet),
                checks: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl ConnectivityProbe for FakeProbe {
        async fn wifi_has_internet(&self) -> bool {
            self.wifi.load(Ordering::SeqCst)
        }

        async fn has_internet(&self) -> bool {
            self.checks.fetch_add(1, Ordering::SeqCst);
            self.internet.load(Ordering::SeqCst)
        }
    }

    #[derive(Default)]
    pub(crate) struct FakeModem {
        pub requests: AtomicUsize,
    }

    #[async_trait]
    impl ModemControl for FakeModem {
        async fn request_stay_on(&self) -> Result<(), ConnectivityError> {
            self.requests.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn fast_policy(max_retries: u32) -> RetryPolicy {
        RetryPolicy {
            timeout: Duration::from_millis(30),
            retry_interval: Duration::from_millis(10),
            max_retries,
            max_retry_interval: Duration::from_millis(20),
            poll_interval: Duration::from_millis(5),
        }
    }

    fn requester(probe: Arc<FakeProbe>, modem: Arc<FakeModem>) -> ConnectionRequester {
        ConnectionRequester::new(probe, modem, Duration::from_millis(10))
    }

    #[test]
    fn test_retry_interval_grows_and_caps() {
        let max = Duration::from_secs(2 * 60 * 60);
        let mut interval = Duration::from_secs(10 * 60);
        interval = next_retry_interval(interval, max);
        assert_eq!(interval, Duration::from_secs(15 * 60));
        for _ in 0..20 {
            interval = next_retry_interval(interval, max);
        }
        assert_eq!(interval, max);
    }

    #[tokio::test]
    async fn test_wait_until_up_succeeds_immediately() {
        let probe = Arc::new(FakeProbe::new(false, true));
        let requester = requester(probe, Arc::new(FakeModem::default()));
        assert!(requester
            .wait_until_up_loop(&fast_policy(0))
            .await
            .is_ok());
    }

    #[tokio::test]
    async fn test_wait_until_up_loop_gives_up() {
        let probe = Arc::new(FakeProbe::new(false, false));
        let requester = requester(probe, Arc::new(FakeModem::default()));

        let result = requester.wait_until_up_loop(&fast_policy(2)).await;
        assert!(matches!(
            result,
            Err(ConnectivityError::NoConnection { attempts: 3 })
        ));
    }

    #[tokio::test]
    async fn test_wait_until_up_sees_link_come_up() {
        let probe = Arc::new(FakeProbe::new(false, false));
        let requester = requester(Arc::clone(&probe), Arc::new(FakeModem::default()));

        let flip = {
            let probe = Arc::clone(&probe);
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(15)).await;
                probe.internet.store(true, Ordering::SeqCst);
            })
        };

        let result = requester
            .wait_until_up(Duration::from_secs(2), Duration::from_millis(5))
            .await;
        flip.await.unwrap();
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn test_guard_stops_requests() {
        let probe = Arc::new(FakeProbe::new(false, true));
        let modem = Arc::new(FakeModem::default());
        let requester = Arc::new(requester(probe, Arc::clone(&modem)));
        let cancel = CancellationToken::new();

        let task = {
            let requester = Arc::clone(&requester);
            let cancel = cancel.clone();
            tokio::spawn(async move { requester.run(cancel).await })
        };

        {
            let _guard = requester.acquire();
            assert!(requester.is_active());
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        assert!(!requester.is_active());

        tokio::time::sleep(Duration::from_millis(20)).await;
        let sent = modem.requests.load(Ordering::SeqCst);
        assert!(sent >= 1);

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(modem.requests.load(Ordering::SeqCst), sent);

        cancel.cancel();
        task.await.unwrap();
    }

    #[tokio::test]
    async fn test_no_requests_while_wifi_is_up() {
        let probe = Arc::new(FakeProbe::new(true, true));
        let modem = Arc::new(FakeModem::default());
        let requester = Arc::new(requester(probe, Arc::clone(&modem)));
        let cancel = CancellationToken::new();

        let task = {
            let requester = Arc::clone(&requester);
            let cancel = cancel.clone();
            tokio::spawn(async move { requester.run(cancel).await })
        };

        requester.start();
        tokio::time::sleep(Duration::from_millis(40)).await;
        requester.stop();
        cancel.cancel();
        task.await.unwrap();

        assert_eq!(modem.requests.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_monitor_fires_on_restore() {
        let probe = Arc::new(FakeProbe::new(false, false));
        let (tx, mut rx) = mpsc::channel(1);
        let cancel = CancellationToken::new();

        let task = tokio::spawn(run_connectivity_monitor(
            Arc::clone(&probe) as Arc<dyn ConnectivityProbe>,
            Duration::from_millis(5),
            tx,
            cancel.clone(),
        ));

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(rx.try_recv().is_err());

        probe.internet.store(true, Ordering::SeqCst);
        let fired = tokio::time::timeout(Duration::from_secs(2), rx.recv()).await;
        assert!(matches!(fired, Ok(Some(()))));

        cancel.cancel();
        task.await.unwrap();
    }

    #[tokio::test]
    async fn test_command_modem_without_command_is_noop() {
        assert!(CommandModem::new(Vec::new()).request_stay_on().await.is_ok());
    }

    #[tokio::test]
    async fn test_command_modem_reports_failure() {
        let modem = CommandModem::new(vec!["false".to_string()]);
        assert!(matches!(
            modem.request_stay_on().await,
            Err(ConnectivityError::Command { .. })
        ));
    }
}

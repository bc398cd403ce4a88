use crate::config::{load_config, Config, ConfigError};
use crate::service::{start_server, ServiceState};
use crate::store::event::POWERED_OFF_EVENT_TYPE;
use crate::store::{
    EnvironmentSource, Event, EventStore, FileEnvironment, RateLimiter, StaticEnvironment,
    StoreError,
};
use crate::upload::connectivity::run_connectivity_monitor;
use crate::upload::{
    ApiCredentials, ApiTransport, CommandModem, ConnectionRequester, ConnectivityProbe,
    HttpApiClient, HttpRadioLink, LongRangeSettings, LongRangeTransport, RetryPolicy, SystemProbe,
    Transport, TransportError, Transports, Triggers, UploadError, UploadRunner, UploadSettings,
};
use chrono::DateTime;
use serde_json::Map;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::signal;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

const RADIO_REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Error)]
pub enum RunError {
    #[error("config error: {0}")]
    Config(#[from] ConfigError),

    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("transport setup error: {0}")]
    Transport(#[from] TransportError),

    #[error("could not determine device name: {0}")]
    DeviceName(String),

    #[error("upload runner failed: {0}")]
    Upload(#[from] UploadError),

    #[error("event service error: {0}")]
    Service(#[from] std::io::Error),

    #[error("task join error: {0}")]
    Join(#[from] tokio::task::JoinError),
}

/// Command-line values that take precedence over the config file.
#[derive(Debug, Clone, Default)]
pub struct RunOverrides {
    pub db: Option<PathBuf>,
    pub interval: Option<Duration>,
}

/// Loads the config at `path`, or the defaults when no file was found,
/// then applies the command-line overrides.
pub fn resolve_config(path: Option<&Path>, overrides: &RunOverrides) -> Result<Config, ConfigError> {
    let mut config = match path {
        Some(path) => {
            info!(config_path = %path.display(), "Loading configuration");
            load_config(path)?
        }
        None => {
            info!("No config file found, using defaults");
            Config::default()
        }
    };

    if let Some(db) = &overrides.db {
        config.store.path = db.clone();
    }
    if let Some(interval) = overrides.interval {
        config.upload.interval = interval;
    }
    Ok(config)
}

pub async fn run(
    config_path: Option<PathBuf>,
    overrides: RunOverrides,
) -> Result<(), Box<dyn std::error::Error>> {
    let config = resolve_config(config_path.as_deref(), &overrides)?;
    run_daemon(config).await.map_err(|e| e.into())
}

pub fn build_rate_limiter(config: &Config) -> RateLimiter {
    let settings = &config.rate_limit;
    let environment: Arc<dyn EnvironmentSource> = match (&settings.environment, &settings.environment_file) {
        (Some(tag), _) => Arc::new(StaticEnvironment(Some(tag.clone()))),
        (None, Some(path)) => Arc::new(FileEnvironment::new(path.clone())),
        (None, None) => Arc::new(StaticEnvironment(None)),
    };

    RateLimiter::new(settings.window, settings.threshold)
        .with_exempt_types(settings.exempt_types.iter().cloned())
        .with_environment(environment)
}

/// Queues an `rpiPoweredOff` event if the marker file holds a Unix-nanosecond
/// time, then removes the file. A missing file means a clean boot.
pub async fn record_power_off(store: &EventStore, marker_file: &Path) -> Result<bool, StoreError> {
    let contents = match tokio::fs::read_to_string(marker_file).await {
        Ok(contents) => contents,
        Err(_) => return Ok(false),
    };

    let nanos = match contents.trim().parse::<i64>() {
        Ok(nanos) => nanos,
        Err(e) => {
            warn!(path = %marker_file.display(), error = %e, "Failed to read power off time");
            return Ok(false);
        }
    };

    let event = Event::new(
        POWERED_OFF_EVENT_TYPE,
        Map::new(),
        DateTime::from_timestamp_nanos(nanos),
    );
    store.add(event).await?;
    info!(at = nanos, "Recorded power off event");

    if let Err(e) = tokio::fs::remove_file(marker_file).await {
        warn!(path = %marker_file.display(), error = %e, "Failed to remove power off marker");
    }
    Ok(true)
}

fn build_transports(
    config: &Config,
    requester: Arc<ConnectionRequester>,
) -> Result<Option<Transports>, RunError> {
    let api = match &config.api {
        Some(api) => api,
        None => return Ok(None),
    };

    let device_name = match &api.device_name {
        Some(name) => name.clone(),
        None => hostname::get()
            .map_err(|e| RunError::DeviceName(e.to_string()))?
            .to_string_lossy()
            .into_owned(),
    };

    let client = Arc::new(HttpApiClient::new(
        ApiCredentials {
            server_url: api.server_url.clone(),
            device_name,
            group: api.group.clone(),
            password: api.password.clone(),
        },
        api.timeout,
    )?);

    let connectivity = &config.connectivity;
    let policy = RetryPolicy {
        timeout: connectivity.timeout,
        retry_interval: connectivity.retry_interval,
        max_retries: connectivity.max_retries,
        max_retry_interval: connectivity.max_retry_interval,
        ..RetryPolicy::default()
    };

    let long_range = match &config.long_range {
        Some(radio) => {
            let link = HttpRadioLink::new(radio.url.clone(), RADIO_REQUEST_TIMEOUT)?;
            let transport: Arc<dyn Transport> = Arc::new(LongRangeTransport::new(
                Arc::new(link),
                LongRangeSettings {
                    join_timeout: radio.join_timeout,
                    delivery_timeout: radio.delivery_timeout,
                    poll_interval: radio.poll_interval,
                },
            ));
            Some(transport)
        }
        None => None,
    };

    Ok(Some(Transports {
        wifi: Arc::new(ApiTransport::wifi(client.clone())),
        long_range,
        cellular: Arc::new(ApiTransport::cellular(client, requester, policy)),
    }))
}

pub async fn run_daemon(config: Config) -> Result<(), RunError> {
    let limiter = build_rate_limiter(&config);

    info!(path = %config.store.path.display(), "Opening event store");
    let store = EventStore::open(&config.store.path, limiter).await?;
    let migrated = store.migration_report();
    if migrated.records > 0 {
        info!(
            records = migrated.records,
            events = migrated.events,
            "Migrated legacy events"
        );
    }

    record_power_off(&store, &config.power_off.marker_file).await?;

    let cancel = CancellationToken::new();
    let (upload_now_tx, upload_now_rx) = mpsc::channel(1);
    let (restored_tx, restored_rx) = mpsc::channel(1);

    let connectivity = &config.connectivity;
    let probe: Arc<dyn ConnectivityProbe> = Arc::new(SystemProbe::new(
        connectivity.wifi_interface.clone(),
        connectivity.ping_hosts.clone(),
        connectivity.ping_timeout,
    ));
    let requester = Arc::new(ConnectionRequester::new(
        probe.clone(),
        Arc::new(CommandModem::new(connectivity.stay_on_command.clone())),
        connectivity.request_interval,
    ));

    let mut handles = Vec::new();
    let mut runner_task = None;

    match build_transports(&config, requester.clone())? {
        Some(transports) => {
            let runner = UploadRunner::new(
                store.clone(),
                probe.clone(),
                transports,
                UploadSettings {
                    interval: config.upload.interval,
                    batch_size: config.upload.batch_size,
                },
            );
            let triggers = Triggers {
                upload_now: upload_now_rx,
                connectivity_restored: restored_rx,
            };
            let runner_cancel = cancel.clone();
            runner_task = Some(tokio::spawn(async move {
                runner.run(triggers, runner_cancel).await
            }));

            let requester_cancel = cancel.clone();
            let requester_task = requester.clone();
            handles.push(tokio::spawn(async move {
                requester_task.run(requester_cancel).await;
            }));

            let monitor_probe = probe.clone();
            let monitor_interval = connectivity.monitor_interval;
            let monitor_cancel = cancel.clone();
            handles.push(tokio::spawn(async move {
                run_connectivity_monitor(monitor_probe, monitor_interval, restored_tx, monitor_cancel)
                    .await;
            }));
        }
        None => {
            warn!("No api section configured, events will be queued but not uploaded");
            drop(upload_now_rx);
            drop(restored_tx);
            drop(restored_rx);
        }
    }

    let state = Arc::new(ServiceState {
        store: store.clone(),
        upload_now: upload_now_tx,
    });
    let listen = config.service.listen;
    let server_cancel = cancel.clone();
    let server = tokio::spawn(async move { start_server(listen, state, server_cancel).await });

    info!("Event reporter started");

    let tasks = DaemonTasks {
        server,
        runner: runner_task,
        background: handles,
    };
    supervise(&store, tasks, shutdown_signal(), cancel).await
}

struct DaemonTasks {
    server: JoinHandle<std::io::Result<()>>,
    runner: Option<JoinHandle<Result<(), UploadError>>>,
    background: Vec<JoinHandle<()>>,
}

enum Stopped {
    Signal,
    Server(Result<std::io::Result<()>, tokio::task::JoinError>),
    Runner(Result<Result<(), UploadError>, tokio::task::JoinError>),
}

/// Waits for a shutdown signal, the server exiting, or the upload runner
/// failing. Whichever comes first stops every task and closes the store.
async fn supervise(
    store: &EventStore,
    tasks: DaemonTasks,
    shutdown: impl Future<Output = ()>,
    cancel: CancellationToken,
) -> Result<(), RunError> {
    let DaemonTasks {
        mut server,
        runner,
        background,
    } = tasks;

    let runner_cancel = cancel.clone();
    let runner_done = async move {
        match runner {
            Some(handle) => handle.await,
            None => {
                runner_cancel.cancelled().await;
                Ok(Ok(()))
            }
        }
    };
    tokio::pin!(runner_done);
    tokio::pin!(shutdown);

    let stopped = tokio::select! {
        _ = &mut shutdown => {
            info!("Shutdown signal received");
            Stopped::Signal
        }
        result = &mut server => Stopped::Server(result),
        result = &mut runner_done => Stopped::Runner(result),
    };

    cancel.cancel();

    let (server_result, runner_result) = match stopped {
        Stopped::Signal => (server.await, runner_done.await),
        Stopped::Server(result) => (result, runner_done.await),
        Stopped::Runner(result) => (server.await, result),
    };

    for handle in background {
        if let Err(e) = handle.await {
            error!(error = %e, "Task join error");
        }
    }

    store.close().await?;
    info!("Event reporter shutdown complete");

    if let Err(e) = runner_result? {
        error!(error = %e, "Upload runner stopped");
        return Err(e.into());
    }
    server_result??;
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}

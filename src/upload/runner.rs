use super::batcher::{build_batches, snapshot, EventGroup};
use super::connectivity::ConnectivityProbe;
use super::transport::{Transport, TransportKind};
use crate::store::{EventStore, StoreError};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

const RECENT_ERROR_LIMIT: usize = 5;

#[derive(Debug, Error)]
pub enum UploadError {
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("failed to build event groups: {0}")]
    Batch(#[from] serde_json::Error),
}

#[derive(Debug, Clone)]
pub struct UploadSettings {
    pub interval: Duration,
    pub batch_size: usize,
}

impl Default for UploadSettings {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(30 * 60),
            batch_size: super::batcher::DEFAULT_BATCH_SIZE,
        }
    }
}

/// The delivery paths, tried in the order the current link state dictates.
pub struct Transports {
    pub wifi: Arc<dyn Transport>,
    pub long_range: Option<Arc<dyn Transport>>,
    pub cellular: Arc<dyn Transport>,
}

/// Signals that start a cycle early.
pub struct Triggers {
    pub upload_now: mpsc::Receiver<()>,
    pub connectivity_restored: mpsc::Receiver<()>,
}

/// Outcome of one upload cycle.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CycleReport {
    pub pending: usize,
    pub transport: Option<TransportKind>,
    pub events_sent: usize,
    pub groups_sent: usize,
    pub groups_failed: usize,
    pub permanent_errors: usize,
    pub temporary_errors: usize,
    /// The most recent delivery errors, oldest first.
    pub recent_errors: Vec<String>,
    /// Set when a delete after confirmed delivery failed and the cycle stopped.
    pub aborted: bool,
}

fn last_errors(errors: &[String], limit: usize) -> Vec<String> {
    errors[errors.len().saturating_sub(limit)..].to_vec()
}

fn drain(rx: &mut mpsc::Receiver<()>) {
    while rx.try_recv().is_ok() {}
}

pub struct UploadRunner {
    store: EventStore,
    probe: Arc<dyn ConnectivityProbe>,
    transports: Transports,
    settings: UploadSettings,
}

impl UploadRunner {
    pub fn new(
        store: EventStore,
        probe: Arc<dyn ConnectivityProbe>,
        transports: Transports,
        settings: UploadSettings,
    ) -> Self {
        Self {
            store,
            probe,
            transports,
            settings,
        }
    }

    /// Runs cycles until `cancel` fires. Only a failure to read the queue
    /// ends the loop with an error.
    pub async fn run(
        &self,
        mut triggers: Triggers,
        cancel: CancellationToken,
    ) -> Result<(), UploadError> {
        info!(
            interval = ?self.settings.interval,
            batch_size = self.settings.batch_size,
            "Upload runner started"
        );

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                report = self.run_cycle() => {
                    report?;
                }
            }

            // Signals that fired during the cycle are stale now.
            drain(&mut triggers.connectivity_restored);

            tokio::select! {
                _ = cancel.cancelled() => break,
                Some(()) = triggers.upload_now.recv() => {
                    info!("Events upload requested");
                }
                Some(()) = triggers.connectivity_restored.recv() => {
                    info!("Connectivity restored, uploading events");
                }
                _ = tokio::time::sleep(self.settings.interval) => {}
            }
        }

        info!("Upload runner stopped");
        Ok(())
    }

    async fn transport_order(&self) -> Vec<Arc<dyn Transport>> {
        if self.probe.wifi_has_internet().await {
            return vec![Arc::clone(&self.transports.wifi)];
        }

        let mut order = Vec::with_capacity(2);
        if let Some(long_range) = &self.transports.long_range {
            order.push(Arc::clone(long_range));
        }
        order.push(Arc::clone(&self.transports.cellular));
        order
    }

    /// One pass over the queue: pick a transport, deliver every group and
    /// delete what the remote confirmed.
    pub async fn run_cycle(&self) -> Result<CycleReport, UploadError> {
        let keys = self.store.get_keys().await?;
        let mut report = CycleReport {
            pending: keys.len(),
            ..Default::default()
        };
        if keys.is_empty() {
            debug!("No events to send");
            return Ok(report);
        }
        info!(events = keys.len(), "Events to send");

        let records = snapshot(&self.store, &keys).await?;
        let groups = build_batches(&records, self.settings.batch_size)?;

        let order = self.transport_order().await;
        let mut errors = Vec::new();
        let mut remaining: &[EventGroup] = &groups;
        for transport in &order {
            let _session = match transport.establish().await {
                Ok(session) => session,
                Err(e) => {
                    warn!(transport = %transport.kind(), error = %e, "Transport unavailable");
                    continue;
                }
            };
            report.transport = Some(transport.kind());
            info!(
                events = remaining.iter().map(EventGroup::len).sum::<usize>(),
                groups = remaining.len(),
                transport = %transport.kind(),
                "Sending event groups"
            );

            match self
                .deliver_groups(transport.as_ref(), remaining, &mut report, &mut errors)
                .await
            {
                Some(failed_at) => {
                    remaining = &remaining[failed_at..];
                    warn!(
                        transport = %transport.kind(),
                        groups = remaining.len(),
                        "Delivery failed, trying next transport"
                    );
                }
                None => {
                    remaining = &[];
                    break;
                }
            }
        }

        if report.transport.is_none() {
            warn!("Unable to get a connection, not reporting events");
            return Ok(report);
        }
        // Groups the last yielding transport gave up on
        report.groups_failed += remaining.len();

        report.recent_errors = last_errors(&errors, RECENT_ERROR_LIMIT);

        if !errors.is_empty() {
            warn!(
                errors = errors.len(),
                permanent = report.permanent_errors,
                temporary = report.temporary_errors,
                "Errors occurred during reporting. Most recent:"
            );
            for e in &report.recent_errors {
                error!(error = %e, "Event report failed");
            }
        }
        if report.events_sent > 0 {
            info!(
                events = report.events_sent,
                groups = report.groups_sent,
                "Events sent"
            );
        }

        Ok(report)
    }

    /// Sends `groups` in order over `transport`. Returns the index of the
    /// group to resume from when the transport yields to the next one.
    async fn deliver_groups(
        &self,
        transport: &dyn Transport,
        groups: &[EventGroup],
        report: &mut CycleReport,
        errors: &mut Vec<String>,
    ) -> Option<usize> {
        for (index, group) in groups.iter().enumerate() {
            match transport.deliver(group).await {
                Ok(()) => {
                    if let Err(e) = self.store.delete_keys(&group.keys).await {
                        error!(error = %e, "Failed to delete delivered events from store");
                        report.aborted = true;
                        return None;
                    }
                    report.events_sent += group.len();
                    report.groups_sent += 1;
                }
                Err(e) if !e.is_permanent() && transport.yields_on_failure() => {
                    report.temporary_errors += 1;
                    debug!(events = group.len(), error = %e, "Event group delivery failed");
                    errors.push(e.to_string());
                    return Some(index);
                }
                Err(e) => {
                    report.groups_failed += 1;
                    if e.is_permanent() {
                        report.permanent_errors += 1;
                        warn!(events = group.len(), error = %e, "Remote rejected event group");
                    } else {
                        report.temporary_errors += 1;
                        debug!(events = group.len(), error = %e, "Event group delivery failed");
                    }
                    errors.push(e.to_string());
                }
            }
        }
        None
    }
}

//! Recovery scanner: re-emits ready events for batches stuck in READY.
//!
//! A batch stays READY when its ready event was never published, was lost,
//! or every delivery of it failed. Once it has been READY for longer than
//! the grace period, the scanner publishes a fresh ready event for it. The
//! worker is idempotent, so a re-emit racing with a slow first delivery is
//! harmless.
//!
//! Every instance may run a scanner; concurrent scanners only cause
//! duplicate events.

use std::sync::Arc;
use std::time::Duration as StdDuration;

use chrono::{DateTime, Duration, Utc};
use metrics::counter;
use tokio_util::sync::CancellationToken;

use crate::bus::EventBus;
use crate::clock::{Clock, SystemClock};
use crate::config::RecoveryConfig;
use crate::domain::{Batch, BatchId, BatchRecord, Ready};
use crate::envelope::Envelope;
use crate::error::Result;
use crate::storage::BatchStorage;
use crate::ticker::Ticker;

/// A step the scanner should take.
#[derive(Debug, Clone, PartialEq)]
pub enum RecoveryAction {
    /// Publish a new ready event carrying `record`.
    Republish { batch_id: BatchId, record: BatchRecord },
}

/// Pick the batches in `snapshot` that have been READY for strictly longer
/// than `grace` at `now`, oldest first.
pub fn plan_recovery(
    now: DateTime<Utc>,
    snapshot: &[Batch<Ready>],
    grace: Duration,
) -> Vec<RecoveryAction> {
    let cutoff = now - grace;
    let mut stuck: Vec<&Batch<Ready>> = snapshot
        .iter()
        .filter(|batch| batch.state.ready_at < cutoff)
        .collect();
    stuck.sort_by_key(|batch| batch.state.ready_at);

    stuck
        .into_iter()
        .map(|batch| RecoveryAction::Republish {
            batch_id: batch.data.id.clone(),
            record: BatchRecord::from(batch),
        })
        .collect()
}

/// Counts from one scan.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ScanReport {
    pub selected: usize,
    pub republished: usize,
    pub failed: usize,
}

/// Periodically re-drives stuck batches.
pub struct RecoveryScanner<S: BatchStorage> {
    storage: Arc<S>,
    bus: Arc<dyn EventBus>,
    ready_topic: String,
    config: RecoveryConfig,
    clock: Arc<dyn Clock>,
}

impl<S: BatchStorage> RecoveryScanner<S> {
    pub fn new(
        storage: Arc<S>,
        bus: Arc<dyn EventBus>,
        ready_topic: impl Into<String>,
        config: RecoveryConfig,
    ) -> Self {
        Self {
            storage,
            bus,
            ready_topic: ready_topic.into(),
            config,
            clock: Arc::new(SystemClock),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// One scan: select stuck batches and publish a ready event for each.
    ///
    /// A failed publish is logged and counted; the batch stays READY and is
    /// picked up again by the next scan.
    pub async fn scan_once(&self) -> Result<ScanReport> {
        let now = self.clock.now();
        let grace = self.config.grace_period();
        let snapshot = self.storage.list_ready_before(now - grace).await?;
        let actions = plan_recovery(now, &snapshot, grace);

        let mut report = ScanReport {
            selected: actions.len(),
            ..Default::default()
        };
        for action in actions {
            match action {
                RecoveryAction::Republish { batch_id, record } => {
                    match self.republish(&batch_id, &record).await {
                        Ok(()) => {
                            report.republished += 1;
                            tracing::info!(batch_id = %batch_id, "Re-emitted ready event for stuck batch");
                        }
                        Err(e) => {
                            report.failed += 1;
                            tracing::error!(
                                batch_id = %batch_id,
                                error = %e,
                                "Failed to re-emit ready event"
                            );
                        }
                    }
                }
            }
        }

        counter!("ferry_recovery_republished_total").increment(report.republished as u64);
        if report.selected > 0 {
            tracing::info!(
                selected = report.selected,
                republished = report.republished,
                failed = report.failed,
                "Recovery scan complete"
            );
        } else {
            tracing::debug!("Recovery scan found no stuck batches");
        }
        Ok(report)
    }

    async fn republish(&self, batch_id: &BatchId, record: &BatchRecord) -> Result<()> {
        let payload = Envelope::batch_ready(record)?.encode()?;
        self.bus
            .publish(&self.ready_topic, batch_id.as_str(), payload)
            .await
    }

    /// Scan every `scan_interval` until `shutdown` fires. A failed scan is
    /// logged and retried on the next tick.
    #[tracing::instrument(skip_all)]
    pub async fn run(&self, shutdown: CancellationToken) {
        let mut ticker = Ticker::new(
            StdDuration::from_millis(self.config.scan_interval_ms),
            shutdown,
        );
        tracing::info!(
            interval_ms = self.config.scan_interval_ms,
            grace_period_ms = self.config.grace_period_ms,
            "Recovery scanner started"
        );

        while ticker.tick().await {
            if let Err(e) = self.scan_once().await {
                tracing::error!(error = %e, "Recovery scan failed");
            }
        }
        tracing::info!("Recovery scanner stopped");
    }
}

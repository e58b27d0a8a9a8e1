//! Process runtime: one lease, one heartbeat task, one recovery task and the
//! ready-topic consumer.
//!
//! ```text
//! acquire lease ──> spawn heartbeat ──> spawn recovery ──> consume (fenced)
//!                        │
//!                        └── lease lost ──> cancel work ──> return LeaseLost
//! ```
//!
//! On shutdown the consumer and both tasks stop, and the lease is released
//! unless it was already lost.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::bus::EventBus;
use crate::clock::{Clock, SystemClock};
use crate::config::FerryConfig;
use crate::domain::{HeartbeatOutcome, LeaseHandle};
use crate::envelope::{BATCH_READY, DispatchTable};
use crate::error::{FerryError, Result};
use crate::lease::{HeartbeatAction, LeaseManager, plan_heartbeat};
use crate::objects::ObjectMover;
use crate::recovery::RecoveryScanner;
use crate::storage::{BatchStorage, LeaseStorage};
use crate::ticker::Ticker;
use crate::worker::{BatchWorker, Consumer};

/// Runs the coordination core for one process.
pub struct Coordinator<S>
where
    S: LeaseStorage + BatchStorage + 'static,
{
    storage: Arc<S>,
    bus: Arc<dyn EventBus>,
    mover: Arc<dyn ObjectMover>,
    config: FerryConfig,
    clock: Arc<dyn Clock>,
    shutdown: CancellationToken,
    lease: Mutex<Option<LeaseHandle>>,
}

impl<S> Coordinator<S>
where
    S: LeaseStorage + BatchStorage + 'static,
{
    /// Fails if `config` does not validate.
    pub fn new(
        storage: Arc<S>,
        bus: Arc<dyn EventBus>,
        mover: Arc<dyn ObjectMover>,
        config: FerryConfig,
    ) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            storage,
            bus,
            mover,
            config,
            clock: Arc::new(SystemClock),
            shutdown: CancellationToken::new(),
            lease: Mutex::new(None),
        })
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Cancel this token to stop the coordinator.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// The lease this coordinator currently runs under, once acquired.
    pub fn lease(&self) -> Option<LeaseHandle> {
        self.lease.lock().clone()
    }

    pub fn spawn(self: Arc<Self>) -> JoinHandle<Result<()>> {
        tokio::spawn(async move { self.run().await })
    }

    /// Acquire a lease and process ready events until shutdown or lease loss.
    #[tracing::instrument(skip(self))]
    pub async fn run(self: Arc<Self>) -> Result<()> {
        let lease_config = &self.config.lease;
        let leases = Arc::new(
            LeaseManager::new(self.storage.clone(), lease_config).with_clock(self.clock.clone()),
        );

        let handle = tokio::select! {
            _ = self.shutdown.cancelled() => return Err(FerryError::Shutdown),
            handle = leases.acquire_with_retry(&lease_config.acquire_retry) => handle?,
        };
        *self.lease.lock() = Some(handle.clone());
        tracing::info!(
            slot_id = %handle.slot_id(),
            epoch = handle.epoch(),
            holder_id = %handle.holder_id(),
            "Coordinator running"
        );

        let work = self.shutdown.child_token();
        let lost = Arc::new(AtomicBool::new(false));

        let heartbeat_task = tokio::spawn(heartbeat_loop(
            leases.clone(),
            handle.clone(),
            self.clock.clone(),
            Ticker::new(lease_config.heartbeat_interval(), work.clone()),
            lease_config.halt_on_lease_loss,
            work.clone(),
            lost.clone(),
        ));

        let scanner = RecoveryScanner::new(
            self.storage.clone(),
            self.bus.clone(),
            self.config.worker.ready_topic.clone(),
            self.config.recovery.clone(),
        )
        .with_clock(self.clock.clone());
        let recovery_work = work.clone();
        let recovery_task = tokio::spawn(async move { scanner.run(recovery_work).await });

        let mut worker = BatchWorker::new(
            self.storage.clone(),
            self.bus.clone(),
            self.mover.clone(),
            self.config.worker.clone(),
        )
        .with_clock(self.clock.clone());
        if lease_config.halt_on_lease_loss {
            worker = worker.with_fence(handle.fence());
        }
        let consumer = Consumer::new(
            self.bus.clone(),
            DispatchTable::new().register(BATCH_READY, Arc::new(worker)),
            self.config.worker.ready_topic.clone(),
            self.config.worker.consumer_group.clone(),
        )
        .with_redelivery_backoff(std::time::Duration::from_millis(
            self.config.worker.redelivery_backoff_ms,
        ));

        let consumed = consumer.run(work.clone()).await;
        if let Err(e) = &consumed {
            if matches!(e, FerryError::LeaseLost { .. }) {
                lost.store(true, Ordering::SeqCst);
            } else {
                tracing::error!(error = %e, "Consumer stopped with error");
            }
        }

        work.cancel();
        for (name, task) in [("heartbeat", heartbeat_task), ("recovery", recovery_task)] {
            if let Err(e) = task.await {
                tracing::error!(task = name, error = %e, "Background task panicked");
            }
        }

        let slot_id = handle.slot_id();
        if lost.load(Ordering::SeqCst) {
            tracing::warn!(slot_id = %slot_id, "Coordinator stopped after losing its lease");
            return Err(FerryError::LeaseLost { slot_id });
        }

        if let Err(e) = leases.release(handle).await {
            tracing::error!(slot_id = %slot_id, error = %e, "Failed to release lease");
        }
        *self.lease.lock() = None;
        tracing::info!(slot_id = %slot_id, "Coordinator stopped");
        consumed
    }
}

async fn heartbeat_loop<S: LeaseStorage>(
    leases: Arc<LeaseManager<S>>,
    handle: LeaseHandle,
    clock: Arc<dyn Clock>,
    mut ticker: Ticker,
    halt_on_loss: bool,
    work: CancellationToken,
    lost: Arc<AtomicBool>,
) {
    let mut last_renewed = handle.acquired_at();

    while ticker.tick().await {
        let outcome = match plan_heartbeat(clock.now(), last_renewed, leases.lease_timeout()) {
            HeartbeatAction::Halt => {
                tracing::warn!(
                    slot_id = %handle.slot_id(),
                    "No successful heartbeat within the lease timeout"
                );
                HeartbeatOutcome::Lost
            }
            HeartbeatAction::Renew => match leases.heartbeat(&handle).await {
                Ok(outcome) => outcome,
                Err(e) => {
                    tracing::error!(slot_id = %handle.slot_id(), error = %e, "Failed to send heartbeat");
                    continue;
                }
            },
        };

        match outcome {
            HeartbeatOutcome::Renewed { at } => last_renewed = at,
            HeartbeatOutcome::Lost => {
                lost.store(true, Ordering::SeqCst);
                if halt_on_loss {
                    tracing::warn!(slot_id = %handle.slot_id(), "Halting lease-gated work");
                    work.cancel();
                }
                break;
            }
        }
    }
}

//! Coordination core for moving staged file batches into production.
//!
//! Three cooperating pieces run in every instance:
//!
//! - a [`LeaseManager`] that hands each live instance a distinct slot from a
//!   fixed pool, with heartbeats and takeover of slots whose holder died;
//! - a [`BatchWorker`] that consumes ready events and drives each batch from
//!   READY to DONE exactly once in effect: files copied to production,
//!   metadata fanned out to two topics, record committed;
//! - a [`RecoveryScanner`] that re-emits ready events for batches stuck in
//!   READY past a grace period.
//!
//! The [`Coordinator`] wires them together behind a single lease. Storage,
//! the broker and the object store sit behind traits, with in-memory
//! implementations for tests and a PostgreSQL document store behind the
//! `postgres` feature.

pub mod bus;
pub mod clock;
pub mod config;
pub mod coordinator;
pub mod domain;
pub mod envelope;
pub mod error;
pub mod lease;
pub mod objects;
pub mod producer;
pub mod recovery;
pub mod storage;
pub mod ticker;
pub mod worker;

// Re-export commonly used types
pub use bus::{BusMessage, Delivery, EventBus, InMemoryBus, Subscription};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{FerryConfig, LeaseConfig, RecoveryConfig, RetryConfig, WorkerConfig};
pub use coordinator::Coordinator;
pub use domain::*;
pub use envelope::{DispatchTable, Envelope, EventHandler};
pub use error::{FerryError, Result};
pub use lease::{HeartbeatAction, LeaseManager, plan_heartbeat};
pub use objects::{
    InMemoryObjectStore, LocalFsObjectStore, MockObjectMover, ObjectMover, ObjectStore,
    ObjectStoreMover,
};
pub use producer::{BatchProducer, Submission};
pub use recovery::{RecoveryAction, RecoveryScanner, ScanReport, plan_recovery};
pub use storage::memory::InMemoryStore;
#[cfg(feature = "postgres")]
pub use storage::postgres::{PoolProvider, PostgresStore, TestDbPools};
pub use storage::{BatchStorage, LeaseStorage};
pub use worker::{
    BatchWorker, CommitSummary, Consumer, DeliveryOutcome, FailedPublish, FanOutReport,
    ProcessOutcome,
};

/// Get the ferry database migrator
///
/// Returns a migrator that can be run against a connection pool.
#[cfg(feature = "postgres")]
pub fn migrator() -> sqlx::migrate::Migrator {
    sqlx::migrate!("./migrations")
}

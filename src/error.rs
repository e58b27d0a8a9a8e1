//! Error types for the coordination core.

use thiserror::Error;

use crate::domain::{BatchId, SlotId};

/// Result type alias using the ferry error type.
pub type Result<T> = std::result::Result<T, FerryError>;

/// Main error type for the coordination core.
#[derive(Error, Debug)]
pub enum FerryError {
    /// Batch not found in the document store
    #[error("Batch not found: {0}")]
    BatchNotFound(BatchId),

    /// Batch is in an invalid state for the requested operation
    #[error("Invalid state transition: batch {0} is in state '{1}', expected '{2}'")]
    InvalidState(BatchId, String, String),

    /// A batch with this id was already created
    #[error("Batch already exists: {0}")]
    DuplicateBatch(BatchId),

    /// A stored batch document could not be decoded
    #[error("Stored batch {batch_id} cannot be decoded: {reason}")]
    CorruptRecord { batch_id: BatchId, reason: String },

    /// Every slot in the pool was held by a live instance during one full pass
    #[error("No lease slot available: all {pool_size} slots are held")]
    ResourceExhausted { pool_size: u32 },

    /// The lease this instance acted under is no longer current
    #[error("Lease on slot {slot_id} is no longer held by this instance")]
    LeaseLost { slot_id: SlotId },

    /// One transfer request of a batch could not be moved to production
    #[error("Failed to move '{staging_key}' for batch {batch_id}: {source}")]
    Transfer {
        batch_id: BatchId,
        staging_key: String,
        #[source]
        source: Box<FerryError>,
    },

    /// Document store momentarily unavailable or rejected the operation
    #[error("Document store error: {0}")]
    Store(String),

    /// Broker momentarily unavailable or rejected the operation
    #[error("Event bus error: {0}")]
    Bus(String),

    /// Object store momentarily unavailable or rejected the operation
    #[error("Object store error: {0}")]
    ObjectStore(String),

    /// Object key does not exist
    #[error("Object not found: {0}")]
    ObjectNotFound(String),

    /// Object key does not follow the staging/production layout
    #[error("Invalid object key '{0}': {1}")]
    InvalidKey(String, String),

    /// Envelope carried a type with no registered handler
    #[error("Unknown event type: {0}")]
    UnknownEventType(String),

    /// Envelope version is newer than the registered handler understands
    #[error("Unsupported version {version} for event type '{kind}'")]
    UnsupportedVersion { kind: String, version: u32 },

    /// Configuration rejected by validation
    #[error("Invalid configuration: {0}")]
    Config(String),

    /// Coordinator is shutting down
    #[error("Shutting down")]
    Shutdown,

    /// Serialization/deserialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Filesystem error from the local object store
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Database error from the PostgreSQL store
    #[cfg(feature = "postgres")]
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// General error from anyhow
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl FerryError {
    /// Whether a delivery that failed with this error is worth redelivering.
    ///
    /// Infrastructure hiccups are safe to retry because moves overwrite and
    /// the record stays READY. A failed move is as transient as its cause.
    /// Everything else is permanent for the delivery at hand.
    pub fn is_transient(&self) -> bool {
        match self {
            FerryError::Store(_)
            | FerryError::Bus(_)
            | FerryError::ObjectStore(_)
            | FerryError::Io(_) => true,
            FerryError::Transfer { source, .. } => source.is_transient(),
            #[cfg(feature = "postgres")]
            FerryError::Database(_) => true,
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transfer_failures_inherit_transience() {
        let outage = FerryError::Transfer {
            batch_id: BatchId::from("b-1"),
            staging_key: "24/05/01/abc".to_string(),
            source: Box::new(FerryError::ObjectStore("timeout".to_string())),
        };
        assert!(outage.is_transient());
        assert!(outage.to_string().contains("24/05/01/abc"));

        let missing = FerryError::Transfer {
            batch_id: BatchId::from("b-1"),
            staging_key: "24/05/01/abc".to_string(),
            source: Box::new(FerryError::ObjectNotFound("24/05/01/abc".to_string())),
        };
        assert!(!missing.is_transient());
    }

    #[test]
    fn test_lease_and_decode_failures_are_permanent() {
        assert!(!FerryError::LeaseLost { slot_id: SlotId(3) }.is_transient());
        assert!(!FerryError::UnknownEventType("x".to_string()).is_transient());
        assert!(!FerryError::ResourceExhausted { pool_size: 10 }.is_transient());
        assert!(!FerryError::DuplicateBatch(BatchId::from("b-1")).is_transient());
        assert!(
            !FerryError::CorruptRecord {
                batch_id: BatchId::from("b-1"),
                reason: "missing field".to_string(),
            }
            .is_transient()
        );
    }
}

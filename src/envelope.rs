//! Versioned event envelope and handler dispatch.
//!
//! Every message on the ready topic is an [`Envelope`]:
//!
//! ```json
//! { "type": "batch.ready", "version": 1, "payload": { ... } }
//! ```
//!
//! Consumers look the type up in a [`DispatchTable`]. An unknown type or a
//! version newer than the handler supports is a permanent failure for that
//! delivery; the consumer acks and logs it rather than redelivering forever.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize, de::DeserializeOwned};

use crate::domain::BatchRecord;
use crate::error::{FerryError, Result};

/// Type tag of the ready event.
pub const BATCH_READY: &str = "batch.ready";

/// Current version of the ready event.
pub const BATCH_READY_VERSION: u32 = 1;

/// A typed, versioned message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(rename = "type")]
    pub kind: String,
    pub version: u32,
    pub payload: serde_json::Value,
}

impl Envelope {
    pub fn new<T: Serialize>(kind: &str, version: u32, payload: &T) -> Result<Self> {
        Ok(Self {
            kind: kind.to_string(),
            version,
            payload: serde_json::to_value(payload)?,
        })
    }

    /// The ready event for a batch record.
    pub fn batch_ready(record: &BatchRecord) -> Result<Self> {
        Self::new(BATCH_READY, BATCH_READY_VERSION, record)
    }

    pub fn encode(&self) -> Result<Bytes> {
        Ok(Bytes::from(serde_json::to_vec(self)?))
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(bytes)?)
    }

    pub fn payload_as<T: DeserializeOwned>(&self) -> Result<T> {
        Ok(serde_json::from_value(self.payload.clone())?)
    }
}

/// Handler for one envelope type.
#[async_trait]
pub trait EventHandler: Send + Sync {
    /// Highest envelope version this handler understands.
    fn supported_version(&self) -> u32;

    async fn handle(&self, envelope: &Envelope) -> Result<()>;
}

/// Maps envelope types to handlers.
#[derive(Clone, Default)]
pub struct DispatchTable {
    handlers: HashMap<String, Arc<dyn EventHandler>>,
}

impl DispatchTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `handler` for `kind`, replacing any previous registration.
    pub fn register(mut self, kind: &str, handler: Arc<dyn EventHandler>) -> Self {
        self.handlers.insert(kind.to_string(), handler);
        self
    }

    pub async fn dispatch(&self, envelope: &Envelope) -> Result<()> {
        let handler = self
            .handlers
            .get(&envelope.kind)
            .ok_or_else(|| FerryError::UnknownEventType(envelope.kind.clone()))?;

        if envelope.version > handler.supported_version() {
            return Err(FerryError::UnsupportedVersion {
                kind: envelope.kind.clone(),
                version: envelope.version,
            });
        }

        handler.handle(envelope).await
    }
}

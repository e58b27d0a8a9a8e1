//! Object storage and the staging → production move.
//!
//! The worker never talks to an [`ObjectStore`] directly; it goes through an
//! [`ObjectMover`], which copies one transfer request's staged object to its
//! production key. Moves overwrite, so repeating one is harmless.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::oneshot;
use uuid::Uuid;

use crate::domain::TransferRequest;
use crate::error::{FerryError, Result};

/// Key/value object storage.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Write `data` under `key`, replacing any existing object.
    async fn put(&self, key: &str, data: Bytes) -> Result<()>;

    /// Read the object under `key`. Fails with `ObjectNotFound` if absent.
    async fn get(&self, key: &str) -> Result<Bytes>;

    async fn exists(&self, key: &str) -> Result<bool>;

    /// All keys starting with `prefix`, sorted.
    async fn list(&self, prefix: &str) -> Result<Vec<String>>;
}

/// Object store held in memory.
#[derive(Default)]
pub struct InMemoryObjectStore {
    objects: Mutex<BTreeMap<String, Bytes>>,
    writes: AtomicU64,
    unavailable: Mutex<bool>,
}

impl InMemoryObjectStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Total number of successful `put` calls.
    pub fn write_count(&self) -> u64 {
        self.writes.load(Ordering::Relaxed)
    }

    /// Snapshot of every stored object.
    pub fn snapshot(&self) -> BTreeMap<String, Bytes> {
        self.objects.lock().clone()
    }

    /// Make every call fail with an object store error until reset.
    pub fn set_unavailable(&self, unavailable: bool) {
        *self.unavailable.lock() = unavailable;
    }

    fn check_available(&self) -> Result<()> {
        if *self.unavailable.lock() {
            return Err(FerryError::ObjectStore("object store unavailable".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl ObjectStore for InMemoryObjectStore {
    async fn put(&self, key: &str, data: Bytes) -> Result<()> {
        self.check_available()?;
        self.objects.lock().insert(key.to_string(), data);
        self.writes.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Bytes> {
        self.check_available()?;
        self.objects
            .lock()
            .get(key)
            .cloned()
            .ok_or_else(|| FerryError::ObjectNotFound(key.to_string()))
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        self.check_available()?;
        Ok(self.objects.lock().contains_key(key))
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>> {
        self.check_available()?;
        Ok(self
            .objects
            .lock()
            .keys()
            .filter(|k| k.starts_with(prefix))
            .cloned()
            .collect())
    }
}

const TEMP_SUFFIX: &str = ".ferry-tmp";

/// Object store rooted at a local directory. Keys map to relative paths.
///
/// Writes go to a temporary sibling first and are renamed into place, so a
/// reader never observes a partially written object.
#[derive(Debug, Clone)]
pub struct LocalFsObjectStore {
    root: PathBuf,
}

impl LocalFsObjectStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path_for(&self, key: &str) -> Result<PathBuf> {
        let valid = !key.is_empty()
            && !key.starts_with('/')
            && key
                .split('/')
                .all(|s| !s.is_empty() && s != "." && s != "..");
        if !valid {
            return Err(FerryError::InvalidKey(
                key.to_string(),
                "keys must be relative paths without empty, '.' or '..' segments".to_string(),
            ));
        }
        Ok(self.root.join(key))
    }
}

#[async_trait]
impl ObjectStore for LocalFsObjectStore {
    async fn put(&self, key: &str, data: Bytes) -> Result<()> {
        let path = self.path_for(key)?;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let mut tmp = path.clone().into_os_string();
        tmp.push(format!(".{}{}", Uuid::new_v4().simple(), TEMP_SUFFIX));
        let tmp = PathBuf::from(tmp);

        tokio::fs::write(&tmp, &data).await?;
        if let Err(e) = tokio::fs::rename(&tmp, &path).await {
            let _ = tokio::fs::remove_file(&tmp).await;
            return Err(e.into());
        }
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Bytes> {
        let path = self.path_for(key)?;
        match tokio::fs::read(&path).await {
            Ok(data) => Ok(Bytes::from(data)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(FerryError::ObjectNotFound(key.to_string()))
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        let path = self.path_for(key)?;
        Ok(tokio::fs::try_exists(&path).await?)
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>> {
        let mut keys = Vec::new();
        let mut pending = vec![self.root.clone()];

        while let Some(dir) = pending.pop() {
            let mut entries = match tokio::fs::read_dir(&dir).await {
                Ok(entries) => entries,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                Err(e) => return Err(e.into()),
            };
            while let Some(entry) = entries.next_entry().await? {
                let path = entry.path();
                if entry.file_type().await?.is_dir() {
                    pending.push(path);
                    continue;
                }
                let Ok(relative) = path.strip_prefix(&self.root) else {
                    continue;
                };
                let key = relative
                    .components()
                    .map(|c| c.as_os_str().to_string_lossy())
                    .collect::<Vec<_>>()
                    .join("/");
                if !key.ends_with(TEMP_SUFFIX) && key.starts_with(prefix) {
                    keys.push(key);
                }
            }
        }

        keys.sort();
        Ok(keys)
    }
}

/// Copies one staged object to its production key.
#[async_trait]
pub trait ObjectMover: Send + Sync {
    /// Copy `request`'s staged object to production, overwriting any existing
    /// object, and return the production key.
    async fn copy_to_production(&self, request: &TransferRequest) -> Result<String>;
}

/// Mover between two object stores (or two areas of one).
#[derive(Clone)]
pub struct ObjectStoreMover {
    staging: Arc<dyn ObjectStore>,
    production: Arc<dyn ObjectStore>,
}

impl ObjectStoreMover {
    pub fn new(staging: Arc<dyn ObjectStore>, production: Arc<dyn ObjectStore>) -> Self {
        Self {
            staging,
            production,
        }
    }
}

#[async_trait]
impl ObjectMover for ObjectStoreMover {
    async fn copy_to_production(&self, request: &TransferRequest) -> Result<String> {
        let production_key = request.production_key()?;
        let data = self.staging.get(&request.staging_key).await?;
        self.production.put(&production_key, data).await?;
        tracing::debug!(
            staging_key = %request.staging_key,
            production_key = %production_key,
            "Copied object to production"
        );
        Ok(production_key)
    }
}

/// Mover for tests: records every call and fails or blocks on demand.
#[derive(Clone, Default)]
pub struct MockObjectMover {
    calls: Arc<Mutex<Vec<TransferRequest>>>,
    failures: Arc<Mutex<HashMap<String, Vec<FerryError>>>>,
    gates: Arc<Mutex<HashMap<String, oneshot::Receiver<()>>>>,
}

impl MockObjectMover {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail the next move of `staging_key` with `error`. Queued errors are
    /// returned in FIFO order; once exhausted, moves of the key succeed.
    pub fn fail_next(&self, staging_key: &str, error: FerryError) {
        self.failures
            .lock()
            .entry(staging_key.to_string())
            .or_default()
            .push(error);
    }

    /// Block the next move of `staging_key` until the returned sender fires
    /// (or is dropped).
    pub fn hold(&self, staging_key: &str) -> oneshot::Sender<()> {
        let (tx, rx) = oneshot::channel();
        self.gates.lock().insert(staging_key.to_string(), rx);
        tx
    }

    /// Every request passed to `copy_to_production`, in call order.
    pub fn calls(&self) -> Vec<TransferRequest> {
        self.calls.lock().clone()
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().len()
    }
}

#[async_trait]
impl ObjectMover for MockObjectMover {
    async fn copy_to_production(&self, request: &TransferRequest) -> Result<String> {
        self.calls.lock().push(request.clone());

        let gate = self.gates.lock().remove(&request.staging_key);
        if let Some(gate) = gate {
            let _ = gate.await;
        }

        let failure = {
            let mut failures = self.failures.lock();
            failures
                .get_mut(&request.staging_key)
                .filter(|queued| !queued.is_empty())
                .map(|queued| queued.remove(0))
        };
        if let Some(error) = failure {
            return Err(error);
        }

        request.production_key()
    }
}

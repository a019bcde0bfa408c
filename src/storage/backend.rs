//! Backend capability set and the registry that fronts it
//!
//! A backend exposes exactly four operations: `open`, `list`, `exists`, and
//! `health`. Concrete implementations wrap an [`object_store::ObjectStore`]
//! (local filesystem, in-memory, or any cloud store), so the core never
//! talks to a vendor SDK directly.
//!
//! Every read goes through the [`BackendRegistry`]:
//! - transient failures (network, 5xx, timeout) are retried with bounded
//!   exponential backoff on the same backend;
//! - not-found falls through to the next backend in registration order;
//! - all backends reporting not-found yields an empty result, not an error;
//! - only an all-backends-transient-failure surfaces as a read error.

use crate::config::StorageMode;
use crate::error::{Error, Result, StorageError};
use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use object_store::local::LocalFileSystem;
use object_store::memory::InMemory;
use object_store::path::Path;
use object_store::ObjectStore;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Health report of a single backend
#[derive(Debug, Clone, Serialize)]
pub struct BackendHealth {
    /// Backend identifier
    pub backend_id: String,
    /// Whether the backend answered its probe
    pub ok: bool,
    /// Probe failures, empty when healthy
    pub issues: Vec<String>,
}

/// The capability set every storage backend provides
#[async_trait]
pub trait Backend: Send + Sync + 'static {
    /// Identifier used in logs and health reports
    fn backend_id(&self) -> &str;

    /// Fetch the full contents of an object
    async fn open(&self, path: &str) -> std::result::Result<Bytes, StorageError>;

    /// List object paths under a prefix; a missing prefix yields an empty list
    async fn list(&self, prefix: &str) -> std::result::Result<Vec<String>, StorageError>;

    /// Check whether an object exists
    async fn exists(&self, path: &str) -> std::result::Result<bool, StorageError>;

    /// Probe the backend
    async fn health(&self) -> BackendHealth;
}

/// Backend backed by any [`object_store::ObjectStore`]
pub struct ObjectStoreBackend {
    id: String,
    store: Arc<dyn ObjectStore>,
}

impl ObjectStoreBackend {
    /// Wrap an existing object store
    pub fn new(id: impl Into<String>, store: Arc<dyn ObjectStore>) -> Self {
        Self {
            id: id.into(),
            store,
        }
    }

    /// Local-filesystem backend rooted at `path`; the directory is created if
    /// absent
    pub fn local(id: impl Into<String>, path: &std::path::Path) -> Result<Self> {
        std::fs::create_dir_all(path)
            .map_err(|e| Error::Configuration(format!("cannot create {}: {}", path.display(), e)))?;
        let store = LocalFileSystem::new_with_prefix(path)
            .map_err(|e| Error::Configuration(format!("invalid storage root: {}", e)))?;
        Ok(Self::new(id, Arc::new(store)))
    }

    /// In-memory backend, used in tests and for ephemeral deployments
    pub fn in_memory(id: impl Into<String>) -> Self {
        Self::new(id, Arc::new(InMemory::new()))
    }
}

#[async_trait]
impl Backend for ObjectStoreBackend {
    fn backend_id(&self) -> &str {
        &self.id
    }

    async fn open(&self, path: &str) -> std::result::Result<Bytes, StorageError> {
        let location = Path::from(path);
        let result = self.store.get(&location).await?;
        Ok(result.bytes().await?)
    }

    async fn list(&self, prefix: &str) -> std::result::Result<Vec<String>, StorageError> {
        let location = if prefix.is_empty() {
            None
        } else {
            Some(Path::from(prefix))
        };
        let mut stream = self.store.list(location.as_ref());
        let mut paths = Vec::new();
        while let Some(item) = stream.next().await {
            match item {
                Ok(meta) => paths.push(meta.location.to_string()),
                Err(object_store::Error::NotFound { .. }) => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(paths)
    }

    async fn exists(&self, path: &str) -> std::result::Result<bool, StorageError> {
        let location = Path::from(path);
        match self.store.head(&location).await {
            Ok(_) => Ok(true),
            Err(object_store::Error::NotFound { .. }) => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    async fn health(&self) -> BackendHealth {
        // A single-item list of the root is enough to prove reachability.
        let mut stream = self.store.list(None);
        match stream.next().await {
            None | Some(Ok(_)) | Some(Err(object_store::Error::NotFound { .. })) => BackendHealth {
                backend_id: self.id.clone(),
                ok: true,
                issues: Vec::new(),
            },
            Some(Err(e)) => BackendHealth {
                backend_id: self.id.clone(),
                ok: false,
                issues: vec![e.to_string()],
            },
        }
    }
}

/// Retry policy for transient backend failures
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// First backoff delay
    pub base: Duration,
    /// Multiplier applied per attempt
    pub factor: u32,
    /// Upper bound on a single backoff delay
    pub cap: Duration,
    /// Total attempts before giving up on a backend
    pub max_attempts: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base: Duration::from_millis(100),
            factor: 2,
            cap: Duration::from_secs(2),
            max_attempts: 3,
        }
    }
}

impl RetryPolicy {
    /// Backoff delay before attempt `attempt + 1` (zero-based)
    fn delay(&self, attempt: u32) -> Duration {
        let exp = self.base.saturating_mul(self.factor.saturating_pow(attempt));
        exp.min(self.cap)
    }
}

/// Ordered sequence of backends with retry and not-found fallback
pub struct BackendRegistry {
    backends: Vec<Arc<dyn Backend>>,
    retry: RetryPolicy,
    last_health: parking_lot::Mutex<Vec<BackendHealth>>,
}

impl BackendRegistry {
    /// Build a registry from an explicit backend order
    pub fn new(backends: Vec<Arc<dyn Backend>>) -> Result<Self> {
        if backends.is_empty() {
            return Err(Error::Configuration(
                "registry requires at least one backend".to_string(),
            ));
        }
        Ok(Self {
            backends,
            retry: RetryPolicy::default(),
            last_health: parking_lot::Mutex::new(Vec::new()),
        })
    }

    /// Compose a registry according to the configured storage mode
    pub fn from_mode(
        mode: StorageMode,
        primary: Option<Arc<dyn Backend>>,
        secondary: Option<Arc<dyn Backend>>,
    ) -> Result<Self> {
        let backends: Vec<Arc<dyn Backend>> = match mode {
            StorageMode::PrimaryOnly => vec![primary.ok_or_else(|| {
                Error::Configuration("storage_mode=primary_only requires a primary backend".into())
            })?],
            StorageMode::SecondaryOnly => vec![secondary.ok_or_else(|| {
                Error::Configuration(
                    "storage_mode=secondary_only requires a secondary backend".into(),
                )
            })?],
            StorageMode::Failover => {
                let mut v = Vec::new();
                if let Some(p) = primary {
                    v.push(p);
                }
                if let Some(s) = secondary {
                    v.push(s);
                }
                v
            }
        };
        Self::new(backends)
    }

    /// Override the retry policy
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Retry one backend operation through the transient-failure policy.
    ///
    /// Not-found and permanent errors return immediately; transient errors
    /// back off and retry up to `max_attempts`.
    async fn with_retries<T, F, Fut>(&self, backend_id: &str, mut op: F) -> std::result::Result<T, StorageError>
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = std::result::Result<T, StorageError>>,
    {
        let mut attempt = 0;
        loop {
            match op().await {
                Ok(v) => return Ok(v),
                Err(e) if e.is_not_found() || !e.is_transient() => return Err(e),
                Err(e) => {
                    attempt += 1;
                    if attempt >= self.retry.max_attempts {
                        return Err(e);
                    }
                    let delay = self.retry.delay(attempt - 1);
                    crate::metrics::BACKEND_RETRIES.inc();
                    debug!(
                        backend = backend_id,
                        attempt = attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "transient backend failure, backing off"
                    );
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }

    /// Fetch an object, falling through backends on not-found.
    ///
    /// Returns `Ok(None)` when every backend reports not-found. A transient
    /// failure that exhausts its retries moves on to the next backend; if no
    /// backend produced the object and at least one failed transiently, the
    /// read errors out rather than silently claiming the object is absent.
    pub async fn open(&self, path: &str) -> Result<Option<Bytes>> {
        let mut transient_failures = Vec::new();
        for backend in &self.backends {
            match self
                .with_retries(backend.backend_id(), || backend.open(path))
                .await
            {
                Ok(bytes) => return Ok(Some(bytes)),
                Err(e) if e.is_not_found() => {
                    debug!(backend = backend.backend_id(), path = path, "not found");
                }
                Err(e) if e.is_transient() => {
                    warn!(
                        backend = backend.backend_id(),
                        path = path,
                        error = %e,
                        "backend exhausted retries"
                    );
                    transient_failures.push(format!("{}: {}", backend.backend_id(), e));
                }
                Err(e) => return Err(Error::ReadFailed(e)),
            }
        }
        if transient_failures.is_empty() {
            Ok(None)
        } else {
            Err(Error::BackendUnavailable {
                message: transient_failures.join("; "),
            })
        }
    }

    /// List the union of object paths under a prefix across all backends.
    pub async fn list(&self, prefix: &str) -> Result<Vec<String>> {
        let mut merged = Vec::new();
        let mut any_ok = false;
        let mut transient_failures = Vec::new();
        for backend in &self.backends {
            match self
                .with_retries(backend.backend_id(), || backend.list(prefix))
                .await
            {
                Ok(paths) => {
                    any_ok = true;
                    merged.extend(paths);
                }
                Err(e) if e.is_not_found() => any_ok = true,
                Err(e) if e.is_transient() => {
                    transient_failures.push(format!("{}: {}", backend.backend_id(), e));
                }
                Err(e) => return Err(Error::ReadFailed(e)),
            }
        }
        if !any_ok {
            return Err(Error::BackendUnavailable {
                message: transient_failures.join("; "),
            });
        }
        merged.sort();
        merged.dedup();
        Ok(merged)
    }

    /// Check whether any backend holds an object at `path`.
    pub async fn exists(&self, path: &str) -> Result<bool> {
        let mut transient_failures = Vec::new();
        for backend in &self.backends {
            match self
                .with_retries(backend.backend_id(), || backend.exists(path))
                .await
            {
                Ok(true) => return Ok(true),
                Ok(false) => {}
                Err(e) if e.is_not_found() => {}
                Err(e) if e.is_transient() => {
                    transient_failures.push(format!("{}: {}", backend.backend_id(), e));
                }
                Err(e) => return Err(Error::ReadFailed(e)),
            }
        }
        if !transient_failures.is_empty() {
            return Err(Error::BackendUnavailable {
                message: transient_failures.join("; "),
            });
        }
        Ok(false)
    }

    /// Probe all backends, caching the results for `health_snapshot`.
    pub async fn health(&self) -> Vec<BackendHealth> {
        let mut statuses = Vec::with_capacity(self.backends.len());
        for backend in &self.backends {
            statuses.push(backend.health().await);
        }
        *self.last_health.lock() = statuses.clone();
        statuses
    }

    /// The most recent health probe results without re-probing.
    pub fn health_snapshot(&self) -> Vec<BackendHealth> {
        self.last_health.lock().clone()
    }

    /// Backend identifiers in fallback order
    pub fn backend_ids(&self) -> Vec<String> {
        self.backends
            .iter()
            .map(|b| b.backend_id().to_string())
            .collect()
    }
}

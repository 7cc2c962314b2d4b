//! Entity locks
//!
//! Every backend provides an [`EntityLock`] implementation doing one
//! non-waiting acquisition attempt. [`Lock`] layers the optional wait window on
//! top, and hands out a [`LockGuard`] that is released on every exit path.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::backend::{StateError, StateResult};
use crate::key::EntityKey;

/// Default interval between acquisition attempts while waiting
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(250);

/// Activity a lock is taken for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationType {
    CreateEnvironment,
    UpdateEnvironment,
    DeleteEnvironment,
    LockEnvironment,
    CreateResource,
    UpdateResource,
    ReplaceResource,
    DeleteResource,
    DeployService,
    CreateService,
    UpdateService,
    DeleteService,
    ForceUnlock,
}

impl fmt::Display for OperationType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::CreateEnvironment => "create_environment",
            Self::UpdateEnvironment => "update_environment",
            Self::DeleteEnvironment => "delete_environment",
            Self::LockEnvironment => "lock_environment",
            Self::CreateResource => "create_resource",
            Self::UpdateResource => "update_resource",
            Self::ReplaceResource => "replace_resource",
            Self::DeleteResource => "delete_resource",
            Self::DeployService => "deploy_service",
            Self::CreateService => "create_service",
            Self::UpdateService => "update_service",
            Self::DeleteService => "delete_service",
            Self::ForceUnlock => "force_unlock",
        };
        write!(f, "{}", name)
    }
}

/// Operation tag plus free-form metadata stored with the lock
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LockOperation {
    pub operation_type: OperationType,
    #[serde(default)]
    pub metadata: serde_json::Map<String, serde_json::Value>,
}

impl LockOperation {
    pub fn new(operation_type: OperationType) -> Self {
        Self {
            operation_type,
            metadata: serde_json::Map::new(),
        }
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }
}

/// Persisted lock record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LockInfo {
    /// Opaque token the holder presents on release
    pub lock_id: String,
    pub lock_operation: LockOperation,
    /// Who acquired the lock (username@hostname)
    #[serde(default = "unknown_owner")]
    pub who: String,
    #[serde(default = "Utc::now")]
    pub acquired_at: DateTime<Utc>,
    /// How long the acquirer was willing to wait
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub wait_for_seconds: Option<u64>,
}

impl LockInfo {
    /// Create a new lock record with a fresh id
    pub fn new(lock_operation: LockOperation) -> Self {
        Self {
            lock_id: uuid::Uuid::new_v4().to_string(),
            lock_operation,
            who: get_lock_owner(),
            acquired_at: Utc::now(),
            wait_for_seconds: None,
        }
    }

    pub fn with_wait_for_seconds(mut self, wait_for_seconds: Option<u64>) -> Self {
        self.wait_for_seconds = wait_for_seconds;
        self
    }

    /// Same record under a different id (used when the server assigns the id)
    pub fn with_lock_id(mut self, lock_id: impl Into<String>) -> Self {
        self.lock_id = lock_id.into();
        self
    }
}

fn unknown_owner() -> String {
    "unknown".to_string()
}

/// Get the lock owner string (username@hostname)
fn get_lock_owner() -> String {
    let username = std::env::var("USER")
        .or_else(|_| std::env::var("USERNAME"))
        .unwrap_or_else(|_| "unknown".to_string());

    let hostname = hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .unwrap_or_else(|| "unknown".to_string());

    format!("{}@{}", username, hostname)
}

/// One backend's way of claiming an entity
#[async_trait]
pub trait EntityLock: Send + Sync {
    /// Single non-waiting attempt
    ///
    /// Returns the lock id to present on release, or `EntityLocked` on contention.
    async fn try_acquire(&self, info: &LockInfo) -> StateResult<String>;

    /// Release a lock previously returned by `try_acquire`
    async fn release(&self, lock_id: &str) -> StateResult<()>;

    /// Current lock record, if any
    async fn read_info(&self) -> StateResult<Option<LockInfo>>;

    /// Delete the lock record regardless of holder; `LockNotFound` if there is none
    async fn force_release(&self) -> StateResult<()>;
}

/// Lock for entities whose real state lives elsewhere (e.g. a local container runtime)
#[derive(Debug, Default)]
pub struct NoopLock;

#[async_trait]
impl EntityLock for NoopLock {
    async fn try_acquire(&self, info: &LockInfo) -> StateResult<String> {
        Ok(info.lock_id.clone())
    }

    async fn release(&self, _lock_id: &str) -> StateResult<()> {
        Ok(())
    }

    async fn read_info(&self) -> StateResult<Option<LockInfo>> {
        Ok(None)
    }

    /// There is never a record to remove
    async fn force_release(&self) -> StateResult<()> {
        Err(StateError::LockNotFound("no-op lock".to_string()))
    }
}

/// A pending claim on an entity: operation, optional wait window, backend lock
pub struct Lock {
    key: EntityKey,
    inner: Arc<dyn EntityLock>,
    operation: LockOperation,
    wait_for: Option<Duration>,
    poll_interval: Duration,
}

impl Lock {
    pub fn new(key: EntityKey, inner: Arc<dyn EntityLock>, operation: LockOperation) -> Self {
        Self {
            key,
            inner,
            operation,
            wait_for: None,
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }

    /// Keep retrying on contention for up to `seconds`
    pub fn wait_for_seconds(self, seconds: u64) -> Self {
        self.wait_for(Some(Duration::from_secs(seconds)))
    }

    pub fn wait_for(mut self, wait_for: Option<Duration>) -> Self {
        self.wait_for = wait_for;
        self
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    pub fn key(&self) -> &EntityKey {
        &self.key
    }

    pub fn operation(&self) -> &LockOperation {
        &self.operation
    }

    /// Claim the entity exclusively
    ///
    /// Without a wait window a held lock fails immediately with `EntityLocked`;
    /// with one, acquisition is retried until the window elapses.
    pub async fn acquire(&self) -> StateResult<LockGuard> {
        let deadline = self.wait_for.map(|w| tokio::time::Instant::now() + w);
        let info = LockInfo::new(self.operation.clone())
            .with_wait_for_seconds(self.wait_for.map(|w| w.as_secs()));

        loop {
            match self.inner.try_acquire(&info).await {
                Ok(lock_id) => {
                    log::debug!(
                        "acquired lock on {} for {} ({})",
                        self.key,
                        self.operation.operation_type,
                        lock_id
                    );
                    return Ok(LockGuard {
                        key: self.key.clone(),
                        inner: Arc::clone(&self.inner),
                        lock_id,
                        released: false,
                    });
                }
                Err(err @ StateError::EntityLocked { .. }) => {
                    let now = tokio::time::Instant::now();
                    match deadline {
                        Some(deadline) if now < deadline => {
                            log::debug!("{} is locked, retrying", self.key);
                            let remaining = deadline - now;
                            tokio::time::sleep(remaining.min(self.poll_interval)).await;
                        }
                        _ => return Err(err),
                    }
                }
                Err(err) => return Err(err),
            }
        }
    }
}

/// A held lock
///
/// Call [`LockGuard::release`] to release it and observe errors. A guard that is
/// dropped while still held (early return, panic, task cancellation) is released
/// in the background on the current tokio runtime.
pub struct LockGuard {
    key: EntityKey,
    inner: Arc<dyn EntityLock>,
    lock_id: String,
    released: bool,
}

impl LockGuard {
    pub fn lock_id(&self) -> &str {
        &self.lock_id
    }

    pub fn key(&self) -> &EntityKey {
        &self.key
    }

    /// Release the lock
    pub async fn release(mut self) -> StateResult<()> {
        self.released = true;
        let result = self.inner.release(&self.lock_id).await;
        match &result {
            Ok(()) => log::debug!("released lock on {} ({})", self.key, self.lock_id),
            Err(e) => log::warn!("failed to release lock on {}: {}", self.key, e),
        }
        result
    }
}

impl fmt::Debug for LockGuard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LockGuard")
            .field("key", &self.key)
            .field("lock_id", &self.lock_id)
            .field("released", &self.released)
            .finish()
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        if self.released {
            return;
        }

        let inner = Arc::clone(&self.inner);
        let lock_id = std::mem::take(&mut self.lock_id);
        let key = self.key.clone();
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    match inner.release(&lock_id).await {
                        Ok(()) => log::debug!("released dropped lock on {}", key),
                        Err(e) => log::warn!("failed to release dropped lock on {}: {}", key, e),
                    }
                });
            }
            Err(_) => log::warn!(
                "lock on {} dropped outside a runtime; it must be force-unlocked",
                key
            ),
        }
    }
}

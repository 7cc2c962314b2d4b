//! Backend descriptor, store trait and error types

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;

use crate::key::{ChildKind, EntityKey, EntityKind};
use crate::lock::{EntityLock, LockInfo};

/// Default endpoint of the hosted control-plane API
pub const DEFAULT_API_URL: &str = "https://api.flow.dev";

/// Errors that can occur when interacting with state or locks
#[derive(Debug, Error)]
pub enum StateError {
    #[error("Project not found: {0}")]
    ProjectNotFound(String),

    #[error("Environment not found: {0}")]
    EnvironmentNotFound(String),

    #[error("Resource not found: {0}")]
    ResourceNotFound(String),

    #[error("Service not found: {0}")]
    ServiceNotFound(String),

    /// The entity is locked by someone else
    #[error("{key} is locked by {who} (lock ID: {lock_id}, operation: {operation})")]
    EntityLocked {
        key: String,
        lock_id: String,
        who: String,
        operation: String,
    },

    /// No lock record exists (release / force-unlock)
    #[error("Lock not found: {0}")]
    LockNotFound(String),

    /// Lock ID mismatch when trying to release
    #[error("Lock ID mismatch: expected {expected}, got {actual}")]
    LockMismatch { expected: String, actual: String },

    #[error("Unsupported backend type: {0}")]
    UnsupportedBackend(String),

    #[error("Backend configuration error: {0}")]
    Configuration(String),

    /// Record is corrupted or invalid
    #[error("Invalid state at {key}: {message}")]
    InvalidState { key: String, message: String },

    #[error("I/O error: {0}")]
    Io(String),

    #[error("AWS error: {0}")]
    Aws(String),

    #[error("HTTP error: {0}")]
    Http(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl StateError {
    /// Entity-specific NotFound for a key
    pub fn not_found(key: &EntityKey) -> Self {
        let name = key.to_string();
        match key.kind() {
            EntityKind::Project => Self::ProjectNotFound(name),
            EntityKind::Environment => Self::EnvironmentNotFound(name),
            EntityKind::Resource => Self::ResourceNotFound(name),
            EntityKind::Service => Self::ServiceNotFound(name),
        }
    }

    /// Create an EntityLocked error, filling in whatever is known about the holder
    pub fn locked(key: &EntityKey, holder: Option<&LockInfo>) -> Self {
        match holder {
            Some(lock) => Self::EntityLocked {
                key: key.to_string(),
                lock_id: lock.lock_id.clone(),
                who: lock.who.clone(),
                operation: lock.lock_operation.operation_type.to_string(),
            },
            None => Self::EntityLocked {
                key: key.to_string(),
                lock_id: "unknown".to_string(),
                who: "unknown".to_string(),
                operation: "unknown".to_string(),
            },
        }
    }

    pub fn unsupported_backend(backend_type: impl Into<String>) -> Self {
        Self::UnsupportedBackend(backend_type.into())
    }

    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration(message.into())
    }

    pub fn invalid_state(key: &EntityKey, message: impl fmt::Display) -> Self {
        Self::InvalidState {
            key: key.to_string(),
            message: message.to_string(),
        }
    }

    /// True for any of the per-entity NotFound variants
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            Self::ProjectNotFound(_)
                | Self::EnvironmentNotFound(_)
                | Self::ResourceNotFound(_)
                | Self::ServiceNotFound(_)
        )
    }

    pub fn is_locked(&self) -> bool {
        matches!(self, Self::EntityLocked { .. })
    }
}

/// Result type for state operations
pub type StateResult<T> = Result<T, StateError>;

/// Where state and locks live
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Backend {
    /// Nested directories under a local path
    Local { path: PathBuf },
    /// Key prefixes inside an S3 bucket
    ObjectStorage { bucket: String, prefix: String },
    /// Hosted control-plane API
    Remote { url: String, account_id: String },
}

impl Backend {
    pub fn local(path: impl Into<PathBuf>) -> Self {
        Self::Local { path: path.into() }
    }

    /// Short backend type name, used in logs and errors
    pub fn backend_type(&self) -> &'static str {
        match self {
            Self::Local { .. } => "local",
            Self::ObjectStorage { .. } => "s3",
            Self::Remote { .. } => "remote",
        }
    }

    /// Parse a descriptor such as `file://.flow`, `s3://bucket/prefix`,
    /// `flow://<account>` or `https://host?account_id=<account>`
    pub fn parse(uri: &str) -> StateResult<Self> {
        let uri = uri.trim();
        if uri.is_empty() {
            return Err(StateError::configuration("empty backend descriptor"));
        }

        let Some((scheme, rest)) = uri.split_once("://") else {
            return Ok(Self::local(uri));
        };

        match scheme {
            "file" => {
                if rest.is_empty() {
                    return Err(StateError::configuration("file backend requires a path"));
                }
                Ok(Self::local(rest))
            }
            "s3" => {
                let rest = rest.trim_end_matches('/');
                let (bucket, prefix) = rest.split_once('/').unwrap_or((rest, ""));
                if bucket.is_empty() {
                    return Err(StateError::configuration("s3 backend requires a bucket"));
                }
                Ok(Self::ObjectStorage {
                    bucket: bucket.to_string(),
                    prefix: prefix.trim_matches('/').to_string(),
                })
            }
            "flow" => {
                let account_id = rest.trim_end_matches('/');
                if account_id.is_empty() {
                    return Err(StateError::configuration(
                        "flow backend requires an account id",
                    ));
                }
                Ok(Self::Remote {
                    url: DEFAULT_API_URL.to_string(),
                    account_id: account_id.to_string(),
                })
            }
            "http" | "https" => {
                let (base, query) = uri.split_once('?').unwrap_or((uri, ""));
                let account_id = query
                    .split('&')
                    .filter_map(|pair| pair.split_once('='))
                    .find(|(k, _)| *k == "account_id")
                    .map(|(_, v)| v.to_string())
                    .filter(|v| !v.is_empty())
                    .ok_or_else(|| {
                        StateError::configuration("remote backend requires ?account_id=<id>")
                    })?;
                Ok(Self::Remote {
                    url: base.trim_end_matches('/').to_string(),
                    account_id,
                })
            }
            other => Err(StateError::unsupported_backend(other)),
        }
    }
}

impl FromStr for Backend {
    type Err = StateError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl fmt::Display for Backend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Local { path } => write!(f, "file://{}", path.display()),
            Self::ObjectStorage { bucket, prefix } if prefix.is_empty() => {
                write!(f, "s3://{}", bucket)
            }
            Self::ObjectStorage { bucket, prefix } => write!(f, "s3://{}/{}", bucket, prefix),
            Self::Remote { url, account_id } => write!(f, "{}?account_id={}", url, account_id),
        }
    }
}

/// Storage for entity records, one implementation per backend
///
/// Writes are unconditional: exclusivity comes from holding the entity's lock,
/// whose id is passed through for backends that enforce it server side.
#[async_trait]
pub trait StateStore: Send + Sync {
    /// Descriptor this store was opened from
    fn backend(&self) -> &Backend;

    /// Read a record; `None` if it does not exist
    async fn read(&self, key: &EntityKey) -> StateResult<Option<Vec<u8>>>;

    /// Overwrite a record
    async fn write(&self, key: &EntityKey, body: Vec<u8>, lock_id: Option<&str>)
    -> StateResult<()>;

    /// Delete a record (no-op if absent)
    async fn delete(&self, key: &EntityKey, lock_id: Option<&str>) -> StateResult<()>;

    /// Names of children of `kind` under `parent` that have a record, sorted
    async fn list(&self, parent: &EntityKey, kind: ChildKind) -> StateResult<Vec<String>>;

    /// Lock implementation for an entity
    fn entity_lock(&self, key: &EntityKey) -> Arc<dyn EntityLock>;

    /// URI handed to the provisioning collaborator for an entity
    fn destination_uri(&self, key: &EntityKey) -> String;

    /// Delete an environment record after every resource and service it owns
    async fn delete_environment(&self, key: &EntityKey, lock_id: &str) -> StateResult<()> {
        for kind in [ChildKind::Resources, ChildKind::Services] {
            for name in self.list(key, kind).await? {
                if let Some(child) = key.child(kind, &name) {
                    log::debug!("cascade delete {}", child);
                    self.delete(&child, Some(lock_id)).await?;
                }
            }
        }
        self.delete(key, Some(lock_id)).await
    }
}

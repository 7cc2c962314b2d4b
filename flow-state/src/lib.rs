//! Flow State Management
//!
//! This crate stores the state of projects, environments, resources and
//! services, and guards every mutation with a per-entity lock.
//!
//! # Overview
//!
//! - **Backend**: where state lives (local directory, S3 bucket, or the hosted
//!   control plane), parsed from a descriptor such as `s3://bucket/prefix`
//! - **StateStore**: one implementation per backend, selected once by [`open_store`]
//! - **Lock / LockGuard**: exclusive, optionally waiting claim on one entity
//! - **Managers**: per-entity load / save / delete / lock façades
//!
//! # Example
//!
//! ```ignore
//! use flow_state::{LockOperation, OperationType, ProjectManager, StateConfig};
//!
//! let project = ProjectManager::open(&StateConfig::from_env(), "acme").await?;
//! let resource = project.environment("dev").resource("bucket");
//!
//! // Acquire the resource lock before modifying its record
//! let lock = resource
//!     .lock(LockOperation::new(OperationType::UpdateResource))
//!     .wait_for_seconds(30)
//!     .acquire()
//!     .await?;
//!
//! let mut state = resource.load().await?;
//! // ... modify state ...
//! resource.save(&state, lock.lock_id()).await?;
//!
//! lock.release().await?;
//! ```

pub mod backend;
pub mod backends;
pub mod config;
pub mod key;
pub mod lock;
pub mod manager;
pub mod state;

// Re-export main types for convenience
pub use backend::{Backend, StateError, StateResult, StateStore};
pub use backends::open_store;
pub use config::StateConfig;
pub use key::{ChildKind, EntityKey, EntityKind};
pub use lock::{EntityLock, Lock, LockGuard, LockInfo, LockOperation, NoopLock, OperationType};
pub use manager::{EnvironmentManager, ProjectManager, ResourceManager, ServiceManager};
pub use state::{
    AwsEnvironmentConfig, CloudProvider, EnvironmentState, EnvironmentStatus, EnvironmentType,
    GcpEnvironmentConfig, Inputs, Outputs, ProjectState, ResourceState, ResourceStatus,
    ServiceState, ServiceStatus,
};

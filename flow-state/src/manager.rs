//! Entity managers
//!
//! One manager per entity type, all sharing a single [`StateStore`] chosen when
//! the project manager is opened. Child-manager factories do no I/O.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::backend::{Backend, StateError, StateResult, StateStore};
use crate::backends::open_store;
use crate::config::StateConfig;
use crate::key::{ChildKind, EntityKey};
use crate::lock::{
    DEFAULT_POLL_INTERVAL, EntityLock, Lock, LockInfo, LockOperation, NoopLock, OperationType,
};
use crate::state::{EnvironmentState, ProjectState, ResourceState, ServiceState};

/// Store, key and lock policy shared by every manager
#[derive(Clone)]
struct EntityHandle {
    store: Arc<dyn StateStore>,
    key: EntityKey,
    poll_interval: Duration,
    /// Entity state lives outside the store (e.g. a container), so locking is a no-op
    noop_lock: bool,
}

impl EntityHandle {
    fn child(&self, kind: ChildKind, name: &str) -> Self {
        Self {
            store: Arc::clone(&self.store),
            key: self
                .key
                .child(kind, name)
                .unwrap_or_else(|| self.key.clone()),
            poll_interval: self.poll_interval,
            noop_lock: false,
        }
    }

    async fn load<T: DeserializeOwned>(&self) -> StateResult<T> {
        match self.store.read(&self.key).await? {
            Some(bytes) => {
                serde_json::from_slice(&bytes).map_err(|e| StateError::invalid_state(&self.key, e))
            }
            None => Err(StateError::not_found(&self.key)),
        }
    }

    async fn save<T: Serialize>(&self, state: &T, lock_id: Option<&str>) -> StateResult<()> {
        let body =
            serde_json::to_vec_pretty(state).map_err(|e| StateError::Serialization(e.to_string()))?;
        self.store.write(&self.key, body, lock_id).await
    }

    async fn delete(&self, lock_id: &str) -> StateResult<()> {
        log::debug!("deleting {}", self.key);
        self.store.delete(&self.key, Some(lock_id)).await
    }

    fn entity_lock(&self) -> Arc<dyn EntityLock> {
        if self.noop_lock {
            Arc::new(NoopLock)
        } else {
            self.store.entity_lock(&self.key)
        }
    }

    fn lock(&self, operation: LockOperation) -> Lock {
        Lock::new(self.key.clone(), self.entity_lock(), operation)
            .with_poll_interval(self.poll_interval)
    }

    async fn lock_info(&self) -> StateResult<Option<LockInfo>> {
        self.entity_lock().read_info().await
    }

    async fn force_unlock(&self) -> StateResult<()> {
        log::warn!("force-unlocking {}", self.key);
        self.entity_lock().force_release().await
    }

    async fn list<T: DeserializeOwned>(&self, kind: ChildKind) -> StateResult<BTreeMap<String, T>> {
        let mut entries = BTreeMap::new();
        for name in self.store.list(&self.key, kind).await? {
            let child = self.child(kind, &name);
            match child.load::<T>().await {
                Ok(state) => {
                    entries.insert(name, state);
                }
                // Deleted between listing and loading
                Err(e) if e.is_not_found() => {}
                Err(e) => return Err(e),
            }
        }
        Ok(entries)
    }
}

/// Entry point to a project's namespace
#[derive(Clone)]
pub struct ProjectManager {
    handle: EntityHandle,
}

impl ProjectManager {
    pub fn new(store: Arc<dyn StateStore>, project: impl Into<String>) -> Self {
        Self {
            handle: EntityHandle {
                store,
                key: EntityKey::project(project),
                poll_interval: DEFAULT_POLL_INTERVAL,
                noop_lock: false,
            },
        }
    }

    /// Open the configured backend and return a manager for `project`
    pub async fn open(config: &StateConfig, project: impl Into<String>) -> StateResult<Self> {
        let backend = config.resolve_backend()?;
        Self::open_backend(&backend, config, project).await
    }

    /// Open a specific backend descriptor
    pub async fn open_backend(
        backend: &Backend,
        config: &StateConfig,
        project: impl Into<String>,
    ) -> StateResult<Self> {
        let store = open_store(backend, config).await?;
        Ok(Self::new(store, project).with_poll_interval(config.lock_poll_interval))
    }

    /// Interval between lock attempts for this project and all its children
    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.handle.poll_interval = poll_interval;
        self
    }

    pub fn name(&self) -> &str {
        self.handle.key.name()
    }

    pub fn key(&self) -> &EntityKey {
        &self.handle.key
    }

    pub fn store(&self) -> &Arc<dyn StateStore> {
        &self.handle.store
    }

    pub async fn load(&self) -> StateResult<ProjectState> {
        self.handle.load().await
    }

    /// Projects have no lock; they are created once and only carry metadata
    pub async fn save(&self, state: &ProjectState) -> StateResult<()> {
        self.handle.save(state, None).await
    }

    /// Delete every environment, each under its own lock, then the project record
    ///
    /// Fails with `EntityLocked` if any environment is in use.
    pub async fn delete(&self) -> StateResult<()> {
        log::info!("deleting project {}", self.handle.key);
        let names = self
            .handle
            .store
            .list(&self.handle.key, ChildKind::Environments)
            .await?;
        for name in names {
            let environment = self.environment(&name);
            let guard = environment
                .lock(LockOperation::new(OperationType::DeleteEnvironment))
                .acquire()
                .await?;
            let result = environment.delete(guard.lock_id()).await;
            let released = guard.release().await;
            result?;
            released?;
        }
        self.handle.store.delete(&self.handle.key, None).await
    }

    pub async fn list_environments(&self) -> StateResult<BTreeMap<String, EnvironmentState>> {
        self.handle.list(ChildKind::Environments).await
    }

    pub fn environment(&self, name: impl AsRef<str>) -> EnvironmentManager {
        EnvironmentManager {
            project: self.name().to_string(),
            handle: self.handle.child(ChildKind::Environments, name.as_ref()),
        }
    }
}

/// Environment record, its lock, and factories for what it owns
#[derive(Clone)]
pub struct EnvironmentManager {
    project: String,
    handle: EntityHandle,
}

impl EnvironmentManager {
    pub fn project_name(&self) -> &str {
        &self.project
    }

    pub fn name(&self) -> &str {
        self.handle.key.name()
    }

    pub fn key(&self) -> &EntityKey {
        &self.handle.key
    }

    pub fn backend(&self) -> &Backend {
        self.handle.store.backend()
    }

    pub async fn load(&self) -> StateResult<EnvironmentState> {
        self.handle.load().await
    }

    pub async fn save(&self, state: &EnvironmentState, lock_id: &str) -> StateResult<()> {
        self.handle.save(state, Some(lock_id)).await
    }

    /// Delete every resource and service record, then the environment itself
    pub async fn delete(&self, lock_id: &str) -> StateResult<()> {
        log::info!("deleting environment {}", self.handle.key);
        self.handle
            .store
            .delete_environment(&self.handle.key, lock_id)
            .await
    }

    /// Environment-wide lock; see [`Lock::wait_for_seconds`] to wait on contention
    pub fn lock(&self, operation: LockOperation) -> Lock {
        self.handle.lock(operation)
    }

    pub async fn lock_info(&self) -> StateResult<Option<LockInfo>> {
        self.handle.lock_info().await
    }

    pub async fn force_unlock(&self) -> StateResult<()> {
        self.handle.force_unlock().await
    }

    pub async fn list_resources(&self) -> StateResult<BTreeMap<String, ResourceState>> {
        self.handle.list(ChildKind::Resources).await
    }

    pub async fn list_services(&self) -> StateResult<BTreeMap<String, ServiceState>> {
        self.handle.list(ChildKind::Services).await
    }

    pub fn resource(&self, name: impl AsRef<str>) -> ResourceManager {
        ResourceManager {
            handle: self.handle.child(ChildKind::Resources, name.as_ref()),
        }
    }

    /// Manager for a resource whose real state is a local container
    ///
    /// Its lock is a [`NoopLock`]: the container runtime is authoritative.
    pub fn container_resource(&self, name: impl AsRef<str>) -> ResourceManager {
        let mut handle = self.handle.child(ChildKind::Resources, name.as_ref());
        handle.noop_lock = true;
        ResourceManager { handle }
    }

    pub fn service(&self, name: impl AsRef<str>) -> ServiceManager {
        ServiceManager {
            handle: self.handle.child(ChildKind::Services, name.as_ref()),
        }
    }
}

/// A single resource record and its lock
#[derive(Clone)]
pub struct ResourceManager {
    handle: EntityHandle,
}

impl ResourceManager {
    pub fn name(&self) -> &str {
        self.handle.key.name()
    }

    pub fn key(&self) -> &EntityKey {
        &self.handle.key
    }

    /// Where the provisioning collaborator may keep its own artifacts
    pub fn destination_uri(&self) -> String {
        self.handle.store.destination_uri(&self.handle.key)
    }

    pub async fn load(&self) -> StateResult<ResourceState> {
        self.handle.load().await
    }

    /// Like `load`, but absence is `None` instead of an error
    pub async fn try_load(&self) -> StateResult<Option<ResourceState>> {
        match self.load().await {
            Ok(state) => Ok(Some(state)),
            Err(e) if e.is_not_found() => Ok(None),
            Err(e) => Err(e),
        }
    }

    pub async fn save(&self, state: &ResourceState, lock_id: &str) -> StateResult<()> {
        self.handle.save(state, Some(lock_id)).await
    }

    pub async fn delete(&self, lock_id: &str) -> StateResult<()> {
        self.handle.delete(lock_id).await
    }

    pub fn lock(&self, operation: LockOperation) -> Lock {
        self.handle.lock(operation)
    }

    pub async fn lock_info(&self) -> StateResult<Option<LockInfo>> {
        self.handle.lock_info().await
    }

    pub async fn force_unlock(&self) -> StateResult<()> {
        self.handle.force_unlock().await
    }
}

/// A single service record and its lock
#[derive(Clone)]
pub struct ServiceManager {
    handle: EntityHandle,
}

impl ServiceManager {
    pub fn name(&self) -> &str {
        self.handle.key.name()
    }

    pub fn key(&self) -> &EntityKey {
        &self.handle.key
    }

    pub fn destination_uri(&self) -> String {
        self.handle.store.destination_uri(&self.handle.key)
    }

    pub async fn load(&self) -> StateResult<ServiceState> {
        self.handle.load().await
    }

    /// Like `load`, but absence is `None` instead of an error
    pub async fn try_load(&self) -> StateResult<Option<ServiceState>> {
        match self.load().await {
            Ok(state) => Ok(Some(state)),
            Err(e) if e.is_not_found() => Ok(None),
            Err(e) => Err(e),
        }
    }

    pub async fn save(&self, state: &ServiceState, lock_id: &str) -> StateResult<()> {
        self.handle.save(state, Some(lock_id)).await
    }

    pub async fn delete(&self, lock_id: &str) -> StateResult<()> {
        self.handle.delete(lock_id).await
    }

    pub fn lock(&self, operation: LockOperation) -> Lock {
        self.handle.lock(operation)
    }

    pub async fn lock_info(&self) -> StateResult<Option<LockInfo>> {
        self.handle.lock_info().await
    }

    pub async fn force_unlock(&self) -> StateResult<()> {
        self.handle.force_unlock().await
    }
}

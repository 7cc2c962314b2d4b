//! Provider - Traits for the external collaborators that do the provisioning
//!
//! The orchestrator never talks to a cloud or a container engine itself. A
//! [`Provisioner`] applies and destroys resources and services; a
//! [`ContainerRuntime`] answers questions about local containers.

use std::future::Future;
use std::pin::Pin;

use flow_state::{Backend, CloudProvider, Inputs, Outputs};

use crate::resource::EnvironmentContext;

/// Error type for provisioning operations
#[derive(Debug)]
pub struct ProvisionError {
    pub message: String,
    /// Resource or service the error belongs to
    pub entity: Option<String>,
    pub cause: Option<Box<dyn std::error::Error + Send + Sync>>,
}

impl std::fmt::Display for ProvisionError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if let Some(ref entity) = self.entity {
            write!(f, "[{}] {}", entity, self.message)
        } else {
            write!(f, "{}", self.message)
        }
    }
}

impl std::error::Error for ProvisionError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.cause
            .as_ref()
            .map(|e| e.as_ref() as &dyn std::error::Error)
    }
}

impl ProvisionError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            entity: None,
            cause: None,
        }
    }

    pub fn for_entity(mut self, entity: impl Into<String>) -> Self {
        self.entity = Some(entity.into());
        self
    }

    pub fn with_cause(mut self, cause: impl std::error::Error + Send + Sync + 'static) -> Self {
        self.cause = Some(Box::new(cause));
        self
    }
}

pub type ProvisionResult<T> = Result<T, ProvisionError>;

/// Return type for async operations
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// What an apply is asked to do
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyAction {
    Create,
    /// Change in place
    Update,
    /// Tear down and recreate
    Replace,
}

/// Everything the provisioner needs to bring one entity to its desired inputs
#[derive(Debug, Clone)]
pub struct ApplyRequest {
    pub name: String,
    pub product: String,
    pub cloud_provider: CloudProvider,
    pub action: ApplyAction,
    /// Fully resolved inputs
    pub inputs: Inputs,
    /// Inputs of the last successful apply
    pub previous_inputs: Option<Inputs>,
    pub previous_outputs: Option<Outputs>,
    pub environment: EnvironmentContext,
    pub backend: Backend,
    /// Location the provisioner may use for its own artifacts
    pub destination_uri: String,
    /// Lock held for the duration of the call
    pub lock_id: String,
}

/// Everything the provisioner needs to tear one entity down
#[derive(Debug, Clone)]
pub struct DestroyRequest {
    pub name: String,
    pub product: String,
    pub cloud_provider: CloudProvider,
    pub inputs: Option<Inputs>,
    pub outputs: Option<Outputs>,
    pub environment: EnvironmentContext,
    pub backend: Backend,
    pub destination_uri: String,
    pub lock_id: String,
}

/// Black-box provisioning collaborator
///
/// Implementations drive whatever actually creates infrastructure (an IaC
/// tool, a container engine, a cloud SDK). All operations are async and
/// involve side effects.
pub trait Provisioner: Send + Sync {
    /// Create, update or replace a resource; returns its outputs
    fn apply_resource(&self, request: ApplyRequest) -> BoxFuture<'_, ProvisionResult<Outputs>>;

    /// Tear a resource down
    fn destroy_resource(&self, request: DestroyRequest) -> BoxFuture<'_, ProvisionResult<()>>;

    /// Create or redeploy a service; returns its outputs
    fn apply_service(&self, request: ApplyRequest) -> BoxFuture<'_, ProvisionResult<Outputs>>;

    /// Tear a service down
    fn destroy_service(&self, request: DestroyRequest) -> BoxFuture<'_, ProvisionResult<()>>;
}

/// Label every container-backed resource carries
pub fn container_label(resource: &str) -> String {
    format!("flow.resource={}", resource)
}

/// Local container engine, queried synchronously
pub trait ContainerRuntime: Send + Sync {
    /// Whether the engine is installed and reachable
    fn is_available(&self) -> bool;

    /// Names of containers carrying `label` (`key=value`)
    fn list_by_label(&self, label: &str) -> ProvisionResult<Vec<String>>;

    /// Start a container; starting a running container is a no-op
    fn start(&self, container: &str) -> ProvisionResult<()>;

    fn stop(&self, container: &str) -> ProvisionResult<()>;

    /// Remove a stopped container
    fn remove(&self, container: &str) -> ProvisionResult<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn provision_error_display() {
        let error = ProvisionError::new("quota exceeded").for_entity("bucket");
        assert_eq!(error.to_string(), "[bucket] quota exceeded");
        assert_eq!(ProvisionError::new("boom").to_string(), "boom");
    }

    #[test]
    fn provision_error_source() {
        use std::error::Error;

        let io = std::io::Error::other("disk full");
        let error = ProvisionError::new("apply failed").with_cause(io);
        assert_eq!(error.source().unwrap().to_string(), "disk full");
    }

    #[test]
    fn container_label_format() {
        assert_eq!(container_label("redis"), "flow.resource=redis");
    }
}

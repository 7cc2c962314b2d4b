//! Orchestration errors

use flow_state::StateError;
use thiserror::Error;

use crate::provider::ProvisionError;

/// Errors that abort a whole create / destroy call
///
/// Per-node provisioning failures do not surface here; they are recorded in
/// the node's state and reported in the outcome map.
#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error(transparent)]
    State(#[from] StateError),

    #[error("Resource {name} is declared as {declared} but already exists as {existing}")]
    DuplicateResourceProductMismatch {
        name: String,
        declared: String,
        existing: String,
    },

    #[error("Missing dependency: {0} is required but not available")]
    MissingDependency(String),

    #[error("Dependency cycle: {}", .0.join(" -> "))]
    DependencyCycle(Vec<String>),

    #[error("Provisioning error: {0}")]
    Provision(#[from] ProvisionError),
}

pub type OrchestratorResult<T> = Result<T, OrchestratorError>;

//! Flow Core
//!
//! Reconciles declared resources and services against persisted state and
//! drives create / destroy across an environment.
//!
//! # Overview
//!
//! - **Declarations**: [`ResourceDeclaration`], [`ServiceDeclaration`] and the
//!   [`EnvironmentContext`] they are resolved in
//! - **Reconciler**: decides create / update / replace / no-op per entity
//! - **Provisioner**: black-box collaborator that does the actual work
//! - **Orchestrator**: dependency-ordered, bounded-concurrency execution with
//!   per-entity locking and per-node failure isolation

pub mod error;
pub mod graph;
pub mod orchestrator;
pub mod provider;
pub mod reconciler;
pub mod report;
pub mod resource;

pub use error::{OrchestratorError, OrchestratorResult};
pub use orchestrator::{DestroySelection, NodeState, Orchestrator, OrchestratorConfig};
pub use provider::{
    ApplyAction, ApplyRequest, BoxFuture, ContainerRuntime, DestroyRequest, ProvisionError,
    ProvisionResult, Provisioner,
};
pub use reconciler::{PlanAction, Reconciler, ResourcePlan, ServicePlan};
pub use report::{CreateReport, DestroyReport, NodeOutcome, Report};
pub use resource::{EnvironmentContext, ResourceDeclaration, ServiceDeclaration};

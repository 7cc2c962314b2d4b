use std::collections::{BTreeSet, HashMap};

use flow_state::{
    CloudProvider, LockOperation, OperationType, ResourceManager, ResourceState, ResourceStatus,
    ServiceManager, ServiceState, ServiceStatus,
};
use serde_json::json;

use super::{NodeId, NodeState, Orchestrator, Scheduled, into_report, log_transition, release};
use crate::error::OrchestratorResult;
use crate::graph::DependencyGraph;
use crate::provider::{DestroyRequest, ProvisionResult};
use crate::report::{DestroyReport, NodeOutcome};
use crate::resource::EnvironmentContext;

/// Which persisted entities a destroy run covers
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum DestroySelection {
    /// Every resource and service in the environment
    #[default]
    All,
    /// Only the named entities; names without a record are ignored
    Only {
        resources: BTreeSet<String>,
        services: BTreeSet<String>,
    },
}

impl DestroySelection {
    pub fn resources<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::Only {
            resources: names.into_iter().map(Into::into).collect(),
            services: BTreeSet::new(),
        }
    }

    pub fn services<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::Only {
            resources: BTreeSet::new(),
            services: names.into_iter().map(Into::into).collect(),
        }
    }

    pub fn includes_resource(&self, name: &str) -> bool {
        match self {
            Self::All => true,
            Self::Only { resources, .. } => resources.contains(name),
        }
    }

    pub fn includes_service(&self, name: &str) -> bool {
        match self {
            Self::All => true,
            Self::Only { services, .. } => services.contains(name),
        }
    }
}

enum DestroyTask {
    Resource(ResourceState),
    Service(ServiceState),
}

impl Orchestrator {
    /// Tear down persisted resources and services
    ///
    /// Holds the environment lock for the whole run so nothing else enumerates
    /// the environment meanwhile. Dependents go before what they depend on; a
    /// resource whose dependent failed, or that sits on a persisted cycle, is
    /// left untouched and reported blocked.
    pub async fn destroy(
        &self,
        ctx: &EnvironmentContext,
        selection: DestroySelection,
    ) -> OrchestratorResult<DestroyReport> {
        let guard = self
            .environment
            .lock(
                LockOperation::new(OperationType::LockEnvironment)
                    .with_metadata("operation", json!("destroy")),
            )
            .wait_for(self.lock_wait())
            .acquire()
            .await?;

        let result = self.destroy_selected(ctx, &selection).await;
        release(guard).await;
        result
    }

    /// Destroy run for a caller that already holds the environment lock
    pub(super) async fn destroy_selected(
        &self,
        ctx: &EnvironmentContext,
        selection: &DestroySelection,
    ) -> OrchestratorResult<DestroyReport> {
        let resources: Vec<ResourceState> = self
            .environment
            .list_resources()
            .await?
            .into_values()
            .filter(|r| selection.includes_resource(&r.name))
            .collect();
        let services: Vec<ServiceState> = self
            .environment
            .list_services()
            .await?
            .into_values()
            .filter(|s| selection.includes_service(&s.name))
            .collect();

        let graph = DependencyGraph::build(
            resources
                .iter()
                .map(|r| (r.name.as_str(), r.depends_on.as_slice())),
        );
        // Records written before cycles were rejected can still hold one; its
        // members and everything they depend on are reported blocked
        if let Some(cycle) = graph.find_cycle() {
            log::warn!(
                "dependency cycle in {}: {}",
                self.environment.key(),
                cycle.join(" -> ")
            );
        }
        log::info!(
            "destroying {} resource(s) and {} service(s) in {}",
            resources.len(),
            services.len(),
            self.environment.key()
        );

        let mut nodes = Vec::with_capacity(resources.len() + services.len());
        for state in resources {
            let predecessors = graph
                .dependents_of(&state.name)
                .iter()
                .map(NodeId::resource)
                .collect();
            nodes.push(Scheduled {
                id: NodeId::resource(&state.name),
                predecessors,
                task: DestroyTask::Resource(state),
            });
        }
        for state in services {
            nodes.push(Scheduled {
                id: NodeId::service(&state.name),
                predecessors: Vec::new(),
                task: DestroyTask::Service(state),
            });
        }

        let outcomes = self
            .drive(nodes, HashMap::new(), |task| self.run_destroy(ctx, task))
            .await;
        Ok(into_report(outcomes))
    }

    async fn run_destroy(&self, ctx: &EnvironmentContext, task: DestroyTask) -> NodeOutcome {
        match task {
            DestroyTask::Resource(state) => self.destroy_resource(ctx, state).await,
            DestroyTask::Service(state) => self.destroy_service(ctx, state).await,
        }
    }

    async fn destroy_resource(&self, ctx: &EnvironmentContext, state: ResourceState) -> NodeOutcome {
        let id = NodeId::resource(&state.name);
        let manager =
            self.resource_manager(&state.name, state.cloud_provider == CloudProvider::Local);
        let lock = manager
            .lock(
                LockOperation::new(OperationType::DeleteResource)
                    .with_metadata("resource", json!(state.name)),
            )
            .wait_for(self.lock_wait());
        let guard = match lock.acquire().await {
            Ok(guard) => guard,
            Err(e) => {
                log::warn!("{}: {}", id, e);
                return NodeOutcome::Failed(e.to_string());
            }
        };
        log_transition(&id, NodeState::Pending, NodeState::Locked);

        let result = self
            .destroy_resource_locked(ctx, &id, &manager, guard.lock_id())
            .await;
        release(guard).await;

        result.unwrap_or_else(|e| {
            log::warn!("{}: {}", id, e);
            NodeOutcome::Failed(e.to_string())
        })
    }

    async fn destroy_resource_locked(
        &self,
        ctx: &EnvironmentContext,
        id: &NodeId,
        manager: &ResourceManager,
        lock_id: &str,
    ) -> OrchestratorResult<NodeOutcome> {
        let Some(mut state) = manager.try_load().await? else {
            log::debug!("{} is already gone", id);
            return Ok(NodeOutcome::Destroyed);
        };
        state.transition(ResourceStatus::Destroying);
        manager.save(&state, lock_id).await?;

        log_transition(id, NodeState::Locked, NodeState::Executing);
        let request = DestroyRequest {
            name: state.name.clone(),
            product: state.product.clone(),
            cloud_provider: state.cloud_provider,
            inputs: state.inputs.clone(),
            outputs: state.outputs.clone(),
            environment: ctx.clone(),
            backend: self.environment.backend().clone(),
            destination_uri: manager.destination_uri(),
            lock_id: lock_id.to_string(),
        };

        match self.teardown_resource(request).await {
            Ok(()) => {
                manager.delete(lock_id).await?;
                log_transition(id, NodeState::Executing, NodeState::Succeeded);
                Ok(NodeOutcome::Destroyed)
            }
            Err(e) => {
                log_transition(id, NodeState::Executing, NodeState::Failed);
                log::warn!("{}: {}", id, e);
                state.transition(ResourceStatus::DeleteFailed);
                manager.save(&state, lock_id).await?;
                Ok(NodeOutcome::Failed(e.to_string()))
            }
        }
    }

    /// Destroy through the provisioner, then clear any containers it left
    async fn teardown_resource(&self, request: DestroyRequest) -> ProvisionResult<()> {
        let name = request.name.clone();
        let container_backed = request.cloud_provider == CloudProvider::Local;
        self.provisioner.destroy_resource(request).await?;
        if container_backed {
            self.remove_containers(&name)?;
        }
        Ok(())
    }

    async fn destroy_service(&self, ctx: &EnvironmentContext, state: ServiceState) -> NodeOutcome {
        let id = NodeId::service(&state.name);
        let manager = self.environment.service(&state.name);
        let lock = manager
            .lock(
                LockOperation::new(OperationType::DeleteService)
                    .with_metadata("service", json!(state.name)),
            )
            .wait_for(self.lock_wait());
        let guard = match lock.acquire().await {
            Ok(guard) => guard,
            Err(e) => {
                log::warn!("{}: {}", id, e);
                return NodeOutcome::Failed(e.to_string());
            }
        };
        log_transition(&id, NodeState::Pending, NodeState::Locked);

        let result = self
            .destroy_service_locked(ctx, &id, &manager, guard.lock_id())
            .await;
        release(guard).await;

        result.unwrap_or_else(|e| {
            log::warn!("{}: {}", id, e);
            NodeOutcome::Failed(e.to_string())
        })
    }

    async fn destroy_service_locked(
        &self,
        ctx: &EnvironmentContext,
        id: &NodeId,
        manager: &ServiceManager,
        lock_id: &str,
    ) -> OrchestratorResult<NodeOutcome> {
        let Some(mut state) = manager.try_load().await? else {
            log::debug!("{} is already gone", id);
            return Ok(NodeOutcome::Destroyed);
        };
        state.transition(ServiceStatus::Destroying);
        manager.save(&state, lock_id).await?;

        log_transition(id, NodeState::Locked, NodeState::Executing);
        let request = DestroyRequest {
            name: state.name.clone(),
            product: state.product.clone(),
            cloud_provider: state.cloud_provider,
            inputs: state.inputs.clone(),
            outputs: state.outputs.clone(),
            environment: ctx.clone(),
            backend: self.environment.backend().clone(),
            destination_uri: manager.destination_uri(),
            lock_id: lock_id.to_string(),
        };

        match self.provisioner.destroy_service(request).await {
            Ok(()) => {
                manager.delete(lock_id).await?;
                log_transition(id, NodeState::Executing, NodeState::Succeeded);
                Ok(NodeOutcome::Destroyed)
            }
            Err(e) => {
                log_transition(id, NodeState::Executing, NodeState::Failed);
                log::warn!("{}: {}", id, e);
                state.transition(ServiceStatus::DeleteFailed);
                manager.save(&state, lock_id).await?;
                Ok(NodeOutcome::Failed(e.to_string()))
            }
        }
    }
}

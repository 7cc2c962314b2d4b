use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};

use flow_state::{
    LockOperation, Outputs, ResourceManager, ResourceState, ResourceStatus, ServiceManager, ServiceState,
    ServiceStatus,
};
use futures_util::future::try_join_all;
use serde_json::json;

use super::{NodeId, NodeState, Orchestrator, Scheduled, into_report, log_transition, release};
use crate::error::{OrchestratorError, OrchestratorResult};
use crate::graph::DependencyGraph;
use crate::provider::{ApplyAction, ApplyRequest, ProvisionResult};
use crate::reconciler::{ResourcePlan, ServicePlan, dedupe_resources, dedupe_services};
use crate::report::{CreateReport, NodeOutcome};
use crate::resource::{EnvironmentContext, ResourceDeclaration, ServiceDeclaration};

/// Parents outside the batch that have never been applied
fn missing_parents(
    plan: &ResourcePlan,
    graph: &DependencyGraph,
    persisted: &BTreeMap<String, ResourceState>,
) -> Vec<String> {
    plan.depends_on()
        .iter()
        .filter(|parent| !graph.contains(parent))
        .filter(|parent| {
            !persisted
                .get(parent.as_str())
                .is_some_and(|state| state.inputs.is_some())
        })
        .cloned()
        .collect()
}

/// Persisted resources outside the batch that the batch transitively depends on
fn persisted_ancestors<'a>(
    batch: &[ResourceDeclaration],
    persisted: &'a BTreeMap<String, ResourceState>,
) -> Vec<&'a ResourceState> {
    let in_batch: BTreeSet<&str> = batch.iter().map(|r| r.name.as_str()).collect();
    let mut seen = BTreeSet::new();
    let mut queue: VecDeque<&str> = batch
        .iter()
        .flat_map(|r| r.depends_on.iter().map(String::as_str))
        .collect();
    let mut found = Vec::new();

    while let Some(name) = queue.pop_front() {
        if in_batch.contains(name) || !seen.insert(name) {
            continue;
        }
        if let Some(state) = persisted.get(name) {
            queue.extend(state.depends_on.iter().map(String::as_str));
            found.push(state);
        }
    }
    found
}

enum CreateTask {
    Resource(ResourcePlan),
    Service(ServicePlan),
}

impl Orchestrator {
    /// Create or update declared resources and services
    ///
    /// Planning errors (product mismatch, missing container runtime, dependency
    /// cycle, unreadable state) are returned before any lock is taken. A node
    /// whose parent is neither in the batch nor already applied is skipped.
    pub async fn create(
        &self,
        ctx: &EnvironmentContext,
        resources: Vec<ResourceDeclaration>,
        services: Vec<ServiceDeclaration>,
    ) -> OrchestratorResult<CreateReport> {
        self.environment.load().await?;

        let resources = dedupe_resources(resources)?;
        let services = dedupe_services(services)?;

        let persisted = self.environment.list_resources().await?;
        let graph = DependencyGraph::build(
            resources
                .iter()
                .map(|r| (r.name.as_str(), r.depends_on.as_slice())),
        );
        // Persisted edges count too, or a cycle could be assembled across runs
        let reachable = DependencyGraph::build(
            resources
                .iter()
                .map(|r| (r.name.as_str(), r.depends_on.as_slice()))
                .chain(
                    persisted_ancestors(&resources, &persisted)
                        .into_iter()
                        .map(|r| (r.name.as_str(), r.depends_on.as_slice())),
                ),
        );
        if let Some(cycle) = reachable.find_cycle() {
            return Err(OrchestratorError::DependencyCycle(cycle));
        }

        let reconciler = self.reconciler(ctx);
        let resource_plans =
            try_join_all(resources.iter().map(|r| reconciler.plan_resource(r))).await?;
        let service_plans =
            try_join_all(services.iter().map(|s| reconciler.plan_service(s))).await?;

        let mut outcomes = HashMap::new();
        let mut nodes = Vec::with_capacity(resource_plans.len() + service_plans.len());
        for plan in resource_plans {
            let id = NodeId::resource(plan.name());
            let missing = missing_parents(&plan, &graph, &persisted);
            if !missing.is_empty() {
                log::info!("skipping {}: {} not found", id, missing.join(", "));
                outcomes.insert(
                    id,
                    NodeOutcome::Skipped(format!("missing parent {}", missing.join(", "))),
                );
                continue;
            }

            let predecessors = graph
                .dependencies_of(plan.name())
                .iter()
                .map(NodeId::resource)
                .collect();
            nodes.push(Scheduled {
                id,
                predecessors,
                task: CreateTask::Resource(plan),
            });
        }
        for plan in service_plans {
            nodes.push(Scheduled {
                id: NodeId::service(plan.name()),
                predecessors: Vec::new(),
                task: CreateTask::Service(plan),
            });
        }

        let outcomes = self
            .drive(nodes, outcomes, |task| self.run_create(ctx, task))
            .await;
        Ok(into_report(outcomes))
    }

    async fn run_create(&self, ctx: &EnvironmentContext, task: CreateTask) -> NodeOutcome {
        match task {
            CreateTask::Resource(plan) => self.apply_resource(ctx, plan).await,
            CreateTask::Service(plan) => self.apply_service(ctx, plan).await,
        }
    }

    async fn apply_resource(&self, ctx: &EnvironmentContext, plan: ResourcePlan) -> NodeOutcome {
        let id = NodeId::resource(plan.name());
        let Some(action) = plan.action.apply_action() else {
            log::debug!("{} is up to date", id);
            return NodeOutcome::Unchanged;
        };

        let manager = self.resource_manager(plan.name(), plan.declaration.is_container_backed());
        let lock = manager
            .lock(
                LockOperation::new(plan.operation_type())
                    .with_metadata("resource", json!(plan.name())),
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
            .apply_resource_locked(ctx, &id, &plan, action, &manager, guard.lock_id())
            .await;
        release(guard).await;

        result.unwrap_or_else(|e| {
            log::warn!("{}: {}", id, e);
            NodeOutcome::Failed(e.to_string())
        })
    }

    async fn apply_resource_locked(
        &self,
        ctx: &EnvironmentContext,
        id: &NodeId,
        plan: &ResourcePlan,
        action: ApplyAction,
        manager: &ResourceManager,
        lock_id: &str,
    ) -> OrchestratorResult<NodeOutcome> {
        let declaration = &plan.declaration;
        // Re-read under the lock; another run may have written since planning
        let mut state = match manager.try_load().await? {
            Some(state) => state,
            None => ResourceState::new(
                &declaration.name,
                &declaration.product,
                declaration.cloud_provider,
                ResourceStatus::Creating,
            ),
        };
        state.cloud_provider = declaration.cloud_provider;
        state.depends_on = declaration.depends_on.clone();
        state.attempted_inputs = Some(plan.inputs.clone());
        state.transition(match action {
            ApplyAction::Create => ResourceStatus::Creating,
            ApplyAction::Update => ResourceStatus::Updating,
            ApplyAction::Replace => ResourceStatus::Replacing,
        });
        manager.save(&state, lock_id).await?;

        log_transition(id, NodeState::Locked, NodeState::Executing);
        let request = ApplyRequest {
            name: declaration.name.clone(),
            product: declaration.product.clone(),
            cloud_provider: declaration.cloud_provider,
            action,
            inputs: plan.inputs.clone(),
            previous_inputs: state.inputs.clone(),
            previous_outputs: state.outputs.clone(),
            environment: ctx.clone(),
            backend: self.environment.backend().clone(),
            destination_uri: manager.destination_uri(),
            lock_id: lock_id.to_string(),
        };

        match self
            .provision_resource(request, declaration.is_container_backed())
            .await
        {
            Ok(outputs) => {
                state.inputs = Some(plan.inputs.clone());
                state.attempted_inputs = None;
                state.outputs = Some(outputs);
                state.transition(ResourceStatus::Ready);
                manager.save(&state, lock_id).await?;
                log_transition(id, NodeState::Executing, NodeState::Succeeded);

                Ok(match action {
                    ApplyAction::Create => NodeOutcome::Created,
                    ApplyAction::Update => NodeOutcome::Updated,
                    ApplyAction::Replace => NodeOutcome::Replaced,
                })
            }
            Err(e) => {
                log_transition(id, NodeState::Executing, NodeState::Failed);
                log::warn!("{}: {}", id, e);
                match action {
                    // Cleared so the next run plans a create again
                    ApplyAction::Create => {
                        state.inputs = None;
                        state.transition(ResourceStatus::CreateFailed);
                    }
                    ApplyAction::Update | ApplyAction::Replace => {
                        state.transition(ResourceStatus::UpdateFailed);
                    }
                }
                manager.save(&state, lock_id).await?;
                Ok(NodeOutcome::Failed(e.to_string()))
            }
        }
    }

    /// Apply through the provisioner; a replaced container-backed resource
    /// loses its old containers first, and its containers are started after
    async fn provision_resource(
        &self,
        request: ApplyRequest,
        container_backed: bool,
    ) -> ProvisionResult<Outputs> {
        let name = request.name.clone();
        if container_backed && request.action == ApplyAction::Replace {
            self.remove_containers(&name)?;
        }
        let outputs = self.provisioner.apply_resource(request).await?;
        if container_backed {
            self.start_containers(&name)?;
        }
        Ok(outputs)
    }

    async fn apply_service(&self, ctx: &EnvironmentContext, plan: ServicePlan) -> NodeOutcome {
        let id = NodeId::service(plan.name());
        let Some(action) = plan.action.apply_action() else {
            log::debug!("{} is up to date", id);
            return NodeOutcome::Unchanged;
        };

        let manager = self.environment.service(plan.name());
        let lock = manager
            .lock(
                LockOperation::new(plan.operation_type())
                    .with_metadata("service", json!(plan.name())),
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
            .apply_service_locked(ctx, &id, &plan, action, &manager, guard.lock_id())
            .await;
        release(guard).await;

        result.unwrap_or_else(|e| {
            log::warn!("{}: {}", id, e);
            NodeOutcome::Failed(e.to_string())
        })
    }

    async fn apply_service_locked(
        &self,
        ctx: &EnvironmentContext,
        id: &NodeId,
        plan: &ServicePlan,
        action: ApplyAction,
        manager: &ServiceManager,
        lock_id: &str,
    ) -> OrchestratorResult<NodeOutcome> {
        let declaration = &plan.declaration;
        let mut state = match manager.try_load().await? {
            Some(state) => state,
            None => ServiceState::new(
                &declaration.name,
                &declaration.product,
                declaration.cloud_provider,
                ServiceStatus::Creating,
            ),
        };
        state.cloud_provider = declaration.cloud_provider;
        state.attempted_inputs = Some(plan.inputs.clone());
        state.transition(match action {
            ApplyAction::Create => ServiceStatus::Creating,
            ApplyAction::Update | ApplyAction::Replace => ServiceStatus::Deploying,
        });
        manager.save(&state, lock_id).await?;

        log_transition(id, NodeState::Locked, NodeState::Executing);
        let request = ApplyRequest {
            name: declaration.name.clone(),
            product: declaration.product.clone(),
            cloud_provider: declaration.cloud_provider,
            action,
            inputs: plan.inputs.clone(),
            previous_inputs: state.inputs.clone(),
            previous_outputs: state.outputs.clone(),
            environment: ctx.clone(),
            backend: self.environment.backend().clone(),
            destination_uri: manager.destination_uri(),
            lock_id: lock_id.to_string(),
        };

        match self.provisioner.apply_service(request).await {
            Ok(outputs) => {
                state.inputs = Some(plan.inputs.clone());
                state.attempted_inputs = None;
                state.outputs = Some(outputs);
                state.transition(ServiceStatus::Ready);
                manager.save(&state, lock_id).await?;
                log_transition(id, NodeState::Executing, NodeState::Succeeded);

                Ok(match action {
                    ApplyAction::Create => NodeOutcome::Created,
                    ApplyAction::Update | ApplyAction::Replace => NodeOutcome::Updated,
                })
            }
            Err(e) => {
                log_transition(id, NodeState::Executing, NodeState::Failed);
                log::warn!("{}: {}", id, e);
                match action {
                    ApplyAction::Create => {
                        state.inputs = None;
                        state.transition(ServiceStatus::CreateFailed);
                    }
                    ApplyAction::Update | ApplyAction::Replace => {
                        state.transition(ServiceStatus::DeployFailed);
                    }
                }
                manager.save(&state, lock_id).await?;
                Ok(NodeOutcome::Failed(e.to_string()))
            }
        }
    }
}

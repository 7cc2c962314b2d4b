//! Reconciler - Compare declared resources with persisted state
//!
//! Resolves the inputs a declaration should be applied with and decides
//! whether the entity needs to be created, updated in place, replaced, or
//! left alone. Nothing here mutates state.

use std::collections::{BTreeSet, HashMap};

use flow_state::{
    EnvironmentManager, Inputs, OperationType, ResourceState, ResourceStatus, ServiceState,
};
use serde_json::json;

use crate::error::{OrchestratorError, OrchestratorResult};
use crate::provider::{ApplyAction, ContainerRuntime, container_label};
use crate::resource::{EnvironmentContext, ResourceDeclaration, ServiceDeclaration};

/// What has to happen to one entity
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PlanAction {
    /// No usable prior state
    Create,
    /// Only in-place fields changed
    Update { changed: Vec<String> },
    /// At least one field that cannot change in place
    Replace { changed: Vec<String> },
    NoOp,
}

impl PlanAction {
    /// Returns whether this action involves a change
    pub fn is_change(&self) -> bool {
        !matches!(self, PlanAction::NoOp)
    }

    pub fn apply_action(&self) -> Option<ApplyAction> {
        match self {
            PlanAction::Create => Some(ApplyAction::Create),
            PlanAction::Update { .. } => Some(ApplyAction::Update),
            PlanAction::Replace { .. } => Some(ApplyAction::Replace),
            PlanAction::NoOp => None,
        }
    }

    /// Changed input keys, sorted
    pub fn changed(&self) -> &[String] {
        match self {
            PlanAction::Update { changed } | PlanAction::Replace { changed } => changed,
            PlanAction::Create | PlanAction::NoOp => &[],
        }
    }
}

/// Decision for one resource
#[derive(Debug, Clone, PartialEq)]
pub struct ResourcePlan {
    pub declaration: ResourceDeclaration,
    /// Resolved inputs to apply
    pub inputs: Inputs,
    pub action: PlanAction,
    pub existing: Option<ResourceState>,
}

impl ResourcePlan {
    pub fn name(&self) -> &str {
        &self.declaration.name
    }

    pub fn depends_on(&self) -> &[String] {
        &self.declaration.depends_on
    }

    pub fn operation_type(&self) -> OperationType {
        match self.action {
            PlanAction::Create => OperationType::CreateResource,
            PlanAction::Replace { .. } => OperationType::ReplaceResource,
            PlanAction::Update { .. } | PlanAction::NoOp => OperationType::UpdateResource,
        }
    }
}

/// Decision for one service
#[derive(Debug, Clone, PartialEq)]
pub struct ServicePlan {
    pub declaration: ServiceDeclaration,
    pub inputs: Inputs,
    /// Never `Replace`; a service with changed inputs is redeployed
    pub action: PlanAction,
    pub existing: Option<ServiceState>,
}

impl ServicePlan {
    pub fn name(&self) -> &str {
        &self.declaration.name
    }

    pub fn operation_type(&self) -> OperationType {
        match self.action {
            PlanAction::Create => OperationType::CreateService,
            _ => OperationType::DeployService,
        }
    }
}

/// Merge declared parameters with environment-derived values
///
/// Declared parameters win, then the environment keys, then context
/// variables fill whatever is still missing.
pub fn resolve_inputs(parameters: &Inputs, name: &str, ctx: &EnvironmentContext) -> Inputs {
    let mut inputs = parameters.clone();
    inputs.insert("project".to_string(), json!(ctx.project));
    inputs.insert("environment".to_string(), json!(ctx.environment));
    inputs.insert(
        "environment_type".to_string(),
        json!(ctx.environment_type.to_string()),
    );
    if let Some(region) = &ctx.region {
        inputs.insert("region".to_string(), json!(region));
    }
    inputs.insert("resource_id".to_string(), json!(ctx.resource_id(name)));
    for (key, value) in &ctx.variables {
        inputs.entry(key.clone()).or_insert_with(|| value.clone());
    }
    inputs
}

/// Compare resolved inputs with the inputs of the last successful apply
pub fn decide(
    resolved: &Inputs,
    previous: Option<&Inputs>,
    in_place_fields: &BTreeSet<String>,
) -> PlanAction {
    let Some(previous) = previous else {
        return PlanAction::Create;
    };

    let changed = find_changed_keys(resolved, previous);
    if changed.is_empty() {
        PlanAction::NoOp
    } else if changed.iter().all(|key| in_place_fields.contains(key)) {
        PlanAction::Update { changed }
    } else {
        PlanAction::Replace { changed }
    }
}

/// Keys added, removed or changed between two input sets, sorted
fn find_changed_keys(desired: &Inputs, current: &Inputs) -> Vec<String> {
    let keys: BTreeSet<&String> = desired.keys().chain(current.keys()).collect();
    keys.into_iter()
        .filter(|key| desired.get(*key) != current.get(*key))
        .cloned()
        .collect()
}

/// Plan a resource against its persisted record
pub fn plan_resource(
    declaration: &ResourceDeclaration,
    ctx: &EnvironmentContext,
    existing: Option<ResourceState>,
) -> OrchestratorResult<ResourcePlan> {
    if let Some(state) = &existing
        && state.product != declaration.product
    {
        return Err(OrchestratorError::DuplicateResourceProductMismatch {
            name: declaration.name.clone(),
            declared: declaration.product.clone(),
            existing: state.product.clone(),
        });
    }

    let inputs = resolve_inputs(&declaration.parameters, &declaration.name, ctx);
    let previous = existing.as_ref().and_then(|s| s.inputs.as_ref());
    let action = decide(&inputs, previous, &declaration.in_place_fields);

    Ok(ResourcePlan {
        declaration: declaration.clone(),
        inputs,
        action,
        existing,
    })
}

/// Plan a service against its persisted record
pub fn plan_service(
    declaration: &ServiceDeclaration,
    ctx: &EnvironmentContext,
    existing: Option<ServiceState>,
) -> OrchestratorResult<ServicePlan> {
    if let Some(state) = &existing
        && state.product != declaration.product
    {
        return Err(OrchestratorError::DuplicateResourceProductMismatch {
            name: declaration.name.clone(),
            declared: declaration.product.clone(),
            existing: state.product.clone(),
        });
    }

    let inputs = resolve_inputs(&declaration.parameters, &declaration.name, ctx);
    let previous = existing.as_ref().and_then(|s| s.inputs.as_ref());
    let action = match decide(&inputs, previous, &declaration.in_place_fields) {
        PlanAction::Replace { changed } => PlanAction::Update { changed },
        action => action,
    };

    Ok(ServicePlan {
        declaration: declaration.clone(),
        inputs,
        action,
        existing,
    })
}

/// Collapse exact duplicates; the same name with two products is an error
pub fn dedupe_resources(
    declarations: Vec<ResourceDeclaration>,
) -> OrchestratorResult<Vec<ResourceDeclaration>> {
    let mut seen: HashMap<String, String> = HashMap::new();
    let mut unique = Vec::with_capacity(declarations.len());
    for declaration in declarations {
        match seen.get(&declaration.name) {
            Some(product) if *product == declaration.product => {
                log::debug!("ignoring duplicate declaration of {}", declaration.name);
            }
            Some(product) => {
                return Err(OrchestratorError::DuplicateResourceProductMismatch {
                    name: declaration.name.clone(),
                    declared: declaration.product.clone(),
                    existing: product.clone(),
                });
            }
            None => {
                seen.insert(declaration.name.clone(), declaration.product.clone());
                unique.push(declaration);
            }
        }
    }
    Ok(unique)
}

pub fn dedupe_services(
    declarations: Vec<ServiceDeclaration>,
) -> OrchestratorResult<Vec<ServiceDeclaration>> {
    let mut seen: HashMap<String, String> = HashMap::new();
    let mut unique = Vec::with_capacity(declarations.len());
    for declaration in declarations {
        match seen.get(&declaration.name) {
            Some(product) if *product == declaration.product => {}
            Some(product) => {
                return Err(OrchestratorError::DuplicateResourceProductMismatch {
                    name: declaration.name.clone(),
                    declared: declaration.product.clone(),
                    existing: product.clone(),
                });
            }
            None => {
                seen.insert(declaration.name.clone(), declaration.product.clone());
                unique.push(declaration);
            }
        }
    }
    Ok(unique)
}

/// Loads persisted state for declarations and plans them
pub struct Reconciler<'a> {
    environment: &'a EnvironmentManager,
    context: &'a EnvironmentContext,
    container_runtime: Option<&'a dyn ContainerRuntime>,
}

impl<'a> Reconciler<'a> {
    pub fn new(environment: &'a EnvironmentManager, context: &'a EnvironmentContext) -> Self {
        Self {
            environment,
            context,
            container_runtime: None,
        }
    }

    pub fn with_container_runtime(mut self, runtime: Option<&'a dyn ContainerRuntime>) -> Self {
        self.container_runtime = runtime;
        self
    }

    /// Container runtime, if it is installed and reachable
    pub fn require_container_runtime(&self) -> OrchestratorResult<&'a dyn ContainerRuntime> {
        match self.container_runtime {
            Some(runtime) if runtime.is_available() => Ok(runtime),
            _ => Err(OrchestratorError::MissingDependency("docker".to_string())),
        }
    }

    pub async fn plan_resource(
        &self,
        declaration: &ResourceDeclaration,
    ) -> OrchestratorResult<ResourcePlan> {
        let existing = self
            .environment
            .resource(&declaration.name)
            .try_load()
            .await?;
        let mut plan = plan_resource(declaration, self.context, existing)?;

        if declaration.is_container_backed() {
            let runtime = self.require_container_runtime()?;
            let ready = plan
                .existing
                .as_ref()
                .is_some_and(|s| s.status == ResourceStatus::Ready);
            if ready
                && runtime
                    .list_by_label(&container_label(&declaration.name))?
                    .is_empty()
            {
                log::info!(
                    "container for {} is gone; planning a fresh create",
                    declaration.name
                );
                plan.action = PlanAction::Create;
            }
        }

        log::debug!("planned {}: {:?}", declaration.name, plan.action);
        Ok(plan)
    }

    pub async fn plan_service(
        &self,
        declaration: &ServiceDeclaration,
    ) -> OrchestratorResult<ServicePlan> {
        let existing = self
            .environment
            .service(&declaration.name)
            .try_load()
            .await?;
        let plan = plan_service(declaration, self.context, existing)?;
        log::debug!("planned service {}: {:?}", declaration.name, plan.action);
        Ok(plan)
    }
}

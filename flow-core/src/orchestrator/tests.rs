use std::collections::{BTreeMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use flow_state::backends::LocalStore;
use flow_state::{
    CloudProvider, EnvironmentStatus, LockOperation, OperationType, Outputs, ProjectManager,
    ResourceStatus, ServiceStatus, StateError, StateStore,
};
use serde_json::json;
use tempfile::TempDir;
use tokio::sync::Notify;

use super::*;
use crate::error::OrchestratorError;
use crate::provider::{
    ApplyAction, ApplyRequest, BoxFuture, ContainerRuntime, DestroyRequest, ProvisionError,
    ProvisionResult,
};
use crate::resource::{ResourceDeclaration, ServiceDeclaration};

/// Records every call; calls listed in `failing` return an error
#[derive(Default)]
struct RecordingProvisioner {
    calls: Mutex<Vec<String>>,
    failing: Mutex<HashSet<String>>,
    applied: Mutex<Vec<ApplyRequest>>,
}

impl RecordingProvisioner {
    fn fail(&self, call: &str) {
        self.failing.lock().unwrap().insert(call.to_string());
    }

    fn recover(&self) {
        self.failing.lock().unwrap().clear();
    }

    fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    fn last_applied(&self) -> ApplyRequest {
        self.applied.lock().unwrap().last().cloned().unwrap()
    }

    fn record(&self, call: String, entity: &str) -> ProvisionResult<usize> {
        let mut calls = self.calls.lock().unwrap();
        calls.push(call.clone());
        if self.failing.lock().unwrap().contains(&call) {
            return Err(ProvisionError::new("simulated failure").for_entity(entity));
        }
        Ok(calls.len())
    }

    fn apply(&self, kind: &str, request: ApplyRequest) -> ProvisionResult<Outputs> {
        let n = self.record(format!("{}:{}", kind, request.name), &request.name)?;
        let outputs = Outputs::default().with_identifier(format!("{}-{}", request.name, n));
        self.applied.lock().unwrap().push(request);
        Ok(outputs)
    }
}

impl Provisioner for RecordingProvisioner {
    fn apply_resource(&self, request: ApplyRequest) -> BoxFuture<'_, ProvisionResult<Outputs>> {
        Box::pin(async move {
            tokio::task::yield_now().await;
            self.apply("apply", request)
        })
    }

    fn destroy_resource(&self, request: DestroyRequest) -> BoxFuture<'_, ProvisionResult<()>> {
        Box::pin(async move {
            tokio::task::yield_now().await;
            self.record(format!("destroy:{}", request.name), &request.name)
                .map(|_| ())
        })
    }

    fn apply_service(&self, request: ApplyRequest) -> BoxFuture<'_, ProvisionResult<Outputs>> {
        Box::pin(async move {
            tokio::task::yield_now().await;
            self.apply("deploy", request)
        })
    }

    fn destroy_service(&self, request: DestroyRequest) -> BoxFuture<'_, ProvisionResult<()>> {
        Box::pin(async move {
            tokio::task::yield_now().await;
            self.record(format!("remove:{}", request.name), &request.name)
                .map(|_| ())
        })
    }
}

/// Signals when a call starts, then never finishes
#[derive(Default)]
struct StallingProvisioner {
    started: Notify,
}

impl StallingProvisioner {
    fn stall<T: Send + 'static>(&self) -> BoxFuture<'_, ProvisionResult<T>> {
        Box::pin(async move {
            self.started.notify_one();
            std::future::pending().await
        })
    }
}

impl Provisioner for StallingProvisioner {
    fn apply_resource(&self, _request: ApplyRequest) -> BoxFuture<'_, ProvisionResult<Outputs>> {
        self.stall()
    }

    fn destroy_resource(&self, _request: DestroyRequest) -> BoxFuture<'_, ProvisionResult<()>> {
        self.stall()
    }

    fn apply_service(&self, _request: ApplyRequest) -> BoxFuture<'_, ProvisionResult<Outputs>> {
        self.stall()
    }

    fn destroy_service(&self, _request: DestroyRequest) -> BoxFuture<'_, ProvisionResult<()>> {
        self.stall()
    }
}

/// Containers keyed by the resource they are labelled for
#[derive(Default)]
struct RecordingRuntime {
    containers: Mutex<BTreeMap<String, Vec<String>>>,
    calls: Mutex<Vec<String>>,
}

impl RecordingRuntime {
    fn run(&self, resource: &str, container: &str) {
        self.containers
            .lock()
            .unwrap()
            .entry(resource.to_string())
            .or_default()
            .push(container.to_string());
    }

    fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }
}

impl ContainerRuntime for RecordingRuntime {
    fn is_available(&self) -> bool {
        true
    }

    fn list_by_label(&self, label: &str) -> ProvisionResult<Vec<String>> {
        let resource = label.trim_start_matches("flow.resource=");
        Ok(self
            .containers
            .lock()
            .unwrap()
            .get(resource)
            .cloned()
            .unwrap_or_default())
    }

    fn start(&self, container: &str) -> ProvisionResult<()> {
        self.calls.lock().unwrap().push(format!("start:{}", container));
        Ok(())
    }

    fn stop(&self, container: &str) -> ProvisionResult<()> {
        self.calls.lock().unwrap().push(format!("stop:{}", container));
        Ok(())
    }

    fn remove(&self, container: &str) -> ProvisionResult<()> {
        self.calls.lock().unwrap().push(format!("remove:{}", container));
        for containers in self.containers.lock().unwrap().values_mut() {
            containers.retain(|c| c != container);
        }
        Ok(())
    }
}

struct Fixture {
    _dir: TempDir,
    project: ProjectManager,
    provisioner: Arc<RecordingProvisioner>,
    orchestrator: Orchestrator,
    ctx: EnvironmentContext,
}

fn fixture_with(config: OrchestratorConfig) -> Fixture {
    let dir = tempfile::tempdir().unwrap();
    let store: Arc<dyn StateStore> = Arc::new(LocalStore::new(dir.path()));
    let project = ProjectManager::new(store, "acme").with_poll_interval(Duration::from_millis(10));
    let provisioner = Arc::new(RecordingProvisioner::default());
    let orchestrator =
        Orchestrator::new(project.environment("dev"), provisioner.clone()).with_config(config);
    Fixture {
        _dir: dir,
        project,
        provisioner,
        orchestrator,
        ctx: EnvironmentContext::new("acme", "dev").with_region("us-central1"),
    }
}

async fn fixture() -> Fixture {
    let fixture = fixture_with(OrchestratorConfig::default());
    fixture
        .orchestrator
        .create_environment(&fixture.ctx)
        .await
        .unwrap();
    fixture
}

fn bucket(name: &str) -> ResourceDeclaration {
    ResourceDeclaration::new(name, "gcp_storage_bucket")
        .with_cloud_provider(CloudProvider::Gcp)
        .with_parameter("location", json!("US"))
}

fn strings(items: &[&str]) -> Vec<String> {
    items.iter().map(|s| s.to_string()).collect()
}

#[tokio::test]
async fn test_create_applies_parent_before_child() {
    let f = fixture().await;
    let report = f
        .orchestrator
        .create(
            &f.ctx,
            vec![bucket("bucket2").depends_on("bucket1"), bucket("bucket1")],
            vec![],
        )
        .await
        .unwrap();

    assert!(report.is_success());
    assert_eq!(report.resource("bucket1"), Some(&NodeOutcome::Created));
    assert_eq!(report.resource("bucket2"), Some(&NodeOutcome::Created));
    assert_eq!(
        f.provisioner.calls(),
        strings(&["apply:bucket1", "apply:bucket2"])
    );

    let env = f.project.environment("dev");
    let state = env.resource("bucket2").load().await.unwrap();
    assert_eq!(state.depends_on, strings(&["bucket1"]));
    assert_eq!(state.status, ResourceStatus::Ready);
    assert!(state.attempted_inputs.is_none());
    assert_eq!(
        state.inputs.as_ref().unwrap()["resource_id"],
        json!("acme-dev-bucket2")
    );
    assert!(state.outputs.unwrap().identifier.is_some());
    assert!(env.resource("bucket2").lock_info().await.unwrap().is_none());
}

#[tokio::test]
async fn test_create_waits_for_every_parent() {
    let f = fixture().await;
    let report = f
        .orchestrator
        .create(
            &f.ctx,
            vec![
                bucket("c").depends_on("a").depends_on("b"),
                bucket("a"),
                bucket("b"),
            ],
            vec![],
        )
        .await
        .unwrap();

    assert!(report.is_success());
    let calls = f.provisioner.calls();
    assert_eq!(calls.len(), 3);
    assert_eq!(calls.last().unwrap(), "apply:c");
}

#[tokio::test]
async fn test_create_skips_node_with_missing_parent() {
    let f = fixture().await;
    let report = f
        .orchestrator
        .create(
            &f.ctx,
            vec![bucket("b"), bucket("c").depends_on("a").depends_on("b")],
            vec![],
        )
        .await
        .unwrap();

    assert_eq!(f.provisioner.calls(), strings(&["apply:b"]));
    assert!(matches!(report.resource("c"), Some(NodeOutcome::Skipped(_))));
    assert!(report.is_success());
    assert!(
        f.project
            .environment("dev")
            .resource("c")
            .try_load()
            .await
            .unwrap()
            .is_none()
    );
}

#[tokio::test]
async fn test_create_accepts_previously_applied_parent() {
    let f = fixture().await;
    f.orchestrator
        .create(&f.ctx, vec![bucket("a")], vec![])
        .await
        .unwrap();

    let report = f
        .orchestrator
        .create(&f.ctx, vec![bucket("c").depends_on("a")], vec![])
        .await
        .unwrap();
    assert_eq!(report.resource("c"), Some(&NodeOutcome::Created));
}

#[tokio::test]
async fn test_reapply_noop_update_replace() {
    let f = fixture().await;
    let declared = bucket("bucket")
        .with_parameter("labels", json!({"team": "a"}))
        .with_in_place_field("labels");

    let report = f
        .orchestrator
        .create(&f.ctx, vec![declared.clone()], vec![])
        .await
        .unwrap();
    assert_eq!(report.resource("bucket"), Some(&NodeOutcome::Created));

    let report = f
        .orchestrator
        .create(&f.ctx, vec![declared.clone()], vec![])
        .await
        .unwrap();
    assert_eq!(report.resource("bucket"), Some(&NodeOutcome::Unchanged));
    assert_eq!(f.provisioner.calls().len(), 1);

    let relabeled = declared
        .clone()
        .with_parameter("labels", json!({"team": "b"}));
    let report = f
        .orchestrator
        .create(&f.ctx, vec![relabeled.clone()], vec![])
        .await
        .unwrap();
    assert_eq!(report.resource("bucket"), Some(&NodeOutcome::Updated));
    assert_eq!(f.provisioner.last_applied().action, ApplyAction::Update);

    let moved = relabeled.with_parameter("location", json!("EU"));
    let report = f
        .orchestrator
        .create(&f.ctx, vec![moved], vec![])
        .await
        .unwrap();
    assert_eq!(report.resource("bucket"), Some(&NodeOutcome::Replaced));
    let request = f.provisioner.last_applied();
    assert_eq!(request.action, ApplyAction::Replace);
    assert_eq!(
        request.previous_inputs.unwrap()["location"],
        json!("US")
    );

    let state = f
        .project
        .environment("dev")
        .resource("bucket")
        .load()
        .await
        .unwrap();
    assert_eq!(state.inputs.unwrap()["location"], json!("EU"));
    assert_eq!(
        state.outputs.unwrap().identifier.as_deref(),
        Some("bucket-3")
    );
}

#[tokio::test]
async fn test_failed_create_clears_inputs_and_releases_lock() {
    let f = fixture().await;
    f.provisioner.fail("apply:bucket");

    let report = f
        .orchestrator
        .create(&f.ctx, vec![bucket("bucket")], vec![])
        .await
        .unwrap();
    assert!(matches!(report.resource("bucket"), Some(NodeOutcome::Failed(_))));
    assert!(!report.is_success());

    let resource = f.project.environment("dev").resource("bucket");
    let state = resource.load().await.unwrap();
    assert_eq!(state.status, ResourceStatus::CreateFailed);
    assert!(state.inputs.is_none());
    assert_eq!(state.attempted_inputs.unwrap()["location"], json!("US"));
    assert!(resource.lock_info().await.unwrap().is_none());

    f.provisioner.recover();
    let report = f
        .orchestrator
        .create(&f.ctx, vec![bucket("bucket")], vec![])
        .await
        .unwrap();
    assert_eq!(report.resource("bucket"), Some(&NodeOutcome::Created));
}

#[tokio::test]
async fn test_failed_update_keeps_previous_inputs() {
    let f = fixture().await;
    f.orchestrator
        .create(&f.ctx, vec![bucket("bucket")], vec![])
        .await
        .unwrap();

    f.provisioner.fail("apply:bucket");
    let changed = bucket("bucket").with_parameter("location", json!("EU"));
    f.orchestrator
        .create(&f.ctx, vec![changed], vec![])
        .await
        .unwrap();

    let state = f
        .project
        .environment("dev")
        .resource("bucket")
        .load()
        .await
        .unwrap();
    assert_eq!(state.status, ResourceStatus::UpdateFailed);
    assert_eq!(state.inputs.unwrap()["location"], json!("US"));
    assert_eq!(state.attempted_inputs.unwrap()["location"], json!("EU"));
}

#[tokio::test]
async fn test_failed_parent_blocks_children() {
    let f = fixture().await;
    f.provisioner.fail("apply:a");

    let report = f
        .orchestrator
        .create(
            &f.ctx,
            vec![bucket("a"), bucket("b").depends_on("a"), bucket("other")],
            vec![],
        )
        .await
        .unwrap();

    assert!(matches!(report.resource("a"), Some(NodeOutcome::Failed(_))));
    assert_eq!(
        report.resource("b"),
        Some(&NodeOutcome::Blocked(strings(&["a"])))
    );
    assert_eq!(report.resource("other"), Some(&NodeOutcome::Created));
    assert!(!f.provisioner.calls().contains(&"apply:b".to_string()));
}

#[tokio::test]
async fn test_destroy_removes_dependents_first() {
    let f = fixture().await;
    f.orchestrator
        .create(&f.ctx, vec![bucket("a"), bucket("b").depends_on("a")], vec![])
        .await
        .unwrap();

    let report = f
        .orchestrator
        .destroy(&f.ctx, DestroySelection::All)
        .await
        .unwrap();

    assert!(report.is_success());
    assert_eq!(
        f.provisioner.calls()[2..].to_vec(),
        strings(&["destroy:b", "destroy:a"])
    );
    let env = f.project.environment("dev");
    assert!(env.list_resources().await.unwrap().is_empty());
    assert!(env.lock_info().await.unwrap().is_none());
}

#[tokio::test]
async fn test_destroy_failure_leaves_parent_untouched() {
    let f = fixture().await;
    f.orchestrator
        .create(&f.ctx, vec![bucket("a"), bucket("b").depends_on("a")], vec![])
        .await
        .unwrap();
    f.provisioner.fail("destroy:b");

    let report = f
        .orchestrator
        .destroy(&f.ctx, DestroySelection::All)
        .await
        .unwrap();

    assert!(!report.is_success());
    assert!(matches!(report.resource("b"), Some(NodeOutcome::Failed(_))));
    assert_eq!(
        report.resource("a"),
        Some(&NodeOutcome::Blocked(strings(&["b"])))
    );
    assert!(!f.provisioner.calls().contains(&"destroy:a".to_string()));

    let env = f.project.environment("dev");
    let a = env.resource("a").load().await.unwrap();
    let b = env.resource("b").load().await.unwrap();
    assert_eq!(a.status, ResourceStatus::Ready);
    assert_eq!(b.status, ResourceStatus::DeleteFailed);
    assert!(env.resource("b").lock_info().await.unwrap().is_none());

    f.provisioner.recover();
    let report = f
        .orchestrator
        .destroy(&f.ctx, DestroySelection::All)
        .await
        .unwrap();
    assert!(report.is_success());
    assert!(env.list_resources().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_destroy_selection_touches_only_selected() {
    let f = fixture().await;
    f.orchestrator
        .create(
            &f.ctx,
            vec![bucket("x"), bucket("y")],
            vec![ServiceDeclaration::new("api", "gcp_cloud_run")],
        )
        .await
        .unwrap();
    let before = f.provisioner.calls().len();

    let report = f
        .orchestrator
        .destroy(&f.ctx, DestroySelection::resources(["x"]))
        .await
        .unwrap();

    assert_eq!(report.resources.len(), 1);
    assert!(report.services.is_empty());
    assert_eq!(f.provisioner.calls()[before..].to_vec(), strings(&["destroy:x"]));

    let env = f.project.environment("dev");
    let remaining = env.list_resources().await.unwrap();
    assert_eq!(remaining.keys().collect::<Vec<_>>(), vec!["y"]);
    assert_eq!(env.list_services().await.unwrap().len(), 1);
}

#[tokio::test]
async fn test_services_create_redeploy_and_destroy() {
    let f = fixture().await;
    let api = ServiceDeclaration::new("api", "gcp_cloud_run").with_parameter("cpu", json!(1));

    let report = f
        .orchestrator
        .create(&f.ctx, vec![], vec![api.clone()])
        .await
        .unwrap();
    assert_eq!(report.service("api"), Some(&NodeOutcome::Created));

    let report = f
        .orchestrator
        .create(&f.ctx, vec![], vec![api.with_parameter("cpu", json!(2))])
        .await
        .unwrap();
    assert_eq!(report.service("api"), Some(&NodeOutcome::Updated));

    let service = f.project.environment("dev").service("api");
    let state = service.load().await.unwrap();
    assert_eq!(state.status, ServiceStatus::Ready);
    assert_eq!(state.inputs.unwrap()["cpu"], json!(2));

    f.orchestrator
        .destroy(&f.ctx, DestroySelection::services(["api"]))
        .await
        .unwrap();
    assert!(service.try_load().await.unwrap().is_none());
    assert_eq!(
        f.provisioner.calls(),
        strings(&["deploy:api", "deploy:api", "remove:api"])
    );
}

#[tokio::test]
async fn test_cycle_is_rejected_before_locking() {
    let f = fixture().await;
    let err = f
        .orchestrator
        .create(
            &f.ctx,
            vec![bucket("a").depends_on("b"), bucket("b").depends_on("a")],
            vec![],
        )
        .await
        .unwrap_err();

    assert!(matches!(err, OrchestratorError::DependencyCycle(_)));
    assert!(f.provisioner.calls().is_empty());
    assert!(
        f.project
            .environment("dev")
            .list_resources()
            .await
            .unwrap()
            .is_empty()
    );
}

#[tokio::test]
async fn test_cycle_through_persisted_resources_is_rejected() {
    let f = fixture().await;
    f.orchestrator
        .create(&f.ctx, vec![bucket("b")], vec![])
        .await
        .unwrap();
    f.orchestrator
        .create(&f.ctx, vec![bucket("a").depends_on("b")], vec![])
        .await
        .unwrap();

    let err = f
        .orchestrator
        .create(&f.ctx, vec![bucket("b").depends_on("a")], vec![])
        .await
        .unwrap_err();
    match err {
        OrchestratorError::DependencyCycle(cycle) => {
            assert!(cycle.contains(&"a".to_string()));
            assert!(cycle.contains(&"b".to_string()));
        }
        other => panic!("Expected DependencyCycle, got {:?}", other),
    }

    let b = f.project.environment("dev").resource("b").load().await.unwrap();
    assert!(b.depends_on.is_empty());
    assert_eq!(f.provisioner.calls(), strings(&["apply:b", "apply:a"]));
}

#[tokio::test]
async fn test_destroy_blocks_persisted_cycle_and_continues() {
    let f = fixture().await;
    f.orchestrator
        .create(&f.ctx, vec![bucket("a"), bucket("b"), bucket("c")], vec![])
        .await
        .unwrap();

    // Records left cyclic by an older writer
    let env = f.project.environment("dev");
    for (name, parent) in [("a", "b"), ("b", "a")] {
        let resource = env.resource(name);
        let mut state = resource.load().await.unwrap();
        state.depends_on = vec![parent.to_string()];
        resource.save(&state, "unused-by-local").await.unwrap();
    }

    let report = f
        .orchestrator
        .destroy(&f.ctx, DestroySelection::All)
        .await
        .unwrap();
    assert!(!report.is_success());
    assert_eq!(report.resource("c"), Some(&NodeOutcome::Destroyed));
    assert!(matches!(report.resource("a"), Some(NodeOutcome::Blocked(_))));
    assert!(matches!(report.resource("b"), Some(NodeOutcome::Blocked(_))));
    assert_eq!(
        env.resource("a").load().await.unwrap().status,
        ResourceStatus::Ready
    );
    assert!(!f.provisioner.calls().contains(&"destroy:a".to_string()));

    let report = f.orchestrator.delete_environment(&f.ctx).await.unwrap();
    assert!(!report.is_success());
    assert_eq!(
        env.load().await.unwrap().status,
        EnvironmentStatus::DeleteFailed
    );
    assert!(env.lock_info().await.unwrap().is_none());
}

#[tokio::test]
async fn test_product_mismatch_in_batch() {
    let f = fixture().await;
    let err = f
        .orchestrator
        .create(
            &f.ctx,
            vec![bucket("db"), ResourceDeclaration::new("db", "gcp_sql_postgres")],
            vec![],
        )
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        OrchestratorError::DuplicateResourceProductMismatch { .. }
    ));
}

#[tokio::test]
async fn test_create_requires_environment() {
    let f = fixture_with(OrchestratorConfig::default());
    let err = f
        .orchestrator
        .create(&f.ctx, vec![bucket("a")], vec![])
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        OrchestratorError::State(StateError::EnvironmentNotFound(_))
    ));
}

#[tokio::test]
async fn test_container_backed_resource_requires_runtime() {
    let f = fixture().await;
    let redis =
        ResourceDeclaration::new("redis", "docker_redis").with_cloud_provider(CloudProvider::Local);
    let err = f
        .orchestrator
        .create(&f.ctx, vec![redis], vec![])
        .await
        .unwrap_err();
    assert!(matches!(err, OrchestratorError::MissingDependency(_)));
}

#[tokio::test]
async fn test_max_concurrency_one_runs_in_declaration_order() {
    let f = fixture_with(OrchestratorConfig {
        max_concurrency: 1,
        lock_wait_for_seconds: None,
    });
    f.orchestrator.create_environment(&f.ctx).await.unwrap();

    f.orchestrator
        .create(&f.ctx, vec![bucket("c"), bucket("a"), bucket("b")], vec![])
        .await
        .unwrap();
    assert_eq!(
        f.provisioner.calls(),
        strings(&["apply:c", "apply:a", "apply:b"])
    );
}

#[tokio::test]
async fn test_locked_resource_fails_only_that_node() {
    let f = fixture().await;
    let held = f
        .project
        .environment("dev")
        .resource("a")
        .lock(LockOperation::new(OperationType::UpdateResource))
        .acquire()
        .await
        .unwrap();

    let report = f
        .orchestrator
        .create(&f.ctx, vec![bucket("a"), bucket("b")], vec![])
        .await
        .unwrap();
    assert!(matches!(report.resource("a"), Some(NodeOutcome::Failed(_))));
    assert_eq!(report.resource("b"), Some(&NodeOutcome::Created));
    assert_eq!(f.provisioner.calls(), strings(&["apply:b"]));

    held.release().await.unwrap();
}

#[tokio::test]
async fn test_create_environment_is_idempotent() {
    let f = fixture().await;
    let env = f.project.environment("dev");
    let first = env.load().await.unwrap();
    assert_eq!(first.status, EnvironmentStatus::Ready);

    let again = f.orchestrator.create_environment(&f.ctx).await.unwrap();
    assert_eq!(again, first);
    assert!(env.lock_info().await.unwrap().is_none());
}

#[tokio::test]
async fn test_delete_environment_cascades() {
    let f = fixture().await;
    f.orchestrator
        .create(
            &f.ctx,
            vec![bucket("a"), bucket("b").depends_on("a")],
            vec![ServiceDeclaration::new("api", "gcp_cloud_run")],
        )
        .await
        .unwrap();

    let report = f.orchestrator.delete_environment(&f.ctx).await.unwrap();
    assert!(report.is_success());
    assert_eq!(report.summary().destroyed, 3);

    let env = f.project.environment("dev");
    assert!(env.load().await.unwrap_err().is_not_found());
    assert!(f.project.list_environments().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_delete_environment_keeps_environment_on_failure() {
    let f = fixture().await;
    f.orchestrator
        .create(&f.ctx, vec![bucket("a"), bucket("b").depends_on("a")], vec![])
        .await
        .unwrap();
    f.provisioner.fail("destroy:a");

    let report = f.orchestrator.delete_environment(&f.ctx).await.unwrap();
    assert!(!report.is_success());
    assert_eq!(report.resource("b"), Some(&NodeOutcome::Destroyed));

    let env = f.project.environment("dev");
    assert_eq!(
        env.load().await.unwrap().status,
        EnvironmentStatus::DeleteFailed
    );
    assert_eq!(
        env.resource("a").load().await.unwrap().status,
        ResourceStatus::DeleteFailed
    );
    assert!(env.lock_info().await.unwrap().is_none());
}

#[tokio::test]
async fn test_container_lifecycle_follows_apply_and_destroy() {
    let f = fixture().await;
    let runtime = Arc::new(RecordingRuntime::default());
    runtime.run("redis", "redis-1");
    let orchestrator = Orchestrator::new(f.project.environment("dev"), f.provisioner.clone())
        .with_container_runtime(runtime.clone());
    let redis = |image: &str| {
        ResourceDeclaration::new("redis", "docker_redis")
            .with_cloud_provider(CloudProvider::Local)
            .with_parameter("image", json!(image))
    };

    let report = orchestrator
        .create(&f.ctx, vec![redis("redis:7")], vec![])
        .await
        .unwrap();
    assert_eq!(report.resource("redis"), Some(&NodeOutcome::Created));
    assert_eq!(runtime.calls(), strings(&["start:redis-1"]));

    let report = orchestrator
        .create(&f.ctx, vec![redis("redis:8")], vec![])
        .await
        .unwrap();
    assert_eq!(report.resource("redis"), Some(&NodeOutcome::Replaced));
    assert_eq!(
        runtime.calls(),
        strings(&["start:redis-1", "stop:redis-1", "remove:redis-1"])
    );

    // Left behind by the provisioner's teardown
    runtime.run("redis", "redis-2");
    let report = orchestrator
        .destroy(&f.ctx, DestroySelection::All)
        .await
        .unwrap();
    assert_eq!(report.resource("redis"), Some(&NodeOutcome::Destroyed));
    assert_eq!(
        runtime.calls(),
        strings(&[
            "start:redis-1",
            "stop:redis-1",
            "remove:redis-1",
            "stop:redis-2",
            "remove:redis-2",
        ])
    );
    assert_eq!(
        f.provisioner.calls(),
        strings(&["apply:redis", "apply:redis", "destroy:redis"])
    );
}

/// Guards dropped with a cancelled run release in the background
async fn settle() {
    tokio::time::sleep(Duration::from_millis(200)).await;
}

#[tokio::test]
async fn test_cancelled_create_releases_node_lock() {
    let f = fixture().await;
    let provisioner = Arc::new(StallingProvisioner::default());
    let orchestrator = Orchestrator::new(f.project.environment("dev"), provisioner.clone());

    tokio::select! {
        _ = orchestrator.create(&f.ctx, vec![bucket("a")], vec![]) => {
            panic!("create finished while the apply stalls")
        }
        _ = provisioner.started.notified() => {}
    }

    settle().await;
    let resource = f.project.environment("dev").resource("a");
    assert!(resource.lock_info().await.unwrap().is_none());
    assert_eq!(
        resource.load().await.unwrap().status,
        ResourceStatus::Creating
    );
}

#[tokio::test]
async fn test_cancelled_destroy_releases_every_lock() {
    let f = fixture().await;
    f.orchestrator
        .create(&f.ctx, vec![bucket("a")], vec![])
        .await
        .unwrap();
    let provisioner = Arc::new(StallingProvisioner::default());
    let orchestrator = Orchestrator::new(f.project.environment("dev"), provisioner.clone());

    tokio::select! {
        _ = orchestrator.destroy(&f.ctx, DestroySelection::All) => {
            panic!("destroy finished while the teardown stalls")
        }
        _ = provisioner.started.notified() => {}
    }

    settle().await;
    let env = f.project.environment("dev");
    let resource = env.resource("a");
    assert!(resource.lock_info().await.unwrap().is_none());
    assert!(env.lock_info().await.unwrap().is_none());
    assert_eq!(
        resource.load().await.unwrap().status,
        ResourceStatus::Destroying
    );
}

//! Orchestrator - Drive create / destroy across an environment
//!
//! The orchestrator asks the [`Reconciler`] for a plan per node, then runs the
//! nodes with bounded concurrency: a node starts only once every predecessor
//! (create: its parents; destroy: its dependents) has terminated successfully.
//! Each node takes its own entity lock, persists the in-flight status,
//! calls the [`Provisioner`], persists the result and releases the lock.
//! A node's failure is recorded on that node and never aborts the batch.

mod create;
mod destroy;
mod environment;

#[cfg(test)]
mod tests;

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use flow_state::{EnvironmentManager, LockGuard, ResourceManager};
use futures_util::StreamExt;
use futures_util::stream::FuturesUnordered;

use crate::provider::{ContainerRuntime, ProvisionResult, Provisioner, container_label};
use crate::reconciler::Reconciler;
use crate::report::{NodeOutcome, Report};
use crate::resource::EnvironmentContext;

pub use destroy::DestroySelection;

/// Orchestrator configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrchestratorConfig {
    /// Upper bound on nodes executing at once
    pub max_concurrency: usize,
    /// How long each lock acquisition waits on contention; `None` fails fast
    pub lock_wait_for_seconds: Option<u64>,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            max_concurrency: 8,
            lock_wait_for_seconds: None,
        }
    }
}

/// Lifecycle of one node within a run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeState {
    Pending,
    Locked,
    Executing,
    Succeeded,
    Failed,
}

impl fmt::Display for NodeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Pending => "pending",
            Self::Locked => "locked",
            Self::Executing => "executing",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
        };
        write!(f, "{}", name)
    }
}

/// Node identity; resources and services live in separate namespaces
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub(crate) enum NodeId {
    Resource(String),
    Service(String),
}

impl NodeId {
    pub(crate) fn resource(name: impl Into<String>) -> Self {
        Self::Resource(name.into())
    }

    pub(crate) fn service(name: impl Into<String>) -> Self {
        Self::Service(name.into())
    }

    fn name(&self) -> &str {
        match self {
            Self::Resource(name) | Self::Service(name) => name,
        }
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Resource(name) => write!(f, "resource {}", name),
            Self::Service(name) => write!(f, "service {}", name),
        }
    }
}

pub(crate) fn log_transition(node: &NodeId, from: NodeState, to: NodeState) {
    log::debug!("{}: {} -> {}", node, from, to);
}

/// A node waiting for its predecessors
struct Scheduled<T> {
    id: NodeId,
    predecessors: Vec<NodeId>,
    task: T,
}

enum Readiness {
    Waiting,
    Ready,
    Resolved(NodeOutcome),
}

fn readiness(predecessors: &[NodeId], outcomes: &HashMap<NodeId, NodeOutcome>) -> Readiness {
    let mut waiting = false;
    let mut failed = Vec::new();
    for predecessor in predecessors {
        match outcomes.get(predecessor) {
            None => waiting = true,
            Some(NodeOutcome::Skipped(_)) => {
                return Readiness::Resolved(NodeOutcome::Skipped(format!(
                    "parent {} was skipped",
                    predecessor.name()
                )));
            }
            Some(outcome) if outcome.is_failure() => failed.push(predecessor.name().to_string()),
            Some(_) => {}
        }
    }

    if !failed.is_empty() {
        Readiness::Resolved(NodeOutcome::Blocked(failed))
    } else if waiting {
        Readiness::Waiting
    } else {
        Readiness::Ready
    }
}

/// Executes resource and service plans against one environment
pub struct Orchestrator {
    environment: EnvironmentManager,
    provisioner: Arc<dyn Provisioner>,
    container_runtime: Option<Arc<dyn ContainerRuntime>>,
    config: OrchestratorConfig,
}

impl Orchestrator {
    pub fn new(environment: EnvironmentManager, provisioner: Arc<dyn Provisioner>) -> Self {
        Self {
            environment,
            provisioner,
            container_runtime: None,
            config: OrchestratorConfig::default(),
        }
    }

    pub fn with_config(mut self, config: OrchestratorConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_container_runtime(mut self, runtime: Arc<dyn ContainerRuntime>) -> Self {
        self.container_runtime = Some(runtime);
        self
    }

    pub fn environment(&self) -> &EnvironmentManager {
        &self.environment
    }

    fn reconciler<'a>(&'a self, ctx: &'a EnvironmentContext) -> Reconciler<'a> {
        Reconciler::new(&self.environment, ctx)
            .with_container_runtime(self.container_runtime.as_deref())
    }

    fn resource_manager(&self, name: &str, container_backed: bool) -> ResourceManager {
        if container_backed {
            self.environment.container_resource(name)
        } else {
            self.environment.resource(name)
        }
    }

    /// Start every container labelled for `resource`
    fn start_containers(&self, resource: &str) -> ProvisionResult<()> {
        let Some(runtime) = &self.container_runtime else {
            return Ok(());
        };
        for container in runtime.list_by_label(&container_label(resource))? {
            log::debug!("starting container {} of resource {}", container, resource);
            runtime.start(&container)?;
        }
        Ok(())
    }

    /// Stop and remove every container labelled for `resource`
    fn remove_containers(&self, resource: &str) -> ProvisionResult<()> {
        let Some(runtime) = &self.container_runtime else {
            return Ok(());
        };
        for container in runtime.list_by_label(&container_label(resource))? {
            log::debug!("removing container {} of resource {}", container, resource);
            runtime.stop(&container)?;
            runtime.remove(&container)?;
        }
        Ok(())
    }

    fn lock_wait(&self) -> Option<Duration> {
        self.config.lock_wait_for_seconds.map(Duration::from_secs)
    }

    /// Run nodes as their predecessors finish, at most `max_concurrency` at a time
    ///
    /// `outcomes` may be pre-seeded with nodes resolved during planning.
    /// Pending nodes are scanned in the order given.
    async fn drive<T, F, Fut>(
        &self,
        mut pending: Vec<Scheduled<T>>,
        mut outcomes: HashMap<NodeId, NodeOutcome>,
        run: F,
    ) -> HashMap<NodeId, NodeOutcome>
    where
        F: Fn(T) -> Fut,
        Fut: Future<Output = NodeOutcome>,
    {
        let max_concurrency = self.config.max_concurrency.max(1);
        let mut running = FuturesUnordered::new();

        loop {
            let mut i = 0;
            while i < pending.len() {
                match readiness(&pending[i].predecessors, &outcomes) {
                    Readiness::Waiting => i += 1,
                    Readiness::Resolved(outcome) => {
                        let node = pending.remove(i);
                        log::info!("{}: {}", node.id, outcome);
                        outcomes.insert(node.id, outcome);
                        // Earlier nodes may depend on this one
                        i = 0;
                    }
                    Readiness::Ready if running.len() < max_concurrency => {
                        let node = pending.remove(i);
                        log::debug!("{}: scheduled", node.id);
                        let id = node.id;
                        let task = run(node.task);
                        running.push(async move { (id, task.await) });
                    }
                    Readiness::Ready => i += 1,
                }
            }

            match running.next().await {
                Some((id, outcome)) => {
                    log::info!("{}: {}", id, outcome);
                    outcomes.insert(id, outcome);
                }
                None => break,
            }
        }

        // Only reachable through a persisted cycle; create rejects new ones
        for node in pending {
            let waiting_on = node
                .predecessors
                .iter()
                .filter(|p| !outcomes.get(*p).is_some_and(NodeOutcome::is_success))
                .map(|p| p.name().to_string())
                .collect();
            outcomes.insert(node.id, NodeOutcome::Blocked(waiting_on));
        }

        outcomes
    }
}

/// Release a node or environment lock
async fn release(guard: LockGuard) {
    // Failures are logged by the guard
    let _ = guard.release().await;
}

fn into_report(outcomes: HashMap<NodeId, NodeOutcome>) -> Report {
    let mut report = Report::default();
    for (id, outcome) in outcomes {
        match id {
            NodeId::Resource(name) => {
                report.resources.insert(name, outcome);
            }
            NodeId::Service(name) => {
                report.services.insert(name, outcome);
            }
        }
    }
    report
}

use flow_state::{EnvironmentState, EnvironmentStatus, LockOperation, OperationType};
use serde_json::json;

use super::{DestroySelection, Orchestrator, release};
use crate::error::OrchestratorResult;
use crate::report::DestroyReport;
use crate::resource::EnvironmentContext;

impl Orchestrator {
    /// Create the environment record, or return it if it is already ready
    pub async fn create_environment(
        &self,
        ctx: &EnvironmentContext,
    ) -> OrchestratorResult<EnvironmentState> {
        let guard = self
            .environment
            .lock(
                LockOperation::new(OperationType::CreateEnvironment)
                    .with_metadata("environment_type", json!(ctx.environment_type.to_string())),
            )
            .wait_for(self.lock_wait())
            .acquire()
            .await?;

        let result = self.create_environment_locked(ctx, guard.lock_id()).await;
        release(guard).await;
        result
    }

    async fn create_environment_locked(
        &self,
        ctx: &EnvironmentContext,
        lock_id: &str,
    ) -> OrchestratorResult<EnvironmentState> {
        let mut state = match self.environment.load().await {
            Ok(state) if state.status == EnvironmentStatus::Ready => {
                log::info!("environment {} is already ready", self.environment.key());
                return Ok(state);
            }
            // Retrying an interrupted or failed create keeps the original record
            Ok(state) => state,
            Err(e) if e.is_not_found() => {
                EnvironmentState::new(ctx.environment_type, EnvironmentStatus::Creating)
            }
            Err(e) => return Err(e.into()),
        };

        state.environment_type = ctx.environment_type;
        state.transition(EnvironmentStatus::Creating);
        self.environment.save(&state, lock_id).await?;

        state.transition(EnvironmentStatus::Ready);
        self.environment.save(&state, lock_id).await?;
        log::info!("created environment {}", self.environment.key());
        Ok(state)
    }

    /// Destroy everything in the environment, then the environment itself
    ///
    /// If any node fails the environment is kept and marked `delete_failed`;
    /// the returned report says which nodes are left.
    pub async fn delete_environment(
        &self,
        ctx: &EnvironmentContext,
    ) -> OrchestratorResult<DestroyReport> {
        let guard = self
            .environment
            .lock(LockOperation::new(OperationType::DeleteEnvironment))
            .wait_for(self.lock_wait())
            .acquire()
            .await?;

        let result = self.delete_environment_locked(ctx, guard.lock_id()).await;
        release(guard).await;
        result
    }

    async fn delete_environment_locked(
        &self,
        ctx: &EnvironmentContext,
        lock_id: &str,
    ) -> OrchestratorResult<DestroyReport> {
        let mut state = self.environment.load().await?;
        state.transition(EnvironmentStatus::Deleting);
        self.environment.save(&state, lock_id).await?;

        let report = match self.destroy_selected(ctx, &DestroySelection::All).await {
            Ok(report) => report,
            Err(e) => {
                state.transition(EnvironmentStatus::DeleteFailed);
                self.environment.save(&state, lock_id).await?;
                return Err(e);
            }
        };

        if report.is_success() {
            self.environment.delete(lock_id).await?;
        } else {
            log::warn!(
                "environment {} not deleted: {}",
                self.environment.key(),
                report.summary()
            );
            state.transition(EnvironmentStatus::DeleteFailed);
            self.environment.save(&state, lock_id).await?;
        }
        Ok(report)
    }
}

//! Generic task trait for pipeline execution.

use super::ArtifactKind;
use async_trait::async_trait;
use buildlite_shared::errors::BuildliteResult;

/// Trait for tasks that can be executed in a pipeline.
///
/// Tasks run with a shared context, which is cloned per task. The artifact
/// declarations are checked by `ExecutionPlan::validate` before anything runs.
#[async_trait]
pub trait PipelineTask<Ctx>: Send + Sync {
    /// Execute the task with the shared pipeline context.
    async fn run(self: Box<Self>, ctx: Ctx) -> BuildliteResult<()>;

    /// Get human-readable task name for logging.
    fn name(&self) -> &str;

    /// Artifacts that must exist before this task runs.
    fn requires(&self) -> &[ArtifactKind] {
        &[]
    }

    /// Artifacts this task hands off on success.
    fn produces(&self) -> &[ArtifactKind] {
        &[]
    }
}

pub type BoxedTask<Ctx> = Box<dyn PipelineTask<Ctx>>;

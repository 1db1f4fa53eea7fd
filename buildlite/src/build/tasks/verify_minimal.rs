//! Task: Runtime minimality check.
//!
//! The assembled rootfs must not carry the dependency manager, its lockfile,
//! the project manifest or VCS metadata.

use super::{TaskCtx, log_task_error, task_start};
use crate::image::{check_rootfs, ensure_minimal};
use crate::pipeline::{ArtifactKind, PipelineTask};
use async_trait::async_trait;
use buildlite_shared::errors::{BuildliteError, BuildliteResult};

pub struct VerifyMinimalTask;

#[async_trait]
impl PipelineTask<TaskCtx> for VerifyMinimalTask {
    async fn run(self: Box<Self>, ctx: TaskCtx) -> BuildliteResult<()> {
        let task_name = self.name();
        let build_id = task_start(&ctx, task_name).await;

        let rootfs = {
            let ctx = ctx.lock().await;
            ctx.rootfs_output
                .as_ref()
                .map(|r| r.rootfs.clone())
                .ok_or_else(|| {
                    BuildliteError::Internal("assemble_rootfs task must run first".into())
                })?
        };

        check_rootfs(&rootfs)
            .and_then(|violations| ensure_minimal(&violations))
            .inspect_err(|e| log_task_error(&build_id, task_name, e))?;

        tracing::info!(build_id = %build_id, "Runtime filesystem is minimal");
        ctx.lock().await.minimal_checked = true;
        Ok(())
    }

    fn name(&self) -> &str {
        "verify_minimal"
    }

    fn requires(&self) -> &[ArtifactKind] {
        &[ArtifactKind::Rootfs]
    }

    fn produces(&self) -> &[ArtifactKind] {
        &[ArtifactKind::MinimalRootfs]
    }
}

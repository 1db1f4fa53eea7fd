//! Task: Lockfile integrity check.
//!
//! The staged lockfile must still match the staged manifest, cover the
//! requested groups and target the image interpreter. A stale lock aborts
//! the build before anything is installed.

use super::{TaskCtx, log_task_error, task_start};
use crate::build::types::LockOutput;
use crate::image::machine_for_arch;
use crate::pipeline::{ArtifactKind, PipelineTask};
use crate::project::{MarkerEnvironment, verify_lock};
use async_trait::async_trait;
use buildlite_shared::errors::{BuildliteError, BuildliteResult};

pub struct VerifyLockTask;

#[async_trait]
impl PipelineTask<TaskCtx> for VerifyLockTask {
    async fn run(self: Box<Self>, ctx: TaskCtx) -> BuildliteResult<()> {
        let task_name = self.name();
        let build_id = task_start(&ctx, task_name).await;

        let (staged, options) = {
            let ctx = ctx.lock().await;
            let staged = ctx.staged_output.clone().ok_or_else(|| {
                BuildliteError::Internal("stage_inputs task must run first".into())
            })?;
            (staged, ctx.options.clone())
        };

        let output = options
            .python_full_version()
            .and_then(|python| {
                let marker_env =
                    MarkerEnvironment::linux_cpython(&python, machine_for_arch(&options.arch));
                let report =
                    verify_lock(&staged.manifest, &staged.lock, &options.extras, &marker_env)?;
                Ok(LockOutput { report, marker_env })
            })
            .inspect_err(|e| log_task_error(&build_id, task_name, e))?;

        tracing::info!(
            build_id = %build_id,
            content_hash = %output.report.content_hash,
            groups = %output.report.groups.join(","),
            checked = output.report.checked.len(),
            "Lockfile is up to date"
        );

        ctx.lock().await.lock_output = Some(output);
        Ok(())
    }

    fn name(&self) -> &str {
        "verify_lock"
    }

    fn requires(&self) -> &[ArtifactKind] {
        &[ArtifactKind::StagedInputs]
    }

    fn produces(&self) -> &[ArtifactKind] {
        &[ArtifactKind::LockVerified]
    }
}

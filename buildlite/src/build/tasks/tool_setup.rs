//! Task: Dependency tool setup.
//!
//! Locates the installer backend before any input is staged, so a missing
//! tool fails the build early.

use super::{TaskCtx, log_task_error, task_start};
use crate::pipeline::{ArtifactKind, PipelineTask};
use async_trait::async_trait;
use buildlite_shared::errors::BuildliteResult;

pub struct ToolSetupTask;

#[async_trait]
impl PipelineTask<TaskCtx> for ToolSetupTask {
    async fn run(self: Box<Self>, ctx: TaskCtx) -> BuildliteResult<()> {
        let task_name = self.name();
        let build_id = task_start(&ctx, task_name).await;

        let installer = ctx.lock().await.installer.clone();

        let tool = installer
            .prepare()
            .await
            .inspect_err(|e| log_task_error(&build_id, task_name, e))?;

        tracing::info!(
            build_id = %build_id,
            installer = %tool.name,
            version = tool.version.as_deref().unwrap_or("unknown"),
            "Installer ready"
        );

        ctx.lock().await.tool_output = Some(tool);
        Ok(())
    }

    fn name(&self) -> &str {
        "tool_setup"
    }

    fn produces(&self) -> &[ArtifactKind] {
        &[ArtifactKind::Toolchain]
    }
}

//! Build pipeline tasks.
//!
//! Builder stage: `tool_setup`, `stage_inputs`, `verify_lock`, `install_env`.
//! Runtime stage: `assemble_rootfs`, `process_config`, `verify_minimal`,
//! `export_image`.

mod assemble_rootfs;
mod export_image;
mod install_env;
mod process_config;
mod stage_inputs;
mod tool_setup;
mod verify_lock;
mod verify_minimal;

pub use assemble_rootfs::AssembleRootfsTask;
pub use export_image::ExportImageTask;
pub use install_env::InstallEnvTask;
pub use process_config::{ProcessConfigTask, ProcessInput, derive_process_config, socket_healthcheck};
pub use stage_inputs::StageInputsTask;
pub use tool_setup::ToolSetupTask;
pub use verify_lock::VerifyLockTask;
pub use verify_minimal::VerifyMinimalTask;

use super::types::BuildCtx;
use buildlite_shared::errors::BuildliteError;

pub type TaskCtx = BuildCtx;

/// Log task entry and return the build id for error reporting.
pub(crate) async fn task_start(ctx: &TaskCtx, task_name: &str) -> String {
    let build_id = ctx.lock().await.build_id.clone();
    tracing::debug!(build_id = %build_id, task = %task_name, "Task starting");
    build_id
}

pub(crate) fn log_task_error(build_id: &str, task_name: &str, e: &BuildliteError) {
    tracing::error!(build_id = %build_id, task = %task_name, "Task failed: {}", e);
}

//! Type definitions for the build pipeline.

use crate::image::ImageLayout;
use crate::install::{EnvCache, Installer, ResolvedEnvironment, ToolInfo};
use crate::project::{IntegrityReport, Lockfile, MarkerEnvironment, ProjectManifest, ResolvedSet};
use crate::runtime::{BuildOptions, BuildWorkspace};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::Mutex;

/// Environment, port and entrypoint of the runtime image.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessConfig {
    /// Ordered `(key, value)` pairs.
    pub env: Vec<(String, String)>,
    pub entrypoint: Vec<String>,
    pub cmd: Vec<String>,
    pub working_dir: String,
    /// `8000/tcp`
    pub exposed_ports: Vec<String>,
    pub stop_signal: String,
    /// Health check command, run inside the container.
    pub healthcheck: Vec<String>,
    pub labels: BTreeMap<String, String>,
}

impl ProcessConfig {
    /// `KEY=value` strings in declaration order.
    pub fn env_strings(&self) -> Vec<String> {
        self.env.iter().map(|(k, v)| format!("{}={}", k, v)).collect()
    }

    pub fn env_var(&self, key: &str) -> Option<&str> {
        self.env
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }
}

/// RAII guard for cleanup on build failure.
///
/// Removes the build workspace if dropped without being disarmed.
pub struct CleanupGuard {
    build_id: String,
    workspace: Option<BuildWorkspace>,
    armed: bool,
}

impl CleanupGuard {
    pub fn new(build_id: impl Into<String>) -> Self {
        Self {
            build_id: build_id.into(),
            workspace: None,
            armed: true,
        }
    }

    /// Register the workspace for cleanup on failure.
    pub fn set_workspace(&mut self, workspace: BuildWorkspace) {
        self.workspace = Some(workspace);
    }

    /// Disarm the guard (call on success).
    ///
    /// After disarming, Drop will not perform cleanup.
    pub fn disarm(&mut self) {
        self.armed = false;
    }
}

impl Drop for CleanupGuard {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }

        tracing::warn!(build_id = %self.build_id, "Build failed, cleaning up");

        if let Some(ref workspace) = self.workspace
            && let Err(e) = workspace.cleanup()
        {
            tracing::warn!("Failed to cleanup build workspace: {}", e);
        }
    }
}

/// Shared build pipeline context.
///
/// Stores shared inputs, outputs, and the cleanup guard across all tasks.
pub struct BuildContext {
    pub build_id: String,
    pub options: BuildOptions,
    pub project_dir: PathBuf,
    pub out_dir: PathBuf,
    pub workspace: BuildWorkspace,
    pub installer: Arc<dyn Installer>,
    pub env_cache: Option<EnvCache>,
    pub guard: CleanupGuard,
    pub tool_output: Option<ToolInfo>,
    pub staged_output: Option<StagedOutput>,
    pub lock_output: Option<LockOutput>,
    pub env_output: Option<EnvironmentOutput>,
    pub rootfs_output: Option<RootfsOutput>,
    pub process_output: Option<ProcessConfig>,
    pub minimal_checked: bool,
    pub image_output: Option<ImageLayout>,
}

impl BuildContext {
    pub fn new(
        build_id: String,
        options: BuildOptions,
        project_dir: PathBuf,
        out_dir: PathBuf,
        workspace: BuildWorkspace,
        installer: Arc<dyn Installer>,
        env_cache: Option<EnvCache>,
    ) -> Self {
        let mut guard = CleanupGuard::new(build_id.clone());
        guard.set_workspace(workspace.clone());
        Self {
            build_id,
            options,
            project_dir,
            out_dir,
            workspace,
            installer,
            env_cache,
            guard,
            tool_output: None,
            staged_output: None,
            lock_output: None,
            env_output: None,
            rootfs_output: None,
            process_output: None,
            minimal_checked: false,
            image_output: None,
        }
    }
}

pub type BuildCtx = Arc<Mutex<BuildContext>>;

// ============================================================================
// TASK INPUT/OUTPUT TYPES
// ============================================================================

/// Input for the stage_inputs task.
pub struct StagedInput<'a> {
    pub options: &'a BuildOptions,
    pub project_dir: &'a std::path::Path,
    pub staged_dir: &'a std::path::Path,
}

/// Inputs copied into the builder workdir, parsed.
#[derive(Debug, Clone)]
pub struct StagedOutput {
    pub project_dir: PathBuf,
    pub manifest: ProjectManifest,
    pub lock: Lockfile,
    pub source_digest: String,
}

/// Output of the verify_lock task.
#[derive(Debug, Clone)]
pub struct LockOutput {
    pub report: IntegrityReport,
    /// Runtime interpreter the lock was checked against.
    pub marker_env: MarkerEnvironment,
}

/// Output of the install_env task.
#[derive(Debug, Clone)]
pub struct EnvironmentOutput {
    pub environment: ResolvedEnvironment,
    pub closure: ResolvedSet,
    /// Digest of every input that shapes the environment.
    pub input_digest: String,
    pub cache_hit: bool,
}

/// Output of the assemble_rootfs task.
#[derive(Debug, Clone)]
pub struct RootfsOutput {
    pub rootfs: PathBuf,
    /// Image paths that become layers, in layer order.
    pub layer_paths: Vec<(String, String)>,
}

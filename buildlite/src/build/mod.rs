//! Image build orchestration.
//!
//! ## Architecture
//!
//! A build is a two-stage execution plan. Stages hand off artifacts, never
//! shared directories:
//!
//! ```text
//! builder:
//!   1. tool_setup        (locate the installer)
//!   2. stage_inputs      (copy manifest, lockfile, README, sources)
//!   3. verify_lock       (lockfile integrity against the manifest)
//!   4. install_env       (resolved environment, from cache when possible)
//!
//! runtime:
//!   5. assemble_rootfs   (copy environment and sources into a fresh rootfs)
//!   6. process_config    (PATH, PYTHONPATH, port, entrypoint)
//!   7. verify_minimal    (no dependency manager, lockfile or manifest)
//!   8. export_image      (deterministic layers, OCI layout)
//! ```
//!
//! `buildlite check` runs `stage_inputs` and `verify_lock` only.
//! `CleanupGuard` removes the build workspace on failure.

mod tasks;
mod types;

pub use tasks::{
    AssembleRootfsTask, ExportImageTask, InstallEnvTask, ProcessConfigTask, ProcessInput,
    StageInputsTask, TaskCtx, ToolSetupTask, VerifyLockTask, VerifyMinimalTask,
    derive_process_config, socket_healthcheck,
};
pub use types::{
    BuildContext, BuildCtx, CleanupGuard, EnvironmentOutput, LockOutput, ProcessConfig,
    RootfsOutput, StagedOutput,
};

use crate::db::BuildStore;
use crate::image::{ImageLayout, sha256_digest};
use crate::install::{EnvCache, EnvironmentRecord, IndexInstaller, Installer, PdmInstaller};
use crate::pipeline::{
    BoxedTask, ExecutionPlan, PipelineBuilder, PipelineExecutor, PipelineMetrics, Stage,
};
use crate::project::IntegrityReport;
use crate::runtime::{BuildOptions, BuildliteHome, InstallerConfig};
use buildlite_shared::errors::{BuildliteError, BuildliteResult};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::Mutex;

// ============================================================================
// EXECUTION PLANS
// ============================================================================

/// The full builder -> runtime plan.
pub fn build_plan() -> ExecutionPlan<TaskCtx> {
    let builder: Vec<BoxedTask<TaskCtx>> = vec![
        Box::new(ToolSetupTask),
        Box::new(StageInputsTask),
        Box::new(VerifyLockTask),
        Box::new(InstallEnvTask),
    ];
    let runtime: Vec<BoxedTask<TaskCtx>> = vec![
        Box::new(AssembleRootfsTask),
        Box::new(ProcessConfigTask),
        Box::new(VerifyMinimalTask),
        Box::new(ExportImageTask),
    ];

    ExecutionPlan::new(vec![
        Stage::sequential("builder", builder),
        Stage::sequential("runtime", runtime),
    ])
}

/// Integrity check only: nothing is installed.
pub fn check_plan() -> ExecutionPlan<TaskCtx> {
    let check: Vec<BoxedTask<TaskCtx>> = vec![Box::new(StageInputsTask), Box::new(VerifyLockTask)];
    ExecutionPlan::new(vec![Stage::sequential("check", check)])
}

fn installer_for(config: &InstallerConfig, project_dir: &Path) -> Arc<dyn Installer> {
    match config {
        InstallerConfig::Pdm { program } => Arc::new(PdmInstaller::new(program.clone())),
        InstallerConfig::Index { path } => Arc::new(IndexInstaller::new(project_dir.join(path))),
    }
}

/// Digest identifying the installed package set.
pub fn environment_digest(record: &EnvironmentRecord) -> BuildliteResult<String> {
    Ok(sha256_digest(&serde_json::to_vec(record)?))
}

// ============================================================================
// BUILDER
// ============================================================================

/// Result of a successful build.
#[derive(Debug, Clone)]
pub struct BuildOutcome {
    pub build_id: String,
    pub image: ImageLayout,
    pub environment: EnvironmentRecord,
    pub environment_digest: String,
    /// Cache key of the resolved environment.
    pub input_digest: String,
    pub cache_hit: bool,
    pub metrics: PipelineMetrics,
}

/// Builds a runtime image from a project directory.
///
/// # Example
///
/// ```ignore
/// let outcome = ImageBuilder::new(options, project_dir, out_dir, home)?
///     .with_store(store)
///     .build()
///     .await?;
/// ```
pub struct ImageBuilder {
    options: BuildOptions,
    project_dir: PathBuf,
    out_dir: PathBuf,
    home: BuildliteHome,
    installer: Arc<dyn Installer>,
    store: Option<BuildStore>,
}

impl ImageBuilder {
    pub fn new(
        options: BuildOptions,
        project_dir: impl Into<PathBuf>,
        out_dir: impl Into<PathBuf>,
        home: BuildliteHome,
    ) -> BuildliteResult<Self> {
        options.sanitize()?;
        let project_dir = project_dir.into();
        let installer = installer_for(&options.installer, &project_dir);

        Ok(Self {
            options,
            project_dir,
            out_dir: out_dir.into(),
            home,
            installer,
            store: None,
        })
    }

    /// Replace the installer selected by the options.
    pub fn with_installer(mut self, installer: Arc<dyn Installer>) -> Self {
        self.installer = installer;
        self
    }

    /// Record the build in the history database.
    pub fn with_store(mut self, store: BuildStore) -> Self {
        self.store = Some(store);
        self
    }

    fn context(&self, build_id: &str) -> BuildliteResult<BuildCtx> {
        self.home.prepare()?;
        let workspace = self.home.workspace(build_id);
        workspace.prepare()?;

        let env_cache = self
            .options
            .cache
            .then(|| EnvCache::new(self.home.env_cache_dir()));

        Ok(Arc::new(Mutex::new(BuildContext::new(
            build_id.to_string(),
            self.options.clone(),
            self.project_dir.clone(),
            self.out_dir.clone(),
            workspace,
            Arc::clone(&self.installer),
            env_cache,
        ))))
    }

    /// Run the builder and runtime stages and export the image.
    ///
    /// Executes all stages with automatic cleanup on failure.
    pub async fn build(self) -> BuildliteResult<BuildOutcome> {
        let build_id = ulid::Ulid::new().to_string();
        let project = self.project_dir.display().to_string();
        tracing::info!(build_id = %build_id, project = %project, "Build starting");

        let plan = build_plan();
        plan.validate()?;

        if let Some(store) = &self.store {
            store.record_started(&build_id, &project)?;
        }

        let ctx = match self.context(&build_id) {
            Ok(ctx) => ctx,
            Err(e) => {
                self.record_failure(&build_id, None, &e);
                return Err(e);
            }
        };

        let pipeline = PipelineBuilder::from_plan(plan);
        let result = match PipelineExecutor::execute(pipeline, Arc::clone(&ctx)).await {
            Ok(metrics) => Self::finish(&ctx, metrics).await,
            Err(e) => Err(e),
        };

        match &result {
            Ok(outcome) => {
                tracing::info!(
                    build_id = %build_id,
                    image = %outcome.image.manifest_digest,
                    environment = %outcome.environment_digest,
                    cache_hit = outcome.cache_hit,
                    "Build succeeded"
                );
                if let Some(store) = &self.store {
                    store.record_succeeded(
                        &build_id,
                        &outcome.input_digest,
                        &outcome.environment_digest,
                        &outcome.image.manifest_digest,
                        outcome.image.base_digest.as_deref(),
                    )?;
                }
            }
            Err(e) => {
                let input_digest = ctx
                    .lock()
                    .await
                    .env_output
                    .as_ref()
                    .map(|o| o.input_digest.clone());
                self.record_failure(&build_id, input_digest.as_deref(), e);
            }
        }

        result
    }

    fn record_failure(&self, build_id: &str, input_digest: Option<&str>, e: &BuildliteError) {
        tracing::error!(
            build_id = %build_id,
            stage = e.stage().unwrap_or("-"),
            "Build failed: {}",
            e
        );
        if let Some(store) = &self.store
            && let Err(db) = store.record_failed(build_id, input_digest, e.stage(), &e.to_string())
        {
            tracing::error!(build_id = %build_id, "Failed to record build failure: {}", db);
        }
    }

    async fn finish(ctx: &BuildCtx, metrics: PipelineMetrics) -> BuildliteResult<BuildOutcome> {
        let mut ctx = ctx.lock().await;
        metrics.log_stages();

        let image = ctx
            .image_output
            .take()
            .ok_or_else(|| BuildliteError::Internal("export_image task must run first".into()))?;
        let env = ctx
            .env_output
            .take()
            .ok_or_else(|| BuildliteError::Internal("install_env task must run first".into()))?;
        let environment_digest = environment_digest(&env.environment.record)?;

        ctx.guard.disarm();
        if let Err(e) = ctx.workspace.cleanup() {
            tracing::warn!(build_id = %ctx.build_id, "Failed to remove build workspace: {}", e);
        }

        Ok(BuildOutcome {
            build_id: ctx.build_id.clone(),
            image,
            environment: env.environment.record,
            environment_digest,
            input_digest: env.input_digest,
            cache_hit: env.cache_hit,
            metrics,
        })
    }

    /// Verify the lockfile against the manifest without installing.
    pub async fn check(self) -> BuildliteResult<IntegrityReport> {
        let build_id = ulid::Ulid::new().to_string();
        let plan = check_plan();
        plan.validate()?;

        let ctx = self.context(&build_id)?;
        PipelineExecutor::execute(PipelineBuilder::from_plan(plan), Arc::clone(&ctx)).await?;

        let mut ctx = ctx.lock().await;
        let lock = ctx
            .lock_output
            .take()
            .ok_or_else(|| BuildliteError::Internal("verify_lock task must run first".into()))?;

        ctx.guard.disarm();
        if let Err(e) = ctx.workspace.cleanup() {
            tracing::warn!(build_id = %ctx.build_id, "Failed to remove check workspace: {}", e);
        }
        Ok(lock.report)
    }
}

//! Task: Resolved environment installation.
//!
//! Computes the production closure from the verified lockfile and installs
//! it into `<builder>/project/.venv`, or restores it from the environment
//! cache when every input matches a previous build.

use super::{TaskCtx, log_task_error, task_start};
use crate::build::types::{EnvironmentOutput, LockOutput, StagedOutput};
use crate::install::{
    CacheKeyInputs, EnvCache, EnvironmentSpec, Installer, ResolvedEnvironment, build_environment,
};
use crate::pipeline::{ArtifactKind, PipelineTask};
use crate::project::{ClosureOptions, resolve_production};
use crate::runtime::BuildOptions;
use async_trait::async_trait;
use buildlite_shared::errors::{BuildliteError, BuildliteResult};
use std::path::Path;
use std::sync::Arc;

pub struct InstallEnvTask;

struct InstallInput<'a> {
    options: &'a BuildOptions,
    staged: &'a StagedOutput,
    lock: &'a LockOutput,
    installer: &'a dyn Installer,
    cache: Option<&'a EnvCache>,
    dest: &'a Path,
}

#[async_trait]
impl PipelineTask<TaskCtx> for InstallEnvTask {
    async fn run(self: Box<Self>, ctx: TaskCtx) -> BuildliteResult<()> {
        let task_name = self.name();
        let build_id = task_start(&ctx, task_name).await;

        let (options, staged, lock, installer, cache, dest) = {
            let ctx = ctx.lock().await;
            let staged = ctx.staged_output.clone().ok_or_else(|| {
                BuildliteError::Internal("stage_inputs task must run first".into())
            })?;
            let lock = ctx.lock_output.clone().ok_or_else(|| {
                BuildliteError::Internal("verify_lock task must run first".into())
            })?;
            (
                ctx.options.clone(),
                staged,
                lock,
                Arc::clone(&ctx.installer),
                ctx.env_cache.clone(),
                ctx.workspace.builder_venv(),
            )
        };

        let output = run_install_env(InstallInput {
            options: &options,
            staged: &staged,
            lock: &lock,
            installer: installer.as_ref(),
            cache: cache.as_ref(),
            dest: &dest,
        })
        .await
        .inspect_err(|e| log_task_error(&build_id, task_name, e))?;

        tracing::info!(
            build_id = %build_id,
            packages = output.closure.len(),
            cache_hit = output.cache_hit,
            input_digest = %output.input_digest,
            "Production environment resolved"
        );

        ctx.lock().await.env_output = Some(output);
        Ok(())
    }

    fn name(&self) -> &str {
        "install_env"
    }

    fn requires(&self) -> &[ArtifactKind] {
        &[ArtifactKind::Toolchain, ArtifactKind::LockVerified]
    }

    fn produces(&self) -> &[ArtifactKind] {
        &[ArtifactKind::ResolvedEnvironment]
    }
}

async fn run_install_env(input: InstallInput<'_>) -> BuildliteResult<EnvironmentOutput> {
    let options = input.options;
    let manifest = &input.staged.manifest;
    let lock = &input.staged.lock;

    let closure = resolve_production(
        manifest,
        lock,
        &ClosureOptions {
            extras: options.extras.clone(),
            env: input.lock.marker_env.clone(),
        },
    )?;
    tracing::debug!(pins = %closure.pins().join(" "), "Production closure");

    let python_full_version = options.python_full_version()?;
    let closure_digest = closure.digest();
    let input_digest = CacheKeyInputs {
        lock_hash: &lock.metadata.content_hash,
        closure_digest: &closure_digest,
        source_digest: &input.staged.source_digest,
        extras: &options.extras,
        installer: input.installer.name(),
        python_full_version: &python_full_version,
        image_path: &options.env_dir,
    }
    .key();

    if let Some(cache) = input.cache
        && let Some(record) = cache.restore(&input_digest, input.dest)?
    {
        tracing::info!(key = %input_digest, "Restored resolved environment from cache");
        return Ok(EnvironmentOutput {
            environment: ResolvedEnvironment {
                path: input.dest.to_path_buf(),
                record,
            },
            closure,
            input_digest,
            cache_hit: true,
        });
    }

    let environment = build_environment(
        input.installer,
        &EnvironmentSpec {
            project_dir: &input.staged.project_dir,
            manifest,
            lock,
            closure: &closure,
            extras: &options.extras,
            image_path: &options.env_dir,
            python_full_version: &python_full_version,
        },
        input.dest,
    )
    .await?;

    if let Some(cache) = input.cache {
        cache.store(&input_digest, &environment.path)?;
    }

    Ok(EnvironmentOutput {
        environment,
        closure,
        input_digest,
        cache_hit: false,
    })
}

//! Task: Runtime process configuration.
//!
//! Derives the image environment (`PATH`, `PYTHONPATH`, `VIRTUAL_ENV`), the
//! exposed port, the entrypoint and the health check. The application
//! module and the ASGI server must both be present in the assembled rootfs.

use super::{TaskCtx, log_task_error, task_start};
use crate::build::types::ProcessConfig;
use crate::install::VenvLayout;
use crate::launch::LaunchConfig;
use crate::pipeline::{ArtifactKind, PipelineTask};
use crate::runtime::BuildOptions;
use crate::runtime::constants::{defaults, envs, labels};
use async_trait::async_trait;
use buildlite_shared::errors::{BuildliteError, BuildliteResult};
use std::path::{Path, PathBuf};

pub struct ProcessConfigTask;

/// Digests recorded as image labels.
pub struct ProcessInput<'a> {
    pub options: &'a BuildOptions,
    pub rootfs: &'a Path,
    pub lock_hash: &'a str,
    pub closure_digest: &'a str,
}

#[async_trait]
impl PipelineTask<TaskCtx> for ProcessConfigTask {
    async fn run(self: Box<Self>, ctx: TaskCtx) -> BuildliteResult<()> {
        let task_name = self.name();
        let build_id = task_start(&ctx, task_name).await;

        let (options, rootfs, lock_hash, closure_digest) = {
            let ctx = ctx.lock().await;
            let rootfs = ctx.rootfs_output.as_ref().ok_or_else(|| {
                BuildliteError::Internal("assemble_rootfs task must run first".into())
            })?;
            let env = ctx.env_output.as_ref().ok_or_else(|| {
                BuildliteError::Internal("install_env task must run first".into())
            })?;
            (
                ctx.options.clone(),
                rootfs.rootfs.clone(),
                env.environment.record.lock_hash.clone(),
                env.environment.record.closure_digest.clone(),
            )
        };

        let config = derive_process_config(ProcessInput {
            options: &options,
            rootfs: &rootfs,
            lock_hash: &lock_hash,
            closure_digest: &closure_digest,
        })
        .inspect_err(|e| log_task_error(&build_id, task_name, e))?;

        tracing::info!(
            build_id = %build_id,
            entrypoint = %config.entrypoint.join(" "),
            ports = %config.exposed_ports.join(","),
            "Process configuration derived"
        );

        ctx.lock().await.process_output = Some(config);
        Ok(())
    }

    fn name(&self) -> &str {
        "process_config"
    }

    fn requires(&self) -> &[ArtifactKind] {
        &[ArtifactKind::ResolvedEnvironment, ArtifactKind::Rootfs]
    }

    fn produces(&self) -> &[ArtifactKind] {
        &[ArtifactKind::ProcessConfig]
    }
}

pub fn derive_process_config(input: ProcessInput<'_>) -> BuildliteResult<ProcessConfig> {
    let options = input.options;
    let python = options.python_full_version()?;
    let venv = VenvLayout::new(
        image_to_host(input.rootfs, &options.env_dir),
        options.env_dir.clone(),
        python,
    );

    let (module, _) = options.app_parts()?;
    let search = [
        image_to_host(input.rootfs, &options.source_dir),
        venv.site_packages(),
    ];
    if !search.iter().any(|dir| module_exists(dir, module)) {
        return Err(BuildliteError::Layout(format!(
            "application module '{}' not found in {} or the environment's site-packages",
            module, options.source_dir
        )));
    }

    let supervised = options.supervisor_binary.is_some();
    if !supervised && venv.bin_dir().join(&options.server).symlink_metadata().is_err() {
        return Err(BuildliteError::Layout(format!(
            "ASGI server '{}' is not installed in the resolved environment",
            options.server
        )));
    }

    let launch = LaunchConfig::from_options(options);
    let mut env: Vec<(String, String)> = vec![
        (envs::PATH.into(), launch.env[envs::PATH].clone()),
        (envs::PYTHONPATH.into(), launch.env[envs::PYTHONPATH].clone()),
        (envs::VIRTUAL_ENV.into(), launch.env[envs::VIRTUAL_ENV].clone()),
        (envs::PYTHONUNBUFFERED.into(), "1".into()),
    ];
    env.extend(options.runtime_env.iter().map(|(k, v)| (k.clone(), v.clone())));

    let port = options.port.to_string();
    let (entrypoint, healthcheck) = if supervised {
        env.extend(launch.to_env());
        (
            vec![defaults::SUPERVISOR_PATH.to_string(), "launch".to_string()],
            vec![
                defaults::SUPERVISOR_PATH.to_string(),
                "probe".to_string(),
                "--port".to_string(),
                port.clone(),
                "--path".to_string(),
                options.health_path.clone(),
            ],
        )
    } else {
        (launch.server_argv(), socket_healthcheck(options.port))
    };

    let mut image_labels = options.labels.clone();
    image_labels.insert(labels::LOCK_HASH.to_string(), input.lock_hash.to_string());
    image_labels.insert(labels::ENV_DIGEST.to_string(), input.closure_digest.to_string());

    Ok(ProcessConfig {
        env,
        entrypoint,
        cmd: Vec::new(),
        working_dir: options.workdir.clone(),
        exposed_ports: vec![format!("{}/tcp", port)],
        stop_signal: defaults::STOP_SIGNAL.to_string(),
        healthcheck,
        labels: image_labels,
    })
}

/// Health check that needs nothing but the interpreter.
pub fn socket_healthcheck(port: u16) -> Vec<String> {
    vec![
        "python".to_string(),
        "-c".to_string(),
        format!(
            "import socket; socket.create_connection(('127.0.0.1', {}), 2).close()",
            port
        ),
    ]
}

fn image_to_host(rootfs: &Path, image_path: &str) -> PathBuf {
    rootfs.join(image_path.trim_start_matches('/'))
}

/// Module file, package directory or extension module for a dotted path.
fn module_exists(dir: &Path, module: &str) -> bool {
    let mut parts: Vec<&str> = module.split('.').collect();
    let Some(last) = parts.pop() else {
        return false;
    };
    let parent = parts.iter().fold(dir.to_path_buf(), |p, part| p.join(part));

    if parent.join(last).is_dir() || parent.join(format!("{}.py", last)).is_file() {
        return true;
    }
    let prefix = format!("{}.", last);
    std::fs::read_dir(&parent)
        .map(|entries| {
            entries.flatten().any(|e| {
                let name = e.file_name();
                let name = name.to_string_lossy();
                name.starts_with(&prefix) && (name.ends_with(".so") || name.ends_with(".pyd"))
            })
        })
        .unwrap_or(false)
}

//! Task: Runtime filesystem assembly.
//!
//! Copies the resolved environment verbatim and the application sources into
//! a fresh rootfs. Nothing is resolved or installed here; the builder's
//! environment is the only dependency input.

use super::{TaskCtx, log_task_error, task_start};
use crate::build::types::RootfsOutput;
use crate::fs::{copy_tree, is_source_entry, publish_dir, sibling_path};
use crate::install::ResolvedEnvironment;
use crate::pipeline::{ArtifactKind, PipelineTask};
use crate::runtime::constants::defaults;
use crate::runtime::{BuildOptions, BuildWorkspace};
use async_trait::async_trait;
use buildlite_shared::errors::{BuildliteError, BuildliteResult};
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

pub struct AssembleRootfsTask;

struct AssembleInput<'a> {
    options: &'a BuildOptions,
    workspace: &'a BuildWorkspace,
    environment: &'a Path,
    sources: &'a Path,
}

#[async_trait]
impl PipelineTask<TaskCtx> for AssembleRootfsTask {
    async fn run(self: Box<Self>, ctx: TaskCtx) -> BuildliteResult<()> {
        let task_name = self.name();
        let build_id = task_start(&ctx, task_name).await;

        let (options, workspace, environment, sources) = {
            let ctx = ctx.lock().await;
            let env_output = ctx.env_output.as_ref().ok_or_else(|| {
                BuildliteError::Internal("install_env task must run first".into())
            })?;
            let staged = ctx.staged_output.as_ref().ok_or_else(|| {
                BuildliteError::Internal("stage_inputs task must run first".into())
            })?;
            (
                ctx.options.clone(),
                ctx.workspace.clone(),
                env_output.environment.path.clone(),
                staged.project_dir.join(&ctx.options.sources),
            )
        };

        let output = run_assemble(AssembleInput {
            options: &options,
            workspace: &workspace,
            environment: &environment,
            sources: &sources,
        })
        .inspect_err(|e| log_task_error(&build_id, task_name, e))?;

        tracing::info!(
            build_id = %build_id,
            rootfs = %output.rootfs.display(),
            layers = output.layer_paths.len(),
            "Runtime filesystem assembled"
        );

        ctx.lock().await.rootfs_output = Some(output);
        Ok(())
    }

    fn name(&self) -> &str {
        "assemble_rootfs"
    }

    fn requires(&self) -> &[ArtifactKind] {
        &[ArtifactKind::StagedInputs, ArtifactKind::ResolvedEnvironment]
    }

    fn produces(&self) -> &[ArtifactKind] {
        &[ArtifactKind::Rootfs]
    }
}

fn run_assemble(input: AssembleInput<'_>) -> BuildliteResult<RootfsOutput> {
    // The builder's export must be a complete environment, not a partial one.
    ResolvedEnvironment::open(input.environment).map_err(|e| {
        BuildliteError::Layout(format!(
            "resolved environment missing at {}: {}",
            input.environment.display(),
            e
        ))
    })?;
    if !input.sources.is_dir() {
        return Err(BuildliteError::Layout(format!(
            "source tree missing at {}",
            input.sources.display()
        )));
    }

    let rootfs = input.workspace.runtime_rootfs();
    let staging = sibling_path(&rootfs, "staging");
    let result = populate(&input, &staging);
    let layer_paths = match result {
        Ok(paths) => paths,
        Err(e) => {
            let _ = std::fs::remove_dir_all(&staging);
            return Err(e);
        }
    };
    publish_dir(&staging, &rootfs)?;

    Ok(RootfsOutput { rootfs, layer_paths })
}

fn populate(input: &AssembleInput<'_>, root: &Path) -> BuildliteResult<Vec<(String, String)>> {
    let options = input.options;
    let at = |image_path: &str| -> PathBuf { root.join(image_path.trim_start_matches('/')) };

    let env_stats = copy_tree(input.environment, &at(&options.env_dir), &|_| true)
        .map_err(|e| BuildliteError::Layout(format!("Failed to copy resolved environment: {}", e)))?;
    let src_stats = copy_tree(input.sources, &at(&options.source_dir), &is_source_entry)
        .map_err(|e| BuildliteError::Layout(format!("Failed to copy source tree: {}", e)))?;
    tracing::debug!(
        env_files = env_stats.files,
        source_files = src_stats.files,
        "Copied environment and sources"
    );

    let mut layers = vec![
        ("environment".to_string(), options.env_dir.clone()),
        ("source".to_string(), options.source_dir.clone()),
    ];

    if let Some(binary) = &options.supervisor_binary {
        let dest = at(defaults::SUPERVISOR_PATH);
        if let Some(parent) = dest.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::copy(binary, &dest).map_err(|e| {
            BuildliteError::Layout(format!(
                "Failed to copy supervisor binary {}: {}",
                binary.display(),
                e
            ))
        })?;
        std::fs::set_permissions(&dest, std::fs::Permissions::from_mode(0o755))?;

        let dir = Path::new(defaults::SUPERVISOR_PATH)
            .parent()
            .map(|p| p.to_string_lossy().into_owned())
            .unwrap_or_else(|| "/".into());
        layers.push(("supervisor".to_string(), dir));
    }

    Ok(layers)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::install::EnvironmentRecord;
    use std::fs;
    use tempfile::TempDir;

    fn record() -> EnvironmentRecord {
        EnvironmentRecord {
            installer: "index".into(),
            python_version: "3.12.0".into(),
            packages: vec![],
            project: None,
            extras: vec![],
            lock_hash: "sha256:x".into(),
            closure_digest: "y".into(),
        }
    }

    #[test]
    fn test_assemble_copies_env_and_sources() {
        let tmp = TempDir::new().unwrap();
        let env = tmp.path().join("venv");
        fs::create_dir_all(env.join("bin")).unwrap();
        record().write(&env).unwrap();
        let src = tmp.path().join("src");
        fs::create_dir_all(src.join("quarto_backend")).unwrap();
        fs::write(src.join("quarto_backend/main.py"), "app = None\n").unwrap();

        let workspace = BuildWorkspace::new(tmp.path().join("ws"));
        let options = BuildOptions::default();
        let output = run_assemble(AssembleInput {
            options: &options,
            workspace: &workspace,
            environment: &env,
            sources: &src,
        })
        .unwrap();

        assert!(output.rootfs.join("project/.venv/bin").is_dir());
        assert!(output.rootfs.join("project/src/quarto_backend/main.py").is_file());
        assert_eq!(output.layer_paths.len(), 2);
    }

    #[test]
    fn test_missing_environment_is_layout_error() {
        let tmp = TempDir::new().unwrap();
        let src = tmp.path().join("src");
        fs::create_dir_all(&src).unwrap();

        let workspace = BuildWorkspace::new(tmp.path().join("ws"));
        let options = BuildOptions::default();
        let err = run_assemble(AssembleInput {
            options: &options,
            workspace: &workspace,
            environment: &tmp.path().join("missing"),
            sources: &src,
        })
        .unwrap_err();
        assert!(matches!(err, BuildliteError::Layout(_)));
        assert!(!workspace.runtime_rootfs().exists());
    }
}

//! Task: Stage inputs.
//!
//! Copies the manifest, lockfile, README and source tree into the builder
//! workdir. The originals are only read.

use super::{TaskCtx, log_task_error, task_start};
use crate::build::types::{StagedInput, StagedOutput};
use crate::fs::{copy_tree, digest_tree, is_source_entry};
use crate::pipeline::{ArtifactKind, PipelineTask};
use crate::project::{Lockfile, ProjectManifest};
use async_trait::async_trait;
use buildlite_shared::errors::{BuildliteError, BuildliteResult};
use std::path::Path;

pub struct StageInputsTask;

#[async_trait]
impl PipelineTask<TaskCtx> for StageInputsTask {
    async fn run(self: Box<Self>, ctx: TaskCtx) -> BuildliteResult<()> {
        let task_name = self.name();
        let build_id = task_start(&ctx, task_name).await;

        let (options, project_dir, staged_dir) = {
            let ctx = ctx.lock().await;
            (
                ctx.options.clone(),
                ctx.project_dir.clone(),
                ctx.workspace.builder_project(),
            )
        };

        let output = run_stage_inputs(StagedInput {
            options: &options,
            project_dir: &project_dir,
            staged_dir: &staged_dir,
        })
        .inspect_err(|e| log_task_error(&build_id, task_name, e))?;

        tracing::info!(
            build_id = %build_id,
            project = %output.manifest.name,
            locked = output.lock.packages.len(),
            "Inputs staged"
        );

        ctx.lock().await.staged_output = Some(output);
        Ok(())
    }

    fn name(&self) -> &str {
        "stage_inputs"
    }

    fn produces(&self) -> &[ArtifactKind] {
        &[ArtifactKind::StagedInputs]
    }
}

fn run_stage_inputs(input: StagedInput<'_>) -> BuildliteResult<StagedOutput> {
    let options = input.options;
    let staged = input.staged_dir;
    std::fs::create_dir_all(staged).map_err(|e| {
        BuildliteError::Storage(format!("Failed to create {}: {}", staged.display(), e))
    })?;

    let manifest_src = input.project_dir.join(&options.manifest);
    let manifest_dst = staged.join(file_name(&options.manifest)?);
    copy_input(&manifest_src, &manifest_dst, BuildliteError::Manifest)?;

    let lock_src = input.project_dir.join(&options.lockfile);
    let lock_dst = staged.join(file_name(&options.lockfile)?);
    copy_input(&lock_src, &lock_dst, BuildliteError::Lockfile)?;

    if let Some(readme) = &options.readme {
        let readme_src = input.project_dir.join(readme);
        if readme_src.is_file() {
            std::fs::copy(&readme_src, staged.join(file_name(readme)?))?;
        } else {
            tracing::debug!(path = %readme_src.display(), "No README to stage");
        }
    }

    let sources_src = input.project_dir.join(&options.sources);
    if !sources_src.is_dir() {
        return Err(BuildliteError::Layout(format!(
            "source tree {} does not exist",
            sources_src.display()
        )));
    }
    let sources_dst = staged.join(&options.sources);
    let stats = copy_tree(&sources_src, &sources_dst, &is_source_entry)?;
    tracing::debug!(
        files = stats.files,
        bytes = stats.bytes,
        "Source tree staged"
    );

    let manifest = ProjectManifest::load(&manifest_dst)?;
    let lock = Lockfile::load(&lock_dst)?;
    let source_digest = digest_tree(&sources_dst)?;

    Ok(StagedOutput {
        project_dir: staged.to_path_buf(),
        manifest,
        lock,
        source_digest,
    })
}

fn file_name(path: &Path) -> BuildliteResult<&std::ffi::OsStr> {
    path.file_name().ok_or_else(|| {
        BuildliteError::Config(format!("{} does not name a file", path.display()))
    })
}

fn copy_input(
    src: &Path,
    dst: &Path,
    err: impl Fn(String) -> BuildliteError,
) -> BuildliteResult<()> {
    if !src.is_file() {
        return Err(err(format!("{} not found", src.display())));
    }
    std::fs::copy(src, dst)
        .map(|_| ())
        .map_err(|e| err(format!("Failed to stage {}: {}", src.display(), e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::BuildOptions;
    use std::fs;
    use tempfile::TempDir;

    const PYPROJECT: &str = r#"
[project]
name = "demo"
version = "0.1.0"
dependencies = []
"#;

    const LOCK: &str = r#"
[metadata]
groups = ["default"]
lock_version = "4.5.0"
content_hash = "sha256:x"
"#;

    #[test]
    fn test_stage_inputs_copies_without_mutating() {
        let tmp = TempDir::new().unwrap();
        let project = tmp.path().join("project");
        fs::create_dir_all(project.join("src/demo/__pycache__")).unwrap();
        fs::create_dir_all(project.join("src/.git")).unwrap();
        fs::write(project.join("src/demo/__init__.py"), "").unwrap();
        fs::write(project.join("src/demo/__pycache__/x.pyc"), "").unwrap();
        fs::write(project.join("pyproject.toml"), PYPROJECT).unwrap();
        fs::write(project.join("pdm.lock"), LOCK).unwrap();

        let staged = tmp.path().join("staged");
        let options = BuildOptions::default();
        let output = run_stage_inputs(StagedInput {
            options: &options,
            project_dir: &project,
            staged_dir: &staged,
        })
        .unwrap();

        assert_eq!(output.manifest.name.as_str(), "demo");
        assert!(staged.join("pdm.lock").is_file());
        assert!(staged.join("src/demo/__init__.py").is_file());
        assert!(!staged.join("src/demo/__pycache__").exists());
        assert!(!staged.join("src/.git").exists());
        assert!(!staged.join("README.md").exists());
        assert!(project.join("src/demo/__pycache__/x.pyc").exists());
    }

    #[test]
    fn test_missing_lockfile() {
        let tmp = TempDir::new().unwrap();
        let project = tmp.path().join("project");
        fs::create_dir_all(project.join("src")).unwrap();
        fs::write(project.join("pyproject.toml"), PYPROJECT).unwrap();

        let options = BuildOptions::default();
        let err = run_stage_inputs(StagedInput {
            options: &options,
            project_dir: &project,
            staged_dir: &tmp.path().join("staged"),
        })
        .unwrap_err();
        assert!(matches!(err, BuildliteError::Lockfile(_)));
    }
}

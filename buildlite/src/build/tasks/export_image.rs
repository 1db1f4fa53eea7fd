//! Task: Image export.
//!
//! Archives each layer path of the rootfs as a deterministic layer and
//! writes the OCI image layout to the output directory, on top of the
//! base image layers when a base layout is configured.

use super::{TaskCtx, log_task_error, task_start};
use crate::build::types::{ProcessConfig, RootfsOutput};
use crate::image::{BaseImage, ExportRequest, ImageLayout, LayerBlob, build_layer, export_layout};
use crate::pipeline::{ArtifactKind, PipelineTask};
use crate::runtime::BuildOptions;
use async_trait::async_trait;
use buildlite_shared::errors::{BuildliteError, BuildliteResult};
use std::path::Path;

pub struct ExportImageTask;

#[async_trait]
impl PipelineTask<TaskCtx> for ExportImageTask {
    async fn run(self: Box<Self>, ctx: TaskCtx) -> BuildliteResult<()> {
        let task_name = self.name();
        let build_id = task_start(&ctx, task_name).await;

        let (options, rootfs, process, project_dir, out_dir) = {
            let ctx = ctx.lock().await;
            if !ctx.minimal_checked {
                return Err(BuildliteError::Internal(
                    "verify_minimal task must run first".into(),
                ));
            }
            let rootfs = ctx.rootfs_output.clone().ok_or_else(|| {
                BuildliteError::Internal("assemble_rootfs task must run first".into())
            })?;
            let process = ctx.process_output.clone().ok_or_else(|| {
                BuildliteError::Internal("process_config task must run first".into())
            })?;
            (
                ctx.options.clone(),
                rootfs,
                process,
                ctx.project_dir.clone(),
                ctx.out_dir.clone(),
            )
        };

        // Layer compression is CPU-bound.
        let layout = tokio::task::spawn_blocking(move || {
            run_export(&options, &rootfs, &process, &project_dir, &out_dir)
        })
        .await
        .map_err(|e| BuildliteError::Internal(format!("export task panicked: {}", e)))
        .and_then(|r| r)
        .inspect_err(|e| log_task_error(&build_id, task_name, e))?;

        ctx.lock().await.image_output = Some(layout);
        Ok(())
    }

    fn name(&self) -> &str {
        "export_image"
    }

    fn requires(&self) -> &[ArtifactKind] {
        &[
            ArtifactKind::Rootfs,
            ArtifactKind::ProcessConfig,
            ArtifactKind::MinimalRootfs,
        ]
    }

    fn produces(&self) -> &[ArtifactKind] {
        &[ArtifactKind::ImageLayout]
    }
}

fn run_export(
    options: &BuildOptions,
    rootfs: &RootfsOutput,
    process: &ProcessConfig,
    project_dir: &Path,
    out_dir: &Path,
) -> BuildliteResult<ImageLayout> {
    let base = open_base(options, project_dir)?;
    let mtime = u64::try_from(options.source_date_epoch).unwrap_or(0);
    let layers: Vec<LayerBlob> = rootfs
        .layer_paths
        .iter()
        .map(|(name, image_path)| build_layer(name, &rootfs.rootfs, image_path, mtime))
        .collect::<BuildliteResult<_>>()?;

    export_layout(
        ExportRequest {
            layers,
            process,
            arch: &options.arch,
            base_image: &options.base_image,
            base: base.as_ref(),
            created: options.source_date_epoch,
            reference: Some("latest"),
        },
        out_dir,
    )
}

fn open_base(options: &BuildOptions, project_dir: &Path) -> BuildliteResult<Option<BaseImage>> {
    let Some(layout) = &options.base_layout else {
        tracing::warn!(
            base_image = %options.base_image,
            "No base_layout configured; the image holds only the build layers"
        );
        return Ok(None);
    };

    let base = BaseImage::open(&project_dir.join(layout), &options.arch)?;
    let expected = options.python_full_version()?;
    if let Some(version) = base.python_version()
        && minor_version(version) != minor_version(&expected)
    {
        return Err(BuildliteError::Config(format!(
            "base layout {} runs Python {} but the environment was built for {}",
            layout.display(),
            version,
            expected
        )));
    }
    Ok(Some(base))
}

fn minor_version(version: &str) -> String {
    version.split('.').take(2).collect::<Vec<_>>().join(".")
}

//! OCI image layout export.
//!
//! ```text
//! <out>/
//!   oci-layout
//!   index.json
//!   blobs/sha256/<config>, <manifest>, <layers...>
//! ```
//!
//! With a base layout the base layers are copied in below the build's
//! layers and the base environment is merged into the config. Without one
//! the layout holds only the build's layers and the base is recorded by
//! name in the annotations.

use super::base::BaseImage;
use super::inspect::LAYER_PATH_ANNOTATION;
use super::layer::{LayerBlob, LayerDescriptor, sha256_digest};
use super::ImageLayout;
use crate::build::ProcessConfig;
use crate::fs::{publish_dir, sibling_path};
use crate::runtime::constants::labels;
use buildlite_shared::errors::{BuildliteError, BuildliteResult};
use chrono::{DateTime, Utc};
use oci_spec::image::{
    Arch, ConfigBuilder, Descriptor, DescriptorBuilder, ImageConfigurationBuilder,
    ImageIndexBuilder, ImageManifestBuilder, MediaType, Os, PlatformBuilder, RootFsBuilder,
    SCHEMA_VERSION,
};
use serde::Serialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::str::FromStr;

const OCI_LAYOUT_VERSION: &str = "1.0.0";
const REF_NAME_ANNOTATION: &str = "org.opencontainers.image.ref.name";

/// Everything written into the image config and manifest.
pub struct ExportRequest<'a> {
    pub layers: Vec<LayerBlob>,
    pub process: &'a ProcessConfig,
    pub arch: &'a str,
    pub base_image: &'a str,
    /// Lower layers and environment of the base image.
    pub base: Option<&'a BaseImage>,
    /// Seconds since the epoch.
    pub created: i64,
    /// Tag recorded as the index entry's ref name.
    pub reference: Option<&'a str>,
}

pub fn parse_arch(arch: &str) -> BuildliteResult<Arch> {
    match arch {
        "amd64" | "x86_64" => Ok(Arch::Amd64),
        "arm64" | "aarch64" => Ok(Arch::ARM64),
        other => Err(BuildliteError::Config(format!(
            "unsupported image architecture '{}'",
            other
        ))),
    }
}

/// `python_platform machine` for marker evaluation.
pub fn machine_for_arch(arch: &str) -> &'static str {
    match arch {
        "arm64" | "aarch64" => "aarch64",
        _ => "x86_64",
    }
}

pub fn created_timestamp(epoch: i64) -> BuildliteResult<String> {
    let created: DateTime<Utc> = DateTime::from_timestamp(epoch, 0).ok_or_else(|| {
        BuildliteError::Config(format!("source_date_epoch {} is out of range", epoch))
    })?;
    Ok(created.to_rfc3339_opts(chrono::SecondsFormat::Secs, true))
}

/// Write the layout into `dest`, replacing it only when complete.
pub fn export_layout(request: ExportRequest<'_>, dest: &Path) -> BuildliteResult<ImageLayout> {
    let staging = sibling_path(dest, "export");
    match write_layout(request, &staging) {
        Ok(mut layout) => {
            publish_dir(&staging, dest)?;
            layout.path = dest.to_path_buf();
            tracing::info!(
                path = %dest.display(),
                manifest = %layout.manifest_digest,
                layers = layout.layers.len(),
                "Image layout exported"
            );
            Ok(layout)
        }
        Err(e) => {
            if staging.exists()
                && let Err(cleanup) = std::fs::remove_dir_all(&staging)
            {
                tracing::warn!(path = %staging.display(), "Failed to remove export staging: {}", cleanup);
            }
            Err(e)
        }
    }
}

fn write_layout(request: ExportRequest<'_>, root: &Path) -> BuildliteResult<ImageLayout> {
    let blobs = root.join("blobs").join("sha256");
    std::fs::create_dir_all(&blobs)?;

    let arch = parse_arch(request.arch)?;
    let created = created_timestamp(request.created)?;

    let mut layer_descriptors: Vec<LayerDescriptor> = Vec::new();
    let mut oci_layers: Vec<Descriptor> = Vec::new();
    let mut diff_ids: Vec<String> = Vec::new();
    if let Some(base) = request.base {
        for layer in &base.layers {
            base.copy_layer(layer, &blobs)?;
            oci_layers.push(layer.clone());
        }
        diff_ids.extend(base.diff_ids.iter().cloned());
    }
    for layer in &request.layers {
        write_blob(&blobs, &layer.descriptor.digest, &layer.bytes)?;
        let mut annotations = HashMap::new();
        annotations.insert(
            LAYER_PATH_ANNOTATION.to_string(),
            layer.descriptor.image_path.clone(),
        );
        oci_layers.push(descriptor(
            MediaType::ImageLayerGzip,
            &layer.descriptor.digest,
            layer.descriptor.size,
            Some(annotations),
        )?);
        diff_ids.push(layer.descriptor.diff_id.clone());
        layer_descriptors.push(layer.descriptor.clone());
    }

    let process = request.process;
    let mut image_labels: HashMap<String, String> = process
        .labels
        .iter()
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect();
    image_labels.insert(labels::BASE_NAME.to_string(), request.base_image.to_string());
    if !process.healthcheck.is_empty() {
        image_labels.insert(
            labels::HEALTHCHECK.to_string(),
            serde_json::to_string(&process.healthcheck)?,
        );
    }

    let mut config = ConfigBuilder::default()
        .env(merge_env(
            request.base.map(|b| b.env.as_slice()).unwrap_or_default(),
            process.env_strings(),
        ))
        .entrypoint(process.entrypoint.clone())
        .working_dir(process.working_dir.clone())
        .exposed_ports(process.exposed_ports.clone())
        .labels(image_labels)
        .stop_signal(process.stop_signal.clone());
    if !process.cmd.is_empty() {
        config = config.cmd(process.cmd.clone());
    }
    let config = config.build().map_err(oci_err)?;

    let rootfs = RootFsBuilder::default()
        .typ("layers")
        .diff_ids(diff_ids)
        .build()
        .map_err(oci_err)?;

    let image_config = ImageConfigurationBuilder::default()
        .created(created.clone())
        .architecture(arch.clone())
        .os(Os::Linux)
        .config(config)
        .rootfs(rootfs)
        .build()
        .map_err(oci_err)?;
    let config_bytes = canonical_json(&image_config)?;
    let config_digest = sha256_digest(&config_bytes);
    write_blob(&blobs, &config_digest, &config_bytes)?;

    let mut manifest_annotations = HashMap::new();
    manifest_annotations.insert(labels::BASE_NAME.to_string(), request.base_image.to_string());
    manifest_annotations.insert(labels::CREATED.to_string(), created);
    if let Some(base) = request.base {
        manifest_annotations.insert(labels::BASE_DIGEST.to_string(), base.manifest_digest.clone());
    }

    let manifest = ImageManifestBuilder::default()
        .schema_version(SCHEMA_VERSION)
        .media_type(MediaType::ImageManifest)
        .config(descriptor(
            MediaType::ImageConfig,
            &config_digest,
            config_bytes.len() as u64,
            None,
        )?)
        .layers(oci_layers)
        .annotations(manifest_annotations)
        .build()
        .map_err(oci_err)?;
    let manifest_bytes = canonical_json(&manifest)?;
    let manifest_digest = sha256_digest(&manifest_bytes);
    write_blob(&blobs, &manifest_digest, &manifest_bytes)?;

    let platform = PlatformBuilder::default()
        .architecture(arch)
        .os(Os::Linux)
        .build()
        .map_err(oci_err)?;
    let mut manifest_descriptor = descriptor(
        MediaType::ImageManifest,
        &manifest_digest,
        manifest_bytes.len() as u64,
        request.reference.map(|r| {
            let mut annotations = HashMap::new();
            annotations.insert(REF_NAME_ANNOTATION.to_string(), r.to_string());
            annotations
        }),
    )?;
    manifest_descriptor.set_platform(Some(platform));

    let index = ImageIndexBuilder::default()
        .schema_version(SCHEMA_VERSION)
        .media_type(MediaType::ImageIndex)
        .manifests(vec![manifest_descriptor])
        .build()
        .map_err(oci_err)?;
    std::fs::write(root.join("index.json"), canonical_json(&index)?)?;
    std::fs::write(
        root.join("oci-layout"),
        serde_json::to_vec(&serde_json::json!({ "imageLayoutVersion": OCI_LAYOUT_VERSION }))?,
    )?;

    Ok(ImageLayout {
        path: PathBuf::from(root),
        manifest_digest,
        config_digest,
        layers: layer_descriptors,
        base_digest: request.base.map(|b| b.manifest_digest.clone()),
    })
}

/// Base entries the process does not set, then the process entries.
fn merge_env(base: &[String], process: Vec<String>) -> Vec<String> {
    let key = |kv: &str| kv.split_once('=').map_or(kv, |(k, _)| k).to_string();
    let owned: std::collections::HashSet<String> = process.iter().map(|kv| key(kv)).collect();
    base.iter()
        .filter(|kv| !owned.contains(&key(kv)))
        .cloned()
        .chain(process)
        .collect()
}

fn descriptor(
    media_type: MediaType,
    digest: &str,
    size: u64,
    annotations: Option<HashMap<String, String>>,
) -> BuildliteResult<Descriptor> {
    let digest = oci_spec::image::Digest::from_str(digest).map_err(oci_err)?;
    let mut builder = DescriptorBuilder::default()
        .media_type(media_type)
        .digest(digest)
        .size(size);
    if let Some(annotations) = annotations {
        builder = builder.annotations(annotations);
    }
    builder.build().map_err(oci_err)
}

/// JSON with sorted keys; the oci-spec types keep maps in `HashMap`s.
fn canonical_json<T: Serialize>(value: &T) -> BuildliteResult<Vec<u8>> {
    let value = serde_json::to_value(value)?;
    Ok(serde_json::to_vec(&value)?)
}

/// Path of a blob inside a layout.
pub fn blob_path(layout: &Path, digest: &str) -> BuildliteResult<PathBuf> {
    let hex = digest
        .strip_prefix("sha256:")
        .filter(|h| h.len() == 64 && h.chars().all(|c| c.is_ascii_hexdigit()))
        .ok_or_else(|| BuildliteError::Image(format!("unsupported digest '{}'", digest)))?;
    Ok(layout.join("blobs").join("sha256").join(hex))
}

fn write_blob(blobs: &Path, digest: &str, bytes: &[u8]) -> BuildliteResult<()> {
    let hex = digest.trim_start_matches("sha256:");
    std::fs::write(blobs.join(hex), bytes).map_err(|e| {
        BuildliteError::Image(format!("Failed to write blob {}: {}", digest, e))
    })
}

fn oci_err(e: impl std::fmt::Display) -> BuildliteError {
    BuildliteError::Image(e.to_string())
}

//! Base image read from a local OCI image layout.
//!
//! The layout is what `skopeo copy docker://python:3.12-slim oci:<dir>`
//! writes. A multi-platform index is resolved to the manifest for the
//! build architecture.

use super::export::{blob_path, parse_arch};
use super::inspect::read_blob;
use buildlite_shared::errors::{BuildliteError, BuildliteResult};
use oci_spec::image::{Descriptor, ImageConfiguration, ImageIndex, ImageManifest, MediaType};
use sha2::{Digest, Sha256};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

const DOCKER_LAYER_GZIP: &str = "application/vnd.docker.image.rootfs.diff.tar.gzip";
const DOCKER_MANIFEST_LIST: &str = "application/vnd.docker.distribution.manifest.list.v2+json";

#[derive(Debug, Clone)]
pub struct BaseImage {
    pub path: PathBuf,
    pub manifest_digest: String,
    /// Layer descriptors, lowest first.
    pub layers: Vec<Descriptor>,
    pub diff_ids: Vec<String>,
    /// `KEY=value` entries of the base config.
    pub env: Vec<String>,
}

impl BaseImage {
    /// Open the layout at `path` and select the manifest for `arch`.
    pub fn open(path: &Path, arch: &str) -> BuildliteResult<Self> {
        let index_bytes = std::fs::read(path.join("index.json")).map_err(|e| {
            BuildliteError::Image(format!(
                "base layout {} has no index.json: {}",
                path.display(),
                e
            ))
        })?;
        let index: ImageIndex = serde_json::from_slice(&index_bytes)?;
        let manifest_descriptor = select_manifest(path, &index, arch)?;
        let manifest_digest = manifest_descriptor.digest().to_string();

        let manifest: ImageManifest = serde_json::from_slice(&read_blob(path, &manifest_digest)?)?;
        let config: ImageConfiguration =
            serde_json::from_slice(&read_blob(path, &manifest.config().digest().to_string())?)?;

        let diff_ids = config.rootfs().diff_ids().clone();
        if diff_ids.len() != manifest.layers().len() {
            return Err(BuildliteError::Image(format!(
                "base image {} lists {} layers but {} diff_ids",
                manifest_digest,
                manifest.layers().len(),
                diff_ids.len()
            )));
        }
        for layer in manifest.layers() {
            if !is_supported_layer(layer.media_type()) {
                return Err(BuildliteError::Image(format!(
                    "base layer {} has unsupported media type {}",
                    layer.digest(),
                    layer.media_type()
                )));
            }
            if !blob_path(path, &layer.digest().to_string())?.is_file() {
                return Err(BuildliteError::Image(format!(
                    "base layer {} is missing from {}",
                    layer.digest(),
                    path.display()
                )));
            }
        }

        let env = config
            .config()
            .as_ref()
            .and_then(|c| c.env().clone())
            .unwrap_or_default();

        tracing::debug!(
            path = %path.display(),
            manifest = %manifest_digest,
            layers = manifest.layers().len(),
            "Base image layout opened"
        );

        Ok(Self {
            path: path.to_path_buf(),
            manifest_digest,
            layers: manifest.layers().clone(),
            diff_ids,
            env,
        })
    }

    pub fn env_var(&self, key: &str) -> Option<&str> {
        self.env.iter().find_map(|kv| {
            kv.split_once('=')
                .filter(|(k, _)| *k == key)
                .map(|(_, v)| v)
        })
    }

    /// Interpreter version the official `python:*` images declare.
    pub fn python_version(&self) -> Option<&str> {
        self.env_var("PYTHON_VERSION")
    }

    /// Copy one layer blob into `blobs`, verifying its digest on the way.
    pub fn copy_layer(&self, layer: &Descriptor, blobs: &Path) -> BuildliteResult<()> {
        let digest = layer.digest().to_string();
        let source = blob_path(&self.path, &digest)?;
        let file_name = digest.trim_start_matches("sha256:");
        let copy_err =
            |e: std::io::Error| BuildliteError::Image(format!("Failed to copy base layer {}: {}", digest, e));

        let mut reader = std::fs::File::open(&source).map_err(copy_err)?;
        let mut writer = std::fs::File::create(blobs.join(file_name)).map_err(copy_err)?;
        let mut hasher = Sha256::new();
        let mut buf = vec![0u8; 64 * 1024];
        loop {
            let n = reader.read(&mut buf).map_err(copy_err)?;
            if n == 0 {
                break;
            }
            hasher.update(&buf[..n]);
            writer.write_all(&buf[..n]).map_err(copy_err)?;
        }

        let actual = format!("sha256:{}", hex::encode(hasher.finalize()));
        if actual != digest {
            return Err(BuildliteError::Image(format!(
                "base layer {} is corrupt (content hashes to {})",
                digest, actual
            )));
        }
        Ok(())
    }
}

fn is_supported_layer(media_type: &MediaType) -> bool {
    match media_type {
        MediaType::ImageLayer | MediaType::ImageLayerGzip => true,
        MediaType::Other(other) => other == DOCKER_LAYER_GZIP,
        _ => false,
    }
}

fn is_index(media_type: &MediaType) -> bool {
    match media_type {
        MediaType::ImageIndex => true,
        MediaType::Other(other) => other == DOCKER_MANIFEST_LIST,
        _ => false,
    }
}

/// Walk nested indexes down to the image manifest for `arch`.
fn select_manifest(layout: &Path, index: &ImageIndex, arch: &str) -> BuildliteResult<Descriptor> {
    let wanted = parse_arch(arch)?;
    let descriptor = index
        .manifests()
        .iter()
        .find(|d| {
            d.platform()
                .as_ref()
                .is_none_or(|p| *p.architecture() == wanted)
        })
        .ok_or_else(|| {
            BuildliteError::Image(format!(
                "base layout {} has no manifest for {}",
                layout.display(),
                arch
            ))
        })?;

    if is_index(descriptor.media_type()) {
        let nested: ImageIndex =
            serde_json::from_slice(&read_blob(layout, &descriptor.digest().to_string())?)?;
        return select_manifest(layout, &nested, arch);
    }
    Ok(descriptor.clone())
}

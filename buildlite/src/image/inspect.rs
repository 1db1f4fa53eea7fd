//! Read back an exported image layout.

use super::export::blob_path;
use super::layer::sha256_digest;
use super::minimal::{Violation, check_paths};
use crate::runtime::constants::labels;
use buildlite_shared::errors::{BuildliteError, BuildliteResult};
use flate2::read::GzDecoder;
use oci_spec::image::{ImageConfiguration, ImageIndex, ImageManifest, MediaType};
use std::io::Read;
use std::path::{Path, PathBuf};

/// Set on the layers a build adds; base layers carry no annotation.
pub(super) const LAYER_PATH_ANNOTATION: &str = "io.buildlite.layer.path";

#[derive(Debug, Clone)]
pub struct InspectedLayer {
    pub digest: String,
    pub size: u64,
    /// Image path the layer was archived from; `None` for base layers.
    pub image_path: Option<String>,
    pub entries: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct InspectedImage {
    pub path: PathBuf,
    pub manifest_digest: String,
    pub manifest: ImageManifest,
    pub config: ImageConfiguration,
    pub layers: Vec<InspectedLayer>,
}

impl InspectedImage {
    pub fn env(&self) -> Vec<String> {
        self.config
            .config()
            .as_ref()
            .and_then(|c| c.env().clone())
            .unwrap_or_default()
    }

    pub fn env_var(&self, key: &str) -> Option<String> {
        self.env().into_iter().find_map(|kv| {
            kv.split_once('=')
                .filter(|(k, _)| *k == key)
                .map(|(_, v)| v.to_string())
        })
    }

    pub fn entrypoint(&self) -> Vec<String> {
        self.config
            .config()
            .as_ref()
            .and_then(|c| c.entrypoint().clone())
            .unwrap_or_default()
    }

    pub fn exposed_ports(&self) -> Vec<String> {
        self.config
            .config()
            .as_ref()
            .and_then(|c| c.exposed_ports().clone())
            .unwrap_or_default()
    }

    pub fn label(&self, key: &str) -> Option<String> {
        self.config
            .config()
            .as_ref()
            .and_then(|c| c.labels().as_ref())
            .and_then(|l| l.get(key).cloned())
    }

    pub fn base_image(&self) -> Option<String> {
        self.label(labels::BASE_NAME)
    }

    pub fn base_digest(&self) -> Option<String> {
        self.manifest
            .annotations()
            .as_ref()
            .and_then(|a| a.get(labels::BASE_DIGEST).cloned())
    }

    /// Every path across all layers.
    pub fn all_entries(&self) -> impl Iterator<Item = &str> {
        self.layers
            .iter()
            .flat_map(|l| l.entries.iter().map(String::as_str))
    }

    /// Violations in the layers the build added. The base image is
    /// trusted as given.
    pub fn minimality_violations(&self) -> Vec<Violation> {
        check_paths(
            self.layers
                .iter()
                .filter(|l| l.image_path.is_some())
                .flat_map(|l| l.entries.iter().map(String::as_str)),
        )
    }
}

/// Read index, manifest, config and layer listings, verifying blob digests.
pub fn inspect_layout(path: &Path) -> BuildliteResult<InspectedImage> {
    let index_bytes = std::fs::read(path.join("index.json")).map_err(|e| {
        BuildliteError::Image(format!(
            "{} is not an image layout: {}",
            path.display(),
            e
        ))
    })?;
    let index: ImageIndex = serde_json::from_slice(&index_bytes)?;
    let manifest_descriptor = index.manifests().first().ok_or_else(|| {
        BuildliteError::Image(format!("{}/index.json lists no manifests", path.display()))
    })?;
    let manifest_digest = manifest_descriptor.digest().to_string();

    let manifest_bytes = read_blob(path, &manifest_digest)?;
    let manifest: ImageManifest = serde_json::from_slice(&manifest_bytes)?;

    let config_bytes = read_blob(path, &manifest.config().digest().to_string())?;
    let config: ImageConfiguration = serde_json::from_slice(&config_bytes)?;

    let mut layers = Vec::new();
    for layer in manifest.layers() {
        let digest = layer.digest().to_string();
        let bytes = read_blob(path, &digest)?;
        let gzip = !matches!(layer.media_type(), MediaType::ImageLayer);
        layers.push(InspectedLayer {
            size: bytes.len() as u64,
            image_path: layer
                .annotations()
                .as_ref()
                .and_then(|a| a.get(LAYER_PATH_ANNOTATION).cloned()),
            entries: list_entries(&bytes, gzip, &digest)?,
            digest,
        });
    }

    Ok(InspectedImage {
        path: path.to_path_buf(),
        manifest_digest,
        manifest,
        config,
        layers,
    })
}

pub(super) fn read_blob(layout: &Path, digest: &str) -> BuildliteResult<Vec<u8>> {
    let path = blob_path(layout, digest)?;
    let bytes = std::fs::read(&path).map_err(|e| {
        BuildliteError::Image(format!("Failed to read blob {}: {}", digest, e))
    })?;
    let actual = sha256_digest(&bytes);
    if actual != digest {
        return Err(BuildliteError::Image(format!(
            "blob {} is corrupt (content hashes to {})",
            digest, actual
        )));
    }
    Ok(bytes)
}

fn list_entries(bytes: &[u8], gzip: bool, digest: &str) -> BuildliteResult<Vec<String>> {
    let layer_err =
        |e: std::io::Error| BuildliteError::Image(format!("Failed to read layer {}: {}", digest, e));

    let reader: Box<dyn Read + '_> = if gzip {
        Box::new(GzDecoder::new(bytes))
    } else {
        Box::new(bytes)
    };
    let mut archive = tar::Archive::new(reader);
    let mut entries = Vec::new();
    for entry in archive.entries().map_err(layer_err)? {
        let entry = entry.map_err(layer_err)?;
        let path = entry.path().map_err(layer_err)?;
        entries.push(path.to_string_lossy().trim_end_matches('/').to_string());
    }
    Ok(entries)
}

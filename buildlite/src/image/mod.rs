//! Runtime image output.
//!
//! - `base`: base image read from a local OCI layout
//! - `layer`: deterministic gzip tar layers
//! - `export`: OCI image layout writer
//! - `inspect`: reads a layout back for `buildlite inspect` and tests
//! - `minimal`: build-time files a runtime image must not contain

mod base;
mod export;
mod inspect;
mod layer;
mod minimal;

pub use base::BaseImage;
pub use export::{
    ExportRequest, blob_path, created_timestamp, export_layout, machine_for_arch, parse_arch,
};
pub use inspect::{InspectedImage, InspectedLayer, inspect_layout};
pub use layer::{LayerBlob, LayerDescriptor, build_layer, sha256_digest};
pub use minimal::{Violation, check_path, check_paths, check_rootfs, ensure_minimal};

use std::path::PathBuf;

/// The image layer set: an exported OCI layout.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageLayout {
    pub path: PathBuf,
    /// Digest of the image manifest, the image's identity.
    pub manifest_digest: String,
    pub config_digest: String,
    /// Layers this build added, above any base layers.
    pub layers: Vec<LayerDescriptor>,
    /// Manifest digest of the base image the layers were placed on.
    pub base_digest: Option<String>,
}

impl ImageLayout {
    pub fn layer_digests(&self) -> Vec<&str> {
        self.layers.iter().map(|l| l.digest.as_str()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::build::ProcessConfig;
    use serde_json::json;
    use std::collections::BTreeMap;
    use std::fs;
    use std::io::Read;
    use std::path::Path;
    use tempfile::TempDir;

    fn process() -> ProcessConfig {
        ProcessConfig {
            env: vec![
                ("PATH".into(), "/project/.venv/bin:/usr/bin".into()),
                ("PYTHONPATH".into(), "/project/src".into()),
            ],
            entrypoint: vec!["uvicorn".into(), "quarto_backend.main:app".into()],
            cmd: vec![],
            working_dir: "/project".into(),
            exposed_ports: vec!["8000/tcp".into()],
            stop_signal: "SIGTERM".into(),
            healthcheck: vec!["python".into(), "-c".into(), "pass".into()],
            labels: BTreeMap::from([("team".to_string(), "web".to_string())]),
        }
    }

    fn export(root: &Path, out: &Path) -> ImageLayout {
        export_on(root, out, None).unwrap()
    }

    fn export_on(root: &Path, out: &Path, base: Option<&BaseImage>) -> crate::BuildliteResult<ImageLayout> {
        let layers = vec![
            build_layer("environment", root, "/project/.venv", 0).unwrap(),
            build_layer("source", root, "/project/src", 0).unwrap(),
        ];
        export_layout(
            ExportRequest {
                layers,
                process: &process(),
                arch: "amd64",
                base_image: "python:3.12-slim",
                base,
                created: 0,
                reference: Some("latest"),
            },
            out,
        )
    }

    /// A two-layer `python:3.12-slim` stand-in: `/usr/local` gzipped and
    /// `/etc` as a plain tar, behind a two-platform index.
    fn base_layout(dir: &Path) -> (std::path::PathBuf, String) {
        let root = dir.join("base-rootfs");
        fs::create_dir_all(root.join("usr/local/bin")).unwrap();
        fs::write(root.join("usr/local/bin/python3.12"), "#!/bin/sh\n").unwrap();
        fs::create_dir_all(root.join("etc")).unwrap();
        fs::write(root.join("etc/os-release"), "ID=debian\n").unwrap();

        let layout = dir.join("base");
        let blobs = layout.join("blobs/sha256");
        fs::create_dir_all(&blobs).unwrap();
        let put = |bytes: &[u8]| {
            let digest = sha256_digest(bytes);
            fs::write(blobs.join(digest.trim_start_matches("sha256:")), bytes).unwrap();
            (digest, bytes.len())
        };

        let local = build_layer("local", &root, "/usr/local", 0).unwrap();
        let etc = build_layer("etc", &root, "/etc", 0).unwrap();
        let mut etc_tar = Vec::new();
        flate2::read::GzDecoder::new(etc.bytes.as_slice())
            .read_to_end(&mut etc_tar)
            .unwrap();

        let (local_digest, local_size) = put(&local.bytes);
        let (etc_digest, etc_size) = put(&etc_tar);
        let config = serde_json::to_vec(&json!({
            "architecture": "amd64",
            "os": "linux",
            "config": {
                "Env": [
                    "PATH=/usr/local/bin:/usr/bin",
                    "LANG=C.UTF-8",
                    "PYTHON_VERSION=3.12.4",
                ],
                "Cmd": ["python3"],
            },
            "rootfs": {
                "type": "layers",
                "diff_ids": [local.descriptor.diff_id, etc.descriptor.diff_id],
            },
        }))
        .unwrap();
        let (config_digest, config_size) = put(&config);
        let manifest = serde_json::to_vec(&json!({
            "schemaVersion": 2,
            "mediaType": "application/vnd.oci.image.manifest.v1+json",
            "config": {
                "mediaType": "application/vnd.oci.image.config.v1+json",
                "digest": config_digest,
                "size": config_size,
            },
            "layers": [
                {
                    "mediaType": "application/vnd.oci.image.layer.v1.tar+gzip",
                    "digest": local_digest,
                    "size": local_size,
                },
                {
                    "mediaType": "application/vnd.oci.image.layer.v1.tar",
                    "digest": etc_digest,
                    "size": etc_size,
                },
            ],
        }))
        .unwrap();
        let (manifest_digest, manifest_size) = put(&manifest);
        let descriptor = |arch: &str| {
            json!({
                "mediaType": "application/vnd.oci.image.manifest.v1+json",
                "digest": manifest_digest,
                "size": manifest_size,
                "platform": { "architecture": arch, "os": "linux" },
            })
        };
        let index = json!({
            "schemaVersion": 2,
            "manifests": [descriptor("s390x"), descriptor("amd64")],
        });
        fs::write(layout.join("index.json"), serde_json::to_vec(&index).unwrap()).unwrap();
        (layout, manifest_digest)
    }

    fn app_rootfs(dir: &Path) -> std::path::PathBuf {
        let root = dir.join("rootfs");
        fs::create_dir_all(root.join("project/.venv/bin")).unwrap();
        fs::create_dir_all(root.join("project/src")).unwrap();
        fs::write(root.join("project/src/app.py"), "x = 1\n").unwrap();
        root
    }

    #[test]
    fn test_export_and_inspect() {
        let tmp = TempDir::new().unwrap();
        let root = tmp.path().join("rootfs");
        fs::create_dir_all(root.join("project/.venv/bin")).unwrap();
        fs::create_dir_all(root.join("project/src/quarto_backend")).unwrap();
        fs::write(root.join("project/src/quarto_backend/main.py"), "app = None\n").unwrap();

        let out = tmp.path().join("image");
        let layout = export(&root, &out);
        assert_eq!(layout.path, out);
        assert_eq!(layout.layers.len(), 2);
        assert!(out.join("oci-layout").is_file());

        let image = inspect_layout(&out).unwrap();
        assert_eq!(image.manifest_digest, layout.manifest_digest);
        assert_eq!(image.env_var("PYTHONPATH").as_deref(), Some("/project/src"));
        assert_eq!(image.entrypoint()[0], "uvicorn");
        assert_eq!(image.base_image().as_deref(), Some("python:3.12-slim"));
        assert_eq!(image.label("team").as_deref(), Some("web"));
        assert!(image.exposed_ports().contains(&"8000/tcp".to_string()));
        assert!(image.all_entries().any(|p| p == "project/src/quarto_backend/main.py"));
        assert!(image.minimality_violations().is_empty());
    }

    #[test]
    fn test_export_is_reproducible() {
        let tmp = TempDir::new().unwrap();
        let root = tmp.path().join("rootfs");
        fs::create_dir_all(root.join("project/.venv/bin")).unwrap();
        fs::create_dir_all(root.join("project/src")).unwrap();
        fs::write(root.join("project/src/app.py"), "x = 1\n").unwrap();

        let first = export(&root, &tmp.path().join("a"));
        let second = export(&root, &tmp.path().join("b"));
        assert_eq!(first.manifest_digest, second.manifest_digest);
        assert_eq!(first.layer_digests(), second.layer_digests());
    }

    #[test]
    fn test_export_on_base_layout() {
        let tmp = TempDir::new().unwrap();
        let root = app_rootfs(tmp.path());
        let (layout_dir, base_digest) = base_layout(tmp.path());

        let base = BaseImage::open(&layout_dir, "amd64").unwrap();
        assert_eq!(base.manifest_digest, base_digest);
        assert_eq!(base.python_version(), Some("3.12.4"));
        assert_eq!(base.layers.len(), 2);

        let out = tmp.path().join("image");
        let layout = export_on(&root, &out, Some(&base)).unwrap();
        assert_eq!(layout.base_digest.as_deref(), Some(base_digest.as_str()));
        assert_eq!(layout.layers.len(), 2);

        let image = inspect_layout(&out).unwrap();
        assert_eq!(image.base_digest().as_deref(), Some(base_digest.as_str()));
        assert_eq!(image.layers.len(), 4);
        assert!(image.layers[0].image_path.is_none());
        assert!(image.layers[1].image_path.is_none());
        assert_eq!(image.layers[2].image_path.as_deref(), Some("/project/.venv"));
        assert!(image.all_entries().any(|p| p == "usr/local/bin/python3.12"));
        assert!(image.all_entries().any(|p| p == "etc/os-release"));

        let diff_ids = image.config.rootfs().diff_ids();
        assert_eq!(diff_ids.len(), 4);
        assert_eq!(diff_ids[..2], base.diff_ids[..]);

        let env = image.env();
        assert_eq!(env.iter().filter(|kv| kv.starts_with("PATH=")).count(), 1);
        assert_eq!(image.env_var("PATH").as_deref(), Some("/project/.venv/bin:/usr/bin"));
        assert_eq!(image.env_var("LANG").as_deref(), Some("C.UTF-8"));
        assert_eq!(image.env_var("PYTHON_VERSION").as_deref(), Some("3.12.4"));
        assert!(image.minimality_violations().is_empty());

        let without = export(&root, &tmp.path().join("bare"));
        assert!(without.base_digest.is_none());
        assert_ne!(without.manifest_digest, layout.manifest_digest);
    }

    #[test]
    fn test_base_layout_errors() {
        let tmp = TempDir::new().unwrap();
        let (layout_dir, _) = base_layout(tmp.path());

        let err = BaseImage::open(&layout_dir, "arm64").unwrap_err();
        assert!(err.to_string().contains("no manifest for arm64"));
        assert!(BaseImage::open(&tmp.path().join("missing"), "amd64").is_err());

        let base = BaseImage::open(&layout_dir, "amd64").unwrap();
        let blob = blob_path(&layout_dir, &base.layers[0].digest().to_string()).unwrap();
        fs::write(&blob, b"garbage").unwrap();
        let root = app_rootfs(tmp.path());
        let out = tmp.path().join("image");
        assert!(export_on(&root, &out, Some(&base)).is_err());
        assert!(!out.exists());
    }

    #[test]
    fn test_corrupt_blob_detected() {
        let tmp = TempDir::new().unwrap();
        let root = tmp.path().join("rootfs");
        fs::create_dir_all(root.join("project/.venv")).unwrap();
        fs::create_dir_all(root.join("project/src")).unwrap();
        let out = tmp.path().join("image");
        let layout = export(&root, &out);

        let blob = blob_path(&out, &layout.layers[1].digest).unwrap();
        fs::write(&blob, b"garbage").unwrap();
        assert!(inspect_layout(&out).is_err());
    }
}

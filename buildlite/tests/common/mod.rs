//! Fixture project and offline package index.

#![allow(dead_code)]

use buildlite::image::{build_layer, sha256_digest};
use buildlite::project::{ProjectManifest, content_hash};
use buildlite::runtime::InstallerConfig;
use buildlite::{BuildOptions, BuildliteHome, ImageBuilder};
use std::fs;
use std::path::{Path, PathBuf};
use tempfile::TempDir;

pub const PYPROJECT: &str = r#"[project]
name = "quarto-backend"
version = "0.1.0"
requires-python = ">=3.12"
dependencies = [
    "foo>=1.0",
    "uvicorn>=0.30",
]

[tool.pdm.dev-dependencies]
dev = ["pytest>=8.0"]
"#;

pub struct Fixture {
    pub tmp: TempDir,
}

impl Fixture {
    /// Project locking `foo==<foo_version>`, with `pytest` in the dev group.
    pub fn new(manifest: &str, foo_version: &str) -> Self {
        let tmp = TempDir::new().unwrap();
        let fixture = Self { tmp };
        fixture.write_project(manifest, foo_version);
        fixture.write_index();
        fixture
    }

    pub fn standard() -> Self {
        Self::new(PYPROJECT, "1.2.0")
    }

    pub fn project(&self) -> PathBuf {
        self.tmp.path().join("project")
    }

    pub fn index(&self) -> PathBuf {
        self.tmp.path().join("index")
    }

    pub fn home(&self) -> BuildliteHome {
        BuildliteHome::new(self.tmp.path().join("home"))
    }

    pub fn out(&self, name: &str) -> PathBuf {
        self.tmp.path().join("out").join(name)
    }

    pub fn options(&self) -> BuildOptions {
        BuildOptions {
            installer: InstallerConfig::Index { path: self.index() },
            ..Default::default()
        }
    }

    pub fn builder(&self, options: BuildOptions, out: &str) -> ImageBuilder {
        ImageBuilder::new(options, self.project(), self.out(out), self.home()).unwrap()
    }

    /// Single-layer base image layout at `<project>/base-image`.
    pub fn write_base_layout(&self, python_version: &str) -> PathBuf {
        let root = self.tmp.path().join("base-rootfs");
        fs::create_dir_all(root.join("usr/local/bin")).unwrap();
        fs::write(root.join("usr/local/bin/python3"), "#!/bin/sh\n").unwrap();
        let layer = build_layer("base", &root, "/usr/local", 0).unwrap();

        let layout = self.project().join("base-image");
        let blobs = layout.join("blobs/sha256");
        fs::create_dir_all(&blobs).unwrap();
        let put = |bytes: &[u8]| {
            let digest = sha256_digest(bytes);
            fs::write(blobs.join(digest.trim_start_matches("sha256:")), bytes).unwrap();
            serde_json::json!({ "digest": digest, "size": bytes.len() })
        };

        let mut layer_desc = put(&layer.bytes);
        layer_desc["mediaType"] = "application/vnd.oci.image.layer.v1.tar+gzip".into();
        let config = serde_json::json!({
            "architecture": "amd64",
            "os": "linux",
            "config": { "Env": ["LANG=C.UTF-8", format!("PYTHON_VERSION={}", python_version)] },
            "rootfs": { "type": "layers", "diff_ids": [layer.descriptor.diff_id] },
        });
        let mut config_desc = put(&serde_json::to_vec(&config).unwrap());
        config_desc["mediaType"] = "application/vnd.oci.image.config.v1+json".into();
        let manifest = serde_json::json!({
            "schemaVersion": 2,
            "config": config_desc,
            "layers": [layer_desc],
        });
        let mut manifest_desc = put(&serde_json::to_vec(&manifest).unwrap());
        manifest_desc["mediaType"] = "application/vnd.oci.image.manifest.v1+json".into();
        let index = serde_json::json!({ "schemaVersion": 2, "manifests": [manifest_desc] });
        fs::write(layout.join("index.json"), serde_json::to_vec(&index).unwrap()).unwrap();
        layout
    }

    fn write_project(&self, manifest: &str, foo_version: &str) {
        let project = self.project();
        let package = project.join("src/quarto_backend");
        fs::create_dir_all(&package).unwrap();
        fs::write(project.join("pyproject.toml"), manifest).unwrap();
        fs::write(project.join("README.md"), "# quarto backend\n").unwrap();
        fs::write(package.join("__init__.py"), "").unwrap();
        fs::write(package.join("main.py"), "import foo\n\napp = object()\n").unwrap();
        fs::create_dir_all(package.join("__pycache__")).unwrap();
        fs::write(package.join("__pycache__/main.cpython-312.pyc"), b"\x00").unwrap();
        fs::create_dir_all(project.join(".git")).unwrap();
        fs::write(project.join(".git/HEAD"), "ref: refs/heads/main\n").unwrap();

        let parsed = ProjectManifest::from_toml(manifest).unwrap();
        let lock = format!(
            r#"[metadata]
groups = ["default", "dev"]
strategy = ["inherit_metadata"]
lock_version = "4.5.0"
content_hash = "{hash}"

[[metadata.targets]]
requires_python = ">=3.12"

[[package]]
name = "foo"
version = "{foo}"
requires_python = ">=3.8"
groups = ["default"]

[[package]]
name = "uvicorn"
version = "0.30.0"
requires_python = ">=3.8"
groups = ["default"]

[[package]]
name = "pytest"
version = "8.0"
requires_python = ">=3.8"
groups = ["dev"]
"#,
            hash = content_hash(&parsed).unwrap(),
            foo = foo_version,
        );
        fs::write(project.join("pdm.lock"), lock).unwrap();
    }

    fn write_index(&self) {
        let index = self.index();
        for version in ["1.1.0", "1.2.0"] {
            write_module(&index.join("foo").join(version).join("foo"), version);
        }
        let uvicorn = index.join("uvicorn/0.30.0");
        write_module(&uvicorn.join("uvicorn"), "0.30.0");
        fs::write(
            uvicorn.join("entry_points.txt"),
            "[console_scripts]\nuvicorn = uvicorn.main:main\n",
        )
        .unwrap();
        write_module(&index.join("pytest/8.0/pytest"), "8.0");
    }
}

fn write_module(dir: &Path, version: &str) {
    fs::create_dir_all(dir).unwrap();
    fs::write(
        dir.join("__init__.py"),
        format!("__version__ = \"{}\"\n", version),
    )
    .unwrap();
}

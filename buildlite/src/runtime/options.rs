//! Build configuration.
//!
//! Read from `buildlite.toml` (every field has a default), then overridden
//! by command-line flags, then checked with [`BuildOptions::sanitize`].

use crate::runtime::constants::{defaults, envs, filenames};
use buildlite_shared::errors::{BuildliteError, BuildliteResult};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Component, Path, PathBuf};

/// Installer backend selection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum InstallerConfig {
    /// Run `pdm install` (needs PDM and network or a configured mirror).
    Pdm {
        #[serde(default = "default_pdm_program")]
        program: PathBuf,
    },
    /// Install from a local package index directory.
    Index { path: PathBuf },
}

impl Default for InstallerConfig {
    fn default() -> Self {
        InstallerConfig::Pdm {
            program: default_pdm_program(),
        }
    }
}

fn default_pdm_program() -> PathBuf {
    PathBuf::from("pdm")
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct BuildOptions {
    /// Base interpreter image, shared by both stages.
    pub base_image: String,
    /// Local OCI image layout of `base_image`. Its layers become the lower
    /// layers of the exported image; without it the layout holds only the
    /// layers this build adds. Relative to the project root.
    pub base_layout: Option<PathBuf>,
    /// Interpreter version of the base image. Derived from the image tag
    /// (`python:3.12-slim` -> `3.12`) when unset.
    pub python_version: Option<String>,
    /// Image architecture (`amd64`, `arm64`).
    pub arch: String,

    /// ASGI application, `module:attribute`.
    pub app: String,
    /// ASGI server executable, resolved through `PATH`.
    pub server: String,
    pub host: String,
    pub port: u16,
    pub workers: u32,
    pub graceful_timeout_secs: u64,
    pub startup_timeout_secs: u64,
    pub health_path: String,

    pub workdir: String,
    pub env_dir: String,
    pub source_dir: String,

    /// Inputs, relative to the project root.
    pub manifest: PathBuf,
    pub lockfile: PathBuf,
    pub readme: Option<PathBuf>,
    pub sources: PathBuf,

    /// Optional-dependency groups installed in production.
    pub extras: Vec<String>,
    pub installer: InstallerConfig,
    /// Reuse resolved environments across builds.
    pub cache: bool,

    /// Extra environment for the runtime image.
    pub runtime_env: BTreeMap<String, String>,
    pub labels: BTreeMap<String, String>,
    /// `buildlite` binary to ship as the image entrypoint. Without it the
    /// ASGI server is the entrypoint.
    pub supervisor_binary: Option<PathBuf>,
    /// Image creation time, seconds since the epoch.
    pub source_date_epoch: i64,
}

impl Default for BuildOptions {
    fn default() -> Self {
        Self {
            base_image: defaults::BASE_IMAGE.into(),
            base_layout: None,
            python_version: None,
            arch: defaults::ARCH.into(),
            app: defaults::APP.into(),
            server: defaults::SERVER.into(),
            host: defaults::HOST.into(),
            port: defaults::PORT,
            workers: defaults::WORKERS,
            graceful_timeout_secs: defaults::GRACEFUL_TIMEOUT_SECS,
            startup_timeout_secs: defaults::STARTUP_TIMEOUT_SECS,
            health_path: defaults::HEALTH_PATH.into(),
            workdir: defaults::WORKDIR.into(),
            env_dir: defaults::ENV_DIR.into(),
            source_dir: defaults::SOURCE_DIR.into(),
            manifest: PathBuf::from(filenames::MANIFEST),
            lockfile: PathBuf::from(filenames::LOCKFILE),
            readme: Some(PathBuf::from(filenames::README)),
            sources: PathBuf::from(filenames::SOURCES),
            extras: Vec::new(),
            installer: InstallerConfig::default(),
            cache: true,
            runtime_env: BTreeMap::new(),
            labels: BTreeMap::new(),
            supervisor_binary: None,
            source_date_epoch: 0,
        }
    }
}

/// Runtime environment variables the image configuration owns.
const RESERVED_ENV: &[&str] = &[envs::PATH, envs::PYTHONPATH, envs::VIRTUAL_ENV];

impl BuildOptions {
    pub fn load(path: &Path) -> BuildliteResult<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            BuildliteError::Config(format!("Failed to read {}: {}", path.display(), e))
        })?;
        Self::from_toml(&content)
    }

    pub fn from_toml(content: &str) -> BuildliteResult<Self> {
        toml::from_str(content)
            .map_err(|e| BuildliteError::Config(format!("Invalid build configuration: {}", e)))
    }

    /// Validate option combinations.
    pub fn sanitize(&self) -> BuildliteResult<()> {
        if self.base_image.trim().is_empty() {
            return Err(BuildliteError::Config("base_image must not be empty".into()));
        }
        self.python_full_version()?;

        let (module, attr) = self.app_parts()?;
        if module.split('.').any(|part| !is_identifier(part)) || !is_identifier(attr) {
            return Err(BuildliteError::Config(format!(
                "app '{}' is not a valid module:attribute reference",
                self.app
            )));
        }

        if self.server.trim().is_empty() {
            return Err(BuildliteError::Config("server must not be empty".into()));
        }
        if self.port == 0 {
            return Err(BuildliteError::Config("port must be non-zero".into()));
        }
        if self.workers == 0 {
            return Err(BuildliteError::Config("workers must be at least 1".into()));
        }
        if self.startup_timeout_secs == 0 {
            return Err(BuildliteError::Config(
                "startup_timeout_secs must be at least 1".into(),
            ));
        }
        if !self.health_path.starts_with('/') {
            return Err(BuildliteError::Config(format!(
                "health_path '{}' must start with '/'",
                self.health_path
            )));
        }

        for (name, path) in [
            ("workdir", &self.workdir),
            ("env_dir", &self.env_dir),
            ("source_dir", &self.source_dir),
        ] {
            if !path.starts_with('/') || path.split('/').any(|c| c == "..") {
                return Err(BuildliteError::Config(format!(
                    "{} '{}' must be an absolute image path",
                    name, path
                )));
            }
        }
        if self.env_dir == self.source_dir
            || is_within(&self.env_dir, &self.source_dir)
            || is_within(&self.source_dir, &self.env_dir)
        {
            return Err(BuildliteError::Config(format!(
                "env_dir '{}' and source_dir '{}' must not overlap",
                self.env_dir, self.source_dir
            )));
        }
        if !is_within(&self.source_dir, &self.workdir) {
            return Err(BuildliteError::Config(format!(
                "source_dir '{}' must be inside workdir '{}'",
                self.source_dir, self.workdir
            )));
        }

        let inputs = [
            ("manifest", Some(&self.manifest)),
            ("lockfile", Some(&self.lockfile)),
            ("readme", self.readme.as_ref()),
            ("sources", Some(&self.sources)),
        ];
        for (name, path) in inputs {
            let Some(path) = path else { continue };
            let escapes = path
                .components()
                .any(|c| !matches!(c, Component::Normal(_) | Component::CurDir));
            if escapes {
                return Err(BuildliteError::Config(format!(
                    "{} path {} must stay inside the project root",
                    name,
                    path.display()
                )));
            }
        }

        for key in self.runtime_env.keys() {
            if RESERVED_ENV.contains(&key.as_str()) {
                return Err(BuildliteError::Config(format!(
                    "runtime_env cannot override {}; it is derived from env_dir/source_dir",
                    key
                )));
            }
        }

        Ok(())
    }

    /// `(module, attribute)` of the ASGI application.
    pub fn app_parts(&self) -> BuildliteResult<(&str, &str)> {
        match self.app.split_once(':') {
            Some((module, attr)) if !module.is_empty() && !attr.is_empty() => Ok((module, attr)),
            _ => Err(BuildliteError::Config(format!(
                "app '{}' must be in module:attribute form",
                self.app
            ))),
        }
    }

    /// Interpreter version with three components (`3.12.0`).
    pub fn python_full_version(&self) -> BuildliteResult<String> {
        let raw = match &self.python_version {
            Some(v) => v.clone(),
            None => python_version_from_image(&self.base_image).ok_or_else(|| {
                BuildliteError::Config(format!(
                    "cannot derive the Python version from base image '{}'; set python_version",
                    self.base_image
                ))
            })?,
        };

        let parts: Vec<&str> = raw.split('.').collect();
        if parts.len() < 2 || parts.len() > 3 || parts.iter().any(|p| p.parse::<u32>().is_err()) {
            return Err(BuildliteError::Config(format!(
                "python_version '{}' must look like 3.12 or 3.12.4",
                raw
            )));
        }
        Ok(if parts.len() == 2 { format!("{}.0", raw) } else { raw })
    }
}

/// `python:3.12-slim` -> `3.12`, `docker.io/library/python:3.11.9` -> `3.11.9`.
pub fn python_version_from_image(image: &str) -> Option<String> {
    let name_end = image.rfind('/').map(|i| i + 1).unwrap_or(0);
    let (_, tag) = image[name_end..].split_once(':')?;
    let tag = tag.split('@').next()?;
    let version: String = tag
        .chars()
        .take_while(|c| c.is_ascii_digit() || *c == '.')
        .collect();
    let version = version.trim_end_matches('.');
    if version.split('.').filter(|p| !p.is_empty()).count() >= 2 {
        Some(version.to_string())
    } else {
        None
    }
}

fn is_identifier(s: &str) -> bool {
    let mut chars = s.chars();
    matches!(chars.next(), Some(c) if c == '_' || c.is_ascii_alphabetic())
        && chars.all(|c| c == '_' || c.is_ascii_alphanumeric())
}

fn is_within(path: &str, dir: &str) -> bool {
    let dir = dir.trim_end_matches('/');
    path.strip_prefix(dir)
        .is_some_and(|rest| rest.starts_with('/') && rest.len() > 1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let options = BuildOptions::default();
        options.sanitize().unwrap();
        assert_eq!(options.python_full_version().unwrap(), "3.12.0");
        assert_eq!(options.app_parts().unwrap(), ("quarto_backend.main", "app"));
    }

    #[test]
    fn test_from_toml() {
        let options = BuildOptions::from_toml(
            r#"
base_image = "python:3.11-slim"
workers = 4
extras = ["postgres"]

[installer]
kind = "index"
path = "/srv/index"

[runtime_env]
LOG_LEVEL = "info"
"#,
        )
        .unwrap();
        assert_eq!(options.workers, 4);
        assert_eq!(options.port, 8000);
        assert_eq!(
            options.installer,
            InstallerConfig::Index {
                path: PathBuf::from("/srv/index")
            }
        );
        assert_eq!(options.python_full_version().unwrap(), "3.11.0");
        assert!(BuildOptions::from_toml("unknown_field = 1").is_err());
    }

    #[test]
    fn test_python_version_from_image() {
        assert_eq!(python_version_from_image("python:3.12-slim").as_deref(), Some("3.12"));
        assert_eq!(
            python_version_from_image("registry:5000/library/python:3.11.9-bookworm").as_deref(),
            Some("3.11.9")
        );
        assert_eq!(python_version_from_image("python:slim"), None);
        assert_eq!(python_version_from_image("python"), None);
    }

    #[test]
    fn test_sanitize_rejects() {
        let bad = |f: fn(&mut BuildOptions)| {
            let mut options = BuildOptions::default();
            f(&mut options);
            options.sanitize().unwrap_err()
        };
        bad(|o| o.port = 0);
        bad(|o| o.workers = 0);
        bad(|o| o.app = "quarto_backend.main".into());
        bad(|o| o.app = "quarto-backend.main:app".into());
        bad(|o| o.source_dir = "/elsewhere/src".into());
        bad(|o| o.env_dir = "relative/.venv".into());
        bad(|o| o.env_dir = "/project/src/.venv".into());
        bad(|o| o.health_path = "healthz".into());
        bad(|o| {
            o.runtime_env.insert("PATH".into(), "/bin".into());
        });
        bad(|o| {
            o.base_image = "internal/python-runtime:latest".into();
        });
    }

    #[test]
    fn test_input_paths_stay_in_project() {
        let check = |f: fn(&mut BuildOptions)| {
            let mut options = BuildOptions::default();
            f(&mut options);
            options.sanitize()
        };
        assert!(check(|o| o.sources = "../elsewhere".into()).is_err());
        assert!(check(|o| o.sources = "src/../../x".into()).is_err());
        assert!(check(|o| o.manifest = "/etc/pyproject.toml".into()).is_err());
        assert!(check(|o| o.lockfile = "../pdm.lock".into()).is_err());
        assert!(check(|o| o.readme = Some("../README.md".into())).is_err());
        assert!(check(|o| o.sources = "./app/src".into()).is_ok());
        assert!(check(|o| o.readme = None).is_ok());
    }
}

//! Lockfile (`pdm.lock`).
//!
//! Records the exact version of every package resolved from the manifest,
//! the groups each package belongs to, and a content hash of the manifest
//! sections it was resolved from.

use super::marker::{MarkerEnvironment, MarkerExpr};
use super::name::PackageName;
use super::version::Version;
use buildlite_shared::errors::{BuildliteError, BuildliteResult};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::path::Path;

/// Lock format major version this crate understands.
pub const SUPPORTED_LOCK_MAJOR: u32 = 4;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Lockfile {
    pub metadata: LockMetadata,
    #[serde(rename = "package", default)]
    pub packages: Vec<LockedPackage>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LockMetadata {
    #[serde(default)]
    pub groups: Vec<String>,
    #[serde(default)]
    pub strategy: Vec<String>,
    pub lock_version: String,
    pub content_hash: String,
    /// Pre-4.5 locks store this at the top level instead of in `targets`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub requires_python: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub targets: Vec<LockTarget>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LockTarget {
    #[serde(default)]
    pub requires_python: Option<String>,
    #[serde(default)]
    pub platform: Option<String>,
    #[serde(default)]
    pub implementation: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LockedPackage {
    pub name: String,
    pub version: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub requires_python: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
    #[serde(default)]
    pub groups: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub marker: Option<String>,
    #[serde(default)]
    pub dependencies: Vec<String>,
    /// Set on the entry that locks `name[extra,...]`.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub extras: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub git: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub revision: Option<String>,
    #[serde(default)]
    pub files: Vec<LockedFile>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LockedFile {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    pub hash: String,
}

impl Lockfile {
    pub fn load(path: &Path) -> BuildliteResult<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            BuildliteError::Lockfile(format!("Failed to read {}: {}", path.display(), e))
        })?;
        Self::from_toml(&content)
    }

    pub fn from_toml(content: &str) -> BuildliteResult<Self> {
        let lock: Lockfile = toml::from_str(content)
            .map_err(|e| BuildliteError::Lockfile(format!("Failed to parse lockfile: {}", e)))?;
        lock.check_format()?;
        Ok(lock)
    }

    fn check_format(&self) -> BuildliteResult<()> {
        let major = self
            .metadata
            .lock_version
            .split('.')
            .next()
            .and_then(|m| m.parse::<u32>().ok())
            .ok_or_else(|| {
                BuildliteError::Lockfile(format!(
                    "invalid lock_version '{}'",
                    self.metadata.lock_version
                ))
            })?;

        if major != SUPPORTED_LOCK_MAJOR {
            return Err(BuildliteError::Lockfile(format!(
                "unsupported lock_version {} (expected {}.x); re-lock the project",
                self.metadata.lock_version, SUPPORTED_LOCK_MAJOR
            )));
        }
        Ok(())
    }

    /// Python constraint the lock was resolved for.
    pub fn requires_python(&self) -> Option<&str> {
        self.metadata
            .targets
            .iter()
            .find_map(|t| t.requires_python.as_deref())
            .or(self.metadata.requires_python.as_deref())
    }

    pub fn has_group(&self, group: &str) -> bool {
        let wanted = PackageName::new(group);
        self.metadata
            .groups
            .iter()
            .any(|g| PackageName::new(g) == wanted)
    }

    /// Find the entry locking `name[extras]` that applies to `env`.
    pub fn find(
        &self,
        name: &PackageName,
        extras: &BTreeSet<String>,
        env: &MarkerEnvironment,
    ) -> BuildliteResult<Option<&LockedPackage>> {
        for package in &self.packages {
            if package.package_name() != *name || package.extra_set() != *extras {
                continue;
            }
            if package.applies(env)? {
                return Ok(Some(package));
            }
        }
        Ok(None)
    }

    /// All entries (any extras) for a package name.
    pub fn entries<'a>(&'a self, name: &'a PackageName) -> impl Iterator<Item = &'a LockedPackage> {
        self.packages
            .iter()
            .filter(move |p| p.package_name() == *name)
    }
}

impl LockedPackage {
    pub fn package_name(&self) -> PackageName {
        PackageName::new(&self.name)
    }

    pub fn parsed_version(&self) -> BuildliteResult<Version> {
        Version::parse(&self.version).map_err(|_| {
            BuildliteError::Lockfile(format!(
                "package '{}' has invalid version '{}'",
                self.name, self.version
            ))
        })
    }

    pub fn extra_set(&self) -> BTreeSet<String> {
        self.extras
            .iter()
            .map(|e| PackageName::new(e).to_string())
            .collect()
    }

    /// Whether this entry's marker matches the environment.
    pub fn applies(&self, env: &MarkerEnvironment) -> BuildliteResult<bool> {
        match &self.marker {
            None => Ok(true),
            Some(marker) => Ok(MarkerExpr::parse(marker)
                .map_err(|e| {
                    BuildliteError::Lockfile(format!("package '{}': {}", self.name, e))
                })?
                .evaluate(env)),
        }
    }

    /// Lockfile-recorded hashes of the distribution files.
    pub fn hashes(&self) -> Vec<&str> {
        self.files.iter().map(|f| f.hash.as_str()).collect()
    }

    /// Non-registry packages (local path, url or git).
    pub fn is_direct(&self) -> bool {
        self.path.is_some() || self.url.is_some() || self.git.is_some()
    }
}

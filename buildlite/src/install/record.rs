//! Installed-package bookkeeping.
//!
//! - `.dist-info` directories (`METADATA`, `INSTALLER`, `RECORD`) written
//!   for every package the index installer lays down
//! - a scan of `site-packages` that reads them back, for either installer
//! - [`EnvironmentRecord`], the `buildlite-env.json` summary stored at the
//!   environment root

use crate::project::PackageName;
use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use buildlite_shared::errors::{BuildliteError, BuildliteResult};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

pub const ENV_RECORD_FILE: &str = "buildlite-env.json";
pub const INSTALLER_NAME: &str = "buildlite";

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct InstalledPackage {
    pub name: PackageName,
    pub version: String,
}

impl InstalledPackage {
    pub fn pin(&self) -> String {
        format!("{}=={}", self.name, self.version)
    }
}

/// Summary of a resolved environment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnvironmentRecord {
    pub installer: String,
    pub python_version: String,
    /// Third-party packages, sorted by name.
    pub packages: Vec<InstalledPackage>,
    /// The project itself, installed non-editable.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub project: Option<InstalledPackage>,
    pub extras: Vec<String>,
    pub lock_hash: String,
    pub closure_digest: String,
}

impl EnvironmentRecord {
    pub fn pins(&self) -> Vec<String> {
        self.packages.iter().map(InstalledPackage::pin).collect()
    }

    pub fn contains(&self, name: &str) -> bool {
        let name = PackageName::new(name);
        self.packages.iter().any(|p| p.name == name)
    }

    pub fn write(&self, env_root: &Path) -> BuildliteResult<()> {
        let json = serde_json::to_string_pretty(self)?;
        fs::write(env_root.join(ENV_RECORD_FILE), format!("{}\n", json))?;
        Ok(())
    }

    pub fn load(env_root: &Path) -> BuildliteResult<Self> {
        let path = env_root.join(ENV_RECORD_FILE);
        let content = fs::read_to_string(&path).map_err(|e| {
            BuildliteError::Layout(format!(
                "Resolved environment record missing at {}: {}",
                path.display(),
                e
            ))
        })?;
        Ok(serde_json::from_str(&content)?)
    }
}

/// A file written into `site-packages` or `bin`, for the `RECORD`.
#[derive(Debug, Clone)]
pub struct RecordEntry {
    /// Path relative to `site-packages` (launchers use `../../../bin/<name>`).
    pub path: String,
    pub hash: String,
    pub size: u64,
}

impl RecordEntry {
    pub fn from_file(path: &Path, record_path: String) -> BuildliteResult<Self> {
        let content = fs::read(path)?;
        Ok(Self {
            path: record_path,
            hash: record_hash(&content),
            size: content.len() as u64,
        })
    }
}

/// `sha256=<urlsafe-b64-nopad>` as used in `RECORD` files.
pub fn record_hash(content: &[u8]) -> String {
    format!("sha256={}", URL_SAFE_NO_PAD.encode(Sha256::digest(content)))
}

/// Collect `RECORD` entries for every file under `dir`.
pub fn record_entries(site_packages: &Path, dir: &Path) -> BuildliteResult<Vec<RecordEntry>> {
    let mut entries = Vec::new();
    for entry in WalkDir::new(dir).sort_by_file_name() {
        let entry = entry.map_err(|e| BuildliteError::Install(e.to_string()))?;
        if !entry.file_type().is_file() {
            continue;
        }
        let rel = entry
            .path()
            .strip_prefix(site_packages)
            .map_err(|e| BuildliteError::Internal(e.to_string()))?
            .to_string_lossy()
            .into_owned();
        entries.push(RecordEntry::from_file(entry.path(), rel)?);
    }
    Ok(entries)
}

/// Write `<name>-<version>.dist-info` with `METADATA`, `INSTALLER`, optional
/// `entry_points.txt` and a `RECORD` covering `files` and itself.
pub fn write_dist_info(
    site_packages: &Path,
    name: &PackageName,
    display_name: &str,
    version: &str,
    summary: Option<&str>,
    entry_points: Option<&str>,
    mut files: Vec<RecordEntry>,
) -> BuildliteResult<PathBuf> {
    let dir_name = format!("{}-{}.dist-info", name.dist_info_stem(), version);
    let dist_info = site_packages.join(&dir_name);
    fs::create_dir_all(&dist_info)?;

    let mut metadata = format!(
        "Metadata-Version: 2.1\nName: {}\nVersion: {}\n",
        display_name, version
    );
    if let Some(summary) = summary {
        metadata.push_str(&format!("Summary: {}\n", summary));
    }

    let mut generated = vec![
        ("METADATA", metadata),
        ("INSTALLER", format!("{}\n", INSTALLER_NAME)),
    ];
    if let Some(entry_points) = entry_points {
        generated.push(("entry_points.txt", entry_points.to_string()));
    }

    for (file, content) in generated {
        fs::write(dist_info.join(file), &content)?;
        files.push(RecordEntry {
            path: format!("{}/{}", dir_name, file),
            hash: record_hash(content.as_bytes()),
            size: content.len() as u64,
        });
    }

    files.sort_by(|a, b| a.path.cmp(&b.path));
    let mut record = String::new();
    for entry in &files {
        record.push_str(&format!("{},{},{}\n", entry.path, entry.hash, entry.size));
    }
    record.push_str(&format!("{}/RECORD,,\n", dir_name));
    fs::write(dist_info.join("RECORD"), record)?;

    Ok(dist_info)
}

/// Read back every installed distribution from `site-packages`.
pub fn scan_installed(site_packages: &Path) -> BuildliteResult<Vec<InstalledPackage>> {
    let mut found = BTreeMap::new();
    if !site_packages.is_dir() {
        return Ok(Vec::new());
    }

    for entry in fs::read_dir(site_packages)? {
        let path = entry?.path();
        let is_dist_info = path
            .file_name()
            .and_then(|n| n.to_str())
            .is_some_and(|n| n.ends_with(".dist-info"));
        if !is_dist_info || !path.is_dir() {
            continue;
        }

        let metadata = fs::read_to_string(path.join("METADATA")).map_err(|e| {
            BuildliteError::Install(format!("Unreadable METADATA in {}: {}", path.display(), e))
        })?;
        let (name, version) = parse_metadata(&metadata).ok_or_else(|| {
            BuildliteError::Install(format!(
                "METADATA in {} has no Name/Version",
                path.display()
            ))
        })?;
        found.insert(name.clone(), InstalledPackage { name, version });
    }

    Ok(found.into_values().collect())
}

fn parse_metadata(content: &str) -> Option<(PackageName, String)> {
    let mut name = None;
    let mut version = None;
    for line in content.lines() {
        if line.is_empty() {
            break; // headers end at the first blank line
        }
        if let Some(v) = line.strip_prefix("Name:") {
            name = Some(PackageName::new(v.trim()));
        } else if let Some(v) = line.strip_prefix("Version:") {
            version = Some(v.trim().to_string());
        }
    }
    Some((name?, version?))
}

/// `[console_scripts]` of an `entry_points.txt`.
pub fn console_scripts(entry_points: &str) -> Vec<(String, String)> {
    let mut in_section = false;
    let mut scripts = Vec::new();
    for line in entry_points.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') || line.starts_with(';') {
            continue;
        }
        if line.starts_with('[') {
            in_section = line == "[console_scripts]";
            continue;
        }
        if in_section && let Some((name, target)) = line.split_once('=') {
            scripts.push((name.trim().to_string(), target.trim().to_string()));
        }
    }
    scripts
}

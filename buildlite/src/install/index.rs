//! Offline installer backed by a local package index.
//!
//! Index layout:
//!
//! ```text
//! <index>/<normalized-name>/<version>/
//!     <importable files>       copied into site-packages
//!     entry_points.txt         optional, console scripts become bin/ launchers
//!     SUMMARY                  optional, one-line summary for METADATA
//! ```
//!
//! Nothing is fetched over the network, so a package missing from the index
//! is a resolution failure.

use super::record::{self, InstalledPackage, RecordEntry};
use super::{InstallRequest, Installer, ToolInfo};
use crate::fs::{copy_tree, is_source_entry};
use crate::project::{PackageName, ResolvedPackage};
use async_trait::async_trait;
use buildlite_shared::errors::{BuildliteError, BuildliteResult};
use std::fs;
use std::path::{Path, PathBuf};

const ENTRY_POINTS: &str = "entry_points.txt";
const SUMMARY: &str = "SUMMARY";

pub struct IndexInstaller {
    index: PathBuf,
}

impl IndexInstaller {
    pub fn new(index: impl Into<PathBuf>) -> Self {
        Self {
            index: index.into(),
        }
    }

    fn package_dir(&self, package: &ResolvedPackage) -> PathBuf {
        self.index.join(package.name.as_str()).join(&package.version)
    }

    fn install_package(
        &self,
        request: &InstallRequest<'_>,
        package: &ResolvedPackage,
    ) -> BuildliteResult<InstalledPackage> {
        let source = self.package_dir(package);
        if !source.is_dir() {
            return Err(BuildliteError::Resolution(format!(
                "{}=={} not found in package index {}",
                package.name,
                package.version,
                self.index.display()
            )));
        }

        let site = request.venv.site_packages();
        copy_tree(&source, &site, &|rel| {
            rel != Path::new(ENTRY_POINTS) && rel != Path::new(SUMMARY) && is_source_entry(rel)
        })
        .map_err(|e| install_err(&package.name, e))?;

        let mut files = Vec::new();
        for entry in fs::read_dir(&source)? {
            let name = entry?.file_name();
            let rel = Path::new(&name);
            if rel == Path::new(ENTRY_POINTS) || rel == Path::new(SUMMARY) || !is_source_entry(rel) {
                continue;
            }
            let installed = site.join(rel);
            if installed.is_dir() {
                files.extend(record::record_entries(&site, &installed)?);
            } else {
                files.push(RecordEntry::from_file(
                    &installed,
                    rel.to_string_lossy().into_owned(),
                )?);
            }
        }

        let entry_points = read_optional(&source.join(ENTRY_POINTS))?;
        if let Some(entry_points) = &entry_points {
            for (script, target) in record::console_scripts(entry_points) {
                let path = request.venv.write_launcher(&script, &target)?;
                files.push(RecordEntry::from_file(
                    &path,
                    format!("../../../bin/{}", script),
                )?);
            }
        }

        let summary = read_optional(&source.join(SUMMARY))?;
        record::write_dist_info(
            &site,
            &package.name,
            package.name.as_str(),
            &package.version,
            summary.as_deref().map(str::trim),
            entry_points.as_deref(),
            files,
        )?;

        tracing::debug!(package = %package.name, version = %package.version, "Installed package");
        Ok(InstalledPackage {
            name: package.name.clone(),
            version: package.version.clone(),
        })
    }

    /// Install the project itself from `<project>/src`, non-editable.
    fn install_project(&self, request: &InstallRequest<'_>) -> BuildliteResult<Option<InstalledPackage>> {
        let manifest = request.manifest;
        let Some(version) = manifest.version.clone() else {
            tracing::debug!(project = %manifest.name, "Project has no static version; not installing it");
            return Ok(None);
        };

        let src = request.project_dir.join("src");
        if !src.is_dir() {
            tracing::debug!(project = %manifest.name, "Project has no src/ directory; not installing it");
            return Ok(None);
        }

        let site = request.venv.site_packages();
        copy_tree(&src, &site, &is_source_entry).map_err(|e| install_err(&manifest.name, e))?;

        let mut files = Vec::new();
        for entry in fs::read_dir(&src)? {
            let name = entry?.file_name();
            let rel = Path::new(&name);
            if !is_source_entry(rel) {
                continue;
            }
            let installed = site.join(rel);
            if installed.is_dir() {
                files.extend(record::record_entries(&site, &installed)?);
            } else {
                files.push(RecordEntry::from_file(&installed, rel.to_string_lossy().into_owned())?);
            }
        }

        let mut entry_points = None;
        if !manifest.scripts.is_empty() {
            let mut text = String::from("[console_scripts]\n");
            for (script, target) in &manifest.scripts {
                text.push_str(&format!("{} = {}\n", script, target));
                let path = request.venv.write_launcher(script, target)?;
                files.push(RecordEntry::from_file(&path, format!("../../../bin/{}", script))?);
            }
            entry_points = Some(text);
        }

        record::write_dist_info(
            &site,
            &manifest.name,
            &manifest.display_name,
            &version,
            None,
            entry_points.as_deref(),
            files,
        )?;

        Ok(Some(InstalledPackage {
            name: manifest.name.clone(),
            version,
        }))
    }
}

#[async_trait]
impl Installer for IndexInstaller {
    fn name(&self) -> &str {
        "index"
    }

    async fn prepare(&self) -> BuildliteResult<ToolInfo> {
        if !self.index.is_dir() {
            return Err(BuildliteError::Config(format!(
                "Package index {} does not exist",
                self.index.display()
            )));
        }
        Ok(ToolInfo {
            name: self.name().to_string(),
            version: None,
            location: Some(self.index.clone()),
        })
    }

    async fn install(&self, request: &InstallRequest<'_>) -> BuildliteResult<Option<InstalledPackage>> {
        request.venv.create()?;

        for package in request.closure.iter() {
            self.install_package(request, package)?;
        }

        self.install_project(request)
    }
}

fn read_optional(path: &Path) -> BuildliteResult<Option<String>> {
    match fs::read_to_string(path) {
        Ok(content) => Ok(Some(content)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

fn install_err(name: &PackageName, e: BuildliteError) -> BuildliteError {
    BuildliteError::Install(format!("Failed to install {}: {}", name, e))
}

//! Installer that shells out to PDM.
//!
//! Runs `pdm install --check --prod --no-editable` in the staged project
//! directory. `--check` makes PDM itself refuse a stale lockfile, on top of
//! the integrity check that already ran. The update check is disabled with
//! `PDM_CHECK_UPDATE=false`, set on the child process only.

use super::record::{self, InstalledPackage};
use super::{InstallRequest, Installer, ToolInfo};
use async_trait::async_trait;
use buildlite_shared::errors::{BuildliteError, BuildliteResult};
use std::path::PathBuf;
use std::process::Stdio;
use tokio::process::Command;

/// Builder-only environment for every PDM invocation.
pub const PDM_ENV: &[(&str, &str)] = &[
    ("PDM_CHECK_UPDATE", "false"),
    ("PDM_NON_INTERACTIVE", "1"),
    ("PDM_IGNORE_ACTIVE_VENV", "1"),
];

/// Fixed `pdm install` flags.
pub const PDM_INSTALL_ARGS: &[&str] = &["install", "--check", "--prod", "--no-editable"];

pub struct PdmInstaller {
    program: PathBuf,
}

impl PdmInstaller {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
        }
    }

    fn command(&self) -> Command {
        let mut cmd = Command::new(&self.program);
        for (key, value) in PDM_ENV {
            cmd.env(key, value);
        }
        cmd.env_remove("VIRTUAL_ENV");
        cmd.stdin(Stdio::null());
        cmd
    }

    /// Full argument list for a production install.
    pub fn install_args(extras: &[String]) -> Vec<String> {
        let mut args: Vec<String> = PDM_INSTALL_ARGS.iter().map(|a| a.to_string()).collect();
        for extra in extras {
            args.push("-G".into());
            args.push(extra.clone());
        }
        args
    }
}

impl Default for PdmInstaller {
    fn default() -> Self {
        Self::new("pdm")
    }
}

#[async_trait]
impl Installer for PdmInstaller {
    fn name(&self) -> &str {
        "pdm"
    }

    async fn prepare(&self) -> BuildliteResult<ToolInfo> {
        let output = self
            .command()
            .arg("--version")
            .output()
            .await
            .map_err(|e| {
                BuildliteError::Install(format!(
                    "Failed to run {} --version: {}",
                    self.program.display(),
                    e
                ))
            })?;

        if !output.status.success() {
            return Err(BuildliteError::Install(format!(
                "{} --version exited with {}",
                self.program.display(),
                output.status
            )));
        }

        // "PDM, version 2.19.1"
        let stdout = String::from_utf8_lossy(&output.stdout);
        let version = stdout
            .split_whitespace()
            .last()
            .map(|v| v.trim().to_string());

        tracing::info!(program = %self.program.display(), version = ?version, "Dependency manager ready");
        Ok(ToolInfo {
            name: self.name().to_string(),
            version,
            location: Some(self.program.clone()),
        })
    }

    async fn install(&self, request: &InstallRequest<'_>) -> BuildliteResult<Option<InstalledPackage>> {
        let project_venv = request.project_dir.join(".venv");
        let args = Self::install_args(request.extras);

        tracing::info!(
            project_dir = %request.project_dir.display(),
            args = %args.join(" "),
            "Running pdm install"
        );

        let output = self
            .command()
            .args(&args)
            .current_dir(request.project_dir)
            .env("PDM_VENV_IN_PROJECT", "true")
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .await
            .map_err(|e| BuildliteError::Install(format!("Failed to spawn pdm: {}", e)))?;

        for line in String::from_utf8_lossy(&output.stderr).lines() {
            tracing::debug!(target: "buildlite::pdm", "{}", line);
        }

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let tail: Vec<&str> = stderr.lines().rev().take(20).collect();
            let tail: Vec<&str> = tail.into_iter().rev().collect();
            return Err(BuildliteError::Install(format!(
                "pdm install exited with {}:\n{}",
                output.status,
                tail.join("\n")
            )));
        }

        if !project_venv.is_dir() {
            return Err(BuildliteError::Install(format!(
                "pdm install did not create {}",
                project_venv.display()
            )));
        }

        // Move PDM's in-project environment to the staging location, then
        // rebase it from the host interpreter onto the image's.
        if let Some(parent) = request.venv.root().parent() {
            std::fs::create_dir_all(parent)?;
        }
        if request.venv.root().exists() {
            std::fs::remove_dir_all(request.venv.root())?;
        }
        std::fs::rename(&project_venv, request.venv.root()).map_err(|e| {
            BuildliteError::Install(format!(
                "Failed to move {} to {}: {}",
                project_venv.display(),
                request.venv.root().display(),
                e
            ))
        })?;
        request.venv.adopt_host_environment(&project_venv)?;

        let installed = record::scan_installed(&request.venv.site_packages())?;
        Ok(installed.into_iter().find(|p| p.name == request.manifest.name))
    }
}

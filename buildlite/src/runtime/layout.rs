//! On-disk layout of the buildlite home and of one build's work directory.
//!
//! ```text
//! ~/.buildlite/
//!   db/buildlite.db
//!   logs/buildlite.log.<date>
//!   cache/envs/<key>/
//!   builds/<build-id>/
//!     builder/project/          staged inputs (mirrors /project)
//!     builder/project/.venv/    resolved environment
//!     runtime/rootfs/           assembled runtime filesystem
//! ```

use crate::runtime::constants::{dirs, envs, filenames};
use buildlite_shared::errors::{BuildliteError, BuildliteResult};
use std::path::{Path, PathBuf};

#[derive(Debug, Clone)]
pub struct BuildliteHome {
    root: PathBuf,
}

impl BuildliteHome {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// `BUILDLITE_HOME`, or `~/.buildlite`.
    pub fn from_env() -> BuildliteResult<Self> {
        if let Some(home) = std::env::var_os(envs::BUILDLITE_HOME)
            && !home.is_empty()
        {
            return Ok(Self::new(PathBuf::from(home)));
        }
        let home = ::dirs::home_dir().ok_or_else(|| {
            BuildliteError::Config(format!(
                "Cannot determine home directory; set {}",
                envs::BUILDLITE_HOME
            ))
        })?;
        Ok(Self::new(home.join(".buildlite")))
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn db_path(&self) -> PathBuf {
        self.root.join(dirs::DB).join(filenames::DB)
    }

    pub fn logs_dir(&self) -> PathBuf {
        self.root.join(dirs::LOGS)
    }

    pub fn env_cache_dir(&self) -> PathBuf {
        self.root.join(dirs::CACHE_ENVS)
    }

    pub fn builds_dir(&self) -> PathBuf {
        self.root.join(dirs::BUILDS)
    }

    /// Create the home directory tree.
    pub fn prepare(&self) -> BuildliteResult<()> {
        for dir in [
            self.root.join(dirs::DB),
            self.logs_dir(),
            self.env_cache_dir(),
            self.builds_dir(),
        ] {
            std::fs::create_dir_all(&dir).map_err(|e| {
                BuildliteError::Storage(format!("Failed to create {}: {}", dir.display(), e))
            })?;
        }
        Ok(())
    }

    pub fn workspace(&self, build_id: &str) -> BuildWorkspace {
        BuildWorkspace::new(self.builds_dir().join(build_id))
    }
}

/// Scratch directories of one build.
#[derive(Debug, Clone)]
pub struct BuildWorkspace {
    root: PathBuf,
}

impl BuildWorkspace {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn builder_dir(&self) -> PathBuf {
        self.root.join("builder")
    }

    /// Staged project, the builder's `/project`.
    pub fn builder_project(&self) -> PathBuf {
        self.builder_dir().join("project")
    }

    /// Resolved environment inside the staged project.
    pub fn builder_venv(&self) -> PathBuf {
        self.builder_project().join(".venv")
    }

    pub fn runtime_dir(&self) -> PathBuf {
        self.root.join("runtime")
    }

    pub fn runtime_rootfs(&self) -> PathBuf {
        self.runtime_dir().join("rootfs")
    }

    /// Host path of an absolute image path inside the runtime rootfs.
    pub fn rootfs_path(&self, image_path: &str) -> PathBuf {
        self.runtime_rootfs().join(image_path.trim_start_matches('/'))
    }

    pub fn prepare(&self) -> BuildliteResult<()> {
        for dir in [self.builder_dir(), self.runtime_dir()] {
            std::fs::create_dir_all(&dir).map_err(|e| {
                BuildliteError::Storage(format!("Failed to create {}: {}", dir.display(), e))
            })?;
        }
        Ok(())
    }

    pub fn cleanup(&self) -> BuildliteResult<()> {
        if self.root.exists() {
            std::fs::remove_dir_all(&self.root)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_home_layout() {
        let tmp = TempDir::new().unwrap();
        let home = BuildliteHome::new(tmp.path());
        home.prepare().unwrap();

        assert_eq!(home.db_path(), tmp.path().join("db/buildlite.db"));
        assert!(home.env_cache_dir().is_dir());
        assert!(home.logs_dir().is_dir());

        let ws = home.workspace("01ABC");
        assert_eq!(ws.builder_venv(), tmp.path().join("builds/01ABC/builder/project/.venv"));
        assert_eq!(
            ws.rootfs_path("/project/src"),
            tmp.path().join("builds/01ABC/runtime/rootfs/project/src")
        );
    }

    #[test]
    fn test_workspace_cleanup() {
        let tmp = TempDir::new().unwrap();
        let ws = BuildWorkspace::new(tmp.path().join("ws"));
        ws.prepare().unwrap();
        assert!(ws.builder_dir().is_dir());
        ws.cleanup().unwrap();
        assert!(!ws.root().exists());
        ws.cleanup().unwrap();
    }
}

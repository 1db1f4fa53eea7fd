//! Resolved environment cache.
//!
//! Entries live at `<home>/cache/envs/<key>/`, where the key digests every
//! input that can change the environment. A hit only replaces installation;
//! the lockfile integrity check always runs first. An entry's mtime is
//! bumped on every store and restore and orders entries for pruning.

use super::record::EnvironmentRecord;
use crate::fs::{copy_tree, publish_dir, sibling_path};
use buildlite_shared::errors::{BuildliteError, BuildliteResult};
use filetime::FileTime;
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

#[derive(Debug, Clone)]
pub struct EnvCache {
    root: PathBuf,
}

/// Inputs that identify an environment.
#[derive(Debug, Clone)]
pub struct CacheKeyInputs<'a> {
    pub lock_hash: &'a str,
    pub closure_digest: &'a str,
    pub source_digest: &'a str,
    pub extras: &'a [String],
    pub installer: &'a str,
    pub python_full_version: &'a str,
    pub image_path: &'a str,
}

impl CacheKeyInputs<'_> {
    pub fn key(&self) -> String {
        let mut extras = self.extras.to_vec();
        extras.sort();
        let extras = extras.join(",");

        let mut hasher = Sha256::new();
        for (label, value) in [
            ("lock", self.lock_hash),
            ("closure", self.closure_digest),
            ("source", self.source_digest),
            ("extras", extras.as_str()),
            ("installer", self.installer),
            ("python", self.python_full_version),
            ("path", self.image_path),
        ] {
            hasher.update(label.as_bytes());
            hasher.update(b"=");
            hasher.update(value.as_bytes());
            hasher.update(b"\n");
        }
        hex::encode(hasher.finalize())
    }
}

impl EnvCache {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn entry_path(&self, key: &str) -> PathBuf {
        self.root.join(key)
    }

    /// Cached environment for `key`, if a complete one exists.
    pub fn lookup(&self, key: &str) -> Option<PathBuf> {
        let path = self.entry_path(key);
        match EnvironmentRecord::load(&path) {
            Ok(_) => Some(path),
            Err(_) => None,
        }
    }

    /// Copy a finished environment into the cache.
    pub fn store(&self, key: &str, env_dir: &Path) -> BuildliteResult<PathBuf> {
        let dest = self.entry_path(key);
        std::fs::create_dir_all(&self.root)?;
        let staging = sibling_path(&dest, "tmp");
        if let Err(e) = copy_tree(env_dir, &staging, &|_| true) {
            let _ = std::fs::remove_dir_all(&staging);
            return Err(e);
        }
        publish_dir(&staging, &dest)?;
        touch(&dest)?;
        tracing::debug!(key = %key, path = %dest.display(), "Cached resolved environment");
        Ok(dest)
    }

    /// Copy a cached environment out to `dest`.
    pub fn restore(&self, key: &str, dest: &Path) -> BuildliteResult<Option<EnvironmentRecord>> {
        let Some(cached) = self.lookup(key) else {
            return Ok(None);
        };
        let staging = sibling_path(dest, "staging");
        if let Err(e) = copy_tree(&cached, &staging, &|_| true) {
            let _ = std::fs::remove_dir_all(&staging);
            return Err(e);
        }
        publish_dir(&staging, dest)?;
        touch(&cached)?;
        Ok(Some(EnvironmentRecord::load(dest)?))
    }

    /// Remove entries beyond the `keep` most recently used and entries
    /// unused for longer than `max_age`. Incomplete entries and leftover
    /// staging directories are always removed.
    pub fn prune(&self, keep: usize, max_age: Option<Duration>) -> BuildliteResult<PruneReport> {
        let mut report = PruneReport::default();
        if !self.root.is_dir() {
            return Ok(report);
        }

        let now = SystemTime::now();
        let mut complete: Vec<(SystemTime, PathBuf)> = Vec::new();
        for entry in std::fs::read_dir(&self.root)? {
            let path = entry?.path();
            let staging = path
                .file_name()
                .is_some_and(|n| n.to_string_lossy().starts_with('.'));
            if staging || !path.is_dir() || EnvironmentRecord::load(&path).is_err() {
                report.removed.push(path);
                continue;
            }
            let used = std::fs::metadata(&path)?.modified()?;
            complete.push((used, path));
        }

        // Most recently used first.
        complete.sort_by(|a, b| b.0.cmp(&a.0).then_with(|| a.1.cmp(&b.1)));
        for (rank, (used, path)) in complete.into_iter().enumerate() {
            let expired = max_age
                .is_some_and(|age| now.duration_since(used).unwrap_or_default() > age);
            if rank >= keep || expired {
                report.removed.push(path);
            } else {
                report.kept.push(path);
            }
        }

        for path in &report.removed {
            let removed = if path.is_dir() {
                std::fs::remove_dir_all(path)
            } else {
                std::fs::remove_file(path)
            };
            removed.map_err(|e| {
                BuildliteError::Storage(format!("Failed to prune {}: {}", path.display(), e))
            })?;
        }
        tracing::info!(
            root = %self.root.display(),
            kept = report.kept.len(),
            removed = report.removed.len(),
            "Pruned environment cache"
        );
        Ok(report)
    }
}

#[derive(Debug, Default)]
pub struct PruneReport {
    pub kept: Vec<PathBuf>,
    pub removed: Vec<PathBuf>,
}

fn touch(path: &Path) -> BuildliteResult<()> {
    filetime::set_file_mtime(path, FileTime::now()).map_err(|e| {
        BuildliteError::Storage(format!("Failed to touch {}: {}", path.display(), e))
    })
}

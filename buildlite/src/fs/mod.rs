//! Filesystem helpers shared by the builder and runtime stages.
//!
//! - `copy_tree`: verbatim tree copy (symlinks kept as links, modes and
//!   mtimes preserved) with an entry filter
//! - `digest_tree`: content digest of a tree, independent of mtimes
//! - `publish_dir`: move a finished staging directory into place

use buildlite_shared::errors::{BuildliteError, BuildliteResult};
use sha2::{Digest, Sha256};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

/// Directory and file names never copied out of a source tree.
pub const SKIPPED_NAMES: &[&str] = &[
    ".git",
    ".hg",
    ".svn",
    "__pycache__",
    ".pytest_cache",
    ".mypy_cache",
    ".ruff_cache",
    ".venv",
    ".pdm-python",
    ".pdm-build",
    ".DS_Store",
];

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct CopyStats {
    pub files: u64,
    pub dirs: u64,
    pub symlinks: u64,
    pub bytes: u64,
}

/// Default filter for application sources: VCS metadata, caches, compiled
/// bytecode and local environments are dropped.
pub fn is_source_entry(rel: &Path) -> bool {
    let Some(name) = rel.file_name().and_then(|n| n.to_str()) else {
        return true;
    };
    !(SKIPPED_NAMES.contains(&name) || name.ends_with(".pyc") || name.ends_with(".pyo"))
}

/// Copy `src` into `dst`, creating `dst`.
///
/// `include` sees paths relative to `src`; an excluded directory is not
/// descended into. Entries are visited in name order so repeated copies
/// create files in the same order.
pub fn copy_tree(
    src: &Path,
    dst: &Path,
    include: &dyn Fn(&Path) -> bool,
) -> BuildliteResult<CopyStats> {
    if !src.is_dir() {
        return Err(BuildliteError::Storage(format!(
            "Cannot copy {}: not a directory",
            src.display()
        )));
    }

    let mut stats = CopyStats::default();
    fs::create_dir_all(dst).map_err(|e| copy_err(dst, e))?;

    let walker = WalkDir::new(src)
        .follow_links(false)
        .sort_by_file_name()
        .min_depth(1)
        .into_iter()
        .filter_entry(|entry| {
            entry
                .path()
                .strip_prefix(src)
                .map(include)
                .unwrap_or(false)
        });

    for entry in walker {
        let entry = entry.map_err(|e| {
            BuildliteError::Storage(format!("Failed to walk {}: {}", src.display(), e))
        })?;
        let rel = entry
            .path()
            .strip_prefix(src)
            .map_err(|e| BuildliteError::Internal(e.to_string()))?;
        let target = dst.join(rel);
        let file_type = entry.file_type();

        if file_type.is_symlink() {
            let link = fs::read_link(entry.path()).map_err(|e| copy_err(entry.path(), e))?;
            if target.symlink_metadata().is_ok() {
                fs::remove_file(&target).map_err(|e| copy_err(&target, e))?;
            }
            std::os::unix::fs::symlink(&link, &target).map_err(|e| copy_err(&target, e))?;
            stats.symlinks += 1;
        } else if file_type.is_dir() {
            fs::create_dir_all(&target).map_err(|e| copy_err(&target, e))?;
            let perms = entry.metadata().map_err(io::Error::from)?.permissions();
            fs::set_permissions(&target, perms).map_err(|e| copy_err(&target, e))?;
            stats.dirs += 1;
        } else {
            stats.bytes += fs::copy(entry.path(), &target).map_err(|e| copy_err(entry.path(), e))?;
            let meta = entry.metadata().map_err(io::Error::from)?;
            let mtime = filetime::FileTime::from_last_modification_time(&meta);
            filetime::set_file_mtime(&target, mtime).map_err(|e| copy_err(&target, e))?;
            stats.files += 1;
        }
    }

    Ok(stats)
}

/// Content digest of a directory tree.
///
/// Covers relative paths, file contents, the executable bit and symlink
/// targets. Timestamps and ownership are ignored.
pub fn digest_tree(root: &Path) -> BuildliteResult<String> {
    use std::os::unix::fs::PermissionsExt;

    let mut hasher = Sha256::new();
    for entry in WalkDir::new(root).follow_links(false).sort_by_file_name().min_depth(1) {
        let entry = entry.map_err(|e| {
            BuildliteError::Storage(format!("Failed to walk {}: {}", root.display(), e))
        })?;
        let rel = entry
            .path()
            .strip_prefix(root)
            .map_err(|e| BuildliteError::Internal(e.to_string()))?
            .to_string_lossy()
            .into_owned();
        let file_type = entry.file_type();

        if file_type.is_symlink() {
            let link = fs::read_link(entry.path())?;
            hasher.update(format!("l {} {}\n", rel, link.display()).as_bytes());
        } else if file_type.is_dir() {
            hasher.update(format!("d {}\n", rel).as_bytes());
        } else {
            let mode = entry.metadata().map_err(io::Error::from)?.permissions().mode();
            let content = fs::read(entry.path())?;
            hasher.update(
                format!(
                    "f {} {} {}\n",
                    rel,
                    if mode & 0o111 != 0 { "x" } else { "-" },
                    hex::encode(Sha256::digest(&content))
                )
                .as_bytes(),
            );
        }
    }
    Ok(hex::encode(hasher.finalize()))
}

/// Replace `dest` with the finished directory `staging`.
///
/// Both must be on the same filesystem. An existing `dest` is moved aside
/// first and removed once the rename succeeded.
pub fn publish_dir(staging: &Path, dest: &Path) -> BuildliteResult<()> {
    if let Some(parent) = dest.parent() {
        fs::create_dir_all(parent)?;
    }

    let previous = if dest.exists() {
        let aside = sibling_path(dest, "old");
        fs::rename(dest, &aside).map_err(|e| copy_err(dest, e))?;
        Some(aside)
    } else {
        None
    };

    if let Err(e) = fs::rename(staging, dest) {
        if let Some(aside) = &previous {
            let _ = fs::rename(aside, dest);
        }
        return Err(BuildliteError::Storage(format!(
            "Failed to move {} to {}: {}",
            staging.display(),
            dest.display(),
            e
        )));
    }

    if let Some(aside) = previous
        && let Err(e) = fs::remove_dir_all(&aside)
    {
        tracing::warn!(path = %aside.display(), "Failed to remove replaced directory: {}", e);
    }
    Ok(())
}

/// `<parent>/.<name>.<tag>-<ulid>`, next to `path` so a rename stays on one filesystem.
pub fn sibling_path(path: &Path, tag: &str) -> PathBuf {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let sibling = format!(".{}.{}-{}", name, tag, ulid::Ulid::new());
    match path.parent() {
        Some(parent) => parent.join(sibling),
        None => PathBuf::from(sibling),
    }
}

fn copy_err(path: &Path, e: io::Error) -> BuildliteError {
    BuildliteError::Storage(format!("Failed to copy {}: {}", path.display(), e))
}

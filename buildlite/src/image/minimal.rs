//! Rules for what may not appear in a runtime image.
//!
//! The runtime filesystem carries the resolved environment and the
//! application sources only. The dependency manager, its lock and config
//! files, the project manifest and VCS metadata are build-time inputs.

use crate::runtime::constants::filenames;
use buildlite_shared::errors::{BuildliteError, BuildliteResult};
use std::fmt;
use std::path::Path;
use walkdir::WalkDir;

const VCS_DIRS: &[&str] = &[".git", ".hg", ".svn"];
const MANAGER_FILES: &[&str] = &[filenames::LOCKFILE, ".pdm-python", "pdm.toml"];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Violation {
    /// Path relative to the filesystem root.
    pub path: String,
    pub reason: &'static str,
}

impl fmt::Display for Violation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "/{} ({})", self.path, self.reason)
    }
}

/// Check one path, relative to the filesystem root.
pub fn check_path(path: &str) -> Option<Violation> {
    let path = path.trim_start_matches("./").trim_matches('/');
    let components: Vec<&str> = path.split('/').filter(|c| !c.is_empty()).collect();
    let name = components.last().copied()?;

    let reason = if components.iter().any(|c| VCS_DIRS.contains(c)) {
        "version control metadata"
    } else if MANAGER_FILES.contains(&name) {
        "dependency manager file"
    } else if name == filenames::MANIFEST && !components.contains(&"site-packages") {
        "project manifest"
    } else if is_manager_install(&components) {
        "dependency manager"
    } else {
        return None;
    };

    Some(Violation {
        path: path.to_string(),
        reason,
    })
}

fn is_manager_install(components: &[&str]) -> bool {
    components.windows(2).any(|pair| match pair {
        ["bin", "pdm"] => true,
        ["site-packages", pkg] => {
            *pkg == "pdm" || (pkg.starts_with("pdm-") && pkg.ends_with(".dist-info"))
        }
        _ => false,
    })
}

pub fn check_paths<'a>(paths: impl IntoIterator<Item = &'a str>) -> Vec<Violation> {
    let mut violations: Vec<Violation> = paths.into_iter().filter_map(check_path).collect();
    // A violating directory is reported once, not once per entry below it.
    violations.sort_by(|a, b| a.path.cmp(&b.path));
    let mut reported: Vec<Violation> = Vec::new();
    for v in violations {
        let covered = reported
            .last()
            .is_some_and(|prev| v.path.starts_with(&format!("{}/", prev.path)));
        if !covered {
            reported.push(v);
        }
    }
    reported
}

/// Walk an assembled rootfs.
pub fn check_rootfs(rootfs: &Path) -> BuildliteResult<Vec<Violation>> {
    let mut paths = Vec::new();
    for entry in WalkDir::new(rootfs).follow_links(false).sort_by_file_name().min_depth(1) {
        let entry = entry.map_err(|e| {
            BuildliteError::Layout(format!("Failed to walk {}: {}", rootfs.display(), e))
        })?;
        let rel = entry
            .path()
            .strip_prefix(rootfs)
            .map_err(|e| BuildliteError::Internal(e.to_string()))?;
        paths.push(rel.to_string_lossy().into_owned());
    }
    Ok(check_paths(paths.iter().map(String::as_str)))
}

/// Fail with every violation listed.
pub fn ensure_minimal(violations: &[Violation]) -> BuildliteResult<()> {
    if violations.is_empty() {
        return Ok(());
    }
    let listed: Vec<String> = violations.iter().map(Violation::to_string).collect();
    Err(BuildliteError::Layout(format!(
        "runtime filesystem contains build-time files: {}",
        listed.join(", ")
    )))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_rules() {
        assert!(check_path("project/src/quarto_backend/main.py").is_none());
        assert!(check_path("project/.venv/bin/uvicorn").is_none());
        assert!(
            check_path("project/.venv/lib/python3.12/site-packages/foo-1.0.dist-info/pyproject.toml")
                .is_none()
        );
        assert!(check_path("project/.venv/lib/python3.12/site-packages/pdm_backend/__init__.py").is_none());

        assert_eq!(check_path("project/pdm.lock").unwrap().reason, "dependency manager file");
        assert_eq!(check_path("project/pyproject.toml").unwrap().reason, "project manifest");
        assert_eq!(check_path("project/src/.git/HEAD").unwrap().reason, "version control metadata");
        assert_eq!(check_path("project/.venv/bin/pdm").unwrap().reason, "dependency manager");
        assert!(check_path("project/.venv/lib/python3.12/site-packages/pdm/core.py").is_some());
        assert!(check_path("project/.venv/lib/python3.12/site-packages/pdm-2.19.1.dist-info").is_some());
        assert!(check_path("project/.pdm-python").is_some());
    }

    #[test]
    fn test_directory_reported_once() {
        let violations = check_paths(["project/.git", "project/.git/HEAD", "project/.git/config"]);
        assert_eq!(violations.len(), 1);
        assert_eq!(violations[0].to_string(), "/project/.git (version control metadata)");
    }

    #[test]
    fn test_check_rootfs() {
        let tmp = TempDir::new().unwrap();
        std::fs::create_dir_all(tmp.path().join("project/src/app")).unwrap();
        std::fs::write(tmp.path().join("project/src/app/main.py"), "").unwrap();
        assert!(check_rootfs(tmp.path()).unwrap().is_empty());

        std::fs::write(tmp.path().join("project/pdm.lock"), "").unwrap();
        let violations = check_rootfs(tmp.path()).unwrap();
        let err = ensure_minimal(&violations).unwrap_err();
        assert!(matches!(err, BuildliteError::Layout(_)));
        assert!(err.to_string().contains("/project/pdm.lock"));
    }
}

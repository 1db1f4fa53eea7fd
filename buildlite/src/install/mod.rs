//! Resolved environment installation.
//!
//! An [`Installer`] lays the production closure down into a staging
//! directory. [`build_environment`] then checks that exactly the closure was
//! installed, writes the [`EnvironmentRecord`] and moves the staging
//! directory into place, so a failed install never leaves a usable
//! environment behind.

pub mod cache;
mod index;
mod pdm;
mod record;
mod venv;

pub use cache::{CacheKeyInputs, EnvCache, PruneReport};
pub use index::IndexInstaller;
pub use pdm::{PDM_ENV, PDM_INSTALL_ARGS, PdmInstaller};
pub use record::{ENV_RECORD_FILE, EnvironmentRecord, InstalledPackage, scan_installed};
pub use venv::{BASE_PYTHON_HOME, VenvLayout};

use crate::fs::{publish_dir, sibling_path};
use crate::project::{Lockfile, ProjectManifest, ResolvedSet};
use async_trait::async_trait;
use buildlite_shared::errors::{BuildliteError, BuildliteResult};
use std::path::{Path, PathBuf};

/// The dependency-management tool an installer drives.
#[derive(Debug, Clone)]
pub struct ToolInfo {
    pub name: String,
    pub version: Option<String>,
    pub location: Option<PathBuf>,
}

/// Everything an installer needs for one install.
pub struct InstallRequest<'a> {
    /// Staged project directory (manifest, lockfile, sources).
    pub project_dir: &'a Path,
    pub manifest: &'a ProjectManifest,
    pub lock: &'a Lockfile,
    pub closure: &'a ResolvedSet,
    pub extras: &'a [String],
    /// Staging environment to install into.
    pub venv: &'a VenvLayout,
}

/// Installer backend.
#[async_trait]
pub trait Installer: Send + Sync {
    fn name(&self) -> &str;

    /// Locate and check the tool before any input is staged.
    async fn prepare(&self) -> BuildliteResult<ToolInfo>;

    /// Install the closure and the project into `request.venv`.
    ///
    /// Returns the project's own installed distribution, if it was installed.
    async fn install(&self, request: &InstallRequest<'_>)
    -> BuildliteResult<Option<InstalledPackage>>;
}

/// A finished, self-contained environment.
#[derive(Debug, Clone)]
pub struct ResolvedEnvironment {
    pub path: PathBuf,
    pub record: EnvironmentRecord,
}

impl ResolvedEnvironment {
    /// Open an environment written by [`build_environment`].
    pub fn open(path: &Path) -> BuildliteResult<Self> {
        Ok(Self {
            path: path.to_path_buf(),
            record: EnvironmentRecord::load(path)?,
        })
    }
}

/// Inputs of one environment build.
pub struct EnvironmentSpec<'a> {
    pub project_dir: &'a Path,
    pub manifest: &'a ProjectManifest,
    pub lock: &'a Lockfile,
    pub closure: &'a ResolvedSet,
    pub extras: &'a [String],
    /// Where the environment lives inside the image.
    pub image_path: &'a str,
    /// Interpreter version of the base image.
    pub python_full_version: &'a str,
}

/// Install into a staging sibling of `dest` and publish it as `dest`.
pub async fn build_environment(
    installer: &dyn Installer,
    spec: &EnvironmentSpec<'_>,
    dest: &Path,
) -> BuildliteResult<ResolvedEnvironment> {
    let staging = sibling_path(dest, "staging");
    let venv = VenvLayout::new(&staging, spec.image_path, spec.python_full_version);

    let record = match install_into(installer, spec, &venv).await {
        Ok(record) => record,
        Err(e) => {
            if staging.exists()
                && let Err(cleanup) = std::fs::remove_dir_all(&staging)
            {
                tracing::warn!(path = %staging.display(), "Failed to remove staging environment: {}", cleanup);
            }
            return Err(e);
        }
    };

    publish_dir(&staging, dest)?;
    tracing::info!(
        path = %dest.display(),
        packages = record.packages.len(),
        installer = %record.installer,
        "Resolved environment ready"
    );

    Ok(ResolvedEnvironment {
        path: dest.to_path_buf(),
        record,
    })
}

async fn install_into(
    installer: &dyn Installer,
    spec: &EnvironmentSpec<'_>,
    venv: &VenvLayout,
) -> BuildliteResult<EnvironmentRecord> {
    let request = InstallRequest {
        project_dir: spec.project_dir,
        manifest: spec.manifest,
        lock: spec.lock,
        closure: spec.closure,
        extras: spec.extras,
        venv,
    };
    let project = installer.install(&request).await?;

    let packages: Vec<InstalledPackage> = scan_installed(&venv.site_packages())?
        .into_iter()
        .filter(|p| p.name != spec.manifest.name && !is_seeded(p, spec.closure))
        .collect();
    check_installed_matches(spec.closure, &packages)?;

    let record = EnvironmentRecord {
        installer: installer.name().to_string(),
        python_version: venv_python_version(venv),
        packages,
        project,
        extras: spec.extras.to_vec(),
        lock_hash: spec.lock.metadata.content_hash.clone(),
        closure_digest: spec.closure.digest(),
    };
    record.write(venv.root())?;
    Ok(record)
}

/// Installer tooling some environment creators seed into every venv.
const SEEDED_PACKAGES: &[&str] = &["pip", "setuptools", "wheel"];

fn is_seeded(package: &InstalledPackage, closure: &ResolvedSet) -> bool {
    SEEDED_PACKAGES.contains(&package.name.as_str()) && !closure.contains(package.name.as_str())
}

fn venv_python_version(venv: &VenvLayout) -> String {
    std::fs::read_to_string(venv.pyvenv_cfg())
        .ok()
        .and_then(|cfg| {
            cfg.lines()
                .filter_map(|l| l.split_once('='))
                .find(|(k, _)| matches!(k.trim(), "version" | "version_info"))
                .map(|(_, v)| v.trim().to_string())
        })
        .unwrap_or_else(|| venv.python_short_version())
}

/// The environment must hold exactly the closure: nothing missing, no
/// other version, and nothing extra (a development package that slipped in).
fn check_installed_matches(
    closure: &ResolvedSet,
    installed: &[InstalledPackage],
) -> BuildliteResult<()> {
    let mut problems = Vec::new();

    for package in closure.iter() {
        match installed.iter().find(|p| p.name == package.name) {
            None => problems.push(format!("{} was not installed", package.name)),
            Some(p) if p.version != package.version => problems.push(format!(
                "{} installed at {} but locked at {}",
                package.name, p.version, package.version
            )),
            Some(_) => {}
        }
    }
    for p in installed {
        if !closure.contains(p.name.as_str()) {
            problems.push(format!("{} is installed but not part of the production closure", p.pin()));
        }
    }

    if problems.is_empty() {
        Ok(())
    } else {
        Err(BuildliteError::Install(problems.join("; ")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::project::{ClosureOptions, MarkerEnvironment, PackageName, resolve_production};
    use std::fs;
    use tempfile::TempDir;

    const PYPROJECT: &str = r#"
[project]
name = "demo"
version = "0.1.0"
dependencies = ["foo>=1.0"]

[project.scripts]
demo = "demo.cli:main"

[tool.pdm.dev-dependencies]
dev = ["pytest==8.0"]
"#;

    const LOCK: &str = r#"
[metadata]
groups = ["default", "dev"]
lock_version = "4.5.0"
content_hash = "sha256:test"

[[package]]
name = "foo"
version = "1.2.0"
groups = ["default"]

[[package]]
name = "pytest"
version = "8.0"
groups = ["dev"]
"#;

    struct Fixture {
        tmp: TempDir,
        project: PathBuf,
        index: PathBuf,
        out: PathBuf,
        manifest: ProjectManifest,
        lock: Lockfile,
        closure: ResolvedSet,
    }

    fn fixture() -> Fixture {
        let tmp = TempDir::new().unwrap();
        let project = tmp.path().join("project");
        fs::create_dir_all(project.join("src/demo")).unwrap();
        fs::write(project.join("src/demo/__init__.py"), "").unwrap();
        fs::write(project.join("src/demo/cli.py"), "def main(): pass\n").unwrap();

        let index = tmp.path().join("index");
        fs::create_dir_all(index.join("foo/1.2.0/foo")).unwrap();
        fs::write(index.join("foo/1.2.0/foo/__init__.py"), "VERSION = '1.2.0'\n").unwrap();
        fs::write(
            index.join("foo/1.2.0/entry_points.txt"),
            "[console_scripts]\nfoo = foo:main\n",
        )
        .unwrap();
        fs::create_dir_all(index.join("pytest/8.0/pytest")).unwrap();

        let manifest = ProjectManifest::from_toml(PYPROJECT).unwrap();
        let lock = Lockfile::from_toml(LOCK).unwrap();
        let closure = resolve_production(
            &manifest,
            &lock,
            &ClosureOptions {
                extras: vec![],
                env: MarkerEnvironment::linux_cpython("3.12", "x86_64"),
            },
        )
        .unwrap();

        Fixture {
            out: tmp.path().join("out/.venv"),
            tmp,
            project,
            index,
            manifest,
            lock,
            closure,
        }
    }

    fn spec(f: &Fixture) -> EnvironmentSpec<'_> {
        EnvironmentSpec {
            project_dir: &f.project,
            manifest: &f.manifest,
            lock: &f.lock,
            closure: &f.closure,
            extras: &[],
            image_path: "/project/.venv",
            python_full_version: "3.12.0",
        }
    }

    #[tokio::test]
    async fn test_index_install_production_only() {
        let f = fixture();
        let installer = IndexInstaller::new(&f.index);
        installer.prepare().await.unwrap();

        let env = build_environment(&installer, &spec(&f), &f.out).await.unwrap();
        assert_eq!(env.record.pins(), vec!["foo==1.2.0"]);
        assert!(!env.record.contains("pytest"));
        assert_eq!(env.record.project.as_ref().unwrap().pin(), "demo==0.1.0");

        let site = f.out.join("lib/python3.12/site-packages");
        assert!(site.join("foo/__init__.py").exists());
        assert!(site.join("demo/cli.py").exists());
        assert!(!site.join("pytest").exists());
        assert!(f.out.join("bin/foo").exists());
        assert!(f.out.join("bin/demo").exists());

        let reopened = ResolvedEnvironment::open(&f.out).unwrap();
        assert_eq!(reopened.record, env.record);
    }

    #[tokio::test]
    async fn test_missing_index_entry_leaves_nothing() {
        let f = fixture();
        fs::remove_dir_all(f.index.join("foo")).unwrap();
        let installer = IndexInstaller::new(&f.index);

        let err = build_environment(&installer, &spec(&f), &f.out).await.unwrap_err();
        assert!(matches!(err, BuildliteError::Resolution(_)));
        assert!(!f.out.exists());

        let leftovers: Vec<_> = fs::read_dir(f.out.parent().unwrap())
            .map(|rd| rd.collect())
            .unwrap_or_default();
        assert!(leftovers.is_empty());
    }

    #[test]
    fn test_extra_package_rejected() {
        let f = fixture();
        let installed = vec![
            InstalledPackage {
                name: PackageName::new("foo"),
                version: "1.2.0".into(),
            },
            InstalledPackage {
                name: PackageName::new("pytest"),
                version: "8.0".into(),
            },
        ];
        let err = check_installed_matches(&f.closure, &installed).unwrap_err();
        assert!(err.to_string().contains("pytest==8.0"));
    }

    /// A `pdm` stand-in that lays out an in-project `.venv` the way PDM does
    /// on a build host whose interpreter lives in `/opt/hostpython`.
    fn fake_pdm(dir: &Path, host_python: &str) -> PathBuf {
        use std::os::unix::fs::PermissionsExt;

        let script = format!(
            r#"#!/bin/sh
if [ "$1" = "--version" ]; then echo "PDM, version 2.19.1"; exit 0; fi
venv="$(pwd)/.venv"
site="$venv/lib/python3.12/site-packages"
mkdir -p "$venv/bin" "$site/foo" "$site/foo-1.2.0.dist-info" "$site/demo-0.1.0.dist-info"
printf 'home = /opt/hostpython/bin\nversion = {host_python}\n' > "$venv/pyvenv.cfg"
ln -s /opt/hostpython/bin/python3.12 "$venv/bin/python"
printf 'Name: foo\nVersion: 1.2.0\n' > "$site/foo-1.2.0.dist-info/METADATA"
printf 'Name: demo\nVersion: 0.1.0\n' > "$site/demo-0.1.0.dist-info/METADATA"
printf '#!%s/bin/python\nimport sys\n' "$venv" > "$venv/bin/demo"
chmod +x "$venv/bin/demo"
"#
        );
        let path = dir.join("pdm");
        fs::write(&path, script).unwrap();
        fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).unwrap();
        path
    }

    #[tokio::test]
    async fn test_pdm_environment_runs_on_base_interpreter() {
        let f = fixture();
        let installer = PdmInstaller::new(fake_pdm(f.tmp.path(), "3.12.3"));
        installer.prepare().await.unwrap();

        let env = build_environment(&installer, &spec(&f), &f.out).await.unwrap();
        assert_eq!(env.record.pins(), vec!["foo==1.2.0"]);
        assert_eq!(env.record.python_version, "3.12.0");
        assert_eq!(env.record.project.as_ref().unwrap().pin(), "demo==0.1.0");

        let python = fs::read_link(f.out.join("bin/python")).unwrap();
        assert!(python.starts_with("/usr/local/bin"), "{}", python.display());
        let cfg = fs::read_to_string(f.out.join("pyvenv.cfg")).unwrap();
        assert!(cfg.contains("home = /usr/local/bin"));
        let launcher = fs::read_to_string(f.out.join("bin/demo")).unwrap();
        assert!(launcher.starts_with("#!/project/.venv/bin/python\n"));
        assert!(!f.project.join(".venv").exists());
    }

    #[tokio::test]
    async fn test_pdm_environment_on_other_interpreter_rejected() {
        let f = fixture();
        let installer = PdmInstaller::new(fake_pdm(f.tmp.path(), "3.11.9"));

        let err = build_environment(&installer, &spec(&f), &f.out).await.unwrap_err();
        assert!(matches!(err, BuildliteError::Install(_)));
        assert!(!f.out.exists());
    }
}

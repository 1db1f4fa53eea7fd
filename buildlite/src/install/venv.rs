//! Virtual environment layout.
//!
//! The environment is built on the host under a staging directory but must
//! run at its image path (`/project/.venv`), so everything that embeds a
//! path (launcher shebangs, `pyvenv.cfg`) uses `image_path`.

use buildlite_shared::errors::{BuildliteError, BuildliteResult};
use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

/// Interpreter location in the official `python:*` images.
pub const BASE_PYTHON_HOME: &str = "/usr/local/bin";

#[derive(Debug, Clone)]
pub struct VenvLayout {
    root: PathBuf,
    image_path: String,
    python_full_version: String,
}

impl VenvLayout {
    /// # Arguments
    ///
    /// * `root` - host directory the environment is written to
    /// * `image_path` - absolute path of the environment inside the image
    /// * `python_full_version` - interpreter version of the base image (`3.12.0`)
    pub fn new(
        root: impl Into<PathBuf>,
        image_path: impl Into<String>,
        python_full_version: impl Into<String>,
    ) -> Self {
        Self {
            root: root.into(),
            image_path: image_path.into(),
            python_full_version: python_full_version.into(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn image_path(&self) -> &str {
        &self.image_path
    }

    /// `3.12` from `3.12.4`.
    pub fn python_short_version(&self) -> String {
        short_version(&self.python_full_version)
    }

    pub fn bin_dir(&self) -> PathBuf {
        self.root.join("bin")
    }

    pub fn site_packages(&self) -> PathBuf {
        self.root
            .join("lib")
            .join(format!("python{}", self.python_short_version()))
            .join("site-packages")
    }

    pub fn pyvenv_cfg(&self) -> PathBuf {
        self.root.join("pyvenv.cfg")
    }

    /// Interpreter path inside the image.
    pub fn image_python(&self) -> String {
        format!("{}/bin/python", self.image_path)
    }

    /// Create the environment skeleton: directories, `pyvenv.cfg` and the
    /// `python` links to the base interpreter.
    pub fn create(&self) -> BuildliteResult<()> {
        fs::create_dir_all(self.bin_dir())?;
        fs::create_dir_all(self.site_packages())?;

        fs::write(
            self.pyvenv_cfg(),
            format!(
                "home = {}\ninclude-system-site-packages = false\nversion = {}\n",
                BASE_PYTHON_HOME, self.python_full_version
            ),
        )?;

        self.link_base_interpreter()?;

        // lib64 -> lib, as `python -m venv` lays it out on 64-bit Linux
        let lib64 = self.root.join("lib64");
        if lib64.symlink_metadata().is_err() {
            std::os::unix::fs::symlink("lib", &lib64)?;
        }

        Ok(())
    }

    /// Point `python`, `python3` and `python<X.Y>` at the base interpreter,
    /// replacing whatever links are already there.
    fn link_base_interpreter(&self) -> BuildliteResult<()> {
        let target = self.base_python();
        for link in [
            "python".to_string(),
            "python3".to_string(),
            format!("python{}", self.python_short_version()),
        ] {
            let path = self.bin_dir().join(link);
            if path.symlink_metadata().is_ok() {
                fs::remove_file(&path)?;
            }
            std::os::unix::fs::symlink(&target, &path)?;
        }
        Ok(())
    }

    fn base_python(&self) -> String {
        format!("{}/python{}", BASE_PYTHON_HOME, self.python_short_version())
    }

    /// Rebase an environment created on the build host at `host_root` onto
    /// the base image interpreter.
    ///
    /// The host interpreter must have the same `major.minor` version as the
    /// base image, otherwise `site-packages` and any compiled extensions
    /// would not match it.
    pub fn adopt_host_environment(&self, host_root: &Path) -> BuildliteResult<()> {
        let cfg = fs::read_to_string(self.pyvenv_cfg()).map_err(|e| {
            BuildliteError::Install(format!(
                "Unreadable {}: {}",
                self.pyvenv_cfg().display(),
                e
            ))
        })?;
        let host_version = pyvenv_value(&cfg, "version")
            .or_else(|| pyvenv_value(&cfg, "version_info"))
            .ok_or_else(|| {
                BuildliteError::Install(format!(
                    "{} does not record the interpreter version",
                    self.pyvenv_cfg().display()
                ))
            })?;
        if short_version(host_version) != self.python_short_version() {
            return Err(BuildliteError::Install(format!(
                "environment was created with Python {} but the base image runs Python {}",
                host_version, self.python_full_version
            )));
        }

        fs::write(self.pyvenv_cfg(), self.rebased_pyvenv_cfg(&cfg))?;
        self.link_base_interpreter()?;
        self.relocate_shebangs(host_root)?;

        tracing::debug!(
            host_version = %host_version,
            image_path = %self.image_path,
            "Rebased environment onto base interpreter"
        );
        Ok(())
    }

    fn rebased_pyvenv_cfg(&self, cfg: &str) -> String {
        let mut out = String::new();
        for line in cfg.lines() {
            let key = line.split_once('=').map(|(k, _)| k.trim());
            let rewritten = match key {
                Some("home") => format!("home = {}", BASE_PYTHON_HOME),
                Some("executable") => format!("executable = {}", self.base_python()),
                Some(k @ ("version" | "version_info")) => {
                    format!("{} = {}", k, self.python_full_version)
                }
                // Host command line that created the environment.
                Some("command") => continue,
                _ => line.to_string(),
            };
            out.push_str(&rewritten);
            out.push('\n');
        }
        out
    }

    /// Write a console-script launcher for `entry` (`module:attr`).
    pub fn write_launcher(&self, name: &str, entry: &str) -> BuildliteResult<PathBuf> {
        let (module, attr) = entry.split_once(':').ok_or_else(|| {
            BuildliteError::Install(format!(
                "invalid entry point '{}' for script '{}': expected module:attr",
                entry, name
            ))
        })?;
        let attr = attr.split_whitespace().next().unwrap_or_default();
        let head = attr.split('.').next().unwrap_or(attr);
        if module.trim().is_empty() || head.is_empty() {
            return Err(BuildliteError::Install(format!(
                "invalid entry point '{}' for script '{}'",
                entry, name
            )));
        }

        let script = format!(
            "#!{python}\n\
             # -*- coding: utf-8 -*-\n\
             import re\n\
             import sys\n\
             from {module} import {head}\n\
             if __name__ == \"__main__\":\n    \
                 sys.argv[0] = re.sub(r\"(-script\\.pyw|\\.exe)?$\", \"\", sys.argv[0])\n    \
                 sys.exit({attr}())\n",
            python = self.image_python(),
            module = module.trim(),
            head = head,
            attr = attr,
        );

        let path = self.bin_dir().join(name);
        fs::write(&path, script)?;
        fs::set_permissions(&path, fs::Permissions::from_mode(0o755))?;
        Ok(path)
    }

    /// Rewrite shebangs that point at `host_root` to the image path.
    ///
    /// Returns the number of launchers rewritten.
    pub fn relocate_shebangs(&self, host_root: &Path) -> BuildliteResult<usize> {
        let host = host_root.to_string_lossy().into_owned();
        let mut rewritten = 0;

        for entry in fs::read_dir(self.bin_dir())? {
            let path = entry?.path();
            if path.symlink_metadata()?.file_type().is_symlink() || !path.is_file() {
                continue;
            }
            let Ok(content) = fs::read_to_string(&path) else {
                continue; // binary
            };
            let Some((first, rest)) = content.split_once('\n') else {
                continue;
            };
            if !first.starts_with("#!") || !first.contains(&host) {
                continue;
            }

            let mode = fs::metadata(&path)?.permissions().mode();
            fs::write(&path, format!("{}\n{}", first.replace(&host, &self.image_path), rest))?;
            fs::set_permissions(&path, fs::Permissions::from_mode(mode))?;
            rewritten += 1;
        }

        if rewritten > 0 {
            tracing::debug!(rewritten, image_path = %self.image_path, "Relocated launcher shebangs");
        }
        Ok(rewritten)
    }
}

fn pyvenv_value<'a>(cfg: &'a str, key: &str) -> Option<&'a str> {
    cfg.lines()
        .filter_map(|l| l.split_once('='))
        .find(|(k, _)| k.trim() == key)
        .map(|(_, v)| v.trim())
}

fn short_version(version: &str) -> String {
    version.split('.').take(2).collect::<Vec<_>>().join(".")
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_skeleton() {
        let tmp = TempDir::new().unwrap();
        let venv = VenvLayout::new(tmp.path().join(".venv"), "/project/.venv", "3.12.4");
        venv.create().unwrap();

        assert!(venv.root().join("lib/python3.12/site-packages").is_dir());
        let cfg = fs::read_to_string(venv.pyvenv_cfg()).unwrap();
        assert!(cfg.contains("version = 3.12.4"));
        assert_eq!(
            fs::read_link(venv.bin_dir().join("python")).unwrap(),
            PathBuf::from("/usr/local/bin/python3.12")
        );
    }

    #[test]
    fn test_launcher() {
        let tmp = TempDir::new().unwrap();
        let venv = VenvLayout::new(tmp.path().join(".venv"), "/project/.venv", "3.12.0");
        venv.create().unwrap();

        let path = venv.write_launcher("uvicorn", "uvicorn.main:main").unwrap();
        let script = fs::read_to_string(&path).unwrap();
        assert!(script.starts_with("#!/project/.venv/bin/python\n"));
        assert!(script.contains("from uvicorn.main import main"));
        assert!(script.contains("sys.exit(main())"));
        assert!(venv.write_launcher("bad", "no_colon").is_err());
    }

    #[test]
    fn test_relocate_shebangs() {
        let tmp = TempDir::new().unwrap();
        let host_root = tmp.path().join("build/.venv");
        let venv = VenvLayout::new(&host_root, "/project/.venv", "3.12.0");
        venv.create().unwrap();
        fs::write(
            venv.bin_dir().join("tool"),
            format!("#!{}/bin/python\nprint(1)\n", host_root.display()),
        )
        .unwrap();

        assert_eq!(venv.relocate_shebangs(&host_root).unwrap(), 1);
        let script = fs::read_to_string(venv.bin_dir().join("tool")).unwrap();
        assert_eq!(script, "#!/project/.venv/bin/python\nprint(1)\n");
    }

    #[test]
    fn test_adopt_host_environment() {
        let tmp = TempDir::new().unwrap();
        let host_root = tmp.path().join("build/.venv");
        let bin = host_root.join("bin");
        fs::create_dir_all(&bin).unwrap();
        fs::write(
            host_root.join("pyvenv.cfg"),
            "home = /opt/hostpython/bin\n\
             include-system-site-packages = false\n\
             version = 3.12.3\n\
             executable = /opt/hostpython/bin/python3.12\n\
             command = /opt/hostpython/bin/python3.12 -m venv /build/.venv\n",
        )
        .unwrap();
        std::os::unix::fs::symlink("/opt/hostpython/bin/python3.12", bin.join("python")).unwrap();
        std::os::unix::fs::symlink("python", bin.join("python3")).unwrap();
        std::os::unix::fs::symlink("python", bin.join("python3.12")).unwrap();
        fs::write(
            bin.join("uvicorn"),
            format!("#!{}/bin/python\nimport uvicorn\n", host_root.display()),
        )
        .unwrap();

        let venv = VenvLayout::new(&host_root, "/project/.venv", "3.12.0");
        venv.adopt_host_environment(&host_root).unwrap();

        for link in ["python", "python3", "python3.12"] {
            assert_eq!(
                fs::read_link(bin.join(link)).unwrap(),
                PathBuf::from("/usr/local/bin/python3.12")
            );
        }
        let cfg = fs::read_to_string(venv.pyvenv_cfg()).unwrap();
        assert!(cfg.contains("home = /usr/local/bin\n"));
        assert!(cfg.contains("version = 3.12.0\n"));
        assert!(cfg.contains("executable = /usr/local/bin/python3.12\n"));
        assert!(!cfg.contains("/opt/hostpython"));
        let script = fs::read_to_string(bin.join("uvicorn")).unwrap();
        assert!(script.starts_with("#!/project/.venv/bin/python\n"));
    }

    #[test]
    fn test_adopt_rejects_other_interpreter() {
        let tmp = TempDir::new().unwrap();
        let root = tmp.path().join(".venv");
        fs::create_dir_all(root.join("bin")).unwrap();
        fs::write(root.join("pyvenv.cfg"), "home = /usr/bin\nversion = 3.11.9\n").unwrap();

        let venv = VenvLayout::new(&root, "/project/.venv", "3.12.0");
        let err = venv.adopt_host_environment(&root).unwrap_err();
        assert!(matches!(err, BuildliteError::Install(_)));
        assert!(err.to_string().contains("3.11.9"));
    }
}

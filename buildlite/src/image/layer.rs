//! Deterministic gzip tar layers.
//!
//! Entries are written in path order with fixed ownership (0:0), a fixed
//! mtime and normalized modes (0o755 for directories and executables, 0o644
//! otherwise), so identical trees produce byte-identical layers.

use buildlite_shared::errors::{BuildliteError, BuildliteResult};
use flate2::Compression;
use flate2::write::GzEncoder;
use sha2::{Digest, Sha256};
use std::fs::{self, File};
use std::io::Write;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use tar::{EntryType, Header};
use walkdir::WalkDir;

/// One layer of the exported image.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LayerDescriptor {
    /// `environment` or `source`.
    pub name: String,
    /// Digest of the compressed blob, `sha256:<hex>`.
    pub digest: String,
    /// Digest of the uncompressed tar, `sha256:<hex>`.
    pub diff_id: String,
    /// Size of the compressed blob.
    pub size: u64,
    /// Image path the layer carries (`/project/.venv`).
    pub image_path: String,
}

/// A built layer and its compressed bytes.
pub struct LayerBlob {
    pub descriptor: LayerDescriptor,
    pub bytes: Vec<u8>,
}

/// `sha256:<hex>` of `bytes`.
pub fn sha256_digest(bytes: &[u8]) -> String {
    format!("sha256:{}", hex::encode(Sha256::digest(bytes)))
}

/// Archive `<rootfs>/<image_path>` as a layer.
///
/// The parent directories of `image_path` are included so the layer
/// unpacks onto an empty filesystem.
pub fn build_layer(
    name: &str,
    rootfs: &Path,
    image_path: &str,
    mtime: u64,
) -> BuildliteResult<LayerBlob> {
    let rel = image_path.trim_matches('/');
    let source = rootfs.join(rel);
    if !source.is_dir() {
        return Err(BuildliteError::Layout(format!(
            "Cannot build {} layer: {} does not exist",
            name,
            source.display()
        )));
    }

    let mut builder = tar::Builder::new(Vec::new());
    builder.follow_symlinks(false);

    let mut ancestors: Vec<PathBuf> = Path::new(rel)
        .ancestors()
        .filter(|p| !p.as_os_str().is_empty() && *p != Path::new(rel))
        .map(Path::to_path_buf)
        .collect();
    ancestors.reverse();
    for dir in ancestors {
        append_dir(&mut builder, &dir, mtime)?;
    }

    for entry in WalkDir::new(&source).follow_links(false).sort_by_file_name() {
        let entry = entry.map_err(|e| {
            BuildliteError::Image(format!("Failed to walk {}: {}", source.display(), e))
        })?;
        let entry_rel = entry
            .path()
            .strip_prefix(rootfs)
            .map_err(|e| BuildliteError::Internal(e.to_string()))?;
        let meta = fs::symlink_metadata(entry.path())?;
        let file_type = meta.file_type();

        if file_type.is_dir() {
            append_dir(&mut builder, entry_rel, mtime)?;
        } else if file_type.is_symlink() {
            let target = fs::read_link(entry.path())?;
            let mut header = base_header(EntryType::Symlink, 0o777, mtime);
            header.set_size(0);
            builder
                .append_link(&mut header, entry_rel, &target)
                .map_err(|e| tar_err(entry_rel, e))?;
        } else if file_type.is_file() {
            let mode = if meta.permissions().mode() & 0o111 != 0 {
                0o755
            } else {
                0o644
            };
            let mut header = base_header(EntryType::Regular, mode, mtime);
            header.set_size(meta.len());
            let file = File::open(entry.path())?;
            builder
                .append_data(&mut header, entry_rel, file)
                .map_err(|e| tar_err(entry_rel, e))?;
        } else {
            tracing::debug!(path = %entry.path().display(), "Skipping special file in layer");
        }
    }

    let tar_bytes = builder
        .into_inner()
        .map_err(|e| BuildliteError::Image(format!("Failed to finish {} layer: {}", name, e)))?;
    let diff_id = sha256_digest(&tar_bytes);

    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(&tar_bytes)?;
    let bytes = encoder.finish()?;

    let descriptor = LayerDescriptor {
        name: name.to_string(),
        digest: sha256_digest(&bytes),
        diff_id,
        size: bytes.len() as u64,
        image_path: format!("/{}", rel),
    };
    tracing::debug!(
        layer = %name,
        digest = %descriptor.digest,
        size = descriptor.size,
        "Built layer"
    );

    Ok(LayerBlob { descriptor, bytes })
}

fn base_header(entry_type: EntryType, mode: u32, mtime: u64) -> Header {
    let mut header = Header::new_gnu();
    header.set_entry_type(entry_type);
    header.set_mode(mode);
    header.set_uid(0);
    header.set_gid(0);
    header.set_mtime(mtime);
    header
}

fn append_dir(builder: &mut tar::Builder<Vec<u8>>, rel: &Path, mtime: u64) -> BuildliteResult<()> {
    let mut header = base_header(EntryType::Directory, 0o755, mtime);
    header.set_size(0);
    builder
        .append_data(&mut header, rel, std::io::empty())
        .map_err(|e| tar_err(rel, e))
}

fn tar_err(path: &Path, e: std::io::Error) -> BuildliteError {
    BuildliteError::Image(format!("Failed to archive {}: {}", path.display(), e))
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::read::GzDecoder;
    use tempfile::TempDir;

    fn tree(root: &Path) {
        fs::create_dir_all(root.join("project/.venv/bin")).unwrap();
        fs::write(root.join("project/.venv/bin/uvicorn"), "#!/project/.venv/bin/python\n").unwrap();
        fs::set_permissions(
            root.join("project/.venv/bin/uvicorn"),
            fs::Permissions::from_mode(0o700),
        )
        .unwrap();
        std::os::unix::fs::symlink(
            "/usr/local/bin/python3.12",
            root.join("project/.venv/bin/python"),
        )
        .unwrap();
    }

    fn entries(bytes: &[u8]) -> Vec<(String, u32, u64)> {
        let mut archive = tar::Archive::new(GzDecoder::new(bytes));
        archive
            .entries()
            .unwrap()
            .map(|e| {
                let e = e.unwrap();
                let h = e.header();
                (
                    e.path()
                        .unwrap()
                        .to_string_lossy()
                        .trim_end_matches('/')
                        .to_string(),
                    h.mode().unwrap(),
                    h.mtime().unwrap(),
                )
            })
            .collect()
    }

    #[test]
    fn test_layer_is_reproducible() {
        let a = TempDir::new().unwrap();
        let b = TempDir::new().unwrap();
        tree(a.path());
        std::thread::sleep(std::time::Duration::from_millis(20));
        tree(b.path());

        let la = build_layer("environment", a.path(), "/project/.venv", 0).unwrap();
        let lb = build_layer("environment", b.path(), "/project/.venv", 0).unwrap();
        assert_eq!(la.descriptor.digest, lb.descriptor.digest);
        assert_eq!(la.descriptor.diff_id, lb.descriptor.diff_id);
        assert_eq!(la.bytes, lb.bytes);
    }

    #[test]
    fn test_layer_entries() {
        let tmp = TempDir::new().unwrap();
        tree(tmp.path());
        let layer = build_layer("environment", tmp.path(), "/project/.venv", 42).unwrap();

        let listed = entries(&layer.bytes);
        let names: Vec<&str> = listed.iter().map(|(p, _, _)| p.as_str()).collect();
        assert_eq!(
            names,
            vec![
                "project",
                "project/.venv",
                "project/.venv/bin",
                "project/.venv/bin/python",
                "project/.venv/bin/uvicorn",
            ]
        );
        let uvicorn = listed.iter().find(|(p, _, _)| p.ends_with("uvicorn")).unwrap();
        assert_eq!(uvicorn.1, 0o755);
        assert!(listed.iter().all(|(_, _, mtime)| *mtime == 42));
        assert_eq!(layer.descriptor.image_path, "/project/.venv");
    }

    #[test]
    fn test_missing_dir_is_layout_error() {
        let tmp = TempDir::new().unwrap();
        let err = build_layer("source", tmp.path(), "/project/src", 0).err().unwrap();
        assert!(matches!(err, BuildliteError::Layout(_)));
    }
}

//! Lockfile integrity check.
//!
//! Installation only proceeds when the lockfile still matches the manifest:
//! - the lock's `content_hash` equals the hash of the manifest's dependency
//!   sections (same scheme PDM uses: sorted-key JSON with Python separators)
//! - every requested group is present in the lock
//! - the image interpreter satisfies the lock's `requires_python`
//! - every applicable production requirement is pinned to a version that
//!   satisfies it
//!
//! Any failure is an [`BuildliteError::Integrity`]; all problems found are
//! reported at once.

use super::lockfile::Lockfile;
use super::manifest::ProjectManifest;
use super::marker::MarkerEnvironment;
use super::version::{SpecifierSet, Version};
use buildlite_shared::errors::{BuildliteError, BuildliteResult};
use serde::Serialize;
use serde_json::ser::Formatter;
use sha2::{Digest, Sha256};
use std::io;

pub const HASH_PREFIX: &str = "sha256:";

/// Result of a successful integrity check.
#[derive(Debug, Clone)]
pub struct IntegrityReport {
    pub content_hash: String,
    /// `name==version` of each production requirement that was checked.
    pub checked: Vec<String>,
    pub groups: Vec<String>,
}

/// Hash of the manifest sections a lock is resolved from.
///
/// Covers the tables exactly as written in `pyproject.toml`, which is what
/// PDM hashes when it writes the lock.
pub fn content_hash(manifest: &ProjectManifest) -> BuildliteResult<String> {
    let sections = &manifest.hash_sections;
    let data = serde_json::json!({
        "sources": sections.sources,
        "dependencies": sections.dependencies,
        "dev-dependencies": sections.dev_dependencies,
        "optional-dependencies": sections.optional_dependencies,
        "requires-python": manifest.requires_python.clone().unwrap_or_default(),
        "overrides": sections.overrides,
    });

    let mut buf = Vec::new();
    let mut ser = serde_json::Serializer::with_formatter(&mut buf, PythonJsonFormatter);
    data.serialize(&mut ser)?;

    Ok(format!("{}{}", HASH_PREFIX, hex::encode(Sha256::digest(&buf))))
}

/// Verify the lockfile against the manifest for a production install.
///
/// # Arguments
///
/// * `extras` - optional-dependency groups to install alongside `default`
/// * `env` - marker environment of the runtime interpreter
pub fn verify_lock(
    manifest: &ProjectManifest,
    lock: &Lockfile,
    extras: &[String],
    env: &MarkerEnvironment,
) -> BuildliteResult<IntegrityReport> {
    let requirements = manifest.production_requirements(extras)?;
    let mut problems = Vec::new();

    let expected = content_hash(manifest)?;
    if lock.metadata.content_hash != expected {
        problems.push(format!(
            "lockfile content hash {} does not match manifest hash {}; re-lock the project",
            lock.metadata.content_hash, expected
        ));
    }

    let mut groups = vec!["default".to_string()];
    groups.extend(extras.iter().cloned());
    for group in &groups {
        if !lock.has_group(group) {
            problems.push(format!("group '{}' is not in the lockfile", group));
        }
    }

    if let Some(requires_python) = lock.requires_python() {
        let spec = SpecifierSet::parse(requires_python).map_err(|e| {
            BuildliteError::Lockfile(format!("invalid requires_python in lockfile: {}", e))
        })?;
        let interpreter = Version::parse(&env.python_full_version)?;
        if !spec.contains(&interpreter) {
            problems.push(format!(
                "lockfile requires Python {} but the image interpreter is {}",
                requires_python, env.python_full_version
            ));
        }
    }

    let env = env.with_extras(extras);
    let mut checked = Vec::new();
    for req in requirements {
        if !req.applies(&env) {
            continue;
        }

        let mut pinned = None;
        for entry in lock.entries(&req.name) {
            if entry.applies(&env)? {
                pinned = Some(entry);
                break;
            }
        }

        let Some(entry) = pinned else {
            problems.push(format!("'{}' is required by the manifest but not locked", req.name));
            continue;
        };

        let version = entry.parsed_version()?;
        if req.url.is_none() && !req.specifiers.contains(&version) {
            problems.push(format!(
                "locked {}=={} does not satisfy manifest requirement '{}'",
                req.name, entry.version, req
            ));
            continue;
        }

        let missing_extras: Vec<&String> = req
            .extras
            .iter()
            .filter(|extra| {
                !lock
                    .entries(&req.name)
                    .any(|e| e.extra_set().contains(extra.as_str()))
            })
            .collect();
        if !missing_extras.is_empty() {
            problems.push(format!(
                "extras {:?} of '{}' are not locked",
                missing_extras, req.name
            ));
            continue;
        }

        checked.push(format!("{}=={}", req.name, entry.version));
    }

    if !problems.is_empty() {
        tracing::error!(problems = problems.len(), "Lockfile integrity check failed");
        return Err(BuildliteError::Integrity(problems.join("; ")));
    }

    checked.sort();
    tracing::debug!(content_hash = %expected, checked = checked.len(), "Lockfile matches manifest");

    Ok(IntegrityReport {
        content_hash: expected,
        checked,
        groups,
    })
}

/// JSON formatting that matches Python's `json.dumps` defaults
/// (`", "` / `": "` separators, non-ASCII escaped).
struct PythonJsonFormatter;

impl Formatter for PythonJsonFormatter {
    fn begin_array_value<W>(&mut self, writer: &mut W, first: bool) -> io::Result<()>
    where
        W: ?Sized + io::Write,
    {
        if first { Ok(()) } else { writer.write_all(b", ") }
    }

    fn begin_object_key<W>(&mut self, writer: &mut W, first: bool) -> io::Result<()>
    where
        W: ?Sized + io::Write,
    {
        if first { Ok(()) } else { writer.write_all(b", ") }
    }

    fn begin_object_value<W>(&mut self, writer: &mut W) -> io::Result<()>
    where
        W: ?Sized + io::Write,
    {
        writer.write_all(b": ")
    }

    fn write_string_fragment<W>(&mut self, writer: &mut W, fragment: &str) -> io::Result<()>
    where
        W: ?Sized + io::Write,
    {
        for c in fragment.chars() {
            if c.is_ascii() {
                writer.write_all(&[c as u8])?;
            } else {
                let mut units = [0u16; 2];
                for unit in c.encode_utf16(&mut units) {
                    write!(writer, "\\u{:04x}", unit)?;
                }
            }
        }
        Ok(())
    }
}

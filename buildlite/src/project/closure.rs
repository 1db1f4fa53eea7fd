//! Production dependency closure.
//!
//! Walks the lockfile from the manifest's production requirements, following
//! each locked package's `dependencies`. Development groups are never
//! roots, so packages only reachable from them are excluded. Nothing is
//! resolved here: every package must already be pinned in the lockfile.

use super::lockfile::Lockfile;
use super::manifest::ProjectManifest;
use super::marker::MarkerEnvironment;
use super::name::PackageName;
use super::requirement::Requirement;
use super::version::Version;
use buildlite_shared::errors::{BuildliteError, BuildliteResult};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, BTreeSet, VecDeque};

/// Selection of what to install.
#[derive(Debug, Clone)]
pub struct ClosureOptions {
    /// Optional-dependency groups installed alongside `default`.
    pub extras: Vec<String>,
    /// Interpreter and platform of the runtime image.
    pub env: MarkerEnvironment,
}

/// One pinned package of the closure.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResolvedPackage {
    pub name: PackageName,
    pub version: String,
    /// Extras of this package that were requested somewhere in the graph.
    #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
    pub extras: BTreeSet<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub hashes: Vec<String>,
    #[serde(default)]
    pub direct: bool,
}

/// Ordered set of packages to install.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResolvedSet {
    packages: BTreeMap<PackageName, ResolvedPackage>,
}

impl ResolvedSet {
    pub fn len(&self) -> usize {
        self.packages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.packages.is_empty()
    }

    pub fn get(&self, name: &str) -> Option<&ResolvedPackage> {
        self.packages.get(&PackageName::new(name))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    pub fn iter(&self) -> impl Iterator<Item = &ResolvedPackage> {
        self.packages.values()
    }

    /// `name==version` for every package, sorted by name.
    pub fn pins(&self) -> Vec<String> {
        self.packages
            .values()
            .map(|p| format!("{}=={}", p.name, p.version))
            .collect()
    }

    /// Digest of the pinned version set.
    pub fn digest(&self) -> String {
        let mut hasher = Sha256::new();
        for pin in self.pins() {
            hasher.update(pin.as_bytes());
            hasher.update(b"\n");
        }
        hex::encode(hasher.finalize())
    }
}

/// Compute the production closure of `manifest` from `lock`.
pub fn resolve_production(
    manifest: &ProjectManifest,
    lock: &Lockfile,
    options: &ClosureOptions,
) -> BuildliteResult<ResolvedSet> {
    let root_env = options.env.with_extras(&options.extras);

    let mut queue: VecDeque<(PackageName, BTreeSet<String>, String)> = VecDeque::new();
    for req in manifest.production_requirements(&options.extras)? {
        if req.applies(&root_env) {
            queue.push_back((req.name.clone(), req.extras.clone(), manifest.display_name.clone()));
        }
    }

    let mut seen: BTreeSet<(PackageName, BTreeSet<String>)> = BTreeSet::new();
    let mut set = ResolvedSet::default();

    while let Some((name, extras, required_by)) = queue.pop_front() {
        // self-references (`demo[extra]`) are satisfied by the project install
        if name == manifest.name {
            continue;
        }
        if !seen.insert((name.clone(), extras.clone())) {
            continue;
        }

        let entry = lock.find(&name, &extras, &options.env)?.ok_or_else(|| {
            let label = if extras.is_empty() {
                name.to_string()
            } else {
                let list: Vec<&str> = extras.iter().map(String::as_str).collect();
                format!("{}[{}]", name, list.join(","))
            };
            BuildliteError::Resolution(format!(
                "'{}' (required by {}) is not pinned in the lockfile",
                label, required_by
            ))
        })?;

        match set.packages.get_mut(&name) {
            Some(existing) if existing.version != entry.version => {
                return Err(BuildliteError::Resolution(format!(
                    "'{}' is locked at both {} and {}",
                    name, existing.version, entry.version
                )));
            }
            Some(existing) => existing.extras.extend(extras.iter().cloned()),
            None => {
                set.packages.insert(
                    name.clone(),
                    ResolvedPackage {
                        name: name.clone(),
                        version: entry.version.clone(),
                        extras: extras.clone(),
                        hashes: entry.hashes().into_iter().map(str::to_string).collect(),
                        direct: entry.is_direct(),
                    },
                );
            }
        }

        for raw in &entry.dependencies {
            let dep = Requirement::parse(raw).map_err(|e| {
                BuildliteError::Lockfile(format!("dependency of '{}': {}", entry.name, e))
            })?;
            if !dep.applies(&options.env) {
                continue;
            }
            queue.push_back((dep.name, dep.extras, format!("{}=={}", name, entry.version)));
        }
    }

    // locked dependency specifiers must agree with the pins they point at
    for package in set.packages.values() {
        let Some(entry) = lock.find(&package.name, &BTreeSet::new(), &options.env)? else {
            continue;
        };
        for raw in &entry.dependencies {
            let dep = Requirement::parse(raw)?;
            let Some(pinned) = set.packages.get(&dep.name) else {
                continue;
            };
            if dep.url.is_none() && !dep.specifiers.contains(&Version::parse(&pinned.version)?) {
                return Err(BuildliteError::Resolution(format!(
                    "{}=={} requires '{}' but {}=={} is locked",
                    package.name, package.version, dep, pinned.name, pinned.version
                )));
            }
        }
    }

    tracing::debug!(packages = set.len(), "Resolved production closure");
    Ok(set)
}

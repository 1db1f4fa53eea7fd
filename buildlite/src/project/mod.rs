//! Project inputs: manifest, lockfile and the checks between them.
//!
//! - `manifest`: `pyproject.toml` (abstract requirements)
//! - `lockfile`: `pdm.lock` (exact pins)
//! - `integrity`: does the lockfile still match the manifest
//! - `closure`: production dependency closure from the lockfile
//!
//! `version`, `marker` and `requirement` implement the subset of PEP 440 and
//! PEP 508 the checks need.

mod closure;
mod integrity;
mod lockfile;
mod manifest;
mod marker;
mod name;
mod requirement;
mod version;

pub use closure::{ClosureOptions, ResolvedPackage, ResolvedSet, resolve_production};
pub use integrity::{IntegrityReport, content_hash, verify_lock};
pub use lockfile::{LockMetadata, LockTarget, LockedFile, LockedPackage, Lockfile};
pub use manifest::{PackageSource, ProjectManifest};
pub use marker::{MarkerEnvironment, MarkerExpr};
pub use name::PackageName;
pub use requirement::Requirement;
pub use version::{Operator, SpecifierSet, Version, VersionSpecifier};

//! Artifacts handed from one pipeline task to the next.

use std::fmt;

/// Named output of a pipeline task.
///
/// Artifacts are the only channel between stages. A stage never reaches into
/// another stage's working state, it only consumes the artifacts that were
/// handed off.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ArtifactKind {
    /// Dependency tool located and configured for the builder.
    Toolchain,
    /// Manifest, lockfile, README and sources copied into the builder workdir.
    StagedInputs,
    /// Lockfile verified against the manifest.
    LockVerified,
    /// Installed production environment (the builder's only export).
    ResolvedEnvironment,
    /// Runtime filesystem (environment + sources).
    Rootfs,
    /// Environment variables, port and entrypoint for the runtime image.
    ProcessConfig,
    /// Rootfs checked for build-time leftovers.
    MinimalRootfs,
    /// Exported OCI image layout.
    ImageLayout,
}

impl ArtifactKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ArtifactKind::Toolchain => "toolchain",
            ArtifactKind::StagedInputs => "staged_inputs",
            ArtifactKind::LockVerified => "lock_verified",
            ArtifactKind::ResolvedEnvironment => "resolved_environment",
            ArtifactKind::Rootfs => "rootfs",
            ArtifactKind::ProcessConfig => "process_config",
            ArtifactKind::MinimalRootfs => "minimal_rootfs",
            ArtifactKind::ImageLayout => "image_layout",
        }
    }
}

impl fmt::Display for ArtifactKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

//! Build configuration, fixed names and on-disk layout.

pub mod constants;
pub mod layout;
pub mod options;

pub use layout::{BuildWorkspace, BuildliteHome};
pub use options::{BuildOptions, InstallerConfig};

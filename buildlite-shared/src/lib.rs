//! Types shared between the buildlite library, its CLI and the launch supervisor.

pub mod errors;

pub use errors::{BuildliteError, BuildliteResult};

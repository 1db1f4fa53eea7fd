//! In-image entrypoint: `buildlite launch` and `buildlite probe`.
//!
//! - `config`: `LaunchConfig`, read once from `BUILDLITE_*` variables
//! - `supervisor`: spawns the ASGI server, gates on readiness, forwards signals
//! - `probe`: TCP or HTTP health check

mod config;
mod probe;
mod supervisor;

pub use config::LaunchConfig;
pub use probe::{ProbeOptions, probe, wait_for_port};
pub use supervisor::Supervisor;

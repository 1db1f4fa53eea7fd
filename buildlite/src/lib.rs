//! Reproducible two-stage image builds for ASGI services.
//!
//! A builder stage verifies the lockfile and installs the production
//! dependency closure into a self-contained environment. A runtime stage
//! copies only that environment and the application sources into a minimal
//! root filesystem and exports it as an OCI image layout.
//!
//! ```ignore
//! let home = BuildliteHome::from_env()?;
//! let outcome = ImageBuilder::new(BuildOptions::load(&config)?, project_dir, out_dir, home)?
//!     .build()
//!     .await?;
//! ```

pub mod build;
pub mod db;
pub mod dockerfile;
pub mod fs;
pub mod image;
pub mod install;
pub mod launch;
pub mod pipeline;
pub mod project;
pub mod runtime;
pub mod util;

pub use build::{BuildOutcome, ImageBuilder};
pub use buildlite_shared::errors::{BuildliteError, BuildliteResult};
pub use launch::{LaunchConfig, ProbeOptions, Supervisor};
pub use runtime::{BuildOptions, BuildliteHome};

use std::sync::OnceLock;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, fmt};

/// Keeps the file writer flushing for the life of the process.
static LOG_GUARD: OnceLock<WorkerGuard> = OnceLock::new();

fn env_filter() -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
}

/// Log to stderr and to a daily file under `<home>/logs`.
///
/// Idempotent: only the first successful call installs a subscriber.
pub fn init_logging_for(home: &BuildliteHome) -> BuildliteResult<()> {
    if LOG_GUARD.get().is_some() {
        return Ok(());
    }

    let logs_dir = home.logs_dir();
    std::fs::create_dir_all(&logs_dir).map_err(|e| {
        BuildliteError::Storage(format!(
            "Failed to create log directory {}: {}",
            logs_dir.display(),
            e
        ))
    })?;
    let appender = RollingFileAppender::builder()
        .rotation(Rotation::DAILY)
        .filename_prefix("buildlite")
        .filename_suffix("log")
        .build(&logs_dir)
        .map_err(|e| {
            BuildliteError::Storage(format!(
                "Failed to open log file in {}: {}",
                logs_dir.display(),
                e
            ))
        })?;
    let (writer, guard) = tracing_appender::non_blocking(appender);

    let installed = tracing_subscriber::registry()
        .with(env_filter())
        .with(fmt::layer().with_writer(std::io::stderr).with_target(false))
        .with(fmt::layer().with_writer(writer).with_ansi(false))
        .try_init()
        .is_ok();
    if installed {
        let _ = LOG_GUARD.set(guard);
    }
    Ok(())
}

/// Log to stderr only. Used inside the runtime image.
pub fn init_logging() {
    let _ = tracing_subscriber::registry()
        .with(env_filter())
        .with(fmt::layer().with_writer(std::io::stderr).with_target(false))
        .try_init();
}

//! Fixed names and defaults.

pub mod envs {
    /// Overrides the home directory (`~/.buildlite`).
    pub const BUILDLITE_HOME: &str = "BUILDLITE_HOME";

    // Read by `buildlite launch` inside the image.
    pub const BUILDLITE_APP: &str = "BUILDLITE_APP";
    pub const BUILDLITE_HOST: &str = "BUILDLITE_HOST";
    pub const BUILDLITE_PORT: &str = "BUILDLITE_PORT";
    pub const BUILDLITE_WORKERS: &str = "BUILDLITE_WORKERS";
    pub const BUILDLITE_GRACEFUL_TIMEOUT: &str = "BUILDLITE_GRACEFUL_TIMEOUT";
    pub const BUILDLITE_STARTUP_TIMEOUT: &str = "BUILDLITE_STARTUP_TIMEOUT";
    pub const BUILDLITE_HEALTH_PATH: &str = "BUILDLITE_HEALTH_PATH";
    pub const BUILDLITE_SERVER: &str = "BUILDLITE_SERVER";

    pub const PATH: &str = "PATH";
    pub const PYTHONPATH: &str = "PYTHONPATH";
    pub const VIRTUAL_ENV: &str = "VIRTUAL_ENV";
    pub const PYTHONUNBUFFERED: &str = "PYTHONUNBUFFERED";
}

pub mod filenames {
    pub const MANIFEST: &str = "pyproject.toml";
    pub const LOCKFILE: &str = "pdm.lock";
    pub const README: &str = "README.md";
    pub const SOURCES: &str = "src";
    pub const CONFIG: &str = "buildlite.toml";
    pub const DB: &str = "buildlite.db";
    pub const SUPERVISOR: &str = "buildlite";
}

pub mod dirs {
    pub const DB: &str = "db";
    pub const LOGS: &str = "logs";
    pub const CACHE_ENVS: &str = "cache/envs";
    pub const BUILDS: &str = "builds";
}

pub mod defaults {
    pub const BASE_IMAGE: &str = "python:3.12-slim";
    pub const APP: &str = "quarto_backend.main:app";
    pub const SERVER: &str = "uvicorn";
    pub const HOST: &str = "0.0.0.0";
    pub const PORT: u16 = 8000;
    pub const WORKERS: u32 = 1;
    pub const GRACEFUL_TIMEOUT_SECS: u64 = 30;
    pub const STARTUP_TIMEOUT_SECS: u64 = 30;
    pub const HEALTH_PATH: &str = "/";
    pub const WORKDIR: &str = "/project";
    pub const ENV_DIR: &str = "/project/.venv";
    pub const SOURCE_DIR: &str = "/project/src";
    /// `PATH` of the official `python:*` images.
    pub const BASE_PATH: &str = "/usr/local/sbin:/usr/local/bin:/usr/sbin:/usr/bin:/sbin:/bin";
    pub const ARCH: &str = "amd64";
    pub const STOP_SIGNAL: &str = "SIGTERM";
    /// Where the supervisor binary is placed in the image.
    pub const SUPERVISOR_PATH: &str = "/usr/local/bin/buildlite";
}

pub mod labels {
    pub const BASE_NAME: &str = "org.opencontainers.image.base.name";
    pub const BASE_DIGEST: &str = "org.opencontainers.image.base.digest";
    pub const CREATED: &str = "org.opencontainers.image.created";
    pub const HEALTHCHECK: &str = "io.buildlite.healthcheck";
    pub const LOCK_HASH: &str = "io.buildlite.lock-hash";
    pub const ENV_DIGEST: &str = "io.buildlite.environment-digest";
}

//! Launch configuration.
//!
//! The build serializes a `LaunchConfig` into `BUILDLITE_*` image env vars;
//! `buildlite launch` reads them back exactly once at process start.

use crate::runtime::BuildOptions;
use crate::runtime::constants::{defaults, envs};
use buildlite_shared::errors::{BuildliteError, BuildliteResult};
use std::collections::BTreeMap;
use std::str::FromStr;
use std::time::Duration;

/// Environment variables handed through to the server process.
const PASSTHROUGH: [&str; 3] = [envs::PATH, envs::PYTHONPATH, envs::VIRTUAL_ENV];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchConfig {
    /// `module:attribute` of the ASGI application.
    pub app: String,
    pub server: String,
    pub host: String,
    pub port: u16,
    pub workers: u32,
    pub graceful_timeout: Duration,
    pub startup_timeout: Duration,
    pub health_path: String,
    pub env: BTreeMap<String, String>,
}

impl Default for LaunchConfig {
    fn default() -> Self {
        Self::from_options(&BuildOptions::default())
    }
}

impl LaunchConfig {
    pub fn from_options(options: &BuildOptions) -> Self {
        let env = BTreeMap::from([
            (
                envs::PATH.to_string(),
                format!("{}/bin:{}", options.env_dir, defaults::BASE_PATH),
            ),
            (envs::PYTHONPATH.to_string(), options.source_dir.clone()),
            (envs::VIRTUAL_ENV.to_string(), options.env_dir.clone()),
        ]);
        Self {
            app: options.app.clone(),
            server: options.server.clone(),
            host: options.host.clone(),
            port: options.port,
            workers: options.workers,
            graceful_timeout: Duration::from_secs(options.graceful_timeout_secs),
            startup_timeout: Duration::from_secs(options.startup_timeout_secs),
            health_path: options.health_path.clone(),
            env,
        }
    }

    /// Read the configuration from the process environment.
    pub fn from_env() -> BuildliteResult<Self> {
        Self::from_vars(std::env::vars())
    }

    /// Unset variables take their build defaults.
    pub fn from_vars<I, K, V>(vars: I) -> BuildliteResult<Self>
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        let vars: BTreeMap<String, String> = vars
            .into_iter()
            .map(|(k, v)| (k.into(), v.into()))
            .collect();
        let text = |key: &str, default: &str| {
            vars.get(key)
                .filter(|v| !v.is_empty())
                .cloned()
                .unwrap_or_else(|| default.to_string())
        };

        let config = Self {
            app: text(envs::BUILDLITE_APP, defaults::APP),
            server: text(envs::BUILDLITE_SERVER, defaults::SERVER),
            host: text(envs::BUILDLITE_HOST, defaults::HOST),
            port: parse_var(&vars, envs::BUILDLITE_PORT, defaults::PORT)?,
            workers: parse_var(&vars, envs::BUILDLITE_WORKERS, defaults::WORKERS)?,
            graceful_timeout: Duration::from_secs(parse_var(
                &vars,
                envs::BUILDLITE_GRACEFUL_TIMEOUT,
                defaults::GRACEFUL_TIMEOUT_SECS,
            )?),
            startup_timeout: Duration::from_secs(parse_var(
                &vars,
                envs::BUILDLITE_STARTUP_TIMEOUT,
                defaults::STARTUP_TIMEOUT_SECS,
            )?),
            health_path: text(envs::BUILDLITE_HEALTH_PATH, defaults::HEALTH_PATH),
            env: PASSTHROUGH
                .iter()
                .filter_map(|key| vars.get(*key).map(|v| (key.to_string(), v.clone())))
                .collect(),
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> BuildliteResult<()> {
        if !self.app.contains(':') {
            return Err(BuildliteError::Config(format!(
                "{} '{}' must be in module:attribute form",
                envs::BUILDLITE_APP,
                self.app
            )));
        }
        if self.port == 0 {
            return Err(BuildliteError::Config(format!(
                "{} must be non-zero",
                envs::BUILDLITE_PORT
            )));
        }
        if self.workers == 0 {
            return Err(BuildliteError::Config(format!(
                "{} must be at least 1",
                envs::BUILDLITE_WORKERS
            )));
        }
        if self.startup_timeout.is_zero() {
            return Err(BuildliteError::Config(format!(
                "{} must be at least 1",
                envs::BUILDLITE_STARTUP_TIMEOUT
            )));
        }
        Ok(())
    }

    /// `BUILDLITE_*` variables that round-trip through [`Self::from_vars`].
    pub fn to_env(&self) -> Vec<(String, String)> {
        vec![
            (envs::BUILDLITE_APP.to_string(), self.app.clone()),
            (envs::BUILDLITE_SERVER.to_string(), self.server.clone()),
            (envs::BUILDLITE_HOST.to_string(), self.host.clone()),
            (envs::BUILDLITE_PORT.to_string(), self.port.to_string()),
            (envs::BUILDLITE_WORKERS.to_string(), self.workers.to_string()),
            (
                envs::BUILDLITE_GRACEFUL_TIMEOUT.to_string(),
                self.graceful_timeout.as_secs().to_string(),
            ),
            (
                envs::BUILDLITE_STARTUP_TIMEOUT.to_string(),
                self.startup_timeout.as_secs().to_string(),
            ),
            (envs::BUILDLITE_HEALTH_PATH.to_string(), self.health_path.clone()),
        ]
    }

    /// `uvicorn <app> --host H --port P --workers N --timeout-graceful-shutdown S`
    pub fn server_argv(&self) -> Vec<String> {
        vec![
            self.server.clone(),
            self.app.clone(),
            "--host".into(),
            self.host.clone(),
            "--port".into(),
            self.port.to_string(),
            "--workers".into(),
            self.workers.to_string(),
            "--timeout-graceful-shutdown".into(),
            self.graceful_timeout.as_secs().to_string(),
        ]
    }

    /// Address to probe for readiness. Wildcard binds are reached via loopback.
    pub fn probe_host(&self) -> &str {
        match self.host.as_str() {
            "0.0.0.0" | "" => "127.0.0.1",
            "::" | "[::]" => "::1",
            host => host,
        }
    }
}

fn parse_var<T>(vars: &BTreeMap<String, String>, key: &str, default: T) -> BuildliteResult<T>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match vars.get(key).map(|v| v.trim()).filter(|v| !v.is_empty()) {
        None => Ok(default),
        Some(raw) => raw
            .parse()
            .map_err(|e| BuildliteError::Config(format!("invalid {} '{}': {}", key, raw, e))),
    }
}

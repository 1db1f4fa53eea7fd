//! ASGI server supervisor.
//!
//! Spawns the server, waits until its port accepts connections, forwards
//! termination signals and propagates the server's exit code.

use super::config::LaunchConfig;
use super::probe::wait_for_port;
use crate::util::{exit_code, send_signal};
use buildlite_shared::errors::{BuildliteError, BuildliteResult};
use nix::sys::signal::Signal;
use std::future::Future;
use std::process::ExitStatus;
use tokio::process::{Child, Command};
use tokio::signal::unix::{SignalKind, signal};
use tokio::time::{Instant, timeout};

pub struct Supervisor {
    config: LaunchConfig,
}

enum Starting {
    Exited(std::io::Result<ExitStatus>),
    Ready(bool),
    Shutdown(Signal),
}

enum Running {
    Exited(std::io::Result<ExitStatus>),
    Shutdown(Signal),
}

impl Supervisor {
    pub fn new(config: LaunchConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &LaunchConfig {
        &self.config
    }

    /// Run the server until it exits or SIGTERM/SIGINT is received.
    ///
    /// Returns the server's exit code. Fails with `Startup` if the server
    /// exits or stays unreachable before becoming ready.
    pub async fn run(&self) -> BuildliteResult<i32> {
        let mut term = signal(SignalKind::terminate())?;
        let mut int = signal(SignalKind::interrupt())?;
        let shutdown = async move {
            tokio::select! {
                _ = term.recv() => Signal::SIGTERM,
                _ = int.recv() => Signal::SIGINT,
            }
        };
        self.run_until(shutdown).await
    }

    /// Like [`Self::run`], with the shutdown trigger supplied by the caller.
    pub async fn run_until<F>(&self, shutdown: F) -> BuildliteResult<i32>
    where
        F: Future<Output = Signal>,
    {
        let mut child = self.spawn()?;
        let pid = child.id().ok_or_else(|| {
            BuildliteError::Startup(format!("{} exited immediately", self.config.server))
        })?;
        tracing::info!(
            pid,
            app = %self.config.app,
            port = self.config.port,
            workers = self.config.workers,
            "Server started"
        );

        tokio::pin!(shutdown);
        let deadline = Instant::now() + self.config.startup_timeout;
        let host = self.config.probe_host().to_string();

        let startup = tokio::select! {
            status = child.wait() => Starting::Exited(status),
            ready = wait_for_port(&host, self.config.port, deadline) => Starting::Ready(ready),
            sig = &mut shutdown => Starting::Shutdown(sig),
        };
        match startup {
            Starting::Exited(status) => {
                let code = exit_code(status?);
                return Err(BuildliteError::Startup(format!(
                    "{} exited with code {} before accepting connections on port {}",
                    self.config.server, code, self.config.port
                )));
            }
            Starting::Ready(false) => {
                child.start_kill()?;
                child.wait().await?;
                return Err(BuildliteError::Startup(format!(
                    "{} did not listen on port {} within {:?}",
                    self.config.server, self.config.port, self.config.startup_timeout
                )));
            }
            Starting::Ready(true) => {
                tracing::info!(pid, port = self.config.port, "Server ready");
            }
            Starting::Shutdown(sig) => return self.stop(&mut child, pid, sig).await,
        }

        let running = tokio::select! {
            status = child.wait() => Running::Exited(status),
            sig = &mut shutdown => Running::Shutdown(sig),
        };
        match running {
            Running::Exited(status) => {
                let code = exit_code(status?);
                tracing::info!(pid, code, "Server exited");
                Ok(code)
            }
            Running::Shutdown(sig) => self.stop(&mut child, pid, sig).await,
        }
    }

    fn spawn(&self) -> BuildliteResult<Child> {
        let argv = self.config.server_argv();
        Command::new(&argv[0])
            .args(&argv[1..])
            .envs(&self.config.env)
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                BuildliteError::Startup(format!("failed to spawn {}: {}", self.config.server, e))
            })
    }

    /// Forward `sig`, wait out the graceful timeout, then kill.
    async fn stop(&self, child: &mut Child, pid: u32, sig: Signal) -> BuildliteResult<i32> {
        tracing::info!(pid, signal = %sig, "Forwarding signal to server");
        send_signal(pid, sig);

        let status = match timeout(self.config.graceful_timeout, child.wait()).await {
            Ok(status) => status?,
            Err(_) => {
                tracing::warn!(
                    pid,
                    timeout = ?self.config.graceful_timeout,
                    "Server did not stop in time, killing"
                );
                child.start_kill()?;
                child.wait().await?
            }
        };

        let code = exit_code(status);
        tracing::info!(pid, code, "Server stopped");
        Ok(code)
    }
}

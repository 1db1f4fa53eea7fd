//! Readiness and health probes.

use buildlite_shared::errors::{BuildliteError, BuildliteResult};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::time::{Instant, timeout};

#[derive(Debug, Clone)]
pub struct ProbeOptions {
    pub host: String,
    pub port: u16,
    /// HTTP path to `GET`; plain TCP connect when unset.
    pub path: Option<String>,
    pub timeout: Duration,
}

impl Default for ProbeOptions {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".into(),
            port: crate::runtime::constants::defaults::PORT,
            path: None,
            timeout: Duration::from_secs(3),
        }
    }
}

/// Run one probe. Succeeds on connect, or on a 2xx/3xx response when a
/// path is set.
pub async fn probe(options: &ProbeOptions) -> BuildliteResult<()> {
    let addr = format!("{}:{}", options.host, options.port);
    let check = async {
        let stream = TcpStream::connect(&addr)
            .await
            .map_err(|e| BuildliteError::Startup(format!("connect to {} failed: {}", addr, e)))?;
        match &options.path {
            None => Ok(()),
            Some(path) => http_check(stream, &addr, path).await,
        }
    };

    timeout(options.timeout, check).await.map_err(|_| {
        BuildliteError::Startup(format!(
            "probe of {} timed out after {:?}",
            addr, options.timeout
        ))
    })?
}

async fn http_check(stream: TcpStream, addr: &str, path: &str) -> BuildliteResult<()> {
    let mut reader = BufReader::new(stream);
    let request = format!(
        "GET {} HTTP/1.1\r\nHost: {}\r\nUser-Agent: buildlite-probe\r\nConnection: close\r\n\r\n",
        path, addr
    );
    reader.get_mut().write_all(request.as_bytes()).await?;

    let mut status_line = String::new();
    reader.read_line(&mut status_line).await?;
    let status = parse_status(&status_line).ok_or_else(|| {
        BuildliteError::Startup(format!(
            "malformed HTTP response from {}: {:?}",
            addr,
            status_line.trim_end()
        ))
    })?;

    if (200..400).contains(&status) {
        Ok(())
    } else {
        Err(BuildliteError::Startup(format!(
            "GET {} on {} returned {}",
            path, addr, status
        )))
    }
}

/// `HTTP/1.1 204 No Content` -> 204
fn parse_status(line: &str) -> Option<u16> {
    let mut parts = line.split_whitespace();
    if !parts.next()?.starts_with("HTTP/") {
        return None;
    }
    parts.next()?.parse().ok()
}

/// Poll a TCP connect until it succeeds or `deadline` passes.
pub async fn wait_for_port(host: &str, port: u16, deadline: Instant) -> bool {
    let addr = format!("{}:{}", host, port);
    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return false;
        }
        if let Ok(Ok(_)) = timeout(remaining, TcpStream::connect(&addr)).await {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(100).min(remaining)).await;
    }
}

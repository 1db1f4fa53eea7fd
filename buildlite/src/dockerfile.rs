//! Dockerfile rendering for builds on a Docker host.
//!
//! The rendered file mirrors the native pipeline: a builder stage that
//! installs the locked production environment with the dependency manager,
//! and a runtime stage that copies only the environment and the sources.

use crate::build::socket_healthcheck;
use crate::launch::LaunchConfig;
use crate::runtime::BuildOptions;
use crate::runtime::constants::defaults;
use buildlite_shared::errors::{BuildliteError, BuildliteResult};
use std::path::Path;

/// Render the two-stage Dockerfile for `options`.
pub fn render(options: &BuildOptions) -> BuildliteResult<String> {
    options.sanitize()?;
    let project_dir = options
        .env_dir
        .strip_suffix("/.venv")
        .filter(|dir| !dir.is_empty())
        .ok_or_else(|| {
            BuildliteError::Config(format!(
                "env_dir '{}' must be a .venv directory to render a Dockerfile",
                options.env_dir
            ))
        })?;
    let launch = LaunchConfig::from_options(options);
    let sources = copy_path(&options.sources);

    let mut inputs = vec![copy_path(&options.manifest), copy_path(&options.lockfile)];
    if let Some(readme) = &options.readme {
        inputs.push(copy_path(readme));
    }

    let mut install = String::from("pdm install --check --prod --no-editable");
    for extra in &options.extras {
        install.push_str(&format!(" -G {}", extra));
    }

    let mut lines = vec![
        "# syntax=docker/dockerfile:1".to_string(),
        format!("ARG PYTHON_BASE={}", options.base_image),
        String::new(),
        "FROM $PYTHON_BASE AS builder".to_string(),
        "RUN pip install -U pdm".to_string(),
        "ENV PDM_CHECK_UPDATE=false".to_string(),
        format!("COPY {} {}/", inputs.join(" "), project_dir),
        format!("COPY {}/ {}", sources, options.source_dir),
        format!("WORKDIR {}", project_dir),
        format!("RUN {}", install),
        String::new(),
        "FROM $PYTHON_BASE".to_string(),
        format!("COPY --from=builder {}/ {}", options.env_dir, options.env_dir),
        format!("ENV PATH={}", quote(&format!("{}/bin:$PATH", options.env_dir))),
        format!("ENV PYTHONPATH={}", quote(&options.source_dir)),
    ];
    lines.extend(
        options
            .runtime_env
            .iter()
            .map(|(key, value)| format!("ENV {}={}", key, quote(value))),
    );
    lines.push(format!("COPY {}/ {}", sources, options.source_dir));
    lines.push(format!("WORKDIR {}", options.workdir));
    lines.extend(
        options
            .labels
            .iter()
            .map(|(key, value)| format!("LABEL {}={}", quote(key), quote(value))),
    );
    lines.push(format!("EXPOSE {}/tcp", options.port));
    lines.push(format!(
        "HEALTHCHECK CMD {}",
        exec_form(&socket_healthcheck(options.port))?
    ));
    lines.push(format!("STOPSIGNAL {}", defaults::STOP_SIGNAL));
    lines.push(format!("CMD {}", exec_form(&launch.server_argv())?));

    let mut out = lines.join("\n");
    out.push('\n');
    Ok(out)
}

fn copy_path(path: &Path) -> String {
    path.to_string_lossy().trim_end_matches('/').to_string()
}

fn quote(value: &str) -> String {
    format!("\"{}\"", value.replace('\\', "\\\\").replace('"', "\\\""))
}

/// JSON array form, so arguments are never word-split by a shell.
fn exec_form(argv: &[String]) -> BuildliteResult<String> {
    Ok(serde_json::to_string(argv)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use std::path::PathBuf;

    #[test]
    fn test_render_defaults() {
        let rendered = render(&BuildOptions::default()).unwrap();
        let lines: Vec<&str> = rendered.lines().collect();

        assert!(lines.contains(&"ARG PYTHON_BASE=python:3.12-slim"));
        assert!(lines.contains(&"FROM $PYTHON_BASE AS builder"));
        assert!(lines.contains(&"RUN pip install -U pdm"));
        assert!(lines.contains(&"COPY pyproject.toml pdm.lock README.md /project/"));
        assert!(lines.contains(&"RUN pdm install --check --prod --no-editable"));
        assert!(lines.contains(&"COPY --from=builder /project/.venv/ /project/.venv"));
        assert!(lines.contains(&"ENV PATH=\"/project/.venv/bin:$PATH\""));
        assert!(lines.contains(&"ENV PYTHONPATH=\"/project/src\""));
        assert!(lines.contains(&"EXPOSE 8000/tcp"));
        assert!(lines.contains(&"STOPSIGNAL SIGTERM"));
        assert_eq!(
            lines.last().copied(),
            Some(
                "CMD [\"uvicorn\",\"quarto_backend.main:app\",\"--host\",\"0.0.0.0\",\"--port\",\"8000\",\"--workers\",\"1\",\"--timeout-graceful-shutdown\",\"30\"]"
            )
        );
    }

    #[test]
    fn test_update_check_is_builder_only() {
        let rendered = render(&BuildOptions::default()).unwrap();
        let (builder, runtime) = rendered.split_once("\nFROM $PYTHON_BASE\n").unwrap();
        assert!(builder.contains("PDM_CHECK_UPDATE=false"));
        assert!(!runtime.contains("PDM_CHECK_UPDATE"));
        assert!(!runtime.contains("pdm.lock"));
        assert!(!runtime.contains("pyproject.toml"));
    }

    #[test]
    fn test_render_options() {
        let options = BuildOptions {
            base_image: "python:3.11-slim".into(),
            port: 9000,
            extras: vec!["redis".into()],
            readme: None,
            runtime_env: BTreeMap::from([("LOG_FORMAT".to_string(), "say \"hi\"".to_string())]),
            sources: PathBuf::from("src/"),
            ..Default::default()
        };
        let rendered = render(&options).unwrap();

        assert!(rendered.contains("ARG PYTHON_BASE=python:3.11-slim\n"));
        assert!(rendered.contains("COPY pyproject.toml pdm.lock /project/\n"));
        assert!(rendered.contains("--no-editable -G redis\n"));
        assert!(rendered.contains("ENV LOG_FORMAT=\"say \\\"hi\\\"\"\n"));
        assert!(rendered.contains("COPY src/ /project/src\n"));
        assert!(rendered.contains("EXPOSE 9000/tcp\n"));
    }

    #[test]
    fn test_render_stage_layout() {
        let options = BuildOptions {
            labels: BTreeMap::from([
                ("team".to_string(), "web".to_string()),
                ("app".to_string(), "quarto".to_string()),
            ]),
            ..Default::default()
        };
        let rendered = render(&options).unwrap();

        assert!(rendered.starts_with("# syntax=docker/dockerfile:1\nARG PYTHON_BASE="));
        assert!(rendered.contains("\n\nFROM $PYTHON_BASE AS builder\n"));
        assert!(rendered.contains("\n\nFROM $PYTHON_BASE\nCOPY --from=builder"));
        assert!(rendered.contains("LABEL \"app\"=\"quarto\"\nLABEL \"team\"=\"web\"\n"));
        assert!(rendered.ends_with("\"30\"]\n"));
        assert_eq!(rendered.matches("\n\n").count(), 2);
    }

    #[test]
    fn test_render_rejects_custom_env_dir() {
        let options = BuildOptions {
            env_dir: "/opt/env".into(),
            ..Default::default()
        };
        assert!(matches!(render(&options), Err(BuildliteError::Config(_))));
    }
}

//! `buildlite` command-line interface.

use anyhow::{Context, bail};
use buildlite::db::{BuildStore, Database};
use buildlite::image::inspect_layout;
use buildlite::install::EnvCache;
use buildlite::runtime::InstallerConfig;
use buildlite::runtime::constants::filenames;
use buildlite::{
    BuildOptions, BuildliteHome, ImageBuilder, LaunchConfig, ProbeOptions, Supervisor, dockerfile,
    init_logging, init_logging_for, launch,
};
use clap::{Args, Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Reproducible two-stage image builder for ASGI services
#[derive(Parser, Debug)]
#[command(name = "buildlite")]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Args, Debug)]
struct ProjectArgs {
    /// Project root holding the manifest, lockfile and sources
    #[arg(short, long, default_value = ".")]
    project: PathBuf,

    /// Build configuration (default: <project>/buildlite.toml when present)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Base interpreter image, e.g. python:3.12-slim
    #[arg(long, env = "PYTHON_BASE")]
    base_image: Option<String>,
}

#[derive(Args, Debug)]
struct BuildArgs {
    /// Output directory for the OCI image layout
    #[arg(short, long, default_value = "image")]
    out: PathBuf,

    /// Local OCI layout of the base image, placed below the build layers
    #[arg(long)]
    base_layout: Option<PathBuf>,

    /// Install from a local package index instead of running pdm
    #[arg(long, conflicts_with = "pdm")]
    index: Option<PathBuf>,

    /// Install with pdm (default)
    #[arg(long)]
    pdm: bool,

    /// Always install, never reuse a cached environment
    #[arg(long)]
    no_cache: bool,

    /// buildlite binary to embed as the image entrypoint supervisor
    #[arg(long)]
    supervisor: Option<PathBuf>,
}

#[derive(Subcommand, Debug)]
enum CacheCommand {
    /// Remove least recently used environments
    Prune {
        /// Number of environments to keep
        #[arg(long, default_value_t = 5)]
        keep: usize,

        /// Also remove environments unused for this many days
        #[arg(long)]
        max_age_days: Option<u64>,
    },
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Build the runtime image as an OCI layout
    Build {
        #[command(flatten)]
        project: ProjectArgs,

        #[command(flatten)]
        build: BuildArgs,
    },

    /// Verify the lockfile against the manifest without installing
    Check {
        #[command(flatten)]
        project: ProjectArgs,
    },

    /// Print the equivalent two-stage Dockerfile
    Render {
        #[command(flatten)]
        project: ProjectArgs,
    },

    /// Print an image layout's configuration and check its minimality
    Inspect {
        /// OCI image layout directory
        layout: PathBuf,
    },

    /// List recorded builds
    History {
        /// Maximum number of builds to list
        #[arg(short = 'n', long, default_value_t = 20)]
        limit: usize,

        /// Check that equal inputs produced equal environments
        #[arg(long)]
        verify: bool,
    },

    /// Manage the resolved environment cache
    Cache {
        #[command(subcommand)]
        command: CacheCommand,
    },

    /// Run the ASGI server (image entrypoint)
    Launch,

    /// Check that the server accepts connections
    Probe {
        #[arg(long, default_value = "127.0.0.1")]
        host: String,

        #[arg(long, env = "BUILDLITE_PORT", default_value_t = 8000)]
        port: u16,

        /// HTTP path to GET; TCP connect only when omitted
        #[arg(long)]
        path: Option<String>,

        /// Timeout in seconds
        #[arg(long, default_value_t = 3)]
        timeout: u64,
    },
}

fn load_options(args: &ProjectArgs) -> anyhow::Result<BuildOptions> {
    let default_config = args.project.join(filenames::CONFIG);
    let mut options = match &args.config {
        Some(path) => BuildOptions::load(path)?,
        None if default_config.is_file() => BuildOptions::load(&default_config)?,
        None => BuildOptions::default(),
    };
    if let Some(image) = &args.base_image {
        options.base_image = image.clone();
    }
    Ok(options)
}

fn open_store(home: &BuildliteHome) -> anyhow::Result<BuildStore> {
    home.prepare()?;
    let db = Database::open(&home.db_path())
        .with_context(|| format!("opening build history in {}", home.root().display()))?;
    Ok(BuildStore::new(db))
}

async fn build(project: ProjectArgs, args: BuildArgs) -> anyhow::Result<()> {
    let home = BuildliteHome::from_env()?;
    init_logging_for(&home)?;

    let mut options = load_options(&project)?;
    if let Some(path) = args.index {
        options.installer = InstallerConfig::Index { path };
    } else if args.pdm && !matches!(options.installer, InstallerConfig::Pdm { .. }) {
        options.installer = InstallerConfig::default();
    }
    if let Some(layout) = args.base_layout {
        options.base_layout = Some(
            std::path::absolute(&layout)
                .with_context(|| format!("resolving {}", layout.display()))?,
        );
    }
    if args.no_cache {
        options.cache = false;
    }
    if args.supervisor.is_some() {
        options.supervisor_binary = args.supervisor;
    }

    let store = open_store(&home)?;
    let outcome = ImageBuilder::new(options, &project.project, &args.out, home)?
        .with_store(store)
        .build()
        .await?;

    println!("build    {}", outcome.build_id);
    println!("image    {}", outcome.image.path.display());
    println!("digest   {}", outcome.image.manifest_digest);
    if let Some(base) = &outcome.image.base_digest {
        println!("base     {}", base);
    }
    println!(
        "env      {} ({} packages{})",
        outcome.environment_digest,
        outcome.environment.packages.len(),
        if outcome.cache_hit { ", cached" } else { "" }
    );
    for layer in &outcome.image.layers {
        println!("layer    {} {} ({} bytes)", layer.name, layer.digest, layer.size);
    }
    Ok(())
}

async fn check(project: ProjectArgs) -> anyhow::Result<()> {
    let home = BuildliteHome::from_env()?;
    init_logging_for(&home)?;

    let options = load_options(&project)?;
    let report = ImageBuilder::new(options, &project.project, Path::new("."), home)?
        .check()
        .await?;

    println!("lock ok  {}", report.content_hash);
    for pin in &report.checked {
        println!("  {}", pin);
    }
    Ok(())
}

fn inspect(layout: &Path) -> anyhow::Result<()> {
    let image = inspect_layout(layout)?;

    println!("image       {}", image.path.display());
    println!("digest      {}", image.manifest_digest);
    if let Some(base) = image.base_image() {
        println!("base        {}", base);
    }
    if let Some(digest) = image.base_digest() {
        println!("base digest {}", digest);
    }
    println!("entrypoint  {}", image.entrypoint().join(" "));
    println!("ports       {}", image.exposed_ports().join(", "));
    for var in image.env() {
        println!("env         {}", var);
    }
    for layer in &image.layers {
        println!(
            "layer       {} ({} bytes, {} entries, {})",
            layer.digest,
            layer.size,
            layer.entries.len(),
            layer.image_path.as_deref().unwrap_or("base")
        );
    }

    let violations = image.minimality_violations();
    if !violations.is_empty() {
        for v in &violations {
            eprintln!("not minimal: {}", v);
        }
        bail!("image contains {} build-only path(s)", violations.len());
    }
    Ok(())
}

fn history(limit: usize, verify: bool) -> anyhow::Result<()> {
    let home = BuildliteHome::from_env()?;
    init_logging_for(&home)?;
    let store = open_store(&home)?;

    for record in store.list(limit)? {
        println!(
            "{}  {:<9}  {}  {}{}",
            record.id,
            record.status,
            record.created_at.format("%Y-%m-%d %H:%M:%S"),
            record.project,
            record
                .failed_stage
                .as_deref()
                .map(|s| format!("  (failed in {})", s))
                .unwrap_or_default()
        );
    }

    if verify {
        let mismatches = store.verify_determinism()?;
        for m in &mismatches {
            eprintln!("non-deterministic: inputs {}", m.input_digest);
            for (id, env) in &m.builds {
                eprintln!("  {}  {}", id, env);
            }
        }
        if !mismatches.is_empty() {
            bail!("{} input digest(s) produced different environments", mismatches.len());
        }
        println!("determinism ok");
    }
    Ok(())
}

fn prune_cache(keep: usize, max_age_days: Option<u64>) -> anyhow::Result<()> {
    let home = BuildliteHome::from_env()?;
    init_logging_for(&home)?;

    let cache = EnvCache::new(home.env_cache_dir());
    let report = cache.prune(keep, max_age_days.map(|d| Duration::from_secs(d * 24 * 60 * 60)))?;
    for path in &report.removed {
        println!("removed  {}", path.display());
    }
    println!("kept {} environment(s)", report.kept.len());
    Ok(())
}

async fn run_launch() -> anyhow::Result<i32> {
    init_logging();
    let config = LaunchConfig::from_env()?;
    Ok(Supervisor::new(config).run().await?)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Build { project, build: args } => build(project, args).await,
        Commands::Check { project } => check(project).await,
        Commands::Render { project } => {
            init_logging();
            print!("{}", dockerfile::render(&load_options(&project)?)?);
            Ok(())
        }
        Commands::Inspect { layout } => {
            init_logging();
            inspect(&layout)
        }
        Commands::History { limit, verify } => history(limit, verify),
        Commands::Cache {
            command: CacheCommand::Prune { keep, max_age_days },
        } => prune_cache(keep, max_age_days),
        Commands::Launch => {
            let code = run_launch().await?;
            std::process::exit(code);
        }
        Commands::Probe {
            host,
            port,
            path,
            timeout,
        } => {
            init_logging();
            launch::probe(&ProbeOptions {
                host,
                port,
                path,
                timeout: Duration::from_secs(timeout),
            })
            .await?;
            Ok(())
        }
    }
}

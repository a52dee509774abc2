use anyhow::{bail, Result};
use clap::{Parser, Subcommand};
use serde::Serialize;
use std::path::PathBuf;
use tracing::info;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use filesentry::config::LoggingConfig;
use filesentry::processor::expand_managed_path;
use filesentry::{Config, Daemon};

#[derive(Parser)]
#[command(name = "filesentry")]
#[command(about = "Mirror files into a git repository and push them on a schedule")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    /// Configuration file path (defaults to XDG config location)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Verbose logging
    #[arg(short, long)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Watch configured files and record every change (default)
    Run,

    /// Validate the configuration and list the files that would be managed
    Check {
        /// Print the result as JSON
        #[arg(long)]
        json: bool,
    },

    /// Write a default configuration file
    Init {
        /// Overwrite an existing configuration
        #[arg(long)]
        force: bool,
    },
}

#[derive(Serialize)]
struct CheckReport {
    config: PathBuf,
    repository: PathBuf,
    remote: String,
    push_interval_secs: u64,
    files: Vec<PathBuf>,
    ignored: Vec<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config_path = match cli.config {
        Some(path) => path,
        None => Config::default_config_path()?,
    };

    match cli.command.unwrap_or(Commands::Run) {
        Commands::Init { force } => {
            init_logging(cli.verbose, &LoggingConfig::default())?;
            cmd_init(config_path, force)
        }
        Commands::Check { json } => {
            let config = Config::load(&config_path)?;
            init_logging(cli.verbose, &config.logging)?;
            cmd_check(config_path, &config, json)
        }
        Commands::Run => {
            let config = Config::load(&config_path)?;
            init_logging(cli.verbose, &config.logging)?;
            info!("Starting FileSentry v{}", env!("CARGO_PKG_VERSION"));
            cmd_run(config).await
        }
    }
}

/// Initialize logging from configuration; `--verbose` and `RUST_LOG` take precedence
fn init_logging(verbose: bool, logging: &LoggingConfig) -> Result<()> {
    let filter = if verbose {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("debug"))
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&logging.level))
    };

    let registry = tracing_subscriber::registry().with(filter);
    let layer = fmt::layer()
        .with_writer(std::io::stderr)
        .with_ansi(logging.color);

    match logging.format.as_str() {
        "pretty" => registry.with(layer.pretty()).init(),
        "full" => registry.with(layer).init(),
        "compact" => registry.with(layer.compact()).init(),
        other => bail!("Unknown log format '{}': use compact, pretty or full", other),
    }

    Ok(())
}

/// Run the daemon in the foreground until SIGINT/SIGTERM
async fn cmd_run(config: Config) -> Result<()> {
    let daemon = Daemon::new(config)?;

    println!("🖥️  Running in foreground mode (Ctrl+C to stop)");
    daemon.run().await
}

/// Validate configuration and show what would be managed
fn cmd_check(config_path: PathBuf, config: &Config, json: bool) -> Result<()> {
    config.validate()?;

    let (absolute, ignored): (Vec<PathBuf>, Vec<PathBuf>) = config
        .managed_paths()
        .into_iter()
        .partition(|path| path.is_absolute());
    let files: Vec<PathBuf> = absolute
        .iter()
        .flat_map(|path| expand_managed_path(path))
        .collect();

    let report = CheckReport {
        config: config_path,
        repository: config.repository_path(),
        remote: config.repository.url.clone(),
        push_interval_secs: config.push_interval()?.as_secs(),
        files,
        ignored,
    };

    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
        return Ok(());
    }

    println!("✅ Configuration is valid: {}", report.config.display());
    println!("   📁 Repository: {}", report.repository.display());
    println!("   🔗 Remote: {}", report.remote);
    if report.push_interval_secs == 0 {
        println!("   ⏸️  Periodic push disabled");
    } else {
        println!("   ⏰ Push interval: {}s", report.push_interval_secs);
    }

    println!("\nManaged files ({}):", report.files.len());
    for file in &report.files {
        let marker = if file.exists() { "📄" } else { "⏳" };
        println!("   {} {}", marker, file.display());
    }

    for path in &report.ignored {
        println!("   ⚠️  Ignored (not absolute): {}", path.display());
    }

    Ok(())
}

/// Write the default configuration
fn cmd_init(config_path: PathBuf, force: bool) -> Result<()> {
    if config_path.exists() && !force {
        println!("⚠️  Configuration already exists: {}", config_path.display());
        println!("   Use --force to overwrite it");
        return Ok(());
    }

    Config::default().save(&config_path)?;
    info!("Configuration saved to: {:?}", config_path);

    println!("✅ FileSentry initialized successfully!");
    println!("   Config: {}", config_path.display());
    println!("   Next: set repository.url and list files, then run 'filesentry run'");

    Ok(())
}

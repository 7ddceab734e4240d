//! Tether - remote control for a local coding agent
//!
//! Runs the agent on this machine and exposes the session to a paired
//! mobile/web client through an encrypted relay.

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use tether::{agent, config::TetherConfig, Daemon};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "tether")]
#[command(author = "A3S Lab Team")]
#[command(version)]
#[command(about = "Remote control for a local coding agent")]
struct Cli {
    /// Configuration file path
    #[arg(short, long, env = "TETHER_CONFIG")]
    config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    /// Emit logs as JSON
    #[arg(long)]
    log_json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start a remotely controllable agent session
    Run {
        /// Working directory of the agent
        #[arg(long)]
        cwd: Option<PathBuf>,

        /// Relay base URL
        #[arg(long, env = "TETHER_RELAY_URL")]
        relay_url: Option<String>,

        /// Relay bearer credential
        #[arg(long, env = "TETHER_TOKEN", hide_env_values = true)]
        token: Option<String>,
    },

    /// Run diagnostics
    Doctor,

    /// Show configuration
    Config {
        /// Show default configuration
        #[arg(long)]
        default: bool,
    },
}

fn init_logging(verbose: bool, json: bool) {
    let log_level = if verbose { "debug" } else { "info" };
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| format!("tether={}", log_level).into());
    let registry = tracing_subscriber::registry().with(filter);
    if json {
        registry
            .with(tracing_subscriber::fmt::layer().json())
            .init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }
}

fn load_config(path: Option<&Path>) -> Result<(TetherConfig, Option<PathBuf>)> {
    if let Some(path) = path {
        return Ok((TetherConfig::load(path)?, Some(path.to_path_buf())));
    }
    match TetherConfig::default_path() {
        Some(path) if path.exists() => Ok((TetherConfig::load(&path)?, Some(path))),
        _ => Ok((TetherConfig::default(), None)),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose, cli.log_json);

    let (mut config, config_path) = load_config(cli.config.as_deref())?;

    match cli.command {
        Commands::Run {
            cwd,
            relay_url,
            token,
        } => {
            if let Some(url) = relay_url {
                config.relay.url = url;
            }
            if let Some(token) = token {
                config.relay.token = token;
            }
            let cwd = match cwd {
                Some(cwd) => cwd,
                None => std::env::current_dir()?,
            };
            run_session(config, config_path, cwd).await?;
        }
        Commands::Doctor => {
            run_doctor(&config, config_path.as_deref()).await?;
        }
        Commands::Config { default } => {
            show_config(if default { None } else { Some(&config) })?;
        }
    }

    Ok(())
}

async fn run_session(
    config: TetherConfig,
    config_path: Option<PathBuf>,
    cwd: PathBuf,
) -> Result<()> {
    tracing::info!("Starting Tether");

    let daemon = Daemon::new(config, cwd).with_config_path(config_path);
    if let Err(e) = daemon.start().await {
        if e.is_fatal() {
            eprintln!("{}", e);
            std::process::exit(1);
        }
        return Err(e.into());
    }

    tracing::info!("Tether is running. Press Ctrl+C to stop.");
    daemon.run_until_shutdown().await?;
    Ok(())
}

async fn run_doctor(config: &TetherConfig, config_path: Option<&Path>) -> Result<()> {
    println!("Tether Doctor");
    println!();

    println!("Checking agent...");
    match agent::probe(&config.agent.binary, &config.agent.mcp_server_min_version).await {
        Ok(found) => {
            let version = found
                .version
                .as_ref()
                .map(|v| v.to_string())
                .unwrap_or_else(|| format!("unknown ({})", found.raw.trim()));
            println!("  ✓ {} {}", config.agent.binary, version);
            println!("  ✓ Using sub-command `{}`", found.subcommand);
        }
        Err(e) => {
            println!("  ✗ {}", e);
        }
    }

    println!();
    println!("Checking search tools...");
    for binary in [&config.sandbox.ripgrep_binary, &config.sandbox.difftastic_binary] {
        if on_path(binary) {
            println!("  ✓ {} found", binary);
        } else {
            println!("  ✗ {} not found on PATH", binary);
        }
    }

    println!();
    println!("Checking configuration...");
    match config_path.map(Path::to_path_buf).or_else(TetherConfig::default_path) {
        Some(path) if path.exists() => {
            println!("  ✓ Configuration file found: {}", path.display())
        }
        Some(path) => println!(
            "  ℹ No configuration file at {} (using defaults)",
            path.display()
        ),
        None => println!("  ℹ No configuration directory (using defaults)"),
    }
    match config.validate() {
        Ok(()) => println!("  ✓ Configuration valid"),
        Err(e) => println!("  ✗ {}", e),
    }
    println!(
        "  ℹ Transcripts: {}",
        config.session.transcripts_dir().display()
    );

    println!();
    println!("Doctor check complete!");

    Ok(())
}

fn on_path(binary: &str) -> bool {
    let candidate = Path::new(binary);
    if candidate.components().count() > 1 {
        return candidate.is_file();
    }
    std::env::var_os("PATH")
        .map(|paths| std::env::split_paths(&paths).any(|dir| dir.join(binary).is_file()))
        .unwrap_or(false)
}

fn show_config(config: Option<&TetherConfig>) -> Result<()> {
    let config = config.cloned().unwrap_or_default();
    let toml = toml::to_string_pretty(&config)?;
    println!("{}", toml);
    Ok(())
}

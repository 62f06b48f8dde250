//! Lodestar binary: local OpenAI-compatible inference server

use anyhow::{Context as _, Result};
use clap::Parser;
use std::path::{Path, PathBuf};
use tracing::info;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::EnvFilter;

use lodestar_core::cli::{handle_models, handle_serve, Commands, LoggingArgs};
use lodestar_core::config::{LoggingConfig, ServerConfig};

#[derive(Parser)]
#[command(
    name = "lodestar",
    version,
    about = "Local OpenAI-compatible inference server",
    long_about = None
)]
struct Cli {
    /// Path to a TOML or JSON configuration file
    #[arg(long, global = true, env = "LODESTAR_CONFIG")]
    config: Option<PathBuf>,

    #[command(flatten)]
    logging: LoggingArgs,

    #[command(subcommand)]
    command: Commands,
}

/// Console logging, or daily-rotated files when `logging.dir` is set. The
/// returned guard must live until exit or buffered lines are lost.
fn init_logging(args: &LoggingArgs, config: &LoggingConfig) -> Option<WorkerGuard> {
    let filter = EnvFilter::builder().parse_lossy(
        std::env::var("RUST_LOG").unwrap_or_else(|_| args.filter_directives(config)),
    );

    match config.dir.as_deref() {
        Some(dir) => {
            let file_appender = RollingFileAppender::new(Rotation::DAILY, dir, "lodestar.log");
            let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_target(true)
                .with_file(true)
                .with_line_number(true)
                .with_ansi(false)
                .with_writer(non_blocking)
                .init();
            info!("File logging enabled to {}/lodestar.log", dir.display());
            Some(guard)
        }
        None => {
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_target(true)
                .init();
            None
        }
    }
}

fn load_config(path: Option<&Path>) -> Result<ServerConfig> {
    ServerConfig::load(path).with_context(|| match path {
        Some(p) => format!("Failed to load config from {}", p.display()),
        None => "Failed to load configuration".to_string(),
    })
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = load_config(cli.config.as_deref())?;

    match cli.command {
        Commands::Serve(cmd) => {
            let config = cmd.server.apply_to_builder(config.to_builder()).build();
            let _log_guard = init_logging(&cli.logging, &config.logging);
            info!("Lodestar v{} starting up", env!("CARGO_PKG_VERSION"));

            let rt = tokio::runtime::Runtime::new()
                .context("Failed to create multi-threaded runtime")?;
            rt.block_on(handle_serve(config))
        }
        Commands::Models(cmd) => {
            let mut builder = config.to_builder();
            if let Some(dir) = cmd.models_dir {
                builder = builder.models_dir(dir);
            }
            let config = builder.build();
            let _log_guard = init_logging(&cli.logging, &config.logging);
            handle_models(config, cmd.json)
        }
    }
}

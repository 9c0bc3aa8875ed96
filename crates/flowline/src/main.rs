//! Flowline - intent pipelines with cron, watch and webhook triggers
//!
//! Main entry point for the Flowline CLI.

use std::path::PathBuf;

use anyhow::{Context as _, Result};
use clap::{Parser, Subcommand};
use tracing_appender::non_blocking::WorkerGuard;

mod builtin;
mod commands;

use commands::{check, run, serve, triggers};

// ─────────────────────────────────────────────────────────────────────────────
// CLI Structure
// ─────────────────────────────────────────────────────────────────────────────

/// Flowline - intent pipelines with cron, watch and webhook triggers
#[derive(Parser)]
#[command(name = "flowline")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Enable verbose output
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Output as JSON (for scripting)
    #[arg(long, global = true)]
    pub json: bool,

    /// User config directory (default: ~/.config/flowline)
    #[arg(long, global = true, value_name = "DIR")]
    pub config_dir: Option<PathBuf>,

    /// Workspace root (default: current directory)
    #[arg(short, long, global = true, value_name = "DIR")]
    pub workspace: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run a pipeline
    Run(run::RunArgs),

    /// Validate and compile a pipeline without running it
    Check(check::CheckArgs),

    /// List triggers declared under the workspace
    Triggers(triggers::TriggersArgs),

    /// Run the trigger manager until interrupted
    Serve(serve::ServeArgs),
}

// ─────────────────────────────────────────────────────────────────────────────
// Main
// ─────────────────────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let base = match cli.workspace {
        Some(ref dir) => dir.clone(),
        None => std::env::current_dir().context("cannot determine current directory")?,
    };
    let loaded = flowline_config::load_config_with_options(Some(base.as_path()), cli.config_dir.as_deref())?;
    let config = loaded.config;

    let config_dir = cli
        .config_dir
        .clone()
        .or_else(flowline_config::xdg_config_dir);
    let _guard = init_tracing(&config.logging(), config_dir, cli.verbose);

    for warning in &loaded.warnings {
        tracing::warn!(warning = %warning, "config");
    }
    config.validate()?;

    let ctx = commands::Context::new(config, base, cli.json, cli.verbose);

    match cli.command {
        Commands::Run(args) => run::run(args, &ctx).await,
        Commands::Check(args) => check::run(args, &ctx).await,
        Commands::Triggers(args) => triggers::run(args, &ctx).await,
        Commands::Serve(args) => serve::run(args, &ctx).await,
    }
}

/// Console (human-readable) + rotating JSON file.
fn init_tracing(
    logging: &flowline_config::LoggingConfig,
    config_dir: Option<PathBuf>,
    verbose: bool,
) -> Option<WorkerGuard> {
    use tracing_subscriber::EnvFilter;
    use tracing_subscriber::prelude::*;

    let level = if verbose { "debug" } else { logging.level.as_str() };
    let console_filter = format!(
        "flowline={level},flowline_pipeline={level},flowline_trigger={level},flowline_config={level},warn"
    );

    let (file_layer, guard) = if logging.file {
        let log_dir = logging
            .dir
            .clone()
            .or_else(|| config_dir.map(|d| d.join("logs")))
            .unwrap_or_else(|| PathBuf::from("logs"));
        let file_appender = tracing_appender::rolling::daily(&log_dir, "flowline.log");
        let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);
        let layer = tracing_subscriber::fmt::layer()
            .json()
            .with_writer(non_blocking)
            .with_filter(EnvFilter::new(
                "flowline=trace,flowline_pipeline=trace,flowline_trigger=trace,flowline_config=trace,info",
            ));
        (Some(layer), Some(guard))
    } else {
        (None, None)
    };

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(verbose)
                .with_writer(std::io::stderr)
                .with_filter(EnvFilter::new(console_filter)),
        )
        .with(file_layer)
        .init();

    guard
}

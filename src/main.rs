//! Satchel - self-executing bundles for Poetry projects
//!
//! The same binary is the build CLI and the bundle bootstrap: when the
//! running executable carries a bundle it runs that bundle, otherwise it
//! dispatches to subcommands.

use clap::Parser;
use console::style;
use satchel::bootstrap;
use satchel::bundle::BundleReader;
use satchel::cli::{Cli, Commands};
use satchel::config::{Config, ConfigManager};
use satchel::error::{SatchelError, SatchelResult};
use std::error::Error;
use std::process::ExitCode;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> ExitCode {
    match bootstrap::embedded_bundle() {
        Ok(Some(reader)) => return run_bundle(reader).await,
        Ok(None) => {}
        Err(e) => return bundle_failure(&e),
    }

    match run().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("{} {}", style("Error:").red().bold(), e);
            if let Some(hint) = e.hint() {
                eprintln!("{} {}", style("Hint:").yellow(), hint);
            }
            ExitCode::FAILURE
        }
    }
}

/// Bootstrap mode: every argument belongs to the bundled application
async fn run_bundle(reader: BundleReader) -> ExitCode {
    match bootstrap::run(reader).await {
        Ok(code) => ExitCode::from(u8::try_from(code).unwrap_or(1)),
        Err(e) => bundle_failure(&e),
    }
}

fn bundle_failure(e: &SatchelError) -> ExitCode {
    eprintln!("satchel [{}] error: {}", e.phase(), e);
    let mut source = e.source();
    while let Some(cause) = source {
        eprintln!("  caused by: {}", cause);
        source = cause.source();
    }
    if let Some(hint) = e.hint() {
        eprintln!("{} {}", style("Hint:").yellow(), hint);
    }
    ExitCode::from(e.exit_code())
}

async fn run() -> SatchelResult<()> {
    let cli = Cli::parse();

    let config_manager = match cli.config {
        Some(ref path) => ConfigManager::with_path(path.clone()),
        None => ConfigManager::new(),
    };
    let config = match config_manager.load().await {
        Ok(config) => config,
        // A broken config file must not block `config init --force`
        Err(e) if matches!(cli.command, Commands::Config(_)) => {
            eprintln!("{} {}", style("Warning:").yellow(), e);
            Config::default()
        }
        Err(e) => return Err(e),
    };

    // Initialize logging: 0 = warn (spinners only), 1 = info, 2+ = debug
    let verbosity = cli.verbose.max(u8::from(config.general.verbose));
    let filter = match verbosity {
        0 => EnvFilter::new("satchel=warn"),
        1 => EnvFilter::new("satchel=info"),
        _ => EnvFilter::new("satchel=debug"),
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .without_time()
        .with_writer(std::io::stderr)
        .init();

    match cli.command {
        Commands::Build(args) => satchel::cli::commands::build(args, &config).await,
        Commands::Inspect(args) => satchel::cli::commands::inspect(args, &config).await,
        Commands::Lock(args) => satchel::cli::commands::lock(args, &config).await,
        Commands::Cache(args) => satchel::cli::commands::cache(args, &config).await,
        Commands::Config(args) => {
            satchel::cli::commands::config(args, &config, &config_manager).await
        }
    }
}

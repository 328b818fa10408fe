//! Tabload CLI - Main entry point

use clap::Parser;
use std::process;
use tabload_cli::{Cli, Commands};
use tabload_common::logging::{init_logging, LogConfig, LogLevel, LogOutput};
use tracing::error;

#[tokio::main]
async fn main() {
    // Load .env before clap reads TABLOAD_CONFIG
    dotenvy::dotenv().ok();

    let cli = Cli::parse();

    let log_config = LogConfig::default()
        .with_level(if cli.verbose {
            LogLevel::Debug
        } else {
            LogLevel::Info
        })
        .with_output(LogOutput::Console);

    // Environment variables take precedence
    let log_config = log_config.clone().with_env_overrides().unwrap_or(log_config);

    // The CLI works without logging; keep the guard so file output is flushed
    let guard = init_logging(&log_config).ok().flatten();

    let code = match execute_command(&cli).await {
        Ok(code) => code,
        Err(e) => {
            error!(kind = e.kind(), error = %e.message(), "Load failed");
            eprintln!("{}: {}", e.kind(), e.message());
            e.exit_code()
        }
    };

    drop(guard);
    process::exit(code);
}

async fn execute_command(cli: &Cli) -> tabload_cli::Result<i32> {
    match &cli.command {
        Commands::Load(args) => tabload_cli::commands::load::run(cli, args).await,
    }
}

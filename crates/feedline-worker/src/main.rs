//! Feedline Worker - Main entry point

use clap::Parser;
use feedline_common::logging::{init_logging, LogConfig, LogLevel};
use feedline_core::config::Config;
use feedline_worker::{commands, Cli, Commands};
use std::process;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let level = if cli.verbose {
        LogLevel::Debug
    } else {
        LogLevel::Info
    };
    let log_config = LogConfig::default()
        .with_level(level)
        .with_file_prefix("feedline-worker")
        .with_filter("feedline_core=info,feedline_worker=info,sqlx=warn")
        .with_env_overrides();

    // Keep the guard alive so file logging flushes on exit
    let _guard = match log_config.and_then(|config| init_logging(&config)) {
        Ok(guard) => Some(guard),
        Err(e) => {
            eprintln!("Warning: logging disabled: {}", e);
            None
        },
    };

    if let Err(e) = execute_command(&cli).await {
        error!(error = ?e, "Command failed");
        eprintln!("Error: {:#}", e);
        process::exit(1);
    }
}

async fn execute_command(cli: &Cli) -> anyhow::Result<()> {
    let config = Config::load()?;

    match &cli.command {
        Commands::Migrate => commands::migrate::run(&config).await,
        Commands::Run(args) => {
            let interrupt = CancellationToken::new();
            let signal = tokio::spawn(shutdown_signal(interrupt.clone()));

            let result = commands::run::run(&config, args, interrupt).await;
            signal.abort();
            result
        },
        Commands::Cursor { command } => commands::cursor::run(&config, command).await,
        Commands::Lease { command } => commands::lease::run(&config, command).await,
    }
}

/// Cancel `interrupt` on Ctrl+C or SIGTERM
async fn shutdown_signal(interrupt: CancellationToken) {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            },
            Err(e) => {
                error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            },
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, finishing the current round");
        },
        _ = terminate => {
            info!("Received terminate signal, finishing the current round");
        },
    }

    interrupt.cancel();
}

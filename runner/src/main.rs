use clap::Parser;
use config::{Cli, DispatchConfig};
use database::SharedConnection;
use dispatch::DispatchCoordinator;
use std::process::exit;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

mod collector;
mod config;
mod database;
mod dispatch;
mod params;
mod queue;
mod scheduler;

fn main() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let cli = Cli::parse();

    if cli.create {
        match config::scaffold(&cli.basedir) {
            Ok(()) => return,
            Err(error) => {
                error!(error = ?error, "Failed to create the directory structure: {error}");
                exit(1);
            }
        }
    }

    let config = match DispatchConfig::assemble(cli) {
        Ok(config) => config,
        Err(error) => {
            error!(error = ?error, "Failed to assemble the configuration: {error}");
            exit(1);
        }
    };

    if config.preflight_checks() {
        error!("Aborting, the setup did not pass the preflight checks");
        exit(1);
    }

    let mut connection = match SharedConnection::load(&config.db_path()) {
        Ok(connection) => connection,
        Err(error) => {
            error!(error = ?error, "Failed to open the job record store: {error}");
            exit(1);
        }
    };
    if let Err(error) = connection.init() {
        error!(error = ?error, "Failed to initialize the job record store: {error}");
        exit(1);
    }

    let coordinator = DispatchCoordinator::new(config, connection.clone());
    let outcome = coordinator.run();
    drop(coordinator);

    if let Err(error) = connection.close() {
        error!(error = ?error, "Failed to close the job record store: {error}");
    }

    match outcome {
        Ok(session_id) => info!("Session {session_id} finished"),
        Err(error) => {
            error!(error = ?error, "Dispatch failed: {error}");
            exit(1);
        }
    }
}

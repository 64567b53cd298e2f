//! dbvault CLI - backup automation for PostgreSQL, MySQL, SQLite and Neo4j
//!
//! Usage:
//!   dbvault serve --port 8080          Start the API server and scheduler
//!   dbvault targets list               List registered targets
//!   dbvault backup-now --target ID     One-off backup to local storage
//!   dbvault runs                       Show run history
//!
//! Exit codes: 0 success, 2 usage/validation, 3 auth, 4 API unreachable,
//! 5 partial success.

mod cli;
mod commands;

#[cfg(test)]
mod tests;

use std::process::ExitCode;

use clap::Parser;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use cli::*;
use commands::api::ApiClient;

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    // Set up logging
    // Priority: RUST_LOG env var > --verbose flag > default (info)
    let filter = if std::env::var("RUST_LOG").is_ok() {
        EnvFilter::from_default_env()
    } else if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::new("info")
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_target(false).compact())
        .init();

    let client = ApiClient::new(cli.api_url.clone(), cli.token.clone());

    let result = match cli.command {
        Commands::Serve {
            host,
            port,
            db,
            local_root,
            workers,
            no_auth,
        } => commands::cmd_serve(&host, port, &db, local_root, workers, no_auth).await,
        Commands::Targets { action } => match action {
            None | Some(TargetsAction::List) => commands::cmd_targets_list(&client).await,
        },
        Commands::Destinations { action } => match action {
            None | Some(DestinationsAction::List) => {
                commands::cmd_destinations_list(&client).await
            }
            Some(DestinationsAction::Backups { id, target }) => {
                commands::cmd_destination_backups(&client, &id, target.as_deref()).await
            }
        },
        Commands::Schedules { action } => match action {
            None | Some(SchedulesAction::List) => commands::cmd_schedules_list(&client).await,
            Some(SchedulesAction::RunNow { id }) => {
                commands::cmd_schedule_run_now(&client, &id).await
            }
            Some(SchedulesAction::RunEnabledNow { max }) => {
                commands::cmd_run_enabled_now(&client, max).await
            }
        },
        Commands::BackupNow {
            target,
            destinations,
            local,
        } => commands::cmd_backup_now(&client, &target, &destinations, local).await,
        Commands::RestoreNow {
            target,
            backup_id,
            destination,
            local,
            confirm,
            password,
        } => {
            commands::cmd_restore_now(
                &client,
                &target,
                &backup_id,
                destination.as_deref(),
                local,
                &confirm,
                password.as_deref(),
            )
            .await
        }
        Commands::Runs {
            target,
            operation,
            limit,
        } => commands::cmd_runs(&client, target.as_deref(), operation.as_deref(), limit).await,
    };

    match result {
        Ok(code) => ExitCode::from(code),
        Err(e) => {
            eprintln!("error: {}", e);
            ExitCode::FAILURE
        }
    }
}

//! CLI argument definitions using clap
//!
//! This module contains all the clap structs and enums for parsing CLI
//! arguments. The actual command implementations are in the `commands`
//! module.

use std::path::PathBuf;

use clap::{Parser, Subcommand};

/// dbvault - multi-database backup and restore service
#[derive(Parser)]
#[command(name = "dbvault")]
#[command(about = "Backup automation for PostgreSQL, MySQL, SQLite and Neo4j", long_about = None)]
#[command(version)]
pub struct Cli {
    /// API base URL for client commands
    #[arg(long, env = "DBVAULT_API_URL", default_value = "http://127.0.0.1:8080", global = true)]
    pub api_url: String,

    /// Bearer token for client commands
    #[arg(long, env = "DBVAULT_API_TOKEN", hide_env_values = true, global = true)]
    pub token: Option<String>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Start the API server and scheduler
    Serve {
        /// Host to bind to
        #[arg(long, default_value = "127.0.0.1")]
        host: String,

        /// Port to listen on
        #[arg(short, long, default_value = "8080")]
        port: u16,

        /// Repository database path
        #[arg(long, env = "DBVAULT_DB", default_value = "dbvault.db")]
        db: PathBuf,

        /// Root directory of the built-in local destination
        #[arg(long, env = "DBVAULT_LOCAL_ROOT")]
        local_root: Option<PathBuf>,

        /// Concurrent backup workers
        #[arg(long, env = "DBVAULT_WORKERS")]
        workers: Option<usize>,

        /// Disable API authentication (local development only)
        #[arg(long)]
        no_auth: bool,
    },

    /// Manage backup targets
    Targets {
        #[command(subcommand)]
        action: Option<TargetsAction>,
    },

    /// Manage storage destinations
    Destinations {
        #[command(subcommand)]
        action: Option<DestinationsAction>,
    },

    /// Manage backup schedules
    Schedules {
        #[command(subcommand)]
        action: Option<SchedulesAction>,
    },

    /// Run a one-off backup of a target
    BackupNow {
        /// Target id
        #[arg(long)]
        target: String,

        /// Destination ids (defaults to the built-in local storage)
        #[arg(long = "destination")]
        destinations: Vec<String>,

        /// Store at the built-in local destination
        #[arg(long)]
        local: bool,
    },

    /// Restore a backup into a target
    RestoreNow {
        /// Target id
        #[arg(long)]
        target: String,

        /// Backup id as reported by the destination listing
        #[arg(long)]
        backup_id: String,

        /// Destination id holding the backup
        #[arg(long)]
        destination: Option<String>,

        /// Fetch from the built-in local destination
        #[arg(long)]
        local: bool,

        /// Type RESTORE to confirm overwriting the target database
        #[arg(long)]
        confirm: String,

        /// Password for encrypted backups
        #[arg(long)]
        password: Option<String>,
    },

    /// Show run history
    Runs {
        /// Filter by target id
        #[arg(long)]
        target: Option<String>,

        /// Filter by operation: backup, restore
        #[arg(long)]
        operation: Option<String>,

        /// Maximum rows
        #[arg(long, default_value = "20")]
        limit: i64,
    },
}

#[derive(Subcommand)]
pub enum TargetsAction {
    /// List registered targets
    List,
}

#[derive(Subcommand)]
pub enum DestinationsAction {
    /// List managed destinations
    List,

    /// List backups stored at a destination
    Backups {
        /// Destination id (`__local__` for the built-in local storage)
        id: String,

        /// Filter to one target id
        #[arg(long)]
        target: Option<String>,
    },
}

#[derive(Subcommand)]
pub enum SchedulesAction {
    /// List schedules
    List,

    /// Trigger a schedule immediately
    RunNow {
        /// Schedule id
        id: String,
    },

    /// Trigger every enabled schedule
    RunEnabledNow {
        /// Cap on how many schedules to trigger
        #[arg(long, default_value = "100")]
        max: usize,
    },
}

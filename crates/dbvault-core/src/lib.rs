//! dbvault Core Library
//!
//! The backup automation engine behind the dbvault service:
//! - Repository store for targets, destinations, schedules, and run history
//! - Database adapters (PostgreSQL, MySQL, SQLite, Neo4j) over the engines'
//!   standard dump/restore tooling
//! - Destination adapters (local filesystem, SFTP, Google Drive) with a
//!   uniform put/list/get/delete contract
//! - Backup pipeline: dump once, gzip, optional encryption envelope, fan out
//! - Retention evaluator (count / age / size / smart buckets)
//! - Scheduler with per-schedule serialization and a bounded worker pool
//! - Restore pipeline behind a confirmation gate
//! - Telegram and email notifications gated by severity

pub mod dest;
pub mod dump;
pub mod engine;
pub mod envelope;
pub mod error;
pub mod models;
pub mod notify;
pub mod pipeline;
pub mod retention;
pub mod sched;
pub mod store;

pub use engine::{BackupNowParams, Engine, EngineConfig, QueuedRun, RestoreNowParams};
pub use error::{Error, ErrorKind, Result};
pub use models::{
    ArtifactInfo, DbType, Destination, DestinationType, Operation, Run, RunStatus, Schedule,
    Severity, Target, Trigger, LOCAL_DESTINATION_ID,
};
pub use notify::Notifier;
pub use store::{
    DestinationInput, RunFilter, RunPage, ScheduleInput, SecretSealer, Store, TargetInput,
};

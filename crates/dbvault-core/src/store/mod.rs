//! Repository store with connection pooling and migrations
//!
//! All entity mutation is serialized through this module. Organized by
//! entity:
//! - `targets` - registered databases
//! - `destinations` - storage locations
//! - `schedules` - periodic backups with retention policies
//! - `runs` - the append-only audit history
//! - `secrets` - AEAD sealing of secret material at rest

use chrono::{DateTime, SecondsFormat, Utc};
use r2d2::{Pool, PooledConnection};
use r2d2_sqlite::SqliteConnectionManager;
use tracing::info;

use crate::error::{Error, Result};

mod destinations;
mod runs;
mod schedules;
mod secrets;
mod targets;


pub use destinations::DestinationInput;
pub use runs::{RunFilter, RunFinish, RunPage, RunStart};
pub use schedules::ScheduleInput;
pub use secrets::SecretSealer;
pub use targets::TargetInput;

pub type DbPool = Pool<SqliteConnectionManager>;
pub type DbConn = PooledConnection<SqliteConnectionManager>;

/// Environment variable holding the secret-sealing passphrase.
pub const SECRET_KEY_ENV: &str = "DBVAULT_SECRET_KEY";

/// Format a timestamp the way every store column expects it: RFC 3339 UTC
/// with millisecond precision.
pub(crate) fn fmt_ts(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// Parse a stored timestamp.
pub(crate) fn parse_ts(s: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}

/// Repository store wrapper with connection pooling
#[derive(Clone)]
pub struct Store {
    pool: DbPool,
    sealer: SecretSealer,
}

impl Store {
    /// Open (or create) the repository at `path`.
    ///
    /// Requires `DBVAULT_SECRET_KEY` to be set; the sealing key is derived
    /// from it with Argon2.
    pub fn open(path: &str) -> Result<Self> {
        let sealer = SecretSealer::from_env()?;
        Self::open_with_sealer(path, sealer)
    }

    /// Open the repository with an explicit sealer (tests, embedding).
    pub fn open_with_sealer(path: &str, sealer: SecretSealer) -> Result<Self> {
        let manager = SqliteConnectionManager::file(path).with_init(|conn| {
            conn.execute_batch(
                "PRAGMA journal_mode = WAL;
                 PRAGMA foreign_keys = ON;
                 PRAGMA busy_timeout = 5000;",
            )
        });
        let pool = Pool::builder().max_size(10).build(manager)?;

        let store = Self { pool, sealer };
        store.run_migrations()?;
        Ok(store)
    }

    /// Create a throwaway store for testing.
    ///
    /// Uses a temporary file rather than `:memory:` because each pooled
    /// connection would otherwise see its own empty database.
    pub fn in_memory() -> Result<Self> {
        use std::sync::atomic::{AtomicU64, Ordering};
        static COUNTER: AtomicU64 = AtomicU64::new(0);

        let id = COUNTER.fetch_add(1, Ordering::SeqCst);
        let path = std::env::temp_dir().join(format!("dbvault_test_{}_{}.db", std::process::id(), id));
        let _ = std::fs::remove_file(&path);

        Self::open_with_sealer(
            path.to_str()
                .ok_or_else(|| Error::Internal("non-utf8 temp path".into()))?,
            SecretSealer::from_passphrase("test-sealing-key")?,
        )
    }

    /// Get a connection from the pool
    pub(crate) fn conn(&self) -> Result<DbConn> {
        Ok(self.pool.get()?)
    }

    pub(crate) fn sealer(&self) -> &SecretSealer {
        &self.sealer
    }

    /// Apply schema migrations, gated on `PRAGMA user_version`.
    fn run_migrations(&self) -> Result<()> {
        let conn = self.conn()?;
        let version: i64 = conn.query_row("PRAGMA user_version;", [], |row| row.get(0))?;

        if version < 1 {
            conn.execute_batch(
                r#"
                CREATE TABLE IF NOT EXISTS targets (
                    id          TEXT PRIMARY KEY,
                    name        TEXT NOT NULL UNIQUE,
                    db_type     TEXT NOT NULL,
                    config      TEXT NOT NULL,
                    secrets     TEXT,
                    is_active   INTEGER NOT NULL DEFAULT 1,
                    created_at  TEXT NOT NULL,
                    updated_at  TEXT NOT NULL
                );

                CREATE TABLE IF NOT EXISTS destinations (
                    id               TEXT PRIMARY KEY,
                    name             TEXT NOT NULL UNIQUE,
                    destination_type TEXT NOT NULL,
                    config           TEXT NOT NULL,
                    secrets          TEXT,
                    is_active        INTEGER NOT NULL DEFAULT 1,
                    created_at       TEXT NOT NULL,
                    updated_at       TEXT NOT NULL
                );

                CREATE TABLE IF NOT EXISTS schedules (
                    id               TEXT PRIMARY KEY,
                    name             TEXT NOT NULL UNIQUE,
                    target_id        TEXT NOT NULL REFERENCES targets(id),
                    destination_ids  TEXT NOT NULL,
                    interval_seconds INTEGER NOT NULL,
                    enabled          INTEGER NOT NULL DEFAULT 1,
                    retention        TEXT NOT NULL,
                    encrypt_password TEXT,
                    next_run_at      TEXT,
                    last_run_at      TEXT,
                    created_at       TEXT NOT NULL,
                    updated_at       TEXT NOT NULL
                );

                CREATE TABLE IF NOT EXISTS runs (
                    id               TEXT PRIMARY KEY,
                    operation        TEXT NOT NULL,
                    "trigger"        TEXT NOT NULL,
                    target_id        TEXT NOT NULL,
                    target_name      TEXT NOT NULL,
                    schedule_id      TEXT,
                    schedule_name    TEXT,
                    destination_id   TEXT,
                    destination_name TEXT,
                    backup_id        TEXT,
                    backup_filename  TEXT,
                    file_size_mb     REAL,
                    status           TEXT NOT NULL,
                    started_at       TEXT NOT NULL,
                    finished_at      TEXT,
                    error_message    TEXT,
                    detail           TEXT NOT NULL DEFAULT '{}'
                );

                CREATE INDEX IF NOT EXISTS idx_runs_started_at ON runs(started_at DESC);
                CREATE INDEX IF NOT EXISTS idx_runs_target ON runs(target_id);
                CREATE INDEX IF NOT EXISTS idx_runs_status ON runs(status);
                CREATE INDEX IF NOT EXISTS idx_schedules_enabled ON schedules(enabled);

                PRAGMA user_version = 1;
                "#,
            )?;
            info!("Repository schema initialized (version 1)");
        }

        Ok(())
    }
}

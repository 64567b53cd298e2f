//! PostgreSQL adapter: pg_dump / pg_restore / psql
//!
//! Custom-format dumps (`-Fc`, `.dump`) restore through `pg_restore`; plain
//! SQL dumps (`.sql`) restore through `psql`. The password rides in
//! `PGPASSWORD` so it never shows up in process listings.

use std::path::Path;

use tokio::process::Command;
use tokio_util::sync::CancellationToken;

use super::{run_tool_from_file, run_tool_probe, run_tool_to_file, DumpOutput};
use crate::error::{Error, Result};
use crate::models::{PgDumpFormat, PostgresConfig, Secrets};

fn base_args(cmd: &mut Command, cfg: &PostgresConfig, secrets: &Secrets) {
    cmd.arg("-h")
        .arg(&cfg.host)
        .arg("-p")
        .arg(cfg.port.to_string())
        .arg("-U")
        .arg(&cfg.user);
    if let Some(password) = &secrets.password {
        cmd.env("PGPASSWORD", password);
    }
}

pub async fn dump(
    cfg: &PostgresConfig,
    secrets: &Secrets,
    sink: &Path,
    cancel: &CancellationToken,
) -> Result<DumpOutput> {
    let mut cmd = Command::new("pg_dump");
    base_args(&mut cmd, cfg, secrets);
    cmd.arg("-d").arg(&cfg.database);

    let logical_format = match cfg.format {
        PgDumpFormat::Custom => {
            cmd.arg("-Fc");
            "dump"
        }
        PgDumpFormat::Plain => "sql",
    };

    let bytes_written = run_tool_to_file("pg_dump", cmd, sink, cancel).await?;
    Ok(DumpOutput {
        bytes_written,
        logical_format,
    })
}

pub async fn restore(
    cfg: &PostgresConfig,
    secrets: &Secrets,
    source: &Path,
    suffix: &str,
    cancel: &CancellationToken,
) -> Result<()> {
    match suffix {
        "dump" => {
            let mut cmd = Command::new("pg_restore");
            base_args(&mut cmd, cfg, secrets);
            cmd.arg("-d")
                .arg(&cfg.database)
                .arg("--clean")
                .arg("--if-exists")
                .arg("--no-owner");
            run_tool_from_file("pg_restore", cmd, source, cancel).await
        }
        "sql" => {
            let mut cmd = Command::new("psql");
            base_args(&mut cmd, cfg, secrets);
            cmd.arg("-d")
                .arg(&cfg.database)
                .arg("-v")
                .arg("ON_ERROR_STOP=1")
                .arg("-q");
            run_tool_from_file("psql", cmd, source, cancel).await
        }
        other => Err(Error::IncompatibleBackup(format!(
            "postgresql cannot restore a .{} stream",
            other
        ))),
    }
}

pub async fn test_connection(
    cfg: &PostgresConfig,
    secrets: &Secrets,
    cancel: &CancellationToken,
) -> Result<String> {
    let mut cmd = Command::new("psql");
    base_args(&mut cmd, cfg, secrets);
    cmd.arg("-d")
        .arg(&cfg.database)
        .arg("-Atc")
        .arg("SELECT version()");
    let version = run_tool_probe("psql", cmd, cancel).await?;
    Ok(format!("connected: {}", version))
}

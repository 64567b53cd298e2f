//! MySQL adapter: mysqldump / mysql
//!
//! Dumps are plain SQL with `--single-transaction` for a consistent InnoDB
//! snapshot. The password rides in `MYSQL_PWD` rather than on the command
//! line.

use std::path::Path;

use tokio::process::Command;
use tokio_util::sync::CancellationToken;

use super::{run_tool_from_file, run_tool_probe, run_tool_to_file, DumpOutput};
use crate::error::Result;
use crate::models::{MysqlConfig, Secrets};

fn base_args(cmd: &mut Command, cfg: &MysqlConfig, secrets: &Secrets) {
    cmd.arg("-h")
        .arg(&cfg.host)
        .arg("-P")
        .arg(cfg.port.to_string())
        .arg("-u")
        .arg(&cfg.user)
        .arg("--protocol=TCP");
    if let Some(password) = &secrets.password {
        cmd.env("MYSQL_PWD", password);
    }
}

pub async fn dump(
    cfg: &MysqlConfig,
    secrets: &Secrets,
    sink: &Path,
    cancel: &CancellationToken,
) -> Result<DumpOutput> {
    let mut cmd = Command::new("mysqldump");
    base_args(&mut cmd, cfg, secrets);
    cmd.arg("--single-transaction")
        .arg("--routines")
        .arg("--triggers")
        .arg(&cfg.database);

    let bytes_written = run_tool_to_file("mysqldump", cmd, sink, cancel).await?;
    Ok(DumpOutput {
        bytes_written,
        logical_format: "sql",
    })
}

pub async fn restore(
    cfg: &MysqlConfig,
    secrets: &Secrets,
    source: &Path,
    cancel: &CancellationToken,
) -> Result<()> {
    let mut cmd = Command::new("mysql");
    base_args(&mut cmd, cfg, secrets);
    cmd.arg(&cfg.database);
    run_tool_from_file("mysql", cmd, source, cancel).await
}

pub async fn test_connection(
    cfg: &MysqlConfig,
    secrets: &Secrets,
    cancel: &CancellationToken,
) -> Result<String> {
    let mut cmd = Command::new("mysql");
    base_args(&mut cmd, cfg, secrets);
    cmd.arg(&cfg.database)
        .arg("--batch")
        .arg("--skip-column-names")
        .arg("-e")
        .arg("SELECT VERSION()");
    let version = run_tool_probe("mysql", cmd, cancel).await?;
    Ok(format!("connected: MySQL {}", version))
}

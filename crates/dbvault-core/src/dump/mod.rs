//! Database adapters: per-engine dump and restore
//!
//! Each engine speaks through its standard tooling (`pg_dump`/`pg_restore`,
//! `mysqldump`/`mysql`, SQLite `VACUUM INTO`, `cypher-shell`) so the
//! artifacts stay restorable outside this service. Dumps stream subprocess
//! stdout straight into the spool file; nothing is buffered whole.

use std::path::Path;
use std::process::Stdio;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::process::Command;
use tokio_util::sync::CancellationToken;

use crate::error::{Error, Result};
use crate::models::{DbConfig, Secrets, Target};

mod mysql;
mod neo4j;
mod postgres;
mod sqlite;

/// Result of a logical dump.
#[derive(Debug, Clone)]
pub struct DumpOutput {
    pub bytes_written: u64,
    /// Logical dump suffix (`dump`, `sql`, `db`, `cypher`).
    pub logical_format: &'static str,
}

/// Dump `target` into `sink` as a restorable byte stream.
pub async fn dump(
    target: &Target,
    secrets: &Secrets,
    sink: &Path,
    cancel: &CancellationToken,
) -> Result<DumpOutput> {
    match &target.config {
        DbConfig::Postgres(cfg) => postgres::dump(cfg, secrets, sink, cancel).await,
        DbConfig::Mysql(cfg) => mysql::dump(cfg, secrets, sink, cancel).await,
        DbConfig::Sqlite(cfg) => sqlite::dump(cfg, sink, cancel).await,
        DbConfig::Neo4j(cfg) => neo4j::dump(cfg, secrets, sink, cancel).await,
    }
}

/// Restore a stream produced by [`dump`] into `target`. `suffix` is the
/// logical format of `source` (already validated for compatibility).
pub async fn restore(
    target: &Target,
    secrets: &Secrets,
    source: &Path,
    suffix: &str,
    cancel: &CancellationToken,
) -> Result<()> {
    match &target.config {
        DbConfig::Postgres(cfg) => postgres::restore(cfg, secrets, source, suffix, cancel).await,
        DbConfig::Mysql(cfg) => mysql::restore(cfg, secrets, source, cancel).await,
        DbConfig::Sqlite(cfg) => sqlite::restore(cfg, source, cancel).await,
        DbConfig::Neo4j(cfg) => neo4j::restore(cfg, secrets, source, cancel).await,
    }
}

/// Probe connectivity without touching any data.
pub async fn test_connection(target: &Target, secrets: &Secrets) -> Result<String> {
    let cancel = CancellationToken::new();
    match &target.config {
        DbConfig::Postgres(cfg) => postgres::test_connection(cfg, secrets, &cancel).await,
        DbConfig::Mysql(cfg) => mysql::test_connection(cfg, secrets, &cancel).await,
        DbConfig::Sqlite(cfg) => sqlite::test_connection(cfg).await,
        DbConfig::Neo4j(cfg) => neo4j::test_connection(cfg, secrets, &cancel).await,
    }
}

/// How many trailing stderr bytes ride along in a `DumpError`.
const STDERR_TAIL_BYTES: usize = 4096;

fn spawn_failed(tool: &str, err: std::io::Error) -> Error {
    if err.kind() == std::io::ErrorKind::NotFound {
        Error::Permanent(format!(
            "{} not found; install the client tools on the server host",
            tool
        ))
    } else {
        Error::Permanent(format!("failed to spawn {}: {}", tool, err))
    }
}

/// Keep only the trailing bytes of captured stderr.
fn stderr_tail(buf: &[u8]) -> String {
    let start = buf.len().saturating_sub(STDERR_TAIL_BYTES);
    String::from_utf8_lossy(&buf[start..]).trim().to_string()
}

/// Run `cmd`, streaming its stdout into the file at `sink`. Propagates the
/// tool's exit code and stderr tail on failure.
pub(crate) async fn run_tool_to_file(
    tool: &str,
    mut cmd: Command,
    sink: &Path,
    cancel: &CancellationToken,
) -> Result<u64> {
    cmd.stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    let mut child = cmd.spawn().map_err(|e| spawn_failed(tool, e))?;

    let mut stdout = child
        .stdout
        .take()
        .ok_or_else(|| Error::Internal("child stdout not captured".into()))?;
    let mut stderr = child
        .stderr
        .take()
        .ok_or_else(|| Error::Internal("child stderr not captured".into()))?;

    let mut file = tokio::fs::File::create(sink).await?;
    let stderr_task = tokio::spawn(async move {
        let mut buf = Vec::new();
        let _ = stderr.read_to_end(&mut buf).await;
        buf
    });

    let copied = tokio::select! {
        res = tokio::io::copy(&mut stdout, &mut file) => res?,
        _ = cancel.cancelled() => {
            let _ = child.kill().await;
            return Err(Error::Cancelled);
        }
    };
    file.flush().await?;

    let status = tokio::select! {
        status = child.wait() => status?,
        _ = cancel.cancelled() => {
            let _ = child.kill().await;
            return Err(Error::Cancelled);
        }
    };
    let stderr_buf = stderr_task.await.unwrap_or_default();

    if !status.success() {
        return Err(Error::Dump {
            code: status.code().unwrap_or(-1),
            stderr_tail: stderr_tail(&stderr_buf),
        });
    }
    Ok(copied)
}

/// Run `cmd`, feeding the file at `source` into its stdin.
pub(crate) async fn run_tool_from_file(
    tool: &str,
    mut cmd: Command,
    source: &Path,
    cancel: &CancellationToken,
) -> Result<()> {
    cmd.stdin(Stdio::piped())
        .stdout(Stdio::null())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    let mut child = cmd.spawn().map_err(|e| spawn_failed(tool, e))?;

    let mut stdin = child
        .stdin
        .take()
        .ok_or_else(|| Error::Internal("child stdin not captured".into()))?;
    let mut stderr = child
        .stderr
        .take()
        .ok_or_else(|| Error::Internal("child stderr not captured".into()))?;

    let stderr_task = tokio::spawn(async move {
        let mut buf = Vec::new();
        let _ = stderr.read_to_end(&mut buf).await;
        buf
    });

    let mut file = tokio::fs::File::open(source).await?;
    let feed = async {
        tokio::io::copy(&mut file, &mut stdin).await?;
        stdin.shutdown().await?;
        drop(stdin);
        Ok::<_, std::io::Error>(())
    };

    tokio::select! {
        res = feed => res?,
        _ = cancel.cancelled() => {
            let _ = child.kill().await;
            return Err(Error::Cancelled);
        }
    }

    let status = tokio::select! {
        status = child.wait() => status?,
        _ = cancel.cancelled() => {
            let _ = child.kill().await;
            return Err(Error::Cancelled);
        }
    };
    let stderr_buf = stderr_task.await.unwrap_or_default();

    if !status.success() {
        return Err(Error::Dump {
            code: status.code().unwrap_or(-1),
            stderr_tail: stderr_tail(&stderr_buf),
        });
    }
    Ok(())
}

/// Run `cmd` to completion for a connectivity probe. Returns trimmed stdout.
pub(crate) async fn run_tool_probe(
    tool: &str,
    mut cmd: Command,
    cancel: &CancellationToken,
) -> Result<String> {
    cmd.stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    let child = cmd.spawn().map_err(|e| spawn_failed(tool, e))?;

    let output = tokio::select! {
        out = child.wait_with_output() => out?,
        _ = cancel.cancelled() => return Err(Error::Cancelled),
    };

    if !output.status.success() {
        return Err(Error::Dump {
            code: output.status.code().unwrap_or(-1),
            stderr_tail: stderr_tail(&output.stderr),
        });
    }
    Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_run_tool_to_file_streams_stdout() {
        let dir = tempfile::tempdir().unwrap();
        let sink = dir.path().join("out.txt");
        let mut cmd = Command::new("sh");
        cmd.arg("-c").arg("printf 'dump bytes'");

        let cancel = CancellationToken::new();
        let copied = run_tool_to_file("sh", cmd, &sink, &cancel).await.unwrap();
        assert_eq!(copied, 10);
        assert_eq!(std::fs::read_to_string(&sink).unwrap(), "dump bytes");
    }

    #[tokio::test]
    async fn test_run_tool_to_file_propagates_exit_code() {
        let dir = tempfile::tempdir().unwrap();
        let sink = dir.path().join("out.txt");
        let mut cmd = Command::new("sh");
        cmd.arg("-c").arg("echo 'boom: connection refused' >&2; exit 3");

        let cancel = CancellationToken::new();
        let err = run_tool_to_file("sh", cmd, &sink, &cancel)
            .await
            .unwrap_err();
        match err {
            Error::Dump { code, stderr_tail } => {
                assert_eq!(code, 3);
                assert!(stderr_tail.contains("connection refused"));
            }
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_missing_tool_is_permanent() {
        let dir = tempfile::tempdir().unwrap();
        let sink = dir.path().join("out.txt");
        let cmd = Command::new("definitely-not-a-real-tool-4711");

        let cancel = CancellationToken::new();
        let err = run_tool_to_file("definitely-not-a-real-tool-4711", cmd, &sink, &cancel)
            .await
            .unwrap_err();
        assert_eq!(err.kind().code(), "PERMANENT");
    }

    #[tokio::test]
    async fn test_cancellation_kills_child() {
        let dir = tempfile::tempdir().unwrap();
        let sink = dir.path().join("out.txt");
        let mut cmd = Command::new("sh");
        cmd.arg("-c").arg("sleep 30");

        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = run_tool_to_file("sh", cmd, &sink, &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Cancelled));
    }
}

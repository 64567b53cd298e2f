//! SQLite adapter
//!
//! Dumps are a consistent page image produced with `VACUUM INTO`, which
//! works safely while the database is in use. Restore swaps the image into
//! place with a write-then-rename.

use std::path::{Path, PathBuf};

use tokio_util::sync::CancellationToken;

use super::DumpOutput;
use crate::error::{Error, Result};
use crate::models::SqliteConfig;

pub async fn dump(
    cfg: &SqliteConfig,
    sink: &Path,
    cancel: &CancellationToken,
) -> Result<DumpOutput> {
    if cancel.is_cancelled() {
        return Err(Error::Cancelled);
    }
    let source = cfg.path.clone();
    if !source.exists() {
        return Err(Error::Permanent(format!(
            "sqlite database not found: {}",
            source.display()
        )));
    }

    // VACUUM INTO refuses to overwrite
    if sink.exists() {
        tokio::fs::remove_file(sink).await?;
    }

    let sink_owned: PathBuf = sink.to_path_buf();
    tokio::task::spawn_blocking(move || -> Result<()> {
        let conn = rusqlite::Connection::open_with_flags(
            &source,
            rusqlite::OpenFlags::SQLITE_OPEN_READ_ONLY,
        )?;
        let sink_str = sink_owned
            .to_str()
            .ok_or_else(|| Error::Internal("non-utf8 spool path".into()))?;
        conn.execute("VACUUM INTO ?1", [sink_str])?;
        Ok(())
    })
    .await
    .map_err(|e| Error::Internal(format!("vacuum task panicked: {}", e)))??;

    let bytes_written = tokio::fs::metadata(sink).await?.len();
    Ok(DumpOutput {
        bytes_written,
        logical_format: "db",
    })
}

pub async fn restore(cfg: &SqliteConfig, source: &Path, cancel: &CancellationToken) -> Result<()> {
    if cancel.is_cancelled() {
        return Err(Error::Cancelled);
    }

    // Refuse anything that is not an SQLite page image before touching the
    // live file
    verify_page_image(source).await?;

    if let Some(parent) = cfg.path.parent() {
        if !parent.as_os_str().is_empty() {
            tokio::fs::create_dir_all(parent).await?;
        }
    }

    let staged = cfg.path.with_extension("db.restore-tmp");
    tokio::fs::copy(source, &staged).await?;
    tokio::fs::rename(&staged, &cfg.path).await?;
    Ok(())
}

pub async fn test_connection(cfg: &SqliteConfig) -> Result<String> {
    let path = cfg.path.clone();
    let pages = tokio::task::spawn_blocking(move || -> Result<i64> {
        let conn = rusqlite::Connection::open_with_flags(
            &path,
            rusqlite::OpenFlags::SQLITE_OPEN_READ_ONLY,
        )?;
        Ok(conn.query_row("PRAGMA page_count", [], |row| row.get(0))?)
    })
    .await
    .map_err(|e| Error::Internal(format!("probe task panicked: {}", e)))??;
    Ok(format!("connected: {} pages", pages))
}

/// Open the file read-only and run a trivial query to check it is a real
/// database image.
async fn verify_page_image(path: &Path) -> Result<()> {
    let path = path.to_path_buf();
    tokio::task::spawn_blocking(move || -> Result<()> {
        let conn = rusqlite::Connection::open_with_flags(
            &path,
            rusqlite::OpenFlags::SQLITE_OPEN_READ_ONLY,
        )
        .map_err(|e| Error::IncompatibleBackup(format!("not an sqlite image: {}", e)))?;
        conn.query_row("PRAGMA schema_version", [], |row| row.get::<_, i64>(0))
            .map_err(|e| Error::IncompatibleBackup(format!("not an sqlite image: {}", e)))?;
        Ok(())
    })
    .await
    .map_err(|e| Error::Internal(format!("verify task panicked: {}", e)))?
}

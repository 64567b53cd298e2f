//! Destination adapters: uniform storage contract over pluggable backends
//!
//! Implementations handle storing artifacts in different locations:
//! - Local filesystem
//! - SFTP
//! - Google Drive
//!
//! Every backend speaks the same `put`/`list`/`get`/`delete` contract and
//! classifies failures as transient (retried by [`with_retries`]) or
//! permanent. `backup_id` is adapter-opaque: a relative path for local, a
//! full remote path for SFTP, a file id for Google Drive. Callers never
//! parse it.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rand::Rng;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::error::{Error, Result};
use crate::models::{ArtifactInfo, DestConfig, Destination, Secrets, StoredArtifact};

mod gdrive;
mod local;
mod sftp;

pub use local::LocalBackend;

/// Retry schedule for transient adapter failures.
const RETRY_ATTEMPTS: u32 = 3;
const RETRY_BASE: Duration = Duration::from_secs(2);
const RETRY_JITTER: f64 = 0.25;

/// Uniform storage backend contract.
#[async_trait]
pub trait StorageAdapter: Send + Sync {
    /// Backend label for logs and run detail.
    fn kind(&self) -> &'static str;

    /// Store the file at `source` under the object key
    /// `<target_folder>/<filename>`.
    async fn put(&self, key: &str, source: &Path, size: u64) -> Result<StoredArtifact>;

    /// List artifacts, optionally restricted to one target folder. Backends
    /// fetch pages until exhausted or `limit` is reached; offset slicing is
    /// the caller's business.
    async fn list(&self, prefix: Option<&str>, limit: Option<usize>) -> Result<Vec<ArtifactInfo>>;

    /// Fetch an artifact into the local file at `dest`.
    async fn get(&self, backup_id: &str, name: &str, dest: &Path) -> Result<()>;

    /// Delete an artifact.
    async fn delete(&self, backup_id: &str, name: &str) -> Result<()>;

    /// Probe the backend without writing anything.
    async fn test_connection(&self) -> Result<String>;
}

/// Open the backend for a destination. Secrets stay inside the returned
/// adapter.
pub fn open(destination: &Destination, secrets: &Secrets) -> Result<Arc<dyn StorageAdapter>> {
    match &destination.config {
        DestConfig::Local(cfg) => Ok(Arc::new(local::LocalBackend::new(cfg.root.clone()))),
        DestConfig::Sftp(cfg) => Ok(Arc::new(sftp::SftpBackend::new(cfg.clone(), secrets.clone())?)),
        DestConfig::GoogleDrive(cfg) => Ok(Arc::new(gdrive::GoogleDriveBackend::new(
            cfg.clone(),
            secrets.clone(),
        )?)),
    }
}

/// Run `op` with exponential backoff on transient failures: 3 attempts,
/// base 2 s, jitter ±25 %.
pub async fn with_retries<T, F, Fut>(
    label: &str,
    cancel: &CancellationToken,
    mut op: F,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T>>,
{
    let mut attempt: u32 = 0;
    loop {
        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }
        match op().await {
            Ok(value) => return Ok(value),
            Err(err) if err.is_transient() && attempt + 1 < RETRY_ATTEMPTS => {
                attempt += 1;
                let backoff = RETRY_BASE.as_secs_f64() * f64::from(1u32 << (attempt - 1));
                let jitter = rand::thread_rng().gen_range(-RETRY_JITTER..=RETRY_JITTER);
                let delay = Duration::from_secs_f64((backoff * (1.0 + jitter)).max(0.1));
                warn!(
                    "{}: transient failure (attempt {}/{}), retrying in {:.1}s: {}",
                    label,
                    attempt,
                    RETRY_ATTEMPTS,
                    delay.as_secs_f64(),
                    err
                );
                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    _ = cancel.cancelled() => return Err(Error::Cancelled),
                }
            }
            Err(err) => return Err(err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test(start_paused = true)]
    async fn test_retries_transient_then_succeeds() {
        let calls = AtomicU32::new(0);
        let cancel = CancellationToken::new();
        let result = with_retries("test", &cancel, || {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if n < 2 {
                    Err(Error::Transient("flaky".into()))
                } else {
                    Ok(42)
                }
            }
        })
        .await
        .unwrap();
        assert_eq!(result, 42);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_exhaustion_surfaces_error() {
        let cancel = CancellationToken::new();
        let result: Result<()> = with_retries("test", &cancel, || async {
            Err(Error::Transient("still down".into()))
        })
        .await;
        assert!(result.unwrap_err().is_transient());
    }

    #[tokio::test]
    async fn test_permanent_fails_immediately() {
        let calls = AtomicU32::new(0);
        let cancel = CancellationToken::new();
        let result: Result<()> = with_retries("test", &cancel, || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(Error::Permanent("bad creds".into())) }
        })
        .await;
        assert_eq!(result.unwrap_err().kind().code(), "PERMANENT");
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_cancelled_before_start() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let result: Result<()> = with_retries("test", &cancel, || async { Ok(()) }).await;
        assert!(matches!(result.unwrap_err(), Error::Cancelled));
    }
}

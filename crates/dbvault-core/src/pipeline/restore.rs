//! Restore pipeline
//!
//! The confirmation gate, password requirement, and engine compatibility
//! check all happen before a run is recorded; a refused restore is a
//! validation error, not an operation, and leaves no audit trace. Once
//! gated, the pipeline fetches the artifact, reverses the transforms suffix
//! by suffix, and streams the logical dump into the target's engine
//! adapter.

use std::path::PathBuf;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use super::filename::ParsedFilename;
use crate::dest::with_retries;
use crate::dump;
use crate::engine::Engine;
use crate::envelope;
use crate::error::{Error, Result};
use crate::models::{
    ArtifactInfo, Destination, Operation, Run, RunStatus, Secrets, Target, Trigger,
};
use crate::store::{RunFinish, RunStart};

/// The literal confirmation a restore request must carry.
pub const CONFIRMATION: &str = "RESTORE";

/// A fully-gated restore, resolved by the engine.
pub struct RestoreRequest {
    pub target: Target,
    pub target_secrets: Secrets,
    pub destination: Destination,
    pub artifact: ArtifactInfo,
    pub parsed: ParsedFilename,
    pub encryption_password: Option<String>,
    pub trigger: Trigger,
}

/// Validate the restore gates. Called by the engine before any run is
/// recorded.
pub fn check_gates(
    confirmation: &str,
    parsed: &ParsedFilename,
    target: &Target,
    encryption_password: Option<&str>,
) -> Result<()> {
    if confirmation != CONFIRMATION {
        return Err(Error::ConfirmationRequired);
    }
    if parsed.encrypted && encryption_password.map_or(true, str::is_empty) {
        return Err(Error::EncryptionPasswordRequired);
    }
    if !target
        .db_type
        .compatible_suffixes()
        .contains(&parsed.suffix.as_str())
    {
        return Err(Error::IncompatibleBackup(format!(
            "a .{} backup cannot restore into a {} target",
            parsed.suffix, target.db_type
        )));
    }
    Ok(())
}

/// Run a gated restore end to end. Like the backup pipeline, failures fold
/// into the terminal run record.
pub async fn run(
    engine: &Arc<Engine>,
    request: RestoreRequest,
    cancel: &CancellationToken,
) -> Result<Run> {
    let run_id = engine.store().record_run_start(RunStart {
        operation: Operation::Restore,
        trigger: request.trigger,
        target_id: request.target.id.clone(),
        target_name: request.target.name.clone(),
        schedule_id: None,
        schedule_name: None,
        destination_id: Some(request.destination.id.clone()),
        destination_name: Some(request.destination.name.clone()),
    })?;
    info!(
        run_id = %run_id,
        target = %request.target.name,
        backup = %request.artifact.name,
        "Restore run started"
    );

    let result = execute(engine, &request, cancel).await;

    let finish = match &result {
        Ok(()) => RunFinish {
            status: Some(RunStatus::Success),
            backup_id: Some(request.artifact.id.clone()),
            backup_filename: Some(request.artifact.name.clone()),
            file_size_mb: Some((request.artifact.size as f64 / (1024.0 * 1024.0) * 100.0).round() / 100.0),
            ..Default::default()
        },
        Err(err) => {
            let message = match err {
                Error::Cancelled => "cancelled".to_string(),
                other => other.to_string(),
            };
            warn!(run_id = %run_id, "Restore failed: {}", message);
            RunFinish {
                status: Some(RunStatus::Failure),
                backup_id: Some(request.artifact.id.clone()),
                backup_filename: Some(request.artifact.name.clone()),
                error_message: Some(message),
                ..Default::default()
            }
        }
    };

    let run = engine.store().record_run_finish(&run_id, finish)?;
    info!(run_id = %run.id, status = run.status.as_str(), "Restore run finished");
    Ok(run)
}

async fn execute(
    engine: &Arc<Engine>,
    request: &RestoreRequest,
    cancel: &CancellationToken,
) -> Result<()> {
    let spool = tempfile::tempdir()?;
    let fetched = spool.path().join(&request.artifact.name);

    let adapter = engine.adapter_for(&request.destination)?;
    let label = format!(
        "get {} from {}",
        request.artifact.name, request.destination.name
    );
    with_retries(&label, cancel, || {
        adapter.get(&request.artifact.id, &request.artifact.name, &fetched)
    })
    .await?;

    // Reverse transforms: strip .enc, then .gz
    let logical = spool.path().join("restore.logical");
    reverse_transform(
        fetched,
        logical.clone(),
        &request.parsed,
        request.encryption_password.clone(),
        cancel,
    )
    .await?;

    dump::restore(
        &request.target,
        &request.target_secrets,
        &logical,
        &request.parsed.suffix,
        cancel,
    )
    .await
}

async fn reverse_transform(
    fetched: PathBuf,
    logical: PathBuf,
    parsed: &ParsedFilename,
    password: Option<String>,
    cancel: &CancellationToken,
) -> Result<()> {
    if cancel.is_cancelled() {
        return Err(Error::Cancelled);
    }
    let parsed = parsed.clone();
    tokio::task::spawn_blocking(move || -> Result<()> {
        use std::io::{BufReader, BufWriter, Read, Write};

        // .enc comes off first
        let compressed: Box<dyn Read> = if parsed.encrypted {
            let password = password.ok_or(Error::EncryptionPasswordRequired)?;
            let mut sealed = BufReader::new(std::fs::File::open(&fetched)?);
            let decrypted_path = fetched.with_extension("dec");
            let mut decrypted = BufWriter::new(std::fs::File::create(&decrypted_path)?);
            envelope::open(&mut sealed, &mut decrypted, &password)?;
            decrypted.flush()?;
            drop(decrypted);
            Box::new(BufReader::new(std::fs::File::open(&decrypted_path)?))
        } else {
            Box::new(BufReader::new(std::fs::File::open(&fetched)?))
        };

        // then .gz
        let mut sink = BufWriter::new(std::fs::File::create(&logical)?);
        if parsed.gzip {
            let mut decoder = flate2::read::GzDecoder::new(compressed);
            std::io::copy(&mut decoder, &mut sink)
                .map_err(|e| Error::Validation(format!("gzip stream is corrupt: {}", e)))?;
        } else {
            let mut compressed = compressed;
            std::io::copy(&mut compressed, &mut sink)?;
        }
        sink.flush()?;
        Ok(())
    })
    .await
    .map_err(|e| Error::Internal(format!("restore transform panicked: {}", e)))?
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{DbConfig, DbType, SqliteConfig};
    use crate::pipeline::filename;
    use chrono::Utc;

    fn sqlite_target() -> Target {
        Target {
            id: "t1".into(),
            name: "app".into(),
            db_type: DbType::Sqlite,
            config: DbConfig::Sqlite(SqliteConfig {
                path: "/tmp/app.db".into(),
            }),
            is_active: true,
            created_at: Utc::now(),
            updated_at: Utc::now(),
            has_secrets: false,
        }
    }

    fn parsed(name: &str) -> ParsedFilename {
        filename::parse(name).unwrap()
    }

    #[test]
    fn test_gate_confirmation_literal() {
        let target = sqlite_target();
        let p = parsed("backup_app_20250301_033000.db.gz");

        // Lowercase is refused
        let err = check_gates("restore", &p, &target, None).unwrap_err();
        assert_eq!(err.kind().code(), "CONFIRMATION_REQUIRED");

        assert!(check_gates("RESTORE", &p, &target, None).is_ok());
    }

    #[test]
    fn test_gate_password_required_for_enc() {
        let target = sqlite_target();
        let p = parsed("backup_app_20250301_033000.db.gz.enc");

        let err = check_gates("RESTORE", &p, &target, None).unwrap_err();
        assert_eq!(err.kind().code(), "ENCRYPTION_PASSWORD_REQUIRED");
        let err = check_gates("RESTORE", &p, &target, Some("")).unwrap_err();
        assert_eq!(err.kind().code(), "ENCRYPTION_PASSWORD_REQUIRED");

        assert!(check_gates("RESTORE", &p, &target, Some("hunter2")).is_ok());
    }

    #[test]
    fn test_gate_suffix_compatibility() {
        let target = sqlite_target();
        let p = parsed("backup_app_20250301_033000.sql.gz");

        let err = check_gates("RESTORE", &p, &target, None).unwrap_err();
        assert_eq!(err.kind().code(), "INCOMPATIBLE_BACKUP");
    }

    #[tokio::test]
    async fn test_reverse_transform_gzip() {
        let dir = tempfile::tempdir().unwrap();
        let fetched = dir.path().join("backup_app_20250301_033000.db.gz");
        let logical = dir.path().join("out.db");

        // gzip some bytes
        {
            use flate2::write::GzEncoder;
            use std::io::Write;
            let mut encoder = GzEncoder::new(
                std::fs::File::create(&fetched).unwrap(),
                flate2::Compression::new(6),
            );
            encoder.write_all(b"page image bytes").unwrap();
            encoder.finish().unwrap();
        }

        let cancel = CancellationToken::new();
        reverse_transform(
            fetched,
            logical.clone(),
            &parsed("backup_app_20250301_033000.db.gz"),
            None,
            &cancel,
        )
        .await
        .unwrap();
        assert_eq!(std::fs::read(&logical).unwrap(), b"page image bytes");
    }

    #[tokio::test]
    async fn test_reverse_transform_enc_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let fetched = dir.path().join("backup_app_20250301_033000.db.gz.enc");
        let logical = dir.path().join("out.db");

        // gzip + seal, as the backup pipeline would
        {
            use flate2::bufread::GzEncoder;
            use std::io::Cursor;
            let mut compressed = GzEncoder::new(
                Cursor::new(b"page image bytes".to_vec()),
                flate2::Compression::new(6),
            );
            let mut sealed = std::fs::File::create(&fetched).unwrap();
            envelope::seal(&mut compressed, &mut sealed, "hunter2").unwrap();
        }

        let cancel = CancellationToken::new();
        let p = parsed("backup_app_20250301_033000.db.gz.enc");

        // Wrong password fails before anything is written
        let err = reverse_transform(
            fetched.clone(),
            logical.clone(),
            &p,
            Some("wrong".into()),
            &cancel,
        )
        .await
        .unwrap_err();
        assert_eq!(err.kind().code(), "DECRYPT_FAILED");

        reverse_transform(fetched, logical.clone(), &p, Some("hunter2".into()), &cancel)
            .await
            .unwrap();
        assert_eq!(std::fs::read(&logical).unwrap(), b"page image bytes");
    }
}

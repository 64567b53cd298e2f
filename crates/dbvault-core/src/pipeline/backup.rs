//! Backup pipeline
//!
//! Stages, in order: dump -> gzip -> envelope (optional) -> fan-out ->
//! retention -> finalize -> notify. The dump happens exactly once per run;
//! destinations stream the transformed spool file concurrently, and a
//! failed upload retries from the spool instead of re-dumping.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use super::filename;
use crate::dest::with_retries;
use crate::dump;
use crate::engine::Engine;
use crate::envelope;
use crate::error::{Error, Result};
use crate::models::{
    Destination, DestinationOutcome, Id, NotificationConfig, Operation, OutcomeStatus,
    RetentionOutcome, RetentionRule, Run, RunDetail, RunStatus, Secrets, Target, Trigger,
};
use crate::retention;
use crate::store::{RunFinish, RunStart};

/// Everything a single backup run needs, resolved up front so the pipeline
/// holds immutable snapshots only.
pub struct BackupRequest {
    pub target: Target,
    pub target_secrets: Secrets,
    pub destinations: Vec<Destination>,
    pub retention_rule: Option<RetentionRule>,
    pub encrypt_password: Option<String>,
    pub notifications: NotificationConfig,
    pub trigger: Trigger,
    pub schedule: Option<(Id, String)>,
}

struct Executed {
    filename: String,
    artifact: PathBuf,
    size: u64,
    destinations: Vec<DestinationOutcome>,
    retention: Vec<RetentionOutcome>,
    // Keeps the spool directory alive until notifications are done
    _spool: tempfile::TempDir,
}

/// Run a backup end to end. The returned run is terminal; pipeline failures
/// are folded into it rather than surfaced as errors.
pub async fn run(
    engine: &Arc<Engine>,
    request: BackupRequest,
    cancel: &CancellationToken,
) -> Result<Run> {
    let (destination_id, destination_name) = match request.destinations.as_slice() {
        [single] => (Some(single.id.clone()), Some(single.name.clone())),
        _ => (None, None),
    };
    let run_id = engine.store().record_run_start(RunStart {
        operation: Operation::Backup,
        trigger: request.trigger,
        target_id: request.target.id.clone(),
        target_name: request.target.name.clone(),
        schedule_id: request.schedule.as_ref().map(|(id, _)| id.clone()),
        schedule_name: request.schedule.as_ref().map(|(_, name)| name.clone()),
        destination_id,
        destination_name,
    })?;
    info!(
        run_id = %run_id,
        target = %request.target.name,
        "Backup run started"
    );

    let executed = execute(engine, &request, cancel).await;

    let run = match executed {
        Ok(executed) => {
            let ok = executed
                .destinations
                .iter()
                .filter(|d| d.status == OutcomeStatus::Success)
                .count();
            let status = if ok == executed.destinations.len() {
                RunStatus::Success
            } else if ok == 0 {
                RunStatus::Failure
            } else {
                RunStatus::PartialSuccess
            };
            let error_message = match status {
                RunStatus::Success => None,
                _ => first_destination_error(&executed.destinations),
            };
            let backup_id = match executed.destinations.as_slice() {
                [single] => single.backup_id.clone(),
                _ => None,
            };

            let run = engine.store().record_run_finish(
                &run_id,
                RunFinish {
                    status: Some(status),
                    detail: RunDetail {
                        destinations: executed.destinations.clone(),
                        retention: executed.retention.clone(),
                        notifications: Vec::new(),
                    },
                    backup_id,
                    backup_filename: Some(executed.filename.clone()),
                    file_size_mb: Some(mb(executed.size)),
                    error_message,
                },
            )?;

            notify(engine, &run, &request.notifications, Some(&executed.artifact)).await;
            run
        }
        Err(err) => {
            let error_message = match &err {
                Error::Cancelled => "cancelled".to_string(),
                other => other.to_string(),
            };
            warn!(run_id = %run_id, "Backup run failed: {}", error_message);
            let run = engine.store().record_run_finish(
                &run_id,
                RunFinish {
                    status: Some(RunStatus::Failure),
                    error_message: Some(error_message),
                    ..Default::default()
                },
            )?;
            notify(engine, &run, &request.notifications, None).await;
            run
        }
    };

    // Pick up appended notification outcomes
    let run = engine.store().get_run(&run.id)?.unwrap_or(run);
    info!(
        run_id = %run.id,
        status = run.status.as_str(),
        "Backup run finished"
    );
    Ok(run)
}

async fn execute(
    engine: &Arc<Engine>,
    request: &BackupRequest,
    cancel: &CancellationToken,
) -> Result<Executed> {
    let spool = tempfile::tempdir()?;
    let raw = spool.path().join("dump.raw");

    // Stage A: one logical dump
    let output = dump::dump(&request.target, &request.target_secrets, &raw, cancel).await?;
    info!(
        target = %request.target.name,
        bytes = output.bytes_written,
        format = output.logical_format,
        "Dump complete"
    );

    // Stages B/C: gzip, then the encryption envelope
    let encrypt = request.encrypt_password.is_some();
    let name = filename::compose(
        &request.target.name,
        Utc::now(),
        output.logical_format,
        true,
        encrypt,
    );
    let artifact = spool.path().join(&name);
    transform(
        raw.clone(),
        artifact.clone(),
        request.encrypt_password.clone(),
        cancel,
    )
    .await?;
    let size = tokio::fs::metadata(&artifact).await?.len();

    // Fan out to every destination; declared order is preserved in the
    // outcome list even though uploads run concurrently.
    let key = filename::storage_key(&request.target.name, &name);
    let mut handles = Vec::with_capacity(request.destinations.len());
    for destination in request.destinations.clone() {
        let engine = engine.clone();
        let artifact = artifact.clone();
        let key = key.clone();
        let cancel = cancel.clone();
        handles.push(tokio::spawn(async move {
            upload_one(&engine, &destination, &key, &artifact, size, &cancel).await
        }));
    }
    let mut destinations = Vec::with_capacity(handles.len());
    for handle in handles {
        destinations.push(
            handle
                .await
                .map_err(|e| Error::Internal(format!("upload task panicked: {}", e)))?,
        );
    }

    if cancel.is_cancelled() {
        return Err(Error::Cancelled);
    }

    // Retention per destination; failures are recorded, never escalated
    let mut retention_outcomes = Vec::new();
    if let Some(rule) = &request.retention_rule {
        let folder = filename::sanitize_target_name(&request.target.name);
        for destination in &request.destinations {
            retention_outcomes.push(
                apply_retention(engine, destination, rule, &folder, cancel).await,
            );
        }
    }

    Ok(Executed {
        filename: name,
        artifact,
        size,
        destinations,
        retention: retention_outcomes,
        _spool: spool,
    })
}

/// gzip (level 6) and optionally envelope-encrypt `raw` into `artifact`.
async fn transform(
    raw: PathBuf,
    artifact: PathBuf,
    encrypt_password: Option<String>,
    cancel: &CancellationToken,
) -> Result<()> {
    if cancel.is_cancelled() {
        return Err(Error::Cancelled);
    }
    tokio::task::spawn_blocking(move || -> Result<()> {
        use std::io::{BufReader, BufWriter, Write};

        let source = std::fs::File::open(&raw)?;
        let mut compressed = flate2::bufread::GzEncoder::new(
            BufReader::new(source),
            flate2::Compression::new(6),
        );
        let mut sink = BufWriter::new(std::fs::File::create(&artifact)?);

        match encrypt_password {
            Some(password) => {
                envelope::seal(&mut compressed, &mut sink, &password)?;
            }
            None => {
                std::io::copy(&mut compressed, &mut sink)?;
            }
        }
        sink.flush()?;
        Ok(())
    })
    .await
    .map_err(|e| Error::Internal(format!("transform task panicked: {}", e)))?
}

async fn upload_one(
    engine: &Arc<Engine>,
    destination: &Destination,
    key: &str,
    artifact: &Path,
    size: u64,
    cancel: &CancellationToken,
) -> DestinationOutcome {
    let started = Instant::now();
    let label = format!("put {} -> {}", key, destination.name);

    let result = async {
        let adapter = engine.adapter_for(destination)?;
        with_retries(&label, cancel, || adapter.put(key, artifact, size)).await
    }
    .await;

    match result {
        Ok(stored) => DestinationOutcome {
            destination_id: destination.id.clone(),
            destination_name: destination.name.clone(),
            status: OutcomeStatus::Success,
            backup_id: Some(stored.backup_id),
            bytes: Some(size),
            duration_ms: started.elapsed().as_millis() as u64,
            error: None,
        },
        Err(err) => {
            warn!("Upload to {} failed: {}", destination.name, err);
            DestinationOutcome {
                destination_id: destination.id.clone(),
                destination_name: destination.name.clone(),
                status: OutcomeStatus::Failure,
                backup_id: None,
                bytes: None,
                duration_ms: started.elapsed().as_millis() as u64,
                error: Some(err.to_string()),
            }
        }
    }
}

async fn apply_retention(
    engine: &Arc<Engine>,
    destination: &Destination,
    rule: &RetentionRule,
    folder: &str,
    cancel: &CancellationToken,
) -> RetentionOutcome {
    let result = async {
        let adapter = engine.adapter_for(destination)?;
        let artifacts = adapter.list(Some(folder), None).await?;
        let doomed = retention::evaluate(rule, &artifacts, Utc::now());

        let mut deleted = Vec::new();
        for artifact in doomed {
            let label = format!("retention delete {} at {}", artifact.name, destination.name);
            with_retries(&label, cancel, || {
                adapter.delete(&artifact.id, &artifact.name)
            })
            .await?;
            deleted.push(artifact.name);
        }
        Ok::<_, Error>(deleted)
    }
    .await;

    match result {
        Ok(deleted) => {
            if !deleted.is_empty() {
                info!(
                    "Retention deleted {} artifact(s) at {}",
                    deleted.len(),
                    destination.name
                );
            }
            RetentionOutcome {
                destination_id: destination.id.clone(),
                deleted,
                error: None,
            }
        }
        Err(err) => {
            warn!("Retention at {} failed: {}", destination.name, err);
            RetentionOutcome {
                destination_id: destination.id.clone(),
                deleted: Vec::new(),
                error: Some(err.to_string()),
            }
        }
    }
}

async fn notify(
    engine: &Arc<Engine>,
    run: &Run,
    config: &NotificationConfig,
    artifact: Option<&Path>,
) {
    if config.is_empty() {
        return;
    }
    let outcomes = engine.notifier().notify_run(run, config, artifact).await;
    if let Err(e) = engine.store().append_run_notifications(&run.id, &outcomes) {
        warn!("Failed to record notification outcomes: {}", e);
    }
}

fn first_destination_error(outcomes: &[DestinationOutcome]) -> Option<String> {
    outcomes
        .iter()
        .find_map(|o| o.error.as_ref().map(|e| format!("{}: {}", o.destination_name, e)))
}

fn mb(bytes: u64) -> f64 {
    (bytes as f64 / (1024.0 * 1024.0) * 100.0).round() / 100.0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mb_rounding() {
        assert_eq!(mb(1024 * 1024), 1.0);
        assert_eq!(mb(1572864), 1.5);
        assert_eq!(mb(10), 0.0);
    }

    #[test]
    fn test_first_destination_error_picks_declared_order() {
        let outcomes = vec![
            DestinationOutcome {
                destination_id: "a".into(),
                destination_name: "local".into(),
                status: OutcomeStatus::Success,
                backup_id: Some("x".into()),
                bytes: Some(1),
                duration_ms: 1,
                error: None,
            },
            DestinationOutcome {
                destination_id: "b".into(),
                destination_name: "sftp-A".into(),
                status: OutcomeStatus::Failure,
                backup_id: None,
                bytes: None,
                duration_ms: 1,
                error: Some("auth failed".into()),
            },
        ];
        assert_eq!(
            first_destination_error(&outcomes).unwrap(),
            "sftp-A: auth failed"
        );
    }
}

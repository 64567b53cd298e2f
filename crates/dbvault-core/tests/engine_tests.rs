//! End-to-end engine tests over a real SQLite target and the built-in local
//! destination.

use std::path::Path;
use std::sync::Arc;

use serde_json::json;
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

use dbvault_core::engine::{BackupNowParams, Engine, EngineConfig, RestoreNowParams};
use dbvault_core::models::{RetentionRule, RunStatus, Secrets, Trigger};
use dbvault_core::pipeline::backup::{self, BackupRequest};
use dbvault_core::store::{DestinationInput, SecretSealer, Store, TargetInput};
use dbvault_core::{DbType, DestinationType, Notifier};

struct Harness {
    _dir: TempDir,
    engine: Arc<Engine>,
    db_path: std::path::PathBuf,
    local_root: std::path::PathBuf,
    target_id: String,
}

fn seed_database(path: &Path, rows: &[&str]) {
    let conn = rusqlite::Connection::open(path).unwrap();
    conn.execute_batch("CREATE TABLE IF NOT EXISTS notes (id INTEGER PRIMARY KEY, body TEXT);")
        .unwrap();
    conn.execute("DELETE FROM notes", []).unwrap();
    for row in rows {
        conn.execute("INSERT INTO notes (body) VALUES (?)", [row])
            .unwrap();
    }
}

fn note_count(path: &Path) -> i64 {
    let conn = rusqlite::Connection::open(path).unwrap();
    conn.query_row("SELECT COUNT(*) FROM notes", [], |row| row.get(0))
        .unwrap()
}

fn harness() -> Harness {
    let dir = TempDir::new().unwrap();
    let db_path = dir.path().join("app.db");
    seed_database(&db_path, &["alpha", "beta"]);

    let store = Store::open_with_sealer(
        dir.path().join("repo.db").to_str().unwrap(),
        SecretSealer::from_passphrase("test-seal").unwrap(),
    )
    .unwrap();

    let target = store
        .create_target(TargetInput {
            name: "App".into(),
            db_type: DbType::Sqlite,
            config: json!({"path": db_path}),
            secrets: None,
            is_active: true,
        })
        .unwrap();

    let local_root = dir.path().join("backups");
    let engine = Engine::new(
        store,
        EngineConfig {
            local_root: local_root.clone(),
            workers: 4,
        },
        Notifier::new(None, None),
    );

    Harness {
        _dir: dir,
        engine,
        db_path,
        local_root,
        target_id: target.id,
    }
}

fn local_artifacts(root: &Path) -> Vec<String> {
    let folder = root.join("app");
    if !folder.exists() {
        return Vec::new();
    }
    let mut names: Vec<String> = std::fs::read_dir(folder)
        .unwrap()
        .map(|e| e.unwrap().file_name().into_string().unwrap())
        .collect();
    names.sort();
    names
}

#[tokio::test]
async fn test_backup_now_to_local_storage() {
    let h = harness();

    let run = h
        .engine
        .backup_now(BackupNowParams {
            target_id: h.target_id.clone(),
            destination_ids: None,
            use_local_storage: true,
        })
        .await
        .unwrap();

    assert_eq!(run.status, RunStatus::Success);
    assert_eq!(run.trigger, Trigger::Manual);
    assert!(run.finished_at.unwrap() > run.started_at);
    assert!(run.file_size_mb.unwrap() >= 0.0);

    let names = local_artifacts(&h.local_root);
    assert_eq!(names.len(), 1);
    assert!(names[0].starts_with("backup_app_"));
    assert!(names[0].ends_with(".db.gz"));
    assert_eq!(run.backup_filename.as_deref(), Some(names[0].as_str()));

    // The run is in the audit history
    let page = h
        .engine
        .store()
        .list_runs(&Default::default())
        .unwrap();
    assert_eq!(page.runs.len(), 1);
    assert_eq!(page.runs[0].detail.destinations.len(), 1);
}

#[tokio::test]
async fn test_backup_restore_roundtrip() {
    let h = harness();

    let run = h
        .engine
        .backup_now(BackupNowParams {
            target_id: h.target_id.clone(),
            destination_ids: None,
            use_local_storage: true,
        })
        .await
        .unwrap();
    assert_eq!(run.status, RunStatus::Success);
    let backup_id = run.detail.destinations[0].backup_id.clone().unwrap();

    // Diverge the live database, then restore
    seed_database(&h.db_path, &["alpha", "beta", "gamma", "delta"]);
    assert_eq!(note_count(&h.db_path), 4);

    let restore = h
        .engine
        .restore_now(RestoreNowParams {
            target_id: h.target_id.clone(),
            backup_id,
            destination_id: None,
            use_local_storage: true,
            confirmation: "RESTORE".into(),
            encryption_password: None,
        })
        .await
        .unwrap();

    assert_eq!(restore.status, RunStatus::Success);
    assert_eq!(note_count(&h.db_path), 2);
}

#[tokio::test]
async fn test_restore_refused_without_exact_confirmation() {
    let h = harness();

    let err = h
        .engine
        .restore_now(RestoreNowParams {
            target_id: h.target_id.clone(),
            backup_id: "anything".into(),
            destination_id: None,
            use_local_storage: true,
            confirmation: "restore".into(),
            encryption_password: None,
        })
        .await
        .unwrap_err();
    assert_eq!(err.kind().code(), "CONFIRMATION_REQUIRED");

    // No run was recorded for the refused restore
    let page = h.engine.store().list_runs(&Default::default()).unwrap();
    assert!(page.runs.is_empty());
}

#[tokio::test]
async fn test_encrypted_backup_with_retention() {
    let h = harness();
    let (target, secrets) = {
        let target = h.engine.store().get_target(&h.target_id).unwrap().unwrap();
        (target, Secrets::default())
    };

    // Pre-age three artifacts so retention has history to chew on
    let folder = h.local_root.join("app");
    std::fs::create_dir_all(&folder).unwrap();
    for day in ["20250225", "20250226", "20250227"] {
        std::fs::write(
            folder.join(format!("backup_app_{}_033000.db.gz.enc", day)),
            b"old artifact",
        )
        .unwrap();
    }

    let request = BackupRequest {
        target,
        target_secrets: secrets,
        destinations: vec![h.engine.local_destination()],
        retention_rule: Some(RetentionRule::MaxCount(3)),
        encrypt_password: Some("hunter2".into()),
        notifications: Default::default(),
        trigger: Trigger::Scheduled,
        schedule: None,
    };
    let cancel = CancellationToken::new();
    let run = backup::run(&h.engine, request, &cancel).await.unwrap();
    assert_eq!(run.status, RunStatus::Success);

    // Oldest artifact pruned; the fresh encrypted artifact is present
    let names = local_artifacts(&h.local_root);
    assert_eq!(names.len(), 3, "retention keeps the newest 3: {:?}", names);
    assert!(!names
        .iter()
        .any(|n| n == "backup_app_20250225_033000.db.gz.enc"));
    assert!(names.iter().any(|n| n.ends_with(".db.gz.enc")
        && n != "backup_app_20250226_033000.db.gz.enc"
        && n != "backup_app_20250227_033000.db.gz.enc"));

    let retention = &run.detail.retention[0];
    assert_eq!(retention.deleted, vec!["backup_app_20250225_033000.db.gz.enc"]);
    assert!(retention.error.is_none());
}

#[tokio::test]
async fn test_encrypted_restore_needs_the_password() {
    let h = harness();
    let target = h.engine.store().get_target(&h.target_id).unwrap().unwrap();

    let request = BackupRequest {
        target,
        target_secrets: Secrets::default(),
        destinations: vec![h.engine.local_destination()],
        retention_rule: None,
        encrypt_password: Some("hunter2".into()),
        notifications: Default::default(),
        trigger: Trigger::Manual,
        schedule: None,
    };
    let cancel = CancellationToken::new();
    let run = backup::run(&h.engine, request, &cancel).await.unwrap();
    assert_eq!(run.status, RunStatus::Success);
    let backup_id = run.detail.destinations[0].backup_id.clone().unwrap();

    // Missing password is refused up front, before a run is recorded
    let err = h
        .engine
        .restore_now(RestoreNowParams {
            target_id: h.target_id.clone(),
            backup_id: backup_id.clone(),
            destination_id: None,
            use_local_storage: true,
            confirmation: "RESTORE".into(),
            encryption_password: None,
        })
        .await
        .unwrap_err();
    assert_eq!(err.kind().code(), "ENCRYPTION_PASSWORD_REQUIRED");

    // A wrong password fails the run with a decrypt error
    let failed = h
        .engine
        .restore_now(RestoreNowParams {
            target_id: h.target_id.clone(),
            backup_id: backup_id.clone(),
            destination_id: None,
            use_local_storage: true,
            confirmation: "RESTORE".into(),
            encryption_password: Some("wrong".into()),
        })
        .await
        .unwrap();
    assert_eq!(failed.status, RunStatus::Failure);
    assert!(failed.error_message.unwrap().contains("Decryption failed"));

    // The right password restores
    let restored = h
        .engine
        .restore_now(RestoreNowParams {
            target_id: h.target_id,
            backup_id,
            destination_id: None,
            use_local_storage: true,
            confirmation: "RESTORE".into(),
            encryption_password: Some("hunter2".into()),
        })
        .await
        .unwrap();
    assert_eq!(restored.status, RunStatus::Success);
}

#[tokio::test]
async fn test_partial_success_across_destinations() {
    let h = harness();

    // An SFTP destination with no credentials fails to open its adapter
    let broken = h
        .engine
        .store()
        .create_destination(DestinationInput {
            name: "sftp-A".into(),
            destination_type: DestinationType::Sftp,
            config: json!({"host": "backups.internal", "user": "backup", "root_path": "/srv"}),
            secrets: None,
            is_active: true,
        })
        .unwrap();

    let run = h
        .engine
        .backup_now(BackupNowParams {
            target_id: h.target_id.clone(),
            destination_ids: Some(vec!["__local__".into(), broken.id.clone()]),
            use_local_storage: false,
        })
        .await
        .unwrap();

    assert_eq!(run.status, RunStatus::PartialSuccess);
    assert_eq!(run.detail.destinations.len(), 2);

    let local = &run.detail.destinations[0];
    let sftp = &run.detail.destinations[1];
    assert_eq!(local.destination_id, "__local__");
    assert!(matches!(
        local.status,
        dbvault_core::models::OutcomeStatus::Success
    ));
    assert!(matches!(
        sftp.status,
        dbvault_core::models::OutcomeStatus::Failure
    ));
    assert!(sftp.error.is_some());

    // The artifact still landed locally
    assert_eq!(local_artifacts(&h.local_root).len(), 1);
}

#[tokio::test]
async fn test_listing_and_deleting_backups() {
    let h = harness();

    h.engine
        .backup_now(BackupNowParams {
            target_id: h.target_id.clone(),
            destination_ids: None,
            use_local_storage: true,
        })
        .await
        .unwrap();

    let (page, total) = h
        .engine
        .list_backups("__local__", Some(&h.target_id), true, 50, 0)
        .await
        .unwrap();
    assert_eq!(total, Some(1));
    assert_eq!(page.len(), 1);

    h.engine
        .delete_backup("__local__", &page[0].id, &page[0].name)
        .await
        .unwrap();
    let (page, _) = h
        .engine
        .list_backups("__local__", None, false, 50, 0)
        .await
        .unwrap();
    assert!(page.is_empty());
}

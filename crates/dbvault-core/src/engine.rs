//! The engine: process-wide state and the operations the API surface calls
//!
//! One `Engine` value is constructed at startup and handed to the server by
//! dependency injection. It owns the repository store, the notifier, the
//! per-schedule locks, the bounded worker pool, and the destination adapter
//! cache. Nothing else in the process is global.

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tokio::sync::{Notify, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::dest::{self, StorageAdapter};
use crate::dump;
use crate::error::{Error, Result};
use crate::models::{
    ArtifactInfo, DbConfig, Destination, Id, Run, Schedule, Secrets, Target, Trigger,
    LOCAL_DESTINATION_ID,
};
use crate::notify::Notifier;
use crate::pipeline::{self, backup::BackupRequest, filename, restore::RestoreRequest};
use crate::sched;
use crate::store::{DestinationInput, Store, TargetInput};

/// Default bounded worker-pool width.
pub const DEFAULT_WORKERS: usize = 4;

/// Hard deadline for manual runs.
const MANUAL_DEADLINE: Duration = Duration::from_secs(3600);

/// Idle destination clients are dropped after this long.
const CLIENT_IDLE_EVICTION: Duration = Duration::from_secs(600);

/// Retry hint returned with `BUSY`.
const BUSY_RETRY_AFTER_SECS: u64 = 30;

#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Root of the built-in `__local__` destination.
    pub local_root: PathBuf,
    /// Concurrent run budget across all schedules.
    pub workers: usize,
}

impl EngineConfig {
    pub fn from_env() -> Self {
        let local_root = std::env::var("DBVAULT_LOCAL_ROOT")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("./backups"));
        let workers = std::env::var("DBVAULT_WORKERS")
            .ok()
            .and_then(|w| w.parse().ok())
            .filter(|w| *w > 0)
            .unwrap_or(DEFAULT_WORKERS);
        Self {
            local_root,
            workers,
        }
    }
}

struct CachedAdapter {
    adapter: Arc<dyn StorageAdapter>,
    last_used: Instant,
}

/// Parameters for `POST /automation/backup-now`.
#[derive(Debug, Clone)]
pub struct BackupNowParams {
    pub target_id: Id,
    pub destination_ids: Option<Vec<Id>>,
    pub use_local_storage: bool,
}

/// Parameters for `POST /automation/restore-now`.
#[derive(Debug, Clone)]
pub struct RestoreNowParams {
    pub target_id: Id,
    pub backup_id: String,
    pub destination_id: Option<Id>,
    pub use_local_storage: bool,
    pub confirmation: String,
    pub encryption_password: Option<String>,
}

/// Acknowledgement for an enqueued run-now.
#[derive(Debug, Clone, serde::Serialize)]
pub struct QueuedRun {
    pub schedule_id: Id,
    pub schedule_name: String,
}

pub struct Engine {
    store: Store,
    config: EngineConfig,
    notifier: Notifier,
    clients: Mutex<HashMap<Id, CachedAdapter>>,
    locks: Arc<Mutex<HashSet<Id>>>,
    semaphore: Arc<Semaphore>,
    wake: Notify,
    shutdown: CancellationToken,
}

/// Holds a schedule's run slot; released on drop.
pub struct ScheduleLockGuard {
    locks: Arc<Mutex<HashSet<Id>>>,
    id: Id,
}

impl Drop for ScheduleLockGuard {
    fn drop(&mut self) {
        if let Ok(mut locks) = self.locks.lock() {
            locks.remove(&self.id);
        }
    }
}

impl Engine {
    pub fn new(store: Store, config: EngineConfig, notifier: Notifier) -> Arc<Self> {
        let workers = config.workers.max(1);
        Arc::new(Self {
            store,
            config,
            notifier,
            clients: Mutex::new(HashMap::new()),
            locks: Arc::new(Mutex::new(HashSet::new())),
            semaphore: Arc::new(Semaphore::new(workers)),
            wake: Notify::new(),
            shutdown: CancellationToken::new(),
        })
    }

    /// Crash recovery plus the scheduler decision loop.
    pub fn start(self: &Arc<Self>) {
        sched::recover(self);
        let engine = self.clone();
        tokio::spawn(sched::run_loop(engine));
    }

    /// Stop the scheduler and cancel in-flight runs.
    pub fn shutdown(&self) {
        info!("Engine shutting down");
        self.shutdown.cancel();
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    pub(crate) fn notifier(&self) -> &Notifier {
        &self.notifier
    }

    /// Nudge the decision loop after a schedule mutation.
    pub fn wake_scheduler(&self) {
        self.wake.notify_one();
    }

    pub(crate) fn scheduler_woken(&self) -> tokio::sync::futures::Notified<'_> {
        self.wake.notified()
    }

    pub(crate) fn shutdown_signal(&self) -> tokio_util::sync::WaitForCancellationFuture<'_> {
        self.shutdown.cancelled()
    }

    /// The built-in virtual destination.
    pub fn local_destination(&self) -> Destination {
        Destination::builtin_local(self.config.local_root.clone())
    }

    /// Resolve a destination id, accepting the built-in `__local__`.
    pub fn resolve_destination(&self, id: &str) -> Result<Destination> {
        if id == LOCAL_DESTINATION_ID {
            return Ok(self.local_destination());
        }
        self.store
            .get_destination(id)?
            .ok_or_else(|| Error::NotFound(format!("destination {}", id)))
    }

    /// Backend client for a destination, pooled per destination id with idle
    /// eviction.
    pub(crate) fn adapter_for(&self, destination: &Destination) -> Result<Arc<dyn StorageAdapter>> {
        let mut clients = self
            .clients
            .lock()
            .map_err(|_| Error::Internal("adapter cache poisoned".into()))?;
        let now = Instant::now();
        clients.retain(|_, cached| now.duration_since(cached.last_used) < CLIENT_IDLE_EVICTION);

        if let Some(cached) = clients.get_mut(&destination.id) {
            cached.last_used = now;
            return Ok(cached.adapter.clone());
        }

        let secrets = self.store.open_destination_secrets(&destination.id)?;
        let adapter = dest::open(destination, &secrets)?;
        clients.insert(
            destination.id.clone(),
            CachedAdapter {
                adapter: adapter.clone(),
                last_used: now,
            },
        );
        Ok(adapter)
    }

    /// Drop a cached client (after a destination mutation).
    pub fn invalidate_adapter(&self, destination_id: &str) {
        if let Ok(mut clients) = self.clients.lock() {
            clients.remove(destination_id);
        }
    }

    // ------------------------------------------------------------------
    // Per-schedule serialization
    // ------------------------------------------------------------------

    pub(crate) fn try_lock_schedule(&self, id: &str) -> Option<ScheduleLockGuard> {
        let mut locks = self.locks.lock().ok()?;
        if !locks.insert(id.to_string()) {
            return None;
        }
        Some(ScheduleLockGuard {
            locks: self.locks.clone(),
            id: id.to_string(),
        })
    }

    // ------------------------------------------------------------------
    // Backup execution
    // ------------------------------------------------------------------

    fn load_target(&self, id: &str) -> Result<(Target, Secrets)> {
        let target = self
            .store
            .get_target(id)?
            .ok_or_else(|| Error::NotFound(format!("target {}", id)))?;
        let secrets = self.store.open_target_secrets(id)?;
        Ok((target, secrets))
    }

    fn build_schedule_request(&self, schedule: &Schedule, trigger: Trigger) -> Result<BackupRequest> {
        let (target, target_secrets) = self.load_target(&schedule.target_id)?;
        let destinations = schedule
            .destination_ids
            .iter()
            .map(|id| self.resolve_destination(id))
            .collect::<Result<Vec<_>>>()?;
        let encrypt_password = if schedule.retention.encrypt {
            self.store.open_schedule_encrypt_password(&schedule.id)?
        } else {
            None
        };

        Ok(BackupRequest {
            target,
            target_secrets,
            destinations,
            retention_rule: Some(schedule.retention.rule.clone()),
            encrypt_password,
            notifications: schedule.retention.notifications.clone(),
            trigger,
            schedule: Some((schedule.id.clone(), schedule.name.clone())),
        })
    }

    /// Run `f` with a cancellation token that fires at `deadline` or on
    /// engine shutdown.
    async fn with_deadline<T, F, Fut>(&self, deadline: Duration, f: F) -> T
    where
        F: FnOnce(CancellationToken) -> Fut,
        Fut: std::future::Future<Output = T>,
    {
        let token = self.shutdown.child_token();
        let watchdog = {
            let token = token.clone();
            tokio::spawn(async move {
                tokio::time::sleep(deadline).await;
                token.cancel();
            })
        };
        let out = f(token).await;
        watchdog.abort();
        out
    }

    /// Execute one schedule-driven backup on the worker pool. The lock guard
    /// rides along and releases when the run finishes.
    pub(crate) fn spawn_schedule_run(
        self: Arc<Self>,
        schedule: Schedule,
        trigger: Trigger,
        guard: ScheduleLockGuard,
    ) {
        tokio::spawn(async move {
            let _guard = guard;
            let permit = match self.semaphore.clone().acquire_owned().await {
                Ok(permit) => permit,
                Err(_) => return,
            };
            let _permit = permit;

            let deadline =
                Duration::from_secs((schedule.interval_seconds.max(3600)) as u64);
            let request = match self.build_schedule_request(&schedule, trigger) {
                Ok(request) => request,
                Err(e) => {
                    warn!("Schedule '{}' cannot run: {}", schedule.name, e);
                    return;
                }
            };

            let engine = self.clone();
            let result = self
                .with_deadline(deadline, |cancel| async move {
                    pipeline::backup::run(&engine, request, &cancel).await
                })
                .await;
            if let Err(e) = result {
                warn!("Schedule '{}' run errored: {}", schedule.name, e);
            }
        });
    }

    /// Enqueue a manual run of a schedule. Refuses with `BUSY` while a run
    /// of the same schedule is active.
    pub fn run_schedule_now(self: &Arc<Self>, schedule_id: &str) -> Result<QueuedRun> {
        let schedule = self
            .store
            .get_schedule(schedule_id)?
            .ok_or_else(|| Error::NotFound(format!("schedule {}", schedule_id)))?;

        let guard = self.try_lock_schedule(&schedule.id).ok_or(Error::Busy {
            retry_after_secs: BUSY_RETRY_AFTER_SECS,
        })?;

        let queued = QueuedRun {
            schedule_id: schedule.id.clone(),
            schedule_name: schedule.name.clone(),
        };
        self.clone()
            .spawn_schedule_run(schedule, Trigger::RunNow, guard);
        Ok(queued)
    }

    /// Enqueue manual runs for enabled schedules, up to `max_schedules`.
    /// Schedules with an active run are skipped, not refused.
    pub fn run_enabled_now(self: &Arc<Self>, max_schedules: usize) -> Result<Vec<QueuedRun>> {
        let mut queued = Vec::new();
        for schedule in self.store.list_enabled_schedules()? {
            if queued.len() >= max_schedules {
                break;
            }
            let guard = match self.try_lock_schedule(&schedule.id) {
                Some(guard) => guard,
                None => continue,
            };
            queued.push(QueuedRun {
                schedule_id: schedule.id.clone(),
                schedule_name: schedule.name.clone(),
            });
            self.clone()
                .spawn_schedule_run(schedule, Trigger::RunNow, guard);
        }
        Ok(queued)
    }

    /// One-shot backup outside any schedule. Waits for the result.
    pub async fn backup_now(self: &Arc<Self>, params: BackupNowParams) -> Result<Run> {
        let (target, target_secrets) = self.load_target(&params.target_id)?;

        let destinations = match (&params.destination_ids, params.use_local_storage) {
            (Some(ids), false) if !ids.is_empty() => ids
                .iter()
                .map(|id| self.resolve_destination(id))
                .collect::<Result<Vec<_>>>()?,
            _ => vec![self.local_destination()],
        };

        let request = BackupRequest {
            target,
            target_secrets,
            destinations,
            retention_rule: None,
            encrypt_password: None,
            notifications: Default::default(),
            trigger: Trigger::Manual,
            schedule: None,
        };

        let _permit = self
            .semaphore
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| Error::Internal("worker pool closed".into()))?;
        let engine = self.clone();
        self.with_deadline(MANUAL_DEADLINE, |cancel| async move {
            pipeline::backup::run(&engine, request, &cancel).await
        })
        .await
    }

    /// Gated restore. Waits for the result; the gates run before any run is
    /// recorded.
    pub async fn restore_now(self: &Arc<Self>, params: RestoreNowParams) -> Result<Run> {
        // The cheapest gate first: a wrong confirmation never touches state
        if params.confirmation != pipeline::restore::CONFIRMATION {
            return Err(Error::ConfirmationRequired);
        }

        let (target, target_secrets) = self.load_target(&params.target_id)?;
        let destination = match (&params.destination_id, params.use_local_storage) {
            (Some(id), false) => self.resolve_destination(id)?,
            _ => self.local_destination(),
        };

        let artifact = self
            .locate_artifact(&destination, &target, &params.backup_id)
            .await?;
        let parsed = filename::parse(&artifact.name).map_err(|_| {
            Error::IncompatibleBackup(format!("unrecognized backup filename: {}", artifact.name))
        })?;

        pipeline::restore::check_gates(
            &params.confirmation,
            &parsed,
            &target,
            params.encryption_password.as_deref(),
        )?;

        let request = RestoreRequest {
            target,
            target_secrets,
            destination,
            artifact,
            parsed,
            encryption_password: params.encryption_password,
            trigger: Trigger::Manual,
        };

        let _permit = self
            .semaphore
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| Error::Internal("worker pool closed".into()))?;
        let engine = self.clone();
        self.with_deadline(MANUAL_DEADLINE, |cancel| async move {
            pipeline::restore::run(&engine, request, &cancel).await
        })
        .await
    }

    /// Find an artifact by opaque id, looking in the target's folder first.
    async fn locate_artifact(
        &self,
        destination: &Destination,
        target: &Target,
        backup_id: &str,
    ) -> Result<ArtifactInfo> {
        let adapter = self.adapter_for(destination)?;
        let folder = filename::sanitize_target_name(&target.name);

        let in_folder = adapter.list(Some(&folder), None).await?;
        if let Some(artifact) = in_folder.into_iter().find(|a| a.id == backup_id) {
            return Ok(artifact);
        }
        let everywhere = adapter.list(None, None).await?;
        everywhere
            .into_iter()
            .find(|a| a.id == backup_id)
            .ok_or_else(|| Error::NotFound(format!("backup {}", backup_id)))
    }

    // ------------------------------------------------------------------
    // Artifact browsing (destination endpoints)
    // ------------------------------------------------------------------

    /// Paginated artifact listing for a destination, optionally filtered to
    /// one target's folder.
    pub async fn list_backups(
        &self,
        destination_id: &str,
        target_id: Option<&str>,
        include_total: bool,
        limit: usize,
        offset: usize,
    ) -> Result<(Vec<ArtifactInfo>, Option<usize>)> {
        let destination = self.resolve_destination(destination_id)?;
        let adapter = self.adapter_for(&destination)?;

        let prefix = match target_id {
            Some(id) => {
                let target = self
                    .store
                    .get_target(id)?
                    .ok_or_else(|| Error::NotFound(format!("target {}", id)))?;
                Some(filename::sanitize_target_name(&target.name))
            }
            None => None,
        };

        let all = adapter.list(prefix.as_deref(), None).await?;
        let total = include_total.then_some(all.len());
        let page = all.into_iter().skip(offset).take(limit.max(1)).collect();
        Ok((page, total))
    }

    /// Fetch an artifact into a temp file for download streaming. The
    /// returned directory guard keeps the file alive.
    pub async fn fetch_backup(
        &self,
        destination_id: &str,
        backup_id: &str,
        name: &str,
    ) -> Result<(tempfile::TempDir, PathBuf)> {
        let destination = self.resolve_destination(destination_id)?;
        let adapter = self.adapter_for(&destination)?;

        let dir = tempfile::tempdir()?;
        let path = dir.path().join(name);
        adapter.get(backup_id, name, &path).await?;
        Ok((dir, path))
    }

    /// Delete one artifact from a destination. Encrypted artifacts are
    /// deleted by name without any decryption check.
    pub async fn delete_backup(
        &self,
        destination_id: &str,
        backup_id: &str,
        name: &str,
    ) -> Result<()> {
        let destination = self.resolve_destination(destination_id)?;
        let adapter = self.adapter_for(&destination)?;
        adapter.delete(backup_id, name).await
    }

    // ------------------------------------------------------------------
    // Connection tests (dry runs against unsaved configs)
    // ------------------------------------------------------------------

    pub async fn test_target_connection(&self, input: TargetInput) -> Result<String> {
        let config = DbConfig::parse(input.db_type, input.config)?;
        let target = Target {
            id: String::new(),
            name: input.name,
            db_type: input.db_type,
            config,
            is_active: true,
            created_at: chrono::Utc::now(),
            updated_at: chrono::Utc::now(),
            has_secrets: input.secrets.is_some(),
        };
        dump::test_connection(&target, &input.secrets.unwrap_or_default()).await
    }

    pub async fn test_destination_connection(&self, input: DestinationInput) -> Result<String> {
        let config = crate::models::DestConfig::parse(input.destination_type, input.config)?;
        let destination = Destination {
            id: String::new(),
            name: input.name,
            destination_type: input.destination_type,
            config,
            is_active: true,
            created_at: chrono::Utc::now(),
            updated_at: chrono::Utc::now(),
            has_secrets: input.secrets.is_some(),
        };
        let adapter = dest::open(&destination, &input.secrets.unwrap_or_default())?;
        adapter.test_connection().await
    }
}

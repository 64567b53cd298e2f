//! Run (audit record) operations
//!
//! Runs are append-only in steady state: `record_run_start` inserts a
//! `running` row, `record_run_finish` transitions it to a terminal status
//! exactly once. Unterminated rows left behind by a crash are swept to
//! `failure` on startup.

use chrono::{DateTime, Utc};
use rusqlite::{params, params_from_iter, OptionalExtension};

use super::{fmt_ts, parse_ts, Store};
use crate::error::{Error, Result};
use crate::models::{
    new_id, Id, NotificationOutcome, Operation, Run, RunDetail, RunStatus, Trigger,
};

/// Fields needed to open a run record.
#[derive(Debug, Clone)]
pub struct RunStart {
    pub operation: Operation,
    pub trigger: Trigger,
    pub target_id: Id,
    pub target_name: String,
    pub schedule_id: Option<Id>,
    pub schedule_name: Option<String>,
    pub destination_id: Option<Id>,
    pub destination_name: Option<String>,
}

/// Terminal state written by `record_run_finish`.
#[derive(Debug, Clone, Default)]
pub struct RunFinish {
    pub status: Option<RunStatus>,
    pub detail: RunDetail,
    pub backup_id: Option<String>,
    pub backup_filename: Option<String>,
    pub file_size_mb: Option<f64>,
    pub error_message: Option<String>,
}

/// Query filter for run history.
#[derive(Debug, Clone, Default)]
pub struct RunFilter {
    pub target_id: Option<Id>,
    pub operation: Option<Operation>,
    pub trigger: Option<Trigger>,
    pub since: Option<DateTime<Utc>>,
    pub until: Option<DateTime<Utc>>,
    pub limit: i64,
    pub offset: i64,
    pub include_total: bool,
}

/// One page of run history.
#[derive(Debug, Clone)]
pub struct RunPage {
    pub runs: Vec<Run>,
    pub total: Option<i64>,
}

struct RunRow {
    id: String,
    operation: String,
    trigger: String,
    target_id: String,
    target_name: String,
    schedule_id: Option<String>,
    schedule_name: Option<String>,
    destination_id: Option<String>,
    destination_name: Option<String>,
    backup_id: Option<String>,
    backup_filename: Option<String>,
    file_size_mb: Option<f64>,
    status: String,
    started_at: String,
    finished_at: Option<String>,
    error_message: Option<String>,
    detail: String,
}

const RUN_COLS: &str = "id, operation, \"trigger\", target_id, target_name, schedule_id, \
                        schedule_name, destination_id, destination_name, backup_id, \
                        backup_filename, file_size_mb, status, started_at, finished_at, \
                        error_message, detail";

fn read_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<RunRow> {
    Ok(RunRow {
        id: row.get(0)?,
        operation: row.get(1)?,
        trigger: row.get(2)?,
        target_id: row.get(3)?,
        target_name: row.get(4)?,
        schedule_id: row.get(5)?,
        schedule_name: row.get(6)?,
        destination_id: row.get(7)?,
        destination_name: row.get(8)?,
        backup_id: row.get(9)?,
        backup_filename: row.get(10)?,
        file_size_mb: row.get(11)?,
        status: row.get(12)?,
        started_at: row.get(13)?,
        finished_at: row.get(14)?,
        error_message: row.get(15)?,
        detail: row.get(16)?,
    })
}

impl RunRow {
    fn into_run(self) -> Result<Run> {
        Ok(Run {
            operation: self.operation.parse()?,
            trigger: self.trigger.parse()?,
            status: self.status.parse()?,
            detail: serde_json::from_str(&self.detail).unwrap_or_default(),
            id: self.id,
            target_id: self.target_id,
            target_name: self.target_name,
            schedule_id: self.schedule_id,
            schedule_name: self.schedule_name,
            destination_id: self.destination_id,
            destination_name: self.destination_name,
            backup_id: self.backup_id,
            backup_filename: self.backup_filename,
            file_size_mb: self.file_size_mb,
            started_at: parse_ts(&self.started_at),
            finished_at: self.finished_at.as_deref().map(parse_ts),
            error_message: self.error_message,
        })
    }
}

impl Store {
    /// Open a run record with `status=running`. Returns the run id.
    pub fn record_run_start(&self, start: RunStart) -> Result<Id> {
        let id = new_id();
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO runs (id, operation, \"trigger\", target_id, target_name, schedule_id,
                               schedule_name, destination_id, destination_name, status,
                               started_at, detail)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, '{}')",
            params![
                id,
                start.operation.as_str(),
                start.trigger.as_str(),
                start.target_id,
                start.target_name,
                start.schedule_id,
                start.schedule_name,
                start.destination_id,
                start.destination_name,
                RunStatus::Running.as_str(),
                fmt_ts(Utc::now()),
            ],
        )?;
        Ok(id)
    }

    /// Transition a run to a terminal status. A second finish on the same run
    /// is a conflict; the first terminal state wins.
    pub fn record_run_finish(&self, id: &str, finish: RunFinish) -> Result<Run> {
        let status = finish
            .status
            .ok_or_else(|| Error::Internal("run finish without a status".into()))?;
        if !status.is_terminal() {
            return Err(Error::Internal(format!(
                "run finish status must be terminal, got {}",
                status.as_str()
            )));
        }

        let conn = self.conn()?;
        let updated = conn.execute(
            "UPDATE runs
             SET status = ?, finished_at = ?, detail = ?, backup_id = ?, backup_filename = ?,
                 file_size_mb = ?, error_message = ?
             WHERE id = ? AND status = 'running'",
            params![
                status.as_str(),
                fmt_ts(Utc::now()),
                serde_json::to_string(&finish.detail)?,
                finish.backup_id,
                finish.backup_filename,
                finish.file_size_mb,
                finish.error_message,
                id,
            ],
        )?;
        if updated == 0 {
            // Either the run does not exist or it is already terminal
            return match self.get_run(id)? {
                Some(run) => Err(Error::Conflict(format!(
                    "run {} already finalized as {}",
                    id,
                    run.status.as_str()
                ))),
                None => Err(Error::NotFound(format!("run {}", id))),
            };
        }

        self.get_run(id)?
            .ok_or_else(|| Error::NotFound(format!("run {}", id)))
    }

    /// Merge notification outcomes into a run's detail. Runs after finalize,
    /// so it touches only the detail column, never the status.
    pub fn append_run_notifications(
        &self,
        id: &str,
        outcomes: &[NotificationOutcome],
    ) -> Result<()> {
        if outcomes.is_empty() {
            return Ok(());
        }
        let run = self
            .get_run(id)?
            .ok_or_else(|| Error::NotFound(format!("run {}", id)))?;
        let mut detail = run.detail;
        detail.notifications.extend(outcomes.iter().cloned());

        let conn = self.conn()?;
        conn.execute(
            "UPDATE runs SET detail = ? WHERE id = ?",
            params![serde_json::to_string(&detail)?, id],
        )?;
        Ok(())
    }

    /// Get a run by id
    pub fn get_run(&self, id: &str) -> Result<Option<Run>> {
        let conn = self.conn()?;
        let row = conn
            .query_row(
                &format!("SELECT {} FROM runs WHERE id = ?", RUN_COLS),
                params![id],
                read_row,
            )
            .optional()?;
        row.map(RunRow::into_run).transpose()
    }

    /// Paginated run history, newest first.
    pub fn list_runs(&self, filter: &RunFilter) -> Result<RunPage> {
        let mut clauses: Vec<&str> = Vec::new();
        let mut args: Vec<String> = Vec::new();

        if let Some(target_id) = &filter.target_id {
            clauses.push("target_id = ?");
            args.push(target_id.clone());
        }
        if let Some(operation) = filter.operation {
            clauses.push("operation = ?");
            args.push(operation.as_str().to_string());
        }
        if let Some(trigger) = filter.trigger {
            clauses.push("\"trigger\" = ?");
            args.push(trigger.as_str().to_string());
        }
        if let Some(since) = filter.since {
            clauses.push("started_at >= ?");
            args.push(fmt_ts(since));
        }
        if let Some(until) = filter.until {
            clauses.push("started_at <= ?");
            args.push(fmt_ts(until));
        }

        let where_sql = if clauses.is_empty() {
            String::new()
        } else {
            format!(" WHERE {}", clauses.join(" AND "))
        };

        let limit = if filter.limit <= 0 { 50 } else { filter.limit };
        let offset = filter.offset.max(0);

        let conn = self.conn()?;
        let total = if filter.include_total {
            let count: i64 = conn.query_row(
                &format!("SELECT COUNT(*) FROM runs{}", where_sql),
                params_from_iter(args.iter()),
                |row| row.get(0),
            )?;
            Some(count)
        } else {
            None
        };

        let sql = format!(
            "SELECT {} FROM runs{} ORDER BY started_at DESC, id DESC LIMIT {} OFFSET {}",
            RUN_COLS, where_sql, limit, offset
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt
            .query_map(params_from_iter(args.iter()), read_row)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        let runs = rows
            .into_iter()
            .map(RunRow::into_run)
            .collect::<Result<Vec<_>>>()?;

        Ok(RunPage { runs, total })
    }

    /// Finalize stale `running` runs left behind by a crash.
    ///
    /// Returns the ids of swept runs.
    pub fn sweep_abandoned_runs(&self, older_than: DateTime<Utc>) -> Result<Vec<Id>> {
        let conn = self.conn()?;
        let mut stmt =
            conn.prepare("SELECT id FROM runs WHERE status = 'running' AND started_at < ?")?;
        let ids = stmt
            .query_map(params![fmt_ts(older_than)], |row| row.get::<_, String>(0))?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        for id in &ids {
            conn.execute(
                "UPDATE runs SET status = ?, finished_at = ?, error_message = ?
                 WHERE id = ? AND status = 'running'",
                params![
                    RunStatus::Failure.as_str(),
                    fmt_ts(Utc::now()),
                    "abandoned",
                    id
                ],
            )?;
        }
        Ok(ids)
    }
}

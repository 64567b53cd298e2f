//! Schedule operations

use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension};
use serde::Deserialize;

use super::{fmt_ts, parse_ts, Store};
use crate::error::{Error, Result};
use crate::models::{
    new_id, Id, RetentionConfig, Schedule, ANCHOR_MIN_INTERVAL_SECONDS, LOCAL_DESTINATION_ID,
    MIN_INTERVAL_SECONDS,
};
use crate::sched::compute_next_run;

/// Create/update payload for a schedule. The nested retention object may
/// carry `encrypt_password`, which is sealed here and never stored plain.
#[derive(Debug, Clone, Deserialize)]
pub struct ScheduleInput {
    pub name: String,
    pub target_id: Id,
    pub destination_ids: Vec<Id>,
    pub interval_seconds: i64,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    pub retention: RetentionConfig,
}

fn default_enabled() -> bool {
    true
}

struct ScheduleRow {
    id: String,
    name: String,
    target_id: String,
    destination_ids: String,
    interval_seconds: i64,
    enabled: bool,
    retention: String,
    next_run_at: Option<String>,
    last_run_at: Option<String>,
    created_at: String,
    updated_at: String,
}

const SCHEDULE_COLS: &str = "id, name, target_id, destination_ids, interval_seconds, enabled, \
                             retention, next_run_at, last_run_at, created_at, updated_at";

fn read_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<ScheduleRow> {
    Ok(ScheduleRow {
        id: row.get(0)?,
        name: row.get(1)?,
        target_id: row.get(2)?,
        destination_ids: row.get(3)?,
        interval_seconds: row.get(4)?,
        enabled: row.get::<_, i64>(5)? != 0,
        retention: row.get(6)?,
        next_run_at: row.get(7)?,
        last_run_at: row.get(8)?,
        created_at: row.get(9)?,
        updated_at: row.get(10)?,
    })
}

impl ScheduleRow {
    fn into_schedule(self) -> Result<Schedule> {
        Ok(Schedule {
            destination_ids: serde_json::from_str(&self.destination_ids)?,
            retention: serde_json::from_str(&self.retention)?,
            id: self.id,
            name: self.name,
            target_id: self.target_id,
            interval_seconds: self.interval_seconds,
            enabled: self.enabled,
            next_run_at: self.next_run_at.as_deref().map(parse_ts),
            last_run_at: self.last_run_at.as_deref().map(parse_ts),
            created_at: parse_ts(&self.created_at),
            updated_at: parse_ts(&self.updated_at),
        })
    }
}

impl Store {
    fn validate_schedule_input(&self, input: &ScheduleInput) -> Result<()> {
        if input.name.trim().is_empty() {
            return Err(Error::Validation("schedule name must not be empty".into()));
        }
        if input.interval_seconds < MIN_INTERVAL_SECONDS {
            return Err(Error::Validation(format!(
                "interval_seconds must be at least {}",
                MIN_INTERVAL_SECONDS
            )));
        }
        if input.retention.run_at_time.is_some()
            && input.interval_seconds < ANCHOR_MIN_INTERVAL_SECONDS
        {
            return Err(Error::Validation(format!(
                "run_at_time requires interval_seconds >= {}",
                ANCHOR_MIN_INTERVAL_SECONDS
            )));
        }
        if input.destination_ids.is_empty() {
            return Err(Error::Validation(
                "a schedule needs at least one destination".into(),
            ));
        }
        if self.get_target(&input.target_id)?.is_none() {
            return Err(Error::Validation(format!(
                "target {} does not exist",
                input.target_id
            )));
        }
        for dest_id in &input.destination_ids {
            if dest_id != LOCAL_DESTINATION_ID && self.get_destination(dest_id)?.is_none() {
                return Err(Error::Validation(format!(
                    "destination {} does not exist",
                    dest_id
                )));
            }
        }
        Ok(())
    }

    /// Retention JSON column value: the config minus the plain password.
    fn retention_json(retention: &RetentionConfig) -> Result<String> {
        // encrypt_password is skip_serializing, so this never persists it
        Ok(serde_json::to_string(retention)?)
    }

    /// Create a schedule. `next_run_at` is computed from now.
    pub fn create_schedule(&self, input: ScheduleInput) -> Result<Schedule> {
        self.validate_schedule_input(&input)?;

        let sealed_password = match input.retention.encrypt_password.as_deref() {
            Some(p) if !p.is_empty() => Some(self.sealer().seal_str(p)?),
            _ => None,
        };
        if input.retention.encrypt && sealed_password.is_none() {
            return Err(Error::Validation(
                "encrypt=true requires encrypt_password at create time".into(),
            ));
        }

        let id = new_id();
        let now = Utc::now();
        let next = compute_next_run(
            input.interval_seconds,
            input.retention.run_at_time,
            now,
            now,
        );

        let conn = self.conn()?;
        let inserted = conn.execute(
            "INSERT INTO schedules (id, name, target_id, destination_ids, interval_seconds, enabled,
                                    retention, encrypt_password, next_run_at, last_run_at, created_at, updated_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, NULL, ?, ?)
             ON CONFLICT(name) DO NOTHING",
            params![
                id,
                input.name,
                input.target_id,
                serde_json::to_string(&input.destination_ids)?,
                input.interval_seconds,
                input.enabled as i64,
                Self::retention_json(&input.retention)?,
                sealed_password,
                fmt_ts(next),
                fmt_ts(now),
                fmt_ts(now),
            ],
        )?;
        if inserted == 0 {
            return Err(Error::Conflict(format!(
                "a schedule named '{}' already exists",
                input.name
            )));
        }

        self.get_schedule(&id)?
            .ok_or_else(|| Error::Internal("schedule vanished after insert".into()))
    }

    /// Get a schedule by id
    pub fn get_schedule(&self, id: &str) -> Result<Option<Schedule>> {
        let conn = self.conn()?;
        let row = conn
            .query_row(
                &format!("SELECT {} FROM schedules WHERE id = ?", SCHEDULE_COLS),
                params![id],
                read_row,
            )
            .optional()?;
        row.map(ScheduleRow::into_schedule).transpose()
    }

    /// List all schedules, alphabetically
    pub fn list_schedules(&self) -> Result<Vec<Schedule>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM schedules ORDER BY name",
            SCHEDULE_COLS
        ))?;
        let rows = stmt
            .query_map([], read_row)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        rows.into_iter().map(ScheduleRow::into_schedule).collect()
    }

    /// List enabled schedules only (the scheduler's working set).
    pub fn list_enabled_schedules(&self) -> Result<Vec<Schedule>> {
        Ok(self
            .list_schedules()?
            .into_iter()
            .filter(|s| s.enabled)
            .collect())
    }

    /// Update a schedule. A provided `encrypt_password` is resealed; an
    /// absent one keeps the stored password.
    pub fn update_schedule(&self, id: &str, input: ScheduleInput) -> Result<Schedule> {
        let existing = self
            .get_schedule(id)?
            .ok_or_else(|| Error::NotFound(format!("schedule {}", id)))?;
        self.validate_schedule_input(&input)?;

        let conn = self.conn()?;
        let sealed_password = match input.retention.encrypt_password.as_deref() {
            Some(p) if !p.is_empty() => Some(self.sealer().seal_str(p)?),
            _ => conn.query_row(
                "SELECT encrypt_password FROM schedules WHERE id = ?",
                params![id],
                |row| row.get::<_, Option<String>>(0),
            )?,
        };
        if input.retention.encrypt && sealed_password.is_none() {
            return Err(Error::Validation(
                "encrypt=true requires an encryption password".into(),
            ));
        }

        // Re-anchor the next run when the recurrence changed
        let now = Utc::now();
        let next = if input.interval_seconds != existing.interval_seconds
            || input.retention.run_at_time != existing.retention.run_at_time
        {
            compute_next_run(
                input.interval_seconds,
                input.retention.run_at_time,
                existing.last_run_at.unwrap_or(existing.created_at),
                now,
            )
        } else {
            existing.next_run_at.unwrap_or_else(|| {
                compute_next_run(
                    input.interval_seconds,
                    input.retention.run_at_time,
                    existing.last_run_at.unwrap_or(existing.created_at),
                    now,
                )
            })
        };

        let updated = conn.execute(
            "UPDATE schedules
             SET name = ?, target_id = ?, destination_ids = ?, interval_seconds = ?, enabled = ?,
                 retention = ?, encrypt_password = ?, next_run_at = ?, updated_at = ?
             WHERE id = ?",
            params![
                input.name,
                input.target_id,
                serde_json::to_string(&input.destination_ids)?,
                input.interval_seconds,
                input.enabled as i64,
                Self::retention_json(&input.retention)?,
                sealed_password,
                fmt_ts(next),
                fmt_ts(now),
                id,
            ],
        );
        if let Err(rusqlite::Error::SqliteFailure(e, _)) = &updated {
            if e.code == rusqlite::ErrorCode::ConstraintViolation {
                return Err(Error::Conflict(format!(
                    "a schedule named '{}' already exists",
                    input.name
                )));
            }
        }
        updated?;

        self.get_schedule(id)?
            .ok_or_else(|| Error::NotFound(format!("schedule {}", id)))
    }

    /// Delete a schedule
    pub fn delete_schedule(&self, id: &str) -> Result<()> {
        let conn = self.conn()?;
        let deleted = conn.execute("DELETE FROM schedules WHERE id = ?", params![id])?;
        if deleted == 0 {
            return Err(Error::NotFound(format!("schedule {}", id)));
        }
        Ok(())
    }

    /// Record a dispatched run: advance `last_run_at` and `next_run_at`.
    pub fn mark_schedule_dispatched(
        &self,
        id: &str,
        last_run_at: DateTime<Utc>,
        next_run_at: DateTime<Utc>,
    ) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            "UPDATE schedules SET last_run_at = ?, next_run_at = ?, updated_at = ? WHERE id = ?",
            params![
                fmt_ts(last_run_at),
                fmt_ts(next_run_at),
                fmt_ts(Utc::now()),
                id
            ],
        )?;
        Ok(())
    }

    /// Overwrite `next_run_at` (startup recomputation).
    pub fn set_schedule_next_run(&self, id: &str, next_run_at: DateTime<Utc>) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            "UPDATE schedules SET next_run_at = ? WHERE id = ?",
            params![fmt_ts(next_run_at), id],
        )?;
        Ok(())
    }

    /// Open the sealed encryption password for a schedule's backups.
    pub fn open_schedule_encrypt_password(&self, id: &str) -> Result<Option<String>> {
        let conn = self.conn()?;
        let sealed: Option<Option<String>> = conn
            .query_row(
                "SELECT encrypt_password FROM schedules WHERE id = ?",
                params![id],
                |row| row.get(0),
            )
            .optional()?;
        match sealed {
            None => Err(Error::NotFound(format!("schedule {}", id))),
            Some(None) => Ok(None),
            Some(Some(blob)) => Ok(Some(self.sealer().open_str(&blob)?)),
        }
    }
}

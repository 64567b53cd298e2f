//! Target operations

use chrono::Utc;
use rusqlite::{params, OptionalExtension};
use serde::Deserialize;

use super::{fmt_ts, parse_ts, Store};
use crate::error::{Error, Result};
use crate::models::{new_id, DbConfig, DbType, Secrets, Target};

/// Create/update payload for a target. `config` is validated against
/// `db_type` before anything is written.
#[derive(Debug, Clone, Deserialize)]
pub struct TargetInput {
    pub name: String,
    pub db_type: DbType,
    #[serde(default)]
    pub config: serde_json::Value,
    #[serde(default)]
    pub secrets: Option<Secrets>,
    #[serde(default = "default_active")]
    pub is_active: bool,
}

fn default_active() -> bool {
    true
}

/// Raw row image; typed into [`Target`] outside the rusqlite closure so
/// config parsing can use the crate error type.
struct TargetRow {
    id: String,
    name: String,
    db_type: String,
    config: String,
    has_secrets: bool,
    is_active: bool,
    created_at: String,
    updated_at: String,
}

const TARGET_COLS: &str = "id, name, db_type, config, secrets, is_active, created_at, updated_at";

fn read_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<TargetRow> {
    Ok(TargetRow {
        id: row.get(0)?,
        name: row.get(1)?,
        db_type: row.get(2)?,
        config: row.get(3)?,
        has_secrets: row.get::<_, Option<String>>(4)?.is_some(),
        is_active: row.get::<_, i64>(5)? != 0,
        created_at: row.get(6)?,
        updated_at: row.get(7)?,
    })
}

impl TargetRow {
    fn into_target(self) -> Result<Target> {
        let db_type: DbType = self.db_type.parse()?;
        Ok(Target {
            config: DbConfig::from_stored(db_type, &self.config)?,
            id: self.id,
            name: self.name,
            db_type,
            is_active: self.is_active,
            created_at: parse_ts(&self.created_at),
            updated_at: parse_ts(&self.updated_at),
            has_secrets: self.has_secrets,
        })
    }
}

impl Store {
    /// Register a new target. Fails with `CONFLICT` on a duplicate name.
    pub fn create_target(&self, input: TargetInput) -> Result<Target> {
        if input.name.trim().is_empty() {
            return Err(Error::Validation("target name must not be empty".into()));
        }
        let config = DbConfig::parse(input.db_type, input.config)?;

        let sealed = match &input.secrets {
            Some(s) if !s.is_empty() => Some(self.sealer().seal(s)?),
            _ => None,
        };

        let id = new_id();
        let now = fmt_ts(Utc::now());
        let conn = self.conn()?;
        let inserted = conn.execute(
            "INSERT INTO targets (id, name, db_type, config, secrets, is_active, created_at, updated_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT(name) DO NOTHING",
            params![
                id,
                input.name,
                input.db_type.as_str(),
                serde_json::to_string(&config)?,
                sealed,
                input.is_active as i64,
                now,
                now,
            ],
        )?;
        if inserted == 0 {
            return Err(Error::Conflict(format!(
                "a target named '{}' already exists",
                input.name
            )));
        }

        self.get_target(&id)?
            .ok_or_else(|| Error::Internal("target vanished after insert".into()))
    }

    /// Get a target by id
    pub fn get_target(&self, id: &str) -> Result<Option<Target>> {
        let conn = self.conn()?;
        let row = conn
            .query_row(
                &format!("SELECT {} FROM targets WHERE id = ?", TARGET_COLS),
                params![id],
                read_row,
            )
            .optional()?;
        row.map(TargetRow::into_target).transpose()
    }

    /// List all targets, alphabetically
    pub fn list_targets(&self) -> Result<Vec<Target>> {
        let conn = self.conn()?;
        let mut stmt =
            conn.prepare(&format!("SELECT {} FROM targets ORDER BY name", TARGET_COLS))?;
        let rows = stmt
            .query_map([], read_row)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        rows.into_iter().map(TargetRow::into_target).collect()
    }

    /// Update a target. Secrets are replaced when provided, cleared when an
    /// explicit empty object is sent, and kept otherwise.
    pub fn update_target(&self, id: &str, input: TargetInput) -> Result<Target> {
        if self.get_target(id)?.is_none() {
            return Err(Error::NotFound(format!("target {}", id)));
        }
        let config = DbConfig::parse(input.db_type, input.config)?;

        let conn = self.conn()?;
        let sealed = match &input.secrets {
            Some(s) if !s.is_empty() => Some(self.sealer().seal(s)?),
            Some(_) => None,
            None => conn.query_row(
                "SELECT secrets FROM targets WHERE id = ?",
                params![id],
                |row| row.get::<_, Option<String>>(0),
            )?,
        };

        let updated = conn.execute(
            "UPDATE targets
             SET name = ?, db_type = ?, config = ?, secrets = ?, is_active = ?, updated_at = ?
             WHERE id = ?",
            params![
                input.name,
                input.db_type.as_str(),
                serde_json::to_string(&config)?,
                sealed,
                input.is_active as i64,
                fmt_ts(Utc::now()),
                id,
            ],
        );
        if let Err(rusqlite::Error::SqliteFailure(e, _)) = &updated {
            if e.code == rusqlite::ErrorCode::ConstraintViolation {
                return Err(Error::Conflict(format!(
                    "a target named '{}' already exists",
                    input.name
                )));
            }
        }
        updated?;

        self.get_target(id)?
            .ok_or_else(|| Error::NotFound(format!("target {}", id)))
    }

    /// Delete a target. Refused while any schedule references it.
    pub fn delete_target(&self, id: &str) -> Result<()> {
        let conn = self.conn()?;
        let referencing: Option<String> = conn
            .query_row(
                "SELECT name FROM schedules WHERE target_id = ? LIMIT 1",
                params![id],
                |row| row.get(0),
            )
            .optional()?;
        if let Some(schedule) = referencing {
            return Err(Error::InUse {
                entity: format!("target {}", id),
                schedule,
            });
        }

        let deleted = conn.execute("DELETE FROM targets WHERE id = ?", params![id])?;
        if deleted == 0 {
            return Err(Error::NotFound(format!("target {}", id)));
        }
        Ok(())
    }

    /// Open a target's sealed secrets for an adapter call.
    pub fn open_target_secrets(&self, id: &str) -> Result<Secrets> {
        let conn = self.conn()?;
        let sealed: Option<Option<String>> = conn
            .query_row(
                "SELECT secrets FROM targets WHERE id = ?",
                params![id],
                |row| row.get(0),
            )
            .optional()?;
        match sealed {
            None => Err(Error::NotFound(format!("target {}", id))),
            Some(None) => Ok(Secrets::default()),
            Some(Some(blob)) => self.sealer().open(&blob),
        }
    }
}

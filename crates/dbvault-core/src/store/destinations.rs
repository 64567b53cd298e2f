//! Destination operations

use chrono::Utc;
use rusqlite::{params, OptionalExtension};
use serde::Deserialize;

use super::{fmt_ts, parse_ts, Store};
use crate::error::{Error, Result};
use crate::models::{
    new_id, DestConfig, Destination, DestinationType, Secrets, LOCAL_DESTINATION_ID,
};

/// Create/update payload for a destination.
#[derive(Debug, Clone, Deserialize)]
pub struct DestinationInput {
    pub name: String,
    pub destination_type: DestinationType,
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

struct DestinationRow {
    id: String,
    name: String,
    destination_type: String,
    config: String,
    has_secrets: bool,
    is_active: bool,
    created_at: String,
    updated_at: String,
}

const DEST_COLS: &str =
    "id, name, destination_type, config, secrets, is_active, created_at, updated_at";

fn read_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<DestinationRow> {
    Ok(DestinationRow {
        id: row.get(0)?,
        name: row.get(1)?,
        destination_type: row.get(2)?,
        config: row.get(3)?,
        has_secrets: row.get::<_, Option<String>>(4)?.is_some(),
        is_active: row.get::<_, i64>(5)? != 0,
        created_at: row.get(6)?,
        updated_at: row.get(7)?,
    })
}

impl DestinationRow {
    fn into_destination(self) -> Result<Destination> {
        let destination_type: DestinationType = self.destination_type.parse()?;
        Ok(Destination {
            config: DestConfig::from_stored(destination_type, &self.config)?,
            id: self.id,
            name: self.name,
            destination_type,
            is_active: self.is_active,
            created_at: parse_ts(&self.created_at),
            updated_at: parse_ts(&self.updated_at),
            has_secrets: self.has_secrets,
        })
    }
}

impl Store {
    /// Register a new destination. Fails with `CONFLICT` on a duplicate name.
    pub fn create_destination(&self, input: DestinationInput) -> Result<Destination> {
        if input.name.trim().is_empty() {
            return Err(Error::Validation(
                "destination name must not be empty".into(),
            ));
        }
        let config = DestConfig::parse(input.destination_type, input.config)?;

        let sealed = match &input.secrets {
            Some(s) if !s.is_empty() => Some(self.sealer().seal(s)?),
            _ => None,
        };

        let id = new_id();
        let now = fmt_ts(Utc::now());
        let conn = self.conn()?;
        let inserted = conn.execute(
            "INSERT INTO destinations (id, name, destination_type, config, secrets, is_active, created_at, updated_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT(name) DO NOTHING",
            params![
                id,
                input.name,
                input.destination_type.as_str(),
                serde_json::to_string(&config)?,
                sealed,
                input.is_active as i64,
                now,
                now,
            ],
        )?;
        if inserted == 0 {
            return Err(Error::Conflict(format!(
                "a destination named '{}' already exists",
                input.name
            )));
        }

        self.get_destination(&id)?
            .ok_or_else(|| Error::Internal("destination vanished after insert".into()))
    }

    /// Get a destination by id. The built-in `__local__` id is not a stored
    /// row; the engine resolves it separately.
    pub fn get_destination(&self, id: &str) -> Result<Option<Destination>> {
        let conn = self.conn()?;
        let row = conn
            .query_row(
                &format!("SELECT {} FROM destinations WHERE id = ?", DEST_COLS),
                params![id],
                read_row,
            )
            .optional()?;
        row.map(DestinationRow::into_destination).transpose()
    }

    /// List managed destinations (the built-in local one is not listed).
    pub fn list_destinations(&self) -> Result<Vec<Destination>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM destinations ORDER BY name",
            DEST_COLS
        ))?;
        let rows = stmt
            .query_map([], read_row)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        rows.into_iter()
            .map(DestinationRow::into_destination)
            .collect()
    }

    /// Update a destination. Secrets are replaced when provided, cleared when
    /// an explicit empty object is sent, and kept otherwise.
    pub fn update_destination(&self, id: &str, input: DestinationInput) -> Result<Destination> {
        if self.get_destination(id)?.is_none() {
            return Err(Error::NotFound(format!("destination {}", id)));
        }
        let config = DestConfig::parse(input.destination_type, input.config)?;

        let conn = self.conn()?;
        let sealed = match &input.secrets {
            Some(s) if !s.is_empty() => Some(self.sealer().seal(s)?),
            Some(_) => None,
            None => conn.query_row(
                "SELECT secrets FROM destinations WHERE id = ?",
                params![id],
                |row| row.get::<_, Option<String>>(0),
            )?,
        };

        let updated = conn.execute(
            "UPDATE destinations
             SET name = ?, destination_type = ?, config = ?, secrets = ?, is_active = ?, updated_at = ?
             WHERE id = ?",
            params![
                input.name,
                input.destination_type.as_str(),
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
                    "a destination named '{}' already exists",
                    input.name
                )));
            }
        }
        updated?;

        self.get_destination(id)?
            .ok_or_else(|| Error::NotFound(format!("destination {}", id)))
    }

    /// Delete a destination. Refused while any schedule references it.
    pub fn delete_destination(&self, id: &str) -> Result<()> {
        if id == LOCAL_DESTINATION_ID {
            return Err(Error::Validation(
                "the built-in local destination cannot be deleted".into(),
            ));
        }

        if let Some(schedule) = self.schedule_referencing_destination(id)? {
            return Err(Error::InUse {
                entity: format!("destination {}", id),
                schedule,
            });
        }

        let conn = self.conn()?;
        let deleted = conn.execute("DELETE FROM destinations WHERE id = ?", params![id])?;
        if deleted == 0 {
            return Err(Error::NotFound(format!("destination {}", id)));
        }
        Ok(())
    }

    /// Open a destination's sealed secrets for an adapter call.
    pub fn open_destination_secrets(&self, id: &str) -> Result<Secrets> {
        if id == LOCAL_DESTINATION_ID {
            return Ok(Secrets::default());
        }
        let conn = self.conn()?;
        let sealed: Option<Option<String>> = conn
            .query_row(
                "SELECT secrets FROM destinations WHERE id = ?",
                params![id],
                |row| row.get(0),
            )
            .optional()?;
        match sealed {
            None => Err(Error::NotFound(format!("destination {}", id))),
            Some(None) => Ok(Secrets::default()),
            Some(Some(blob)) => self.sealer().open(&blob),
        }
    }

    /// Name of the first schedule whose destination set contains `id`.
    ///
    /// `destination_ids` is a JSON array column; membership is checked in
    /// Rust rather than with string matching.
    pub(crate) fn schedule_referencing_destination(&self, id: &str) -> Result<Option<String>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare("SELECT name, destination_ids FROM schedules")?;
        let rows = stmt
            .query_map([], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        for (name, ids_json) in rows {
            let ids: Vec<String> = serde_json::from_str(&ids_json)?;
            if ids.iter().any(|d| d == id) {
                return Ok(Some(name));
            }
        }
        Ok(None)
    }
}

//! Backup filename grammar
//!
//! `backup_<sanitized-target>_<UTC yyyymmdd_HHMMSS>.<dbSuffix>[.gz][.enc]`
//!
//! The sanitized target name doubles as the per-target storage folder:
//! object key = `<sanitized-target>/<filename>`.

use chrono::{DateTime, NaiveDateTime, Utc};

use crate::error::{Error, Result};

/// Lowercase a target name into `[a-z0-9_-]+`, collapsing runs of
/// replacement underscores.
pub fn sanitize_target_name(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    let mut last_was_underscore = false;
    for ch in name.to_lowercase().chars() {
        let mapped = match ch {
            'a'..='z' | '0'..='9' | '-' => Some(ch),
            _ => Some('_'),
        };
        if let Some(c) = mapped {
            if c == '_' {
                if last_was_underscore {
                    continue;
                }
                last_was_underscore = true;
            } else {
                last_was_underscore = false;
            }
            out.push(c);
        }
    }
    let trimmed = out.trim_matches('_');
    if trimmed.is_empty() {
        "unnamed".to_string()
    } else {
        trimmed.to_string()
    }
}

/// Compose a backup filename for `target_name` dumped at `timestamp`.
pub fn compose(
    target_name: &str,
    timestamp: DateTime<Utc>,
    suffix: &str,
    gzip: bool,
    encrypted: bool,
) -> String {
    let mut name = format!(
        "backup_{}_{}.{}",
        sanitize_target_name(target_name),
        timestamp.format("%Y%m%d_%H%M%S"),
        suffix
    );
    if gzip {
        name.push_str(".gz");
    }
    if encrypted {
        name.push_str(".enc");
    }
    name
}

/// Storage key for a filename: `<sanitized-target>/<filename>`.
pub fn storage_key(target_name: &str, filename: &str) -> String {
    format!("{}/{}", sanitize_target_name(target_name), filename)
}

/// Decomposed backup filename.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedFilename {
    pub target: String,
    pub timestamp: DateTime<Utc>,
    /// Logical dump suffix (`dump`, `sql`, `db`, `cypher`).
    pub suffix: String,
    pub gzip: bool,
    pub encrypted: bool,
}

/// Parse a filename produced by [`compose`].
pub fn parse(filename: &str) -> Result<ParsedFilename> {
    let bad = || Error::Validation(format!("not a backup filename: {}", filename));

    let mut rest = filename.strip_prefix("backup_").ok_or_else(bad)?;

    let encrypted = if let Some(stripped) = rest.strip_suffix(".enc") {
        rest = stripped;
        true
    } else {
        false
    };
    let gzip = if let Some(stripped) = rest.strip_suffix(".gz") {
        rest = stripped;
        true
    } else {
        false
    };

    let (stem, suffix) = rest.rsplit_once('.').ok_or_else(bad)?;
    if suffix.is_empty() {
        return Err(bad());
    }

    // stem = <target>_<yyyymmdd>_<HHMMSS>; the timestamp is the last two
    // underscore-separated fields
    let (head, time_part) = stem.rsplit_once('_').ok_or_else(bad)?;
    let (target, date_part) = head.rsplit_once('_').ok_or_else(bad)?;
    if target.is_empty() {
        return Err(bad());
    }

    let timestamp =
        NaiveDateTime::parse_from_str(&format!("{}_{}", date_part, time_part), "%Y%m%d_%H%M%S")
            .map_err(|_| bad())?
            .and_utc();

    Ok(ParsedFilename {
        target: target.to_string(),
        timestamp,
        suffix: suffix.to_string(),
        gzip,
        encrypted,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_sanitize() {
        assert_eq!(sanitize_target_name("pg-app"), "pg-app");
        assert_eq!(sanitize_target_name("Prod DB #1"), "prod_db_1");
        assert_eq!(sanitize_target_name("a   b"), "a_b");
        assert_eq!(sanitize_target_name("__x__"), "x");
        assert_eq!(sanitize_target_name("!!!"), "unnamed");
    }

    #[test]
    fn test_compose_and_parse_roundtrip() {
        let ts = Utc.with_ymd_and_hms(2025, 3, 1, 3, 30, 0).unwrap();
        let name = compose("Pg App", ts, "sql", true, true);
        assert_eq!(name, "backup_pg_app_20250301_033000.sql.gz.enc");

        let parsed = parse(&name).unwrap();
        assert_eq!(parsed.target, "pg_app");
        assert_eq!(parsed.timestamp, ts);
        assert_eq!(parsed.suffix, "sql");
        assert!(parsed.gzip);
        assert!(parsed.encrypted);
    }

    #[test]
    fn test_parse_plain() {
        let parsed = parse("backup_app_20250301_033000.dump").unwrap();
        assert!(!parsed.gzip);
        assert!(!parsed.encrypted);
        assert_eq!(parsed.suffix, "dump");
    }

    #[test]
    fn test_parse_rejects_foreign_names() {
        assert!(parse("notes.txt").is_err());
        assert!(parse("backup_app.sql").is_err());
        assert!(parse("backup_app_2025_033000.sql").is_err());
    }

    #[test]
    fn test_storage_key() {
        assert_eq!(
            storage_key("Pg App", "backup_pg_app_20250301_033000.sql"),
            "pg_app/backup_pg_app_20250301_033000.sql"
        );
    }
}

//! Core data model: targets, destinations, schedules, runs
//!
//! Entity configs are modeled as tagged variants per engine/backend type with
//! a narrow validation layer at the API boundary (`DbConfig::parse`,
//! `DestConfig::parse`); everything past the boundary works with typed fields.

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Opaque stable entity id (UUID-shaped string).
pub type Id = String;

/// Id of the built-in virtual destination backed by the server-local root.
pub const LOCAL_DESTINATION_ID: &str = "__local__";

/// Mint a new entity id.
pub fn new_id() -> Id {
    uuid::Uuid::new_v4().to_string()
}

// ============================================================================
// Enumerations
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DbType {
    Postgresql,
    Mysql,
    Sqlite,
    Neo4j,
}

impl DbType {
    pub fn as_str(&self) -> &'static str {
        match self {
            DbType::Postgresql => "postgresql",
            DbType::Mysql => "mysql",
            DbType::Sqlite => "sqlite",
            DbType::Neo4j => "neo4j",
        }
    }

    /// Logical dump suffixes this engine can restore from.
    pub fn compatible_suffixes(&self) -> &'static [&'static str] {
        match self {
            DbType::Postgresql => &["dump", "sql"],
            DbType::Mysql => &["sql"],
            DbType::Sqlite => &["db"],
            DbType::Neo4j => &["cypher"],
        }
    }
}

impl FromStr for DbType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "postgresql" => Ok(DbType::Postgresql),
            "mysql" => Ok(DbType::Mysql),
            "sqlite" => Ok(DbType::Sqlite),
            "neo4j" => Ok(DbType::Neo4j),
            other => Err(Error::Validation(format!("unknown db_type: {}", other))),
        }
    }
}

impl fmt::Display for DbType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DestinationType {
    Local,
    Sftp,
    GoogleDrive,
}

impl DestinationType {
    pub fn as_str(&self) -> &'static str {
        match self {
            DestinationType::Local => "local",
            DestinationType::Sftp => "sftp",
            DestinationType::GoogleDrive => "google_drive",
        }
    }
}

impl FromStr for DestinationType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "local" => Ok(DestinationType::Local),
            "sftp" => Ok(DestinationType::Sftp),
            "google_drive" => Ok(DestinationType::GoogleDrive),
            other => Err(Error::Validation(format!(
                "unknown destination_type: {}",
                other
            ))),
        }
    }
}

impl fmt::Display for DestinationType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Operation {
    Backup,
    Restore,
}

impl Operation {
    pub fn as_str(&self) -> &'static str {
        match self {
            Operation::Backup => "backup",
            Operation::Restore => "restore",
        }
    }
}

impl FromStr for Operation {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "backup" => Ok(Operation::Backup),
            "restore" => Ok(Operation::Restore),
            other => Err(Error::Validation(format!("unknown operation: {}", other))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Trigger {
    Scheduled,
    Manual,
    RunNow,
}

impl Trigger {
    pub fn as_str(&self) -> &'static str {
        match self {
            Trigger::Scheduled => "scheduled",
            Trigger::Manual => "manual",
            Trigger::RunNow => "run_now",
        }
    }
}

impl FromStr for Trigger {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "scheduled" => Ok(Trigger::Scheduled),
            "manual" => Ok(Trigger::Manual),
            "run_now" => Ok(Trigger::RunNow),
            other => Err(Error::Validation(format!("unknown trigger: {}", other))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Running,
    Success,
    Failure,
    PartialSuccess,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Running => "running",
            RunStatus::Success => "success",
            RunStatus::Failure => "failure",
            RunStatus::PartialSuccess => "partial_success",
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, RunStatus::Running)
    }
}

impl FromStr for RunStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "running" => Ok(RunStatus::Running),
            "success" => Ok(RunStatus::Success),
            "failure" => Ok(RunStatus::Failure),
            "partial_success" => Ok(RunStatus::PartialSuccess),
            other => Err(Error::Validation(format!("unknown run status: {}", other))),
        }
    }
}

/// Notification severity, ordered info < warning < error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Info,
    Warning,
    Error,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Info => "info",
            Severity::Warning => "warning",
            Severity::Error => "error",
        }
    }

    /// Severity of a terminal run status.
    pub fn for_status(status: RunStatus) -> Severity {
        match status {
            RunStatus::Success | RunStatus::Running => Severity::Info,
            RunStatus::PartialSuccess => Severity::Warning,
            RunStatus::Failure => Severity::Error,
        }
    }
}

// ============================================================================
// Target configuration
// ============================================================================

/// Per-engine connection config. Parsed from the loosely-shaped `config`
/// object the API accepts; required fields are enforced here, once.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum DbConfig {
    Postgres(PostgresConfig),
    Mysql(MysqlConfig),
    Sqlite(SqliteConfig),
    Neo4j(Neo4jConfig),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PostgresConfig {
    pub host: String,
    #[serde(default = "PostgresConfig::default_port")]
    pub port: u16,
    pub database: String,
    pub user: String,
    /// `custom` (pg_dump -Fc, `.dump`) or `plain` (SQL text, `.sql`).
    #[serde(default)]
    pub format: PgDumpFormat,
}

impl PostgresConfig {
    fn default_port() -> u16 {
        5432
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PgDumpFormat {
    #[default]
    Custom,
    Plain,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MysqlConfig {
    pub host: String,
    #[serde(default = "MysqlConfig::default_port")]
    pub port: u16,
    pub database: String,
    pub user: String,
}

impl MysqlConfig {
    fn default_port() -> u16 {
        3306
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SqliteConfig {
    /// Path to the database file on the server host.
    pub path: PathBuf,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Neo4jConfig {
    pub host: String,
    #[serde(default = "Neo4jConfig::default_port")]
    pub port: u16,
    /// Database name; `neo4j` when unset.
    pub database: Option<String>,
    /// Auth is optional for Neo4j.
    pub user: Option<String>,
}

impl Neo4jConfig {
    fn default_port() -> u16 {
        7687
    }
}

impl DbConfig {
    /// Validate and type a raw config object against the declared `db_type`.
    pub fn parse(db_type: DbType, raw: serde_json::Value) -> Result<DbConfig> {
        let invalid = |field: &str| {
            Error::Validation(format!(
                "db_type={} requires config.{}",
                db_type.as_str(),
                field
            ))
        };
        match db_type {
            DbType::Postgresql => {
                let cfg: PostgresConfig =
                    serde_json::from_value(raw).map_err(|e| Error::Validation(e.to_string()))?;
                if cfg.host.is_empty() {
                    return Err(invalid("host"));
                }
                if cfg.database.is_empty() {
                    return Err(invalid("database"));
                }
                if cfg.user.is_empty() {
                    return Err(invalid("user"));
                }
                Ok(DbConfig::Postgres(cfg))
            }
            DbType::Mysql => {
                let cfg: MysqlConfig =
                    serde_json::from_value(raw).map_err(|e| Error::Validation(e.to_string()))?;
                if cfg.host.is_empty() {
                    return Err(invalid("host"));
                }
                if cfg.database.is_empty() {
                    return Err(invalid("database"));
                }
                if cfg.user.is_empty() {
                    return Err(invalid("user"));
                }
                Ok(DbConfig::Mysql(cfg))
            }
            DbType::Sqlite => {
                let cfg: SqliteConfig =
                    serde_json::from_value(raw).map_err(|e| Error::Validation(e.to_string()))?;
                if cfg.path.as_os_str().is_empty() {
                    return Err(invalid("path"));
                }
                Ok(DbConfig::Sqlite(cfg))
            }
            DbType::Neo4j => {
                let cfg: Neo4jConfig =
                    serde_json::from_value(raw).map_err(|e| Error::Validation(e.to_string()))?;
                if cfg.host.is_empty() {
                    return Err(invalid("host"));
                }
                Ok(DbConfig::Neo4j(cfg))
            }
        }
    }

    pub fn db_type(&self) -> DbType {
        match self {
            DbConfig::Postgres(_) => DbType::Postgresql,
            DbConfig::Mysql(_) => DbType::Mysql,
            DbConfig::Sqlite(_) => DbType::Sqlite,
            DbConfig::Neo4j(_) => DbType::Neo4j,
        }
    }

    /// Deserialize a stored config column, re-typed by the stored db_type.
    pub fn from_stored(db_type: DbType, json: &str) -> Result<DbConfig> {
        DbConfig::parse(db_type, serde_json::from_str(json)?)
    }
}

// ============================================================================
// Destination configuration
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum DestConfig {
    Local(LocalConfig),
    Sftp(SftpConfig),
    GoogleDrive(GoogleDriveConfig),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LocalConfig {
    /// Root directory artifacts are stored under.
    pub root: PathBuf,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SftpConfig {
    pub host: String,
    #[serde(default = "SftpConfig::default_port")]
    pub port: u16,
    pub user: String,
    /// Remote base directory (absolute or relative to the login home).
    pub root_path: String,
}

impl SftpConfig {
    fn default_port() -> u16 {
        22
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GoogleDriveConfig {
    /// Drive folder all artifacts live under.
    pub folder_id: String,
}

impl DestConfig {
    pub fn parse(destination_type: DestinationType, raw: serde_json::Value) -> Result<DestConfig> {
        let invalid = |field: &str| {
            Error::Validation(format!(
                "destination_type={} requires config.{}",
                destination_type.as_str(),
                field
            ))
        };
        match destination_type {
            DestinationType::Local => {
                let cfg: LocalConfig =
                    serde_json::from_value(raw).map_err(|e| Error::Validation(e.to_string()))?;
                if cfg.root.as_os_str().is_empty() {
                    return Err(invalid("root"));
                }
                Ok(DestConfig::Local(cfg))
            }
            DestinationType::Sftp => {
                let cfg: SftpConfig =
                    serde_json::from_value(raw).map_err(|e| Error::Validation(e.to_string()))?;
                if cfg.host.is_empty() {
                    return Err(invalid("host"));
                }
                if cfg.user.is_empty() {
                    return Err(invalid("user"));
                }
                if cfg.root_path.is_empty() {
                    return Err(invalid("root_path"));
                }
                Ok(DestConfig::Sftp(cfg))
            }
            DestinationType::GoogleDrive => {
                let cfg: GoogleDriveConfig =
                    serde_json::from_value(raw).map_err(|e| Error::Validation(e.to_string()))?;
                if cfg.folder_id.is_empty() {
                    return Err(invalid("folder_id"));
                }
                Ok(DestConfig::GoogleDrive(cfg))
            }
        }
    }

    pub fn destination_type(&self) -> DestinationType {
        match self {
            DestConfig::Local(_) => DestinationType::Local,
            DestConfig::Sftp(_) => DestinationType::Sftp,
            DestConfig::GoogleDrive(_) => DestinationType::GoogleDrive,
        }
    }

    pub fn from_stored(destination_type: DestinationType, json: &str) -> Result<DestConfig> {
        DestConfig::parse(destination_type, serde_json::from_str(json)?)
    }
}

// ============================================================================
// Secrets
// ============================================================================

/// Secret material attached to a target or destination. Stored sealed as one
/// blob; opened only inside the adapter call that consumes it.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Secrets {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub private_key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub passphrase: Option<String>,
    /// Google service-account credentials JSON.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service_account_json: Option<String>,
}

impl Secrets {
    pub fn is_empty(&self) -> bool {
        self.password.is_none()
            && self.private_key.is_none()
            && self.passphrase.is_none()
            && self.service_account_json.is_none()
    }
}

// ============================================================================
// Entities
// ============================================================================

/// A backupable database.
#[derive(Debug, Clone, Serialize)]
pub struct Target {
    pub id: Id,
    pub name: String,
    pub db_type: DbType,
    pub config: DbConfig,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Which secret fields are present (secrets themselves never leave the
    /// store unsealed through entity reads).
    pub has_secrets: bool,
}

/// A storage location for backup artifacts.
#[derive(Debug, Clone, Serialize)]
pub struct Destination {
    pub id: Id,
    pub name: String,
    pub destination_type: DestinationType,
    pub config: DestConfig,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub has_secrets: bool,
}

impl Destination {
    /// The built-in virtual destination, rooted at the server-local path.
    pub fn builtin_local(root: PathBuf) -> Destination {
        let now = Utc::now();
        Destination {
            id: LOCAL_DESTINATION_ID.to_string(),
            name: "Local storage".to_string(),
            destination_type: DestinationType::Local,
            config: DestConfig::Local(LocalConfig { root }),
            is_active: true,
            created_at: now,
            updated_at: now,
            has_secrets: false,
        }
    }
}

/// A named periodic backup of one target to a set of destinations.
#[derive(Debug, Clone, Serialize)]
pub struct Schedule {
    pub id: Id,
    pub name: String,
    pub target_id: Id,
    pub destination_ids: Vec<Id>,
    pub interval_seconds: i64,
    pub enabled: bool,
    pub retention: RetentionConfig,
    pub next_run_at: Option<DateTime<Utc>>,
    pub last_run_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Minimum schedule interval.
pub const MIN_INTERVAL_SECONDS: i64 = 60;

/// `run_at_time` anchors only apply to intervals of at least an hour.
pub const ANCHOR_MIN_INTERVAL_SECONDS: i64 = 3600;

// ============================================================================
// Retention
// ============================================================================

/// Wall-clock anchor for schedule slots, `HH:MM` local time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeOfDay {
    pub hour: u8,
    pub minute: u8,
}

impl TimeOfDay {
    pub fn parse(s: &str) -> Result<TimeOfDay> {
        let bytes = s.as_bytes();
        let well_formed = bytes.len() == 5
            && bytes[2] == b':'
            && bytes[0].is_ascii_digit()
            && bytes[0] <= b'2'
            && bytes[1].is_ascii_digit()
            && bytes[3].is_ascii_digit()
            && bytes[3] <= b'5'
            && bytes[4].is_ascii_digit();
        if !well_formed {
            return Err(Error::Validation(format!(
                "run_at_time must be HH:MM, got {:?}",
                s
            )));
        }
        let hour: u8 = s[0..2]
            .parse()
            .map_err(|_| Error::Validation(format!("invalid run_at_time hour in {:?}", s)))?;
        let minute: u8 = s[3..5]
            .parse()
            .map_err(|_| Error::Validation(format!("invalid run_at_time minute in {:?}", s)))?;
        if hour > 23 {
            return Err(Error::Validation(format!(
                "run_at_time hour out of range in {:?}",
                s
            )));
        }
        Ok(TimeOfDay { hour, minute })
    }
}

impl fmt::Display for TimeOfDay {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:02}:{:02}", self.hour, self.minute)
    }
}

impl Serialize for TimeOfDay {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for TimeOfDay {
    fn deserialize<D: serde::Deserializer<'de>>(
        deserializer: D,
    ) -> std::result::Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        TimeOfDay::parse(&s).map_err(serde::de::Error::custom)
    }
}

/// Exactly one retention mode applies per schedule; the externally-tagged
/// representation (`{"max_count": 3}`, `{"smart": {...}}`) enforces that at
/// the serde layer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RetentionRule {
    Smart(SmartBuckets),
    MaxCount(u32),
    MaxDays(u32),
    MaxSizeMb(u64),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SmartBuckets {
    #[serde(default)]
    pub daily: u32,
    #[serde(default)]
    pub weekly: u32,
    #[serde(default)]
    pub monthly: u32,
    #[serde(default)]
    pub yearly: u32,
}

/// Retention and run policy attached to a schedule.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetentionConfig {
    /// HH:MM local anchor; only honored for intervals >= 3600 s.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub run_at_time: Option<TimeOfDay>,
    #[serde(flatten)]
    pub rule: RetentionRule,
    #[serde(default)]
    pub encrypt: bool,
    /// Accepted at create/update time, sealed into the store by the
    /// repository, and never serialized back out.
    #[serde(default, skip_serializing)]
    pub encrypt_password: Option<String>,
    #[serde(default, skip_serializing_if = "NotificationConfig::is_empty")]
    pub notifications: NotificationConfig,
}

// ============================================================================
// Notifications
// ============================================================================

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NotificationConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub telegram: Option<TelegramNotifyConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<EmailNotifyConfig>,
}

impl NotificationConfig {
    pub fn is_empty(&self) -> bool {
        self.telegram.is_none() && self.email.is_none()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TelegramNotifyConfig {
    pub enabled: bool,
    pub recipients: Vec<TelegramRecipient>,
    #[serde(default)]
    pub attach_backup: bool,
    #[serde(default = "default_attach_max_mb")]
    pub attach_max_mb: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TelegramRecipient {
    pub chat_id: String,
    #[serde(default = "default_min_severity")]
    pub min_severity: Severity,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EmailNotifyConfig {
    pub enabled: bool,
    pub recipients: Vec<EmailRecipient>,
    #[serde(default)]
    pub attach_backup: bool,
    #[serde(default = "default_attach_max_mb")]
    pub attach_max_mb: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EmailRecipient {
    pub to: String,
    #[serde(default = "default_min_severity")]
    pub min_severity: Severity,
}

fn default_min_severity() -> Severity {
    Severity::Info
}

fn default_attach_max_mb() -> u64 {
    25
}

// ============================================================================
// Runs (audit records)
// ============================================================================

/// One executed backup or restore.
#[derive(Debug, Clone, Serialize)]
pub struct Run {
    pub id: Id,
    pub operation: Operation,
    pub trigger: Trigger,
    pub target_id: Id,
    pub target_name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub schedule_id: Option<Id>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub schedule_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub destination_id: Option<Id>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub destination_name: Option<String>,
    /// Adapter-opaque artifact id.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub backup_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub backup_filename: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file_size_mb: Option<f64>,
    pub status: RunStatus,
    pub started_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    pub detail: RunDetail,
}

/// Structured per-destination and per-notification sub-results.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RunDetail {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub destinations: Vec<DestinationOutcome>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub retention: Vec<RetentionOutcome>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub notifications: Vec<NotificationOutcome>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutcomeStatus {
    Success,
    Failure,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DestinationOutcome {
    pub destination_id: Id,
    pub destination_name: String,
    pub status: OutcomeStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backup_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bytes: Option<u64>,
    pub duration_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetentionOutcome {
    pub destination_id: Id,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub deleted: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotificationOutcome {
    /// `telegram` or `email`.
    pub channel: String,
    pub recipient: String,
    pub ok: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

// ============================================================================
// Artifacts
// ============================================================================

/// A stored backup file as reported by a destination adapter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArtifactInfo {
    /// Adapter-opaque id (relative path for local, full path for SFTP,
    /// file id for Google Drive). Callers never parse it.
    pub id: String,
    pub name: String,
    pub size: u64,
    pub created_at: DateTime<Utc>,
}

/// Result of a destination `put`.
#[derive(Debug, Clone)]
pub struct StoredArtifact {
    pub backup_id: String,
    pub created_at: DateTime<Utc>,
}

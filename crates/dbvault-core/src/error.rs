//! Error types for the backup engine
//!
//! Every error carries a [`ErrorKind`] so callers (HTTP layer, CLI) can map
//! failures to status codes without matching on individual variants.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("Database pool error: {0}")]
    Pool(#[from] r2d2::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("{entity} is referenced by schedule '{schedule}'")]
    InUse { entity: String, schedule: String },

    #[error("Unauthorized: {0}")]
    Auth(String),

    #[error("Schedule busy: a run is already active")]
    Busy { retry_after_secs: u64 },

    /// Retryable adapter failure (network, 5xx, throttling). Retried by the
    /// pipeline, never surfaced to API callers directly.
    #[error("Transient adapter error: {0}")]
    Transient(String),

    /// Non-retryable adapter failure (auth, not-found, quota).
    #[error("Permanent adapter error: {0}")]
    Permanent(String),

    #[error("Dump tool exited with code {code}: {stderr_tail}")]
    Dump { code: i32, stderr_tail: String },

    #[error("Restore confirmation required: pass confirmation=\"RESTORE\"")]
    ConfirmationRequired,

    #[error("Backup is encrypted: an encryption password is required")]
    EncryptionPasswordRequired,

    #[error("Incompatible backup: {0}")]
    IncompatibleBackup(String),

    #[error("Decryption failed: {0}")]
    DecryptFailed(String),

    #[error("Secret sealing error: {0}")]
    Secret(String),

    #[error("Operation cancelled")]
    Cancelled,

    #[error("Internal error: {0}")]
    Internal(String),
}

/// Error taxonomy kinds, mapped to HTTP statuses by the server crate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Validation,
    NotFound,
    Conflict,
    Auth,
    Busy,
    Transient,
    Permanent,
    ConfirmationRequired,
    EncryptionPasswordRequired,
    IncompatibleBackup,
    DecryptFailed,
    Internal,
}

impl ErrorKind {
    /// Stable wire code for API error bodies.
    pub fn code(&self) -> &'static str {
        match self {
            ErrorKind::Validation => "VALIDATION",
            ErrorKind::NotFound => "NOT_FOUND",
            ErrorKind::Conflict => "CONFLICT",
            ErrorKind::Auth => "AUTH",
            ErrorKind::Busy => "BUSY",
            ErrorKind::Transient => "TRANSIENT",
            ErrorKind::Permanent => "PERMANENT",
            ErrorKind::ConfirmationRequired => "CONFIRMATION_REQUIRED",
            ErrorKind::EncryptionPasswordRequired => "ENCRYPTION_PASSWORD_REQUIRED",
            ErrorKind::IncompatibleBackup => "INCOMPATIBLE_BACKUP",
            ErrorKind::DecryptFailed => "DECRYPT_FAILED",
            ErrorKind::Internal => "INTERNAL",
        }
    }
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Validation(_) => ErrorKind::Validation,
            Error::NotFound(_) => ErrorKind::NotFound,
            Error::Conflict(_) | Error::InUse { .. } => ErrorKind::Conflict,
            Error::Auth(_) => ErrorKind::Auth,
            Error::Busy { .. } => ErrorKind::Busy,
            Error::Transient(_) => ErrorKind::Transient,
            Error::Permanent(_) | Error::Dump { .. } => ErrorKind::Permanent,
            Error::ConfirmationRequired => ErrorKind::ConfirmationRequired,
            Error::EncryptionPasswordRequired => ErrorKind::EncryptionPasswordRequired,
            Error::IncompatibleBackup(_) => ErrorKind::IncompatibleBackup,
            Error::DecryptFailed(_) => ErrorKind::DecryptFailed,
            Error::Database(_)
            | Error::Pool(_)
            | Error::Io(_)
            | Error::Json(_)
            | Error::Secret(_)
            | Error::Cancelled
            | Error::Internal(_) => ErrorKind::Internal,
        }
    }

    /// True if the pipeline should retry the operation.
    pub fn is_transient(&self) -> bool {
        matches!(self, Error::Transient(_))
    }
}

impl From<reqwest::Error> for Error {
    fn from(err: reqwest::Error) -> Self {
        // Connection-level and server-side failures are worth retrying;
        // everything else (body decode, redirect loops) is not.
        if err.is_timeout() || err.is_connect() {
            return Error::Transient(err.to_string());
        }
        match err.status() {
            Some(status) if status.is_server_error() || status.as_u16() == 429 => {
                Error::Transient(err.to_string())
            }
            Some(status) if status.as_u16() == 401 || status.as_u16() == 403 => {
                Error::Permanent(format!("authentication rejected: {}", err))
            }
            _ => Error::Permanent(err.to_string()),
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_codes_are_stable() {
        assert_eq!(Error::ConfirmationRequired.kind().code(), "CONFIRMATION_REQUIRED");
        assert_eq!(
            Error::Busy {
                retry_after_secs: 30
            }
            .kind()
            .code(),
            "BUSY"
        );
        assert_eq!(
            Error::InUse {
                entity: "target pg-app".into(),
                schedule: "nightly".into()
            }
            .kind()
            .code(),
            "CONFLICT"
        );
    }

    #[test]
    fn test_transient_classification() {
        assert!(Error::Transient("503".into()).is_transient());
        assert!(!Error::Permanent("auth".into()).is_transient());
        assert!(!Error::NotFound("x".into()).is_transient());
    }
}

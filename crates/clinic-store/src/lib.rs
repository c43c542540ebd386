//! clinic-store — SQLite persistence for the clinic check-in tool.
//!
//! Plain functions over a `rusqlite::Connection`, so the same code serves
//! the synchronous CLI and the daemon's `tokio-rusqlite` connection.

pub mod cipher;
pub mod encodings;
pub mod patients;
pub mod schema;
pub mod visits;

use clinic_core::types::EmbeddingError;
use rusqlite::Connection;
use std::path::{Path, PathBuf};
use thiserror::Error;

pub use cipher::EmbeddingCipher;
pub use patients::{NewPatient, Patient};
pub use visits::{NewVisit, Visit};

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("sqlite: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
    #[error("patient {0} already exists")]
    PatientExists(String),
    #[error("patient {0} not found")]
    NotFound(String),
    #[error("invalid {field}: {reason}")]
    Invalid { field: &'static str, reason: String },
    #[error("encryption key does not match the key this database was created with")]
    KeyMismatch,
    #[error("face encoding for {0} failed to decrypt")]
    Decrypt(String),
    #[error("face encoding encryption failed")]
    Encrypt,
    #[error("bad key file {path}: {reason}")]
    BadKey { path: String, reason: String },
    #[error("corrupt face encoding for {patient_id}: {source}")]
    Corrupt {
        patient_id: String,
        source: EmbeddingError,
    },
}

pub type Result<T> = std::result::Result<T, StoreError>;

/// Database location: `$CLINIC_DB_PATH`, else `<data home>/clinic/clinic.db`.
pub fn default_db_path() -> PathBuf {
    std::env::var("CLINIC_DB_PATH")
        .map(PathBuf::from)
        .unwrap_or_else(|_| clinic_core::data_home().join("clinic").join("clinic.db"))
}

/// Key file location: `$CLINIC_KEY_PATH`, else `<data home>/clinic/encodings.key`.
pub fn default_key_path() -> PathBuf {
    std::env::var("CLINIC_KEY_PATH")
        .map(PathBuf::from)
        .unwrap_or_else(|_| clinic_core::data_home().join("clinic").join("encodings.key"))
}

/// Open (creating if needed) the database at `path` and bring the schema up to date.
pub fn open(path: &Path) -> Result<Connection> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)?;
    }
    let conn = Connection::open(path)?;
    schema::migrate(&conn)?;
    tracing::debug!(path = %path.display(), "database opened");
    Ok(conn)
}

/// In-memory database with the schema applied.
pub fn open_in_memory() -> Result<Connection> {
    let conn = Connection::open_in_memory()?;
    schema::migrate(&conn)?;
    Ok(conn)
}

/// Current UTC time as RFC 3339 with milliseconds.
pub(crate) fn now() -> String {
    chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Millis, true)
}

/// True for UNIQUE / PRIMARY KEY / FOREIGN KEY violations.
pub(crate) fn is_constraint_violation(err: &rusqlite::Error) -> bool {
    matches!(
        err,
        rusqlite::Error::SqliteFailure(e, _) if e.code == rusqlite::ErrorCode::ConstraintViolation
    )
}

use rusqlite::Error as RusqliteError;
use std::io;
use std::path::PathBuf;
use thiserror::Error;

use crate::control::ControlStatus;

#[derive(Error, Debug)]
pub enum XferoError {
    #[error("I/O error: {0}")]
    IoError(#[from] io::Error), // Converts io::Error into XferoError automatically

    #[error("Database error: {0}")]
    DatabaseError(#[from] RusqliteError), // Converts rusqlite::Error automatically

    #[error("Connection pool error: {0}")]
    PoolError(#[from] r2d2::Error),

    #[error("Configuration missing: {0}")]
    ConfigMissing(String),

    #[error("Configuration corrupt: {0}")]
    ConfigCorrupt(String),

    #[error("Database schema missing: {0}")]
    SchemaMissing(String),

    #[error("Lock contended: {}", .0.display())]
    LockContended(PathBuf),

    #[error("Invalid control transition: {from} -> {to}")]
    InvalidTransition {
        from: ControlStatus,
        to: ControlStatus,
    },

    #[error("A supervisor is already running (pid {0})")]
    AlreadyRunning(i32),

    #[error("Invalid pattern: {0}")]
    PatternError(#[from] regex::Error),

    #[error("Error: {0}")]
    Error(String), // Allows custom application errors
}

impl From<figment::Error> for XferoError {
    fn from(err: figment::Error) -> Self {
        XferoError::ConfigCorrupt(err.to_string())
    }
}

impl XferoError {
    /// Process exit code for this error. Codes are stable per kind so that
    /// service wrappers can tell boot failures apart.
    pub fn exit_code(&self) -> i32 {
        match self {
            XferoError::ConfigMissing(_) => 2,
            XferoError::ConfigCorrupt(_) => 3,
            XferoError::SchemaMissing(_) => 4,
            XferoError::DatabaseError(_) | XferoError::PoolError(_) => 5,
            XferoError::AlreadyRunning(_) => 6,
            XferoError::InvalidTransition { .. } => 7,
            _ => 1,
        }
    }

    /// SQLITE_BUSY and SQLITE_LOCKED clear up on their own once the competing
    /// writer commits, so they are retried rather than surfaced.
    pub fn is_transient(&self) -> bool {
        match self {
            XferoError::DatabaseError(err) => is_transient_sqlite(err),
            _ => false,
        }
    }
}

pub fn is_transient_sqlite(err: &RusqliteError) -> bool {
    matches!(
        err.sqlite_error_code(),
        Some(rusqlite::ErrorCode::DatabaseBusy) | Some(rusqlite::ErrorCode::DatabaseLocked)
    )
}

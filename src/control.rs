use std::fmt;

use log::info;
use rusqlite::{Connection, OptionalExtension};
use serde::{Deserialize, Serialize};

use crate::db::Database;
use crate::error::XferoError;

/// Identifier of the singleton control row
pub const CONTROL_ID: i64 = 1;

/// Runtime state of the system, held in the control row. The control row is
/// the in-band signal between the supervisor and admin tools.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ControlStatus {
    Running,
    Stopping,
    Stopped,
}

impl ControlStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ControlStatus::Running => "RUNNING",
            ControlStatus::Stopping => "STOPPING",
            ControlStatus::Stopped => "STOPPED",
        }
    }

    pub fn from_string(s: &str) -> Option<Self> {
        match s.trim().to_ascii_uppercase().as_str() {
            "RUNNING" => Some(ControlStatus::Running),
            "STOPPING" => Some(ControlStatus::Stopping),
            "STOPPED" => Some(ControlStatus::Stopped),
            _ => None,
        }
    }

    /// STOPPED -> RUNNING -> STOPPING -> STOPPED; nothing else.
    pub fn can_transition_to(&self, next: ControlStatus) -> bool {
        matches!(
            (self, next),
            (ControlStatus::Stopped, ControlStatus::Running)
                | (ControlStatus::Running, ControlStatus::Stopping)
                | (ControlStatus::Stopping, ControlStatus::Stopped)
        )
    }
}

impl fmt::Display for ControlStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Control {
    pub status: ControlStatus,
    pub num_threads: i64,
    pub pgp_keyring: Option<String>,
    pub pgp_passphrase_ref: Option<String>,
    pub updated_at: i64,
}

impl Control {
    pub fn get(conn: &Connection) -> Result<Option<Self>, XferoError> {
        conn.query_row(
            "SELECT status, num_threads, pgp_keyring, pgp_passphrase_ref, updated_at
            FROM control
            WHERE control_id = ?",
            [CONTROL_ID],
            |row| {
                let status: String = row.get(0)?;
                Ok((
                    status,
                    row.get::<_, i64>(1)?,
                    row.get::<_, Option<String>>(2)?,
                    row.get::<_, Option<String>>(3)?,
                    row.get::<_, i64>(4)?,
                ))
            },
        )
        .optional()?
        .map(|(status, num_threads, pgp_keyring, pgp_passphrase_ref, updated_at)| {
            let status = ControlStatus::from_string(&status).ok_or_else(|| {
                XferoError::ConfigCorrupt(format!("Invalid control status '{}'", status))
            })?;
            Ok(Control {
                status,
                num_threads,
                pgp_keyring,
                pgp_passphrase_ref,
                updated_at,
            })
        })
        .transpose()
    }

    fn require(conn: &Connection) -> Result<Self, XferoError> {
        Self::get(conn)?
            .ok_or_else(|| XferoError::SchemaMissing("control row is missing".into()))
    }

    /// Inserts the singleton row if it does not exist yet
    pub fn ensure_row(conn: &Connection, num_threads: i64) -> Result<(), XferoError> {
        conn.execute(
            "INSERT OR IGNORE INTO control (control_id, status, num_threads, updated_at)
            VALUES (?, ?, ?, ?)",
            rusqlite::params![
                CONTROL_ID,
                ControlStatus::Stopped.as_str(),
                num_threads,
                chrono::Utc::now().timestamp()
            ],
        )?;
        Ok(())
    }

    /// Sets the status if the transition from the current status is legal.
    ///
    /// IMPORTANT: Caller must hold an immediate transaction
    pub fn set_status_locked(conn: &Connection, next: ControlStatus) -> Result<(), XferoError> {
        let current = Self::require(conn)?.status;
        if !current.can_transition_to(next) {
            return Err(XferoError::InvalidTransition {
                from: current,
                to: next,
            });
        }
        conn.execute(
            "UPDATE control SET status = ?, updated_at = ? WHERE control_id = ?",
            rusqlite::params![next.as_str(), chrono::Utc::now().timestamp(), CONTROL_ID],
        )?;
        info!("Control status {} -> {}", current, next);
        Ok(())
    }

    pub fn set_num_threads(conn: &Connection, num_threads: i64) -> Result<(), XferoError> {
        conn.execute(
            "UPDATE control SET num_threads = ?, updated_at = ? WHERE control_id = ?",
            rusqlite::params![num_threads, chrono::Utc::now().timestamp(), CONTROL_ID],
        )?;
        Ok(())
    }

    pub fn set_pgp_identity(
        conn: &Connection,
        keyring: Option<&str>,
        passphrase_ref: Option<&str>,
    ) -> Result<(), XferoError> {
        conn.execute(
            "UPDATE control SET pgp_keyring = ?, pgp_passphrase_ref = ?, updated_at = ?
            WHERE control_id = ?",
            rusqlite::params![
                keyring,
                passphrase_ref,
                chrono::Utc::now().timestamp(),
                CONTROL_ID
            ],
        )?;
        Ok(())
    }
}

impl Database {
    pub fn control(&self) -> Result<Control, XferoError> {
        self.with_retry("control", |conn| Control::require(conn))
    }

    pub fn control_status(&self) -> Result<ControlStatus, XferoError> {
        Ok(self.control()?.status)
    }

    pub fn set_control_status(&self, next: ControlStatus) -> Result<(), XferoError> {
        self.with_retry("set_control_status", |conn| {
            Database::immediate_transaction(conn, |conn| Control::set_status_locked(conn, next))
        })
    }

    /// Admin entry point: ask a running supervisor to drain and stop.
    /// Admin tools may only write STOPPING; STOPPED belongs to the supervisor.
    pub fn request_stop(&self) -> Result<(), XferoError> {
        self.set_control_status(ControlStatus::Stopping)
    }
}

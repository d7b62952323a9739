use rusqlite::{Connection, OptionalExtension};

use crate::error::XferoError;

/// Urgency level referenced by routes. Lower level = higher urgency.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Priority {
    pub level: i64,
    pub detail: String,
}

impl Priority {
    pub fn create(conn: &Connection, level: i64, detail: &str) -> Result<Self, XferoError> {
        conn.execute(
            "INSERT INTO priorities (priority_level, detail) VALUES (?, ?)",
            rusqlite::params![level, detail],
        )?;
        Ok(Priority {
            level,
            detail: detail.to_owned(),
        })
    }

    pub fn get_by_level(conn: &Connection, level: i64) -> Result<Option<Self>, XferoError> {
        conn.query_row(
            "SELECT priority_level, detail FROM priorities WHERE priority_level = ?",
            [level],
            |row| {
                Ok(Priority {
                    level: row.get(0)?,
                    detail: row.get(1)?,
                })
            },
        )
        .optional()
        .map_err(XferoError::DatabaseError)
    }

    pub fn list(conn: &Connection) -> Result<Vec<Self>, XferoError> {
        let mut stmt = conn.prepare(
            "SELECT priority_level, detail
            FROM priorities
            ORDER BY priority_level ASC",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok(Priority {
                level: row.get(0)?,
                detail: row.get(1)?,
            })
        })?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    pub fn update(&self, conn: &Connection) -> Result<(), XferoError> {
        let changed = conn.execute(
            "UPDATE priorities SET detail = ? WHERE priority_level = ?",
            rusqlite::params![self.detail, self.level],
        )?;
        if changed == 0 {
            return Err(XferoError::Error(format!("Priority {} not found", self.level)));
        }
        Ok(())
    }

    /// Fails while any route still references the level
    pub fn delete(conn: &Connection, level: i64) -> Result<(), XferoError> {
        conn.execute("DELETE FROM priorities WHERE priority_level = ?", [level])?;
        Ok(())
    }
}

//! Named parameter templates for third-party transfer products (COTS) and
//! antivirus scanners. The engine treats them as opaque; the `transfer` and
//! `av.scan` steps read them.

use rusqlite::{Connection, OptionalExtension, Row};

use crate::error::XferoError;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CotsPattern {
    pub cots_pattern_id: i64,
    pub name: String,
    pub product: String,
    /// Command line with `{FileName}`-style placeholders
    pub command_template: String,
    pub params: String,
}

impl CotsPattern {
    fn from_row(row: &Row) -> rusqlite::Result<Self> {
        Ok(CotsPattern {
            cots_pattern_id: row.get(0)?,
            name: row.get(1)?,
            product: row.get(2)?,
            command_template: row.get(3)?,
            params: row.get(4)?,
        })
    }

    pub fn create(
        conn: &Connection,
        name: &str,
        product: &str,
        command_template: &str,
        params: &str,
    ) -> Result<Self, XferoError> {
        let cots_pattern_id: i64 = conn.query_row(
            "INSERT INTO cots_patterns (name, product, command_template, params)
            VALUES (?, ?, ?, ?)
            RETURNING cots_pattern_id",
            rusqlite::params![name, product, command_template, params],
            |row| row.get(0),
        )?;
        Ok(CotsPattern {
            cots_pattern_id,
            name: name.to_owned(),
            product: product.to_owned(),
            command_template: command_template.to_owned(),
            params: params.to_owned(),
        })
    }

    pub fn get_by_id(conn: &Connection, cots_pattern_id: i64) -> Result<Option<Self>, XferoError> {
        conn.query_row(
            "SELECT cots_pattern_id, name, product, command_template, params
            FROM cots_patterns WHERE cots_pattern_id = ?",
            [cots_pattern_id],
            CotsPattern::from_row,
        )
        .optional()
        .map_err(XferoError::DatabaseError)
    }

    pub fn list(conn: &Connection) -> Result<Vec<Self>, XferoError> {
        let mut stmt = conn.prepare(
            "SELECT cots_pattern_id, name, product, command_template, params
            FROM cots_patterns ORDER BY name ASC",
        )?;
        let rows = stmt.query_map([], CotsPattern::from_row)?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    pub fn update(&self, conn: &Connection) -> Result<(), XferoError> {
        conn.execute(
            "UPDATE cots_patterns SET name = ?, product = ?, command_template = ?, params = ?
            WHERE cots_pattern_id = ?",
            rusqlite::params![
                self.name,
                self.product,
                self.command_template,
                self.params,
                self.cots_pattern_id
            ],
        )?;
        Ok(())
    }

    pub fn delete(conn: &Connection, cots_pattern_id: i64) -> Result<(), XferoError> {
        conn.execute(
            "DELETE FROM cots_patterns WHERE cots_pattern_id = ?",
            [cots_pattern_id],
        )?;
        Ok(())
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AvPattern {
    pub av_pattern_id: i64,
    pub name: String,
    pub command_template: String,
    pub params: String,
    /// Comma separated exit codes that mean "infected"
    pub infected_exit_codes: String,
}

impl AvPattern {
    fn from_row(row: &Row) -> rusqlite::Result<Self> {
        Ok(AvPattern {
            av_pattern_id: row.get(0)?,
            name: row.get(1)?,
            command_template: row.get(2)?,
            params: row.get(3)?,
            infected_exit_codes: row.get(4)?,
        })
    }

    /// Exit codes that flag the scanned file as infected. Unparsable entries
    /// are ignored.
    pub fn infected_codes(&self) -> Vec<i32> {
        self.infected_exit_codes
            .split(',')
            .filter_map(|c| c.trim().parse().ok())
            .collect()
    }

    pub fn create(
        conn: &Connection,
        name: &str,
        command_template: &str,
        params: &str,
        infected_exit_codes: &str,
    ) -> Result<Self, XferoError> {
        let av_pattern_id: i64 = conn.query_row(
            "INSERT INTO av_patterns (name, command_template, params, infected_exit_codes)
            VALUES (?, ?, ?, ?)
            RETURNING av_pattern_id",
            rusqlite::params![name, command_template, params, infected_exit_codes],
            |row| row.get(0),
        )?;
        Ok(AvPattern {
            av_pattern_id,
            name: name.to_owned(),
            command_template: command_template.to_owned(),
            params: params.to_owned(),
            infected_exit_codes: infected_exit_codes.to_owned(),
        })
    }

    pub fn get_by_id(conn: &Connection, av_pattern_id: i64) -> Result<Option<Self>, XferoError> {
        conn.query_row(
            "SELECT av_pattern_id, name, command_template, params, infected_exit_codes
            FROM av_patterns WHERE av_pattern_id = ?",
            [av_pattern_id],
            AvPattern::from_row,
        )
        .optional()
        .map_err(XferoError::DatabaseError)
    }

    pub fn get_by_name(conn: &Connection, name: &str) -> Result<Option<Self>, XferoError> {
        conn.query_row(
            "SELECT av_pattern_id, name, command_template, params, infected_exit_codes
            FROM av_patterns WHERE name = ?",
            [name],
            AvPattern::from_row,
        )
        .optional()
        .map_err(XferoError::DatabaseError)
    }

    pub fn list(conn: &Connection) -> Result<Vec<Self>, XferoError> {
        let mut stmt = conn.prepare(
            "SELECT av_pattern_id, name, command_template, params, infected_exit_codes
            FROM av_patterns ORDER BY name ASC",
        )?;
        let rows = stmt.query_map([], AvPattern::from_row)?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    pub fn update(&self, conn: &Connection) -> Result<(), XferoError> {
        conn.execute(
            "UPDATE av_patterns SET name = ?, command_template = ?, params = ?, infected_exit_codes = ?
            WHERE av_pattern_id = ?",
            rusqlite::params![
                self.name,
                self.command_template,
                self.params,
                self.infected_exit_codes,
                self.av_pattern_id
            ],
        )?;
        Ok(())
    }

    pub fn delete(conn: &Connection, av_pattern_id: i64) -> Result<(), XferoError> {
        conn.execute("DELETE FROM av_patterns WHERE av_pattern_id = ?", [av_pattern_id])?;
        Ok(())
    }
}

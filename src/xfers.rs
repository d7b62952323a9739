use rusqlite::{Connection, OptionalExtension, Row};

use crate::db::Database;
use crate::error::XferoError;

/// A terminal transfer action of a route, bound to a partner and a COTS
/// pattern. A route may own several.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Xfer {
    pub xfer_id: i64,
    pub route_id: i64,
    pub cots_pattern_id: i64,
    pub partner_id: i64,
    pub command: String,
    pub params: String,
    pub delete_source: bool,
}

#[derive(Clone, Debug)]
pub struct NewXfer {
    pub route_id: i64,
    pub cots_pattern_id: i64,
    pub partner_id: i64,
    pub command: String,
    pub params: String,
    pub delete_source: bool,
}

const SELECT_XFER: &str =
    "SELECT xfer_id, route_id, cots_pattern_id, partner_id, command, params, delete_source FROM xfers";

impl Xfer {
    fn from_row(row: &Row) -> rusqlite::Result<Self> {
        Ok(Xfer {
            xfer_id: row.get(0)?,
            route_id: row.get(1)?,
            cots_pattern_id: row.get(2)?,
            partner_id: row.get(3)?,
            command: row.get(4)?,
            params: row.get(5)?,
            delete_source: row.get(6)?,
        })
    }

    pub fn create(conn: &Connection, params: &NewXfer) -> Result<Self, XferoError> {
        let xfer_id: i64 = conn.query_row(
            "INSERT INTO xfers (route_id, cots_pattern_id, partner_id, command, params, delete_source)
            VALUES (?, ?, ?, ?, ?, ?)
            RETURNING xfer_id",
            rusqlite::params![
                params.route_id,
                params.cots_pattern_id,
                params.partner_id,
                params.command,
                params.params,
                params.delete_source,
            ],
            |row| row.get(0),
        )?;
        Ok(Xfer {
            xfer_id,
            route_id: params.route_id,
            cots_pattern_id: params.cots_pattern_id,
            partner_id: params.partner_id,
            command: params.command.clone(),
            params: params.params.clone(),
            delete_source: params.delete_source,
        })
    }

    pub fn get_by_id(conn: &Connection, xfer_id: i64) -> Result<Option<Self>, XferoError> {
        conn.query_row(
            &format!("{} WHERE xfer_id = ?", SELECT_XFER),
            [xfer_id],
            Xfer::from_row,
        )
        .optional()
        .map_err(XferoError::DatabaseError)
    }

    pub fn list_for_route(conn: &Connection, route_id: i64) -> Result<Vec<Self>, XferoError> {
        let mut stmt = conn.prepare(&format!(
            "{} WHERE route_id = ? ORDER BY xfer_id ASC",
            SELECT_XFER
        ))?;
        let rows = stmt.query_map([route_id], Xfer::from_row)?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    pub fn update(&self, conn: &Connection) -> Result<(), XferoError> {
        conn.execute(
            "UPDATE xfers
            SET route_id = ?, cots_pattern_id = ?, partner_id = ?, command = ?, params = ?, delete_source = ?
            WHERE xfer_id = ?",
            rusqlite::params![
                self.route_id,
                self.cots_pattern_id,
                self.partner_id,
                self.command,
                self.params,
                self.delete_source,
                self.xfer_id,
            ],
        )?;
        Ok(())
    }

    pub fn delete(conn: &Connection, xfer_id: i64) -> Result<(), XferoError> {
        conn.execute("DELETE FROM xfers WHERE xfer_id = ?", [xfer_id])?;
        Ok(())
    }
}

impl Database {
    pub fn xfers_for(&self, route_id: i64) -> Result<Vec<Xfer>, XferoError> {
        self.with_retry("xfers_for", |conn| Xfer::list_for_route(conn, route_id))
    }
}

use std::path::PathBuf;

use rusqlite::{Connection, OptionalExtension, Row};

use crate::db::Database;
use crate::error::XferoError;

/// A monitored directory, a filename pattern and a priority. Files in the
/// directory whose basename fully matches the pattern belong to the route.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Route {
    pub route_id: i64,
    pub name: String,
    pub monitored_dir: PathBuf,
    pub filename_pattern: String,
    pub active: bool,
    pub priority: i64,
}

/// Parameters for creating a new route
#[derive(Clone, Debug)]
pub struct NewRoute {
    pub name: String,
    pub monitored_dir: PathBuf,
    pub filename_pattern: String,
    pub active: bool,
    pub priority: i64,
}

impl NewRoute {
    pub fn new(
        name: &str,
        monitored_dir: impl Into<PathBuf>,
        filename_pattern: &str,
        priority: i64,
    ) -> Self {
        NewRoute {
            name: name.to_owned(),
            monitored_dir: monitored_dir.into(),
            filename_pattern: filename_pattern.to_owned(),
            active: true,
            priority,
        }
    }
}

const SELECT_ROUTE: &str = "SELECT route_id, name, monitored_dir, filename_pattern, active, priority FROM routes";

impl Route {
    fn from_row(row: &Row) -> rusqlite::Result<Self> {
        Ok(Route {
            route_id: row.get(0)?,
            name: row.get(1)?,
            monitored_dir: PathBuf::from(row.get::<_, String>(2)?),
            filename_pattern: row.get(3)?,
            active: row.get(4)?,
            priority: row.get(5)?,
        })
    }

    pub fn create(conn: &Connection, params: &NewRoute) -> Result<Self, XferoError> {
        let route_id: i64 = conn.query_row(
            "INSERT INTO routes (name, monitored_dir, filename_pattern, active, priority)
            VALUES (?, ?, ?, ?, ?)
            RETURNING route_id",
            rusqlite::params![
                params.name,
                params.monitored_dir.to_string_lossy(),
                params.filename_pattern,
                params.active,
                params.priority,
            ],
            |row| row.get(0),
        )?;

        Ok(Route {
            route_id,
            name: params.name.clone(),
            monitored_dir: params.monitored_dir.clone(),
            filename_pattern: params.filename_pattern.clone(),
            active: params.active,
            priority: params.priority,
        })
    }

    pub fn get_by_id(conn: &Connection, route_id: i64) -> Result<Option<Self>, XferoError> {
        conn.query_row(
            &format!("{} WHERE route_id = ?", SELECT_ROUTE),
            [route_id],
            Route::from_row,
        )
        .optional()
        .map_err(XferoError::DatabaseError)
    }

    pub fn list(conn: &Connection) -> Result<Vec<Self>, XferoError> {
        let mut stmt = conn.prepare(&format!("{} ORDER BY route_id ASC", SELECT_ROUTE))?;
        let rows = stmt.query_map([], Route::from_row)?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    /// Active routes, most urgent first. Ties are broken by route id so that
    /// the order is stable across scans.
    pub fn list_active_by_priority(conn: &Connection) -> Result<Vec<Self>, XferoError> {
        let mut stmt = conn.prepare(&format!(
            "{} WHERE active = 1 ORDER BY priority ASC, route_id ASC",
            SELECT_ROUTE
        ))?;
        let rows = stmt.query_map([], Route::from_row)?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    pub fn update(&self, conn: &Connection) -> Result<(), XferoError> {
        let changed = conn.execute(
            "UPDATE routes
            SET name = ?, monitored_dir = ?, filename_pattern = ?, active = ?, priority = ?
            WHERE route_id = ?",
            rusqlite::params![
                self.name,
                self.monitored_dir.to_string_lossy(),
                self.filename_pattern,
                self.active,
                self.priority,
                self.route_id,
            ],
        )?;
        if changed == 0 {
            return Err(XferoError::Error(format!("Route {} not found", self.route_id)));
        }
        Ok(())
    }

    /// Deletes the route together with its workflow items and xfers
    pub fn delete(conn: &Connection, route_id: i64) -> Result<(), XferoError> {
        conn.execute("DELETE FROM routes WHERE route_id = ?", [route_id])?;
        Ok(())
    }
}

impl Database {
    pub fn routes_active_ordered_by_priority(&self) -> Result<Vec<Route>, XferoError> {
        self.with_retry("routes_active_ordered_by_priority", |conn| {
            Route::list_active_by_priority(conn)
        })
    }
}

pub mod schema;

use std::path::{Path, PathBuf};
use std::thread;
use std::time::Duration;

use log::{info, warn};
use r2d2::{Pool, PooledConnection};
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::{Connection, OptionalExtension, Transaction, TransactionBehavior};

use crate::control::Control;
use crate::error::XferoError;
use crate::priorities::Priority;

use schema::{CREATE_SCHEMA_SQL, DEFAULT_NUM_THREADS, DROP_SCHEMA_SQL, PRIORITY_LEVELS, SCHEMA_VERSION};

pub type PooledConn = PooledConnection<SqliteConnectionManager>;

const POOL_MAX_SIZE: u32 = 16;
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);
const RETRY_ATTEMPTS: u32 = 5;
const RETRY_INITIAL_BACKOFF: Duration = Duration::from_millis(50);

/// Handle to the configuration store. Cloning is cheap; clones share the
/// connection pool.
#[derive(Clone)]
pub struct Database {
    pool: Pool<SqliteConnectionManager>,
    path: PathBuf,
}

impl Database {
    /// Opens an existing store. The schema must already be in place; it is
    /// only ever created by the explicit bootstrap action.
    pub fn open(path: &Path) -> Result<Self, XferoError> {
        if !path.is_file() {
            return Err(XferoError::SchemaMissing(format!(
                "database '{}' does not exist; run `xfero init-db --yes` first",
                path.display()
            )));
        }

        let db = Self::connect(path)?;
        let conn = db.get_connection()?;
        Self::ensure_schema(&conn)?;
        drop(conn);

        info!("Database opened at: {}", path.display());
        Ok(db)
    }

    /// Opens (creating if needed) the file without checking the schema.
    /// Used by the bootstrap path only.
    pub fn open_for_bootstrap(path: &Path) -> Result<Self, XferoError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        Self::connect(path)
    }

    fn connect(path: &Path) -> Result<Self, XferoError> {
        let manager = SqliteConnectionManager::file(path).with_init(|conn| {
            conn.execute_batch("PRAGMA foreign_keys = ON;")?;
            conn.query_row("PRAGMA journal_mode = WAL", [], |_| Ok(()))?;
            conn.busy_timeout(BUSY_TIMEOUT)
        });

        let pool = Pool::builder()
            .max_size(POOL_MAX_SIZE)
            .connection_timeout(Duration::from_secs(5))
            .build(manager)
            .map_err(|e| {
                XferoError::ConfigCorrupt(format!(
                    "unable to open database '{}': {}",
                    path.display(),
                    e
                ))
            })?;

        Ok(Database {
            pool,
            path: path.to_owned(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn get_connection(&self) -> Result<PooledConn, XferoError> {
        Ok(self.pool.get()?)
    }

    fn ensure_schema(conn: &Connection) -> Result<(), XferoError> {
        let table_exists: bool = conn
            .query_row(
                "SELECT count(*) FROM sqlite_master WHERE type='table' AND name='meta'",
                [],
                |row| row.get::<_, i32>(0),
            )
            .map(|count| count > 0)?;

        if !table_exists {
            return Err(XferoError::SchemaMissing(
                "meta table not found; run `xfero init-db --yes` first".into(),
            ));
        }

        let stored_version: Option<String> = conn
            .query_row(
                "SELECT value FROM meta WHERE key = 'schema_version'",
                [],
                |row| row.get(0),
            )
            .optional()?;

        match stored_version.as_deref() {
            Some(SCHEMA_VERSION) => Ok(()),
            Some(other) => Err(XferoError::ConfigCorrupt(format!(
                "schema version mismatch: found {}, expected {}",
                other, SCHEMA_VERSION
            ))),
            None => Err(XferoError::SchemaMissing("schema version missing".into())),
        }
    }

    /// Drops and recreates the whole schema, then seeds the priority levels
    /// and the control row. Destroys all configuration.
    pub fn bootstrap_schema(&self) -> Result<(), XferoError> {
        let conn = self.get_connection()?;
        Self::immediate_transaction(&conn, |conn| {
            conn.execute_batch(DROP_SCHEMA_SQL)?;
            conn.execute_batch(CREATE_SCHEMA_SQL)?;
            for level in 1..=PRIORITY_LEVELS {
                Priority::create(conn, level, &format!("Priority {}", level))?;
            }
            Control::ensure_row(conn, DEFAULT_NUM_THREADS)
        })?;
        warn!("Schema bootstrapped at {}", self.path.display());
        Ok(())
    }

    /// Runs `func` inside a `BEGIN IMMEDIATE` transaction, committing on
    /// success and rolling back on error. Immediate transactions take the
    /// write lock up front, which serializes writers.
    pub fn immediate_transaction<T, F>(conn: &Connection, func: F) -> Result<T, XferoError>
    where
        F: FnOnce(&Connection) -> Result<T, XferoError>,
    {
        let tx = Transaction::new_unchecked(conn, TransactionBehavior::Immediate)?;
        let value = func(&tx)?;
        tx.commit()?;
        Ok(value)
    }

    /// Runs `func` on a pooled connection, retrying busy/locked failures with
    /// bounded exponential backoff. Other errors are returned immediately.
    pub fn with_retry<T, F>(&self, op_name: &str, mut func: F) -> Result<T, XferoError>
    where
        F: FnMut(&Connection) -> Result<T, XferoError>,
    {
        let mut backoff = RETRY_INITIAL_BACKOFF;
        let mut attempt = 1;
        loop {
            let conn = self.get_connection()?;
            match func(&conn) {
                Err(e) if e.is_transient() && attempt < RETRY_ATTEMPTS => {
                    warn!(
                        "{}: database busy (attempt {}/{}), retrying in {:?}",
                        op_name, attempt, RETRY_ATTEMPTS, backoff
                    );
                    drop(conn);
                    thread::sleep(backoff);
                    backoff *= 2;
                    attempt += 1;
                }
                result => return result,
            }
        }
    }

    /// SQLite VACUUM. Atomic from SQLite's perspective.
    pub fn compact(&self) -> Result<(), XferoError> {
        let conn = self.get_connection()?;
        conn.execute_batch("VACUUM")?;
        info!("Database compacted");
        Ok(())
    }

    /// Row counts per table, for the stats task
    pub fn table_counts(&self) -> Result<Vec<(&'static str, i64)>, XferoError> {
        const TABLES: [&str; 8] = [
            "routes",
            "workflow_items",
            "xfers",
            "partners",
            "cots_patterns",
            "av_patterns",
            "scheduled_tasks",
            "priorities",
        ];
        let conn = self.get_connection()?;
        let mut counts = Vec::with_capacity(TABLES.len());
        for table in TABLES {
            let count: i64 =
                conn.query_row(&format!("SELECT count(*) FROM {}", table), [], |row| row.get(0))?;
            counts.push((table, count));
        }
        Ok(counts)
    }
}

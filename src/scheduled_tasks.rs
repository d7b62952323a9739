use rusqlite::{Connection, OptionalExtension, Row};

use crate::db::Database;
use crate::error::XferoError;

/// A time-triggered task. Each trigger field is a cron-like expression or
/// `None` for "any".
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ScheduledTask {
    pub scheduled_task_id: i64,
    pub name: String,
    pub function_kind: String,
    pub year: Option<String>,
    pub month: Option<String>,
    pub day: Option<String>,
    pub week: Option<String>,
    pub day_of_week: Option<String>,
    pub hour: Option<String>,
    pub minute: Option<String>,
    pub second: Option<String>,
    pub args: String,
    pub active: bool,
}

const SELECT_TASK: &str = "SELECT scheduled_task_id, name, function_kind, year, month, day, week,
    day_of_week, hour, minute, second, args, active FROM scheduled_tasks";

impl ScheduledTask {
    /// An active task with every trigger field wildcarded
    pub fn new(name: &str, function_kind: &str) -> Self {
        ScheduledTask {
            name: name.to_owned(),
            function_kind: function_kind.to_owned(),
            active: true,
            ..Default::default()
        }
    }

    fn from_row(row: &Row) -> rusqlite::Result<Self> {
        Ok(ScheduledTask {
            scheduled_task_id: row.get(0)?,
            name: row.get(1)?,
            function_kind: row.get(2)?,
            year: row.get(3)?,
            month: row.get(4)?,
            day: row.get(5)?,
            week: row.get(6)?,
            day_of_week: row.get(7)?,
            hour: row.get(8)?,
            minute: row.get(9)?,
            second: row.get(10)?,
            args: row.get(11)?,
            active: row.get(12)?,
        })
    }

    /// Inserts `task` (its id is ignored) and returns the stored row
    pub fn create(conn: &Connection, task: &ScheduledTask) -> Result<Self, XferoError> {
        let scheduled_task_id: i64 = conn.query_row(
            "INSERT INTO scheduled_tasks (
                name, function_kind, year, month, day, week, day_of_week, hour, minute, second,
                args, active
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            RETURNING scheduled_task_id",
            rusqlite::params![
                task.name,
                task.function_kind,
                task.year,
                task.month,
                task.day,
                task.week,
                task.day_of_week,
                task.hour,
                task.minute,
                task.second,
                task.args,
                task.active,
            ],
            |row| row.get(0),
        )?;
        Ok(ScheduledTask {
            scheduled_task_id,
            ..task.clone()
        })
    }

    pub fn get_by_id(conn: &Connection, scheduled_task_id: i64) -> Result<Option<Self>, XferoError> {
        conn.query_row(
            &format!("{} WHERE scheduled_task_id = ?", SELECT_TASK),
            [scheduled_task_id],
            ScheduledTask::from_row,
        )
        .optional()
        .map_err(XferoError::DatabaseError)
    }

    pub fn list(conn: &Connection) -> Result<Vec<Self>, XferoError> {
        let mut stmt = conn.prepare(&format!("{} ORDER BY scheduled_task_id ASC", SELECT_TASK))?;
        let rows = stmt.query_map([], ScheduledTask::from_row)?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    pub fn list_active(conn: &Connection) -> Result<Vec<Self>, XferoError> {
        let mut stmt = conn.prepare(&format!(
            "{} WHERE active = 1 ORDER BY scheduled_task_id ASC",
            SELECT_TASK
        ))?;
        let rows = stmt.query_map([], ScheduledTask::from_row)?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    pub fn update(&self, conn: &Connection) -> Result<(), XferoError> {
        let changed = conn.execute(
            "UPDATE scheduled_tasks SET
                name = ?, function_kind = ?, year = ?, month = ?, day = ?, week = ?,
                day_of_week = ?, hour = ?, minute = ?, second = ?, args = ?, active = ?
            WHERE scheduled_task_id = ?",
            rusqlite::params![
                self.name,
                self.function_kind,
                self.year,
                self.month,
                self.day,
                self.week,
                self.day_of_week,
                self.hour,
                self.minute,
                self.second,
                self.args,
                self.active,
                self.scheduled_task_id,
            ],
        )?;
        if changed == 0 {
            return Err(XferoError::Error(format!(
                "Scheduled task {} not found",
                self.scheduled_task_id
            )));
        }
        Ok(())
    }

    pub fn delete(conn: &Connection, scheduled_task_id: i64) -> Result<(), XferoError> {
        conn.execute(
            "DELETE FROM scheduled_tasks WHERE scheduled_task_id = ?",
            [scheduled_task_id],
        )?;
        Ok(())
    }
}

impl Database {
    pub fn scheduled_tasks_active(&self) -> Result<Vec<ScheduledTask>, XferoError> {
        self.with_retry("scheduled_tasks_active", |conn| ScheduledTask::list_active(conn))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::test_support::scratch_db;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_only_active_tasks_listed() {
        let (_dir, db) = scratch_db();
        let conn = db.get_connection().unwrap();

        let mut purge = ScheduledTask::new("purge", "housekeeping.purge");
        purge.minute = Some("5".into());
        purge.args = r#"{"dir":"/tmp/x","pattern":"^old_","days":1}"#.into();
        let purge = ScheduledTask::create(&conn, &purge).unwrap();

        let mut stats = ScheduledTask::new("stats", "stats.collect");
        stats.active = false;
        let mut stats = ScheduledTask::create(&conn, &stats).unwrap();
        drop(conn);

        assert_eq!(db.scheduled_tasks_active().unwrap(), vec![purge.clone()]);

        let conn = db.get_connection().unwrap();
        stats.active = true;
        stats.update(&conn).unwrap();
        drop(conn);
        assert_eq!(db.scheduled_tasks_active().unwrap().len(), 2);

        let conn = db.get_connection().unwrap();
        ScheduledTask::delete(&conn, purge.scheduled_task_id).unwrap();
        assert_eq!(ScheduledTask::list(&conn).unwrap(), vec![stats]);
    }

    #[test]
    fn test_null_fields_round_through_store() {
        let (_dir, db) = scratch_db();
        let conn = db.get_connection().unwrap();
        let stored = ScheduledTask::create(&conn, &ScheduledTask::new("t", "stats.collect")).unwrap();
        let fetched = ScheduledTask::get_by_id(&conn, stored.scheduled_task_id)
            .unwrap()
            .unwrap();
        assert!(fetched.minute.is_none() && fetched.year.is_none());
        assert_eq!(fetched, stored);
    }
}

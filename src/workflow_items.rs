use rusqlite::{Connection, OptionalExtension, Row};

use crate::db::Database;
use crate::error::XferoError;

/// One ordered step in a route's processing chain
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct WorkflowItem {
    pub workflow_item_id: i64,
    pub route_id: i64,
    pub step_kind: String,
    pub function_call: String,
    pub args: String,
    pub running_order: i64,
}

#[derive(Clone, Debug)]
pub struct NewWorkflowItem {
    pub route_id: i64,
    pub step_kind: String,
    pub function_call: String,
    pub args: String,
    pub running_order: i64,
}

impl NewWorkflowItem {
    pub fn new(route_id: i64, step_kind: &str, running_order: i64) -> Self {
        NewWorkflowItem {
            route_id,
            step_kind: step_kind.to_owned(),
            function_call: String::new(),
            args: String::new(),
            running_order,
        }
    }

    pub fn with_args(mut self, args: &str) -> Self {
        self.args = args.to_owned();
        self
    }

    pub fn with_function_call(mut self, function_call: &str) -> Self {
        self.function_call = function_call.to_owned();
        self
    }
}

const SELECT_ITEM: &str = "SELECT workflow_item_id, route_id, step_kind, function_call, args, running_order FROM workflow_items";

impl WorkflowItem {
    fn from_row(row: &Row) -> rusqlite::Result<Self> {
        Ok(WorkflowItem {
            workflow_item_id: row.get(0)?,
            route_id: row.get(1)?,
            step_kind: row.get(2)?,
            function_call: row.get(3)?,
            args: row.get(4)?,
            running_order: row.get(5)?,
        })
    }

    /// The name this item is looked up under in the step registry:
    /// `step_kind`, or `step_kind.function_call` when a function is named.
    pub fn registry_key(&self) -> String {
        if self.function_call.trim().is_empty() {
            self.step_kind.clone()
        } else {
            format!("{}.{}", self.step_kind, self.function_call.trim())
        }
    }

    pub fn create(conn: &Connection, params: &NewWorkflowItem) -> Result<Self, XferoError> {
        let workflow_item_id: i64 = conn.query_row(
            "INSERT INTO workflow_items (route_id, step_kind, function_call, args, running_order)
            VALUES (?, ?, ?, ?, ?)
            RETURNING workflow_item_id",
            rusqlite::params![
                params.route_id,
                params.step_kind,
                params.function_call,
                params.args,
                params.running_order,
            ],
            |row| row.get(0),
        )?;

        Ok(WorkflowItem {
            workflow_item_id,
            route_id: params.route_id,
            step_kind: params.step_kind.clone(),
            function_call: params.function_call.clone(),
            args: params.args.clone(),
            running_order: params.running_order,
        })
    }

    pub fn get_by_id(conn: &Connection, workflow_item_id: i64) -> Result<Option<Self>, XferoError> {
        conn.query_row(
            &format!("{} WHERE workflow_item_id = ?", SELECT_ITEM),
            [workflow_item_id],
            WorkflowItem::from_row,
        )
        .optional()
        .map_err(XferoError::DatabaseError)
    }

    /// Items of a route in execution order: `running_order`, then id.
    /// Gaps in `running_order` are allowed.
    pub fn list_for_route(conn: &Connection, route_id: i64) -> Result<Vec<Self>, XferoError> {
        let mut stmt = conn.prepare(&format!(
            "{} WHERE route_id = ? ORDER BY running_order ASC, workflow_item_id ASC",
            SELECT_ITEM
        ))?;
        let rows = stmt.query_map([route_id], WorkflowItem::from_row)?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    pub fn update(&self, conn: &Connection) -> Result<(), XferoError> {
        let changed = conn.execute(
            "UPDATE workflow_items
            SET route_id = ?, step_kind = ?, function_call = ?, args = ?, running_order = ?
            WHERE workflow_item_id = ?",
            rusqlite::params![
                self.route_id,
                self.step_kind,
                self.function_call,
                self.args,
                self.running_order,
                self.workflow_item_id,
            ],
        )?;
        if changed == 0 {
            return Err(XferoError::Error(format!(
                "Workflow item {} not found",
                self.workflow_item_id
            )));
        }
        Ok(())
    }

    pub fn delete(conn: &Connection, workflow_item_id: i64) -> Result<(), XferoError> {
        conn.execute(
            "DELETE FROM workflow_items WHERE workflow_item_id = ?",
            [workflow_item_id],
        )?;
        Ok(())
    }
}

impl Database {
    pub fn workflow_items_for(&self, route_id: i64) -> Result<Vec<WorkflowItem>, XferoError> {
        self.with_retry("workflow_items_for", |conn| {
            WorkflowItem::list_for_route(conn, route_id)
        })
    }
}

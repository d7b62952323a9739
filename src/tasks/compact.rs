use std::time::{Duration, Instant};

use log::info;
use serde_json::Value;

use crate::error::XferoError;
use crate::registry::{ScheduledTaskFn, TaskContext};
use crate::utils::Utils;

/// Runs SQLite VACUUM on the configuration store.
///
/// VACUUM is atomic from SQLite's perspective: it either completes fully or
/// rolls back, so the task is never interrupted mid-way. A helper thread runs
/// the VACUUM while this one logs elapsed time for long compactions.
pub struct CompactDatabaseTask;

const PROGRESS_EVERY: Duration = Duration::from_secs(30);

impl ScheduledTaskFn for CompactDatabaseTask {
    fn run(&self, _args: &Value, ctx: &TaskContext) -> Result<(), XferoError> {
        let db = ctx.db.clone();
        let handle = std::thread::spawn(move || db.compact());
        let start = Instant::now();
        let mut next_report = PROGRESS_EVERY;

        loop {
            if handle.is_finished() {
                return handle
                    .join()
                    .map_err(|_| XferoError::Error("compaction thread panicked".into()))?;
            }
            if start.elapsed() >= next_report {
                info!(
                    "Task '{}': compacting, elapsed {}",
                    ctx.task_name,
                    Utils::format_elapsed(start.elapsed())
                );
                next_report += PROGRESS_EVERY;
            }
            std::thread::sleep(Duration::from_millis(100));
        }
    }
}

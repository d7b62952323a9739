use std::fs;
use std::path::Path;

use log::{info, warn};
use serde_json::Value;

use crate::error::XferoError;
use crate::registry::{ScheduledTaskFn, TaskContext};

/// Logs how many files sit in each working directory and how many rows each
/// configuration table holds.
pub struct StatsTask;

impl StatsTask {
    /// Regular files under `dir`, recursively. A missing directory counts as
    /// empty.
    pub fn count_files(dir: &Path) -> usize {
        let entries = match fs::read_dir(dir) {
            Ok(entries) => entries,
            Err(_) => return 0,
        };
        entries
            .filter_map(Result::ok)
            .map(|entry| match entry.file_type() {
                Ok(ft) if ft.is_dir() => Self::count_files(&entry.path()),
                Ok(ft) if ft.is_file() => 1,
                _ => 0,
            })
            .sum()
    }
}

impl ScheduledTaskFn for StatsTask {
    fn run(&self, _args: &Value, ctx: &TaskContext) -> Result<(), XferoError> {
        let settings = &ctx.config.settings;
        for (label, dir) in [
            ("transient", &settings.transient_directory),
            ("outbound", &settings.outbound_directory),
            ("error", &settings.error_directory),
        ] {
            info!("Stats: {} files in {} ({})", Self::count_files(dir), label, dir.display());
        }

        match ctx.db.table_counts() {
            Ok(counts) => {
                let summary = counts
                    .iter()
                    .map(|(table, count)| format!("{}={}", table, count))
                    .collect::<Vec<_>>()
                    .join(", ");
                info!("Stats: {}", summary);
            }
            Err(e) => warn!("Stats: unable to count rows: {}", e),
        }

        let control = ctx.db.control()?;
        info!("Stats: control {} with {} worker(s)", control.status, control.num_threads);
        Ok(())
    }
}

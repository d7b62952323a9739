use std::fs;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use log::{info, warn};
use regex::Regex;
use serde::Deserialize;
use serde_json::Value;

use crate::error::XferoError;
use crate::fs_lock::LockStyle;
use crate::registry::{args_as, ScheduledTaskFn, TaskContext};

const SECS_PER_DAY: f64 = 86_400.0;

#[derive(Debug, Deserialize)]
struct PurgeArgs {
    dir: PathBuf,
    /// Regex searched for in the basename; anchor it to match whole names
    pattern: String,
    /// Minimum age in days; fractions allowed
    days: f64,
}

/// Removes regular files in `dir` (non-recursive) whose basename matches
/// `pattern` and whose modification time is older than `days`. Lock
/// sentinels are never touched.
pub struct PurgeTask;

impl PurgeTask {
    pub fn purge(dir: &Path, pattern: &str, max_age: Duration) -> Result<usize, XferoError> {
        let regex = Regex::new(pattern)?;
        let cutoff = SystemTime::now()
            .checked_sub(max_age)
            .unwrap_or(SystemTime::UNIX_EPOCH);

        let mut removed = 0;
        for entry in fs::read_dir(dir)? {
            let entry = entry?;
            let name = entry.file_name().to_string_lossy().into_owned();
            if LockStyle::is_sentinel_name(&name) || !regex.is_match(&name) {
                continue;
            }
            let metadata = match entry.metadata() {
                Ok(m) if m.is_file() => m,
                _ => continue,
            };
            let modified = metadata.modified()?;
            if modified > cutoff {
                continue;
            }
            match fs::remove_file(entry.path()) {
                Ok(()) => removed += 1,
                Err(e) => warn!("Purge: failed to remove {}: {}", entry.path().display(), e),
            }
        }
        Ok(removed)
    }
}

impl ScheduledTaskFn for PurgeTask {
    fn run(&self, args: &Value, ctx: &TaskContext) -> Result<(), XferoError> {
        let args: PurgeArgs = args_as(args).map_err(|e| XferoError::Error(e.to_string()))?;
        if !args.days.is_finite() || args.days < 0.0 {
            return Err(XferoError::Error(format!(
                "housekeeping.purge: days must be non-negative, got {}",
                args.days
            )));
        }
        let max_age = Duration::from_secs_f64(args.days * SECS_PER_DAY);
        let removed = Self::purge(&args.dir, &args.pattern, max_age)?;
        info!(
            "Task '{}': purged {} file(s) from {}",
            ctx.task_name,
            removed,
            args.dir.display()
        );
        Ok(())
    }
}

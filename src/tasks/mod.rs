//! Standard scheduled tasks

mod compact;
mod housekeeping;
mod stats;

pub use compact::CompactDatabaseTask;
pub use housekeeping::PurgeTask;
pub use stats::StatsTask;

use crate::registry::StepRegistry;

pub fn register_defaults(registry: &mut StepRegistry) {
    registry
        .register_task("housekeeping.purge", PurgeTask)
        .register_task("stats.collect", StatsTask)
        .register_task("database.compact", CompactDatabaseTask);
}

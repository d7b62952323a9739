use std::path::Path;
use std::time::Duration;

use log::{info, warn};
use serde::Deserialize;
use serde_json::Value;

use super::command::{self, Placeholders};
use crate::patterns::AvPattern;
use crate::registry::{args_as, Step, StepContext, StepError, StepResult};
use crate::utils::Utils;

#[derive(Debug, Deserialize)]
struct AvScanArgs {
    /// Name of the AV_Pattern to run
    pattern: String,
    timeout_secs: Option<u64>,
}

/// Runs the scanner described by an AV pattern. Exit code 0 is clean, a code
/// listed in the pattern's `infected_exit_codes` quarantines the file and
/// anything else is a step failure.
pub struct AvScanStep;

impl Step for AvScanStep {
    fn run(&self, path: &Path, args: &Value, ctx: &StepContext) -> Result<StepResult, StepError> {
        let args: AvScanArgs = args_as(args)?;
        let conn = ctx.db.get_connection()?;
        let pattern = AvPattern::get_by_name(&conn, &args.pattern)?.ok_or_else(|| {
            StepError::InvalidArgs(format!("av.scan: unknown AV pattern '{}'", args.pattern))
        })?;
        drop(conn);

        if !path.exists() {
            return Err(StepError::FileVanished(path.to_owned()));
        }

        let placeholders = Placeholders::new()
            .set("FileName", path.to_string_lossy())
            .set("BaseName", Utils::file_name(path))
            .set("Params", pattern.params.as_str());
        let argv = command::build_argv(&pattern.command_template, &[], &placeholders);
        let outcome = command::run(
            &argv,
            args.timeout_secs.map(Duration::from_secs),
            &ctx.correlation,
        )?;

        match outcome.code() {
            Some(0) => {
                info!("[{}] {} clean ({})", ctx.correlation, Utils::file_name(path), pattern.name);
                Ok(StepResult::proceed(path))
            }
            Some(code) if pattern.infected_codes().contains(&code) => {
                warn!("[{}] {} flagged by {}", ctx.correlation, Utils::file_name(path), pattern.name);
                Ok(StepResult::quarantine(
                    path,
                    format!("infected ({} exit code {})", pattern.name, code),
                ))
            }
            _ => Err(StepError::Failed(format!(
                "scanner '{}' {}",
                pattern.name,
                outcome.describe()
            ))),
        }
    }
}

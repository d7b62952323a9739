use std::path::Path;
use std::time::Duration;

use log::info;
use serde::Deserialize;
use serde_json::Value;

use super::command::{self, Placeholders};
use crate::registry::{args_as, Step, StepContext, StepError, StepResult};
use crate::utils::Utils;

#[derive(Debug, Deserialize)]
struct ExitArgs {
    command: String,
    #[serde(default)]
    args: Vec<String>,
    timeout_secs: Option<u64>,
}

/// Invokes an external command against the file and waits for it. A
/// non-zero exit or a timeout quarantines the file.
///
/// Recognised placeholders: `{FileName}` (full path), `{BaseName}`,
/// `{Correlation}`.
pub struct ExitStep;

impl Step for ExitStep {
    fn run(&self, path: &Path, args: &Value, ctx: &StepContext) -> Result<StepResult, StepError> {
        let args: ExitArgs = args_as(args)?;
        if !path.exists() {
            return Err(StepError::FileVanished(path.to_owned()));
        }

        let placeholders = Placeholders::new()
            .set("FileName", path.to_string_lossy())
            .set("BaseName", Utils::file_name(path))
            .set("Correlation", ctx.correlation.as_str());
        let argv = command::build_argv(&args.command, &args.args, &placeholders);
        let outcome = command::run(
            &argv,
            args.timeout_secs.map(Duration::from_secs),
            &ctx.correlation,
        )?;

        if outcome.success() {
            info!("[{}] '{}' completed", ctx.correlation, args.command);
            Ok(StepResult::proceed(path))
        } else {
            Ok(StepResult::quarantine(
                path,
                format!("'{}' failed: {}", args.command, outcome.describe()),
            ))
        }
    }
}

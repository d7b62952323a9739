use std::fs;
use std::path::{Path, PathBuf};

use log::debug;
use regex::Regex;
use serde::Deserialize;
use serde_json::Value;

use crate::registry::{args_as, Step, StepContext, StepError, StepResult};
use crate::utils::Utils;

#[derive(Debug, Default, Deserialize)]
struct CopyArgs {
    /// Directory for the copy; beside the file when absent
    target: Option<PathBuf>,
}

/// Leaves the file where it is and writes a copy named
/// `<basename>_YYYYmmddHHMMSS`
pub struct CopyStep;

impl Step for CopyStep {
    fn run(&self, path: &Path, args: &Value, ctx: &StepContext) -> Result<StepResult, StepError> {
        let args: CopyArgs = args_as(args)?;
        let name = format!("{}{}", Utils::file_name(path), Utils::copy_timestamp());
        let dir = match args.target {
            Some(target) => {
                fs::create_dir_all(&target)?;
                target
            }
            None => path.parent().map(Path::to_path_buf).unwrap_or_default(),
        };
        let copy = Utils::unique_destination(&dir, &name);
        fs::copy(path, &copy).map_err(|e| StepError::from_io(path, e))?;
        debug!("[{}] Copied to {}", ctx.correlation, copy.display());
        Ok(StepResult::proceed(path).with_metadata(serde_json::json!({
            "copy": copy.to_string_lossy()
        })))
    }
}

#[derive(Debug, Deserialize)]
struct MoveArgs {
    target: PathBuf,
}

/// Moves the file into the `target` directory, keeping its basename. An
/// existing file of the same name is replaced.
pub struct MoveStep;

impl Step for MoveStep {
    fn run(&self, path: &Path, args: &Value, ctx: &StepContext) -> Result<StepResult, StepError> {
        let args: MoveArgs = args_as(args)?;
        if args.target.as_os_str().is_empty() {
            return Err(StepError::InvalidArgs("move: 'target' is empty".into()));
        }
        let destination = args.target.join(Utils::file_name(path));
        Utils::move_file(path, &destination).map_err(|e| StepError::from_io(path, e))?;
        debug!("[{}] Moved to {}", ctx.correlation, destination.display());
        Ok(StepResult::proceed(destination))
    }
}

#[derive(Debug, Deserialize)]
struct RenameArgs {
    pattern: String,
    replacement: String,
}

/// Renames the file in place. `pattern` is a regex applied to the basename;
/// `replacement` may use `$1`-style group references and `{Timestamp}`.
/// A basename the pattern does not match is left unchanged.
pub struct RenameStep;

impl RenameStep {
    fn new_name(args: &RenameArgs, name: &str) -> Result<Option<String>, StepError> {
        let regex = Regex::new(&args.pattern)
            .map_err(|e| StepError::InvalidArgs(format!("rename: {}", e)))?;
        if !regex.is_match(name) {
            return Ok(None);
        }
        let replacement = args.replacement.replace("{Timestamp}", &Utils::file_timestamp());
        let renamed = regex.replace_all(name, replacement.as_str()).into_owned();
        if renamed.is_empty() || renamed.contains('/') || renamed == "." || renamed == ".." {
            return Err(StepError::InvalidArgs(format!(
                "rename: '{}' is not a valid file name",
                renamed
            )));
        }
        Ok(Some(renamed))
    }
}

impl Step for RenameStep {
    fn run(&self, path: &Path, args: &Value, ctx: &StepContext) -> Result<StepResult, StepError> {
        let args: RenameArgs = args_as(args)?;
        let name = Utils::file_name(path);
        let renamed = match Self::new_name(&args, &name)? {
            Some(renamed) if renamed != name => renamed,
            _ => {
                if !path.exists() {
                    return Err(StepError::FileVanished(path.to_owned()));
                }
                return Ok(StepResult::proceed(path));
            }
        };
        let target = path.with_file_name(&renamed);
        fs::rename(path, &target).map_err(|e| StepError::from_io(path, e))?;
        debug!("[{}] Renamed {} -> {}", ctx.correlation, name, renamed);
        Ok(StepResult::proceed(target))
    }
}

//! Explicit registration of the code that workflow items and scheduled tasks
//! name by string. Workflow steps and scheduled tasks live in separate
//! namespaces.

use std::collections::HashMap;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde_json::Value;
use thiserror::Error;

use crate::config::Config;
use crate::db::Database;
use crate::error::XferoError;
use crate::partners::Partner;
use crate::xfers::Xfer;

/// What the executor should do after a step returns
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepOutcome {
    Continue,
    HaltSuccess,
    HaltQuarantine,
}

#[derive(Debug, Clone, PartialEq)]
pub struct StepResult {
    /// The file as it stands after the step. Steps that rename or move the
    /// file return its new location.
    pub next_path: PathBuf,
    pub outcome: StepOutcome,
    pub metadata: Option<Value>,
}

impl StepResult {
    pub fn proceed(next_path: impl Into<PathBuf>) -> Self {
        StepResult {
            next_path: next_path.into(),
            outcome: StepOutcome::Continue,
            metadata: None,
        }
    }

    pub fn halt_success(next_path: impl Into<PathBuf>) -> Self {
        StepResult {
            next_path: next_path.into(),
            outcome: StepOutcome::HaltSuccess,
            metadata: None,
        }
    }

    /// Quarantine with a human-readable reason, kept under `metadata.reason`
    pub fn quarantine(next_path: impl Into<PathBuf>, reason: impl Into<String>) -> Self {
        StepResult {
            next_path: next_path.into(),
            outcome: StepOutcome::HaltQuarantine,
            metadata: Some(serde_json::json!({ "reason": reason.into() })),
        }
    }

    pub fn with_metadata(mut self, metadata: Value) -> Self {
        self.metadata = Some(metadata);
        self
    }

    pub fn reason(&self) -> Option<&str> {
        self.metadata.as_ref()?.get("reason")?.as_str()
    }
}

#[derive(Error, Debug)]
pub enum StepError {
    #[error("File vanished: {}", .0.display())]
    FileVanished(PathBuf),

    #[error("Invalid step arguments: {0}")]
    InvalidArgs(String),

    #[error("Step failed: {0}")]
    Failed(String),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("Database error: {0}")]
    Database(#[from] XferoError),
}

impl StepError {
    /// Classifies an I/O error on `path`: a missing file means somebody
    /// removed it underneath the workflow.
    pub fn from_io(path: &Path, err: io::Error) -> Self {
        if err.kind() == io::ErrorKind::NotFound {
            StepError::FileVanished(path.to_owned())
        } else {
            StepError::Io(err)
        }
    }
}

/// Everything a step may need beyond the file itself. Built by the executor
/// once per workflow run.
#[derive(Clone)]
pub struct StepContext {
    pub correlation: String,
    pub route_id: i64,
    /// This run's private directory under the transient root
    pub transient_dir: PathBuf,
    pub outbound_dir: PathBuf,
    pub error_dir: PathBuf,
    /// Set for `transfer` invocations only
    pub partner: Option<Partner>,
    pub xfer: Option<Xfer>,
    pub db: Database,
}

/// A workflow step. Implementations must leave the file at the returned
/// `next_path` whatever the outcome.
pub trait Step: Send + Sync {
    fn run(&self, path: &Path, args: &Value, ctx: &StepContext) -> Result<StepResult, StepError>;
}

struct FnStep<F>(F);

impl<F> Step for FnStep<F>
where
    F: Fn(&Path, &Value, &StepContext) -> Result<StepResult, StepError> + Send + Sync,
{
    fn run(&self, path: &Path, args: &Value, ctx: &StepContext) -> Result<StepResult, StepError> {
        (self.0)(path, args, ctx)
    }
}

pub struct TaskContext {
    pub task_id: i64,
    pub task_name: String,
    pub config: Arc<Config>,
    pub db: Database,
}

pub trait ScheduledTaskFn: Send + Sync {
    fn run(&self, args: &Value, ctx: &TaskContext) -> Result<(), XferoError>;
}

struct FnTask<F>(F);

impl<F> ScheduledTaskFn for FnTask<F>
where
    F: Fn(&Value, &TaskContext) -> Result<(), XferoError> + Send + Sync,
{
    fn run(&self, args: &Value, ctx: &TaskContext) -> Result<(), XferoError> {
        (self.0)(args, ctx)
    }
}

#[derive(Default, Clone)]
pub struct StepRegistry {
    steps: HashMap<String, Arc<dyn Step>>,
    tasks: HashMap<String, Arc<dyn ScheduledTaskFn>>,
}

impl StepRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// A registry holding the standard workflow steps and scheduled tasks
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        crate::steps::register_defaults(&mut registry);
        crate::tasks::register_defaults(&mut registry);
        registry
    }

    /// Registers `step` under `key`, replacing any earlier registration
    pub fn register_step(&mut self, key: &str, step: impl Step + 'static) -> &mut Self {
        self.steps.insert(key.to_owned(), Arc::new(step));
        self
    }

    pub fn register_step_fn<F>(&mut self, key: &str, step: F) -> &mut Self
    where
        F: Fn(&Path, &Value, &StepContext) -> Result<StepResult, StepError> + Send + Sync + 'static,
    {
        self.register_step(key, FnStep(step))
    }

    pub fn register_task(&mut self, kind: &str, task: impl ScheduledTaskFn + 'static) -> &mut Self {
        self.tasks.insert(kind.to_owned(), Arc::new(task));
        self
    }

    pub fn register_task_fn<F>(&mut self, kind: &str, task: F) -> &mut Self
    where
        F: Fn(&Value, &TaskContext) -> Result<(), XferoError> + Send + Sync + 'static,
    {
        self.register_task(kind, FnTask(task))
    }

    pub fn step(&self, key: &str) -> Option<Arc<dyn Step>> {
        self.steps.get(key).cloned()
    }

    pub fn task(&self, kind: &str) -> Option<Arc<dyn ScheduledTaskFn>> {
        self.tasks.get(kind).cloned()
    }

    pub fn step_keys(&self) -> Vec<&str> {
        let mut keys: Vec<&str> = self.steps.keys().map(String::as_str).collect();
        keys.sort_unstable();
        keys
    }

    pub fn task_kinds(&self) -> Vec<&str> {
        let mut kinds: Vec<&str> = self.tasks.keys().map(String::as_str).collect();
        kinds.sort_unstable();
        kinds
    }
}

/// Parses a stored argument blob. Empty text is an empty object.
pub fn parse_args(text: &str) -> Result<Value, StepError> {
    if text.trim().is_empty() {
        return Ok(Value::Object(Default::default()));
    }
    let value: Value =
        serde_json::from_str(text).map_err(|e| StepError::InvalidArgs(e.to_string()))?;
    if !value.is_object() {
        return Err(StepError::InvalidArgs(format!(
            "expected a JSON object, got '{}'",
            text
        )));
    }
    Ok(value)
}

/// Deserializes step or task arguments into a typed settings struct
pub fn args_as<T: DeserializeOwned>(args: &Value) -> Result<T, StepError> {
    T::deserialize(args).map_err(|e| StepError::InvalidArgs(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[test]
    fn test_defaults_cover_standard_kinds() {
        let registry = StepRegistry::with_defaults();
        for key in [
            "case.lower",
            "case.upper",
            "line_end.dos2unix",
            "line_end.unix2dos",
            "copy",
            "move",
            "rename",
            "exit",
            "av.scan",
            "transfer",
        ] {
            assert!(registry.step(key).is_some(), "missing step {}", key);
        }
        for kind in ["housekeeping.purge", "stats.collect", "database.compact"] {
            assert!(registry.task(kind).is_some(), "missing task {}", kind);
        }
        assert!(registry.step("does_not_exist").is_none());
        assert!(registry.task("case.lower").is_none());
    }

    #[test]
    fn test_closure_registration_replaces() {
        let mut registry = StepRegistry::new();
        registry.register_step_fn("noop", |p, _, _| Ok(StepResult::proceed(p)));
        registry.register_step_fn("noop", |p, _, _| Ok(StepResult::halt_success(p)));
        assert_eq!(registry.step_keys(), vec!["noop"]);
    }

    #[test]
    fn test_parse_args() {
        assert_eq!(parse_args("").unwrap(), serde_json::json!({}));
        assert_eq!(
            parse_args(r#"{"target":"/out"}"#).unwrap()["target"],
            "/out"
        );
        assert!(matches!(parse_args("[1]"), Err(StepError::InvalidArgs(_))));
        assert!(matches!(parse_args("{nope"), Err(StepError::InvalidArgs(_))));
    }

    #[test]
    fn test_args_as_typed() {
        #[derive(Deserialize)]
        struct MoveArgs {
            target: String,
        }
        let args = parse_args(r#"{"target":"/out"}"#).unwrap();
        assert_eq!(args_as::<MoveArgs>(&args).unwrap().target, "/out");
        assert!(args_as::<MoveArgs>(&serde_json::json!({})).is_err());
    }

    #[test]
    fn test_quarantine_reason() {
        let r = StepResult::quarantine("/x", "infected");
        assert_eq!(r.outcome, StepOutcome::HaltQuarantine);
        assert_eq!(r.reason(), Some("infected"));
        assert_eq!(StepResult::proceed("/x").reason(), None);
    }

    #[test]
    fn test_from_io_classifies_not_found() {
        let err = StepError::from_io(Path::new("/gone"), io::Error::from(io::ErrorKind::NotFound));
        assert!(matches!(err, StepError::FileVanished(_)));
        let err = StepError::from_io(
            Path::new("/x"),
            io::Error::from(io::ErrorKind::PermissionDenied),
        );
        assert!(matches!(err, StepError::Io(_)));
    }
}

//! External command invocation shared by the `exit`, `av.scan` and
//! `transfer` steps.

use std::collections::HashMap;
use std::process::{Command, ExitStatus, Stdio};
use std::thread;
use std::time::{Duration, Instant};

use log::{debug, warn};

use crate::registry::StepError;

const POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Values substituted into `{Placeholder}` tokens of a command template
#[derive(Debug, Default, Clone)]
pub struct Placeholders(HashMap<&'static str, String>);

impl Placeholders {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(mut self, key: &'static str, value: impl Into<String>) -> Self {
        self.0.insert(key, value.into());
        self
    }

    /// Replaces every known `{Key}` in `text`. Unknown placeholders are left
    /// as they are.
    pub fn apply(&self, text: &str) -> String {
        let mut out = text.to_owned();
        for (key, value) in &self.0 {
            out = out.replace(&format!("{{{}}}", key), value);
        }
        out
    }
}

#[derive(Debug)]
pub enum CommandOutcome {
    Exited(ExitStatus),
    TimedOut,
}

impl CommandOutcome {
    pub fn success(&self) -> bool {
        matches!(self, CommandOutcome::Exited(status) if status.success())
    }

    pub fn code(&self) -> Option<i32> {
        match self {
            CommandOutcome::Exited(status) => status.code(),
            CommandOutcome::TimedOut => None,
        }
    }

    pub fn describe(&self) -> String {
        match self {
            CommandOutcome::Exited(status) => match status.code() {
                Some(code) => format!("exit code {}", code),
                None => "terminated by signal".to_owned(),
            },
            CommandOutcome::TimedOut => "timed out".to_owned(),
        }
    }
}

/// Splits `template` on whitespace and substitutes placeholders per token,
/// so substituted paths containing spaces stay a single argument.
pub fn build_argv(template: &str, extra: &[String], placeholders: &Placeholders) -> Vec<String> {
    template
        .split_whitespace()
        .map(str::to_owned)
        .chain(extra.iter().cloned())
        .map(|token| placeholders.apply(&token))
        .collect()
}

/// Runs `argv` to completion, killing it once `timeout` has elapsed.
/// Standard output and error are discarded. Spawn failures are step failures.
pub fn run(argv: &[String], timeout: Option<Duration>, correlation: &str) -> Result<CommandOutcome, StepError> {
    let (program, args) = argv
        .split_first()
        .ok_or_else(|| StepError::InvalidArgs("empty command".into()))?;

    debug!("[{}] Running {:?}", correlation, argv);
    let mut child = Command::new(program)
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .spawn()
        .map_err(|e| StepError::Failed(format!("unable to start '{}': {}", program, e)))?;

    let start = Instant::now();
    loop {
        if let Some(status) = child.try_wait()? {
            return Ok(CommandOutcome::Exited(status));
        }
        if let Some(limit) = timeout {
            if start.elapsed() >= limit {
                warn!("[{}] '{}' exceeded {:?}; killing it", correlation, program, limit);
                if let Err(e) = child.kill() {
                    warn!("[{}] Failed to kill '{}': {}", correlation, program, e);
                }
                let _ = child.wait();
                return Ok(CommandOutcome::TimedOut);
            }
        }
        thread::sleep(POLL_INTERVAL);
    }
}

use std::fs;
use std::path::{Path, PathBuf};

use log::debug;
use serde_json::Value;

use crate::registry::{Step, StepContext, StepError, StepResult};
use crate::utils::Utils;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Case {
    Lower,
    Upper,
}

/// Renames the file in place, changing the casing of its basename
pub struct CaseStep(pub Case);

impl Step for CaseStep {
    fn run(&self, path: &Path, _args: &Value, ctx: &StepContext) -> Result<StepResult, StepError> {
        let name = Utils::file_name(path);
        let renamed = match self.0 {
            Case::Lower => name.to_lowercase(),
            Case::Upper => name.to_uppercase(),
        };
        if renamed == name {
            return Ok(StepResult::proceed(path));
        }

        let target = sibling(path, &renamed);
        fs::rename(path, &target).map_err(|e| StepError::from_io(path, e))?;
        debug!("[{}] {} -> {}", ctx.correlation, name, renamed);
        Ok(StepResult::proceed(target))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LineEnd {
    Unix,
    Dos,
}

/// Rewrites the file with the target line terminator. The new content is
/// written beside the file and renamed over it.
pub struct LineEndStep(pub LineEnd);

impl LineEndStep {
    fn convert(&self, content: &[u8]) -> Vec<u8> {
        let mut unix = Vec::with_capacity(content.len());
        let mut iter = content.iter().peekable();
        while let Some(&b) = iter.next() {
            if b == b'\r' && iter.peek() == Some(&&b'\n') {
                continue;
            }
            unix.push(b);
        }
        match self.0 {
            LineEnd::Unix => unix,
            LineEnd::Dos => {
                let mut dos = Vec::with_capacity(unix.len() + unix.len() / 16);
                for b in unix {
                    if b == b'\n' {
                        dos.push(b'\r');
                    }
                    dos.push(b);
                }
                dos
            }
        }
    }
}

impl Step for LineEndStep {
    fn run(&self, path: &Path, _args: &Value, _ctx: &StepContext) -> Result<StepResult, StepError> {
        let content = fs::read(path).map_err(|e| StepError::from_io(path, e))?;
        let converted = self.convert(&content);
        if converted != content {
            let tmp = sibling(path, &format!(".{}.tmp", Utils::file_name(path)));
            fs::write(&tmp, converted)?;
            if let Err(e) = fs::rename(&tmp, path) {
                let _ = fs::remove_file(&tmp);
                return Err(StepError::from_io(path, e));
            }
        }
        Ok(StepResult::proceed(path))
    }
}

fn sibling(path: &Path, name: &str) -> PathBuf {
    path.with_file_name(name)
}

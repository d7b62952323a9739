//! Cross-process, cross-host mutual exclusion built on filesystem atomicity.
//!
//! A lock on resource `R` is a sentinel created next to it: either the file
//! `R.lock` opened with exclusive-create, or the directory `R_lock/`. Both
//! operations are atomic on local filesystems and on NFSv3+, so whichever
//! caller creates the sentinel owns the lock.
//!
//! The sentinel carries `<hostname>\n<pid>\n<owner-args...>` so an operator
//! can tell who holds it. Sentinels left behind by a crashed holder are never
//! removed automatically.

use std::ffi::OsString;
use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::thread;
use std::time::{Duration, Instant};

use log::{debug, warn};
use nix::errno::Errno;
use nix::sys::signal;
use nix::unistd::Pid;
use once_cell::sync::Lazy;
use thiserror::Error;

use crate::error::XferoError;

static HOSTNAME: Lazy<String> = Lazy::new(|| {
    nix::unistd::gethostname()
        .map(|h: OsString| h.to_string_lossy().into_owned())
        .unwrap_or_else(|_| "unknown".to_owned())
});

/// Payload file written inside a directory sentinel
const DIR_PAYLOAD_FILE: &str = "owner";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockStyle {
    /// `R.lock`, created with `O_CREAT | O_EXCL`
    File,
    /// `R_lock/`, created with `mkdir`
    Directory,
}

impl LockStyle {
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "file" => Some(LockStyle::File),
            "directory" | "dir" => Some(LockStyle::Directory),
            _ => None,
        }
    }

    pub fn sentinel_for(self, name: &Path) -> PathBuf {
        let mut s = name.as_os_str().to_owned();
        match self {
            LockStyle::File => s.push(".lock"),
            LockStyle::Directory => s.push("_lock"),
        }
        PathBuf::from(s)
    }

    /// True for directory entries named like lock sentinels of either style.
    pub fn is_sentinel_name(file_name: &str) -> bool {
        file_name.ends_with(".lock") || file_name.ends_with("_lock")
    }

    /// True when `path` is a sentinel rather than a payload that happens to
    /// carry a sentinel-like name (`yarn.lock`). A `R.lock` file is a sentinel
    /// while `R` exists or while it holds an owner record. A `R_lock` entry is
    /// a sentinel only as a directory.
    pub fn is_sentinel(path: &Path) -> bool {
        let name = match path.file_name().and_then(|n| n.to_str()) {
            Some(name) => name,
            None => return false,
        };
        if name.ends_with("_lock") && path.is_dir() {
            return true;
        }
        match name.strip_suffix(".lock") {
            Some(resource) if !resource.is_empty() => {
                path.with_file_name(resource).exists()
                    || fs::read_to_string(path)
                        .ok()
                        .and_then(|payload| LockOwner::parse(&payload))
                        .is_some()
            }
            _ => false,
        }
    }
}

#[derive(Debug, Clone)]
pub struct LockOptions {
    pub style: LockStyle,
    /// A non-blocking acquire makes exactly one attempt
    pub blocking: bool,
    /// `None` blocks forever
    pub timeout: Option<Duration>,
    pub delay: Duration,
    pub owner_args: Vec<String>,
}

impl LockOptions {
    pub fn non_blocking(style: LockStyle) -> Self {
        LockOptions {
            style,
            blocking: false,
            timeout: Some(Duration::ZERO),
            delay: Duration::ZERO,
            owner_args: Vec::new(),
        }
    }

    pub fn blocking(style: LockStyle, timeout: Option<Duration>, delay: Duration) -> Self {
        LockOptions {
            style,
            blocking: true,
            timeout,
            delay,
            owner_args: Vec::new(),
        }
    }

    pub fn with_owner_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.owner_args = args.into_iter().map(Into::into).collect();
        self
    }
}

#[derive(Error, Debug)]
pub enum LockError {
    #[error("Lock on '{}' is held elsewhere", .0.display())]
    TimedOut(PathBuf),

    #[error("Failed to lock '{}': {source}", .path.display())]
    Failed { path: PathBuf, source: io::Error },
}

impl From<LockError> for XferoError {
    fn from(err: LockError) -> Self {
        match err {
            LockError::TimedOut(path) => XferoError::LockContended(path),
            LockError::Failed { source, .. } => XferoError::IoError(source),
        }
    }
}

/// Identity recorded in a sentinel
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockOwner {
    pub hostname: String,
    pub pid: i32,
    pub args: Vec<String>,
}

impl LockOwner {
    fn current(args: &[String]) -> Self {
        LockOwner {
            hostname: HOSTNAME.clone(),
            pid: std::process::id() as i32,
            args: args.to_vec(),
        }
    }

    fn to_payload(&self) -> String {
        let mut payload = format!("{}\n{}\n", self.hostname, self.pid);
        payload.push_str(&self.args.join(" "));
        payload
    }

    fn parse(payload: &str) -> Option<Self> {
        let mut lines = payload.splitn(3, '\n');
        let hostname = lines.next()?.trim();
        let pid = lines.next()?.trim().parse().ok()?;
        let args = lines
            .next()
            .map(|rest| rest.split_whitespace().map(str::to_owned).collect())
            .unwrap_or_default();
        if hostname.is_empty() {
            return None;
        }
        Some(LockOwner {
            hostname: hostname.to_owned(),
            pid,
            args,
        })
    }

    /// The holder ran on this host and its process is gone. Holders on other
    /// hosts can't be checked from here and are never reported stale.
    pub fn appears_stale(&self) -> bool {
        if self.hostname != *HOSTNAME || self.pid <= 0 {
            return false;
        }
        matches!(signal::kill(Pid::from_raw(self.pid), None), Err(Errno::ESRCH))
    }
}

/// A held lock. Dropping it releases the sentinel.
#[derive(Debug)]
pub struct FsLock {
    name: PathBuf,
    sentinel: PathBuf,
    style: LockStyle,
    held: bool,
}

impl FsLock {
    pub fn acquire(name: &Path, opts: &LockOptions) -> Result<FsLock, LockError> {
        let sentinel = opts.style.sentinel_for(name);
        let payload = LockOwner::current(&opts.owner_args).to_payload();
        let start = Instant::now();

        loop {
            match Self::try_create(&sentinel, opts.style, &payload) {
                Ok(true) => {
                    debug!("Acquired lock {}", sentinel.display());
                    return Ok(FsLock {
                        name: name.to_owned(),
                        sentinel,
                        style: opts.style,
                        held: true,
                    });
                }
                Ok(false) => {}
                Err(source) => {
                    return Err(LockError::Failed {
                        path: sentinel,
                        source,
                    })
                }
            }

            if !opts.blocking {
                return Err(LockError::TimedOut(name.to_owned()));
            }
            if let Some(timeout) = opts.timeout {
                if start.elapsed() >= timeout {
                    return Err(LockError::TimedOut(name.to_owned()));
                }
            }
            thread::sleep(opts.delay);
        }
    }

    /// `Ok(false)` means somebody else's sentinel is already there.
    fn try_create(sentinel: &Path, style: LockStyle, payload: &str) -> io::Result<bool> {
        let created = match style {
            LockStyle::File => OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(sentinel)
                .map(|mut f| f.write_all(payload.as_bytes()).and_then(|_| f.sync_all())),
            LockStyle::Directory => fs::create_dir(sentinel)
                .map(|_| fs::write(sentinel.join(DIR_PAYLOAD_FILE), payload)),
        };

        match created {
            Ok(Ok(())) => Ok(true),
            Ok(Err(write_err)) => {
                // We own the sentinel but could not record ourselves in it
                Self::remove_sentinel(sentinel, style);
                Err(write_err)
            }
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => Ok(false),
            Err(e) => Err(e),
        }
    }

    fn remove_sentinel(sentinel: &Path, style: LockStyle) -> bool {
        let result = match style {
            LockStyle::File => fs::remove_file(sentinel),
            LockStyle::Directory => fs::remove_dir_all(sentinel),
        };
        match result {
            Ok(()) => true,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                warn!("Lock sentinel {} was already gone", sentinel.display());
                true
            }
            Err(e) => {
                warn!("Failed to remove lock sentinel {}: {}", sentinel.display(), e);
                false
            }
        }
    }

    /// Removes the sentinel. Idempotent; failures are only logged.
    pub fn release(&mut self) {
        if !self.held {
            return;
        }
        self.held = false;
        if Self::remove_sentinel(&self.sentinel, self.style) {
            debug!("Released lock {}", self.sentinel.display());
        }
    }

    /// Advisory probe; the answer may be stale by the time it is used.
    pub fn available(name: &Path, style: LockStyle) -> bool {
        !style.sentinel_for(name).exists()
    }

    /// Reads the owner recorded in an existing sentinel.
    pub fn read_owner(name: &Path, style: LockStyle) -> Option<LockOwner> {
        let sentinel = style.sentinel_for(name);
        let payload_path = match style {
            LockStyle::File => sentinel,
            LockStyle::Directory => sentinel.join(DIR_PAYLOAD_FILE),
        };
        let payload = fs::read_to_string(payload_path).ok()?;
        LockOwner::parse(&payload)
    }

    pub fn name(&self) -> &Path {
        &self.name
    }

    pub fn sentinel(&self) -> &Path {
        &self.sentinel
    }

    pub fn is_held(&self) -> bool {
        self.held
    }
}

impl Drop for FsLock {
    fn drop(&mut self) {
        self.release();
    }
}

pub fn local_hostname() -> &'static str {
    &HOSTNAME
}

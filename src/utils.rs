use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::Local;

pub struct Utils {}

impl Utils {
    /// Compact local timestamp used in generated file names, e.g. `20250115T103000`.
    pub fn file_timestamp() -> String {
        Local::now().format("%Y%m%dT%H%M%S").to_string()
    }

    /// Timestamp suffix used by the `copy` step, e.g. `_20250115103000`.
    pub fn copy_timestamp() -> String {
        Local::now().format("_%Y%m%d%H%M%S").to_string()
    }

    pub fn format_elapsed(duration: Duration) -> String {
        let secs = duration.as_secs();
        if secs < 60 {
            format!("{}s", secs)
        } else if secs < 3600 {
            format!("{}m {}s", secs / 60, secs % 60)
        } else {
            format!("{}h {}m", secs / 3600, (secs % 3600) / 60)
        }
    }

    /// Basename of a path as an owned string (lossy for non-UTF-8 names).
    pub fn file_name(path: &Path) -> String {
        path.file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default()
    }

    /// Moves `src` to `dst`. A plain rename is tried first; when the two paths
    /// live on different filesystems the file is copied and the source removed.
    pub fn move_file(src: &Path, dst: &Path) -> io::Result<()> {
        if let Some(parent) = dst.parent() {
            fs::create_dir_all(parent)?;
        }
        match fs::rename(src, dst) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Err(e),
            Err(_) => {
                fs::copy(src, dst)?;
                fs::remove_file(src)
            }
        }
    }

    /// Returns `dir/name`, or `dir/name<timestamp>` when that name is taken.
    pub fn unique_destination(dir: &Path, name: &str) -> PathBuf {
        let candidate = dir.join(name);
        if !candidate.exists() {
            return candidate;
        }
        let mut n = 1;
        loop {
            let candidate = dir.join(format!("{}.{}_{}", name, Utils::file_timestamp(), n));
            if !candidate.exists() {
                return candidate;
            }
            n += 1;
        }
    }
}

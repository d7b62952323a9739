use std::collections::{HashMap, HashSet};
use std::fs;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use log::{debug, error, info, trace, warn, Level};
use logging_timer::timer;
use regex::Regex;
use tokio::sync::broadcast;

use crate::config::Config;
use crate::control::ControlStatus;
use crate::db::Database;
use crate::error::XferoError;
use crate::fs_lock::{FsLock, LockError, LockOptions, LockStyle};
use crate::routes::Route;
use crate::worker_pool::{Job, WorkerPool};

/// What one scan cycle did
#[derive(Debug, Default)]
pub struct ScanReport {
    /// Files handed to the pool, in submission order
    pub submitted: Vec<PathBuf>,
    /// Files whose lock was held elsewhere
    pub contended: usize,
    /// Set when the pool refused a job; the cycle stops there
    pub saturated: bool,
    /// Routes skipped because of a bad pattern or unreadable directory
    pub skipped_routes: usize,
}

/// Compiled filename pattern, keyed by route id and recompiled when the
/// stored source changes
struct CachedPattern {
    source: String,
    regex: Option<Regex>,
}

/// Discovers files in the monitored directories and feeds them, highest
/// priority first, to the worker pool.
pub struct RouteEngine {
    config: Arc<Config>,
    db: Database,
    pool: Arc<WorkerPool>,
    lock_style: LockStyle,
    patterns: Mutex<HashMap<i64, CachedPattern>>,
}

impl RouteEngine {
    pub fn new(config: Arc<Config>, db: Database, pool: Arc<WorkerPool>) -> Self {
        let lock_style = config.engine.lock_style();
        RouteEngine {
            config,
            db,
            pool,
            lock_style,
            patterns: Mutex::new(HashMap::new()),
        }
    }

    /// Full-match semantics: the pattern has to cover the whole basename.
    pub fn compile_pattern(pattern: &str) -> Result<Regex, XferoError> {
        Ok(Regex::new(&format!("^(?:{})$", pattern))?)
    }

    fn pattern_for(&self, route: &Route) -> Option<Regex> {
        let mut patterns = self.patterns.lock().unwrap();
        let cached = patterns.entry(route.route_id).or_insert_with(|| CachedPattern {
            source: String::new(),
            regex: None,
        });
        if cached.regex.is_none() || cached.source != route.filename_pattern {
            let first_failure = cached.source != route.filename_pattern;
            cached.source = route.filename_pattern.clone();
            cached.regex = match Self::compile_pattern(&route.filename_pattern) {
                Ok(regex) => Some(regex),
                Err(e) => {
                    if first_failure {
                        error!(
                            "Route {} ({}): invalid pattern '{}': {}",
                            route.route_id, route.name, route.filename_pattern, e
                        );
                    }
                    None
                }
            };
        }
        cached.regex.clone()
    }

    /// One scan cycle. Does nothing unless the control row says RUNNING.
    pub fn scan_once(&self) -> Result<ScanReport, XferoError> {
        let _tmr = timer!(Level::Trace; "RouteEngine::scan_once");
        let mut report = ScanReport::default();

        if self.db.control_status()? != ControlStatus::Running {
            trace!("Not running; skipping scan");
            return Ok(report);
        }

        let routes = self.db.routes_active_ordered_by_priority()?;
        let mut claimed: HashSet<PathBuf> = HashSet::new();

        for route in &routes {
            if !self.scan_route(route, &mut claimed, &mut report) {
                debug!(
                    "Worker pool is full; ending scan after {} submission(s)",
                    report.submitted.len()
                );
                break;
            }
        }

        if !report.submitted.is_empty() {
            info!(
                "Scan submitted {} file(s), {} contended",
                report.submitted.len(),
                report.contended
            );
        }
        Ok(report)
    }

    /// Returns false once the pool refuses a job.
    fn scan_route(
        &self,
        route: &Route,
        claimed: &mut HashSet<PathBuf>,
        report: &mut ScanReport,
    ) -> bool {
        let regex = match self.pattern_for(route) {
            Some(regex) => regex,
            None => {
                report.skipped_routes += 1;
                return true;
            }
        };

        let mut names = match Self::list_files(route) {
            Ok(names) => names,
            Err(e) => {
                warn!(
                    "Route {} ({}): unable to list {}: {}",
                    route.route_id,
                    route.name,
                    route.monitored_dir.display(),
                    e
                );
                report.skipped_routes += 1;
                return true;
            }
        };
        names.sort();

        for name in names {
            if !regex.is_match(&name) {
                continue;
            }
            let path = route.monitored_dir.join(&name);
            if LockStyle::is_sentinel_name(&name) && LockStyle::is_sentinel(&path) {
                trace!("Route {}: skipping lock sentinel {}", route.route_id, name);
                continue;
            }
            if claimed.contains(&path) {
                continue;
            }

            let lock = match self.try_lock(route, &path) {
                Some(lock) => lock,
                None => {
                    report.contended += 1;
                    continue;
                }
            };
            // Another process may have finished with the file between the
            // listing and the lock
            if !path.is_file() {
                continue;
            }

            claimed.insert(path.clone());
            let job = Job {
                route: route.clone(),
                path: path.clone(),
                lock,
            };
            match self.pool.try_submit(job) {
                Ok(()) => {
                    debug!("Route {}: submitted {}", route.route_id, path.display());
                    report.submitted.push(path);
                }
                Err(job) => {
                    // dropping the job releases its lock
                    drop(job);
                    report.saturated = true;
                    return false;
                }
            }
        }
        true
    }

    fn list_files(route: &Route) -> std::io::Result<Vec<String>> {
        let mut names = Vec::new();
        for entry in fs::read_dir(&route.monitored_dir)? {
            let entry = entry?;
            match entry.file_type() {
                Ok(ft) if ft.is_file() => {
                    names.push(entry.file_name().to_string_lossy().into_owned())
                }
                _ => {}
            }
        }
        Ok(names)
    }

    fn try_lock(&self, route: &Route, path: &std::path::Path) -> Option<FsLock> {
        let opts = LockOptions::non_blocking(self.lock_style).with_owner_args([
            "xfero".to_owned(),
            format!("route={}", route.route_id),
        ]);
        match FsLock::acquire(path, &opts) {
            Ok(lock) => Some(lock),
            Err(LockError::TimedOut(_)) => {
                if let Some(owner) = FsLock::read_owner(path, self.lock_style) {
                    if owner.appears_stale() {
                        warn!(
                            "Lock on {} looks stale: held by pid {} on {} which is gone; remove {} by hand",
                            path.display(),
                            owner.pid,
                            owner.hostname,
                            self.lock_style.sentinel_for(path).display()
                        );
                    } else {
                        trace!("{} is locked by {}:{}", path.display(), owner.hostname, owner.pid);
                    }
                }
                None
            }
            Err(e) => {
                warn!("Route {}: {}", route.route_id, e);
                None
            }
        }
    }

    /// Scans every `scan_interval` until shutdown is signalled. Scans run on
    /// the blocking pool; a scan is never started while the previous one is
    /// still running.
    pub async fn run(self: Arc<Self>, mut shutdown_rx: broadcast::Receiver<()>) {
        let mut interval = tokio::time::interval(self.config.engine.scan_interval());
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        info!(
            "Route engine started (every {:?})",
            self.config.engine.scan_interval()
        );

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    let engine = Arc::clone(&self);
                    match tokio::task::spawn_blocking(move || engine.scan_once()).await {
                        Ok(Ok(_)) => {}
                        Ok(Err(e)) => error!("Route scan failed: {}", e),
                        Err(e) => error!("Route scan panicked: {}", e),
                    }
                }
                _ = shutdown_rx.recv() => {
                    info!("Route engine stopping");
                    break;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::test_support::config_in;
    use crate::db::test_support::scratch_db;
    use crate::executor::WorkflowExecutor;
    use crate::registry::{StepRegistry, StepResult};
    use crate::routes::NewRoute;
    use crate::workflow_items::{NewWorkflowItem, WorkflowItem};
    use pretty_assertions::assert_eq;
    use std::path::Path;
    use std::sync::mpsc;
    use std::time::Duration;
    use tempfile::TempDir;

    struct Fixture {
        _dir: TempDir,
        db: Database,
        config: Arc<Config>,
        inbound: PathBuf,
    }

    fn fixture() -> Fixture {
        let (dir, db) = scratch_db();
        let mut config = config_in(dir.path());
        config.prepare_directories().unwrap();
        let inbound = dir.path().join("in");
        fs::create_dir_all(&inbound).unwrap();
        db.set_control_status(ControlStatus::Running).unwrap();
        Fixture {
            _dir: dir,
            db,
            config: Arc::new(config),
            inbound,
        }
    }

    fn add_route(fx: &Fixture, pattern: &str, priority: i64, step: &str) -> Route {
        let conn = fx.db.get_connection().unwrap();
        let route =
            Route::create(&conn, &NewRoute::new(pattern, &fx.inbound, pattern, priority)).unwrap();
        WorkflowItem::create(&conn, &NewWorkflowItem::new(route.route_id, step, 1)).unwrap();
        route
    }

    fn engine(fx: &Fixture, registry: StepRegistry, width: usize, capacity: usize) -> RouteEngine {
        let executor = WorkflowExecutor::new(fx.config.clone(), fx.db.clone(), Arc::new(registry));
        let pool = Arc::new(WorkerPool::new(width, capacity, executor));
        RouteEngine::new(fx.config.clone(), fx.db.clone(), pool)
    }

    #[test]
    fn test_full_match_pattern() {
        let re = RouteEngine::compile_pattern("A.*\\.txt").unwrap();
        assert!(re.is_match("ALPHA.txt"));
        assert!(!re.is_match("xALPHA.txt"));
        assert!(!re.is_match("ALPHA.txt.bak"));
        // already-anchored patterns keep working
        assert!(RouteEngine::compile_pattern("^A.*\\.txt$").unwrap().is_match("A.txt"));
        assert!(RouteEngine::compile_pattern("a|b").unwrap().is_match("b"));
        assert!(!RouteEngine::compile_pattern("a|b").unwrap().is_match("ab"));
    }

    #[test]
    fn test_not_running_scans_nothing() {
        let fx = fixture();
        add_route(&fx, ".*", 1, "case.lower");
        fs::write(fx.inbound.join("F"), b"").unwrap();
        fx.db.request_stop().unwrap();

        let engine = engine(&fx, StepRegistry::with_defaults(), 1, 1);
        let report = engine.scan_once().unwrap();
        assert!(report.submitted.is_empty());
        assert!(fx.inbound.join("F").exists());
    }

    #[test]
    fn test_priority_order_and_single_owner() {
        let fx = fixture();
        let (order_tx, order_rx) = mpsc::channel::<String>();
        let order_tx = Mutex::new(order_tx);
        let mut registry = StepRegistry::new();
        registry.register_step_fn("record", move |p: &Path, _, _| {
            order_tx
                .lock()
                .unwrap()
                .send(p.file_name().unwrap().to_string_lossy().into_owned())
                .unwrap();
            Ok(StepResult::proceed(p))
        });
        add_route(&fx, "b.*", 2, "record");
        add_route(&fx, "a.*", 1, "record");
        // matches both routes; only the higher priority one gets it
        add_route(&fx, "ab.*|a.*", 3, "record");
        for name in ["b1", "a1", "ab"] {
            fs::write(fx.inbound.join(name), b"").unwrap();
        }

        let engine = engine(&fx, registry, 1, 8);
        let report = engine.scan_once().unwrap();
        assert_eq!(
            report.submitted,
            vec![fx.inbound.join("a1"), fx.inbound.join("ab"), fx.inbound.join("b1")]
        );
        engine.pool.drain();

        let seen: Vec<String> = order_rx.try_iter().collect();
        assert_eq!(seen, vec!["a1", "ab", "b1"]);
    }

    #[test]
    fn test_contended_file_is_skipped() {
        let fx = fixture();
        add_route(&fx, ".*", 1, "case.lower");
        let path = fx.inbound.join("X");
        fs::write(&path, b"").unwrap();
        let held = FsLock::acquire(&path, &LockOptions::non_blocking(LockStyle::File)).unwrap();

        let engine = engine(&fx, StepRegistry::with_defaults(), 1, 1);
        let report = engine.scan_once().unwrap();
        assert!(report.submitted.is_empty());
        assert_eq!(report.contended, 1);
        assert!(path.exists());
        drop(held);

        let report = engine.scan_once().unwrap();
        assert_eq!(report.submitted, vec![path]);
        engine.pool.drain();
        assert!(fx.config.settings.outbound_directory.join("x").exists());
    }

    #[test]
    fn test_saturated_pool_stops_cycle_and_releases_lock() {
        let fx = fixture();
        let (release_tx, release_rx) = mpsc::channel::<()>();
        let release_rx = Mutex::new(release_rx);
        let mut registry = StepRegistry::new();
        registry.register_step_fn("gate", move |p: &Path, _, _| {
            release_rx.lock().unwrap().recv_timeout(Duration::from_secs(5)).ok();
            Ok(StepResult::proceed(p))
        });
        add_route(&fx, ".*", 1, "gate");
        for name in ["f1", "f2", "f3", "f4"] {
            fs::write(fx.inbound.join(name), b"").unwrap();
        }

        let engine = engine(&fx, registry, 1, 1);
        let report = engine.scan_once().unwrap();
        assert!(report.saturated);
        assert!(report.submitted.len() < 4);
        let rejected = fx.inbound.join(format!("f{}", report.submitted.len() + 1));
        assert!(FsLock::available(&rejected, LockStyle::File));

        for _ in 0..4 {
            release_tx.send(()).ok();
        }
        engine.pool.drain();
    }

    #[test]
    fn test_sentinels_and_directories_are_ignored() {
        let fx = fixture();
        add_route(&fx, ".*", 1, "case.lower");
        // sentinel of a file already detached by its holder
        let _held = FsLock::acquire(
            &fx.inbound.join("detached"),
            &LockOptions::non_blocking(LockStyle::File),
        )
        .unwrap();
        fs::create_dir(fx.inbound.join("sub")).unwrap();
        fs::create_dir(fx.inbound.join("y_lock")).unwrap();

        let engine = engine(&fx, StepRegistry::with_defaults(), 1, 1);
        let report = engine.scan_once().unwrap();
        assert!(report.submitted.is_empty());
        assert_eq!(report.contended, 0);
    }

    #[test]
    fn test_payload_with_lock_suffix_is_picked_up() {
        let fx = fixture();
        add_route(&fx, "yarn\\.lock", 1, "case.lower");
        fs::write(fx.inbound.join("yarn.lock"), b"# yarn lockfile v1\n").unwrap();

        let engine = engine(&fx, StepRegistry::with_defaults(), 1, 1);
        let report = engine.scan_once().unwrap();
        assert_eq!(report.submitted, vec![fx.inbound.join("yarn.lock")]);
        engine.pool.drain();
        assert!(fx.config.settings.outbound_directory.join("yarn.lock").exists());
    }

    #[test]
    fn test_bad_pattern_and_missing_dir_skip_route() {
        let fx = fixture();
        add_route(&fx, "(", 1, "case.lower");
        let conn = fx.db.get_connection().unwrap();
        Route::create(&conn, &NewRoute::new("gone", fx.inbound.join("missing"), ".*", 2)).unwrap();
        drop(conn);
        add_route(&fx, ".*", 3, "case.lower");
        fs::write(fx.inbound.join("Z"), b"").unwrap();

        let engine = engine(&fx, StepRegistry::with_defaults(), 1, 2);
        let report = engine.scan_once().unwrap();
        assert_eq!(report.skipped_routes, 2);
        assert_eq!(report.submitted, vec![fx.inbound.join("Z")]);
        engine.pool.drain();
    }
}

use std::fs;
use std::io;
use std::path::Path;
use std::sync::Arc;

use log::{error, info, warn};
use nix::errno::Errno;
use nix::sys::signal;
use nix::unistd::Pid;
use tokio::sync::broadcast;

use crate::config::Config;
use crate::control::ControlStatus;
use crate::db::Database;
use crate::error::XferoError;
use crate::executor::WorkflowExecutor;
use crate::registry::StepRegistry;
use crate::route_engine::RouteEngine;
use crate::task_scheduler::TaskScheduler;
use crate::worker_pool::WorkerPool;

/// Owns the process lifetime: boots the store, runs the route engine and the
/// task scheduler, and drains everything once the control row says
/// STOPPING.
pub struct Supervisor {
    config: Arc<Config>,
    db: Database,
    registry: Arc<StepRegistry>,
}

impl Supervisor {
    /// Prepares directories, opens the store, clears state left by a crashed
    /// run and moves the control row to RUNNING. The pid file is written
    /// last.
    pub fn boot(mut config: Config, registry: StepRegistry) -> Result<Self, XferoError> {
        config.prepare_directories()?;
        let db = Database::open(&config.database.db_location)?;

        Self::recover(&db, &config.process.pid_file)?;
        db.set_control_status(ControlStatus::Running)?;
        if let Err(e) = Self::write_pid_file(&config.process.pid_file) {
            // Leave the row as we found it so the next boot is clean
            db.set_control_status(ControlStatus::Stopping)?;
            db.set_control_status(ControlStatus::Stopped)?;
            return Err(e.into());
        }

        info!(
            "Supervisor booted (pid {}, registry: {} step(s), {} task kind(s))",
            std::process::id(),
            registry.step_keys().len(),
            registry.task_kinds().len()
        );
        Ok(Supervisor {
            config: Arc::new(config),
            db,
            registry: Arc::new(registry),
        })
    }

    /// A RUNNING or STOPPING row at boot either belongs to a live supervisor,
    /// which is fatal, or was left behind by a crash and is walked back to
    /// STOPPED through legal transitions.
    fn recover(db: &Database, pid_file: &Path) -> Result<(), XferoError> {
        let status = db.control_status()?;
        if status == ControlStatus::Stopped {
            return Ok(());
        }

        if let Some(pid) = Self::read_pid_file(pid_file) {
            if pid != std::process::id() as i32 && Self::process_alive(pid) {
                return Err(XferoError::AlreadyRunning(pid));
            }
        }

        warn!(
            "Control row is {} but no supervisor is running; recovering from an unclean shutdown",
            status
        );
        if status == ControlStatus::Running {
            db.set_control_status(ControlStatus::Stopping)?;
        }
        db.set_control_status(ControlStatus::Stopped)
    }

    fn read_pid_file(pid_file: &Path) -> Option<i32> {
        fs::read_to_string(pid_file).ok()?.trim().parse().ok()
    }

    fn write_pid_file(pid_file: &Path) -> io::Result<()> {
        if let Some(parent) = pid_file.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(pid_file, format!("{}\n", std::process::id()))
    }

    fn remove_pid_file(pid_file: &Path) {
        match fs::remove_file(pid_file) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => warn!("Failed to remove pid file {}: {}", pid_file.display(), e),
        }
    }

    fn process_alive(pid: i32) -> bool {
        if pid <= 0 {
            return false;
        }
        !matches!(signal::kill(Pid::from_raw(pid), None), Err(Errno::ESRCH))
    }

    pub fn database(&self) -> &Database {
        &self.db
    }

    /// Worker count from the control row, falling back to the configured
    /// default when the row holds a non-positive value.
    fn pool_width(&self) -> Result<usize, XferoError> {
        let num_threads = self.db.control()?.num_threads;
        if num_threads > 0 {
            Ok(num_threads as usize)
        } else {
            warn!(
                "Control row has num_threads = {}; using {}",
                num_threads, self.config.engine.default_num_threads
            );
            Ok(self.config.engine.default_num_threads)
        }
    }

    /// Runs until the control row leaves RUNNING, then drains and writes
    /// STOPPED. A database failure while polling is fatal and is returned
    /// after the drain.
    pub async fn run(self) -> Result<(), XferoError> {
        let width = self.pool_width()?;
        let capacity = width * self.config.engine.queue_multiplier;
        let executor = WorkflowExecutor::new(
            Arc::clone(&self.config),
            self.db.clone(),
            Arc::clone(&self.registry),
        );
        let pool = Arc::new(WorkerPool::new(width, capacity, executor));
        let engine = Arc::new(RouteEngine::new(
            Arc::clone(&self.config),
            self.db.clone(),
            Arc::clone(&pool),
        ));
        let scheduler = Arc::new(TaskScheduler::new(
            Arc::clone(&self.config),
            self.db.clone(),
            Arc::clone(&self.registry),
        ));

        let (shutdown_tx, _) = broadcast::channel::<()>(1);
        let engine_handle = tokio::spawn(engine.run(shutdown_tx.subscribe()));
        let scheduler_handle = tokio::spawn(scheduler.run(shutdown_tx.subscribe()));

        let fatal = self.poll_control().await;

        info!("Stopping: halting admission");
        let _ = shutdown_tx.send(());
        for (name, handle) in [("route engine", engine_handle), ("task scheduler", scheduler_handle)] {
            if let Err(e) = handle.await {
                error!("{} ended abnormally: {}", name, e);
            }
        }

        let drain_pool = Arc::clone(&pool);
        if let Err(e) = tokio::task::spawn_blocking(move || drain_pool.drain()).await {
            error!("Worker pool drain failed: {}", e);
        }

        let db = self.db.clone();
        let stopped = tokio::task::spawn_blocking(move || Self::mark_stopped(&db))
            .await
            .map_err(|e| XferoError::Error(e.to_string()))
            .and_then(|r| r);
        Self::remove_pid_file(&self.config.process.pid_file);

        match (fatal, stopped) {
            (Some(e), _) => Err(e),
            (None, Err(e)) => Err(e),
            (None, Ok(())) => {
                info!("Supervisor stopped");
                Ok(())
            }
        }
    }

    /// Polls the control row until it leaves RUNNING. Ctrl-C is turned into
    /// a STOPPING write so it takes the same path as an admin stop.
    async fn poll_control(&self) -> Option<XferoError> {
        let mut interval = tokio::time::interval(self.config.engine.control_poll());
        let ctrl_c = tokio::signal::ctrl_c();
        tokio::pin!(ctrl_c);
        let mut interrupted = false;

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    let db = self.db.clone();
                    let status = tokio::task::spawn_blocking(move || db.control_status()).await;
                    match status {
                        Ok(Ok(ControlStatus::Running)) => {}
                        Ok(Ok(status)) => {
                            info!("Control status is {}", status);
                            return None;
                        }
                        Ok(Err(e)) => {
                            error!("Unable to read control status: {}", e);
                            return Some(e);
                        }
                        Err(e) => {
                            error!("Control poll panicked: {}", e);
                            return Some(XferoError::Error(e.to_string()));
                        }
                    }
                }
                result = &mut ctrl_c, if !interrupted => {
                    interrupted = true;
                    if let Err(e) = result {
                        warn!("Unable to listen for Ctrl-C: {}", e);
                        continue;
                    }
                    info!("Interrupt received; requesting stop");
                    let db = self.db.clone();
                    match tokio::task::spawn_blocking(move || db.request_stop()).await {
                        Ok(Ok(())) => {}
                        Ok(Err(e)) => warn!("Stop request failed: {}", e),
                        Err(e) => warn!("Stop request panicked: {}", e),
                    }
                }
            }
        }
    }

    /// Ends the cycle at STOPPED from whatever state the run left behind.
    fn mark_stopped(db: &Database) -> Result<(), XferoError> {
        match db.control_status()? {
            ControlStatus::Stopped => Ok(()),
            ControlStatus::Stopping => db.set_control_status(ControlStatus::Stopped),
            ControlStatus::Running => {
                db.set_control_status(ControlStatus::Stopping)?;
                db.set_control_status(ControlStatus::Stopped)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::test_support::config_in;
    use crate::registry::StepResult;
    use crate::routes::{NewRoute, Route};
    use crate::workflow_items::{NewWorkflowItem, WorkflowItem};
    use serial_test::serial;
    use std::path::PathBuf;
    use std::sync::mpsc;
    use std::sync::Mutex;
    use std::time::Duration;
    use tempfile::TempDir;

    fn bootstrapped() -> (TempDir, Config) {
        let dir = tempfile::tempdir().unwrap();
        let config = config_in(dir.path());
        let db = Database::open_for_bootstrap(&config.database.db_location).unwrap();
        db.bootstrap_schema().unwrap();
        (dir, config)
    }

    #[test]
    fn test_boot_without_schema_fails() {
        let dir = tempfile::tempdir().unwrap();
        let err = Supervisor::boot(config_in(dir.path()), StepRegistry::new())
            .err()
            .unwrap();
        assert!(matches!(err, XferoError::SchemaMissing(_)));
        assert_eq!(err.exit_code(), 4);
    }

    #[test]
    fn test_boot_sets_running_and_writes_pid() {
        let (_dir, config) = bootstrapped();
        let pid_file = config.process.pid_file.clone();
        let supervisor = Supervisor::boot(config, StepRegistry::new()).unwrap();

        assert_eq!(
            supervisor.database().control_status().unwrap(),
            ControlStatus::Running
        );
        let written = fs::read_to_string(&pid_file).unwrap();
        assert_eq!(written.trim(), std::process::id().to_string());
        assert!(supervisor.config.settings.transient_directory.is_dir());
    }

    #[test]
    fn test_live_pid_is_already_running() {
        let (_dir, config) = bootstrapped();
        let db = Database::open(&config.database.db_location).unwrap();
        db.set_control_status(ControlStatus::Running).unwrap();
        let parent = nix::unistd::getppid().as_raw();
        fs::write(&config.process.pid_file, parent.to_string()).unwrap();

        let err = Supervisor::boot(config, StepRegistry::new()).err().unwrap();
        assert!(matches!(err, XferoError::AlreadyRunning(pid) if pid == parent));
        assert_eq!(db.control_status().unwrap(), ControlStatus::Running);
    }

    #[test]
    fn test_stale_state_is_recovered() {
        let (_dir, config) = bootstrapped();
        let db = Database::open(&config.database.db_location).unwrap();
        db.set_control_status(ControlStatus::Running).unwrap();
        db.set_control_status(ControlStatus::Stopping).unwrap();
        fs::write(&config.process.pid_file, "999999999\n").unwrap();

        let supervisor = Supervisor::boot(config, StepRegistry::new()).unwrap();
        assert_eq!(
            supervisor.database().control_status().unwrap(),
            ControlStatus::Running
        );
    }

    #[test]
    fn test_mark_stopped_from_any_state() {
        let (_dir, config) = bootstrapped();
        let db = Database::open(&config.database.db_location).unwrap();
        Supervisor::mark_stopped(&db).unwrap();
        db.set_control_status(ControlStatus::Running).unwrap();
        Supervisor::mark_stopped(&db).unwrap();
        assert_eq!(db.control_status().unwrap(), ControlStatus::Stopped);
    }

    #[tokio::test(flavor = "multi_thread")]
    #[serial]
    async fn test_graceful_shutdown_drains_in_flight_workflow() {
        let (dir, config) = bootstrapped();
        let inbound = dir.path().join("in");
        fs::create_dir_all(&inbound).unwrap();
        let outbound = config.settings.outbound_directory.clone();
        let pid_file = config.process.pid_file.clone();

        let (started_tx, started_rx) = mpsc::channel::<PathBuf>();
        let started_tx = Mutex::new(started_tx);
        let mut registry = StepRegistry::with_defaults();
        registry.register_step_fn("slow", move |p: &Path, _, _| {
            started_tx.lock().unwrap().send(p.to_owned()).ok();
            std::thread::sleep(Duration::from_secs(1));
            Ok(StepResult::proceed(p))
        });

        {
            let db = Database::open(&config.database.db_location).unwrap();
            let conn = db.get_connection().unwrap();
            let route = Route::create(&conn, &NewRoute::new("slow", &inbound, ".*", 1)).unwrap();
            WorkflowItem::create(&conn, &NewWorkflowItem::new(route.route_id, "slow", 1)).unwrap();
        }
        fs::write(inbound.join("first"), b"1").unwrap();

        let supervisor = Supervisor::boot(config, registry).unwrap();
        let db = supervisor.database().clone();
        let run = tokio::spawn(supervisor.run());

        let in_flight = tokio::task::spawn_blocking(move || {
            started_rx.recv_timeout(Duration::from_secs(10)).unwrap()
        })
        .await
        .unwrap();
        assert_eq!(in_flight.file_name().unwrap(), "first");

        db.request_stop().unwrap();
        fs::write(inbound.join("late"), b"2").unwrap();

        run.await.unwrap().unwrap();

        assert!(outbound.join("first").exists());
        assert!(inbound.join("late").exists());
        assert_eq!(db.control_status().unwrap(), ControlStatus::Stopped);
        assert!(!pid_file.exists());
    }
}

use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use crossbeam_channel::{bounded, Sender, TrySendError};
use log::{debug, error, info, warn};
use threadpool::ThreadPool;

use crate::control::ControlStatus;
use crate::executor::{WorkflowExecutor, WorkflowOutcome};
use crate::fs_lock::FsLock;
use crate::routes::Route;

/// One accepted file. The lock is owned by the job and released once the
/// workflow has returned, or when the job is dropped unprocessed.
#[derive(Debug)]
pub struct Job {
    pub route: Route,
    pub path: PathBuf,
    pub lock: FsLock,
}

/// State shared by the pool handle and its workers
struct Shared {
    draining: AtomicBool,
    in_flight: AtomicUsize,
    queued: AtomicUsize,
    executor: WorkflowExecutor,
}

/// Fixed-width pool of workflow workers fed from a bounded queue.
///
/// Submission never blocks: a full queue hands the job back to the caller.
pub struct WorkerPool {
    sender: Mutex<Option<Sender<Job>>>,
    pool: ThreadPool,
    shared: Arc<Shared>,
    width: usize,
    capacity: usize,
}

impl WorkerPool {
    pub fn new(width: usize, capacity: usize, executor: WorkflowExecutor) -> Self {
        let width = width.max(1);
        let capacity = capacity.max(1);
        let (sender, receiver) = bounded::<Job>(capacity);
        let pool = ThreadPool::with_name("xfero-worker".into(), width);
        let shared = Arc::new(Shared {
            draining: AtomicBool::new(false),
            in_flight: AtomicUsize::new(0),
            queued: AtomicUsize::new(0),
            executor,
        });

        for worker in 0..width {
            let receiver = receiver.clone();
            let shared = Arc::clone(&shared);

            pool.execute(move || {
                while let Ok(job) = receiver.recv() {
                    shared.queued.fetch_sub(1, Ordering::AcqRel);
                    WorkerPool::process_job(worker, &shared, job);
                }
                debug!("Worker {} exiting", worker);
            });
        }

        info!("Worker pool started with {} worker(s), queue capacity {}", width, capacity);
        WorkerPool {
            sender: Mutex::new(Some(sender)),
            pool,
            shared,
            width,
            capacity,
        }
    }

    fn process_job(worker: usize, shared: &Shared, mut job: Job) {
        if !Self::may_start(shared) {
            debug!(
                "Worker {}: not starting {} while stopping",
                worker,
                job.path.display()
            );
            job.lock.release();
            return;
        }

        shared.in_flight.fetch_add(1, Ordering::AcqRel);
        // A panicking step must not take the worker loop down with it
        let result = panic::catch_unwind(AssertUnwindSafe(|| {
            shared.executor.run(&job.route, &job.path)
        }));
        job.lock.release();
        shared.in_flight.fetch_sub(1, Ordering::AcqRel);

        let report = match result {
            Ok(report) => report,
            Err(payload) => {
                error!(
                    "Worker {}: workflow for {} on route {} panicked: {}; the file may remain under the transient directory",
                    worker,
                    job.path.display(),
                    job.route.route_id,
                    Self::panic_message(payload.as_ref())
                );
                return;
            }
        };

        match report.outcome {
            WorkflowOutcome::Completed => debug!(
                "Worker {}: [{}] completed",
                worker, report.correlation
            ),
            WorkflowOutcome::Quarantined { kind, step, .. } => warn!(
                "Worker {}: [{}] quarantined at {} ({})",
                worker, report.correlation, step, kind
            ),
        }
    }

    fn panic_message(payload: &(dyn Any + Send)) -> &str {
        payload
            .downcast_ref::<&str>()
            .copied()
            .or_else(|| payload.downcast_ref::<String>().map(String::as_str))
            .unwrap_or("unknown panic")
    }

    /// A dequeued job only starts while the pool is admitting and the control
    /// row still says RUNNING.
    fn may_start(shared: &Shared) -> bool {
        if shared.draining.load(Ordering::Acquire) {
            return false;
        }
        match shared.executor.database().control_status() {
            Ok(ControlStatus::Running) => true,
            Ok(_) => false,
            Err(e) => {
                error!("Unable to read control status: {}", e);
                false
            }
        }
    }

    /// Queues `job` without blocking. A full or closed queue hands the job
    /// back.
    pub fn try_submit(&self, job: Job) -> Result<(), Job> {
        if self.shared.draining.load(Ordering::Acquire) {
            return Err(job);
        }
        let guard = self.sender.lock().unwrap();
        let sender = match guard.as_ref() {
            Some(sender) => sender,
            None => return Err(job),
        };
        self.shared.queued.fetch_add(1, Ordering::AcqRel);
        match sender.try_send(job) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(job)) | Err(TrySendError::Disconnected(job)) => {
                self.shared.queued.fetch_sub(1, Ordering::AcqRel);
                Err(job)
            }
        }
    }

    /// Jobs currently inside the executor
    pub fn in_flight(&self) -> usize {
        self.shared.in_flight.load(Ordering::Acquire)
    }

    /// Jobs waiting in the queue
    pub fn queued(&self) -> usize {
        self.shared.queued.load(Ordering::Acquire)
    }

    pub fn width(&self) -> usize {
        self.width
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn is_draining(&self) -> bool {
        self.shared.draining.load(Ordering::Acquire)
    }

    /// Stops admission and waits for the workers to finish. Queued jobs are
    /// released without being run; in-flight workflows run to completion.
    /// Safe to call more than once.
    pub fn drain(&self) {
        self.shared.draining.store(true, Ordering::Release);
        // Dropping the only sender lets workers fall out of `recv` once the
        // queue is empty
        let sender = self.sender.lock().unwrap().take();
        if sender.is_none() {
            self.pool.join();
            return;
        }
        drop(sender);

        info!(
            "Draining worker pool: {} in flight, {} queued",
            self.in_flight(),
            self.queued()
        );
        self.pool.join();
        info!("Worker pool drained");
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.drain();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::test_support::config_in;
    use crate::db::test_support::scratch_db;
    use crate::db::Database;
    use crate::fs_lock::{LockOptions, LockStyle};
    use crate::registry::{StepRegistry, StepResult};
    use crate::routes::NewRoute;
    use crate::workflow_items::{NewWorkflowItem, WorkflowItem};
    use std::fs;
    use std::path::Path;
    use std::sync::mpsc;
    use std::time::Duration;
    use tempfile::TempDir;

    struct Fixture {
        _dir: TempDir,
        db: Database,
        inbound: PathBuf,
        route: Route,
        config: Arc<crate::config::Config>,
    }

    fn fixture(step: &str) -> Fixture {
        let (dir, db) = scratch_db();
        let mut config = config_in(dir.path());
        config.prepare_directories().unwrap();
        let inbound = dir.path().join("in");
        fs::create_dir_all(&inbound).unwrap();
        let conn = db.get_connection().unwrap();
        let route = Route::create(&conn, &NewRoute::new("r", &inbound, ".*", 1)).unwrap();
        WorkflowItem::create(&conn, &NewWorkflowItem::new(route.route_id, step, 1)).unwrap();
        drop(conn);
        db.set_control_status(ControlStatus::Running).unwrap();
        Fixture {
            _dir: dir,
            db,
            inbound,
            route,
            config: Arc::new(config),
        }
    }

    fn job(fx: &Fixture, name: &str) -> Job {
        let path = fx.inbound.join(name);
        fs::write(&path, b"x").unwrap();
        let lock = FsLock::acquire(&path, &LockOptions::non_blocking(LockStyle::File)).unwrap();
        Job {
            route: fx.route.clone(),
            path,
            lock,
        }
    }

    fn pool(fx: &Fixture, registry: StepRegistry, width: usize, capacity: usize) -> WorkerPool {
        let executor = WorkflowExecutor::new(fx.config.clone(), fx.db.clone(), Arc::new(registry));
        WorkerPool::new(width, capacity, executor)
    }

    /// A registry whose `gate` step blocks until the test lets it go
    fn gated() -> (StepRegistry, mpsc::Sender<()>, mpsc::Receiver<()>) {
        let (release_tx, release_rx) = mpsc::channel::<()>();
        let (started_tx, started_rx) = mpsc::channel::<()>();
        let release_rx = Mutex::new(release_rx);
        let started_tx = Mutex::new(started_tx);
        let mut registry = StepRegistry::new();
        registry.register_step_fn("gate", move |p: &Path, _, _| {
            started_tx.lock().unwrap().send(()).unwrap();
            release_rx.lock().unwrap().recv().unwrap();
            Ok(StepResult::proceed(p))
        });
        (registry, release_tx, started_rx)
    }

    #[test]
    fn test_full_queue_hands_job_back() {
        let fx = fixture("gate");
        let (registry, release, started) = gated();
        let pool = pool(&fx, registry, 1, 1);

        pool.try_submit(job(&fx, "a")).unwrap();
        started.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(pool.in_flight(), 1);

        pool.try_submit(job(&fx, "b")).unwrap();
        assert_eq!(pool.queued(), 1);

        let rejected = pool.try_submit(job(&fx, "c")).unwrap_err();
        assert_eq!(rejected.path, fx.inbound.join("c"));
        drop(rejected);
        assert!(FsLock::available(&fx.inbound.join("c"), LockStyle::File));

        release.send(()).unwrap();
        started.recv_timeout(Duration::from_secs(5)).unwrap();
        release.send(()).unwrap();
        pool.drain();

        assert_eq!(pool.in_flight(), 0);
        assert!(fx.config.settings.outbound_directory.join("a").exists());
        assert!(fx.config.settings.outbound_directory.join("b").exists());
        assert!(FsLock::available(&fx.inbound.join("a"), LockStyle::File));
    }

    #[test]
    fn test_drain_lets_in_flight_finish_and_skips_queued() {
        let fx = fixture("gate");
        let (registry, release, started) = gated();
        let pool = pool(&fx, registry, 1, 4);

        pool.try_submit(job(&fx, "running")).unwrap();
        started.recv_timeout(Duration::from_secs(5)).unwrap();
        pool.try_submit(job(&fx, "waiting")).unwrap();

        let pool = Arc::new(pool);
        let drainer = {
            let pool = Arc::clone(&pool);
            std::thread::spawn(move || pool.drain())
        };
        while !pool.is_draining() {
            std::thread::sleep(Duration::from_millis(5));
        }
        assert!(pool.try_submit(job(&fx, "late")).is_err());

        release.send(()).unwrap();
        drainer.join().unwrap();

        assert!(fx.config.settings.outbound_directory.join("running").exists());
        // never started, left in place and unlocked for the next run
        assert!(fx.inbound.join("waiting").exists());
        assert!(FsLock::available(&fx.inbound.join("waiting"), LockStyle::File));
        pool.drain();
    }

    #[test]
    fn test_stopping_control_row_blocks_new_starts() {
        let fx = fixture("case.lower");
        fx.db.request_stop().unwrap();
        let pool = pool(&fx, StepRegistry::with_defaults(), 2, 2);

        pool.try_submit(job(&fx, "F")).unwrap();
        pool.drain();

        assert!(fx.inbound.join("F").exists());
        assert!(FsLock::available(&fx.inbound.join("F"), LockStyle::File));
    }

    #[test]
    fn test_panicking_step_keeps_worker_alive() {
        let fx = fixture("boom");
        let mut registry = StepRegistry::new();
        registry.register_step_fn("boom", |p: &Path, _, _| {
            if p.ends_with("boom") {
                panic!("step blew up");
            }
            Ok(StepResult::proceed(p))
        });
        let pool = pool(&fx, registry, 1, 4);

        pool.try_submit(job(&fx, "boom")).unwrap();
        pool.try_submit(job(&fx, "after")).unwrap();
        pool.drain();

        assert_eq!(pool.in_flight(), 0);
        assert!(fx.config.settings.outbound_directory.join("after").exists());
        assert!(FsLock::available(&fx.inbound.join("boom"), LockStyle::File));
    }

    #[test]
    fn test_pool_accepts_work_after_a_panic() {
        let fx = fixture("boom");
        let (release_tx, release_rx) = mpsc::channel::<()>();
        let release_rx = Mutex::new(release_rx);
        let mut registry = StepRegistry::new();
        registry.register_step_fn("boom", move |p: &Path, _, _| {
            release_rx.lock().unwrap().recv().unwrap();
            if p.ends_with("boom") {
                panic!("step blew up");
            }
            Ok(StepResult::proceed(p))
        });
        let pool = pool(&fx, registry, 1, 1);

        pool.try_submit(job(&fx, "boom")).unwrap();
        release_tx.send(()).unwrap();
        let mut waited = 0;
        while pool.in_flight() > 0 || pool.queued() > 0 {
            std::thread::sleep(Duration::from_millis(10));
            waited += 1;
            assert!(waited < 500, "worker never finished");
        }

        pool.try_submit(job(&fx, "after")).unwrap();
        release_tx.send(()).unwrap();
        pool.drain();
        assert!(fx.config.settings.outbound_directory.join("after").exists());
    }
}

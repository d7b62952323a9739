use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

use chrono::{Duration as ChronoDuration, Local, NaiveDateTime};
use log::{debug, error, info, warn, Level};
use logging_timer::timer;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

use crate::config::Config;
use crate::control::ControlStatus;
use crate::cron::CronSchedule;
use crate::db::Database;
use crate::error::XferoError;
use crate::registry::{parse_args, StepRegistry, TaskContext};
use crate::scheduled_tasks::ScheduledTask;

/// Longest stretch of missed seconds evaluated after a slow or late tick
const MAX_CATCH_UP_SECS: i64 = 300;

#[derive(Default)]
struct SchedulerState {
    last_tick: Option<NaiveDateTime>,
    /// `(task id, window start)` of every firing in the last day
    fired: HashSet<(i64, NaiveDateTime)>,
    /// Task id to the trigger text last reported as invalid
    reported_invalid: HashMap<i64, String>,
    running: Vec<JoinHandle<()>>,
}

/// Fires scheduled tasks whose trigger matches the wall clock.
pub struct TaskScheduler {
    config: Arc<Config>,
    db: Database,
    registry: Arc<StepRegistry>,
    state: Mutex<SchedulerState>,
}

impl TaskScheduler {
    pub fn new(config: Arc<Config>, db: Database, registry: Arc<StepRegistry>) -> Self {
        TaskScheduler {
            config,
            db,
            registry,
            state: Mutex::new(SchedulerState::default()),
        }
    }

    /// Tasks to fire for a tick at `now`. Every second since the previous
    /// tick is checked so that a coarse tick never skips a window; each task
    /// is returned at most once per window.
    pub fn due(&self, tasks: &[ScheduledTask], now: NaiveDateTime) -> Vec<ScheduledTask> {
        let mut state = self.state.lock().unwrap();

        let first = match state.last_tick {
            Some(last) if last < now => {
                let earliest = now - ChronoDuration::seconds(MAX_CATCH_UP_SECS - 1);
                (last + ChronoDuration::seconds(1)).max(earliest)
            }
            // first tick, or the clock went backwards
            _ => now,
        };
        state.last_tick = Some(now);

        let mut due = Vec::new();
        for task in tasks.iter().filter(|t| t.active) {
            let schedule = match CronSchedule::for_task(task) {
                Ok(schedule) => {
                    state.reported_invalid.remove(&task.scheduled_task_id);
                    schedule
                }
                Err(e) => {
                    let text = e.to_string();
                    if state.reported_invalid.get(&task.scheduled_task_id) != Some(&text) {
                        error!("Task {} ({}): {}", task.scheduled_task_id, task.name, text);
                        state
                            .reported_invalid
                            .insert(task.scheduled_task_id, text);
                    }
                    continue;
                }
            };

            let mut t = first;
            while t <= now {
                if schedule.matches(&t) {
                    let key = (task.scheduled_task_id, schedule.window_key(&t));
                    if state.fired.insert(key) {
                        due.push(task.clone());
                        break;
                    }
                }
                t += ChronoDuration::seconds(1);
            }
        }

        let horizon = now - ChronoDuration::days(1);
        state.fired.retain(|(_, window)| *window >= horizon);
        due
    }

    /// Runs one task to completion on the calling thread.
    pub fn execute(&self, task: &ScheduledTask) -> Result<(), XferoError> {
        let _tmr = timer!(Level::Debug; "scheduled_task", "{} ({})", task.name, task.function_kind);
        let func = self.registry.task(&task.function_kind).ok_or_else(|| {
            XferoError::Error(format!("no scheduled task registered as '{}'", task.function_kind))
        })?;
        let args = parse_args(&task.args).map_err(|e| XferoError::Error(e.to_string()))?;
        let ctx = TaskContext {
            task_id: task.scheduled_task_id,
            task_name: task.name.clone(),
            config: Arc::clone(&self.config),
            db: self.db.clone(),
        };
        func.run(&args, &ctx)
    }

    fn launch(self: &Arc<Self>, task: ScheduledTask) {
        info!(
            "Firing task {} '{}' ({})",
            task.scheduled_task_id, task.name, task.function_kind
        );
        let scheduler = Arc::clone(self);
        let handle = tokio::task::spawn_blocking(move || match scheduler.execute(&task) {
            Ok(()) => info!("Task '{}' finished", task.name),
            Err(e) => error!("Task '{}' failed: {}", task.name, e),
        });

        let mut state = self.state.lock().unwrap();
        state.running.retain(|h| !h.is_finished());
        state.running.push(handle);
    }

    /// Number of fired tasks that have not finished yet
    pub fn running(&self) -> usize {
        let state = self.state.lock().unwrap();
        state.running.iter().filter(|h| !h.is_finished()).count()
    }

    async fn tick(self: &Arc<Self>) {
        let now = Local::now().naive_local();
        let db = self.db.clone();
        let loaded = tokio::task::spawn_blocking(move || -> Result<Option<Vec<ScheduledTask>>, XferoError> {
            if db.control_status()? != ControlStatus::Running {
                return Ok(None);
            }
            db.scheduled_tasks_active().map(Some)
        })
        .await;

        let tasks = match loaded {
            Ok(Ok(Some(tasks))) => tasks,
            Ok(Ok(None)) => return,
            Ok(Err(e)) => {
                warn!("Scheduler: unable to load tasks: {}", e);
                return;
            }
            Err(e) => {
                error!("Scheduler: task loader panicked: {}", e);
                return;
            }
        };

        for task in self.due(&tasks, now) {
            self.launch(task);
        }
    }

    /// Ticks every `scheduler_tick` until shutdown, then waits for running
    /// tasks to finish.
    pub async fn run(self: Arc<Self>, mut shutdown_rx: broadcast::Receiver<()>) {
        let mut interval = tokio::time::interval(self.config.engine.scheduler_tick());
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        info!(
            "Task scheduler started (tick {:?})",
            self.config.engine.scheduler_tick()
        );

        loop {
            tokio::select! {
                _ = interval.tick() => self.tick().await,
                _ = shutdown_rx.recv() => {
                    info!("Task scheduler stopping");
                    break;
                }
            }
        }

        let handles = std::mem::take(&mut self.state.lock().unwrap().running);
        if !handles.is_empty() {
            info!("Waiting for {} scheduled task(s)", handles.len());
        }
        for handle in handles {
            if let Err(e) = handle.await {
                error!("Scheduled task panicked: {}", e);
            }
        }
        debug!("Task scheduler stopped");
    }
}

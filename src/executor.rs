//! Runs the ordered workflow of a route against one accepted file.
//!
//! The file is first detached from its monitored directory into a private
//! run directory `<transient>/route_<id>/<correlation>/`. Steps then run in
//! `(running_order, id)` order, followed by one `transfer` per xfer row.
//! Any failure quarantines the file into the error directory under
//! `<basename>.<order>_<step>.<timestamp>`; the executor itself never fails.

use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use log::{debug, error, info, warn, Level};
use logging_timer::timer;
use uuid::Uuid;

use crate::config::Config;
use crate::db::Database;
use crate::partners::Partner;
use crate::registry::{parse_args, StepContext, StepError, StepOutcome, StepRegistry};
use crate::routes::Route;
use crate::steps::TRANSFER_STEP;
use crate::utils::Utils;
use crate::xfers::Xfer;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QuarantineKind {
    StepUnknown,
    StepFailed,
    FileVanished,
    TransferFailed,
}

impl fmt::Display for QuarantineKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            QuarantineKind::StepUnknown => "StepUnknown",
            QuarantineKind::StepFailed => "StepFailed",
            QuarantineKind::FileVanished => "FileVanished",
            QuarantineKind::TransferFailed => "TransferFailed",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkflowOutcome {
    Completed,
    Quarantined {
        kind: QuarantineKind,
        /// `<order>_<step>` marker recorded in the quarantined name
        step: String,
        reason: String,
    },
}

#[derive(Debug, Clone)]
pub struct WorkflowReport {
    pub correlation: String,
    pub route_id: i64,
    pub outcome: WorkflowOutcome,
    /// Registry keys of the steps invoked, in order, transfers included
    pub steps_run: Vec<String>,
    /// Where the file ended up. `None` when it vanished or was deleted after
    /// transfer.
    pub final_path: Option<PathBuf>,
}

impl WorkflowReport {
    pub fn is_completed(&self) -> bool {
        self.outcome == WorkflowOutcome::Completed
    }
}

/// Failure raised while walking the chain, before it is turned into a
/// quarantine
struct Halt {
    kind: QuarantineKind,
    marker: String,
    reason: String,
}

impl Halt {
    fn new(kind: QuarantineKind, marker: impl Into<String>, reason: impl Into<String>) -> Self {
        Halt {
            kind,
            marker: marker.into(),
            reason: reason.into(),
        }
    }

    fn from_step_error(marker: String, err: StepError, transfer: bool) -> Self {
        let kind = match (&err, transfer) {
            (StepError::FileVanished(_), _) => QuarantineKind::FileVanished,
            (_, true) => QuarantineKind::TransferFailed,
            (_, false) => QuarantineKind::StepFailed,
        };
        Halt::new(kind, marker, err.to_string())
    }
}

pub struct WorkflowExecutor {
    config: Arc<Config>,
    db: Database,
    registry: Arc<StepRegistry>,
}

impl WorkflowExecutor {
    pub fn new(config: Arc<Config>, db: Database, registry: Arc<StepRegistry>) -> Self {
        WorkflowExecutor {
            config,
            db,
            registry,
        }
    }

    pub fn database(&self) -> &Database {
        &self.db
    }

    /// Processes `path` for `route`. The caller must hold the file's lock.
    pub fn run(&self, route: &Route, path: &Path) -> WorkflowReport {
        let correlation = Uuid::new_v4().simple().to_string();
        let _tmr = timer!(Level::Debug; "workflow", "{} route {}", correlation, route.route_id);
        let start = Instant::now();

        let original_name = Utils::file_name(path);
        let run_dir = self
            .config
            .settings
            .transient_directory
            .join(format!("route_{}", route.route_id))
            .join(&correlation);

        info!(
            "[{}] Starting workflow for {} on route {} ({})",
            correlation,
            path.display(),
            route.route_id,
            route.name
        );

        let mut report = WorkflowReport {
            correlation: correlation.clone(),
            route_id: route.route_id,
            outcome: WorkflowOutcome::Completed,
            steps_run: Vec::new(),
            final_path: None,
        };

        let ctx = StepContext {
            correlation: correlation.clone(),
            route_id: route.route_id,
            transient_dir: run_dir.clone(),
            outbound_dir: self.config.settings.outbound_directory.clone(),
            error_dir: self.config.settings.error_directory.clone(),
            partner: None,
            xfer: None,
            db: self.db.clone(),
        };

        let mut current = path.to_owned();
        let result = self
            .detach(path, &run_dir, &original_name)
            .and_then(|detached| {
                current = detached;
                self.run_chain(route, &ctx, &mut current, &mut report.steps_run)
            });

        match result {
            Ok(delete_after) => {
                report.final_path = self.finish(&ctx, &current, &run_dir, delete_after);
                info!(
                    "[{}] Workflow completed ({} step(s)) in {}",
                    correlation,
                    report.steps_run.len(),
                    Utils::format_elapsed(start.elapsed())
                );
            }
            Err(halt) => {
                report.final_path = self.quarantine(&ctx, &current, &original_name, &halt);
                report.outcome = WorkflowOutcome::Quarantined {
                    kind: halt.kind,
                    step: halt.marker,
                    reason: halt.reason,
                };
            }
        }

        let leftovers_to = if report.is_completed() {
            &ctx.outbound_dir
        } else {
            &ctx.error_dir
        };
        Self::close_run_dir(&correlation, &run_dir, report.final_path.as_deref(), leftovers_to);

        if let Some(limit) = self.config.engine.workflow_timeout() {
            if start.elapsed() > limit {
                warn!(
                    "[{}] Workflow ran for {}, exceeding the {} limit",
                    correlation,
                    Utils::format_elapsed(start.elapsed()),
                    Utils::format_elapsed(limit)
                );
            }
        }

        report
    }

    /// Moves the file out of the monitored directory so it is not detected
    /// again while the workflow runs.
    fn detach(&self, path: &Path, run_dir: &Path, name: &str) -> Result<PathBuf, Halt> {
        let target = run_dir.join(name);
        Utils::move_file(path, &target).map_err(|e| {
            let err = StepError::from_io(path, e);
            Halt::from_step_error("0_intake".into(), err, false)
        })?;
        Ok(target)
    }

    /// Walks the workflow items, then the xfers. Returns whether the source
    /// should be removed once everything succeeded.
    fn run_chain(
        &self,
        route: &Route,
        ctx: &StepContext,
        current: &mut PathBuf,
        steps_run: &mut Vec<String>,
    ) -> Result<bool, Halt> {
        let items = self.db.workflow_items_for(route.route_id).map_err(|e| {
            Halt::new(QuarantineKind::StepFailed, "0_workflow", e.to_string())
        })?;

        for item in &items {
            let key = item.registry_key();
            let marker = format!("{}_{}", item.running_order, key);

            let step = self.registry.step(&key).ok_or_else(|| {
                Halt::new(
                    QuarantineKind::StepUnknown,
                    marker.clone(),
                    format!("no step registered as '{}'", key),
                )
            })?;
            let args = parse_args(&item.args)
                .map_err(|e| Halt::from_step_error(marker.clone(), e, false))?;
            if !current.exists() {
                return Err(Halt::from_step_error(
                    marker,
                    StepError::FileVanished(current.clone()),
                    false,
                ));
            }

            debug!("[{}] Step {} on {}", ctx.correlation, marker, current.display());
            steps_run.push(key.clone());
            let result = step
                .run(current, &args, ctx)
                .map_err(|e| Halt::from_step_error(marker.clone(), e, false))?;
            *current = result.next_path.clone();

            match result.outcome {
                StepOutcome::Continue => {}
                StepOutcome::HaltSuccess => {
                    debug!("[{}] {} ended the step chain", ctx.correlation, marker);
                    break;
                }
                StepOutcome::HaltQuarantine => {
                    let reason = result.reason().unwrap_or("step requested quarantine");
                    return Err(Halt::new(QuarantineKind::StepFailed, marker, reason));
                }
            }
        }

        self.run_transfers(route, ctx, current, steps_run)
    }

    fn run_transfers(
        &self,
        route: &Route,
        ctx: &StepContext,
        current: &Path,
        steps_run: &mut Vec<String>,
    ) -> Result<bool, Halt> {
        let xfers = self.db.xfers_for(route.route_id).map_err(|e| {
            Halt::new(QuarantineKind::TransferFailed, "x_transfer", e.to_string())
        })?;
        if xfers.is_empty() {
            return Ok(false);
        }
        let step = self.registry.step(TRANSFER_STEP).ok_or_else(|| {
            Halt::new(
                QuarantineKind::StepUnknown,
                format!("x{}_{}", xfers[0].xfer_id, TRANSFER_STEP),
                format!("no step registered as '{}'", TRANSFER_STEP),
            )
        })?;

        let mut delete_source = false;
        for xfer in xfers {
            let marker = format!("x{}_{}", xfer.xfer_id, TRANSFER_STEP);
            let partner = self.partner_for(&xfer).map_err(|reason| {
                Halt::new(QuarantineKind::TransferFailed, marker.clone(), reason)
            })?;

            let args = parse_args(&xfer.params)
                .map_err(|e| Halt::from_step_error(marker.clone(), e, true))?;

            let mut xfer_ctx = ctx.clone();
            xfer_ctx.partner = Some(partner);
            xfer_ctx.xfer = Some(xfer.clone());

            steps_run.push(TRANSFER_STEP.to_owned());
            let result = step
                .run(current, &args, &xfer_ctx)
                .map_err(|e| Halt::from_step_error(marker.clone(), e, true))?;
            if result.outcome == StepOutcome::HaltQuarantine {
                let reason = result.reason().unwrap_or("transfer failed");
                return Err(Halt::new(QuarantineKind::TransferFailed, marker, reason));
            }
            delete_source |= xfer.delete_source;
        }
        Ok(delete_source)
    }

    fn partner_for(&self, xfer: &Xfer) -> Result<Partner, String> {
        let conn = self.db.get_connection().map_err(|e| e.to_string())?;
        Partner::get_by_id(&conn, xfer.partner_id)
            .map_err(|e| e.to_string())?
            .ok_or_else(|| format!("partner {} not found", xfer.partner_id))
    }

    /// Final placement after success: delete after transfer, or move a file
    /// still inside the run directory to outbound.
    fn finish(
        &self,
        ctx: &StepContext,
        current: &Path,
        run_dir: &Path,
        delete_source: bool,
    ) -> Option<PathBuf> {
        if delete_source {
            return match fs::remove_file(current) {
                Ok(()) => {
                    debug!("[{}] Source removed after transfer", ctx.correlation);
                    None
                }
                Err(e) => {
                    warn!("[{}] Failed to remove {}: {}", ctx.correlation, current.display(), e);
                    Some(current.to_owned())
                }
            };
        }
        if !current.starts_with(run_dir) {
            return Some(current.to_owned());
        }

        let destination = Utils::unique_destination(&ctx.outbound_dir, &Utils::file_name(current));
        match Utils::move_file(current, &destination) {
            Ok(()) => Some(destination),
            Err(e) => {
                error!(
                    "[{}] Failed to move {} to outbound: {}",
                    ctx.correlation,
                    current.display(),
                    e
                );
                Some(current.to_owned())
            }
        }
    }

    fn quarantine(
        &self,
        ctx: &StepContext,
        current: &Path,
        original_name: &str,
        halt: &Halt,
    ) -> Option<PathBuf> {
        error!(
            "[{}] Quarantining {} at {}: {} ({})",
            ctx.correlation, original_name, halt.marker, halt.reason, halt.kind
        );
        if !current.exists() {
            warn!("[{}] {} is gone; nothing to quarantine", ctx.correlation, current.display());
            return None;
        }

        let name = format!(
            "{}.{}.{}",
            original_name,
            halt.marker.replace(['/', '\\'], "_"),
            Utils::file_timestamp()
        );
        let destination = Utils::unique_destination(&ctx.error_dir, &name);
        match Utils::move_file(current, &destination) {
            Ok(()) => Some(destination),
            Err(e) => {
                error!(
                    "[{}] Failed to quarantine {}: {}",
                    ctx.correlation,
                    current.display(),
                    e
                );
                Some(current.to_owned())
            }
        }
    }

    /// Removes the run directory. Other files a step left there (such as an
    /// untargeted copy) are moved to `leftovers_to` first. A file that could
    /// not be placed keeps the directory alive for an operator.
    fn close_run_dir(
        correlation: &str,
        run_dir: &Path,
        final_path: Option<&Path>,
        leftovers_to: &Path,
    ) {
        if let Some(stranded) = final_path.filter(|p| p.starts_with(run_dir)) {
            error!(
                "[{}] {} could not be placed; left in {} for manual recovery",
                correlation,
                Utils::file_name(stranded),
                run_dir.display()
            );
            return;
        }

        let entries = match fs::read_dir(run_dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return,
            Err(e) => {
                warn!("[{}] Failed to read {}: {}", correlation, run_dir.display(), e);
                return;
            }
        };
        for entry in entries.flatten() {
            let path = entry.path();
            let destination = Utils::unique_destination(leftovers_to, &Utils::file_name(&path));
            if let Err(e) = Utils::move_file(&path, &destination) {
                error!(
                    "[{}] Failed to move leftover {}: {}; keeping {}",
                    correlation,
                    path.display(),
                    e,
                    run_dir.display()
                );
                return;
            }
            debug!("[{}] Leftover {} moved to {}", correlation, path.display(), destination.display());
        }

        if let Err(e) = fs::remove_dir(run_dir) {
            warn!("[{}] Failed to clean up {}: {}", correlation, run_dir.display(), e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::test_support::config_in;
    use crate::db::test_support::scratch_db;
    use crate::patterns::CotsPattern;
    use crate::registry::StepResult;
    use crate::routes::NewRoute;
    use crate::workflow_items::{NewWorkflowItem, WorkflowItem};
    use crate::xfers::NewXfer;
    use pretty_assertions::assert_eq;
    use std::sync::Mutex;
    use tempfile::TempDir;

    struct Fixture {
        dir: TempDir,
        db: Database,
        config: Arc<Config>,
        inbound: PathBuf,
    }

    impl Fixture {
        fn new() -> Self {
            let (dir, db) = scratch_db();
            let mut config = config_in(dir.path());
            config.prepare_directories().unwrap();
            let inbound = dir.path().join("in");
            fs::create_dir_all(&inbound).unwrap();
            Fixture {
                dir,
                db,
                config: Arc::new(config),
                inbound,
            }
        }

        fn route(&self, steps: &[(&str, i64, &str)]) -> Route {
            let conn = self.db.get_connection().unwrap();
            let route = Route::create(&conn, &NewRoute::new("r", &self.inbound, ".*", 1)).unwrap();
            for (kind, order, args) in steps {
                WorkflowItem::create(
                    &conn,
                    &NewWorkflowItem::new(route.route_id, kind, *order).with_args(args),
                )
                .unwrap();
            }
            route
        }

        fn drop_file(&self, name: &str) -> PathBuf {
            let path = self.inbound.join(name);
            fs::write(&path, b"payload\r\n").unwrap();
            path
        }

        fn executor(&self, registry: StepRegistry) -> WorkflowExecutor {
            WorkflowExecutor::new(self.config.clone(), self.db.clone(), Arc::new(registry))
        }

        fn names_in(&self, dir: &Path) -> Vec<String> {
            let mut names: Vec<String> = walk(dir)
                .into_iter()
                .map(|p| Utils::file_name(&p))
                .collect();
            names.sort();
            names
        }

        fn transient_files(&self) -> usize {
            walk(&self.config.settings.transient_directory).len()
        }
    }

    fn walk(dir: &Path) -> Vec<PathBuf> {
        let mut out = Vec::new();
        if let Ok(entries) = fs::read_dir(dir) {
            for entry in entries.flatten() {
                let path = entry.path();
                if path.is_dir() {
                    out.extend(walk(&path));
                } else {
                    out.push(path);
                }
            }
        }
        out
    }

    #[test]
    fn test_happy_path_lower_then_move() {
        let fx = Fixture::new();
        let out = fx.dir.path().join("out");
        let route = fx.route(&[
            ("case.lower", 1, ""),
            ("move", 2, &format!(r#"{{"target":"{}"}}"#, out.display())),
        ]);
        let path = fx.drop_file("ALPHA.TXT");

        let report = fx.executor(StepRegistry::with_defaults()).run(&route, &path);

        assert!(report.is_completed(), "{:?}", report.outcome);
        assert_eq!(report.steps_run, vec!["case.lower", "move"]);
        assert_eq!(report.final_path, Some(out.join("alpha.txt")));
        assert!(out.join("alpha.txt").exists());
        assert!(fx.names_in(&fx.inbound).is_empty());
        assert_eq!(fx.transient_files(), 0);
        assert!(fx.names_in(&fx.config.settings.error_directory).is_empty());
    }

    #[test]
    fn test_steps_run_in_order_with_gaps_and_function_call() {
        let fx = Fixture::new();
        let conn = fx.db.get_connection().unwrap();
        let route = Route::create(&conn, &NewRoute::new("r", &fx.inbound, ".*", 1)).unwrap();
        for (kind, function_call, order) in [("rec", "c", 30), ("rec", "a", 5), ("rec", "b", 17)] {
            WorkflowItem::create(
                &conn,
                &NewWorkflowItem::new(route.route_id, kind, order).with_function_call(function_call),
            )
            .unwrap();
        }
        drop(conn);

        let seen = Arc::new(Mutex::new(Vec::new()));
        let mut registry = StepRegistry::new();
        for name in ["a", "b", "c"] {
            let seen = seen.clone();
            registry.register_step_fn(&format!("rec.{}", name), move |p, _, _| {
                seen.lock().unwrap().push(name);
                Ok(StepResult::proceed(p))
            });
        }

        let path = fx.drop_file("f");
        let report = fx.executor(registry).run(&route, &path);
        assert!(report.is_completed());
        assert_eq!(*seen.lock().unwrap(), vec!["a", "b", "c"]);
        // left in the run directory, so delivered to outbound
        assert_eq!(
            report.final_path,
            Some(fx.config.settings.outbound_directory.join("f"))
        );
    }

    #[test]
    fn test_unknown_step_quarantines() {
        let fx = Fixture::new();
        let route = fx.route(&[("does_not_exist", 1, "")]);
        let path = fx.drop_file("f");

        let report = fx.executor(StepRegistry::with_defaults()).run(&route, &path);

        match &report.outcome {
            WorkflowOutcome::Quarantined { kind, step, .. } => {
                assert_eq!(*kind, QuarantineKind::StepUnknown);
                assert_eq!(step, "1_does_not_exist");
            }
            other => panic!("unexpected outcome {:?}", other),
        }
        let errors = fx.names_in(&fx.config.settings.error_directory);
        assert_eq!(errors.len(), 1);
        assert!(errors[0].starts_with("f.1_does_not_exist."), "{}", errors[0]);
        assert!(fx.names_in(&fx.inbound).is_empty());
        assert!(fx.names_in(&fx.config.settings.outbound_directory).is_empty());
        assert_eq!(fx.transient_files(), 0);
    }

    #[test]
    fn test_step_quarantine_keeps_original_name() {
        let fx = Fixture::new();
        let route = fx.route(&[("case.lower", 1, ""), ("exit", 2, r#"{"command":"false"}"#)]);
        let path = fx.drop_file("UPPER");

        let report = fx.executor(StepRegistry::with_defaults()).run(&route, &path);
        assert!(matches!(
            report.outcome,
            WorkflowOutcome::Quarantined { kind: QuarantineKind::StepFailed, .. }
        ));
        let errors = fx.names_in(&fx.config.settings.error_directory);
        assert!(errors[0].starts_with("UPPER.2_exit."), "{}", errors[0]);
    }

    #[test]
    fn test_halt_success_skips_remaining_steps() {
        let fx = Fixture::new();
        let mut registry = StepRegistry::with_defaults();
        registry.register_step_fn("stop", |p, _, _| Ok(StepResult::halt_success(p)));
        let route = fx.route(&[("stop", 1, ""), ("does_not_exist", 2, "")]);
        let path = fx.drop_file("f");

        let report = fx.executor(registry).run(&route, &path);
        assert!(report.is_completed());
        assert_eq!(report.steps_run, vec!["stop"]);
    }

    #[test]
    fn test_vanished_file_is_reported() {
        let fx = Fixture::new();
        let mut registry = StepRegistry::new();
        registry.register_step_fn("eat", |p, _, _| {
            fs::remove_file(p)?;
            Ok(StepResult::proceed(p))
        });
        registry.register_step_fn("touch", |p, _, _| {
            fs::metadata(p).map_err(|e| StepError::from_io(p, e))?;
            Ok(StepResult::proceed(p))
        });
        let route = fx.route(&[("eat", 1, ""), ("touch", 2, "")]);
        let path = fx.drop_file("f");

        let report = fx.executor(registry).run(&route, &path);
        assert!(matches!(
            report.outcome,
            WorkflowOutcome::Quarantined { kind: QuarantineKind::FileVanished, .. }
        ));
        assert_eq!(report.final_path, None);
        assert!(fx.names_in(&fx.config.settings.error_directory).is_empty());
        assert_eq!(fx.transient_files(), 0);
    }

    #[test]
    fn test_missing_source_is_vanished_at_intake() {
        let fx = Fixture::new();
        let route = fx.route(&[]);
        let report = fx
            .executor(StepRegistry::with_defaults())
            .run(&route, &fx.inbound.join("never-there"));
        assert!(matches!(
            report.outcome,
            WorkflowOutcome::Quarantined { kind: QuarantineKind::FileVanished, .. }
        ));
    }

    #[test]
    fn test_invalid_args_quarantine() {
        let fx = Fixture::new();
        let route = fx.route(&[("move", 1, "{not json")]);
        let path = fx.drop_file("f");
        let report = fx.executor(StepRegistry::with_defaults()).run(&route, &path);
        assert!(matches!(
            report.outcome,
            WorkflowOutcome::Quarantined { kind: QuarantineKind::StepFailed, .. }
        ));
        assert_eq!(fx.names_in(&fx.config.settings.error_directory).len(), 1);
    }

    fn add_xfer(fx: &Fixture, route: &Route, template: &str, delete_source: bool) {
        add_xfer_with_params(fx, route, template, "", delete_source);
    }

    fn add_xfer_with_params(
        fx: &Fixture,
        route: &Route,
        template: &str,
        params: &str,
        delete_source: bool,
    ) {
        let conn = fx.db.get_connection().unwrap();
        let partner = Partner::create(&conn, &Partner::named("P")).unwrap();
        let cots = CotsPattern::create(&conn, template, "shell", template, "").unwrap();
        Xfer::create(
            &conn,
            &NewXfer {
                route_id: route.route_id,
                cots_pattern_id: cots.cots_pattern_id,
                partner_id: partner.partner_id,
                command: String::new(),
                params: params.to_owned(),
                delete_source,
            },
        )
        .unwrap();
    }

    #[test]
    fn test_transfers_then_delete_source() {
        let fx = Fixture::new();
        let route = fx.route(&[("line_end.dos2unix", 1, "")]);
        let sent = fx.dir.path().join("sent");
        fs::create_dir_all(&sent).unwrap();
        add_xfer(&fx, &route, &format!("cp {{FileName}} {}", sent.display()), true);
        let path = fx.drop_file("f");

        let report = fx.executor(StepRegistry::with_defaults()).run(&route, &path);
        assert!(report.is_completed(), "{:?}", report.outcome);
        assert_eq!(report.steps_run, vec!["line_end.dos2unix", "transfer"]);
        assert_eq!(fs::read(sent.join("f")).unwrap(), b"payload\n");
        assert_eq!(report.final_path, None);
        assert!(fx.names_in(&fx.config.settings.outbound_directory).is_empty());
        assert_eq!(fx.transient_files(), 0);
    }

    #[test]
    fn test_failed_transfer_quarantines() {
        let fx = Fixture::new();
        let route = fx.route(&[]);
        add_xfer(&fx, &route, "false", false);
        let path = fx.drop_file("f");

        let report = fx.executor(StepRegistry::with_defaults()).run(&route, &path);
        match &report.outcome {
            WorkflowOutcome::Quarantined { kind, step, .. } => {
                assert_eq!(*kind, QuarantineKind::TransferFailed);
                assert!(step.ends_with("_transfer"));
                assert!(step.starts_with('x'));
            }
            other => panic!("unexpected outcome {:?}", other),
        }
        assert_eq!(fx.names_in(&fx.config.settings.error_directory).len(), 1);
    }

    #[test]
    fn test_xfer_params_bound_transfer_timeout() {
        let fx = Fixture::new();
        let route = fx.route(&[]);
        add_xfer_with_params(&fx, &route, "sleep 5", r#"{"timeout_secs":1}"#, true);
        let path = fx.drop_file("slow");

        let started = Instant::now();
        let report = fx.executor(StepRegistry::with_defaults()).run(&route, &path);
        assert!(started.elapsed() < std::time::Duration::from_secs(4));
        match &report.outcome {
            WorkflowOutcome::Quarantined { kind, reason, .. } => {
                assert_eq!(*kind, QuarantineKind::TransferFailed);
                assert!(reason.contains("timed out"), "{}", reason);
            }
            other => panic!("unexpected outcome {:?}", other),
        }
        let errors = fx.names_in(&fx.config.settings.error_directory);
        assert_eq!(errors.len(), 1);
        assert!(errors[0].starts_with("slow.x"), "{}", errors[0]);
    }

    #[test]
    fn test_malformed_xfer_params_quarantine() {
        let fx = Fixture::new();
        let route = fx.route(&[]);
        add_xfer_with_params(&fx, &route, "true", "{oops", false);
        let path = fx.drop_file("f");

        let report = fx.executor(StepRegistry::with_defaults()).run(&route, &path);
        assert!(matches!(
            report.outcome,
            WorkflowOutcome::Quarantined { kind: QuarantineKind::TransferFailed, .. }
        ));
        assert_eq!(fx.names_in(&fx.config.settings.error_directory).len(), 1);
    }

    #[test]
    fn test_unusable_error_dir_keeps_file_in_run_dir() {
        let fx = Fixture::new();
        let error_dir = &fx.config.settings.error_directory;
        fs::remove_dir_all(error_dir).unwrap();
        fs::write(error_dir, b"not a directory").unwrap();

        let mut registry = StepRegistry::new();
        registry.register_step_fn("reject", |p, _, _| Ok(StepResult::quarantine(p, "rejected")));
        let route = fx.route(&[("reject", 1, "")]);
        let path = fx.drop_file("precious");

        let report = fx.executor(registry).run(&route, &path);
        assert!(!report.is_completed());
        let kept = report.final_path.expect("file location is reported");
        assert!(kept.starts_with(&fx.config.settings.transient_directory));
        assert_eq!(fs::read(&kept).unwrap(), b"payload\r\n");
    }

    #[test]
    fn test_unusable_outbound_dir_keeps_file_in_run_dir() {
        let fx = Fixture::new();
        let outbound = &fx.config.settings.outbound_directory;
        fs::remove_dir_all(outbound).unwrap();
        fs::write(outbound, b"not a directory").unwrap();

        let route = fx.route(&[("case.lower", 1, "")]);
        let path = fx.drop_file("f");

        let report = fx.executor(StepRegistry::with_defaults()).run(&route, &path);
        assert!(report.is_completed());
        let kept = report.final_path.expect("file location is reported");
        assert!(kept.starts_with(&fx.config.settings.transient_directory));
        assert!(kept.exists());
    }

    #[test]
    fn test_untargeted_copy_is_delivered_with_the_file() {
        let fx = Fixture::new();
        let route = fx.route(&[("copy", 1, "")]);
        let path = fx.drop_file("f");

        let report = fx.executor(StepRegistry::with_defaults()).run(&route, &path);
        assert!(report.is_completed(), "{:?}", report.outcome);
        let delivered = fx.names_in(&fx.config.settings.outbound_directory);
        assert_eq!(delivered.len(), 2, "{:?}", delivered);
        assert!(delivered.contains(&"f".to_owned()));
        assert_eq!(fx.transient_files(), 0);
        let run_dirs = fs::read_dir(
            fx.config
                .settings
                .transient_directory
                .join(format!("route_{}", route.route_id)),
        )
        .unwrap()
        .count();
        assert_eq!(run_dirs, 0);
    }
}

//! Execution session: single dispatcher, parallel workers
//!
//! The dispatcher performs only in-process bookkeeping: it refreshes
//! the ready queue, acquires resources, fans work out to bounded
//! worker tasks, and applies published results.  Workers execute the
//! child processes.  A case never starts before its resolved
//! dependencies reach a terminal status satisfying its edge filters.

use chrono::Utc;
use std::collections::BTreeMap;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::task::JoinSet;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::case::{CaseId, StatusName};
use crate::catalog::Catalog;
use crate::error::EngineResult;
use crate::queue::ReadyQueue;
use crate::resource::{Assignment, ResourcePool};
use crate::runner::{run_case, CaseResult, RunContext};
use crate::store::Workspace;

/// Session-level execution options
#[derive(Debug, Clone)]
pub struct SessionOptions {
    /// Upper bound on concurrent workers
    pub workers: usize,
    /// Session timeout in seconds; None or 0 disables it
    pub session_timeout: Option<f64>,
    /// Default per-case timeout when the case declares none
    pub default_timeout: f64,
    pub timeout_multiplier: f64,
    /// Seconds between SIGTERM and SIGKILL on cancellation
    pub grace_period: f64,
    pub diff_exit_code: i32,
    /// Cancel the session on the first FAIL/DIFF/TIMEOUT
    pub fail_fast: bool,
    /// FAIL and TIMEOUT cases re-queue this many times
    pub max_retries: u32,
    /// Environment exports for every case
    pub env: Vec<(String, String)>,
    /// Write the catalog index on entry/exit.  Batch-exec sessions
    /// disable this: the index already exists and sibling jobs may be
    /// writing their own members
    pub persist_index: bool,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            workers: num_cpus::get(),
            session_timeout: None,
            default_timeout: 300.0,
            timeout_multiplier: 1.0,
            grace_period: 5.0,
            diff_exit_code: 64,
            fail_fast: false,
            max_retries: 0,
            env: Vec::new(),
            persist_index: true,
        }
    }
}

/// Result counts for a finished session
#[derive(Debug, Clone, Default)]
pub struct SessionSummary {
    counts: BTreeMap<StatusName, usize>,
}

impl SessionSummary {
    pub fn from_catalog(catalog: &Catalog) -> Self {
        let mut counts = BTreeMap::new();
        for case in catalog.active() {
            *counts.entry(case.status.name).or_insert(0) += 1;
        }
        Self { counts }
    }

    pub fn count(&self, status: StatusName) -> usize {
        self.counts.get(&status).copied().unwrap_or(0)
    }

    pub fn total(&self) -> usize {
        self.counts.values().sum()
    }

    pub fn counts(&self) -> &BTreeMap<StatusName, usize> {
        &self.counts
    }

    /// Session exit code bitfield: bit 1 DIFF, bit 2 FAIL, bit 3
    /// TIMEOUT, bit 4 SKIP/NOT_RUN, bit 5 READY (never ran), bit 6
    /// CANCELLED.  Zero iff every active case succeeded.
    pub fn exit_code(&self) -> i32 {
        let mut code = 0;
        for (status, count) in &self.counts {
            if *count == 0 {
                continue;
            }
            code |= match status {
                StatusName::Diff => 1 << 1,
                StatusName::Fail => 1 << 2,
                StatusName::Timeout => 1 << 3,
                StatusName::Skip | StatusName::NotRun => 1 << 4,
                StatusName::Created | StatusName::Pending | StatusName::Ready
                | StatusName::Running => 1 << 5,
                StatusName::Cancelled => 1 << 6,
                StatusName::Success => 0,
            };
        }
        code
    }
}

/// A runnable test session over a resolved catalog
pub struct Session {
    catalog: Catalog,
    pool: Arc<ResourcePool>,
    workspace: Workspace,
    opts: SessionOptions,
    cancel: Arc<AtomicBool>,
    cancel_notify: Arc<Notify>,
}

impl Session {
    pub fn new(
        catalog: Catalog,
        pool: Arc<ResourcePool>,
        workspace: Workspace,
        opts: SessionOptions,
    ) -> Self {
        Self {
            catalog,
            pool,
            workspace,
            opts,
            cancel: Arc::new(AtomicBool::new(false)),
            cancel_notify: Arc::new(Notify::new()),
        }
    }

    pub fn catalog(&self) -> &Catalog {
        &self.catalog
    }

    pub fn into_catalog(self) -> Catalog {
        self.catalog
    }

    /// Shared flag external callers (signal handlers, batch drivers)
    /// may set to cancel the session
    pub fn cancel_handle(&self) -> (Arc<AtomicBool>, Arc<Notify>) {
        (self.cancel.clone(), self.cancel_notify.clone())
    }

    fn trigger_cancel(&self, reason: &str) {
        if !self.cancel.swap(true, Ordering::SeqCst) {
            warn!(%reason, "cancelling session");
        }
        self.cancel_notify.notify_waiters();
    }

    /// Drive every active case to a terminal status
    pub async fn run(&mut self) -> EngineResult<SessionSummary> {
        self.preflight()?;
        if self.opts.persist_index {
            self.workspace.save_catalog(&self.catalog)?;
        }

        let run_ctx = RunContext {
            grace_period: Duration::from_secs_f64(self.opts.grace_period.max(0.0)),
            diff_exit_code: self.opts.diff_exit_code,
            env: self.opts.env.clone(),
            cancel: self.cancel.clone(),
            cancel_notify: self.cancel_notify.clone(),
        };

        let mut queue = ReadyQueue::new();
        let mut workers: JoinSet<CaseResult> = JoinSet::new();
        let mut inflight: HashMap<tokio::task::Id, (CaseId, Assignment)> = HashMap::new();
        let mut deadline = self
            .opts
            .session_timeout
            .filter(|t| *t > 0.0)
            .map(|t| Instant::now() + Duration::from_secs_f64(t));

        loop {
            queue.refresh(&mut self.catalog)?;
            if queue.finished(&self.catalog) {
                break;
            }

            let mut dispatched = 0usize;
            if !self.cancel.load(Ordering::SeqCst) {
                dispatched = self.dispatch(&mut queue, &mut workers, &mut inflight, &run_ctx)?;
            }

            if queue.running() == 0 {
                if self.cancel.load(Ordering::SeqCst) {
                    self.cancel_remaining()?;
                    break;
                }
                if dispatched == 0 {
                    // accommodates() passed at preflight, so an idle
                    // pool must admit some ready case; bail rather
                    // than spin if it does not
                    warn!("no case is dispatchable; leaving remaining cases unscheduled");
                    break;
                }
                continue;
            }

            // block until a worker completes (or the session times out)
            let joined = match deadline {
                Some(at) => tokio::select! {
                    joined = workers.join_next_with_id() => joined,
                    _ = tokio::time::sleep_until(at) => {
                        self.trigger_cancel("session timeout");
                        deadline = None;
                        continue;
                    }
                },
                None => workers.join_next_with_id().await,
            };
            match joined {
                Some(Ok((task_id, result))) => {
                    if let Some((id, assignment)) = inflight.remove(&task_id) {
                        self.finish_case(&mut queue, &id, assignment, result)?;
                    }
                }
                Some(Err(join_error)) => {
                    // a worker panicked; isolate it and fail its case
                    let task_id = join_error.id();
                    if let Some((id, assignment)) = inflight.remove(&task_id) {
                        self.pool.release(&assignment);
                        let case = self.catalog.case(&id)?.clone();
                        queue.mark_done(&id, case.exclusive);
                        if let Some(case) = self.catalog.get_mut(&id) {
                            case.status.set(
                                StatusName::Fail,
                                Some(format!("worker failed: {join_error}")),
                            )?;
                            case.stop = Some(Utc::now());
                        }
                    }
                }
                None => {}
            }
        }

        if self.opts.persist_index {
            self.workspace.save_catalog(&self.catalog)?;
        } else {
            for case in self.catalog.active() {
                self.workspace.save_case(case)?;
            }
        }
        let summary = SessionSummary::from_catalog(&self.catalog);
        info!(
            total = summary.total(),
            success = summary.count(StatusName::Success),
            fail = summary.count(StatusName::Fail),
            "session finished"
        );
        Ok(summary)
    }

    /// Pre-run pass: directories, effective timeouts, and resource
    /// feasibility (infeasible cases fail before anything runs)
    fn preflight(&mut self) -> EngineResult<()> {
        self.workspace.assign_directories(&mut self.catalog);
        let pool = self.pool.clone();
        let opts = self.opts.clone();
        for case in self.catalog.iter_mut() {
            if !case.active() || case.status.name.is_terminal() {
                continue;
            }
            if let Err(reason) = pool.accommodates(&case.resources) {
                warn!(case = %case.display_name(), %reason, "case cannot be scheduled");
                case.status.set(
                    StatusName::Fail,
                    Some(format!("resource unsatisfiable: {reason}")),
                )?;
                continue;
            }
            let timeout = case.timeout.unwrap_or(opts.default_timeout);
            case.timeout = Some(timeout * opts.timeout_multiplier);
        }
        Ok(())
    }

    fn dispatch(
        &mut self,
        queue: &mut ReadyQueue,
        workers: &mut JoinSet<CaseResult>,
        inflight: &mut HashMap<tokio::task::Id, (CaseId, Assignment)>,
        run_ctx: &RunContext,
    ) -> EngineResult<usize> {
        let mut dispatched = 0;
        for id in queue.candidates(&self.catalog) {
            if queue.running() >= self.opts.workers {
                break;
            }
            let case = self.catalog.case(&id)?;
            // exclusive cases run alone
            if case.exclusive && queue.running() > 0 {
                continue;
            }
            let assignment = match self.pool.acquire(&case.resources) {
                Some(assignment) => assignment,
                None => continue,
            };
            let case_clone = case.clone();
            let workdir = case_clone
                .working_directory
                .clone()
                .unwrap_or_else(|| self.workspace.root().join(case_clone.id.to_string()));

            let exclusive = case_clone.exclusive;
            {
                let case = self
                    .catalog
                    .get_mut(&id)
                    .ok_or_else(|| crate::error::EngineError::CaseNotFound(id.to_string()))?;
                case.status.set(StatusName::Running, None)?;
                case.start = Some(Utc::now());
                case.assignment = Some(assignment.clone());
            }
            queue.mark_running(&id, exclusive);
            dispatched += 1;
            debug!(case = %case_clone.display_name(), "dispatching");

            let ctx = run_ctx.clone();
            let task_assignment = assignment.clone();
            let handle = workers.spawn(async move {
                run_case(&case_clone, &workdir, &task_assignment, &ctx).await
            });
            inflight.insert(handle.id(), (id.clone(), assignment));

            if exclusive {
                break;
            }
        }
        Ok(dispatched)
    }

    fn finish_case(
        &mut self,
        queue: &mut ReadyQueue,
        id: &CaseId,
        assignment: Assignment,
        result: CaseResult,
    ) -> EngineResult<()> {
        self.pool.release(&assignment);
        let retry_allowed = matches!(result.status, StatusName::Fail | StatusName::Timeout)
            && !self.cancel.load(Ordering::SeqCst);
        let fail_fast = self.opts.fail_fast;
        let max_retries = self.opts.max_retries;

        let exclusive;
        let final_status;
        {
            let case = self
                .catalog
                .get_mut(id)
                .ok_or_else(|| crate::error::EngineError::CaseNotFound(id.to_string()))?;
            exclusive = case.exclusive;
            case.attempts += 1;
            if retry_allowed && case.attempts <= max_retries {
                warn!(
                    case = %case.display_name(),
                    attempt = case.attempts,
                    status = %result.status,
                    "re-queueing failed case"
                );
                case.status.set(StatusName::Ready, Some("retrying".to_string()))?;
                case.start = None;
                case.assignment = None;
                queue.mark_done(id, exclusive);
                return Ok(());
            }
            case.status.set(result.status, result.message.clone())?;
            case.start = Some(result.start);
            case.stop = Some(result.stop);
            case.returncode = result.returncode;
            case.measurements = result.measurements.clone();
            case.assignment = None;
            final_status = case.status.name;
            info!(
                case = %case.display_name(),
                status = %final_status,
                returncode = ?result.returncode,
                "finished"
            );
        }
        queue.mark_done(id, exclusive);
        let case = self.catalog.case(id)?.clone();
        self.workspace.save_case(&case)?;

        if fail_fast
            && matches!(
                final_status,
                StatusName::Fail | StatusName::Diff | StatusName::Timeout
            )
        {
            self.trigger_cancel("fail-fast");
        }
        Ok(())
    }

    /// Mark everything still pending as cancelled once the running set
    /// has drained
    fn cancel_remaining(&mut self) -> EngineResult<()> {
        for case in self.catalog.iter_mut() {
            if case.active() && !case.status.name.is_terminal() {
                case.status
                    .set(StatusName::Cancelled, Some("session cancelled".to_string()))?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::case::{DepEdge, Scalar, TestCase};
    use std::collections::BTreeMap as Map;

    fn sh_case(family: &str, n: i64, script: &str) -> TestCase {
        let mut params = Map::new();
        params.insert("n".to_string(), Scalar::Int(n));
        let mut case =
            TestCase::new("/src", format!("{family}.canary.toml"), family, params);
        case.command = vec![
            "/bin/sh".to_string(),
            "-c".to_string(),
            script.to_string(),
        ];
        case.resources = vec![vec![crate::case::ResourceRequest::new("cpus", 1)]];
        case.runtime_estimate = 1.0;
        case
    }

    fn session(cases: Vec<TestCase>, opts: SessionOptions) -> (Session, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let catalog = Catalog::from_cases(cases).unwrap();
        let pool = Arc::new(ResourcePool::local(4, 1));
        let workspace = Workspace::create(dir.path()).unwrap();
        (Session::new(catalog, pool, workspace, opts), dir)
    }

    #[tokio::test]
    async fn test_independent_cases_all_succeed() {
        let cases = vec![
            sh_case("a", 1, "exit 0"),
            sh_case("b", 1, "exit 0"),
            sh_case("c", 1, "exit 0"),
        ];
        let (mut session, _dir) = session(cases, SessionOptions::default());
        let summary = session.run().await.unwrap();
        assert_eq!(summary.count(StatusName::Success), 3);
        assert_eq!(summary.exit_code(), 0);
    }

    #[tokio::test]
    async fn test_dependency_ordering_is_enforced() {
        let up = sh_case("up", 1, "sleep 0.2; exit 0");
        let mut down = sh_case("down", 1, "exit 0");
        down.dependencies.push(DepEdge {
            id: up.id.clone(),
            result: Default::default(),
        });
        let up_id = up.id.clone();
        let down_id = down.id.clone();
        let (mut session, _dir) = session(vec![up, down], SessionOptions::default());
        let summary = session.run().await.unwrap();
        assert_eq!(summary.count(StatusName::Success), 2);
        let catalog = session.catalog();
        let up_stop = catalog.get(&up_id).unwrap().stop.unwrap();
        let down_start = catalog.get(&down_id).unwrap().start.unwrap();
        assert!(up_stop <= down_start, "dependency finished before dependent started");
    }

    #[tokio::test]
    async fn test_failed_dependency_cascades_not_run() {
        let up = sh_case("up", 1, "exit 1");
        let mut down = sh_case("down", 1, "exit 0");
        down.dependencies.push(DepEdge {
            id: up.id.clone(),
            result: Default::default(),
        });
        let (mut session, _dir) = session(vec![up, down], SessionOptions::default());
        let summary = session.run().await.unwrap();
        assert_eq!(summary.count(StatusName::Fail), 1);
        assert_eq!(summary.count(StatusName::NotRun), 1);
        // bit 2 (FAIL) and bit 4 (NOT_RUN)
        assert_eq!(summary.exit_code(), (1 << 2) | (1 << 4));
    }

    #[tokio::test]
    async fn test_infeasible_case_fails_without_blocking() {
        let mut infeasible = sh_case("big", 1, "exit 0");
        infeasible.resources = vec![vec![crate::case::ResourceRequest::new("gpus", 2)]];
        let feasible = sh_case("ok", 1, "exit 0");
        let (mut session, _dir) = session(vec![infeasible, feasible], SessionOptions::default());
        let summary = session.run().await.unwrap();
        assert_eq!(summary.count(StatusName::Fail), 1);
        assert_eq!(summary.count(StatusName::Success), 1);
        let failed = session
            .catalog()
            .iter()
            .find(|c| c.family == "big")
            .unwrap();
        assert!(failed
            .status
            .message
            .as_deref()
            .unwrap()
            .contains("resource unsatisfiable"));
    }

    #[tokio::test]
    async fn test_retries_requeue_failed_cases() {
        let mut opts = SessionOptions::default();
        opts.max_retries = 2;
        let case = sh_case("flaky", 1, "exit 1");
        let id = case.id.clone();
        let (mut session, _dir) = session(vec![case], opts);
        let summary = session.run().await.unwrap();
        assert_eq!(summary.count(StatusName::Fail), 1);
        assert_eq!(session.catalog().get(&id).unwrap().attempts, 3);
    }

    #[tokio::test]
    async fn test_session_timeout_cancels_remaining() {
        let mut opts = SessionOptions::default();
        opts.workers = 1;
        opts.session_timeout = Some(0.3);
        opts.grace_period = 0.1;
        let cases = vec![
            sh_case("slow1", 1, "sleep 30"),
            sh_case("slow2", 1, "sleep 30"),
        ];
        let (mut session, _dir) = session(cases, opts);
        let summary = session.run().await.unwrap();
        assert_eq!(summary.count(StatusName::Cancelled), 2);
        assert_ne!(summary.exit_code() & (1 << 6), 0);
    }

    #[tokio::test]
    async fn test_fail_fast_cancels_session() {
        let mut opts = SessionOptions::default();
        opts.workers = 1;
        opts.fail_fast = true;
        opts.grace_period = 0.1;
        let first = sh_case("bad", 1, "exit 1");
        let second = sh_case("later", 1, "sleep 0.1; exit 0");
        // deterministic order: make the failing case costlier
        let mut first = first;
        first.runtime_estimate = 100.0;
        let (mut session, _dir) = session(vec![first, second], opts);
        let summary = session.run().await.unwrap();
        assert_eq!(summary.count(StatusName::Fail), 1);
        assert_eq!(summary.count(StatusName::Cancelled), 1);
    }

    #[tokio::test]
    async fn test_masked_cases_are_not_scheduled() {
        let mut masked = sh_case("masked", 1, "exit 0");
        masked.mask = Some("deselected".to_string());
        let active = sh_case("active", 1, "exit 0");
        let (mut session, _dir) = session(vec![masked, active], SessionOptions::default());
        let summary = session.run().await.unwrap();
        assert_eq!(summary.total(), 1);
        let masked = session
            .catalog()
            .iter()
            .find(|c| c.family == "masked")
            .unwrap();
        assert_eq!(masked.status.name, StatusName::Created);
    }

    #[tokio::test]
    async fn test_exclusive_case_runs_alone() {
        let mut exclusive = sh_case("exclusive", 1, "sleep 0.2; exit 0");
        exclusive.exclusive = true;
        exclusive.runtime_estimate = 1000.0; // dispatches first
        let other = sh_case("other", 1, "exit 0");
        let ex_id = exclusive.id.clone();
        let other_id = other.id.clone();
        let (mut session, _dir) = session(vec![exclusive, other], SessionOptions::default());
        let summary = session.run().await.unwrap();
        assert_eq!(summary.count(StatusName::Success), 2);
        let catalog = session.catalog();
        let ex_stop = catalog.get(&ex_id).unwrap().stop.unwrap();
        let other_start = catalog.get(&other_id).unwrap().start.unwrap();
        assert!(ex_stop <= other_start, "exclusive case ran alone");
    }
}

//! Batch submission driver
//!
//! Groups ready cases into batches, renders one submission script per
//! batch, submits through the backend, polls to completion, and
//! merges per-case results back into the session catalog.  Inter-batch
//! dependencies mirror the member case edges; a batch is submitted
//! only after every upstream batch has finished.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use canary_engine::case::{CaseId, StatusName};
use canary_engine::{Catalog, Workspace};

use crate::backend::{SchedulerBackend, SubmitSpec};
use crate::batch::TestBatch;
use crate::batching::{batch_cases, BatchScheme, NodesConstraint};
use crate::error::{HpcError, HpcResult};

/// Batch execution options
#[derive(Debug, Clone)]
pub struct BatchOptions {
    pub scheme: BatchScheme,
    pub nodes: NodesConstraint,
    /// Worker bound passed to the engine inside each allocation
    pub workers: Option<usize>,
    /// Concurrently in-flight batch submissions
    pub max_concurrent: usize,
    pub scheduler_args: Vec<String>,
    pub timeout_multiplier: f64,
    /// Session identifier recorded in batch metadata
    pub session: String,
    /// Engine executable re-invoked inside the allocation
    pub canary_exe: String,
}

impl Default for BatchOptions {
    fn default() -> Self {
        Self {
            scheme: BatchScheme::Duration(1800.0),
            nodes: NodesConstraint::Any,
            workers: None,
            max_concurrent: 4,
            scheduler_args: Vec::new(),
            timeout_multiplier: 1.0,
            session: "canary".to_string(),
            canary_exe: "canary".to_string(),
        }
    }
}

/// How one batch job ended
#[derive(Debug)]
enum JobOutcome {
    Finished(i32),
    /// Submission or polling failed; the job may never have run
    Lost(String),
    Cancelled,
}

pub struct BatchRunner {
    backend: Arc<dyn SchedulerBackend>,
    opts: BatchOptions,
    cancel: Arc<AtomicBool>,
}

impl BatchRunner {
    pub fn new(backend: Arc<dyn SchedulerBackend>, opts: BatchOptions) -> Self {
        Self {
            backend,
            opts,
            cancel: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn cancel_flag(&self) -> Arc<AtomicBool> {
        self.cancel.clone()
    }

    /// Pack, submit, and merge every schedulable case in the catalog
    pub async fn run(&self, catalog: &mut Catalog, workspace: &Workspace) -> HpcResult<()> {
        let members: Vec<CaseId> = catalog
            .active()
            .filter(|c| !c.status.name.is_terminal())
            .map(|c| c.id.clone())
            .collect();
        if members.is_empty() {
            return Ok(());
        }
        let batches = batch_cases(catalog, &members, &self.opts.scheme, self.opts.nodes, None)?;
        info!(
            cases = members.len(),
            batches = batches.len(),
            backend = self.backend.name(),
            "submitting batches"
        );
        let cache = workspace.cache_dir();
        for batch in &batches {
            batch.setup(&cache, &self.opts.session, "READY")?;
        }

        let by_id: BTreeMap<String, &TestBatch> =
            batches.iter().map(|b| (b.id.clone(), b)).collect();
        let mut pending: BTreeSet<String> = by_id.keys().cloned().collect();
        let mut completed: BTreeSet<String> = BTreeSet::new();
        let mut running = 0usize;
        let mut jobs: JoinSet<(String, JobOutcome)> = JoinSet::new();

        loop {
            if !self.cancel.load(Ordering::SeqCst) {
                let ready: Vec<String> = pending
                    .iter()
                    .filter(|id| {
                        by_id[*id]
                            .dependencies
                            .iter()
                            .all(|dep| completed.contains(dep))
                    })
                    .cloned()
                    .collect();
                for id in ready {
                    if running >= self.opts.max_concurrent {
                        break;
                    }
                    pending.remove(&id);
                    running += 1;
                    let batch = by_id[&id];
                    let spec = self.submit_spec(catalog, workspace, batch);
                    let backend = self.backend.clone();
                    let cancel = self.cancel.clone();
                    let breadcrumb = batch.breadcrumb(&cache);
                    let batch_id = id.clone();
                    jobs.spawn(async move {
                        let outcome = run_job(backend, spec, cancel, &breadcrumb).await;
                        (batch_id, outcome)
                    });
                }
            }

            if running == 0 {
                if pending.is_empty() {
                    break;
                }
                if self.cancel.load(Ordering::SeqCst) {
                    for id in &pending {
                        self.fail_members(catalog, by_id[id], "session cancelled")?;
                    }
                    break;
                }
                // remaining batches wait on batches that will never
                // finish (upstream lost); drop them
                for id in &pending {
                    self.fail_members(catalog, by_id[id], "upstream batch did not finish")?;
                }
                break;
            }

            match jobs.join_next().await {
                Some(Ok((id, outcome))) => {
                    running -= 1;
                    completed.insert(id.clone());
                    self.merge_results(catalog, workspace, by_id[&id], outcome)?;
                }
                Some(Err(join_error)) => {
                    running -= 1;
                    warn!(error = %join_error, "batch task failed");
                }
                None => {}
            }
        }

        workspace.save_catalog(catalog)?;
        Ok(())
    }

    /// Render the submission request for one batch
    fn submit_spec(
        &self,
        catalog: &Catalog,
        workspace: &Workspace,
        batch: &TestBatch,
    ) -> SubmitSpec {
        let cache = workspace.cache_dir();
        let stage = batch.stage_dir(&cache);
        let mut command = vec![
            self.opts.canary_exe.clone(),
            "-C".to_string(),
            workspace.root().display().to_string(),
            "hpc-exec".to_string(),
            format!("--backend={}", self.backend.name()),
        ];
        if let Some(workers) = self.opts.workers {
            command.push(format!("--workers={}", workers));
        }
        command.push(batch.id.clone());

        SubmitSpec {
            name: format!("canary.{}", &batch.id[..7]),
            commands: vec![command.join(" ")],
            nodes: batch.nodes_required(catalog, self.backend.as_ref()),
            scriptname: batch.script_file(&cache),
            output: batch.log_file(&cache),
            error: batch.log_file(&cache),
            submit_flags: self.opts.scheduler_args.clone(),
            variables: batch.variables.clone(),
            qtime: batch.qtime(catalog, &self.opts.scheduler_args) * self.opts.timeout_multiplier,
        }
    }

    /// Fold one finished job back into the catalog.  Results written
    /// by the in-allocation engine win; members the job never reached
    /// are NOT_RUN, members caught mid-flight are CANCELLED.
    fn merge_results(
        &self,
        catalog: &mut Catalog,
        workspace: &Workspace,
        batch: &TestBatch,
        outcome: JobOutcome,
    ) -> HpcResult<()> {
        match outcome {
            JobOutcome::Lost(reason) => {
                warn!(batch = %&batch.id[..7], %reason, "batch lost");
                return self.fail_members(catalog, batch, &reason);
            }
            JobOutcome::Finished(code) => {
                debug!(batch = %&batch.id[..7], code, "batch finished");
            }
            JobOutcome::Cancelled => {
                debug!(batch = %&batch.id[..7], "batch cancelled");
            }
        }
        for id in &batch.cases {
            if let Ok(saved) = workspace.load_case(id) {
                if saved.status.name.is_terminal() {
                    if let Some(case) = catalog.get_mut(id) {
                        case.status = saved.status;
                        case.start = saved.start;
                        case.stop = saved.stop;
                        case.returncode = saved.returncode;
                        case.measurements = saved.measurements;
                        continue;
                    }
                }
            }
            if let Some(case) = catalog.get_mut(id) {
                match case.status.name {
                    StatusName::Running => case.status.set(
                        StatusName::Cancelled,
                        Some("batch job ended while case was running".to_string()),
                    )?,
                    name if !name.is_terminal() => case.status.set(
                        StatusName::NotRun,
                        Some("batch job finished without running case".to_string()),
                    )?,
                    _ => {}
                }
            }
        }
        Ok(())
    }

    fn fail_members(
        &self,
        catalog: &mut Catalog,
        batch: &TestBatch,
        reason: &str,
    ) -> HpcResult<()> {
        for id in &batch.cases {
            if let Some(case) = catalog.get_mut(id) {
                if !case.status.name.is_terminal() {
                    case.status
                        .set(StatusName::NotRun, Some(reason.to_string()))?;
                }
            }
        }
        Ok(())
    }
}

/// Submit one job and poll it to completion, honoring cancellation
async fn run_job(
    backend: Arc<dyn SchedulerBackend>,
    spec: SubmitSpec,
    cancel: Arc<AtomicBool>,
    breadcrumb: &std::path::Path,
) -> JobOutcome {
    let mut job = match backend.submit(spec).await {
        Ok(job) => job,
        Err(err) => return JobOutcome::Lost(format!("submission failed: {err}")),
    };
    let _ = std::fs::write(breadcrumb, job.id());
    let outcome = loop {
        if cancel.load(Ordering::SeqCst) {
            if let Err(err) = job.cancel().await {
                warn!(job = %job.id(), error = %err, "cancel failed");
            }
            break JobOutcome::Cancelled;
        }
        match job.poll().await {
            Ok(Some(code)) => break JobOutcome::Finished(code),
            Ok(None) => tokio::time::sleep(backend.polling_frequency()).await,
            Err(err) => break JobOutcome::Lost(format!("polling failed: {err}")),
        }
    };
    let _ = std::fs::remove_file(breadcrumb);
    outcome
}

#[cfg(test)]
mod tests {
    use super::*;
    use canary_engine::case::{Scalar, TestCase};
    use std::collections::BTreeMap as Map;

    fn case(family: &str, n: i64) -> TestCase {
        let mut params = Map::new();
        params.insert("n".to_string(), Scalar::Int(n));
        let mut case =
            TestCase::new("/src", format!("{family}.canary.toml"), family, params);
        case.runtime_estimate = 60.0;
        case.command = vec!["/bin/true".to_string()];
        case
    }

    fn runner() -> BatchRunner {
        let backend = crate::backend::get_backend("subshell").unwrap();
        BatchRunner::new(backend, BatchOptions::default())
    }

    #[test]
    fn test_submit_spec_invocation() {
        let dir = tempfile::tempdir().unwrap();
        let workspace = Workspace::create(dir.path()).unwrap();
        let c = case("t", 1);
        let id = c.id.clone();
        let catalog = Catalog::from_cases(vec![c]).unwrap();
        let batch = TestBatch::new(&catalog, vec![id], 60.0).unwrap();
        let runner = runner();
        let spec = runner.submit_spec(&catalog, &workspace, &batch);
        assert_eq!(spec.name, format!("canary.{}", &batch.id[..7]));
        assert!(spec.commands[0].contains("hpc-exec"));
        assert!(spec.commands[0].contains(&batch.id));
        assert!(spec.commands[0].contains("--backend=subshell"));
        assert_eq!(spec.variables["CANARY_BATCH_ID"], batch.id);
        assert_eq!(spec.nodes, 1);
    }

    #[test]
    fn test_lost_job_marks_members_not_run() {
        let dir = tempfile::tempdir().unwrap();
        let workspace = Workspace::create(dir.path()).unwrap();
        let c = case("t", 1);
        let id = c.id.clone();
        let mut catalog = Catalog::from_cases(vec![c]).unwrap();
        let batch = TestBatch::new(&catalog, vec![id.clone()], 60.0).unwrap();
        let runner = runner();
        runner
            .merge_results(
                &mut catalog,
                &workspace,
                &batch,
                JobOutcome::Lost("scheduler dropped the job".to_string()),
            )
            .unwrap();
        let case = catalog.get(&id).unwrap();
        assert_eq!(case.status.name, StatusName::NotRun);
    }

    #[test]
    fn test_finished_job_merges_saved_results() {
        let dir = tempfile::tempdir().unwrap();
        let workspace = Workspace::create(dir.path()).unwrap();
        let mut c = case("t", 1);
        c.status.set(StatusName::Ready, None).unwrap();
        c.status.set(StatusName::Running, None).unwrap();
        c.status.set(StatusName::Success, None).unwrap();
        c.returncode = Some(0);
        let id = c.id.clone();
        workspace.save_case(&c).unwrap();

        // in-memory catalog still thinks the case is pending
        let fresh = case("t", 1);
        let mut catalog = Catalog::from_cases(vec![fresh]).unwrap();
        let batch = TestBatch::new(&catalog, vec![id.clone()], 60.0).unwrap();
        let runner = runner();
        runner
            .merge_results(&mut catalog, &workspace, &batch, JobOutcome::Finished(0))
            .unwrap();
        let merged = catalog.get(&id).unwrap();
        assert_eq!(merged.status.name, StatusName::Success);
        assert_eq!(merged.returncode, Some(0));
    }

    #[test]
    fn test_unreached_member_is_not_run() {
        let dir = tempfile::tempdir().unwrap();
        let workspace = Workspace::create(dir.path()).unwrap();
        let c = case("t", 1);
        let id = c.id.clone();
        let mut catalog = Catalog::from_cases(vec![c]).unwrap();
        let batch = TestBatch::new(&catalog, vec![id.clone()], 60.0).unwrap();
        let runner = runner();
        runner
            .merge_results(&mut catalog, &workspace, &batch, JobOutcome::Finished(1))
            .unwrap();
        assert_eq!(catalog.get(&id).unwrap().status.name, StatusName::NotRun);
    }
}

//! `canary hpc-exec`: run batch members inside a scheduler allocation
//!
//! Invoked by the submission script that `canary run -b …` renders.
//! Loads the session catalog, restricts it to the batch members,
//! rebuilds the resource pool from the backend's node description,
//! and runs the members with the ordinary session engine.

use anyhow::{bail, Context, Result};
use clap::Args;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

use canary_config::CanaryConfig;
use canary_engine::resource::PoolItem;
use canary_engine::{ResourcePool, Session, SessionOptions, Workspace};
use canary_hpc::TestBatch;

#[derive(Args, Debug)]
pub struct HpcExecArgs {
    /// Scheduler backend name
    #[arg(long, default_value = "subshell")]
    pub backend: String,

    /// Worker bound inside the allocation
    #[arg(long, value_name = "N")]
    pub workers: Option<usize>,

    /// Run only this member case
    #[arg(long, value_name = "ID")]
    pub case: Option<String>,

    /// Batch id
    #[arg(value_name = "BATCH")]
    pub batch_id: String,

    /// Session directory
    #[arg(short = 'w', long, default_value = ".", value_name = "DIR")]
    pub work_tree: PathBuf,
}

pub async fn run(args: HpcExecArgs, config: &CanaryConfig) -> Result<i32> {
    if let Ok(batch_env) = std::env::var("CANARY_BATCH_ID") {
        if batch_env != args.batch_id {
            bail!("env batch id {batch_env} inconsistent with cli batch id {}", args.batch_id);
        }
    }

    let workspace = Workspace::open(&args.work_tree)?;
    let record = TestBatch::load_record(&workspace.cache_dir(), &args.batch_id)?;
    let mut catalog = workspace.load_catalog()?;

    // restrict the session to the batch members
    let members: Vec<_> = match &args.case {
        Some(needle) => {
            let case = catalog
                .find(needle)
                .with_context(|| format!("no such case {needle}"))?;
            vec![case.id.clone()]
        }
        None => record.cases.clone(),
    };
    for case in catalog.iter_mut() {
        if !members.contains(&case.id) && case.mask.is_none() {
            case.mask = Some("not a member of this batch".to_string());
        }
    }
    tracing::info!(
        batch = %&args.batch_id[..args.batch_id.len().min(7)],
        cases = members.len(),
        "executing batch"
    );

    // pool from the backend's node description
    let backend = canary_hpc::get_backend(&args.backend)?;
    let mut resources: BTreeMap<String, Vec<PoolItem>> = BTreeMap::new();
    for rtype in ["cpus", "gpus"] {
        let per_node = backend.count_per_node(rtype).unwrap_or(0);
        let total = per_node * backend.node_count();
        if total > 0 {
            resources.insert(
                rtype.to_string(),
                (0..total)
                    .map(|i| PoolItem {
                        id: i.to_string(),
                        slots: 1,
                    })
                    .collect(),
            );
        }
    }
    if resources.is_empty() {
        resources.insert(
            "cpus".to_string(),
            (0..num_cpus::get())
                .map(|i| PoolItem {
                    id: i.to_string(),
                    slots: 1,
                })
                .collect(),
        );
    }
    let pool = Arc::new(ResourcePool::new(&resources));

    // persist the pool description alongside the batch metadata
    let stage = TestBatch::stage(&workspace.cache_dir(), &args.batch_id);
    let pool_file = stage.join("resource_pool.json");
    if !pool_file.exists() {
        let body = serde_json::json!({ "resource_pool": resources });
        std::fs::write(&pool_file, serde_json::to_string_pretty(&body)?)?;
    }

    let opts = SessionOptions {
        workers: args.workers.unwrap_or_else(num_cpus::get).max(1),
        session_timeout: None,
        default_timeout: config.test.timeout,
        timeout_multiplier: config.test.timeout_multiplier,
        grace_period: config.session.grace_period,
        diff_exit_code: config.test.diff_exit_code,
        fail_fast: false,
        max_retries: config.session.max_retries,
        env: Vec::new(),
        persist_index: false,
    };
    let mut session = Session::new(catalog, pool, workspace, opts);
    let summary = session.run().await?;
    Ok(summary.exit_code())
}

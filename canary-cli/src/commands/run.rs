//! `canary run`: discover, expand, resolve, select, and execute

use anyhow::{bail, Context, Result};
use clap::Args;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use canary_config::CanaryConfig;
use canary_engine::resource::PoolItem;
use canary_engine::select;
use canary_engine::{
    Catalog, ExpandContext, Filter, ParserRegistry, Reporter, ResourcePool, Selection, Session,
    SessionOptions, SessionSummary, Workspace,
};
use canary_hpc::{BatchOptions, BatchRunner, BatchScheme, NodesConstraint};

use super::report;

#[derive(Args, Debug)]
pub struct RunArgs {
    /// Test file trees to scan
    #[arg(value_name = "PATH")]
    pub paths: Vec<PathBuf>,

    /// Select cases matching this keyword expression
    #[arg(short = 'k', value_name = "EXPR")]
    pub keyword_exprs: Vec<String>,

    /// Select cases matching this parameter expression
    #[arg(short = 'p', value_name = "EXPR")]
    pub parameter_exprs: Vec<String>,

    /// Turn on an option for `when` predicates
    #[arg(short = 'o', value_name = "OPTION")]
    pub on_options: Vec<String>,

    /// Worker pool bound
    #[arg(long, value_name = "N")]
    pub workers: Option<usize>,

    /// Session timeout in seconds
    #[arg(long, value_name = "T")]
    pub timeout: Option<f64>,

    /// Resource overrides, e.g. -r cpus:16 -r gpus:2
    #[arg(short = 'r', value_name = "TYPE:COUNT")]
    pub resources: Vec<String>,

    /// Batch spec: count:K, duration:T, or atomic
    #[arg(short = 'b', value_name = "SPEC")]
    pub batch: Option<String>,

    /// Stop the session on the first failure
    #[arg(long)]
    pub fail_fast: bool,

    /// Keep running after failures (overrides configuration)
    #[arg(long, conflicts_with = "fail_fast")]
    pub keep_going: bool,

    /// Session directory
    #[arg(short = 'w', long, default_value = "TestResults", value_name = "DIR")]
    pub work_tree: PathBuf,
}

pub async fn run(args: RunArgs, config: &CanaryConfig) -> Result<i32> {
    // discover and expand
    let registry = ParserRegistry::builtin();
    let paths = if args.paths.is_empty() {
        vec![PathBuf::from(".")]
    } else {
        args.paths.clone()
    };
    let mut drafts = Vec::new();
    for path in &paths {
        let root = path
            .canonicalize()
            .with_context(|| format!("cannot scan {}", path.display()))?;
        drafts.extend(registry.discover(&root)?);
    }
    if drafts.is_empty() {
        bail!("no test files found under {:?}", paths);
    }

    let ctx = ExpandContext {
        platform: std::env::consts::OS.to_string(),
        on_options: args.on_options.clone(),
    };
    let mut cases = Vec::new();
    for draft in &drafts {
        match canary_engine::expand(draft, &ctx) {
            Ok(expanded) => cases.extend(expanded),
            Err(err) => {
                tracing::warn!(file = %draft.display_path(), error = %err, "dropping draft");
            }
        }
    }

    // resolve and select
    let mut catalog = Catalog::from_cases(cases)?;
    canary_engine::resolve(&mut catalog)?;
    let mut selection = Selection::new();
    for expr in &args.keyword_exprs {
        selection.filters.push(Filter::Keyword(expr.clone()));
    }
    for expr in &args.parameter_exprs {
        selection.filters.push(Filter::Parameter(expr.clone()));
    }
    select::apply(&mut catalog, &selection)?;

    let active = catalog.active().count();
    tracing::info!(total = catalog.len(), active, "catalog resolved");

    let workspace = Workspace::create(&args.work_tree)?;
    let summary = match &args.batch {
        Some(spec) => run_batched(spec, catalog, &workspace, &args, config).await?,
        None => run_direct(catalog, &workspace, &args, config).await?,
    };
    Ok(summary.exit_code())
}

async fn run_direct(
    catalog: Catalog,
    workspace: &Workspace,
    args: &RunArgs,
    config: &CanaryConfig,
) -> Result<SessionSummary> {
    let pool = Arc::new(build_pool(config, &args.resources)?);
    let opts = session_options(args, config);
    let mut session = Session::new(catalog, pool, workspace.clone(), opts);

    // first interrupt cancels gracefully
    let (cancel, notify) = session.cancel_handle();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            cancel.store(true, Ordering::SeqCst);
            notify.notify_waiters();
        }
    });

    let summary = session.run().await?;
    report::ConsoleReporter.report(session.catalog())?;
    Ok(summary)
}

async fn run_batched(
    spec: &str,
    mut catalog: Catalog,
    workspace: &Workspace,
    args: &RunArgs,
    config: &CanaryConfig,
) -> Result<SessionSummary> {
    let scheme = parse_batch_spec(spec, config)?;
    let backend_name = config
        .batch
        .scheduler
        .clone()
        .unwrap_or_else(|| "subshell".to_string());
    let backend = canary_hpc::get_backend(&backend_name)?;
    let nodes = match config.batch.nodes.as_str() {
        "same" => NodesConstraint::Same {
            cpus_per_node: backend.count_per_node("cpus").unwrap_or(1),
        },
        _ => NodesConstraint::Any,
    };
    let opts = BatchOptions {
        scheme,
        nodes,
        workers: args.workers.or(config.batch.workers),
        max_concurrent: args.workers.unwrap_or(4).max(1),
        scheduler_args: config.batch.scheduler_args.clone(),
        timeout_multiplier: config.test.timeout_multiplier,
        session: workspace.root().display().to_string(),
        canary_exe: std::env::current_exe()
            .map(|p| p.display().to_string())
            .unwrap_or_else(|_| "canary".to_string()),
    };

    workspace.assign_directories(&mut catalog);
    workspace.save_catalog(&catalog)?;

    let runner = BatchRunner::new(backend, opts);
    let cancel = runner.cancel_flag();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            cancel.store(true, Ordering::SeqCst);
        }
    });

    runner.run(&mut catalog, workspace).await?;
    report::ConsoleReporter.report(&catalog)?;
    Ok(SessionSummary::from_catalog(&catalog))
}

fn session_options(args: &RunArgs, config: &CanaryConfig) -> SessionOptions {
    let fail_fast = if args.keep_going {
        false
    } else {
        args.fail_fast || config.session.fail_fast
    };
    SessionOptions {
        workers: args
            .workers
            .or(config.session.workers)
            .unwrap_or_else(num_cpus::get)
            .max(1),
        session_timeout: args
            .timeout
            .or(Some(config.session.timeout))
            .filter(|t| *t > 0.0),
        default_timeout: config.test.timeout,
        timeout_multiplier: config.test.timeout_multiplier,
        grace_period: config.session.grace_period,
        diff_exit_code: config.test.diff_exit_code,
        fail_fast,
        max_retries: config.session.max_retries,
        env: case_environment(config),
        persist_index: true,
    }
}

/// Session-level environment exports from configuration
fn case_environment(config: &CanaryConfig) -> Vec<(String, String)> {
    let mut env: Vec<(String, String)> = Vec::new();
    for (key, value) in &config.env.set {
        env.push((key.clone(), value.clone()));
    }
    for key in &config.env.unset {
        env.push((key.clone(), String::new()));
    }
    for (key, value) in &config.env.prepend_path {
        let current = std::env::var(key).unwrap_or_default();
        let joined = if current.is_empty() {
            value.clone()
        } else {
            format!("{value}:{current}")
        };
        env.push((key.clone(), joined));
    }
    for (key, value) in &config.env.append_path {
        let current = std::env::var(key).unwrap_or_default();
        let joined = if current.is_empty() {
            value.clone()
        } else {
            format!("{current}:{value}")
        };
        env.push((key.clone(), joined));
    }
    env
}

/// Build the session resource pool from configuration plus `-r`
/// overrides
fn build_pool(config: &CanaryConfig, overrides: &[String]) -> Result<ResourcePool> {
    let mut flat: BTreeMap<String, Vec<PoolItem>> = config
        .resource_pool
        .flat()
        .into_iter()
        .map(|(rtype, items)| {
            let items = items
                .into_iter()
                .map(|item| PoolItem {
                    id: item.id,
                    slots: item.slots,
                })
                .collect();
            (rtype, items)
        })
        .collect();
    for over in overrides {
        let (rtype, count) = parse_resource_override(over)?;
        let items = (0..count)
            .map(|i| PoolItem {
                id: i.to_string(),
                slots: 1,
            })
            .collect();
        flat.insert(rtype, items);
    }
    Ok(ResourcePool::new(&flat))
}

fn parse_resource_override(arg: &str) -> Result<(String, u32)> {
    let (rtype, count) = arg
        .split_once([':', '='])
        .with_context(|| format!("invalid resource override {arg:?}: expected type:count"))?;
    let count: u32 = count
        .parse()
        .with_context(|| format!("invalid resource count in {arg:?}"))?;
    let rtype = if rtype.ends_with('s') {
        rtype.to_string()
    } else {
        format!("{rtype}s")
    };
    Ok((rtype, count))
}

fn parse_batch_spec(spec: &str, config: &CanaryConfig) -> Result<BatchScheme> {
    match spec.split_once(':') {
        Some(("count", value)) => Ok(BatchScheme::Count(
            value
                .parse()
                .with_context(|| format!("invalid batch count {value:?}"))?,
        )),
        Some(("duration", value)) => Ok(BatchScheme::Duration(
            value
                .parse()
                .with_context(|| format!("invalid batch duration {value:?}"))?,
        )),
        None if spec == "atomic" => Ok(BatchScheme::Atomic),
        None if spec == "count" => Ok(BatchScheme::Count(
            config.batch.count.unwrap_or(8),
        )),
        None if spec == "duration" => Ok(BatchScheme::Duration(config.batch.duration)),
        _ => bail!("invalid batch spec {spec:?}: expected count:K, duration:T, or atomic"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_resource_override() {
        assert_eq!(
            parse_resource_override("cpus:16").unwrap(),
            ("cpus".to_string(), 16)
        );
        assert_eq!(
            parse_resource_override("gpu=2").unwrap(),
            ("gpus".to_string(), 2)
        );
        assert!(parse_resource_override("cpus").is_err());
        assert!(parse_resource_override("cpus:lots").is_err());
    }

    #[test]
    fn test_parse_batch_spec() {
        let config = CanaryConfig::default();
        assert_eq!(
            parse_batch_spec("count:3", &config).unwrap(),
            BatchScheme::Count(3)
        );
        assert_eq!(
            parse_batch_spec("duration:900", &config).unwrap(),
            BatchScheme::Duration(900.0)
        );
        assert_eq!(parse_batch_spec("atomic", &config).unwrap(), BatchScheme::Atomic);
        assert!(parse_batch_spec("spiral", &config).is_err());
    }
}

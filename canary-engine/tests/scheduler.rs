//! Scheduler integration: resource admission, ordering, and terminal
//! status accounting against real child processes

use std::collections::BTreeMap;
use std::sync::Arc;

use canary_engine::case::{DepEdge, ResourceRequest, Scalar, StatusName, TestCase};
use canary_engine::{Catalog, ResourcePool, Session, SessionOptions, Workspace};

fn sh_case(family: &str, n: i64, cpus: u32, gpus: u32, script: &str) -> TestCase {
    let mut params = BTreeMap::new();
    params.insert("n".to_string(), Scalar::Int(n));
    let mut case = TestCase::new("/src", format!("{family}.canary.toml"), family, params);
    case.command = vec!["/bin/sh".to_string(), "-c".to_string(), script.to_string()];
    let mut group = vec![ResourceRequest::new("cpus", cpus)];
    if gpus > 0 {
        group.push(ResourceRequest::new("gpus", gpus));
    }
    case.resources = vec![group];
    case.runtime_estimate = 1.0;
    case
}

async fn run_session(
    cases: Vec<TestCase>,
    pool: ResourcePool,
    opts: SessionOptions,
) -> (canary_engine::SessionSummary, Catalog) {
    let dir = tempfile::tempdir().unwrap();
    let catalog = Catalog::from_cases(cases).unwrap();
    let workspace = Workspace::create(dir.path()).unwrap();
    let mut session = Session::new(catalog, Arc::new(pool), workspace, opts);
    let summary = session.run().await.unwrap();
    (summary, session.into_catalog())
}

#[tokio::test]
async fn resource_pool_admission_never_oversubscribes() {
    // pool: 4 cpus, 1 gpu; c1{cpus:4}, c2{cpus:2,gpus:1}, c3{cpus:1}
    let cases = vec![
        sh_case("c1", 1, 4, 0, "sleep 0.15"),
        sh_case("c2", 1, 2, 1, "sleep 0.15"),
        sh_case("c3", 1, 1, 0, "sleep 0.15"),
    ];
    let (summary, catalog) = run_session(
        cases,
        ResourcePool::local(4, 1),
        SessionOptions::default(),
    )
    .await;
    assert_eq!(summary.count(StatusName::Success), 3);

    // overlapping cases never exceed the pool per type
    let runs: Vec<(&TestCase, chrono::DateTime<chrono::Utc>, chrono::DateTime<chrono::Utc>)> =
        catalog
            .iter()
            .map(|c| (c, c.start.unwrap(), c.stop.unwrap()))
            .collect();
    for (i, (a, a_start, a_stop)) in runs.iter().enumerate() {
        for (b, b_start, b_stop) in runs.iter().skip(i + 1) {
            let overlap = a_start < b_stop && b_start < a_stop;
            if overlap {
                assert!(a.cpus() + b.cpus() <= 4, "cpu slots oversubscribed");
                assert!(a.gpus() + b.gpus() <= 1, "gpu slots oversubscribed");
            }
        }
    }
}

#[tokio::test]
async fn infeasible_case_fails_and_session_continues() {
    // pool has 1 gpu; the case wants 2 in every group
    let mut infeasible = sh_case("wants2", 1, 1, 2, "exit 0");
    infeasible.resources = vec![vec![
        ResourceRequest::new("gpus", 2),
    ]];
    let ok = sh_case("ok", 1, 1, 0, "exit 0");
    let (summary, catalog) = run_session(
        vec![infeasible, ok],
        ResourcePool::local(2, 1),
        SessionOptions::default(),
    )
    .await;
    assert_eq!(summary.count(StatusName::Fail), 1);
    assert_eq!(summary.count(StatusName::Success), 1);
    let failed = catalog.iter().find(|c| c.family == "wants2").unwrap();
    assert!(failed
        .status
        .message
        .as_deref()
        .unwrap()
        .contains("resource unsatisfiable"));
    assert!(failed.start.is_none(), "infeasible case never started");
}

#[tokio::test]
async fn composite_base_waits_for_success_or_diff() {
    let mut opts = SessionOptions::default();
    opts.diff_exit_code = 64;
    let s1 = sh_case("flow", 1, 1, 0, "sleep 0.1; exit 0");
    let s2 = sh_case("flow", 2, 1, 0, "sleep 0.1; exit 64"); // diff
    let s3 = sh_case("flow", 3, 1, 0, "sleep 0.1; exit 0");
    let mut base = sh_case("flow_base", 0, 1, 0, "exit 0");
    for upstream in [&s1, &s2, &s3] {
        base.dependencies.push(DepEdge {
            id: upstream.id.clone(),
            result: Default::default(),
        });
    }
    let base_id = base.id.clone();
    let upstream_ids = vec![s1.id.clone(), s2.id.clone(), s3.id.clone()];
    let (summary, catalog) =
        run_session(vec![s1, s2, s3, base], ResourcePool::local(4, 0), opts).await;
    assert_eq!(summary.count(StatusName::Success), 3);
    assert_eq!(summary.count(StatusName::Diff), 1);

    let base_start = catalog.get(&base_id).unwrap().start.unwrap();
    for id in upstream_ids {
        let stop = catalog.get(&id).unwrap().stop.unwrap();
        assert!(stop <= base_start, "base started after every upstream");
    }
}

#[tokio::test]
async fn terminal_statuses_map_to_exit_code_bits() {
    let cases = vec![
        sh_case("pass", 1, 1, 0, "exit 0"),
        sh_case("diff", 1, 1, 0, "exit 64"),
        sh_case("fail", 1, 1, 0, "exit 3"),
    ];
    let (summary, _) = run_session(cases, ResourcePool::local(4, 0), SessionOptions::default()).await;
    let code = summary.exit_code();
    assert_ne!(code & (1 << 1), 0, "diff bit");
    assert_ne!(code & (1 << 2), 0, "fail bit");
    assert_eq!(code & (1 << 3), 0, "no timeout bit");
}

#[tokio::test]
async fn timeout_kills_and_flags_case() {
    let mut opts = SessionOptions::default();
    opts.grace_period = 0.1;
    let mut slow = sh_case("slow", 1, 1, 0, "sleep 30");
    slow.timeout = Some(0.2);
    let (summary, catalog) = run_session(vec![slow], ResourcePool::local(2, 0), opts).await;
    assert_eq!(summary.count(StatusName::Timeout), 1);
    let case = catalog.iter().next().unwrap();
    assert!(case.start.unwrap() <= case.stop.unwrap());
    assert_ne!(summary.exit_code() & (1 << 3), 0, "timeout bit");
}

#[tokio::test]
async fn xstatus_accepts_expected_nonzero_exit() {
    let mut expected = sh_case("xfail", 1, 1, 0, "exit 7");
    expected.xstatus = 7;
    let mut any_nonzero = sh_case("xany", 1, 1, 0, "exit 3");
    any_nonzero.xstatus = -1;
    let (summary, _) = run_session(
        vec![expected, any_nonzero],
        ResourcePool::local(2, 0),
        SessionOptions::default(),
    )
    .await;
    assert_eq!(summary.count(StatusName::Success), 2);
    assert_eq!(summary.exit_code(), 0);
}

#[tokio::test]
async fn results_persist_for_status_reload() {
    let dir = tempfile::tempdir().unwrap();
    let cases = vec![sh_case("t", 1, 1, 0, "exit 0")];
    let catalog = Catalog::from_cases(cases).unwrap();
    let workspace = Workspace::create(dir.path()).unwrap();
    let mut session = Session::new(
        catalog,
        Arc::new(ResourcePool::local(2, 0)),
        workspace,
        SessionOptions::default(),
    );
    session.run().await.unwrap();

    // a later `canary status` reloads the same terminal state
    let reloaded = Workspace::open(dir.path()).unwrap().load_catalog().unwrap();
    let case = reloaded.iter().next().unwrap();
    assert_eq!(case.status.name, StatusName::Success);
    assert_eq!(case.returncode, Some(0));
    assert!(case.start.unwrap() <= case.stop.unwrap());
}

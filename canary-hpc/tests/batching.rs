//! Batching integration: packing invariants over real catalogs

use std::collections::{BTreeMap, BTreeSet};

use canary_engine::case::{CaseId, DepEdge, Scalar, TestCase};
use canary_engine::Catalog;
use canary_hpc::{batch_cases, BatchScheme, NodesConstraint};

fn case(family: &str, n: i64, cpus: i64, runtime: f64) -> TestCase {
    let mut params = BTreeMap::new();
    params.insert("n".to_string(), Scalar::Int(n));
    params.insert("cpus".to_string(), Scalar::Int(cpus));
    let mut case = TestCase::new("/src", format!("{family}.canary.toml"), family, params);
    case.runtime_estimate = runtime;
    case
}

fn catalog_of(cases: Vec<TestCase>) -> (Catalog, Vec<CaseId>) {
    let ids = cases.iter().map(|c| c.id.clone()).collect();
    (Catalog::from_cases(cases).unwrap(), ids)
}

#[test]
fn duration_packing_tiles_twelve_five_minute_cases() {
    // 12 independent 5-minute single-cpu cases, 4 cpus wide: bins of
    // one row tile into exactly 3 batches of 4 cases, all well under
    // the 15 minute ceiling
    let cases: Vec<TestCase> = (0..12).map(|i| case("t", i, 1, 300.0)).collect();
    let (catalog, ids) = catalog_of(cases);
    let batches = batch_cases(
        &catalog,
        &ids,
        &BatchScheme::Duration(300.0),
        NodesConstraint::Any,
        Some(4),
    )
    .unwrap();
    assert_eq!(batches.len(), 3);
    for batch in &batches {
        assert_eq!(batch.len(), 4);
        assert!(batch.runtime <= 900.0, "batch exceeds 15 minutes");
    }
}

#[test]
fn packing_round_trip_covers_input_exactly() {
    // member sets are disjoint and their union is the input set
    let mut cases: Vec<TestCase> = (0..9).map(|i| case("t", i, (i % 3) + 1, 60.0 * (i + 1) as f64)).collect();
    let mut downstream = case("reduce", 0, 1, 30.0);
    for upstream in &cases {
        downstream.dependencies.push(DepEdge {
            id: upstream.id.clone(),
            result: Default::default(),
        });
    }
    cases.push(downstream);
    let (catalog, ids) = catalog_of(cases);

    for scheme in [
        BatchScheme::Duration(600.0),
        BatchScheme::Count(4),
        BatchScheme::Atomic,
    ] {
        let batches =
            batch_cases(&catalog, &ids, &scheme, NodesConstraint::Any, None).unwrap();
        let mut seen: BTreeSet<CaseId> = BTreeSet::new();
        for batch in &batches {
            for id in &batch.cases {
                assert!(seen.insert(id.clone()), "{scheme:?}: member in two batches");
            }
        }
        assert_eq!(
            seen,
            ids.iter().cloned().collect::<BTreeSet<_>>(),
            "{scheme:?}: members do not cover the input"
        );
    }
}

#[test]
fn batch_dependencies_follow_case_edges() {
    let up = case("mesh", 0, 1, 60.0);
    let mut mid = case("solve", 0, 1, 60.0);
    mid.dependencies.push(DepEdge {
        id: up.id.clone(),
        result: Default::default(),
    });
    let mut down = case("post", 0, 1, 60.0);
    down.dependencies.push(DepEdge {
        id: mid.id.clone(),
        result: Default::default(),
    });
    let (catalog, ids) = catalog_of(vec![up, mid, down]);
    let batches = batch_cases(
        &catalog,
        &ids,
        &BatchScheme::Atomic,
        NodesConstraint::Any,
        None,
    )
    .unwrap();
    assert_eq!(batches.len(), 3);

    // the batch graph is acyclic and respects the chain
    let by_id: BTreeMap<&str, &canary_hpc::TestBatch> =
        batches.iter().map(|b| (b.id.as_str(), b)).collect();
    for batch in &batches {
        for dep in &batch.dependencies {
            assert!(by_id.contains_key(dep.as_str()));
            assert_ne!(dep, &batch.id, "self-edges are not allowed");
        }
    }
    let chain_deps: usize = batches.iter().map(|b| b.dependencies.len()).sum();
    assert_eq!(chain_deps, 2);
}

#[test]
fn batch_ids_are_stable_across_orderings() {
    let (catalog, ids) = catalog_of((0..4).map(|i| case("t", i, 1, 60.0)).collect());
    let forward = batch_cases(
        &catalog,
        &ids,
        &BatchScheme::Count(1),
        NodesConstraint::Any,
        None,
    )
    .unwrap();
    let reversed_ids: Vec<CaseId> = ids.iter().rev().cloned().collect();
    let reversed = batch_cases(
        &catalog,
        &reversed_ids,
        &BatchScheme::Count(1),
        NodesConstraint::Any,
        None,
    )
    .unwrap();
    assert_eq!(forward[0].id, reversed[0].id);
}

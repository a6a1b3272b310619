//! Dependency DAG: topological ordering, cycle detection, strata

use std::collections::{BTreeMap, BTreeSet};

use crate::case::CaseId;
use crate::error::{EngineError, EngineResult};

/// Dependency graph over case ids.  An edge records that a case
/// depends on (runs after) another.
#[derive(Debug, Clone, Default)]
pub struct DepGraph {
    deps: BTreeMap<CaseId, BTreeSet<CaseId>>,
}

impl DepGraph {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_node(&mut self, id: CaseId) {
        self.deps.entry(id).or_default();
    }

    /// Record that `case` depends on `upstream`
    pub fn add_edge(&mut self, case: CaseId, upstream: CaseId) {
        self.deps.entry(upstream.clone()).or_default();
        self.deps.entry(case).or_default().insert(upstream);
    }

    pub fn len(&self) -> usize {
        self.deps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.deps.is_empty()
    }

    pub fn dependencies_of(&self, id: &CaseId) -> impl Iterator<Item = &CaseId> {
        self.deps.get(id).into_iter().flatten()
    }

    /// Kahn-style peeling: each stratum contains only nodes whose
    /// dependencies all appear in earlier strata, so members of one
    /// stratum have no inter-dependencies.  A cycle is fatal.
    pub fn strata(&self) -> EngineResult<Vec<Vec<CaseId>>> {
        let mut remaining: BTreeMap<&CaseId, BTreeSet<&CaseId>> = self
            .deps
            .iter()
            .map(|(id, deps)| (id, deps.iter().collect()))
            .collect();
        let mut strata = Vec::new();
        while !remaining.is_empty() {
            let ready: Vec<CaseId> = remaining
                .iter()
                .filter(|(_, deps)| deps.is_empty())
                .map(|(id, _)| (*id).clone())
                .collect();
            if ready.is_empty() {
                // every remaining node waits on another: a cycle
                let member = remaining
                    .keys()
                    .next()
                    .map(|id| id.to_string())
                    .unwrap_or_default();
                return Err(EngineError::DependencyCycle(member));
            }
            for id in &ready {
                remaining.remove(id);
            }
            for deps in remaining.values_mut() {
                for id in &ready {
                    deps.remove(id);
                }
            }
            strata.push(ready);
        }
        Ok(strata)
    }

    /// Flat topological order (dependencies before dependents)
    pub fn toposort(&self) -> EngineResult<Vec<CaseId>> {
        Ok(self.strata()?.into_iter().flatten().collect())
    }

    /// Verify the graph is acyclic
    pub fn check_acyclic(&self) -> EngineResult<()> {
        self.strata().map(|_| ())
    }
}

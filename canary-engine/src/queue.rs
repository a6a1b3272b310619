//! Ready-queue bookkeeping for the dispatcher
//!
//! The queue is owned by the single dispatcher task; workers never
//! touch it.  `refresh` advances PENDING cases whose edges are met,
//! fails cases whose edges can no longer be met, and keeps the READY
//! set current.

use std::collections::{BTreeMap, BTreeSet};

use crate::case::{CaseId, StatusName};
use crate::catalog::Catalog;
use crate::error::{EngineError, EngineResult};

#[derive(Debug, Default)]
pub struct ReadyQueue {
    ready: BTreeSet<CaseId>,
    running: BTreeSet<CaseId>,
    exclusive_running: bool,
}

enum EdgeState {
    Met,
    Waiting,
    Failed(String),
}

impl ReadyQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn running(&self) -> usize {
        self.running.len()
    }

    pub fn exclusive_running(&self) -> bool {
        self.exclusive_running
    }

    /// Re-derive case readiness from current upstream statuses
    pub fn refresh(&mut self, catalog: &mut Catalog) -> EngineResult<()> {
        let statuses: BTreeMap<CaseId, StatusName> = catalog
            .iter()
            .map(|c| (c.id.clone(), c.status.name))
            .collect();
        let ids: Vec<CaseId> = catalog.ids().cloned().collect();
        for id in ids {
            let case = catalog
                .get_mut(&id)
                .ok_or_else(|| EngineError::CaseNotFound(id.to_string()))?;
            if !case.active() || case.status.name.is_terminal() {
                self.ready.remove(&id);
                continue;
            }
            if self.running.contains(&id) {
                continue;
            }
            let state = edge_state(case, &statuses);
            match state {
                EdgeState::Failed(reason) => {
                    self.ready.remove(&id);
                    case.status.set(StatusName::NotRun, Some(reason))?;
                }
                EdgeState::Met => {
                    if case.status.name != StatusName::Ready {
                        case.status.set(StatusName::Ready, None)?;
                    }
                    self.ready.insert(id);
                }
                EdgeState::Waiting => {
                    if case.status.name == StatusName::Created {
                        case.status.set(StatusName::Pending, None)?;
                    }
                }
            }
        }
        Ok(())
    }

    /// Dispatch candidates in policy order: exclusive isolation first,
    /// then descending cost so long tests start earliest, ties broken
    /// by ascending id.
    pub fn candidates(&self, catalog: &Catalog) -> Vec<CaseId> {
        if self.exclusive_running {
            return Vec::new();
        }
        let mut ready: Vec<&CaseId> = self.ready.iter().collect();
        ready.sort_by(|a, b| {
            let ca = catalog.get(a).map(|c| c.cost()).unwrap_or(0.0);
            let cb = catalog.get(b).map(|c| c.cost()).unwrap_or(0.0);
            cb.partial_cmp(&ca)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.cmp(b))
        });
        ready.into_iter().cloned().collect()
    }

    pub fn mark_running(&mut self, id: &CaseId, exclusive: bool) {
        self.ready.remove(id);
        self.running.insert(id.clone());
        if exclusive {
            self.exclusive_running = true;
        }
    }

    pub fn mark_done(&mut self, id: &CaseId, exclusive: bool) {
        self.running.remove(id);
        if exclusive {
            self.exclusive_running = false;
        }
    }

    /// Session is complete when every active case is terminal
    pub fn finished(&self, catalog: &Catalog) -> bool {
        self.running.is_empty() && catalog.active().all(|c| c.status.name.is_terminal())
    }
}

fn edge_state(
    case: &crate::case::TestCase,
    statuses: &BTreeMap<CaseId, StatusName>,
) -> EdgeState {
    for edge in &case.dependencies {
        let upstream = match statuses.get(&edge.id) {
            Some(status) => *status,
            None => {
                return EdgeState::Failed(format!(
                    "unresolved dependency: {} is not in the catalog",
                    edge.id
                ))
            }
        };
        match edge.result.met(upstream) {
            Some(true) => {}
            Some(false) => {
                return EdgeState::Failed(format!(
                    "dependency {} finished {}",
                    edge.id.short(),
                    upstream.label()
                ))
            }
            None => return EdgeState::Waiting,
        }
    }
    EdgeState::Met
}

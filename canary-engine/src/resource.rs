//! Typed resource pool with slot accounting
//!
//! The pool is the only shared mutable state outside the case-status
//! map.  A single mutex protects the free-slot counters; `acquire` and
//! `release` are the only write paths.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

use crate::case::ResourceGroup;

/// One addressable resource instance with slot capacity, e.g. cpu "3"
/// with 1 slot or gpu "0" with 4 slots
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolItem {
    pub id: String,
    pub slots: u32,
}

/// A slot reservation against one pool item
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SlotRef {
    /// Pool item id within its type
    pub gid: String,
    pub slots: u32,
}

/// An exact reservation held by a case from acquire until release.
///
/// The satisfied requirement group is kept as one assignment group so
/// the projection into the child environment preserves structure.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Assignment {
    pub groups: Vec<BTreeMap<String, Vec<SlotRef>>>,
}

impl Assignment {
    /// Project the assignment into environment variables for the child
    /// process:
    ///
    /// - `<prefix>_RESOURCE_GROUP_COUNT`
    /// - `<prefix>_RESOURCE_GROUP_<i>`: comma-joined type names
    /// - `<prefix>_RESOURCE_GROUP_<i>_<TYPE>`: `id:X,slots:Y` pairs
    ///   joined by `;`
    pub fn env(&self, prefix: &str) -> Vec<(String, String)> {
        let mut vars = Vec::new();
        vars.push((
            format!("{}_RESOURCE_GROUP_COUNT", prefix),
            self.groups.len().to_string(),
        ));
        for (i, group) in self.groups.iter().enumerate() {
            let types: Vec<&str> = group.keys().map(String::as_str).collect();
            vars.push((format!("{}_RESOURCE_GROUP_{}", prefix, i), types.join(",")));
            for (rtype, slots) in group {
                let value: Vec<String> = slots
                    .iter()
                    .map(|s| format!("id:{},slots:{}", s.gid, s.slots))
                    .collect();
                vars.push((
                    format!("{}_RESOURCE_GROUP_{}_{}", prefix, i, rtype.to_uppercase()),
                    value.join(";"),
                ));
            }
        }
        vars
    }
}

#[derive(Debug, Clone)]
struct Item {
    id: String,
    capacity: u32,
    free: u32,
}

#[derive(Debug)]
struct PoolState {
    items: BTreeMap<String, Vec<Item>>,
}

/// Typed, slot-accounted pool of resources
pub struct ResourcePool {
    state: Mutex<PoolState>,
    types: BTreeSet<String>,
    totals: BTreeMap<String, u32>,
}

impl ResourcePool {
    /// Build a pool from the flat typed form
    /// (`{"cpus": [{"id": "0", "slots": 1}, …], …}`)
    pub fn new(resources: &BTreeMap<String, Vec<PoolItem>>) -> Self {
        let mut items = BTreeMap::new();
        let mut totals = BTreeMap::new();
        for (rtype, members) in resources {
            let row: Vec<Item> = members
                .iter()
                .map(|m| Item {
                    id: m.id.clone(),
                    capacity: m.slots,
                    free: m.slots,
                })
                .collect();
            totals.insert(rtype.clone(), row.iter().map(|i| i.capacity).sum());
            items.insert(rtype.clone(), row);
        }
        let types = resources.keys().cloned().collect();
        Self {
            state: Mutex::new(PoolState { items }),
            types,
            totals,
        }
    }

    /// Convenience pool for the local machine: N single-slot cpus and
    /// M single-slot gpus
    pub fn local(cpus: u32, gpus: u32) -> Self {
        let mut resources = BTreeMap::new();
        resources.insert(
            "cpus".to_string(),
            (0..cpus)
                .map(|i| PoolItem {
                    id: i.to_string(),
                    slots: 1,
                })
                .collect(),
        );
        if gpus > 0 {
            resources.insert(
                "gpus".to_string(),
                (0..gpus)
                    .map(|i| PoolItem {
                        id: i.to_string(),
                        slots: 1,
                    })
                    .collect(),
            );
        }
        Self::new(&resources)
    }

    /// The set of distinct resource types present
    pub fn types(&self) -> &BTreeSet<String> {
        &self.types
    }

    /// Total slot capacity of a type
    pub fn total(&self, rtype: &str) -> u32 {
        self.totals.get(rtype).copied().unwrap_or(0)
    }

    /// Attempt to reserve a requirement set.  Groups are alternatives
    /// tried in authoring order; the first group whose every item can
    /// be satisfied is committed atomically.  Returns `None` when no
    /// group fits right now.
    pub fn acquire(&self, required: &[ResourceGroup]) -> Option<Assignment> {
        let mut state = self.state.lock();
        for group in required {
            if let Some(reservation) = Self::try_group(&state, group) {
                // commit
                for (rtype, slots) in &reservation {
                    let row = state.items.get_mut(rtype)?;
                    for slot in slots {
                        if let Some(item) = row.iter_mut().find(|i| i.id == slot.gid) {
                            item.free -= slot.slots;
                        }
                    }
                }
                return Some(Assignment {
                    groups: vec![reservation],
                });
            }
        }
        None
    }

    /// Tentatively satisfy every item of one group against the current
    /// free counts, preferring the lowest-index item with sufficient
    /// capacity and accumulating from the low end otherwise.
    fn try_group(
        state: &PoolState,
        group: &ResourceGroup,
    ) -> Option<BTreeMap<String, Vec<SlotRef>>> {
        // free counts are mutated tentatively, so clone per attempt
        let mut scratch: BTreeMap<&str, Vec<Item>> = state
            .items
            .iter()
            .map(|(k, v)| (k.as_str(), v.clone()))
            .collect();
        let mut reservation: BTreeMap<String, Vec<SlotRef>> = BTreeMap::new();
        for request in group {
            let row = scratch.get_mut(request.rtype.as_str())?;
            let taken = Self::take_slots(row, request.slots)?;
            reservation
                .entry(request.rtype.clone())
                .or_default()
                .extend(taken);
        }
        Some(reservation)
    }

    fn take_slots(row: &mut [Item], wanted: u32) -> Option<Vec<SlotRef>> {
        if wanted == 0 {
            return Some(Vec::new());
        }
        // whole request from a single item when possible
        if let Some(item) = row.iter_mut().find(|i| i.free >= wanted) {
            item.free -= wanted;
            return Some(vec![SlotRef {
                gid: item.id.clone(),
                slots: wanted,
            }]);
        }
        // otherwise accumulate from the low end
        let mut remaining = wanted;
        let mut taken = Vec::new();
        for item in row.iter_mut() {
            if item.free == 0 {
                continue;
            }
            let n = item.free.min(remaining);
            item.free -= n;
            taken.push(SlotRef {
                gid: item.id.clone(),
                slots: n,
            });
            remaining -= n;
            if remaining == 0 {
                return Some(taken);
            }
        }
        None
    }

    /// Restore exactly the slots recorded in the assignment
    pub fn release(&self, assignment: &Assignment) {
        let mut state = self.state.lock();
        for group in &assignment.groups {
            for (rtype, slots) in group {
                if let Some(row) = state.items.get_mut(rtype) {
                    for slot in slots {
                        if let Some(item) = row.iter_mut().find(|i| i.id == slot.gid) {
                            item.free = (item.free + slot.slots).min(item.capacity);
                        }
                    }
                }
            }
        }
    }

    /// Non-mutating feasibility check: will this requirement EVER fit
    /// given the pool's total capacity?  Infeasible cases are failed
    /// before the session starts rather than wedging the queue.
    pub fn accommodates(&self, required: &[ResourceGroup]) -> Result<(), String> {
        if required.is_empty() {
            return Ok(());
        }
        let mut last_reason = String::new();
        for group in required {
            let mut demand: BTreeMap<&str, u32> = BTreeMap::new();
            for request in group {
                *demand.entry(request.rtype.as_str()).or_insert(0) += request.slots;
            }
            let mut feasible = true;
            for (rtype, slots) in &demand {
                if !self.types.contains(*rtype) {
                    last_reason = format!("resource type {:?} is not available", rtype);
                    feasible = false;
                    break;
                }
                if self.total(rtype) < *slots {
                    last_reason = format!(
                        "insufficient slots of {:?}: require {}, pool has {}",
                        rtype,
                        slots,
                        self.total(rtype)
                    );
                    feasible = false;
                    break;
                }
            }
            if feasible {
                return Ok(());
            }
        }
        Err(last_reason)
    }

    /// Free slots of a type (diagnostics only)
    pub fn free(&self, rtype: &str) -> u32 {
        let state = self.state.lock();
        state
            .items
            .get(rtype)
            .map(|row| row.iter().map(|i| i.free).sum())
            .unwrap_or(0)
    }
}

impl std::fmt::Debug for ResourcePool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResourcePool")
            .field("types", &self.types)
            .field("totals", &self.totals)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::case::ResourceRequest;

    fn group(items: &[(&str, u32)]) -> ResourceGroup {
        items
            .iter()
            .map(|(t, n)| ResourceRequest::new(*t, *n))
            .collect()
    }

    #[test]
    fn test_acquire_and_release_restore_slots() {
        let pool = ResourcePool::local(4, 1);
        let req = vec![group(&[("cpus", 2), ("gpus", 1)])];
        let a = pool.acquire(&req).unwrap();
        assert_eq!(pool.free("cpus"), 2);
        assert_eq!(pool.free("gpus"), 0);
        pool.release(&a);
        assert_eq!(pool.free("cpus"), 4);
        assert_eq!(pool.free("gpus"), 1);
    }

    #[test]
    fn test_acquire_fails_when_slots_exhausted() {
        let pool = ResourcePool::local(2, 0);
        let req = vec![group(&[("cpus", 2)])];
        let a = pool.acquire(&req).unwrap();
        assert!(pool.acquire(&req).is_none());
        pool.release(&a);
        assert!(pool.acquire(&req).is_some());
    }

    #[test]
    fn test_alternative_groups_prefer_authoring_order() {
        let pool = ResourcePool::local(4, 1);
        let req = vec![group(&[("gpus", 1)]), group(&[("cpus", 4)])];
        let a = pool.acquire(&req).unwrap();
        assert_eq!(pool.free("gpus"), 0);
        assert_eq!(pool.free("cpus"), 4);
        pool.release(&a);
    }

    #[test]
    fn test_second_group_used_when_first_cannot_fit() {
        let pool = ResourcePool::local(4, 0);
        let req = vec![group(&[("gpus", 1)]), group(&[("cpus", 2)])];
        let a = pool.acquire(&req).unwrap();
        assert_eq!(pool.free("cpus"), 2);
        pool.release(&a);
    }

    #[test]
    fn test_accommodates_reports_infeasible() {
        let pool = ResourcePool::local(4, 1);
        assert!(pool.accommodates(&[group(&[("gpus", 2)])]).is_err());
        assert!(pool.accommodates(&[group(&[("cpus", 4)])]).is_ok());
        assert!(pool
            .accommodates(&[group(&[("gpus", 2)]), group(&[("cpus", 1)])])
            .is_ok());
        assert!(pool.accommodates(&[group(&[("fpgas", 1)])]).is_err());
    }

    #[test]
    fn test_multi_slot_item_packing() {
        let mut resources = BTreeMap::new();
        resources.insert(
            "gpus".to_string(),
            vec![PoolItem {
                id: "0".to_string(),
                slots: 4,
            }],
        );
        let pool = ResourcePool::new(&resources);
        let a = pool.acquire(&[group(&[("gpus", 3)])]).unwrap();
        assert_eq!(pool.free("gpus"), 1);
        assert!(pool.acquire(&[group(&[("gpus", 2)])]).is_none());
        pool.release(&a);
        assert_eq!(pool.free("gpus"), 4);
    }

    #[test]
    fn test_environment_projection_format() {
        let pool = ResourcePool::local(2, 0);
        let a = pool.acquire(&[group(&[("cpus", 2)])]).unwrap();
        let env: BTreeMap<String, String> = a.env("CANARY").into_iter().collect();
        assert_eq!(env["CANARY_RESOURCE_GROUP_COUNT"], "1");
        assert_eq!(env["CANARY_RESOURCE_GROUP_0"], "cpus");
        // two single-slot cpus accumulated from the low end
        assert_eq!(
            env["CANARY_RESOURCE_GROUP_0_CPUS"],
            "id:0,slots:1;id:1,slots:1"
        );
    }
}

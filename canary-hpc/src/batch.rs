//! Test batches: groups of cases submitted to an HPC scheduler as one
//! job
//!
//! Per-batch on-disk layout under the session cache:
//!
//! - `canary_hpc/batches/<id[:2]>/<id[2:]>/config.json` session id,
//!   member case ids, and a status snapshot;
//! - `…/canary-inp.sh` the rendered submission script;
//! - `…/canary-out.txt` combined job output;
//! - `…/.running` breadcrumb while the job is in flight.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};

use canary_engine::case::CaseId;
use canary_engine::Catalog;

use crate::backend::SchedulerBackend;
use crate::error::{HpcError, HpcResult};

pub const SCRIPT_FILE: &str = "canary-inp.sh";
pub const LOG_FILE: &str = "canary-out.txt";
pub const CONFIG_FILE: &str = "config.json";
pub const BREADCRUMB: &str = ".running";

/// A batch of test cases
#[derive(Debug, Clone)]
pub struct TestBatch {
    /// 20-hex-char hash over the sorted member ids
    pub id: String,
    pub cases: Vec<CaseId>,
    /// Upstream batch ids mirroring the member case edges
    pub dependencies: Vec<String>,
    /// Approximate runtime in seconds from the packed perimeter
    pub runtime: f64,
    /// Environment exported into the job
    pub variables: BTreeMap<String, String>,
}

/// Persisted batch metadata (`config.json`)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchRecord {
    pub session: String,
    pub cases: Vec<CaseId>,
    pub status: String,
}

impl TestBatch {
    /// Build a batch over catalog members.  Masked members (or masked
    /// dependencies of members) are a validation error.
    pub fn new(catalog: &Catalog, cases: Vec<CaseId>, runtime: f64) -> HpcResult<Self> {
        let mut sorted = cases;
        sorted.sort();
        for id in &sorted {
            let case = catalog
                .get(id)
                .ok_or_else(|| HpcError::InvalidBatch(format!("{id} is not in the catalog")))?;
            if !case.active() {
                return Err(HpcError::InvalidBatch(format!(
                    "{}: case is masked",
                    case.display_name()
                )));
            }
            for edge in &case.dependencies {
                if let Some(dep) = catalog.get(&edge.id) {
                    if !dep.active() {
                        return Err(HpcError::InvalidBatch(format!(
                            "{}: dependency of {} is masked",
                            dep.display_name(),
                            case.display_name()
                        )));
                    }
                }
            }
        }
        let joined: Vec<&str> = sorted.iter().map(|id| id.as_str()).collect();
        let mut hasher = Sha256::new();
        hasher.update(joined.join(",").as_bytes());
        let id = hex::encode(hasher.finalize())[..20].to_string();
        let mut variables = BTreeMap::new();
        variables.insert("CANARY_BATCH_ID".to_string(), id.clone());
        variables.insert("CANARY_LEVEL".to_string(), "1".to_string());
        Ok(Self {
            id,
            cases: sorted,
            dependencies: Vec::new(),
            runtime,
            variables,
        })
    }

    pub fn len(&self) -> usize {
        self.cases.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cases.is_empty()
    }

    pub fn contains(&self, id: &CaseId) -> bool {
        self.cases.binary_search(id).is_ok()
    }

    /// Widest member in cpus
    pub fn max_cpus(&self, catalog: &Catalog) -> u32 {
        self.cases
            .iter()
            .filter_map(|id| catalog.get(id))
            .map(|c| c.cpus())
            .max()
            .unwrap_or(1)
    }

    /// Scheduling cost, mirroring the per-case metric
    pub fn cost(&self, catalog: &Catalog) -> f64 {
        let cpus = self.max_cpus(catalog) as f64;
        (cpus * cpus + self.runtime * self.runtime).sqrt()
    }

    /// Nodes required to run the batch members
    pub fn nodes_required(&self, catalog: &Catalog, backend: &dyn SchedulerBackend) -> u32 {
        let mut max_per_type: BTreeMap<String, u32> = BTreeMap::new();
        for id in &self.cases {
            let Some(case) = catalog.get(id) else { continue };
            for group in &case.resources {
                let mut per_type: BTreeMap<&str, u32> = BTreeMap::new();
                for request in group {
                    *per_type.entry(request.rtype.as_str()).or_insert(0) += request.slots;
                }
                for (rtype, slots) in per_type {
                    let entry = max_per_type.entry(rtype.to_string()).or_insert(0);
                    *entry = (*entry).max(slots);
                }
            }
        }
        let mut nodes = 1u32;
        for (rtype, slots) in max_per_type {
            if let Some(per_node) = backend.count_per_node(&rtype) {
                if per_node > 0 {
                    nodes = nodes.max(slots.div_ceil(per_node));
                }
            }
        }
        nodes
    }

    /// Queue time requested from the scheduler.  An explicit `--time`
    /// in the scheduler args wins; otherwise the runtime estimate is
    /// padded through a ladder so short batches are not killed at the
    /// margin.
    pub fn qtime(&self, catalog: &Catalog, scheduler_args: &[String]) -> f64 {
        if let Some(t) = time_from_args(scheduler_args) {
            return t;
        }
        if self.cases.len() == 1 {
            if let Some(case) = catalog.get(&self.cases[0]) {
                return case.runtime_estimate;
            }
        }
        let runtime = self.runtime;
        if runtime < 100.0 {
            300.0
        } else if runtime < 300.0 {
            600.0
        } else if runtime < 600.0 {
            1200.0
        } else if runtime < 1800.0 {
            2400.0
        } else if runtime < 3600.0 {
            5000.0
        } else {
            runtime * 1.25
        }
    }

    /// Per-batch working directory: `batches/<id[:2]>/<id[2:]>`
    pub fn stage(cache_dir: &Path, batch_id: &str) -> PathBuf {
        cache_dir
            .join("canary_hpc")
            .join("batches")
            .join(&batch_id[..2])
            .join(&batch_id[2..])
    }

    pub fn stage_dir(&self, cache_dir: &Path) -> PathBuf {
        Self::stage(cache_dir, &self.id)
    }

    pub fn script_file(&self, cache_dir: &Path) -> PathBuf {
        self.stage_dir(cache_dir).join(SCRIPT_FILE)
    }

    pub fn log_file(&self, cache_dir: &Path) -> PathBuf {
        self.stage_dir(cache_dir).join(LOG_FILE)
    }

    pub fn config_file(&self, cache_dir: &Path) -> PathBuf {
        self.stage_dir(cache_dir).join(CONFIG_FILE)
    }

    pub fn breadcrumb(&self, cache_dir: &Path) -> PathBuf {
        self.stage_dir(cache_dir).join(BREADCRUMB)
    }

    /// Create the stage directory and write `config.json`
    pub fn setup(&self, cache_dir: &Path, session: &str, status: &str) -> HpcResult<()> {
        let stage = self.stage_dir(cache_dir);
        std::fs::create_dir_all(&stage)?;
        let record = BatchRecord {
            session: session.to_string(),
            cases: self.cases.clone(),
            status: status.to_string(),
        };
        let text = serde_json::to_string_pretty(&record)?;
        std::fs::write(self.config_file(cache_dir), text)?;
        Ok(())
    }

    /// Read back `config.json` for a batch id
    pub fn load_record(cache_dir: &Path, batch_id: &str) -> HpcResult<BatchRecord> {
        let file = Self::stage(cache_dir, batch_id).join(CONFIG_FILE);
        let text = std::fs::read_to_string(&file)
            .map_err(|e| HpcError::Persistence(format!("{}: {}", file.display(), e)))?;
        Ok(serde_json::from_str(&text)?)
    }
}

/// Derive inter-batch dependency edges from the member case edges:
/// batch A depends on batch B iff any case in A depends on any case
/// in B.
pub fn link_batches(catalog: &Catalog, batches: &mut [TestBatch]) {
    let owner: BTreeMap<CaseId, String> = batches
        .iter()
        .flat_map(|b| b.cases.iter().map(move |id| (id.clone(), b.id.clone())))
        .collect();
    for batch in batches.iter_mut() {
        let mut upstream: BTreeSet<String> = BTreeSet::new();
        for id in &batch.cases {
            let Some(case) = catalog.get(id) else { continue };
            for edge in &case.dependencies {
                if let Some(owner_id) = owner.get(&edge.id) {
                    if owner_id != &batch.id {
                        upstream.insert(owner_id.clone());
                    }
                }
            }
        }
        batch.dependencies = upstream.into_iter().collect();
    }
}

fn time_from_args(args: &[String]) -> Option<f64> {
    let mut iter = args.iter();
    while let Some(arg) = iter.next() {
        if let Some(value) = arg.strip_prefix("--time=") {
            return value.parse().ok();
        }
        if arg == "--time" {
            return iter.next().and_then(|v| v.parse().ok());
        }
    }
    None
}

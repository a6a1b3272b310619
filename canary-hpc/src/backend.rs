//! Scheduler backend contract
//!
//! The engine talks to HPC schedulers through this narrow interface;
//! concrete backends render submission scripts, submit them, and poll
//! the resulting jobs.

use async_trait::async_trait;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use crate::error::{HpcError, HpcResult};

/// One submission request
#[derive(Debug, Clone)]
pub struct SubmitSpec {
    /// Job name shown by the scheduler
    pub name: String,
    /// Shell command lines run inside the allocation
    pub commands: Vec<String>,
    pub nodes: u32,
    /// Where to render the submission script
    pub scriptname: PathBuf,
    pub output: PathBuf,
    pub error: PathBuf,
    /// Extra flags passed through to the scheduler
    pub submit_flags: Vec<String>,
    /// Environment exported into the job
    pub variables: BTreeMap<String, String>,
    /// Queue time in seconds
    pub qtime: f64,
}

/// A submitted job
#[async_trait]
pub trait Job: Send {
    fn id(&self) -> String;

    /// `None` while running, the exit code once finished
    async fn poll(&mut self) -> HpcResult<Option<i32>>;

    async fn cancel(&mut self) -> HpcResult<()>;
}

/// A batch scheduler
#[async_trait]
pub trait SchedulerBackend: Send + Sync {
    fn name(&self) -> &'static str;

    /// Nodes available to this backend
    fn node_count(&self) -> u32;

    /// Resources of a type per node; `None` when the type is unknown
    fn count_per_node(&self, rtype: &str) -> Option<u32>;

    /// How often jobs should be polled
    fn polling_frequency(&self) -> Duration;

    async fn submit(&self, spec: SubmitSpec) -> HpcResult<Box<dyn Job>>;

    /// Submit a job array; the default maps to one submission per
    /// spec
    async fn submitn(&self, specs: Vec<SubmitSpec>) -> HpcResult<Vec<Box<dyn Job>>> {
        let mut jobs = Vec::with_capacity(specs.len());
        for spec in specs {
            jobs.push(self.submit(spec).await?);
        }
        Ok(jobs)
    }
}

/// Resolve a backend by name or alias
pub fn get_backend(name: &str) -> HpcResult<Arc<dyn SchedulerBackend>> {
    match name.to_lowercase().as_str() {
        "shell" | "subshell" | "subprocess" | "none" => {
            Ok(Arc::new(crate::subshell::SubShell::new()))
        }
        "slurm" | "sbatch" => Ok(Arc::new(crate::slurm::Slurm::from_environment())),
        other => Err(HpcError::NoSuchBackend(other.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backend_aliases_resolve() {
        assert_eq!(get_backend("shell").unwrap().name(), "subshell");
        assert_eq!(get_backend("none").unwrap().name(), "subshell");
        assert_eq!(get_backend("sbatch").unwrap().name(), "slurm");
        assert!(get_backend("pbs-pro-ultra").is_err());
    }
}

//! HPC batching for the canary test harness
//!
//! Packs ready cases into batches with a 2-D bin packer, renders
//! scheduler submission scripts, submits them through a narrow
//! backend interface, and merges per-case results back into the
//! session catalog.

#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]

pub mod backend;
pub mod batch;
pub mod batching;
pub mod binpack;
pub mod error;
pub mod slurm;
pub mod submit;
pub mod subshell;

pub use backend::{get_backend, Job, SchedulerBackend, SubmitSpec};
pub use batch::{BatchRecord, TestBatch};
pub use batching::{batch_cases, BatchScheme, NodesConstraint};
pub use binpack::{Bin, Block};
pub use error::{HpcError, HpcResult};
pub use submit::{BatchOptions, BatchRunner};

//! Translate test cases into packable blocks and batch them

use std::collections::BTreeMap;
use tracing::debug;

use canary_engine::case::CaseId;
use canary_engine::Catalog;

use crate::batch::{link_batches, TestBatch};
use crate::binpack::{self, Block, Grouper};
use crate::error::{HpcError, HpcResult};

/// How cases are partitioned into batches
#[derive(Debug, Clone, PartialEq)]
pub enum BatchScheme {
    /// Tile into bins of approximately this many seconds
    Duration(f64),
    /// Greedily fill this many bins
    Count(usize),
    /// One case per batch
    Atomic,
}

/// Node-uniformity constraint across a batch
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodesConstraint {
    Any,
    /// All cases in a batch need the same node count
    Same { cpus_per_node: u32 },
}

/// Partition the given cases into batches honoring the scheme and the
/// dependency DAG
pub fn batch_cases(
    catalog: &Catalog,
    cases: &[CaseId],
    scheme: &BatchScheme,
    nodes: NodesConstraint,
    width: Option<u64>,
) -> HpcResult<Vec<TestBatch>> {
    let lookup: BTreeMap<&str, &CaseId> =
        cases.iter().map(|id| (id.as_str(), id)).collect();
    let mut blocks = Vec::with_capacity(cases.len());
    for id in cases {
        let case = catalog
            .get(id)
            .ok_or_else(|| HpcError::InvalidBatch(format!("{id} is not in the catalog")))?;
        let dependencies = case
            .dependencies
            .iter()
            .filter(|edge| lookup.contains_key(edge.id.as_str()))
            .map(|edge| edge.id.to_string())
            .collect();
        let block = Block::new(
            id.to_string(),
            case.cpus().max(1) as u64,
            (case.runtime_estimate.ceil() as u64).max(1),
        )
        .with_dependencies(dependencies);
        blocks.push(block);
    }

    let group_by_nodes = |cpus_per_node: u32| {
        move |ready: Vec<Block>| -> Vec<Vec<Block>> {
            let mut groups: BTreeMap<u64, Vec<Block>> = BTreeMap::new();
            for block in ready {
                let nodes_reqd = block.width.div_ceil(cpus_per_node.max(1) as u64);
                groups.entry(nodes_reqd).or_default().push(block);
            }
            groups.into_values().collect()
        }
    };
    let grouper_fn;
    let grouper: Option<&Grouper> = match nodes {
        NodesConstraint::Any => None,
        NodesConstraint::Same { cpus_per_node } => {
            grouper_fn = group_by_nodes(cpus_per_node);
            Some(&grouper_fn)
        }
    };

    let bins = match scheme {
        BatchScheme::Duration(duration) => {
            debug!(duration, blocks = blocks.len(), "batching by duration");
            binpack::pack_to_height(&blocks, duration.ceil() as u64, width, grouper)?
        }
        BatchScheme::Count(count) => {
            debug!(count, blocks = blocks.len(), "batching by count");
            binpack::pack_by_count(&blocks, *count, grouper)?
        }
        BatchScheme::Atomic => {
            debug!(blocks = blocks.len(), "batching one case per batch");
            binpack::pack_by_count(&blocks, binpack::ONE_PER_BIN, None)?
        }
    };

    let mut batches = Vec::with_capacity(bins.len());
    for bin in &bins {
        let members: Vec<CaseId> = bin
            .blocks
            .iter()
            .filter_map(|b| lookup.get(b.id.as_str()).map(|id| (*id).clone()))
            .collect();
        let width = bin.blocks.iter().map(|b| b.width).max().unwrap_or(1);
        let runtime = if members.len() == 1 {
            bin.blocks[0].height as f64
        } else {
            let packed = binpack::packed_height(&bin.blocks, width) as f64;
            let total: u64 = bin.blocks.iter().map(|b| b.height).sum();
            packed.min(total as f64)
        };
        batches.push(TestBatch::new(catalog, members, runtime)?);
    }
    link_batches(catalog, &mut batches);
    Ok(batches)
}

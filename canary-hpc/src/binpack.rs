//! 2-D bin packing of test blocks
//!
//! Each case is a block `(width = cpus, height = runtime)`.  Blocks
//! are peeled off the dependency DAG in Kahn strata so no bin holds
//! two blocks with an edge between them, then tiled with a growing
//! binary-tree packer (duration mode) or distributed greedily by
//! vector norm (count mode).

use std::collections::{BTreeMap, BTreeSet};

use crate::error::{HpcError, HpcResult};

/// Sentinel: choose the batch count automatically (one bin per
/// stratum / dependency group)
pub const AUTO: usize = 1_000_001;
/// Sentinel: one block per bin
pub const ONE_PER_BIN: usize = 1_000_002;

/// Optional regrouping applied to each ready stratum before packing
/// (node-uniform batching)
pub type Grouper = dyn Fn(Vec<Block>) -> Vec<Vec<Block>>;

/// One packable unit
#[derive(Debug, Clone)]
pub struct Block {
    pub id: String,
    pub width: u64,
    pub height: u64,
    pub dependencies: Vec<String>,
    /// Placement assigned by the packer
    pub fit: Option<Rect>,
}

impl Block {
    pub fn new(id: impl Into<String>, width: u64, height: u64) -> Self {
        Self {
            id: id.into(),
            width,
            height,
            dependencies: Vec::new(),
            fit: None,
        }
    }

    pub fn with_dependencies(mut self, dependencies: Vec<String>) -> Self {
        self.dependencies = dependencies;
        self
    }

    pub fn norm(&self) -> f64 {
        ((self.width * self.width + self.height * self.height) as f64).sqrt()
    }
}

/// Placement rectangle within a bin
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Rect {
    pub x: u64,
    pub y: u64,
    pub w: u64,
    pub h: u64,
}

/// A set of blocks submitted together
#[derive(Debug, Clone, Default)]
pub struct Bin {
    pub blocks: Vec<Block>,
}

impl Bin {
    pub fn new(blocks: Vec<Block>) -> Self {
        Self { blocks }
    }

    pub fn len(&self) -> usize {
        self.blocks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }

    /// Vector norm of the bin's total width and height
    pub fn norm(&self) -> f64 {
        let width: u64 = self.blocks.iter().map(|b| b.width).sum();
        let height: u64 = self.blocks.iter().map(|b| b.height).sum();
        ((width * width + height * height) as f64).sqrt()
    }
}

/// Partition blocks into bins by tiling the 2-D space `width x height`
pub fn pack_to_height(
    blocks: &[Block],
    height: u64,
    width: Option<u64>,
    grouper: Option<&Grouper>,
) -> HpcResult<Vec<Bin>> {
    if let Some(width) = width {
        let too_wide = blocks.iter().filter(|b| b.width > width).count();
        if too_wide > 0 {
            return Err(HpcError::Packing(format!(
                "{} block(s) wider than the target width {}",
                too_wide, width
            )));
        }
    }

    let mut bins: Vec<Bin> = Vec::new();
    for stratum in strata(blocks)? {
        let mut ready = stratum;
        ready.sort_by(|a, b| {
            b.norm()
                .partial_cmp(&a.norm())
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.id.cmp(&b.id))
        });
        let groups = match grouper {
            Some(group_fn) => group_fn(ready),
            None => vec![ready],
        };
        for group in groups {
            pack_ready_group(group, height, width, &mut bins)?;
        }
    }

    let packed: usize = bins.iter().map(Bin::len).sum();
    if packed != blocks.len() {
        return Err(HpcError::Packing(format!(
            "packed {} of {} blocks",
            packed,
            blocks.len()
        )));
    }
    bins.retain(|bin| !bin.is_empty());
    Ok(bins)
}

fn pack_ready_group(
    group: Vec<Block>,
    height: u64,
    width: Option<u64>,
    bins: &mut Vec<Bin>,
) -> HpcResult<()> {
    if group.is_empty() {
        return Ok(());
    }
    let mut packer = Packer::new();
    let mut pending = group;
    loop {
        let max_width = pending.iter().map(|b| b.width).max().unwrap_or(1);
        let target_width = width.unwrap_or(max_width);
        let max_height = pending.iter().map(|b| b.height).max().unwrap_or(1);
        let target_height = height.max(max_height);
        packer.pack(&mut pending, Some(target_width), Some(target_height));
        let (fitted, unfit): (Vec<Block>, Vec<Block>) =
            pending.into_iter().partition(|b| b.fit.is_some());
        if fitted.is_empty() {
            return Err(HpcError::Packing(
                "unable to partition blocks".to_string(),
            ));
        }
        bins.push(Bin::new(fitted));
        if unfit.is_empty() {
            return Ok(());
        }
        pending = unfit;
    }
}

/// Pack blocks into at most `count` bins such that no bin has
/// intra-dependencies; bins may depend on other bins
pub fn pack_by_count(
    blocks: &[Block],
    count: usize,
    grouper: Option<&Grouper>,
) -> HpcResult<Vec<Bin>> {
    if count == ONE_PER_BIN {
        return Ok(blocks
            .iter()
            .map(|b| Bin::new(vec![b.clone()]))
            .collect());
    }
    if count == 1 {
        return Ok(vec![Bin::new(blocks.to_vec())]);
    }

    let mut groups: Vec<Vec<Block>> = Vec::new();
    for stratum in strata(blocks)? {
        match grouper {
            Some(group_fn) => groups.extend(group_fn(stratum)),
            None => groups.push(stratum),
        }
    }

    if count == AUTO {
        return Ok(groups.into_iter().map(Bin::new).collect());
    }
    if groups.len() > count {
        return Err(HpcError::Packing(format!(
            "count {} insufficient to partition {} dependency strata",
            count,
            groups.len()
        )));
    }

    // proportional bin budget per stratum, smallest strata first
    let mut sized: Vec<(f64, Vec<Block>)> = groups
        .into_iter()
        .map(|g| (g.iter().map(Block::norm).sum::<f64>(), g))
        .collect();
    sized.sort_by(|a, b| a.0.partial_cmp(&b.0).unwrap_or(std::cmp::Ordering::Equal));
    let total: f64 = sized.iter().map(|(s, _)| *s).sum();
    let mut budgets: Vec<usize> = Vec::with_capacity(sized.len());
    for (size, _) in sized.iter().take(sized.len().saturating_sub(1)) {
        let share = if total > 0.0 {
            (count as f64 * size / total).floor() as usize
        } else {
            1
        };
        budgets.push(share.max(1));
    }
    let used: usize = budgets.iter().sum();
    budgets.push(count.saturating_sub(used).max(1));

    let mut bins: Vec<Bin> = Vec::new();
    for ((_, group), budget) in sized.into_iter().zip(budgets) {
        let mut local: Vec<Bin> = (0..budget).map(|_| Bin::default()).collect();
        for block in group {
            if let Some(bin) = local.iter_mut().min_by(|a, b| {
                a.norm()
                    .partial_cmp(&b.norm())
                    .unwrap_or(std::cmp::Ordering::Equal)
            }) {
                bin.blocks.push(block);
            }
        }
        bins.extend(local.into_iter().filter(|b| !b.is_empty()));
    }
    Ok(bins)
}

/// Partition blocks into at most `count` bins keeping each block in
/// the same bin as its dependencies
pub fn pack_by_count_atomic(blocks: &[Block], count: usize) -> HpcResult<Vec<Bin>> {
    if count == 0 {
        return Err(HpcError::Packing("count must be > 0".to_string()));
    }
    if count == 1 {
        return Ok(vec![Bin::new(blocks.to_vec())]);
    }
    let groups = groupby_dep(blocks)?;
    if count == AUTO {
        let mut bins: Vec<Bin> = groups
            .iter()
            .filter(|g| g.len() > 1)
            .map(|g| Bin::new(g.clone()))
            .collect();
        let mean = if bins.is_empty() {
            0.0
        } else {
            bins.iter().map(Bin::norm).sum::<f64>() / bins.len() as f64
        };
        // singleton groups accumulate until they reach the mean size
        let mut pending = Bin::default();
        for group in groups.into_iter().filter(|g| g.len() == 1) {
            pending.blocks.extend(group);
            if pending.norm() >= mean {
                bins.push(std::mem::take(&mut pending));
            }
        }
        if !pending.is_empty() {
            bins.push(pending);
        }
        return Ok(bins);
    }
    let mut bins: Vec<Bin> = (0..count).map(|_| Bin::default()).collect();
    for group in groups {
        if let Some(bin) = bins.iter_mut().min_by(|a, b| {
            a.norm()
                .partial_cmp(&b.norm())
                .unwrap_or(std::cmp::Ordering::Equal)
        }) {
            bin.blocks.extend(group);
        }
    }
    bins.retain(|b| !b.is_empty());
    Ok(bins)
}

/// Group blocks so a block and its dependencies share a group
/// (connected components over dependency edges)
pub fn groupby_dep(blocks: &[Block]) -> HpcResult<Vec<Vec<Block>>> {
    let mut sets: Vec<BTreeSet<String>> = blocks
        .iter()
        .map(|b| {
            let mut set: BTreeSet<String> = b.dependencies.iter().cloned().collect();
            set.insert(b.id.clone());
            set
        })
        .collect();
    let mut merged: Vec<BTreeSet<String>> = Vec::new();
    while let Some(mut first) = sets.pop() {
        let mut combined = true;
        while combined {
            combined = false;
            sets.retain(|other| {
                if first.intersection(other).next().is_some() {
                    first.extend(other.iter().cloned());
                    combined = true;
                    false
                } else {
                    true
                }
            });
        }
        merged.push(first);
    }

    let by_id: BTreeMap<&str, &Block> = blocks.iter().map(|b| (b.id.as_str(), b)).collect();
    let mut groups: Vec<Vec<Block>> = Vec::new();
    for set in merged {
        let group: Vec<Block> = set
            .iter()
            .filter_map(|id| by_id.get(id.as_str()).map(|b| (*b).clone()))
            .collect();
        if !group.is_empty() {
            groups.push(group);
        }
    }
    let total: usize = groups.iter().map(Vec::len).sum();
    if total != blocks.len() {
        return Err(HpcError::Packing("incorrect partition lengths".to_string()));
    }
    Ok(groups)
}

/// Kahn strata over the blocks' dependency edges (edges outside the
/// set are ignored)
fn strata(blocks: &[Block]) -> HpcResult<Vec<Vec<Block>>> {
    let ids: BTreeSet<&str> = blocks.iter().map(|b| b.id.as_str()).collect();
    let mut remaining: BTreeMap<&str, BTreeSet<&str>> = blocks
        .iter()
        .map(|b| {
            let deps: BTreeSet<&str> = b
                .dependencies
                .iter()
                .map(String::as_str)
                .filter(|d| ids.contains(d))
                .collect();
            (b.id.as_str(), deps)
        })
        .collect();
    let by_id: BTreeMap<&str, &Block> = blocks.iter().map(|b| (b.id.as_str(), b)).collect();
    let mut result = Vec::new();
    while !remaining.is_empty() {
        let ready: Vec<&str> = remaining
            .iter()
            .filter(|(_, deps)| deps.is_empty())
            .map(|(id, _)| *id)
            .collect();
        if ready.is_empty() {
            return Err(HpcError::Packing("dependency cycle among blocks".to_string()));
        }
        for id in &ready {
            remaining.remove(id);
        }
        for deps in remaining.values_mut() {
            for id in &ready {
                deps.remove(id);
            }
        }
        result.push(
            ready
                .iter()
                .filter_map(|id| by_id.get(id).map(|b| (*b).clone()))
                .collect(),
        );
    }
    Ok(result)
}

/// Bounding perimeter of packed blocks
pub fn perimeter(blocks: &[Block]) -> (u64, u64) {
    let mut max_x = 0;
    let mut max_y = 0;
    for block in blocks {
        if let Some(fit) = &block.fit {
            max_x = max_x.max(fit.x + fit.w);
            max_y = max_y.max(fit.y + fit.h);
        }
    }
    (max_x, max_y)
}

/// Estimate the packed height of a set of blocks at a fixed width
pub fn packed_height(blocks: &[Block], width: u64) -> u64 {
    let mut sorted: Vec<Block> = blocks.to_vec();
    sorted.sort_by(|a, b| {
        b.norm()
            .partial_cmp(&a.norm())
            .unwrap_or(std::cmp::Ordering::Equal)
    });
    let mut packer = Packer::new();
    packer.pack(&mut sorted, Some(width.max(1)), None);
    perimeter(&sorted).1
}

// Growing binary-tree packer: place a block at the first node that
// fits, splitting the remaining space down and right; grow the root
// when a dimension is unbounded.

struct Node {
    origin: (u64, u64),
    size: (u64, u64),
    used: bool,
    down: Option<usize>,
    right: Option<usize>,
}

struct Packer {
    nodes: Vec<Node>,
    root: usize,
    auto: (bool, bool),
}

impl Packer {
    fn new() -> Self {
        Self {
            nodes: Vec::new(),
            root: 0,
            auto: (false, false),
        }
    }

    fn node(&mut self, origin: (u64, u64), size: (u64, u64)) -> usize {
        self.nodes.push(Node {
            origin,
            size,
            used: false,
            down: None,
            right: None,
        });
        self.nodes.len() - 1
    }

    fn pack(&mut self, blocks: &mut [Block], width: Option<u64>, height: Option<u64>) {
        self.nodes.clear();
        let max_w = blocks.iter().map(|b| b.width).max().unwrap_or(1);
        let max_h = blocks.iter().map(|b| b.height).max().unwrap_or(1);
        self.auto = (width.is_none(), height.is_none());
        let width = width.unwrap_or_else(|| (3 * max_w).div_ceil(2));
        let height = height.unwrap_or_else(|| (3 * max_h).div_ceil(2));
        self.root = self.node((0, 0), (width, height));
        for i in 0..blocks.len() {
            let size = (blocks[i].width.max(1), blocks[i].height.max(1));
            let placed = match self.find(self.root, size) {
                Some(node) => Some(self.split(node, size)),
                None => self.grow(size),
            };
            blocks[i].fit = placed.map(|node| Rect {
                x: self.nodes[node].origin.0,
                y: self.nodes[node].origin.1,
                w: size.0,
                h: size.1,
            });
        }
    }

    fn find(&self, index: usize, size: (u64, u64)) -> Option<usize> {
        let node = &self.nodes[index];
        if node.used {
            let right = node.right?;
            let down = node.down?;
            self.find(right, size).or_else(|| self.find(down, size))
        } else if size.0 <= node.size.0 && size.1 <= node.size.1 {
            Some(index)
        } else {
            None
        }
    }

    fn split(&mut self, index: usize, size: (u64, u64)) -> usize {
        let (origin, node_size) = {
            let node = &self.nodes[index];
            (node.origin, node.size)
        };
        let down = self.node(
            (origin.0, origin.1 + size.1),
            (node_size.0, node_size.1 - size.1),
        );
        let right = self.node(
            (origin.0 + size.0, origin.1),
            (node_size.0 - size.0, size.1),
        );
        let node = &mut self.nodes[index];
        node.used = true;
        node.down = Some(down);
        node.right = Some(right);
        index
    }

    fn grow(&mut self, size: (u64, u64)) -> Option<usize> {
        let root_size = self.nodes[self.root].size;
        let can_grow_right = self.auto.0 && size.1 <= root_size.1;
        let can_grow_down = self.auto.1 && size.0 <= root_size.0;
        let should_grow_right = can_grow_right && root_size.1 >= root_size.0 + size.0;
        let should_grow_down = can_grow_down && root_size.0 >= root_size.1 + size.1;

        if should_grow_right {
            self.grow_right(size)
        } else if should_grow_down {
            self.grow_down(size)
        } else if can_grow_right {
            self.grow_right(size)
        } else if can_grow_down {
            self.grow_down(size)
        } else {
            None
        }
    }

    fn grow_right(&mut self, size: (u64, u64)) -> Option<usize> {
        let old_root = self.root;
        let old_size = self.nodes[old_root].size;
        let right = self.node((old_size.0, 0), (size.0, old_size.1));
        let root = self.node((0, 0), (old_size.0 + size.0, old_size.1));
        self.nodes[root].used = true;
        self.nodes[root].down = Some(old_root);
        self.nodes[root].right = Some(right);
        self.root = root;
        self.find(self.root, size).map(|node| self.split(node, size))
    }

    fn grow_down(&mut self, size: (u64, u64)) -> Option<usize> {
        let old_root = self.root;
        let old_size = self.nodes[old_root].size;
        let down = self.node((0, old_size.1), (old_size.0, size.1));
        let root = self.node((0, 0), (old_size.0, old_size.1 + size.1));
        self.nodes[root].used = true;
        self.nodes[root].down = Some(down);
        self.nodes[root].right = Some(old_root);
        self.root = root;
        self.find(self.root, size).map(|node| self.split(node, size))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn blocks(n: usize, width: u64, height: u64) -> Vec<Block> {
        (0..n)
            .map(|i| Block::new(format!("case{i}"), width, height))
            .collect()
    }

    #[test]
    fn test_pack_by_duration_tiles_evenly() {
        // 12 independent 5-minute single-cpu cases, 4 cpus wide, bins
        // bounded by one 5-minute row: exactly 3 bins of 4 cases
        let blocks = blocks(12, 1, 300);
        let bins = pack_to_height(&blocks, 300, Some(4), None).unwrap();
        assert_eq!(bins.len(), 3);
        for bin in &bins {
            assert_eq!(bin.len(), 4);
            let (_, height) = perimeter(&bin.blocks);
            assert!(height <= 900, "bin exceeds the 15 minute budget");
        }
    }

    #[test]
    fn test_taller_height_target_packs_more_rows() {
        let blocks = blocks(12, 1, 300);
        let bins = pack_to_height(&blocks, 900, Some(4), None).unwrap();
        // three 4-wide rows of 5 minutes stack within 15 minutes
        assert_eq!(bins.len(), 1);
        let (width, height) = perimeter(&bins[0].blocks);
        assert!(width <= 4);
        assert!(height <= 900);
    }

    #[test]
    fn test_pack_to_height_accounts_for_every_block() {
        let mut all = blocks(7, 2, 100);
        all.push(Block::new("wide", 4, 500));
        let bins = pack_to_height(&all, 600, Some(4), None).unwrap();
        let packed: usize = bins.iter().map(Bin::len).sum();
        assert_eq!(packed, 8);
        let mut seen: BTreeSet<String> = BTreeSet::new();
        for bin in &bins {
            for block in &bin.blocks {
                assert!(seen.insert(block.id.clone()), "block packed twice");
            }
        }
    }

    #[test]
    fn test_pack_to_height_rejects_overwide_blocks() {
        let blocks = vec![Block::new("big", 8, 100)];
        assert!(pack_to_height(&blocks, 600, Some(4), None).is_err());
    }

    #[test]
    fn test_dependent_blocks_land_in_dependency_order() {
        let up = Block::new("up", 1, 100);
        let down = Block::new("down", 1, 100).with_dependencies(vec!["up".to_string()]);
        let bins = pack_to_height(&[up, down], 600, None, None).unwrap();
        // strata force the dependent block into a later bin
        assert_eq!(bins.len(), 2);
        assert_eq!(bins[0].blocks[0].id, "up");
        assert_eq!(bins[1].blocks[0].id, "down");
    }

    #[test]
    fn test_pack_by_count_distributes_by_norm() {
        let blocks = blocks(10, 1, 100);
        let bins = pack_by_count(&blocks, 5, None).unwrap();
        assert_eq!(bins.len(), 5);
        for bin in &bins {
            assert_eq!(bin.len(), 2);
        }
    }

    #[test]
    fn test_pack_by_count_one_per_bin() {
        let blocks = blocks(4, 1, 100);
        let bins = pack_by_count(&blocks, ONE_PER_BIN, None).unwrap();
        assert_eq!(bins.len(), 4);
    }

    #[test]
    fn test_pack_by_count_atomic_keeps_components_together() {
        let a = Block::new("a", 1, 100);
        let b = Block::new("b", 1, 100).with_dependencies(vec!["a".to_string()]);
        let c = Block::new("c", 1, 100);
        let bins = pack_by_count_atomic(&[a, b, c], 2).unwrap();
        assert_eq!(bins.len(), 2);
        let with_pair = bins
            .iter()
            .find(|bin| bin.blocks.iter().any(|blk| blk.id == "a"))
            .unwrap();
        assert!(with_pair.blocks.iter().any(|blk| blk.id == "b"));
    }

    #[test]
    fn test_groupby_dep_connected_components() {
        let a = Block::new("a", 1, 1);
        let b = Block::new("b", 1, 1).with_dependencies(vec!["a".to_string()]);
        let c = Block::new("c", 1, 1).with_dependencies(vec!["b".to_string()]);
        let d = Block::new("d", 1, 1);
        let groups = groupby_dep(&[a, b, c, d]).unwrap();
        assert_eq!(groups.len(), 2);
        let sizes: Vec<usize> = {
            let mut v: Vec<usize> = groups.iter().map(Vec::len).collect();
            v.sort();
            v
        };
        assert_eq!(sizes, vec![1, 3]);
    }

    #[test]
    fn test_packed_height_estimate() {
        let blocks = blocks(4, 1, 100);
        let height = packed_height(&blocks, 4);
        assert_eq!(height, 100);
        // at half the width the rows stack (the growing root pads the
        // estimate past the ideal 200)
        let height = packed_height(&blocks, 2);
        assert!(height >= 200);
    }

    #[test]
    fn test_cycle_in_blocks_is_an_error() {
        let a = Block::new("a", 1, 1).with_dependencies(vec!["b".to_string()]);
        let b = Block::new("b", 1, 1).with_dependencies(vec!["a".to_string()]);
        assert!(pack_to_height(&[a, b], 600, None, None).is_err());
    }
}

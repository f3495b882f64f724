//! Branch profiling for speculative recompilation.
//!
//! Compiled conditionals report every branch selection to a `BranchObserver`
//! passed in by the caller. Two observers exist:
//! - `BranchLivenessProfiler` only records whether each side was ever taken
//! - `BranchCounter` records per-side counts, so rarely taken sides can be
//!   speculated away behind a guard

use std::fmt;

use rustc_hash::{FxHashMap, FxHashSet};

use crate::ssa::node::Node;
use crate::ssa::optimize::prune_unreached;

/// Identifies a conditional: the ordinal of the basic block that embeds it
/// (0 for a stand-alone program) and its position in that block's array.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BranchId {
    pub block: u32,
    pub node: u16,
}

impl BranchId {
    pub fn new(block: u32, node: u16) -> Self {
        Self { block, node }
    }
}

impl fmt::Display for BranchId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "bb{}:%{}", self.block, self.node)
    }
}

/// Receives branch selections from instrumented code.
pub trait BranchObserver {
    fn taken(&mut self, branch: BranchId);
    fn not_taken(&mut self, branch: BranchId);
}

/// Observed dispositions for one basic block, ready for `prune_unreached`.
#[derive(Debug, Default, Clone)]
pub struct BranchSets {
    pub taken: FxHashSet<u16>,
    pub not_taken: FxHashSet<u16>,
}

impl BranchSets {
    /// Apply these dispositions to `nodes`. Returns the number of pruned conditionals.
    pub fn apply(&self, nodes: &mut [Option<Node>], offset: usize, emit_guard: bool) -> usize {
        prune_unreached(nodes, offset, &self.taken, &self.not_taken, emit_guard)
    }
}

/// Records whether each side of each conditional was ever selected.
#[derive(Debug, Default)]
pub struct BranchLivenessProfiler {
    taken: FxHashSet<BranchId>,
    not_taken: FxHashSet<BranchId>,
}

impl BranchLivenessProfiler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn sets(&self, block: u32) -> BranchSets {
        BranchSets {
            taken: Self::collect(&self.taken, block),
            not_taken: Self::collect(&self.not_taken, block),
        }
    }

    /// Commit observed dispositions into `nodes`.
    pub fn strip(&self, nodes: &mut [Option<Node>], block: u32, offset: usize) -> usize {
        self.sets(block).apply(nodes, offset, false)
    }

    pub fn is_empty(&self) -> bool {
        self.taken.is_empty() && self.not_taken.is_empty()
    }

    fn collect(set: &FxHashSet<BranchId>, block: u32) -> FxHashSet<u16> {
        set.iter()
            .filter(|branch| branch.block == block)
            .map(|branch| branch.node)
            .collect()
    }
}

impl BranchObserver for BranchLivenessProfiler {
    fn taken(&mut self, branch: BranchId) {
        self.taken.insert(branch);
    }

    fn not_taken(&mut self, branch: BranchId) {
        self.not_taken.insert(branch);
    }
}

/// Per-side selection counts for one conditional.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct BranchCounts {
    pub taken: u64,
    pub not_taken: u64,
}

/// Counts every branch selection.
#[derive(Debug, Default)]
pub struct BranchCounter {
    counts: FxHashMap<BranchId, BranchCounts>,
}

impl BranchCounter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, branch: BranchId) -> Option<BranchCounts> {
        self.counts.get(&branch).copied()
    }

    /// Dispositions for one block. A side counts as observed only when it
    /// was selected more than `threshold` times, so a non-zero threshold
    /// treats rarely taken sides as unreached.
    pub fn sets(&self, block: u32, threshold: u64) -> BranchSets {
        let mut sets = BranchSets::default();

        for (branch, counts) in self.counts.iter().filter(|(branch, _)| branch.block == block) {
            if counts.taken > threshold {
                sets.taken.insert(branch.node);
            }
            if counts.not_taken > threshold {
                sets.not_taken.insert(branch.node);
            }
        }

        sets
    }

    /// Collapse conditionals of `block` whose cold side stayed within
    /// `threshold`, optionally behind a bailout guard.
    pub fn strip(
        &self,
        nodes: &mut [Option<Node>],
        block: u32,
        offset: usize,
        threshold: u64,
        emit_guard: bool,
    ) -> usize {
        self.sets(block, threshold).apply(nodes, offset, emit_guard)
    }

    pub fn stats(&self) -> BranchStats {
        let mut stats = BranchStats {
            tracked: self.counts.len(),
            ..BranchStats::default()
        };

        for counts in self.counts.values() {
            stats.selections += counts.taken + counts.not_taken;
            if counts.taken == 0 || counts.not_taken == 0 {
                stats.one_sided += 1;
            }
        }

        stats
    }

    pub fn clear(&mut self) {
        self.counts.clear();
    }
}

impl BranchObserver for BranchCounter {
    fn taken(&mut self, branch: BranchId) {
        let counts = self.counts.entry(branch).or_default();
        counts.taken = counts.taken.saturating_add(1);
    }

    fn not_taken(&mut self, branch: BranchId) {
        let counts = self.counts.entry(branch).or_default();
        counts.not_taken = counts.not_taken.saturating_add(1);
    }
}

/// Summary of a branch counter.
#[derive(Debug, Default, Clone, Copy)]
pub struct BranchStats {
    pub tracked: usize,
    pub one_sided: usize,
    pub selections: u64,
}

impl fmt::Display for BranchStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} branch(es) tracked, {} one-sided, {} selection(s)",
            self.tracked, self.one_sided, self.selections
        )
    }
}

//! Observed-behavior passes over Turing trees.
//!
//! A `TuringProfile` is built fresh for every profiling round and passed to
//! instrumented executions. The passes below only hold for the inputs that
//! were sampled, so they are re-run every round and never cached.
//! - `commit_branches`: collapse one-sided conditionals for good
//! - `speculate_branches`: collapse rarely taken conditionals behind guards
//! - `strip_dead_loops`: remove loops whose body never ran
//!
//! The branch passes key on basic-block ordinals, so they must run before
//! `strip_dead_loops` changes the shape of the tree.

use log::debug;
use rustc_hash::FxHashSet;

use crate::jit::profiler::BranchCounter;

use super::node::TuringNode;

/// Instrumentation context for one worker and one round.
#[derive(Debug, Default)]
pub struct TuringProfile {
    pub branches: BranchCounter,
    reached: FxHashSet<u32>,
}

impl TuringProfile {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn mark_reached(&mut self, block: u32) {
        self.reached.insert(block);
    }

    pub fn is_reached(&self, block: u32) -> bool {
        self.reached.contains(&block)
    }

    pub fn reached_count(&self) -> usize {
        self.reached.len()
    }
}

/// Commit every conditional that was only seen going one way and drop any
/// specialized arrays. `offset` is the number of leading argument slots.
pub fn commit_branches(tree: &mut TuringNode, profile: &TuringProfile, offset: usize) -> usize {
    let mut committed = 0;
    for (ordinal, block) in tree.basic_blocks_mut().into_iter().enumerate() {
        block.specialized = None;
        committed += profile
            .branches
            .strip(&mut block.nodes, ordinal as u32, offset, 0, false);
    }

    debug!("Committed {} branch(es)", committed);
    committed
}

/// Build guarded specialized arrays in which every conditional whose cold
/// side was taken at most `threshold` times is collapsed. Blocks with nothing
/// to collapse get no specialized array.
pub fn speculate_branches(
    tree: &mut TuringNode,
    profile: &TuringProfile,
    offset: usize,
    threshold: u64,
) -> usize {
    let mut speculated = 0;
    for (ordinal, block) in tree.basic_blocks_mut().into_iter().enumerate() {
        let mut specialized = block.nodes.clone();
        let pruned = profile
            .branches
            .strip(&mut specialized, ordinal as u32, offset, threshold, true);

        block.specialized = (pruned > 0).then_some(specialized);
        speculated += pruned;
    }

    debug!("Speculated on {} branch(es)", speculated);
    speculated
}

/// Replace every loop whose body block was never reached with `NoOp`.
/// Block ordinals follow the post-order numbering of the instrumented
/// compile. Returns the rewritten tree and the number of removed loops.
pub fn strip_dead_loops(tree: TuringNode, profile: &TuringProfile) -> (TuringNode, usize) {
    let mut blocks = 0u32;
    let mut stripped = 0;

    let tree = tree.rewrite(&mut |node| match node {
        TuringNode::Block(children) => {
            blocks += 1;
            TuringNode::Block(children)
        }
        // the body was the last block numbered before its loop
        TuringNode::WhileLoop { condition, body } => {
            if matches!(*body, TuringNode::Block(_)) && !profile.is_reached(blocks - 1) {
                stripped += 1;
                TuringNode::NoOp
            } else {
                TuringNode::WhileLoop { condition, body }
            }
        }
        other => other,
    });

    debug!("Stripped {} dead loop(s)", stripped);
    (tree, stripped)
}

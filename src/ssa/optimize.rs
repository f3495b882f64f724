//! Whole-array optimization passes for the scalar IR.
//!
//! - `optimize_all`: per-node simplification + dead-code elimination to a fixed point
//! - `prune_unreached`: profile-guided branch collapsing, committed or guarded

use std::borrow::Cow;

use log::trace;
use rustc_hash::FxHashSet;

use super::node::Node;

/// Simplify every node and remove dead ones until nothing changes.
///
/// Nodes at or after `protected_start` (the outputs) are never removed, and
/// neither are arguments. Any other node with no later reader is dropped.
/// Returns the number of rounds that changed something.
pub fn optimize_all(nodes: &mut [Option<Node>], protected_start: usize) -> usize {
    let count = nodes.len();
    if count < 2 {
        return 0;
    }

    let mut rounds = 0;
    let mut useful = vec![false; count];

    loop {
        let mut changed = false;

        for i in 1..count {
            let Some(old) = nodes[i] else {
                continue;
            };

            let (prior, _) = nodes.split_at(i);
            if let Cow::Owned(optimized) = old.optimize(prior) {
                nodes[i] = Some(optimized);
                changed = true;
            }
        }

        useful.iter_mut().for_each(|flag| *flag = false);
        for i in (1..count).rev() {
            if i < protected_start && !useful[i] {
                if let Some(node) = nodes[i] {
                    if !node.is_removal_protected() {
                        nodes[i] = None;
                        changed = true;
                        continue;
                    }
                }
            }

            if let Some(node) = nodes[i] {
                for read in node.reads() {
                    useful[read as usize] = true;
                }
            }
        }

        if !changed {
            break;
        }
        rounds += 1;
    }

    trace!("Optimizer reached a fixed point after {} round(s)", rounds);
    rounds
}

/// Collapse conditionals after `offset` whose branches were only observed
/// going one way.
///
/// A conditional seen in both sets is left alone, and so is one seen in
/// neither. With `emit_guard` the conditional becomes a `Bailout` that keeps
/// checking its condition; without it the selection is committed.
pub fn prune_unreached(
    nodes: &mut [Option<Node>],
    offset: usize,
    taken: &FxHashSet<u16>,
    not_taken: &FxHashSet<u16>,
    emit_guard: bool,
) -> usize {
    let mut pruned = 0;

    for i in offset.max(1)..nodes.len() {
        let Some(node @ Node::Conditional { .. }) = nodes[i] else {
            continue;
        };

        let index = i as u16;
        let was_taken = taken.contains(&index);
        let was_not_taken = not_taken.contains(&index);
        if was_taken == was_not_taken {
            continue;
        }

        let (prior, _) = nodes.split_at(i);
        if let Some(replacement) = node.collapse_conditional(prior, was_taken, emit_guard) {
            nodes[i] = Some(replacement);
            pruned += 1;
        }
    }

    pruned
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ssa::node::BinaryOp;

    fn arg(parameter: u16) -> Option<Node> {
        Some(Node::Argument { parameter })
    }

    #[test]
    fn test_removes_unread_nodes() {
        let mut nodes = vec![
            arg(0),
            Some(Node::binary(BinaryOp::Mul, 0, 0)),
            Some(Node::binary(BinaryOp::Add, 0, 0)),
            Some(Node::binary(BinaryOp::Sub, 0, 2)),
        ];

        optimize_all(&mut nodes, 3);

        assert!(nodes[1].is_none());
        assert!(nodes[2].is_some());
        assert!(nodes[3].is_some());
    }

    #[test]
    fn test_removal_cascades_upstream() {
        let mut nodes = vec![
            arg(0),
            Some(Node::binary(BinaryOp::Mul, 0, 0)),
            Some(Node::binary(BinaryOp::Add, 1, 0)),
            Some(Node::constant(4.0)),
        ];

        optimize_all(&mut nodes, 3);

        assert_eq!(nodes[1], None);
        assert_eq!(nodes[2], None);
    }

    #[test]
    fn test_arguments_are_protected() {
        let mut nodes = vec![arg(0), arg(1), Some(Node::constant(1.0))];
        optimize_all(&mut nodes, 2);
        assert_eq!(nodes[1], arg(1));
    }

    #[test]
    fn test_constant_folding_shortens_chains() {
        let mut nodes = vec![
            arg(0),
            Some(Node::constant(2.0)),
            Some(Node::constant(3.0)),
            Some(Node::binary(BinaryOp::Mul, 1, 2)),
            Some(Node::binary(BinaryOp::Add, 0, 3)),
        ];

        optimize_all(&mut nodes, 4);

        assert_eq!(nodes[1], None);
        assert_eq!(nodes[2], None);
        assert_eq!(nodes[3], Some(Node::constant(6.0)));
    }

    #[test]
    fn test_second_run_is_a_fixed_point() {
        let mut nodes = vec![
            arg(0),
            arg(1),
            Some(Node::constant(0.0)),
            Some(Node::binary(BinaryOp::Add, 0, 2)),
            Some(Node::binary(BinaryOp::Mul, 3, 1)),
            Some(Node::Conditional { x: 4, y: 3, cond: 1 }),
        ];

        optimize_all(&mut nodes, 5);
        let snapshot = nodes.clone();

        assert_eq!(optimize_all(&mut nodes, 5), 0);
        assert_eq!(nodes, snapshot);
    }

    #[test]
    fn test_prune_commits_single_observed_branch() {
        let mut nodes = vec![
            arg(0),
            arg(1),
            Some(Node::binary(BinaryOp::Add, 0, 1)),
            Some(Node::Conditional { x: 2, y: 0, cond: 1 }),
        ];

        let taken: FxHashSet<u16> = [3].into_iter().collect();
        let pruned = prune_unreached(&mut nodes, 2, &taken, &FxHashSet::default(), false);

        assert_eq!(pruned, 1);
        assert_eq!(nodes[3], Some(Node::Move { target: 2 }));
    }

    #[test]
    fn test_prune_leaves_ambiguous_branches() {
        let mut nodes = vec![arg(0), arg(1), Some(Node::Conditional { x: 0, y: 1, cond: 1 })];
        let both: FxHashSet<u16> = [2].into_iter().collect();

        assert_eq!(prune_unreached(&mut nodes, 1, &both, &both, true), 0);
        assert_eq!(
            prune_unreached(&mut nodes, 1, &FxHashSet::default(), &FxHashSet::default(), true),
            0
        );
        assert!(matches!(nodes[2], Some(Node::Conditional { .. })));
    }

    #[test]
    fn test_prune_with_guard_emits_bailout() {
        let mut nodes = vec![arg(0), arg(1), Some(Node::Conditional { x: 0, y: 1, cond: 1 })];
        let not_taken: FxHashSet<u16> = [2].into_iter().collect();

        prune_unreached(&mut nodes, 1, &FxHashSet::default(), &not_taken, true);

        assert_eq!(
            nodes[2],
            Some(Node::Bailout {
                branch: 1,
                cond: 1,
                taken: false
            })
        );
    }
}

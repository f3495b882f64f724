//! Random program generation and mutation for the scalar IR.

use std::collections::VecDeque;

use log::{trace, warn};
use rand::Rng;
use rustc_hash::FxHashSet;

use crate::error::EvoError;
use crate::EvoResult;

use super::node::{BinaryOp, Node};
use super::optimize::optimize_all;

/// Number of node kinds `random_node` picks from: a constant, every binary
/// operator and a conditional.
const NODE_KINDS: usize = BinaryOp::ALL.len() + 2;

/// Upper bound on optimize/regenerate rounds in `strip_static_invalid_values`.
pub const MAX_STRIP_ROUNDS: usize = 1024;

/// A random node for slot `position`. Operands are drawn from `[0, position)`.
pub fn random_node<R: Rng + ?Sized>(position: usize, rng: &mut R) -> Node {
    if position == 0 {
        return random_constant(rng);
    }

    let position = position.min(u16::MAX as usize + 1) as u16;
    match rng.gen_range(0..NODE_KINDS) {
        0 => random_constant(rng),
        kind if kind <= BinaryOp::ALL.len() => Node::binary(
            BinaryOp::ALL[kind - 1],
            rng.gen_range(0..position),
            rng.gen_range(0..position),
        ),
        _ => Node::Conditional {
            x: rng.gen_range(0..position),
            y: rng.gen_range(0..position),
            cond: rng.gen_range(0..position),
        },
    }
}

fn random_constant<R: Rng + ?Sized>(rng: &mut R) -> Node {
    let numerator = rng.gen_range(0..i32::MAX) as f64;
    let denominator = rng.gen_range(1..i32::MAX) as f64;
    Node::constant(numerator / denominator)
}

/// A fresh program: `arguments` argument nodes followed by random nodes, for
/// `complexity` slots in total.
pub fn generate_initial<R: Rng + ?Sized>(
    arguments: usize,
    complexity: usize,
    rng: &mut R,
) -> EvoResult<Vec<Option<Node>>> {
    if arguments == 0 {
        return Err(EvoError::NoArguments);
    }
    if complexity <= arguments {
        return Err(EvoError::ComplexityTooLow {
            complexity,
            arguments,
        });
    }
    if complexity > u16::MAX as usize + 1 {
        return Err(EvoError::InvalidConfig {
            message: format!("complexity {} exceeds the addressable node count", complexity),
        });
    }

    let mut nodes = Vec::with_capacity(complexity);
    nodes.extend((0..arguments).map(|parameter| {
        Some(Node::Argument {
            parameter: parameter as u16,
        })
    }));
    for position in arguments..complexity {
        nodes.push(Some(random_node(position, rng)));
    }

    Ok(nodes)
}

/// Regenerate every queued slot, breadth first. A new node that reads an
/// absent slot queues that slot too, so the array ends fully defined again.
pub fn randomize<R: Rng + ?Sized>(nodes: &mut [Option<Node>], mut queue: VecDeque<usize>, rng: &mut R) {
    let mut pending: FxHashSet<usize> = queue.iter().copied().collect();

    while let Some(slot) = queue.pop_front() {
        pending.remove(&slot);

        let node = random_node(slot, rng);
        nodes[slot] = Some(node);

        for read in node.reads() {
            let read = read as usize;
            if nodes[read].is_none() && pending.insert(read) {
                queue.push_back(read);
            }
        }
    }
}

/// Replace one present slot at or after `offset` with a random node.
/// Returns the mutated slot, or `None` if nothing is mutable.
pub fn random_mutate<R: Rng + ?Sized>(nodes: &mut [Option<Node>], offset: usize, rng: &mut R) -> Option<usize> {
    let offset = offset.max(1);
    if offset >= nodes.len() {
        return None;
    }

    let present: Vec<usize> = (offset..nodes.len()).filter(|&i| nodes[i].is_some()).collect();
    let slot = if present.is_empty() {
        rng.gen_range(offset..nodes.len())
    } else {
        present[rng.gen_range(0..present.len())]
    };

    randomize(nodes, VecDeque::from([slot]), rng);
    Some(slot)
}

/// Optimize, then regenerate every node that provably yields NaN or an
/// infinity or violates a checked operator's domain, until none remain.
/// Returns the number of regenerated slots.
pub fn strip_static_invalid_values<R: Rng + ?Sized>(
    nodes: &mut [Option<Node>],
    protected_start: usize,
    rng: &mut R,
) -> usize {
    let mut regenerated = 0;

    for _ in 0..MAX_STRIP_ROUNDS {
        optimize_all(nodes, protected_start);

        let offenders: VecDeque<usize> = (1..nodes.len())
            .filter(|&i| match nodes[i] {
                Some(node) if !node.is_removal_protected() => {
                    let prior = &nodes[..i];
                    node.is_static_invalid(prior) || node.is_static_non_finite(prior)
                }
                _ => false,
            })
            .collect();

        if offenders.is_empty() {
            return regenerated;
        }

        trace!("Regenerating {} statically invalid node(s)", offenders.len());
        regenerated += offenders.len();
        randomize(nodes, offenders, rng);
    }

    warn!(
        "Static invalid values remain after {} rounds",
        MAX_STRIP_ROUNDS
    );
    regenerated
}

#[cfg(test)]
mod tests {
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    use super::*;
    use crate::ssa::node::validate;

    #[test]
    fn test_generate_initial_shape() {
        let mut rng = StdRng::seed_from_u64(1);
        let nodes = generate_initial(3, 20, &mut rng).unwrap();

        assert_eq!(nodes.len(), 20);
        for (parameter, node) in nodes.iter().take(3).enumerate() {
            assert_eq!(
                *node,
                Some(Node::Argument {
                    parameter: parameter as u16
                })
            );
        }
        assert!(nodes.iter().all(Option::is_some));
        validate(&nodes).unwrap();
    }

    #[test]
    fn test_generate_initial_rejects_bad_shapes() {
        let mut rng = StdRng::seed_from_u64(1);
        assert!(matches!(generate_initial(0, 4, &mut rng), Err(EvoError::NoArguments)));
        assert!(matches!(
            generate_initial(4, 4, &mut rng),
            Err(EvoError::ComplexityTooLow {
                complexity: 4,
                arguments: 4
            })
        ));
    }

    #[test]
    fn test_mutation_preserves_ordering() {
        let mut rng = StdRng::seed_from_u64(7);
        let mut nodes = generate_initial(2, 40, &mut rng).unwrap();

        for _ in 0..200 {
            optimize_all(&mut nodes, 39);
            let slot = random_mutate(&mut nodes, 2, &mut rng).unwrap();
            assert!(slot >= 2);
            validate(&nodes).unwrap();
        }
    }

    #[test]
    fn test_randomize_cascades_into_absent_slots() {
        let mut rng = StdRng::seed_from_u64(3);
        let mut nodes = generate_initial(1, 30, &mut rng).unwrap();
        for slot in nodes.iter_mut().take(29).skip(1) {
            *slot = None;
        }

        randomize(&mut nodes, VecDeque::from([29]), &mut rng);
        validate(&nodes).unwrap();
    }

    #[test]
    fn test_strip_static_invalid_values() {
        let mut rng = StdRng::seed_from_u64(9);
        let mut nodes = vec![
            Some(Node::Argument { parameter: 0 }),
            Some(Node::ZERO),
            Some(Node::binary(BinaryOp::Div, 0, 1)),
            Some(Node::binary(BinaryOp::Add, 2, 0)),
        ];

        strip_static_invalid_values(&mut nodes, 3, &mut rng);

        validate(&nodes).unwrap();
        for i in 1..nodes.len() {
            if let Some(node) = nodes[i] {
                assert!(!node.is_static_invalid(&nodes[..i]));
                assert!(!node.is_static_non_finite(&nodes[..i]));
            }
        }
    }
}

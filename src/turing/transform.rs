//! Random mutation of Turing trees.

use log::trace;
use rand::distributions::{Distribution, WeightedIndex};
use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::error::EvoError;
use crate::ssa::generator::{generate_initial, random_mutate, strip_static_invalid_values};
use crate::EvoResult;

use super::node::{ScalarBasicBlock, TuringNode};

/// Tunable weights of `RandomTransformer`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MutationOdds {
    /// Block mutation: recurse into a random child.
    pub descend: u32,
    /// Block mutation: insert a random leaf before a random child.
    pub insert: u32,
    /// Block mutation: remove a random child.
    pub remove: u32,
    /// Probability that a loop re-rolls its condition variable instead of
    /// mutating its body.
    pub loop_flip: f64,
    /// Probability that a memory write re-rolls its address rather than its value.
    pub write_address: f64,
    pub leaf_read: u32,
    pub leaf_write: u32,
    pub leaf_block: u32,
    pub leaf_loop: u32,
}

impl Default for MutationOdds {
    fn default() -> Self {
        Self {
            descend: 1,
            insert: 1,
            remove: 1,
            loop_flip: 0.5,
            write_address: 0.5,
            leaf_read: 1,
            leaf_write: 1,
            leaf_block: 1,
            leaf_loop: 1,
        }
    }
}

impl MutationOdds {
    pub fn validate(&self) -> EvoResult<()> {
        if self.descend + self.insert + self.remove == 0 {
            return Err(EvoError::InvalidConfig {
                message: "block mutation weights are all zero".to_string(),
            });
        }
        if self.leaf_read + self.leaf_write + self.leaf_block + self.leaf_loop == 0 {
            return Err(EvoError::InvalidConfig {
                message: "leaf weights are all zero".to_string(),
            });
        }
        for (name, p) in [("loop_flip", self.loop_flip), ("write_address", self.write_address)] {
            if !(0.0..=1.0).contains(&p) {
                return Err(EvoError::InvalidConfig {
                    message: format!("{} must be a probability, got {}", name, p),
                });
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy)]
enum BlockEdit {
    Descend,
    Insert,
    Remove,
}

#[derive(Debug, Clone, Copy)]
enum Leaf {
    Read,
    Write,
    BasicBlock,
    Loop,
}

/// Applies one random edit somewhere in a tree.
#[derive(Debug, Clone)]
pub struct RandomTransformer {
    variables: usize,
    block_complexity: usize,
    odds: MutationOdds,
    edits: WeightedIndex<u32>,
    leaves: WeightedIndex<u32>,
}

impl RandomTransformer {
    pub fn new(variables: usize, block_complexity: usize, odds: MutationOdds) -> EvoResult<Self> {
        if variables == 0 {
            return Err(EvoError::NoArguments);
        }
        if block_complexity <= variables {
            return Err(EvoError::ComplexityTooLow {
                complexity: block_complexity,
                arguments: variables,
            });
        }
        odds.validate()?;

        let weights_error = |err: rand::distributions::WeightedError| EvoError::InvalidConfig {
            message: err.to_string(),
        };
        let edits = WeightedIndex::new([odds.descend, odds.insert, odds.remove]).map_err(weights_error)?;
        let leaves = WeightedIndex::new([odds.leaf_read, odds.leaf_write, odds.leaf_block, odds.leaf_loop])
            .map_err(weights_error)?;

        Ok(Self {
            variables,
            block_complexity,
            odds,
            edits,
            leaves,
        })
    }

    /// A fresh basic block: variables in, random nodes, every variable out.
    pub fn random_basic_block<R: Rng + ?Sized>(&self, rng: &mut R) -> EvoResult<ScalarBasicBlock> {
        let mut nodes = generate_initial(self.variables, self.block_complexity, rng)?;
        strip_static_invalid_values(&mut nodes, self.block_complexity - self.variables, rng);
        Ok(ScalarBasicBlock::new(nodes))
    }

    pub fn random_leaf<R: Rng + ?Sized>(&self, rng: &mut R) -> EvoResult<TuringNode> {
        const LEAVES: [Leaf; 4] = [Leaf::Read, Leaf::Write, Leaf::BasicBlock, Leaf::Loop];

        let leaf = match LEAVES[self.leaves.sample(rng)] {
            Leaf::Read => TuringNode::MemoryRead {
                target: self.random_variable(rng),
            },
            Leaf::Write => TuringNode::MemoryWrite {
                address: self.random_variable(rng),
                value: self.random_variable(rng),
            },
            Leaf::BasicBlock => TuringNode::BasicBlock(self.random_basic_block(rng)?),
            Leaf::Loop => TuringNode::WhileLoop {
                condition: self.random_variable(rng),
                body: Box::new(TuringNode::Block(vec![TuringNode::BasicBlock(
                    self.random_basic_block(rng)?,
                )])),
            },
        };

        Ok(leaf)
    }

    /// Apply one random edit to `node` or one of its descendants.
    pub fn mutate<R: Rng + ?Sized>(&self, node: &mut TuringNode, rng: &mut R) -> EvoResult<()> {
        const EDITS: [BlockEdit; 3] = [BlockEdit::Descend, BlockEdit::Insert, BlockEdit::Remove];

        match node {
            TuringNode::Block(children) if children.is_empty() => {
                children.push(self.random_leaf(rng)?);
            }
            TuringNode::Block(children) => {
                let target = rng.gen_range(0..children.len());
                match EDITS[self.edits.sample(rng)] {
                    BlockEdit::Descend => self.mutate(&mut children[target], rng)?,
                    BlockEdit::Insert => children.insert(target, self.random_leaf(rng)?),
                    BlockEdit::Remove => {
                        children.remove(target);
                    }
                }
            }
            TuringNode::BasicBlock(block) => {
                let slot = random_mutate(&mut block.nodes, self.variables, rng);
                strip_static_invalid_values(&mut block.nodes, self.block_complexity - self.variables, rng);
                block.specialized = None;
                trace!("Mutated basic block slot {:?}", slot);
            }
            TuringNode::WhileLoop { condition, body } => {
                if rng.gen_bool(self.odds.loop_flip) {
                    *condition = self.random_variable(rng);
                } else {
                    self.mutate(body, rng)?;
                }
            }
            TuringNode::MemoryRead { target } => {
                *target = self.random_variable(rng);
            }
            TuringNode::MemoryWrite { address, value } => {
                if rng.gen_bool(self.odds.write_address) {
                    *address = self.random_variable(rng);
                } else {
                    *value = self.random_variable(rng);
                }
            }
            TuringNode::NoOp => {}
        }

        Ok(())
    }

    fn random_variable<R: Rng + ?Sized>(&self, rng: &mut R) -> u16 {
        rng.gen_range(0..self.variables) as u16
    }
}

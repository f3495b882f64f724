//! Turing-complete control tree.
//!
//! Leaves operate on a fixed set of `f64` variables and a paged virtual
//! memory; scalar basic blocks embed a straight-line IR array whose outputs
//! overwrite every variable.

use std::fmt;

use crate::ssa::node::Node;

/// A scalar IR array embedded in the tree. `specialized`, when present, is a
/// guarded copy of `nodes` tried first at runtime; it can always be dropped
/// without changing behavior.
#[derive(Debug, Clone, PartialEq)]
pub struct ScalarBasicBlock {
    pub nodes: Vec<Option<Node>>,
    pub specialized: Option<Vec<Option<Node>>>,
}

impl ScalarBasicBlock {
    pub fn new(nodes: Vec<Option<Node>>) -> Self {
        Self {
            nodes,
            specialized: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum TuringNode {
    NoOp,
    Block(Vec<TuringNode>),
    /// Runs `body` while `variables[condition] > 0`.
    WhileLoop {
        condition: u16,
        body: Box<TuringNode>,
    },
    /// `variables[target] = memory[variables[target]]`
    MemoryRead {
        target: u16,
    },
    /// `memory[variables[address]] = variables[value]`
    MemoryWrite {
        address: u16,
        value: u16,
    },
    BasicBlock(ScalarBasicBlock),
}

impl TuringNode {
    pub fn empty() -> Self {
        TuringNode::Block(Vec::new())
    }

    /// Post-order rewrite. Children are rewritten before their parent is
    /// handed to `f`, and blocks drop children that became `NoOp`.
    pub fn rewrite<F>(self, f: &mut F) -> TuringNode
    where
        F: FnMut(TuringNode) -> TuringNode,
    {
        let node = match self {
            TuringNode::Block(children) => TuringNode::Block(
                children
                    .into_iter()
                    .map(|child| child.rewrite(f))
                    .filter(|child| !matches!(child, TuringNode::NoOp))
                    .collect(),
            ),
            TuringNode::WhileLoop { condition, body } => TuringNode::WhileLoop {
                condition,
                body: Box::new(body.rewrite(f)),
            },
            leaf => leaf,
        };

        f(node)
    }

    /// Every embedded basic block, left to right. A block's index in this
    /// list is its ordinal for branch profiling.
    pub fn basic_blocks(&self) -> Vec<&ScalarBasicBlock> {
        let mut blocks = Vec::new();
        collect(self, &mut blocks);
        blocks
    }

    pub fn basic_blocks_mut(&mut self) -> Vec<&mut ScalarBasicBlock> {
        let mut blocks = Vec::new();
        collect_mut(self, &mut blocks);
        blocks
    }

    pub fn basic_block_mut(&mut self, ordinal: usize) -> Option<&mut ScalarBasicBlock> {
        self.basic_blocks_mut().into_iter().nth(ordinal)
    }

    /// Drop every specialized array.
    pub fn clear_specialized(&mut self) {
        for block in self.basic_blocks_mut() {
            block.specialized = None;
        }
    }

    /// Number of nodes in the tree, basic blocks counted once.
    pub fn size(&self) -> usize {
        match self {
            TuringNode::Block(children) => 1 + children.iter().map(TuringNode::size).sum::<usize>(),
            TuringNode::WhileLoop { body, .. } => 1 + body.size(),
            _ => 1,
        }
    }

    fn fmt_indented(&self, f: &mut fmt::Formatter<'_>, depth: usize) -> fmt::Result {
        let pad = depth * 2;
        match self {
            TuringNode::NoOp => writeln!(f, "{:pad$}nop", ""),
            TuringNode::Block(children) => {
                writeln!(f, "{:pad$}{{", "")?;
                for child in children {
                    child.fmt_indented(f, depth + 1)?;
                }
                writeln!(f, "{:pad$}}}", "")
            }
            TuringNode::WhileLoop { condition, body } => {
                writeln!(f, "{:pad$}while v{} > 0", "", condition)?;
                body.fmt_indented(f, depth + 1)
            }
            TuringNode::MemoryRead { target } => {
                writeln!(f, "{:pad$}v{} = mem[v{}]", "", target, target)
            }
            TuringNode::MemoryWrite { address, value } => {
                writeln!(f, "{:pad$}mem[v{}] = v{}", "", address, value)
            }
            TuringNode::BasicBlock(block) => {
                writeln!(
                    f,
                    "{:pad$}bb({} live node(s){})",
                    "",
                    block.nodes.iter().flatten().count(),
                    if block.specialized.is_some() {
                        ", specialized"
                    } else {
                        ""
                    }
                )
            }
        }
    }
}

impl fmt::Display for TuringNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.fmt_indented(f, 0)
    }
}

fn collect<'a>(node: &'a TuringNode, blocks: &mut Vec<&'a ScalarBasicBlock>) {
    match node {
        TuringNode::Block(children) => children.iter().for_each(|child| collect(child, blocks)),
        TuringNode::WhileLoop { body, .. } => collect(body, blocks),
        TuringNode::BasicBlock(block) => blocks.push(block),
        _ => {}
    }
}

fn collect_mut<'a>(node: &'a mut TuringNode, blocks: &mut Vec<&'a mut ScalarBasicBlock>) {
    match node {
        TuringNode::Block(children) => children
            .iter_mut()
            .for_each(|child| collect_mut(child, blocks)),
        TuringNode::WhileLoop { body, .. } => collect_mut(body, blocks),
        TuringNode::BasicBlock(block) => blocks.push(block),
        _ => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn block(nodes: usize) -> TuringNode {
        TuringNode::BasicBlock(ScalarBasicBlock::new(
            (0..nodes)
                .map(|parameter| {
                    Some(Node::Argument {
                        parameter: parameter as u16,
                    })
                })
                .collect(),
        ))
    }

    fn sample() -> TuringNode {
        TuringNode::Block(vec![
            block(1),
            TuringNode::WhileLoop {
                condition: 0,
                body: Box::new(TuringNode::Block(vec![block(2), TuringNode::MemoryRead { target: 0 }])),
            },
            block(3),
        ])
    }

    #[test]
    fn test_basic_blocks_are_left_to_right() {
        let tree = sample();
        let sizes: Vec<usize> = tree.basic_blocks().iter().map(|b| b.nodes.len()).collect();
        assert_eq!(sizes, vec![1, 2, 3]);
    }

    #[test]
    fn test_rewrite_drops_noops_from_blocks() {
        let tree = sample().rewrite(&mut |node| match node {
            TuringNode::MemoryRead { .. } => TuringNode::NoOp,
            other => other,
        });

        let TuringNode::Block(children) = &tree else {
            panic!("root must stay a block");
        };
        let TuringNode::WhileLoop { body, .. } = &children[1] else {
            panic!("loop must survive");
        };
        assert_eq!(**body, TuringNode::Block(vec![block(2)]));
        assert_eq!(tree.size(), 6);
    }

    #[test]
    fn test_size_counts_every_node() {
        assert_eq!(sample().size(), 7);
        assert_eq!(TuringNode::empty().size(), 1);
    }

    #[test]
    fn test_clear_specialized() {
        let mut tree = sample();
        for bb in tree.basic_blocks_mut() {
            bb.specialized = Some(bb.nodes.clone());
        }

        tree.clear_specialized();
        assert!(tree.basic_blocks().iter().all(|b| b.specialized.is_none()));
    }

    #[test]
    fn test_basic_block_mut_by_ordinal() {
        let mut tree = sample();
        let bb = tree.basic_block_mut(1).unwrap();
        assert_eq!(bb.nodes.len(), 2);
        assert!(tree.basic_block_mut(3).is_none());
    }
}

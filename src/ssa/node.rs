//! Scalar IR nodes.
//!
//! A program is a fixed-length array of optional nodes. Every operand index
//! of the node at position `i` is strictly less than `i`, so the array is
//! acyclic and evaluates in position order. An empty slot means the node was
//! proven dead and removed.

use std::borrow::Cow;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::EvoError;
use crate::EvoResult;

/// Binary arithmetic operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
    Mod,
    Pow,
    Log,
}

impl BinaryOp {
    pub const ALL: [BinaryOp; 7] = [
        BinaryOp::Add,
        BinaryOp::Sub,
        BinaryOp::Mul,
        BinaryOp::Div,
        BinaryOp::Mod,
        BinaryOp::Pow,
        BinaryOp::Log,
    ];

    #[inline(always)]
    pub fn apply(self, x: f64, y: f64) -> f64 {
        match self {
            BinaryOp::Add => x + y,
            BinaryOp::Sub => x - y,
            BinaryOp::Mul => x * y,
            BinaryOp::Div => x / y,
            BinaryOp::Mod => x % y,
            BinaryOp::Pow => x.powf(y),
            BinaryOp::Log => x.log(y),
        }
    }

    /// Operators with a checked variant.
    pub fn is_checked(self) -> bool {
        matches!(
            self,
            BinaryOp::Div | BinaryOp::Mod | BinaryOp::Pow | BinaryOp::Log
        )
    }

    /// Domain check for checked operators. Division and modulo reject a zero
    /// divisor, log rejects a non-positive base (its right operand) and pow
    /// rejects a non-positive base (its left operand).
    #[inline(always)]
    pub fn is_invalid(self, x: f64, y: f64) -> bool {
        match self {
            BinaryOp::Div | BinaryOp::Mod => y == 0.0,
            BinaryOp::Log => y <= 0.0,
            BinaryOp::Pow => x <= 0.0,
            _ => false,
        }
    }
}

impl fmt::Display for BinaryOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let symbol = match self {
            BinaryOp::Add => "+",
            BinaryOp::Sub => "-",
            BinaryOp::Mul => "*",
            BinaryOp::Div => "/",
            BinaryOp::Mod => "%",
            BinaryOp::Pow => "**",
            BinaryOp::Log => "log",
        };
        write!(f, "{}", symbol)
    }
}

/// A single scalar IR node. Operands are positions in the owning array.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind")]
pub enum Node {
    Constant {
        #[serde(with = "crate::serialize::float_repr")]
        value: f64,
    },
    Argument {
        parameter: u16,
    },
    Binary {
        op: BinaryOp,
        lhs: u16,
        rhs: u16,
    },
    /// Pure alias of an earlier node.
    Move {
        target: u16,
    },
    /// Selects `x` when `cond > 0`, otherwise `y`.
    Conditional {
        x: u16,
        y: u16,
        cond: u16,
    },
    /// Speculatively evaluates `branch`, re-checking that `cond > 0` still
    /// equals `taken`. A mismatch raises `Signal::Bailout`.
    Bailout {
        branch: u16,
        cond: u16,
        taken: bool,
    },
}

/// Operand positions read by a node.
#[derive(Debug, Clone, Copy)]
pub struct Reads {
    slots: [u16; 3],
    len: usize,
    next: usize,
}

impl Iterator for Reads {
    type Item = u16;

    fn next(&mut self) -> Option<u16> {
        if self.next < self.len {
            self.next += 1;
            Some(self.slots[self.next - 1])
        } else {
            None
        }
    }
}

impl Node {
    pub const NAN: Node = Node::Constant { value: f64::NAN };
    pub const ZERO: Node = Node::Constant { value: 0.0 };
    pub const ONE: Node = Node::Constant { value: 1.0 };

    pub fn constant(value: f64) -> Self {
        Node::Constant { value }
    }

    pub fn binary(op: BinaryOp, lhs: u16, rhs: u16) -> Self {
        Node::Binary { op, lhs, rhs }
    }

    pub fn reads(&self) -> Reads {
        let (slots, len) = match *self {
            Node::Constant { .. } | Node::Argument { .. } => ([0; 3], 0),
            Node::Binary { lhs, rhs, .. } => ([lhs, rhs, 0], 2),
            Node::Move { target } => ([target, 0, 0], 1),
            Node::Conditional { x, y, cond } => ([x, y, cond], 3),
            Node::Bailout { branch, cond, .. } => ([cond, branch, 0], 2),
        };

        Reads {
            slots,
            len,
            next: 0,
        }
    }

    /// Constants, arguments and aliases compile to a value without any
    /// computation and may be duplicated freely.
    pub fn is_direct(&self) -> bool {
        matches!(
            self,
            Node::Constant { .. } | Node::Argument { .. } | Node::Move { .. }
        )
    }

    /// Arguments are never removed by dead-code elimination.
    pub fn is_removal_protected(&self) -> bool {
        matches!(self, Node::Argument { .. })
    }

    /// Attempt to evaluate this node at compile time. `prior` holds every
    /// node before this one. Succeeds only if all transitive operands fold.
    pub fn try_evaluate(&self, prior: &[Option<Node>]) -> Option<f64> {
        match *self {
            Node::Constant { value } => Some(value),
            Node::Argument { .. } => None,
            Node::Binary { op, lhs, rhs } => {
                let x = evaluate_slot(prior, lhs)?;
                let y = evaluate_slot(prior, rhs)?;
                Some(op.apply(x, y))
            }
            Node::Move { target } => evaluate_slot(prior, target),
            Node::Conditional { x, y, cond } => {
                let z = evaluate_slot(prior, cond)?;
                evaluate_slot(prior, if z > 0.0 { x } else { y })
            }
            Node::Bailout {
                branch,
                cond,
                taken,
            } => {
                let z = evaluate_slot(prior, cond)?;
                if (z > 0.0) == taken {
                    evaluate_slot(prior, branch)
                } else {
                    None
                }
            }
        }
    }

    /// Algebraic simplification of a single node. Returns `Cow::Borrowed`
    /// when nothing changed, which drives the optimizer's fixed point.
    pub fn optimize<'a>(&'a self, prior: &[Option<Node>]) -> Cow<'a, Node> {
        match *self {
            Node::Constant { .. } | Node::Argument { .. } => Cow::Borrowed(self),
            Node::Binary { op, lhs, rhs } => match optimize_binary(op, lhs, rhs, prior) {
                Some(node) => Cow::Owned(node),
                None => Cow::Borrowed(self),
            },
            Node::Conditional { x, y, cond } => match evaluate_slot(prior, cond) {
                Some(z) => Cow::Owned(select_branch(prior, if z > 0.0 { x } else { y })),
                None => Cow::Borrowed(self),
            },
            Node::Move { .. } | Node::Bailout { .. } => match self.try_evaluate(prior) {
                Some(value) => Cow::Owned(Node::constant(value)),
                None => Cow::Borrowed(self),
            },
        }
    }

    /// Replace a conditional by one of its branches. With `emit_guard` the
    /// replacement is a `Bailout` that still re-checks the condition;
    /// without it the decision is committed.
    pub fn collapse_conditional(&self, prior: &[Option<Node>], taken: bool, emit_guard: bool) -> Option<Node> {
        let Node::Conditional { x, y, cond } = *self else {
            return None;
        };
        let branch = if taken { x } else { y };

        if emit_guard {
            return Some(Node::Bailout {
                branch,
                cond,
                taken,
            });
        }

        Some(select_branch(prior, branch))
    }

    /// True if a checked operator can be proven invalid without running it.
    pub fn is_static_invalid(&self, prior: &[Option<Node>]) -> bool {
        let Node::Binary { op, lhs, rhs } = *self else {
            return false;
        };

        match op {
            BinaryOp::Div | BinaryOp::Mod | BinaryOp::Log => {
                matches!(evaluate_slot(prior, rhs), Some(y) if op.is_invalid(1.0, y))
            }
            BinaryOp::Pow => matches!(evaluate_slot(prior, lhs), Some(x) if x <= 0.0),
            _ => false,
        }
    }

    /// True if this node folds to NaN or an infinity.
    pub fn is_static_non_finite(&self, prior: &[Option<Node>]) -> bool {
        matches!(self.try_evaluate(prior), Some(value) if !value.is_finite())
    }
}

impl fmt::Display for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Node::Constant { value } => write!(f, "{}", value),
            Node::Argument { parameter } => write!(f, "arg{}", parameter),
            Node::Binary { op, lhs, rhs } => write!(f, "%{} {} %{}", lhs, op, rhs),
            Node::Move { target } => write!(f, "%{}", target),
            Node::Conditional { x, y, cond } => write!(f, "%{} > 0 ? %{} : %{}", cond, x, y),
            Node::Bailout {
                branch,
                cond,
                taken,
            } => write!(f, "guard(%{} > 0 == {}) %{}", cond, taken, branch),
        }
    }
}

fn evaluate_slot(prior: &[Option<Node>], slot: u16) -> Option<f64> {
    let slot = slot as usize;
    prior.get(slot)?.as_ref()?.try_evaluate(&prior[..slot])
}

/// The node a committed branch selection turns into: the branch's own
/// optimized form when that is directly compilable, otherwise an alias.
fn select_branch(prior: &[Option<Node>], branch: u16) -> Node {
    let index = branch as usize;
    match prior.get(index).and_then(|node| node.as_ref()) {
        Some(node) => {
            let optimized = node.optimize(&prior[..index]);
            if optimized.is_direct() {
                optimized.into_owned()
            } else {
                Node::Move { target: branch }
            }
        }
        None => Node::Move { target: branch },
    }
}

/// Alias of operand `slot`, reusing the operand itself when it is direct.
fn alias(prior: &[Option<Node>], slot: u16) -> Node {
    match prior.get(slot as usize).and_then(|node| node.as_ref()) {
        Some(node) if node.is_direct() => *node,
        _ => Node::Move { target: slot },
    }
}

fn optimize_binary(op: BinaryOp, lhs: u16, rhs: u16, prior: &[Option<Node>]) -> Option<Node> {
    let x = evaluate_slot(prior, lhs);
    let y = evaluate_slot(prior, rhs);

    if let (Some(x), Some(y)) = (x, y) {
        return Some(Node::constant(op.apply(x, y)));
    }

    // mod and log only fold
    if matches!(op, BinaryOp::Mod | BinaryOp::Log) {
        return None;
    }

    if x.map_or(false, f64::is_nan) || y.map_or(false, f64::is_nan) {
        return Some(Node::NAN);
    }

    match op {
        BinaryOp::Add => match (x, y) {
            (Some(x), _) if x == 0.0 => Some(alias(prior, rhs)),
            (_, Some(y)) if y == 0.0 => Some(alias(prior, lhs)),
            _ => None,
        },
        BinaryOp::Sub => match y {
            Some(y) if y == 0.0 => Some(alias(prior, lhs)),
            _ => None,
        },
        BinaryOp::Mul => match (x, y) {
            (Some(x), _) if x == 1.0 => Some(alias(prior, rhs)),
            (_, Some(y)) if y == 1.0 => Some(alias(prior, lhs)),
            (Some(x), _) if x == 0.0 => Some(Node::ZERO),
            (_, Some(y)) if y == 0.0 => Some(Node::ZERO),
            _ => None,
        },
        BinaryOp::Div => match y {
            Some(y) if y == 1.0 => Some(alias(prior, lhs)),
            _ => None,
        },
        BinaryOp::Pow => match (x, y) {
            (Some(x), _) if x == 1.0 => Some(Node::ONE),
            (_, Some(y)) if y == 0.0 => Some(Node::ONE),
            _ => None,
        },
        BinaryOp::Mod | BinaryOp::Log => None,
    }
}

/// Check the ordering invariant: every operand of node `i` is present and
/// strictly before `i`.
pub fn validate(nodes: &[Option<Node>]) -> EvoResult<()> {
    for (index, node) in nodes.iter().enumerate() {
        let Some(node) = node else {
            continue;
        };

        for operand in node.reads() {
            let operand = operand as usize;
            if operand >= index {
                return Err(EvoError::ForwardReference { index, operand });
            }
            if nodes[operand].is_none() {
                return Err(EvoError::AbsentOperand { index, operand });
            }
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn arg(parameter: u16) -> Option<Node> {
        Some(Node::Argument { parameter })
    }

    fn constant(value: f64) -> Option<Node> {
        Some(Node::constant(value))
    }

    #[test]
    fn test_try_evaluate_follows_chains() {
        let nodes = vec![
            arg(0),
            constant(2.0),
            constant(3.0),
            Some(Node::binary(BinaryOp::Mul, 1, 2)),
            Some(Node::Move { target: 3 }),
        ];

        assert_eq!(nodes[4].unwrap().try_evaluate(&nodes[..4]), Some(6.0));
    }

    #[test]
    fn test_try_evaluate_fails_on_arguments() {
        let nodes = vec![arg(0), constant(2.0), Some(Node::binary(BinaryOp::Add, 0, 1))];
        assert_eq!(nodes[2].unwrap().try_evaluate(&nodes[..2]), None);
    }

    #[test]
    fn test_optimize_returns_borrowed_when_unchanged() {
        let nodes = vec![arg(0), arg(1), Some(Node::binary(BinaryOp::Add, 0, 1))];
        let node = nodes[2].unwrap();
        assert!(matches!(node.optimize(&nodes[..2]), Cow::Borrowed(_)));
    }

    #[test]
    fn test_identity_elimination() {
        let nodes = vec![arg(0), constant(0.0), constant(1.0)];

        let add = Node::binary(BinaryOp::Add, 1, 0);
        assert_eq!(*add.optimize(&nodes), Node::Argument { parameter: 0 });

        let mul = Node::binary(BinaryOp::Mul, 0, 2);
        assert_eq!(*mul.optimize(&nodes), Node::Argument { parameter: 0 });

        let div = Node::binary(BinaryOp::Div, 0, 2);
        assert_eq!(*div.optimize(&nodes), Node::Argument { parameter: 0 });
    }

    #[test]
    fn test_division_by_one_on_the_left_is_kept() {
        let nodes = vec![arg(0), constant(1.0)];
        let div = Node::binary(BinaryOp::Div, 1, 0);
        assert!(matches!(div.optimize(&nodes), Cow::Borrowed(_)));
    }

    #[test]
    fn test_alias_of_computed_node_is_move() {
        let nodes = vec![
            arg(0),
            arg(1),
            Some(Node::binary(BinaryOp::Sub, 0, 1)),
            constant(0.0),
        ];
        let add = Node::binary(BinaryOp::Add, 2, 3);
        assert_eq!(*add.optimize(&nodes), Node::Move { target: 2 });
    }

    #[test]
    fn test_absorbing_elements() {
        let nodes = vec![arg(0), constant(0.0), constant(f64::NAN)];

        let mul = Node::binary(BinaryOp::Mul, 0, 1);
        assert_eq!(*mul.optimize(&nodes), Node::ZERO);

        let sub = Node::binary(BinaryOp::Sub, 0, 2);
        match *sub.optimize(&nodes) {
            Node::Constant { value } => assert!(value.is_nan()),
            other => panic!("expected NaN constant, got {:?}", other),
        }
    }

    #[test]
    fn test_pow_rules() {
        let nodes = vec![arg(0), constant(1.0), constant(0.0)];
        assert_eq!(*Node::binary(BinaryOp::Pow, 1, 0).optimize(&nodes), Node::ONE);
        assert_eq!(*Node::binary(BinaryOp::Pow, 0, 2).optimize(&nodes), Node::ONE);
    }

    #[test]
    fn test_conditional_with_constant_condition() {
        let nodes = vec![
            arg(0),
            arg(1),
            Some(Node::binary(BinaryOp::Mul, 0, 1)),
            constant(-1.0),
        ];

        let taken = Node::Conditional { x: 0, y: 2, cond: 3 };
        assert_eq!(*taken.optimize(&nodes), Node::Move { target: 2 });

        let nodes = vec![arg(0), arg(1), constant(5.0)];
        let taken = Node::Conditional { x: 0, y: 1, cond: 2 };
        assert_eq!(*taken.optimize(&nodes), Node::Argument { parameter: 0 });
    }

    #[test]
    fn test_collapse_conditional_with_guard() {
        let nodes = vec![arg(0), arg(1), arg(2)];
        let conditional = Node::Conditional { x: 0, y: 1, cond: 2 };

        assert_eq!(
            conditional.collapse_conditional(&nodes, true, true),
            Some(Node::Bailout {
                branch: 0,
                cond: 2,
                taken: true
            })
        );
        assert_eq!(
            conditional.collapse_conditional(&nodes, false, false),
            Some(Node::Argument { parameter: 1 })
        );
    }

    #[test]
    fn test_static_invalid_detection() {
        let nodes = vec![arg(0), constant(0.0), constant(-2.0)];

        assert!(Node::binary(BinaryOp::Div, 0, 1).is_static_invalid(&nodes));
        assert!(Node::binary(BinaryOp::Mod, 0, 1).is_static_invalid(&nodes));
        assert!(Node::binary(BinaryOp::Log, 0, 2).is_static_invalid(&nodes));
        assert!(Node::binary(BinaryOp::Pow, 2, 0).is_static_invalid(&nodes));
        assert!(!Node::binary(BinaryOp::Div, 1, 0).is_static_invalid(&nodes));
        assert!(!Node::binary(BinaryOp::Add, 0, 1).is_static_invalid(&nodes));
    }

    #[test]
    fn test_validate_rejects_forward_reference() {
        let nodes = vec![arg(0), Some(Node::binary(BinaryOp::Add, 0, 1))];
        assert!(matches!(
            validate(&nodes),
            Err(EvoError::ForwardReference { index: 1, operand: 1 })
        ));

        let nodes = vec![arg(0), None, Some(Node::Move { target: 1 })];
        assert!(matches!(
            validate(&nodes),
            Err(EvoError::AbsentOperand { index: 2, operand: 1 })
        ));
    }
}

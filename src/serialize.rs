//! JSON boundary for scalar programs and Turing trees.
//!
//! Scalar arrays are written as a list of internally tagged nodes with `null`
//! for empty slots. Turing trees go through `TuringRecord`, where each basic
//! block carries its array as an embedded scalar JSON document. Everything
//! read back is validated before it becomes a live program.

use serde::{Deserialize, Serialize};

use crate::ssa::node::{validate, Node};
use crate::turing::node::{ScalarBasicBlock, TuringNode};
use crate::EvoResult;

/// Non-finite floats as strings, everything else as a plain JSON number.
pub mod float_repr {
    use serde::de::Error;
    use serde::{Deserialize, Deserializer, Serializer};

    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Repr {
        Number(f64),
        Text(String),
    }

    pub fn serialize<S>(value: &f64, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        if value.is_nan() {
            serializer.serialize_str("NaN")
        } else if *value == f64::INFINITY {
            serializer.serialize_str("inf")
        } else if *value == f64::NEG_INFINITY {
            serializer.serialize_str("-inf")
        } else {
            serializer.serialize_f64(*value)
        }
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<f64, D::Error>
    where
        D: Deserializer<'de>,
    {
        match Repr::deserialize(deserializer)? {
            Repr::Number(value) => Ok(value),
            Repr::Text(text) => match text.as_str() {
                "NaN" => Ok(f64::NAN),
                "inf" => Ok(f64::INFINITY),
                "-inf" => Ok(f64::NEG_INFINITY),
                other => Err(D::Error::custom(format!("invalid float '{}'", other))),
            },
        }
    }
}

/// Serializable stand-in for `TuringNode`.
#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "kind")]
enum TuringRecord {
    NoOp,
    Block { children: Vec<TuringRecord> },
    WhileLoop { condition: u16, body: Box<TuringRecord> },
    MemoryRead { target: u16 },
    MemoryWrite { address: u16, value: u16 },
    BasicBlock { nodes: String },
}

impl TuringRecord {
    fn from_tree(node: &TuringNode) -> EvoResult<Self> {
        let record = match node {
            TuringNode::NoOp => TuringRecord::NoOp,
            TuringNode::Block(children) => TuringRecord::Block {
                children: children.iter().map(TuringRecord::from_tree).collect::<EvoResult<_>>()?,
            },
            TuringNode::WhileLoop { condition, body } => TuringRecord::WhileLoop {
                condition: *condition,
                body: Box::new(TuringRecord::from_tree(body)?),
            },
            TuringNode::MemoryRead { target } => TuringRecord::MemoryRead { target: *target },
            TuringNode::MemoryWrite { address, value } => TuringRecord::MemoryWrite {
                address: *address,
                value: *value,
            },
            TuringNode::BasicBlock(block) => TuringRecord::BasicBlock {
                nodes: nodes_to_json(&block.nodes)?,
            },
        };

        Ok(record)
    }

    fn into_tree(self) -> EvoResult<TuringNode> {
        let node = match self {
            TuringRecord::NoOp => TuringNode::NoOp,
            TuringRecord::Block { children } => TuringNode::Block(
                children
                    .into_iter()
                    .map(TuringRecord::into_tree)
                    .collect::<EvoResult<_>>()?,
            ),
            TuringRecord::WhileLoop { condition, body } => TuringNode::WhileLoop {
                condition,
                body: Box::new(body.into_tree()?),
            },
            TuringRecord::MemoryRead { target } => TuringNode::MemoryRead { target },
            TuringRecord::MemoryWrite { address, value } => TuringNode::MemoryWrite { address, value },
            TuringRecord::BasicBlock { nodes } => TuringNode::BasicBlock(ScalarBasicBlock::new(nodes_from_json(&nodes)?)),
        };

        Ok(node)
    }
}

pub fn nodes_to_json(nodes: &[Option<Node>]) -> EvoResult<String> {
    Ok(serde_json::to_string(nodes)?)
}

/// Parse a scalar array and check its operand ordering.
pub fn nodes_from_json(text: &str) -> EvoResult<Vec<Option<Node>>> {
    let nodes: Vec<Option<Node>> = serde_json::from_str(text)?;
    validate(&nodes)?;
    Ok(nodes)
}

/// Serialize a Turing tree. Specialized copies of basic blocks are left out.
pub fn tree_to_json(tree: &TuringNode) -> EvoResult<String> {
    let record = TuringRecord::from_tree(tree)?;
    Ok(serde_json::to_string_pretty(&record)?)
}

pub fn tree_from_json(text: &str) -> EvoResult<TuringNode> {
    let record: TuringRecord = serde_json::from_str(text)?;
    record.into_tree()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::EvoError;
    use crate::ssa::node::BinaryOp;

    #[test]
    fn test_node_format() {
        let nodes = vec![
            Some(Node::Argument { parameter: 0 }),
            None,
            Some(Node::binary(BinaryOp::Mul, 0, 0)),
        ];

        let text = nodes_to_json(&nodes).unwrap();
        assert_eq!(
            text,
            r#"[{"kind":"Argument","parameter":0},null,{"kind":"Binary","op":"Mul","lhs":0,"rhs":0}]"#
        );
        assert_eq!(nodes_from_json(&text).unwrap(), nodes);
    }

    #[test]
    fn test_non_finite_constants() {
        let nodes = vec![
            Some(Node::constant(f64::INFINITY)),
            Some(Node::constant(f64::NEG_INFINITY)),
            Some(Node::NAN),
            Some(Node::constant(0.25)),
        ];

        let text = nodes_to_json(&nodes).unwrap();
        assert!(text.contains(r#""value":"inf""#));
        assert!(text.contains(r#""value":"NaN""#));

        let read = nodes_from_json(&text).unwrap();
        assert_eq!(read[0], Some(Node::constant(f64::INFINITY)));
        assert_eq!(read[1], Some(Node::constant(f64::NEG_INFINITY)));
        assert!(matches!(read[2], Some(Node::Constant { value }) if value.is_nan()));
        assert_eq!(read[3], Some(Node::constant(0.25)));
    }

    #[test]
    fn test_reading_rejects_forward_references() {
        let text = r#"[{"kind":"Move","target":1},{"kind":"Argument","parameter":0}]"#;
        assert!(matches!(
            nodes_from_json(text),
            Err(EvoError::ForwardReference { index: 0, operand: 1 })
        ));

        assert!(matches!(nodes_from_json("[{\"kind\":\"Jump\"}]"), Err(EvoError::Serialization { .. })));
    }

    #[test]
    fn test_tree_round_trip_drops_specialized() {
        let nodes = vec![
            Some(Node::Argument { parameter: 0 }),
            Some(Node::Argument { parameter: 1 }),
            Some(Node::binary(BinaryOp::Add, 0, 1)),
            Some(Node::Move { target: 0 }),
        ];
        let mut block = ScalarBasicBlock::new(nodes.clone());
        block.specialized = Some(nodes.clone());

        let tree = TuringNode::Block(vec![
            TuringNode::MemoryWrite { address: 0, value: 1 },
            TuringNode::WhileLoop {
                condition: 1,
                body: Box::new(TuringNode::Block(vec![TuringNode::BasicBlock(block)])),
            },
            TuringNode::MemoryRead { target: 0 },
        ]);

        let read = tree_from_json(&tree_to_json(&tree).unwrap()).unwrap();

        let mut expected = tree.clone();
        expected.clear_specialized();
        assert_eq!(read, expected);
    }

    #[test]
    fn test_tree_reading_validates_blocks() {
        let text = r#"{"kind":"Block","children":[{"kind":"BasicBlock","nodes":"[{\"kind\":\"Move\",\"target\":0}]"}]}"#;
        assert!(matches!(
            tree_from_json(text),
            Err(EvoError::ForwardReference { index: 0, operand: 0 })
        ));
    }
}

//! Scalar IR: straight-line dataflow programs over `f64`.
//!
//! - `node`: the node sum type and per-node simplification
//! - `optimize`: whole-array optimization to a fixed point, branch pruning
//! - `compiler`: lowering into executable closures
//! - `generator`: random generation and mutation

pub mod compiler;
pub mod generator;
pub mod node;
pub mod optimize;

pub use compiler::{compile, compile_tiered, CompiledProgram, Tiered};
pub use node::{validate, BinaryOp, Node};
pub use optimize::{optimize_all, prune_unreached};

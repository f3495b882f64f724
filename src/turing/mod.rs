//! Turing-complete extension: a control tree of blocks, loops and memory
//! operations whose leaves embed scalar basic blocks.

pub mod compiler;
pub mod memory;
pub mod node;
pub mod profile;
pub mod transform;

pub use compiler::{compile, MachineConfig, TuringProgram};
pub use memory::{PagePool, VirtualMemoryManager, PAGE_POOL, PAGE_SIZE};
pub use node::{ScalarBasicBlock, TuringNode};
pub use profile::{commit_branches, speculate_branches, strip_dead_loops, TuringProfile};
pub use transform::{MutationOdds, RandomTransformer};

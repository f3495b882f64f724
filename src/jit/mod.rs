//! Speculation infrastructure shared by the scalar and Turing layers.
//!
//! Compiled code moves through three tiers:
//! - Baseline: unspecialized, always correct
//! - Profiling: baseline plus branch instrumentation
//! - Specialized: cold branches collapsed behind guards, falling back to the
//!   baseline whenever a guard fails

pub mod profiler;

pub use profiler::{
    BranchCounter, BranchCounts, BranchId, BranchLivenessProfiler, BranchObserver, BranchSets,
    BranchStats,
};

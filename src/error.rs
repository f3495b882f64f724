use git_version::git_version;
use thiserror::Error;

/// Fatal errors raised while building, validating or compiling a program.
/// These abort construction and are never retried.
#[derive(Error, Debug)]
pub enum EvoError {
    #[error("Unknown error '{message}'. Please report this bug with the following information: Evojit Version = '{}', Git Revision = '{}'", env!("CARGO_PKG_VERSION"), git_version!(fallback = "unknown"))]
    UnknownError { message: String },

    #[error("Programs must take at least one argument")]
    NoArguments,

    #[error("Complexity {complexity} must exceed the argument count {arguments}")]
    ComplexityTooLow { complexity: usize, arguments: usize },

    #[error("Node {index} reads operand {operand}, which is not strictly before it")]
    ForwardReference { index: usize, operand: usize },

    #[error("Node {index} reads operand {operand}, which has been removed")]
    AbsentOperand { index: usize, operand: usize },

    #[error("Output slot {index} is empty")]
    AbsentOutput { index: usize },

    #[error("The leading node of a program must be directly compilable")]
    NonCompilableLeadingNode,

    #[error("Variable {variable} is out of range for a program with {count} variable(s)")]
    VariableOutOfRange { variable: usize, count: usize },

    #[error("Invalid configuration: {message}")]
    InvalidConfig { message: String },

    #[error("Worker task failed: {message}")]
    Worker { message: String },

    #[error("Serialization error")]
    Serialization {
        #[from]
        source: serde_json::Error,
    },

    #[error("IO error occurred while reading/writing")]
    IOError {
        #[from]
        source: std::io::Error,
    },
}

/// Runtime signals raised by compiled code. These are control flow, not
/// failures: callers catch them and deoptimize, repair or terminate the
/// current execution.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum Signal {
    /// A checked arithmetic node received an operand it could not prove
    /// invalid ahead of time.
    #[error("Dynamic invalid operation at node {0}")]
    InvalidOperation(u16),

    /// A speculative guard failed.
    #[error("Optimized code bailed out")]
    Bailout,

    #[error("Loop budget exceeded")]
    LoopBudgetExceeded,

    #[error("Virtual memory page budget exhausted")]
    MemoryExhausted,

    #[error("Virtual memory address out of range")]
    AddressOutOfRange,
}

impl Signal {
    /// Signals that end the current execution outright instead of falling
    /// back to an unspecialized path.
    pub fn is_termination(&self) -> bool {
        matches!(
            self,
            Signal::LoopBudgetExceeded | Signal::MemoryExhausted | Signal::AddressOutOfRange
        )
    }
}

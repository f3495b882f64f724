pub mod error;
pub mod jit;
pub mod serialize;
pub mod ssa;
pub mod trainer;
pub mod turing;
pub mod worker;

pub use error::{EvoError, Signal};

pub type EvoResult<T> = Result<T, error::EvoError>;

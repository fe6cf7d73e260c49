//! Capital allocation across strategies, brokers and assets.

pub mod allocator;
mod engine;
mod error;
pub mod portfolio;

pub use engine::{AllocationConfig, CapitalAllocationEngine};
pub use error::{AllocationError, Result};

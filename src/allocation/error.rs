//! Error types for capital allocation.

use thiserror::Error;

use crate::models::TargetId;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum AllocationError {
    #[error("No active allocation targets")]
    NoActiveTargets,

    #[error("Unknown allocation target: {0}")]
    UnknownTarget(TargetId),

    #[error("Invalid allocation bounds for {id}: min {min}, max {max}")]
    InvalidBounds { id: TargetId, min: f64, max: f64 },
}

pub type Result<T> = std::result::Result<T, AllocationError>;

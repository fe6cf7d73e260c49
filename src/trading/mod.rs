//! Entry sizing.

mod config;
mod position_sizer;

pub use config::SizingConfig;
pub use position_sizer::{PositionSizer, SizingMethod};

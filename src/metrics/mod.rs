//! Performance statistics over return series.

mod calculator;

pub use calculator::{MetricsCalculator, DEFAULT_PERIODS_PER_YEAR};

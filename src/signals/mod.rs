//! Entry signal generation: indicators, regime detection and scoring.

pub mod indicators;
pub mod regime;
mod scorer;

pub use indicators::IndicatorSet;
pub use regime::{AdxRegimeDetector, MarketRegime, RegimeDetector, RsiBounds, RsiRanges};
pub use scorer::{Conditions, ScoreResult, ScorerConfig, SignalScorer, MAX_SCORE};

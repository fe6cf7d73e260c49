//! Market regime detection and the RSI bounds each regime implies.

use serde::{Deserialize, Serialize};

use super::indicators::{last_two, IndicatorSet};

/// Coarse market regime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MarketRegime {
    Trending,
    Ranging,
    Transitional,
}

/// Inclusive RSI window for an entry side.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RsiBounds {
    pub min: f64,
    pub max: f64,
}

impl RsiBounds {
    pub const fn new(min: f64, max: f64) -> Self {
        Self { min, max }
    }

    pub fn contains(&self, rsi: f64) -> bool {
        rsi >= self.min && rsi <= self.max
    }
}

/// RSI windows for long and short entries.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RsiRanges {
    pub long: RsiBounds,
    pub short: RsiBounds,
}

impl Default for RsiRanges {
    fn default() -> Self {
        Self {
            long: RsiBounds::new(30.0, 70.0),
            short: RsiBounds::new(30.0, 70.0),
        }
    }
}

/// Classifies the market and supplies regime-specific RSI ranges.
pub trait RegimeDetector: Send + Sync {
    /// Detect the current regime, or `None` if the indicators are not warm.
    fn detect(&self, indicators: &IndicatorSet) -> Option<MarketRegime>;

    /// RSI ranges to use in `regime`.
    fn rsi_ranges(&self, regime: MarketRegime) -> RsiRanges;
}

/// ADX-threshold regime detector.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdxRegimeDetector {
    /// ADX at or above this is trending
    pub trending_threshold: f64,
    /// ADX at or below this is ranging
    pub ranging_threshold: f64,
    pub trending: RsiRanges,
    pub ranging: RsiRanges,
    pub transitional: RsiRanges,
}

impl Default for AdxRegimeDetector {
    fn default() -> Self {
        Self {
            trending_threshold: 25.0,
            ranging_threshold: 20.0,
            // Pullbacks in trends rarely reach deep oversold
            trending: RsiRanges {
                long: RsiBounds::new(40.0, 75.0),
                short: RsiBounds::new(25.0, 60.0),
            },
            ranging: RsiRanges {
                long: RsiBounds::new(25.0, 55.0),
                short: RsiBounds::new(45.0, 75.0),
            },
            transitional: RsiRanges::default(),
        }
    }
}

impl RegimeDetector for AdxRegimeDetector {
    fn detect(&self, indicators: &IndicatorSet) -> Option<MarketRegime> {
        let adx = indicators
            .adx
            .last()
            .copied()
            .filter(|v| v.is_finite())?;

        let regime = if adx >= self.trending_threshold {
            MarketRegime::Trending
        } else if adx <= self.ranging_threshold {
            MarketRegime::Ranging
        } else {
            MarketRegime::Transitional
        };
        Some(regime)
    }

    fn rsi_ranges(&self, regime: MarketRegime) -> RsiRanges {
        match regime {
            MarketRegime::Trending => self.trending,
            MarketRegime::Ranging => self.ranging,
            MarketRegime::Transitional => self.transitional,
        }
    }
}

/// Whether ADX is rising, used only for reason strings.
pub fn adx_rising(indicators: &IndicatorSet) -> bool {
    last_two(&indicators.adx).is_some_and(|(cur, prev)| cur > prev)
}

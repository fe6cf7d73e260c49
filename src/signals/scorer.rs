//! Entry signal scoring.
//!
//! Five independent conditions are evaluated on the last two candles and
//! the indicator series:
//! - Pullback: close near EMA21 or VWAP
//! - RSI: inside the active range and moving in the trade direction
//! - Candlestick: engulfing or hammer / shooting star
//! - MACD: histogram ticking in the trade direction
//! - Volume: not collapsing versus the previous candle
//!
//! An entry is allowed once enough of them agree.

use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::indicators::{last_two, IndicatorSet};
use super::regime::{AdxRegimeDetector, MarketRegime, RegimeDetector, RsiBounds, RsiRanges};
use crate::models::{Candle, OrderSide};

/// Total number of scored conditions.
pub const MAX_SCORE: u8 = 5;

/// Signal scorer configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ScorerConfig {
    /// Conditions that must hold for an entry (out of 5)
    pub min_signal_score: u8,

    /// Max relative distance of close from EMA21 / VWAP
    pub pullback_tolerance: f64,

    /// Last volume must be at least this multiple of the previous volume
    pub min_volume_ratio: f64,

    /// RSI ranges used when no regime detector is attached
    pub rsi: RsiRanges,

    /// Attach the ADX regime detector
    pub regime_adaptive: bool,
}

impl Default for ScorerConfig {
    fn default() -> Self {
        Self {
            min_signal_score: 3,
            pullback_tolerance: 0.005, // 0.5%
            min_volume_ratio: 0.5,
            rsi: RsiRanges::default(),
            regime_adaptive: false,
        }
    }
}

/// Outcome of scoring one candle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoreResult {
    pub allowed: bool,
    pub score: u8,
    pub reason: String,
}

/// Individual condition outcomes, in scoring order.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Conditions {
    pub pullback: bool,
    pub rsi: bool,
    pub candlestick: bool,
    pub macd: bool,
    pub volume: bool,
}

impl Conditions {
    pub fn score(&self) -> u8 {
        [self.pullback, self.rsi, self.candlestick, self.macd, self.volume]
            .iter()
            .filter(|c| **c)
            .count() as u8
    }

    fn labels(&self) -> Vec<&'static str> {
        let mut labels = Vec::new();
        if self.pullback {
            labels.push("pullback");
        }
        if self.rsi {
            labels.push("rsi");
        }
        if self.candlestick {
            labels.push("candlestick");
        }
        if self.macd {
            labels.push("macd");
        }
        if self.volume {
            labels.push("volume");
        }
        labels
    }
}

/// Threshold scorer for entry signals.
pub struct SignalScorer {
    config: ScorerConfig,
    regime: Option<Box<dyn RegimeDetector>>,
}

impl SignalScorer {
    /// Create a scorer with fixed RSI ranges.
    pub fn new(config: ScorerConfig) -> Self {
        Self {
            config,
            regime: None,
        }
    }

    /// Create a scorer, attaching the ADX detector if `regime_adaptive` is set.
    pub fn from_config(config: ScorerConfig) -> Self {
        let adaptive = config.regime_adaptive;
        let scorer = Self::new(config);
        if adaptive {
            scorer.with_regime_detector(Box::new(AdxRegimeDetector::default()))
        } else {
            scorer
        }
    }

    /// Attach a regime detector for adaptive RSI ranges.
    pub fn with_regime_detector(mut self, detector: Box<dyn RegimeDetector>) -> Self {
        self.regime = Some(detector);
        self
    }

    pub fn config(&self) -> &ScorerConfig {
        &self.config
    }

    /// Score an entry on `side` using the last two candles.
    pub fn score(
        &self,
        side: OrderSide,
        prev: &Candle,
        last: &Candle,
        indicators: &IndicatorSet,
    ) -> ScoreResult {
        let regime = self.regime.as_ref().and_then(|d| d.detect(indicators));
        let bounds = self.rsi_bounds(side, regime);

        let conditions = Conditions {
            pullback: self.pullback(last, indicators),
            rsi: rsi_ok(side, indicators, bounds),
            candlestick: candlestick_ok(side, prev, last),
            macd: macd_ok(side, indicators),
            volume: self.volume_ok(prev, last),
        };

        let score = conditions.score();
        let allowed = score >= self.config.min_signal_score;

        let labels = conditions.labels();
        let mut reason = format!(
            "{} score {}/{} (min {}): {}",
            side,
            score,
            MAX_SCORE,
            self.config.min_signal_score,
            if labels.is_empty() { "none".to_string() } else { labels.join(", ") }
        );
        if let Some(regime) = regime {
            reason.push_str(&format!(" [regime {:?}]", regime));
        }

        debug!(
            side = %side,
            score,
            allowed,
            pullback = conditions.pullback,
            rsi = conditions.rsi,
            candlestick = conditions.candlestick,
            macd = conditions.macd,
            volume = conditions.volume,
            "Scored entry signal"
        );

        ScoreResult { allowed, score, reason }
    }

    fn rsi_bounds(&self, side: OrderSide, regime: Option<MarketRegime>) -> RsiBounds {
        let ranges = match (&self.regime, regime) {
            (Some(detector), Some(regime)) => detector.rsi_ranges(regime),
            _ => self.config.rsi,
        };
        match side {
            OrderSide::Buy => ranges.long,
            OrderSide::Sell => ranges.short,
        }
    }

    fn pullback(&self, last: &Candle, indicators: &IndicatorSet) -> bool {
        let close = last.close_f64();
        let near = |series: &[f64]| {
            series
                .last()
                .filter(|level| level.is_finite() && **level > 0.0)
                .is_some_and(|level| ((close - level) / level).abs() <= self.config.pullback_tolerance)
        };
        near(&indicators.ema21) || near(&indicators.vwap)
    }

    fn volume_ok(&self, prev: &Candle, last: &Candle) -> bool {
        let prev_vol = prev.volume_f64();
        if prev_vol <= 0.0 {
            return last.volume_f64() > 0.0;
        }
        last.volume_f64() >= self.config.min_volume_ratio * prev_vol
    }
}

fn rsi_ok(side: OrderSide, indicators: &IndicatorSet, bounds: RsiBounds) -> bool {
    let Some((cur, prev)) = last_two(&indicators.rsi) else {
        return false;
    };
    if !bounds.contains(cur) {
        return false;
    }
    match side {
        OrderSide::Buy => cur > prev,
        OrderSide::Sell => cur < prev,
    }
}

fn macd_ok(side: OrderSide, indicators: &IndicatorSet) -> bool {
    match last_two(&indicators.macd_histogram) {
        Some((cur, prev)) => match side {
            OrderSide::Buy => cur > prev,
            OrderSide::Sell => cur < prev,
        },
        None => false,
    }
}

fn candlestick_ok(side: OrderSide, prev: &Candle, last: &Candle) -> bool {
    match side {
        OrderSide::Buy => bullish_engulfing(prev, last) || hammer(last),
        OrderSide::Sell => bearish_engulfing(prev, last) || shooting_star(last),
    }
}

fn bullish_engulfing(prev: &Candle, last: &Candle) -> bool {
    prev.is_bearish()
        && last.is_bullish()
        && last.open <= prev.close
        && last.close >= prev.open
}

fn bearish_engulfing(prev: &Candle, last: &Candle) -> bool {
    prev.is_bullish()
        && last.is_bearish()
        && last.open >= prev.close
        && last.close <= prev.open
}

/// Long lower wick (at least twice the body), small upper wick.
fn hammer(c: &Candle) -> bool {
    let range = c.range();
    if range.is_zero() {
        return false;
    }
    let body = c.body();
    c.lower_wick() >= body * Decimal::TWO
        && c.upper_wick() <= body.max(range / Decimal::TEN)
        && wick_share(c.lower_wick(), range) >= 0.5
}

fn shooting_star(c: &Candle) -> bool {
    let range = c.range();
    if range.is_zero() {
        return false;
    }
    let body = c.body();
    c.upper_wick() >= body * Decimal::TWO
        && c.lower_wick() <= body.max(range / Decimal::TEN)
        && wick_share(c.upper_wick(), range) >= 0.5
}

fn wick_share(wick: Decimal, range: Decimal) -> f64 {
    (wick / range).to_f64().unwrap_or(0.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::signals::regime::AdxRegimeDetector;
    use chrono::Utc;
    use rust_decimal::Decimal;
    use rust_decimal_macros::dec;

    fn candle(open: Decimal, high: Decimal, low: Decimal, close: Decimal, volume: Decimal) -> Candle {
        Candle::new(Utc::now(), open, high, low, close, volume)
    }

    /// Bearish candle followed by a bullish engulfing one closing at 100.
    fn engulfing_pair() -> (Candle, Candle) {
        (
            candle(dec!(100), dec!(100.5), dec!(98.5), dec!(99), dec!(10)),
            candle(dec!(98.8), dec!(100.2), dec!(98.6), dec!(100), dec!(12)),
        )
    }

    fn bullish_indicators() -> IndicatorSet {
        IndicatorSet {
            rsi: vec![42.0, 48.0],
            macd_histogram: vec![-0.4, -0.1],
            ema21: vec![99.9, 100.1],
            vwap: vec![101.5, 101.6],
            adx: vec![18.0, 19.0],
        }
    }

    #[test]
    fn test_all_conditions_long() {
        let scorer = SignalScorer::new(ScorerConfig::default());
        let (prev, last) = engulfing_pair();

        let result = scorer.score(OrderSide::Buy, &prev, &last, &bullish_indicators());

        assert_eq!(result.score, 5);
        assert!(result.allowed);
        assert!(result.reason.contains("pullback"));
    }

    #[test]
    fn test_allowed_matches_threshold() {
        let (prev, last) = engulfing_pair();

        // Break RSI direction and MACD tick: 3 of 5 remain
        let mut indicators = bullish_indicators();
        indicators.rsi = vec![50.0, 45.0];
        indicators.macd_histogram = vec![0.2, 0.1];

        for min in 0..=MAX_SCORE {
            let scorer = SignalScorer::new(ScorerConfig {
                min_signal_score: min,
                ..Default::default()
            });
            let result = scorer.score(OrderSide::Buy, &prev, &last, &indicators);
            assert_eq!(result.score, 3);
            assert_eq!(result.allowed, result.score >= min);
        }
    }

    #[test]
    fn test_missing_indicators_score_false() {
        let scorer = SignalScorer::new(ScorerConfig::default());
        let (prev, last) = engulfing_pair();

        let result = scorer.score(OrderSide::Buy, &prev, &last, &IndicatorSet::default());

        // Only candlestick and volume can hold without indicators
        assert_eq!(result.score, 2);
        assert!(!result.allowed);
    }

    #[test]
    fn test_short_side_mirrors() {
        let scorer = SignalScorer::new(ScorerConfig::default());
        let prev = candle(dec!(99), dec!(100.8), dec!(98.9), dec!(100.5), dec!(10));
        let last = candle(dec!(100.6), dec!(100.7), dec!(98.7), dec!(98.8), dec!(4));
        let indicators = IndicatorSet {
            rsi: vec![60.0, 55.0],
            macd_histogram: vec![0.3, 0.1],
            ema21: vec![98.9],
            ..Default::default()
        };

        let result = scorer.score(OrderSide::Sell, &prev, &last, &indicators);

        // Volume fell below half of the previous bar
        assert_eq!(result.score, 4);
        assert!(result.allowed);
        assert!(!result.reason.contains("volume"));
    }

    #[test]
    fn test_hammer_and_shooting_star() {
        let hammer_candle = candle(dec!(100), dec!(100.6), dec!(97), dec!(100.5), dec!(1));
        assert!(hammer(&hammer_candle));
        assert!(!shooting_star(&hammer_candle));

        let star = candle(dec!(100.5), dec!(103.5), dec!(99.9), dec!(100), dec!(1));
        assert!(shooting_star(&star));
        assert!(!hammer(&star));

        let doji = candle(dec!(100), dec!(100), dec!(100), dec!(100), dec!(1));
        assert!(!hammer(&doji));
    }

    #[test]
    fn test_regime_adaptive_bounds() {
        let (prev, last) = engulfing_pair();
        let mut indicators = bullish_indicators();
        // RSI 35 is inside the fixed long range but below the trending floor
        indicators.rsi = vec![30.0, 35.0];
        indicators.adx = vec![29.0, 30.0];

        let fixed = SignalScorer::new(ScorerConfig::default());
        let adaptive = SignalScorer::new(ScorerConfig::default())
            .with_regime_detector(Box::new(AdxRegimeDetector::default()));

        let fixed_result = fixed.score(OrderSide::Buy, &prev, &last, &indicators);
        let adaptive_result = adaptive.score(OrderSide::Buy, &prev, &last, &indicators);

        assert_eq!(fixed_result.score, adaptive_result.score + 1);
        assert!(adaptive_result.reason.contains("Trending"));
    }
}

//! OHLCV candle model.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use rust_decimal::prelude::ToPrimitive;
use serde::{Deserialize, Serialize};

/// A single OHLCV bar.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Candle {
    /// Bar open time
    pub timestamp: DateTime<Utc>,
    pub open: Decimal,
    pub high: Decimal,
    pub low: Decimal,
    pub close: Decimal,
    #[serde(default)]
    pub volume: Decimal,
}

impl Candle {
    pub fn new(
        timestamp: DateTime<Utc>,
        open: Decimal,
        high: Decimal,
        low: Decimal,
        close: Decimal,
        volume: Decimal,
    ) -> Self {
        Self {
            timestamp,
            open,
            high,
            low,
            close,
            volume,
        }
    }

    /// Absolute size of the candle body.
    pub fn body(&self) -> Decimal {
        (self.close - self.open).abs()
    }

    /// Full high-low range.
    pub fn range(&self) -> Decimal {
        self.high - self.low
    }

    /// Wick below the body.
    pub fn lower_wick(&self) -> Decimal {
        self.open.min(self.close) - self.low
    }

    /// Wick above the body.
    pub fn upper_wick(&self) -> Decimal {
        self.high - self.open.max(self.close)
    }

    pub fn is_bullish(&self) -> bool {
        self.close > self.open
    }

    pub fn is_bearish(&self) -> bool {
        self.close < self.open
    }

    /// Typical price (H + L + C) / 3, used for VWAP.
    pub fn typical_price(&self) -> f64 {
        ((self.high + self.low + self.close) / Decimal::from(3))
            .to_f64()
            .unwrap_or(0.0)
    }

    pub fn close_f64(&self) -> f64 {
        self.close.to_f64().unwrap_or(0.0)
    }

    pub fn high_f64(&self) -> f64 {
        self.high.to_f64().unwrap_or(0.0)
    }

    pub fn low_f64(&self) -> f64 {
        self.low.to_f64().unwrap_or(0.0)
    }

    pub fn volume_f64(&self) -> f64 {
        self.volume.to_f64().unwrap_or(0.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_candle_anatomy() {
        let candle = Candle::new(Utc::now(), dec!(100), dec!(106), dec!(95), dec!(104), dec!(10));

        assert!(candle.is_bullish());
        assert_eq!(candle.body(), dec!(4));
        assert_eq!(candle.range(), dec!(11));
        assert_eq!(candle.lower_wick(), dec!(5));
        assert_eq!(candle.upper_wick(), dec!(2));
        assert!((candle.typical_price() - 101.666).abs() < 0.01);
    }
}

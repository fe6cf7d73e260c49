//! Technical indicators computed over candle series.
//!
//! Each function returns only warmed-up values, oldest first, so the last
//! element always lines up with the last candle.

use serde::{Deserialize, Serialize};

use crate::models::Candle;

/// Pre-computed indicator series consumed by the signal scorer.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct IndicatorSet {
    #[serde(default)]
    pub rsi: Vec<f64>,
    #[serde(default)]
    pub macd_histogram: Vec<f64>,
    #[serde(default)]
    pub ema21: Vec<f64>,
    #[serde(default)]
    pub vwap: Vec<f64>,
    #[serde(default)]
    pub adx: Vec<f64>,
}

impl IndicatorSet {
    /// Compute the default indicator set from a candle series.
    pub fn from_candles(candles: &[Candle]) -> Self {
        let closes: Vec<f64> = candles.iter().map(Candle::close_f64).collect();

        Self {
            rsi: rsi(&closes, 14),
            macd_histogram: macd_histogram(&closes, 12, 26, 9),
            ema21: ema(&closes, 21),
            vwap: vwap(candles),
            adx: adx(candles, 14),
        }
    }
}

/// Latest and previous values of a series.
pub fn last_two(series: &[f64]) -> Option<(f64, f64)> {
    match series {
        [.., prev, last] => Some((*last, *prev)),
        _ => None,
    }
}

/// Exponential moving average seeded with the SMA of the first `period` values.
pub fn ema(values: &[f64], period: usize) -> Vec<f64> {
    if period == 0 || values.len() < period {
        return Vec::new();
    }

    let k = 2.0 / (period as f64 + 1.0);
    let seed = values[..period].iter().sum::<f64>() / period as f64;

    let mut out = Vec::with_capacity(values.len() - period + 1);
    out.push(seed);

    let mut prev = seed;
    for v in &values[period..] {
        prev = (v - prev) * k + prev;
        out.push(prev);
    }
    out
}

/// Relative strength index with Wilder smoothing.
pub fn rsi(closes: &[f64], period: usize) -> Vec<f64> {
    if period == 0 || closes.len() <= period {
        return Vec::new();
    }

    let changes: Vec<f64> = closes.windows(2).map(|w| w[1] - w[0]).collect();

    let mut avg_gain = changes[..period].iter().map(|c| c.max(0.0)).sum::<f64>() / period as f64;
    let mut avg_loss = changes[..period].iter().map(|c| (-c).max(0.0)).sum::<f64>() / period as f64;

    let to_rsi = |gain: f64, loss: f64| {
        if loss == 0.0 {
            if gain == 0.0 { 50.0 } else { 100.0 }
        } else {
            100.0 - 100.0 / (1.0 + gain / loss)
        }
    };

    let mut out = Vec::with_capacity(changes.len() - period + 1);
    out.push(to_rsi(avg_gain, avg_loss));

    let n = period as f64;
    for c in &changes[period..] {
        avg_gain = (avg_gain * (n - 1.0) + c.max(0.0)) / n;
        avg_loss = (avg_loss * (n - 1.0) + (-c).max(0.0)) / n;
        out.push(to_rsi(avg_gain, avg_loss));
    }
    out
}

/// MACD histogram: (EMA fast - EMA slow) minus its signal EMA.
pub fn macd_histogram(closes: &[f64], fast: usize, slow: usize, signal: usize) -> Vec<f64> {
    if fast >= slow {
        return Vec::new();
    }

    let fast_ema = ema(closes, fast);
    let slow_ema = ema(closes, slow);
    if slow_ema.is_empty() {
        return Vec::new();
    }

    // Align fast EMA to the slow one (both end on the last close)
    let offset = fast_ema.len() - slow_ema.len();
    let macd_line: Vec<f64> = slow_ema
        .iter()
        .zip(&fast_ema[offset..])
        .map(|(s, f)| f - s)
        .collect();

    let signal_line = ema(&macd_line, signal);
    if signal_line.is_empty() {
        return Vec::new();
    }

    let offset = macd_line.len() - signal_line.len();
    macd_line[offset..]
        .iter()
        .zip(&signal_line)
        .map(|(m, s)| m - s)
        .collect()
}

/// Cumulative volume-weighted average price over the whole series.
pub fn vwap(candles: &[Candle]) -> Vec<f64> {
    let mut cum_pv = 0.0;
    let mut cum_vol = 0.0;
    let mut out = Vec::with_capacity(candles.len());

    for c in candles {
        let vol = c.volume_f64();
        cum_pv += c.typical_price() * vol;
        cum_vol += vol;
        out.push(if cum_vol > 0.0 { cum_pv / cum_vol } else { c.typical_price() });
    }
    out
}

/// Average directional index with Wilder smoothing.
pub fn adx(candles: &[Candle], period: usize) -> Vec<f64> {
    if period == 0 || candles.len() < 2 * period + 1 {
        return Vec::new();
    }

    let mut trs = Vec::with_capacity(candles.len() - 1);
    let mut plus_dms = Vec::with_capacity(candles.len() - 1);
    let mut minus_dms = Vec::with_capacity(candles.len() - 1);

    for w in candles.windows(2) {
        let (prev, cur) = (&w[0], &w[1]);
        let (high, low, prev_close) = (cur.high_f64(), cur.low_f64(), prev.close_f64());

        let tr = (high - low)
            .max((high - prev_close).abs())
            .max((low - prev_close).abs());

        let up = high - prev.high_f64();
        let down = prev.low_f64() - low;

        trs.push(tr);
        plus_dms.push(if up > down && up > 0.0 { up } else { 0.0 });
        minus_dms.push(if down > up && down > 0.0 { down } else { 0.0 });
    }

    let n = period as f64;
    let mut tr_s: f64 = trs[..period].iter().sum();
    let mut plus_s: f64 = plus_dms[..period].iter().sum();
    let mut minus_s: f64 = minus_dms[..period].iter().sum();

    let dx = |plus: f64, minus: f64, tr: f64| {
        if tr <= 0.0 {
            return 0.0;
        }
        let pdi = 100.0 * plus / tr;
        let mdi = 100.0 * minus / tr;
        if pdi + mdi == 0.0 {
            0.0
        } else {
            100.0 * (pdi - mdi).abs() / (pdi + mdi)
        }
    };

    let mut dxs = vec![dx(plus_s, minus_s, tr_s)];
    for i in period..trs.len() {
        tr_s = tr_s - tr_s / n + trs[i];
        plus_s = plus_s - plus_s / n + plus_dms[i];
        minus_s = minus_s - minus_s / n + minus_dms[i];
        dxs.push(dx(plus_s, minus_s, tr_s));
    }

    if dxs.len() < period {
        return Vec::new();
    }

    let mut adx_val = dxs[..period].iter().sum::<f64>() / n;
    let mut out = vec![adx_val];
    for d in &dxs[period..] {
        adx_val = (adx_val * (n - 1.0) + d) / n;
        out.push(adx_val);
    }
    out
}

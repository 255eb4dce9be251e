// =============================================================================
// HTF Structure — ATR, k-symmetric swing pivots, structure breaks
// =============================================================================

use serde::{Deserialize, Serialize};

use crate::market_data::Candle;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HtfFrame {
    pub bar_start_ms: i64,
    pub close: f64,
    pub atr: Option<f64>,
    pub last_swing_high: Option<f64>,
    pub last_swing_low: Option<f64>,
    pub structure_break_up: bool,
    pub structure_break_dn: bool,
}

/// Average true range over the last `period` true-range samples. `None`
/// when fewer than `period + 1` candles are available (TR needs a prior
/// close).
fn average_true_range(candles: &[Candle], period: usize) -> Option<f64> {
    if candles.len() < period + 1 {
        return None;
    }
    let mut trs = Vec::with_capacity(candles.len() - 1);
    for i in 1..candles.len() {
        let prev_close = candles[i - 1].close;
        let tr = (candles[i].high - candles[i].low)
            .max((candles[i].high - prev_close).abs())
            .max((candles[i].low - prev_close).abs());
        trs.push(tr);
    }
    let tail = &trs[trs.len().saturating_sub(period)..];
    if tail.len() < period {
        return None;
    }
    Some(tail.iter().sum::<f64>() / period as f64)
}

/// Last k-symmetric swing high: the most recent candle whose high is
/// strictly greater than every high in the `k`-wide left window and not
/// less than every high in the `k`-wide right window.
fn last_swing_high(candles: &[Candle], k: usize) -> Option<f64> {
    if candles.len() < 2 * k + 1 {
        return None;
    }
    for i in (k..candles.len() - k).rev() {
        let left_max = candles[i - k..i].iter().map(|c| c.high).fold(f64::MIN, f64::max);
        let right_max = candles[i + 1..=i + k].iter().map(|c| c.high).fold(f64::MIN, f64::max);
        if candles[i].high > left_max && candles[i].high >= right_max {
            return Some(candles[i].high);
        }
    }
    None
}

/// Symmetric counterpart for swing lows.
fn last_swing_low(candles: &[Candle], k: usize) -> Option<f64> {
    if candles.len() < 2 * k + 1 {
        return None;
    }
    for i in (k..candles.len() - k).rev() {
        let left_min = candles[i - k..i].iter().map(|c| c.low).fold(f64::MAX, f64::min);
        let right_min = candles[i + 1..=i + k].iter().map(|c| c.low).fold(f64::MAX, f64::min);
        if candles[i].low < left_min && candles[i].low <= right_min {
            return Some(candles[i].low);
        }
    }
    None
}

/// Compute the HTF frame for the most recently closed candle in `candles`.
pub fn compute_htf(candles: &[Candle], atr_period: usize, swing_lookback: usize) -> Option<HtfFrame> {
    let last = candles.last()?;
    let atr = average_true_range(candles, atr_period);
    let swing_high = last_swing_high(candles, swing_lookback);
    let swing_low = last_swing_low(candles, swing_lookback);

    let structure_break_up = swing_high.map(|h| last.close > h).unwrap_or(false);
    let structure_break_dn = swing_low.map(|l| last.close < l).unwrap_or(false);

    Some(HtfFrame {
        bar_start_ms: last.open_time,
        close: last.close,
        atr,
        last_swing_high: swing_high,
        last_swing_low: swing_low,
        structure_break_up,
        structure_break_dn,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn candle(open_time: i64, high: f64, low: f64, close: f64) -> Candle {
        Candle {
            open_time,
            close_time: open_time + 1,
            open: close,
            high,
            low,
            close,
            volume: 0.0,
            quote_volume: 0.0,
            trades_count: 0,
            taker_buy_volume: 0.0,
            taker_buy_quote_volume: 0.0,
            is_closed: true,
        }
    }

    /// End-to-end structure-break scenario with hand-checked pivot levels.
    #[test]
    fn htf_structure_scenario() {
        let candles = vec![
            candle(1, 100.0, 97.0, 98.0),
            candle(2, 101.0, 95.0, 100.0),
            candle(3, 105.0, 99.0, 104.0),
            candle(4, 103.0, 98.0, 99.0),
            candle(5, 106.0, 100.0, 107.0),
        ];

        let frame = compute_htf(&candles, 3, 1).unwrap();

        assert_eq!(frame.last_swing_high, Some(105.0));
        assert_eq!(frame.last_swing_low, Some(98.0));
        assert!(frame.structure_break_up);
        assert!(!frame.structure_break_dn);
        assert!((frame.atr.unwrap() - (6.0 + 6.0 + 7.0) / 3.0).abs() < 1e-9);
    }

    #[test]
    fn insufficient_candles_yield_none_fields() {
        let candles = vec![candle(1, 100.0, 99.0, 99.5), candle(2, 101.0, 99.0, 100.5)];
        let frame = compute_htf(&candles, 14, 3).unwrap();
        assert!(frame.atr.is_none());
        assert!(frame.last_swing_high.is_none());
        assert!(frame.last_swing_low.is_none());
        assert!(!frame.structure_break_up);
        assert!(!frame.structure_break_dn);
    }
}

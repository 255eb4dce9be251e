// =============================================================================
// Liquidity Metrics — microprice, imbalance curve, slope, slippage, spread
// =============================================================================

use serde::{Deserialize, Serialize};

use crate::market_data::orderbook::OrderBook;

const IMBALANCE_DEPTHS: [usize; 5] = [1, 5, 10, 20, 50];

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LiquidityMetrics {
    pub microprice: Option<f64>,
    /// Orderbook imbalance at depths 1/5/10/20/50, in [-1.0, 1.0].
    pub imbalance: [Option<f64>; 5],
    pub slope_bid: Option<f64>,
    pub slope_ask: Option<f64>,
    pub convexity: Option<f64>,
    pub wall_score: Option<f64>,
    pub void_score: Option<f64>,
    pub expected_slippage_bps: Option<f64>,
    pub effective_spread_bps: Option<f64>,
}

fn imbalance_at(book: &OrderBook, depth: usize) -> Option<f64> {
    let (bids, asks) = book.depth_at(depth);
    if bids.is_empty() || asks.is_empty() {
        return None;
    }
    let bid_vol: f64 = bids.iter().map(|(l, _)| l.qty.from_fp()).sum();
    let ask_vol: f64 = asks.iter().map(|(l, _)| l.qty.from_fp()).sum();
    let total = bid_vol + ask_vol;
    if total < f64::EPSILON {
        return None;
    }
    Some((bid_vol - ask_vol) / total)
}

fn book_slope(levels: &[(crate::market_data::orderbook::PriceLevel, crate::fp::Fp)]) -> Option<f64> {
    if levels.len() < 2 {
        return None;
    }
    let first_price = levels[0].0.price.from_fp();
    let last_price = levels[levels.len() - 1].0.price.from_fp();
    let dp = (last_price - first_price).abs();
    if dp < f64::EPSILON {
        return None;
    }
    let cum_qty = levels.last().unwrap().1.from_fp();
    Some(cum_qty / dp)
}

/// Expected slippage (in bps of mid) to fill `notional` against one side.
fn expected_slippage_bps(
    levels: &[(crate::market_data::orderbook::PriceLevel, crate::fp::Fp)],
    mid: f64,
    notional: f64,
) -> Option<f64> {
    if mid < f64::EPSILON {
        return None;
    }
    let mut remaining = notional;
    let mut filled_notional = 0.0;
    let mut worst_price = mid;
    for (level, _) in levels {
        let price = level.price.from_fp();
        let qty = level.qty.from_fp();
        let level_notional = price * qty;
        let take = level_notional.min(remaining);
        filled_notional += take;
        worst_price = price;
        remaining -= take;
        if remaining <= f64::EPSILON {
            break;
        }
    }
    if filled_notional < f64::EPSILON {
        return None;
    }
    Some(((worst_price - mid).abs() / mid) * 10_000.0)
}

/// Compute all liquidity metrics for the current book state. `slippage_notional`
/// is a fixed reference notional (e.g. 10,000 quote units).
pub fn compute_liquidity(book: &OrderBook, slippage_notional: f64) -> LiquidityMetrics {
    let best_bid = book.best_bid();
    let best_ask = book.best_ask();

    let microprice = match (best_bid, best_ask) {
        (Some(b), Some(a)) => {
            let bq = b.qty.from_fp();
            let aq = a.qty.from_fp();
            let total = bq + aq;
            if total > f64::EPSILON {
                Some((b.price.from_fp() * aq + a.price.from_fp() * bq) / total)
            } else {
                None
            }
        }
        _ => None,
    };

    let mut imbalance = [None; 5];
    for (i, depth) in IMBALANCE_DEPTHS.iter().enumerate() {
        imbalance[i] = imbalance_at(book, *depth);
    }

    let (bids_50, asks_50) = book.depth_at(50);
    let slope_bid = book_slope(&bids_50);
    let slope_ask = book_slope(&asks_50);

    let convexity = match (slope_bid, slope_ask) {
        (Some(b), Some(a)) if a > f64::EPSILON => Some(b / a),
        _ => None,
    };

    let mid = book.mid_price().map(|p| p.from_fp());

    let wall_score = bids_50
        .iter()
        .chain(asks_50.iter())
        .map(|(l, _)| l.qty.from_fp())
        .fold(0.0_f64, f64::max)
        .into();
    let void_score = if bids_50.is_empty() && asks_50.is_empty() { Some(1.0) } else { None };

    let expected_slippage_bps = mid.and_then(|m| expected_slippage_bps(&asks_50, m, slippage_notional));

    let effective_spread_bps = match (best_bid, best_ask, mid) {
        (Some(b), Some(a), Some(m)) if m > f64::EPSILON => {
            Some(((a.price.from_fp() - b.price.from_fp()) / m) * 10_000.0)
        }
        _ => None,
    };

    LiquidityMetrics {
        microprice,
        imbalance,
        slope_bid,
        slope_ask,
        convexity,
        wall_score: Some(wall_score),
        void_score,
        expected_slippage_bps,
        effective_spread_bps,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fp::Fp;
    use crate::market_data::orderbook::PriceLevel;

    fn lvl(price: f64, qty: f64) -> PriceLevel {
        PriceLevel { price: Fp::to_fp(price).unwrap(), qty: Fp::to_fp(qty).unwrap() }
    }

    #[test]
    fn empty_book_yields_null_metrics() {
        let book = OrderBook::new("BTCUSDT");
        let m = compute_liquidity(&book, 10_000.0);
        assert!(m.microprice.is_none());
        assert!(m.imbalance.iter().all(|x| x.is_none()));
    }

    #[test]
    fn balanced_book_has_zero_imbalance() {
        let mut book = OrderBook::new("BTCUSDT");
        book.apply_snapshot(1, &[lvl(100.0, 10.0)], &[lvl(101.0, 10.0)], 0);
        let m = compute_liquidity(&book, 10_000.0);
        assert!((m.imbalance[0].unwrap()).abs() < 1e-9);
    }

    #[test]
    fn microprice_weighted_toward_larger_qty_side() {
        let mut book = OrderBook::new("BTCUSDT");
        book.apply_snapshot(1, &[lvl(100.0, 100.0)], &[lvl(101.0, 1.0)], 0);
        let m = compute_liquidity(&book, 10_000.0);
        // Heavy bid size pulls microprice toward the ask price.
        assert!(m.microprice.unwrap() > 100.5);
    }
}

// =============================================================================
// Orderbook Manager — snapshot+diff reconciliation, gap detection, resync FSM
// =============================================================================
//
// Maintains a top-N book per symbol from an initial REST snapshot plus a
// contiguous stream of diffs. A diff is contiguous when its first update ID
// immediately follows the book's last applied update ID; any gap drives the
// book into RESYNCING until a fresh snapshot arrives.

use std::collections::BTreeMap;
use std::time::Duration;

use futures_util::StreamExt;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_tungstenite::connect_async;
use tracing::{error, info, warn};

use crate::fp::Fp;
use crate::types::{BookState, IntegrityLevel};

/// Staleness budgets driving the LIVE -> STALE -> RESYNCING transitions.
const STALE_MS: i64 = 5_000;
const CRITICAL_MS: i64 = 15_000;
/// Once the gap counter reaches this, `reconnectRecommended` latches true
/// until the next snapshot resets it.
const GAP_RECONNECT_THRESHOLD: u32 = 3;

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct PriceLevel {
    pub price: Fp,
    pub qty: Fp,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IntegrityRecord {
    pub level: IntegrityLevel,
    pub message: String,
    pub last_update_ts: i64,
    pub sequence_gap_count: u32,
    pub crossed_book_detected: bool,
    pub avg_staleness_ms: f64,
    pub reconnect_count: u32,
    pub reconnect_recommended: bool,
}

pub struct DiffOutcome {
    pub ok: bool,
    pub reason: Option<&'static str>,
}

/// One side of the book, keyed by raw fixed-point price for exact ordering.
type Levels = BTreeMap<i128, i128>;

pub struct OrderBook {
    pub symbol: String,
    bids: Levels,
    asks: Levels,
    pub last_update_id: i64,
    pub state: BookState,
    last_update_ts: i64,
    staleness_samples: Vec<f64>,
    sequence_gap_count: u32,
    reconnect_count: u32,
    crossed_book_detected: bool,
}

impl OrderBook {
    pub fn new(symbol: impl Into<String>) -> Self {
        Self {
            symbol: symbol.into(),
            bids: BTreeMap::new(),
            asks: BTreeMap::new(),
            last_update_id: 0,
            state: BookState::Unknown,
            last_update_ts: 0,
            staleness_samples: Vec::new(),
            sequence_gap_count: 0,
            reconnect_count: 0,
            crossed_book_detected: false,
        }
    }

    /// Replace both sides wholesale. Never fails.
    pub fn apply_snapshot(
        &mut self,
        last_update_id: i64,
        bids: &[PriceLevel],
        asks: &[PriceLevel],
        now_ms: i64,
    ) {
        self.bids = bids.iter().map(|l| (l.price.0, l.qty.0)).collect();
        self.asks = asks.iter().map(|l| (l.price.0, l.qty.0)).collect();
        self.last_update_id = last_update_id;
        self.state = BookState::Live;
        self.last_update_ts = now_ms;
        self.sequence_gap_count = 0;
        info!(symbol = %self.symbol, last_update_id, "orderbook snapshot applied");
    }

    /// Apply a contiguous diff. `u_start` must equal `last_update_id + 1`;
    /// otherwise the book moves to RESYNCING and the caller must refetch a
    /// snapshot.
    pub fn apply_diff(
        &mut self,
        u_start: i64,
        u_end: i64,
        bids: &[PriceLevel],
        asks: &[PriceLevel],
        event_ts: i64,
        receipt_ts: i64,
    ) -> DiffOutcome {
        if self.state == BookState::Unknown {
            // No snapshot yet — diffs before the first snapshot are dropped.
            return DiffOutcome { ok: false, reason: Some("no_snapshot") };
        }

        if u_start > self.last_update_id + 1 {
            self.state = BookState::Resyncing;
            self.sequence_gap_count += 1;
            if self.sequence_gap_count >= GAP_RECONNECT_THRESHOLD {
                self.reconnect_count += 1;
            }
            warn!(
                symbol = %self.symbol,
                expected = self.last_update_id + 1,
                got = u_start,
                "orderbook sequence gap detected"
            );
            return DiffOutcome { ok: false, reason: Some("gap") };
        }

        if u_end <= self.last_update_id {
            // Duplicate / already-applied diff — idempotent no-op.
            return DiffOutcome { ok: true, reason: None };
        }

        for level in bids {
            apply_level(&mut self.bids, level);
        }
        for level in asks {
            apply_level(&mut self.asks, level);
        }

        self.last_update_id = u_end;
        self.state = BookState::Live;

        let staleness = (receipt_ts - event_ts).max(0) as f64;
        self.staleness_samples.push(staleness);
        if self.staleness_samples.len() > 200 {
            self.staleness_samples.remove(0);
        }
        self.last_update_ts = receipt_ts;

        self.crossed_book_detected = match (self.best_bid(), self.best_ask()) {
            (Some(b), Some(a)) => b.price.cmp_fp(a.price) != std::cmp::Ordering::Less,
            _ => false,
        };

        DiffOutcome { ok: true, reason: None }
    }

    pub fn best_bid(&self) -> Option<PriceLevel> {
        self.bids.iter().next_back().map(|(&p, &q)| PriceLevel { price: Fp(p), qty: Fp(q) })
    }

    pub fn best_ask(&self) -> Option<PriceLevel> {
        self.asks.iter().next().map(|(&p, &q)| PriceLevel { price: Fp(p), qty: Fp(q) })
    }

    pub fn level_size(&self, side_bid: bool, price: Fp) -> Fp {
        let side = if side_bid { &self.bids } else { &self.asks };
        side.get(&price.0).copied().map(Fp).unwrap_or(Fp::ZERO)
    }

    /// Top `n` levels per side, best-first, with cumulative quantity.
    pub fn depth_at(&self, n: usize) -> (Vec<(PriceLevel, Fp)>, Vec<(PriceLevel, Fp)>) {
        let mut cum = Fp::ZERO;
        let bids = self
            .bids
            .iter()
            .rev()
            .take(n)
            .map(|(&p, &q)| {
                cum = cum.add(Fp(q));
                (PriceLevel { price: Fp(p), qty: Fp(q) }, cum)
            })
            .collect();

        cum = Fp::ZERO;
        let asks = self
            .asks
            .iter()
            .take(n)
            .map(|(&p, &q)| {
                cum = cum.add(Fp(q));
                (PriceLevel { price: Fp(p), qty: Fp(q) }, cum)
            })
            .collect();

        (bids, asks)
    }

    pub fn mid_price(&self) -> Option<Fp> {
        match (self.best_bid(), self.best_ask()) {
            (Some(b), Some(a)) => Some(b.price.add(a.price).div(Fp::to_fp(2.0).ok()?).ok()?),
            _ => None,
        }
    }

    /// Evaluate staleness against `now_ms` and compose the integrity record.
    pub fn integrity(&mut self, now_ms: i64) -> IntegrityRecord {
        let staleness_now = (now_ms - self.last_update_ts).max(0);

        if self.state == BookState::Live {
            if staleness_now > CRITICAL_MS {
                self.state = BookState::Resyncing;
            } else if staleness_now > STALE_MS {
                self.state = BookState::Stale;
            }
        } else if self.state == BookState::Stale {
            if staleness_now > CRITICAL_MS {
                self.state = BookState::Resyncing;
            } else if staleness_now <= STALE_MS {
                self.state = BookState::Live;
            }
        }

        let avg_staleness_ms = if self.staleness_samples.is_empty() {
            0.0
        } else {
            self.staleness_samples.iter().sum::<f64>() / self.staleness_samples.len() as f64
        };

        let level = match self.state {
            BookState::Live => IntegrityLevel::Ok,
            BookState::Stale => IntegrityLevel::Degraded,
            BookState::Resyncing | BookState::Unknown => IntegrityLevel::Critical,
        };

        let message = match self.state {
            BookState::Unknown => "awaiting initial snapshot".to_string(),
            BookState::Live => "book live".to_string(),
            BookState::Stale => format!("no diff for {staleness_now}ms"),
            BookState::Resyncing => "resynchronizing from snapshot".to_string(),
        };

        IntegrityRecord {
            level,
            message,
            last_update_ts: self.last_update_ts,
            sequence_gap_count: self.sequence_gap_count,
            crossed_book_detected: self.crossed_book_detected,
            avg_staleness_ms,
            reconnect_count: self.reconnect_count,
            reconnect_recommended: self.sequence_gap_count >= GAP_RECONNECT_THRESHOLD,
        }
    }
}

fn apply_level(side: &mut Levels, level: &PriceLevel) {
    if level.qty.is_zero() {
        side.remove(&level.price.0);
    } else {
        side.insert(level.price.0, level.qty.0);
    }
}

// =============================================================================
// Upstream WebSocket consumption
// =============================================================================

#[derive(Debug, Clone)]
pub enum DepthEvent {
    Snapshot { last_update_id: i64, bids: Vec<PriceLevel>, asks: Vec<PriceLevel> },
    Diff { u_start: i64, u_end: i64, bids: Vec<PriceLevel>, asks: Vec<PriceLevel>, event_ts: i64 },
}

fn parse_levels(raw: &[Vec<String>]) -> Vec<PriceLevel> {
    raw.iter()
        .filter_map(|pair| {
            let price: f64 = pair.first()?.parse().ok()?;
            let qty: f64 = pair.get(1)?.parse().ok()?;
            Some(PriceLevel {
                price: Fp::to_fp(price).ok()?,
                qty: Fp::to_fp(qty).ok()?,
            })
        })
        .collect()
}

/// Connect to the futures diff-depth stream for `symbol` and forward parsed
/// events on `tx`. Reconnects with exponential backoff are the caller's
/// (Symbol Coordinator's) responsibility; this function returns once the
/// socket closes or errors.
pub async fn run_depth_stream(
    ws_host: &str,
    symbol: &str,
    tx: mpsc::Sender<DepthEvent>,
) -> anyhow::Result<()> {
    let stream_name = format!("{}@depth@100ms", symbol.to_ascii_lowercase());
    let url = format!("wss://{ws_host}/stream?streams={stream_name}");

    info!(symbol, url, "connecting to depth stream");
    let (ws_stream, _) = connect_async(&url).await?;
    let (_, mut read) = ws_stream.split();

    while let Some(msg) = read.next().await {
        let msg = match msg {
            Ok(m) => m,
            Err(e) => {
                error!(symbol, error = %e, "depth stream error");
                break;
            }
        };

        if !msg.is_text() {
            continue;
        }

        let text = msg.into_text().unwrap_or_default();
        let value: serde_json::Value = match serde_json::from_str(&text) {
            Ok(v) => v,
            Err(e) => {
                warn!(symbol, error = %e, "failed to parse depth frame");
                continue;
            }
        };

        let data = value.get("data").unwrap_or(&value);
        let Some(bids_raw) = data.get("b").and_then(|v| v.as_array()) else { continue };
        let Some(asks_raw) = data.get("a").and_then(|v| v.as_array()) else { continue };

        let to_pairs = |arr: &[serde_json::Value]| -> Vec<Vec<String>> {
            arr.iter()
                .filter_map(|e| {
                    let e = e.as_array()?;
                    Some(vec![
                        e.first()?.as_str()?.to_string(),
                        e.get(1)?.as_str()?.to_string(),
                    ])
                })
                .collect()
        };

        let bids = parse_levels(&to_pairs(bids_raw));
        let asks = parse_levels(&to_pairs(asks_raw));
        let u_start = data.get("U").and_then(|v| v.as_i64()).unwrap_or(0);
        let u_end = data.get("u").and_then(|v| v.as_i64()).unwrap_or(0);
        let event_ts = data.get("E").and_then(|v| v.as_i64()).unwrap_or(0);

        if tx
            .send(DepthEvent::Diff { u_start, u_end, bids, asks, event_ts })
            .await
            .is_err()
        {
            break;
        }
    }

    Ok(())
}

/// Fetch an initial REST depth snapshot. `max_attempts` lets callers retry
/// transient failures with a short backoff sleep between attempts.
pub async fn fetch_snapshot_retrying(
    client: &reqwest::Client,
    rest_host: &str,
    symbol: &str,
    limit: u32,
    max_attempts: u32,
) -> anyhow::Result<DepthEvent> {
    let url = format!("https://{rest_host}/fapi/v1/depth?symbol={symbol}&limit={limit}");
    let mut attempt = 0;
    loop {
        attempt += 1;
        match client.get(&url).send().await {
            Ok(resp) => {
                let body: serde_json::Value = resp.json().await?;
                let last_update_id = body["lastUpdateId"].as_i64().unwrap_or(0);
                let bids = parse_raw_pairs(&body["bids"]);
                let asks = parse_raw_pairs(&body["asks"]);
                return Ok(DepthEvent::Snapshot {
                    last_update_id,
                    bids: parse_levels(&bids),
                    asks: parse_levels(&asks),
                });
            }
            Err(e) if attempt < max_attempts => {
                warn!(symbol, attempt, error = %e, "snapshot fetch failed, retrying");
                tokio::time::sleep(Duration::from_millis(300 * attempt as u64)).await;
            }
            Err(e) => return Err(e.into()),
        }
    }
}

fn parse_raw_pairs(value: &serde_json::Value) -> Vec<Vec<String>> {
    value
        .as_array()
        .map(|arr| {
            arr.iter()
                .filter_map(|e| {
                    let e = e.as_array()?;
                    Some(vec![
                        e.first()?.as_str()?.to_string(),
                        e.get(1)?.as_str()?.to_string(),
                    ])
                })
                .collect()
        })
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lvl(price: f64, qty: f64) -> PriceLevel {
        PriceLevel { price: Fp::to_fp(price).unwrap(), qty: Fp::to_fp(qty).unwrap() }
    }

    #[test]
    fn snapshot_then_contiguous_diff_ok() {
        let mut book = OrderBook::new("BTCUSDT");
        book.apply_snapshot(10, &[lvl(100.0, 1.0)], &[lvl(101.0, 1.0)], 0);
        let outcome = book.apply_diff(11, 11, &[lvl(100.5, 2.0)], &[], 1, 1);
        assert!(outcome.ok);
        assert_eq!(book.last_update_id, 11);
    }

    #[test]
    fn gap_after_snapshot_triggers_resync() {
        // Contiguous diff following a snapshot stays live; a genuine gap
        // (U > lastUpdateId + 1) is covered separately below.
        let mut book = OrderBook::new("BTCUSDT");
        book.apply_snapshot(10, &[lvl(100.0, 1.0)], &[lvl(101.0, 1.0)], 0);
        let ok = book.apply_diff(11, 11, &[], &[], 1, 1);
        assert!(ok.ok);
        assert_eq!(book.last_update_id, 11);

        let gap = book.apply_diff(13, 13, &[], &[], 2, 2);
        assert!(!gap.ok);
        assert_eq!(gap.reason, Some("gap"));
        assert_eq!(book.state, BookState::Resyncing);
    }

    #[test]
    fn qty_zero_deletes_level() {
        let mut book = OrderBook::new("BTCUSDT");
        book.apply_snapshot(1, &[lvl(100.0, 1.0)], &[], 0);
        book.apply_diff(2, 2, &[lvl(100.0, 0.0)], &[], 1, 1);
        assert!(book.best_bid().is_none());
    }

    #[test]
    fn duplicate_diff_is_idempotent() {
        let mut book = OrderBook::new("BTCUSDT");
        book.apply_snapshot(1, &[lvl(100.0, 1.0)], &[], 0);
        book.apply_diff(2, 2, &[lvl(100.0, 5.0)], &[], 1, 1);
        let before = book.best_bid();
        let outcome = book.apply_diff(2, 2, &[lvl(100.0, 999.0)], &[], 1, 1);
        assert!(outcome.ok);
        assert_eq!(book.best_bid().map(|l| l.qty.0), before.map(|l| l.qty.0));
    }

    #[test]
    fn best_bid_below_best_ask_when_not_crossed() {
        let mut book = OrderBook::new("BTCUSDT");
        book.apply_snapshot(1, &[lvl(100.0, 1.0)], &[lvl(101.0, 1.0)], 0);
        let b = book.best_bid().unwrap();
        let a = book.best_ask().unwrap();
        assert!(b.price.cmp_fp(a.price) == std::cmp::Ordering::Less);
    }

    #[test]
    fn integrity_transitions_to_stale_then_critical() {
        let mut book = OrderBook::new("BTCUSDT");
        book.apply_snapshot(1, &[lvl(100.0, 1.0)], &[lvl(101.0, 1.0)], 0);
        book.apply_diff(2, 2, &[], &[], 0, 0);

        let rec = book.integrity(STALE_MS + 1);
        assert_eq!(book.state, BookState::Stale);
        assert_eq!(rec.level, IntegrityLevel::Degraded);

        let rec = book.integrity(CRITICAL_MS + 1);
        assert_eq!(book.state, BookState::Resyncing);
        assert_eq!(rec.level, IntegrityLevel::Critical);
    }

    #[test]
    fn depth_at_returns_cumulative_quantity() {
        let mut book = OrderBook::new("BTCUSDT");
        book.apply_snapshot(1, &[lvl(100.0, 1.0), lvl(99.0, 2.0)], &[], 0);
        let (bids, _) = book.depth_at(5);
        assert_eq!(bids.len(), 2);
        assert!((bids[0].1.from_fp() - 1.0).abs() < 1e-8);
        assert!((bids[1].1.from_fp() - 3.0).abs() < 1e-8);
    }
}

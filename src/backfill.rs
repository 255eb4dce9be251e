// =============================================================================
// Backfill Coordinator — bounded, deduplicated 1m-kline prefetch
// =============================================================================
//
// `ensure(symbol)` is idempotent: concurrent callers for the same symbol
// await the same in-flight fetch rather than issuing duplicate requests,
// a completed fetch is a no-op, and a failed fetch respects a retry
// interval before the next caller is allowed to try again. Failure is
// soft — callers fall back to whatever candles are already buffered and
// the HTF/regime derivators naturally report `None` for anything that
// needs more history than is available.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, Semaphore};
use tracing::{debug, warn};

use crate::binance::client::BinanceClient;
use crate::market_data::{CandleBuffer, CandleKey};

const BACKFILL_INTERVAL: &str = "1m";
const BACKFILL_LIMIT: u32 = 500;

/// Per-symbol backfill progress, mirroring the state shape named in the
/// component contract.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackfillStatus {
    pub in_progress: bool,
    pub done: bool,
    pub bars_loaded: usize,
    pub started_at_ms: Option<i64>,
    pub done_at_ms: Option<i64>,
    pub fetch_count: u32,
    pub last_attempt_ms: Option<i64>,
    pub last_error: Option<String>,
}

impl Default for BackfillStatus {
    fn default() -> Self {
        Self {
            in_progress: false,
            done: false,
            bars_loaded: 0,
            started_at_ms: None,
            done_at_ms: None,
            fetch_count: 0,
            last_attempt_ms: None,
            last_error: None,
        }
    }
}

enum Slot {
    InFlight(broadcast::Sender<()>),
    Done,
}

struct SymbolState {
    slot: Option<Slot>,
    status: BackfillStatus,
    failed_at_ms: Option<i64>,
}

impl Default for SymbolState {
    fn default() -> Self {
        Self { slot: None, status: BackfillStatus::default(), failed_at_ms: None }
    }
}

/// Bounded-concurrency backfill coordinator shared across all Symbol
/// Coordinators in the process.
pub struct BackfillCoordinator {
    client: BinanceClient,
    buffer: Arc<CandleBuffer>,
    states: RwLock<HashMap<String, SymbolState>>,
    semaphore: Arc<Semaphore>,
    retry_interval: Duration,
}

fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

impl BackfillCoordinator {
    pub fn new(client: BinanceClient, buffer: Arc<CandleBuffer>, max_concurrent: usize, retry_interval: Duration) -> Self {
        Self {
            client,
            buffer,
            states: RwLock::new(HashMap::new()),
            semaphore: Arc::new(Semaphore::new(max_concurrent.max(1))),
            retry_interval,
        }
    }

    /// Idempotent 1m-kline prefetch for `symbol`. Returns once a fetch has
    /// either completed (this call's own fetch, or one it waited on) or the
    /// symbol is already marked done.
    pub async fn ensure(&self, symbol: &str) {
        loop {
            let action = {
                let mut states = self.states.write();
                let state = states.entry(symbol.to_string()).or_default();

                match &state.slot {
                    Some(Slot::Done) => return,
                    Some(Slot::InFlight(tx)) => Action::Wait(tx.subscribe()),
                    None => {
                        if let Some(failed_at) = state.failed_at_ms {
                            let elapsed = now_ms() - failed_at;
                            if elapsed < self.retry_interval.as_millis() as i64 {
                                return;
                            }
                        }
                        let (tx, _rx) = broadcast::channel(1);
                        state.slot = Some(Slot::InFlight(tx.clone()));
                        state.status.in_progress = true;
                        state.status.started_at_ms = Some(now_ms());
                        Action::Fetch(tx)
                    }
                }
            };

            match action {
                Action::Wait(mut rx) => {
                    let _ = rx.recv().await;
                    continue;
                }
                Action::Fetch(tx) => {
                    self.run_fetch(symbol, &tx).await;
                    return;
                }
            }
        }
    }

    async fn run_fetch(&self, symbol: &str, tx: &broadcast::Sender<()>) {
        let _permit = self.semaphore.acquire().await;

        {
            let mut states = self.states.write();
            if let Some(state) = states.get_mut(symbol) {
                state.status.last_attempt_ms = Some(now_ms());
                state.status.fetch_count += 1;
            }
        }

        match self.client.get_klines(symbol, BACKFILL_INTERVAL, BACKFILL_LIMIT).await {
            Ok(candles) => {
                let bars = candles.len();
                let key = CandleKey { symbol: symbol.to_string(), interval: BACKFILL_INTERVAL.to_string() };
                for candle in candles {
                    self.buffer.update(key.clone(), candle);
                }
                debug!(symbol, bars, "backfill prefetch complete");

                let mut states = self.states.write();
                if let Some(state) = states.get_mut(symbol) {
                    state.slot = Some(Slot::Done);
                    state.status.in_progress = false;
                    state.status.done = true;
                    state.status.bars_loaded = bars;
                    state.status.done_at_ms = Some(now_ms());
                    state.status.last_error = None;
                }
            }
            Err(e) => {
                warn!(symbol, error = %e, "backfill prefetch failed, will retry after cooldown");

                let mut states = self.states.write();
                if let Some(state) = states.get_mut(symbol) {
                    state.slot = None;
                    state.failed_at_ms = Some(now_ms());
                    state.status.in_progress = false;
                    state.status.last_error = Some(e.to_string());
                }
            }
        }

        let _ = tx.send(());
    }

    pub fn status(&self, symbol: &str) -> BackfillStatus {
        self.states.read().get(symbol).map(|s| s.status.clone()).unwrap_or_default()
    }
}

enum Action {
    Wait(broadcast::Receiver<()>),
    Fetch(broadcast::Sender<()>),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_status_is_not_done() {
        let status = BackfillStatus::default();
        assert!(!status.done);
        assert!(!status.in_progress);
        assert_eq!(status.fetch_count, 0);
    }
}

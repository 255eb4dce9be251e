// =============================================================================
// Deterministic ID Generator — reproducible order/trade/event IDs per run
// =============================================================================
//
// IDs are a short hex digest of `(runId | kind | counter | salient inputs)`.
// For identical run inputs, the emitted sequence is byte-identical across
// runs and platforms. Never a UUID — no `uuid::Uuid::new_v4` in this module.

use sha2::{Digest, Sha256};
use std::sync::atomic::{AtomicU64, Ordering};

/// Length, in hex characters, of a generated ID.
const ID_HEX_LEN: usize = 24;

/// Per-kind monotonic counters scoped to one dry-run session.
#[derive(Debug)]
pub struct IdGenerator {
    run_id: String,
    order_counter: AtomicU64,
    trade_counter: AtomicU64,
    event_counter: AtomicU64,
}

fn digest(run_id: &str, kind: &str, counter: u64, salient: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(run_id.as_bytes());
    hasher.update(b"|");
    hasher.update(kind.as_bytes());
    hasher.update(b"|");
    hasher.update(counter.to_string().as_bytes());
    hasher.update(b"|");
    hasher.update(salient.as_bytes());
    let out = hasher.finalize();
    hex::encode(out)[..ID_HEX_LEN].to_string()
}

impl IdGenerator {
    pub fn new(run_id: impl Into<String>) -> Self {
        Self {
            run_id: run_id.into(),
            order_counter: AtomicU64::new(0),
            trade_counter: AtomicU64::new(0),
            event_counter: AtomicU64::new(0),
        }
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    /// Generate the next order ID. `salient` should encode whatever makes
    /// this order unique within the tick (symbol, side, price) so that two
    /// orders in the same tick never collide even if the counter were lost.
    pub fn next_order_id(&self, salient: &str) -> String {
        let n = self.order_counter.fetch_add(1, Ordering::SeqCst);
        digest(&self.run_id, "order", n, salient)
    }

    pub fn next_trade_id(&self, salient: &str) -> String {
        let n = self.trade_counter.fetch_add(1, Ordering::SeqCst);
        digest(&self.run_id, "trade", n, salient)
    }

    pub fn next_event_id(&self, salient: &str) -> String {
        let n = self.event_counter.fetch_add(1, Ordering::SeqCst);
        digest(&self.run_id, "event", n, salient)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identical_inputs_produce_identical_sequences() {
        let a = IdGenerator::new("run-deterministic-001");
        let b = IdGenerator::new("run-deterministic-001");

        let a_ids: Vec<String> = (0..5).map(|i| a.next_order_id(&format!("sym{i}"))).collect();
        let b_ids: Vec<String> = (0..5).map(|i| b.next_order_id(&format!("sym{i}"))).collect();

        assert_eq!(a_ids, b_ids);
    }

    #[test]
    fn different_run_ids_diverge() {
        let a = IdGenerator::new("run-a");
        let b = IdGenerator::new("run-b");
        assert_ne!(a.next_order_id("x"), b.next_order_id("x"));
    }

    #[test]
    fn ids_are_not_uuid_shaped() {
        let g = IdGenerator::new("run-x");
        let id = g.next_order_id("x");
        // Canonical UUID has hyphens at fixed positions; our digest never does.
        assert!(!id.contains('-'));
        assert_eq!(id.len(), ID_HEX_LEN);
    }

    #[test]
    fn counters_advance_independently_per_kind() {
        let g = IdGenerator::new("run-x");
        let o1 = g.next_order_id("a");
        let t1 = g.next_trade_id("a");
        let o2 = g.next_order_id("a");
        assert_ne!(o1, t1);
        assert_ne!(o1, o2);
    }
}

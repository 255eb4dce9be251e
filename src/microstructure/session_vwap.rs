// =============================================================================
// Session VWAP — piecewise per-session anchored VWAP
// =============================================================================
//
// Sessions switch at fixed UTC hour boundaries: 00:00 asia, 08:00 london,
// 13:00 ny. A session's VWAP, high, and low reset at its own rollover.

use chrono::{DateTime, Timelike, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionName {
    Asia,
    London,
    Ny,
}

impl SessionName {
    fn start_hour(self) -> u32 {
        match self {
            SessionName::Asia => 0,
            SessionName::London => 8,
            SessionName::Ny => 13,
        }
    }
}

/// Determine the active session for a UTC timestamp.
pub fn session_for(ts_ms: i64) -> SessionName {
    let dt = DateTime::<Utc>::from_timestamp_millis(ts_ms).unwrap_or_else(|| Utc::now());
    let hour = dt.hour();
    if hour >= 13 {
        SessionName::Ny
    } else if hour >= 8 {
        SessionName::London
    } else {
        SessionName::Asia
    }
}

/// The start-of-day-UTC millisecond boundary at which `session` begins, for
/// the calendar day containing `ts_ms`.
fn session_start_ms(ts_ms: i64, session: SessionName) -> i64 {
    let day_start = (ts_ms.div_euclid(86_400_000)) * 86_400_000;
    day_start + (session.start_hour() as i64) * 3_600_000
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionVwap {
    pub name: SessionName,
    pub session_start_ms: i64,
    pub elapsed_ms: i64,
    pub value: f64,
    pub price_distance_bps: f64,
    pub session_high: f64,
    pub session_low: f64,
    pub session_range_pct: f64,
    cum_pv: f64,
    cum_v: f64,
}

impl SessionVwap {
    pub fn new() -> Self {
        Self {
            name: SessionName::Asia,
            session_start_ms: 0,
            elapsed_ms: 0,
            value: 0.0,
            price_distance_bps: 0.0,
            session_high: f64::MIN,
            session_low: f64::MAX,
            session_range_pct: 0.0,
            cum_pv: 0.0,
            cum_v: 0.0,
        }
    }

    pub fn on_trade(&mut self, ts_ms: i64, price: f64, qty: f64) {
        let session = session_for(ts_ms);
        let start = session_start_ms(ts_ms, session);

        if start != self.session_start_ms {
            // Rollover: a new session begins, reset accumulators.
            self.name = session;
            self.session_start_ms = start;
            self.cum_pv = 0.0;
            self.cum_v = 0.0;
            self.session_high = price;
            self.session_low = price;
        }

        self.cum_pv += price * qty;
        self.cum_v += qty;
        self.session_high = self.session_high.max(price);
        self.session_low = self.session_low.min(price);
        self.elapsed_ms = ts_ms - self.session_start_ms;

        if self.cum_v > f64::EPSILON {
            self.value = self.cum_pv / self.cum_v;
            self.price_distance_bps = ((price - self.value) / self.value) * 10_000.0;
        }

        if self.session_low > f64::EPSILON {
            self.session_range_pct = (self.session_high - self.session_low) / self.session_low * 100.0;
        }
    }
}

impl Default for SessionVwap {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn session_for_boundaries() {
        assert_eq!(session_for(0), SessionName::Asia);
        assert_eq!(session_for(8 * 3_600_000), SessionName::London);
        assert_eq!(session_for(13 * 3_600_000), SessionName::Ny);
        assert_eq!(session_for(7 * 3_600_000 + 59 * 60_000), SessionName::Asia);
    }

    #[test]
    fn vwap_accumulates_within_session() {
        let mut v = SessionVwap::new();
        v.on_trade(1_000, 100.0, 1.0);
        v.on_trade(2_000, 102.0, 1.0);
        assert!((v.value - 101.0).abs() < 1e-9);
    }

    #[test]
    fn vwap_resets_on_session_rollover() {
        let mut v = SessionVwap::new();
        v.on_trade(1_000, 100.0, 1.0);
        let eight_hours = 8 * 3_600_000;
        v.on_trade(eight_hours, 50.0, 1.0);
        assert_eq!(v.name, SessionName::London);
        assert!((v.value - 50.0).abs() < 1e-9);
    }
}

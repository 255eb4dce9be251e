// =============================================================================
// Binance USDT-M Futures REST Client — public market data only
// =============================================================================
//
// The engine never submits real orders, so this client exposes only the
// public endpoints the telemetry and backfill paths need: klines, mark/index
// price, and funding rate history. Construction enforces the mainnet
// upstream guard — see `crate::config::MAINNET_REST_HOSTS`.
// =============================================================================

use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::{debug, instrument, warn};

use crate::binance::rate_limit::RateLimitTracker;
use crate::config::MAINNET_REST_HOSTS;
use crate::market_data::Candle;

const KLINES_WEIGHT: u32 = 5;
const PREMIUM_INDEX_WEIGHT: u32 = 1;

/// Public REST client scoped to a single REST host. Cloning shares the same
/// underlying connection pool and rate-limit tracker.
#[derive(Clone)]
pub struct BinanceClient {
    rest_host: String,
    client: reqwest::Client,
    rate_limit: Arc<RateLimitTracker>,
}

impl BinanceClient {
    /// Construct a client against `rest_host`. Fails fast if the host is not
    /// one of the recognized mainnet futures hosts — the engine must never
    /// silently talk to testnet.
    pub fn new(rest_host: impl Into<String>) -> Result<Self> {
        let rest_host = rest_host.into();
        if !MAINNET_REST_HOSTS.contains(&rest_host.as_str()) {
            anyhow::bail!(
                "refusing to construct BinanceClient against non-mainnet host '{rest_host}'"
            );
        }

        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(10))
            .build()
            .expect("failed to build reqwest client");

        debug!(rest_host, "BinanceClient initialised");

        Ok(Self { rest_host, client, rate_limit: Arc::new(RateLimitTracker::new()) })
    }

    /// Construct without the upstream guard — exposed for tests that exercise
    /// parsing logic against a mock server.
    #[cfg(test)]
    fn new_unchecked(rest_host: impl Into<String>) -> Self {
        Self {
            rest_host: rest_host.into(),
            client: reqwest::Client::new(),
            rate_limit: Arc::new(RateLimitTracker::new()),
        }
    }

    pub fn rate_limit_snapshot(&self) -> crate::binance::rate_limit::RateLimitSnapshot {
        self.rate_limit.snapshot()
    }

    // -------------------------------------------------------------------------
    // Public market data
    // -------------------------------------------------------------------------

    /// GET /fapi/v1/klines.
    ///
    /// Array indices: [0] openTime, [1] open, [2] high, [3] low, [4] close,
    /// [5] volume, [6] closeTime, [7] quoteAssetVolume, [8] numberOfTrades,
    /// [9] takerBuyBaseVolume, [10] takerBuyQuoteVolume.
    #[instrument(skip(self), name = "binance::get_klines")]
    pub async fn get_klines(&self, symbol: &str, interval: &str, limit: u32) -> Result<Vec<Candle>> {
        if !self.rate_limit.can_send_request(KLINES_WEIGHT) {
            anyhow::bail!("rate limit budget exhausted, refusing to send GET /fapi/v1/klines");
        }

        let url = format!(
            "https://{}/fapi/v1/klines?symbol={}&interval={}&limit={}",
            self.rest_host, symbol, interval, limit
        );

        let resp = self
            .client
            .get(&url)
            .send()
            .await
            .context("GET /fapi/v1/klines request failed")?;

        self.rate_limit.update_from_headers(resp.headers());
        let status = resp.status();
        let body: serde_json::Value = resp.json().await.context("failed to parse klines response")?;

        if !status.is_success() {
            anyhow::bail!("Binance GET /fapi/v1/klines returned {}: {}", status, body);
        }

        let raw = body.as_array().context("klines response is not an array")?;
        let mut candles = Vec::with_capacity(raw.len());

        for entry in raw {
            let arr = entry.as_array().context("kline entry is not an array")?;
            if arr.len() < 11 {
                warn!("skipping malformed kline entry with {} elements", arr.len());
                continue;
            }

            let open_time = arr[0].as_i64().unwrap_or(0);
            let open = Self::parse_str_f64(&arr[1])?;
            let high = Self::parse_str_f64(&arr[2])?;
            let low = Self::parse_str_f64(&arr[3])?;
            let close = Self::parse_str_f64(&arr[4])?;
            let volume = Self::parse_str_f64(&arr[5])?;
            let close_time = arr[6].as_i64().unwrap_or(0);
            let quote_volume = Self::parse_str_f64(&arr[7])?;
            let trades_count = arr[8].as_u64().unwrap_or(0);
            let taker_buy_volume = Self::parse_str_f64(&arr[9])?;
            let taker_buy_quote_volume = Self::parse_str_f64(&arr[10])?;

            candles.push(Candle {
                open_time,
                close_time,
                open,
                high,
                low,
                close,
                volume,
                quote_volume,
                trades_count,
                taker_buy_volume,
                taker_buy_quote_volume,
                is_closed: true,
            });
        }

        debug!(symbol, interval, count = candles.len(), "klines fetched");
        Ok(candles)
    }

    /// GET /fapi/v1/premiumIndex — mark price, index price, and the funding
    /// rate currently accruing toward the next settlement.
    #[instrument(skip(self), name = "binance::get_premium_index")]
    pub async fn get_premium_index(&self, symbol: &str) -> Result<PremiumIndex> {
        if !self.rate_limit.can_send_request(PREMIUM_INDEX_WEIGHT) {
            anyhow::bail!("rate limit budget exhausted, refusing to send GET /fapi/v1/premiumIndex");
        }

        let url = format!("https://{}/fapi/v1/premiumIndex?symbol={}", self.rest_host, symbol);

        let resp = self
            .client
            .get(&url)
            .send()
            .await
            .context("GET /fapi/v1/premiumIndex request failed")?;

        self.rate_limit.update_from_headers(resp.headers());
        let status = resp.status();
        let body: serde_json::Value = resp
            .json()
            .await
            .context("failed to parse premiumIndex response")?;

        if !status.is_success() {
            anyhow::bail!("Binance GET /fapi/v1/premiumIndex returned {}: {}", status, body);
        }

        Ok(PremiumIndex {
            mark_price: body["markPrice"].as_str().unwrap_or("0").parse().unwrap_or(0.0),
            index_price: body["indexPrice"].as_str().unwrap_or("0").parse().unwrap_or(0.0),
            last_funding_rate: body["lastFundingRate"].as_str().unwrap_or("0").parse().unwrap_or(0.0),
            next_funding_time: body["nextFundingTime"].as_i64().unwrap_or(0),
        })
    }

    // -------------------------------------------------------------------------
    // Internal helpers
    // -------------------------------------------------------------------------

    fn parse_str_f64(val: &serde_json::Value) -> Result<f64> {
        if let Some(s) = val.as_str() {
            s.parse::<f64>().with_context(|| format!("failed to parse '{s}' as f64"))
        } else if let Some(n) = val.as_f64() {
            Ok(n)
        } else {
            anyhow::bail!("expected string or number, got: {val}")
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct PremiumIndex {
    pub mark_price: f64,
    pub index_price: f64,
    pub last_funding_rate: f64,
    pub next_funding_time: i64,
}

impl std::fmt::Debug for BinanceClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BinanceClient").field("rest_host", &self.rest_host).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn non_mainnet_host_is_rejected() {
        let err = BinanceClient::new("testnet.binancefuture.com").unwrap_err();
        assert!(err.to_string().contains("non-mainnet"));
    }

    #[test]
    fn mainnet_host_is_accepted() {
        assert!(BinanceClient::new("fapi.binance.com").is_ok());
    }

    #[test]
    fn unchecked_constructor_bypasses_guard_for_tests() {
        let _ = BinanceClient::new_unchecked("example.invalid");
    }
}

// =============================================================================
// Trade Stream — aggTrade WebSocket ingestion into TradeEvent
// =============================================================================
//
// Connects to the futures aggTrade stream for one symbol and forwards parsed
// prints on `tx`. Reconnection and backoff are the Symbol Coordinator's
// responsibility; this function returns once the socket closes or errors,
// mirroring `market_data::orderbook::run_depth_stream`.

use anyhow::{Context, Result};
use futures_util::StreamExt;
use tokio::sync::mpsc;
use tokio_tungstenite::connect_async;
use tracing::{error, info, warn};

use crate::fp::Fp;
use crate::market_data::trade_tape::TradeEvent;
use crate::types::Aggressor;

pub async fn run_trade_stream(ws_host: &str, symbol: &str, tx: mpsc::Sender<TradeEvent>) -> Result<()> {
    let lower = symbol.to_ascii_lowercase();
    let url = format!("wss://{ws_host}/ws/{lower}@aggTrade");
    info!(symbol, url, "connecting to trade stream");

    let (ws_stream, _) = connect_async(&url).await.context("failed to connect to trade stream")?;
    let (_write, mut read) = ws_stream.split();

    while let Some(msg) = read.next().await {
        let msg = match msg {
            Ok(m) => m,
            Err(e) => {
                error!(symbol, error = %e, "trade stream error");
                return Err(e.into());
            }
        };

        if !msg.is_text() {
            continue;
        }

        match parse_agg_trade(&msg.into_text().unwrap_or_default()) {
            Ok(trade) => {
                if tx.send(trade).await.is_err() {
                    break;
                }
            }
            Err(e) => warn!(symbol, error = %e, "failed to parse aggTrade message"),
        }
    }

    warn!(symbol, "trade stream ended");
    Ok(())
}

/// Expected shape:
/// ```json
/// { "e": "aggTrade", "E": 123, "s": "BTCUSDT", "p": "37000.00", "q": "0.123", "m": true }
/// ```
fn parse_agg_trade(text: &str) -> Result<TradeEvent> {
    let root: serde_json::Value = serde_json::from_str(text).context("failed to parse aggTrade JSON")?;

    let ts = root["E"].as_i64().context("missing field E")?;
    let price: f64 = root["p"].as_str().context("missing field p")?.parse().context("failed to parse price")?;
    let qty: f64 = root["q"].as_str().context("missing field q")?.parse().context("failed to parse quantity")?;
    let is_buyer_maker = root["m"].as_bool().context("missing field m")?;

    // Buyer is maker => the taker (aggressor) is selling.
    let aggressor = if is_buyer_maker { Aggressor::Sell } else { Aggressor::Buy };

    Ok(TradeEvent {
        ts,
        price: Fp::to_fp(price).context("non-finite trade price")?,
        qty: Fp::to_fp(qty).context("non-finite trade qty")?,
        aggressor,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_buyer_maker_as_sell_aggressor() {
        let json = r#"{"e":"aggTrade","E":1700000000000,"s":"BTCUSDT","p":"37000.00","q":"0.5","m":true}"#;
        let trade = parse_agg_trade(json).unwrap();
        assert_eq!(trade.aggressor, Aggressor::Sell);
        assert_eq!(trade.ts, 1_700_000_000_000);
    }

    #[test]
    fn parses_seller_maker_as_buy_aggressor() {
        let json = r#"{"e":"aggTrade","E":1,"s":"BTCUSDT","p":"100.0","q":"1.0","m":false}"#;
        let trade = parse_agg_trade(json).unwrap();
        assert_eq!(trade.aggressor, Aggressor::Buy);
    }

    #[test]
    fn missing_field_is_rejected() {
        let json = r#"{"e":"aggTrade","s":"BTCUSDT"}"#;
        assert!(parse_agg_trade(json).is_err());
    }
}

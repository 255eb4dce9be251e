pub mod candle_buffer;
pub mod orderbook;
pub mod trade_stream;
pub mod trade_tape;

// Re-export the Candle struct for convenient access (e.g. `use crate::market_data::Candle`).
pub use candle_buffer::{Candle, CandleBuffer, CandleKey};
pub use orderbook::OrderBook;
pub use trade_tape::{TradeEvent, TradeTape};

// =============================================================================
// Exchange interface — the data plane's upstream collaborator
// =============================================================================
//
// The engine only depends on this trait; the Binance adapter in binance.rs
// is one implementation, MockExchange drives tests and the `all` development
// command. Symbol form conversion (BTCUSDT <-> BTC/USDT) is the adapter's
// concern and lives here so no caller ever reformats symbols.
// =============================================================================

pub mod binance;
pub mod rate_limit;

use std::collections::HashMap;

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::types::{Bar, MarketType};

/// Real-time ticker snapshot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Ticker {
    pub symbol: String,
    pub last: f64,
    pub bid: f64,
    pub ask: f64,
    pub timestamp: i64,
}

/// Order-book snapshot: (price, quantity) levels, best first.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderBook {
    pub symbol: String,
    pub bids: Vec<(f64, f64)>,
    pub asks: Vec<(f64, f64)>,
    pub timestamp: i64,
}

/// A placed or queried order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Order {
    pub id: String,
    pub symbol: String,
    pub side: String,
    pub order_type: String,
    pub amount: f64,
    pub price: Option<f64>,
    pub status: String,
}

/// Exchange operations the engine depends on. Implementations are expected
/// to be rate-limited and to enforce a per-call timeout (default 5 s).
#[async_trait]
pub trait Exchange: Send + Sync {
    /// Fetch bars ascending by timestamp. `since_ts` is Unix seconds;
    /// `None` means "the most recent `limit` bars".
    async fn fetch_bars(
        &self,
        symbol: &str,
        timeframe: &str,
        since_ts: Option<i64>,
        limit: usize,
        market: MarketType,
    ) -> Result<Vec<Bar>>;

    async fn fetch_ticker(&self, symbol: &str) -> Result<Ticker>;

    async fn fetch_order_book(&self, symbol: &str, limit: usize) -> Result<OrderBook>;

    async fn create_order(
        &self,
        symbol: &str,
        side: &str,
        order_type: &str,
        amount: f64,
        price: Option<f64>,
    ) -> Result<Order>;

    async fn cancel_order(&self, order_id: &str, symbol: &str) -> Result<bool>;

    async fn fetch_order(&self, order_id: &str, symbol: &str) -> Result<Option<Order>>;

    /// Free balance per asset.
    async fn fetch_balance(&self) -> Result<HashMap<String, f64>>;
}

// ---------------------------------------------------------------------------
// Symbol conversion
// ---------------------------------------------------------------------------

/// Convert the internal symbol form to the exchange's slash form:
/// `BTCUSDT -> BTC/USDT`. Symbols with an unrecognized quote asset pass
/// through unchanged.
pub fn to_exchange_symbol(symbol: &str) -> String {
    for quote in ["USDT", "USD", "BTC", "ETH"] {
        if let Some(base) = symbol.strip_suffix(quote) {
            if !base.is_empty() {
                return format!("{base}/{quote}");
            }
        }
    }
    symbol.to_string()
}

/// Inverse of [`to_exchange_symbol`].
pub fn from_exchange_symbol(symbol: &str) -> String {
    symbol.replace('/', "")
}

// ---------------------------------------------------------------------------
// MockExchange
// ---------------------------------------------------------------------------

/// Deterministic exchange used in tests and the `all` development command.
///
/// Bars are generated on a fixed grid from a slow sine walk seeded by the
/// symbol name, so any (since, limit) request is reproducible.
pub struct MockExchange;

impl MockExchange {
    pub fn new() -> Self {
        Self
    }

    fn synth_bar(symbol: &str, timeframe: &str, ts: i64, market: MarketType) -> Bar {
        let seed = symbol
            .bytes()
            .fold(0u64, |acc, b| acc.wrapping_mul(31).wrapping_add(b as u64));
        let base = 100.0 + (seed % 900) as f64;
        let phase = ts as f64 / 40_000.0;
        let close = base * (1.0 + 0.05 * phase.sin());
        let open = base * (1.0 + 0.05 * (phase - 0.01).sin());
        let high = open.max(close) * 1.002;
        let low = open.min(close) * 0.998;
        Bar {
            symbol: symbol.to_string(),
            timeframe: timeframe.to_string(),
            timestamp: ts,
            market_type: market,
            open,
            high,
            low,
            close,
            volume: 50.0 + (ts % 97) as f64,
        }
    }
}

impl Default for MockExchange {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Exchange for MockExchange {
    async fn fetch_bars(
        &self,
        symbol: &str,
        timeframe: &str,
        since_ts: Option<i64>,
        limit: usize,
        market: MarketType,
    ) -> Result<Vec<Bar>> {
        let interval = crate::types::timeframe_secs(timeframe);
        let now = chrono::Utc::now().timestamp();
        let latest = now / interval * interval;
        let start = match since_ts {
            Some(since) => (since + interval - 1) / interval * interval,
            None => latest - interval * (limit as i64 - 1),
        };

        let mut bars = Vec::new();
        let mut ts = start;
        while ts <= latest && bars.len() < limit {
            bars.push(Self::synth_bar(symbol, timeframe, ts, market));
            ts += interval;
        }
        Ok(bars)
    }

    async fn fetch_ticker(&self, symbol: &str) -> Result<Ticker> {
        let now = chrono::Utc::now().timestamp();
        let bar = Self::synth_bar(symbol, "1m", now / 60 * 60, MarketType::Spot);
        Ok(Ticker {
            symbol: symbol.to_string(),
            last: bar.close,
            bid: bar.close * 0.9995,
            ask: bar.close * 1.0005,
            timestamp: now,
        })
    }

    async fn fetch_order_book(&self, symbol: &str, limit: usize) -> Result<OrderBook> {
        let ticker = self.fetch_ticker(symbol).await?;
        let bids = (0..limit)
            .map(|i| (ticker.bid * (1.0 - i as f64 * 0.0001), 1.0 + i as f64))
            .collect();
        let asks = (0..limit)
            .map(|i| (ticker.ask * (1.0 + i as f64 * 0.0001), 1.0 + i as f64))
            .collect();
        Ok(OrderBook {
            symbol: symbol.to_string(),
            bids,
            asks,
            timestamp: ticker.timestamp,
        })
    }

    async fn create_order(
        &self,
        symbol: &str,
        side: &str,
        order_type: &str,
        amount: f64,
        price: Option<f64>,
    ) -> Result<Order> {
        Ok(Order {
            id: uuid::Uuid::new_v4().to_string(),
            symbol: symbol.to_string(),
            side: side.to_string(),
            order_type: order_type.to_string(),
            amount,
            price,
            status: "FILLED".to_string(),
        })
    }

    async fn cancel_order(&self, _order_id: &str, _symbol: &str) -> Result<bool> {
        Ok(true)
    }

    async fn fetch_order(&self, _order_id: &str, _symbol: &str) -> Result<Option<Order>> {
        Ok(None)
    }

    async fn fetch_balance(&self) -> Result<HashMap<String, f64>> {
        Ok(HashMap::from([("USDT".to_string(), 10_000.0)]))
    }
}

// =============================================================================
// Binance REST adapter — HMAC-SHA256 signed requests
// =============================================================================
//
// SECURITY: the secret key is never logged or serialized. Signed requests
// carry X-MBX-APIKEY as a header and a recvWindow of 5 000 ms to tolerate
// minor clock drift between the engine and Binance servers.
//
// Market routing:
//   spot     -> https://api.binance.com   /api/v3
//   future   -> https://fapi.binance.com  /fapi/v1
//   delivery -> https://dapi.binance.com  /dapi/v1
// =============================================================================

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use anyhow::{Context, Result};
use async_trait::async_trait;
use hmac::{Hmac, Mac};
use reqwest::header::{HeaderMap, HeaderValue};
use sha2::Sha256;
use tracing::{debug, warn};

use crate::types::{Bar, MarketType};

use super::rate_limit::RateLimitTracker;
use super::{from_exchange_symbol, Exchange, Order, OrderBook, Ticker};

type HmacSha256 = Hmac<Sha256>;

/// Default recv-window sent with every signed request (milliseconds).
const RECV_WINDOW: u64 = 5000;

/// Per-call timeout for all REST requests.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(5);

/// Binance REST client implementing the [`Exchange`] trait.
#[derive(Clone)]
pub struct BinanceExchange {
    secret: String,
    client: reqwest::Client,
    limiter: Arc<RateLimitTracker>,
}

impl BinanceExchange {
    /// Create a new client. Empty credentials restrict the instance to
    /// public endpoints (klines, ticker, order book).
    pub fn new(
        api_key: impl Into<String>,
        secret: impl Into<String>,
        proxy_host: Option<&str>,
        proxy_port: Option<u16>,
    ) -> Result<Self> {
        let api_key = api_key.into();

        let mut default_headers = HeaderMap::new();
        if !api_key.is_empty() {
            if let Ok(val) = HeaderValue::from_str(&api_key) {
                default_headers.insert("X-MBX-APIKEY", val);
            }
        }

        let mut builder = reqwest::Client::builder()
            .default_headers(default_headers)
            .timeout(REQUEST_TIMEOUT);

        if let (Some(host), Some(port)) = (proxy_host, proxy_port) {
            let proxy_url = format!("http://{host}:{port}");
            builder = builder.proxy(
                reqwest::Proxy::all(&proxy_url)
                    .with_context(|| format!("invalid proxy: {proxy_url}"))?,
            );
            debug!(proxy = %proxy_url, "exchange client using proxy");
        }

        Ok(Self {
            secret: secret.into(),
            client: builder.build().context("failed to build http client")?,
            limiter: Arc::new(RateLimitTracker::new()),
        })
    }

    pub fn rate_limit(&self) -> &RateLimitTracker {
        &self.limiter
    }

    fn base_url(market: MarketType) -> &'static str {
        match market {
            MarketType::Spot => "https://api.binance.com/api/v3",
            MarketType::Future => "https://fapi.binance.com/fapi/v1",
            MarketType::Delivery => "https://dapi.binance.com/dapi/v1",
        }
    }

    // -------------------------------------------------------------------------
    // Signing helpers
    // -------------------------------------------------------------------------

    /// HMAC-SHA256 hex signature of `query`.
    fn sign(&self, query: &str) -> String {
        let mut mac =
            HmacSha256::new_from_slice(self.secret.as_bytes()).expect("HMAC accepts any key size");
        mac.update(query.as_bytes());
        hex::encode(mac.finalize().into_bytes())
    }

    fn timestamp_ms() -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("system clock before UNIX epoch")
            .as_millis() as u64
    }

    /// Append timestamp, recvWindow, and the signature to `params`.
    fn signed_query(&self, params: &str) -> String {
        let ts = Self::timestamp_ms();
        let base = if params.is_empty() {
            format!("timestamp={ts}&recvWindow={RECV_WINDOW}")
        } else {
            format!("{params}&timestamp={ts}&recvWindow={RECV_WINDOW}")
        };
        let sig = self.sign(&base);
        format!("{base}&signature={sig}")
    }

    // -------------------------------------------------------------------------
    // Request plumbing
    // -------------------------------------------------------------------------

    async fn get_json(&self, url: &str) -> Result<serde_json::Value> {
        if !self.limiter.can_request() {
            anyhow::bail!("request-weight budget exhausted, backing off");
        }

        let resp = self
            .client
            .get(url)
            .send()
            .await
            .with_context(|| format!("GET {url} failed"))?;

        self.limiter.update_from_headers(resp.headers());

        let status = resp.status();
        let body: serde_json::Value = resp.json().await.context("failed to parse response body")?;
        if !status.is_success() {
            anyhow::bail!("Binance returned {status}: {body}");
        }
        Ok(body)
    }

    async fn post_json(&self, url: &str) -> Result<serde_json::Value> {
        if !self.limiter.can_request() {
            anyhow::bail!("request-weight budget exhausted, backing off");
        }

        let resp = self
            .client
            .post(url)
            .send()
            .await
            .with_context(|| format!("POST {url} failed"))?;

        self.limiter.update_from_headers(resp.headers());

        let status = resp.status();
        let body: serde_json::Value = resp.json().await.context("failed to parse response body")?;
        if !status.is_success() {
            anyhow::bail!("Binance returned {status}: {body}");
        }
        Ok(body)
    }

    /// Binance sends numeric values as JSON strings inside kline arrays.
    fn parse_str_f64(val: &serde_json::Value, name: &str) -> Result<f64> {
        match val {
            serde_json::Value::String(s) => s
                .parse::<f64>()
                .with_context(|| format!("failed to parse {name} as f64: {s}")),
            serde_json::Value::Number(n) => n
                .as_f64()
                .with_context(|| format!("field {name} is not a valid f64")),
            _ => anyhow::bail!("field {name} has unexpected JSON type"),
        }
    }

    /// Parse one kline entry.
    ///
    /// Array indices:
    ///   [0] openTime(ms), [1] open, [2] high, [3] low, [4] close,
    ///   [5] volume, [6] closeTime(ms), ...
    fn parse_kline(
        entry: &serde_json::Value,
        symbol: &str,
        timeframe: &str,
        market: MarketType,
    ) -> Result<Bar> {
        let arr = entry.as_array().context("kline entry is not an array")?;
        if arr.len() < 7 {
            anyhow::bail!("malformed kline entry with {} elements", arr.len());
        }

        Ok(Bar {
            symbol: symbol.to_string(),
            timeframe: timeframe.to_string(),
            timestamp: arr[0].as_i64().context("missing open time")? / 1000,
            market_type: market,
            open: Self::parse_str_f64(&arr[1], "open")?,
            high: Self::parse_str_f64(&arr[2], "high")?,
            low: Self::parse_str_f64(&arr[3], "low")?,
            close: Self::parse_str_f64(&arr[4], "close")?,
            volume: Self::parse_str_f64(&arr[5], "volume")?,
        })
    }
}

#[async_trait]
impl Exchange for BinanceExchange {
    async fn fetch_bars(
        &self,
        symbol: &str,
        timeframe: &str,
        since_ts: Option<i64>,
        limit: usize,
        market: MarketType,
    ) -> Result<Vec<Bar>> {
        let native = from_exchange_symbol(symbol);
        let mut url = format!(
            "{}/klines?symbol={}&interval={}&limit={}",
            Self::base_url(market),
            native,
            timeframe,
            limit
        );
        if let Some(since) = since_ts {
            url.push_str(&format!("&startTime={}", since * 1000));
        }

        let body = self.get_json(&url).await?;
        let raw = body.as_array().context("klines response is not an array")?;

        let mut bars = Vec::with_capacity(raw.len());
        for entry in raw {
            match Self::parse_kline(entry, &native, timeframe, market) {
                Ok(bar) if bar.is_valid() => bars.push(bar),
                Ok(bar) => warn!(symbol = %native, ts = bar.timestamp, "dropping invalid bar"),
                Err(e) => warn!(symbol = %native, error = %e, "skipping malformed kline entry"),
            }
        }

        debug!(symbol = %native, timeframe, count = bars.len(), "klines fetched");
        Ok(bars)
    }

    async fn fetch_ticker(&self, symbol: &str) -> Result<Ticker> {
        let native = from_exchange_symbol(symbol);
        let url = format!(
            "{}/ticker/bookTicker?symbol={}",
            Self::base_url(MarketType::Spot),
            native
        );
        let body = self.get_json(&url).await?;

        let bid = Self::parse_str_f64(&body["bidPrice"], "bidPrice")?;
        let ask = Self::parse_str_f64(&body["askPrice"], "askPrice")?;
        Ok(Ticker {
            symbol: native,
            last: (bid + ask) / 2.0,
            bid,
            ask,
            timestamp: chrono::Utc::now().timestamp(),
        })
    }

    async fn fetch_order_book(&self, symbol: &str, limit: usize) -> Result<OrderBook> {
        let native = from_exchange_symbol(symbol);
        let url = format!(
            "{}/depth?symbol={}&limit={}",
            Self::base_url(MarketType::Spot),
            native,
            limit
        );
        let body = self.get_json(&url).await?;

        let parse_levels = |levels: &serde_json::Value| -> Result<Vec<(f64, f64)>> {
            levels
                .as_array()
                .context("depth levels missing")?
                .iter()
                .map(|lvl| {
                    let pair = lvl.as_array().context("level is not an array")?;
                    Ok((
                        Self::parse_str_f64(&pair[0], "price")?,
                        Self::parse_str_f64(&pair[1], "qty")?,
                    ))
                })
                .collect()
        };

        Ok(OrderBook {
            symbol: native,
            bids: parse_levels(&body["bids"])?,
            asks: parse_levels(&body["asks"])?,
            timestamp: chrono::Utc::now().timestamp(),
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
        let native = from_exchange_symbol(symbol);
        let mut params = format!(
            "symbol={}&side={}&type={}&quantity={}",
            native,
            side.to_uppercase(),
            order_type.to_uppercase(),
            amount
        );
        if let Some(p) = price {
            params.push_str(&format!("&price={p}&timeInForce=GTC"));
        }

        let url = format!(
            "{}/order?{}",
            Self::base_url(MarketType::Spot),
            self.signed_query(&params)
        );
        let body = self.post_json(&url).await?;

        Ok(Order {
            id: body["orderId"]
                .as_i64()
                .map(|id| id.to_string())
                .context("order response missing orderId")?,
            symbol: native,
            side: side.to_uppercase(),
            order_type: order_type.to_uppercase(),
            amount,
            price,
            status: body["status"].as_str().unwrap_or("NEW").to_string(),
        })
    }

    async fn cancel_order(&self, order_id: &str, symbol: &str) -> Result<bool> {
        let native = from_exchange_symbol(symbol);
        let params = format!("symbol={native}&orderId={order_id}");
        let url = format!(
            "{}/order?{}",
            Self::base_url(MarketType::Spot),
            self.signed_query(&params)
        );

        let resp = self
            .client
            .delete(&url)
            .send()
            .await
            .context("DELETE /order failed")?;
        self.limiter.update_from_headers(resp.headers());
        Ok(resp.status().is_success())
    }

    async fn fetch_order(&self, order_id: &str, symbol: &str) -> Result<Option<Order>> {
        let native = from_exchange_symbol(symbol);
        let params = format!("symbol={native}&orderId={order_id}");
        let url = format!(
            "{}/order?{}",
            Self::base_url(MarketType::Spot),
            self.signed_query(&params)
        );

        let body = match self.get_json(&url).await {
            Ok(body) => body,
            Err(_) => return Ok(None),
        };

        Ok(Some(Order {
            id: order_id.to_string(),
            symbol: native,
            side: body["side"].as_str().unwrap_or_default().to_string(),
            order_type: body["type"].as_str().unwrap_or_default().to_string(),
            amount: Self::parse_str_f64(&body["origQty"], "origQty").unwrap_or(0.0),
            price: Self::parse_str_f64(&body["price"], "price").ok(),
            status: body["status"].as_str().unwrap_or_default().to_string(),
        }))
    }

    async fn fetch_balance(&self) -> Result<HashMap<String, f64>> {
        let url = format!(
            "{}/account?{}",
            Self::base_url(MarketType::Spot),
            self.signed_query("")
        );
        let body = self.get_json(&url).await?;

        let balances = body["balances"]
            .as_array()
            .context("account response missing 'balances' array")?;

        let mut out = HashMap::new();
        for b in balances {
            let Some(asset) = b["asset"].as_str() else {
                continue;
            };
            let free: f64 = b["free"].as_str().unwrap_or("0").parse().unwrap_or(0.0);
            if free > 0.0 {
                out.insert(asset.to_string(), free);
            }
        }
        Ok(out)
    }
}

// =============================================================================
// Unit Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn kline_entry_parses_to_bar() {
        let entry = json!([
            1_700_000_000_000_i64,
            "37000.00",
            "37050.00",
            "36990.00",
            "37020.00",
            "123.456",
            1_700_003_599_999_i64
        ]);
        let bar =
            BinanceExchange::parse_kline(&entry, "BTCUSDT", "1h", MarketType::Future).unwrap();
        assert_eq!(bar.timestamp, 1_700_000_000);
        assert_eq!(bar.market_type, MarketType::Future);
        assert!((bar.close - 37_020.0).abs() < f64::EPSILON);
        assert!(bar.is_valid());
    }

    #[test]
    fn short_kline_entry_rejected() {
        let entry = json!([1_700_000_000_000_i64, "1", "2"]);
        assert!(BinanceExchange::parse_kline(&entry, "BTCUSDT", "1h", MarketType::Spot).is_err());
    }

    #[test]
    fn signature_is_stable_hex() {
        let ex = BinanceExchange::new("key", "secret", None, None).unwrap();
        let sig = ex.sign("symbol=BTCUSDT&side=BUY");
        assert_eq!(sig.len(), 64);
        assert!(sig.chars().all(|c| c.is_ascii_hexdigit()));
        assert_eq!(sig, ex.sign("symbol=BTCUSDT&side=BUY"));
    }

    #[test]
    fn market_routing() {
        assert!(BinanceExchange::base_url(MarketType::Spot).contains("api.binance.com"));
        assert!(BinanceExchange::base_url(MarketType::Future).contains("fapi"));
        assert!(BinanceExchange::base_url(MarketType::Delivery).contains("dapi"));
    }
}

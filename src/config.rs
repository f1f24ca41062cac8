// =============================================================================
// Engine Configuration — environment-driven settings
// =============================================================================
//
// Every tunable lives here and is resolved once in main(); components receive
// the values they need through their constructors. No module reads the
// environment on its own.
// =============================================================================

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::types::MarketType;

/// Prefix shared by all environment variables.
const ENV_PREFIX: &str = "MERIDIAN_";

/// Full engine configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Symbols to track, internal format (e.g. "BTCUSDT").
    pub symbols: Vec<String>,
    /// Timeframes to track (e.g. "1h").
    pub timeframes: Vec<String>,
    pub market_type: MarketType,

    /// Producer fetch interval in seconds.
    pub fetch_interval_sec: u64,
    /// Write-buffer size that triggers an immediate flush.
    pub buffer_size: usize,
    /// Periodic flush interval in seconds.
    pub flush_interval_sec: u64,

    /// Run a repair pass before starting the producer.
    pub auto_repair_on_start: bool,
    /// Bar look-back for the startup repair, in hours.
    pub repair_hours_back_on_startup: f64,
    /// Bar look-back for the deep `repair` command, in days.
    pub repair_days_back: f64,
    /// Indicator sample budget per series for the deep repair.
    pub repair_klines_count: usize,

    /// Simulated account balance for back-tests and the dev pipeline.
    pub initial_balance: f64,

    /// HTTP API listen address.
    pub api_addr: String,

    /// Exchange credentials; empty means public endpoints only.
    pub api_key: String,
    pub api_secret: String,
    /// Optional HTTP proxy for exchange calls.
    pub proxy_host: Option<String>,
    pub proxy_port: Option<u16>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            symbols: vec!["BTCUSDT".into(), "ETHUSDT".into()],
            timeframes: vec!["1h".into()],
            market_type: MarketType::Spot,
            fetch_interval_sec: 5,
            buffer_size: 100,
            flush_interval_sec: 10,
            auto_repair_on_start: false,
            repair_hours_back_on_startup: 1.0,
            repair_days_back: 30.0,
            repair_klines_count: 500,
            initial_balance: 10_000.0,
            api_addr: "127.0.0.1:8900".into(),
            api_key: String::new(),
            api_secret: String::new(),
            proxy_host: None,
            proxy_port: None,
        }
    }
}

impl Config {
    /// Resolve the configuration from the environment on top of defaults.
    ///
    /// Malformed numeric values fall back to the default with a warning
    /// rather than aborting startup; a malformed market type is an error
    /// because every store key and bus subject depends on it.
    pub fn from_env() -> Result<Self> {
        let mut cfg = Self::default();

        if let Some(raw) = env_var("SYMBOLS") {
            let symbols: Vec<String> = raw
                .split(',')
                .map(|s| s.trim().to_uppercase())
                .filter(|s| !s.is_empty())
                .collect();
            if !symbols.is_empty() {
                cfg.symbols = symbols;
            }
        }
        if let Some(raw) = env_var("TIMEFRAMES") {
            let tfs: Vec<String> = raw
                .split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect();
            if !tfs.is_empty() {
                cfg.timeframes = tfs;
            }
        }
        if let Some(raw) = env_var("MARKET_TYPE") {
            cfg.market_type = raw
                .parse()
                .with_context(|| format!("invalid {ENV_PREFIX}MARKET_TYPE: {raw}"))?;
        }

        parse_into(&mut cfg.fetch_interval_sec, "FETCH_INTERVAL_SEC");
        parse_into(&mut cfg.buffer_size, "BUFFER_SIZE");
        parse_into(&mut cfg.flush_interval_sec, "FLUSH_INTERVAL_SEC");
        parse_into(&mut cfg.auto_repair_on_start, "AUTO_REPAIR_ON_START");
        parse_into(&mut cfg.repair_hours_back_on_startup, "REPAIR_HOURS_BACK_ON_STARTUP");
        parse_into(&mut cfg.repair_days_back, "REPAIR_DAYS_BACK");
        parse_into(&mut cfg.repair_klines_count, "REPAIR_KLINES_COUNT");
        parse_into(&mut cfg.initial_balance, "INITIAL_BALANCE");

        if let Some(addr) = env_var("API_ADDR") {
            cfg.api_addr = addr;
        }
        if let Some(key) = env_var("API_KEY") {
            cfg.api_key = key;
        }
        if let Some(secret) = env_var("API_SECRET") {
            cfg.api_secret = secret;
        }
        cfg.proxy_host = env_var("PROXY_HOST");
        if let Some(raw) = env_var("PROXY_PORT") {
            match raw.parse() {
                Ok(port) => cfg.proxy_port = Some(port),
                Err(_) => warn!(value = %raw, "ignoring unparseable proxy port"),
            }
        }

        Ok(cfg)
    }
}

fn env_var(suffix: &str) -> Option<String> {
    std::env::var(format!("{ENV_PREFIX}{suffix}"))
        .ok()
        .filter(|v| !v.is_empty())
}

/// Parse an env var into `slot`, keeping the current value on parse failure.
fn parse_into<T: std::str::FromStr>(slot: &mut T, suffix: &str) {
    if let Some(raw) = env_var(suffix) {
        match raw.parse() {
            Ok(v) => *slot = v,
            Err(_) => warn!(
                var = %format!("{ENV_PREFIX}{suffix}"),
                value = %raw,
                "ignoring unparseable config value"
            ),
        }
    }
}

// =============================================================================
// Unit Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let cfg = Config::default();
        assert_eq!(cfg.fetch_interval_sec, 5);
        assert_eq!(cfg.buffer_size, 100);
        assert_eq!(cfg.flush_interval_sec, 10);
        assert_eq!(cfg.market_type, MarketType::Spot);
        assert!(!cfg.auto_repair_on_start);
        assert_eq!(cfg.initial_balance, 10_000.0);
    }

    #[test]
    fn env_overrides() {
        // One test owns every env mutation: parallel tests sharing the
        // process environment would race otherwise.
        std::env::set_var("MERIDIAN_SYMBOLS", "btcusdt, ethusdt ,,");
        std::env::set_var("MERIDIAN_FETCH_INTERVAL_SEC", "not-a-number");
        let cfg = Config::from_env().unwrap();
        assert_eq!(cfg.symbols, vec!["BTCUSDT".to_string(), "ETHUSDT".to_string()]);
        // Unparseable numerics keep the default instead of aborting.
        assert_eq!(cfg.fetch_interval_sec, 5);

        std::env::set_var("MERIDIAN_MARKET_TYPE", "margin");
        assert!(Config::from_env().is_err());

        std::env::remove_var("MERIDIAN_SYMBOLS");
        std::env::remove_var("MERIDIAN_FETCH_INTERVAL_SEC");
        std::env::remove_var("MERIDIAN_MARKET_TYPE");
    }
}

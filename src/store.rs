// =============================================================================
// Store — persistence interface + in-memory implementation
// =============================================================================
//
// The SQL store is an external collaborator; the engine only depends on this
// trait. Every key carries the market type explicitly — no process-wide
// market context exists anywhere in the engine.
//
// MemoryStore backs every test and the `all` development command. It keeps
// one BTreeMap per series so ascending-timestamp reads come for free and
// UPSERTs are plain map inserts.
// =============================================================================

use std::collections::{BTreeMap, HashMap};

use anyhow::Result;
use async_trait::async_trait;
use parking_lot::RwLock;

use crate::types::{Bar, IndicatorVector, MarketType, SeriesKey, Signal};

/// Persistence operations required by the data plane.
///
/// `bulk_upsert_bars` and `insert_indicator` are idempotent on the
/// (symbol, timeframe, timestamp, market) key: re-inserting a duplicate
/// replaces the stored row with the newer fields.
#[async_trait]
pub trait Store: Send + Sync {
    /// Insert or replace bars; returns the number of rows written.
    async fn bulk_upsert_bars(&self, bars: &[Bar]) -> Result<usize>;

    /// Timestamp of the newest bar in the series, if any.
    async fn last_bar_ts(
        &self,
        symbol: &str,
        timeframe: &str,
        market: MarketType,
    ) -> Result<Option<i64>>;

    /// Number of bars stored for the series.
    async fn count_bars(&self, symbol: &str, timeframe: &str, market: MarketType)
        -> Result<usize>;

    /// The most recent `limit` bars, ascending by timestamp. With `before_ts`
    /// only bars with `ts <= before_ts` are considered (inclusive so the bar
    /// at a repair target timestamp is part of its own preheat window).
    async fn recent_bars(
        &self,
        symbol: &str,
        timeframe: &str,
        limit: usize,
        before_ts: Option<i64>,
        market: MarketType,
    ) -> Result<Vec<Bar>>;

    /// Insert or replace one indicator vector.
    async fn insert_indicator(&self, vector: &IndicatorVector) -> Result<()>;

    /// The indicator vector at an exact timestamp, if present.
    async fn indicator_at(
        &self,
        symbol: &str,
        timeframe: &str,
        timestamp: i64,
        market: MarketType,
    ) -> Result<Option<IndicatorVector>>;

    /// The most recent `limit` indicator vectors, ascending by timestamp.
    async fn recent_indicators(
        &self,
        symbol: &str,
        timeframe: &str,
        limit: usize,
        market: MarketType,
    ) -> Result<Vec<IndicatorVector>>;

    /// Append a signal.
    async fn insert_signal(&self, signal: &Signal) -> Result<()>;

    /// The most recent `limit` signals for a strategy (optionally one
    /// symbol), newest first.
    async fn recent_signals(
        &self,
        strategy: &str,
        symbol: Option<&str>,
        limit: usize,
    ) -> Result<Vec<Signal>>;
}

// ---------------------------------------------------------------------------
// MemoryStore
// ---------------------------------------------------------------------------

#[derive(Default)]
struct MemoryInner {
    bars: HashMap<SeriesKey, BTreeMap<i64, Bar>>,
    indicators: HashMap<SeriesKey, BTreeMap<i64, IndicatorVector>>,
    signals: Vec<Signal>,
}

/// Thread-safe in-memory store.
#[derive(Default)]
pub struct MemoryStore {
    inner: RwLock<MemoryInner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn bulk_upsert_bars(&self, bars: &[Bar]) -> Result<usize> {
        let mut inner = self.inner.write();
        for bar in bars {
            let key = SeriesKey::new(&bar.symbol, &bar.timeframe, bar.market_type);
            inner.bars.entry(key).or_default().insert(bar.timestamp, bar.clone());
        }
        Ok(bars.len())
    }

    async fn last_bar_ts(
        &self,
        symbol: &str,
        timeframe: &str,
        market: MarketType,
    ) -> Result<Option<i64>> {
        let inner = self.inner.read();
        let key = SeriesKey::new(symbol, timeframe, market);
        Ok(inner
            .bars
            .get(&key)
            .and_then(|series| series.keys().next_back().copied()))
    }

    async fn count_bars(
        &self,
        symbol: &str,
        timeframe: &str,
        market: MarketType,
    ) -> Result<usize> {
        let inner = self.inner.read();
        let key = SeriesKey::new(symbol, timeframe, market);
        Ok(inner.bars.get(&key).map_or(0, BTreeMap::len))
    }

    async fn recent_bars(
        &self,
        symbol: &str,
        timeframe: &str,
        limit: usize,
        before_ts: Option<i64>,
        market: MarketType,
    ) -> Result<Vec<Bar>> {
        let inner = self.inner.read();
        let key = SeriesKey::new(symbol, timeframe, market);
        let Some(series) = inner.bars.get(&key) else {
            return Ok(Vec::new());
        };
        let mut selected: Vec<Bar> = match before_ts {
            Some(cutoff) => series.range(..=cutoff).rev().take(limit).map(|(_, b)| b.clone()).collect(),
            None => series.iter().rev().take(limit).map(|(_, b)| b.clone()).collect(),
        };
        selected.reverse();
        Ok(selected)
    }

    async fn insert_indicator(&self, vector: &IndicatorVector) -> Result<()> {
        let mut inner = self.inner.write();
        let key = SeriesKey::new(&vector.symbol, &vector.timeframe, vector.market_type);
        inner
            .indicators
            .entry(key)
            .or_default()
            .insert(vector.timestamp, vector.clone());
        Ok(())
    }

    async fn indicator_at(
        &self,
        symbol: &str,
        timeframe: &str,
        timestamp: i64,
        market: MarketType,
    ) -> Result<Option<IndicatorVector>> {
        let inner = self.inner.read();
        let key = SeriesKey::new(symbol, timeframe, market);
        Ok(inner
            .indicators
            .get(&key)
            .and_then(|series| series.get(&timestamp).cloned()))
    }

    async fn recent_indicators(
        &self,
        symbol: &str,
        timeframe: &str,
        limit: usize,
        market: MarketType,
    ) -> Result<Vec<IndicatorVector>> {
        let inner = self.inner.read();
        let key = SeriesKey::new(symbol, timeframe, market);
        let Some(series) = inner.indicators.get(&key) else {
            return Ok(Vec::new());
        };
        let mut selected: Vec<IndicatorVector> =
            series.iter().rev().take(limit).map(|(_, v)| v.clone()).collect();
        selected.reverse();
        Ok(selected)
    }

    async fn insert_signal(&self, signal: &Signal) -> Result<()> {
        self.inner.write().signals.push(signal.clone());
        Ok(())
    }

    async fn recent_signals(
        &self,
        strategy: &str,
        symbol: Option<&str>,
        limit: usize,
    ) -> Result<Vec<Signal>> {
        let inner = self.inner.read();
        Ok(inner
            .signals
            .iter()
            .rev()
            .filter(|s| s.strategy_name == strategy)
            .filter(|s| symbol.map_or(true, |sym| s.symbol == sym))
            .take(limit)
            .cloned()
            .collect())
    }
}

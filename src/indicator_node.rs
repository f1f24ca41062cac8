// =============================================================================
// Indicator Node — per-series incremental indicator computation
// =============================================================================
//
// Subscribes to bar.*.*.<market> for each configured market. On the first
// bar of a series it preheats a fresh CalculatorSet from stored history (the
// ONLY store read after bootstrap), then every further bar is an O(1)
// update: compute, persist, publish to ind.<sym>.<tf>.
//
// A single update taking longer than 10 ms trips a warning — the hot path
// must stay flat no matter how many series are live.
// =============================================================================

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context, Result};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::bus::MessageBus;
use crate::indicators::{max_required_bars, min_required_bars, CalculatorSet};
use crate::store::Store;
use crate::types::{subjects, Bar, MarketType, SeriesKey};

/// Hot-path budget per update, milliseconds.
const SLOW_UPDATE_MS: u128 = 10;

/// Per-node performance counters.
#[derive(Debug, Clone, Copy, Default)]
pub struct IndicatorNodeStats {
    pub vectors_emitted: u64,
    pub preheats: u64,
    pub skipped_cold: u64,
}

/// The indicator node. One instance serves every configured market.
pub struct IndicatorNode {
    bus: MessageBus,
    store: Arc<dyn Store>,
    markets: Vec<MarketType>,
    calculators: HashMap<SeriesKey, CalculatorSet>,
    stats: IndicatorNodeStats,
}

impl IndicatorNode {
    pub fn new(bus: MessageBus, store: Arc<dyn Store>, markets: Vec<MarketType>) -> Self {
        info!(
            markets = markets.len(),
            preheat_bars = max_required_bars(),
            min_bars = min_required_bars(),
            "indicator node created"
        );
        Self {
            bus,
            store,
            markets,
            calculators: HashMap::new(),
            stats: IndicatorNodeStats::default(),
        }
    }

    pub fn stats(&self) -> IndicatorNodeStats {
        self.stats
    }

    /// Process one bar: lazily preheat the series, then update, persist, and
    /// publish the indicator vector. Returns the vector when one was emitted.
    pub async fn process_bar(&mut self, bar: &Bar) -> Result<Option<crate::types::IndicatorVector>> {
        let key = SeriesKey::new(&bar.symbol, &bar.timeframe, bar.market_type);

        if !self.calculators.contains_key(&key) {
            if !self.preheat(&key, bar.timestamp).await? {
                self.stats.skipped_cold += 1;
                return Ok(None);
            }
        }

        let started = Instant::now();
        let calculator = self
            .calculators
            .get_mut(&key)
            .expect("calculator exists after preheat");
        let vector = calculator.update(bar);
        let elapsed_ms = started.elapsed().as_millis();
        if elapsed_ms > SLOW_UPDATE_MS {
            warn!(key = %key, elapsed_ms, "indicator update exceeded hot-path budget");
        }

        self.store
            .insert_indicator(&vector)
            .await
            .with_context(|| format!("failed to persist indicator for {key}"))?;

        let subject = subjects::indicator(&bar.symbol, &bar.timeframe);
        match serde_json::to_value(&vector) {
            Ok(payload) => self.bus.publish(&subject, payload),
            Err(e) => warn!(key = %key, error = %e, "failed to serialize indicator vector"),
        }

        self.stats.vectors_emitted += 1;
        Ok(Some(vector))
    }

    /// Build and warm a fresh calculator from history strictly before
    /// `live_ts` (the incoming live bar is fed by the caller). Returns false
    /// when the series is still too cold to bother.
    async fn preheat(&mut self, key: &SeriesKey, live_ts: i64) -> Result<bool> {
        let history = self
            .store
            .recent_bars(
                &key.symbol,
                &key.timeframe,
                max_required_bars(),
                Some(live_ts - 1),
                key.market_type,
            )
            .await
            .with_context(|| format!("preheat read failed for {key}"))?;

        if history.len() < min_required_bars() {
            debug!(
                key = %key,
                available = history.len(),
                needed = min_required_bars(),
                "not enough history yet, skipping series"
            );
            return Ok(false);
        }

        let mut calculator = CalculatorSet::new();
        for bar in &history {
            calculator.update(bar);
        }
        info!(key = %key, bars = history.len(), "calculator preheated");
        self.calculators.insert(key.clone(), calculator);
        self.stats.preheats += 1;
        Ok(true)
    }

    /// Subscribe to bar subjects and process until `shutdown` flips.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        // Merge the per-market subscriptions into one channel so the node
        // body stays a single ordered loop.
        let (tx, mut rx) = tokio::sync::mpsc::channel::<(String, serde_json::Value)>(1024);
        for market in &self.markets {
            let mut sub = self.bus.subscribe(&format!("bar.*.*.{market}"));
            let tx = tx.clone();
            tokio::spawn(async move {
                while let Some(msg) = sub.recv().await {
                    if tx.send(msg).await.is_err() {
                        break;
                    }
                }
            });
        }
        drop(tx);

        info!(markets = self.markets.len(), "indicator node running");

        loop {
            tokio::select! {
                msg = rx.recv() => {
                    let Some((subject, payload)) = msg else { break };
                    match serde_json::from_value::<Bar>(payload) {
                        Ok(bar) => {
                            if let Err(e) = self.process_bar(&bar).await {
                                warn!(subject = %subject, error = %e, "bar processing failed");
                            }
                        }
                        Err(e) => warn!(subject = %subject, error = %e, "undecodable bar payload"),
                    }
                }
                _ = shutdown.changed() => break,
            }
        }

        info!(emitted = self.stats.vectors_emitted, "indicator node stopped");
        Ok(())
    }
}

// =============================================================================
// Unit Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    fn bar(ts: i64, close: f64) -> Bar {
        Bar {
            symbol: "BTCUSDT".into(),
            timeframe: "1h".into(),
            timestamp: ts,
            market_type: MarketType::Spot,
            open: close,
            high: close + 1.0,
            low: close - 1.0,
            close,
            volume: 10.0,
        }
    }

    async fn seeded_store(count: i64) -> Arc<MemoryStore> {
        let store = Arc::new(MemoryStore::new());
        let bars: Vec<Bar> = (0..count).map(|i| bar(i * 3_600, 100.0 + i as f64 * 0.1)).collect();
        store.bulk_upsert_bars(&bars).await.unwrap();
        store
    }

    #[tokio::test]
    async fn cold_series_is_skipped() {
        let store = seeded_store(2).await; // below min_required_bars
        let mut node = IndicatorNode::new(MessageBus::new(), store, vec![MarketType::Spot]);

        let out = node.process_bar(&bar(10 * 3_600, 101.0)).await.unwrap();
        assert!(out.is_none());
        assert_eq!(node.stats().skipped_cold, 1);
        assert_eq!(node.stats().preheats, 0);
    }

    #[tokio::test]
    async fn preheat_then_emit_and_persist() {
        let store = seeded_store(130).await;
        let bus = MessageBus::new();
        let mut sub = bus.subscribe("ind.BTCUSDT.1h");
        let mut node = IndicatorNode::new(bus, store.clone(), vec![MarketType::Spot]);

        let live = bar(130 * 3_600, 113.0);
        let out = node.process_bar(&live).await.unwrap().unwrap();

        // All 120-bar indicators are warm after a 130-bar preheat.
        assert!(out.ma120.is_some());
        assert!(out.rsi14.is_some());
        assert_eq!(out.timestamp, live.timestamp);
        assert_eq!(node.stats().preheats, 1);

        // Vector was persisted and published.
        let stored = store
            .indicator_at("BTCUSDT", "1h", live.timestamp, MarketType::Spot)
            .await
            .unwrap();
        assert!(stored.is_some());
        let (subject, payload) = sub.recv().await.unwrap();
        assert_eq!(subject, "ind.BTCUSDT.1h");
        assert_eq!(payload["timestamp"], live.timestamp);
    }

    #[tokio::test]
    async fn preheat_happens_once_per_series() {
        let store = seeded_store(130).await;
        let mut node = IndicatorNode::new(MessageBus::new(), store, vec![MarketType::Spot]);

        node.process_bar(&bar(130 * 3_600, 113.0)).await.unwrap();
        node.process_bar(&bar(131 * 3_600, 113.5)).await.unwrap();
        node.process_bar(&bar(132 * 3_600, 114.0)).await.unwrap();

        assert_eq!(node.stats().preheats, 1);
        assert_eq!(node.stats().vectors_emitted, 3);
    }

    #[tokio::test]
    async fn preheated_series_matches_straight_replay() {
        // Preheat from the store + one live update must equal feeding the
        // whole history through a single calculator.
        let store = seeded_store(130).await;
        let mut node = IndicatorNode::new(MessageBus::new(), store.clone(), vec![MarketType::Spot]);
        let live = bar(130 * 3_600, 113.0);
        let via_node = node.process_bar(&live).await.unwrap().unwrap();

        let mut reference = CalculatorSet::new();
        let history = store
            .recent_bars("BTCUSDT", "1h", 130, None, MarketType::Spot)
            .await
            .unwrap();
        // Node preheats from at most max_required_bars of history.
        for b in history.iter().skip(history.len().saturating_sub(max_required_bars())) {
            reference.update(b);
        }
        let via_reference = reference.update(&live);

        assert!((via_node.ma20.unwrap() - via_reference.ma20.unwrap()).abs() < 1e-9);
        assert!((via_node.rsi14.unwrap() - via_reference.rsi14.unwrap()).abs() < 1e-9);
    }

    #[tokio::test]
    async fn distinct_markets_get_distinct_calculators() {
        let store = Arc::new(MemoryStore::new());
        for market in [MarketType::Spot, MarketType::Future] {
            let bars: Vec<Bar> = (0..130)
                .map(|i| {
                    let mut b = bar(i * 3_600, 100.0);
                    b.market_type = market;
                    b
                })
                .collect();
            store.bulk_upsert_bars(&bars).await.unwrap();
        }
        let mut node = IndicatorNode::new(
            MessageBus::new(),
            store,
            vec![MarketType::Spot, MarketType::Future],
        );

        let mut spot = bar(130 * 3_600, 100.0);
        spot.market_type = MarketType::Spot;
        let mut fut = bar(130 * 3_600, 100.0);
        fut.market_type = MarketType::Future;

        node.process_bar(&spot).await.unwrap();
        node.process_bar(&fut).await.unwrap();
        assert_eq!(node.stats().preheats, 2);
    }
}

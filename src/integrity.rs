// =============================================================================
// Data-Integrity Service — gap detection and repair for bars and indicators
// =============================================================================
//
// Two detectors, two fillers:
//   - bar gaps: expected interval grid minus observed timestamps, merged
//     into [start, end] ranges (1.5x interval tolerance); filled from the
//     exchange in windows of up to 1500 bars with a 200 ms pause between
//     ranges to respect rate limits,
//   - indicator gaps: timestamps where a bar exists but no vector does;
//     filled by replaying a fresh CalculatorSet over the preceding history
//     (skipped when fewer than 120 bars precede the hole).
//
// check_and_repair_all applies two independent policies: bars by time
// window (days_back), indicators by sample budget (klines_count). Each
// range/timestamp repair is independent — one failure never aborts the rest.
// =============================================================================

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::exchange::Exchange;
use crate::indicators::{max_required_bars, CalculatorSet};
use crate::store::Store;
use crate::types::{timeframe_secs, MarketType};

/// Widest fetch window the exchange allows for historical bars.
const BACKFILL_WINDOW: usize = 1500;
/// Pause between range fetches.
const RANGE_PAUSE: Duration = Duration::from_millis(200);
/// Bars a fresh calculator needs before a repaired vector is trustworthy.
const MIN_REPLAY_BARS: usize = 120;
/// Upper bound on how many stored rows a detector scans per series.
const SCAN_LIMIT: usize = 100_000;

/// Outcome of a full check-and-repair pass.
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct IntegritySummary {
    pub bar_gaps_found: usize,
    pub bars_filled: usize,
    pub indicator_gaps_found: usize,
    pub indicators_filled: usize,
}

/// Repair policies for one pass. `None` disables that detector.
#[derive(Debug, Clone, Copy, Default)]
pub struct RepairPolicy {
    /// Bars: temporal continuity over the trailing window, in days.
    pub bar_days_back: Option<f64>,
    /// Indicators: uniform sample budget per series, in bars.
    pub indicator_klines_count: Option<usize>,
}

pub struct DataIntegrityService {
    store: Arc<dyn Store>,
    exchange: Arc<dyn Exchange>,
}

impl DataIntegrityService {
    pub fn new(store: Arc<dyn Store>, exchange: Arc<dyn Exchange>) -> Self {
        Self { store, exchange }
    }

    // -------------------------------------------------------------------------
    // Top level
    // -------------------------------------------------------------------------

    /// Check and repair every (symbol, timeframe) pair under the policy.
    pub async fn check_and_repair_all(
        &self,
        symbols: &[String],
        timeframes: &[String],
        market: MarketType,
        policy: RepairPolicy,
    ) -> IntegritySummary {
        let now = chrono::Utc::now().timestamp();
        let mut summary = IntegritySummary::default();

        info!(
            symbols = symbols.len(),
            timeframes = timeframes.len(),
            market = %market,
            bar_days_back = ?policy.bar_days_back,
            indicator_klines_count = ?policy.indicator_klines_count,
            "integrity check starting"
        );

        for symbol in symbols {
            for timeframe in timeframes {
                if let Some(days_back) = policy.bar_days_back {
                    match self.repair_bars(symbol, timeframe, days_back, market, now).await {
                        Ok((gaps, filled)) => {
                            summary.bar_gaps_found += gaps;
                            summary.bars_filled += filled;
                        }
                        Err(e) => warn!(symbol = %symbol, timeframe = %timeframe, error = %e, "bar repair failed"),
                    }
                }
                if let Some(count) = policy.indicator_klines_count {
                    match self.repair_indicators_by_count(symbol, timeframe, count, market).await {
                        Ok((gaps, filled)) => {
                            summary.indicator_gaps_found += gaps;
                            summary.indicators_filled += filled;
                        }
                        Err(e) => warn!(symbol = %symbol, timeframe = %timeframe, error = %e, "indicator repair failed"),
                    }
                }
            }
        }

        info!(
            bar_gaps = summary.bar_gaps_found,
            bars_filled = summary.bars_filled,
            indicator_gaps = summary.indicator_gaps_found,
            indicators_filled = summary.indicators_filled,
            "integrity check complete"
        );
        summary
    }

    async fn repair_bars(
        &self,
        symbol: &str,
        timeframe: &str,
        days_back: f64,
        market: MarketType,
        now: i64,
    ) -> Result<(usize, usize)> {
        let gaps = self
            .detect_bar_gaps_at(symbol, timeframe, days_back, market, now)
            .await?;
        if gaps.is_empty() {
            return Ok((0, 0));
        }
        warn!(symbol, timeframe, gaps = gaps.len(), "bar gaps detected");
        let filled = self.backfill_bars(symbol, timeframe, &gaps, market).await;
        Ok((gaps.len(), filled))
    }

    async fn repair_indicators_by_count(
        &self,
        symbol: &str,
        timeframe: &str,
        klines_count: usize,
        market: MarketType,
    ) -> Result<(usize, usize)> {
        let missing = self
            .detect_indicator_gaps_by_count(symbol, timeframe, klines_count, market)
            .await?;
        if missing.is_empty() {
            return Ok((0, 0));
        }
        warn!(symbol, timeframe, missing = missing.len(), "indicator gaps detected");
        let filled = self.backfill_indicators(symbol, timeframe, &missing, market).await;
        Ok((missing.len(), filled))
    }

    // -------------------------------------------------------------------------
    // Bar gaps
    // -------------------------------------------------------------------------

    /// Detect missing bars in [now - days_back, now] as merged ranges.
    pub async fn detect_bar_gaps(
        &self,
        symbol: &str,
        timeframe: &str,
        days_back: f64,
        market: MarketType,
    ) -> Result<Vec<(i64, i64)>> {
        let now = chrono::Utc::now().timestamp();
        self.detect_bar_gaps_at(symbol, timeframe, days_back, market, now).await
    }

    async fn detect_bar_gaps_at(
        &self,
        symbol: &str,
        timeframe: &str,
        days_back: f64,
        market: MarketType,
        now: i64,
    ) -> Result<Vec<(i64, i64)>> {
        let interval = timeframe_secs(timeframe);
        let start = now - (days_back * 86_400.0) as i64;

        let existing = self
            .store
            .recent_bars(symbol, timeframe, SCAN_LIMIT, None, market)
            .await
            .context("reading stored bars for gap detection")?;

        if existing.is_empty() {
            debug!(symbol, timeframe, "no stored bars, whole window is one gap");
            return Ok(vec![(start, now)]);
        }

        let observed: std::collections::HashSet<i64> =
            existing.iter().map(|b| b.timestamp).collect();

        // Expected grid, aligned to the interval boundary.
        let mut missing = Vec::new();
        let mut ts = start / interval * interval;
        while ts <= now {
            if ts >= start && !observed.contains(&ts) {
                missing.push(ts);
            }
            ts += interval;
        }

        Ok(merge_to_ranges(&missing, interval))
    }

    /// Fill each gap range from the exchange. Returns bars written; a range
    /// that fails is logged and skipped.
    pub async fn backfill_bars(
        &self,
        symbol: &str,
        timeframe: &str,
        gaps: &[(i64, i64)],
        market: MarketType,
    ) -> usize {
        let interval = timeframe_secs(timeframe);
        let mut total = 0;

        for (range_start, range_end) in gaps {
            let mut since = *range_start;
            loop {
                let window = ((range_end - since) / interval + 1).clamp(1, BACKFILL_WINDOW as i64);
                let bars = match self
                    .exchange
                    .fetch_bars(symbol, timeframe, Some(since), window as usize, market)
                    .await
                {
                    Ok(bars) => bars,
                    Err(e) => {
                        warn!(
                            symbol,
                            timeframe,
                            range_start,
                            range_end,
                            error = %e,
                            "backfill fetch failed, skipping range"
                        );
                        break;
                    }
                };
                if bars.is_empty() {
                    break;
                }

                let in_range: Vec<_> = bars
                    .iter()
                    .filter(|b| b.timestamp <= *range_end)
                    .cloned()
                    .collect();
                let batch_max = bars.iter().map(|b| b.timestamp).max().unwrap_or(*range_end);

                if !in_range.is_empty() {
                    match self.store.bulk_upsert_bars(&in_range).await {
                        Ok(written) => total += written,
                        Err(e) => {
                            warn!(symbol, timeframe, error = %e, "backfill persist failed");
                            break;
                        }
                    }
                }

                if batch_max >= *range_end {
                    break;
                }
                since = batch_max + interval;
            }

            tokio::time::sleep(RANGE_PAUSE).await;
        }

        info!(symbol, timeframe, filled = total, "bar backfill done");
        total
    }

    // -------------------------------------------------------------------------
    // Indicator gaps
    // -------------------------------------------------------------------------

    /// Timestamps in [now - days_back, now] with a bar but no vector.
    pub async fn detect_indicator_gaps(
        &self,
        symbol: &str,
        timeframe: &str,
        days_back: f64,
        market: MarketType,
    ) -> Result<Vec<i64>> {
        let cutoff = chrono::Utc::now().timestamp() - (days_back * 86_400.0) as i64;
        let bars = self
            .store
            .recent_bars(symbol, timeframe, SCAN_LIMIT, None, market)
            .await?;
        let bar_ts: Vec<i64> = bars
            .iter()
            .map(|b| b.timestamp)
            .filter(|ts| *ts >= cutoff)
            .collect();
        self.missing_vectors(symbol, timeframe, bar_ts, market).await
    }

    /// The last `klines_count` bar timestamps lacking a vector.
    pub async fn detect_indicator_gaps_by_count(
        &self,
        symbol: &str,
        timeframe: &str,
        klines_count: usize,
        market: MarketType,
    ) -> Result<Vec<i64>> {
        let bars = self
            .store
            .recent_bars(symbol, timeframe, klines_count, None, market)
            .await?;
        let bar_ts: Vec<i64> = bars.iter().map(|b| b.timestamp).collect();
        self.missing_vectors(symbol, timeframe, bar_ts, market).await
    }

    async fn missing_vectors(
        &self,
        symbol: &str,
        timeframe: &str,
        bar_ts: Vec<i64>,
        market: MarketType,
    ) -> Result<Vec<i64>> {
        if bar_ts.is_empty() {
            return Ok(Vec::new());
        }
        let vectors = self
            .store
            .recent_indicators(symbol, timeframe, SCAN_LIMIT, market)
            .await?;
        let have: std::collections::HashSet<i64> = vectors.iter().map(|v| v.timestamp).collect();

        let mut missing: Vec<i64> = bar_ts.into_iter().filter(|ts| !have.contains(ts)).collect();
        missing.sort_unstable();
        Ok(missing)
    }

    /// Recompute vectors at the missing timestamps by replaying history
    /// through a fresh calculator. Returns vectors written.
    pub async fn backfill_indicators(
        &self,
        symbol: &str,
        timeframe: &str,
        missing: &[i64],
        market: MarketType,
    ) -> usize {
        let mut filled = 0;
        let mut skipped = 0;

        for &ts in missing {
            let history = match self
                .store
                .recent_bars(symbol, timeframe, max_required_bars() + 80, Some(ts), market)
                .await
            {
                Ok(history) => history,
                Err(e) => {
                    warn!(symbol, timeframe, ts, error = %e, "history read failed");
                    skipped += 1;
                    continue;
                }
            };

            // The replay must end on the bar at the hole itself.
            if history.len() < MIN_REPLAY_BARS
                || history.last().map(|b| b.timestamp) != Some(ts)
            {
                debug!(
                    symbol,
                    timeframe,
                    ts,
                    available = history.len(),
                    "insufficient preceding bars, skipping"
                );
                skipped += 1;
                continue;
            }

            let mut calculator = CalculatorSet::new();
            let mut vector = None;
            for bar in &history {
                vector = Some(calculator.update(bar));
            }

            let Some(vector) = vector else {
                skipped += 1;
                continue;
            };
            match self.store.insert_indicator(&vector).await {
                Ok(()) => filled += 1,
                Err(e) => {
                    warn!(symbol, timeframe, ts, error = %e, "vector persist failed");
                    skipped += 1;
                }
            }
        }

        info!(symbol, timeframe, filled, skipped, "indicator backfill done");
        filled
    }
}

/// Merge sorted missing timestamps into [start, end] ranges. Two holes join
/// the same range when they are at most 1.5 intervals apart.
fn merge_to_ranges(missing: &[i64], interval: i64) -> Vec<(i64, i64)> {
    let tolerance = interval + interval / 2;
    let mut ranges: Vec<(i64, i64)> = Vec::new();

    for &ts in missing {
        match ranges.last_mut() {
            Some((_, end)) if ts - *end <= tolerance => *end = ts,
            _ => ranges.push((ts, ts)),
        }
    }
    ranges
}

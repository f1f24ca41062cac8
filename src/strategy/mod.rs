// =============================================================================
// Strategy Runtime — position-aware state machine over (bar, indicator) pairs
// =============================================================================
//
// The runtime owns per-symbol state: latest bar, current + previous
// indicator vector, and at most one open position. A decision is evaluated
// only when the bar and indicator share a timestamp and a previous indicator
// exists — strict temporal alignment.
//
// Decision pipeline per aligned pair:
//   1. position open  -> default exits (stop loss, take profit, trailing),
//                        then the strategy's own exit rule
//   2. no position    -> strategy entry rule -> confirmation-filter chain
//   3. confirmed entry -> ATR stops (SL = entry -/+ 2*ATR, TP = entry +/- 3*ATR,
//                        percentage fallback when ATR is unknown), watermarks
//                        seeded at the entry price
//
// Signals are RETURNED from on_message rather than pushed through a
// callback: the live node publishes and persists them, the back-test engine
// consumes them inline. That is the whole of the "direct handler" contract.
//
//   NO_POSITION --(confirmed entry)--> IN_POSITION(side)
//   IN_POSITION --(any exit rule)----> NO_POSITION
// =============================================================================

pub mod bollinger;
pub mod dual_ma;
pub mod filters;
pub mod macd;
pub mod registry;
pub mod rsi;

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Result;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::bus::MessageBus;
use crate::store::Store;
use crate::types::{
    subjects, Bar, IndicatorVector, Side, Signal, SignalAction, SignalType,
};

use self::filters::ConfirmationChain;

/// Default trailing-stop distance as a fraction of the watermark.
const TRAIL_PCT: f64 = 0.05;
/// ATR multiples for the default stops.
const STOP_LOSS_ATR: f64 = 2.0;
const TAKE_PROFIT_ATR: f64 = 3.0;
/// Percentage fallbacks when ATR is not warm yet.
const STOP_LOSS_PCT: f64 = 0.03;
const TAKE_PROFIT_PCT: f64 = 0.06;

// ---------------------------------------------------------------------------
// Strategy interface
// ---------------------------------------------------------------------------

/// A trading strategy: entry rule, exit rule, and an optional extra
/// confirmation that tightens the shared filter chain.
pub trait Strategy: Send + Sync {
    fn name(&self) -> &str;

    /// Entry rule. Returns a candidate OPEN signal or `None`.
    fn check_entry(
        &self,
        symbol: &str,
        bar: &Bar,
        indicator: &IndicatorVector,
        prev: &IndicatorVector,
    ) -> Option<Signal>;

    /// Strategy-specific exit rule, evaluated after the default exits.
    /// Returns the exit reason when the position should close.
    fn check_exit(
        &self,
        position: &Position,
        bar: &Bar,
        indicator: &IndicatorVector,
        prev: &IndicatorVector,
    ) -> Option<String> {
        let _ = (position, bar, indicator, prev);
        None
    }

    /// Extra confirmation on top of the shared chain. Returns a rejection
    /// reason to veto the entry.
    fn confirm(&self, signal: &Signal, bar: &Bar, indicator: &IndicatorVector) -> Option<String> {
        let _ = (signal, bar, indicator);
        None
    }
}

impl std::fmt::Debug for dyn Strategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Strategy").field("name", &self.name()).finish()
    }
}

/// Default confidence heuristic for strategies without a formula of their
/// own (the cross strategies); RSI and Bollinger carry their own.
pub(crate) fn base_confidence(indicator: &IndicatorVector) -> f64 {
    let mut confidence: f64 = 0.5;

    if let Some(rsi) = indicator.rsi14 {
        if (40.0..=60.0).contains(&rsi) {
            confidence += 0.2;
        } else if (30.0..=70.0).contains(&rsi) {
            confidence += 0.1;
        }
    }
    if matches!(indicator.macd_histogram, Some(h) if h > 0.0) {
        confidence += 0.1;
    }
    if indicator.volume_ma5.is_some() {
        confidence += 0.1;
    }

    confidence.min(1.0)
}

// ---------------------------------------------------------------------------
// Position
// ---------------------------------------------------------------------------

/// One open directional exposure tracked by the runtime.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Position {
    pub symbol: String,
    pub side: Side,
    pub qty: f64,
    pub entry_price: f64,
    pub entry_ts: i64,
    /// Highest close seen since entry (longs trail from here).
    pub high_water: f64,
    /// Lowest close seen since entry (shorts trail from here).
    pub low_water: f64,
    pub stop_loss: f64,
    pub take_profit: f64,
}

// ---------------------------------------------------------------------------
// Runtime
// ---------------------------------------------------------------------------

#[derive(Default)]
struct SymbolState {
    bar: Option<Bar>,
    indicator: Option<IndicatorVector>,
    prev_indicator: Option<IndicatorVector>,
    position: Option<Position>,
}

/// Drives one strategy over interleaved bar/indicator updates.
pub struct StrategyRuntime {
    strategy: Box<dyn Strategy>,
    filters: ConfirmationChain,
    states: HashMap<String, SymbolState>,
}

impl StrategyRuntime {
    pub fn new(strategy: Box<dyn Strategy>, filters: ConfirmationChain) -> Self {
        info!(strategy = strategy.name(), "strategy runtime created");
        Self {
            strategy,
            filters,
            states: HashMap::new(),
        }
    }

    pub fn strategy_name(&self) -> &str {
        self.strategy.name()
    }

    /// Open position for a symbol, if any.
    pub fn position(&self, symbol: &str) -> Option<&Position> {
        self.states.get(symbol).and_then(|s| s.position.as_ref())
    }

    /// Latest (bar, indicator) pair for a symbol.
    pub fn market_state(&self, symbol: &str) -> (Option<&Bar>, Option<&IndicatorVector>) {
        match self.states.get(symbol) {
            Some(s) => (s.bar.as_ref(), s.indicator.as_ref()),
            None => (None, None),
        }
    }

    /// Feed one bus message. Returns the signals emitted by this update
    /// (empty for most messages).
    pub async fn on_message(&mut self, subject: &str, payload: &serde_json::Value) -> Vec<Signal> {
        if subject.starts_with("bar.") {
            match serde_json::from_value::<Bar>(payload.clone()) {
                Ok(bar) => self.on_bar(bar).await,
                Err(e) => {
                    warn!(subject = %subject, error = %e, "undecodable bar payload");
                    Vec::new()
                }
            }
        } else if subject.starts_with("ind.") {
            match serde_json::from_value::<IndicatorVector>(payload.clone()) {
                Ok(vector) => self.on_indicator(vector).await,
                Err(e) => {
                    warn!(subject = %subject, error = %e, "undecodable indicator payload");
                    Vec::new()
                }
            }
        } else {
            Vec::new()
        }
    }

    async fn on_bar(&mut self, bar: Bar) -> Vec<Signal> {
        let symbol = bar.symbol.clone();
        let state = self.states.entry(symbol.clone()).or_default();
        state.bar = Some(bar);
        self.evaluate(&symbol).await
    }

    async fn on_indicator(&mut self, vector: IndicatorVector) -> Vec<Signal> {
        let symbol = vector.symbol.clone();
        let state = self.states.entry(symbol.clone()).or_default();
        // Rotate prev <- current <- incoming; cross detection needs both.
        if let Some(current) = state.indicator.take() {
            state.prev_indicator = Some(current);
        }
        state.indicator = Some(vector);
        self.evaluate(&symbol).await
    }

    /// Run the decision pipeline when the symbol state is aligned.
    async fn evaluate(&mut self, symbol: &str) -> Vec<Signal> {
        let state = match self.states.get_mut(symbol) {
            Some(s) => s,
            None => return Vec::new(),
        };
        let (Some(bar), Some(indicator), Some(prev)) =
            (state.bar.clone(), state.indicator.clone(), state.prev_indicator.clone())
        else {
            return Vec::new();
        };
        if bar.timestamp != indicator.timestamp {
            debug!(
                symbol,
                bar_ts = bar.timestamp,
                indicator_ts = indicator.timestamp,
                "timestamps not aligned, skipping decision"
            );
            return Vec::new();
        }

        if state.position.is_some() {
            // Watermarks move first so trailing stops see the latest extreme.
            if let Some(position) = state.position.as_mut() {
                position.high_water = position.high_water.max(bar.close);
                position.low_water = position.low_water.min(bar.close);
            }

            let position = state.position.as_ref().expect("position checked above");
            let exit_reason = default_exit(position, bar.close)
                .or_else(|| self.strategy.check_exit(position, &bar, &indicator, &prev));

            if let Some(reason) = exit_reason {
                let position = state.position.take().expect("position checked above");
                let signal = close_signal(self.strategy.name(), &position, &bar, reason);
                info!(
                    strategy = self.strategy.name(),
                    symbol,
                    side = %position.side,
                    price = bar.close,
                    reason = %signal.reason,
                    "position closed"
                );
                return vec![signal];
            }
            return Vec::new();
        }

        // No position: entry rule, then confirmation.
        let Some(mut candidate) = self.strategy.check_entry(symbol, &bar, &indicator, &prev) else {
            return Vec::new();
        };

        if let Some(rejection) = self.filters.confirm(&candidate, &bar, &indicator).await {
            debug!(strategy = self.strategy.name(), symbol, rejection = %rejection, "entry rejected by filters");
            return Vec::new();
        }
        if let Some(rejection) = self.strategy.confirm(&candidate, &bar, &indicator) {
            debug!(strategy = self.strategy.name(), symbol, rejection = %rejection, "entry rejected by strategy");
            return Vec::new();
        }

        // Confirmed: compute canonical ATR stops and open the position.
        let entry = bar.close;
        let (stop_loss, take_profit) = atr_stops(entry, candidate.side, indicator.atr14);
        candidate.price = entry;
        candidate.stop_loss = Some(stop_loss);
        candidate.take_profit = Some(take_profit);

        let state = self.states.get_mut(symbol).expect("state exists");
        state.position = Some(Position {
            symbol: symbol.to_string(),
            side: candidate.side,
            qty: 0.0,
            entry_price: entry,
            entry_ts: bar.timestamp,
            high_water: entry,
            low_water: entry,
            stop_loss,
            take_profit,
        });

        info!(
            strategy = self.strategy.name(),
            symbol,
            side = %candidate.side,
            price = entry,
            stop_loss,
            take_profit,
            reason = %candidate.reason,
            "position opened"
        );
        vec![candidate]
    }
}

/// Default exits, in priority order: stop loss, take profit, trailing stop.
fn default_exit(position: &Position, price: f64) -> Option<String> {
    match position.side {
        Side::Long => {
            if price <= position.stop_loss {
                return Some(format!("Stop loss hit at {:.2}", position.stop_loss));
            }
            if price >= position.take_profit {
                return Some(format!("Take profit hit at {:.2}", position.take_profit));
            }
            let trail = position.high_water * (1.0 - TRAIL_PCT);
            if price <= trail {
                return Some(format!(
                    "Trailing stop hit at {:.2} (high water {:.2})",
                    trail, position.high_water
                ));
            }
        }
        Side::Short => {
            if price >= position.stop_loss {
                return Some(format!("Stop loss hit at {:.2}", position.stop_loss));
            }
            if price <= position.take_profit {
                return Some(format!("Take profit hit at {:.2}", position.take_profit));
            }
            let trail = position.low_water * (1.0 + TRAIL_PCT);
            if price >= trail {
                return Some(format!(
                    "Trailing stop hit at {:.2} (low water {:.2})",
                    trail, position.low_water
                ));
            }
        }
    }
    None
}

/// ATR-based stops with a percentage fallback.
fn atr_stops(entry: f64, side: Side, atr: Option<f64>) -> (f64, f64) {
    match (side, atr) {
        (Side::Long, Some(atr)) if atr > 0.0 => {
            (entry - STOP_LOSS_ATR * atr, entry + TAKE_PROFIT_ATR * atr)
        }
        (Side::Short, Some(atr)) if atr > 0.0 => {
            (entry + STOP_LOSS_ATR * atr, entry - TAKE_PROFIT_ATR * atr)
        }
        (Side::Long, _) => (entry * (1.0 - STOP_LOSS_PCT), entry * (1.0 + TAKE_PROFIT_PCT)),
        (Side::Short, _) => (entry * (1.0 + STOP_LOSS_PCT), entry * (1.0 - TAKE_PROFIT_PCT)),
    }
}

fn close_signal(strategy: &str, position: &Position, bar: &Bar, reason: String) -> Signal {
    Signal {
        strategy_name: strategy.to_string(),
        symbol: position.symbol.clone(),
        timestamp: bar.timestamp,
        signal_type: SignalType::from_parts(position.side, SignalAction::Close),
        side: position.side,
        action: SignalAction::Close,
        price: bar.close,
        reason,
        confidence: 1.0,
        stop_loss: None,
        take_profit: None,
        position_size: None,
    }
}

// ---------------------------------------------------------------------------
// Live strategy node
// ---------------------------------------------------------------------------

/// Subscribe a runtime to the bus and run it until shutdown: emitted signals
/// are persisted and published to sig.<strategy>.<symbol>.
pub async fn run_strategy_node(
    bus: MessageBus,
    store: Arc<dyn Store>,
    mut runtime: StrategyRuntime,
    symbols: Vec<String>,
    timeframe: String,
    market: crate::types::MarketType,
    mut shutdown: watch::Receiver<bool>,
) -> Result<()> {
    let (tx, mut rx) = tokio::sync::mpsc::channel::<(String, serde_json::Value)>(1024);
    for symbol in &symbols {
        for pattern in [
            subjects::bar(symbol, &timeframe, market),
            subjects::indicator(symbol, &timeframe),
        ] {
            let mut sub = bus.subscribe(&pattern);
            let tx = tx.clone();
            tokio::spawn(async move {
                while let Some(msg) = sub.recv().await {
                    if tx.send(msg).await.is_err() {
                        break;
                    }
                }
            });
        }
    }
    drop(tx);

    info!(
        strategy = runtime.strategy_name(),
        symbols = symbols.len(),
        timeframe = %timeframe,
        "strategy node running"
    );

    loop {
        tokio::select! {
            msg = rx.recv() => {
                let Some((subject, payload)) = msg else { break };
                for signal in runtime.on_message(&subject, &payload).await {
                    if let Err(e) = store.insert_signal(&signal).await {
                        warn!(error = %e, "failed to persist signal");
                    }
                    let out = subjects::signal(&signal.strategy_name, &signal.symbol);
                    match serde_json::to_value(&signal) {
                        Ok(payload) => bus.publish(&out, payload),
                        Err(e) => warn!(error = %e, "failed to serialize signal"),
                    }
                }
            }
            _ = shutdown.changed() => break,
        }
    }

    info!(strategy = runtime.strategy_name(), "strategy node stopped");
    Ok(())
}

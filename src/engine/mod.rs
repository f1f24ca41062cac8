// =============================================================================
// Trading Engine — one pipeline for live and back-test
// =============================================================================
//
// The engine pulls (subject, payload) pairs from a DataSource, routes every
// message through the strategy runtime, and handles the signals the runtime
// returns:
//   - back-test: simulate the fill at signal.price through the position
//     manager, record trades/signals, and snapshot equity on every bar,
//   - live: publish to sig.<strategy>.<symbol>, persist, and stub execution
//     with a warning (order routing is an external concern).
//
// Signals reach the engine by direct return value in both modes; live mode
// additionally publishes them so dashboards can observe the flow. At most
// one position per symbol is enforced by the position manager.
// =============================================================================

pub mod metrics;
pub mod position;

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Result;
use serde::Serialize;
use tracing::{info, warn};

use crate::bus::MessageBus;
use crate::datasource::DataStream;
use crate::store::Store;
use crate::strategy::StrategyRuntime;
use crate::tasks::progress::ProgressTracker;
use crate::types::{subjects, Side, Signal, SignalAction, SignalType};

use self::metrics::{EquityPoint, Statistics};
use self::position::{AccountStatus, PositionManager, TradeRecord};

/// Which half of the pipeline this engine instance drives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineMode {
    Live,
    Backtest,
}

/// Signal record kept for reporting (both opens and closes).
#[derive(Debug, Clone, Serialize)]
pub struct SignalRecord {
    pub timestamp: i64,
    pub symbol: String,
    pub side: Side,
    pub action: SignalAction,
    pub signal_type: SignalType,
    pub price: f64,
    pub quantity: f64,
    pub reason: String,
    pub confidence: f64,
    pub stop_loss: Option<f64>,
    pub take_profit: Option<f64>,
    pub pnl: Option<f64>,
    pub pnl_pct: Option<f64>,
}

/// The structured outcome of a back-test run.
#[derive(Debug, Clone, Serialize)]
pub struct BacktestResults {
    pub strategy: String,
    pub symbols: Vec<String>,
    pub timeframe: String,

    pub total_return: f64,
    pub sharpe_ratio: f64,
    pub max_drawdown: f64,
    pub win_rate: f64,
    pub total_trades: usize,
    pub profit_factor: f64,

    pub initial_balance: f64,
    pub final_balance: f64,
    pub avg_holding_time_hours: f64,

    pub statistics: Statistics,
    pub account: AccountStatus,
    pub trades: Vec<TradeRecord>,
    pub signals: Vec<SignalRecord>,
    pub equity_curve: Vec<EquityPoint>,
}

pub struct TradingEngine {
    mode: EngineMode,
    runtime: StrategyRuntime,
    positions: PositionManager,
    symbols: Vec<String>,
    timeframe: String,

    // Live-mode collaborators; unused in back-test.
    bus: Option<MessageBus>,
    store: Option<Arc<dyn Store>>,

    trades: Vec<TradeRecord>,
    signals: Vec<SignalRecord>,
    equity_curve: Vec<EquityPoint>,
    marks: HashMap<String, f64>,
    progress: Option<Arc<ProgressTracker>>,
}

impl TradingEngine {
    pub fn backtest(
        runtime: StrategyRuntime,
        positions: PositionManager,
        symbols: Vec<String>,
        timeframe: String,
    ) -> Self {
        Self::new(EngineMode::Backtest, runtime, positions, symbols, timeframe, None, None)
    }

    pub fn live(
        runtime: StrategyRuntime,
        positions: PositionManager,
        symbols: Vec<String>,
        timeframe: String,
        bus: MessageBus,
        store: Arc<dyn Store>,
    ) -> Self {
        Self::new(
            EngineMode::Live,
            runtime,
            positions,
            symbols,
            timeframe,
            Some(bus),
            Some(store),
        )
    }

    fn new(
        mode: EngineMode,
        runtime: StrategyRuntime,
        positions: PositionManager,
        symbols: Vec<String>,
        timeframe: String,
        bus: Option<MessageBus>,
        store: Option<Arc<dyn Store>>,
    ) -> Self {
        info!(
            mode = ?mode,
            strategy = runtime.strategy_name(),
            symbols = symbols.len(),
            timeframe = %timeframe,
            "trading engine created"
        );
        Self {
            mode,
            runtime,
            positions,
            symbols,
            timeframe,
            bus,
            store,
            trades: Vec::new(),
            signals: Vec::new(),
            equity_curve: Vec::new(),
            marks: HashMap::new(),
            progress: None,
        }
    }

    /// Attach a per-item progress tracker (back-test tasks).
    pub fn set_progress_tracker(&mut self, tracker: Arc<ProgressTracker>) {
        self.progress = Some(tracker);
    }

    /// Drain the stream to completion (back-test) or until it ends (live).
    pub async fn run(&mut self, stream: &mut DataStream) -> Result<()> {
        while let Some((subject, payload)) = stream.next().await {
            let is_bar = subject.starts_with("bar.");
            if is_bar {
                if let (Some(symbol), Some(close)) =
                    (payload["symbol"].as_str(), payload["close"].as_f64())
                {
                    self.marks.insert(symbol.to_string(), close);
                }
            }

            let emitted = self.runtime.on_message(&subject, &payload).await;
            for signal in emitted {
                self.handle_signal(signal).await;
            }

            if self.mode == EngineMode::Backtest && is_bar {
                if let Some(ts) = payload["timestamp"].as_i64() {
                    self.record_equity(ts);
                }
            }

            if let Some(tracker) = &self.progress {
                tracker.update(1);
            }
        }

        if self.mode == EngineMode::Backtest {
            let status = self.positions.account_status();
            info!(
                trades = self.trades.len(),
                final_balance = status.current_balance,
                total_pnl = status.total_pnl,
                "back-test stream complete"
            );
        }
        Ok(())
    }

    async fn handle_signal(&mut self, signal: Signal) {
        match self.mode {
            EngineMode::Backtest => self.handle_signal_backtest(signal),
            EngineMode::Live => self.handle_signal_live(signal).await,
        }
    }

    fn handle_signal_backtest(&mut self, signal: Signal) {
        match signal.action {
            SignalAction::Open => {
                let indicator = self.runtime.market_state(&signal.symbol).1.cloned();
                let Some(order) = self.positions.calculate_order_size(&signal, indicator.as_ref())
                else {
                    warn!(symbol = %signal.symbol, "open signal rejected by position manager");
                    return;
                };
                self.positions.open_position(&signal, order);
                self.signals.push(SignalRecord {
                    timestamp: signal.timestamp,
                    symbol: signal.symbol.clone(),
                    side: signal.side,
                    action: signal.action,
                    signal_type: signal.signal_type,
                    price: signal.price,
                    quantity: order.qty,
                    reason: signal.reason,
                    confidence: signal.confidence,
                    stop_loss: signal.stop_loss,
                    take_profit: signal.take_profit,
                    pnl: None,
                    pnl_pct: None,
                });
            }
            SignalAction::Close => {
                let Some(trade) =
                    self.positions
                        .close_position(&signal.symbol, signal.price, signal.timestamp)
                else {
                    return;
                };
                self.signals.push(SignalRecord {
                    timestamp: signal.timestamp,
                    symbol: signal.symbol.clone(),
                    side: signal.side,
                    action: signal.action,
                    signal_type: signal.signal_type,
                    price: signal.price,
                    quantity: trade.qty,
                    reason: signal.reason,
                    confidence: signal.confidence,
                    stop_loss: None,
                    take_profit: None,
                    pnl: Some(trade.pnl),
                    pnl_pct: Some(trade.pnl_pct),
                });
                self.trades.push(trade);
            }
        }
    }

    /// Live handling: persist, publish for observers, stub execution.
    async fn handle_signal_live(&mut self, signal: Signal) {
        if let Some(store) = &self.store {
            if let Err(e) = store.insert_signal(&signal).await {
                warn!(error = %e, "failed to persist live signal");
            }
        }
        if let Some(bus) = &self.bus {
            let subject = subjects::signal(&signal.strategy_name, &signal.symbol);
            match serde_json::to_value(&signal) {
                Ok(payload) => bus.publish(&subject, payload),
                Err(e) => warn!(error = %e, "failed to serialize live signal"),
            }
        }
        warn!(
            symbol = %signal.symbol,
            action = ?signal.action,
            side = %signal.side,
            price = signal.price,
            "live order execution is stubbed, signal recorded only"
        );
    }

    fn record_equity(&mut self, timestamp: i64) {
        let equity = self.positions.equity(&self.marks);
        let status = self.positions.account_status();
        let pnl = equity - status.initial_balance;
        self.equity_curve.push(EquityPoint {
            timestamp,
            balance: equity,
            pnl,
            pnl_pct: if status.initial_balance > 0.0 {
                pnl / status.initial_balance
            } else {
                0.0
            },
        });
    }

    /// Structured results; meaningful after a back-test run completes.
    pub fn results(&self) -> BacktestResults {
        let statistics = metrics::compute(&self.trades, &self.equity_curve);
        let account = self.positions.account_status();

        let avg_holding_time_hours = if self.trades.is_empty() {
            0.0
        } else {
            self.trades
                .iter()
                .map(|t| (t.exit_ts - t.entry_ts) as f64 / 3_600.0)
                .sum::<f64>()
                / self.trades.len() as f64
        };

        BacktestResults {
            strategy: self.runtime.strategy_name().to_string(),
            symbols: self.symbols.clone(),
            timeframe: self.timeframe.clone(),
            total_return: account.total_pnl_pct,
            sharpe_ratio: statistics.sharpe_ratio,
            max_drawdown: statistics.max_drawdown,
            win_rate: statistics.win_rate,
            total_trades: statistics.total_trades,
            profit_factor: statistics.profit_factor,
            initial_balance: account.initial_balance,
            final_balance: account.current_balance,
            avg_holding_time_hours,
            statistics,
            account,
            trades: self.trades.clone(),
            signals: self.signals.clone(),
            equity_curve: self.equity_curve.clone(),
        }
    }
}

// =============================================================================
// Unit Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::datasource::{BacktestDataSource, DataSource};
    use crate::store::MemoryStore;
    use crate::strategy::filters::ConfirmationChain;
    use crate::strategy::Strategy;
    use crate::types::{Bar, IndicatorVector, MarketType};
    use self::position::{PositionConfig, SizingStrategy};

    /// 2024-01-01 00:00:00 UTC.
    const JAN_START: i64 = 1_704_067_200;
    const HOUR: i64 = 3_600;

    /// Enters long at fixed timestamps; exits come from the default stops.
    struct TimedEntries {
        entries: Vec<i64>,
    }

    impl Strategy for TimedEntries {
        fn name(&self) -> &str {
            "timed"
        }

        fn check_entry(
            &self,
            symbol: &str,
            bar: &Bar,
            _indicator: &IndicatorVector,
            _prev: &IndicatorVector,
        ) -> Option<Signal> {
            self.entries.contains(&bar.timestamp).then(|| Signal {
                strategy_name: "timed".into(),
                symbol: symbol.into(),
                timestamp: bar.timestamp,
                signal_type: SignalType::OpenLong,
                side: Side::Long,
                action: SignalAction::Open,
                price: bar.close,
                reason: "timed entry".into(),
                confidence: 0.9,
                stop_loss: None,
                take_profit: None,
                position_size: None,
            })
        }
    }

    /// January 2024 hourly history: flat at 100 except one pump to 110
    /// (take profit) and one dump to 95 (stop loss).
    async fn seeded_store() -> Arc<MemoryStore> {
        let store = Arc::new(MemoryStore::new());
        for i in 0..744 {
            let ts = JAN_START + i * HOUR;
            let close: f64 = match i {
                110 => 110.0,
                410 => 95.0,
                _ => 100.0,
            };
            let bar = Bar {
                symbol: "BTCUSDT".into(),
                timeframe: "1h".into(),
                timestamp: ts,
                market_type: MarketType::Spot,
                open: 100.0,
                high: close.max(100.0) + 0.5,
                low: close.min(100.0) - 0.5,
                close,
                volume: 10.0,
            };
            store.bulk_upsert_bars(&[bar]).await.unwrap();
            let vector = IndicatorVector {
                symbol: "BTCUSDT".into(),
                timeframe: "1h".into(),
                timestamp: ts,
                market_type: MarketType::Spot,
                ..Default::default()
            };
            store.insert_indicator(&vector).await.unwrap();
        }
        store
    }

    fn engine() -> TradingEngine {
        let runtime = StrategyRuntime::new(
            Box::new(TimedEntries {
                entries: vec![JAN_START + 100 * HOUR, JAN_START + 400 * HOUR],
            }),
            ConfirmationChain::new(),
        );
        let positions = PositionManager::new(PositionConfig {
            initial_balance: 10_000.0,
            max_positions: 3,
            max_exposure_pct: 0.8,
            single_position_max_pct: 0.5,
            sizing: SizingStrategy::FixedAmount { amount: 1_000.0 },
        });
        TradingEngine::backtest(runtime, positions, vec!["BTCUSDT".into()], "1h".into())
    }

    async fn run_once() -> BacktestResults {
        let store = seeded_store().await;
        let source =
            BacktestDataSource::new(store, JAN_START, JAN_START + 743 * HOUR, MarketType::Spot);
        let mut stream = source.stream(&["BTCUSDT".into()], "1h").await.unwrap();
        let mut engine = engine();
        engine.run(&mut stream).await.unwrap();
        engine.results()
    }

    #[tokio::test]
    async fn winning_and_losing_trade_shape() {
        let results = run_once().await;

        // Entry at 100 with 1000 USDT -> qty 10. The 110 bar trips the +6%
        // fallback take profit for +100; the 95 bar trips the -3% stop for -50.
        assert_eq!(results.total_trades, 2);
        assert!((results.trades[0].pnl - 100.0).abs() < 1e-9);
        assert!((results.trades[1].pnl - (-50.0)).abs() < 1e-9);

        assert!((results.total_return - 0.005).abs() < 1e-9);
        assert!((results.win_rate - 0.5).abs() < 1e-9);
        assert!((results.profit_factor - 2.0).abs() < 1e-9);
        assert!((results.final_balance - 10_050.0).abs() < 1e-9);
        assert!((results.initial_balance - 10_000.0).abs() < 1e-9);

        // One equity point per bar, and four signal records (2 opens + 2 closes).
        assert_eq!(results.equity_curve.len(), 744);
        assert_eq!(results.signals.len(), 4);
        let opens: Vec<_> = results
            .signals
            .iter()
            .filter(|s| s.action == SignalAction::Open)
            .collect();
        assert!(opens.iter().all(|s| (s.quantity - 10.0).abs() < 1e-9));
    }

    #[tokio::test]
    async fn backtest_is_deterministic() {
        let a = run_once().await;
        let b = run_once().await;
        assert_eq!(
            serde_json::to_string(&a).unwrap(),
            serde_json::to_string(&b).unwrap()
        );
    }

    #[tokio::test]
    async fn equity_curve_marks_open_positions() {
        let results = run_once().await;
        // Position opened at hour 100 (flat price): equity stays 10k.
        let at_open = &results.equity_curve[100];
        assert!((at_open.balance - 10_000.0).abs() < 1e-9);

        // The pump bar itself is marked before the close executes.
        let at_pump = &results.equity_curve[110];
        assert!((at_pump.balance - 10_100.0).abs() < 1e-9);

        // After both trades resolve: 10_050 to the end.
        let last = results.equity_curve.last().unwrap();
        assert!((last.balance - 10_050.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn live_mode_publishes_and_stubs_execution() {
        let bus = MessageBus::new();
        let store: Arc<MemoryStore> = Arc::new(MemoryStore::new());
        let mut sub = bus.subscribe("sig.timed.*");

        let runtime = StrategyRuntime::new(
            Box::new(TimedEntries {
                entries: vec![JAN_START + 2 * HOUR],
            }),
            ConfirmationChain::new(),
        );
        let positions = PositionManager::new(PositionConfig::default());
        let mut engine = TradingEngine::live(
            runtime,
            positions,
            vec!["BTCUSDT".into()],
            "1h".into(),
            bus.clone(),
            store.clone(),
        );

        // Drive the runtime by hand through the live signal path.
        for i in 0..3 {
            let ts = JAN_START + i * HOUR;
            let bar = Bar {
                symbol: "BTCUSDT".into(),
                timeframe: "1h".into(),
                timestamp: ts,
                market_type: MarketType::Spot,
                open: 100.0,
                high: 100.5,
                low: 99.5,
                close: 100.0,
                volume: 10.0,
            };
            let vector = IndicatorVector {
                symbol: "BTCUSDT".into(),
                timeframe: "1h".into(),
                timestamp: ts,
                ..Default::default()
            };
            let signals = engine
                .runtime
                .on_message("bar.BTCUSDT.1h.spot", &serde_json::to_value(&bar).unwrap())
                .await;
            for s in signals {
                engine.handle_signal(s).await;
            }
            let signals = engine
                .runtime
                .on_message("ind.BTCUSDT.1h", &serde_json::to_value(&vector).unwrap())
                .await;
            for s in signals {
                engine.handle_signal(s).await;
            }
        }

        // The OPEN signal was published and persisted, not simulated.
        let (subject, payload) = sub.recv().await.unwrap();
        assert_eq!(subject, "sig.timed.BTCUSDT");
        assert_eq!(payload["signal_type"], "OPEN_LONG");
        assert_eq!(store.recent_signals("timed", None, 10).await.unwrap().len(), 1);
        assert_eq!(engine.trades.len(), 0);
    }
}

// =============================================================================
// Meridian Quant Engine — Main Entry Point
// =============================================================================
//
// One binary drives every process role:
//   meridian producer            bar ingest (cursor + write buffer)
//   meridian indicator           incremental indicator node
//   meridian strategy [names..]  strategy runtime(s)
//   meridian repair              one-shot deep data repair, then exit
//   meridian all                 inline orchestration for development
// =============================================================================

// ── Module declarations ──────────────────────────────────────────────────────
mod api;
mod backtest;
mod bus;
mod config;
mod datasource;
mod engine;
mod exchange;
mod indicator_node;
mod indicators;
mod integrity;
mod optimizer;
mod producer;
mod store;
mod strategy;
mod tasks;
mod types;

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use crate::api::ApiContext;
use crate::backtest::BacktestRunner;
use crate::bus::MessageBus;
use crate::config::Config;
use crate::datasource::{DataSource, LiveDataSource};
use crate::engine::position::{PositionConfig, PositionManager};
use crate::engine::TradingEngine;
use crate::exchange::{binance::BinanceExchange, Exchange, MockExchange};
use crate::indicator_node::IndicatorNode;
use crate::integrity::{DataIntegrityService, RepairPolicy};
use crate::producer::{BarProducer, ProducerConfig};
use crate::store::{MemoryStore, Store};
use crate::strategy::filters::ConfirmationChain;
use crate::strategy::registry::StrategyRegistry;
use crate::strategy::{run_strategy_node, StrategyRuntime};
use crate::tasks::TaskManager;

#[derive(Parser)]
#[command(name = "meridian", about = "Real-time quantitative trading data plane")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Start the bar producer (exchange ingest + buffered persistence).
    Producer,
    /// Start the indicator node.
    Indicator,
    /// Start the strategy runtime for the given strategies (default: all).
    Strategy {
        names: Vec<String>,
    },
    /// Run a deep data repair pass and exit.
    Repair,
    /// Run the whole pipeline inline against a mock exchange (development).
    All,
}

#[tokio::main]
async fn main() -> Result<()> {
    let _ = dotenv::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let config = Config::from_env().context("loading configuration")?;
    info!(
        symbols = ?config.symbols,
        timeframes = ?config.timeframes,
        market = %config.market_type,
        "meridian starting"
    );

    // The engine persists through the Store interface; the process wires the
    // in-memory implementation, a SQL-backed store plugs in at this seam.
    let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
    let bus = MessageBus::new();
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    spawn_shutdown_listener(shutdown_tx);

    match cli.command {
        Command::Producer => {
            let exchange = live_exchange(&config)?;
            if config.auto_repair_on_start {
                let integrity = DataIntegrityService::new(Arc::clone(&store), Arc::clone(&exchange));
                integrity
                    .check_and_repair_all(
                        &config.symbols,
                        &config.timeframes,
                        config.market_type,
                        RepairPolicy {
                            bar_days_back: Some(config.repair_hours_back_on_startup / 24.0),
                            indicator_klines_count: None,
                        },
                    )
                    .await;
            }
            let producer = BarProducer::new(bus, exchange, store, producer_config(&config));
            producer.run(shutdown_rx).await?;
        }

        Command::Indicator => {
            let node = IndicatorNode::new(bus, store, vec![config.market_type]);
            node.run(shutdown_rx).await?;
        }

        Command::Strategy { names } => {
            run_strategies(bus, store, config.clone(), names, shutdown_rx).await?;
        }

        Command::Repair => {
            let exchange = live_exchange(&config)?;
            let integrity = DataIntegrityService::new(store, exchange);
            let summary = integrity
                .check_and_repair_all(
                    &config.symbols,
                    &config.timeframes,
                    config.market_type,
                    RepairPolicy {
                        bar_days_back: Some(config.repair_days_back),
                        indicator_klines_count: Some(config.repair_klines_count),
                    },
                )
                .await;
            info!(
                bar_gaps = summary.bar_gaps_found,
                bars_filled = summary.bars_filled,
                indicator_gaps = summary.indicator_gaps_found,
                indicators_filled = summary.indicators_filled,
                "repair finished"
            );
        }

        Command::All => {
            run_all(bus, store, &config, shutdown_rx).await?;
        }
    }

    info!("meridian stopped");
    Ok(())
}

/// Flip the shutdown flag on Ctrl-C.
fn spawn_shutdown_listener(shutdown_tx: watch::Sender<bool>) {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("shutdown signal received");
            let _ = shutdown_tx.send(true);
        }
    });
}

fn live_exchange(config: &Config) -> Result<Arc<dyn Exchange>> {
    let exchange = BinanceExchange::new(
        config.api_key.clone(),
        config.api_secret.clone(),
        config.proxy_host.as_deref(),
        config.proxy_port,
    )?;
    Ok(Arc::new(exchange))
}

fn producer_config(config: &Config) -> ProducerConfig {
    ProducerConfig {
        symbols: config.symbols.clone(),
        timeframes: config.timeframes.clone(),
        market_type: config.market_type,
        fetch_interval: Duration::from_secs(config.fetch_interval_sec),
        buffer_size: config.buffer_size,
        flush_interval: Duration::from_secs(config.flush_interval_sec),
    }
}

/// Spawn one strategy node per requested strategy. Unknown names abort
/// before anything starts.
async fn run_strategies(
    bus: MessageBus,
    store: Arc<dyn Store>,
    config: Config,
    names: Vec<String>,
    shutdown: watch::Receiver<bool>,
) -> Result<()> {
    let registry = StrategyRegistry::with_builtins();
    let names = if names.is_empty() { registry.names() } else { names };

    let timeframe = config
        .timeframes
        .first()
        .cloned()
        .unwrap_or_else(|| "1h".to_string());

    let mut nodes = Vec::new();
    for name in &names {
        let strategy = registry
            .build(name, serde_json::Value::Null)
            .with_context(|| format!("starting strategy {name}"))?;
        let runtime = StrategyRuntime::new(strategy, ConfirmationChain::new());
        nodes.push(tokio::spawn(run_strategy_node(
            bus.clone(),
            Arc::clone(&store),
            runtime,
            config.symbols.clone(),
            timeframe.clone(),
            config.market_type,
            shutdown.clone(),
        )));
    }
    info!(strategies = ?names, timeframe = %timeframe, "strategy nodes running");

    for node in nodes {
        if let Err(e) = node.await {
            error!(error = %e, "strategy node crashed");
        }
    }
    Ok(())
}

/// Development orchestration: mock exchange, in-memory store, every node in
/// one process, plus the HTTP surface.
async fn run_all(
    bus: MessageBus,
    store: Arc<dyn Store>,
    config: &Config,
    shutdown: watch::Receiver<bool>,
) -> Result<()> {
    let exchange: Arc<dyn Exchange> = Arc::new(MockExchange::new());
    let registry = Arc::new(StrategyRegistry::with_builtins());
    let runner = Arc::new(BacktestRunner::new(Arc::clone(&store), Arc::clone(&registry)));

    // HTTP surface.
    let context = ApiContext {
        store: Arc::clone(&store),
        registry: Arc::clone(&registry),
        runner,
        backtest_tasks: TaskManager::backtest(),
        optimization_tasks: TaskManager::optimization(),
        bus: bus.clone(),
    };
    context
        .backtest_tasks
        .spawn_cleanup_loop(Duration::from_secs(600), Duration::from_secs(1_800));
    context
        .optimization_tasks
        .spawn_cleanup_loop(Duration::from_secs(600), Duration::from_secs(3_600));

    let listener = tokio::net::TcpListener::bind(&config.api_addr)
        .await
        .with_context(|| format!("binding {}", config.api_addr))?;
    info!(addr = %config.api_addr, "http surface listening");
    tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, api::rest::router(context)).await {
            warn!(error = %e, "http surface stopped");
        }
    });

    // Pipeline nodes.
    let producer = BarProducer::new(
        bus.clone(),
        Arc::clone(&exchange),
        Arc::clone(&store),
        producer_config(config),
    );
    let indicator = IndicatorNode::new(bus.clone(), Arc::clone(&store), vec![config.market_type]);

    let mut node_tasks = Vec::new();
    {
        let shutdown = shutdown.clone();
        node_tasks.push(tokio::spawn(async move { producer.run(shutdown).await }));
    }
    {
        let shutdown = shutdown.clone();
        node_tasks.push(tokio::spawn(async move { indicator.run(shutdown).await }));
    }

    // One live engine per strategy: the engine hosts the runtime, consumes
    // the live data source, and stubs execution on each signal.
    let timeframe = config
        .timeframes
        .first()
        .cloned()
        .unwrap_or_else(|| "1h".to_string());
    for name in registry.names() {
        let strategy = registry
            .build(&name, serde_json::Value::Null)
            .with_context(|| format!("starting strategy {name}"))?;
        let runtime = StrategyRuntime::new(strategy, ConfirmationChain::new());
        let positions = PositionManager::new(PositionConfig {
            initial_balance: config.initial_balance,
            ..Default::default()
        });
        let mut engine = TradingEngine::live(
            runtime,
            positions,
            config.symbols.clone(),
            timeframe.clone(),
            bus.clone(),
            Arc::clone(&store),
        );
        let source = LiveDataSource::new(bus.clone(), config.market_type);
        let symbols = config.symbols.clone();
        let tf = timeframe.clone();
        let mut stop = shutdown.clone();
        node_tasks.push(tokio::spawn(async move {
            let mut stream = source.stream(&symbols, &tf).await?;
            tokio::select! {
                result = engine.run(&mut stream) => result,
                _ = stop.changed() => Ok(()),
            }
        }));
    }

    for task in node_tasks {
        match task.await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => error!(error = %e, "pipeline node failed"),
            Err(e) => error!(error = %e, "pipeline task panicked"),
        }
    }
    Ok(())
}

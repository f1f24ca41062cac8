// =============================================================================
// Position Manager — pure sizing and exposure state, no I/O
// =============================================================================
//
// Order admission for an OPEN signal:
//   1. reject when open positions >= max_positions,
//   2. target USDT amount from the configured sizing strategy,
//   3. cap at single_position_max_pct * balance,
//   4. remaining exposure = max_exposure_pct * balance - open exposure;
//      an amount over the remaining is rejected when the remaining is
//      under half of it, otherwise shrunk to fit,
//   5. qty = amount / signal.price.
//
// Opening moves the amount out of the cash balance; closing returns
// entry_amount + pnl, where pnl = (exit - entry) * qty for longs and the
// inverse for shorts.
// =============================================================================

use std::collections::HashMap;

use serde::Serialize;
use tracing::{debug, info};

use crate::types::{IndicatorVector, Side, Signal};

/// How the target position value is derived from the account.
#[derive(Debug, Clone)]
pub enum SizingStrategy {
    /// A flat USDT amount per trade.
    FixedAmount { amount: f64 },
    /// A fraction of the current balance.
    FixedPercentage { pct: f64 },
    /// Size so the loss at the stop equals risk_per_trade of the balance.
    /// Requires the signal to carry a stop loss.
    RiskBased { risk_per_trade: f64 },
    /// Half-Kelly, clamped to [1%, 25%] of the balance.
    Kelly { win_rate: f64, win_loss_ratio: f64 },
    /// A base fraction scaled down as ATR% grows past the target.
    VolatilityAdjusted { base_pct: f64, target_atr_pct: f64 },
}

impl SizingStrategy {
    /// Target position value in USDT. `None` means the strategy cannot size
    /// this signal (e.g. risk-based with no stop).
    pub fn target_amount(
        &self,
        balance: f64,
        signal: &Signal,
        indicator: Option<&IndicatorVector>,
    ) -> Option<f64> {
        match self {
            Self::FixedAmount { amount } => Some(*amount),
            Self::FixedPercentage { pct } => Some(balance * pct),
            Self::RiskBased { risk_per_trade } => {
                let stop = signal.stop_loss?;
                let distance = (signal.price - stop).abs();
                if distance <= 0.0 {
                    return None;
                }
                let risk_amount = balance * risk_per_trade;
                Some(risk_amount / distance * signal.price)
            }
            Self::Kelly {
                win_rate,
                win_loss_ratio,
            } => {
                if *win_loss_ratio <= 0.0 {
                    return None;
                }
                let kelly = win_rate - (1.0 - win_rate) / win_loss_ratio;
                let half = (kelly / 2.0).clamp(0.01, 0.25);
                Some(balance * half)
            }
            Self::VolatilityAdjusted {
                base_pct,
                target_atr_pct,
            } => {
                let scale = match indicator.and_then(|i| i.atr14) {
                    Some(atr) if atr > 0.0 && signal.price > 0.0 => {
                        let atr_pct = atr / signal.price;
                        (target_atr_pct / atr_pct).min(1.0)
                    }
                    _ => 1.0,
                };
                Some(balance * base_pct * scale)
            }
        }
    }
}

/// Risk limits and sizing for one engine instance.
#[derive(Debug, Clone)]
pub struct PositionConfig {
    pub initial_balance: f64,
    pub max_positions: usize,
    pub max_exposure_pct: f64,
    pub single_position_max_pct: f64,
    pub sizing: SizingStrategy,
}

impl Default for PositionConfig {
    fn default() -> Self {
        Self {
            initial_balance: 10_000.0,
            max_positions: 3,
            max_exposure_pct: 0.8,
            single_position_max_pct: 0.5,
            sizing: SizingStrategy::FixedPercentage { pct: 0.1 },
        }
    }
}

/// An admitted order: what the engine fills.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct OrderSize {
    pub qty: f64,
    pub amount: f64,
    pub price: f64,
}

/// One sized open position.
#[derive(Debug, Clone, Serialize)]
pub struct EnginePosition {
    pub symbol: String,
    pub side: Side,
    pub qty: f64,
    pub entry_price: f64,
    pub entry_amount: f64,
    pub entry_ts: i64,
    pub stop_loss: Option<f64>,
    pub take_profit: Option<f64>,
}

/// A completed round trip.
#[derive(Debug, Clone, Serialize)]
pub struct TradeRecord {
    pub symbol: String,
    pub side: Side,
    pub qty: f64,
    pub entry_price: f64,
    pub exit_price: f64,
    pub entry_ts: i64,
    pub exit_ts: i64,
    pub pnl: f64,
    pub pnl_pct: f64,
}

/// Account snapshot derived from closed trades and open exposure.
#[derive(Debug, Clone, Serialize)]
pub struct AccountStatus {
    pub initial_balance: f64,
    pub current_balance: f64,
    pub total_pnl: f64,
    pub total_pnl_pct: f64,
    pub open_positions: usize,
    pub open_exposure: f64,
}

/// Pure position/balance state. At most one position per symbol.
pub struct PositionManager {
    config: PositionConfig,
    balance: f64,
    realized_pnl: f64,
    positions: HashMap<String, EnginePosition>,
}

impl PositionManager {
    pub fn new(config: PositionConfig) -> Self {
        let balance = config.initial_balance;
        Self {
            config,
            balance,
            realized_pnl: 0.0,
            positions: HashMap::new(),
        }
    }

    pub fn position(&self, symbol: &str) -> Option<&EnginePosition> {
        self.positions.get(symbol)
    }

    pub fn open_positions(&self) -> usize {
        self.positions.len()
    }

    pub fn single_position_max_pct(&self) -> f64 {
        self.config.single_position_max_pct
    }

    fn open_exposure(&self) -> f64 {
        self.positions.values().map(|p| p.entry_amount).sum()
    }

    // -------------------------------------------------------------------------
    // Admission
    // -------------------------------------------------------------------------

    /// Run the admission algorithm for an OPEN signal.
    pub fn calculate_order_size(
        &self,
        signal: &Signal,
        indicator: Option<&IndicatorVector>,
    ) -> Option<OrderSize> {
        if signal.price <= 0.0 {
            return None;
        }
        if self.positions.len() >= self.config.max_positions {
            debug!(symbol = %signal.symbol, "rejected: position slots exhausted");
            return None;
        }
        if self.positions.contains_key(&signal.symbol) {
            debug!(symbol = %signal.symbol, "rejected: symbol already has a position");
            return None;
        }

        // "balance" for the caps is total capital: cash plus open exposure
        // at entry. Cash alone would double-count an open position.
        let capital = self.balance + self.open_exposure();
        let mut amount = self.config.sizing.target_amount(capital, signal, indicator)?;
        amount = amount.min(self.config.single_position_max_pct * capital);

        let remaining = self.config.max_exposure_pct * capital - self.open_exposure();
        if amount > remaining {
            if remaining < amount / 2.0 {
                debug!(
                    symbol = %signal.symbol,
                    amount,
                    remaining,
                    "rejected: remaining exposure too small"
                );
                return None;
            }
            amount = remaining;
        }
        if amount <= 0.0 {
            return None;
        }

        Some(OrderSize {
            qty: amount / signal.price,
            amount,
            price: signal.price,
        })
    }

    // -------------------------------------------------------------------------
    // Lifecycle
    // -------------------------------------------------------------------------

    /// Record the fill of an admitted order.
    pub fn open_position(&mut self, signal: &Signal, order: OrderSize) {
        self.balance -= order.amount;
        self.positions.insert(
            signal.symbol.clone(),
            EnginePosition {
                symbol: signal.symbol.clone(),
                side: signal.side,
                qty: order.qty,
                entry_price: order.price,
                entry_amount: order.amount,
                entry_ts: signal.timestamp,
                stop_loss: signal.stop_loss,
                take_profit: signal.take_profit,
            },
        );
        info!(
            symbol = %signal.symbol,
            side = %signal.side,
            qty = order.qty,
            amount = order.amount,
            price = order.price,
            "position opened"
        );
    }

    /// Close a position at `exit_price`, returning the trade record.
    pub fn close_position(
        &mut self,
        symbol: &str,
        exit_price: f64,
        exit_ts: i64,
    ) -> Option<TradeRecord> {
        let position = self.positions.remove(symbol)?;

        let direction = match position.side {
            Side::Long => 1.0,
            Side::Short => -1.0,
        };
        let pnl = direction * (exit_price - position.entry_price) * position.qty;
        let pnl_pct = if position.entry_amount > 0.0 {
            pnl / position.entry_amount
        } else {
            0.0
        };

        self.balance += position.entry_amount + pnl;
        self.realized_pnl += pnl;

        info!(symbol, exit_price, pnl, "position closed");
        Some(TradeRecord {
            symbol: symbol.to_string(),
            side: position.side,
            qty: position.qty,
            entry_price: position.entry_price,
            exit_price,
            entry_ts: position.entry_ts,
            exit_ts,
            pnl,
            pnl_pct,
        })
    }

    // -------------------------------------------------------------------------
    // Reporting
    // -------------------------------------------------------------------------

    /// Cash balance (open exposure excluded).
    pub fn balance(&self) -> f64 {
        self.balance
    }

    /// Marked equity: cash + open positions valued at `marks` (entry price
    /// where no mark is known).
    pub fn equity(&self, marks: &HashMap<String, f64>) -> f64 {
        let open_value: f64 = self
            .positions
            .values()
            .map(|p| {
                let mark = marks.get(&p.symbol).copied().unwrap_or(p.entry_price);
                let direction = match p.side {
                    Side::Long => 1.0,
                    Side::Short => -1.0,
                };
                p.entry_amount + direction * (mark - p.entry_price) * p.qty
            })
            .sum();
        self.balance + open_value
    }

    pub fn account_status(&self) -> AccountStatus {
        let equity = self.equity(&HashMap::new());
        let total_pnl = equity - self.config.initial_balance;
        AccountStatus {
            initial_balance: self.config.initial_balance,
            current_balance: equity,
            total_pnl,
            total_pnl_pct: if self.config.initial_balance > 0.0 {
                total_pnl / self.config.initial_balance
            } else {
                0.0
            },
            open_positions: self.positions.len(),
            open_exposure: self.open_exposure(),
        }
    }
}

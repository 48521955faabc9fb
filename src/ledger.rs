//! Paper Trade Ledger
//!
//! Owns the trade history for a session and derives positions and bankroll
//! from it. BUY orders append OPEN lots; SELL orders consume the oldest open
//! lots first (FIFO) with partial-consumption support. Selling more than is
//! open is rejected outright, which is what keeps the no-short-selling
//! invariant.
//!
//! The bankroll is always recomputed from the full trade history rather than
//! tracked as a running balance, so repeated derivation cannot drift.

use chrono::{DateTime, Utc};
use tracing::debug;

use crate::domain::{Bankroll, Position, Trade, TradeSide, TradeStatus, TradeUpdate};
use crate::error::{QtradeError, Result};

/// Strategy tag on synthetic end-of-day closing SELLs
pub const EOD_SETTLEMENT: &str = "EOD_SETTLEMENT";

/// Result of executing one order against the ledger.
///
/// `lot_updates` carries every mutation FIFO matching applied to existing
/// lots, so a store can commit the SELL leg and its lot updates together.
#[derive(Debug, Clone)]
pub struct Execution {
    /// The appended trade record
    pub trade: Trade,
    /// Aggregate realized P&L (0 for BUY)
    pub realized_pnl: f64,
    /// Lots touched by FIFO matching (fully and partially consumed)
    pub closed_trade_ids: Vec<i64>,
    /// Field mutations for the touched lots
    pub lot_updates: Vec<(i64, TradeUpdate)>,
}

/// In-memory trade ledger with FIFO lot matching.
#[derive(Debug, Clone)]
pub struct Ledger {
    starting_cash: f64,
    trades: Vec<Trade>,
    next_id: i64,
}

impl Ledger {
    pub fn new(starting_cash: f64) -> Self {
        Self {
            starting_cash,
            trades: Vec::new(),
            next_id: 1,
        }
    }

    /// Rebuild a ledger from persisted trade history.
    pub fn from_trades(starting_cash: f64, trades: Vec<Trade>) -> Self {
        let next_id = trades.iter().map(|t| t.id).max().unwrap_or(0) + 1;
        Self {
            starting_cash,
            trades,
            next_id,
        }
    }

    pub fn trades(&self) -> &[Trade] {
        &self.trades
    }

    pub fn starting_cash(&self) -> f64 {
        self.starting_cash
    }

    /// Execute a paper order.
    ///
    /// BUY appends an OPEN lot after a funds check. SELL validates the open
    /// quantity up front and only then consumes lots, so a rejected SELL
    /// leaves the ledger untouched.
    pub fn execute(
        &mut self,
        instrument: &str,
        side: TradeSide,
        quantity: u32,
        price: f64,
        strategy: &str,
        reasoning: &str,
        when: DateTime<Utc>,
    ) -> Result<Execution> {
        if quantity == 0 {
            return Err(QtradeError::Validation(
                "order quantity must be positive".to_string(),
            ));
        }

        match side {
            TradeSide::Buy => self.execute_buy(instrument, quantity, price, strategy, reasoning, when),
            TradeSide::Sell => {
                self.execute_sell(instrument, quantity, price, strategy, reasoning, when)
            }
        }
    }

    fn execute_buy(
        &mut self,
        instrument: &str,
        quantity: u32,
        price: f64,
        strategy: &str,
        reasoning: &str,
        when: DateTime<Utc>,
    ) -> Result<Execution> {
        let cost = quantity as f64 * price;
        let balance = self.bankroll().balance;
        if cost > balance {
            return Err(QtradeError::InsufficientFunds { cost, balance });
        }

        let trade = Trade {
            id: self.alloc_id(),
            instrument: instrument.to_string(),
            side: TradeSide::Buy,
            quantity,
            price,
            status: TradeStatus::Open,
            strategy: strategy.to_string(),
            reasoning: reasoning.to_string(),
            executed_at: when,
            exit_price: None,
            exit_time: None,
            profit_loss: None,
        };
        self.trades.push(trade.clone());

        debug!(instrument, quantity, price, "opened BUY lot");

        Ok(Execution {
            trade,
            realized_pnl: 0.0,
            closed_trade_ids: Vec::new(),
            lot_updates: Vec::new(),
        })
    }

    fn execute_sell(
        &mut self,
        instrument: &str,
        quantity: u32,
        price: f64,
        strategy: &str,
        reasoning: &str,
        when: DateTime<Utc>,
    ) -> Result<Execution> {
        // Oldest-first queue of open lots for this instrument
        let mut lot_order: Vec<usize> = self
            .trades
            .iter()
            .enumerate()
            .filter(|(_, t)| t.instrument == instrument && t.is_open_lot())
            .map(|(i, _)| i)
            .collect();
        lot_order.sort_by_key(|&i| (self.trades[i].executed_at, self.trades[i].id));

        let total_open: u32 = lot_order.iter().map(|&i| self.trades[i].quantity).sum();
        if quantity > total_open {
            return Err(QtradeError::InsufficientPosition {
                requested: quantity,
                open: total_open,
            });
        }

        // Plan every lot mutation before touching the ledger so one SELL's
        // updates commit together or not at all.
        let mut remaining = quantity;
        let mut realized_pnl = 0.0;
        let mut closed_trade_ids = Vec::new();
        let mut lot_updates = Vec::new();
        let mut planned: Vec<(usize, u32, bool)> = Vec::new();

        for &idx in &lot_order {
            if remaining == 0 {
                break;
            }
            let lot = &self.trades[idx];
            let matched = remaining.min(lot.quantity);
            realized_pnl += (price - lot.price) * matched as f64;
            remaining -= matched;

            let fully_consumed = matched == lot.quantity;
            planned.push((idx, matched, fully_consumed));
            closed_trade_ids.push(lot.id);
            if fully_consumed {
                lot_updates.push((
                    lot.id,
                    TradeUpdate {
                        status: Some(TradeStatus::Closed),
                        exit_price: Some(price),
                        exit_time: Some(when),
                        ..Default::default()
                    },
                ));
            } else {
                lot_updates.push((
                    lot.id,
                    TradeUpdate {
                        quantity: Some(lot.quantity - matched),
                        ..Default::default()
                    },
                ));
            }
        }

        for (idx, matched, fully_consumed) in planned {
            let lot = &mut self.trades[idx];
            if fully_consumed {
                lot.status = TradeStatus::Closed;
                lot.exit_price = Some(price);
                lot.exit_time = Some(when);
            } else {
                lot.quantity -= matched;
            }
        }

        let trade = Trade {
            id: self.alloc_id(),
            instrument: instrument.to_string(),
            side: TradeSide::Sell,
            quantity,
            price,
            status: TradeStatus::Closed,
            strategy: strategy.to_string(),
            reasoning: reasoning.to_string(),
            executed_at: when,
            exit_price: Some(price),
            exit_time: Some(when),
            profit_loss: Some(realized_pnl),
        };
        self.trades.push(trade.clone());

        debug!(
            instrument,
            quantity,
            price,
            realized_pnl,
            lots = closed_trade_ids.len(),
            "matched SELL against open lots"
        );

        Ok(Execution {
            trade,
            realized_pnl,
            closed_trade_ids,
            lot_updates,
        })
    }

    /// Force-close the instrument's entire open quantity as a synthetic SELL
    /// tagged `EOD_SETTLEMENT`. No-op when nothing is open.
    pub fn settle(
        &mut self,
        instrument: &str,
        exit_price: f64,
        when: DateTime<Utc>,
    ) -> Result<Option<Execution>> {
        let open_qty = self.open_quantity(instrument);
        if open_qty == 0 {
            return Ok(None);
        }

        let execution = self.execute(
            instrument,
            TradeSide::Sell,
            open_qty,
            exit_price,
            EOD_SETTLEMENT,
            "Auto-close position at market settlement",
            when,
        )?;
        Ok(Some(execution))
    }

    /// Net open quantity for one instrument.
    pub fn open_quantity(&self, instrument: &str) -> u32 {
        self.trades
            .iter()
            .filter(|t| t.instrument == instrument && t.is_open_lot())
            .map(|t| t.quantity)
            .sum()
    }

    /// Derived position for one instrument, if any quantity is open.
    pub fn position(&self, instrument: &str) -> Option<Position> {
        let open: Vec<&Trade> = self
            .trades
            .iter()
            .filter(|t| t.instrument == instrument && t.is_open_lot())
            .collect();
        if open.is_empty() {
            return None;
        }

        let quantity: u32 = open.iter().map(|t| t.quantity).sum();
        let notional: f64 = open.iter().map(|t| t.quantity as f64 * t.price).sum();
        let last_trade_time = open.iter().map(|t| t.executed_at).max()?;

        Some(Position {
            instrument: instrument.to_string(),
            quantity,
            avg_entry_price: notional / quantity as f64,
            last_trade_time,
        })
    }

    /// All derived open positions, ordered by instrument.
    pub fn active_positions(&self) -> Vec<Position> {
        let mut instruments: Vec<&str> = self
            .trades
            .iter()
            .filter(|t| t.is_open_lot())
            .map(|t| t.instrument.as_str())
            .collect();
        instruments.sort_unstable();
        instruments.dedup();

        instruments
            .into_iter()
            .filter_map(|i| self.position(i))
            .collect()
    }

    /// Timestamp of the oldest open lot, used as the position's entry time
    /// when computing holding age.
    pub fn entry_time(&self, instrument: &str) -> Option<DateTime<Utc>> {
        self.trades
            .iter()
            .filter(|t| t.instrument == instrument && t.is_open_lot())
            .map(|t| t.executed_at)
            .min()
    }

    /// Capital currently committed across all open lots, at entry prices.
    pub fn total_exposure(&self) -> f64 {
        self.trades
            .iter()
            .filter(|t| t.is_open_lot())
            .map(|t| t.quantity as f64 * t.price)
            .sum()
    }

    /// Bankroll snapshot recomputed from the full trade history.
    pub fn bankroll(&self) -> Bankroll {
        let mut balance = self.starting_cash;
        let mut closed_trades = 0u32;
        let mut winning_trades = 0u32;
        let mut total_pnl = 0.0;

        for trade in &self.trades {
            match trade.side {
                TradeSide::Buy => balance -= trade.quantity as f64 * trade.price,
                TradeSide::Sell => balance += trade.quantity as f64 * trade.price,
            }
            if let Some(pnl) = trade.profit_loss {
                closed_trades += 1;
                if pnl > 0.0 {
                    winning_trades += 1;
                }
                total_pnl += pnl;
            }
        }

        let win_rate = if closed_trades > 0 {
            winning_trades as f64 / closed_trades as f64
        } else {
            0.0
        };

        Bankroll {
            balance,
            closed_trades,
            winning_trades,
            total_pnl,
            win_rate,
            roi: total_pnl / self.starting_cash.max(1e-6),
        }
    }

    fn alloc_id(&mut self) -> i64 {
        let id = self.next_id;
        self.next_id += 1;
        id
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(minute: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 10, 15, 14, minute, 0).unwrap()
    }

    fn buy(ledger: &mut Ledger, qty: u32, price: f64, minute: u32) -> Execution {
        ledger
            .execute(
                "AAPL",
                TradeSide::Buy,
                qty,
                price,
                "RL_AGENT",
                "test",
                at(minute),
            )
            .unwrap()
    }

    fn sell(ledger: &mut Ledger, qty: u32, price: f64, minute: u32) -> Execution {
        ledger
            .execute(
                "AAPL",
                TradeSide::Sell,
                qty,
                price,
                "RL_AGENT",
                "test",
                at(minute),
            )
            .unwrap()
    }

    #[test]
    fn test_round_trip_realizes_price_difference() {
        let mut ledger = Ledger::new(10_000.0);
        buy(&mut ledger, 5, 100.0, 0);
        let exec = sell(&mut ledger, 5, 105.0, 10);

        assert!((exec.realized_pnl - 25.0).abs() < 1e-9);
        assert_eq!(ledger.open_quantity("AAPL"), 0);

        let bankroll = ledger.bankroll();
        assert!((bankroll.balance - 10_025.0).abs() < 1e-9);
        assert!((bankroll.total_pnl - 25.0).abs() < 1e-9);
        assert_eq!(bankroll.closed_trades, 1);
        assert_eq!(bankroll.winning_trades, 1);
        assert!((bankroll.win_rate - 1.0).abs() < 1e-9);
        assert!((bankroll.roi - 0.0025).abs() < 1e-9);
    }

    #[test]
    fn test_fifo_consumes_oldest_lot_first() {
        let mut ledger = Ledger::new(10_000.0);
        buy(&mut ledger, 5, 100.0, 0);
        buy(&mut ledger, 5, 110.0, 5);

        // Selling 5 must match the $100 lot, not the $110 lot
        let exec = sell(&mut ledger, 5, 108.0, 10);
        assert!((exec.realized_pnl - 40.0).abs() < 1e-9);
        assert_eq!(exec.closed_trade_ids, vec![1]);

        let pos = ledger.position("AAPL").unwrap();
        assert_eq!(pos.quantity, 5);
        assert!((pos.avg_entry_price - 110.0).abs() < 1e-9);
    }

    #[test]
    fn test_partial_consumption_keeps_lot_open() {
        let mut ledger = Ledger::new(10_000.0);
        buy(&mut ledger, 5, 100.0, 0);
        let exec = sell(&mut ledger, 2, 104.0, 10);

        assert!((exec.realized_pnl - 8.0).abs() < 1e-9);
        let (lot_id, update) = &exec.lot_updates[0];
        assert_eq!(*lot_id, 1);
        assert_eq!(update.quantity, Some(3));
        assert_eq!(update.status, None);

        let lot = &ledger.trades()[0];
        assert_eq!(lot.status, TradeStatus::Open);
        assert_eq!(lot.quantity, 3);
        assert_eq!(ledger.open_quantity("AAPL"), 3);
    }

    #[test]
    fn test_sell_spanning_lots_closes_and_reduces() {
        let mut ledger = Ledger::new(10_000.0);
        buy(&mut ledger, 3, 100.0, 0);
        buy(&mut ledger, 4, 102.0, 5);

        let exec = sell(&mut ledger, 5, 103.0, 10);
        // 3 @ +3.0 and 2 @ +1.0
        assert!((exec.realized_pnl - 11.0).abs() < 1e-9);
        assert_eq!(exec.closed_trade_ids, vec![1, 2]);
        assert_eq!(exec.lot_updates.len(), 2);
        assert_eq!(exec.lot_updates[0].1.status, Some(TradeStatus::Closed));
        assert_eq!(exec.lot_updates[1].1.quantity, Some(2));
        assert_eq!(ledger.open_quantity("AAPL"), 2);
    }

    #[test]
    fn test_overselling_is_rejected_without_side_effects() {
        let mut ledger = Ledger::new(10_000.0);
        buy(&mut ledger, 5, 100.0, 0);
        let before = ledger.trades().len();

        let err = ledger
            .execute(
                "AAPL",
                TradeSide::Sell,
                10,
                105.0,
                "RL_AGENT",
                "test",
                at(10),
            )
            .unwrap_err();

        match err {
            QtradeError::InsufficientPosition { requested, open } => {
                assert_eq!(requested, 10);
                assert_eq!(open, 5);
            }
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(ledger.trades().len(), before);
        assert_eq!(ledger.open_quantity("AAPL"), 5);
        assert_eq!(ledger.trades()[0].status, TradeStatus::Open);
    }

    #[test]
    fn test_selling_with_no_position_is_rejected() {
        let mut ledger = Ledger::new(10_000.0);
        let err = ledger
            .execute("AAPL", TradeSide::Sell, 1, 100.0, "RL_AGENT", "test", at(0))
            .unwrap_err();
        assert!(matches!(
            err,
            QtradeError::InsufficientPosition { open: 0, .. }
        ));
    }

    #[test]
    fn test_buy_exceeding_balance_is_rejected() {
        let mut ledger = Ledger::new(400.0);
        let err = ledger
            .execute("AAPL", TradeSide::Buy, 5, 100.0, "RL_AGENT", "test", at(0))
            .unwrap_err();
        assert!(matches!(err, QtradeError::InsufficientFunds { .. }));
        assert!(ledger.trades().is_empty());
    }

    #[test]
    fn test_bankroll_recomputation_is_idempotent() {
        let mut ledger = Ledger::new(10_000.0);
        buy(&mut ledger, 5, 100.0, 0);
        buy(&mut ledger, 3, 101.0, 2);
        sell(&mut ledger, 6, 102.0, 10);

        let first = ledger.bankroll();
        let second = ledger.bankroll();
        assert_eq!(first, second);

        // balance identity over the trade history as currently recorded
        let expected: f64 = 10_000.0
            - ledger
                .trades()
                .iter()
                .filter(|t| t.side == TradeSide::Buy)
                .map(|t| t.quantity as f64 * t.price)
                .sum::<f64>()
            + ledger
                .trades()
                .iter()
                .filter(|t| t.side == TradeSide::Sell)
                .map(|t| t.quantity as f64 * t.price)
                .sum::<f64>();
        assert!((first.balance - expected).abs() < 1e-9);
    }

    #[test]
    fn test_settle_closes_everything_with_settlement_tag() {
        let mut ledger = Ledger::new(10_000.0);
        buy(&mut ledger, 5, 100.0, 0);
        buy(&mut ledger, 5, 102.0, 5);

        let exec = ledger.settle("AAPL", 101.0, at(30)).unwrap().unwrap();
        assert!((exec.realized_pnl - 0.0).abs() < 1e-9); // +5 and -5
        assert_eq!(exec.trade.strategy, EOD_SETTLEMENT);
        assert_eq!(ledger.open_quantity("AAPL"), 0);
        assert!(ledger.position("AAPL").is_none());
    }

    #[test]
    fn test_settle_without_position_is_noop() {
        let mut ledger = Ledger::new(10_000.0);
        let result = ledger.settle("AAPL", 101.0, at(30)).unwrap();
        assert!(result.is_none());
        assert!(ledger.trades().is_empty());
    }

    #[test]
    fn test_positions_are_instrument_scoped() {
        let mut ledger = Ledger::new(10_000.0);
        buy(&mut ledger, 5, 100.0, 0);
        ledger
            .execute("MSFT", TradeSide::Buy, 2, 300.0, "RL_AGENT", "test", at(1))
            .unwrap();

        let positions = ledger.active_positions();
        assert_eq!(positions.len(), 2);
        assert_eq!(positions[0].instrument, "AAPL");
        assert_eq!(positions[1].instrument, "MSFT");
        assert!((ledger.total_exposure() - (500.0 + 600.0)).abs() < 1e-9);
    }

    #[test]
    fn test_avg_entry_price_is_quantity_weighted() {
        let mut ledger = Ledger::new(10_000.0);
        buy(&mut ledger, 1, 100.0, 0);
        buy(&mut ledger, 3, 104.0, 1);

        let pos = ledger.position("AAPL").unwrap();
        assert!((pos.avg_entry_price - 103.0).abs() < 1e-9);
    }
}

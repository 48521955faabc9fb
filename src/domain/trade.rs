//! Paper trade records and derived portfolio views.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Trade side (buy or sell)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum TradeSide {
    Buy,
    Sell,
}

impl TradeSide {
    pub fn as_str(&self) -> &'static str {
        match self {
            TradeSide::Buy => "BUY",
            TradeSide::Sell => "SELL",
        }
    }
}

impl std::fmt::Display for TradeSide {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl TryFrom<&str> for TradeSide {
    type Error = String;

    fn try_from(raw: &str) -> Result<Self, Self::Error> {
        match raw {
            "BUY" => Ok(TradeSide::Buy),
            "SELL" => Ok(TradeSide::Sell),
            other => Err(format!("invalid trade side: {other}")),
        }
    }
}

/// Trade status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum TradeStatus {
    /// BUY lot not yet fully consumed by a SELL
    Open,
    /// Fully matched or a completed SELL leg
    Closed,
}

impl TradeStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TradeStatus::Open => "OPEN",
            TradeStatus::Closed => "CLOSED",
        }
    }
}

impl TryFrom<&str> for TradeStatus {
    type Error = String;

    fn try_from(raw: &str) -> Result<Self, Self::Error> {
        match raw {
            "OPEN" => Ok(TradeStatus::Open),
            "CLOSED" => Ok(TradeStatus::Closed),
            other => Err(format!("invalid trade status: {other}")),
        }
    }
}

/// One paper trade record.
///
/// A BUY is inserted OPEN and represents a lot of shares bought together at
/// one price. A SELL is inserted already CLOSED and carries the aggregate
/// realized P&L of the lots it consumed; `profit_loss` is populated if and
/// only if the record is a closing SELL leg.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Trade {
    pub id: i64,
    pub instrument: String,
    pub side: TradeSide,
    /// Share count; reduced in place when a BUY lot is partially consumed
    pub quantity: u32,
    pub price: f64,
    pub status: TradeStatus,
    /// Strategy tag ("RL_AGENT", "EOD_SETTLEMENT", ...)
    pub strategy: String,
    /// Free-text decision explanation
    pub reasoning: String,
    pub executed_at: DateTime<Utc>,
    pub exit_price: Option<f64>,
    pub exit_time: Option<DateTime<Utc>>,
    pub profit_loss: Option<f64>,
}

impl Trade {
    /// An open BUY lot that can still be matched by a SELL
    pub fn is_open_lot(&self) -> bool {
        self.side == TradeSide::Buy && self.status == TradeStatus::Open
    }

    /// A closed round trip (SELL leg carrying realized P&L)
    pub fn is_closing_leg(&self) -> bool {
        self.side == TradeSide::Sell && self.profit_loss.is_some()
    }
}

/// Field-level mutation applied to an existing trade record during FIFO
/// matching. Only the fields that change are set.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TradeUpdate {
    pub quantity: Option<u32>,
    pub status: Option<TradeStatus>,
    pub exit_price: Option<f64>,
    pub exit_time: Option<DateTime<Utc>>,
}

/// Derived open position for one instrument; never stored.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Position {
    pub instrument: String,
    /// Net open quantity; always > 0 for a reported position
    pub quantity: u32,
    /// Quantity-weighted average entry price over the open lots
    pub avg_entry_price: f64,
    /// Timestamp of the most recent open lot
    pub last_trade_time: DateTime<Utc>,
}

impl Position {
    /// Mark-to-market P&L at the given price
    pub fn unrealized_pnl(&self, price: f64) -> f64 {
        (price - self.avg_entry_price) * self.quantity as f64
    }
}

/// Derived bankroll snapshot; recomputed from the full trade history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Bankroll {
    /// starting_cash - sum(BUY qty*price) + sum(SELL qty*price)
    pub balance: f64,
    /// Closed round trips (SELL legs carrying P&L)
    pub closed_trades: u32,
    /// Closed round trips with positive P&L
    pub winning_trades: u32,
    /// Sum of realized P&L over closed round trips
    pub total_pnl: f64,
    /// winning / closed, 0 when nothing has closed
    pub win_rate: f64,
    /// total_pnl / starting_cash
    pub roi: f64,
}

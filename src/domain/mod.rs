//! Domain types shared across the decision-and-accounting engine.

pub mod state;
pub mod trade;

pub use state::{
    CashBucket, ExposureBucket, LevelPosition, MarketView, PositionStatus, PriceMomentum,
    RsiBucket, TradingState,
};
pub use trade::{Bankroll, Position, Trade, TradeSide, TradeStatus, TradeUpdate};

pub mod agent;
pub mod config;
pub mod domain;
pub mod engine;
pub mod error;
pub mod ledger;
pub mod market;
pub mod reward;
pub mod store;

pub use agent::{Action, AgentSnapshot, AgentStats, QLearningAgent};
pub use config::AppConfig;
pub use domain::{Bankroll, MarketView, Position, Trade, TradeSide, TradeStatus, TradingState};
pub use engine::{CycleSummary, DecisionEngine, SettlementSummary};
pub use error::{QtradeError, Result};
pub use ledger::{Execution, Ledger};
pub use market::{Bar, IndicatorSet, MarketDataSource, PreviousClose};
pub use reward::{RewardContext, RewardPolicy};
pub use store::{DecisionRecord, InMemoryStore, PersistenceStore, PostgresStore, TradeFilter};

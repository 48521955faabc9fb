//! Persistence collaborator interface and implementations.

pub mod memory;
pub mod postgres;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::agent::AgentSnapshot;
use crate::domain::{Trade, TradeStatus, TradeUpdate};
use crate::error::Result;

pub use memory::InMemoryStore;
pub use postgres::PostgresStore;

/// Filter for trade history queries. Unset fields match everything.
#[derive(Debug, Clone, Default)]
pub struct TradeFilter {
    pub instrument: Option<String>,
    pub status: Option<TradeStatus>,
}

impl TradeFilter {
    pub fn for_instrument(instrument: &str) -> Self {
        Self {
            instrument: Some(instrument.to_string()),
            status: None,
        }
    }

    pub fn matches(&self, trade: &Trade) -> bool {
        if let Some(instrument) = &self.instrument {
            if &trade.instrument != instrument {
                return false;
            }
        }
        if let Some(status) = self.status {
            if trade.status != status {
                return false;
            }
        }
        true
    }
}

/// One logged decision, persisted for audit and the report command.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DecisionRecord {
    pub instrument: String,
    /// Compact state key at decision time
    pub state: String,
    pub action: String,
    pub was_executed: bool,
    pub was_random: bool,
    pub reasoning: String,
    /// Q-values for the state at decision time, keyed by action
    pub q_values: serde_json::Value,
    pub timestamp: DateTime<Utc>,
}

/// Durable storage for agents, trades, and the decision log.
///
/// Committed trades must be visible to subsequent queries exactly once;
/// agent snapshots are last-write-wins.
#[async_trait]
pub trait PersistenceStore: Send + Sync {
    /// Load the persisted agent snapshot for an instrument, if any.
    async fn load_agent(&self, instrument: &str) -> Result<Option<AgentSnapshot>>;

    /// Persist an agent snapshot, replacing any prior one.
    async fn save_agent(&self, instrument: &str, snapshot: &AgentSnapshot) -> Result<()>;

    /// Append a trade record, returning its assigned id.
    async fn append_trade(&self, trade: &Trade) -> Result<i64>;

    /// Apply a partial update to an existing trade.
    async fn update_trade(&self, trade_id: i64, update: &TradeUpdate) -> Result<()>;

    /// All trades matching the filter, oldest first.
    async fn query_trades(&self, filter: &TradeFilter) -> Result<Vec<Trade>>;

    /// Append one decision log entry.
    async fn append_decision(&self, record: &DecisionRecord) -> Result<()>;

    /// Most recent decisions, newest first, optionally scoped to one
    /// instrument.
    async fn recent_decisions(
        &self,
        instrument: Option<&str>,
        limit: usize,
    ) -> Result<Vec<DecisionRecord>>;
}

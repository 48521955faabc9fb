//! In-memory store for tests and offline runs.
//!
//! Backs both the persistence and market-data interfaces with plain maps
//! behind a single async mutex. Market data is loaded through the fixture
//! helpers rather than collected.

use async_trait::async_trait;
use std::collections::HashMap;
use tokio::sync::Mutex;

use crate::agent::AgentSnapshot;
use crate::domain::{Trade, TradeUpdate};
use crate::error::{QtradeError, Result};
use crate::market::{Bar, IndicatorSet, MarketDataSource, PreviousClose};
use crate::store::{DecisionRecord, PersistenceStore, TradeFilter};

#[derive(Default)]
struct Inner {
    agents: HashMap<String, AgentSnapshot>,
    trades: Vec<Trade>,
    next_trade_id: i64,
    decisions: Vec<DecisionRecord>,
    bars: HashMap<String, Vec<Bar>>,
    indicators: HashMap<String, IndicatorSet>,
    previous_closes: HashMap<String, PreviousClose>,
}

pub struct InMemoryStore {
    inner: Mutex<Inner>,
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                next_trade_id: 1,
                ..Default::default()
            }),
        }
    }

    /// Replace the fixture bars for an instrument (stored newest first).
    pub async fn set_bars(&self, instrument: &str, bars: Vec<Bar>) {
        self.inner
            .lock()
            .await
            .bars
            .insert(instrument.to_string(), bars);
    }

    pub async fn set_indicators(&self, instrument: &str, indicators: IndicatorSet) {
        self.inner
            .lock()
            .await
            .indicators
            .insert(instrument.to_string(), indicators);
    }

    pub async fn set_previous_close(&self, instrument: &str, close: PreviousClose) {
        self.inner
            .lock()
            .await
            .previous_closes
            .insert(instrument.to_string(), close);
    }

    pub async fn trade_count(&self) -> usize {
        self.inner.lock().await.trades.len()
    }

    pub async fn decision_count(&self) -> usize {
        self.inner.lock().await.decisions.len()
    }
}

#[async_trait]
impl PersistenceStore for InMemoryStore {
    async fn load_agent(&self, instrument: &str) -> Result<Option<AgentSnapshot>> {
        Ok(self.inner.lock().await.agents.get(instrument).cloned())
    }

    async fn save_agent(&self, instrument: &str, snapshot: &AgentSnapshot) -> Result<()> {
        self.inner
            .lock()
            .await
            .agents
            .insert(instrument.to_string(), snapshot.clone());
        Ok(())
    }

    async fn append_trade(&self, trade: &Trade) -> Result<i64> {
        let mut inner = self.inner.lock().await;
        let id = inner.next_trade_id;
        inner.next_trade_id += 1;
        let mut stored = trade.clone();
        stored.id = id;
        inner.trades.push(stored);
        Ok(id)
    }

    async fn update_trade(&self, trade_id: i64, update: &TradeUpdate) -> Result<()> {
        let mut inner = self.inner.lock().await;
        let trade = inner
            .trades
            .iter_mut()
            .find(|t| t.id == trade_id)
            .ok_or_else(|| QtradeError::Validation(format!("unknown trade id {trade_id}")))?;

        if let Some(quantity) = update.quantity {
            trade.quantity = quantity;
        }
        if let Some(status) = update.status {
            trade.status = status;
        }
        if let Some(exit_price) = update.exit_price {
            trade.exit_price = Some(exit_price);
        }
        if let Some(exit_time) = update.exit_time {
            trade.exit_time = Some(exit_time);
        }
        Ok(())
    }

    async fn query_trades(&self, filter: &TradeFilter) -> Result<Vec<Trade>> {
        let inner = self.inner.lock().await;
        let mut trades: Vec<Trade> = inner
            .trades
            .iter()
            .filter(|t| filter.matches(t))
            .cloned()
            .collect();
        trades.sort_by(|a, b| a.executed_at.cmp(&b.executed_at).then(a.id.cmp(&b.id)));
        Ok(trades)
    }

    async fn append_decision(&self, record: &DecisionRecord) -> Result<()> {
        self.inner.lock().await.decisions.push(record.clone());
        Ok(())
    }

    async fn recent_decisions(
        &self,
        instrument: Option<&str>,
        limit: usize,
    ) -> Result<Vec<DecisionRecord>> {
        let inner = self.inner.lock().await;
        Ok(inner
            .decisions
            .iter()
            .rev()
            .filter(|d| instrument.map_or(true, |i| d.instrument == i))
            .take(limit)
            .cloned()
            .collect())
    }
}

#[async_trait]
impl MarketDataSource for InMemoryStore {
    async fn recent_bars(&self, instrument: &str, lookback: usize) -> Result<Vec<Bar>> {
        let inner = self.inner.lock().await;
        Ok(inner
            .bars
            .get(instrument)
            .map(|bars| bars.iter().take(lookback).cloned().collect())
            .unwrap_or_default())
    }

    async fn latest_indicators(&self, instrument: &str) -> Result<IndicatorSet> {
        let inner = self.inner.lock().await;
        Ok(inner.indicators.get(instrument).cloned().unwrap_or_default())
    }

    async fn previous_close(&self, instrument: &str) -> Result<Option<PreviousClose>> {
        Ok(self
            .inner
            .lock()
            .await
            .previous_closes
            .get(instrument)
            .cloned())
    }
}

//! PostgreSQL storage adapter.
//!
//! Backs both the persistence and market-data interfaces. Price bars and
//! indicators are written by the external collector; this crate only reads
//! them.

use async_trait::async_trait;
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::Row;
use tracing::info;

use crate::agent::AgentSnapshot;
use crate::domain::{Trade, TradeSide, TradeStatus, TradeUpdate};
use crate::error::{QtradeError, Result};
use crate::market::{Bar, IndicatorSet, MarketDataSource, PreviousClose};
use crate::store::{DecisionRecord, PersistenceStore, TradeFilter};

#[derive(Clone)]
pub struct PostgresStore {
    pool: PgPool,
}

impl PostgresStore {
    pub async fn new(database_url: &str, max_connections: u32) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(database_url)
            .await?;

        info!("Connected to PostgreSQL");
        Ok(Self { pool })
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Run migrations
    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        info!("Database migrations completed");
        Ok(())
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    fn row_to_trade(row: &sqlx::postgres::PgRow) -> Result<Trade> {
        let side: String = row.get("side");
        let status: String = row.get("status");
        Ok(Trade {
            id: row.get("id"),
            instrument: row.get("instrument"),
            side: TradeSide::try_from(side.as_str()).map_err(QtradeError::Validation)?,
            quantity: row.get::<i32, _>("quantity") as u32,
            price: row.get("price"),
            status: TradeStatus::try_from(status.as_str()).map_err(QtradeError::Validation)?,
            strategy: row.get("strategy"),
            reasoning: row.get("reasoning"),
            executed_at: row.get("executed_at"),
            exit_price: row.get("exit_price"),
            exit_time: row.get("exit_time"),
            profit_loss: row.get("profit_loss"),
        })
    }
}

#[async_trait]
impl PersistenceStore for PostgresStore {
    async fn load_agent(&self, instrument: &str) -> Result<Option<AgentSnapshot>> {
        let row = sqlx::query(
            r#"
            SELECT snapshot FROM rl_agents WHERE instrument = $1
            "#,
        )
        .bind(instrument)
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(row) => {
                let snapshot: serde_json::Value = row.get("snapshot");
                Ok(Some(serde_json::from_value(snapshot)?))
            }
            None => Ok(None),
        }
    }

    async fn save_agent(&self, instrument: &str, snapshot: &AgentSnapshot) -> Result<()> {
        let payload = serde_json::to_value(snapshot)?;
        sqlx::query(
            r#"
            INSERT INTO rl_agents (instrument, snapshot, updated_at)
            VALUES ($1, $2, NOW())
            ON CONFLICT (instrument) DO UPDATE SET
                snapshot = EXCLUDED.snapshot,
                updated_at = EXCLUDED.updated_at
            "#,
        )
        .bind(instrument)
        .bind(payload)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn append_trade(&self, trade: &Trade) -> Result<i64> {
        let row = sqlx::query(
            r#"
            INSERT INTO paper_trades
                (instrument, side, quantity, price, status, strategy, reasoning,
                 executed_at, exit_price, exit_time, profit_loss)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
            RETURNING id
            "#,
        )
        .bind(&trade.instrument)
        .bind(trade.side.as_str())
        .bind(trade.quantity as i32)
        .bind(trade.price)
        .bind(trade.status.as_str())
        .bind(&trade.strategy)
        .bind(&trade.reasoning)
        .bind(trade.executed_at)
        .bind(trade.exit_price)
        .bind(trade.exit_time)
        .bind(trade.profit_loss)
        .fetch_one(&self.pool)
        .await?;

        Ok(row.get("id"))
    }

    async fn update_trade(&self, trade_id: i64, update: &TradeUpdate) -> Result<()> {
        let result = sqlx::query(
            r#"
            UPDATE paper_trades SET
                quantity = COALESCE($2, quantity),
                status = COALESCE($3, status),
                exit_price = COALESCE($4, exit_price),
                exit_time = COALESCE($5, exit_time)
            WHERE id = $1
            "#,
        )
        .bind(trade_id)
        .bind(update.quantity.map(|q| q as i32))
        .bind(update.status.map(|s| s.as_str()))
        .bind(update.exit_price)
        .bind(update.exit_time)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(QtradeError::Validation(format!(
                "unknown trade id {trade_id}"
            )));
        }
        Ok(())
    }

    async fn query_trades(&self, filter: &TradeFilter) -> Result<Vec<Trade>> {
        let rows = sqlx::query(
            r#"
            SELECT id, instrument, side, quantity, price, status, strategy,
                   reasoning, executed_at, exit_price, exit_time, profit_loss
            FROM paper_trades
            WHERE ($1::text IS NULL OR instrument = $1)
              AND ($2::text IS NULL OR status = $2)
            ORDER BY executed_at ASC, id ASC
            "#,
        )
        .bind(filter.instrument.as_deref())
        .bind(filter.status.map(|s| s.as_str()))
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(Self::row_to_trade).collect()
    }

    async fn append_decision(&self, record: &DecisionRecord) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO decision_log
                (instrument, state, action, was_executed, was_random,
                 reasoning, q_values, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            "#,
        )
        .bind(&record.instrument)
        .bind(&record.state)
        .bind(&record.action)
        .bind(record.was_executed)
        .bind(record.was_random)
        .bind(&record.reasoning)
        .bind(&record.q_values)
        .bind(record.timestamp)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn recent_decisions(
        &self,
        instrument: Option<&str>,
        limit: usize,
    ) -> Result<Vec<DecisionRecord>> {
        let rows = sqlx::query(
            r#"
            SELECT instrument, state, action, was_executed, was_random,
                   reasoning, q_values, created_at
            FROM decision_log
            WHERE ($1::text IS NULL OR instrument = $1)
            ORDER BY created_at DESC, id DESC
            LIMIT $2
            "#,
        )
        .bind(instrument)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .iter()
            .map(|row| DecisionRecord {
                instrument: row.get("instrument"),
                state: row.get("state"),
                action: row.get("action"),
                was_executed: row.get("was_executed"),
                was_random: row.get("was_random"),
                reasoning: row.get("reasoning"),
                q_values: row.get("q_values"),
                timestamp: row.get("created_at"),
            })
            .collect())
    }
}

#[async_trait]
impl MarketDataSource for PostgresStore {
    async fn recent_bars(&self, instrument: &str, lookback: usize) -> Result<Vec<Bar>> {
        let rows = sqlx::query(
            r#"
            SELECT bar_time, open, high, low, close, volume
            FROM price_bars
            WHERE instrument = $1
            ORDER BY bar_time DESC
            LIMIT $2
            "#,
        )
        .bind(instrument)
        .bind(lookback as i64)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .iter()
            .map(|row| Bar {
                timestamp: row.get("bar_time"),
                open: row.get("open"),
                high: row.get("high"),
                low: row.get("low"),
                close: row.get("close"),
                volume: row.get("volume"),
            })
            .collect())
    }

    async fn latest_indicators(&self, instrument: &str) -> Result<IndicatorSet> {
        let row = sqlx::query(
            r#"
            SELECT rsi, sma_50, vwap
            FROM technical_indicators
            WHERE instrument = $1
            ORDER BY computed_at DESC
            LIMIT 1
            "#,
        )
        .bind(instrument)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row
            .map(|row| IndicatorSet {
                rsi: row.get("rsi"),
                sma_50: row.get("sma_50"),
                vwap: row.get("vwap"),
            })
            .unwrap_or_default())
    }

    async fn previous_close(&self, instrument: &str) -> Result<Option<PreviousClose>> {
        let row = sqlx::query(
            r#"
            SELECT close, bar_time
            FROM price_bars
            WHERE instrument = $1 AND bar_time::date < CURRENT_DATE
            ORDER BY bar_time DESC
            LIMIT 1
            "#,
        )
        .bind(instrument)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|row| PreviousClose {
            close: row.get("close"),
            timestamp: row.get("bar_time"),
        }))
    }
}

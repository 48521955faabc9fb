//! Market data collaborator interface.
//!
//! The decision engine only reads prices and indicators; collection and
//! indicator computation live outside this crate and land in the store the
//! engine reads from.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::Result;

/// One OHLCV price bar.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Bar {
    pub timestamp: DateTime<Utc>,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
}

/// Latest computed indicator values for one instrument. Any indicator can be
/// missing while the collector warms up.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct IndicatorSet {
    pub rsi: Option<f64>,
    pub sma_50: Option<f64>,
    pub vwap: Option<f64>,
}

/// Prior session's closing price, used as the settlement exit price.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PreviousClose {
    pub close: f64,
    pub timestamp: DateTime<Utc>,
}

/// Read-side market data access.
#[async_trait]
pub trait MarketDataSource: Send + Sync {
    /// Most recent bars for an instrument, newest first, at most `lookback`.
    async fn recent_bars(&self, instrument: &str, lookback: usize) -> Result<Vec<Bar>>;

    /// Latest indicator values for an instrument.
    async fn latest_indicators(&self, instrument: &str) -> Result<IndicatorSet>;

    /// Prior session close, if one is known.
    async fn previous_close(&self, instrument: &str) -> Result<Option<PreviousClose>>;
}

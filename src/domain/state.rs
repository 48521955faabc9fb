//! Trading State Representation
//!
//! Defines how the agent perceives the market: continuous market and
//! portfolio numbers are discretized into a fixed-cardinality state tuple
//! so the Q-table stays tabular (5*3*3*3*3*3*4 = 4,860 possible states).

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::{QtradeError, Result};

/// Floor applied to starting cash before ratio bucketing, avoids division
/// by zero on a misconfigured bankroll.
const MIN_STARTING_CASH: f64 = 1e-6;

/// RSI momentum bucket (five-way split)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum RsiBucket {
    Oversold,
    Weak,
    Neutral,
    Strong,
    Overbought,
}

impl RsiBucket {
    /// Bucket an RSI reading (0-100). Boundaries are half-open so every
    /// reading lands in exactly one bucket; rsi=30 is WEAK, not OVERSOLD.
    pub fn from_value(rsi: f64) -> Self {
        if rsi < 30.0 {
            Self::Oversold
        } else if rsi < 45.0 {
            Self::Weak
        } else if rsi < 55.0 {
            Self::Neutral
        } else if rsi < 70.0 {
            Self::Strong
        } else {
            Self::Overbought
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Oversold => "OVERSOLD",
            Self::Weak => "WEAK",
            Self::Neutral => "NEUTRAL",
            Self::Strong => "STRONG",
            Self::Overbought => "OVERBOUGHT",
        }
    }
}

impl FromStr for RsiBucket {
    type Err = &'static str;

    fn from_str(raw: &str) -> std::result::Result<Self, Self::Err> {
        match raw {
            "OVERSOLD" => Ok(Self::Oversold),
            "WEAK" => Ok(Self::Weak),
            "NEUTRAL" => Ok(Self::Neutral),
            "STRONG" => Ok(Self::Strong),
            "OVERBOUGHT" => Ok(Self::Overbought),
            _ => Err("invalid RSI bucket"),
        }
    }
}

/// Price position relative to a reference level (SMA or VWAP)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum LevelPosition {
    Above,
    At,
    Below,
}

impl LevelPosition {
    /// Bucket the percentage distance between price and a reference level.
    /// Within +/-0.5% counts as AT.
    pub fn from_prices(price: f64, reference: f64) -> Self {
        let diff_pct = (price - reference) / reference * 100.0;
        if diff_pct > 0.5 {
            Self::Above
        } else if diff_pct < -0.5 {
            Self::Below
        } else {
            Self::At
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Above => "ABOVE",
            Self::At => "AT",
            Self::Below => "BELOW",
        }
    }
}

impl FromStr for LevelPosition {
    type Err = &'static str;

    fn from_str(raw: &str) -> std::result::Result<Self, Self::Err> {
        match raw {
            "ABOVE" => Ok(Self::Above),
            "AT" => Ok(Self::At),
            "BELOW" => Ok(Self::Below),
            _ => Err("invalid level position"),
        }
    }
}

/// Current position direction for the instrument
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum PositionStatus {
    Long,
    Flat,
    Short,
}

impl PositionStatus {
    /// No path in this crate produces a negative quantity; SHORT exists so
    /// a violated no-shorting invariant surfaces as its own state.
    pub fn from_quantity(quantity: i64) -> Self {
        if quantity > 0 {
            Self::Long
        } else if quantity < 0 {
            Self::Short
        } else {
            Self::Flat
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Long => "LONG",
            Self::Flat => "FLAT",
            Self::Short => "SHORT",
        }
    }
}

impl FromStr for PositionStatus {
    type Err = &'static str;

    fn from_str(raw: &str) -> std::result::Result<Self, Self::Err> {
        match raw {
            "LONG" => Ok(Self::Long),
            "FLAT" => Ok(Self::Flat),
            "SHORT" => Ok(Self::Short),
            _ => Err("invalid position status"),
        }
    }
}

/// Short-horizon price momentum
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum PriceMomentum {
    Up,
    Flat,
    Down,
}

impl PriceMomentum {
    /// Bucket the percentage move against the previous bar; within
    /// +/-0.1% counts as FLAT.
    pub fn from_prices(price: f64, prev_price: f64) -> Self {
        let change_pct = (price - prev_price) / prev_price * 100.0;
        if change_pct > 0.1 {
            Self::Up
        } else if change_pct < -0.1 {
            Self::Down
        } else {
            Self::Flat
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Up => "UP",
            Self::Flat => "FLAT",
            Self::Down => "DOWN",
        }
    }
}

impl FromStr for PriceMomentum {
    type Err = &'static str;

    fn from_str(raw: &str) -> std::result::Result<Self, Self::Err> {
        match raw {
            "UP" => Ok(Self::Up),
            "FLAT" => Ok(Self::Flat),
            "DOWN" => Ok(Self::Down),
            _ => Err("invalid price momentum"),
        }
    }
}

/// Remaining cash as a fraction of starting capital
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum CashBucket {
    High,
    Medium,
    Low,
}

impl CashBucket {
    pub fn from_ratio(cash_available: f64, starting_cash: f64) -> Self {
        let ratio = cash_available / starting_cash.max(MIN_STARTING_CASH);
        if ratio >= 0.7 {
            Self::High
        } else if ratio >= 0.3 {
            Self::Medium
        } else {
            Self::Low
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::High => "HIGH",
            Self::Medium => "MEDIUM",
            Self::Low => "LOW",
        }
    }
}

impl FromStr for CashBucket {
    type Err = &'static str;

    fn from_str(raw: &str) -> std::result::Result<Self, Self::Err> {
        match raw {
            "HIGH" => Ok(Self::High),
            "MEDIUM" => Ok(Self::Medium),
            "LOW" => Ok(Self::Low),
            _ => Err("invalid cash bucket"),
        }
    }
}

/// Committed capital as a fraction of starting capital
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ExposureBucket {
    None,
    Light,
    Heavy,
    Overextended,
}

impl ExposureBucket {
    pub fn from_ratio(total_exposure: f64, starting_cash: f64) -> Self {
        let ratio = total_exposure / starting_cash.max(MIN_STARTING_CASH);
        if ratio <= 0.05 {
            Self::None
        } else if ratio < 0.5 {
            Self::Light
        } else if ratio <= 1.0 {
            Self::Heavy
        } else {
            Self::Overextended
        }
    }

    /// Exposure tight enough to shape HOLD/BUY/SELL rewards
    pub fn is_constrained(&self) -> bool {
        matches!(self, Self::Heavy | Self::Overextended)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::None => "NONE",
            Self::Light => "LIGHT",
            Self::Heavy => "HEAVY",
            Self::Overextended => "OVEREXTENDED",
        }
    }
}

impl FromStr for ExposureBucket {
    type Err = &'static str;

    fn from_str(raw: &str) -> std::result::Result<Self, Self::Err> {
        match raw {
            "NONE" => Ok(Self::None),
            "LIGHT" => Ok(Self::Light),
            "HEAVY" => Ok(Self::Heavy),
            "OVEREXTENDED" => Ok(Self::Overextended),
            _ => Err("invalid exposure bucket"),
        }
    }
}

/// Raw market and portfolio numbers feeding the discretizer
#[derive(Debug, Clone, Copy)]
pub struct MarketView {
    /// RSI reading (0-100)
    pub rsi: f64,
    /// Current price
    pub price: f64,
    /// Simple moving average reference
    pub sma: f64,
    /// Volume-weighted average price reference
    pub vwap: f64,
    /// Signed net position (negative only on upstream invariant violation)
    pub position_quantity: i64,
    /// Previous bar close for momentum
    pub prev_price: f64,
    /// Remaining bankroll balance
    pub cash_available: f64,
    /// Capital committed across all open lots
    pub total_exposure: f64,
    /// Configured starting capital
    pub starting_cash: f64,
}

/// Discrete state tuple used as the Q-table key.
///
/// Every field is a pure, total function of the `MarketView` inputs, so the
/// same inputs always map to the same state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TradingState {
    pub rsi: RsiBucket,
    pub ma_position: LevelPosition,
    pub vwap_position: LevelPosition,
    pub position_status: PositionStatus,
    pub price_momentum: PriceMomentum,
    pub cash: CashBucket,
    pub exposure: ExposureBucket,
}

impl TradingState {
    /// Discretize raw market and portfolio numbers into a state tuple.
    pub fn from_market_view(view: &MarketView) -> Self {
        Self {
            rsi: RsiBucket::from_value(view.rsi),
            ma_position: LevelPosition::from_prices(view.price, view.sma),
            vwap_position: LevelPosition::from_prices(view.price, view.vwap),
            position_status: PositionStatus::from_quantity(view.position_quantity),
            price_momentum: PriceMomentum::from_prices(view.price, view.prev_price),
            cash: CashBucket::from_ratio(view.cash_available, view.starting_cash),
            exposure: ExposureBucket::from_ratio(view.total_exposure, view.starting_cash),
        }
    }

    /// Compact pipe-joined form used as the persisted Q-table key.
    pub fn to_key(&self) -> String {
        format!(
            "{}|{}|{}|{}|{}|{}|{}",
            self.rsi.as_str(),
            self.ma_position.as_str(),
            self.vwap_position.as_str(),
            self.position_status.as_str(),
            self.price_momentum.as_str(),
            self.cash.as_str(),
            self.exposure.as_str(),
        )
    }

    /// Parse a persisted key back into a state tuple.
    pub fn from_key(key: &str) -> Result<Self> {
        let parts: Vec<&str> = key.split('|').collect();
        if parts.len() != 7 {
            return Err(QtradeError::MalformedPersistedState(format!(
                "state key has {} fields, expected 7: {key}",
                parts.len()
            )));
        }

        let malformed = |what: &str| {
            QtradeError::MalformedPersistedState(format!("{what} in state key: {key}"))
        };

        Ok(Self {
            rsi: parts[0].parse().map_err(|e| malformed(e))?,
            ma_position: parts[1].parse().map_err(|e| malformed(e))?,
            vwap_position: parts[2].parse().map_err(|e| malformed(e))?,
            position_status: parts[3].parse().map_err(|e| malformed(e))?,
            price_momentum: parts[4].parse().map_err(|e| malformed(e))?,
            cash: parts[5].parse().map_err(|e| malformed(e))?,
            exposure: parts[6].parse().map_err(|e| malformed(e))?,
        })
    }
}

impl fmt::Display for TradingState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "State(RSI={}, MA={}, VWAP={}, Pos={}, Mom={}, Cash={}, Exp={})",
            self.rsi.as_str(),
            self.ma_position.as_str(),
            self.vwap_position.as_str(),
            self.position_status.as_str(),
            self.price_momentum.as_str(),
            self.cash.as_str(),
            self.exposure.as_str(),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn view() -> MarketView {
        MarketView {
            rsi: 50.0,
            price: 100.0,
            sma: 100.0,
            vwap: 100.0,
            position_quantity: 0,
            prev_price: 100.0,
            cash_available: 10_000.0,
            total_exposure: 0.0,
            starting_cash: 10_000.0,
        }
    }

    #[test]
    fn test_rsi_buckets_are_total_over_range() {
        for rsi in 0..=100 {
            // Every integer RSI maps to exactly one bucket without panicking
            let _ = RsiBucket::from_value(rsi as f64);
        }
        assert_eq!(RsiBucket::from_value(29.9), RsiBucket::Oversold);
        assert_eq!(RsiBucket::from_value(30.0), RsiBucket::Weak);
        assert_eq!(RsiBucket::from_value(44.9), RsiBucket::Weak);
        assert_eq!(RsiBucket::from_value(45.0), RsiBucket::Neutral);
        assert_eq!(RsiBucket::from_value(54.9), RsiBucket::Neutral);
        assert_eq!(RsiBucket::from_value(55.0), RsiBucket::Strong);
        assert_eq!(RsiBucket::from_value(69.9), RsiBucket::Strong);
        assert_eq!(RsiBucket::from_value(70.0), RsiBucket::Overbought);
    }

    #[test]
    fn test_level_position_half_percent_band() {
        assert_eq!(LevelPosition::from_prices(100.6, 100.0), LevelPosition::Above);
        assert_eq!(LevelPosition::from_prices(100.5, 100.0), LevelPosition::At);
        assert_eq!(LevelPosition::from_prices(99.5, 100.0), LevelPosition::At);
        assert_eq!(LevelPosition::from_prices(99.4, 100.0), LevelPosition::Below);
    }

    #[test]
    fn test_momentum_tenth_percent_band() {
        assert_eq!(PriceMomentum::from_prices(100.2, 100.0), PriceMomentum::Up);
        assert_eq!(PriceMomentum::from_prices(100.05, 100.0), PriceMomentum::Flat);
        assert_eq!(PriceMomentum::from_prices(99.8, 100.0), PriceMomentum::Down);
    }

    #[test]
    fn test_cash_bucket_boundaries_are_closed() {
        assert_eq!(CashBucket::from_ratio(7_000.0, 10_000.0), CashBucket::High);
        assert_eq!(CashBucket::from_ratio(6_999.0, 10_000.0), CashBucket::Medium);
        assert_eq!(CashBucket::from_ratio(3_000.0, 10_000.0), CashBucket::Medium);
        assert_eq!(CashBucket::from_ratio(2_999.0, 10_000.0), CashBucket::Low);
    }

    #[test]
    fn test_exposure_bucket_boundaries() {
        assert_eq!(ExposureBucket::from_ratio(500.0, 10_000.0), ExposureBucket::None);
        assert_eq!(ExposureBucket::from_ratio(501.0, 10_000.0), ExposureBucket::Light);
        assert_eq!(ExposureBucket::from_ratio(4_999.0, 10_000.0), ExposureBucket::Light);
        assert_eq!(ExposureBucket::from_ratio(5_000.0, 10_000.0), ExposureBucket::Heavy);
        assert_eq!(ExposureBucket::from_ratio(10_000.0, 10_000.0), ExposureBucket::Heavy);
        assert_eq!(
            ExposureBucket::from_ratio(10_001.0, 10_000.0),
            ExposureBucket::Overextended
        );
    }

    #[test]
    fn test_zero_starting_cash_does_not_divide_by_zero() {
        let mut v = view();
        v.starting_cash = 0.0;
        let state = TradingState::from_market_view(&v);
        assert_eq!(state.exposure, ExposureBucket::None);
    }

    #[test]
    fn test_negative_quantity_maps_to_short() {
        assert_eq!(PositionStatus::from_quantity(-1), PositionStatus::Short);
        assert_eq!(PositionStatus::from_quantity(0), PositionStatus::Flat);
        assert_eq!(PositionStatus::from_quantity(3), PositionStatus::Long);
    }

    #[test]
    fn test_key_roundtrip() {
        let state = TradingState::from_market_view(&view());
        let key = state.to_key();
        assert_eq!(key, "NEUTRAL|AT|AT|FLAT|FLAT|HIGH|NONE");
        assert_eq!(TradingState::from_key(&key).unwrap(), state);
    }

    #[test]
    fn test_malformed_key_is_rejected() {
        assert!(TradingState::from_key("NEUTRAL|AT|AT").is_err());
        assert!(TradingState::from_key("BOGUS|AT|AT|FLAT|FLAT|HIGH|NONE").is_err());
    }

    #[test]
    fn test_discretizer_is_deterministic() {
        let v = MarketView {
            rsi: 28.0,
            price: 178.5,
            sma: 179.0,
            vwap: 177.8,
            position_quantity: 0,
            prev_price: 178.2,
            cash_available: 9_000.0,
            total_exposure: 900.0,
            starting_cash: 10_000.0,
        };
        let a = TradingState::from_market_view(&v);
        let b = TradingState::from_market_view(&v);
        assert_eq!(a, b);
        assert_eq!(a.rsi, RsiBucket::Oversold);
        assert_eq!(a.vwap_position, LevelPosition::At);
        assert_eq!(a.cash, CashBucket::High);
        assert_eq!(a.exposure, ExposureBucket::Light);
    }
}

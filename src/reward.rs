//! Reward shaping for the Q-learning agent.
//!
//! Converts one decision outcome into a scalar reward. HOLD carries a small
//! time penalty plus mark-to-market shaping, BUY a small entry incentive
//! with capital-pressure penalties, SELL the realized P&L with time-in-trade
//! shaping. Orders that never executed yield zero so the agent cannot learn
//! from phantom fills.

use crate::agent::Action;
use crate::config::RewardConfig;
use crate::domain::{CashBucket, ExposureBucket};

/// Clamp bound on the price-change shaping term for HOLD
const PRICE_CHANGE_CLAMP: f64 = 0.02;
/// Clamp bound on the unrealized-P&L shaping term for HOLD
const UNREALIZED_CLAMP: f64 = 0.05;
/// Divisor scaling unrealized P&L dollars into reward units
const UNREALIZED_SCALE: f64 = 1_000.0;

const BUY_LOW_CASH_PENALTY: f64 = 0.01;
const BUY_EXPOSURE_PENALTY: f64 = 0.02;

/// Everything the policy needs to know about one decision outcome.
#[derive(Debug, Clone)]
pub struct RewardContext {
    pub action: Action,
    /// Whether the order actually executed (HOLD counts as executed)
    pub executed: bool,
    /// Realized P&L of an executed SELL; 0 otherwise
    pub realized_pnl: f64,
    pub cash: CashBucket,
    pub exposure: ExposureBucket,
    /// Whether a position is open at decision time
    pub position_open: bool,
    /// Minutes since the oldest open lot was entered; 0 when flat
    pub position_age_minutes: f64,
    pub price: f64,
    pub prev_price: f64,
    /// Mark-to-market P&L of the open position; 0 when flat
    pub unrealized_pnl: f64,
}

/// Stateless reward function parameterized by configuration.
#[derive(Debug, Clone)]
pub struct RewardPolicy {
    config: RewardConfig,
}

impl RewardPolicy {
    pub fn new(config: RewardConfig) -> Self {
        Self { config }
    }

    pub fn reward(&self, ctx: &RewardContext) -> f64 {
        match ctx.action {
            Action::Hold => self.hold_reward(ctx),
            Action::Buy | Action::Sell if !ctx.executed => 0.0,
            Action::Buy => self.buy_reward(ctx),
            Action::Sell => self.sell_reward(ctx),
        }
    }

    fn hold_reward(&self, ctx: &RewardContext) -> f64 {
        let mut reward = -self.config.hold_penalty;

        if ctx.cash == CashBucket::Low {
            reward -= self.config.hold_penalty;
        }
        if ctx.exposure.is_constrained() {
            reward -= self.config.hold_penalty;
        }

        // Holding an open position tracks the market: reward moving with the
        // price and the sign of the unrealized P&L, both clamped.
        if ctx.position_open {
            if ctx.prev_price > 0.0 {
                let change_pct = (ctx.price - ctx.prev_price) / ctx.prev_price * 100.0;
                reward += (change_pct / 100.0).clamp(-PRICE_CHANGE_CLAMP, PRICE_CHANGE_CLAMP);
            }
            if ctx.unrealized_pnl != 0.0 {
                reward += (ctx.unrealized_pnl / UNREALIZED_SCALE)
                    .clamp(-UNREALIZED_CLAMP, UNREALIZED_CLAMP);
            }
        }

        reward
    }

    fn buy_reward(&self, ctx: &RewardContext) -> f64 {
        let mut reward = self.config.buy_reward;
        if ctx.cash == CashBucket::Low {
            reward -= BUY_LOW_CASH_PENALTY;
        }
        if ctx.exposure.is_constrained() {
            reward -= BUY_EXPOSURE_PENALTY;
        }
        reward
    }

    fn sell_reward(&self, ctx: &RewardContext) -> f64 {
        let mut reward = ctx.realized_pnl;

        if ctx.realized_pnl > 0.0
            && ctx.position_age_minutes <= self.config.quick_exit_threshold_minutes
        {
            reward += self.config.quick_exit_bonus;
        }

        if ctx.realized_pnl < 0.0
            && ctx.position_age_minutes >= self.config.lingering_threshold_minutes
        {
            let block = self.config.lingering_threshold_minutes / 3.0;
            let blocks = (ctx.position_age_minutes / block).floor();
            reward -= self.config.lingering_penalty_per_block * blocks;
        }

        // Selling out of tight capital or exposure conditions is relief
        if ctx.cash == CashBucket::Low {
            reward += self.config.relief_bonus;
        }
        if ctx.exposure.is_constrained() {
            reward += self.config.relief_bonus;
        }

        reward
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy() -> RewardPolicy {
        RewardPolicy::new(RewardConfig::default())
    }

    fn base_ctx(action: Action) -> RewardContext {
        RewardContext {
            action,
            executed: true,
            realized_pnl: 0.0,
            cash: CashBucket::High,
            exposure: ExposureBucket::None,
            position_open: false,
            position_age_minutes: 0.0,
            price: 100.0,
            prev_price: 100.0,
            unrealized_pnl: 0.0,
        }
    }

    #[test]
    fn test_unexecuted_orders_yield_zero() {
        let policy = policy();
        for action in [Action::Buy, Action::Sell] {
            let ctx = RewardContext {
                executed: false,
                realized_pnl: 50.0,
                ..base_ctx(action)
            };
            assert_eq!(policy.reward(&ctx), 0.0);
        }
    }

    #[test]
    fn test_hold_base_penalty() {
        let ctx = base_ctx(Action::Hold);
        assert!((policy().reward(&ctx) + 0.005).abs() < 1e-12);
    }

    #[test]
    fn test_hold_penalties_stack() {
        let ctx = RewardContext {
            cash: CashBucket::Low,
            exposure: ExposureBucket::Heavy,
            ..base_ctx(Action::Hold)
        };
        assert!((policy().reward(&ctx) + 0.015).abs() < 1e-12);
    }

    #[test]
    fn test_hold_with_losing_position_is_bounded_negative() {
        // Open long, price dropped 101 -> 99, unrealized -10
        let ctx = RewardContext {
            position_open: true,
            price: 99.0,
            prev_price: 101.0,
            unrealized_pnl: -10.0,
            ..base_ctx(Action::Hold)
        };
        let reward = policy().reward(&ctx);
        assert!(reward < 0.0);
        assert!(reward >= -0.085 && reward <= -0.005);
    }

    #[test]
    fn test_hold_shaping_terms_are_clamped() {
        // Huge favorable move and huge unrealized gain
        let ctx = RewardContext {
            position_open: true,
            price: 200.0,
            prev_price: 100.0,
            unrealized_pnl: 1_000_000.0,
            ..base_ctx(Action::Hold)
        };
        // -0.005 + 0.02 + 0.05
        assert!((policy().reward(&ctx) - 0.065).abs() < 1e-12);
    }

    #[test]
    fn test_buy_reward_and_penalties() {
        let policy = policy();
        assert!((policy.reward(&base_ctx(Action::Buy)) - 0.02).abs() < 1e-12);

        let ctx = RewardContext {
            cash: CashBucket::Low,
            exposure: ExposureBucket::Overextended,
            ..base_ctx(Action::Buy)
        };
        // 0.02 - 0.01 - 0.02
        assert!((policy.reward(&ctx) + 0.01).abs() < 1e-12);
    }

    #[test]
    fn test_quick_exit_bonus_beats_raw_pnl() {
        let ctx = RewardContext {
            realized_pnl: 2.0,
            position_age_minutes: 5.0,
            ..base_ctx(Action::Sell)
        };
        let reward = policy().reward(&ctx);
        assert!((reward - 2.05).abs() < 1e-12);
        assert!(reward > ctx.realized_pnl);
    }

    #[test]
    fn test_no_quick_exit_bonus_past_threshold() {
        let ctx = RewardContext {
            realized_pnl: 2.0,
            position_age_minutes: 11.0,
            ..base_ctx(Action::Sell)
        };
        assert!((policy().reward(&ctx) - 2.0).abs() < 1e-12);
    }

    #[test]
    fn test_lingering_loss_penalty_scales_by_block() {
        let policy = policy();
        // 30-minute threshold, 10-minute blocks: 45 minutes = 4 blocks
        let ctx = RewardContext {
            realized_pnl: -1.0,
            position_age_minutes: 45.0,
            ..base_ctx(Action::Sell)
        };
        assert!((policy.reward(&ctx) + 1.08).abs() < 1e-12);

        // Under the threshold: no penalty
        let quick_loss = RewardContext {
            position_age_minutes: 20.0,
            ..ctx
        };
        assert!((policy.reward(&quick_loss) + 1.0).abs() < 1e-12);
    }

    #[test]
    fn test_sell_relief_bonuses() {
        let ctx = RewardContext {
            realized_pnl: 1.0,
            position_age_minutes: 20.0,
            cash: CashBucket::Low,
            exposure: ExposureBucket::Heavy,
            ..base_ctx(Action::Sell)
        };
        // 1.0 + 0.02 + 0.02
        assert!((policy().reward(&ctx) - 1.04).abs() < 1e-12);
    }
}

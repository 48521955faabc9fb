//! Decision engine: one Q-learning decision cycle per instrument.
//!
//! Each cycle loads the trade history into a fresh ledger, restores (or
//! creates) the instrument's agent, discretizes the current market view,
//! chooses an action epsilon-greedily, executes it as a paper trade, logs
//! the decision, shapes a reward, updates the agent, and persists the agent
//! snapshot. Instruments are processed sequentially and one instrument's
//! failure never aborts the rest of the batch.

use chrono::Utc;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::agent::{Action, QLearningAgent};
use crate::config::AppConfig;
use crate::domain::{MarketView, TradeSide, TradingState};
use crate::error::{QtradeError, Result};
use crate::ledger::{Execution, Ledger, EOD_SETTLEMENT};
use crate::market::MarketDataSource;
use crate::reward::{RewardContext, RewardPolicy};
use crate::store::{DecisionRecord, PersistenceStore, TradeFilter};

const STRATEGY_TAG: &str = "RL_AGENT";

/// Pick an exploration decay factor from the trailing win rate.
///
/// Winning agents decay exploration faster (exploit what works), losing
/// agents keep exploring longer. Re-derived from outcomes every cycle rather
/// than stored.
pub fn adaptive_decay(win_rate: f64, closed_trades: u32) -> f64 {
    if closed_trades == 0 {
        0.99
    } else if win_rate >= 0.5 {
        0.98
    } else if win_rate <= 0.3 {
        0.995
    } else {
        0.99
    }
}

/// Outcome of one instrument's decision cycle.
#[derive(Debug, Clone)]
pub struct InstrumentOutcome {
    pub instrument: String,
    pub state: String,
    pub action: Action,
    pub executed: bool,
    pub was_random: bool,
    pub reward: f64,
}

/// Outcome of one full cycle over all tracked instruments.
#[derive(Debug, Clone, Default)]
pub struct CycleSummary {
    pub outcomes: Vec<InstrumentOutcome>,
    pub skipped: Vec<String>,
}

/// Outcome of end-of-day settlement.
#[derive(Debug, Clone, Default)]
pub struct SettlementSummary {
    pub positions_closed: usize,
    pub realized_pnl: f64,
    pub final_balance: f64,
}

pub struct DecisionEngine<M, S> {
    market: Arc<M>,
    store: Arc<S>,
    config: AppConfig,
    reward_policy: RewardPolicy,
    /// Deployment mode: always exploit, never explore
    force_exploit: bool,
}

impl<M, S> DecisionEngine<M, S>
where
    M: MarketDataSource,
    S: PersistenceStore,
{
    pub fn new(market: Arc<M>, store: Arc<S>, config: AppConfig, force_exploit: bool) -> Self {
        let reward_policy = RewardPolicy::new(config.reward.clone());
        Self {
            market,
            store,
            config,
            reward_policy,
            force_exploit,
        }
    }

    /// Run one decision cycle over the given instruments.
    ///
    /// Recoverable per-instrument errors (no history, corrupt snapshot) are
    /// logged and skipped; infrastructure errors propagate.
    pub async fn run_cycle(&self, instruments: &[String]) -> Result<CycleSummary> {
        let mut summary = CycleSummary::default();

        for instrument in instruments {
            match self.run_instrument(instrument).await {
                Ok(outcome) => {
                    info!(
                        instrument = %outcome.instrument,
                        action = %outcome.action,
                        executed = outcome.executed,
                        random = outcome.was_random,
                        reward = outcome.reward,
                        "cycle complete"
                    );
                    summary.outcomes.push(outcome);
                }
                Err(err) if err.is_recoverable() => {
                    warn!(instrument = %instrument, %err, "skipping instrument this cycle");
                    summary.skipped.push(instrument.clone());
                }
                Err(err) => return Err(err),
            }
        }

        Ok(summary)
    }

    /// One instrument's full decision cycle.
    async fn run_instrument(&self, instrument: &str) -> Result<InstrumentOutcome> {
        let trading = &self.config.trading;
        let now = Utc::now();

        // The full history is loaded because the bankroll is global even
        // though positions are instrument-scoped.
        let trades = self.store.query_trades(&TradeFilter::default()).await?;
        let mut ledger = Ledger::from_trades(trading.starting_cash, trades);

        let mut agent = self.load_or_create_agent(instrument).await?;
        let (closed, wins) = instrument_win_stats(&ledger, instrument);
        let win_rate = if closed > 0 {
            wins as f64 / closed as f64
        } else {
            0.0
        };
        agent.set_exploration_decay(adaptive_decay(win_rate, closed));

        let (view, state) = self.observe(instrument, &ledger).await?;
        let price = view.price;
        let prev_price = view.prev_price;

        // Position facts are captured before execution; the SELL reward
        // needs the age and unrealized P&L of the position being closed.
        let open_qty = ledger.open_quantity(instrument);
        let position_open = open_qty > 0;
        let position_age_minutes = ledger
            .entry_time(instrument)
            .map(|t| (now - t).num_seconds() as f64 / 60.0)
            .unwrap_or(0.0);
        let unrealized_pnl = ledger
            .position(instrument)
            .map(|p| p.unrealized_pnl(price))
            .unwrap_or(0.0);

        let q_values = agent.q_values(&state);
        let (action, was_random) = agent.choose_action(&state, self.force_exploit);

        let mut reasoning = decision_reasoning(&view);
        if was_random {
            reasoning.push_str(" (EXPLORATION)");
        }

        let (executed, realized_pnl) = self
            .execute_action(&mut ledger, instrument, action, open_qty, price, &reasoning, now)
            .await?;

        self.store
            .append_decision(&DecisionRecord {
                instrument: instrument.to_string(),
                state: state.to_key(),
                action: action.as_str().to_string(),
                was_executed: executed,
                was_random,
                reasoning: reasoning.clone(),
                q_values: serde_json::json!({
                    "BUY": q_values[0],
                    "SELL": q_values[1],
                    "HOLD": q_values[2],
                }),
                timestamp: now,
            })
            .await?;

        let reward = self.reward_policy.reward(&RewardContext {
            action,
            executed,
            realized_pnl,
            cash: state.cash,
            exposure: state.exposure,
            position_open,
            position_age_minutes,
            price,
            prev_price,
            unrealized_pnl,
        });

        // Next state reflects the post-trade portfolio at unchanged prices
        let next_view = MarketView {
            position_quantity: ledger.open_quantity(instrument) as i64,
            cash_available: ledger.bankroll().balance,
            total_exposure: ledger.total_exposure(),
            ..view
        };
        let next_state = TradingState::from_market_view(&next_view);

        agent.update(&state, action, reward, &next_state, false);
        agent.finish_episode();
        self.store.save_agent(instrument, &agent.snapshot()).await?;

        Ok(InstrumentOutcome {
            instrument: instrument.to_string(),
            state: state.to_key(),
            action,
            executed,
            was_random,
            reward,
        })
    }

    /// Force-close every open position at the prior session close and decay
    /// every tracked instrument's agent, idle ones included.
    pub async fn settle_all(&self) -> Result<SettlementSummary> {
        let trading = &self.config.trading;
        let now = Utc::now();

        let trades = self.store.query_trades(&TradeFilter::default()).await?;
        let mut ledger = Ledger::from_trades(trading.starting_cash, trades);
        let mut summary = SettlementSummary::default();

        for instrument in &trading.symbols {
            let mut agent = self.load_or_create_agent(instrument).await?;

            if ledger.open_quantity(instrument) > 0 {
                match self.market.previous_close(instrument).await? {
                    Some(close) => {
                        let position_age_minutes = ledger
                            .entry_time(instrument)
                            .map(|t| (now - t).num_seconds() as f64 / 60.0)
                            .unwrap_or(0.0);

                        if let Some(execution) =
                            ledger.settle(instrument, close.close, now)?
                        {
                            self.commit_execution(&execution).await?;
                            summary.positions_closed += 1;
                            summary.realized_pnl += execution.realized_pnl;
                            info!(
                                instrument = %instrument,
                                pnl = execution.realized_pnl,
                                exit_price = close.close,
                                strategy = EOD_SETTLEMENT,
                                "settled open position"
                            );

                            // Terminal update when the day's state is still
                            // observable; settlement must succeed without it.
                            if let Ok((view, state)) =
                                self.observe(instrument, &ledger).await
                            {
                                let reward = self.reward_policy.reward(&RewardContext {
                                    action: Action::Sell,
                                    executed: true,
                                    realized_pnl: execution.realized_pnl,
                                    cash: state.cash,
                                    exposure: state.exposure,
                                    position_open: true,
                                    position_age_minutes,
                                    price: close.close,
                                    prev_price: view.prev_price,
                                    unrealized_pnl: 0.0,
                                });
                                agent.update(&state, Action::Sell, reward, &state, true);
                            }
                        }
                    }
                    None => {
                        warn!(instrument = %instrument, "no prior close, position left open");
                    }
                }
            }

            agent.finish_episode();
            self.store.save_agent(instrument, &agent.snapshot()).await?;
        }

        summary.final_balance = ledger.bankroll().balance;
        info!(
            positions_closed = summary.positions_closed,
            realized_pnl = summary.realized_pnl,
            final_balance = summary.final_balance,
            "settlement complete"
        );
        Ok(summary)
    }

    async fn load_or_create_agent(&self, instrument: &str) -> Result<QLearningAgent> {
        match self.store.load_agent(instrument).await? {
            Some(snapshot) => {
                debug!(instrument = %instrument, episodes = snapshot.total_episodes, "restored agent");
                QLearningAgent::restore(&snapshot)
            }
            None => {
                debug!(instrument = %instrument, "created new agent");
                Ok(QLearningAgent::new(&self.config.agent))
            }
        }
    }

    /// Build the current market view and its discretized state.
    async fn observe(&self, instrument: &str, ledger: &Ledger) -> Result<(MarketView, TradingState)> {
        let trading = &self.config.trading;

        let bars = self
            .market
            .recent_bars(instrument, trading.min_history_bars)
            .await?;
        if bars.len() < trading.min_history_bars {
            return Err(QtradeError::InsufficientHistory {
                bars: bars.len(),
                required: trading.min_history_bars,
            });
        }

        let indicators = self.market.latest_indicators(instrument).await?;
        let (rsi, sma, vwap) = match (indicators.rsi, indicators.sma_50, indicators.vwap) {
            (Some(rsi), Some(sma), Some(vwap)) => (rsi, sma, vwap),
            _ => {
                return Err(QtradeError::MarketDataUnavailable(format!(
                    "indicators not ready for {instrument}"
                )))
            }
        };

        // Bars arrive newest first
        let price = bars[0].close;
        let prev_price = bars.get(1).map(|b| b.close).unwrap_or(price);

        let view = MarketView {
            rsi,
            price,
            sma,
            vwap,
            position_quantity: ledger.open_quantity(instrument) as i64,
            prev_price,
            cash_available: ledger.bankroll().balance,
            total_exposure: ledger.total_exposure(),
            starting_cash: trading.starting_cash,
        };
        let state = TradingState::from_market_view(&view);
        Ok((view, state))
    }

    /// Execute the chosen action against the ledger and write it through to
    /// the store. Returns (executed, realized_pnl).
    async fn execute_action(
        &self,
        ledger: &mut Ledger,
        instrument: &str,
        action: Action,
        open_qty: u32,
        price: f64,
        reasoning: &str,
        now: chrono::DateTime<Utc>,
    ) -> Result<(bool, f64)> {
        let trading = &self.config.trading;

        match action {
            Action::Hold => Ok((true, 0.0)),
            Action::Buy => {
                let quantity = trading.lot_size.min(trading.max_position_size.saturating_sub(open_qty));
                if quantity == 0 {
                    debug!(instrument = %instrument, "position cap reached, BUY skipped");
                    return Ok((false, 0.0));
                }
                match ledger.execute(
                    instrument,
                    TradeSide::Buy,
                    quantity,
                    price,
                    STRATEGY_TAG,
                    reasoning,
                    now,
                ) {
                    Ok(execution) => {
                        self.commit_execution(&execution).await?;
                        Ok((true, 0.0))
                    }
                    Err(err @ QtradeError::InsufficientFunds { .. }) => {
                        debug!(instrument = %instrument, %err, "BUY skipped");
                        Ok((false, 0.0))
                    }
                    Err(err) => Err(err),
                }
            }
            Action::Sell => {
                if open_qty == 0 {
                    debug!(instrument = %instrument, "nothing open, SELL skipped");
                    return Ok((false, 0.0));
                }
                match ledger.execute(
                    instrument,
                    TradeSide::Sell,
                    open_qty,
                    price,
                    STRATEGY_TAG,
                    reasoning,
                    now,
                ) {
                    Ok(execution) => {
                        let pnl = execution.realized_pnl;
                        self.commit_execution(&execution).await?;
                        Ok((true, pnl))
                    }
                    Err(err @ QtradeError::InsufficientPosition { .. }) => {
                        debug!(instrument = %instrument, %err, "SELL rejected");
                        Ok((false, 0.0))
                    }
                    Err(err) => Err(err),
                }
            }
        }
    }

    /// Persist one ledger execution: the new trade plus the lot mutations
    /// FIFO matching applied. Lot ids in the updates are store ids because
    /// the ledger was rebuilt from persisted trades this cycle.
    async fn commit_execution(&self, execution: &Execution) -> Result<()> {
        self.store.append_trade(&execution.trade).await?;
        for (trade_id, update) in &execution.lot_updates {
            self.store.update_trade(*trade_id, update).await?;
        }
        Ok(())
    }
}

fn decision_reasoning(view: &MarketView) -> String {
    let sma_pct = if view.sma > 0.0 {
        (view.price - view.sma) / view.sma * 100.0
    } else {
        0.0
    };
    let vwap_pct = if view.vwap > 0.0 {
        (view.price - view.vwap) / view.vwap * 100.0
    } else {
        0.0
    };
    format!(
        "RSI={:.1} | Price vs SMA: {:+.2}% | Price vs VWAP: {:+.2}%",
        view.rsi, sma_pct, vwap_pct
    )
}

fn instrument_win_stats(ledger: &Ledger, instrument: &str) -> (u32, u32) {
    let mut closed = 0u32;
    let mut wins = 0u32;
    for trade in ledger.trades() {
        if trade.instrument != instrument {
            continue;
        }
        if let Some(pnl) = trade.profit_loss {
            closed += 1;
            if pnl > 0.0 {
                wins += 1;
            }
        }
    }
    (closed, wins)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_adaptive_decay_thresholds() {
        assert_eq!(adaptive_decay(0.0, 0), 0.99);
        assert_eq!(adaptive_decay(0.5, 10), 0.98);
        assert_eq!(adaptive_decay(0.8, 10), 0.98);
        assert_eq!(adaptive_decay(0.3, 10), 0.995);
        assert_eq!(adaptive_decay(0.1, 10), 0.995);
        assert_eq!(adaptive_decay(0.4, 10), 0.99);
    }

    #[test]
    fn test_decision_reasoning_format() {
        let view = MarketView {
            rsi: 28.46,
            price: 101.0,
            sma: 100.0,
            vwap: 102.0,
            position_quantity: 0,
            prev_price: 100.0,
            cash_available: 10_000.0,
            total_exposure: 0.0,
            starting_cash: 10_000.0,
        };
        let text = decision_reasoning(&view);
        assert!(text.starts_with("RSI=28.5 | Price vs SMA: +1.00%"));
        assert!(text.contains("Price vs VWAP: -0.98%"));
    }
}

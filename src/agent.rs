//! Q-Learning Agent
//!
//! Tabular Q-learning over the discretized `TradingState`. The agent keeps a
//! sparse state -> action -> value table, selects actions epsilon-greedily,
//! applies the Bellman update after each decision, and decays exploration at
//! episode boundaries. One agent (and one table) exists per instrument.
//!
//! Snapshots serialize the full table plus hyperparameters. Loading tolerates
//! the earlier coarse state schema that only knew three RSI buckets: every
//! NEUTRAL-RSI entry is expanded into WEAK/NEUTRAL/STRONG entries sharing the
//! original action-values. Corrupt entries are skipped with a warning instead
//! of failing the whole load.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use tracing::{debug, warn};

use crate::config::AgentConfig;
use crate::domain::{RsiBucket, TradingState};
use crate::error::Result;

/// Bounds for the exploration decay factor; adaptive tuning is clamped into
/// this range so a bad win-rate signal cannot freeze or kill exploration.
pub const DECAY_MIN: f64 = 0.5;
pub const DECAY_MAX: f64 = 0.999;

/// Trading action.
///
/// The enumeration order is the argmax tie-break order: when Q-values are
/// equal the first maximum wins, so BUY beats SELL beats HOLD. This is
/// observable behavior and must not be reordered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Action {
    Buy,
    Sell,
    Hold,
}

/// All actions in tie-break order
pub const ACTIONS: [Action; 3] = [Action::Buy, Action::Sell, Action::Hold];

impl Action {
    pub fn index(&self) -> usize {
        match self {
            Action::Buy => 0,
            Action::Sell => 1,
            Action::Hold => 2,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Action::Buy => "BUY",
            Action::Sell => "SELL",
            Action::Hold => "HOLD",
        }
    }
}

impl std::fmt::Display for Action {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for Action {
    type Err = &'static str;

    fn from_str(raw: &str) -> std::result::Result<Self, Self::Err> {
        match raw {
            "BUY" => Ok(Action::Buy),
            "SELL" => Ok(Action::Sell),
            "HOLD" => Ok(Action::Hold),
            _ => Err("invalid action"),
        }
    }
}

/// Q-values for all three actions in one state
pub type ActionValues = [f64; 3];

/// Serialized agent state: the full Q-table keyed by the compact state key,
/// plus hyperparameters and learning statistics.
///
/// Older snapshots may lack the decay fields; defaults are applied on load.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentSnapshot {
    pub q_table: BTreeMap<String, BTreeMap<String, f64>>,
    pub learning_rate: f64,
    pub discount_factor: f64,
    pub exploration_rate: f64,
    #[serde(default = "default_snapshot_decay")]
    pub exploration_decay: f64,
    #[serde(default = "default_snapshot_min_exploration")]
    pub min_exploration: f64,
    pub total_episodes: u64,
    pub total_rewards: f64,
}

fn default_snapshot_decay() -> f64 {
    0.995
}

fn default_snapshot_min_exploration() -> f64 {
    0.01
}

/// Agent learning statistics for diagnostics and reports
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentStats {
    pub total_episodes: u64,
    pub exploration_rate: f64,
    pub avg_reward: f64,
    pub q_table_size: usize,
    pub total_rewards: f64,
}

/// Tabular Q-learning agent for one instrument.
pub struct QLearningAgent {
    learning_rate: f64,
    discount_factor: f64,
    exploration_rate: f64,
    exploration_decay: f64,
    min_exploration: f64,
    total_episodes: u64,
    total_rewards: f64,
    q_table: HashMap<TradingState, ActionValues>,
    rng: StdRng,
}

impl QLearningAgent {
    pub fn new(config: &AgentConfig) -> Self {
        Self::with_rng(config, StdRng::from_entropy())
    }

    /// Construct with a seeded RNG for deterministic tests.
    pub fn with_rng(config: &AgentConfig, rng: StdRng) -> Self {
        Self {
            learning_rate: config.learning_rate,
            discount_factor: config.discount_factor,
            exploration_rate: config.exploration_rate,
            exploration_decay: config.exploration_decay.clamp(DECAY_MIN, DECAY_MAX),
            min_exploration: config.min_exploration,
            total_episodes: 0,
            total_rewards: 0.0,
            q_table: HashMap::new(),
            rng,
        }
    }

    /// Q-values for every action in a state, lazily materializing an
    /// all-zero row the first time a state is seen. A state is never left
    /// partially populated.
    pub fn q_values(&mut self, state: &TradingState) -> ActionValues {
        *self.q_table.entry(*state).or_insert([0.0; 3])
    }

    pub fn get_q(&mut self, state: &TradingState, action: Action) -> f64 {
        self.q_values(state)[action.index()]
    }

    /// Highest-valued action; ties go to the first maximum in
    /// BUY, SELL, HOLD order.
    pub fn best_action(&mut self, state: &TradingState) -> Action {
        let values = self.q_values(state);
        let mut best = ACTIONS[0];
        let mut best_value = values[0];
        for action in &ACTIONS[1..] {
            if values[action.index()] > best_value {
                best = *action;
                best_value = values[action.index()];
            }
        }
        best
    }

    /// Epsilon-greedy action selection.
    ///
    /// Returns the chosen action and whether it was a random exploration
    /// draw. `force_exploit` bypasses exploration entirely (deployment mode).
    pub fn choose_action(&mut self, state: &TradingState, force_exploit: bool) -> (Action, bool) {
        if force_exploit {
            return (self.best_action(state), false);
        }

        if self.rng.gen::<f64>() < self.exploration_rate {
            let action = ACTIONS[self.rng.gen_range(0..ACTIONS.len())];
            (action, true)
        } else {
            (self.best_action(state), false)
        }
    }

    /// Bellman update:
    /// Q(s,a) <- Q(s,a) + alpha * (target - Q(s,a)), where target is the
    /// plain reward when the episode is done, else
    /// reward + gamma * max_a' Q(s',a').
    pub fn update(
        &mut self,
        state: &TradingState,
        action: Action,
        reward: f64,
        next_state: &TradingState,
        done: bool,
    ) {
        let current = self.get_q(state, action);
        let target = if done {
            reward
        } else {
            let next_values = self.q_values(next_state);
            let max_next = next_values
                .iter()
                .copied()
                .fold(f64::NEG_INFINITY, f64::max);
            reward + self.discount_factor * max_next
        };

        let new_q = current + self.learning_rate * (target - current);
        self.q_table
            .entry(*state)
            .or_insert([0.0; 3])[action.index()] = new_q;
        self.total_rewards += reward;

        debug!(
            action = %action,
            reward,
            old_q = current,
            new_q,
            done,
            "applied Q-update"
        );
    }

    /// Mark an episode (one logical trading cycle) complete and decay
    /// exploration toward the floor. Must run exactly once per cycle per
    /// instrument, including idle instruments, or epsilon never converges.
    pub fn finish_episode(&mut self) {
        self.total_episodes += 1;
        self.exploration_rate =
            (self.exploration_rate * self.exploration_decay).max(self.min_exploration);
    }

    /// Set the decay factor, clamped into [DECAY_MIN, DECAY_MAX].
    pub fn set_exploration_decay(&mut self, decay: f64) {
        self.exploration_decay = decay.clamp(DECAY_MIN, DECAY_MAX);
    }

    pub fn exploration_rate(&self) -> f64 {
        self.exploration_rate
    }

    pub fn exploration_decay(&self) -> f64 {
        self.exploration_decay
    }

    pub fn total_episodes(&self) -> u64 {
        self.total_episodes
    }

    pub fn stats(&self) -> AgentStats {
        AgentStats {
            total_episodes: self.total_episodes,
            exploration_rate: self.exploration_rate,
            avg_reward: self.total_rewards / self.total_episodes.max(1) as f64,
            q_table_size: self.q_table.len(),
            total_rewards: self.total_rewards,
        }
    }

    /// Serialize the full table and parameters for persistence.
    pub fn snapshot(&self) -> AgentSnapshot {
        let mut q_table = BTreeMap::new();
        for (state, values) in &self.q_table {
            let mut row = BTreeMap::new();
            for action in ACTIONS {
                row.insert(action.as_str().to_string(), values[action.index()]);
            }
            q_table.insert(state.to_key(), row);
        }

        AgentSnapshot {
            q_table,
            learning_rate: self.learning_rate,
            discount_factor: self.discount_factor,
            exploration_rate: self.exploration_rate,
            exploration_decay: self.exploration_decay,
            min_exploration: self.min_exploration,
            total_episodes: self.total_episodes,
            total_rewards: self.total_rewards,
        }
    }

    /// Restore an agent from a persisted snapshot.
    ///
    /// Corrupt table entries are skipped with a warning so one bad row never
    /// loses the rest of the table. After parsing, the legacy RSI schema is
    /// migrated if needed.
    pub fn restore(snapshot: &AgentSnapshot) -> Result<Self> {
        let mut q_table = HashMap::new();

        for (key, row) in &snapshot.q_table {
            let state = match TradingState::from_key(key) {
                Ok(state) => state,
                Err(err) => {
                    warn!(key = %key, %err, "skipping malformed Q-table entry");
                    continue;
                }
            };

            let mut values = [0.0; 3];
            for (action_str, value) in row {
                match action_str.parse::<Action>() {
                    Ok(action) => values[action.index()] = *value,
                    Err(_) => {
                        warn!(key = %key, action = %action_str, "skipping malformed action entry");
                    }
                }
            }
            q_table.insert(state, values);
        }

        let q_table = migrate_legacy_rsi(q_table);

        Ok(Self {
            learning_rate: snapshot.learning_rate,
            discount_factor: snapshot.discount_factor,
            exploration_rate: snapshot.exploration_rate,
            exploration_decay: snapshot.exploration_decay.clamp(DECAY_MIN, DECAY_MAX),
            min_exploration: snapshot.min_exploration,
            total_episodes: snapshot.total_episodes,
            total_rewards: snapshot.total_rewards,
            q_table,
            rng: StdRng::from_entropy(),
        })
    }

    #[cfg(test)]
    fn table_len(&self) -> usize {
        self.q_table.len()
    }
}

/// Expand a table written under the legacy 3-bucket RSI schema to the
/// current 5-bucket schema.
///
/// Each NEUTRAL-RSI entry is duplicated into WEAK and STRONG entries with
/// identical action-values; other buckets are untouched. A table that
/// already contains any WEAK or STRONG entry is considered migrated and is
/// returned unchanged, which makes the transform idempotent. Detection by
/// bucket-label presence rather than a version tag is a known sharp edge
/// kept for compatibility with already-trained tables.
pub fn migrate_legacy_rsi(
    table: HashMap<TradingState, ActionValues>,
) -> HashMap<TradingState, ActionValues> {
    let already_migrated = table
        .keys()
        .any(|s| matches!(s.rsi, RsiBucket::Weak | RsiBucket::Strong));
    if already_migrated {
        return table;
    }

    let mut migrated = HashMap::with_capacity(table.len() * 2);
    for (state, values) in table {
        if state.rsi == RsiBucket::Neutral {
            for rsi in [RsiBucket::Weak, RsiBucket::Neutral, RsiBucket::Strong] {
                let mut expanded = state;
                expanded.rsi = rsi;
                migrated.insert(expanded, values);
            }
        } else {
            migrated.insert(state, values);
        }
    }
    migrated
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{
        CashBucket, ExposureBucket, LevelPosition, PositionStatus, PriceMomentum,
    };

    fn state_with_rsi(rsi: RsiBucket) -> TradingState {
        TradingState {
            rsi,
            ma_position: LevelPosition::At,
            vwap_position: LevelPosition::At,
            position_status: PositionStatus::Flat,
            price_momentum: PriceMomentum::Flat,
            cash: CashBucket::High,
            exposure: ExposureBucket::None,
        }
    }

    fn agent() -> QLearningAgent {
        QLearningAgent::with_rng(&AgentConfig::default(), StdRng::seed_from_u64(42))
    }

    #[test]
    fn test_unseen_state_materializes_all_zero() {
        let mut agent = agent();
        let state = state_with_rsi(RsiBucket::Neutral);
        assert_eq!(agent.q_values(&state), [0.0, 0.0, 0.0]);
        assert_eq!(agent.table_len(), 1);
    }

    #[test]
    fn test_tie_break_prefers_buy_then_sell() {
        let mut agent = agent();
        let state = state_with_rsi(RsiBucket::Neutral);

        // All zero: first maximum wins
        assert_eq!(agent.best_action(&state), Action::Buy);

        // SELL and HOLD tied above BUY: SELL wins
        agent.q_table.insert(state, [-1.0, 0.5, 0.5]);
        assert_eq!(agent.best_action(&state), Action::Sell);
    }

    #[test]
    fn test_force_exploit_is_deterministic() {
        let mut agent = agent();
        let state = state_with_rsi(RsiBucket::Oversold);
        agent.q_table.insert(state, [0.1, 2.0, 0.3]);

        for _ in 0..50 {
            let (action, was_random) = agent.choose_action(&state, true);
            assert_eq!(action, Action::Sell);
            assert!(!was_random);
        }
    }

    #[test]
    fn test_zero_epsilon_never_explores() {
        let config = AgentConfig {
            exploration_rate: 0.0,
            ..Default::default()
        };
        let mut agent = QLearningAgent::with_rng(&config, StdRng::seed_from_u64(7));
        let state = state_with_rsi(RsiBucket::Neutral);

        for _ in 0..100 {
            let (_, was_random) = agent.choose_action(&state, false);
            assert!(!was_random);
        }
    }

    #[test]
    fn test_full_epsilon_always_explores() {
        let mut agent = agent(); // exploration_rate = 1.0
        let state = state_with_rsi(RsiBucket::Neutral);
        for _ in 0..100 {
            let (_, was_random) = agent.choose_action(&state, false);
            assert!(was_random);
        }
    }

    #[test]
    fn test_update_moves_toward_target() {
        let mut agent = agent();
        let state = state_with_rsi(RsiBucket::Oversold);
        let next = state_with_rsi(RsiBucket::Neutral);

        // done=true: target is the bare reward
        agent.update(&state, Action::Buy, 5.0, &next, true);
        assert!((agent.get_q(&state, Action::Buy) - 0.5).abs() < 1e-9);

        // done=false: target includes discounted best next value
        agent.q_table.insert(next, [2.0, 0.0, 1.0]);
        agent.update(&state, Action::Buy, 1.0, &next, false);
        // target = 1.0 + 0.95 * 2.0 = 2.9; q = 0.5 + 0.1 * (2.9 - 0.5)
        assert!((agent.get_q(&state, Action::Buy) - 0.74).abs() < 1e-9);
    }

    #[test]
    fn test_finish_episode_decays_monotonically_to_floor() {
        let mut agent = agent();
        let mut prev = agent.exploration_rate();
        for _ in 0..5_000 {
            agent.finish_episode();
            let current = agent.exploration_rate();
            assert!(current <= prev);
            assert!(current >= 0.01);
            prev = current;
        }
        assert!((agent.exploration_rate() - 0.01).abs() < 1e-12);
        assert_eq!(agent.total_episodes(), 5_000);
    }

    #[test]
    fn test_decay_is_clamped() {
        let mut agent = agent();
        agent.set_exploration_decay(0.1);
        assert!((agent.exploration_decay() - DECAY_MIN).abs() < 1e-12);
        agent.set_exploration_decay(1.5);
        assert!((agent.exploration_decay() - DECAY_MAX).abs() < 1e-12);
        agent.set_exploration_decay(0.98);
        assert!((agent.exploration_decay() - 0.98).abs() < 1e-12);
    }

    #[test]
    fn test_snapshot_roundtrip() {
        let mut agent = agent();
        let state = state_with_rsi(RsiBucket::Strong);
        agent.q_table.insert(state, [1.5, -0.5, 0.25]);
        agent.finish_episode();

        let snapshot = agent.snapshot();
        let mut restored = QLearningAgent::restore(&snapshot).unwrap();

        assert!((restored.get_q(&state, Action::Buy) - 1.5).abs() < 1e-9);
        assert!((restored.get_q(&state, Action::Sell) + 0.5).abs() < 1e-9);
        assert_eq!(restored.total_episodes(), 1);
        assert!((restored.exploration_rate() - agent.exploration_rate()).abs() < 1e-12);
    }

    #[test]
    fn test_restore_skips_malformed_entries() {
        let mut agent = agent();
        agent.q_table.insert(state_with_rsi(RsiBucket::Weak), [1.0, 0.0, 0.0]);
        let mut snapshot = agent.snapshot();

        let mut bad_row = BTreeMap::new();
        bad_row.insert("BUY".to_string(), 9.9);
        snapshot
            .q_table
            .insert("GARBAGE|AT|AT|FLAT|FLAT|HIGH|NONE".to_string(), bad_row);

        let restored = QLearningAgent::restore(&snapshot).unwrap();
        assert_eq!(restored.table_len(), 1);
    }

    #[test]
    fn test_legacy_migration_expands_neutral() {
        let mut table = HashMap::new();
        table.insert(state_with_rsi(RsiBucket::Neutral), [1.0, 2.0, 3.0]);
        table.insert(state_with_rsi(RsiBucket::Oversold), [4.0, 0.0, 0.0]);

        let migrated = migrate_legacy_rsi(table);
        assert_eq!(migrated.len(), 4);
        for rsi in [RsiBucket::Weak, RsiBucket::Neutral, RsiBucket::Strong] {
            assert_eq!(migrated[&state_with_rsi(rsi)], [1.0, 2.0, 3.0]);
        }
        assert_eq!(migrated[&state_with_rsi(RsiBucket::Oversold)], [4.0, 0.0, 0.0]);
    }

    #[test]
    fn test_legacy_migration_is_idempotent() {
        let mut table = HashMap::new();
        table.insert(state_with_rsi(RsiBucket::Neutral), [1.0, 2.0, 3.0]);

        let once = migrate_legacy_rsi(table);
        let twice = migrate_legacy_rsi(once.clone());
        assert_eq!(once, twice);
    }

    #[test]
    fn test_stats_reflect_learning() {
        let mut agent = agent();
        let state = state_with_rsi(RsiBucket::Neutral);
        agent.update(&state, Action::Hold, 2.0, &state, true);
        agent.finish_episode();

        let stats = agent.stats();
        assert_eq!(stats.total_episodes, 1);
        assert_eq!(stats.q_table_size, 1);
        assert!((stats.total_rewards - 2.0).abs() < 1e-9);
        assert!((stats.avg_reward - 2.0).abs() < 1e-9);
    }
}

//! Strategy instances and entry signals
//!
//! A strategy instance owns at most one non-terminal position per market,
//! its immutable config, its aggregate stats, and the idempotent-entry
//! record that prevents double entries. The *when and which side* decision
//! is behind the [`EntrySignal`] trait: the engine loop is identical for
//! every strategy, only the signal differs.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use std::collections::HashMap;
use tracing::{debug, error};

use crate::config::StrategyConfig;
use crate::persistence::StrategySnapshot;
use crate::types::{AggregateStats, MarketRef, OutcomeToken, Position};

/// Market data handed to an entry signal on each tick.
#[derive(Debug, Clone)]
pub struct MarketSnapshot {
    /// Current mid price per outcome token (missing quotes are skipped)
    pub mids: Vec<(OutcomeToken, Decimal)>,
    pub seconds_to_close: i64,
}

/// A signal's verdict: which outcome to buy and at what limit price.
#[derive(Debug, Clone)]
pub struct EntryDecision {
    pub outcome: OutcomeToken,
    pub limit_price: Decimal,
}

/// The pluggable entry decision. Implementations are free to hold state
/// between ticks (trend trackers, forecast caches, ...).
pub trait EntrySignal: Send + Sync {
    fn decide(
        &mut self,
        market: &MarketRef,
        snapshot: &MarketSnapshot,
        cfg: &StrategyConfig,
    ) -> Option<EntryDecision>;
}

/// Buy the current favorite once it is confident enough but still cheap:
/// the leader's mid must clear `min_leader_prob` and stay under the
/// strategy's entry ceiling. The limit is improved slightly over mid so a
/// resting order has a realistic chance to fill before close.
pub struct FavoriteSignal {
    pub min_leader_prob: Decimal,
}

impl Default for FavoriteSignal {
    fn default() -> Self {
        Self {
            min_leader_prob: dec!(0.55),
        }
    }
}

impl EntrySignal for FavoriteSignal {
    fn decide(
        &mut self,
        _market: &MarketRef,
        snapshot: &MarketSnapshot,
        cfg: &StrategyConfig,
    ) -> Option<EntryDecision> {
        let (leader, leader_mid) = snapshot
            .mids
            .iter()
            .max_by_key(|(_, mid)| *mid)
            .cloned()?;

        if leader_mid < self.min_leader_prob {
            debug!(leader = %leader.label, mid = %leader_mid, "No clear leader yet");
            return None;
        }
        if leader_mid > cfg.entry_price_ceiling {
            debug!(leader = %leader.label, mid = %leader_mid, "Leader already too expensive");
            return None;
        }

        let limit_price = (leader_mid + dec!(0.02))
            .min(cfg.entry_price_ceiling)
            .clamp(dec!(0.01), dec!(0.99));
        Some(EntryDecision {
            outcome: leader,
            limit_price,
        })
    }
}

/// One running strategy: config + stats + live position + entry guard.
pub struct StrategyInstance {
    pub config: StrategyConfig,
    pub stats: AggregateStats,
    /// The current attempted-or-open trade, if any
    pub position: Option<Position>,
    signal: Box<dyn EntrySignal>,
    /// Markets already attempted, keyed by market id with the market close
    /// time for bounded eviction. Marked *before* the entry order call is
    /// awaited so a second tick cannot double-enter.
    attempted: HashMap<String, DateTime<Utc>>,
}

impl StrategyInstance {
    pub fn new(config: StrategyConfig, signal: Box<dyn EntrySignal>) -> Self {
        Self {
            config,
            stats: AggregateStats::default(),
            position: None,
            signal,
            attempted: HashMap::new(),
        }
    }

    /// Rebuild from a persisted snapshot. Recovered positions still need a
    /// gateway re-query before they can be trusted (engine recovery).
    pub fn from_snapshot(snapshot: StrategySnapshot, signal: Box<dyn EntrySignal>) -> Self {
        let mut attempted = HashMap::new();
        let position = snapshot.open_positions.into_iter().next();
        if let Some(p) = &position {
            attempted.insert(p.market.id.clone(), p.market.close_time);
        }
        Self {
            config: snapshot.config,
            stats: snapshot.stats,
            position,
            signal,
            attempted,
        }
    }

    pub fn to_snapshot(&self) -> StrategySnapshot {
        StrategySnapshot {
            tag: self.config.tag.clone(),
            config: self.config.clone(),
            stats: self.stats.clone(),
            open_positions: self
                .position
                .iter()
                .filter(|p| !p.state.is_terminal())
                .cloned()
                .collect(),
        }
    }

    pub fn has_live_position(&self) -> bool {
        self.position
            .as_ref()
            .map(|p| !p.state.is_terminal())
            .unwrap_or(false)
    }

    /// Ask the signal for an entry decision. Refuses if this market was
    /// already attempted or a live position exists — a double entry is a
    /// programming error, not a market condition.
    pub fn decide_entry(
        &mut self,
        market: &MarketRef,
        snapshot: &MarketSnapshot,
    ) -> Option<EntryDecision> {
        if self.has_live_position() {
            return None;
        }
        if self.attempted.contains_key(&market.id) {
            return None;
        }
        self.signal.decide(market, snapshot, &self.config)
    }

    /// Mark the market attempted. Must happen before the placement call is
    /// awaited.
    pub fn mark_attempted(&mut self, market: &MarketRef) {
        if self.has_live_position() {
            error!(
                strategy = %self.config.tag,
                market = %market.id,
                "Attempted entry while a live position exists"
            );
            debug_assert!(false, "double entry attempt");
            return;
        }
        self.attempted.insert(market.id.clone(), market.close_time);
    }

    pub fn already_attempted(&self, market_id: &str) -> bool {
        self.attempted.contains_key(market_id)
    }

    /// Drop attempt records for markets that closed more than `keep_secs`
    /// ago, so the guard map stays bounded.
    pub fn evict_attempted(&mut self, now: DateTime<Utc>, keep_secs: i64) {
        self.attempted
            .retain(|_, close_time| now.signed_duration_since(*close_time).num_seconds() < keep_secs);
    }

    pub fn attempted_len(&self) -> usize {
        self.attempted.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn cfg() -> StrategyConfig {
        StrategyConfig {
            tag: "test".to_string(),
            slug_prefix: "btc-updown-15m-".to_string(),
            period_secs: 900,
            reference_symbol: None,
            reference_interval: None,
            entry_price_ceiling: dec!(0.85),
            stop_distance: dec!(0.10),
            target_distance: dec!(0.10),
            notional_per_trade: dec!(1),
            min_shares: dec!(5),
            tick_size: dec!(0.01),
            entry_window_secs: 180,
            entry_timeout_secs: 60,
            close_safety_secs: 20,
        }
    }

    fn market() -> MarketRef {
        MarketRef {
            id: "cond-1".to_string(),
            question: "BTC up or down?".to_string(),
            outcome_tokens: vec![
                OutcomeToken {
                    token_id: "tok-up".to_string(),
                    label: "Up".to_string(),
                },
                OutcomeToken {
                    token_id: "tok-down".to_string(),
                    label: "Down".to_string(),
                },
            ],
            close_time: Utc::now() + Duration::seconds(120),
        }
    }

    fn snapshot(up_mid: Decimal, down_mid: Decimal) -> MarketSnapshot {
        let m = market();
        MarketSnapshot {
            mids: vec![
                (m.outcome_tokens[0].clone(), up_mid),
                (m.outcome_tokens[1].clone(), down_mid),
            ],
            seconds_to_close: 120,
        }
    }

    #[test]
    fn favorite_signal_buys_the_leader() {
        let mut signal = FavoriteSignal::default();
        let decision = signal
            .decide(&market(), &snapshot(dec!(0.62), dec!(0.38)), &cfg())
            .expect("leader above 0.55 should trigger");
        assert_eq!(decision.outcome.label, "Up");
        // mid + 0.02 improvement, still under the ceiling
        assert_eq!(decision.limit_price, dec!(0.64));
    }

    #[test]
    fn favorite_signal_waits_without_clear_leader() {
        let mut signal = FavoriteSignal::default();
        assert!(signal
            .decide(&market(), &snapshot(dec!(0.51), dec!(0.49)), &cfg())
            .is_none());
    }

    #[test]
    fn favorite_signal_skips_expensive_leader() {
        let mut signal = FavoriteSignal::default();
        assert!(signal
            .decide(&market(), &snapshot(dec!(0.91), dec!(0.09)), &cfg())
            .is_none());
    }

    #[test]
    fn favorite_signal_caps_limit_at_ceiling() {
        let mut signal = FavoriteSignal::default();
        let decision = signal
            .decide(&market(), &snapshot(dec!(0.84), dec!(0.16)), &cfg())
            .unwrap();
        assert_eq!(decision.limit_price, dec!(0.85));
    }

    #[test]
    fn attempted_guard_blocks_second_decision() {
        let mut instance = StrategyInstance::new(cfg(), Box::new(FavoriteSignal::default()));
        let m = market();
        let snap = snapshot(dec!(0.62), dec!(0.38));

        assert!(instance.decide_entry(&m, &snap).is_some());
        // Guard is set before the placement call returns.
        instance.mark_attempted(&m);
        assert!(instance.decide_entry(&m, &snap).is_none());
        assert!(instance.already_attempted("cond-1"));
    }

    #[test]
    fn attempted_guard_evicts_by_close_time() {
        let mut instance = StrategyInstance::new(cfg(), Box::new(FavoriteSignal::default()));
        let mut old_market = market();
        old_market.id = "cond-old".to_string();
        old_market.close_time = Utc::now() - Duration::seconds(7200);
        instance.mark_attempted(&old_market);
        instance.mark_attempted(&market());
        assert_eq!(instance.attempted_len(), 2);

        instance.evict_attempted(Utc::now(), 3600);
        assert_eq!(instance.attempted_len(), 1);
        assert!(!instance.already_attempted("cond-old"));
        assert!(instance.already_attempted("cond-1"));
    }

    #[test]
    fn snapshot_roundtrip_keeps_live_position_and_guard() {
        let mut instance = StrategyInstance::new(cfg(), Box::new(FavoriteSignal::default()));
        let m = market();
        let tok = m.outcome_tokens[0].clone();
        let mut p = Position::new("test", m.clone(), tok);
        p.state = crate::types::PositionState::EntrySubmitted;
        instance.mark_attempted(&m);
        instance.position = Some(p);

        let snap = instance.to_snapshot();
        assert_eq!(snap.open_positions.len(), 1);

        let restored = StrategyInstance::from_snapshot(snap, Box::new(FavoriteSignal::default()));
        assert!(restored.has_live_position());
        assert!(restored.already_attempted("cond-1"));
    }
}

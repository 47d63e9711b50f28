//! Engine: scheduler, recovery, and control surface
//!
//! One cooperative tick loop drives every strategy instance. Each tick an
//! instance either advances its position (fill polls, exits, settlement)
//! or evaluates entry (discovery → window check → signal → sizing → caps →
//! placement). Instances are independent: a slow gateway call in one
//! instance's turn delays the others but cannot corrupt them, and every
//! call is bounded by the timeout decorator around the gateway.
//!
//! The engine also owns recovery: at startup every persisted non-terminal
//! position re-queries the gateway before it resumes ticking, because a
//! crash can land between order placement and status acknowledgment.

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, watch};
use tracing::{debug, info, warn};

use crate::clob::{MarketDiscovery, MarketQuery, OrderGateway, ResolutionSource};
use crate::config::{ReconcilerConfig, SchedulerConfig, StrategyConfig};
use crate::persistence::{
    EngineSnapshot, SettledTradeRecord, SnapshotStore, TradeLog,
};
use crate::position;
use crate::reconcile::Reconciler;
use crate::sizing::{self, DailyCaps};
use crate::strategy::{EntrySignal, MarketSnapshot, StrategyInstance};
use crate::types::{AggregateStats, OrderStatus, Position, PositionEvent, PositionState};

/// Guard-map entries are kept this long past market close.
const ATTEMPT_RETENTION_SECS: i64 = 3600;

/// Returned by `stop_strategy`.
#[derive(Debug, Clone)]
pub struct StoppedSummary {
    pub tag: String,
    pub stats: AggregateStats,
    /// True if a resting entry order was cancelled during the stop
    pub cancelled_entry: bool,
    /// A position that was still open when the strategy stopped; it is no
    /// longer managed and must be handled by the operator
    pub open_position: Option<Position>,
}

/// Returned by `status`.
#[derive(Debug, Clone)]
pub struct StrategyStatus {
    pub tag: String,
    pub stats: AggregateStats,
    pub open_position: Option<Position>,
}

pub struct Engine {
    strategies: HashMap<String, StrategyInstance>,
    gateway: Arc<dyn OrderGateway>,
    resolution: Arc<dyn ResolutionSource>,
    discovery: Arc<dyn MarketDiscovery>,
    reconciler: Reconciler,
    snapshots: SnapshotStore,
    trade_log: Option<TradeLog>,
    caps: DailyCaps,
    scheduler: SchedulerConfig,
    events: broadcast::Sender<PositionEvent>,
}

impl Engine {
    pub fn new(
        gateway: Arc<dyn OrderGateway>,
        resolution: Arc<dyn ResolutionSource>,
        discovery: Arc<dyn MarketDiscovery>,
        reconciler_cfg: ReconcilerConfig,
        scheduler: SchedulerConfig,
        snapshots: SnapshotStore,
        trade_log: Option<TradeLog>,
        max_trades_per_day: u32,
    ) -> Self {
        let (events, _) = broadcast::channel(256);
        Self {
            strategies: HashMap::new(),
            gateway,
            resolution,
            discovery,
            reconciler: Reconciler::new(reconciler_cfg),
            snapshots,
            trade_log,
            caps: DailyCaps::new(max_trades_per_day),
            scheduler,
            events,
        }
    }

    /// Event stream: one event per position state transition.
    pub fn subscribe(&self) -> broadcast::Receiver<PositionEvent> {
        self.events.subscribe()
    }

    /// Register and start a strategy instance.
    pub fn start_strategy(
        &mut self,
        config: StrategyConfig,
        signal: Box<dyn EntrySignal>,
    ) -> Result<()> {
        let tag = config.tag.clone();
        if self.strategies.contains_key(&tag) {
            bail!("strategy '{tag}' is already running");
        }
        info!(strategy = %tag, "Strategy started");
        self.strategies
            .insert(tag, StrategyInstance::new(config, signal));
        Ok(())
    }

    /// Stop a strategy: cancel a resting entry order, report anything that
    /// remains open, drop the instance.
    pub async fn stop_strategy(&mut self, tag: &str) -> Result<StoppedSummary> {
        let mut instance = self
            .strategies
            .remove(tag)
            .with_context(|| format!("strategy '{tag}' is not running"))?;

        let mut cancelled_entry = false;
        if let Some(position) = instance.position.as_mut() {
            if position.state == PositionState::EntrySubmitted {
                if let Some(order) = &position.entry_order {
                    match self.gateway.cancel(&order.external_id).await {
                        Ok(()) => {
                            cancelled_entry = true;
                            position.state = PositionState::Aborted;
                            position.closed_at = Some(Utc::now());
                            let _ = self.events.send(PositionEvent::Aborted {
                                strategy_tag: tag.to_string(),
                                market_id: position.market.id.clone(),
                            });
                        }
                        Err(e) => {
                            warn!(strategy = %tag, error = %e, "Cancel during stop failed");
                        }
                    }
                }
            }
        }

        let open_position = instance
            .position
            .take()
            .filter(|p| !p.state.is_terminal());
        if let Some(p) = &open_position {
            warn!(
                strategy = %tag,
                market = %p.market.id,
                state = %p.state,
                "Strategy stopped with a live position; manual handling required"
            );
        }

        self.save_snapshot();
        Ok(StoppedSummary {
            tag: tag.to_string(),
            stats: instance.stats.clone(),
            cancelled_entry,
            open_position,
        })
    }

    pub fn status(&self, tag: &str) -> Option<StrategyStatus> {
        self.strategies.get(tag).map(|instance| StrategyStatus {
            tag: tag.to_string(),
            stats: instance.stats.clone(),
            open_position: instance
                .position
                .clone()
                .filter(|p| !p.state.is_terminal()),
        })
    }

    pub fn running_tags(&self) -> Vec<String> {
        self.strategies.keys().cloned().collect()
    }

    /// Restore strategies from a snapshot. Signals are not persisted, so a
    /// factory recreates one per strategy config.
    pub fn restore(
        &mut self,
        snapshot: EngineSnapshot,
        signal_factory: impl Fn(&StrategyConfig) -> Box<dyn EntrySignal>,
    ) {
        for strat in snapshot.strategies {
            let signal = signal_factory(&strat.config);
            let tag = strat.tag.clone();
            let instance = StrategyInstance::from_snapshot(strat, signal);
            info!(
                strategy = %tag,
                live_position = instance.has_live_position(),
                "Strategy restored from snapshot"
            );
            self.strategies.insert(tag, instance);
        }
    }

    /// Re-query the gateway for every recovered non-terminal position
    /// before the first tick. Stored status is a hint; the live answer
    /// wins, and every disagreement is logged as a recovery mismatch.
    pub async fn recover(&mut self) {
        for (tag, instance) in self.strategies.iter_mut() {
            let Some(pos) = instance.position.as_mut() else {
                continue;
            };
            if pos.state.is_terminal() {
                continue;
            }

            let mut events = Vec::new();
            match pos.state {
                PositionState::PendingEntry => {
                    // Crashed between deciding and acknowledging placement.
                    warn!(
                        strategy = %tag,
                        market = %pos.market.id,
                        "Recovered position without a confirmed order; aborting (possible ghost)"
                    );
                    pos.state = PositionState::Aborted;
                    pos.closed_at = Some(Utc::now());
                    events.push(PositionEvent::Aborted {
                        strategy_tag: tag.clone(),
                        market_id: pos.market.id.clone(),
                    });
                }
                PositionState::EntrySubmitted => {
                    if let Some(order) = pos.entry_order.as_mut() {
                        match self.gateway.order_status(&order.external_id).await {
                            Ok(live_status) => {
                                if live_status != order.status {
                                    warn!(
                                        strategy = %tag,
                                        order_id = %order.external_id,
                                        stored = %order.status,
                                        live = %live_status,
                                        "Recovery mismatch; trusting the gateway"
                                    );
                                }
                                order.status = live_status;
                                if live_status == OrderStatus::Cancelled {
                                    pos.state = PositionState::Aborted;
                                    pos.closed_at = Some(Utc::now());
                                    events.push(PositionEvent::Aborted {
                                        strategy_tag: tag.clone(),
                                        market_id: pos.market.id.clone(),
                                    });
                                }
                                // Filled is picked up by the next tick's
                                // normal fill handling.
                            }
                            Err(e) => {
                                debug!(error = %e, "Recovery status query failed; keeping stored state");
                            }
                        }
                    }
                }
                PositionState::ExitSubmitted => {
                    if let Some(order) = pos.exit_order.as_mut() {
                        match self.gateway.order_status(&order.external_id).await {
                            Ok(live_status) => {
                                if live_status != order.status {
                                    warn!(
                                        strategy = %tag,
                                        order_id = %order.external_id,
                                        stored = %order.status,
                                        live = %live_status,
                                        "Recovery mismatch on exit order; trusting the gateway"
                                    );
                                }
                                order.status = live_status;
                                if live_status == OrderStatus::Cancelled {
                                    // Exit died while we were down; the
                                    // shares are still held.
                                    pos.exit_order = None;
                                    pos.exit_reason = None;
                                    pos.state = PositionState::Open;
                                }
                            }
                            Err(e) => {
                                debug!(error = %e, "Recovery status query failed; keeping stored state");
                            }
                        }
                    }
                }
                PositionState::Open | PositionState::Closed | PositionState::Aborted => {}
            }

            if pos.state.is_terminal() {
                finalize_terminal(instance, self.trade_log.as_ref());
            }
            for event in events {
                let _ = self.events.send(event);
            }
        }
        self.save_snapshot();
    }

    /// Run the tick loop until `shutdown` flips.
    pub async fn run(&mut self, mut shutdown: watch::Receiver<bool>) {
        let mut interval =
            tokio::time::interval(Duration::from_secs(self.scheduler.tick_interval_secs.max(1)));
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        info!(
            tick_interval_secs = self.scheduler.tick_interval_secs,
            strategies = self.strategies.len(),
            "Engine loop started"
        );

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    self.tick(Utc::now()).await;
                }
                changed = shutdown.changed() => {
                    // A dropped sender also means shutdown.
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        self.save_snapshot();
        info!("Engine loop stopped");
    }

    /// One scheduler tick: advance every instance once, in turn.
    pub async fn tick(&mut self, now: DateTime<Utc>) {
        let gateway = Arc::clone(&self.gateway);
        let resolution = Arc::clone(&self.resolution);
        let discovery = Arc::clone(&self.discovery);

        let mut dirty = false;
        let tags: Vec<String> = self.strategies.keys().cloned().collect();
        for tag in tags {
            let Some(instance) = self.strategies.get_mut(&tag) else {
                continue;
            };
            let events = tick_instance(
                instance,
                &mut self.caps,
                &self.reconciler,
                self.trade_log.as_ref(),
                gateway.as_ref(),
                resolution.as_ref(),
                discovery.as_ref(),
                now,
            )
            .await;
            for event in events {
                dirty = true;
                let _ = self.events.send(event);
            }
        }

        if dirty {
            self.save_snapshot();
        }
    }

    fn save_snapshot(&self) {
        let snapshot = EngineSnapshot::new(
            self.strategies
                .values()
                .map(|instance| instance.to_snapshot())
                .collect(),
        );
        if let Err(e) = self.snapshots.save(&snapshot) {
            warn!(error = %e, "Snapshot save failed");
        }
    }
}

fn market_query(cfg: &StrategyConfig) -> MarketQuery {
    MarketQuery {
        slug_prefix: cfg.slug_prefix.clone(),
        period_secs: cfg.period_secs,
        reference_symbol: cfg.reference_symbol.clone(),
        reference_interval: cfg.reference_interval.clone(),
    }
}

/// Advance one strategy instance by one turn.
#[allow(clippy::too_many_arguments)]
async fn tick_instance(
    instance: &mut StrategyInstance,
    caps: &mut DailyCaps,
    reconciler: &Reconciler,
    trade_log: Option<&TradeLog>,
    gateway: &dyn OrderGateway,
    resolution: &dyn ResolutionSource,
    discovery: &dyn MarketDiscovery,
    now: DateTime<Utc>,
) -> Vec<PositionEvent> {
    instance.evict_attempted(now, ATTEMPT_RETENTION_SECS);
    caps.evict_before(now.date_naive().pred_opt().unwrap_or(now.date_naive()));

    if instance.has_live_position() {
        let cfg = instance.config.clone();
        let pos = instance.position.as_mut().expect("live position");

        let mut events = position::advance(pos, gateway, &cfg, now).await;

        // Holding through close: the market pays out instead of an exit.
        if !pos.state.is_terminal()
            && matches!(
                pos.state,
                PositionState::Open | PositionState::ExitSubmitted
            )
            && now >= pos.market.close_time
        {
            let resting_exit = pos
                .exit_order
                .as_ref()
                .filter(|o| o.status == OrderStatus::Live)
                .map(|o| o.external_id.clone());
            let (_, settle_events) = reconciler.settle(pos, resolution, now).await;
            if pos.state.is_terminal() {
                if let Some(order_id) = resting_exit {
                    // Best effort: nothing should fill after close, but a
                    // dangling order costs nothing to clean up.
                    if let Err(e) = gateway.cancel(&order_id).await {
                        debug!(order_id = %order_id, error = %e, "Post-settlement cancel failed");
                    }
                }
            }
            events.extend(settle_events);
        }

        if instance
            .position
            .as_ref()
            .map(|p| p.state.is_terminal())
            .unwrap_or(false)
        {
            finalize_terminal(instance, trade_log);
        }
        return events;
    }

    // No live position: look for an entry.
    let cfg = instance.config.clone();
    let query = market_query(&cfg);
    let market = match discovery.current_market(&query).await {
        Ok(Some(market)) => market,
        Ok(None) => return Vec::new(),
        Err(e) => {
            debug!(strategy = %cfg.tag, error = %e, "Market discovery failed");
            return Vec::new();
        }
    };

    let seconds_to_close = market.seconds_to_close(now);
    // No new entries inside the close-safety window, and no early entries
    // before the entry window opens.
    if seconds_to_close <= cfg.close_safety_secs || seconds_to_close > cfg.entry_window_secs {
        return Vec::new();
    }
    if instance.already_attempted(&market.id) {
        return Vec::new();
    }

    let today = now.date_naive();
    if caps.would_exceed(today, &cfg.tag) {
        debug!(strategy = %cfg.tag, "Daily trade cap reached");
        return Vec::new();
    }

    // Quote every outcome for the signal.
    let mut mids = Vec::with_capacity(market.outcome_tokens.len());
    for token in &market.outcome_tokens {
        match gateway.mid_price(token).await {
            Ok(Some(mid)) => mids.push((token.clone(), mid)),
            Ok(None) => {}
            Err(e) => {
                debug!(token = %token.token_id, error = %e, "Quote failed");
            }
        }
    }
    if mids.is_empty() {
        return Vec::new();
    }

    let snapshot = MarketSnapshot {
        mids,
        seconds_to_close,
    };
    let Some(decision) = instance.decide_entry(&market, &snapshot) else {
        return Vec::new();
    };

    let sized = match sizing::size_for_spend(
        cfg.notional_per_trade,
        decision.limit_price,
        cfg.min_shares,
        cfg.tick_size,
    ) {
        Ok(sized) => sized,
        Err(e) => {
            warn!(strategy = %cfg.tag, error = %e, "Entry sizing rejected");
            return Vec::new();
        }
    };

    // Idempotent-entry guard: mark the market attempted BEFORE the
    // placement call suspends, so a second tick cannot double-enter.
    instance.mark_attempted(&market);
    caps.record(today, &cfg.tag);

    let mut position = Position::new(&cfg.tag, market, decision.outcome);
    let events = position::place_entry(&mut position, sized, gateway).await;
    instance.position = Some(position);

    if instance
        .position
        .as_ref()
        .map(|p| p.state.is_terminal())
        .unwrap_or(false)
    {
        finalize_terminal(instance, trade_log);
    }
    events
}

/// Fold a terminal position into the aggregate stats and the trade log,
/// then release the slot for the next market.
fn finalize_terminal(instance: &mut StrategyInstance, trade_log: Option<&TradeLog>) {
    let Some(position) = instance.position.take() else {
        return;
    };

    let result = match position.state {
        PositionState::Aborted => "ABORTED".to_string(),
        PositionState::Closed => match position.realized_pnl {
            // Forced resolutions carry no PnL and are audited separately.
            None => {
                instance.stats.record_forced();
                "FORCED".to_string()
            }
            Some(pnl) if pnl >= rust_decimal::Decimal::ZERO => {
                instance.stats.record_win(pnl);
                "WIN".to_string()
            }
            Some(pnl) => {
                instance.stats.record_loss(pnl);
                "LOSS".to_string()
            }
        },
        _ => unreachable!("finalize_terminal on non-terminal position"),
    };

    if let Some(log) = trade_log {
        let record = SettledTradeRecord {
            timestamp: position
                .closed_at
                .map(|t| t.timestamp_millis())
                .unwrap_or_else(|| Utc::now().timestamp_millis()),
            strategy_tag: position.strategy_tag.clone(),
            market_id: position.market.id.clone(),
            question: position.market.question.clone(),
            outcome: position.outcome.label.clone(),
            entry_price: position.fill_price,
            shares: position.shares,
            notional_cost: position.notional_cost,
            exit_price: position.exit_price,
            result,
            exit_reason: position.exit_reason.map(|r| r.to_string()),
            pnl: position.realized_pnl,
        };
        if let Err(e) = log.append(&record) {
            warn!(error = %e, "Trade log append failed");
        }
    }
}

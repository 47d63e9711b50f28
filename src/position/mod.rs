//! Position state machine
//!
//! Drives one position through its lifecycle:
//!
//! ```text
//! PendingEntry --place confirmed--> EntrySubmitted
//! EntrySubmitted --cancelled/expired--> Aborted
//! EntrySubmitted --filled--> Open            (fill price recorded here)
//! EntrySubmitted --timeout or close-safety--> cancel --> Aborted
//! Open --stop/target--> ExitSubmitted        (limit first, escalate on failure)
//! Open --close-safety window--> market sell --> ExitSubmitted
//! ExitSubmitted --filled--> Closed           (realized PnL computed)
//! Open --market resolves unsold--> reconciler --> Closed
//! ```
//!
//! Each tick performs at most one transition per position, and every
//! external call that fails leaves the state untouched for the next tick.
//! A waiting state always carries a deadline: the entry timeout, or the
//! close-safety margin, whichever comes first.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use tracing::{debug, error, info, warn};

use crate::clob::{GatewayError, OrderGateway};
use crate::config::StrategyConfig;
use crate::sizing::{self, SizedOrder};
use crate::types::{
    ExitReason, OrderStatus, Position, PositionEvent, PositionState,
};

/// PnL and notional amounts are kept at 6 decimal places (USDC precision).
const MONEY_DP: u32 = 6;

/// Place the entry order for a fresh `PendingEntry` position.
///
/// The owning strategy must mark the market as attempted *before* awaiting
/// this call. A definitive rejection aborts the position; an ambiguous
/// failure (timeout, transport) also aborts but is logged loudly because
/// the order may exist upstream as a ghost — recovery re-checks on restart.
pub async fn place_entry(
    position: &mut Position,
    sized: SizedOrder,
    gateway: &dyn OrderGateway,
) -> Vec<PositionEvent> {
    debug_assert_eq!(position.state, PositionState::PendingEntry);

    match gateway
        .place_limit_buy(&position.outcome, sized.price, sized.shares)
        .await
    {
        Ok(order) => {
            info!(
                strategy = %position.strategy_tag,
                market = %position.market.id,
                outcome = %position.outcome.label,
                order_id = %order.external_id,
                price = %sized.price,
                shares = %sized.shares,
                "Entry order submitted"
            );
            position.shares = sized.shares;
            position.entry_order = Some(order);
            position.state = PositionState::EntrySubmitted;
            vec![PositionEvent::Entered {
                strategy_tag: position.strategy_tag.clone(),
                market_id: position.market.id.clone(),
                outcome: position.outcome.label.clone(),
                limit_price: sized.price,
                shares: sized.shares,
            }]
        }
        Err(GatewayError::Rejected(msg)) => {
            warn!(
                strategy = %position.strategy_tag,
                market = %position.market.id,
                reason = %msg,
                "Entry order rejected"
            );
            abort(position, Utc::now())
        }
        Err(e) => {
            // The response was lost, not necessarily the order. Recovery
            // reconciles any ghost on the next restart.
            error!(
                strategy = %position.strategy_tag,
                market = %position.market.id,
                error = %e,
                "Entry placement failed without confirmation; possible ghost order"
            );
            abort(position, Utc::now())
        }
    }
}

/// Advance a non-terminal position by at most one transition.
pub async fn advance(
    position: &mut Position,
    gateway: &dyn OrderGateway,
    cfg: &StrategyConfig,
    now: DateTime<Utc>,
) -> Vec<PositionEvent> {
    match position.state {
        PositionState::EntrySubmitted => entry_submitted_tick(position, gateway, cfg, now).await,
        PositionState::Open => open_tick(position, gateway, cfg, now).await,
        PositionState::ExitSubmitted => exit_submitted_tick(position, gateway, cfg, now).await,
        PositionState::PendingEntry => {
            debug!(position = %position.id, "PendingEntry position not yet placed");
            Vec::new()
        }
        PositionState::Closed | PositionState::Aborted => Vec::new(),
    }
}

fn abort(position: &mut Position, now: DateTime<Utc>) -> Vec<PositionEvent> {
    position.state = PositionState::Aborted;
    position.closed_at = Some(now);
    vec![PositionEvent::Aborted {
        strategy_tag: position.strategy_tag.clone(),
        market_id: position.market.id.clone(),
    }]
}

async fn entry_submitted_tick(
    position: &mut Position,
    gateway: &dyn OrderGateway,
    cfg: &StrategyConfig,
    now: DateTime<Utc>,
) -> Vec<PositionEvent> {
    let Some(order_id) = position.entry_order.as_ref().map(|o| o.external_id.clone()) else {
        error!(position = %position.id, "EntrySubmitted without an entry order");
        return abort(position, now);
    };

    let status = match gateway.order_status(&order_id).await {
        Ok(status) => status,
        Err(e) => {
            // Unknown, not a negative result. Try again next tick.
            debug!(order_id = %order_id, error = %e, "Entry status query failed");
            return Vec::new();
        }
    };
    if let Some(order) = position.entry_order.as_mut() {
        order.status = status;
    }

    match status {
        OrderStatus::Filled => {
            let requested = position
                .entry_order
                .as_ref()
                .map(|o| o.limit_price)
                .unwrap_or_default();
            let fill = match resolve_fill_price(position, gateway, &order_id, requested).await {
                Some(price) => price,
                None => return Vec::new(), // retry next tick
            };
            position.fill_price = Some(fill);
            position.notional_cost = (position.shares * fill).round_dp(MONEY_DP);
            position.state = PositionState::Open;
            position.fill_price_polls = 0;
            info!(
                strategy = %position.strategy_tag,
                market = %position.market.id,
                fill_price = %fill,
                requested_price = %requested,
                shares = %position.shares,
                notional = %position.notional_cost,
                "Entry filled"
            );
            vec![PositionEvent::Filled {
                strategy_tag: position.strategy_tag.clone(),
                market_id: position.market.id.clone(),
                fill_price: fill,
                shares: position.shares,
                notional_cost: position.notional_cost,
            }]
        }
        OrderStatus::Cancelled => {
            info!(
                strategy = %position.strategy_tag,
                market = %position.market.id,
                order_id = %order_id,
                "Entry order cancelled upstream"
            );
            abort(position, now)
        }
        OrderStatus::Live | OrderStatus::Submitted | OrderStatus::Unknown => {
            let seconds_to_close = position.market.seconds_to_close(now);
            let in_close_safety = seconds_to_close <= cfg.close_safety_secs;
            let entry_deadline = position.opened_at
                + chrono::Duration::seconds(cfg.entry_timeout_secs);
            let timed_out = now >= entry_deadline;

            // The close-safety window overrules the remaining timeout
            // budget: never straddle a resolving market with a dangling
            // entry order.
            if !in_close_safety && !timed_out {
                return Vec::new();
            }

            match gateway.cancel(&order_id).await {
                Ok(()) => {
                    info!(
                        strategy = %position.strategy_tag,
                        market = %position.market.id,
                        order_id = %order_id,
                        close_safety = in_close_safety,
                        timed_out = timed_out,
                        "Unfilled entry cancelled"
                    );
                    abort(position, now)
                }
                Err(e) => {
                    warn!(order_id = %order_id, error = %e, "Entry cancel failed; retrying next tick");
                    Vec::new()
                }
            }
        }
    }
}

async fn open_tick(
    position: &mut Position,
    gateway: &dyn OrderGateway,
    cfg: &StrategyConfig,
    now: DateTime<Utc>,
) -> Vec<PositionEvent> {
    let seconds_to_close = position.market.seconds_to_close(now);
    if seconds_to_close <= 0 {
        // Market is resolving; the reconciler owns this position now.
        return Vec::new();
    }

    // Emergency close always takes precedence over stop/target checks.
    if seconds_to_close <= cfg.close_safety_secs {
        return match gateway
            .place_immediate_sell(&position.outcome, position.shares)
            .await
        {
            Ok(order) => {
                warn!(
                    strategy = %position.strategy_tag,
                    market = %position.market.id,
                    seconds_to_close,
                    "Close-safety window reached; emergency market sell submitted"
                );
                position.exit_order = Some(order);
                position.exit_reason = Some(ExitReason::EmergencyClose);
                position.state = PositionState::ExitSubmitted;
                position.fill_price_polls = 0;
                vec![PositionEvent::EmergencyClosed {
                    strategy_tag: position.strategy_tag.clone(),
                    market_id: position.market.id.clone(),
                }]
            }
            Err(e) => {
                warn!(error = %e, "Emergency sell failed; retrying next tick");
                Vec::new()
            }
        };
    }

    let Some(fill) = position.fill_price else {
        error!(position = %position.id, "Open position without a fill price");
        return Vec::new();
    };
    let mid = match gateway.mid_price(&position.outcome).await {
        Ok(Some(mid)) => mid,
        Ok(None) => return Vec::new(),
        Err(e) => {
            debug!(error = %e, "Mid-price query failed");
            return Vec::new();
        }
    };

    let stop = sizing::stop_trigger(fill, cfg.stop_distance);
    let target = sizing::target_trigger(fill, cfg.target_distance);

    if mid <= stop {
        submit_exit(position, gateway, ExitReason::StopLoss, stop).await
    } else if mid >= target {
        submit_exit(position, gateway, ExitReason::TakeProfit, target).await
    } else {
        Vec::new()
    }
}

/// Place the exit as a limit order at the trigger price; if placement
/// fails, escalate once to an immediate sell. Further failures retry next
/// tick and are bounded by the close-safety window.
async fn submit_exit(
    position: &mut Position,
    gateway: &dyn OrderGateway,
    reason: ExitReason,
    trigger: Decimal,
) -> Vec<PositionEvent> {
    let order = match gateway
        .place_limit_sell(&position.outcome, trigger, position.shares)
        .await
    {
        Ok(order) => order,
        Err(limit_err) => {
            warn!(
                strategy = %position.strategy_tag,
                market = %position.market.id,
                error = %limit_err,
                "Exit limit placement failed; escalating to immediate sell"
            );
            match gateway
                .place_immediate_sell(&position.outcome, position.shares)
                .await
            {
                Ok(order) => order,
                Err(e) => {
                    warn!(error = %e, "Immediate sell escalation failed; retrying next tick");
                    return Vec::new();
                }
            }
        }
    };

    info!(
        strategy = %position.strategy_tag,
        market = %position.market.id,
        reason = %reason,
        trigger = %trigger,
        order_id = %order.external_id,
        "Exit submitted"
    );
    position.exit_order = Some(order);
    position.exit_reason = Some(reason);
    position.state = PositionState::ExitSubmitted;
    position.fill_price_polls = 0;

    let event = match reason {
        ExitReason::StopLoss => PositionEvent::StoppedOut {
            strategy_tag: position.strategy_tag.clone(),
            market_id: position.market.id.clone(),
            trigger_price: trigger,
        },
        _ => PositionEvent::TargetHit {
            strategy_tag: position.strategy_tag.clone(),
            market_id: position.market.id.clone(),
            trigger_price: trigger,
        },
    };
    vec![event]
}

async fn exit_submitted_tick(
    position: &mut Position,
    gateway: &dyn OrderGateway,
    cfg: &StrategyConfig,
    now: DateTime<Utc>,
) -> Vec<PositionEvent> {
    let Some(order_id) = position.exit_order.as_ref().map(|o| o.external_id.clone()) else {
        error!(position = %position.id, "ExitSubmitted without an exit order");
        return Vec::new();
    };

    let status = match gateway.order_status(&order_id).await {
        Ok(status) => status,
        Err(e) => {
            debug!(order_id = %order_id, error = %e, "Exit status query failed");
            return Vec::new();
        }
    };
    if let Some(order) = position.exit_order.as_mut() {
        order.status = status;
    }

    match status {
        OrderStatus::Filled => {
            let requested = position
                .exit_order
                .as_ref()
                .map(|o| o.limit_price)
                .unwrap_or_default();
            let exit_price = match resolve_exit_price(position, gateway, &order_id, requested).await
            {
                Some(price) => price,
                None => return Vec::new(),
            };
            close_with_exit(position, exit_price, now)
        }
        OrderStatus::Cancelled => {
            // A killed FOK or an externally cancelled limit: the shares are
            // still ours, so escalate to an immediate sell.
            warn!(
                strategy = %position.strategy_tag,
                market = %position.market.id,
                order_id = %order_id,
                "Exit order died unfilled; escalating to immediate sell"
            );
            match gateway
                .place_immediate_sell(&position.outcome, position.shares)
                .await
            {
                Ok(order) => {
                    position.exit_order = Some(order);
                    Vec::new()
                }
                Err(e) => {
                    warn!(error = %e, "Immediate sell retry failed");
                    Vec::new()
                }
            }
        }
        OrderStatus::Live | OrderStatus::Submitted | OrderStatus::Unknown => {
            let seconds_to_close = position.market.seconds_to_close(now);
            let is_resting_limit = position
                .exit_order
                .as_ref()
                .map(|o| o.limit_price > Decimal::ZERO)
                .unwrap_or(false);
            // Past close there is nothing left to sell into; the
            // reconciler takes over from here.
            if seconds_to_close <= 0
                || seconds_to_close > cfg.close_safety_secs
                || !is_resting_limit
            {
                return Vec::new();
            }

            // Single emergency-close path: cancel the resting limit and
            // replace it with an immediate sell before the market resolves.
            if let Err(e) = gateway.cancel(&order_id).await {
                warn!(order_id = %order_id, error = %e, "Exit cancel failed; retrying next tick");
                return Vec::new();
            }
            match gateway
                .place_immediate_sell(&position.outcome, position.shares)
                .await
            {
                Ok(order) => {
                    warn!(
                        strategy = %position.strategy_tag,
                        market = %position.market.id,
                        seconds_to_close,
                        "Exit limit unmatched near close; replaced with immediate sell"
                    );
                    position.exit_order = Some(order);
                    position.exit_reason = Some(ExitReason::EmergencyClose);
                    vec![PositionEvent::EmergencyClosed {
                        strategy_tag: position.strategy_tag.clone(),
                        market_id: position.market.id.clone(),
                    }]
                }
                Err(e) => {
                    warn!(error = %e, "Emergency replacement sell failed; retrying next tick");
                    Vec::new()
                }
            }
        }
    }
}

fn close_with_exit(
    position: &mut Position,
    exit_price: Decimal,
    now: DateTime<Utc>,
) -> Vec<PositionEvent> {
    let reason = position.exit_reason.unwrap_or(ExitReason::EmergencyClose);
    let pnl = (position.shares * exit_price - position.notional_cost).round_dp(MONEY_DP);
    position.exit_price = Some(exit_price);
    position.realized_pnl = Some(pnl);
    position.state = PositionState::Closed;
    position.closed_at = Some(now);
    info!(
        strategy = %position.strategy_tag,
        market = %position.market.id,
        exit_price = %exit_price,
        realized_pnl = %pnl,
        reason = %reason,
        "Position closed"
    );
    vec![PositionEvent::Exited {
        strategy_tag: position.strategy_tag.clone(),
        market_id: position.market.id.clone(),
        exit_price,
        realized_pnl: pnl,
        reason,
    }]
}

/// The actual fill price for a matched entry. Retries once across ticks
/// before falling back to the requested price, because triggers anchored
/// to the wrong price double the intended risk.
async fn resolve_fill_price(
    position: &mut Position,
    gateway: &dyn OrderGateway,
    order_id: &str,
    requested: Decimal,
) -> Option<Decimal> {
    match gateway.fill_price(order_id).await {
        Ok(Some(price)) => Some(price),
        Ok(None) | Err(_) => {
            if position.fill_price_polls == 0 {
                position.fill_price_polls = 1;
                debug!(order_id = %order_id, "Fill reported without a price; retrying");
                None
            } else {
                warn!(
                    order_id = %order_id,
                    requested = %requested,
                    "Gateway never reported a fill price; falling back to requested price"
                );
                Some(requested)
            }
        }
    }
}

/// Exit proceeds per share. Falls back to the resting limit price, then to
/// the current mid, before giving up for this tick.
async fn resolve_exit_price(
    position: &mut Position,
    gateway: &dyn OrderGateway,
    order_id: &str,
    requested: Decimal,
) -> Option<Decimal> {
    match gateway.fill_price(order_id).await {
        Ok(Some(price)) => Some(price),
        Ok(None) | Err(_) => {
            if position.fill_price_polls == 0 {
                position.fill_price_polls = 1;
                return None;
            }
            if requested > Decimal::ZERO {
                warn!(order_id = %order_id, requested = %requested, "Using limit price as exit price");
                return Some(requested);
            }
            match gateway.mid_price(&position.outcome).await {
                Ok(Some(mid)) => {
                    warn!(order_id = %order_id, mid = %mid, "Using mid price as exit price");
                    Some(mid)
                }
                _ => {
                    warn!(order_id = %order_id, "No exit price available; retrying next tick");
                    None
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clob::MockOrderGateway;
    use crate::types::{MarketRef, OrderRef, OrderSide, OutcomeToken};
    use chrono::Duration;
    use mockall::predicate::eq;
    use rust_decimal_macros::dec;

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

    fn market(close_time: DateTime<Utc>) -> MarketRef {
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
            close_time,
        }
    }

    fn submitted_position(now: DateTime<Utc>, close_in_secs: i64) -> Position {
        let m = market(now + Duration::seconds(close_in_secs));
        let tok = m.outcome_tokens[0].clone();
        let mut p = Position::new("test", m, tok);
        p.opened_at = now - Duration::seconds(1);
        p.shares = dec!(5);
        p.entry_order = Some(OrderRef {
            external_id: "ord-1".to_string(),
            side: OrderSide::Buy,
            limit_price: dec!(0.60),
            requested_size: dec!(5),
            status: crate::types::OrderStatus::Live,
        });
        p.state = PositionState::EntrySubmitted;
        p
    }

    fn open_position(now: DateTime<Utc>, close_in_secs: i64) -> Position {
        let mut p = submitted_position(now, close_in_secs);
        p.state = PositionState::Open;
        p.fill_price = Some(dec!(0.55));
        p.notional_cost = dec!(2.75);
        p
    }

    #[tokio::test]
    async fn fill_records_actual_price_not_requested() {
        let now = Utc::now();
        let mut position = submitted_position(now, 600);

        let mut gateway = MockOrderGateway::new();
        gateway
            .expect_order_status()
            .with(eq("ord-1"))
            .returning(|_| Ok(crate::types::OrderStatus::Filled));
        // Requested 0.60, but the order actually filled at 0.55.
        gateway
            .expect_fill_price()
            .with(eq("ord-1"))
            .returning(|_| Ok(Some(dec!(0.55))));

        let events = advance(&mut position, &gateway, &cfg(), now).await;
        assert_eq!(position.state, PositionState::Open);
        assert_eq!(position.fill_price, Some(dec!(0.55)));
        assert_eq!(position.notional_cost, dec!(2.75));
        assert!(matches!(
            events.as_slice(),
            [PositionEvent::Filled { fill_price, .. }] if *fill_price == dec!(0.55)
        ));
    }

    #[tokio::test]
    async fn fill_price_fallback_after_one_retry() {
        let now = Utc::now();
        let mut position = submitted_position(now, 600);

        let mut gateway = MockOrderGateway::new();
        gateway
            .expect_order_status()
            .returning(|_| Ok(crate::types::OrderStatus::Filled));
        gateway.expect_fill_price().returning(|_| Ok(None));

        // First tick: no price yet, stay submitted.
        let events = advance(&mut position, &gateway, &cfg(), now).await;
        assert!(events.is_empty());
        assert_eq!(position.state, PositionState::EntrySubmitted);

        // Second tick: fall back to the requested price, flagged in logs.
        let events = advance(&mut position, &gateway, &cfg(), now).await;
        assert_eq!(position.state, PositionState::Open);
        assert_eq!(position.fill_price, Some(dec!(0.60)));
        assert_eq!(events.len(), 1);
    }

    #[tokio::test]
    async fn entry_timeout_issues_exactly_one_cancel() {
        let now = Utc::now();
        // Market 10 minutes out: not in the close-safety window.
        let mut position = submitted_position(now, 600);
        position.opened_at = now - Duration::seconds(120); // past 60s timeout

        let mut gateway = MockOrderGateway::new();
        gateway
            .expect_order_status()
            .returning(|_| Ok(crate::types::OrderStatus::Live));
        gateway
            .expect_cancel()
            .with(eq("ord-1"))
            .times(1)
            .returning(|_| Ok(()));

        let events = advance(&mut position, &gateway, &cfg(), now).await;
        assert_eq!(position.state, PositionState::Aborted);
        assert!(matches!(events.as_slice(), [PositionEvent::Aborted { .. }]));
    }

    #[tokio::test]
    async fn close_safety_cancels_before_nominal_timeout() {
        let now = Utc::now();
        // 10 seconds to close (inside the 20s safety window), but the entry
        // is only 1 second old — far from its 60s timeout.
        let mut position = submitted_position(now, 10);

        let mut gateway = MockOrderGateway::new();
        gateway
            .expect_order_status()
            .returning(|_| Ok(crate::types::OrderStatus::Live));
        gateway.expect_cancel().times(1).returning(|_| Ok(()));

        let events = advance(&mut position, &gateway, &cfg(), now).await;
        assert_eq!(position.state, PositionState::Aborted);
        assert_eq!(events.len(), 1);
    }

    #[tokio::test]
    async fn entry_before_any_deadline_does_nothing() {
        let now = Utc::now();
        let mut position = submitted_position(now, 600);

        let mut gateway = MockOrderGateway::new();
        gateway
            .expect_order_status()
            .returning(|_| Ok(crate::types::OrderStatus::Live));
        // No cancel expectation: issuing one would panic the mock.

        let events = advance(&mut position, &gateway, &cfg(), now).await;
        assert!(events.is_empty());
        assert_eq!(position.state, PositionState::EntrySubmitted);
    }

    #[tokio::test]
    async fn gateway_failure_is_status_unknown_not_abort() {
        let now = Utc::now();
        let mut position = submitted_position(now, 600);

        let mut gateway = MockOrderGateway::new();
        gateway
            .expect_order_status()
            .returning(|_| Err(GatewayError::Timeout));

        let events = advance(&mut position, &gateway, &cfg(), now).await;
        assert!(events.is_empty());
        assert_eq!(position.state, PositionState::EntrySubmitted);
    }

    #[tokio::test]
    async fn stop_loss_uses_trigger_from_fill_price() {
        let now = Utc::now();
        let mut position = open_position(now, 600);

        let mut gateway = MockOrderGateway::new();
        // fill 0.55, stop distance 0.10 -> trigger 0.45; mid 0.44 breaches it.
        gateway
            .expect_mid_price()
            .returning(|_| Ok(Some(dec!(0.44))));
        gateway
            .expect_place_limit_sell()
            .withf(|_, price, shares| *price == dec!(0.45) && *shares == dec!(5))
            .returning(|_, price, shares| {
                Ok(OrderRef {
                    external_id: "exit-1".to_string(),
                    side: OrderSide::Sell,
                    limit_price: price,
                    requested_size: shares,
                    status: crate::types::OrderStatus::Live,
                })
            });

        let events = advance(&mut position, &gateway, &cfg(), now).await;
        assert_eq!(position.state, PositionState::ExitSubmitted);
        assert_eq!(position.exit_reason, Some(ExitReason::StopLoss));
        assert!(matches!(
            events.as_slice(),
            [PositionEvent::StoppedOut { trigger_price, .. }] if *trigger_price == dec!(0.45)
        ));
    }

    #[tokio::test]
    async fn target_hit_submits_limit_exit() {
        let now = Utc::now();
        let mut position = open_position(now, 600);

        let mut gateway = MockOrderGateway::new();
        gateway
            .expect_mid_price()
            .returning(|_| Ok(Some(dec!(0.66))));
        gateway
            .expect_place_limit_sell()
            .withf(|_, price, _| *price == dec!(0.65))
            .returning(|_, price, shares| {
                Ok(OrderRef {
                    external_id: "exit-2".to_string(),
                    side: OrderSide::Sell,
                    limit_price: price,
                    requested_size: shares,
                    status: crate::types::OrderStatus::Live,
                })
            });

        let events = advance(&mut position, &gateway, &cfg(), now).await;
        assert_eq!(position.exit_reason, Some(ExitReason::TakeProfit));
        assert!(matches!(events.as_slice(), [PositionEvent::TargetHit { .. }]));
    }

    #[tokio::test]
    async fn mid_between_triggers_holds() {
        let now = Utc::now();
        let mut position = open_position(now, 600);

        let mut gateway = MockOrderGateway::new();
        gateway
            .expect_mid_price()
            .returning(|_| Ok(Some(dec!(0.50))));

        let events = advance(&mut position, &gateway, &cfg(), now).await;
        assert!(events.is_empty());
        assert_eq!(position.state, PositionState::Open);
    }

    #[tokio::test]
    async fn close_safety_forces_emergency_market_sell() {
        let now = Utc::now();
        let mut position = open_position(now, 15); // inside 20s window

        let mut gateway = MockOrderGateway::new();
        gateway
            .expect_place_immediate_sell()
            .withf(|_, shares| *shares == dec!(5))
            .times(1)
            .returning(|_, shares| {
                Ok(OrderRef {
                    external_id: "fok-1".to_string(),
                    side: OrderSide::Sell,
                    limit_price: Decimal::ZERO,
                    requested_size: shares,
                    status: crate::types::OrderStatus::Submitted,
                })
            });

        let events = advance(&mut position, &gateway, &cfg(), now).await;
        assert_eq!(position.state, PositionState::ExitSubmitted);
        assert_eq!(position.exit_reason, Some(ExitReason::EmergencyClose));
        assert!(matches!(
            events.as_slice(),
            [PositionEvent::EmergencyClosed { .. }]
        ));
    }

    #[tokio::test]
    async fn exit_fill_computes_realized_pnl() {
        let now = Utc::now();
        let mut position = open_position(now, 600);
        position.state = PositionState::ExitSubmitted;
        position.exit_reason = Some(ExitReason::TakeProfit);
        position.exit_order = Some(OrderRef {
            external_id: "exit-1".to_string(),
            side: OrderSide::Sell,
            limit_price: dec!(0.65),
            requested_size: dec!(5),
            status: crate::types::OrderStatus::Live,
        });

        let mut gateway = MockOrderGateway::new();
        gateway
            .expect_order_status()
            .returning(|_| Ok(crate::types::OrderStatus::Filled));
        gateway
            .expect_fill_price()
            .returning(|_| Ok(Some(dec!(0.65))));

        let events = advance(&mut position, &gateway, &cfg(), now).await;
        assert_eq!(position.state, PositionState::Closed);
        // 5 * 0.65 - 2.75 = 0.50
        assert_eq!(position.realized_pnl, Some(dec!(0.50)));
        assert!(matches!(
            events.as_slice(),
            [PositionEvent::Exited { realized_pnl, .. }] if *realized_pnl == dec!(0.50)
        ));
    }

    #[tokio::test]
    async fn unmatched_exit_limit_is_replaced_by_market_sell_near_close() {
        let now = Utc::now();
        let mut position = open_position(now, 10); // inside safety window
        position.state = PositionState::ExitSubmitted;
        position.exit_reason = Some(ExitReason::StopLoss);
        position.exit_order = Some(OrderRef {
            external_id: "exit-1".to_string(),
            side: OrderSide::Sell,
            limit_price: dec!(0.45),
            requested_size: dec!(5),
            status: crate::types::OrderStatus::Live,
        });

        let mut gateway = MockOrderGateway::new();
        gateway
            .expect_order_status()
            .returning(|_| Ok(crate::types::OrderStatus::Live));
        gateway
            .expect_cancel()
            .with(eq("exit-1"))
            .times(1)
            .returning(|_| Ok(()));
        gateway
            .expect_place_immediate_sell()
            .times(1)
            .returning(|_, shares| {
                Ok(OrderRef {
                    external_id: "fok-2".to_string(),
                    side: OrderSide::Sell,
                    limit_price: Decimal::ZERO,
                    requested_size: shares,
                    status: crate::types::OrderStatus::Submitted,
                })
            });

        let events = advance(&mut position, &gateway, &cfg(), now).await;
        assert_eq!(position.state, PositionState::ExitSubmitted);
        assert_eq!(position.exit_reason, Some(ExitReason::EmergencyClose));
        assert!(matches!(
            events.as_slice(),
            [PositionEvent::EmergencyClosed { .. }]
        ));
    }

    #[tokio::test]
    async fn rejected_entry_placement_aborts_position() {
        let now = Utc::now();
        let m = market(now + Duration::seconds(600));
        let tok = m.outcome_tokens[0].clone();
        let mut position = Position::new("test", m, tok);

        let mut gateway = MockOrderGateway::new();
        gateway
            .expect_place_limit_buy()
            .returning(|_, _, _| Err(GatewayError::Rejected("insufficient balance".to_string())));

        let sized = SizedOrder {
            price: dec!(0.60),
            shares: dec!(5),
            notional: dec!(3.00),
        };
        let events = place_entry(&mut position, sized, &gateway).await;
        assert_eq!(position.state, PositionState::Aborted);
        assert!(matches!(events.as_slice(), [PositionEvent::Aborted { .. }]));
    }
}

//! Resolution Reconciler
//!
//! Settles positions that held shares through market close (the market
//! paid out instead of being actively exited). Evidence sources are tried
//! in strict priority order, each behind its own staleness window:
//!
//! 1. Authoritative market-status query — trusted immediately once present.
//! 2. Independent reference data — only after a grace period, because the
//!    authoritative source is usually delayed, not absent.
//! 3. Forced settlement after a maximum wait — a flagged last resort,
//!    excluded from win/loss statistics, never silently merged with real
//!    resolutions.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use tracing::{debug, info, warn};

use crate::clob::ResolutionSource;
use crate::config::ReconcilerConfig;
use crate::types::{ExitReason, Position, PositionEvent, PositionState, ResolutionKind};

/// Outcome of one reconciliation attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Settlement {
    /// No trusted evidence yet. A wait condition, not an error.
    StaleEvidence,
    /// The position was settled and moved to `Closed`.
    Settled {
        win: bool,
        kind: ResolutionKind,
        declared: Option<String>,
    },
}

/// Win/loss determination with label-synonym normalization: Up/Yes/1/p1
/// and Down/No/0/p2 are treated as the same polarity. Labels without an
/// up/down polarity (multi-outcome markets) compare as plain strings.
pub fn matches_outcome(held: &str, declared: &str) -> bool {
    match (polarity(held), polarity(declared)) {
        (Some(a), Some(b)) => a == b,
        _ => held.trim().eq_ignore_ascii_case(declared.trim()),
    }
}

fn polarity(label: &str) -> Option<bool> {
    match label.trim().to_ascii_lowercase().as_str() {
        "up" | "yes" | "1" | "p1" | "true" => Some(true),
        "down" | "no" | "0" | "p2" | "false" => Some(false),
        _ => None,
    }
}

/// PnL of a resolved position: payout is 1 per share on a win, 0 otherwise.
pub fn resolution_pnl(shares: Decimal, notional_cost: Decimal, won: bool) -> Decimal {
    if won {
        (shares - notional_cost).round_dp(6)
    } else {
        -notional_cost
    }
}

/// Evidence cascade driver. Stateless apart from its configuration.
pub struct Reconciler {
    cfg: ReconcilerConfig,
}

impl Reconciler {
    pub fn new(cfg: ReconcilerConfig) -> Self {
        Self { cfg }
    }

    /// Attempt to settle a position whose market has closed. Returns the
    /// events to publish; `Settlement::StaleEvidence` means try again next
    /// tick.
    pub async fn settle(
        &self,
        position: &mut Position,
        source: &dyn ResolutionSource,
        now: DateTime<Utc>,
    ) -> (Settlement, Vec<PositionEvent>) {
        debug_assert!(matches!(
            position.state,
            PositionState::Open | PositionState::ExitSubmitted
        ));

        let elapsed = now
            .signed_duration_since(position.market.close_time)
            .num_seconds();
        if elapsed < self.cfg.poll_start_secs {
            return (Settlement::StaleEvidence, Vec::new());
        }

        // 1. Authoritative market status.
        match source.market_resolution(&position.market.id).await {
            Ok(Some(declared)) => {
                return self.close_resolved(position, &declared, ResolutionKind::Authoritative, now)
            }
            Ok(None) => {
                debug!(market = %position.market.id, elapsed, "Authoritative resolution not yet available");
            }
            Err(e) => {
                debug!(market = %position.market.id, error = %e, "Authoritative resolution query failed");
            }
        }

        // 2. Reference evidence, only once the authoritative source has had
        //    its grace period.
        if elapsed >= self.cfg.grace_secs {
            match source.reference_settlement_value(&position.market.id).await {
                Ok(Some(declared)) => {
                    return self.close_resolved(position, &declared, ResolutionKind::Reference, now)
                }
                Ok(None) => {
                    debug!(market = %position.market.id, "Reference settlement cannot decide yet");
                }
                Err(e) => {
                    debug!(market = %position.market.id, error = %e, "Reference settlement query failed");
                }
            }
        }

        // 3. Forced settlement rather than hanging forever. Flagged, and
        //    excluded from win/loss stats downstream.
        if elapsed >= self.cfg.forced_secs {
            warn!(
                strategy = %position.strategy_tag,
                market = %position.market.id,
                elapsed,
                "No resolution evidence after maximum wait; forcing settlement"
            );
            position.state = PositionState::Closed;
            position.exit_reason = Some(ExitReason::Resolution);
            position.closed_at = Some(now);
            // The engine cannot know the payout; it refuses to invent one.
            position.realized_pnl = None;
            let event = PositionEvent::Resolved {
                strategy_tag: position.strategy_tag.clone(),
                market_id: position.market.id.clone(),
                win: true, // the held outcome is assumed, and flagged as such
                kind: ResolutionKind::Forced,
                realized_pnl: None,
            };
            return (
                Settlement::Settled {
                    win: true,
                    kind: ResolutionKind::Forced,
                    declared: None,
                },
                vec![event],
            );
        }

        (Settlement::StaleEvidence, Vec::new())
    }

    fn close_resolved(
        &self,
        position: &mut Position,
        declared: &str,
        kind: ResolutionKind,
        now: DateTime<Utc>,
    ) -> (Settlement, Vec<PositionEvent>) {
        let won = matches_outcome(&position.outcome.label, declared);
        let pnl = resolution_pnl(position.shares, position.notional_cost, won);

        position.state = PositionState::Closed;
        position.exit_reason = Some(ExitReason::Resolution);
        position.realized_pnl = Some(pnl);
        position.closed_at = Some(now);

        info!(
            strategy = %position.strategy_tag,
            market = %position.market.id,
            held = %position.outcome.label,
            declared = %declared,
            won,
            kind = %kind,
            realized_pnl = %pnl,
            "Position settled by resolution"
        );

        let event = PositionEvent::Resolved {
            strategy_tag: position.strategy_tag.clone(),
            market_id: position.market.id.clone(),
            win: won,
            kind,
            realized_pnl: Some(pnl),
        };
        (
            Settlement::Settled {
                win: won,
                kind,
                declared: Some(declared.to_string()),
            },
            vec![event],
        )
    }
}

//! Core types used throughout PolySniper
//!
//! Defines the market reference, order, and position entities shared by
//! every strategy instance.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// One tradable side of a market.
///
/// Pays 1 USDC per share if the labeled outcome is declared, 0 otherwise.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutcomeToken {
    /// CLOB token ID used for orders and quotes
    pub token_id: String,
    /// Human label ("Up", "Down", "13°C", ...)
    pub label: String,
}

/// Immutable description of one time-boxed market.
///
/// Created by market discovery; never mutated after that. A market is dead
/// once `close_time` passes and is replaced by the next period's market.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MarketRef {
    /// Condition ID (stable identifier used for orders and resolution)
    pub id: String,
    /// Question/title, for logs and the trade record
    pub question: String,
    /// Tradable outcome tokens; token_id is unique within the market
    pub outcome_tokens: Vec<OutcomeToken>,
    /// When the market stops trading and resolves
    pub close_time: DateTime<Utc>,
}

impl MarketRef {
    /// Seconds until the market closes (negative once past close).
    pub fn seconds_to_close(&self, now: DateTime<Utc>) -> i64 {
        self.close_time.signed_duration_since(now).num_seconds()
    }

    /// Find the token whose label matches (case-insensitive).
    pub fn token_for_label(&self, label: &str) -> Option<&OutcomeToken> {
        self.outcome_tokens
            .iter()
            .find(|t| t.label.eq_ignore_ascii_case(label))
    }
}

/// Order side
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderSide {
    Buy,
    Sell,
}

impl fmt::Display for OrderSide {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OrderSide::Buy => write!(f, "BUY"),
            OrderSide::Sell => write!(f, "SELL"),
        }
    }
}

/// Last known status of an order at the gateway.
///
/// `Unknown` covers every failed or timed-out query: an order that we could
/// not confirm may still exist upstream, so it is never collapsed into
/// `Cancelled`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderStatus {
    Submitted,
    Live,
    Filled,
    Cancelled,
    Unknown,
}

impl OrderStatus {
    /// Parse the CLOB's status strings ("live", "matched", "cancelled", ...).
    pub fn from_gateway_label(s: &str) -> Self {
        match s.to_ascii_lowercase().as_str() {
            "live" | "open" => OrderStatus::Live,
            "matched" | "filled" => OrderStatus::Filled,
            "cancelled" | "canceled" | "expired" => OrderStatus::Cancelled,
            "submitted" | "delayed" => OrderStatus::Submitted,
            _ => OrderStatus::Unknown,
        }
    }
}

impl fmt::Display for OrderStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OrderStatus::Submitted => write!(f, "submitted"),
            OrderStatus::Live => write!(f, "live"),
            OrderStatus::Filled => write!(f, "filled"),
            OrderStatus::Cancelled => write!(f, "cancelled"),
            OrderStatus::Unknown => write!(f, "unknown"),
        }
    }
}

/// Reference to one order at the gateway.
///
/// Owned exclusively by the Position that created it; never shared between
/// positions or strategies.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderRef {
    /// Gateway-assigned order ID
    pub external_id: String,
    pub side: OrderSide,
    /// Requested limit price (NOT the fill price; see `Position::fill_price`)
    pub limit_price: Decimal,
    /// Requested size in shares
    pub requested_size: Decimal,
    pub status: OrderStatus,
}

/// Position lifecycle states. See `position` module for the transition table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PositionState {
    /// Entry decided, order not yet placed
    PendingEntry,
    /// Entry limit order resting at the gateway
    EntrySubmitted,
    /// Entry filled; holding shares
    Open,
    /// Exit order (limit or emergency market sell) submitted
    ExitSubmitted,
    /// Terminal: shares sold or market resolved
    Closed,
    /// Terminal: entry never filled
    Aborted,
}

impl PositionState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, PositionState::Closed | PositionState::Aborted)
    }
}

impl fmt::Display for PositionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PositionState::PendingEntry => write!(f, "PENDING_ENTRY"),
            PositionState::EntrySubmitted => write!(f, "ENTRY_SUBMITTED"),
            PositionState::Open => write!(f, "OPEN"),
            PositionState::ExitSubmitted => write!(f, "EXIT_SUBMITTED"),
            PositionState::Closed => write!(f, "CLOSED"),
            PositionState::Aborted => write!(f, "ABORTED"),
        }
    }
}

/// Why a position left the `Open` state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExitReason {
    StopLoss,
    TakeProfit,
    /// Forced market sell inside the close-safety window
    EmergencyClose,
    /// Held to market resolution, settled by the reconciler
    Resolution,
}

impl fmt::Display for ExitReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExitReason::StopLoss => write!(f, "STOP_LOSS"),
            ExitReason::TakeProfit => write!(f, "TAKE_PROFIT"),
            ExitReason::EmergencyClose => write!(f, "EMERGENCY_CLOSE"),
            ExitReason::Resolution => write!(f, "RESOLUTION"),
        }
    }
}

/// Which evidence source settled a resolution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ResolutionKind {
    /// Market-status query: closed flag + declared outcome
    Authoritative,
    /// Independent reference data, used after the grace period
    Reference,
    /// Last-resort timeout settlement; audited separately, excluded from stats
    Forced,
}

impl fmt::Display for ResolutionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResolutionKind::Authoritative => write!(f, "authoritative"),
            ResolutionKind::Reference => write!(f, "reference"),
            ResolutionKind::Forced => write!(f, "forced"),
        }
    }
}

/// One attempted-or-open trade on a single market outcome.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Position {
    pub id: String,
    pub market: MarketRef,
    /// The outcome token we hold (or tried to buy)
    pub outcome: OutcomeToken,
    pub state: PositionState,
    pub entry_order: Option<OrderRef>,
    /// Actual average fill price. Set if and only if the state has passed
    /// `Open`; stop/target triggers derive from this, never from the
    /// requested limit price.
    pub fill_price: Option<Decimal>,
    pub shares: Decimal,
    /// shares * fill_price, within rounding tolerance
    pub notional_cost: Decimal,
    pub exit_order: Option<OrderRef>,
    pub exit_price: Option<Decimal>,
    /// Set only in terminal states. Left unset for forced resolutions.
    pub realized_pnl: Option<Decimal>,
    pub exit_reason: Option<ExitReason>,
    pub opened_at: DateTime<Utc>,
    pub closed_at: Option<DateTime<Utc>>,
    /// Which strategy instance owns this position
    pub strategy_tag: String,
    /// Consecutive polls that saw a fill without a reported fill price;
    /// after one retry the requested price is used as a flagged fallback
    #[serde(default)]
    pub fill_price_polls: u8,
}

impl Position {
    /// A fresh position in `PendingEntry`, before any order exists.
    pub fn new(strategy_tag: &str, market: MarketRef, outcome: OutcomeToken) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            market,
            outcome,
            state: PositionState::PendingEntry,
            entry_order: None,
            fill_price: None,
            shares: Decimal::ZERO,
            notional_cost: Decimal::ZERO,
            exit_order: None,
            exit_price: None,
            realized_pnl: None,
            exit_reason: None,
            opened_at: Utc::now(),
            closed_at: None,
            strategy_tag: strategy_tag.to_string(),
            fill_price_polls: 0,
        }
    }
}

/// One event per observable position transition, for the notification and
/// telemetry consumers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum PositionEvent {
    /// Entry order accepted by the gateway
    Entered {
        strategy_tag: String,
        market_id: String,
        outcome: String,
        limit_price: Decimal,
        shares: Decimal,
    },
    /// Entry filled; position is open
    Filled {
        strategy_tag: String,
        market_id: String,
        fill_price: Decimal,
        shares: Decimal,
        notional_cost: Decimal,
    },
    /// Stop-loss exit submitted
    StoppedOut {
        strategy_tag: String,
        market_id: String,
        trigger_price: Decimal,
    },
    /// Profit-target exit submitted
    TargetHit {
        strategy_tag: String,
        market_id: String,
        trigger_price: Decimal,
    },
    /// Forced market sell inside the close-safety window
    EmergencyClosed {
        strategy_tag: String,
        market_id: String,
    },
    /// Entry never filled; order cancelled
    Aborted {
        strategy_tag: String,
        market_id: String,
    },
    /// Market resolution settled the position
    Resolved {
        strategy_tag: String,
        market_id: String,
        win: bool,
        kind: ResolutionKind,
        realized_pnl: Option<Decimal>,
    },
    /// Active exit (stop/target/emergency) completed
    Exited {
        strategy_tag: String,
        market_id: String,
        exit_price: Decimal,
        realized_pnl: Decimal,
        reason: ExitReason,
    },
}

/// Aggregate per-strategy statistics.
///
/// Updated only when a position reaches a terminal state. Forced
/// resolutions are counted in `forced` and excluded from wins, losses and
/// total_pnl so the audit trail stays honest.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AggregateStats {
    pub wins: u32,
    pub losses: u32,
    pub forced: u32,
    pub total_trades: u32,
    pub total_pnl: Decimal,
}

impl AggregateStats {
    pub fn record_win(&mut self, pnl: Decimal) {
        self.wins += 1;
        self.total_trades += 1;
        self.total_pnl += pnl;
    }

    pub fn record_loss(&mut self, pnl: Decimal) {
        self.losses += 1;
        self.total_trades += 1;
        self.total_pnl += pnl;
    }

    pub fn record_forced(&mut self) {
        self.forced += 1;
        self.total_trades += 1;
    }

    pub fn win_rate(&self) -> f64 {
        let settled = self.wins + self.losses;
        if settled == 0 {
            return 0.0;
        }
        f64::from(self.wins) / f64::from(settled)
    }
}

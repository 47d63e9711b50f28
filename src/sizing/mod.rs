//! Sizing & Risk Rules
//!
//! Pure functions that turn a target notional spend into a valid CLOB order
//! (tick rounding, minimum share count, minimum notional) and derive
//! stop-loss / profit-target trigger prices from the actual fill price.
//!
//! Trigger prices are anchored to the fill price, never to the requested
//! limit price: a late-filled limit order often fills below its requested
//! price, and anchoring risk to the request silently widens the stop.

use chrono::NaiveDate;
use rust_decimal::{Decimal, RoundingStrategy};
use rust_decimal_macros::dec;
use std::collections::HashMap;
use thiserror::Error;

/// Share quantities are quoted to 2 decimal places on the CLOB.
const SHARE_DP: u32 = 2;

/// Local validation failures. Never sent to the gateway.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum SizingError {
    /// Binary-outcome prices are probabilities in (0, 1)
    #[error("invalid price {0}: must be in (0, 1)")]
    InvalidPrice(Decimal),
    #[error("invalid size: {0}")]
    InvalidSize(String),
}

/// A validated order: tick-rounded price, share count, re-derived notional.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SizedOrder {
    pub price: Decimal,
    pub shares: Decimal,
    /// shares * price — the actual spend, which may exceed the target when
    /// the minimum-shares floor dominates
    pub notional: Decimal,
}

/// Round a price to the market's tick size.
pub fn round_to_tick(price: Decimal, tick_size: Decimal) -> Result<Decimal, SizingError> {
    if tick_size <= Decimal::ZERO {
        return Err(SizingError::InvalidSize(format!(
            "tick size {tick_size} must be positive"
        )));
    }
    Ok((price / tick_size).round() * tick_size)
}

/// Convert a target notional spend into a valid order.
///
/// Rounds the price to tick, computes `shares = target_notional / price`
/// rounded up to share precision, floors at `min_shares`, and re-derives
/// the actual notional from the final share count.
pub fn size_for_spend(
    target_notional: Decimal,
    price: Decimal,
    min_shares: Decimal,
    tick_size: Decimal,
) -> Result<SizedOrder, SizingError> {
    if price <= Decimal::ZERO || price >= Decimal::ONE {
        return Err(SizingError::InvalidPrice(price));
    }
    if target_notional <= Decimal::ZERO {
        return Err(SizingError::InvalidSize(format!(
            "target notional {target_notional} must be positive"
        )));
    }

    let price = round_to_tick(price, tick_size)?;
    if price <= Decimal::ZERO || price >= Decimal::ONE {
        return Err(SizingError::InvalidPrice(price));
    }

    let mut shares = (target_notional / price)
        .round_dp_with_strategy(SHARE_DP, RoundingStrategy::AwayFromZero);
    if shares < min_shares {
        shares = min_shares;
    }

    Ok(SizedOrder {
        price,
        shares,
        notional: (shares * price).round_dp(SHARE_DP),
    })
}

/// Stop-loss trigger derived from the actual fill price.
pub fn stop_trigger(fill_price: Decimal, stop_distance: Decimal) -> Decimal {
    clamp_price(fill_price - stop_distance)
}

/// Profit-target trigger derived from the actual fill price.
pub fn target_trigger(fill_price: Decimal, target_distance: Decimal) -> Decimal {
    clamp_price(fill_price + target_distance)
}

/// Keep a trigger inside the tradable band. Same bounds the execution
/// planner uses for maker prices.
fn clamp_price(price: Decimal) -> Decimal {
    price.clamp(dec!(0.01), dec!(0.99))
}

/// Daily per-entity trade caps.
///
/// Pure counters keyed by (calendar date, entity) — e.g. "at most one large
/// copy-trade per trader per day". No side effects beyond incrementing;
/// past dates are evicted so the map stays bounded.
#[derive(Debug, Default)]
pub struct DailyCaps {
    counts: HashMap<(NaiveDate, String), u32>,
    max_per_day: u32,
}

impl DailyCaps {
    pub fn new(max_per_day: u32) -> Self {
        Self {
            counts: HashMap::new(),
            max_per_day,
        }
    }

    /// Would recording one more trade for this entity today exceed the cap?
    pub fn would_exceed(&self, date: NaiveDate, entity: &str) -> bool {
        let count = self
            .counts
            .get(&(date, entity.to_string()))
            .copied()
            .unwrap_or(0);
        count >= self.max_per_day
    }

    /// Record one trade for (date, entity).
    pub fn record(&mut self, date: NaiveDate, entity: &str) {
        *self.counts.entry((date, entity.to_string())).or_insert(0) += 1;
    }

    /// Drop counters for dates before `cutoff`.
    pub fn evict_before(&mut self, cutoff: NaiveDate) {
        self.counts.retain(|(date, _), _| *date >= cutoff);
    }

    pub fn len(&self) -> usize {
        self.counts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.counts.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn min_shares_floor_dominates_small_spend() {
        // $1 at 0.40 is 2.5 shares; the 5-share minimum wins and the actual
        // notional becomes $2.00.
        let sized = size_for_spend(dec!(1), dec!(0.40), dec!(5), dec!(0.01)).unwrap();
        assert_eq!(sized.shares, dec!(5));
        assert_eq!(sized.price, dec!(0.40));
        assert_eq!(sized.notional, dec!(2.00));
    }

    #[test]
    fn larger_spend_sizes_from_notional() {
        let sized = size_for_spend(dec!(10), dec!(0.40), dec!(5), dec!(0.01)).unwrap();
        assert_eq!(sized.shares, dec!(25));
        assert_eq!(sized.notional, dec!(10.00));
    }

    #[test]
    fn price_is_rounded_to_tick_before_sizing() {
        let sized = size_for_spend(dec!(10), dec!(0.404), dec!(5), dec!(0.01)).unwrap();
        assert_eq!(sized.price, dec!(0.40));
        assert_eq!(sized.notional, sized.shares * dec!(0.40));
    }

    #[test]
    fn rejects_probability_bounds() {
        assert_eq!(
            size_for_spend(dec!(1), dec!(0), dec!(5), dec!(0.01)),
            Err(SizingError::InvalidPrice(dec!(0)))
        );
        assert_eq!(
            size_for_spend(dec!(1), dec!(1.0), dec!(5), dec!(0.01)),
            Err(SizingError::InvalidPrice(dec!(1.0)))
        );
        assert!(size_for_spend(dec!(1), dec!(-0.2), dec!(5), dec!(0.01)).is_err());
    }

    #[test]
    fn rejects_nonpositive_notional_and_tick() {
        assert!(matches!(
            size_for_spend(dec!(0), dec!(0.5), dec!(5), dec!(0.01)),
            Err(SizingError::InvalidSize(_))
        ));
        assert!(matches!(
            size_for_spend(dec!(1), dec!(0.5), dec!(5), dec!(0)),
            Err(SizingError::InvalidSize(_))
        ));
    }

    #[test]
    fn triggers_anchor_to_fill_price() {
        // Requested 0.60 but filled at 0.55: triggers must use 0.55.
        let fill = dec!(0.55);
        assert_eq!(stop_trigger(fill, dec!(0.10)), dec!(0.45));
        assert_eq!(target_trigger(fill, dec!(0.10)), dec!(0.65));
    }

    #[test]
    fn triggers_stay_inside_tradable_band() {
        assert_eq!(stop_trigger(dec!(0.05), dec!(0.10)), dec!(0.01));
        assert_eq!(target_trigger(dec!(0.95), dec!(0.10)), dec!(0.99));
    }

    #[test]
    fn daily_caps_count_per_date_and_entity() {
        let mut caps = DailyCaps::new(1);
        let d1 = NaiveDate::from_ymd_opt(2026, 8, 6).unwrap();
        let d2 = NaiveDate::from_ymd_opt(2026, 8, 7).unwrap();

        assert!(!caps.would_exceed(d1, "0xtrader"));
        caps.record(d1, "0xtrader");
        assert!(caps.would_exceed(d1, "0xtrader"));
        // Different entity and different day are independent counters.
        assert!(!caps.would_exceed(d1, "0xother"));
        assert!(!caps.would_exceed(d2, "0xtrader"));

        caps.record(d2, "0xtrader");
        caps.evict_before(d2);
        assert_eq!(caps.len(), 1);
        assert!(!caps.would_exceed(d1, "0xtrader"));
    }
}

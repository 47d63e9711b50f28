//! Order Gateway and market-data interfaces
//!
//! The engine talks to the outside world through the narrow traits in this
//! module: order placement/cancellation/status, quotes, resolution
//! evidence, and market discovery. The live implementation speaks the
//! Polymarket CLOB + Gamma REST APIs (`rest.rs`, `discovery.rs`); tests
//! substitute mocks.
//!
//! Every call here is a suspension point and can fail transiently. A
//! timeout or 5xx never means "did not happen": an order may have been
//! accepted even though the response was lost, so callers treat failures
//! as status-unknown and retry on the next tick.

pub mod discovery;
pub mod rest;

pub use discovery::*;
pub use rest::*;

use async_trait::async_trait;
use rust_decimal::Decimal;
use thiserror::Error;

use crate::types::{OrderRef, OrderStatus, OutcomeToken};

/// External call failures at the gateway seam.
#[derive(Debug, Error)]
pub enum GatewayError {
    /// The call did not complete in time. The order may still exist.
    #[error("gateway call timed out")]
    Timeout,
    /// The gateway answered with an explicit rejection.
    #[error("gateway rejected request: {0}")]
    Rejected(String),
    /// Transport-level failure (connection refused, 5xx, TLS, ...).
    #[error("transport error: {0}")]
    Transport(#[from] reqwest::Error),
    /// The gateway answered 200 with a body we could not interpret.
    #[error("invalid gateway response: {0}")]
    InvalidResponse(String),
}

/// Order submission, cancellation, and tracking.
///
/// Placement returns an [`OrderRef`] owned by exactly one Position.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait OrderGateway: Send + Sync {
    /// Place a resting limit buy (GTC).
    async fn place_limit_buy(
        &self,
        token: &OutcomeToken,
        price: Decimal,
        shares: Decimal,
    ) -> Result<OrderRef, GatewayError>;

    /// Place a resting limit sell (GTC).
    async fn place_limit_sell(
        &self,
        token: &OutcomeToken,
        price: Decimal,
        shares: Decimal,
    ) -> Result<OrderRef, GatewayError>;

    /// Place an immediate ("market") sell, fill-or-kill.
    async fn place_immediate_sell(
        &self,
        token: &OutcomeToken,
        shares: Decimal,
    ) -> Result<OrderRef, GatewayError>;

    /// Cancel a resting order.
    async fn cancel(&self, order_id: &str) -> Result<(), GatewayError>;

    /// Query current order status. Errors map to `OrderStatus::Unknown`
    /// at the call site, never to `Cancelled`.
    async fn order_status(&self, order_id: &str) -> Result<OrderStatus, GatewayError>;

    /// Average fill price for a matched order, if the gateway reports one.
    async fn fill_price(&self, order_id: &str) -> Result<Option<Decimal>, GatewayError>;

    /// Current mid-price for an outcome token.
    async fn mid_price(&self, token: &OutcomeToken) -> Result<Option<Decimal>, GatewayError>;
}

/// Settlement evidence sources for the resolution reconciler.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ResolutionSource: Send + Sync {
    /// Authoritative market status: declared outcome label once the market
    /// is closed and resolved. `None` while unresolved.
    async fn market_resolution(&self, market_id: &str) -> Result<Option<String>, GatewayError>;

    /// Independent reference data matching the market's settlement rule
    /// (e.g. the settlement candle of the underlying). `None` when the
    /// reference cannot decide.
    async fn reference_settlement_value(
        &self,
        market_id: &str,
    ) -> Result<Option<String>, GatewayError>;
}

// Shared gateways are passed around as Arc; delegate the traits through.
#[async_trait]
impl<T: OrderGateway + ?Sized> OrderGateway for std::sync::Arc<T> {
    async fn place_limit_buy(
        &self,
        token: &OutcomeToken,
        price: Decimal,
        shares: Decimal,
    ) -> Result<OrderRef, GatewayError> {
        (**self).place_limit_buy(token, price, shares).await
    }

    async fn place_limit_sell(
        &self,
        token: &OutcomeToken,
        price: Decimal,
        shares: Decimal,
    ) -> Result<OrderRef, GatewayError> {
        (**self).place_limit_sell(token, price, shares).await
    }

    async fn place_immediate_sell(
        &self,
        token: &OutcomeToken,
        shares: Decimal,
    ) -> Result<OrderRef, GatewayError> {
        (**self).place_immediate_sell(token, shares).await
    }

    async fn cancel(&self, order_id: &str) -> Result<(), GatewayError> {
        (**self).cancel(order_id).await
    }

    async fn order_status(&self, order_id: &str) -> Result<OrderStatus, GatewayError> {
        (**self).order_status(order_id).await
    }

    async fn fill_price(&self, order_id: &str) -> Result<Option<Decimal>, GatewayError> {
        (**self).fill_price(order_id).await
    }

    async fn mid_price(&self, token: &OutcomeToken) -> Result<Option<Decimal>, GatewayError> {
        (**self).mid_price(token).await
    }
}

#[async_trait]
impl<T: ResolutionSource + ?Sized> ResolutionSource for std::sync::Arc<T> {
    async fn market_resolution(&self, market_id: &str) -> Result<Option<String>, GatewayError> {
        (**self).market_resolution(market_id).await
    }

    async fn reference_settlement_value(
        &self,
        market_id: &str,
    ) -> Result<Option<String>, GatewayError> {
        (**self).reference_settlement_value(market_id).await
    }
}

/// Decorator that bounds every gateway call with a hard deadline, so one
/// wedged HTTP call can never stall the tick loop indefinitely. Expiry is
/// surfaced as [`GatewayError::Timeout`], i.e. status-unknown.
pub struct TimeoutGateway<G> {
    inner: G,
    timeout: std::time::Duration,
}

impl<G> TimeoutGateway<G> {
    pub fn new(inner: G, timeout: std::time::Duration) -> Self {
        Self { inner, timeout }
    }
}

macro_rules! bounded {
    ($self:ident, $fut:expr) => {
        match tokio::time::timeout($self.timeout, $fut).await {
            Ok(result) => result,
            Err(_) => Err(GatewayError::Timeout),
        }
    };
}

#[async_trait]
impl<G: OrderGateway> OrderGateway for TimeoutGateway<G> {
    async fn place_limit_buy(
        &self,
        token: &OutcomeToken,
        price: Decimal,
        shares: Decimal,
    ) -> Result<OrderRef, GatewayError> {
        bounded!(self, self.inner.place_limit_buy(token, price, shares))
    }

    async fn place_limit_sell(
        &self,
        token: &OutcomeToken,
        price: Decimal,
        shares: Decimal,
    ) -> Result<OrderRef, GatewayError> {
        bounded!(self, self.inner.place_limit_sell(token, price, shares))
    }

    async fn place_immediate_sell(
        &self,
        token: &OutcomeToken,
        shares: Decimal,
    ) -> Result<OrderRef, GatewayError> {
        bounded!(self, self.inner.place_immediate_sell(token, shares))
    }

    async fn cancel(&self, order_id: &str) -> Result<(), GatewayError> {
        bounded!(self, self.inner.cancel(order_id))
    }

    async fn order_status(&self, order_id: &str) -> Result<OrderStatus, GatewayError> {
        bounded!(self, self.inner.order_status(order_id))
    }

    async fn fill_price(&self, order_id: &str) -> Result<Option<Decimal>, GatewayError> {
        bounded!(self, self.inner.fill_price(order_id))
    }

    async fn mid_price(&self, token: &OutcomeToken) -> Result<Option<Decimal>, GatewayError> {
        bounded!(self, self.inner.mid_price(token))
    }
}

#[async_trait]
impl<G: ResolutionSource + Send + Sync> ResolutionSource for TimeoutGateway<G> {
    async fn market_resolution(&self, market_id: &str) -> Result<Option<String>, GatewayError> {
        bounded!(self, self.inner.market_resolution(market_id))
    }

    async fn reference_settlement_value(
        &self,
        market_id: &str,
    ) -> Result<Option<String>, GatewayError> {
        bounded!(self, self.inner.reference_settlement_value(market_id))
    }
}

//! CLOB REST gateway
//!
//! Live implementation of [`OrderGateway`] and [`ResolutionSource`] against
//! the Polymarket CLOB and Gamma APIs, with a Binance kline fallback as the
//! independent settlement reference for up/down markets.
//!
//! All orders go out as GTC limit orders except the emergency sell, which
//! is FOK. Authenticated endpoints use L2 HMAC header auth.

use async_trait::async_trait;
use base64::{engine::general_purpose, Engine as _};
use chrono::Utc;
use hmac::{Hmac, Mac};
use reqwest::{
    header::{HeaderMap, HeaderValue, CONTENT_TYPE},
    Client, StatusCode,
};
use rust_decimal::Decimal;
use serde::Deserialize;
use serde_json::json;
use sha2::Sha256;
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{debug, warn};

use super::{GatewayError, OrderGateway, ResolutionSource};
use crate::types::{OrderRef, OrderSide, OrderStatus, OutcomeToken};

/// Connection settings for the live gateway.
#[derive(Debug, Clone)]
pub struct ClobConfig {
    /// CLOB REST API endpoint
    pub clob_url: String,
    /// Gamma API endpoint (market metadata + resolution)
    pub gamma_url: String,
    /// Reference price API endpoint (settlement fallback)
    pub reference_url: String,
    /// Wallet address for L2 auth headers
    pub address: Option<String>,
    pub api_key: Option<String>,
    pub api_secret: Option<String>,
    pub api_passphrase: Option<String>,
    /// Per-request HTTP timeout in seconds
    pub http_timeout_secs: u64,
}

impl Default for ClobConfig {
    fn default() -> Self {
        Self {
            clob_url: "https://clob.polymarket.com".to_string(),
            gamma_url: "https://gamma-api.polymarket.com".to_string(),
            reference_url: "https://api.binance.com".to_string(),
            address: None,
            api_key: None,
            api_secret: None,
            api_passphrase: None,
            http_timeout_secs: 10,
        }
    }
}

impl ClobConfig {
    /// Pull credentials from the environment (.env is loaded by config).
    pub fn from_env() -> Self {
        fn first_of(vars: &[&str]) -> Option<String> {
            vars.iter()
                .filter_map(|v| std::env::var(v).ok())
                .find(|v| !v.trim().is_empty())
        }

        Self {
            address: first_of(&["POLYMARKET_ADDRESS"]),
            api_key: first_of(&["POLY_API_KEY", "API_KEY"]),
            api_secret: first_of(&["POLY_API_SECRET", "API_SECRET"]),
            api_passphrase: first_of(&["POLY_API_PASSPHRASE", "API_PASSPHRASE"]),
            ..Default::default()
        }
    }
}

/// The settlement window of a market on the reference exchange, registered
/// by discovery so the reconciler's fallback can compare the period's open
/// and close prices.
#[derive(Debug, Clone)]
pub struct ReferenceWindow {
    /// Exchange symbol, e.g. "BTCUSDT"
    pub symbol: String,
    /// Kline interval label, e.g. "15m"
    pub interval: String,
    /// Period start in unix milliseconds
    pub open_time_ms: i64,
}

/// Live REST gateway.
pub struct ClobClient {
    config: ClobConfig,
    http: Client,
    /// market_id -> reference settlement window, registered at discovery time
    reference_windows: RwLock<HashMap<String, ReferenceWindow>>,
}

#[derive(Debug, Deserialize)]
struct PostOrderResponse {
    #[serde(rename = "orderID", alias = "orderId", alias = "order_id")]
    order_id: Option<String>,
    #[serde(default)]
    status: Option<String>,
    #[serde(default, rename = "errorMsg")]
    error_msg: Option<String>,
}

#[derive(Debug, Deserialize)]
struct OrderStatusResponse {
    #[serde(default)]
    status: Option<String>,
    #[serde(default, rename = "avgPrice", alias = "avg_price")]
    avg_price: Option<String>,
    #[serde(default, alias = "price")]
    price: Option<String>,
}

#[derive(Debug, Deserialize)]
struct MidpointResponse {
    #[serde(default)]
    mid: Option<String>,
}

#[derive(Debug, Deserialize)]
struct GammaMarket {
    #[serde(default)]
    closed: Option<bool>,
    #[serde(default, rename = "umaResolutionStatus")]
    uma_resolution_status: Option<String>,
    #[serde(default)]
    resolution: Option<String>,
    #[serde(default, rename = "outcomePrices")]
    outcome_prices: Option<serde_json::Value>,
    #[serde(default)]
    outcomes: Option<serde_json::Value>,
}

impl ClobClient {
    pub fn new(config: ClobConfig) -> Self {
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));

        let http = Client::builder()
            .timeout(Duration::from_secs(config.http_timeout_secs))
            .default_headers(headers)
            .build()
            .expect("Failed to create HTTP client");

        Self {
            config,
            http,
            reference_windows: RwLock::new(HashMap::new()),
        }
    }

    /// Register the reference settlement window for a market so the
    /// reconciler's fallback evidence source can answer for it.
    pub async fn register_reference_window(&self, market_id: &str, window: ReferenceWindow) {
        let mut windows = self.reference_windows.write().await;
        windows.insert(market_id.to_string(), window);
        // Bounded: windows are only useful around market close.
        if windows.len() > 256 {
            let cutoff = Utc::now().timestamp_millis() - 24 * 3600 * 1000;
            windows.retain(|_, w| w.open_time_ms >= cutoff);
        }
    }

    fn map_reqwest(e: reqwest::Error) -> GatewayError {
        if e.is_timeout() {
            GatewayError::Timeout
        } else {
            GatewayError::Transport(e)
        }
    }

    /// L2 HMAC auth headers: signature over timestamp + method + path + body.
    fn build_l2_headers(
        &self,
        method: &str,
        request_path: &str,
        body: &str,
    ) -> Result<HeaderMap, GatewayError> {
        let (address, api_key, api_secret, api_passphrase) = match (
            &self.config.address,
            &self.config.api_key,
            &self.config.api_secret,
            &self.config.api_passphrase,
        ) {
            (Some(a), Some(k), Some(s), Some(p)) => (a, k, s, p),
            _ => {
                return Err(GatewayError::Rejected(
                    "missing CLOB API credentials for authenticated request".to_string(),
                ))
            }
        };

        let timestamp = Utc::now().timestamp().to_string();
        let message = format!(
            "{}{}{}{}",
            timestamp,
            method.to_uppercase(),
            request_path,
            body
        );

        let secret_bytes = general_purpose::URL_SAFE_NO_PAD
            .decode(api_secret)
            .or_else(|_| general_purpose::URL_SAFE.decode(api_secret))
            .map_err(|e| GatewayError::InvalidResponse(format!("bad api secret encoding: {e}")))?;

        type HmacSha256 = Hmac<Sha256>;
        let mut mac = HmacSha256::new_from_slice(&secret_bytes)
            .map_err(|e| GatewayError::InvalidResponse(format!("bad HMAC key: {e}")))?;
        mac.update(message.as_bytes());
        let signature = general_purpose::URL_SAFE.encode(mac.finalize().into_bytes());

        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        for (name, value) in [
            ("POLY_ADDRESS", address.as_str()),
            ("POLY_SIGNATURE", signature.as_str()),
            ("POLY_TIMESTAMP", timestamp.as_str()),
            ("POLY_API_KEY", api_key.as_str()),
            ("POLY_PASSPHRASE", api_passphrase.as_str()),
        ] {
            headers.insert(
                name,
                HeaderValue::from_str(value)
                    .map_err(|e| GatewayError::InvalidResponse(format!("bad header value: {e}")))?,
            );
        }
        Ok(headers)
    }

    /// POST an order payload; 4xx is a definitive rejection, everything
    /// else bubbles up as transient.
    async fn post_order(
        &self,
        payload: serde_json::Value,
        side: OrderSide,
        price: Decimal,
        shares: Decimal,
    ) -> Result<OrderRef, GatewayError> {
        let path = "/order";
        let body = payload.to_string();
        let headers = self.build_l2_headers("POST", path, &body)?;
        let url = format!("{}{}", self.config.clob_url, path);

        let resp = self
            .http
            .post(&url)
            .headers(headers)
            .body(body)
            .send()
            .await
            .map_err(Self::map_reqwest)?;

        let status = resp.status();
        if status.is_client_error() {
            let text = resp.text().await.unwrap_or_default();
            return Err(GatewayError::Rejected(format!("{status}: {text}")));
        }
        let resp = resp.error_for_status().map_err(Self::map_reqwest)?;

        let parsed: PostOrderResponse = resp.json().await.map_err(Self::map_reqwest)?;
        if let Some(msg) = parsed.error_msg.filter(|m| !m.is_empty()) {
            return Err(GatewayError::Rejected(msg));
        }
        let order_id = parsed.order_id.filter(|id| !id.is_empty()).ok_or_else(|| {
            GatewayError::InvalidResponse("missing orderID in response".to_string())
        })?;

        let status = parsed
            .status
            .as_deref()
            .map(OrderStatus::from_gateway_label)
            .unwrap_or(OrderStatus::Submitted);

        debug!(order_id = %order_id, side = %side, price = %price, shares = %shares, "Order accepted by CLOB");
        Ok(OrderRef {
            external_id: order_id,
            side,
            limit_price: price,
            requested_size: shares,
            status,
        })
    }

    async fn fetch_gamma_market(
        &self,
        market_id: &str,
    ) -> Result<Option<GammaMarket>, GatewayError> {
        let url = format!("{}/markets", self.config.gamma_url);
        let resp = self
            .http
            .get(&url)
            .query(&[("condition_ids", market_id)])
            .send()
            .await
            .map_err(Self::map_reqwest)?
            .error_for_status()
            .map_err(Self::map_reqwest)?;

        let markets: Vec<GammaMarket> = resp.json().await.map_err(Self::map_reqwest)?;
        Ok(markets.into_iter().next())
    }
}

/// Pull outcome labels/prices that Gamma sometimes serializes as a JSON
/// string inside the JSON.
pub(crate) fn parse_string_array(value: &serde_json::Value) -> Vec<String> {
    match value {
        serde_json::Value::Array(items) => items
            .iter()
            .filter_map(|v| v.as_str().map(ToString::to_string))
            .collect(),
        serde_json::Value::String(s) => serde_json::from_str::<Vec<String>>(s).unwrap_or_default(),
        _ => Vec::new(),
    }
}

/// The declared outcome of a resolved market: the label whose resolution
/// price collapsed to ~1.
fn declared_outcome(market: &GammaMarket) -> Option<String> {
    if let Some(resolution) = market.resolution.as_ref().filter(|r| !r.is_empty()) {
        return Some(resolution.clone());
    }

    let prices: Vec<Decimal> = market
        .outcome_prices
        .as_ref()
        .map(parse_string_array)
        .unwrap_or_default()
        .iter()
        .filter_map(|p| p.parse::<Decimal>().ok())
        .collect();
    let labels = market
        .outcomes
        .as_ref()
        .map(parse_string_array)
        .unwrap_or_default();
    if prices.len() < 2 || labels.len() != prices.len() {
        return None;
    }

    let (winner_idx, winner_price) = prices
        .iter()
        .enumerate()
        .max_by_key(|(_, p)| **p)
        .map(|(i, p)| (i, *p))?;
    // Resolution prices collapse near {1, 0}; anything mid-range is still trading.
    if winner_price < Decimal::new(95, 2) {
        return None;
    }
    labels.get(winner_idx).cloned()
}

#[async_trait]
impl OrderGateway for ClobClient {
    async fn place_limit_buy(
        &self,
        token: &OutcomeToken,
        price: Decimal,
        shares: Decimal,
    ) -> Result<OrderRef, GatewayError> {
        let payload = json!({
            "tokenID": token.token_id,
            "price": price.to_string(),
            "size": shares.to_string(),
            "side": "BUY",
            "orderType": "GTC",
        });
        self.post_order(payload, OrderSide::Buy, price, shares)
            .await
    }

    async fn place_limit_sell(
        &self,
        token: &OutcomeToken,
        price: Decimal,
        shares: Decimal,
    ) -> Result<OrderRef, GatewayError> {
        let payload = json!({
            "tokenID": token.token_id,
            "price": price.to_string(),
            "size": shares.to_string(),
            "side": "SELL",
            "orderType": "GTC",
        });
        self.post_order(payload, OrderSide::Sell, price, shares)
            .await
    }

    async fn place_immediate_sell(
        &self,
        token: &OutcomeToken,
        shares: Decimal,
    ) -> Result<OrderRef, GatewayError> {
        let payload = json!({
            "tokenID": token.token_id,
            "amount": shares.to_string(),
            "side": "SELL",
            "orderType": "FOK",
        });
        self.post_order(payload, OrderSide::Sell, Decimal::ZERO, shares)
            .await
    }

    async fn cancel(&self, order_id: &str) -> Result<(), GatewayError> {
        let path = "/order";
        let body = json!({ "orderID": order_id }).to_string();
        let headers = self.build_l2_headers("DELETE", path, &body)?;
        let url = format!("{}{}", self.config.clob_url, path);

        let resp = self
            .http
            .delete(&url)
            .headers(headers)
            .body(body)
            .send()
            .await
            .map_err(Self::map_reqwest)?;

        // Cancelling an already-gone order is success from our side.
        if resp.status() == StatusCode::NOT_FOUND {
            debug!(order_id = %order_id, "Cancel target already gone");
            return Ok(());
        }
        if resp.status().is_client_error() {
            let status = resp.status();
            let text = resp.text().await.unwrap_or_default();
            return Err(GatewayError::Rejected(format!("{status}: {text}")));
        }
        resp.error_for_status().map_err(Self::map_reqwest)?;
        Ok(())
    }

    async fn order_status(&self, order_id: &str) -> Result<OrderStatus, GatewayError> {
        let path = format!("/data/order/{order_id}");
        let headers = self.build_l2_headers("GET", &path, "")?;
        let url = format!("{}{}", self.config.clob_url, path);

        let resp = self.http.get(&url).headers(headers).send().await.map_err(Self::map_reqwest)?;
        // An order the gateway no longer recognizes is gone, not unknown.
        if resp.status() == StatusCode::NOT_FOUND {
            debug!(order_id = %order_id, "Order unknown to gateway");
            return Ok(OrderStatus::Cancelled);
        }
        let resp = resp.error_for_status().map_err(Self::map_reqwest)?;

        let parsed: OrderStatusResponse = resp.json().await.map_err(Self::map_reqwest)?;
        Ok(parsed
            .status
            .as_deref()
            .map(OrderStatus::from_gateway_label)
            .unwrap_or(OrderStatus::Unknown))
    }

    async fn fill_price(&self, order_id: &str) -> Result<Option<Decimal>, GatewayError> {
        let path = format!("/data/order/{order_id}");
        let headers = self.build_l2_headers("GET", &path, "")?;
        let url = format!("{}{}", self.config.clob_url, path);

        let resp = self
            .http
            .get(&url)
            .headers(headers)
            .send()
            .await
            .map_err(Self::map_reqwest)?
            .error_for_status()
            .map_err(Self::map_reqwest)?;

        let parsed: OrderStatusResponse = resp.json().await.map_err(Self::map_reqwest)?;
        let price = parsed
            .avg_price
            .or(parsed.price)
            .and_then(|p| p.parse::<Decimal>().ok())
            .filter(|p| *p > Decimal::ZERO);
        Ok(price)
    }

    async fn mid_price(&self, token: &OutcomeToken) -> Result<Option<Decimal>, GatewayError> {
        let url = format!("{}/midpoint", self.config.clob_url);
        let resp = self
            .http
            .get(&url)
            .query(&[("token_id", token.token_id.as_str())])
            .send()
            .await
            .map_err(Self::map_reqwest)?
            .error_for_status()
            .map_err(Self::map_reqwest)?;

        let parsed: MidpointResponse = resp.json().await.map_err(Self::map_reqwest)?;
        Ok(parsed
            .mid
            .and_then(|m| m.parse::<Decimal>().ok())
            .filter(|m| *m > Decimal::ZERO))
    }
}

#[async_trait]
impl ResolutionSource for ClobClient {
    async fn market_resolution(&self, market_id: &str) -> Result<Option<String>, GatewayError> {
        let Some(market) = self.fetch_gamma_market(market_id).await? else {
            return Ok(None);
        };

        let closed = market.closed.unwrap_or(false);
        let uma_resolved = market
            .uma_resolution_status
            .as_deref()
            .map(|s| s.eq_ignore_ascii_case("resolved"))
            .unwrap_or(false);
        if !closed && !uma_resolved {
            return Ok(None);
        }

        Ok(declared_outcome(&market))
    }

    async fn reference_settlement_value(
        &self,
        market_id: &str,
    ) -> Result<Option<String>, GatewayError> {
        let window = {
            let windows = self.reference_windows.read().await;
            windows.get(market_id).cloned()
        };
        let Some(window) = window else {
            debug!(market_id = %market_id, "No reference window registered");
            return Ok(None);
        };

        let url = format!("{}/api/v3/klines", self.config.reference_url);
        let resp = self
            .http
            .get(&url)
            .query(&[
                ("symbol", window.symbol.as_str()),
                ("interval", window.interval.as_str()),
                ("startTime", &window.open_time_ms.to_string()),
                ("limit", "1"),
            ])
            .send()
            .await
            .map_err(Self::map_reqwest)?
            .error_for_status()
            .map_err(Self::map_reqwest)?;

        let klines: Vec<Vec<serde_json::Value>> = resp.json().await.map_err(Self::map_reqwest)?;
        let Some(kline) = klines.first() else {
            return Ok(None);
        };
        let open = kline
            .get(1)
            .and_then(|v| v.as_str())
            .and_then(|s| s.parse::<Decimal>().ok());
        let close = kline
            .get(4)
            .and_then(|v| v.as_str())
            .and_then(|s| s.parse::<Decimal>().ok());

        match (open, close) {
            (Some(open), Some(close)) if open != close => {
                let outcome = if close > open { "Up" } else { "Down" };
                Ok(Some(outcome.to_string()))
            }
            (Some(_), Some(_)) => {
                warn!(market_id = %market_id, "Reference window settled exactly flat; cannot decide");
                Ok(None)
            }
            _ => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn declared_outcome_prefers_explicit_resolution() {
        let market = GammaMarket {
            closed: Some(true),
            uma_resolution_status: None,
            resolution: Some("Up".to_string()),
            outcome_prices: Some(json!(["0", "1"])),
            outcomes: Some(json!(["Up", "Down"])),
        };
        assert_eq!(declared_outcome(&market), Some("Up".to_string()));
    }

    #[test]
    fn declared_outcome_infers_winner_from_collapsed_prices() {
        let market = GammaMarket {
            closed: Some(true),
            uma_resolution_status: None,
            resolution: None,
            outcome_prices: Some(json!(["0.002", "0.998"])),
            outcomes: Some(json!(["Up", "Down"])),
        };
        assert_eq!(declared_outcome(&market), Some("Down".to_string()));
    }

    #[test]
    fn mid_range_prices_are_not_a_resolution() {
        let market = GammaMarket {
            closed: Some(true),
            uma_resolution_status: None,
            resolution: None,
            outcome_prices: Some(json!(["0.60", "0.40"])),
            outcomes: Some(json!(["Up", "Down"])),
        };
        assert_eq!(declared_outcome(&market), None);
    }

    #[test]
    fn gamma_string_encoded_arrays_are_parsed() {
        let value = json!("[\"Up\", \"Down\"]");
        assert_eq!(parse_string_array(&value), vec!["Up", "Down"]);
    }
}

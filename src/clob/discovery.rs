//! Market discovery
//!
//! Finds the currently-live market for a strategy's lane (e.g. the BTC
//! 15-minute up/down window that is open right now) via the Gamma API and
//! turns it into an immutable [`MarketRef`]. Results are cached with a
//! short TTL: once found, a market never changes, only expires.

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use reqwest::Client;
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use super::{ClobClient, GatewayError, ReferenceWindow};
use crate::types::{MarketRef, OutcomeToken};

/// What a strategy instance trades: one rolling market lane.
#[derive(Debug, Clone)]
pub struct MarketQuery {
    /// Gamma event slug prefix, e.g. "btc-updown-15m-"; the live slug is
    /// prefix + period start timestamp
    pub slug_prefix: String,
    /// Market period length in seconds (900 for 15m, 3600 for 1h)
    pub period_secs: i64,
    /// Reference exchange symbol for fallback settlement (e.g. "BTCUSDT")
    pub reference_symbol: Option<String>,
    /// Reference kline interval matching the period (e.g. "15m")
    pub reference_interval: Option<String>,
}

impl MarketQuery {
    /// Slug of the period containing `now`.
    pub fn current_slug(&self, now: DateTime<Utc>) -> String {
        let period_start = (now.timestamp() / self.period_secs) * self.period_secs;
        format!("{}{}", self.slug_prefix, period_start)
    }
}

/// Supplies the market a strategy should currently be looking at.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait MarketDiscovery: Send + Sync {
    async fn current_market(&self, query: &MarketQuery) -> Result<Option<MarketRef>, GatewayError>;
}

#[derive(Debug, Deserialize)]
struct GammaEvent {
    #[serde(default)]
    title: Option<String>,
    #[serde(default)]
    closed: Option<bool>,
    #[serde(default)]
    markets: Vec<GammaEventMarket>,
}

#[derive(Debug, Deserialize)]
struct GammaEventMarket {
    #[serde(rename = "conditionId")]
    condition_id: Option<String>,
    #[serde(default)]
    question: Option<String>,
    #[serde(default, rename = "clobTokenIds")]
    clob_token_ids: Option<serde_json::Value>,
    #[serde(default)]
    outcomes: Option<serde_json::Value>,
    #[serde(default, rename = "endDate")]
    end_date: Option<String>,
}

/// Live Gamma-backed discovery with a per-query TTL cache.
pub struct GammaDiscovery {
    http: Client,
    gamma_url: String,
    cache_ttl: Duration,
    /// (slug, market, fetched_at); one entry per slug_prefix
    cache: RwLock<std::collections::HashMap<String, (String, MarketRef, DateTime<Utc>)>>,
    /// Registers reference settlement windows as markets are found
    gateway: Option<Arc<ClobClient>>,
}

impl GammaDiscovery {
    pub fn new(gamma_url: impl Into<String>, gateway: Option<Arc<ClobClient>>) -> Self {
        Self {
            http: Client::builder()
                .timeout(Duration::from_secs(15))
                .build()
                .expect("Failed to create HTTP client"),
            gamma_url: gamma_url.into(),
            cache_ttl: Duration::from_secs(120),
            cache: RwLock::new(std::collections::HashMap::new()),
            gateway,
        }
    }

    pub fn with_cache_ttl(mut self, ttl: Duration) -> Self {
        self.cache_ttl = ttl;
        self
    }

    async fn fetch_event(&self, slug: &str) -> Result<Option<GammaEvent>, GatewayError> {
        let url = format!("{}/events/slug/{}", self.gamma_url, slug);
        let resp = self.http.get(&url).send().await.map_err(|e| {
            if e.is_timeout() {
                GatewayError::Timeout
            } else {
                GatewayError::Transport(e)
            }
        })?;

        if resp.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let resp = resp.error_for_status().map_err(GatewayError::Transport)?;
        let event: GammaEvent = resp.json().await.map_err(GatewayError::Transport)?;
        Ok(Some(event))
    }

    fn convert_event(query: &MarketQuery, slug: &str, event: GammaEvent) -> Option<MarketRef> {
        if event.closed.unwrap_or(false) {
            return None;
        }
        let market = event.markets.into_iter().next()?;
        let condition_id = market.condition_id.filter(|c| !c.is_empty())?;

        let token_ids = market
            .clob_token_ids
            .as_ref()
            .map(super::rest::parse_string_array)
            .unwrap_or_default();
        let labels = market
            .outcomes
            .as_ref()
            .map(super::rest::parse_string_array)
            .unwrap_or_default();
        if token_ids.len() < 2 || token_ids.len() != labels.len() {
            warn!(slug = %slug, tokens = token_ids.len(), labels = labels.len(),
                "Event market has unusable token/outcome arrays");
            return None;
        }

        let close_time = market
            .end_date
            .as_deref()
            .and_then(|d| DateTime::parse_from_rfc3339(d).ok())
            .map(|dt| dt.with_timezone(&Utc))
            .or_else(|| {
                // Up/down slugs encode the period start; close = start + period.
                slug.rsplit('-')
                    .next()
                    .and_then(|ts| ts.parse::<i64>().ok())
                    .and_then(|start| Utc.timestamp_opt(start + query.period_secs, 0).single())
            })?;

        let outcome_tokens = token_ids
            .into_iter()
            .zip(labels)
            .map(|(token_id, label)| OutcomeToken { token_id, label })
            .collect();

        Some(MarketRef {
            id: condition_id,
            question: market
                .question
                .or(event.title)
                .unwrap_or_else(|| slug.to_string()),
            outcome_tokens,
            close_time,
        })
    }
}

#[async_trait]
impl MarketDiscovery for GammaDiscovery {
    async fn current_market(&self, query: &MarketQuery) -> Result<Option<MarketRef>, GatewayError> {
        let now = Utc::now();
        let slug = query.current_slug(now);

        {
            let cache = self.cache.read().await;
            if let Some((cached_slug, market, fetched_at)) = cache.get(&query.slug_prefix) {
                let fresh = now.signed_duration_since(*fetched_at).num_seconds()
                    < self.cache_ttl.as_secs() as i64;
                if *cached_slug == slug && fresh {
                    return Ok(Some(market.clone()));
                }
            }
        }

        let Some(event) = self.fetch_event(&slug).await? else {
            debug!(slug = %slug, "No live event for slug");
            return Ok(None);
        };
        let Some(market) = Self::convert_event(query, &slug, event) else {
            return Ok(None);
        };

        info!(
            slug = %slug,
            market_id = %market.id,
            close_time = %market.close_time,
            outcomes = market.outcome_tokens.len(),
            "Discovered live market"
        );

        if let (Some(gateway), Some(symbol), Some(interval)) = (
            &self.gateway,
            &query.reference_symbol,
            &query.reference_interval,
        ) {
            let open_time_ms =
                (market.close_time.timestamp() - query.period_secs) * 1000;
            gateway
                .register_reference_window(
                    &market.id,
                    ReferenceWindow {
                        symbol: symbol.clone(),
                        interval: interval.clone(),
                        open_time_ms,
                    },
                )
                .await;
        }

        let mut cache = self.cache.write().await;
        cache.insert(query.slug_prefix.clone(), (slug, market.clone(), now));
        Ok(Some(market))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn current_slug_buckets_by_period() {
        let query = MarketQuery {
            slug_prefix: "btc-updown-15m-".to_string(),
            period_secs: 900,
            reference_symbol: None,
            reference_interval: None,
        };
        let now = Utc.timestamp_opt(1_771_387_755, 0).single().unwrap();
        // 1771387755 / 900 * 900 = 1771387200
        assert_eq!(query.current_slug(now), "btc-updown-15m-1771387200");
    }

    #[test]
    fn convert_event_derives_close_from_slug_when_end_date_missing() {
        let query = MarketQuery {
            slug_prefix: "btc-updown-15m-".to_string(),
            period_secs: 900,
            reference_symbol: None,
            reference_interval: None,
        };
        let event = GammaEvent {
            title: Some("Bitcoin Up or Down".to_string()),
            closed: Some(false),
            markets: vec![GammaEventMarket {
                condition_id: Some("cond-7".to_string()),
                question: Some("BTC up or down?".to_string()),
                clob_token_ids: Some(serde_json::json!(["tok-up", "tok-down"])),
                outcomes: Some(serde_json::json!(["Up", "Down"])),
                end_date: None,
            }],
        };

        let market =
            GammaDiscovery::convert_event(&query, "btc-updown-15m-1771387200", event).unwrap();
        assert_eq!(market.id, "cond-7");
        assert_eq!(market.close_time.timestamp(), 1_771_387_200 + 900);
        assert_eq!(market.outcome_tokens[0].label, "Up");
        assert_eq!(market.outcome_tokens[1].token_id, "tok-down");
    }

    #[test]
    fn closed_or_tokenless_events_are_rejected() {
        let query = MarketQuery {
            slug_prefix: "btc-updown-15m-".to_string(),
            period_secs: 900,
            reference_symbol: None,
            reference_interval: None,
        };
        let closed = GammaEvent {
            title: None,
            closed: Some(true),
            markets: vec![],
        };
        assert!(GammaDiscovery::convert_event(&query, "slug", closed).is_none());

        let tokenless = GammaEvent {
            title: None,
            closed: Some(false),
            markets: vec![GammaEventMarket {
                condition_id: Some("cond".to_string()),
                question: None,
                clob_token_ids: Some(serde_json::json!(["only-one"])),
                outcomes: Some(serde_json::json!(["Up", "Down"])),
                end_date: None,
            }],
        };
        assert!(GammaDiscovery::convert_event(&query, "slug", tokenless).is_none());
    }
}

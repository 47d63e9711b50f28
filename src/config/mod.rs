//! Configuration management for PolySniper
//!
//! Loads from TOML/YAML files + environment variables via .env

use anyhow::{Context, Result};
use config::{Config, Environment, File};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Main application configuration
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    pub bot: BotConfig,
    pub scheduler: SchedulerConfig,
    pub gateway: GatewayConfig,
    pub reconciler: ReconcilerConfig,
    pub risk: RiskConfig,
    pub persistence: PersistenceConfig,
    /// Strategy instances to start at boot
    #[serde(default)]
    pub strategies: Vec<StrategySpec>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BotConfig {
    /// Bot version tag for logging and the trade record
    pub tag: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SchedulerConfig {
    /// Tick loop interval in seconds
    pub tick_interval_secs: u64,
    /// Hard ceiling on any single gateway call; expiry means status-unknown
    pub gateway_timeout_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct GatewayConfig {
    /// CLOB API endpoint
    pub clob_url: String,
    /// Gamma API endpoint
    pub gamma_url: String,
    /// Reference price API endpoint (settlement fallback)
    pub reference_url: String,
    /// Per-request HTTP timeout in seconds
    pub http_timeout_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ReconcilerConfig {
    /// Wait this long past close before the first resolution query
    pub poll_start_secs: i64,
    /// Fallback reference evidence is consulted only after this grace period
    pub grace_secs: i64,
    /// Forced settlement after this long past close
    pub forced_secs: i64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RiskConfig {
    /// Maximum entries per strategy per calendar day
    pub max_trades_per_day: u32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PersistenceConfig {
    /// Data directory
    pub data_dir: String,
    /// Enable the settled-trade CSV log
    pub csv_enabled: bool,
}

/// One strategy instance as written in the config file (plain floats;
/// converted to `StrategyConfig` before the engine sees it).
#[derive(Debug, Clone, Deserialize)]
pub struct StrategySpec {
    pub tag: String,
    /// Gamma slug prefix of the rolling market lane, e.g. "btc-updown-15m-"
    pub slug_prefix: String,
    /// Market period in seconds (900 for 15m, 3600 for 1h)
    pub period_secs: i64,
    /// Reference exchange symbol for fallback settlement (optional)
    #[serde(default)]
    pub reference_symbol: Option<String>,
    /// Reference kline interval (optional, e.g. "15m")
    #[serde(default)]
    pub reference_interval: Option<String>,
    pub entry_price_ceiling: f64,
    pub stop_distance: f64,
    pub target_distance: f64,
    pub notional_per_trade: f64,
    pub min_shares: f64,
    pub tick_size: f64,
    /// Enter only within this window before close
    pub entry_window_secs: i64,
    /// Cancel an unfilled entry after this long
    pub entry_timeout_secs: i64,
    /// Close-safety margin: no new entries, dangling orders cancelled,
    /// exits escalated to immediate sells inside this window
    pub close_safety_secs: i64,
}

/// Immutable runtime parameters of one strategy instance.
///
/// Created at strategy start from a [`StrategySpec`]; replaced only by
/// stop + restart.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StrategyConfig {
    pub tag: String,
    pub slug_prefix: String,
    pub period_secs: i64,
    pub reference_symbol: Option<String>,
    pub reference_interval: Option<String>,
    /// Never pay more than this for an entry
    pub entry_price_ceiling: Decimal,
    /// Stop-loss distance below the fill price
    pub stop_distance: Decimal,
    /// Profit-target distance above the fill price
    pub target_distance: Decimal,
    /// Target notional spend per trade
    pub notional_per_trade: Decimal,
    /// Exchange minimum share count
    pub min_shares: Decimal,
    /// Price tick size
    pub tick_size: Decimal,
    pub entry_window_secs: i64,
    pub entry_timeout_secs: i64,
    pub close_safety_secs: i64,
}

fn to_decimal(value: f64, field: &str) -> Result<Decimal> {
    Decimal::try_from(value)
        .map(|d| d.round_dp(6))
        .with_context(|| format!("{field} = {value} is not a valid decimal"))
}

impl StrategySpec {
    /// Validate and convert the file form into runtime parameters.
    pub fn into_config(self) -> Result<StrategyConfig> {
        anyhow::ensure!(!self.tag.trim().is_empty(), "strategy tag must not be empty");
        anyhow::ensure!(self.period_secs > 0, "period_secs must be positive");
        anyhow::ensure!(
            self.entry_timeout_secs > 0 && self.close_safety_secs >= 0,
            "entry_timeout_secs must be positive and close_safety_secs non-negative"
        );

        Ok(StrategyConfig {
            entry_price_ceiling: to_decimal(self.entry_price_ceiling, "entry_price_ceiling")?,
            stop_distance: to_decimal(self.stop_distance, "stop_distance")?,
            target_distance: to_decimal(self.target_distance, "target_distance")?,
            notional_per_trade: to_decimal(self.notional_per_trade, "notional_per_trade")?,
            min_shares: to_decimal(self.min_shares, "min_shares")?,
            tick_size: to_decimal(self.tick_size, "tick_size")?,
            tag: self.tag,
            slug_prefix: self.slug_prefix,
            period_secs: self.period_secs,
            reference_symbol: self.reference_symbol,
            reference_interval: self.reference_interval,
            entry_window_secs: self.entry_window_secs,
            entry_timeout_secs: self.entry_timeout_secs,
            close_safety_secs: self.close_safety_secs,
        })
    }
}

impl AppConfig {
    /// Load configuration from file and environment
    pub fn load() -> Result<Self> {
        // Load .env file first
        dotenvy::dotenv().ok();

        let config = Config::builder()
            .set_default("bot.tag", env!("CARGO_PKG_VERSION"))?
            // Scheduler defaults
            .set_default("scheduler.tick_interval_secs", 3)?
            .set_default("scheduler.gateway_timeout_secs", 10)?
            // Gateway defaults
            .set_default("gateway.clob_url", "https://clob.polymarket.com")?
            .set_default("gateway.gamma_url", "https://gamma-api.polymarket.com")?
            .set_default("gateway.reference_url", "https://api.binance.com")?
            .set_default("gateway.http_timeout_secs", 10)?
            // Reconciler defaults: first poll 30s after close, reference
            // fallback after 120s, forced settlement after 600s
            .set_default("reconciler.poll_start_secs", 30)?
            .set_default("reconciler.grace_secs", 120)?
            .set_default("reconciler.forced_secs", 600)?
            // Risk defaults
            .set_default("risk.max_trades_per_day", 20)?
            // Persistence defaults
            .set_default("persistence.data_dir", "./data")?
            .set_default("persistence.csv_enabled", true)?
            // Load config file if exists
            .add_source(File::with_name("config/default").required(false))
            .add_source(File::with_name("config/local").required(false))
            // Override with environment variables (POLYSNIPER_*)
            .add_source(Environment::with_prefix("POLYSNIPER").separator("__"))
            .build()
            .context("Failed to build configuration")?;

        let app_config: AppConfig = config
            .try_deserialize()
            .context("Failed to deserialize configuration")?;

        Ok(app_config)
    }

    /// Generate a digest of the config (without secrets) for logging
    pub fn digest(&self) -> String {
        format!(
            "bot={} tick={}s strategies={:?}",
            self.bot.tag,
            self.scheduler.tick_interval_secs,
            self.strategies
                .iter()
                .map(|s| s.tag.as_str())
                .collect::<Vec<_>>()
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn spec() -> StrategySpec {
        StrategySpec {
            tag: "btc-sniper-15m".to_string(),
            slug_prefix: "btc-updown-15m-".to_string(),
            period_secs: 900,
            reference_symbol: Some("BTCUSDT".to_string()),
            reference_interval: Some("15m".to_string()),
            entry_price_ceiling: 0.85,
            stop_distance: 0.10,
            target_distance: 0.10,
            notional_per_trade: 1.0,
            min_shares: 5.0,
            tick_size: 0.01,
            entry_window_secs: 180,
            entry_timeout_secs: 60,
            close_safety_secs: 20,
        }
    }

    #[test]
    fn spec_converts_to_decimal_config() {
        let cfg = spec().into_config().unwrap();
        assert_eq!(cfg.entry_price_ceiling, dec!(0.85));
        assert_eq!(cfg.stop_distance, dec!(0.10));
        assert_eq!(cfg.notional_per_trade, dec!(1));
        assert_eq!(cfg.min_shares, dec!(5));
        assert_eq!(cfg.tick_size, dec!(0.01));
    }

    #[test]
    fn spec_rejects_empty_tag_and_bad_periods() {
        let mut bad = spec();
        bad.tag = "  ".to_string();
        assert!(bad.into_config().is_err());

        let mut bad = spec();
        bad.period_secs = 0;
        assert!(bad.into_config().is_err());

        let mut bad = spec();
        bad.entry_timeout_secs = 0;
        assert!(bad.into_config().is_err());
    }
}

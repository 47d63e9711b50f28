//! PolySniper binary: wire config, gateway, and engine together and run
//! the tick loop until ctrl-c.

use anyhow::{Context, Result};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use polysniper::clob::{ClobClient, ClobConfig, GammaDiscovery, TimeoutGateway};
use polysniper::config::AppConfig;
use polysniper::engine::Engine;
use polysniper::persistence::{SnapshotStore, TradeLog};
use polysniper::strategy::FavoriteSignal;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = AppConfig::load().context("Failed to load configuration")?;
    info!(config = %config.digest(), "PolySniper starting");

    // Live gateway, shared by ordering, resolution, and discovery.
    let clob = Arc::new(ClobClient::new(ClobConfig {
        clob_url: config.gateway.clob_url.clone(),
        gamma_url: config.gateway.gamma_url.clone(),
        reference_url: config.gateway.reference_url.clone(),
        http_timeout_secs: config.gateway.http_timeout_secs,
        ..ClobConfig::from_env()
    }));
    let call_timeout = Duration::from_secs(config.scheduler.gateway_timeout_secs);
    let gateway = Arc::new(TimeoutGateway::new(Arc::clone(&clob), call_timeout));
    let resolution = Arc::new(TimeoutGateway::new(Arc::clone(&clob), call_timeout));
    let discovery = Arc::new(GammaDiscovery::new(
        config.gateway.gamma_url.clone(),
        Some(Arc::clone(&clob)),
    ));

    let snapshots = SnapshotStore::new(&config.persistence.data_dir)?;
    // Read the previous state up front; the store then moves into the engine.
    let previous = snapshots.load();
    let trade_log = if config.persistence.csv_enabled {
        Some(TradeLog::new(&config.persistence.data_dir)?)
    } else {
        None
    };

    let mut engine = Engine::new(
        gateway,
        resolution,
        discovery,
        config.reconciler.clone(),
        config.scheduler.clone(),
        snapshots,
        trade_log,
        config.risk.max_trades_per_day,
    );

    // Resume from the previous snapshot, then reconcile every recovered
    // position against the live gateway before ticking.
    match previous {
        Ok(Some(snapshot)) => {
            engine.restore(snapshot, |_| Box::new(FavoriteSignal::default()));
            engine.recover().await;
        }
        Ok(None) => info!("No previous snapshot; starting clean"),
        Err(e) => {
            // A version mismatch must stop the operator, not be guessed at.
            error!(error = %e, "Snapshot unreadable");
            return Err(e.into());
        }
    }

    // Start strategies from config that are not already restored.
    let running = engine.running_tags();
    for spec in config.strategies.clone() {
        if running.contains(&spec.tag) {
            continue;
        }
        let strategy_config = spec.into_config()?;
        engine.start_strategy(strategy_config, Box::new(FavoriteSignal::default()))?;
    }
    if engine.running_tags().is_empty() {
        warn!("No strategies configured; the engine will idle");
    }

    // Log every position event (the notification layer proper is external).
    let mut events = engine.subscribe();
    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(event) => info!(event = ?event, "Position event"),
                Err(tokio::sync::broadcast::error::RecvError::Lagged(missed)) => {
                    warn!(missed, "Event consumer lagged");
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            }
        }
    });

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Shutdown signal received");
            let _ = shutdown_tx.send(true);
        }
    });

    engine.run(shutdown_rx).await;
    info!("PolySniper stopped");
    Ok(())
}

//! Persistence
//!
//! Versioned JSON snapshots of every strategy's non-terminal positions and
//! aggregate stats, written on each state transition and reloaded at
//! startup so a crash never loses track of a live order. Stored state is a
//! hint, not the truth: recovery re-queries the gateway before resuming.
//!
//! Also keeps an append-only CSV of settled trades for offline analysis.

use anyhow::{Context, Result};
use chrono::Utc;
use csv::WriterBuilder;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fs::{self, OpenOptions};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::info;

use crate::config::StrategyConfig;
use crate::types::{AggregateStats, Position};

/// Bumped on every incompatible snapshot schema change.
pub const SNAPSHOT_VERSION: u32 = 1;

/// Snapshot load/store failures.
#[derive(Debug, Error)]
pub enum SnapshotError {
    /// The stored schema version does not match this build. Never misread
    /// silently; the operator decides whether to migrate or discard.
    #[error("snapshot version mismatch: found {found}, expected {expected}")]
    VersionMismatch { found: u32, expected: u32 },
    #[error("snapshot io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("snapshot serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}

/// Everything one strategy instance needs to resume after a restart.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StrategySnapshot {
    pub tag: String,
    pub config: StrategyConfig,
    pub stats: AggregateStats,
    /// Non-terminal positions only; terminal ones live in the trade log
    pub open_positions: Vec<Position>,
}

/// The full persisted engine state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineSnapshot {
    pub version: u32,
    pub saved_at: i64,
    pub strategies: Vec<StrategySnapshot>,
}

impl EngineSnapshot {
    pub fn new(strategies: Vec<StrategySnapshot>) -> Self {
        Self {
            version: SNAPSHOT_VERSION,
            saved_at: Utc::now().timestamp_millis(),
            strategies,
        }
    }
}

/// Snapshot file store with atomic replace semantics.
pub struct SnapshotStore {
    path: PathBuf,
}

impl SnapshotStore {
    pub fn new(data_dir: impl AsRef<Path>) -> Result<Self> {
        let dir = data_dir.as_ref();
        fs::create_dir_all(dir).context("Failed to create data directory")?;
        Ok(Self {
            path: dir.join("engine_state.json"),
        })
    }

    /// Write the snapshot to a temp file and rename it into place, so a
    /// crash mid-write never leaves a truncated state file.
    pub fn save(&self, snapshot: &EngineSnapshot) -> Result<(), SnapshotError> {
        let json = serde_json::to_string_pretty(snapshot)?;
        let tmp = self.path.with_extension("json.tmp");
        fs::write(&tmp, json)?;
        fs::rename(&tmp, &self.path)?;
        Ok(())
    }

    /// Load the previous snapshot, if any. A version mismatch is an error,
    /// not a silent misread.
    pub fn load(&self) -> Result<Option<EngineSnapshot>, SnapshotError> {
        if !self.path.exists() {
            return Ok(None);
        }
        let json = fs::read_to_string(&self.path)?;
        let snapshot: EngineSnapshot = serde_json::from_str(&json)?;
        if snapshot.version != SNAPSHOT_VERSION {
            return Err(SnapshotError::VersionMismatch {
                found: snapshot.version,
                expected: SNAPSHOT_VERSION,
            });
        }
        info!(
            path = %self.path.display(),
            strategies = snapshot.strategies.len(),
            saved_at = snapshot.saved_at,
            "Loaded engine snapshot"
        );
        Ok(Some(snapshot))
    }
}

/// One settled trade for the CSV record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SettledTradeRecord {
    pub timestamp: i64,
    pub strategy_tag: String,
    pub market_id: String,
    pub question: String,
    pub outcome: String,
    pub entry_price: Option<Decimal>,
    pub shares: Decimal,
    pub notional_cost: Decimal,
    pub exit_price: Option<Decimal>,
    /// WIN / LOSS / ABORTED / FORCED
    pub result: String,
    pub exit_reason: Option<String>,
    pub pnl: Option<Decimal>,
}

/// Append-only daily CSV trade log.
pub struct TradeLog {
    dir: PathBuf,
}

impl TradeLog {
    pub fn new(data_dir: impl AsRef<Path>) -> Result<Self> {
        let dir = data_dir.as_ref().join("trades");
        fs::create_dir_all(&dir).context("Failed to create trades directory")?;
        Ok(Self { dir })
    }

    /// Append one record to today's file, writing the header only when the
    /// file is new or empty.
    pub fn append(&self, record: &SettledTradeRecord) -> Result<()> {
        let filename = format!("trades_{}.csv", Utc::now().format("%Y-%m-%d"));
        let path = self.dir.join(filename);
        let file_has_data =
            path.exists() && fs::metadata(&path).map(|m| m.len() > 0).unwrap_or(false);

        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .context("Failed to open trade log file")?;

        let mut writer = WriterBuilder::new()
            .has_headers(!file_has_data)
            .from_writer(file);
        writer
            .serialize(record)
            .context("Failed to write trade record")?;
        writer.flush().context("Failed to flush trade log")?;
        Ok(())
    }
}

//! Crash-recoverable position state.
//!
//! One JSON file holds the per-token positions and session aggregates.
//! Saves go through a temporary sibling and an atomic rename so a crash
//! mid-write can never leave a truncated file behind; loads fall back to
//! a fresh state when the file is absent or unreadable.

use std::collections::HashMap;
use std::fs;
use std::path::PathBuf;

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};

use pmm_common::TokenId;

/// Errors surfaced by `save_state`. Loads never fail; they degrade.
#[derive(Debug, Error)]
pub enum StateError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// Persisted view of one position.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PositionState {
    pub quantity: Decimal,
    pub avg_cost: Decimal,
    pub realized_pnl: Decimal,
}

/// Durable engine state across restarts.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TradingState {
    #[serde(default)]
    pub last_session_id: String,
    /// Epoch seconds of the last save.
    #[serde(default)]
    pub last_updated: i64,
    #[serde(default)]
    pub total_trades: u64,
    #[serde(default)]
    pub total_volume: Decimal,
    #[serde(default)]
    pub total_realized_pnl: Decimal,
    #[serde(default)]
    pub positions: HashMap<TokenId, PositionState>,
}

/// Reader/writer for the state file.
pub struct StatePersistence {
    state_file: PathBuf,
}

impl StatePersistence {
    pub fn new(state_file: impl Into<PathBuf>) -> Self {
        let state_file = state_file.into();
        debug!(file = %state_file.display(), "state persistence initialized");
        Self { state_file }
    }

    /// Serialize and atomically replace the state file.
    pub fn save_state(&self, state: &TradingState) -> Result<(), StateError> {
        if let Some(parent) = self.state_file.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }

        let json = serde_json::to_string_pretty(state)?;
        let tmp_file = self.state_file.with_extension("json.tmp");
        fs::write(&tmp_file, json)?;
        fs::rename(&tmp_file, &self.state_file)?;

        debug!(
            positions = state.positions.len(),
            trades = state.total_trades,
            pnl = %state.total_realized_pnl,
            "state saved"
        );
        Ok(())
    }

    /// Load the last saved state; absent or malformed files start fresh.
    pub fn load_state(&self) -> TradingState {
        if !self.state_file.exists() {
            info!(file = %self.state_file.display(), "no previous state file, starting fresh");
            return TradingState::default();
        }

        let raw = match fs::read_to_string(&self.state_file) {
            Ok(r) => r,
            Err(e) => {
                warn!(file = %self.state_file.display(), error = %e,
                    "failed to read state file, starting fresh");
                return TradingState::default();
            }
        };

        match serde_json::from_str::<TradingState>(&raw) {
            Ok(state) => {
                info!(
                    positions = state.positions.len(),
                    trades = state.total_trades,
                    pnl = %state.total_realized_pnl,
                    session = %state.last_session_id,
                    "loaded previous state"
                );
                state
            }
            Err(e) => {
                warn!(file = %self.state_file.display(), error = %e,
                    "state file malformed, starting fresh");
                TradingState::default()
            }
        }
    }
}

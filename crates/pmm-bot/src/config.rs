//! Configuration: TOML file, environment overrides, CLI overrides.
//!
//! Every field has a working default so the bot runs with no config file
//! at all. Environment variables win over the file; CLI flags win over
//! both (applied in `main`).

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use rust_decimal::Decimal;
use serde::Deserialize;

use pmm_common::TradingMode;
use pmm_market::clob::DEFAULT_WS_URL;
use pmm_market::catalog::DEFAULT_GAMMA_URL;

use crate::strategy::engine::EngineConfig;

/// Top-level bot configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BotConfig {
    /// Trading mode: "paper" or "live".
    pub mode: String,
    /// Log level for the tracing subscriber.
    pub log_level: String,
    /// Root directory for session audit logs.
    pub log_dir: PathBuf,
    /// Path of the persisted state file.
    pub state_file: PathBuf,
    pub trading: TradingSettings,
    pub feed: FeedSettings,
    pub catalog: CatalogSettings,
}

impl Default for BotConfig {
    fn default() -> Self {
        Self {
            mode: "paper".to_string(),
            log_level: "info".to_string(),
            log_dir: PathBuf::from("./logs"),
            state_file: PathBuf::from("./state.json"),
            trading: TradingSettings::default(),
            feed: FeedSettings::default(),
            catalog: CatalogSettings::default(),
        }
    }
}

/// Quoting parameters.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TradingSettings {
    /// Target spread as a fraction of mid.
    pub spread_pct: f64,
    /// Maximum position per token, in dollars.
    pub max_position: Decimal,
}

impl Default for TradingSettings {
    fn default() -> Self {
        Self {
            spread_pct: 0.02,
            max_position: Decimal::new(1000, 0),
        }
    }
}

/// Websocket transport parameters.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct FeedSettings {
    pub ws_url: String,
    pub connect_timeout_secs: u64,
    pub max_reconnect_attempts: u32,
    pub reconnect_backoff_secs: u64,
}

impl Default for FeedSettings {
    fn default() -> Self {
        Self {
            ws_url: DEFAULT_WS_URL.to_string(),
            connect_timeout_secs: 10,
            max_reconnect_attempts: 5,
            reconnect_backoff_secs: 2,
        }
    }
}

/// Event-catalog endpoint.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CatalogSettings {
    pub base_url: String,
}

impl Default for CatalogSettings {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_GAMMA_URL.to_string(),
        }
    }
}

impl BotConfig {
    /// Load from a TOML file.
    pub fn from_file(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file {}", path.display()))?;
        let config: BotConfig = toml::from_str(&raw)
            .with_context(|| format!("failed to parse config file {}", path.display()))?;
        Ok(config)
    }

    /// Environment variables override file values.
    pub fn apply_env_overrides(&mut self) {
        if let Ok(mode) = std::env::var("PMM_MODE") {
            self.mode = mode;
        }
        if let Ok(level) = std::env::var("PMM_LOG_LEVEL") {
            self.log_level = level;
        }
        if let Ok(dir) = std::env::var("PMM_LOG_DIR") {
            self.log_dir = PathBuf::from(dir);
        }
        if let Ok(file) = std::env::var("PMM_STATE_FILE") {
            self.state_file = PathBuf::from(file);
        }
        if let Ok(url) = std::env::var("PMM_WS_URL") {
            self.feed.ws_url = url;
        }
        if let Ok(url) = std::env::var("PMM_GAMMA_URL") {
            self.catalog.base_url = url;
        }
    }

    /// Reject configurations the engine cannot run with.
    pub fn validate(&self) -> Result<()> {
        self.trading_mode()?;
        if !(self.trading.spread_pct > 0.0 && self.trading.spread_pct < 1.0) {
            bail!("trading.spread_pct must be in (0, 1)");
        }
        if self.trading.max_position <= Decimal::ZERO {
            bail!("trading.max_position must be positive");
        }
        if self.feed.max_reconnect_attempts == 0 {
            bail!("feed.max_reconnect_attempts must be at least 1");
        }
        Ok(())
    }

    pub fn trading_mode(&self) -> Result<TradingMode> {
        self.mode
            .parse()
            .map_err(|e: String| anyhow::anyhow!(e))
    }

    pub fn engine_config(&self) -> Result<EngineConfig> {
        Ok(EngineConfig {
            mode: self.trading_mode()?,
            spread_pct: self.trading.spread_pct,
            max_position: self.trading.max_position,
            state_file: self.state_file.clone(),
            log_dir: self.log_dir.clone(),
        })
    }

    pub fn feed_config(&self) -> pmm_market::FeedConfig {
        pmm_market::FeedConfig {
            ws_url: self.feed.ws_url.clone(),
            connect_timeout: Duration::from_secs(self.feed.connect_timeout_secs),
            max_reconnect_attempts: self.feed.max_reconnect_attempts,
            reconnect_backoff: Duration::from_secs(self.feed.reconnect_backoff_secs),
            ping_interval: Duration::from_secs(9),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_defaults_are_valid() {
        let config = BotConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.trading_mode().unwrap(), TradingMode::Paper);
        assert_eq!(config.trading.spread_pct, 0.02);
        assert_eq!(config.trading.max_position, dec!(1000));
    }

    #[test]
    fn test_parse_partial_toml() {
        let config: BotConfig = toml::from_str(
            r#"
            mode = "live"

            [trading]
            spread_pct = 0.03
            "#,
        )
        .unwrap();

        assert_eq!(config.trading_mode().unwrap(), TradingMode::Live);
        assert_eq!(config.trading.spread_pct, 0.03);
        // Unspecified sections fall back to defaults.
        assert_eq!(config.trading.max_position, dec!(1000));
        assert_eq!(config.feed.max_reconnect_attempts, 5);
    }

    #[test]
    fn test_invalid_mode_rejected() {
        let config = BotConfig {
            mode: "backtest".to_string(),
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_invalid_spread_rejected() {
        let mut config = BotConfig::default();
        config.trading.spread_pct = 1.5;
        assert!(config.validate().is_err());

        config.trading.spread_pct = 0.0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_zero_reconnect_attempts_rejected() {
        let mut config = BotConfig::default();
        config.feed.max_reconnect_attempts = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_engine_config_mapping() {
        let config = BotConfig::default();
        let engine = config.engine_config().unwrap();
        assert_eq!(engine.mode, TradingMode::Paper);
        assert_eq!(engine.spread_pct, 0.02);
        assert_eq!(engine.state_file, PathBuf::from("./state.json"));
    }
}

//! Event-driven market-making engine for binary prediction markets.
//!
//! The engine maintains two-sided limit quotes on outcome tokens, skewing
//! placement and size by inventory, event timing, and the toxicity of
//! recent fills. A single strategy thread drains a blocking event queue
//! fed by the websocket transport; in paper mode the order manager fills
//! resting orders against the last known book and feeds the fills back
//! through the same queue.
//!
//! ## Modules
//!
//! - `events`: tagged event union and the blocking MPSC queue
//! - `strategy`: quote generation, adverse-selection monitoring, event loop
//! - `order_manager`: order lifecycle and the paper-fill simulator
//! - `state`: crash-recoverable position persistence
//! - `audit`: per-session CSV streams and the market-summary aggregator
//! - `feed`: bridge from the websocket client to the event queue
//! - `config`: TOML configuration with environment overrides

pub mod audit;
pub mod config;
pub mod events;
pub mod feed;
pub mod order_manager;
pub mod state;
pub mod strategy;

pub use config::BotConfig;
pub use events::{EngineEvent, EventQueue};
pub use order_manager::OrderManager;
pub use state::{PositionState, StatePersistence, TradingState};
pub use strategy::adverse::AdverseSelectionMonitor;
pub use strategy::engine::{EngineStats, StrategyEngine};
pub use strategy::maker::{MarketMaker, Quote};

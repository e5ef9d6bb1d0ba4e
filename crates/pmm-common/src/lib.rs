//! Shared types for the prediction-market maker.
//!
//! CRITICAL: All prices and quantities use `rust_decimal::Decimal`.
//! NEVER use f64 for financial math. Model statistics (volatility,
//! spread multipliers, scores) are plain f64.

pub mod types;

pub use types::{
    BookLevel, CancelReason, ConditionId, MarketId, MarketMetadata, MarketPhase, Order, OrderId,
    OrderStatus, Side, TokenId, TradingMode,
};

//! Market-data layer for the prediction-market maker.
//!
//! - `book`: per-token two-sided depth ladder
//! - `types`: CLOB websocket message shapes and Gamma API models
//! - `clob`: websocket client with reconnect policy
//! - `catalog`: Gamma event-catalog HTTP client

pub mod book;
pub mod catalog;
pub mod clob;
pub mod types;

pub use book::OrderBook;
pub use catalog::{CatalogClient, CatalogError, EventInfo, MarketInfo};
pub use clob::{FeedEvent, FeedClient, FeedConfig, FeedError};
pub use types::{
    BookMessage, GammaEvent, GammaMarket, OrderSummary, PriceChange, PriceChangeMessage,
    SubscribeMessage,
};

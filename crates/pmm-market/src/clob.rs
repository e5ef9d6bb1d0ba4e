//! CLOB websocket client.
//!
//! Connects to the market channel, subscribes to a token set, and emits
//! parsed `FeedEvent`s over an mpsc channel. Malformed payloads are logged
//! and dropped; the stream continues. Connection loss triggers reconnects
//! with linear backoff until the attempt budget is exhausted, at which
//! point `run` returns an error and the caller decides how to wind down.

use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use rust_decimal::Decimal;
use thiserror::Error;
use tokio::sync::{broadcast, mpsc};
use tokio::time::{interval, timeout};
use tokio_tungstenite::{
    connect_async_with_config,
    tungstenite::{protocol::Message, protocol::WebSocketConfig, Error as WsError},
};
use tracing::{debug, info, warn};

use pmm_common::{BookLevel, Side, TokenId};

use crate::types::{BookMessage, GenericMessage, PriceChangeMessage, SubscribeMessage};

/// Default market channel URL.
pub const DEFAULT_WS_URL: &str = "wss://ws-subscriptions-clob.polymarket.com/ws/market";

/// The venue can deliver very large snapshot batches.
const MAX_MESSAGE_BYTES: usize = 64 * 1024 * 1024;

/// Errors from the feed client.
#[derive(Debug, Error)]
pub enum FeedError {
    #[error("connection failed: {0}")]
    Connection(String),

    #[error("websocket error: {0}")]
    WebSocket(#[from] WsError),

    #[error("subscribe serialization failed: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("connection timeout")]
    Timeout,

    #[error("stream ended")]
    StreamEnded,

    #[error("reconnect attempts exhausted after {0} tries")]
    ReconnectExhausted(u32),
}

/// Parsed feed event delivered to the consumer.
#[derive(Debug, Clone)]
pub enum FeedEvent {
    /// Connection established and subscription sent.
    Connected,
    /// Full snapshot for one token.
    BookSnapshot {
        token_id: TokenId,
        bids: Vec<BookLevel>,
        asks: Vec<BookLevel>,
    },
    /// Single-level delta for one token.
    PriceLevel {
        token_id: TokenId,
        side: Side,
        price: Decimal,
        size: Decimal,
    },
    /// Connection lost; a reconnect follows unless the budget is spent.
    Disconnected(String),
}

/// Feed connection and retry policy.
#[derive(Debug, Clone)]
pub struct FeedConfig {
    pub ws_url: String,
    pub connect_timeout: Duration,
    /// Consecutive failed sessions tolerated before giving up.
    pub max_reconnect_attempts: u32,
    /// Linear backoff unit: attempt `n` waits `n * reconnect_backoff`.
    pub reconnect_backoff: Duration,
    /// Keepalive ping cadence (the venue expects one every ~10s).
    pub ping_interval: Duration,
}

impl Default for FeedConfig {
    fn default() -> Self {
        Self {
            ws_url: DEFAULT_WS_URL.to_string(),
            connect_timeout: Duration::from_secs(10),
            max_reconnect_attempts: 5,
            reconnect_backoff: Duration::from_secs(2),
            ping_interval: Duration::from_secs(9),
        }
    }
}

/// Websocket client for the market channel.
pub struct FeedClient {
    config: FeedConfig,
    tokens: Vec<TokenId>,
    event_tx: mpsc::Sender<FeedEvent>,
}

impl FeedClient {
    pub fn new(config: FeedConfig, tokens: Vec<TokenId>, event_tx: mpsc::Sender<FeedEvent>) -> Self {
        Self {
            config,
            tokens,
            event_tx,
        }
    }

    /// Run with automatic reconnection until shutdown or attempt exhaustion.
    pub async fn run(&self, mut shutdown: broadcast::Receiver<()>) -> Result<(), FeedError> {
        let mut failed_attempts: u32 = 0;

        loop {
            if shutdown.try_recv().is_ok() {
                info!("feed: shutdown signal received");
                return Ok(());
            }

            match self.run_session(&mut shutdown).await {
                Ok(()) => {
                    info!("feed: clean shutdown");
                    return Ok(());
                }
                Err(e) => {
                    failed_attempts += 1;
                    let _ = self
                        .event_tx
                        .send(FeedEvent::Disconnected(e.to_string()))
                        .await;

                    if failed_attempts >= self.config.max_reconnect_attempts {
                        warn!(
                            attempts = failed_attempts,
                            "feed: reconnect attempts exhausted"
                        );
                        return Err(FeedError::ReconnectExhausted(failed_attempts));
                    }

                    let delay = self.config.reconnect_backoff * failed_attempts;
                    warn!(error = %e, attempt = failed_attempts, ?delay, "feed: reconnecting");

                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        _ = shutdown.recv() => {
                            info!("feed: shutdown during reconnect delay");
                            return Ok(());
                        }
                    }
                }
            }
        }
    }

    /// One websocket session: connect, subscribe, pump messages.
    async fn run_session(&self, shutdown: &mut broadcast::Receiver<()>) -> Result<(), FeedError> {
        info!(url = %self.config.ws_url, "feed: connecting");

        let mut ws_config = WebSocketConfig::default();
        ws_config.max_message_size = Some(MAX_MESSAGE_BYTES);
        ws_config.max_frame_size = Some(MAX_MESSAGE_BYTES);

        let connect = connect_async_with_config(self.config.ws_url.as_str(), Some(ws_config), false);
        let (ws_stream, _response) = match timeout(self.config.connect_timeout, connect).await {
            Ok(Ok(pair)) => pair,
            Ok(Err(e)) => return Err(FeedError::Connection(e.to_string())),
            Err(_) => return Err(FeedError::Timeout),
        };

        info!("feed: connected");

        let (mut write, mut read) = ws_stream.split();

        let subscribe = SubscribeMessage::market(self.tokens.clone());
        write
            .send(Message::Text(serde_json::to_string(&subscribe)?))
            .await?;
        info!(tokens = self.tokens.len(), "feed: subscribed");

        let _ = self.event_tx.send(FeedEvent::Connected).await;

        let mut ping_timer = interval(self.config.ping_interval);

        loop {
            tokio::select! {
                msg = read.next() => {
                    match msg {
                        Some(Ok(Message::Text(text))) => {
                            self.handle_text(&text).await;
                        }
                        Some(Ok(Message::Ping(data))) => {
                            write.send(Message::Pong(data)).await?;
                        }
                        Some(Ok(Message::Close(frame))) => {
                            info!(?frame, "feed: closed by server");
                            return Err(FeedError::StreamEnded);
                        }
                        Some(Ok(_)) => {}
                        Some(Err(e)) => return Err(FeedError::WebSocket(e)),
                        None => return Err(FeedError::StreamEnded),
                    }
                }

                _ = ping_timer.tick() => {
                    write.send(Message::Text("PING".to_string())).await?;
                }

                _ = shutdown.recv() => {
                    info!("feed: shutdown signal received");
                    return Ok(());
                }
            }
        }
    }

    /// Messages arrive individually or as a JSON array of messages.
    async fn handle_text(&self, text: &str) {
        let value: serde_json::Value = match serde_json::from_str(text) {
            Ok(v) => v,
            Err(_) => {
                // Keepalive responses and the like are not JSON.
                debug!(msg = %text, "feed: non-JSON message");
                return;
            }
        };

        match value {
            serde_json::Value::Array(items) => {
                for item in items {
                    self.dispatch(item).await;
                }
            }
            other => self.dispatch(other).await,
        }
    }

    async fn dispatch(&self, value: serde_json::Value) {
        let generic: GenericMessage = match serde_json::from_value(value.clone()) {
            Ok(g) => g,
            Err(e) => {
                warn!(error = %e, "feed: dropping unreadable message");
                return;
            }
        };

        match generic.event_type.as_deref() {
            Some("book") => self.dispatch_book(value).await,
            Some("price_change") => self.dispatch_price_change(value).await,
            Some(other) => debug!(event_type = other, "feed: ignoring message"),
            None => debug!("feed: message without event_type"),
        }
    }

    async fn dispatch_book(&self, value: serde_json::Value) {
        let book: BookMessage = match serde_json::from_value(value) {
            Ok(b) => b,
            Err(e) => {
                warn!(error = %e, "feed: dropping malformed book message");
                return;
            }
        };

        let bids = parse_levels(&book.bids);
        let asks = parse_levels(&book.asks);
        debug!(
            token = %book.asset_id,
            bids = bids.len(),
            asks = asks.len(),
            "feed: book snapshot"
        );

        let _ = self
            .event_tx
            .send(FeedEvent::BookSnapshot {
                token_id: book.asset_id,
                bids,
                asks,
            })
            .await;
    }

    async fn dispatch_price_change(&self, value: serde_json::Value) {
        let msg: PriceChangeMessage = match serde_json::from_value(value) {
            Ok(m) => m,
            Err(e) => {
                warn!(error = %e, "feed: dropping malformed price_change message");
                return;
            }
        };

        for change in msg.price_changes {
            let side = match parse_side(&change.side) {
                Some(s) => s,
                None => {
                    warn!(side = %change.side, "feed: unknown side in price_change");
                    continue;
                }
            };
            let (price, size) = match (change.price.parse(), change.size.parse()) {
                (Ok(p), Ok(s)) => (p, s),
                _ => {
                    warn!(
                        price = %change.price,
                        size = %change.size,
                        "feed: unparsable price_change level"
                    );
                    continue;
                }
            };

            let _ = self
                .event_tx
                .send(FeedEvent::PriceLevel {
                    token_id: change.asset_id,
                    side,
                    price,
                    size,
                })
                .await;
        }
    }
}

fn parse_levels(levels: &[crate::types::OrderSummary]) -> Vec<BookLevel> {
    levels
        .iter()
        .filter_map(|l| {
            let price: Decimal = l.price.parse().ok()?;
            let size: Decimal = l.size.parse().ok()?;
            Some(BookLevel::new(price, size))
        })
        .collect()
}

fn parse_side(raw: &str) -> Option<Side> {
    match raw.to_lowercase().as_str() {
        "buy" | "bid" => Some(Side::Buy),
        "sell" | "ask" => Some(Side::Sell),
        _ => None,
    }
}

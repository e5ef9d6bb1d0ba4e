//! Bridge from the websocket feed to the engine queue.
//!
//! The feed client parses wire messages on the tokio runtime; this module
//! converts them into engine events and pushes them onto the blocking
//! queue the strategy thread drains. Unrecoverable transport failure
//! (reconnect budget exhausted) becomes a `Shutdown` event.

use std::sync::Arc;

use tokio::sync::{broadcast, mpsc};
use tracing::{error, info, warn};

use pmm_common::{BookLevel, Side, TokenId};
use pmm_market::{FeedClient, FeedConfig, FeedEvent};

use crate::events::{EngineEvent, EventQueue};

const FEED_CHANNEL_CAPACITY: usize = 10_000;

/// Convert one feed event into queue pushes.
fn forward_event(queue: &EventQueue, event: FeedEvent) {
    match event {
        FeedEvent::Connected => {
            info!("market feed connected");
        }
        FeedEvent::BookSnapshot {
            token_id,
            bids,
            asks,
        } => {
            queue.push(EngineEvent::book_snapshot(token_id, bids, asks));
        }
        FeedEvent::PriceLevel {
            token_id,
            side,
            price,
            size,
        } => {
            let level = vec![BookLevel::new(price, size)];
            let (bids, asks) = match side {
                Side::Buy => (level, Vec::new()),
                Side::Sell => (Vec::new(), level),
            };
            queue.push(EngineEvent::price_level_update(token_id, bids, asks));
        }
        FeedEvent::Disconnected(reason) => {
            warn!(%reason, "market feed disconnected");
        }
    }
}

/// Spawn the feed client and its event pump.
///
/// Returns the client task handle; the pump task ends when the client
/// drops its sender.
pub fn spawn_feed(
    queue: Arc<EventQueue>,
    tokens: Vec<TokenId>,
    config: FeedConfig,
    shutdown: &broadcast::Sender<()>,
) -> tokio::task::JoinHandle<()> {
    let (event_tx, mut event_rx) = mpsc::channel(FEED_CHANNEL_CAPACITY);
    let client = FeedClient::new(config, tokens, event_tx);
    let client_shutdown = shutdown.subscribe();

    let pump_queue = Arc::clone(&queue);
    tokio::spawn(async move {
        while let Some(event) = event_rx.recv().await {
            forward_event(&pump_queue, event);
        }
    });

    tokio::spawn(async move {
        if let Err(e) = client.run(client_shutdown).await {
            error!(error = %e, "market feed failed permanently");
            queue.push(EngineEvent::shutdown(format!("transport failure: {}", e)));
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_snapshot_forwarded() {
        let queue = EventQueue::new();
        forward_event(
            &queue,
            FeedEvent::BookSnapshot {
                token_id: "tok".to_string(),
                bids: vec![BookLevel::new(dec!(0.41), dec!(7000))],
                asks: vec![BookLevel::new(dec!(0.42), dec!(1700))],
            },
        );

        match queue.pop() {
            EngineEvent::BookSnapshot {
                token_id,
                bids,
                asks,
                ..
            } => {
                assert_eq!(token_id, "tok");
                assert_eq!(bids.len(), 1);
                assert_eq!(asks.len(), 1);
            }
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[test]
    fn test_price_level_lands_on_correct_side() {
        let queue = EventQueue::new();
        forward_event(
            &queue,
            FeedEvent::PriceLevel {
                token_id: "tok".to_string(),
                side: Side::Sell,
                price: dec!(0.44),
                size: dec!(100),
            },
        );

        match queue.pop() {
            EngineEvent::PriceLevelUpdate { bids, asks, .. } => {
                assert!(bids.is_empty());
                assert_eq!(asks.len(), 1);
                assert_eq!(asks[0].price, dec!(0.44));
            }
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[test]
    fn test_connection_events_produce_no_engine_events() {
        let queue = EventQueue::new();
        forward_event(&queue, FeedEvent::Connected);
        forward_event(&queue, FeedEvent::Disconnected("test".to_string()));
        assert!(queue.is_empty());
    }
}

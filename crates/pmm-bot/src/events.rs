//! Engine events and the blocking event queue.
//!
//! All inputs to the strategy thread arrive as `EngineEvent`s: book updates
//! from the transport, fills and rejections from the order manager, timer
//! ticks, and shutdown. The queue is an unbounded FIFO with exactly one
//! consumer; producers never block.

use std::collections::VecDeque;

use chrono::{DateTime, Utc};
use parking_lot::{Condvar, Mutex};
use rust_decimal::Decimal;

use pmm_common::{BookLevel, OrderId, Side, TokenId};

/// Tagged union of everything the strategy thread reacts to.
#[derive(Debug, Clone)]
pub enum EngineEvent {
    /// Full book replacement for one token.
    BookSnapshot {
        token_id: TokenId,
        bids: Vec<BookLevel>,
        asks: Vec<BookLevel>,
        timestamp: DateTime<Utc>,
    },
    /// Incremental level changes for one token, applied in arrival order.
    PriceLevelUpdate {
        token_id: TokenId,
        bids: Vec<BookLevel>,
        asks: Vec<BookLevel>,
        timestamp: DateTime<Utc>,
    },
    /// An order of ours (fully) filled.
    OrderFill {
        order_id: OrderId,
        token_id: TokenId,
        fill_price: Decimal,
        filled_size: Decimal,
        side: Side,
        timestamp: DateTime<Utc>,
    },
    /// An order was rejected by the venue (live mode only).
    OrderRejected {
        order_id: OrderId,
        reason: String,
        timestamp: DateTime<Utc>,
    },
    /// Periodic wakeup so housekeeping advances on a quiet feed.
    TimerTick { timestamp: DateTime<Utc> },
    /// Terminal event; the consumer drains and exits.
    Shutdown {
        reason: String,
        timestamp: DateTime<Utc>,
    },
}

impl EngineEvent {
    pub fn book_snapshot(
        token_id: impl Into<TokenId>,
        bids: Vec<BookLevel>,
        asks: Vec<BookLevel>,
    ) -> Self {
        EngineEvent::BookSnapshot {
            token_id: token_id.into(),
            bids,
            asks,
            timestamp: Utc::now(),
        }
    }

    pub fn price_level_update(
        token_id: impl Into<TokenId>,
        bids: Vec<BookLevel>,
        asks: Vec<BookLevel>,
    ) -> Self {
        EngineEvent::PriceLevelUpdate {
            token_id: token_id.into(),
            bids,
            asks,
            timestamp: Utc::now(),
        }
    }

    pub fn order_fill(
        order_id: impl Into<OrderId>,
        token_id: impl Into<TokenId>,
        fill_price: Decimal,
        filled_size: Decimal,
        side: Side,
    ) -> Self {
        EngineEvent::OrderFill {
            order_id: order_id.into(),
            token_id: token_id.into(),
            fill_price,
            filled_size,
            side,
            timestamp: Utc::now(),
        }
    }

    pub fn order_rejected(order_id: impl Into<OrderId>, reason: impl Into<String>) -> Self {
        EngineEvent::OrderRejected {
            order_id: order_id.into(),
            reason: reason.into(),
            timestamp: Utc::now(),
        }
    }

    pub fn timer_tick() -> Self {
        EngineEvent::TimerTick {
            timestamp: Utc::now(),
        }
    }

    pub fn shutdown(reason: impl Into<String>) -> Self {
        EngineEvent::Shutdown {
            reason: reason.into(),
            timestamp: Utc::now(),
        }
    }

    /// Wall-clock time the event was created.
    pub fn timestamp(&self) -> DateTime<Utc> {
        match self {
            EngineEvent::BookSnapshot { timestamp, .. }
            | EngineEvent::PriceLevelUpdate { timestamp, .. }
            | EngineEvent::OrderFill { timestamp, .. }
            | EngineEvent::OrderRejected { timestamp, .. }
            | EngineEvent::TimerTick { timestamp }
            | EngineEvent::Shutdown { timestamp, .. } => *timestamp,
        }
    }
}

/// Unbounded blocking FIFO of engine events.
///
/// `push` never blocks and wakes one waiter; `pop` parks the caller until
/// an event is available. Ordering is strict FIFO per producer.
#[derive(Default)]
pub struct EventQueue {
    inner: Mutex<VecDeque<EngineEvent>>,
    available: Condvar,
}

impl EventQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append an event and wake one waiting consumer.
    pub fn push(&self, event: EngineEvent) {
        let mut queue = self.inner.lock();
        queue.push_back(event);
        drop(queue);
        self.available.notify_one();
    }

    /// Block until an event is available, then dequeue it.
    pub fn pop(&self) -> EngineEvent {
        let mut queue = self.inner.lock();
        loop {
            if let Some(event) = queue.pop_front() {
                return event;
            }
            self.available.wait(&mut queue);
        }
    }

    /// Advisory depth; may be stale by the time the caller acts on it.
    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().is_empty()
    }
}

//! Order lifecycle and the paper-fill simulator.
//!
//! In paper mode every book update runs a crossing check over the open
//! orders for that token: a buy fills when the best ask trades through
//! our bid, a sell when the best bid trades through our ask. Fills are
//! whole-order, at the order's own price, and come back to the strategy
//! thread as `OrderFill` events through the queue. Live mode keeps the
//! same call surface but only tracks orders locally; venue placement is
//! a stub.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use rust_decimal::Decimal;
use tracing::{debug, info, warn};

use pmm_common::{CancelReason, Order, OrderId, OrderStatus, Side, TokenId, TradingMode};
use pmm_market::OrderBook;

use crate::audit::TradingAudit;
use crate::events::{EngineEvent, EventQueue};

/// Order bookkeeping with an in-process paper-fill simulator.
pub struct OrderManager {
    queue: Arc<EventQueue>,
    mode: TradingMode,
    audit: Option<Arc<TradingAudit>>,
    orders: HashMap<OrderId, Order>,
    next_order_id: u64,
    books: HashMap<TokenId, OrderBook>,
}

impl OrderManager {
    pub fn new(queue: Arc<EventQueue>, mode: TradingMode, audit: Option<Arc<TradingAudit>>) -> Self {
        info!(%mode, "order manager initialized");
        Self {
            queue,
            mode,
            audit,
            orders: HashMap::new(),
            next_order_id: 1,
            books: HashMap::new(),
        }
    }

    pub fn mode(&self) -> TradingMode {
        self.mode
    }

    pub fn is_paper(&self) -> bool {
        self.mode == TradingMode::Paper
    }

    /// Create an open order and audit it. Returns the new order ID.
    pub fn place_order(
        &mut self,
        token_id: &str,
        side: Side,
        price: Decimal,
        size: Decimal,
        market_id: &str,
    ) -> OrderId {
        let order_id = format!("ORD_{}", self.next_order_id);
        self.next_order_id += 1;

        let order = Order {
            order_id: order_id.clone(),
            token_id: token_id.to_string(),
            side,
            price,
            size,
            filled_size: Decimal::ZERO,
            status: OrderStatus::Open,
            created_at: Instant::now(),
        };

        if let Some(audit) = &self.audit {
            audit.log_order_placed(&order, market_id);
        }

        match self.mode {
            TradingMode::Paper => {
                debug!(order = %order_id, %side, %size, %price, "paper order placed");
            }
            TradingMode::Live => {
                debug!(order = %order_id, %side, %size, %price, "placing live order");
                self.place_order_live(&order);
            }
        }

        self.orders.insert(order_id.clone(), order);
        order_id
    }

    /// Cancel one order. Unknown IDs are a logged no-op.
    pub fn cancel_order(&mut self, order_id: &str, market_id: &str, reason: CancelReason) -> bool {
        let mut order = match self.orders.remove(order_id) {
            Some(o) => o,
            None => {
                warn!(order = order_id, "cancel for unknown order");
                return false;
            }
        };

        order.status = OrderStatus::Cancelled;

        if let Some(audit) = &self.audit {
            audit.log_order_cancelled(&order, market_id, reason);
        }

        if self.mode == TradingMode::Live {
            self.cancel_order_live(order_id);
        }

        debug!(order = order_id, %reason, "order cancelled");
        true
    }

    /// Cancel every open order on one token.
    pub fn cancel_all_for_token(&mut self, token_id: &str, market_id: &str, reason: CancelReason) {
        let to_cancel: Vec<OrderId> = self
            .orders
            .values()
            .filter(|o| o.token_id == token_id)
            .map(|o| o.order_id.clone())
            .collect();

        for order_id in to_cancel {
            self.cancel_order(&order_id, market_id, reason);
        }
    }

    /// Cancel everything, e.g. on shutdown.
    pub fn cancel_all(&mut self, reason: CancelReason) {
        let to_cancel: Vec<(OrderId, TokenId)> = self
            .orders
            .values()
            .map(|o| (o.order_id.clone(), o.token_id.clone()))
            .collect();

        for (order_id, token_id) in to_cancel {
            self.cancel_order(&order_id, &token_id, reason);
        }
    }

    /// Replace the cached book for a token; paper mode checks crossings.
    pub fn update_order_book(&mut self, token_id: &str, book: &OrderBook) {
        self.books.insert(token_id.to_string(), book.clone());

        if self.is_paper() {
            self.check_for_fills(token_id);
        }
    }

    /// Open orders resting on a token.
    pub fn open_orders(&self, token_id: &str) -> Vec<Order> {
        self.orders
            .values()
            .filter(|o| o.token_id == token_id && o.status == OrderStatus::Open)
            .cloned()
            .collect()
    }

    pub fn open_order_count(&self) -> usize {
        self.orders
            .values()
            .filter(|o| o.status == OrderStatus::Open)
            .count()
    }

    pub fn bid_count(&self) -> usize {
        self.orders
            .values()
            .filter(|o| o.status == OrderStatus::Open && o.side == Side::Buy)
            .count()
    }

    pub fn ask_count(&self) -> usize {
        self.orders
            .values()
            .filter(|o| o.status == OrderStatus::Open && o.side == Side::Sell)
            .count()
    }

    /// Fill any open order the latest book has traded through.
    fn check_for_fills(&mut self, token_id: &str) {
        let book = match self.books.get(token_id) {
            Some(b) => b,
            None => return,
        };

        let best_bid = book.best_bid();
        let best_ask = book.best_ask();

        let crossed: Vec<OrderId> = self
            .orders
            .values()
            .filter(|o| o.token_id == token_id && o.status == OrderStatus::Open)
            .filter(|o| match o.side {
                Side::Buy => best_ask.is_some_and(|ask| ask <= o.price),
                Side::Sell => best_bid.is_some_and(|bid| bid >= o.price),
            })
            .map(|o| o.order_id.clone())
            .collect();

        for order_id in crossed {
            self.generate_fill(&order_id);
        }
    }

    /// Emit a whole-order fill at the order's own price.
    fn generate_fill(&mut self, order_id: &str) {
        // An order can vanish between the crossing scan and here when a
        // cancel raced it; that is not an error.
        let order = match self.orders.get_mut(order_id) {
            Some(o) => o,
            None => return,
        };

        order.filled_size = order.size;
        order.status = OrderStatus::Filled;

        info!(
            order = order_id,
            side = %order.side,
            size = %order.size,
            price = %order.price,
            "paper fill"
        );

        self.queue.push(EngineEvent::order_fill(
            order_id,
            order.token_id.clone(),
            order.price,
            order.size,
            order.side,
        ));

        // Fully filled; nothing left to rest.
        self.orders.remove(order_id);
    }

    fn place_order_live(&self, order: &Order) {
        // Venue REST placement is out of scope; surface only.
        warn!(order = %order.order_id, "live order placement not implemented");
    }

    fn cancel_order_live(&self, order_id: &str) {
        warn!(order = order_id, "live order cancellation not implemented");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn paper_manager() -> (OrderManager, Arc<EventQueue>) {
        let queue = Arc::new(EventQueue::new());
        let manager = OrderManager::new(Arc::clone(&queue), TradingMode::Paper, None);
        (manager, queue)
    }

    fn book(bid: Decimal, ask: Decimal) -> OrderBook {
        let mut book = OrderBook::new("tok");
        book.update_bid(bid, dec!(1000));
        book.update_ask(ask, dec!(1000));
        book
    }

    #[test]
    fn test_place_assigns_monotonic_ids() {
        let (mut manager, _queue) = paper_manager();
        let a = manager.place_order("tok", Side::Buy, dec!(0.41), dec!(100), "mkt");
        let b = manager.place_order("tok", Side::Sell, dec!(0.43), dec!(100), "mkt");

        assert_eq!(a, "ORD_1");
        assert_eq!(b, "ORD_2");
        assert_eq!(manager.open_order_count(), 2);
        assert_eq!(manager.bid_count(), 1);
        assert_eq!(manager.ask_count(), 1);
    }

    #[test]
    fn test_cancel_removes_order() {
        let (mut manager, _queue) = paper_manager();
        let id = manager.place_order("tok", Side::Buy, dec!(0.41), dec!(100), "mkt");

        assert!(manager.cancel_order(&id, "mkt", CancelReason::QuoteUpdate));
        assert_eq!(manager.open_order_count(), 0);
    }

    #[test]
    fn test_cancel_unknown_is_noop() {
        let (mut manager, _queue) = paper_manager();
        assert!(!manager.cancel_order("ORD_99", "mkt", CancelReason::Manual));
    }

    #[test]
    fn test_cancel_all_for_token_leaves_others() {
        let (mut manager, _queue) = paper_manager();
        manager.place_order("tok_a", Side::Buy, dec!(0.41), dec!(100), "mkt");
        manager.place_order("tok_a", Side::Sell, dec!(0.43), dec!(100), "mkt");
        manager.place_order("tok_b", Side::Buy, dec!(0.30), dec!(100), "mkt");

        manager.cancel_all_for_token("tok_a", "mkt", CancelReason::TtlExpired);

        assert_eq!(manager.open_order_count(), 1);
        assert_eq!(manager.open_orders("tok_b").len(), 1);
    }

    #[test]
    fn test_buy_fills_when_ask_crosses() {
        let (mut manager, queue) = paper_manager();
        manager.place_order("tok", Side::Buy, dec!(0.41), dec!(100), "mkt");

        // Ask drops to our bid: fill at OUR price.
        manager.update_order_book("tok", &book(dec!(0.39), dec!(0.41)));

        match queue.pop() {
            EngineEvent::OrderFill {
                order_id,
                fill_price,
                filled_size,
                side,
                ..
            } => {
                assert_eq!(order_id, "ORD_1");
                assert_eq!(fill_price, dec!(0.41));
                assert_eq!(filled_size, dec!(100));
                assert_eq!(side, Side::Buy);
            }
            other => panic!("unexpected event: {:?}", other),
        }
        assert_eq!(manager.open_order_count(), 0);
    }

    #[test]
    fn test_sell_fills_when_bid_crosses() {
        let (mut manager, queue) = paper_manager();
        manager.place_order("tok", Side::Sell, dec!(0.42), dec!(100), "mkt");

        manager.update_order_book("tok", &book(dec!(0.43), dec!(0.44)));

        match queue.pop() {
            EngineEvent::OrderFill {
                fill_price, side, ..
            } => {
                assert_eq!(fill_price, dec!(0.42));
                assert_eq!(side, Side::Sell);
            }
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[test]
    fn test_no_fill_without_crossing() {
        let (mut manager, queue) = paper_manager();
        manager.place_order("tok", Side::Buy, dec!(0.41), dec!(100), "mkt");
        manager.place_order("tok", Side::Sell, dec!(0.43), dec!(100), "mkt");

        manager.update_order_book("tok", &book(dec!(0.41), dec!(0.43)));

        assert!(queue.is_empty());
        assert_eq!(manager.open_order_count(), 2);
    }

    #[test]
    fn test_fill_only_affects_matching_token() {
        let (mut manager, queue) = paper_manager();
        manager.place_order("tok_a", Side::Buy, dec!(0.41), dec!(100), "mkt");
        manager.place_order("tok_b", Side::Buy, dec!(0.41), dec!(100), "mkt");

        manager.update_order_book("tok_a", &book(dec!(0.39), dec!(0.40)));

        // Only tok_a's order crossed.
        assert!(matches!(queue.pop(), EngineEvent::OrderFill { token_id, .. } if token_id == "tok_a"));
        assert!(queue.is_empty());
        assert_eq!(manager.open_orders("tok_b").len(), 1);
    }

    #[test]
    fn test_live_mode_does_not_simulate_fills() {
        let queue = Arc::new(EventQueue::new());
        let mut manager = OrderManager::new(Arc::clone(&queue), TradingMode::Live, None);
        manager.place_order("tok", Side::Buy, dec!(0.41), dec!(100), "mkt");

        manager.update_order_book("tok", &book(dec!(0.39), dec!(0.40)));

        assert!(queue.is_empty());
        assert_eq!(manager.open_order_count(), 1);
    }

    #[test]
    fn test_empty_book_side_never_fills() {
        let (mut manager, queue) = paper_manager();
        manager.place_order("tok", Side::Buy, dec!(0.41), dec!(100), "mkt");

        let mut bid_only = OrderBook::new("tok");
        bid_only.update_bid(dec!(0.40), dec!(100));
        manager.update_order_book("tok", &bid_only);

        assert!(queue.is_empty());
    }
}

//! Order book state for a single outcome token.
//!
//! Maintained from websocket snapshots and deltas. A snapshot clears and
//! rebuilds both sides; a delta with size zero removes the level. Crossed
//! books from the feed are represented as-is; quoting on them is suppressed
//! by the strategy, not here.

use std::collections::BTreeMap;

use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;

use pmm_common::TokenId;

/// Number of levels per side considered for volume and imbalance.
const DEPTH_LEVELS: usize = 5;

/// Two-sided limit book: bids descending, asks ascending by price.
///
/// Invariant: no zero-size levels are ever stored.
#[derive(Debug, Clone, Default)]
pub struct OrderBook {
    token_id: TokenId,
    bids: BTreeMap<Decimal, Decimal>,
    asks: BTreeMap<Decimal, Decimal>,
}

impl OrderBook {
    pub fn new(token_id: impl Into<TokenId>) -> Self {
        Self {
            token_id: token_id.into(),
            bids: BTreeMap::new(),
            asks: BTreeMap::new(),
        }
    }

    pub fn token_id(&self) -> &str {
        &self.token_id
    }

    /// Set the bid size at `price`; size zero removes the level.
    pub fn update_bid(&mut self, price: Decimal, size: Decimal) {
        if size.is_zero() {
            self.bids.remove(&price);
        } else {
            self.bids.insert(price, size);
        }
    }

    /// Set the ask size at `price`; size zero removes the level.
    pub fn update_ask(&mut self, price: Decimal, size: Decimal) {
        if size.is_zero() {
            self.asks.remove(&price);
        } else {
            self.asks.insert(price, size);
        }
    }

    /// Drop all levels on both sides.
    pub fn clear(&mut self) {
        self.bids.clear();
        self.asks.clear();
    }

    /// Highest bid price, if any bids exist.
    pub fn best_bid(&self) -> Option<Decimal> {
        self.bids.keys().next_back().copied()
    }

    /// Lowest ask price, if any asks exist.
    pub fn best_ask(&self) -> Option<Decimal> {
        self.asks.keys().next().copied()
    }

    /// `best_ask - best_bid`. Negative for a crossed book.
    pub fn spread(&self) -> Option<Decimal> {
        Some(self.best_ask()? - self.best_bid()?)
    }

    /// Midpoint of the BBO.
    pub fn mid(&self) -> Option<Decimal> {
        Some((self.best_bid()? + self.best_ask()?) / Decimal::TWO)
    }

    /// True when both sides have at least one level.
    pub fn has_valid_bbo(&self) -> bool {
        !self.bids.is_empty() && !self.asks.is_empty()
    }

    /// Spread relative to mid, in basis points.
    pub fn spread_bps(&self) -> Option<f64> {
        let spread = self.spread()?.to_f64()?;
        let mid = self.mid()?.to_f64()?;
        if mid <= 0.0 {
            return None;
        }
        Some(spread / mid * 10_000.0)
    }

    /// Total bid size over the top `levels` levels.
    pub fn total_bid_volume(&self, levels: usize) -> Decimal {
        self.bids.values().rev().take(levels).copied().sum()
    }

    /// Total ask size over the top `levels` levels.
    pub fn total_ask_volume(&self, levels: usize) -> Decimal {
        self.asks.values().take(levels).copied().sum()
    }

    /// Volume imbalance over the top five levels:
    /// `(bid_vol - ask_vol) / (bid_vol + ask_vol)`, zero on an empty book.
    pub fn imbalance(&self) -> f64 {
        let bid_vol = self.total_bid_volume(DEPTH_LEVELS);
        let ask_vol = self.total_ask_volume(DEPTH_LEVELS);
        let total = bid_vol + ask_vol;
        if total.is_zero() {
            return 0.0;
        }
        ((bid_vol - ask_vol) / total).to_f64().unwrap_or(0.0)
    }

    pub fn bid_level_count(&self) -> usize {
        self.bids.len()
    }

    pub fn ask_level_count(&self) -> usize {
        self.asks.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn sample_book() -> OrderBook {
        let mut book = OrderBook::new("tok");
        book.update_bid(dec!(0.48), dec!(1000));
        book.update_bid(dec!(0.47), dec!(500));
        book.update_ask(dec!(0.54), dec!(800));
        book.update_ask(dec!(0.55), dec!(300));
        book
    }

    #[test]
    fn test_bbo() {
        let book = sample_book();
        assert!(book.has_valid_bbo());
        assert_eq!(book.best_bid(), Some(dec!(0.48)));
        assert_eq!(book.best_ask(), Some(dec!(0.54)));
        assert_eq!(book.spread(), Some(dec!(0.06)));
        assert_eq!(book.mid(), Some(dec!(0.51)));
    }

    #[test]
    fn test_empty_book() {
        let book = OrderBook::new("tok");
        assert!(!book.has_valid_bbo());
        assert_eq!(book.best_bid(), None);
        assert_eq!(book.best_ask(), None);
        assert_eq!(book.spread(), None);
        assert_eq!(book.mid(), None);
        assert_eq!(book.imbalance(), 0.0);
    }

    #[test]
    fn test_zero_size_removes_level() {
        let mut book = sample_book();
        book.update_bid(dec!(0.48), Decimal::ZERO);
        assert_eq!(book.best_bid(), Some(dec!(0.47)));
        assert_eq!(book.bid_level_count(), 1);

        book.update_ask(dec!(0.54), Decimal::ZERO);
        assert_eq!(book.best_ask(), Some(dec!(0.55)));
    }

    #[test]
    fn test_update_replaces_size() {
        let mut book = sample_book();
        book.update_bid(dec!(0.48), dec!(250));
        assert_eq!(book.total_bid_volume(1), dec!(250));
        assert_eq!(book.bid_level_count(), 2);
    }

    #[test]
    fn test_clear() {
        let mut book = sample_book();
        book.clear();
        assert!(!book.has_valid_bbo());
        assert_eq!(book.bid_level_count(), 0);
        assert_eq!(book.ask_level_count(), 0);
    }

    #[test]
    fn test_volume_respects_level_cap() {
        let mut book = OrderBook::new("tok");
        for i in 0i64..8 {
            book.update_bid(Decimal::new(40 - i, 2), dec!(100));
        }
        // Eight levels, only the top five counted.
        assert_eq!(book.total_bid_volume(5), dec!(500));
        assert_eq!(book.bid_level_count(), 8);
    }

    #[test]
    fn test_imbalance() {
        let mut book = OrderBook::new("tok");
        book.update_bid(dec!(0.48), dec!(300));
        book.update_ask(dec!(0.52), dec!(100));
        // (300 - 100) / 400 = 0.5
        assert!((book.imbalance() - 0.5).abs() < 1e-9);
    }

    #[test]
    fn test_crossed_book_is_representable() {
        let mut book = OrderBook::new("tok");
        book.update_bid(dec!(0.55), dec!(100));
        book.update_ask(dec!(0.50), dec!(100));
        assert!(book.has_valid_bbo());
        assert_eq!(book.spread(), Some(dec!(-0.05)));
    }

    #[test]
    fn test_spread_bps() {
        let mut book = OrderBook::new("tok");
        book.update_bid(dec!(0.48), dec!(100));
        book.update_ask(dec!(0.52), dec!(100));
        // 0.04 / 0.50 * 10000 = 800
        assert!((book.spread_bps().unwrap() - 800.0).abs() < 1e-6);
    }
}

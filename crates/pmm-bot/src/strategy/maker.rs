//! Inventory-skewed quote generation.
//!
//! Quotes are centered on an Avellaneda-Stoikov reservation price: holding
//! inventory shifts both sides toward the exit, and an EWMA volatility
//! estimate widens the shift in choppy markets. An inventory-risk floor
//! keeps the ask above cost while there is time to be patient, relaxing to
//! a small accepted loss as the event close approaches.

use std::time::Instant;

use chrono::{DateTime, Utc};
use rust_decimal::prelude::{FromPrimitive, ToPrimitive};
use rust_decimal::{Decimal, RoundingStrategy};
use tracing::{debug, info};

use pmm_common::{MarketMetadata, Side};
use pmm_market::OrderBook;

/// Lowest quotable price for a binary outcome token.
const MIN_PRICE: Decimal = Decimal::from_parts(1, 0, 0, false, 2); // 0.01
/// Highest quotable price.
const MAX_PRICE: Decimal = Decimal::from_parts(99, 0, 0, false, 2); // 0.99

/// Inventory normalization divisor for the reservation-price skew.
const INVENTORY_NORM: f64 = 100.0;
/// EWMA smoothing for the volatility estimate.
const VOL_LAMBDA: f64 = 0.94;
/// Volatility clamp bounds.
const VOL_MIN: f64 = 0.01;
const VOL_MAX: f64 = 0.50;
/// Minimum elapsed time between volatility observations.
const VOL_MIN_ELAPSED_SECS: f64 = 0.1;
/// Base profit requirement over average cost when unwinding a long.
const BASE_MIN_PROFIT: f64 = 0.015;
/// Maximum shares per quote.
const MAX_QUOTE_SIZE: Decimal = Decimal::from_parts(100, 0, 0, false, 0);
/// Quotes below this size are not worth resting.
const MIN_QUOTE_SIZE: Decimal = Decimal::from_parts(10, 0, 0, false, 0);
/// TTL when the event end time is unknown.
const DEFAULT_TTL_SECS: u64 = 90;

/// A paired bid/ask proposal.
///
/// Invariants: `bid_price < ask_price`, both within [0.01, 0.99],
/// sizes at least `MIN_QUOTE_SIZE`, `ttl_seconds > 0`.
#[derive(Debug, Clone)]
pub struct Quote {
    pub bid_price: Decimal,
    pub bid_size: Decimal,
    pub ask_price: Decimal,
    pub ask_size: Decimal,
    pub ttl_seconds: u64,
    pub created_at: Instant,
}

impl Quote {
    /// True once the quote has outlived its TTL.
    pub fn is_expired(&self) -> bool {
        self.created_at.elapsed().as_secs() >= self.ttl_seconds
    }
}

/// Per-token quote generator with inventory and PnL tracking.
#[derive(Debug)]
pub struct MarketMaker {
    spread_pct: f64,
    max_position: Decimal,
    risk_aversion: f64,
    volatility: f64,

    inventory: Decimal,
    inventory_dollars: Decimal,
    avg_cost: Decimal,
    realized_pnl: Decimal,

    last_mid: Option<Decimal>,
    last_update: Instant,
    market_close_time: Option<DateTime<Utc>>,
}

impl MarketMaker {
    pub fn new(spread_pct: f64, max_position: Decimal) -> Self {
        debug!(
            spread_pct,
            %max_position,
            "market maker initialized"
        );
        Self {
            spread_pct,
            max_position,
            risk_aversion: 0.1,
            volatility: 0.05,
            inventory: Decimal::ZERO,
            inventory_dollars: Decimal::ZERO,
            avg_cost: Decimal::ZERO,
            realized_pnl: Decimal::ZERO,
            last_mid: None,
            last_update: Instant::now(),
            market_close_time: None,
        }
    }

    pub fn inventory(&self) -> Decimal {
        self.inventory
    }

    pub fn inventory_dollars(&self) -> Decimal {
        self.inventory_dollars
    }

    pub fn avg_cost(&self) -> Decimal {
        self.avg_cost
    }

    pub fn realized_pnl(&self) -> Decimal {
        self.realized_pnl
    }

    pub fn volatility(&self) -> f64 {
        self.volatility
    }

    pub fn max_position(&self) -> Decimal {
        self.max_position
    }

    pub fn set_market_close_time(&mut self, close_time: DateTime<Utc>) {
        self.market_close_time = Some(close_time);
    }

    /// Mark-to-mid PnL of the open position.
    pub fn unrealized_pnl(&self, current_mid: Decimal) -> Decimal {
        self.inventory * (current_mid - self.avg_cost)
    }

    /// Seed inventory from persisted state after a restart.
    pub fn restore_state(&mut self, inventory: Decimal, avg_cost: Decimal, realized_pnl: Decimal) {
        self.inventory = inventory;
        self.avg_cost = avg_cost;
        self.realized_pnl = realized_pnl;
        self.inventory_dollars = inventory * avg_cost;
        info!(
            %inventory,
            %avg_cost,
            %realized_pnl,
            "restored maker state"
        );
    }

    /// Generate a paired quote against the current book, or decline.
    ///
    /// Declines when the market spread is under a cent, when the quotes
    /// collapse or would cross the market after rounding, or when the
    /// remaining position capacity is too small to quote.
    pub fn generate_quote(
        &mut self,
        book: &OrderBook,
        metadata: Option<&MarketMetadata>,
        spread_multiplier: f64,
    ) -> Option<Quote> {
        let mid = book.mid()?;
        let market_spread = book.spread()?;

        // Volatility observation rides on the quoting clock.
        if let Some(last_mid) = self.last_mid {
            let elapsed = self.last_update.elapsed().as_secs_f64();
            if last_mid > Decimal::ZERO && elapsed >= VOL_MIN_ELAPSED_SECS {
                self.update_volatility(last_mid, mid, elapsed);
            }
        }
        self.last_mid = Some(mid);
        self.last_update = Instant::now();

        if market_spread < MIN_PRICE {
            debug!(%market_spread, "market spread too tight, not quoting");
            return None;
        }

        let mid_f = mid.to_f64()?;
        let q = self.inventory.to_f64()? / INVENTORY_NORM;
        let gamma = self.risk_aversion;
        let sigma_sq = self.volatility * self.volatility;

        let reservation_bid = mid_f - (q + 1.0) * gamma * sigma_sq;
        let reservation_ask = mid_f + (q - 1.0) * gamma * sigma_sq;
        let half_spread = mid_f * self.spread_pct * spread_multiplier / 2.0;
        let imbalance_adjustment = book.imbalance() * 0.005;

        let bid_raw = reservation_bid - half_spread + imbalance_adjustment;
        let mut ask_raw = reservation_ask + half_spread + imbalance_adjustment;

        // Cost floor on the ask while long: demand a profit that shrinks
        // with urgency, and accept a capped loss when urgency is extreme.
        if self.inventory > Decimal::ZERO && self.avg_cost > Decimal::ZERO {
            let inventory_risk = (self.inventory_dollars.abs() / self.max_position)
                .to_f64()
                .unwrap_or(0.0);
            let urgency = self.time_urgency().max(inventory_risk);
            let min_profit = if urgency > 0.9 {
                -0.01
            } else {
                BASE_MIN_PROFIT * (1.0 - urgency)
            };
            let floor = self.avg_cost.to_f64()? * (1.0 + min_profit);
            if ask_raw < floor {
                debug!(
                    ask = ask_raw,
                    floor,
                    urgency,
                    inventory_risk,
                    "raising ask to cost floor"
                );
                ask_raw = floor;
            }
        }

        let our_bid = round_to_cent(bid_raw)?.clamp(MIN_PRICE, MAX_PRICE);
        let our_ask = round_to_cent(ask_raw)?.clamp(MIN_PRICE, MAX_PRICE);

        if our_ask <= our_bid {
            debug!(%our_bid, %our_ask, "quotes collapsed after rounding, not quoting");
            return None;
        }

        let best_bid = book.best_bid()?;
        let best_ask = book.best_ask()?;
        if our_bid >= best_ask || our_ask <= best_bid {
            debug!(%our_bid, %our_ask, %best_bid, %best_ask, "quotes would cross, not quoting");
            return None;
        }

        let remaining_capacity = self.max_position - self.inventory.abs();
        let quote_size = (remaining_capacity / mid).min(MAX_QUOTE_SIZE);
        if quote_size < MIN_QUOTE_SIZE {
            debug!(%remaining_capacity, "near max position, not quoting");
            return None;
        }

        let ttl_seconds = metadata
            .and_then(|m| m.market_phase())
            .map(|p| p.recommended_ttl_secs())
            .unwrap_or(DEFAULT_TTL_SECS);

        debug!(
            %our_bid,
            %our_ask,
            %quote_size,
            ttl_seconds,
            inventory = %self.inventory,
            "generated quote"
        );

        Some(Quote {
            bid_price: our_bid,
            bid_size: quote_size,
            ask_price: our_ask,
            ask_size: quote_size,
            ttl_seconds,
            created_at: Instant::now(),
        })
    }

    /// Fold a fill into inventory, realizing PnL on closes.
    ///
    /// Same-direction fills update the volume-weighted average cost;
    /// opposite-direction fills realize against it, and a fill that
    /// crosses through zero opens the new position at the fill price.
    pub fn update_inventory(&mut self, side: Side, filled_size: Decimal, fill_price: Decimal) {
        let signed = filled_size * side.sign();

        if self.inventory.is_zero() {
            self.inventory = signed;
            self.avg_cost = fill_price;
        } else if (self.inventory > Decimal::ZERO) == (signed > Decimal::ZERO) {
            let total_cost = self.inventory.abs() * self.avg_cost + filled_size * fill_price;
            self.inventory += signed;
            self.avg_cost = total_cost / self.inventory.abs();
        } else if signed.abs() >= self.inventory.abs() {
            let pnl = self.inventory * (fill_price - self.avg_cost);
            self.realized_pnl += pnl;
            info!(
                closed = %self.inventory,
                %fill_price,
                avg_cost = %self.avg_cost,
                %pnl,
                "closed position"
            );
            self.inventory += signed;
            self.avg_cost = if self.inventory.is_zero() {
                Decimal::ZERO
            } else {
                fill_price
            };
        } else {
            let pnl = -signed * (fill_price - self.avg_cost);
            self.realized_pnl += pnl;
            self.inventory += signed;
        }

        if self.inventory.is_zero() {
            self.avg_cost = Decimal::ZERO;
        }
        self.inventory_dollars = self.inventory * self.avg_cost;

        debug!(
            inventory = %self.inventory,
            dollars = %self.inventory_dollars,
            realized = %self.realized_pnl,
            "inventory updated"
        );
    }

    /// EWMA update from an observed mid move over `elapsed_secs`.
    pub fn update_volatility(&mut self, old_mid: Decimal, new_mid: Decimal, elapsed_secs: f64) {
        let (old_f, new_f) = match (old_mid.to_f64(), new_mid.to_f64()) {
            (Some(o), Some(n)) if o > 0.0 => (o, n),
            _ => return,
        };

        let return_pct = (new_f - old_f).abs() / old_f;
        let annual_factor = (252.0 * 24.0 * 3600.0 / elapsed_secs).sqrt();
        let observed = return_pct * annual_factor;

        self.volatility = VOL_LAMBDA * self.volatility + (1.0 - VOL_LAMBDA) * observed;
        self.volatility = self.volatility.clamp(VOL_MIN, VOL_MAX);
    }

    /// Urgency in [0, 1] from time to the market close.
    ///
    /// Zero beyond 24 hours or when the close is unknown; one past close;
    /// linear ramp in between.
    pub fn time_urgency(&self) -> f64 {
        let close = match self.market_close_time {
            Some(t) => t,
            None => return 0.0,
        };

        let hours_remaining = (close - Utc::now()).num_seconds() as f64 / 3600.0;
        if hours_remaining < 0.0 {
            1.0
        } else if hours_remaining > 24.0 {
            0.0
        } else {
            1.0 - hours_remaining / 24.0
        }
    }
}

fn round_to_cent(price: f64) -> Option<Decimal> {
    Decimal::from_f64(price)
        .map(|d| d.round_dp_with_strategy(2, RoundingStrategy::MidpointAwayFromZero))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use rust_decimal_macros::dec;

    fn book(bids: &[(Decimal, Decimal)], asks: &[(Decimal, Decimal)]) -> OrderBook {
        let mut book = OrderBook::new("tok");
        for (p, s) in bids {
            book.update_bid(*p, *s);
        }
        for (p, s) in asks {
            book.update_ask(*p, *s);
        }
        book
    }

    fn metadata_ending_in(delta: Duration) -> MarketMetadata {
        MarketMetadata {
            title: "Test".to_string(),
            outcome: "Yes".to_string(),
            event_end_time: Some(Utc::now() + delta),
            ..Default::default()
        }
    }

    #[test]
    fn test_quote_centered_with_zero_inventory() {
        let mut mm = MarketMaker::new(0.02, dec!(1000));
        let book = book(&[(dec!(0.48), dec!(1000))], &[(dec!(0.54), dec!(800))]);

        let quote = mm.generate_quote(&book, None, 1.0).unwrap();

        assert!(quote.bid_price > dec!(0.48) && quote.bid_price < dec!(0.54));
        assert!(quote.ask_price > dec!(0.48) && quote.ask_price < dec!(0.54));
        assert!(quote.ask_price > quote.bid_price);
        // Rounded to whole cents.
        assert!(quote.bid_price.scale() <= 2);
        assert!(quote.ask_price.scale() <= 2);
        assert!(quote.bid_size >= dec!(10));
        assert_eq!(quote.ttl_seconds, 90);
    }

    #[test]
    fn test_inventory_skews_quotes_down() {
        let book = book(&[(dec!(0.48), dec!(1000))], &[(dec!(0.54), dec!(800))]);

        let mut flat = MarketMaker::new(0.02, dec!(10000));
        let flat_quote = flat.generate_quote(&book, None, 1.0).unwrap();

        let mut long = MarketMaker::new(0.02, dec!(10000));
        long.update_inventory(Side::Buy, dec!(1000), dec!(0.50));
        let long_quote = long.generate_quote(&book, None, 1.0).unwrap();

        assert!(long_quote.bid_price <= flat_quote.bid_price);
        assert!(long_quote.bid_price < dec!(0.51));
        assert!(long_quote.ask_price < dec!(0.53));
    }

    #[test]
    fn test_ask_respects_cost_floor() {
        let mut mm = MarketMaker::new(0.02, dec!(10000));
        mm.update_inventory(Side::Buy, dec!(100), dec!(0.55));

        let book = book(&[(dec!(0.50), dec!(500))], &[(dec!(0.52), dec!(500))]);
        let quote = mm.generate_quote(&book, None, 1.0).unwrap();

        // No urgency: required profit is 1.5% over the 0.55 cost.
        assert!(quote.ask_price >= dec!(0.55));
    }

    #[test]
    fn test_high_urgency_accepts_small_loss() {
        let mut mm = MarketMaker::new(0.02, dec!(10000));
        mm.update_inventory(Side::Buy, dec!(100), dec!(0.55));
        // One hour out: urgency ~0.96, above the 0.9 threshold.
        mm.set_market_close_time(Utc::now() + Duration::hours(1));

        let book = book(&[(dec!(0.50), dec!(500))], &[(dec!(0.52), dec!(500))]);
        let quote = mm.generate_quote(&book, None, 1.0).unwrap();

        // Floor drops to 0.55 * 0.99 = 0.5445, which rounds to 0.54.
        assert_eq!(quote.ask_price, dec!(0.54));
    }

    #[test]
    fn test_no_quote_when_spread_too_tight() {
        let mut mm = MarketMaker::new(0.02, dec!(1000));
        let book = book(&[(dec!(0.50), dec!(100))], &[(dec!(0.505), dec!(100))]);
        assert!(mm.generate_quote(&book, None, 1.0).is_none());
    }

    #[test]
    fn test_no_quote_near_max_position() {
        let mut mm = MarketMaker::new(0.02, dec!(1000));
        mm.update_inventory(Side::Buy, dec!(998), dec!(0.50));
        let book = book(&[(dec!(0.48), dec!(1000))], &[(dec!(0.54), dec!(800))]);
        // Remaining capacity 2 / mid 0.51 is well below the minimum size.
        assert!(mm.generate_quote(&book, None, 1.0).is_none());
    }

    #[test]
    fn test_ttl_follows_market_phase() {
        let cases = [
            (Duration::hours(3), 90),
            (Duration::minutes(45), 45),
            (Duration::minutes(8), 20),
            (Duration::minutes(-5), 3),
        ];

        for (delta, expected_ttl) in cases {
            let mut mm = MarketMaker::new(0.02, dec!(1000));
            let book = book(&[(dec!(0.50), dec!(100))], &[(dec!(0.52), dec!(100))]);
            let meta = metadata_ending_in(delta);
            let quote = mm.generate_quote(&book, Some(&meta), 1.0).unwrap();
            assert_eq!(quote.ttl_seconds, expected_ttl);
        }
    }

    #[test]
    fn test_spread_multiplier_widens_quotes() {
        let book = book(&[(dec!(0.40), dec!(1000))], &[(dec!(0.60), dec!(1000))]);

        let mut base = MarketMaker::new(0.05, dec!(1000));
        let narrow = base.generate_quote(&book, None, 1.0).unwrap();

        let mut widened = MarketMaker::new(0.05, dec!(1000));
        let wide = widened.generate_quote(&book, None, 3.0).unwrap();

        assert!(wide.bid_price <= narrow.bid_price);
        assert!(wide.ask_price >= narrow.ask_price);
        assert!(
            wide.ask_price - wide.bid_price > narrow.ask_price - narrow.bid_price
        );
    }

    #[test]
    fn test_inventory_weighted_average_cost() {
        let mut mm = MarketMaker::new(0.02, dec!(10000));
        mm.update_inventory(Side::Buy, dec!(100), dec!(0.40));
        mm.update_inventory(Side::Buy, dec!(100), dec!(0.50));

        assert_eq!(mm.inventory(), dec!(200));
        assert_eq!(mm.avg_cost(), dec!(0.45));
        assert_eq!(mm.inventory_dollars(), dec!(90));
    }

    #[test]
    fn test_inventory_partial_close_realizes_pnl() {
        let mut mm = MarketMaker::new(0.02, dec!(10000));
        mm.update_inventory(Side::Buy, dec!(100), dec!(0.50));
        mm.update_inventory(Side::Sell, dec!(40), dec!(0.60));

        assert_eq!(mm.inventory(), dec!(60));
        assert_eq!(mm.avg_cost(), dec!(0.50));
        assert_eq!(mm.realized_pnl(), dec!(4.0));
    }

    #[test]
    fn test_inventory_flip_through_zero() {
        let mut mm = MarketMaker::new(0.02, dec!(10000));
        mm.update_inventory(Side::Buy, dec!(100), dec!(0.50));
        mm.update_inventory(Side::Sell, dec!(150), dec!(0.60));

        // 100 closed at +0.10 each, 50 opened short at 0.60.
        assert_eq!(mm.realized_pnl(), dec!(10.0));
        assert_eq!(mm.inventory(), dec!(-50));
        assert_eq!(mm.avg_cost(), dec!(0.60));
    }

    #[test]
    fn test_inventory_flat_clears_avg_cost() {
        let mut mm = MarketMaker::new(0.02, dec!(10000));
        mm.update_inventory(Side::Buy, dec!(100), dec!(0.50));
        mm.update_inventory(Side::Sell, dec!(100), dec!(0.55));

        assert_eq!(mm.inventory(), Decimal::ZERO);
        assert_eq!(mm.avg_cost(), Decimal::ZERO);
        assert_eq!(mm.inventory_dollars(), Decimal::ZERO);
        assert_eq!(mm.realized_pnl(), dec!(5.0));
    }

    #[test]
    fn test_short_cover_realizes_pnl() {
        let mut mm = MarketMaker::new(0.02, dec!(10000));
        mm.update_inventory(Side::Sell, dec!(100), dec!(0.60));
        assert_eq!(mm.inventory(), dec!(-100));
        assert_eq!(mm.avg_cost(), dec!(0.60));

        mm.update_inventory(Side::Buy, dec!(100), dec!(0.50));
        assert_eq!(mm.inventory(), Decimal::ZERO);
        assert_eq!(mm.realized_pnl(), dec!(10.0));
    }

    #[test]
    fn test_volatility_clamped() {
        let mut mm = MarketMaker::new(0.02, dec!(1000));
        // A 2% move in one second annualizes far beyond the cap.
        mm.update_volatility(dec!(0.50), dec!(0.51), 1.0);
        assert_eq!(mm.volatility(), VOL_MAX);

        // Long stretches of no movement decay toward the floor.
        let mut quiet = MarketMaker::new(0.02, dec!(1000));
        for _ in 0..200 {
            quiet.update_volatility(dec!(0.50), dec!(0.50), 1.0);
        }
        assert_eq!(quiet.volatility(), VOL_MIN);
    }

    #[test]
    fn test_time_urgency_ramp() {
        let mut mm = MarketMaker::new(0.02, dec!(1000));
        assert_eq!(mm.time_urgency(), 0.0);

        mm.set_market_close_time(Utc::now() + Duration::hours(48));
        assert_eq!(mm.time_urgency(), 0.0);

        mm.set_market_close_time(Utc::now() + Duration::hours(12));
        let urgency = mm.time_urgency();
        assert!(urgency > 0.49 && urgency < 0.51);

        mm.set_market_close_time(Utc::now() - Duration::hours(1));
        assert_eq!(mm.time_urgency(), 1.0);
    }

    #[test]
    fn test_restore_state() {
        let mut mm = MarketMaker::new(0.02, dec!(1000));
        mm.restore_state(dec!(500), dec!(0.55), dec!(250));

        assert_eq!(mm.inventory(), dec!(500));
        assert_eq!(mm.avg_cost(), dec!(0.55));
        assert_eq!(mm.realized_pnl(), dec!(250));
        assert_eq!(mm.inventory_dollars(), dec!(275));
    }

    #[test]
    fn test_unrealized_pnl() {
        let mut mm = MarketMaker::new(0.02, dec!(10000));
        mm.update_inventory(Side::Buy, dec!(100), dec!(0.50));
        assert_eq!(mm.unrealized_pnl(dec!(0.55)), dec!(5.0));
        assert_eq!(mm.unrealized_pnl(dec!(0.45)), dec!(-5.0));
    }
}

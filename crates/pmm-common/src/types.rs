//! Domain vocabulary shared across the workspace.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Outcome token identifier (opaque CLOB asset ID).
pub type TokenId = String;
/// Order identifier, monotonic within a process (`"ORD_<n>"`).
pub type OrderId = String;
/// Market identifier.
pub type MarketId = String;
/// Condition identifier shared by the tokens of one market.
pub type ConditionId = String;

/// Order side.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Side {
    Buy,
    Sell,
}

impl Side {
    pub fn opposite(&self) -> Self {
        match self {
            Side::Buy => Side::Sell,
            Side::Sell => Side::Buy,
        }
    }

    /// Sign applied to a fill of this side (+1 buy, -1 sell).
    pub fn sign(&self) -> Decimal {
        match self {
            Side::Buy => Decimal::ONE,
            Side::Sell => Decimal::NEGATIVE_ONE,
        }
    }
}

impl std::fmt::Display for Side {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Side::Buy => write!(f, "BUY"),
            Side::Sell => write!(f, "SELL"),
        }
    }
}

/// Lifecycle state of an order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum OrderStatus {
    Open,
    Filled,
    Cancelled,
}

impl std::fmt::Display for OrderStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OrderStatus::Open => write!(f, "OPEN"),
            OrderStatus::Filled => write!(f, "FILLED"),
            OrderStatus::Cancelled => write!(f, "CANCELLED"),
        }
    }
}

/// A resting limit order.
///
/// Invariant: `0 <= filled_size <= size`; `status == Filled` implies
/// `filled_size >= size`.
#[derive(Debug, Clone)]
pub struct Order {
    pub order_id: OrderId,
    pub token_id: TokenId,
    pub side: Side,
    pub price: Decimal,
    pub size: Decimal,
    pub filled_size: Decimal,
    pub status: OrderStatus,
    pub created_at: std::time::Instant,
}

/// Why an order was cancelled. Audit-only.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelReason {
    QuoteUpdate,
    TtlExpired,
    InventoryLimit,
    Shutdown,
    Manual,
    Unknown,
}

impl std::fmt::Display for CancelReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CancelReason::QuoteUpdate => write!(f, "QUOTE_UPDATE"),
            CancelReason::TtlExpired => write!(f, "TTL_EXPIRED"),
            CancelReason::InventoryLimit => write!(f, "INVENTORY_LIMIT"),
            CancelReason::Shutdown => write!(f, "SHUTDOWN"),
            CancelReason::Manual => write!(f, "MANUAL"),
            CancelReason::Unknown => write!(f, "UNKNOWN"),
        }
    }
}

/// Execution mode: simulated fills or the live venue adapter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TradingMode {
    #[default]
    Paper,
    Live,
}

impl std::str::FromStr for TradingMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "paper" => Ok(TradingMode::Paper),
            "live" => Ok(TradingMode::Live),
            _ => Err(format!("unknown trading mode: {}", s)),
        }
    }
}

impl std::fmt::Display for TradingMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TradingMode::Paper => write!(f, "paper"),
            TradingMode::Live => write!(f, "live"),
        }
    }
}

/// A single price level (price, size) in an order book payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BookLevel {
    /// Price in (0, 1) for binary outcome tokens.
    pub price: Decimal,
    /// Quantity resting at this price.
    pub size: Decimal,
}

impl BookLevel {
    pub fn new(price: Decimal, size: Decimal) -> Self {
        Self { price, size }
    }
}

/// Lifecycle phase of a market relative to its event start.
///
/// Drives quote TTL: quotes rest longer when the event is far away and
/// refresh aggressively once it is underway.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MarketPhase {
    /// More than an hour to the event.
    PreMatchEarly,
    /// Between 10 and 60 minutes out.
    PreMatchLate,
    /// Final 10 minutes before the event.
    PreMatchCritical,
    /// Event underway (or end time passed).
    InPlay,
}

impl MarketPhase {
    /// Recommended quote TTL in seconds for this phase.
    pub fn recommended_ttl_secs(&self) -> u64 {
        match self {
            MarketPhase::PreMatchEarly => 90,
            MarketPhase::PreMatchLate => 45,
            MarketPhase::PreMatchCritical => 20,
            MarketPhase::InPlay => 3,
        }
    }
}

impl std::fmt::Display for MarketPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MarketPhase::PreMatchEarly => write!(f, "PRE_MATCH_EARLY"),
            MarketPhase::PreMatchLate => write!(f, "PRE_MATCH_LATE"),
            MarketPhase::PreMatchCritical => write!(f, "PRE_MATCH_CRITICAL"),
            MarketPhase::InPlay => write!(f, "IN_PLAY"),
        }
    }
}

/// Descriptive metadata for a tradable outcome token.
#[derive(Debug, Clone, Default)]
pub struct MarketMetadata {
    /// Event title, e.g. "Aston Villa vs Bournemouth".
    pub title: String,
    /// Outcome this token pays on, e.g. "Villa Win".
    pub outcome: String,
    /// Market identifier.
    pub market_id: MarketId,
    /// Condition identifier (shared across sibling outcomes).
    pub condition_id: ConditionId,
    /// Scheduled end of the underlying event, when known.
    pub event_end_time: Option<DateTime<Utc>>,
}

impl MarketMetadata {
    /// Display name used in logs and audit rows.
    pub fn display_name(&self) -> String {
        format!("{} - {}", self.title, self.outcome)
    }

    /// Phase derived from minutes remaining to the event end.
    ///
    /// Returns `None` when the end time is unknown.
    pub fn market_phase(&self) -> Option<MarketPhase> {
        self.market_phase_at(Utc::now())
    }

    /// Phase evaluated against an explicit reference time.
    pub fn market_phase_at(&self, now: DateTime<Utc>) -> Option<MarketPhase> {
        let end = self.event_end_time?;
        let minutes = (end - now).num_minutes();
        let phase = if minutes >= 60 {
            MarketPhase::PreMatchEarly
        } else if minutes >= 10 {
            MarketPhase::PreMatchLate
        } else if minutes >= 0 {
            MarketPhase::PreMatchCritical
        } else {
            MarketPhase::InPlay
        };
        Some(phase)
    }

    /// Hours remaining to the event end; negative once in play.
    pub fn hours_to_event(&self, now: DateTime<Utc>) -> Option<f64> {
        self.event_end_time
            .map(|end| (end - now).num_seconds() as f64 / 3600.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use rust_decimal_macros::dec;

    #[test]
    fn test_side_opposite() {
        assert_eq!(Side::Buy.opposite(), Side::Sell);
        assert_eq!(Side::Sell.opposite(), Side::Buy);
    }

    #[test]
    fn test_side_sign() {
        assert_eq!(Side::Buy.sign(), Decimal::ONE);
        assert_eq!(Side::Sell.sign(), Decimal::NEGATIVE_ONE);
    }

    #[test]
    fn test_side_display() {
        assert_eq!(Side::Buy.to_string(), "BUY");
        assert_eq!(Side::Sell.to_string(), "SELL");
    }

    #[test]
    fn test_trading_mode_parse() {
        assert_eq!("paper".parse::<TradingMode>(), Ok(TradingMode::Paper));
        assert_eq!("LIVE".parse::<TradingMode>(), Ok(TradingMode::Live));
        assert!("shadow".parse::<TradingMode>().is_err());
    }

    #[test]
    fn test_cancel_reason_display() {
        assert_eq!(CancelReason::QuoteUpdate.to_string(), "QUOTE_UPDATE");
        assert_eq!(CancelReason::TtlExpired.to_string(), "TTL_EXPIRED");
        assert_eq!(CancelReason::Shutdown.to_string(), "SHUTDOWN");
    }

    #[test]
    fn test_book_level() {
        let level = BookLevel::new(dec!(0.45), dec!(100));
        assert_eq!(level.price, dec!(0.45));
        assert_eq!(level.size, dec!(100));
    }

    #[test]
    fn test_market_phase_thresholds() {
        let now = Utc::now();
        let meta = |end: DateTime<Utc>| MarketMetadata {
            title: "Test".to_string(),
            outcome: "Yes".to_string(),
            event_end_time: Some(end),
            ..Default::default()
        };

        assert_eq!(
            meta(now + Duration::hours(3)).market_phase_at(now),
            Some(MarketPhase::PreMatchEarly)
        );
        assert_eq!(
            meta(now + Duration::minutes(45)).market_phase_at(now),
            Some(MarketPhase::PreMatchLate)
        );
        assert_eq!(
            meta(now + Duration::minutes(8)).market_phase_at(now),
            Some(MarketPhase::PreMatchCritical)
        );
        assert_eq!(
            meta(now - Duration::minutes(5)).market_phase_at(now),
            Some(MarketPhase::InPlay)
        );
    }

    #[test]
    fn test_market_phase_unknown_end_time() {
        let meta = MarketMetadata::default();
        assert_eq!(meta.market_phase(), None);
    }

    #[test]
    fn test_phase_ttls() {
        assert_eq!(MarketPhase::PreMatchEarly.recommended_ttl_secs(), 90);
        assert_eq!(MarketPhase::PreMatchLate.recommended_ttl_secs(), 45);
        assert_eq!(MarketPhase::PreMatchCritical.recommended_ttl_secs(), 20);
        assert_eq!(MarketPhase::InPlay.recommended_ttl_secs(), 3);
    }

    #[test]
    fn test_display_name() {
        let meta = MarketMetadata {
            title: "Villa vs Bournemouth".to_string(),
            outcome: "Draw".to_string(),
            ..Default::default()
        };
        assert_eq!(meta.display_name(), "Villa vs Bournemouth - Draw");
    }
}

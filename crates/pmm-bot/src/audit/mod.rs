//! Per-session CSV audit streams.
//!
//! Four files per session under `<log_dir>/session_<YYYYMMDD_HHMMSS>`:
//! `orders.csv`, `fills.csv`, `positions.csv`, `price_updates.csv`. Rows
//! are flushed as they are written so a crash loses at most the row in
//! flight. Timestamps are ISO-8601 UTC. Fields are numeric or
//! identifier-like; no quoting is needed.

pub mod summary;

use std::fs::{self, File};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Local, Utc};
use parking_lot::Mutex;
use rust_decimal::Decimal;
use thiserror::Error;
use tracing::{debug, error, info};

use pmm_common::{CancelReason, Order, Side};

/// Errors opening session files.
#[derive(Debug, Error)]
pub enum AuditError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),
}

/// Wall-clock timestamp in the audit row format.
fn audit_timestamp(ts: DateTime<Utc>) -> String {
    ts.format("%Y-%m-%dT%H:%M:%SZ").to_string()
}

fn now_timestamp() -> String {
    audit_timestamp(Utc::now())
}

struct SessionWriters {
    session_id: String,
    session_dir: PathBuf,
    orders: csv::Writer<File>,
    fills: csv::Writer<File>,
    positions: csv::Writer<File>,
    price_updates: csv::Writer<File>,
}

/// One row of `positions.csv`.
#[derive(Debug, Clone)]
pub struct PositionRow {
    pub market_id: String,
    pub token_id: String,
    pub quantity: Decimal,
    pub avg_cost: Decimal,
    pub opened_at: DateTime<Utc>,
    pub last_updated: DateTime<Utc>,
    pub entry_side: Option<Side>,
    pub num_fills: u32,
    pub total_cost: Decimal,
}

/// One row of `price_updates.csv`.
#[derive(Debug, Clone)]
pub struct PriceUpdateRow {
    pub market_id: String,
    pub token_id: String,
    pub mid_price: Decimal,
    pub price_change_pct: f64,
    pub price_change_abs: Decimal,
    pub best_bid: Decimal,
    pub best_ask: Decimal,
    pub spread: Decimal,
    pub spread_bps: f64,
    pub bid_volume: Decimal,
    pub ask_volume: Decimal,
    pub volume_imbalance: f64,
    pub bid_levels: usize,
    pub ask_levels: usize,
    pub our_inventory: Decimal,
    pub time_to_event_hours: f64,
    pub seconds_since_last_update: f64,
}

/// Mutex-serialized CSV audit writer for one trading session.
pub struct TradingAudit {
    log_dir: PathBuf,
    session: Mutex<Option<SessionWriters>>,
}

impl TradingAudit {
    pub fn new(log_dir: impl Into<PathBuf>) -> Self {
        Self {
            log_dir: log_dir.into(),
            session: Mutex::new(None),
        }
    }

    /// Open a new session directory and its four CSV files.
    ///
    /// Returns the session directory so collaborators (the summary
    /// aggregator) can place their own files beside these.
    pub fn start_session(&self, event_name: &str) -> Result<PathBuf, AuditError> {
        let session_id = format!("session_{}", Local::now().format("%Y%m%d_%H%M%S"));
        let session_dir = self.log_dir.join(&session_id);
        fs::create_dir_all(&session_dir)?;

        let orders = open_with_header(
            &session_dir.join("orders.csv"),
            &[
                "timestamp", "market_id", "order_id", "token_id", "side", "price", "size",
                "status",
            ],
        )?;
        let fills = open_with_header(
            &session_dir.join("fills.csv"),
            &[
                "timestamp", "market_id", "order_id", "token_id", "side", "fill_price",
                "fill_size", "pnl",
            ],
        )?;
        let positions = open_with_header(
            &session_dir.join("positions.csv"),
            &[
                "timestamp", "market_id", "token_id", "position", "avg_cost", "opened_at",
                "last_updated", "entry_side", "num_fills", "total_cost",
            ],
        )?;
        let price_updates = open_with_header(
            &session_dir.join("price_updates.csv"),
            &[
                "timestamp", "market_id", "token_id", "mid_price", "price_change_pct",
                "price_change_abs", "best_bid", "best_ask", "spread", "spread_bps",
                "bid_volume_5levels", "ask_volume_5levels", "total_volume", "volume_imbalance",
                "bid_levels_count", "ask_levels_count", "our_inventory", "time_to_event_hours",
                "seconds_since_last_update",
            ],
        )?;

        info!(session = %session_id, event = event_name, "trading session started");

        *self.session.lock() = Some(SessionWriters {
            session_id,
            session_dir: session_dir.clone(),
            orders,
            fills,
            positions,
            price_updates,
        });

        Ok(session_dir)
    }

    /// Close the session files, flushing any buffered rows.
    pub fn end_session(&self) {
        let mut guard = self.session.lock();
        if let Some(mut session) = guard.take() {
            let _ = session.orders.flush();
            let _ = session.fills.flush();
            let _ = session.positions.flush();
            let _ = session.price_updates.flush();
            info!(session = %session.session_id, dir = %session.session_dir.display(),
                "trading session ended");
        }
    }

    pub fn session_id(&self) -> Option<String> {
        self.session.lock().as_ref().map(|s| s.session_id.clone())
    }

    pub fn session_dir(&self) -> Option<PathBuf> {
        self.session.lock().as_ref().map(|s| s.session_dir.clone())
    }

    pub fn log_order_placed(&self, order: &Order, market_id: &str) {
        let mut guard = self.session.lock();
        let session = match guard.as_mut() {
            Some(s) => s,
            None => return,
        };

        let result = session.orders.write_record([
            now_timestamp(),
            market_id.to_string(),
            order.order_id.clone(),
            order.token_id.clone(),
            order.side.to_string(),
            order.price.to_string(),
            order.size.to_string(),
            "OPEN".to_string(),
        ]);
        flush_or_warn(result.and_then(|_| session.orders.flush().map_err(Into::into)), "orders");
    }

    pub fn log_order_cancelled(&self, order: &Order, market_id: &str, reason: CancelReason) {
        debug!(order = %order.order_id, %reason, "order cancelled");

        let mut guard = self.session.lock();
        let session = match guard.as_mut() {
            Some(s) => s,
            None => return,
        };

        let result = session.orders.write_record([
            now_timestamp(),
            market_id.to_string(),
            order.order_id.clone(),
            order.token_id.clone(),
            order.side.to_string(),
            order.price.to_string(),
            order.size.to_string(),
            "CANCELLED".to_string(),
        ]);
        flush_or_warn(result.and_then(|_| session.orders.flush().map_err(Into::into)), "orders");
    }

    #[allow(clippy::too_many_arguments)]
    pub fn log_order_filled(
        &self,
        market_id: &str,
        order_id: &str,
        token_id: &str,
        fill_price: Decimal,
        fill_size: Decimal,
        side: Side,
        pnl: Decimal,
    ) {
        let mut guard = self.session.lock();
        let session = match guard.as_mut() {
            Some(s) => s,
            None => return,
        };

        let result = session.fills.write_record([
            now_timestamp(),
            market_id.to_string(),
            order_id.to_string(),
            token_id.to_string(),
            side.to_string(),
            fill_price.to_string(),
            fill_size.to_string(),
            pnl.to_string(),
        ]);
        flush_or_warn(result.and_then(|_| session.fills.flush().map_err(Into::into)), "fills");
    }

    pub fn log_position(&self, row: &PositionRow) {
        let mut guard = self.session.lock();
        let session = match guard.as_mut() {
            Some(s) => s,
            None => return,
        };

        let entry_side = row
            .entry_side
            .map(|s| s.to_string())
            .unwrap_or_else(|| "NONE".to_string());

        let result = session.positions.write_record([
            now_timestamp(),
            row.market_id.clone(),
            row.token_id.clone(),
            row.quantity.to_string(),
            row.avg_cost.to_string(),
            audit_timestamp(row.opened_at),
            audit_timestamp(row.last_updated),
            entry_side,
            row.num_fills.to_string(),
            row.total_cost.to_string(),
        ]);
        flush_or_warn(
            result.and_then(|_| session.positions.flush().map_err(Into::into)),
            "positions",
        );
    }

    pub fn log_price_update(&self, row: &PriceUpdateRow) {
        let mut guard = self.session.lock();
        let session = match guard.as_mut() {
            Some(s) => s,
            None => return,
        };

        let total_volume = row.bid_volume + row.ask_volume;
        let result = session.price_updates.write_record([
            now_timestamp(),
            row.market_id.clone(),
            row.token_id.clone(),
            row.mid_price.to_string(),
            format!("{:.6}", row.price_change_pct),
            row.price_change_abs.to_string(),
            row.best_bid.to_string(),
            row.best_ask.to_string(),
            row.spread.to_string(),
            format!("{:.2}", row.spread_bps),
            row.bid_volume.to_string(),
            row.ask_volume.to_string(),
            total_volume.to_string(),
            format!("{:.4}", row.volume_imbalance),
            row.bid_levels.to_string(),
            row.ask_levels.to_string(),
            row.our_inventory.to_string(),
            format!("{:.2}", row.time_to_event_hours),
            format!("{:.1}", row.seconds_since_last_update),
        ]);
        flush_or_warn(
            result.and_then(|_| session.price_updates.flush().map_err(Into::into)),
            "price_updates",
        );
    }
}

fn open_with_header(path: &Path, header: &[&str]) -> Result<csv::Writer<File>, AuditError> {
    let file = File::create(path)?;
    let mut writer = csv::Writer::from_writer(file);
    writer.write_record(header)?;
    writer.flush()?;
    Ok(writer)
}

fn flush_or_warn(result: Result<(), csv::Error>, stream: &str) {
    if let Err(e) = result {
        error!(stream, error = %e, "audit write failed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;
    use std::time::Instant;
    use tempfile::TempDir;

    use pmm_common::OrderStatus;

    fn sample_order() -> Order {
        Order {
            order_id: "ORD_1".to_string(),
            token_id: "tok".to_string(),
            side: Side::Buy,
            price: dec!(0.41),
            size: dec!(100),
            filled_size: Decimal::ZERO,
            status: OrderStatus::Open,
            created_at: Instant::now(),
        }
    }

    #[test]
    fn test_session_creates_files_with_headers() {
        let dir = TempDir::new().unwrap();
        let audit = TradingAudit::new(dir.path());
        let session_dir = audit.start_session("Test Event").unwrap();

        for name in ["orders.csv", "fills.csv", "positions.csv", "price_updates.csv"] {
            let content = std::fs::read_to_string(session_dir.join(name)).unwrap();
            assert!(content.starts_with("timestamp,"), "{name} missing header");
        }
        assert!(audit.session_id().unwrap().starts_with("session_"));
    }

    #[test]
    fn test_order_rows() {
        let dir = TempDir::new().unwrap();
        let audit = TradingAudit::new(dir.path());
        let session_dir = audit.start_session("Test").unwrap();

        let order = sample_order();
        audit.log_order_placed(&order, "mkt1");
        audit.log_order_cancelled(&order, "mkt1", CancelReason::QuoteUpdate);

        let content = std::fs::read_to_string(session_dir.join("orders.csv")).unwrap();
        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(lines.len(), 3);
        assert!(lines[1].contains("ORD_1,tok,BUY,0.41,100,OPEN"));
        assert!(lines[2].ends_with("CANCELLED"));
    }

    #[test]
    fn test_fill_row() {
        let dir = TempDir::new().unwrap();
        let audit = TradingAudit::new(dir.path());
        let session_dir = audit.start_session("Test").unwrap();

        audit.log_order_filled("mkt1", "ORD_2", "tok", dec!(0.42), dec!(100), Side::Sell, dec!(1.5));

        let content = std::fs::read_to_string(session_dir.join("fills.csv")).unwrap();
        assert!(content.lines().nth(1).unwrap().contains("ORD_2,tok,SELL,0.42,100,1.5"));
    }

    #[test]
    fn test_position_row() {
        let dir = TempDir::new().unwrap();
        let audit = TradingAudit::new(dir.path());
        let session_dir = audit.start_session("Test").unwrap();

        let now = Utc::now();
        audit.log_position(&PositionRow {
            market_id: "mkt1".to_string(),
            token_id: "tok".to_string(),
            quantity: dec!(500),
            avg_cost: dec!(0.55),
            opened_at: now,
            last_updated: now,
            entry_side: Some(Side::Buy),
            num_fills: 3,
            total_cost: dec!(275),
        });

        let content = std::fs::read_to_string(session_dir.join("positions.csv")).unwrap();
        let row = content.lines().nth(1).unwrap();
        assert!(row.contains("mkt1,tok,500,0.55"));
        assert!(row.contains("BUY,3,275"));
    }

    #[test]
    fn test_writes_without_session_are_dropped() {
        let dir = TempDir::new().unwrap();
        let audit = TradingAudit::new(dir.path());
        // No session started: nothing panics, nothing is written.
        audit.log_order_placed(&sample_order(), "mkt1");
        assert!(audit.session_id().is_none());
    }

    #[test]
    fn test_end_session_closes() {
        let dir = TempDir::new().unwrap();
        let audit = TradingAudit::new(dir.path());
        audit.start_session("Test").unwrap();
        audit.end_session();
        assert!(audit.session_id().is_none());
    }
}

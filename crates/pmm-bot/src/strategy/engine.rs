//! The strategy engine: one worker thread draining the event queue.
//!
//! The worker exclusively owns the order books, makers, positions,
//! adverse-selection state, and the order manager. Everything other
//! threads need to see (position and market aggregates, counters) is
//! published into `EngineStats`, which the status sampler reads without
//! touching engine internals.
//!
//! Housekeeping rides on the event stream: a ticker thread pushes
//! `TimerTick` once a second so TTL sweeps, summary flushes, and the
//! 60-second snapshot cycle advance even when the feed goes quiet.

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use tracing::{debug, error, info, warn};

use pmm_common::{
    BookLevel, CancelReason, ConditionId, MarketMetadata, OrderId, Side, TokenId, TradingMode,
};
use pmm_market::OrderBook;

use crate::audit::summary::MarketSummaryAggregator;
use crate::audit::{PositionRow, PriceUpdateRow, TradingAudit};
use crate::events::{EngineEvent, EventQueue};
use crate::order_manager::OrderManager;
use crate::state::{PositionState, StatePersistence, TradingState};
use crate::strategy::adverse::AdverseSelectionMonitor;
use crate::strategy::maker::MarketMaker;

/// Resting orders within this distance of the new quote are kept.
const QUOTE_PRICE_TOLERANCE: Decimal = Decimal::from_parts(1, 0, 0, false, 3); // 0.001
/// Positions smaller than this are display noise, not holdings.
const POSITION_EPSILON: Decimal = Decimal::from_parts(1, 0, 0, false, 3);

const TTL_SWEEP_INTERVAL: Duration = Duration::from_secs(1);
const SUMMARY_CHECK_INTERVAL: Duration = Duration::from_secs(5);
const SNAPSHOT_INTERVAL: Duration = Duration::from_secs(60);

/// Engine-side position for one token.
#[derive(Debug, Clone)]
pub struct Position {
    pub quantity: Decimal,
    pub avg_entry_price: Decimal,
    pub realized_pnl: Decimal,
    pub opened_at: DateTime<Utc>,
    pub last_updated: DateTime<Utc>,
    pub entry_side: Option<Side>,
    pub num_fills: u32,
    pub total_cost: Decimal,
}

impl Default for Position {
    fn default() -> Self {
        let now = Utc::now();
        Self {
            quantity: Decimal::ZERO,
            avg_entry_price: Decimal::ZERO,
            realized_pnl: Decimal::ZERO,
            opened_at: now,
            last_updated: now,
            entry_side: None,
            num_fills: 0,
            total_cost: Decimal::ZERO,
        }
    }
}

impl Position {
    /// Fold one fill into the position.
    ///
    /// Additions in the held direction update the volume-weighted average
    /// entry; reductions realize PnL against it; a fill through zero
    /// realizes the whole position and opens the remainder at the fill
    /// price with a fresh entry side and open time.
    pub fn apply_fill(&mut self, side: Side, quantity: Decimal, price: Decimal) {
        let signed = quantity * side.sign();
        let now = Utc::now();

        if self.quantity.is_zero() {
            self.quantity = signed;
            self.avg_entry_price = price;
            self.opened_at = now;
            self.entry_side = Some(side);
        } else if (self.quantity > Decimal::ZERO) == (signed > Decimal::ZERO) {
            let total_cost = self.quantity.abs() * self.avg_entry_price + quantity * price;
            self.quantity += signed;
            self.avg_entry_price = total_cost / self.quantity.abs();
        } else if signed.abs() >= self.quantity.abs() {
            self.realized_pnl += self.quantity * (price - self.avg_entry_price);
            self.quantity += signed;
            if self.quantity.is_zero() {
                self.avg_entry_price = Decimal::ZERO;
                self.entry_side = None;
            } else {
                self.avg_entry_price = price;
                self.opened_at = now;
                self.entry_side = Some(side);
            }
        } else {
            self.realized_pnl += -signed * (price - self.avg_entry_price);
            self.quantity += signed;
        }

        self.num_fills += 1;
        self.last_updated = now;
        self.total_cost = self.quantity.abs() * self.avg_entry_price;
    }
}

/// Per-market view published for display.
#[derive(Debug, Clone)]
pub struct MarketView {
    pub mid: Decimal,
    pub spread_bps: f64,
}

/// Last quote placed on a token.
#[derive(Debug, Clone)]
pub struct QuoteView {
    pub bid_price: Decimal,
    pub ask_price: Decimal,
}

/// Aggregates shared between the strategy thread and read-only samplers.
#[derive(Default)]
pub struct EngineStats {
    running: AtomicBool,
    events_processed: AtomicU64,
    total_fills: AtomicU64,
    open_orders: AtomicUsize,
    bid_orders: AtomicUsize,
    ask_orders: AtomicUsize,
    positions: DashMap<TokenId, Position>,
    markets: DashMap<TokenId, MarketView>,
    quotes: DashMap<TokenId, QuoteView>,
}

impl EngineStats {
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    pub fn events_processed(&self) -> u64 {
        self.events_processed.load(Ordering::Relaxed)
    }

    pub fn fill_count(&self) -> u64 {
        self.total_fills.load(Ordering::Relaxed)
    }

    pub fn active_order_count(&self) -> usize {
        self.open_orders.load(Ordering::Relaxed)
    }

    pub fn bid_count(&self) -> usize {
        self.bid_orders.load(Ordering::Relaxed)
    }

    pub fn ask_count(&self) -> usize {
        self.ask_orders.load(Ordering::Relaxed)
    }

    pub fn active_market_count(&self) -> usize {
        self.markets.len()
    }

    /// Tokens with a materially non-zero holding.
    pub fn position_count(&self) -> usize {
        self.positions
            .iter()
            .filter(|entry| entry.value().quantity.abs() > POSITION_EPSILON)
            .count()
    }

    pub fn total_realized_pnl(&self) -> Decimal {
        self.positions
            .iter()
            .map(|entry| entry.value().realized_pnl)
            .sum()
    }

    /// Mark-to-mid PnL over tokens with a live market view.
    pub fn unrealized_pnl(&self) -> Decimal {
        self.positions
            .iter()
            .filter(|entry| entry.value().quantity.abs() > POSITION_EPSILON)
            .filter_map(|entry| {
                let market = self.markets.get(entry.key())?;
                let pos = entry.value();
                Some(pos.quantity * (market.mid - pos.avg_entry_price))
            })
            .sum()
    }

    /// Absolute share count held across all tokens.
    pub fn total_inventory(&self) -> Decimal {
        self.positions
            .iter()
            .map(|entry| entry.value().quantity.abs())
            .sum()
    }

    /// Mean spread over markets currently publishing a view.
    pub fn average_spread_bps(&self) -> f64 {
        let count = self.markets.len();
        if count == 0 {
            return 0.0;
        }
        let sum: f64 = self.markets.iter().map(|entry| entry.value().spread_bps).sum();
        sum / count as f64
    }

    pub fn position_for(&self, token_id: &str) -> Option<Position> {
        self.positions.get(token_id).map(|p| p.clone())
    }

    pub fn quote_for(&self, token_id: &str) -> Option<QuoteView> {
        self.quotes.get(token_id).map(|q| q.clone())
    }
}

/// Tunables for the engine.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub mode: TradingMode,
    pub spread_pct: f64,
    pub max_position: Decimal,
    pub state_file: PathBuf,
    pub log_dir: PathBuf,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            mode: TradingMode::Paper,
            spread_pct: 0.02,
            max_position: Decimal::new(1000, 0),
            state_file: PathBuf::from("./state.json"),
            log_dir: PathBuf::from("./logs"),
        }
    }
}

/// Quote currently resting in the market, tracked for TTL and summaries.
struct ActiveQuote {
    bid_price: Decimal,
    ask_price: Decimal,
    mid: Decimal,
    spread_bps: f64,
    inventory: Decimal,
    created_at: Instant,
    ttl: Duration,
}

/// Last observed mid per token, for price-update deltas.
#[derive(Clone, Copy)]
struct PriceHistory {
    last_mid: Decimal,
    last_update: Instant,
}

/// Extended context captured at fill time, assessed on the 60s cycle.
struct FillMetricsRecord {
    fill_time: Instant,
    token_id: TokenId,
    order_id: OrderId,
    side: Side,
    fill_price: Decimal,
    mid_at_fill: Option<Decimal>,
    spread_bps_at_fill: f64,
    imbalance_at_fill: f64,
    inventory_before: Decimal,
    inventory_after: Decimal,
    mid_30s_after: Option<Decimal>,
    mid_60s_after: Option<Decimal>,
    complete: bool,
}

/// Everything the worker thread owns.
struct EngineCore {
    queue: Arc<EventQueue>,
    stats: Arc<EngineStats>,
    config: EngineConfig,
    audit: Arc<TradingAudit>,
    summary: Option<MarketSummaryAggregator>,
    persistence: StatePersistence,
    persisted: TradingState,
    as_monitor: AdverseSelectionMonitor,
    order_manager: OrderManager,

    books: HashMap<TokenId, OrderBook>,
    makers: HashMap<TokenId, MarketMaker>,
    metadata: HashMap<TokenId, MarketMetadata>,
    positions: HashMap<TokenId, Position>,
    active_quotes: HashMap<TokenId, ActiveQuote>,
    price_history: HashMap<TokenId, PriceHistory>,
    event_end_times: HashMap<ConditionId, DateTime<Utc>>,
    fill_metrics: Vec<FillMetricsRecord>,
    restored_tokens: HashSet<TokenId>,
    initial_positions_logged: bool,
    session_volume: Decimal,
}

/// Public handle: registration before start, lifecycle, shared stats.
pub struct StrategyEngine {
    queue: Arc<EventQueue>,
    stats: Arc<EngineStats>,
    core: Option<EngineCore>,
    worker: Option<thread::JoinHandle<()>>,
    ticker: Option<thread::JoinHandle<()>>,
}

impl StrategyEngine {
    pub fn new(queue: Arc<EventQueue>, config: EngineConfig) -> Self {
        let stats = Arc::new(EngineStats::default());

        let audit = Arc::new(TradingAudit::new(config.log_dir.clone()));
        let persistence = StatePersistence::new(config.state_file.clone());
        let persisted = persistence.load_state();

        let order_manager = OrderManager::new(
            Arc::clone(&queue),
            config.mode,
            Some(Arc::clone(&audit)),
        );

        // Seed engine positions from the previous session so holdings
        // survive a restart even before their first book update.
        let mut positions: HashMap<TokenId, Position> = HashMap::new();
        for (token_id, saved) in &persisted.positions {
            if saved.quantity.is_zero() {
                continue;
            }
            let position = Position {
                quantity: saved.quantity,
                avg_entry_price: saved.avg_cost,
                realized_pnl: saved.realized_pnl,
                entry_side: Some(if saved.quantity > Decimal::ZERO {
                    Side::Buy
                } else {
                    Side::Sell
                }),
                total_cost: saved.quantity.abs() * saved.avg_cost,
                ..Default::default()
            };
            stats.positions.insert(token_id.clone(), position.clone());
            positions.insert(token_id.clone(), position);
        }

        let core = EngineCore {
            queue: Arc::clone(&queue),
            stats: Arc::clone(&stats),
            config,
            audit,
            summary: None,
            persistence,
            persisted,
            as_monitor: AdverseSelectionMonitor::new(),
            order_manager,
            books: HashMap::new(),
            makers: HashMap::new(),
            metadata: HashMap::new(),
            positions,
            active_quotes: HashMap::new(),
            price_history: HashMap::new(),
            event_end_times: HashMap::new(),
            fill_metrics: Vec::new(),
            restored_tokens: HashSet::new(),
            initial_positions_logged: false,
            session_volume: Decimal::ZERO,
        };

        info!("strategy engine initialized");

        Self {
            queue,
            stats,
            core: Some(core),
            worker: None,
            ticker: None,
        }
    }

    pub fn queue(&self) -> Arc<EventQueue> {
        Arc::clone(&self.queue)
    }

    pub fn stats(&self) -> Arc<EngineStats> {
        Arc::clone(&self.stats)
    }

    pub fn is_running(&self) -> bool {
        self.stats.is_running()
    }

    /// Register a token for quoting: creates its market maker.
    pub fn register_market(
        &mut self,
        token_id: &str,
        title: &str,
        outcome: &str,
        market_id: &str,
        condition_id: &str,
    ) {
        let core = match self.core.as_mut() {
            Some(c) => c,
            None => {
                warn!(token = token_id, "cannot register market after start");
                return;
            }
        };

        core.makers.insert(
            token_id.to_string(),
            MarketMaker::new(core.config.spread_pct, core.config.max_position),
        );
        core.metadata.insert(
            token_id.to_string(),
            MarketMetadata {
                title: title.to_string(),
                outcome: outcome.to_string(),
                market_id: market_id.to_string(),
                condition_id: condition_id.to_string(),
                event_end_time: core.event_end_times.get(condition_id).copied(),
            },
        );
        debug!(token = token_id, title, outcome, "registered market");
    }

    /// Track a token without quoting it.
    pub fn register_market_metadata(
        &mut self,
        token_id: &str,
        title: &str,
        outcome: &str,
        market_id: &str,
        condition_id: &str,
    ) {
        let core = match self.core.as_mut() {
            Some(c) => c,
            None => {
                warn!(token = token_id, "cannot register metadata after start");
                return;
            }
        };

        core.metadata.insert(
            token_id.to_string(),
            MarketMetadata {
                title: title.to_string(),
                outcome: outcome.to_string(),
                market_id: market_id.to_string(),
                condition_id: condition_id.to_string(),
                event_end_time: core.event_end_times.get(condition_id).copied(),
            },
        );
        debug!(token = token_id, title, outcome, "registered metadata (observation only)");
    }

    /// Propagate an event end time to every token of a condition.
    pub fn set_event_end_time(&mut self, condition_id: &str, end_time: DateTime<Utc>) {
        let core = match self.core.as_mut() {
            Some(c) => c,
            None => {
                warn!(condition = condition_id, "cannot set end time after start");
                return;
            }
        };

        core.event_end_times
            .insert(condition_id.to_string(), end_time);

        for (token_id, meta) in core.metadata.iter_mut() {
            if meta.condition_id == condition_id {
                meta.event_end_time = Some(end_time);
                if let Some(maker) = core.makers.get_mut(token_id) {
                    maker.set_market_close_time(end_time);
                }
            }
        }

        if let Some(summary) = core.summary.as_mut() {
            summary.set_event_end_time(condition_id, end_time);
        }
    }

    /// Open the audit session (CSV files and the summary aggregator).
    pub fn start_logging(&mut self, event_name: &str) {
        let core = match self.core.as_mut() {
            Some(c) => c,
            None => {
                warn!("cannot start logging after start");
                return;
            }
        };

        match core.audit.start_session(event_name) {
            Ok(session_dir) => match MarketSummaryAggregator::new(&session_dir) {
                Ok(mut summary) => {
                    for (condition_id, end_time) in &core.event_end_times {
                        summary.set_event_end_time(condition_id, *end_time);
                    }
                    core.summary = Some(summary);
                }
                Err(e) => error!(error = %e, "failed to create summary aggregator"),
            },
            Err(e) => error!(error = %e, "failed to start audit session"),
        }
    }

    /// Spawn the worker and ticker threads.
    pub fn start(&mut self) {
        if self.stats.running.swap(true, Ordering::AcqRel) {
            warn!("strategy engine already running");
            return;
        }

        let core = match self.core.take() {
            Some(c) => c,
            None => {
                self.stats.running.store(false, Ordering::Release);
                warn!("strategy engine already consumed");
                return;
            }
        };

        let worker = thread::Builder::new()
            .name("strategy".to_string())
            .spawn(move || core.run());
        match worker {
            Ok(handle) => self.worker = Some(handle),
            Err(e) => {
                self.stats.running.store(false, Ordering::Release);
                error!(error = %e, "failed to spawn strategy thread");
                return;
            }
        }

        let ticker_queue = Arc::clone(&self.queue);
        let ticker_stats = Arc::clone(&self.stats);
        let ticker = thread::Builder::new()
            .name("strategy-ticker".to_string())
            .spawn(move || {
                while ticker_stats.is_running() {
                    thread::sleep(Duration::from_secs(1));
                    if ticker_stats.is_running() {
                        ticker_queue.push(EngineEvent::timer_tick());
                    }
                }
            });
        if let Ok(handle) = ticker {
            self.ticker = Some(handle);
        }

        info!("strategy engine started");
    }

    /// Enqueue shutdown and join the worker.
    pub fn stop(&mut self) {
        let worker = match self.worker.take() {
            Some(w) => w,
            None => return,
        };

        debug!("stopping strategy engine");
        self.queue.push(EngineEvent::shutdown("strategy shutdown"));
        if worker.join().is_err() {
            error!("strategy thread panicked");
            self.stats.running.store(false, Ordering::Release);
        }

        if let Some(ticker) = self.ticker.take() {
            let _ = ticker.join();
        }

        info!("strategy engine stopped");
    }
}

impl Drop for StrategyEngine {
    fn drop(&mut self) {
        self.stop();
    }
}

impl EngineCore {
    fn run(mut self) {
        debug!("strategy event loop started");

        let mut last_ttl_sweep = Instant::now();
        let mut last_summary_check = Instant::now();
        let mut last_snapshot = Instant::now();

        loop {
            let event = self.queue.pop();
            self.stats.events_processed.fetch_add(1, Ordering::Relaxed);

            match event {
                EngineEvent::BookSnapshot {
                    token_id,
                    bids,
                    asks,
                    ..
                } => self.handle_book_snapshot(&token_id, bids, asks),
                EngineEvent::PriceLevelUpdate {
                    token_id,
                    bids,
                    asks,
                    ..
                } => self.handle_price_update(&token_id, bids, asks),
                EngineEvent::OrderFill {
                    order_id,
                    token_id,
                    fill_price,
                    filled_size,
                    side,
                    ..
                } => self.handle_order_fill(&order_id, &token_id, fill_price, filled_size, side),
                EngineEvent::OrderRejected {
                    order_id, reason, ..
                } => {
                    error!(order = %order_id, %reason, "order rejected");
                }
                EngineEvent::TimerTick { .. } => {}
                EngineEvent::Shutdown { reason, .. } => {
                    info!(%reason, "shutdown event received");
                    break;
                }
            }

            let now = Instant::now();
            if now.duration_since(last_ttl_sweep) >= TTL_SWEEP_INTERVAL {
                self.check_expired_quotes();
                last_ttl_sweep = now;
            }
            if now.duration_since(last_summary_check) >= SUMMARY_CHECK_INTERVAL {
                if let Some(summary) = self.summary.as_mut() {
                    if summary.should_flush() {
                        summary.flush();
                    }
                }
                last_summary_check = now;
            }
            if now.duration_since(last_snapshot) >= SNAPSHOT_INTERVAL {
                self.snapshot_positions();
                self.assess_fill_metrics();
                self.log_quote_summary();
                self.as_monitor.decay();
                last_snapshot = now;
            }
        }

        // Drain: pull resting orders, persist, close the session.
        self.order_manager.cancel_all(CancelReason::Shutdown);
        self.sync_order_stats();
        self.snapshot_positions();
        self.audit.end_session();
        self.stats.running.store(false, Ordering::Release);
        info!("strategy event loop exited");
    }

    fn market_name(&self, token_id: &str) -> String {
        self.metadata
            .get(token_id)
            .map(|m| m.display_name())
            .unwrap_or_else(|| token_id.to_string())
    }

    fn market_id(&self, token_id: &str) -> String {
        self.metadata
            .get(token_id)
            .map(|m| m.market_id.clone())
            .filter(|id| !id.is_empty())
            .unwrap_or_else(|| token_id.to_string())
    }

    fn handle_book_snapshot(&mut self, token_id: &str, bids: Vec<BookLevel>, asks: Vec<BookLevel>) {
        debug!(
            token = token_id,
            bids = bids.len(),
            asks = asks.len(),
            "book snapshot"
        );

        let book_clone = {
            let book = self
                .books
                .entry(token_id.to_string())
                .or_insert_with(|| OrderBook::new(token_id.to_string()));
            book.clear();
            for level in &bids {
                book.update_bid(level.price, level.size);
            }
            for level in &asks {
                book.update_ask(level.price, level.size);
            }
            book.clone()
        };

        if let Some(mid) = book_clone.mid() {
            self.as_monitor.update_metrics(token_id, mid);
        }
        self.publish_market_view(token_id);

        if !self.initial_positions_logged {
            self.log_initial_positions();
        }

        // Forward to the order manager; in paper mode this is where
        // resting orders get crossed and fills come back on the queue.
        self.order_manager.update_order_book(token_id, &book_clone);
        self.sync_order_stats();

        self.calculate_quotes(token_id, CancelReason::QuoteUpdate);
    }

    fn handle_price_update(&mut self, token_id: &str, bids: Vec<BookLevel>, asks: Vec<BookLevel>) {
        let prior = self.price_history.get(token_id).copied();

        let book_clone = {
            let book = self
                .books
                .entry(token_id.to_string())
                .or_insert_with(|| OrderBook::new(token_id.to_string()));
            for level in &bids {
                book.update_bid(level.price, level.size);
            }
            for level in &asks {
                book.update_ask(level.price, level.size);
            }
            book.clone()
        };

        if let Some(mid) = book_clone.mid() {
            self.as_monitor.update_metrics(token_id, mid);
        }
        self.publish_market_view(token_id);

        if book_clone.has_valid_bbo() {
            self.record_price_update(token_id, &book_clone, prior);
        }

        self.calculate_quotes(token_id, CancelReason::QuoteUpdate);
    }

    /// Audit row and summary feed for one delta application.
    fn record_price_update(
        &mut self,
        token_id: &str,
        book: &OrderBook,
        prior: Option<PriceHistory>,
    ) {
        let (mid, best_bid, best_ask) = match (book.mid(), book.best_bid(), book.best_ask()) {
            (Some(m), Some(b), Some(a)) => (m, b, a),
            _ => return,
        };

        let spread = best_ask - best_bid;
        let spread_bps = book.spread_bps().unwrap_or(0.0);
        let bid_volume = book.total_bid_volume(5);
        let ask_volume = book.total_ask_volume(5);

        let (price_change_pct, price_change_abs, seconds_since_last) = match prior {
            Some(p) if p.last_mid > Decimal::ZERO => {
                let change = mid - p.last_mid;
                let pct = (change / p.last_mid)
                    .to_f64()
                    .map(|v| v * 100.0)
                    .unwrap_or(0.0);
                (pct, change, p.last_update.elapsed().as_secs_f64())
            }
            _ => (0.0, Decimal::ZERO, 0.0),
        };

        let our_inventory = self
            .makers
            .get(token_id)
            .map(|m| m.inventory())
            .or_else(|| self.positions.get(token_id).map(|p| p.quantity))
            .unwrap_or(Decimal::ZERO);

        let time_to_event_hours = self
            .metadata
            .get(token_id)
            .and_then(|m| m.hours_to_event(Utc::now()))
            .unwrap_or(-1.0);

        self.audit.log_price_update(&PriceUpdateRow {
            market_id: self.market_id(token_id),
            token_id: token_id.to_string(),
            mid_price: mid,
            price_change_pct,
            price_change_abs,
            best_bid,
            best_ask,
            spread,
            spread_bps,
            bid_volume,
            ask_volume,
            volume_imbalance: book.imbalance(),
            bid_levels: book.bid_level_count(),
            ask_levels: book.ask_level_count(),
            our_inventory,
            time_to_event_hours,
            seconds_since_last_update: seconds_since_last,
        });

        let market_name = self.market_name(token_id);
        let market_id = self.market_id(token_id);
        let condition_id = self
            .metadata
            .get(token_id)
            .map(|m| m.condition_id.clone())
            .unwrap_or_default();
        if let Some(summary) = self.summary.as_mut() {
            summary.update_market(
                &market_name,
                &market_id,
                &condition_id,
                token_id,
                mid,
                spread_bps,
                best_bid,
                best_ask,
                bid_volume,
                ask_volume,
            );
        }

        self.price_history.insert(
            token_id.to_string(),
            PriceHistory {
                last_mid: mid,
                last_update: Instant::now(),
            },
        );
    }

    fn handle_order_fill(
        &mut self,
        order_id: &str,
        token_id: &str,
        fill_price: Decimal,
        filled_size: Decimal,
        side: Side,
    ) {
        let market_name = self.market_name(token_id);
        info!(
            order = order_id,
            market = %market_name,
            %side,
            size = %filled_size,
            price = %fill_price,
            "fill event"
        );

        let (mid, spread_bps, imbalance) = self
            .books
            .get(token_id)
            .map(|b| (b.mid(), b.spread_bps().unwrap_or(0.0), b.imbalance()))
            .unwrap_or((None, 0.0, 0.0));

        let inventory_before = self
            .makers
            .get(token_id)
            .map(|m| m.inventory())
            .unwrap_or(Decimal::ZERO);

        self.update_position(token_id, filled_size, fill_price, side);

        let inventory_after = if let Some(maker) = self.makers.get_mut(token_id) {
            maker.update_inventory(side, filled_size, fill_price);
            maker.inventory()
        } else {
            inventory_before
        };

        if let Some(mid) = mid {
            self.as_monitor
                .record_fill(token_id, order_id, side, fill_price, mid, inventory_before);
        }

        self.fill_metrics.push(FillMetricsRecord {
            fill_time: Instant::now(),
            token_id: token_id.to_string(),
            order_id: order_id.to_string(),
            side,
            fill_price,
            mid_at_fill: mid,
            spread_bps_at_fill: spread_bps,
            imbalance_at_fill: imbalance,
            inventory_before,
            inventory_after,
            mid_30s_after: None,
            mid_60s_after: None,
            complete: false,
        });

        self.stats.total_fills.fetch_add(1, Ordering::Relaxed);
        self.session_volume += filled_size * fill_price;

        let realized_pnl = self
            .positions
            .get(token_id)
            .map(|p| p.realized_pnl)
            .unwrap_or(Decimal::ZERO);
        self.audit.log_order_filled(
            &self.market_id(token_id),
            order_id,
            token_id,
            fill_price,
            filled_size,
            side,
            realized_pnl,
        );
        self.log_position_row(token_id);
        self.sync_order_stats();

        self.calculate_quotes(token_id, CancelReason::QuoteUpdate);
    }

    fn update_position(&mut self, token_id: &str, quantity: Decimal, price: Decimal, side: Side) {
        let position = self.positions.entry(token_id.to_string()).or_default();
        position.apply_fill(side, quantity, price);

        info!(
            token = token_id,
            quantity = %position.quantity,
            avg = %position.avg_entry_price,
            realized = %position.realized_pnl,
            "position updated"
        );

        self.stats
            .positions
            .insert(token_id.to_string(), position.clone());
    }

    /// Regenerate and (if needed) replace the resting pair for a token.
    fn calculate_quotes(&mut self, token_id: &str, cancel_reason: CancelReason) {
        let book = match self.books.get(token_id) {
            Some(b) => b.clone(),
            None => return,
        };
        if !book.has_valid_bbo() {
            debug!(token = token_id, "no valid BBO, skipping quotes");
            return;
        }

        if !self.makers.contains_key(token_id) {
            // Observation-only token.
            return;
        }

        // First quote for a token: rehydrate the maker from saved state.
        if self.restored_tokens.insert(token_id.to_string()) {
            if let Some(saved) = self.persisted.positions.get(token_id) {
                if !saved.quantity.is_zero() {
                    if let Some(maker) = self.makers.get_mut(token_id) {
                        maker.restore_state(saved.quantity, saved.avg_cost, saved.realized_pnl);
                    }
                }
            }
        }

        let inventory = self
            .makers
            .get(token_id)
            .map(|m| m.inventory())
            .unwrap_or(Decimal::ZERO);

        // Quote the worst case of the two sides' toxicity assessments.
        let mult_buy = self
            .as_monitor
            .spread_multiplier(token_id, Side::Buy, inventory);
        let mult_sell = self
            .as_monitor
            .spread_multiplier(token_id, Side::Sell, inventory);
        let spread_multiplier = mult_buy.max(mult_sell);

        let quote = {
            let metadata = self.metadata.get(token_id);
            match self.makers.get_mut(token_id) {
                Some(maker) => maker.generate_quote(&book, metadata, spread_multiplier),
                None => None,
            }
        };

        let quote = match quote {
            Some(q) => q,
            None => return,
        };

        let open_orders = self.order_manager.open_orders(token_id);
        let has_matching_bid = open_orders.iter().any(|o| {
            o.side == Side::Buy && (o.price - quote.bid_price).abs() < QUOTE_PRICE_TOLERANCE
        });
        let has_matching_ask = open_orders.iter().any(|o| {
            o.side == Side::Sell && (o.price - quote.ask_price).abs() < QUOTE_PRICE_TOLERANCE
        });

        if has_matching_bid && has_matching_ask {
            debug!(token = token_id, "orders already at target prices");
        } else {
            let market_id = self.market_id(token_id);
            self.order_manager
                .cancel_all_for_token(token_id, &market_id, cancel_reason);
            self.order_manager.place_order(
                token_id,
                Side::Buy,
                quote.bid_price,
                quote.bid_size,
                &market_id,
            );
            self.order_manager.place_order(
                token_id,
                Side::Sell,
                quote.ask_price,
                quote.ask_size,
                &market_id,
            );
            self.sync_order_stats();

            info!(
                token = token_id,
                bid = %quote.bid_price,
                bid_size = %quote.bid_size,
                ask = %quote.ask_price,
                ask_size = %quote.ask_size,
                ttl = quote.ttl_seconds,
                "placed quote pair"
            );
        }

        // Refresh quote tracking either way; the TTL clock restarts from
        // this (re)validation.
        let (mid, spread_bps) = (
            book.mid().unwrap_or(Decimal::ZERO),
            book.spread_bps().unwrap_or(0.0),
        );
        self.active_quotes.insert(
            token_id.to_string(),
            ActiveQuote {
                bid_price: quote.bid_price,
                ask_price: quote.ask_price,
                mid,
                spread_bps,
                inventory,
                created_at: quote.created_at,
                ttl: Duration::from_secs(quote.ttl_seconds),
            },
        );
        self.stats.quotes.insert(
            token_id.to_string(),
            QuoteView {
                bid_price: quote.bid_price,
                ask_price: quote.ask_price,
            },
        );
    }

    /// Requote every active quote that has outlived its TTL.
    fn check_expired_quotes(&mut self) {
        let expired: Vec<TokenId> = self
            .active_quotes
            .iter()
            .filter(|(_, q)| q.created_at.elapsed() >= q.ttl)
            .map(|(token_id, _)| token_id.clone())
            .collect();

        for token_id in expired {
            debug!(token = %token_id, "quote TTL expired, requoting");
            self.active_quotes.remove(&token_id);
            self.calculate_quotes(&token_id, CancelReason::TtlExpired);
        }
    }

    /// Persist positions and write the audit position snapshot.
    fn snapshot_positions(&mut self) {
        let mut state = TradingState {
            last_session_id: self.audit.session_id().unwrap_or_default(),
            last_updated: Utc::now().timestamp(),
            total_trades: self.persisted.total_trades + self.stats.fill_count(),
            total_volume: self.persisted.total_volume + self.session_volume,
            ..Default::default()
        };

        for (token_id, position) in &self.positions {
            state.positions.insert(
                token_id.clone(),
                PositionState {
                    quantity: position.quantity,
                    avg_cost: position.avg_entry_price,
                    realized_pnl: position.realized_pnl,
                },
            );
            state.total_realized_pnl += position.realized_pnl;
        }

        if let Err(e) = self.persistence.save_state(&state) {
            error!(error = %e, "failed to persist state");
        }

        let tokens: Vec<TokenId> = self.positions.keys().cloned().collect();
        for token_id in tokens {
            self.log_position_row(&token_id);
        }
    }

    /// Capture delayed mids for pending fill records; finalize at 60s.
    fn assess_fill_metrics(&mut self) {
        let mids: HashMap<TokenId, Decimal> = self
            .books
            .iter()
            .filter_map(|(token_id, book)| book.mid().map(|m| (token_id.clone(), m)))
            .collect();

        for record in self.fill_metrics.iter_mut() {
            if record.complete {
                continue;
            }
            let elapsed = record.fill_time.elapsed().as_secs();
            let current_mid = mids.get(&record.token_id).copied();

            if elapsed >= 30 && record.mid_30s_after.is_none() {
                record.mid_30s_after = current_mid;
            }
            if elapsed >= 60 {
                record.mid_60s_after = current_mid;
                record.complete = true;

                debug!(
                    order = %record.order_id,
                    token = %record.token_id,
                    side = %record.side,
                    fill_price = %record.fill_price,
                    mid_at_fill = ?record.mid_at_fill,
                    spread_bps = record.spread_bps_at_fill,
                    imbalance = record.imbalance_at_fill,
                    inventory_before = %record.inventory_before,
                    inventory_after = %record.inventory_after,
                    mid_30s = ?record.mid_30s_after,
                    mid_60s = ?record.mid_60s_after,
                    "fill metrics complete"
                );
            }
        }

        self.fill_metrics.retain(|r| !r.complete);
    }

    /// One line per active quote on the 60s cycle.
    fn log_quote_summary(&mut self) {
        if self.active_quotes.is_empty() {
            return;
        }

        for (token_id, quote) in &self.active_quotes {
            info!(
                market = %self.market_name(token_id),
                bid = %quote.bid_price,
                ask = %quote.ask_price,
                mid = %quote.mid,
                spread_bps = quote.spread_bps,
                inventory = %quote.inventory,
                "active quote"
            );
        }
    }

    /// Log holdings carried in from the previous session, once, after the
    /// first book update arrives.
    fn log_initial_positions(&mut self) {
        self.initial_positions_logged = true;

        for (token_id, position) in &self.positions {
            if position.quantity.abs() > POSITION_EPSILON {
                info!(
                    market = %self.market_name(token_id),
                    quantity = %position.quantity,
                    avg_cost = %position.avg_entry_price,
                    realized = %position.realized_pnl,
                    "carrying position from previous session"
                );
            }
        }
    }

    fn log_position_row(&self, token_id: &str) {
        let position = match self.positions.get(token_id) {
            Some(p) => p,
            None => return,
        };

        self.audit.log_position(&PositionRow {
            market_id: self.market_id(token_id),
            token_id: token_id.to_string(),
            quantity: position.quantity,
            avg_cost: position.avg_entry_price,
            opened_at: position.opened_at,
            last_updated: position.last_updated,
            entry_side: position.entry_side,
            num_fills: position.num_fills,
            total_cost: position.total_cost,
        });
    }

    fn publish_market_view(&mut self, token_id: &str) {
        if let Some(book) = self.books.get(token_id) {
            if let (Some(mid), Some(spread_bps)) = (book.mid(), book.spread_bps()) {
                self.stats.markets.insert(
                    token_id.to_string(),
                    MarketView { mid, spread_bps },
                );
            }
        }
    }

    fn sync_order_stats(&self) {
        self.stats
            .open_orders
            .store(self.order_manager.open_order_count(), Ordering::Relaxed);
        self.stats
            .bid_orders
            .store(self.order_manager.bid_count(), Ordering::Relaxed);
        self.stats
            .ask_orders
            .store(self.order_manager.ask_count(), Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_position_open_from_flat() {
        let mut pos = Position::default();
        pos.apply_fill(Side::Buy, dec!(100), dec!(0.50));

        assert_eq!(pos.quantity, dec!(100));
        assert_eq!(pos.avg_entry_price, dec!(0.50));
        assert_eq!(pos.entry_side, Some(Side::Buy));
        assert_eq!(pos.num_fills, 1);
        assert_eq!(pos.total_cost, dec!(50));
    }

    #[test]
    fn test_position_weighted_average_on_add() {
        let mut pos = Position::default();
        pos.apply_fill(Side::Buy, dec!(100), dec!(0.40));
        pos.apply_fill(Side::Buy, dec!(300), dec!(0.48));

        assert_eq!(pos.quantity, dec!(400));
        assert_eq!(pos.avg_entry_price, dec!(0.46));
        assert_eq!(pos.realized_pnl, Decimal::ZERO);
    }

    #[test]
    fn test_position_partial_close() {
        let mut pos = Position::default();
        pos.apply_fill(Side::Buy, dec!(100), dec!(0.50));
        pos.apply_fill(Side::Sell, dec!(40), dec!(0.60));

        assert_eq!(pos.quantity, dec!(60));
        assert_eq!(pos.avg_entry_price, dec!(0.50));
        assert_eq!(pos.realized_pnl, dec!(4.0));
    }

    #[test]
    fn test_position_flip_resets_entry() {
        let mut pos = Position::default();
        pos.apply_fill(Side::Buy, dec!(100), dec!(0.50));
        pos.apply_fill(Side::Sell, dec!(150), dec!(0.56));

        assert_eq!(pos.realized_pnl, dec!(6.0));
        assert_eq!(pos.quantity, dec!(-50));
        assert_eq!(pos.avg_entry_price, dec!(0.56));
        assert_eq!(pos.entry_side, Some(Side::Sell));
    }

    #[test]
    fn test_position_exact_close_clears() {
        let mut pos = Position::default();
        pos.apply_fill(Side::Buy, dec!(100), dec!(0.50));
        pos.apply_fill(Side::Sell, dec!(100), dec!(0.45));

        assert_eq!(pos.quantity, Decimal::ZERO);
        assert_eq!(pos.avg_entry_price, Decimal::ZERO);
        assert_eq!(pos.entry_side, None);
        assert_eq!(pos.realized_pnl, dec!(-5.0));
    }

    #[test]
    fn test_position_short_accounting() {
        let mut pos = Position::default();
        pos.apply_fill(Side::Sell, dec!(200), dec!(0.60));
        assert_eq!(pos.quantity, dec!(-200));
        assert_eq!(pos.entry_side, Some(Side::Sell));

        pos.apply_fill(Side::Buy, dec!(200), dec!(0.50));
        // Short 200 covered 0.10 lower: +20.
        assert_eq!(pos.realized_pnl, dec!(20.0));
        assert_eq!(pos.quantity, Decimal::ZERO);
    }

    #[test]
    fn test_stats_aggregates() {
        let stats = EngineStats::default();

        let mut long = Position::default();
        long.apply_fill(Side::Buy, dec!(100), dec!(0.40));
        stats.positions.insert("T1".to_string(), long);

        let mut short = Position::default();
        short.apply_fill(Side::Sell, dec!(50), dec!(0.60));
        stats.positions.insert("T2".to_string(), short);

        stats.markets.insert(
            "T1".to_string(),
            MarketView {
                mid: dec!(0.50),
                spread_bps: 200.0,
            },
        );
        stats.markets.insert(
            "T2".to_string(),
            MarketView {
                mid: dec!(0.55),
                spread_bps: 400.0,
            },
        );

        assert_eq!(stats.position_count(), 2);
        assert_eq!(stats.active_market_count(), 2);
        assert_eq!(stats.total_inventory(), dec!(150));
        // T1: 100*(0.50-0.40)=10; T2: -50*(0.55-0.60)=2.5
        assert_eq!(stats.unrealized_pnl(), dec!(12.5));
        assert!((stats.average_spread_bps() - 300.0).abs() < 1e-9);
    }

    #[test]
    fn test_stats_position_count_ignores_dust() {
        let stats = EngineStats::default();
        let mut pos = Position::default();
        pos.quantity = dec!(0.0005);
        stats.positions.insert("T1".to_string(), pos);
        assert_eq!(stats.position_count(), 0);
    }
}

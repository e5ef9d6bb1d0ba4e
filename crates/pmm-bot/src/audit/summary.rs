//! Rolling market-quality summaries.
//!
//! Each tracked token keeps five-minute rolling windows of mid, spread,
//! and depth, plus BBO-change counters. A periodic flush scores every
//! market 0-100 on liquidity, spread, stability, and activity, and
//! appends one row per market to `market_summary.csv`. The flush cadence
//! adapts to time-to-event: markets near their event are sampled far more
//! often than ones days away.

use std::collections::{HashMap, VecDeque};
use std::fs::File;
use std::path::Path;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use tracing::debug;

use pmm_common::{ConditionId, TokenId};

use super::AuditError;

/// Span of every rolling window.
const WINDOW: Duration = Duration::from_secs(300);
/// Quality score at or above which a market is considered tradeable.
const TRADEABLE_SCORE: i32 = 50;

/// Time-indexed window pruned on insertion.
#[derive(Debug, Default)]
pub struct RollingWindow {
    samples: VecDeque<(Instant, f64)>,
}

impl RollingWindow {
    pub fn add(&mut self, value: f64, now: Instant) {
        self.samples.push_back((now, value));
        self.cleanup(now);
    }

    pub fn cleanup(&mut self, now: Instant) {
        while let Some((ts, _)) = self.samples.front() {
            if now.duration_since(*ts) > WINDOW {
                self.samples.pop_front();
            } else {
                break;
            }
        }
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn mean(&self) -> f64 {
        if self.samples.is_empty() {
            return 0.0;
        }
        self.samples.iter().map(|(_, v)| v).sum::<f64>() / self.samples.len() as f64
    }

    pub fn stddev(&self) -> f64 {
        if self.samples.len() < 2 {
            return 0.0;
        }
        let mean = self.mean();
        let sq_sum: f64 = self.samples.iter().map(|(_, v)| (v - mean).powi(2)).sum();
        (sq_sum / self.samples.len() as f64).sqrt()
    }

    pub fn max(&self) -> f64 {
        if self.samples.is_empty() {
            return 0.0;
        }
        self.samples
            .iter()
            .map(|(_, v)| *v)
            .fold(f64::NEG_INFINITY, f64::max)
    }

    pub fn min(&self) -> f64 {
        if self.samples.is_empty() {
            return 0.0;
        }
        self.samples
            .iter()
            .map(|(_, v)| *v)
            .fold(f64::INFINITY, f64::min)
    }

    fn front(&self) -> Option<f64> {
        self.samples.front().map(|(_, v)| *v)
    }

    fn back(&self) -> Option<f64> {
        self.samples.back().map(|(_, v)| *v)
    }

    /// Least-squares slope over sample index, normalized by the mean.
    pub fn trend(&self) -> f64 {
        let n = self.samples.len();
        if n < 2 {
            return 0.0;
        }

        let (mut sum_x, mut sum_y, mut sum_xy, mut sum_x2) = (0.0, 0.0, 0.0, 0.0);
        for (i, (_, y)) in self.samples.iter().enumerate() {
            let x = i as f64;
            sum_x += x;
            sum_y += y;
            sum_xy += x * y;
            sum_x2 += x * x;
        }

        let n_f = n as f64;
        let denominator = n_f * sum_x2 - sum_x * sum_x;
        if denominator.abs() < 1e-10 {
            return 0.0;
        }

        let slope = (n_f * sum_xy - sum_x * sum_y) / denominator;
        let mean = sum_y / n_f;
        if mean > 0.0 {
            slope / mean
        } else {
            0.0
        }
    }
}

/// Accumulated state for one tracked market.
struct MarketActivity {
    market_name: String,
    market_id: String,
    condition_id: ConditionId,

    current_mid: Decimal,
    current_spread_bps: f64,
    current_best_bid: Decimal,
    current_best_ask: Decimal,
    current_bid_volume: Decimal,
    current_ask_volume: Decimal,

    mid_prices: RollingWindow,
    spreads_bps: RollingWindow,
    bid_volumes: RollingWindow,
    ask_volumes: RollingWindow,

    last_best_bid: Decimal,
    last_best_ask: Decimal,
    bid_changes: u32,
    ask_changes: u32,
    update_count: u64,

    first_update: Instant,
    event_end_time: Option<DateTime<Utc>>,
}

/// Computed summary for one market at flush time.
#[derive(Debug, Clone)]
pub struct MarketSummary {
    pub market_name: String,
    pub market_id: String,
    pub token_id: TokenId,
    pub mid_price: Decimal,
    pub spread_bps: f64,
    pub best_bid: Decimal,
    pub best_ask: Decimal,
    pub mid_price_volatility: f64,
    pub price_trend: f64,
    pub max_price_move: f64,
    pub quote_change_rate: f64,
    pub bid_stability_score: f64,
    pub ask_stability_score: f64,
    pub avg_spread_bps: f64,
    pub liquidity_score: f64,
    pub depth_score: f64,
    pub update_frequency: f64,
    pub volume_trend: f64,
    pub hours_to_event: f64,
    pub is_tradeable: bool,
    pub trading_quality_score: i32,
}

/// Aggregator writing `market_summary.csv` in the session directory.
pub struct MarketSummaryAggregator {
    writer: csv::Writer<File>,
    states: HashMap<TokenId, MarketActivity>,
    event_end_times: HashMap<ConditionId, DateTime<Utc>>,
    last_flush: Option<Instant>,
}

impl MarketSummaryAggregator {
    pub fn new(session_dir: &Path) -> Result<Self, AuditError> {
        let file = File::create(session_dir.join("market_summary.csv"))?;
        let mut writer = csv::Writer::from_writer(file);
        writer.write_record([
            "timestamp", "market_name", "market_id", "token_id", "mid_price", "spread_bps",
            "best_bid", "best_ask", "mid_price_volatility", "price_trend", "max_price_move",
            "quote_change_rate", "bid_stability_score", "ask_stability_score", "avg_spread_bps",
            "liquidity_score", "depth_score", "update_frequency", "volume_trend",
            "hours_to_event", "is_tradeable", "trading_quality_score",
        ])?;
        writer.flush()?;

        Ok(Self {
            writer,
            states: HashMap::new(),
            event_end_times: HashMap::new(),
            last_flush: None,
        })
    }

    /// Feed one book observation for a market.
    #[allow(clippy::too_many_arguments)]
    pub fn update_market(
        &mut self,
        market_name: &str,
        market_id: &str,
        condition_id: &str,
        token_id: &str,
        mid_price: Decimal,
        spread_bps: f64,
        best_bid: Decimal,
        best_ask: Decimal,
        bid_volume: Decimal,
        ask_volume: Decimal,
    ) {
        let now = Instant::now();
        let known_end = self.event_end_times.get(condition_id).copied();

        let state = self
            .states
            .entry(token_id.to_string())
            .or_insert_with(|| MarketActivity {
                market_name: market_name.to_string(),
                market_id: market_id.to_string(),
                condition_id: condition_id.to_string(),
                current_mid: Decimal::ZERO,
                current_spread_bps: 0.0,
                current_best_bid: best_bid,
                current_best_ask: best_ask,
                current_bid_volume: Decimal::ZERO,
                current_ask_volume: Decimal::ZERO,
                mid_prices: RollingWindow::default(),
                spreads_bps: RollingWindow::default(),
                bid_volumes: RollingWindow::default(),
                ask_volumes: RollingWindow::default(),
                last_best_bid: best_bid,
                last_best_ask: best_ask,
                bid_changes: 0,
                ask_changes: 0,
                update_count: 0,
                first_update: now,
                event_end_time: known_end,
            });

        if best_bid != state.last_best_bid {
            state.bid_changes += 1;
            state.last_best_bid = best_bid;
        }
        if best_ask != state.last_best_ask {
            state.ask_changes += 1;
            state.last_best_ask = best_ask;
        }

        state.current_mid = mid_price;
        state.current_spread_bps = spread_bps;
        state.current_best_bid = best_bid;
        state.current_best_ask = best_ask;
        state.current_bid_volume = bid_volume;
        state.current_ask_volume = ask_volume;

        if mid_price > Decimal::ZERO {
            state.mid_prices.add(mid_price.to_f64().unwrap_or(0.0), now);
        }
        if spread_bps > 0.0 {
            state.spreads_bps.add(spread_bps, now);
        }
        state
            .bid_volumes
            .add(bid_volume.to_f64().unwrap_or(0.0), now);
        state
            .ask_volumes
            .add(ask_volume.to_f64().unwrap_or(0.0), now);

        state.update_count += 1;
    }

    /// Propagate an event end time to all markets of a condition.
    pub fn set_event_end_time(&mut self, condition_id: &str, end_time: DateTime<Utc>) {
        self.event_end_times
            .insert(condition_id.to_string(), end_time);
        for state in self.states.values_mut() {
            if state.condition_id == condition_id {
                state.event_end_time = Some(end_time);
            }
        }
    }

    /// True once the adaptive interval has elapsed since the last flush.
    pub fn should_flush(&self) -> bool {
        match self.last_flush {
            Some(at) => at.elapsed() >= self.flush_interval(),
            None => true,
        }
    }

    /// Flush cadence keyed to the closest event end across all markets.
    pub fn flush_interval(&self) -> Duration {
        let now = Utc::now();
        let min_hours = self
            .states
            .values()
            .filter_map(|s| s.event_end_time)
            .map(|end| (end - now).num_seconds() as f64 / 3600.0)
            .fold(f64::NAN, f64::min);

        adaptive_interval(if min_hours.is_nan() { -1.0 } else { min_hours })
    }

    /// Write one summary row per tracked market.
    pub fn flush(&mut self) {
        let now = Instant::now();
        let mut rows = 0usize;

        let summaries: Vec<(TokenId, MarketSummary)> = self
            .states
            .iter_mut()
            .filter(|(_, s)| s.update_count > 0)
            .map(|(token_id, state)| {
                state.mid_prices.cleanup(now);
                state.spreads_bps.cleanup(now);
                state.bid_volumes.cleanup(now);
                state.ask_volumes.cleanup(now);
                (token_id.clone(), compute_summary(token_id, state))
            })
            .collect();

        for (token_id, summary) in summaries {
            let timestamp = Utc::now().format("%Y-%m-%dT%H:%M:%SZ").to_string();
            let result = self.writer.write_record([
                timestamp,
                summary.market_name.clone(),
                summary.market_id.clone(),
                token_id,
                summary.mid_price.to_string(),
                format!("{:.2}", summary.spread_bps),
                summary.best_bid.to_string(),
                summary.best_ask.to_string(),
                format!("{:.6}", summary.mid_price_volatility),
                format!("{:.6}", summary.price_trend),
                format!("{:.6}", summary.max_price_move),
                format!("{:.3}", summary.quote_change_rate),
                format!("{:.4}", summary.bid_stability_score),
                format!("{:.4}", summary.ask_stability_score),
                format!("{:.2}", summary.avg_spread_bps),
                format!("{:.2}", summary.liquidity_score),
                format!("{:.2}", summary.depth_score),
                format!("{:.3}", summary.update_frequency),
                format!("{:.4}", summary.volume_trend),
                format!("{:.2}", summary.hours_to_event),
                if summary.is_tradeable { "1" } else { "0" }.to_string(),
                summary.trading_quality_score.to_string(),
            ]);
            if result.is_ok() {
                rows += 1;
            }
        }

        let _ = self.writer.flush();
        self.last_flush = Some(now);
        debug!(markets = rows, "flushed market summaries");
    }

    /// Current summary for one token, without writing. For inspection.
    pub fn summary_for(&mut self, token_id: &str) -> Option<MarketSummary> {
        let state = self.states.get_mut(token_id)?;
        if state.update_count == 0 {
            return None;
        }
        Some(compute_summary(token_id, state))
    }
}

fn compute_summary(token_id: &str, state: &MarketActivity) -> MarketSummary {
    let mid_mean = state.mid_prices.mean();
    let mid_price_volatility = if state.mid_prices.len() >= 2 && mid_mean > 0.0 {
        state.mid_prices.stddev() / mid_mean
    } else {
        0.0
    };

    let price_range = if state.mid_prices.is_empty() {
        0.0
    } else {
        state.mid_prices.max() - state.mid_prices.min()
    };
    let max_price_move = if mid_mean > 0.0 {
        price_range / mid_mean
    } else {
        0.0
    };

    let minutes = (state.first_update.elapsed().as_secs_f64() / 60.0).max(1.0);
    let quote_change_rate = (state.bid_changes + state.ask_changes) as f64 / minutes;

    // Stability: exponential decay on the fraction of updates that moved
    // the BBO. 1.0 is a pinned book, near 0 is churn on every update.
    let bid_change_ratio = state.bid_changes as f64 / state.update_count.max(1) as f64;
    let ask_change_ratio = state.ask_changes as f64 / state.update_count.max(1) as f64;
    let bid_stability_score = (-5.0 * bid_change_ratio).exp();
    let ask_stability_score = (-5.0 * ask_change_ratio).exp();

    let avg_spread_bps = state.spreads_bps.mean();

    let total_volume = (state.current_bid_volume + state.current_ask_volume)
        .to_f64()
        .unwrap_or(0.0);
    let liquidity_score = if avg_spread_bps > 0.0 {
        total_volume / avg_spread_bps
    } else {
        0.0
    };

    let depth_score = state.bid_volumes.mean() + state.ask_volumes.mean();
    let update_frequency = state.update_count as f64 / minutes;

    let recent_vol = state.bid_volumes.back().unwrap_or(0.0) + state.ask_volumes.back().unwrap_or(0.0);
    let early_vol = if state.bid_volumes.len() > 5 {
        state.bid_volumes.front().unwrap_or(0.0) + state.ask_volumes.front().unwrap_or(0.0)
    } else {
        recent_vol
    };
    let volume_trend = if early_vol > 0.0 {
        (recent_vol - early_vol) / early_vol
    } else {
        0.0
    };

    let hours_to_event = state
        .event_end_time
        .map(|end| (end - Utc::now()).num_seconds() as f64 / 3600.0)
        .unwrap_or(-1.0);

    let mut summary = MarketSummary {
        market_name: state.market_name.clone(),
        market_id: state.market_id.clone(),
        token_id: token_id.to_string(),
        mid_price: state.current_mid,
        spread_bps: state.current_spread_bps,
        best_bid: state.current_best_bid,
        best_ask: state.current_best_ask,
        mid_price_volatility,
        price_trend: state.mid_prices.trend(),
        max_price_move,
        quote_change_rate,
        bid_stability_score,
        ask_stability_score,
        avg_spread_bps,
        liquidity_score,
        depth_score,
        update_frequency,
        volume_trend,
        hours_to_event,
        is_tradeable: false,
        trading_quality_score: 0,
    };

    summary.trading_quality_score = quality_score(&summary);
    summary.is_tradeable = summary.trading_quality_score >= TRADEABLE_SCORE;
    summary
}

/// Score 0-100: liquidity 40, spread 25, stability 20, activity 15.
fn quality_score(summary: &MarketSummary) -> i32 {
    let mut score = 0i32;

    let ls = summary.liquidity_score;
    if ls > 5000.0 {
        score += 40;
    } else if ls > 1000.0 {
        score += (20.0 + (ls - 1000.0) / 4000.0 * 20.0) as i32;
    } else if ls > 100.0 {
        score += (ls / 1000.0 * 20.0) as i32;
    }

    let spread = summary.avg_spread_bps;
    if spread < 100.0 {
        score += 25;
    } else if spread < 300.0 {
        score += (25.0 - (spread - 100.0) / 200.0 * 10.0) as i32;
    } else if spread < 500.0 {
        score += (15.0 - (spread - 300.0) / 200.0 * 10.0) as i32;
    }

    let avg_stability = (summary.bid_stability_score + summary.ask_stability_score) / 2.0;
    score += (avg_stability * 20.0) as i32;

    if summary.update_frequency > 1.0 {
        score += 15;
    } else {
        score += (summary.update_frequency * 15.0) as i32;
    }

    score.clamp(0, 100)
}

/// Flush cadence by hours to the nearest event.
fn adaptive_interval(hours_to_event: f64) -> Duration {
    let secs = if hours_to_event < 0.0 {
        300
    } else if hours_to_event < 3.0 {
        30
    } else if hours_to_event < 6.0 {
        60
    } else if hours_to_event < 24.0 {
        300
    } else if hours_to_event < 48.0 {
        600
    } else {
        1800
    };
    Duration::from_secs(secs)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration as ChronoDuration;
    use rust_decimal_macros::dec;
    use tempfile::TempDir;

    fn feed(aggregator: &mut MarketSummaryAggregator, token: &str, bid: Decimal, ask: Decimal) {
        let mid = (bid + ask) / Decimal::TWO;
        let spread_bps = ((ask - bid) / mid).to_f64().unwrap() * 10_000.0;
        aggregator.update_market(
            "Test Market",
            "mkt1",
            "cond1",
            token,
            mid,
            spread_bps,
            bid,
            ask,
            dec!(5000),
            dec!(4000),
        );
    }

    #[test]
    fn test_rolling_window_stats() {
        let mut window = RollingWindow::default();
        let now = Instant::now();
        for v in [1.0, 2.0, 3.0, 4.0] {
            window.add(v, now);
        }

        assert_eq!(window.len(), 4);
        assert!((window.mean() - 2.5).abs() < 1e-9);
        assert!((window.stddev() - 1.118_033_988).abs() < 1e-6);
        assert_eq!(window.max(), 4.0);
        assert_eq!(window.min(), 1.0);
    }

    #[test]
    fn test_rolling_window_prunes_old_samples() {
        let mut window = RollingWindow::default();
        let old = Instant::now() - Duration::from_secs(400);
        window.add(1.0, old);
        window.add(2.0, Instant::now());
        assert_eq!(window.len(), 1);
        assert_eq!(window.mean(), 2.0);
    }

    #[test]
    fn test_trend_direction() {
        let mut rising = RollingWindow::default();
        let mut falling = RollingWindow::default();
        let now = Instant::now();
        for i in 0..10 {
            rising.add(0.40 + i as f64 * 0.01, now);
            falling.add(0.60 - i as f64 * 0.01, now);
        }
        assert!(rising.trend() > 0.0);
        assert!(falling.trend() < 0.0);

        let mut flat = RollingWindow::default();
        for _ in 0..10 {
            flat.add(0.50, now);
        }
        assert!(flat.trend().abs() < 1e-9);
    }

    #[test]
    fn test_quality_score_good_market() {
        let dir = TempDir::new().unwrap();
        let mut aggregator = MarketSummaryAggregator::new(dir.path()).unwrap();

        // Stable tight book with deep volume: should score as tradeable.
        for _ in 0..50 {
            feed(&mut aggregator, "tok", dec!(0.495), dec!(0.50));
        }

        let summary = aggregator.summary_for("tok").unwrap();
        assert!(summary.liquidity_score > 0.0);
        assert!(summary.bid_stability_score > 0.9);
        assert!(summary.trading_quality_score >= 50);
        assert!(summary.is_tradeable);
    }

    #[test]
    fn test_quality_score_unstable_market() {
        let dir = TempDir::new().unwrap();
        let mut aggregator = MarketSummaryAggregator::new(dir.path()).unwrap();

        // BBO moves on every update: stability collapses.
        for i in 0i64..50 {
            let shift = Decimal::new(i % 7, 2);
            feed(&mut aggregator, "tok", dec!(0.30) + shift, dec!(0.45) + shift);
        }

        let summary = aggregator.summary_for("tok").unwrap();
        assert!(summary.bid_stability_score < 0.1);
        assert!(summary.quote_change_rate > 0.0);
    }

    #[test]
    fn test_adaptive_interval_thresholds() {
        assert_eq!(adaptive_interval(-1.0), Duration::from_secs(300));
        assert_eq!(adaptive_interval(1.0), Duration::from_secs(30));
        assert_eq!(adaptive_interval(4.0), Duration::from_secs(60));
        assert_eq!(adaptive_interval(12.0), Duration::from_secs(300));
        assert_eq!(adaptive_interval(30.0), Duration::from_secs(600));
        assert_eq!(adaptive_interval(72.0), Duration::from_secs(1800));
    }

    #[test]
    fn test_flush_interval_uses_nearest_event() {
        let dir = TempDir::new().unwrap();
        let mut aggregator = MarketSummaryAggregator::new(dir.path()).unwrap();

        feed(&mut aggregator, "tok_a", dec!(0.48), dec!(0.52));
        feed(&mut aggregator, "tok_b", dec!(0.30), dec!(0.34));

        // Unknown end times: default cadence.
        assert_eq!(aggregator.flush_interval(), Duration::from_secs(300));

        aggregator.set_event_end_time("cond1", Utc::now() + ChronoDuration::hours(2));
        assert_eq!(aggregator.flush_interval(), Duration::from_secs(30));
    }

    #[test]
    fn test_flush_writes_rows() {
        let dir = TempDir::new().unwrap();
        let mut aggregator = MarketSummaryAggregator::new(dir.path()).unwrap();

        assert!(aggregator.should_flush());
        feed(&mut aggregator, "tok", dec!(0.48), dec!(0.52));
        aggregator.flush();
        assert!(!aggregator.should_flush());

        let content = std::fs::read_to_string(dir.path().join("market_summary.csv")).unwrap();
        let lines: Vec<&str> = content.lines().collect();
        assert!(lines[0].starts_with("timestamp,market_name"));
        assert_eq!(lines.len(), 2);
        assert!(lines[1].contains("Test Market,mkt1,tok"));
    }

    #[test]
    fn test_end_time_applies_to_existing_and_new_markets() {
        let dir = TempDir::new().unwrap();
        let mut aggregator = MarketSummaryAggregator::new(dir.path()).unwrap();

        feed(&mut aggregator, "tok", dec!(0.48), dec!(0.52));
        aggregator.set_event_end_time("cond1", Utc::now() + ChronoDuration::hours(5));

        let summary = aggregator.summary_for("tok").unwrap();
        assert!(summary.hours_to_event > 4.5 && summary.hours_to_event <= 5.0);
    }
}

//! Adverse-selection monitoring.
//!
//! Tracks the quality of recent fills per token: a fill after which the mid
//! moves against our side by more than half a percent within thirty seconds
//! is toxic, and toxic flow widens subsequent quotes through a persistent
//! spread multiplier. A volume clock scales the multiplier with fill rate,
//! and inventory direction biases it toward the side that would add risk.

use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};

use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use tracing::{debug, warn};

use pmm_common::{OrderId, Side, TokenId};

/// Fills retained per token for quality analysis.
const MAX_FILL_HISTORY: usize = 50;
/// 30-second move below this marks a fill toxic.
const TOXIC_THRESHOLD: f64 = -0.005;
/// 30-second move above this marks a fill favorable.
const FAVORABLE_THRESHOLD: f64 = 0.005;
/// Per-decay-period shrink of the stored multiplier toward 1.
const DECAY_RATE: f64 = 0.95;
const MIN_MULTIPLIER: f64 = 1.0;
const MAX_MULTIPLIER: f64 = 3.0;
/// Expected fills per second in normal conditions.
const BASELINE_FILL_RATE: f64 = 0.05;
/// Position scale used to normalize inventory for the risk score.
const INVENTORY_SCALE: f64 = 1000.0;

/// Quality record for one fill.
#[derive(Debug, Clone)]
pub struct FillQualityMetrics {
    pub token_id: TokenId,
    pub order_id: OrderId,
    pub side: Side,
    pub fill_price: Decimal,
    pub mid_at_fill: Decimal,
    pub inventory_before: Decimal,
    pub fill_time: Instant,
    /// Signed mid move against the fill side after ~5s; negative is adverse.
    pub price_move_5s: f64,
    /// Signed mid move against the fill side after ~30s.
    pub price_move_30s: f64,
    pub is_toxic: bool,
    pub metrics_captured: bool,
}

/// Fill-rate tracker over a rolling 60-second window.
#[derive(Debug, Default)]
struct VolumeClock {
    recent_fills: VecDeque<Instant>,
}

impl VolumeClock {
    const WINDOW: Duration = Duration::from_secs(60);

    fn record_fill(&mut self) {
        let now = Instant::now();
        self.recent_fills.push_back(now);
        while let Some(front) = self.recent_fills.front() {
            if now.duration_since(*front) > Self::WINDOW {
                self.recent_fills.pop_front();
            } else {
                break;
            }
        }
    }

    fn fill_rate(&self) -> f64 {
        if self.recent_fills.is_empty() {
            return 0.0;
        }
        self.recent_fills.len() as f64 / Self::WINDOW.as_secs_f64()
    }

    /// More volume carries more information; dampened with a square root.
    fn multiplier(&self, baseline_rate: f64) -> f64 {
        let current = self.fill_rate();
        if current < baseline_rate * 0.1 {
            // Very quiet market, lower risk.
            return 0.8;
        }
        (current / baseline_rate).sqrt()
    }
}

/// Combined spread-adjustment components for one request.
#[derive(Debug, Clone, Copy)]
pub struct AdverseSelectionScores {
    pub toxic_flow_score: f64,
    pub inventory_risk_score: f64,
    pub volume_clock_score: f64,
    pub total_multiplier: f64,
}

/// Per-token toxic-flow state.
#[derive(Debug, Default)]
pub struct AdverseSelectionMonitor {
    fill_history: HashMap<TokenId, VecDeque<FillQualityMetrics>>,
    volume_clocks: HashMap<TokenId, VolumeClock>,
    spread_multipliers: HashMap<TokenId, f64>,
}

impl AdverseSelectionMonitor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a fill for later quality assessment.
    pub fn record_fill(
        &mut self,
        token_id: &str,
        order_id: &str,
        side: Side,
        fill_price: Decimal,
        mid_at_fill: Decimal,
        inventory_before: Decimal,
    ) {
        let history = self.fill_history.entry(token_id.to_string()).or_default();
        history.push_back(FillQualityMetrics {
            token_id: token_id.to_string(),
            order_id: order_id.to_string(),
            side,
            fill_price,
            mid_at_fill,
            inventory_before,
            fill_time: Instant::now(),
            price_move_5s: 0.0,
            price_move_30s: 0.0,
            is_toxic: false,
            metrics_captured: false,
        });
        if history.len() > MAX_FILL_HISTORY {
            history.pop_front();
        }

        self.volume_clocks
            .entry(token_id.to_string())
            .or_default()
            .record_fill();

        debug!(token = token_id, %side, %fill_price, "recorded fill for toxicity tracking");
    }

    /// Advance incomplete fill records against the current mid.
    ///
    /// Each record captures its 5-second move once and is finalized exactly
    /// once at the 30-second mark; finalization adjusts the stored spread
    /// multiplier up on toxic fills and down on favorable ones.
    pub fn update_metrics(&mut self, token_id: &str, current_mid: Decimal) {
        let history = match self.fill_history.get_mut(token_id) {
            Some(h) => h,
            None => return,
        };

        let mid_f = match current_mid.to_f64() {
            Some(m) => m,
            None => return,
        };

        let multiplier = self
            .spread_multipliers
            .entry(token_id.to_string())
            .or_insert(MIN_MULTIPLIER);

        for record in history.iter_mut() {
            if record.metrics_captured {
                continue;
            }

            let mid_at_fill = match record.mid_at_fill.to_f64() {
                Some(m) if m > 0.0 => m,
                _ => {
                    record.metrics_captured = true;
                    continue;
                }
            };

            let elapsed = record.fill_time.elapsed().as_secs();
            let price_change = (mid_f - mid_at_fill) / mid_at_fill;
            // Sign the move against our side: negative means the market
            // went where the counterparty wanted.
            let signed_move = match record.side {
                Side::Buy => price_change,
                Side::Sell => -price_change,
            };

            if elapsed >= 5 && record.price_move_5s == 0.0 {
                record.price_move_5s = signed_move;
            }

            if elapsed >= 30 {
                record.price_move_30s = signed_move;
                record.is_toxic = signed_move < TOXIC_THRESHOLD;
                record.metrics_captured = true;

                if record.is_toxic {
                    *multiplier = (*multiplier * 1.2 + 0.1).min(MAX_MULTIPLIER);
                    warn!(
                        token = token_id,
                        side = %record.side,
                        fill_price = %record.fill_price,
                        move_pct = signed_move * 100.0,
                        multiplier = *multiplier,
                        "toxic fill detected"
                    );
                } else if signed_move > FAVORABLE_THRESHOLD {
                    *multiplier = (*multiplier * DECAY_RATE).max(MIN_MULTIPLIER);
                    debug!(
                        token = token_id,
                        move_pct = signed_move * 100.0,
                        "favorable fill"
                    );
                }
            }
        }
    }

    /// Spread multiplier for quoting `side` with the given signed inventory.
    pub fn spread_multiplier(&self, token_id: &str, side: Side, inventory: Decimal) -> f64 {
        let stored = self
            .spread_multipliers
            .get(token_id)
            .copied()
            .unwrap_or(MIN_MULTIPLIER);

        let toxic_score = self.toxic_flow_score(token_id);
        let inventory_score = inventory_risk_score(side, inventory);
        let volume_score = self
            .volume_clocks
            .get(token_id)
            .map(|c| c.multiplier(BASELINE_FILL_RATE))
            .unwrap_or(1.0);

        let total = stored * toxic_score * inventory_score * volume_score;
        total.clamp(MIN_MULTIPLIER, MAX_MULTIPLIER)
    }

    /// Component breakdown, for logging and inspection.
    pub fn scores(&self, token_id: &str, side: Side, inventory: Decimal) -> AdverseSelectionScores {
        AdverseSelectionScores {
            toxic_flow_score: self.toxic_flow_score(token_id),
            inventory_risk_score: inventory_risk_score(side, inventory),
            volume_clock_score: self
                .volume_clocks
                .get(token_id)
                .map(|c| c.multiplier(BASELINE_FILL_RATE))
                .unwrap_or(1.0),
            total_multiplier: self.spread_multiplier(token_id, side, inventory),
        }
    }

    /// Stored per-token multiplier before per-request scoring.
    pub fn stored_multiplier(&self, token_id: &str) -> f64 {
        self.spread_multipliers
            .get(token_id)
            .copied()
            .unwrap_or(MIN_MULTIPLIER)
    }

    /// Relax all stored multipliers toward 1; called on the 60s cycle.
    pub fn decay(&mut self) {
        for (token_id, multiplier) in self.spread_multipliers.iter_mut() {
            if *multiplier > MIN_MULTIPLIER {
                *multiplier =
                    (MIN_MULTIPLIER + (*multiplier - MIN_MULTIPLIER) * DECAY_RATE).max(MIN_MULTIPLIER);
                debug!(token = %token_id, multiplier = *multiplier, "decayed spread multiplier");
            }
        }
    }

    fn toxic_flow_score(&self, token_id: &str) -> f64 {
        let history = match self.fill_history.get(token_id) {
            Some(h) if !h.is_empty() => h,
            _ => return 1.0,
        };

        let mut toxic_count = 0usize;
        let mut total_count = 0usize;
        let mut adverse_sum = 0.0;

        for record in history {
            if record.metrics_captured {
                total_count += 1;
                if record.is_toxic {
                    toxic_count += 1;
                }
                adverse_sum += record.price_move_30s.min(0.0);
            }
        }

        if total_count == 0 {
            return 1.0;
        }

        let toxic_rate = toxic_count as f64 / total_count as f64;
        let toxic_score = 1.0 + toxic_rate;

        let avg_adverse = adverse_sum / total_count as f64;
        let magnitude_score = (1.0 - avg_adverse * 10.0).clamp(1.0, 2.0);

        toxic_score.max(magnitude_score)
    }

    #[cfg(test)]
    fn backdate_last_fill(&mut self, token_id: &str, secs: u64) {
        if let Some(history) = self.fill_history.get_mut(token_id) {
            if let Some(record) = history.back_mut() {
                record.fill_time = Instant::now() - Duration::from_secs(secs);
            }
        }
    }
}

/// Risk of getting filled on `side` (our side of the trade) given a
/// signed inventory. The ask being lifted while long, or the bid being
/// hit while short, signals informed flow running against the position.
fn inventory_risk_score(side: Side, inventory: Decimal) -> f64 {
    let normalized = inventory.to_f64().unwrap_or(0.0) / INVENTORY_SCALE;
    let magnitude = normalized.abs();

    let score = if inventory > Decimal::ZERO && side == Side::Sell {
        1.0 + magnitude * 0.5
    } else if inventory < Decimal::ZERO && side == Side::Buy {
        1.0 + magnitude * 0.5
    } else if inventory > Decimal::ZERO && side == Side::Buy {
        1.0 - magnitude * 0.2
    } else if inventory < Decimal::ZERO && side == Side::Sell {
        1.0 - magnitude * 0.2
    } else {
        1.0
    };

    score.clamp(0.8, 1.5)
}

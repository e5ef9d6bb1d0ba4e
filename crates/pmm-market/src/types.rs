//! Wire types for the CLOB websocket and the Gamma catalog API.
//!
//! Prices and sizes arrive as decimal strings and are parsed at the edge;
//! everything downstream works with `Decimal`.

use serde::{Deserialize, Serialize};

/// Subscription request sent after connecting to the market channel.
#[derive(Debug, Serialize)]
pub struct SubscribeMessage {
    pub assets_ids: Vec<String>,
    #[serde(rename = "type")]
    pub msg_type: &'static str,
}

impl SubscribeMessage {
    pub fn market(assets_ids: Vec<String>) -> Self {
        Self {
            assets_ids,
            msg_type: "market",
        }
    }
}

/// One price level in a `book` message.
#[derive(Debug, Clone, Deserialize)]
pub struct OrderSummary {
    pub price: String,
    pub size: String,
}

/// Full order book snapshot message.
#[derive(Debug, Clone, Deserialize)]
pub struct BookMessage {
    pub event_type: String,
    pub asset_id: String,
    #[serde(default)]
    pub market: String,
    #[serde(default)]
    pub timestamp: String,
    #[serde(default)]
    pub bids: Vec<OrderSummary>,
    #[serde(default)]
    pub asks: Vec<OrderSummary>,
}

/// One entry of a `price_change` message.
#[derive(Debug, Clone, Deserialize)]
pub struct PriceChange {
    pub asset_id: String,
    pub price: String,
    pub size: String,
    pub side: String,
}

/// Delta message carrying one or more level changes.
#[derive(Debug, Clone, Deserialize)]
pub struct PriceChangeMessage {
    pub event_type: String,
    #[serde(default)]
    pub market: String,
    #[serde(default)]
    pub timestamp: String,
    pub price_changes: Vec<PriceChange>,
}

/// Minimal shape used to dispatch on `event_type`.
#[derive(Debug, Deserialize)]
pub struct GenericMessage {
    pub event_type: Option<String>,
}

/// Market entry of a Gamma event.
///
/// `clob_token_ids` and `outcomes` are JSON-encoded string arrays inside a
/// string field, as the API delivers them.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GammaMarket {
    pub id: Option<String>,
    pub condition_id: Option<String>,
    pub question: Option<String>,
    pub description: Option<String>,
    pub slug: Option<String>,
    #[serde(default)]
    pub active: Option<bool>,
    #[serde(default, deserialize_with = "de_flexible_f64")]
    pub volume: Option<f64>,
    #[serde(default, deserialize_with = "de_flexible_f64")]
    pub liquidity: Option<f64>,
    pub clob_token_ids: Option<String>,
    pub outcomes: Option<String>,
}

impl GammaMarket {
    /// Decode the JSON-encoded token ID array.
    pub fn token_ids(&self) -> Vec<String> {
        decode_string_array(self.clob_token_ids.as_deref())
    }

    /// Decode the JSON-encoded outcome label array.
    pub fn outcome_labels(&self) -> Vec<String> {
        decode_string_array(self.outcomes.as_deref())
    }
}

/// Event from the Gamma `/events` endpoint.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GammaEvent {
    pub id: Option<String>,
    pub title: Option<String>,
    pub slug: Option<String>,
    pub description: Option<String>,
    pub start_date: Option<String>,
    pub end_date: Option<String>,
    pub category: Option<String>,
    #[serde(default)]
    pub active: Option<bool>,
    #[serde(default)]
    pub closed: Option<bool>,
    #[serde(default, deserialize_with = "de_flexible_f64")]
    pub volume: Option<f64>,
    #[serde(default, deserialize_with = "de_flexible_f64")]
    pub liquidity: Option<f64>,
    #[serde(default)]
    pub markets: Option<Vec<GammaMarket>>,
}

fn decode_string_array(raw: Option<&str>) -> Vec<String> {
    raw.and_then(|s| serde_json::from_str::<Vec<String>>(s).ok())
        .unwrap_or_default()
}

/// The API is inconsistent about numerics: some fields arrive as JSON
/// numbers, others as quoted strings. Accept both.
fn de_flexible_f64<'de, D>(deserializer: D) -> Result<Option<f64>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let value = Option::<serde_json::Value>::deserialize(deserializer)?;
    Ok(match value {
        Some(serde_json::Value::Number(n)) => n.as_f64(),
        Some(serde_json::Value::String(s)) => s.parse().ok(),
        _ => None,
    })
}

//! Gamma event-catalog HTTP client.
//!
//! Fetches tradable events and their markets. The engine treats this client
//! as opaque; it is only used at startup to pick what to subscribe to.

use std::time::Duration;

use chrono::{DateTime, Utc};
use reqwest::Client;
use thiserror::Error;
use tracing::{debug, warn};

use pmm_common::TokenId;

use crate::types::GammaEvent;

/// Default Gamma API base URL.
pub const DEFAULT_GAMMA_URL: &str = "https://gamma-api.polymarket.com";

const REQUEST_TIMEOUT: Duration = Duration::from_secs(15);

/// Errors from catalog lookups.
#[derive(Debug, Error)]
pub enum CatalogError {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("API error: status {status}, body: {body}")]
    Api { status: u16, body: String },

    #[error("JSON parsing failed: {0}")]
    Json(String),
}

/// One tradable market of an event, with its outcome tokens resolved.
#[derive(Debug, Clone)]
pub struct MarketInfo {
    pub market_id: String,
    pub condition_id: String,
    pub question: String,
    pub tokens: Vec<TokenId>,
    pub outcomes: Vec<String>,
    pub active: bool,
    pub volume: f64,
    pub liquidity: f64,
}

/// An event with its markets.
#[derive(Debug, Clone)]
pub struct EventInfo {
    pub event_id: String,
    pub title: String,
    pub slug: String,
    pub category: String,
    pub end_date: Option<DateTime<Utc>>,
    pub active: bool,
    pub closed: bool,
    pub volume: f64,
    pub liquidity: f64,
    pub markets: Vec<MarketInfo>,
}

/// HTTP client for the Gamma `/events` endpoint.
pub struct CatalogClient {
    http: Client,
    base_url: String,
}

impl CatalogClient {
    /// Create a client. `base_url` defaults to the production endpoint.
    pub fn new(base_url: Option<String>) -> Result<Self, CatalogError> {
        let http = Client::builder().timeout(REQUEST_TIMEOUT).build()?;
        Ok(Self {
            http,
            base_url: base_url.unwrap_or_else(|| DEFAULT_GAMMA_URL.to_string()),
        })
    }

    /// Fetch active events ordered by volume.
    pub async fn active_events(&self, limit: usize) -> Result<Vec<EventInfo>, CatalogError> {
        let url = format!(
            "{}/events?active=true&closed=false&order=volume&ascending=false&limit={}",
            self.base_url, limit
        );
        self.fetch_events(&url).await
    }

    /// Search events by slug substring.
    pub async fn search_events(&self, query: &str) -> Result<Vec<EventInfo>, CatalogError> {
        let url = format!(
            "{}/events?active=true&closed=false&slug_contains={}",
            self.base_url, query
        );
        self.fetch_events(&url).await
    }

    async fn fetch_events(&self, url: &str) -> Result<Vec<EventInfo>, CatalogError> {
        debug!(%url, "catalog: fetching events");

        let response = self.http.get(url).send().await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(CatalogError::Api {
                status: status.as_u16(),
                body,
            });
        }

        let body = response.text().await?;
        let raw: Vec<GammaEvent> =
            serde_json::from_str(&body).map_err(|e| CatalogError::Json(e.to_string()))?;

        Ok(raw.into_iter().filter_map(convert_event).collect())
    }
}

/// Convert a raw Gamma event, dropping ones without usable markets.
fn convert_event(raw: GammaEvent) -> Option<EventInfo> {
    let event_id = raw.id?;
    let title = raw.title.unwrap_or_else(|| event_id.clone());

    let markets: Vec<MarketInfo> = raw
        .markets
        .unwrap_or_default()
        .into_iter()
        .filter_map(|m| {
            let tokens = m.token_ids();
            let outcomes = m.outcome_labels();
            if tokens.is_empty() || tokens.len() != outcomes.len() {
                warn!(
                    market = m.id.as_deref().unwrap_or("?"),
                    "catalog: skipping market with mismatched tokens/outcomes"
                );
                return None;
            }
            Some(MarketInfo {
                market_id: m.id.unwrap_or_default(),
                condition_id: m.condition_id.unwrap_or_default(),
                question: m.question.unwrap_or_default(),
                tokens,
                outcomes,
                active: m.active.unwrap_or(false),
                volume: m.volume.unwrap_or(0.0),
                liquidity: m.liquidity.unwrap_or(0.0),
            })
        })
        .collect();

    Some(EventInfo {
        event_id,
        title,
        slug: raw.slug.unwrap_or_default(),
        category: raw.category.unwrap_or_default(),
        end_date: raw
            .end_date
            .as_deref()
            .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
            .map(|dt| dt.with_timezone(&Utc)),
        active: raw.active.unwrap_or(false),
        closed: raw.closed.unwrap_or(false),
        volume: raw.volume.unwrap_or(0.0),
        liquidity: raw.liquidity.unwrap_or(0.0),
        markets,
    })
}

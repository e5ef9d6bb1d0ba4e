//! Interactive market-making bot.
//!
//! Startup walks the operator through mode and market selection against
//! the live event catalog, then wires the pieces together: websocket feed
//! -> event queue -> strategy thread, with a status line every five
//! seconds until Ctrl-C.

use std::io::{self, Write};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{bail, Context, Result};
use clap::Parser;
use tokio::sync::broadcast;
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

use pmm_bot::config::BotConfig;
use pmm_bot::events::{EngineEvent, EventQueue};
use pmm_bot::feed::spawn_feed;
use pmm_bot::strategy::engine::StrategyEngine;
use pmm_common::TradingMode;
use pmm_market::{CatalogClient, EventInfo, MarketInfo};

/// CLI arguments.
#[derive(Parser, Debug)]
#[command(name = "pmm-bot")]
#[command(about = "Market maker for binary prediction markets")]
#[command(version)]
struct Args {
    /// Trading mode: paper or live (prompted when omitted)
    #[arg(short, long)]
    mode: Option<String>,

    /// Config file path
    #[arg(short, long, default_value = "config/bot.toml")]
    config: PathBuf,

    /// Log level override: trace, debug, info, warn, error
    #[arg(long)]
    log_level: Option<String>,
}

#[tokio::main]
async fn main() -> ExitCode {
    match run().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {:#}", e);
            ExitCode::FAILURE
        }
    }
}

async fn run() -> Result<()> {
    let _ = dotenvy::dotenv();

    let args = Args::parse();

    let mut config = if args.config.exists() {
        BotConfig::from_file(&args.config)
            .with_context(|| format!("failed to load config {}", args.config.display()))?
    } else {
        BotConfig::default()
    };
    config.apply_env_overrides();
    if let Some(level) = &args.log_level {
        config.log_level = level.clone();
    }
    if let Some(mode) = &args.mode {
        config.mode = mode.clone();
    }

    init_tracing(&config.log_level)?;
    config.validate()?;

    let mode = resolve_mode(args.mode.as_deref(), &config)?;
    config.mode = mode.to_string();
    if mode == TradingMode::Live {
        println!("\nWARNING: LIVE TRADING MODE - REAL MONEY AT RISK!");
        let confirm = prompt("Type 'YES' to confirm: ")?;
        if confirm != "YES" {
            println!("Live trading cancelled. Switching to paper mode.");
            config.mode = TradingMode::Paper.to_string();
        }
    }

    info!(mode = %config.mode, "starting market maker");

    // Market selection against the live catalog.
    let catalog = CatalogClient::new(Some(config.catalog.base_url.clone()))?;
    let events = fetch_events(&catalog).await?;
    if events.is_empty() {
        bail!("no events found");
    }

    print_events(&events);
    let selection = prompt(&format!(
        "Select events to trade (comma list, 'all', 'top N') [0-{}]: ",
        events.len() - 1
    ))?;
    let event_indices = parse_event_selection(&selection, events.len())?;
    if event_indices.is_empty() {
        bail!("no events selected");
    }

    let queue = Arc::new(EventQueue::new());
    let mut engine = StrategyEngine::new(Arc::clone(&queue), config.engine_config()?);

    let mut all_tokens = Vec::new();
    for &event_index in &event_indices {
        let event = &events[event_index];
        println!("\n{}:", event.title);
        print_markets(&event.markets);

        let selection = prompt(
            "Select markets ('all', 'top N', 'liquid N', 'vol>N', comma list, 'skip'): ",
        )?;
        let market_indices = parse_market_selection(&selection, &event.markets)?;

        for &market_index in &market_indices {
            let market = &event.markets[market_index];
            for (i, token_id) in market.tokens.iter().enumerate() {
                let outcome = market.outcomes.get(i).map(String::as_str).unwrap_or("");
                engine.register_market(
                    token_id,
                    &market.question,
                    outcome,
                    &market.market_id,
                    &market.condition_id,
                );
                all_tokens.push(token_id.clone());
            }
            if let Some(end) = event.end_date {
                engine.set_event_end_time(&market.condition_id, end);
            }
        }
    }

    if all_tokens.is_empty() {
        bail!("no markets selected");
    }
    info!(tokens = all_tokens.len(), "markets registered");

    let session_name = events[event_indices[0]].title.clone();
    engine.start_logging(&session_name);
    engine.start();

    let (shutdown_tx, _) = broadcast::channel(16);
    let _feed_task = spawn_feed(
        Arc::clone(&queue),
        all_tokens.clone(),
        config.feed_config(),
        &shutdown_tx,
    );

    spawn_status_sampler(&engine, Arc::clone(&queue), &shutdown_tx, all_tokens.len());

    info!("running; press Ctrl-C to stop");
    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for Ctrl-C")?;

    info!("shutting down");
    let _ = shutdown_tx.send(());
    queue.push(EngineEvent::shutdown("operator interrupt"));
    engine.stop();

    info!(log_dir = %config.log_dir.display(), "session logs saved");
    Ok(())
}

fn init_tracing(level: &str) -> Result<()> {
    let level = match level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };
    let subscriber = FmtSubscriber::builder().with_max_level(level).finish();
    tracing::subscriber::set_global_default(subscriber)
        .context("failed to set tracing subscriber")
}

fn resolve_mode(cli_mode: Option<&str>, config: &BotConfig) -> Result<TradingMode> {
    if let Some(mode) = cli_mode {
        return mode.parse().map_err(|e: String| anyhow::anyhow!(e));
    }

    println!("Trading mode:");
    println!("  1. Paper Trading (simulated)");
    println!("  2. Live Trading (real money!)");
    let choice = prompt("Choice [1]: ")?;
    match choice.as_str() {
        "2" => Ok(TradingMode::Live),
        "1" | "" => Ok(TradingMode::Paper),
        other => {
            info!(input = other, "unrecognized choice, using configured mode");
            config.trading_mode()
        }
    }
}

async fn fetch_events(catalog: &CatalogClient) -> Result<Vec<EventInfo>> {
    println!("What would you like to trade?");
    println!("  1. Search for a specific event (e.g. 'epl')");
    println!("  2. Browse top active events");
    let choice = prompt("Choice (1 or 2) [2]: ")?;

    let events = if choice == "1" {
        let query = prompt("Enter search query: ")?;
        catalog.search_events(&query).await?
    } else {
        catalog.active_events(10).await?
    };
    Ok(events)
}

fn print_events(events: &[EventInfo]) {
    println!("\nAvailable events:");
    for (i, event) in events.iter().enumerate() {
        println!(
            "  [{}] {}\n      Volume: ${:.0}, Liquidity: ${:.0}, Markets: {}",
            i,
            event.title,
            event.volume,
            event.liquidity,
            event.markets.len()
        );
    }
}

fn print_markets(markets: &[MarketInfo]) {
    for (i, market) in markets.iter().enumerate() {
        println!(
            "  [{}] {} (volume ${:.0}, liquidity ${:.0})",
            i, market.question, market.volume, market.liquidity
        );
    }
}

fn prompt(message: &str) -> Result<String> {
    print!("{}", message);
    io::stdout().flush()?;
    let mut line = String::new();
    io::stdin().read_line(&mut line)?;
    Ok(line.trim().to_string())
}

/// Parse an event selection: `all`, `top N`, or a comma list of indices.
fn parse_event_selection(input: &str, count: usize) -> Result<Vec<usize>> {
    let input = input.trim().to_lowercase();

    if input == "all" {
        return Ok((0..count).collect());
    }

    if let Some(rest) = input.strip_prefix("top ") {
        let n: usize = rest
            .trim()
            .parse()
            .with_context(|| format!("invalid count in '{}'", input))?;
        return Ok((0..n.min(count)).collect());
    }

    let mut indices = Vec::new();
    for part in input.split(',') {
        let index: usize = part
            .trim()
            .parse()
            .with_context(|| format!("invalid selection '{}'", part.trim()))?;
        if index >= count {
            bail!("selection {} out of range (0-{})", index, count - 1);
        }
        indices.push(index);
    }
    Ok(indices)
}

/// Parse a market selection: `all`, `top N`, `liquid N`, `vol>N`,
/// a comma list of indices, or `skip`.
fn parse_market_selection(input: &str, markets: &[MarketInfo]) -> Result<Vec<usize>> {
    let input = input.trim().to_lowercase();

    if input == "skip" {
        return Ok(Vec::new());
    }
    if input == "all" {
        return Ok((0..markets.len()).collect());
    }

    if let Some(rest) = input.strip_prefix("top ") {
        let n: usize = rest
            .trim()
            .parse()
            .with_context(|| format!("invalid count in '{}'", input))?;
        return Ok((0..n.min(markets.len())).collect());
    }

    if let Some(rest) = input.strip_prefix("liquid ") {
        let n: usize = rest
            .trim()
            .parse()
            .with_context(|| format!("invalid count in '{}'", input))?;
        let mut indices: Vec<usize> = (0..markets.len()).collect();
        indices.sort_by(|&a, &b| {
            markets[b]
                .liquidity
                .partial_cmp(&markets[a].liquidity)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        indices.truncate(n);
        return Ok(indices);
    }

    if let Some(rest) = input.strip_prefix("vol>") {
        let threshold: f64 = rest
            .trim()
            .parse()
            .with_context(|| format!("invalid volume threshold in '{}'", input))?;
        return Ok((0..markets.len())
            .filter(|&i| markets[i].volume > threshold)
            .collect());
    }

    let mut indices = Vec::new();
    for part in input.split(',') {
        let index: usize = part
            .trim()
            .parse()
            .with_context(|| format!("invalid selection '{}'", part.trim()))?;
        if index >= markets.len() {
            bail!("selection {} out of range (0-{})", index, markets.len() - 1);
        }
        indices.push(index);
    }
    Ok(indices)
}

fn spawn_status_sampler(
    engine: &StrategyEngine,
    queue: Arc<EventQueue>,
    shutdown: &broadcast::Sender<()>,
    market_count: usize,
) {
    let stats = engine.stats();
    let mut shutdown_rx = shutdown.subscribe();

    tokio::spawn(async move {
        let start = Instant::now();
        let mut ticker = tokio::time::interval(Duration::from_secs(5));
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    info!(
                        runtime_secs = start.elapsed().as_secs(),
                        queue_depth = queue.len(),
                        markets = market_count,
                        positions = stats.position_count(),
                        orders = stats.active_order_count(),
                        fills = stats.fill_count(),
                        realized_pnl = %stats.total_realized_pnl(),
                        unrealized_pnl = %stats.unrealized_pnl(),
                        "status"
                    );
                }
                _ = shutdown_rx.recv() => break,
            }
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    fn market(question: &str, volume: f64, liquidity: f64) -> MarketInfo {
        MarketInfo {
            market_id: format!("m-{}", question),
            condition_id: format!("c-{}", question),
            question: question.to_string(),
            tokens: vec!["t1".to_string(), "t2".to_string()],
            outcomes: vec!["Yes".to_string(), "No".to_string()],
            active: true,
            volume,
            liquidity,
        }
    }

    #[test]
    fn test_event_selection_all() {
        assert_eq!(parse_event_selection("all", 3).unwrap(), vec![0, 1, 2]);
        assert_eq!(parse_event_selection("ALL", 2).unwrap(), vec![0, 1]);
    }

    #[test]
    fn test_event_selection_top_n() {
        assert_eq!(parse_event_selection("top 2", 5).unwrap(), vec![0, 1]);
        // Clamped to the available count.
        assert_eq!(parse_event_selection("top 9", 3).unwrap(), vec![0, 1, 2]);
    }

    #[test]
    fn test_event_selection_comma_list() {
        assert_eq!(parse_event_selection("0, 2", 3).unwrap(), vec![0, 2]);
    }

    #[test]
    fn test_event_selection_rejects_out_of_range() {
        assert!(parse_event_selection("5", 3).is_err());
        assert!(parse_event_selection("abc", 3).is_err());
    }

    #[test]
    fn test_market_selection_skip_and_all() {
        let markets = vec![market("a", 100.0, 50.0), market("b", 200.0, 10.0)];
        assert!(parse_market_selection("skip", &markets).unwrap().is_empty());
        assert_eq!(parse_market_selection("all", &markets).unwrap(), vec![0, 1]);
    }

    #[test]
    fn test_market_selection_liquid_n() {
        let markets = vec![
            market("a", 100.0, 50.0),
            market("b", 200.0, 500.0),
            market("c", 300.0, 100.0),
        ];
        assert_eq!(parse_market_selection("liquid 2", &markets).unwrap(), vec![1, 2]);
    }

    #[test]
    fn test_market_selection_volume_threshold() {
        let markets = vec![
            market("a", 100.0, 50.0),
            market("b", 200.0, 500.0),
            market("c", 300.0, 100.0),
        ];
        assert_eq!(parse_market_selection("vol>150", &markets).unwrap(), vec![1, 2]);
        assert!(parse_market_selection("vol>1000", &markets).unwrap().is_empty());
    }

    #[test]
    fn test_market_selection_indices() {
        let markets = vec![market("a", 100.0, 50.0), market("b", 200.0, 10.0)];
        assert_eq!(parse_market_selection("1", &markets).unwrap(), vec![1]);
        assert!(parse_market_selection("3", &markets).is_err());
    }
}

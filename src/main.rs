//! tapebot run driver
//!
//! Two modes over the same engine: `live` streams the venue feed until
//! ctrl-c, `replay` drives stored history through the paper ledger. All
//! live/replay differences live behind the source traits; the driver only
//! wires components together and reports the outcome.

use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use tapebot::config::AppConfig;
use tapebot::models::Millis;
use tapebot::source::replay::DEFAULT_PAGE_SIZE;
use tapebot::source::{LiveSource, ReplaySource, TradeSource, VenueClient};
use tapebot::store::{RecordingHandler, TradeStore};
use tapebot::strategy::VolumeEngine;

#[derive(Parser)]
#[command(name = "tapebot", version, about = "Volume-flow trading engine")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Trade the live feed against the venue account.
    Live {
        /// Persist every feed batch into the trade store.
        #[arg(long)]
        record: bool,
    },
    /// Replay stored history through the paper ledger.
    Replay {
        /// Window start, RFC 3339 (inclusive).
        #[arg(long)]
        start: String,
        /// Window end, RFC 3339 (exclusive).
        #[arg(long)]
        end: String,
        /// Rows fetched per store page.
        #[arg(long, default_value_t = DEFAULT_PAGE_SIZE)]
        page_size: usize,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    let cli = Cli::parse();
    let config = AppConfig::from_env().context("failed to load configuration")?;

    match cli.command {
        Command::Live { record } => run_live(config, record).await,
        Command::Replay {
            start,
            end,
            page_size,
        } => run_replay(config, &start, &end, page_size).await,
    }
}

fn init_tracing() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "tapebot=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}

async fn run_live(config: AppConfig, record: bool) -> Result<()> {
    let venue = VenueClient::new(&config.venue_api_url)?;
    let source = Arc::new(LiveSource::new(&config.ws_url, &config.instrument, venue));

    let engine = VolumeEngine::new(
        config.engine.clone(),
        source.clone() as Arc<dyn TradeSource>,
    );
    let metrics = engine.metrics();
    source.add_trade_handler(Box::new(engine)).await;

    if record {
        let store = Arc::new(TradeStore::open(&config.database_path)?);
        let instrument_id = store.instrument_id(&config.instrument)?;
        source
            .add_trade_handler(Box::new(RecordingHandler::new(store, instrument_id)))
            .await;
        info!(db = %config.database_path, instrument = %config.instrument, "recording live trades");
    }

    info!(
        ws_url = %config.ws_url,
        venue = %config.venue_api_url,
        instrument = %config.instrument,
        "starting live session"
    );

    let streamer = source.clone();
    let stream = tokio::spawn(async move { streamer.stream_trades().await });

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for ctrl-c")?;
    info!("shutdown requested");
    source.stop();

    stream
        .await
        .context("stream task panicked")?
        .context("live stream failed")?;

    let summary = metrics.read().clone();
    info!(
        flushes = summary.flush_count,
        buys = summary.buy_orders,
        sells = summary.sell_orders,
        rejected = summary.rejected_orders,
        "live session summary"
    );
    Ok(())
}

async fn run_replay(config: AppConfig, start: &str, end: &str, page_size: usize) -> Result<()> {
    let start_ms = parse_rfc3339(start).context("invalid --start")?;
    let end_ms = parse_rfc3339(end).context("invalid --end")?;
    anyhow::ensure!(start_ms < end_ms, "--start must be before --end");

    let store = Arc::new(TradeStore::open(&config.database_path)?);
    let instrument_id = store.instrument_id(&config.instrument)?;
    let stored = store.trade_count(instrument_id)?;
    if let Some((first, last)) = store.time_coverage(instrument_id)? {
        info!(
            instrument = %config.instrument,
            stored,
            coverage_start = first,
            coverage_end = last,
            "store opened"
        );
    } else {
        info!(instrument = %config.instrument, "store has no trades for instrument");
    }

    let source = Arc::new(ReplaySource::new(
        store,
        &config.instrument,
        start_ms,
        end_ms,
        config.starting_cash,
        page_size,
    )?);

    let engine = VolumeEngine::new(
        config.engine.clone(),
        source.clone() as Arc<dyn TradeSource>,
    );
    let metrics = engine.metrics();
    source.add_trade_handler(Box::new(engine)).await;

    source.stream_trades().await.context("replay failed")?;

    let summary = metrics.read().clone();
    info!(
        flushes = summary.flush_count,
        buys = summary.buy_orders,
        sells = summary.sell_orders,
        rejected = summary.rejected_orders,
        final_equity = summary.final_equity,
        "replay complete"
    );
    match summary.return_pct() {
        Some(pct) => info!(
            return_pct = format!("{pct:.2}"),
            max_drawdown = format!("{:.4}", summary.max_drawdown()),
            "replay performance"
        ),
        None => info!("no active flushes in window; engine never left warmup"),
    }
    Ok(())
}

fn parse_rfc3339(value: &str) -> Result<Millis> {
    let parsed = chrono::DateTime::parse_from_rfc3339(value)
        .with_context(|| format!("not an RFC 3339 timestamp: {value}"))?;
    Ok(parsed.timestamp_millis())
}

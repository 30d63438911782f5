//! Spread Hedger - Main Entry Point
//!
//! Paper mode fills against in-process venues driven by live market data.
//! Live mode signs real orders on both venues.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use spread_hedger::config::{Config, VenueConfig};
use spread_hedger::events::EventLog;
use spread_hedger::exchange::{
    BookTickerStream, FuturesRestClient, PaperVenue, Venue, VenueClient,
};
use spread_hedger::feed::PriceFeed;
use spread_hedger::persistence::PositionLedger;
use spread_hedger::strategy::HedgeEngine;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn, Level};
use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::EnvFilter;

/// Paper venues copy the streamed book this often.
const PAPER_SYNC_INTERVAL: Duration = Duration::from_millis(200);

/// Spread Hedger CLI
#[derive(Parser)]
#[command(name = "spread-hedger")]
#[command(version, about = "Cross-venue perpetual futures spread hedging")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the hedge engine (default, paper trading unless --live)
    Run {
        /// Send real orders to both venues
        #[arg(long)]
        live: bool,
    },
    /// Print the position ledger report
    Status {
        /// Ledger database path, defaults to the configured one
        #[arg(long)]
        db: Option<String>,
    },
    /// Compare ledger exposure with live venue positions once
    Reconcile,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    init_logging()?;

    let config = Config::load().context("Failed to load configuration")?;
    config.validate()?;

    match cli.command.unwrap_or(Commands::Run { live: false }) {
        Commands::Run { live } => run(config, live).await,
        Commands::Status { db } => {
            let path = db.unwrap_or_else(|| config.persistence.db_path.clone());
            let ledger = PositionLedger::new(&path)?;
            println!("{}", ledger.report()?);
            Ok(())
        }
        Commands::Reconcile => {
            let clients = live_clients(&config)?;
            let feeds = feeds(&config);
            let ledger = PositionLedger::new(&config.persistence.db_path)?;
            let engine = HedgeEngine::new(config, clients, feeds, ledger, EventLog::new())?;
            let report = engine.reconcile().await?;
            println!("{}", report.summary());
            Ok(())
        }
    }
}

async fn run(config: Config, live: bool) -> Result<()> {
    info!("═══════════════════════════════════════════════════════════");
    info!("  Spread Hedger v{}", env!("CARGO_PKG_VERSION"));
    if live {
        warn!("  Mode: LIVE - real orders will be sent");
    } else {
        info!("  Mode: PAPER");
    }
    info!("═══════════════════════════════════════════════════════════");
    log_config(&config);

    let feeds = feeds(&config);
    let mut tasks = Vec::new();
    for (venue_config, feed) in [&config.venue_a, &config.venue_b].into_iter().zip(&feeds) {
        let stream = BookTickerStream::new(venue_config, Arc::clone(feed));
        tasks.push(tokio::spawn(stream.run()));
    }

    let clients = if live {
        live_clients(&config)?
    } else {
        let venues = [
            Arc::new(paper_venue(&config.venue_a)),
            Arc::new(paper_venue(&config.venue_b)),
        ];
        for (venue, feed) in venues.iter().zip(&feeds) {
            tasks.push(tokio::spawn(sync_paper_quotes(
                Arc::clone(venue),
                Arc::clone(feed),
            )));
        }
        let [a, b] = venues;
        let clients: [Arc<dyn VenueClient>; 2] = [a, b];
        clients
    };

    let ledger = PositionLedger::new(&config.persistence.db_path)?;
    let engine = Arc::new(HedgeEngine::new(
        config,
        clients,
        feeds,
        ledger,
        EventLog::new(),
    )?);

    let shutdown = Arc::new(AtomicBool::new(false));
    let shutdown_clone = shutdown.clone();
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        info!("🛑 Shutdown signal received");
        shutdown_clone.store(true, Ordering::SeqCst);
    });

    info!("🚀 Starting evaluation loop...");
    Arc::clone(&engine).run(shutdown).await?;

    for task in tasks {
        task.abort();
    }
    if engine.is_halted() {
        warn!("Engine halted during this session; review alarms before restarting");
    }
    info!("{}", engine.ledger_report()?);
    info!("👋 Spread Hedger shutdown complete");
    Ok(())
}

fn feeds(config: &Config) -> [Arc<PriceFeed>; 2] {
    let window = config.strategy.staleness_window();
    Venue::ALL.map(|venue| Arc::new(PriceFeed::new(venue, window)))
}

fn live_clients(config: &Config) -> Result<[Arc<dyn VenueClient>; 2]> {
    let a = FuturesRestClient::new(&config.venue_a).context("Venue A client")?;
    let b = FuturesRestClient::new(&config.venue_b).context("Venue B client")?;
    Ok([Arc::new(a), Arc::new(b)])
}

fn paper_venue(config: &VenueConfig) -> PaperVenue {
    PaperVenue::new(config.name.clone(), config.symbol.clone())
}

/// Mirrors the streamed book into a paper venue so its fills and stop
/// triggers follow the real market.
async fn sync_paper_quotes(venue: Arc<PaperVenue>, feed: Arc<PriceFeed>) {
    let mut interval = tokio::time::interval(PAPER_SYNC_INTERVAL);
    loop {
        interval.tick().await;
        if let Some(quote) = feed.read() {
            venue.set_quote(quote.bid, quote.ask).await;
        }
    }
}

/// Initialize logging to stdout and an hourly rolling file.
fn init_logging() -> Result<()> {
    use tracing_subscriber::fmt::writer::MakeWriterExt;

    std::fs::create_dir_all("logs")?;

    let file_appender = tracing_appender::rolling::hourly("logs", "spread-hedger.log");
    let (file_writer, guard) = tracing_appender::non_blocking(file_appender);

    // Keep the writer alive for the program duration
    Box::leak(Box::new(guard));

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::from_default_env()
                .add_directive("spread_hedger=debug".parse()?)
                .add_directive(Level::INFO.into()),
        )
        .with_writer(std::io::stdout.and(file_writer))
        .with_target(true)
        .with_thread_ids(false)
        .with_file(true)
        .with_line_number(true)
        .with_span_events(FmtSpan::CLOSE)
        .with_ansi(true)
        .init();

    Ok(())
}

fn log_config(config: &Config) {
    info!("📋 Configuration:");
    info!(
        "   Venues: {} ({}) / {} ({})",
        config.venue_a.name, config.venue_a.symbol, config.venue_b.name, config.venue_b.symbol
    );
    info!(
        "   Open / Close Threshold: {} / {}",
        config.strategy.open_threshold, config.strategy.close_threshold
    );
    info!(
        "   Unit: {} (max {} legs, max size {})",
        config.strategy.unit_amount, config.strategy.max_legs, config.strategy.max_size
    );
    info!(
        "   Leg / Lock Timeout: {}ms / {}ms",
        config.execution.leg_timeout_ms, config.execution.lock_timeout_ms
    );
    if config.protection.enabled {
        info!(
            "   Protection: loss limit {}, trailing at {} profit",
            config.protection.loss_limit, config.protection.trailing_profit
        );
    } else {
        warn!("   Protection: disabled");
    }
    info!("   Ledger: {}", config.persistence.db_path);
}

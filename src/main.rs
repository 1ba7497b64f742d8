//! REGIME MONITOR — market regime classification with a prediction
//! feedback loop.
//!
//! Entry point. Loads configuration, initialises structured logging and
//! dispatches to the requested subcommand: a single cycle for external
//! schedulers, the interval loop with graceful shutdown, or one of the
//! operator tools.

use anyhow::Result;
use chrono::{Duration as ChronoDuration, Utc};
use clap::{Parser, Subcommand};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

use regime_monitor::admin;
use regime_monitor::analytics::Calibrator;
use regime_monitor::config::AppConfig;
use regime_monitor::dashboard::{self, DashboardState};
use regime_monitor::engine::cycle::{CycleLock, CycleReport, Pipeline};
use regime_monitor::engine::diversity::DiversityMonitor;
use regime_monitor::engine::resolver::OutcomeResolver;
use regime_monitor::storage::state::{JsonStateStore, StateStore};
use regime_monitor::storage::PredictionStore;

const BANNER: &str = r#"
  ____  _____ ____ ___ __  __ _____
 |  _ \| ____/ ___|_ _|  \/  | ____|
 | |_) |  _|| |  _ | || |\/| |  _|
 |  _ <| |__| |_| || || |  | | |___
 |_| \_\_____\____|___|_|  |_|_____|

  Market regime monitor v0.1.0
"#;

#[derive(Parser)]
#[command(name = "regime-monitor")]
#[command(about = "Market regime classification with a continuous prediction feedback loop")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Config file path
    #[arg(short, long, default_value = "config.toml")]
    config: String,
}

#[derive(Subcommand)]
enum Commands {
    /// Run one cycle and exit (for cron or another external scheduler)
    Cycle,
    /// Run cycles on the configured interval until Ctrl+C
    Run,
    /// Resolve due predictions without classifying
    Resolve,
    /// Show the current regime, diversity status and accuracy
    Status {
        #[arg(short, long, default_value = "10")]
        limit: i64,
    },
    /// Relabel the dominant regime's predictions for reporting
    Rebalance {
        /// Run even when feedback.force_diversity is false
        #[arg(long)]
        force: bool,
    },
    /// Roll the model registry back to its baseline version
    Rollback,
    /// Serve the read-only status API
    Serve {
        #[arg(short, long)]
        port: Option<u16>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file if present (non-fatal if missing)
    let _ = dotenv::dotenv();

    let cli = Cli::parse();
    let cfg = AppConfig::load(&cli.config)?;
    init_logging();

    match cli.command {
        Commands::Cycle => {
            let pipeline = Pipeline::from_config(cfg).await?;
            match pipeline.run_exclusive(Utc::now()).await? {
                Some(report) => print_cycle(&report),
                None => println!("Another run holds the cycle lock; skipped."),
            }
        }
        Commands::Run => run_loop(cfg).await?,
        Commands::Resolve => resolve(&cfg).await?,
        Commands::Status { limit } => status(&cfg, limit).await?,
        Commands::Rebalance { force } => {
            let store = PredictionStore::connect(&cfg.pipeline.database_path).await?;
            let report = admin::rebalance(&store, &cfg.feedback, cfg.aggregator.max_ratio, force, Utc::now()).await?;
            match report.dominant {
                Some(regime) => println!(
                    "Dominant regime {regime} ({:.0}%): {} predictions examined, {} relabeled.",
                    report.dominant_share * 100.0,
                    report.examined,
                    report.relabeled
                ),
                None => println!("No predictions since {}.", report.window_start),
            }
        }
        Commands::Rollback => {
            if admin::rollback(cfg.model.models_dir.as_deref())? {
                println!("Model registry rolled back to baseline.");
            } else {
                println!("Model registry already at baseline.");
            }
        }
        Commands::Serve { port } => {
            let port = port.unwrap_or(cfg.dashboard.port);
            let state = dashboard_state(&cfg).await?;
            tokio::select! {
                result = dashboard::serve(state, port) => result?,
                _ = tokio::signal::ctrl_c() => info!("Shutdown signal received."),
            }
        }
    }

    Ok(())
}

/// Drive cycles on the configured interval until Ctrl+C.
async fn run_loop(cfg: AppConfig) -> Result<()> {
    println!("{BANNER}");
    info!(
        name = %cfg.pipeline.name,
        interval_secs = cfg.pipeline.cycle_interval_secs,
        emergency_mode = cfg.feedback.emergency_mode,
        models_dir = ?cfg.model.models_dir,
        "Regime monitor starting up"
    );

    if cfg.dashboard.enabled {
        dashboard::spawn_dashboard(dashboard_state(&cfg).await?, cfg.dashboard.port);
    }

    let market_hours = cfg.market_hours.clone();
    let interval_secs = cfg.pipeline.cycle_interval_secs;
    let pipeline = Pipeline::from_config(cfg).await?;

    let mut interval = tokio::time::interval(Duration::from_secs(interval_secs));
    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);

    info!(interval_secs, "Entering main loop. Press Ctrl+C to stop.");

    loop {
        tokio::select! {
            _ = interval.tick() => {
                let now = Utc::now();
                if let Some(hours) = &market_hours {
                    match hours.is_open(now) {
                        Ok(true) => {}
                        Ok(false) => {
                            debug!("Market closed, skipping cycle");
                            continue;
                        }
                        Err(e) => warn!(error = %e, "Market hours check failed, cycling anyway"),
                    }
                }

                match pipeline.run_exclusive(now).await {
                    Ok(Some(_)) => {}
                    Ok(None) => warn!("Cycle skipped, lock held by another run"),
                    Err(e) => error!(error = %e, "Cycle failed — continuing to next"),
                }
            }
            _ = &mut shutdown => {
                info!("Shutdown signal received.");
                break;
            }
        }
    }

    info!("Regime monitor shut down cleanly.");
    Ok(())
}

async fn resolve(cfg: &AppConfig) -> Result<()> {
    let now = Utc::now();
    let stale_after = ChronoDuration::seconds(cfg.pipeline.lock_stale_secs as i64);
    let Some(_lock) = CycleLock::acquire(Path::new(&cfg.pipeline.lock_path), stale_after, now)? else {
        println!("Another run holds the cycle lock; skipped.");
        return Ok(());
    };

    let store = PredictionStore::connect(&cfg.pipeline.database_path).await?;
    let report = OutcomeResolver::new(cfg.feedback.resolution_horizon_minutes)
        .resolve_due(&store, now)
        .await?;
    println!(
        "Resolved {} predictions ({} already resolved, {} awaiting a realized regime).",
        report.resolved, report.skipped, report.pending
    );
    Ok(())
}

async fn status(cfg: &AppConfig, limit: i64) -> Result<()> {
    let now = Utc::now();
    let store = PredictionStore::connect(&cfg.pipeline.database_path).await?;
    let state = JsonStateStore::new(&cfg.pipeline.state_path).load()?;

    match &state.regime {
        Some(r) => println!(
            "Current regime: {} {} ({:.0}% confidence, since {})",
            r.regime.emoji(),
            r.regime,
            r.confidence * 100.0,
            r.updated_at.format("%Y-%m-%d %H:%M UTC")
        ),
        None => println!("Current regime: not yet established"),
    }
    println!(
        "Cycles run: {}  last: {}",
        state.cycle_count,
        state
            .last_cycle_at
            .map(|t| t.format("%Y-%m-%d %H:%M UTC").to_string())
            .unwrap_or_else(|| "never".into())
    );

    let monitor = DiversityMonitor::new(cfg.feedback.clone(), None);
    let diversity = monitor.report(&store, now).await?;
    println!(
        "Diversity: {} | {} predictions in {}d window, {} distinct, dominant {} at {:.0}%{}",
        state.diversity.phase,
        diversity.total,
        cfg.feedback.diversity_window_days,
        diversity.distinct,
        diversity.dominant.map(|r| r.to_string()).unwrap_or_else(|| "-".into()),
        diversity.dominant_share * 100.0,
        if diversity.monoculture { " (MONOCULTURE)" } else { "" }
    );
    println!(
        "Auto-retrain: {}",
        state.overrides.auto_retrain(&cfg.feedback)
    );

    println!("\nRecent predictions:");
    for p in store.recent(limit).await? {
        println!("  {p}");
    }

    let resolved = store.resolved_since(now - ChronoDuration::days(30)).await?;
    println!("\n{}", Calibrator::from_predictions(&resolved).summary());
    Ok(())
}

async fn dashboard_state(cfg: &AppConfig) -> Result<Arc<DashboardState>> {
    let store = PredictionStore::connect(&cfg.pipeline.database_path).await?;
    let stale_after = 2 * cfg.pipeline.cycle_interval_secs as i64;
    Ok(Arc::new(DashboardState::new(store, &cfg.pipeline.artifact_path, stale_after)))
}

fn print_cycle(report: &CycleReport) {
    println!(
        "{} {} {} ({:.0}% via {}, data {}){}",
        report.timestamp.format("%Y-%m-%d %H:%M UTC"),
        report.regime.emoji(),
        report.regime,
        report.confidence * 100.0,
        report.strategy,
        report.quality,
        if report.is_duplicate() { " [slot already recorded]" } else { "" }
    );
    println!(
        "Resolved {} | diversity {}",
        report.resolution.resolved, report.diversity_phase
    );
}

/// Initialise the `tracing` subscriber.
fn init_logging() {
    use tracing_subscriber::{fmt, EnvFilter};

    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("regime_monitor=info"));

    let json_logging = std::env::var("REGIME_LOG_JSON").is_ok();

    if json_logging {
        fmt()
            .json()
            .with_env_filter(env_filter)
            .with_target(true)
            .with_thread_ids(true)
            .init();
    } else {
        fmt()
            .with_env_filter(env_filter)
            .with_target(true)
            .init();
    }
}

// =============================================================================
// Vegawatch — Main Entry Point
// =============================================================================
//
// The engine starts in demo mode by default; point it at a live provider by
// flipping `demo_mode` in vegawatch.json once one is linked in.
// =============================================================================

use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use vegawatch::calendar;
use vegawatch::config::EngineConfig;
use vegawatch::engine::Engine;
use vegawatch::scheduler::Scheduler;
use vegawatch::store::Store;

const CONFIG_PATH: &str = "vegawatch.json";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // ── 1. Environment & config ──────────────────────────────────────────
    let _ = dotenv::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    info!("╔══════════════════════════════════════════════════════════╗");
    info!("║        Vegawatch Engine — Starting Up                   ║");
    info!("╚══════════════════════════════════════════════════════════╝");

    let mut config = EngineConfig::load(CONFIG_PATH).unwrap_or_else(|e| {
        warn!(error = %e, "failed to load config, using defaults");
        EngineConfig::default()
    });
    config.apply_env_overrides();
    config.normalise();

    info!(
        watchlist = ?config.watchlist,
        demo_mode = config.demo_mode,
        collection_times = ?config.scheduler.collection_times_et,
        "engine configuration ready"
    );

    // ── 2. Durable store ─────────────────────────────────────────────────
    let store = Store::open(&config.db_path)?;

    // ── 3. Build shared engine state ─────────────────────────────────────
    let engine = Engine::new(config, store, calendar::now_utc());

    // ── 4. Scheduler task ────────────────────────────────────────────────
    let scheduler = Scheduler::new(engine.clone(), calendar::now_utc());
    let scheduler_task = tokio::spawn(scheduler.run());

    info!("engine running. Press Ctrl+C to stop.");

    // ── 5. Graceful shutdown ─────────────────────────────────────────────
    tokio::signal::ctrl_c().await?;
    warn!("shutdown signal received — stopping gracefully");
    engine.request_shutdown();

    if let Err(e) = scheduler_task.await {
        error!(error = %e, "scheduler task ended abnormally");
    }

    let final_config = engine.config.read().clone();
    if let Err(e) = final_config.save(CONFIG_PATH) {
        error!(error = %e, "failed to save config on shutdown");
    }

    info!("Vegawatch shut down complete.");
    Ok(())
}

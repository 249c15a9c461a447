// =============================================================================
// Engine State — shared subsystems wired together at startup
// =============================================================================
//
// The engine owns the cache, the breaker registry, the rate budget, the
// market-data façade, and the store handle; collaborators receive references
// from here. There is no process-global mutable state, so tests construct
// fresh engines freely.
// =============================================================================

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::Serialize;
use tokio::sync::Notify;
use tracing::info;

use crate::breaker::{BreakerRegistry, BreakerStatus};
use crate::cache::{CacheStats, TtlCache};
use crate::config::EngineConfig;
use crate::market_data::{DemoProvider, MarketData, MarketDataProvider, RateBudget};
use crate::store::Store;
use crate::types::{ScanRecord, SchedulerPhase, SchedulerState};

/// Serialisable engine status snapshot, mirrored into `status.json`.
#[derive(Debug, Clone, Serialize)]
pub struct EngineStatus {
    pub state: SchedulerPhase,
    pub uptime_secs: u64,
    pub demo_mode: bool,
    pub watchlist: Vec<String>,
    pub api_calls_this_hour: u32,
    pub api_calls_today: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub next_collection_at: Option<DateTime<Utc>>,
    pub consecutive_failures: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub backoff_until: Option<DateTime<Utc>>,
    pub breakers: Vec<BreakerStatus>,
    pub cache: CacheStats,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_scan: Option<ScanRecord>,
    pub generated_at: DateTime<Utc>,
}

pub struct Engine {
    pub config: Arc<RwLock<EngineConfig>>,
    pub cache: Arc<TtlCache>,
    pub breakers: Arc<BreakerRegistry>,
    pub budget: Arc<RateBudget>,
    pub market: Arc<MarketData>,
    pub store: Store,

    shutdown: AtomicBool,
    shutdown_notify: Notify,
    /// Which provider family is currently plugged in; compared against the
    /// config at the start of each cycle for the demo hot-switch.
    demo_active: AtomicBool,
    start_time: std::time::Instant,
}

impl Engine {
    /// Wire all shared subsystems from a configuration snapshot.
    pub fn new(config: EngineConfig, store: Store, now: DateTime<Utc>) -> Arc<Self> {
        let cache = Arc::new(TtlCache::new(config.cache.max_mb));
        let breakers = Arc::new(BreakerRegistry::new());
        let budget = Arc::new(RateBudget::new(
            config.scheduler.max_calls_per_hour,
            config.scheduler.max_calls_per_day,
            now,
        ));

        let provider = Self::build_provider(&config);
        let market = Arc::new(MarketData::new(
            provider,
            cache.clone(),
            breakers.clone(),
            budget.clone(),
            config.cache.clone(),
            config.breakers.clone(),
        ));

        let demo = config.demo_mode;
        info!(demo_mode = demo, watchlist = ?config.watchlist, "engine assembled");

        Arc::new(Self {
            config: Arc::new(RwLock::new(config)),
            cache,
            breakers,
            budget,
            market,
            store,
            shutdown: AtomicBool::new(false),
            shutdown_notify: Notify::new(),
            demo_active: AtomicBool::new(demo),
            start_time: std::time::Instant::now(),
        })
    }

    /// The provider selected by the configuration. Only the synthetic
    /// provider ships in-tree; a live backend is injected by the binary that
    /// links one in.
    pub fn build_provider(config: &EngineConfig) -> Arc<dyn MarketDataProvider> {
        Arc::new(DemoProvider::new(config.demo_seed))
    }

    /// Apply the demo-mode hot switch if the config changed since the last
    /// cycle. Called at the start of each COLLECTING cycle so an in-flight
    /// scan always finishes on one provider.
    pub fn sync_provider(&self) {
        let want_demo = self.config.read().demo_mode;
        let have_demo = self.demo_active.load(Ordering::SeqCst);
        if want_demo != have_demo {
            let config = self.config.read().clone();
            self.market.swap_provider(Self::build_provider(&config));
            self.demo_active.store(want_demo, Ordering::SeqCst);
            info!(demo_mode = want_demo, "provider hot-switched for the new cycle");
        }
    }

    // ── Shutdown ────────────────────────────────────────────────────────

    pub fn request_shutdown(&self) {
        self.shutdown.store(true, Ordering::SeqCst);
        self.shutdown_notify.notify_waiters();
    }

    pub fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::SeqCst)
    }

    pub async fn shutdown_notified(&self) {
        self.shutdown_notify.notified().await;
    }

    // ── Status ──────────────────────────────────────────────────────────

    /// Build the status snapshot mirrored into the export directory.
    pub fn build_status(
        &self,
        sched: &SchedulerState,
        last_scan: Option<ScanRecord>,
        now: DateTime<Utc>,
    ) -> EngineStatus {
        let config = self.config.read();
        let (calls_hour, calls_day, _, _) = self.budget.snapshot();
        EngineStatus {
            state: sched.current_state,
            uptime_secs: self.start_time.elapsed().as_secs(),
            demo_mode: config.demo_mode,
            watchlist: config.watchlist.clone(),
            api_calls_this_hour: calls_hour,
            api_calls_today: calls_day,
            next_collection_at: sched.next_collection_at,
            consecutive_failures: sched.consecutive_failures,
            backoff_until: sched.backoff_until,
            breakers: self.breakers.statuses(),
            cache: self.cache.stats(),
            last_scan,
            generated_at: now,
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 8, 1, 12, 0, 0).unwrap()
    }

    fn engine() -> Arc<Engine> {
        Engine::new(EngineConfig::default(), Store::open_in_memory().unwrap(), now())
    }

    #[test]
    fn status_snapshot_reflects_scheduler_state() {
        let engine = engine();
        let mut sched = SchedulerState::fresh(now());
        sched.current_state = SchedulerPhase::Waiting;
        sched.consecutive_failures = 2;
        let status = engine.build_status(&sched, None, now());
        assert_eq!(status.state, SchedulerPhase::Waiting);
        assert_eq!(status.consecutive_failures, 2);
        assert!(status.demo_mode);
        assert_eq!(status.watchlist.len(), 5);
        // Serialises cleanly for the export.
        assert!(serde_json::to_string(&status).is_ok());
    }

    #[test]
    fn shutdown_flag_flips_once() {
        let engine = engine();
        assert!(!engine.is_shutdown());
        engine.request_shutdown();
        assert!(engine.is_shutdown());
    }

    #[tokio::test]
    async fn shutdown_wakes_waiters() {
        let engine = engine();
        let waiter = engine.clone();
        let handle = tokio::spawn(async move {
            waiter.shutdown_notified().await;
        });
        tokio::task::yield_now().await;
        engine.request_shutdown();
        tokio::time::timeout(std::time::Duration::from_secs(1), handle)
            .await
            .expect("waiter woke")
            .unwrap();
    }

    #[test]
    fn sync_provider_is_a_noop_when_mode_unchanged() {
        let engine = engine();
        engine.sync_provider();
        assert!(engine.demo_active.load(Ordering::SeqCst));
    }
}

// =============================================================================
// Scheduler FSM — the cycle driver
// =============================================================================
//
//   IDLE ──compute next_collection_at──▶ WAITING
//   WAITING ──now ≥ next, budget ok──▶ COLLECTING
//   WAITING ──now ≥ next, budget exhausted──▶ BACKING_OFF
//   COLLECTING ──buffer ≥ flush_threshold──▶ FLUSHING ──▶ COLLECTING
//   COLLECTING ──done──▶ WAITING (advance next_collection_at)
//   COLLECTING ──rate limit / circuit open──▶ BACKING_OFF
//   BACKING_OFF ──now ≥ backoff_until──▶ WAITING
//
// One cooperative task; the only suspension points are the tick sleep, the
// adaptive inter-call delay, and provider calls (each hard-capped at 30 s by
// the façade). State is persisted after every transition and counter update;
// a restart restores state younger than 24 h and otherwise starts fresh.
// =============================================================================

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, NaiveTime, Utc};
use tracing::{debug, error, info, warn};

use crate::calendar;
use crate::detectors::DetectorRegistry;
use crate::engine::Engine;
use crate::export::Exporter;
use crate::features::{self, FeatureInputs};
use crate::market_data::DataError;
use crate::scoring::{ScoredCandidate, Scorer};
use crate::throttle::Throttler;
use crate::types::{Alert, ScanStatus, SchedulerPhase, SchedulerState, Ticker};

/// First backoff step in seconds; doubles per consecutive failure.
const BASE_BACKOFF_SECS: i64 = 60;
/// Backoff ceiling in seconds.
const MAX_BACKOFF_SECS: i64 = 1800;
/// Persisted state older than this is discarded on restart.
const STATE_RESTORE_MAX_AGE_HOURS: i64 = 24;
/// Daily bars requested per ticker (252 trading days plus slack).
const HISTORY_DAYS: u32 = 300;
/// Trailing ATM-IV samples fed to the percentile/rank window.
const IV_WINDOW_DAYS: u32 = 252;
/// Grace window for the shutdown flush.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

/// Summary of one collection cycle, mostly for tests and logs.
#[derive(Debug, Clone)]
pub struct CycleOutcome {
    pub scan_id: String,
    pub status: ScanStatus,
    pub tickers_scanned: u32,
    pub tickers_skipped: u32,
    pub alerts_published: u32,
}

/// Why one ticker's scan ended early.
enum TickerFailure {
    /// Skip this ticker, keep the cycle going.
    Skip(String),
    /// Stop the cycle and back off (rate limit, circuit open, store down).
    Abort(String),
}

pub struct Scheduler {
    engine: Arc<Engine>,
    detectors: DetectorRegistry,
    scorer: Scorer,
    throttler: Throttler,
    exporter: Exporter,
    collection_times: Vec<NaiveTime>,
    state: SchedulerState,
    /// Admitted alerts awaiting a batch commit. Owned by this task, never
    /// shared.
    buffer: Vec<Alert>,
    last_export_at: Option<DateTime<Utc>>,
}

impl Scheduler {
    pub fn new(engine: Arc<Engine>, now: DateTime<Utc>) -> Self {
        let config = engine.config.read().clone();
        let detectors = DetectorRegistry::from_config(&config.detectors);
        let scorer = Scorer::new(config.scoring.clone());
        let throttler = Throttler::new(
            engine.store.clone(),
            config.alerts.clone(),
            config.risk.clone(),
        );
        let exporter = Exporter::new(&config.export_dir);
        let collection_times =
            calendar::parse_collection_times(&config.scheduler.collection_times_et);

        let state = Self::restore_state(&engine, now);
        engine.budget.restore(
            state.api_calls_this_hour,
            state.api_calls_today,
            state.hour_window_start,
            state.day_window_start,
        );

        info!(
            state = %state.current_state,
            detectors = detectors.len(),
            collection_times = ?config.scheduler.collection_times_et,
            "scheduler constructed"
        );

        Self {
            engine,
            detectors,
            scorer,
            throttler,
            exporter,
            collection_times,
            state,
            buffer: Vec::new(),
            last_export_at: None,
        }
    }

    /// Restore persisted state younger than 24 h; anything else starts fresh.
    /// Restoration failure is logged and non-fatal.
    fn restore_state(engine: &Engine, now: DateTime<Utc>) -> SchedulerState {
        match engine.store.scheduler_state().load() {
            Ok(Some((state, updated_at)))
                if now - updated_at < chrono::Duration::hours(STATE_RESTORE_MAX_AGE_HOURS) =>
            {
                info!(
                    persisted_state = %state.current_state,
                    age_secs = (now - updated_at).num_seconds(),
                    "scheduler state restored"
                );
                state
            }
            Ok(Some((_, updated_at))) => {
                info!(
                    age_hours = (now - updated_at).num_hours(),
                    "persisted scheduler state too old — starting fresh"
                );
                SchedulerState::fresh(now)
            }
            Ok(None) => SchedulerState::fresh(now),
            Err(e) => {
                warn!(error = %e, "failed to restore scheduler state — starting fresh");
                SchedulerState::fresh(now)
            }
        }
    }

    pub fn state(&self) -> &SchedulerState {
        &self.state
    }

    pub fn buffered_alerts(&self) -> usize {
        self.buffer.len()
    }

    /// Sync counters into the state row and persist. A store failure here is
    /// logged and retried on the next transition.
    fn persist(&mut self, now: DateTime<Utc>) {
        let (hour, day, hour_start, day_start) = self.engine.budget.snapshot();
        self.state.api_calls_this_hour = hour;
        self.state.api_calls_today = day;
        self.state.hour_window_start = hour_start;
        self.state.day_window_start = day_start;
        self.state.write_buffer_count = self.buffer.len() as u32;
        self.state.updated_at = now;
        if let Err(e) = self.engine.store.scheduler_state().save(&self.state) {
            error!(error = %e, "failed to persist scheduler state");
        }
    }

    fn transition(&mut self, to: SchedulerPhase, now: DateTime<Utc>) {
        if self.state.current_state != to {
            debug!(from = %self.state.current_state, to = %to, "scheduler transition");
        }
        self.state.current_state = to;
        self.persist(now);
    }

    // ── Main loop ───────────────────────────────────────────────────────

    pub async fn run(mut self) {
        let check_interval = {
            let config = self.engine.config.read();
            Duration::from_secs(config.scheduler.check_interval_sec.max(1))
        };
        info!(check_interval_secs = check_interval.as_secs(), "scheduler loop starting");

        loop {
            if self.engine.is_shutdown() {
                break;
            }
            let now = calendar::now_utc();
            self.tick(now).await;

            if self.engine.is_shutdown() {
                break;
            }
            tokio::select! {
                _ = tokio::time::sleep(check_interval) => {}
                _ = self.engine.shutdown_notified() => {}
            }
        }

        // Cooperative shutdown: flush, persist, exit inside the grace window.
        let flushed = tokio::time::timeout(SHUTDOWN_GRACE, async {
            let now = calendar::now_utc();
            self.flush(now, SchedulerPhase::Waiting);
            self.persist(now);
        })
        .await;
        if flushed.is_err() {
            warn!("shutdown flush exceeded the grace window");
        }
        info!("scheduler stopped");
    }

    /// One pass of the FSM at `now`.
    pub async fn tick(&mut self, now: DateTime<Utc>) {
        match self.state.current_state {
            SchedulerPhase::Idle => {
                match calendar::next_collection_at(now, &self.collection_times) {
                    Some(next) => {
                        self.state.next_collection_at = Some(next);
                        info!(next_collection_at = %next, "collection scheduled");
                        self.transition(SchedulerPhase::Waiting, now);
                    }
                    None => {
                        warn!("no valid collection times configured — staying idle");
                        self.persist(now);
                    }
                }
            }
            SchedulerPhase::Waiting => {
                self.maybe_export(now);
                let due = self
                    .state
                    .next_collection_at
                    .map(|next| now >= next)
                    .unwrap_or(false);
                if due {
                    if self.engine.budget.can_call(now) {
                        self.collect_cycle(now).await;
                    } else {
                        warn!("rate budget exhausted before collection could start");
                        self.enter_backoff(now);
                    }
                }
            }
            // A restart mid-cycle lands here; the cycle itself is not
            // resumable, so fall back to waiting for the next slot.
            SchedulerPhase::Collecting | SchedulerPhase::Flushing => {
                self.advance_next_collection(now);
                self.transition(SchedulerPhase::Waiting, now);
            }
            SchedulerPhase::BackingOff => {
                let done = self
                    .state
                    .backoff_until
                    .map(|until| now >= until)
                    .unwrap_or(true);
                if done {
                    self.state.backoff_until = None;
                    self.advance_next_collection(now);
                    self.transition(SchedulerPhase::Waiting, now);
                }
            }
        }
    }

    fn advance_next_collection(&mut self, now: DateTime<Utc>) {
        let stale = self
            .state
            .next_collection_at
            .map(|next| next <= now)
            .unwrap_or(true);
        if stale {
            self.state.next_collection_at =
                calendar::next_collection_at(now, &self.collection_times);
        }
    }

    fn enter_backoff(&mut self, now: DateTime<Utc>) {
        self.state.consecutive_failures += 1;
        let n = self.state.consecutive_failures;
        let secs = backoff_secs(n);
        self.state.backoff_until = Some(now + chrono::Duration::seconds(secs));
        warn!(
            consecutive_failures = n,
            backoff_secs = secs,
            "entering backoff"
        );
        self.transition(SchedulerPhase::BackingOff, now);
    }

    fn maybe_export(&mut self, now: DateTime<Utc>) {
        let interval = {
            let config = self.engine.config.read();
            chrono::Duration::seconds(config.scheduler.export_interval_sec as i64)
        };
        let due = self
            .last_export_at
            .map(|last| now - last >= interval)
            .unwrap_or(true);
        if due {
            self.export(now);
        }
    }

    fn export(&mut self, now: DateTime<Utc>) {
        let watchlist = self.watchlist();
        let last_scan = self.engine.store.scans().latest().unwrap_or_default();
        let status = self.engine.build_status(&self.state, last_scan, now);
        if let Err(e) = self
            .exporter
            .export_all(&self.engine.store, &watchlist, status, now)
        {
            error!(error = %e, "export failed");
        } else {
            self.last_export_at = Some(now);
        }
    }

    fn watchlist(&self) -> Vec<Ticker> {
        self.engine
            .config
            .read()
            .watchlist
            .iter()
            .filter_map(|s| Ticker::new(s))
            .collect()
    }

    // ── Collection ──────────────────────────────────────────────────────

    /// Run one full collection cycle. Public for the integration suite.
    pub async fn collect_cycle(&mut self, now: DateTime<Utc>) -> CycleOutcome {
        self.engine.sync_provider();
        self.transition(SchedulerPhase::Collecting, now);

        let config = self.engine.config.read().clone();
        let watchlist = self.watchlist();
        let scans = self.engine.store.scans();

        let scan_id = match scans.create(&config.config_hash(), now) {
            Ok(id) => id,
            Err(e) => {
                error!(error = %e, "store unavailable — cannot open a scan");
                self.enter_backoff(now);
                return CycleOutcome {
                    scan_id: String::new(),
                    status: ScanStatus::Failed,
                    tickers_scanned: 0,
                    tickers_skipped: watchlist.len() as u32,
                    alerts_published: 0,
                };
            }
        };
        let _ = scans.update(&scan_id, ScanStatus::Running, 0, 0, 0, None, None, None);
        info!(scan_id, tickers = watchlist.len(), "collection cycle starting");

        let mut scanned = 0u32;
        let mut skipped = 0u32;
        let mut published = 0u32;
        let mut cycle_error: Option<String> = None;
        let mut backoff = false;

        for (idx, ticker) in watchlist.iter().enumerate() {
            if self.engine.is_shutdown() {
                skipped += (watchlist.len() - idx) as u32;
                cycle_error.get_or_insert_with(|| "shutdown requested".to_string());
                break;
            }
            let loop_now = calendar::now_utc();
            if !self.engine.budget.can_call(loop_now) {
                skipped += (watchlist.len() - idx) as u32;
                cycle_error = Some("rate budget exhausted".to_string());
                backoff = true;
                break;
            }

            match self.scan_ticker(&scan_id, ticker).await {
                Ok(count) => {
                    scanned += 1;
                    published += count;
                }
                Err(TickerFailure::Skip(msg)) => {
                    warn!(%ticker, reason = %msg, "ticker skipped this cycle");
                    skipped += 1;
                    cycle_error.get_or_insert(msg);
                }
                Err(TickerFailure::Abort(msg)) => {
                    warn!(%ticker, reason = %msg, "cycle aborted");
                    skipped += (watchlist.len() - idx) as u32;
                    cycle_error = Some(msg);
                    backoff = true;
                    break;
                }
            }

            if self.buffer.len() >= config.scheduler.flush_threshold {
                self.flush(calendar::now_utc(), SchedulerPhase::Collecting);
            }

            if idx + 1 < watchlist.len() {
                let delay = self.engine.budget.adaptive_delay(calendar::now_utc());
                tokio::time::sleep(delay).await;
            }
        }

        self.flush(calendar::now_utc(), SchedulerPhase::Collecting);

        let finished = calendar::now_utc();
        let status = if !watchlist.is_empty() && scanned == 0 && cycle_error.is_some() {
            ScanStatus::Failed
        } else if cycle_error.is_some() || skipped > 0 {
            ScanStatus::Partial
        } else {
            ScanStatus::Completed
        };
        let runtime = (finished - now).num_milliseconds() as f64 / 1000.0;
        if let Err(e) = scans.update(
            &scan_id,
            status,
            scanned,
            skipped,
            published,
            Some(runtime),
            cycle_error.as_deref(),
            Some(finished),
        ) {
            error!(error = %e, "failed to finalise scan row");
        }

        self.export(finished);

        if backoff {
            self.enter_backoff(finished);
        } else {
            self.state.consecutive_failures = 0;
            self.state.backoff_until = None;
            self.advance_next_collection(finished);
            self.transition(SchedulerPhase::Waiting, finished);
        }

        info!(
            scan_id,
            status = %status,
            scanned,
            skipped,
            published,
            runtime_secs = runtime,
            "collection cycle finished"
        );

        CycleOutcome {
            scan_id,
            status,
            tickers_scanned: scanned,
            tickers_skipped: skipped,
            alerts_published: published,
        }
    }

    /// Fetch, compute, detect, score, and gate one ticker. Returns the number
    /// of alerts admitted into the buffer.
    async fn scan_ticker(&mut self, scan_id: &str, ticker: &Ticker) -> Result<u32, TickerFailure> {
        let market = &self.engine.market;

        let chain = market
            .get_option_chain(ticker, None)
            .await
            .map_err(classify_data_error)?;
        let history = market
            .get_price_history(ticker, HISTORY_DAYS)
            .await
            .map_err(classify_data_error)?;
        // Metadata is best-effort; a miss only costs the earnings feature.
        let info = market.get_ticker_info(ticker).await.ok();

        let now = calendar::now_utc();
        let days_to_earnings = info
            .and_then(|i| i.next_earnings)
            .map(|d| (d - now.date_naive()).num_days());

        let iv_window = self
            .engine
            .store
            .iv_history()
            .window(ticker, IV_WINDOW_DAYS)
            .map_err(store_failure)?;

        let feature_set = features::compute(
            ticker,
            &FeatureInputs {
                chain: &chain,
                history: &history,
                iv_window: &iv_window,
                days_to_earnings,
                now,
            },
        );

        // Historise: full chain for backtesting, today's ATM IV once per UTC
        // trading day (idempotent by date).
        self.engine
            .store
            .chain_snapshots()
            .save(scan_id, &chain)
            .map_err(store_failure)?;
        if let Some(atm_iv) = feature_set.atm_iv_front {
            self.engine
                .store
                .iv_history()
                .append(ticker, now.date_naive(), atm_iv, feature_set.skew_25d)
                .map_err(store_failure)?;
        }
        self.engine
            .store
            .feature_snapshots()
            .save(scan_id, ticker, &feature_set)
            .map_err(store_failure)?;

        let mut admitted = 0u32;
        for candidate in self.detectors.run_all(&feature_set) {
            let decision_now = calendar::now_utc();
            let scored = self.scorer.score(&candidate, &feature_set, decision_now);
            let decision = self
                .throttler
                .decide(&scored, decision_now)
                .map_err(store_failure)?;
            if decision.admit {
                self.throttler
                    .record_admission(ticker, scored.final_score, decision_now)
                    .map_err(store_failure)?;
                self.buffer.push(build_alert(scan_id, &scored, decision_now));
                self.state.write_buffer_count = self.buffer.len() as u32;
                admitted += 1;
                info!(
                    %ticker,
                    detector = %scored.candidate.detector,
                    final_score = scored.final_score,
                    "alert admitted"
                );
            } else {
                debug!(
                    %ticker,
                    detector = %scored.candidate.detector,
                    reason = decision.reason.as_deref().unwrap_or(""),
                    "alert suppressed"
                );
            }
        }
        Ok(admitted)
    }

    /// Commit the buffer through the store. A failed commit keeps the buffer
    /// as the in-memory retry queue for the next flush.
    fn flush(&mut self, now: DateTime<Utc>, resume: SchedulerPhase) {
        if self.buffer.is_empty() {
            return;
        }
        self.transition(SchedulerPhase::Flushing, now);
        match self.engine.store.alerts().save_batch(&self.buffer) {
            Ok(ids) => {
                info!(count = ids.len(), "alert buffer flushed");
                self.buffer.clear();
            }
            Err(e) => {
                error!(error = %e, retained = self.buffer.len(), "flush failed — buffer retained");
            }
        }
        self.state.write_buffer_count = self.buffer.len() as u32;
        self.transition(resume, now);
    }
}

/// Exponential backoff: min(60 · 2^(n−1), 1800) seconds.
fn backoff_secs(consecutive_failures: u32) -> i64 {
    let shift = consecutive_failures.saturating_sub(1).min(20);
    (BASE_BACKOFF_SECS.saturating_mul(1_i64 << shift)).min(MAX_BACKOFF_SECS)
}

fn classify_data_error(err: DataError) -> TickerFailure {
    if err.is_backoff_worthy() {
        TickerFailure::Abort(err.to_string())
    } else {
        TickerFailure::Skip(err.to_string())
    }
}

fn store_failure(err: crate::store::StoreError) -> TickerFailure {
    TickerFailure::Abort(format!("store unavailable: {err}"))
}

fn build_alert(scan_id: &str, scored: &ScoredCandidate, created_at: DateTime<Utc>) -> Alert {
    let metrics: BTreeMap<String, f64> = scored
        .candidate
        .metrics
        .to_pairs()
        .into_iter()
        .map(|(k, v)| (k.to_string(), v))
        .collect();
    Alert {
        id: 0,
        scan_id: scan_id.to_string(),
        ticker: scored.candidate.ticker.clone(),
        detector: scored.candidate.detector,
        raw_score: scored.candidate.raw_score,
        final_score: scored.final_score,
        explanation: scored.explanation.clone(),
        strategies: scored.strategies.clone(),
        metrics,
        created_at,
    }
}

//! Historical data engine: cache → rate limit → fetch → validate → score → cache.
//!
//! Rules implemented:
//! - one public entry point, `get_historical_data`, returning shared immutable candles
//! - same-key callers are serialized on a cache lease; the second one sees the first's result
//! - retryable fetch failures are retried per page with exponential backoff
//! - nothing is cached unless it passed the quality gate
//! - every terminal failure emits a `fetch_error` event before it is returned

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use chrono::{NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use crate::cache::{CacheError, CacheManager, SweepReport};
use crate::candle::{CacheKey, Candle, HistoricalRequest};
use crate::config::{ConfigError, EngineConfig};
use crate::entropy::{ClockHashJitter, JitterSource};
use crate::fetch::{BinanceRestClient, FetchError, KlineFetcher, KlinePage};
use crate::quality;
use crate::rate_limiter::{RateLimiter, RateLimiterSnapshot};
use crate::timeframe::parse_timeframe;
use crate::validation::run_pipeline;

const EVENT_CHANNEL_CAPACITY: usize = 256;

pub trait Clock: Send + Sync + 'static {
    fn now_ms(&self) -> i64;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_ms(&self) -> i64 {
        Utc::now().timestamp_millis()
    }
}

/// Settable clock for tests and replay tooling.
#[derive(Debug, Default)]
pub struct ManualClock {
    now_ms: AtomicI64,
}

impl ManualClock {
    pub fn new(now_ms: i64) -> Self {
        Self {
            now_ms: AtomicI64::new(now_ms),
        }
    }

    pub fn set(&self, now_ms: i64) {
        self.now_ms.store(now_ms, Ordering::SeqCst);
    }

    pub fn advance(&self, by: Duration) {
        self.now_ms
            .fetch_add(by.as_millis() as i64, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now_ms(&self) -> i64 {
        self.now_ms.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureStage {
    Config,
    Fetch,
    Quality,
}

impl FailureStage {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Config => "config",
            Self::Fetch => "fetch",
            Self::Quality => "quality",
        }
    }
}

#[derive(Debug, Error)]
pub enum HistoricalDataError {
    #[error("invalid request for {symbol} {timeframe}: {reason}")]
    ValidationConfig {
        symbol: String,
        timeframe: String,
        reason: String,
    },
    #[error("transport failure for {symbol} {timeframe} after {attempts} attempt(s): {source}")]
    Transport {
        symbol: String,
        timeframe: String,
        attempts: u32,
        #[source]
        source: FetchError,
    },
    #[error("upstream rejected {symbol} {timeframe} after {attempts} attempt(s): {source}")]
    Upstream {
        symbol: String,
        timeframe: String,
        attempts: u32,
        #[source]
        source: FetchError,
    },
    #[error("quality {score:.4} below minimum {minimum:.4} for {symbol} {timeframe} ({candle_count} candles)")]
    Quality {
        symbol: String,
        timeframe: String,
        score: f64,
        minimum: f64,
        candle_count: usize,
    },
}

impl HistoricalDataError {
    pub fn stage(&self) -> FailureStage {
        match self {
            Self::ValidationConfig { .. } => FailureStage::Config,
            Self::Transport { .. } | Self::Upstream { .. } => FailureStage::Fetch,
            Self::Quality { .. } => FailureStage::Quality,
        }
    }

    /// Whether the same call may succeed later. Local retries have already run.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Transport { source, .. } | Self::Upstream { source, .. } => source.is_retryable(),
            Self::ValidationConfig { .. } | Self::Quality { .. } => false,
        }
    }

    pub fn symbol(&self) -> &str {
        match self {
            Self::ValidationConfig { symbol, .. }
            | Self::Transport { symbol, .. }
            | Self::Upstream { symbol, .. }
            | Self::Quality { symbol, .. } => symbol,
        }
    }

    pub fn timeframe(&self) -> &str {
        match self {
            Self::ValidationConfig { timeframe, .. }
            | Self::Transport { timeframe, .. }
            | Self::Upstream { timeframe, .. }
            | Self::Quality { timeframe, .. } => timeframe,
        }
    }
}

#[derive(Debug, Error)]
pub enum EngineInitError {
    #[error("invalid engine config: {0}")]
    Config(#[from] ConfigError),
    #[error("fetch client error: {0}")]
    Fetch(#[from] FetchError),
    #[error("cache error: {0}")]
    Cache(#[from] CacheError),
    #[error("connectivity check failed: {0}")]
    Connectivity(#[source] FetchError),
}

/// Lifecycle notifications for collaborators.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum EngineEvent {
    EngineReady {
        symbols_supported: usize,
        timeframes_supported: usize,
        cache_enabled: bool,
    },
    CacheHit {
        symbol: String,
        timeframe: String,
    },
    CacheMiss {
        symbol: String,
        timeframe: String,
    },
    DataFetched {
        symbol: String,
        timeframe: String,
        candle_count: usize,
        quality_score: f64,
    },
    FetchError {
        symbol: String,
        timeframe: String,
        stage: FailureStage,
        reason: String,
    },
}

pub trait EngineObserver: Send + Sync + 'static {
    fn on_event(&self, event: &EngineEvent);
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestCounts {
    pub total: u64,
    pub successful: u64,
    pub failed: u64,
    pub cache_hits: u64,
    pub cache_misses: u64,
    pub upstream_calls: u64,
    pub retries: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InitState {
    Pending,
    Ready,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InitializationStatus {
    pub state: InitState,
    pub started_at_ms: Option<i64>,
    pub completed_at_ms: Option<i64>,
    pub error: Option<String>,
}

impl Default for InitializationStatus {
    fn default() -> Self {
        Self {
            state: InitState::Pending,
            started_at_ms: None,
            completed_at_ms: None,
            error: None,
        }
    }
}

#[derive(Debug, Default)]
struct SystemCounters {
    requests: RequestCounts,
    cleaned_records: u64,
    dropped_rows: u64,
    failed_validations: u64,
    interpolated_candles: u64,
    cache_write_failures: u64,
    cache_read_failures: u64,
}

/// Read-only snapshot of the engine's running totals.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SystemStats {
    pub request_counts: RequestCounts,
    pub cache_hit_rate: f64,
    pub success_rate: f64,
    pub cache_size_bytes: u64,
    pub cache_entries: u64,
    pub cleaned_record_count: u64,
    pub dropped_row_count: u64,
    pub failed_validations: u64,
    pub interpolated_candles: u64,
    pub cache_write_failures: u64,
    pub cache_read_failures: u64,
    pub rate_limiter: RateLimiterSnapshot,
    pub initialization: InitializationStatus,
}

pub struct HistoricalDataEngine {
    cfg: EngineConfig,
    fetcher: Arc<dyn KlineFetcher>,
    rate_limiter: Arc<RateLimiter>,
    cache: Arc<CacheManager>,
    clock: Arc<dyn Clock>,
    counters: Mutex<SystemCounters>,
    init: Mutex<InitializationStatus>,
    observers: RwLock<Vec<Arc<dyn EngineObserver>>>,
    events: broadcast::Sender<EngineEvent>,
}

impl HistoricalDataEngine {
    /// Engine over the live REST client, wall clock and hashed-clock jitter.
    pub fn new(cfg: EngineConfig) -> Result<Self, EngineInitError> {
        cfg.validate()?;
        let fetcher = Arc::new(BinanceRestClient::new(&cfg.fetch)?);
        Self::with_components(cfg, fetcher, Arc::new(SystemClock), Arc::new(ClockHashJitter::new()))
    }

    pub fn with_components(
        cfg: EngineConfig,
        fetcher: Arc<dyn KlineFetcher>,
        clock: Arc<dyn Clock>,
        jitter: Arc<dyn JitterSource>,
    ) -> Result<Self, EngineInitError> {
        cfg.validate()?;

        let cache = Arc::new(CacheManager::open(cfg.cache.clone(), clock.now_ms())?);
        let rate_limiter = Arc::new(RateLimiter::new(cfg.rate_limit.clone(), jitter));
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);

        Ok(Self {
            cfg,
            fetcher,
            rate_limiter,
            cache,
            clock,
            counters: Mutex::new(SystemCounters::default()),
            init: Mutex::new(InitializationStatus::default()),
            observers: RwLock::new(Vec::new()),
            events,
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.cfg
    }

    pub fn cache(&self) -> &Arc<CacheManager> {
        &self.cache
    }

    pub fn rate_limiter(&self) -> &Arc<RateLimiter> {
        &self.rate_limiter
    }

    pub fn add_observer(&self, observer: Arc<dyn EngineObserver>) {
        self.observers
            .write()
            .expect("observer list lock should not be poisoned")
            .push(observer);
    }

    /// Channel view of the same events observers receive. Slow receivers lag and skip.
    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.events.subscribe()
    }

    /// Probes upstream connectivity (when configured) and announces readiness.
    pub async fn initialize(&self) -> Result<(), EngineInitError> {
        let started_at_ms = self.clock.now_ms();
        {
            let mut init = self.init_status();
            *init = InitializationStatus {
                started_at_ms: Some(started_at_ms),
                ..InitializationStatus::default()
            };
        }

        if self.cfg.verify_connectivity {
            self.rate_limiter.acquire(1).await;
            self.with_counters(|c| c.requests.upstream_calls += 1);
            match self.fetcher.server_time().await {
                Ok(server_time_ms) => info!(
                    component = "engine",
                    event = "engine.connectivity.ok",
                    server_time_ms,
                    clock_skew_ms = server_time_ms - self.clock.now_ms()
                ),
                Err(err) => {
                    error!(
                        component = "engine",
                        event = "engine.connectivity.failed",
                        error = %err
                    );
                    let mut init = self.init_status();
                    init.state = InitState::Failed;
                    init.completed_at_ms = Some(self.clock.now_ms());
                    init.error = Some(err.to_string());
                    return Err(EngineInitError::Connectivity(err));
                }
            }
        }

        {
            let mut init = self.init_status();
            init.state = InitState::Ready;
            init.completed_at_ms = Some(self.clock.now_ms());
        }

        info!(
            component = "engine",
            event = "engine.ready",
            symbols_supported = self.cfg.symbols.len(),
            timeframes_supported = self.cfg.timeframes.len(),
            cache_enabled = self.cache.is_enabled()
        );
        self.emit(EngineEvent::EngineReady {
            symbols_supported: self.cfg.symbols.len(),
            timeframes_supported: self.cfg.timeframes.len(),
            cache_enabled: self.cache.is_enabled(),
        });
        Ok(())
    }

    /// Candles for `[start 00:00 UTC, end 00:00 UTC]`, from cache when fresh.
    pub async fn get_historical_data(
        &self,
        symbol: &str,
        timeframe: &str,
        start: NaiveDate,
        end: NaiveDate,
    ) -> Result<Arc<[Candle]>, HistoricalDataError> {
        self.with_counters(|c| c.requests.total += 1);

        let result = match self.build_request(symbol, timeframe, start, end) {
            Ok(req) => self.serve(&req).await,
            Err(err) => Err(err),
        };

        match &result {
            Ok(_) => self.with_counters(|c| c.requests.successful += 1),
            Err(err) => {
                self.with_counters(|c| c.requests.failed += 1);
                warn!(
                    component = "engine",
                    event = "engine.request.failed",
                    symbol = err.symbol(),
                    timeframe = err.timeframe(),
                    stage = err.stage().as_str(),
                    retryable = err.is_retryable(),
                    error = %err
                );
                self.emit(EngineEvent::FetchError {
                    symbol: err.symbol().to_string(),
                    timeframe: err.timeframe().to_string(),
                    stage: err.stage(),
                    reason: err.to_string(),
                });
            }
        }

        result
    }

    pub fn get_system_stats(&self) -> SystemStats {
        let counters = self.counters_guard();
        let requests = counters.requests.clone();
        let lookups = requests.cache_hits + requests.cache_misses;
        let finished = requests.successful + requests.failed;

        SystemStats {
            cache_hit_rate: ratio(requests.cache_hits, lookups),
            success_rate: ratio(requests.successful, finished),
            request_counts: requests,
            cache_size_bytes: self.cache.size_bytes(),
            cache_entries: self.cache.len() as u64,
            cleaned_record_count: counters.cleaned_records,
            dropped_row_count: counters.dropped_rows,
            failed_validations: counters.failed_validations,
            interpolated_candles: counters.interpolated_candles,
            cache_write_failures: counters.cache_write_failures,
            cache_read_failures: counters.cache_read_failures,
            rate_limiter: self.rate_limiter.snapshot(),
            initialization: self.init_status().clone(),
        }
    }

    /// Manual trigger for the periodic TTL sweep.
    pub fn clean_expired_cache(&self) -> Result<SweepReport, CacheError> {
        self.cache.sweep_expired(self.clock.now_ms())
    }

    /// Drops one cached window from memory and disk.
    pub fn invalidate(
        &self,
        symbol: &str,
        timeframe: &str,
        start: NaiveDate,
        end: NaiveDate,
    ) -> Result<bool, HistoricalDataError> {
        let req = self.build_request(symbol, timeframe, start, end)?;
        self.cache
            .invalidate(&req.cache_key())
            .map_err(|err| HistoricalDataError::ValidationConfig {
                symbol: req.symbol.clone(),
                timeframe: req.timeframe.to_string(),
                reason: format!("cache invalidation failed: {err}"),
            })
    }

    /// Starts the token refill and cache sweep timers. Both stop when the
    /// returned handle is dropped.
    pub fn spawn_maintenance(self: &Arc<Self>) -> MaintenanceTasks {
        let refill = self.rate_limiter.spawn_refill_task();

        let engine = Arc::clone(self);
        let period = Duration::from_millis(self.cfg.cache.sweep_interval_ms.max(1));
        let sweep = tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                if let Err(err) = engine.clean_expired_cache() {
                    warn!(
                        component = "engine",
                        event = "engine.sweep.failed",
                        error = %err
                    );
                }
            }
        });

        MaintenanceTasks {
            handles: vec![refill, sweep],
        }
    }

    fn build_request(
        &self,
        symbol: &str,
        timeframe: &str,
        start: NaiveDate,
        end: NaiveDate,
    ) -> Result<HistoricalRequest, HistoricalDataError> {
        let symbol = symbol.trim().to_ascii_uppercase();
        let reject = |reason: String| HistoricalDataError::ValidationConfig {
            symbol: symbol.clone(),
            timeframe: timeframe.to_string(),
            reason,
        };

        if symbol.is_empty() {
            return Err(reject("symbol must not be empty".to_string()));
        }
        if !symbol.bytes().all(|b| b.is_ascii_alphanumeric()) {
            return Err(reject(format!("symbol {symbol} must be ASCII letters and digits only")));
        }
        if !self.cfg.supports_symbol(&symbol) {
            return Err(reject(format!("symbol {symbol} is not configured")));
        }
        let parsed = parse_timeframe(timeframe).map_err(|err| reject(err.to_string()))?;
        if !self.cfg.supports_timeframe(parsed) {
            return Err(reject(format!("timeframe {parsed} is not configured")));
        }
        if start >= end {
            return Err(reject(format!("start date {start} must be before end date {end}")));
        }

        Ok(HistoricalRequest::from_dates(symbol, parsed, start, end))
    }

    async fn serve(&self, req: &HistoricalRequest) -> Result<Arc<[Candle]>, HistoricalDataError> {
        let key = req.cache_key();
        let _lease = self.cache.lock_key(&key).await;

        if let Some(hit) = self.lookup(&key) {
            self.with_counters(|c| c.requests.cache_hits += 1);
            debug!(
                component = "engine",
                event = "engine.cache_hit",
                key = %key,
                candles = hit.len()
            );
            self.emit(EngineEvent::CacheHit {
                symbol: req.symbol.clone(),
                timeframe: req.timeframe.to_string(),
            });
            return Ok(hit);
        }

        self.with_counters(|c| c.requests.cache_misses += 1);
        self.emit(EngineEvent::CacheMiss {
            symbol: req.symbol.clone(),
            timeframe: req.timeframe.to_string(),
        });

        info!(
            component = "engine",
            event = "engine.fetch.start",
            symbol = %req.symbol,
            timeframe = req.timeframe.as_str(),
            start_ms = req.start_ms,
            end_ms = req.end_ms
        );
        let raw = self.fetch_window(req).await?;

        let (cleaned, report) = run_pipeline(raw.candles, raw.dropped_rows, req.timeframe, &self.cfg.validation);
        self.with_counters(|c| {
            c.cleaned_records += report.cleaned_records();
            c.dropped_rows += report.dropped_rows;
            c.interpolated_candles += report.interpolated_count;
        });

        let verdict = quality::evaluate(&cleaned, &report, self.cfg.min_quality);
        if !verdict.passed {
            self.with_counters(|c| c.failed_validations += 1);
            return Err(HistoricalDataError::Quality {
                symbol: req.symbol.clone(),
                timeframe: req.timeframe.to_string(),
                score: verdict.score,
                minimum: verdict.minimum,
                candle_count: cleaned.len(),
            });
        }

        let candles: Arc<[Candle]> = cleaned.into();
        if let Err(err) = self.cache.put(&key, Arc::clone(&candles), self.clock.now_ms()) {
            self.with_counters(|c| c.cache_write_failures += 1);
            warn!(
                component = "engine",
                event = "engine.cache.write_failed",
                key = %key,
                error = %err
            );
        }

        info!(
            component = "engine",
            event = "engine.fetch.complete",
            symbol = %req.symbol,
            timeframe = req.timeframe.as_str(),
            candle_count = candles.len(),
            quality_score = verdict.score,
            gap_count = report.gap_count,
            interpolated = report.interpolated_count,
            cleaned = report.cleaned_records()
        );
        self.emit(EngineEvent::DataFetched {
            symbol: req.symbol.clone(),
            timeframe: req.timeframe.to_string(),
            candle_count: candles.len(),
            quality_score: verdict.score,
        });

        Ok(candles)
    }

    fn lookup(&self, key: &CacheKey) -> Option<Arc<[Candle]>> {
        match self.cache.get(key, self.clock.now_ms()) {
            Ok(hit) => hit,
            Err(err) => {
                self.with_counters(|c| c.cache_read_failures += 1);
                warn!(
                    component = "engine",
                    event = "engine.cache.read_failed",
                    key = %key,
                    error = %err
                );
                None
            }
        }
    }

    /// Pages through the window: cursor = last open time + one interval.
    async fn fetch_window(&self, req: &HistoricalRequest) -> Result<KlinePage, HistoricalDataError> {
        let interval = req.timeframe.interval_ms();
        let row_limit = self.cfg.fetch.row_limit.max(1) as u64;
        let mut cursor = req.start_ms;
        let mut out = KlinePage::default();
        let mut pages = 0u32;

        loop {
            let page = self.fetch_page_with_retry(req, cursor).await?;
            pages += 1;
            let rows = page.candles.len() as u64 + page.dropped_rows;
            let last_open = page.candles.iter().map(|c| c.timestamp).max();
            out.dropped_rows += page.dropped_rows;
            out.candles.extend(page.candles);

            let Some(last_open) = last_open else {
                break;
            };
            if rows < row_limit {
                break;
            }
            let next = last_open + interval;
            if next <= cursor {
                return Err(HistoricalDataError::Upstream {
                    symbol: req.symbol.clone(),
                    timeframe: req.timeframe.to_string(),
                    attempts: 1,
                    source: FetchError::MalformedBody {
                        url: format!("page starting at {cursor}"),
                        message: format!("page cursor did not advance past {cursor}"),
                    },
                });
            }
            if next > req.end_ms {
                break;
            }
            cursor = next;
        }

        debug!(
            component = "engine",
            event = "engine.fetch.paged",
            symbol = %req.symbol,
            timeframe = req.timeframe.as_str(),
            pages,
            rows = out.candles.len()
        );
        Ok(out)
    }

    async fn fetch_page_with_retry(
        &self,
        req: &HistoricalRequest,
        cursor: i64,
    ) -> Result<KlinePage, HistoricalDataError> {
        let mut attempt: u32 = 0;
        loop {
            self.rate_limiter.acquire(self.cfg.fetch.request_weight).await;
            self.with_counters(|c| c.requests.upstream_calls += 1);

            match self
                .fetcher
                .fetch(&req.symbol, req.timeframe, cursor, req.end_ms)
                .await
            {
                Ok(page) => return Ok(page),
                Err(err) if err.is_retryable() && attempt < self.cfg.max_retries => {
                    attempt = attempt.saturating_add(1);
                    let backoff = retry_backoff(self.cfg.retry_backoff_ms, attempt);
                    self.with_counters(|c| c.requests.retries += 1);
                    warn!(
                        component = "engine",
                        event = "engine.fetch.retry",
                        symbol = %req.symbol,
                        timeframe = req.timeframe.as_str(),
                        attempt,
                        backoff_ms = backoff.as_millis() as u64,
                        error = %err
                    );
                    tokio::time::sleep(backoff).await;
                }
                Err(err) => return Err(fetch_failure(req, err, attempt + 1)),
            }
        }
    }

    fn emit(&self, event: EngineEvent) {
        let observers = self
            .observers
            .read()
            .expect("observer list lock should not be poisoned");
        for observer in observers.iter() {
            observer.on_event(&event);
        }
        // No subscribers is fine.
        let _ = self.events.send(event);
    }

    fn with_counters(&self, f: impl FnOnce(&mut SystemCounters)) {
        f(&mut self.counters_guard());
    }

    fn counters_guard(&self) -> std::sync::MutexGuard<'_, SystemCounters> {
        self.counters
            .lock()
            .expect("system counters lock should not be poisoned")
    }

    fn init_status(&self) -> std::sync::MutexGuard<'_, InitializationStatus> {
        self.init
            .lock()
            .expect("initialization status lock should not be poisoned")
    }
}

/// Background timers started by [`HistoricalDataEngine::spawn_maintenance`].
pub struct MaintenanceTasks {
    handles: Vec<JoinHandle<()>>,
}

impl MaintenanceTasks {
    pub fn abort(&self) {
        for handle in &self.handles {
            handle.abort();
        }
    }
}

impl Drop for MaintenanceTasks {
    fn drop(&mut self) {
        self.abort();
    }
}

fn fetch_failure(req: &HistoricalRequest, err: FetchError, attempts: u32) -> HistoricalDataError {
    let symbol = req.symbol.clone();
    let timeframe = req.timeframe.to_string();
    match err {
        FetchError::Upstream { .. } => HistoricalDataError::Upstream {
            symbol,
            timeframe,
            attempts,
            source: err,
        },
        _ => HistoricalDataError::Transport {
            symbol,
            timeframe,
            attempts,
            source: err,
        },
    }
}

fn retry_backoff(base_ms: u64, attempt: u32) -> Duration {
    let shift = attempt.saturating_sub(1).min(10);
    Duration::from_millis(base_ms.saturating_mul(1u64 << shift))
}

fn ratio(part: u64, whole: u64) -> f64 {
    if whole == 0 {
        0.0
    } else {
        part as f64 / whole as f64
    }
}

//! Historical OHLCV ingestion, validation and caching.
//!
//! Current implemented scope:
//! - rate-limited, paged kline fetching from the exchange REST API
//! - validation and cleaning pipeline with a minimum-quality gate
//! - two-tier cache (memory + sqlite) with per-timeframe TTL
//! - engine facade with counters, lifecycle events and an HTTP surface

mod cache;
mod candle;
mod config;
mod engine;
mod entropy;
mod fetch;
mod observability;
mod quality;
mod rate_limiter;
mod server;
mod store;
mod timeframe;
mod validation;

pub use cache::{CacheConfig, CacheError, CacheManager, KeyLease, SweepReport, DEFAULT_CACHE_DIRECTORY};
pub use candle::{day_start_ms, CacheKey, Candle, HistoricalRequest};
pub use config::{
    engine_config_from_env, parse_ttl_overrides, ConfigError, EngineConfig, DEFAULT_SYMBOLS,
    DEFAULT_TIMEFRAMES,
};
pub use engine::{
    Clock, EngineEvent, EngineInitError, EngineObserver, FailureStage, HistoricalDataEngine,
    HistoricalDataError, InitState, InitializationStatus, MaintenanceTasks, ManualClock,
    RequestCounts, SystemClock, SystemStats,
};
pub use entropy::{ClockHashJitter, FixedJitter, JitterSource};
pub use fetch::{
    parse_klines_payload, BinanceRestClient, FetchConfig, FetchError, KlineFetcher, KlinePage,
    BINANCE_REST_BASE_URL,
};
pub use observability::{
    init_logging, log_app_bind, log_app_start, log_app_stop, log_engine_config,
    logging_config_from_env, overlay_logging_env, LogFormat, LoggingConfig, LoggingInitError,
};
pub use quality::{evaluate as evaluate_quality, score as quality_score, QualityVerdict};
pub use rate_limiter::{RateLimiter, RateLimiterConfig, RateLimiterSnapshot};
pub use server::{stats_router, status_for, KlinesQuery, ROUTES};
pub use store::{SqliteCacheStore, StoreError, StoredEntry, WarmLoad, STORE_FILE_NAME};
pub use timeframe::{parse_timeframe, Timeframe, TimeframeError, ALL_TIMEFRAMES};
pub use validation::{run_pipeline, Gap, ValidationConfig, ValidationReport};

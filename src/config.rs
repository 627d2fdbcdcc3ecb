//! Engine configuration: defaults, sanity checks and `HISTDATA_*` environment overlay.

use std::collections::BTreeMap;
use std::env;
use std::path::PathBuf;
use std::str::FromStr;

use thiserror::Error;
use tracing::warn;

use crate::cache::CacheConfig;
use crate::fetch::FetchConfig;
use crate::observability::parse_bool;
use crate::rate_limiter::RateLimiterConfig;
use crate::timeframe::{parse_timeframe, Timeframe};
use crate::validation::ValidationConfig;

pub const DEFAULT_SYMBOLS: [&str; 12] = [
    "BTCUSDT", "ETHUSDT", "BNBUSDT", "SOLUSDT", "XRPUSDT", "DOGEUSDT", "ADAUSDT", "AVAXUSDT",
    "LINKUSDT", "DOTUSDT", "MATICUSDT", "UNIUSDT",
];

pub const DEFAULT_TIMEFRAMES: [Timeframe; 3] = [Timeframe::H1, Timeframe::H4, Timeframe::D1];

#[derive(Debug, Clone, PartialEq)]
pub struct EngineConfig {
    pub fetch: FetchConfig,
    pub rate_limit: RateLimiterConfig,
    pub validation: ValidationConfig,
    pub cache: CacheConfig,
    /// Accepted symbols; empty accepts any.
    pub symbols: Vec<String>,
    /// Timeframes this engine serves.
    pub timeframes: Vec<Timeframe>,
    pub min_quality: f64,
    pub max_retries: u32,
    pub retry_backoff_ms: u64,
    pub verify_connectivity: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            fetch: FetchConfig::default(),
            rate_limit: RateLimiterConfig::default(),
            validation: ValidationConfig::default(),
            cache: CacheConfig::default(),
            symbols: DEFAULT_SYMBOLS.iter().map(|s| s.to_string()).collect(),
            timeframes: DEFAULT_TIMEFRAMES.to_vec(),
            min_quality: 0.95,
            max_retries: 3,
            retry_backoff_ms: 200,
            verify_connectivity: true,
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("invalid config value for {field}: {reason}")]
    Invalid { field: &'static str, reason: String },
}

fn invalid(field: &'static str, reason: impl Into<String>) -> ConfigError {
    ConfigError::Invalid {
        field,
        reason: reason.into(),
    }
}

impl EngineConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.fetch.base_url.trim().is_empty() {
            return Err(invalid("fetch.base_url", "must not be empty"));
        }
        if self.fetch.request_timeout_ms == 0 {
            return Err(invalid("fetch.request_timeout_ms", "must be > 0"));
        }
        if self.fetch.row_limit == 0 {
            return Err(invalid("fetch.row_limit", "must be > 0"));
        }

        let rl = &self.rate_limit;
        if rl.max_tokens == 0 {
            return Err(invalid("rate_limit.max_tokens", "must be > 0"));
        }
        if rl.window_ms == 0 {
            return Err(invalid("rate_limit.window_ms", "must be > 0"));
        }
        if rl.backoff_min_ms > rl.backoff_max_ms {
            return Err(invalid(
                "rate_limit.backoff_min_ms",
                format!("{} exceeds backoff_max_ms {}", rl.backoff_min_ms, rl.backoff_max_ms),
            ));
        }
        if self.fetch.request_weight == 0 || self.fetch.request_weight > rl.max_tokens {
            return Err(invalid(
                "fetch.request_weight",
                format!("must be within 1..={}", rl.max_tokens),
            ));
        }

        let v = &self.validation;
        if !(v.outlier_z_threshold.is_finite() && v.outlier_z_threshold > 0.0) {
            return Err(invalid("validation.outlier_z_threshold", "must be a positive number"));
        }
        if !(v.min_volume.is_finite() && v.min_volume >= 0.0) {
            return Err(invalid("validation.min_volume", "must be a non-negative number"));
        }
        if !(v.gap_tolerance_ratio > 0.0 && v.gap_tolerance_ratio < 1.0) {
            return Err(invalid("validation.gap_tolerance_ratio", "must be within (0, 1)"));
        }

        if !(0.0..=1.0).contains(&self.min_quality) {
            return Err(invalid("min_quality", "must be within [0, 1]"));
        }
        if self.timeframes.is_empty() {
            return Err(invalid("timeframes", "at least one timeframe is required"));
        }
        if self.symbols.iter().any(|s| s.trim().is_empty()) {
            return Err(invalid("symbols", "symbol names must not be empty"));
        }
        if self.cache.enable_cache && self.cache.sweep_interval_ms == 0 {
            return Err(invalid("cache.sweep_interval_ms", "must be > 0"));
        }

        Ok(())
    }

    pub fn supports_timeframe(&self, timeframe: Timeframe) -> bool {
        self.timeframes.contains(&timeframe)
    }

    pub fn supports_symbol(&self, symbol: &str) -> bool {
        self.symbols.is_empty() || self.symbols.iter().any(|s| s == symbol)
    }
}

/// Defaults overlaid with `HISTDATA_*` variables. Values that fail to parse are
/// logged and ignored.
pub fn engine_config_from_env() -> EngineConfig {
    let mut cfg = EngineConfig::default();

    if let Some(url) = env_string("HISTDATA_BASE_URL") {
        cfg.fetch.base_url = url;
    }
    if let Some(ms) = env_parsed("HISTDATA_HTTP_TIMEOUT_MS") {
        cfg.fetch.request_timeout_ms = ms;
    }
    if let Some(limit) = env_parsed("HISTDATA_ROW_LIMIT") {
        cfg.fetch.row_limit = limit;
    }
    if let Some(weight) = env_parsed("HISTDATA_REQUEST_WEIGHT") {
        cfg.fetch.request_weight = weight;
    }

    if let Some(tokens) = env_parsed("HISTDATA_RATE_LIMIT_MAX_TOKENS") {
        cfg.rate_limit.max_tokens = tokens;
    }
    if let Some(ms) = env_parsed("HISTDATA_RATE_LIMIT_WINDOW_MS") {
        cfg.rate_limit.window_ms = ms;
    }

    if let Some(enabled) = env_bool("HISTDATA_ENABLE_CACHE") {
        cfg.cache.enable_cache = enabled;
    }
    if let Some(dir) = env_string("HISTDATA_CACHE_DIR") {
        cfg.cache.cache_directory = PathBuf::from(dir);
    }
    if let Some(raw) = env_string("HISTDATA_CACHE_TTL") {
        match parse_ttl_overrides(&raw) {
            Some(overrides) => cfg.cache.ttl_overrides = overrides,
            None => ignored("HISTDATA_CACHE_TTL", &raw),
        }
    }
    if let Some(ms) = env_parsed("HISTDATA_CACHE_SWEEP_MS") {
        cfg.cache.sweep_interval_ms = ms;
    }

    if let Some(enabled) = env_bool("HISTDATA_ENABLE_VALIDATION") {
        cfg.validation.enable_data_validation = enabled;
    }
    if let Some(enabled) = env_bool("HISTDATA_ENABLE_CLEANING") {
        cfg.validation.enable_data_cleaning = enabled;
    }
    if let Some(z) = env_parsed("HISTDATA_OUTLIER_Z") {
        cfg.validation.outlier_z_threshold = z;
    }
    if let Some(volume) = env_parsed("HISTDATA_MIN_VOLUME") {
        cfg.validation.min_volume = volume;
    }
    if let Some(cap) = env_parsed("HISTDATA_MAX_INTERPOLATED_PER_GAP") {
        cfg.validation.max_interpolated_per_gap = cap;
    }

    if let Some(raw) = env_string("HISTDATA_SYMBOLS") {
        cfg.symbols = parse_symbols(&raw);
    }
    if let Some(raw) = env_string("HISTDATA_TIMEFRAMES") {
        match parse_timeframes(&raw) {
            Some(timeframes) => cfg.timeframes = timeframes,
            None => ignored("HISTDATA_TIMEFRAMES", &raw),
        }
    }
    if let Some(min_quality) = env_parsed("HISTDATA_MIN_QUALITY") {
        cfg.min_quality = min_quality;
    }
    if let Some(retries) = env_parsed("HISTDATA_MAX_RETRIES") {
        cfg.max_retries = retries;
    }
    if let Some(ms) = env_parsed("HISTDATA_RETRY_BACKOFF_MS") {
        cfg.retry_backoff_ms = ms;
    }
    if let Some(verify) = env_bool("HISTDATA_VERIFY_CONNECTIVITY") {
        cfg.verify_connectivity = verify;
    }

    cfg
}

/// Parses `1m=5,1h=120` into per-timeframe TTL minutes.
pub fn parse_ttl_overrides(raw: &str) -> Option<BTreeMap<Timeframe, u64>> {
    let mut out = BTreeMap::new();
    for pair in raw.split(',').map(str::trim).filter(|p| !p.is_empty()) {
        let (tf, minutes) = pair.split_once('=')?;
        let timeframe = parse_timeframe(tf.trim()).ok()?;
        let minutes: u64 = minutes.trim().parse().ok()?;
        out.insert(timeframe, minutes);
    }
    Some(out)
}

fn parse_timeframes(raw: &str) -> Option<Vec<Timeframe>> {
    let mut out = Vec::new();
    for token in raw.split(',').map(str::trim).filter(|t| !t.is_empty()) {
        let timeframe = parse_timeframe(token).ok()?;
        if !out.contains(&timeframe) {
            out.push(timeframe);
        }
    }
    (!out.is_empty()).then_some(out)
}

fn parse_symbols(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(|s| s.trim().to_ascii_uppercase())
        .filter(|s| !s.is_empty())
        .collect()
}

fn env_string(name: &'static str) -> Option<String> {
    env::var(name)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn env_bool(name: &'static str) -> Option<bool> {
    let raw = env_string(name)?;
    let parsed = parse_bool(&raw);
    if parsed.is_none() {
        ignored(name, &raw);
    }
    parsed
}

fn env_parsed<T: FromStr>(name: &'static str) -> Option<T> {
    let raw = env_string(name)?;
    match raw.parse() {
        Ok(value) => Some(value),
        Err(_) => {
            ignored(name, &raw);
            None
        }
    }
}

fn ignored(name: &'static str, raw: &str) {
    warn!(
        component = "config",
        event = "config.env.ignored",
        variable = name,
        value = raw
    );
}

//! Shared logging configuration and initialization.

use std::env;
use std::net::SocketAddr;
use std::str::FromStr;

use thiserror::Error;
use tracing::info;
use tracing_subscriber::EnvFilter;

use crate::config::EngineConfig;

/// Output shape for the process-wide subscriber.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Json,
    Pretty,
    /// Single-line records, used by the one-shot fetch CLI.
    Compact,
}

impl FromStr for LogFormat {
    type Err = ();

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "json" => Ok(Self::Json),
            "pretty" => Ok(Self::Pretty),
            "compact" => Ok(Self::Compact),
            _ => Err(()),
        }
    }
}

/// Crates whose request-level chatter stays at `warn` unless a directive names them.
const QUIET_DEPENDENCIES: &[&str] = &["hyper", "hyper_util", "reqwest", "rustls", "h2"];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoggingConfig {
    pub level: String,
    pub format: LogFormat,
    pub include_target: bool,
    pub quiet_dependencies: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Pretty,
            include_target: true,
            quiet_dependencies: true,
        }
    }
}

impl LoggingConfig {
    /// Filter directive handed to `EnvFilter`. A level that already carries
    /// per-target directives is used verbatim.
    pub fn filter_directive(&self) -> String {
        let level = self.level.trim();
        if !self.quiet_dependencies || level.contains('=') {
            return level.to_string();
        }
        let mut directive = level.to_string();
        for dep in QUIET_DEPENDENCIES {
            directive.push_str(&format!(",{dep}=warn"));
        }
        directive
    }
}

#[derive(Debug, Error)]
pub enum LoggingInitError {
    #[error("logging already initialized: {0}")]
    AlreadyInitialized(#[from] tracing::subscriber::SetGlobalDefaultError),
}

pub fn logging_config_from_env() -> LoggingConfig {
    overlay_logging_env(LoggingConfig::default())
}

/// Applies the `HISTDATA_LOG_*` variables over a binary's own defaults.
pub fn overlay_logging_env(mut config: LoggingConfig) -> LoggingConfig {
    if let Some(level) = env_value("HISTDATA_LOG_LEVEL") {
        config.level = level;
    }
    if let Some(format) = env_value("HISTDATA_LOG_FORMAT").and_then(|raw| raw.parse().ok()) {
        config.format = format;
    }
    if let Some(flag) = env_value("HISTDATA_LOG_TARGET").and_then(|raw| parse_bool(&raw)) {
        config.include_target = flag;
    }
    if let Some(flag) = env_value("HISTDATA_LOG_QUIET_DEPS").and_then(|raw| parse_bool(&raw)) {
        config.quiet_dependencies = flag;
    }

    config
}

fn env_value(name: &str) -> Option<String> {
    env::var(name)
        .ok()
        .map(|raw| raw.trim().to_string())
        .filter(|raw| !raw.is_empty())
}

pub fn init_logging(config: &LoggingConfig) -> Result<(), LoggingInitError> {
    let env_filter = EnvFilter::try_new(config.filter_directive())
        .unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(config.include_target)
        .with_ansi(!matches!(config.format, LogFormat::Json));

    match config.format {
        LogFormat::Json => tracing::subscriber::set_global_default(builder.json().finish())?,
        LogFormat::Pretty => tracing::subscriber::set_global_default(builder.pretty().finish())?,
        LogFormat::Compact => {
            tracing::subscriber::set_global_default(builder.compact().finish())?
        }
    }

    Ok(())
}

pub fn log_app_start(app: &'static str, config: &LoggingConfig) {
    info!(
        component = app,
        event = "app.start",
        version = env!("CARGO_PKG_VERSION"),
        log_filter = %config.filter_directive(),
        log_format = ?config.format,
        include_target = config.include_target
    );
}

pub fn log_app_bind(app: &'static str, bound_addr: SocketAddr, routes: &[&str]) {
    info!(
        component = app,
        event = "app.bind",
        bind_addr = %bound_addr,
        routes = %routes.join(",")
    );
}

pub fn log_app_stop(app: &'static str, reason: &str) {
    info!(component = app, event = "app.stop", reason);
}

pub fn log_engine_config(app: &'static str, config: &EngineConfig) {
    let timeframes: Vec<&str> = config.timeframes.iter().map(|tf| tf.as_str()).collect();
    info!(
        component = app,
        event = "config.loaded",
        base_url = %config.fetch.base_url,
        cache_enabled = config.cache.enable_cache,
        cache_directory = %config.cache.cache_directory.display(),
        symbols = config.symbols.len(),
        timeframes = %timeframes.join(","),
        min_quality = config.min_quality,
        max_tokens = config.rate_limit.max_tokens
    );
}

pub(crate) fn parse_bool(raw: &str) -> Option<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

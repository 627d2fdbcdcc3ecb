//! Canonical OHLCV candle and the request/cache key model.

use std::fmt;

use chrono::{NaiveDate, TimeZone, Utc};
use serde::{Deserialize, Serialize};

use crate::timeframe::Timeframe;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Candle {
    /// Open time, epoch milliseconds UTC.
    pub timestamp: i64,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
    /// Set only on candles synthesized by gap interpolation.
    #[serde(default)]
    pub interpolated: bool,
}

impl Candle {
    pub fn new(timestamp: i64, open: f64, high: f64, low: f64, close: f64, volume: f64) -> Self {
        Self {
            timestamp,
            open,
            high,
            low,
            close,
            volume,
            interpolated: false,
        }
    }

    /// All five OHLCV fields present (finite) and non-zero.
    pub fn is_complete(&self) -> bool {
        [self.open, self.high, self.low, self.close, self.volume]
            .iter()
            .all(|value| value.is_finite() && *value > 0.0)
    }

    pub fn is_consistent(&self) -> bool {
        self.high >= self.open.max(self.close)
            && self.low <= self.open.min(self.close)
            && self.high >= self.low
    }
}

/// Exact-range identity of one cached result set.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CacheKey {
    pub symbol: String,
    pub timeframe: Timeframe,
    pub start_ms: i64,
    pub end_ms: i64,
}

impl CacheKey {
    pub fn new(symbol: impl Into<String>, timeframe: Timeframe, start_ms: i64, end_ms: i64) -> Self {
        Self {
            symbol: symbol.into(),
            timeframe,
            start_ms,
            end_ms,
        }
    }

    /// Deterministic `SYMBOL_TIMEFRAME_START_END` rendering used as the durable record name.
    pub fn as_string(&self) -> String {
        format!(
            "{}_{}_{}_{}",
            self.symbol,
            self.timeframe.as_str(),
            format_key_ts(self.start_ms),
            format_key_ts(self.end_ms)
        )
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.as_string())
    }
}

/// One validated `getHistoricalData` request window, `[start_ms, end_ms]` UTC.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoricalRequest {
    pub symbol: String,
    pub timeframe: Timeframe,
    pub start_ms: i64,
    pub end_ms: i64,
}

impl HistoricalRequest {
    pub fn from_dates(
        symbol: impl Into<String>,
        timeframe: Timeframe,
        start: NaiveDate,
        end: NaiveDate,
    ) -> Self {
        Self {
            symbol: symbol.into(),
            timeframe,
            start_ms: day_start_ms(start),
            end_ms: day_start_ms(end),
        }
    }

    pub fn cache_key(&self) -> CacheKey {
        CacheKey::new(self.symbol.clone(), self.timeframe, self.start_ms, self.end_ms)
    }
}

pub fn day_start_ms(date: NaiveDate) -> i64 {
    date.and_hms_opt(0, 0, 0)
        .map(|dt| dt.and_utc().timestamp_millis())
        .unwrap_or_default()
}

fn format_key_ts(ts_ms: i64) -> String {
    let Some(dt) = Utc.timestamp_millis_opt(ts_ms).single() else {
        return ts_ms.to_string();
    };
    if ts_ms.rem_euclid(86_400_000) == 0 {
        dt.format("%Y-%m-%d").to_string()
    } else {
        dt.format("%Y-%m-%dT%H%M%SZ").to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn completeness_rejects_zero_and_non_finite_fields() {
        assert!(Candle::new(0, 1.0, 2.0, 0.5, 1.5, 10.0).is_complete());
        assert!(!Candle::new(0, 1.0, 2.0, 0.5, 1.5, 0.0).is_complete());
        assert!(!Candle::new(0, f64::NAN, 2.0, 0.5, 1.5, 10.0).is_complete());
        assert!(!Candle::new(0, 1.0, f64::INFINITY, 0.5, 1.5, 10.0).is_complete());
    }

    #[test]
    fn consistency_checks_all_three_inequalities() {
        assert!(Candle::new(0, 1.0, 2.0, 0.5, 1.5, 10.0).is_consistent());
        // high below close
        assert!(!Candle::new(0, 1.0, 1.2, 0.5, 1.5, 10.0).is_consistent());
        // low above open
        assert!(!Candle::new(0, 1.0, 2.0, 1.1, 1.5, 10.0).is_consistent());
    }

    #[test]
    fn cache_key_renders_dates_for_day_aligned_windows() {
        let req = HistoricalRequest::from_dates(
            "BTCUSDT",
            Timeframe::H1,
            NaiveDate::from_ymd_opt(2024, 1, 1).unwrap(),
            NaiveDate::from_ymd_opt(2024, 1, 7).unwrap(),
        );
        assert_eq!(req.start_ms, 1_704_067_200_000);
        assert_eq!(
            req.cache_key().as_string(),
            "BTCUSDT_1h_2024-01-01_2024-01-07"
        );
    }

    #[test]
    fn cache_key_keeps_intraday_precision() {
        let key = CacheKey::new("ETHUSDT", Timeframe::M1, 1_704_067_200_000 + 90_000, 1_704_153_600_000);
        assert_eq!(key.as_string(), "ETHUSDT_1m_2024-01-01T000130Z_2024-01-02");
    }
}

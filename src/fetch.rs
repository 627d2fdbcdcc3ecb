//! Upstream kline fetching over the exchange REST API.

use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::candle::Candle;
use crate::timeframe::Timeframe;

pub const BINANCE_REST_BASE_URL: &str = "https://api.binance.com";
const KLINES_PATH: &str = "/api/v3/klines";
const SERVER_TIME_PATH: &str = "/api/v3/time";
const KLINE_ROW_MIN_COLUMNS: usize = 6;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchConfig {
    pub base_url: String,
    pub request_timeout_ms: u64,
    /// Server-side row cap per request; wider windows are paged.
    pub row_limit: u32,
    /// Rate-limit weight debited per kline request.
    pub request_weight: u32,
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            base_url: BINANCE_REST_BASE_URL.to_string(),
            request_timeout_ms: 10_000,
            row_limit: 1_500,
            request_weight: 1,
        }
    }
}

/// One normalized response page.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct KlinePage {
    pub candles: Vec<Candle>,
    /// Raw rows that could not be mapped onto a candle.
    pub dropped_rows: u64,
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("HTTP client build error: {0}")]
    HttpClientBuild(String),
    #[error("HTTP request failed for {url}: {message}")]
    Transport {
        url: String,
        message: String,
        timed_out: bool,
    },
    #[error("upstream returned HTTP {status}: {message}")]
    Upstream {
        status: u16,
        code: Option<i64>,
        message: String,
    },
    #[error("malformed response from {url}: {message}")]
    MalformedBody { url: String, message: String },
}

impl FetchError {
    /// Transport failures and 429/5xx are worth another attempt; other 4xx are caller bugs.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::HttpClientBuild(_) => false,
            Self::Transport { .. } | Self::MalformedBody { .. } => true,
            Self::Upstream { status, .. } => *status == 429 || (500..600).contains(status),
        }
    }
}

#[async_trait]
pub trait KlineFetcher: Send + Sync + 'static {
    /// Fetches at most one page of candles with open time in `[start_ms, end_ms]`.
    async fn fetch(
        &self,
        symbol: &str,
        timeframe: Timeframe,
        start_ms: i64,
        end_ms: i64,
    ) -> Result<KlinePage, FetchError>;

    /// Exchange clock in epoch milliseconds; doubles as the connectivity check.
    async fn server_time(&self) -> Result<i64, FetchError>;
}

pub struct BinanceRestClient {
    client: reqwest::Client,
    base_url: String,
    row_limit: u32,
}

impl BinanceRestClient {
    pub fn new(cfg: &FetchConfig) -> Result<Self, FetchError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_millis(cfg.request_timeout_ms))
            .build()
            .map_err(|err| FetchError::HttpClientBuild(err.to_string()))?;

        Ok(Self {
            client,
            base_url: cfg.base_url.trim_end_matches('/').to_string(),
            row_limit: cfg.row_limit,
        })
    }

    fn klines_url(&self, symbol: &str, timeframe: Timeframe, start_ms: i64, end_ms: i64) -> String {
        format!(
            "{}{KLINES_PATH}?symbol={}&interval={}&startTime={}&endTime={}&limit={}",
            self.base_url,
            symbol,
            timeframe.as_str(),
            start_ms,
            end_ms,
            self.row_limit
        )
    }

    async fn get_bytes(&self, url: &str) -> Result<Vec<u8>, FetchError> {
        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|err| transport_error(url, &err))?;

        let status = response.status();
        let body = response
            .bytes()
            .await
            .map_err(|err| transport_error(url, &err))?;

        if !status.is_success() {
            return Err(upstream_error(status.as_u16(), &body));
        }

        Ok(body.to_vec())
    }
}

#[async_trait]
impl KlineFetcher for BinanceRestClient {
    async fn fetch(
        &self,
        symbol: &str,
        timeframe: Timeframe,
        start_ms: i64,
        end_ms: i64,
    ) -> Result<KlinePage, FetchError> {
        let url = self.klines_url(symbol, timeframe, start_ms, end_ms);
        debug!(
            component = "fetch",
            event = "fetch.request",
            url = %url
        );

        let body = self.get_bytes(&url).await?;
        let page = parse_klines_payload(&url, &body)?;

        info!(
            component = "fetch",
            event = "fetch.page",
            symbol,
            timeframe = timeframe.as_str(),
            rows = page.candles.len(),
            dropped_rows = page.dropped_rows
        );
        Ok(page)
    }

    async fn server_time(&self) -> Result<i64, FetchError> {
        #[derive(Deserialize)]
        #[serde(rename_all = "camelCase")]
        struct ServerTime {
            server_time: i64,
        }

        let url = format!("{}{SERVER_TIME_PATH}", self.base_url);
        let body = self.get_bytes(&url).await?;
        let parsed: ServerTime =
            serde_json::from_slice(&body).map_err(|err| FetchError::MalformedBody {
                url: url.clone(),
                message: err.to_string(),
            })?;
        Ok(parsed.server_time)
    }
}

/// Maps a kline array payload onto candles, dropping malformed rows one by one.
pub fn parse_klines_payload(url: &str, body: &[u8]) -> Result<KlinePage, FetchError> {
    let payload: Value = serde_json::from_slice(body).map_err(|err| FetchError::MalformedBody {
        url: url.to_string(),
        message: err.to_string(),
    })?;
    let rows = payload.as_array().ok_or_else(|| FetchError::MalformedBody {
        url: url.to_string(),
        message: "expected top-level array".to_string(),
    })?;

    let mut page = KlinePage {
        candles: Vec::with_capacity(rows.len()),
        dropped_rows: 0,
    };

    for (idx, row) in rows.iter().enumerate() {
        match parse_kline_row(row) {
            Ok(candle) => page.candles.push(candle),
            Err(reason) => {
                page.dropped_rows += 1;
                debug!(
                    component = "fetch",
                    event = "fetch.row.dropped",
                    row_index = idx,
                    reason = %reason
                );
            }
        }
    }

    if page.dropped_rows > 0 {
        warn!(
            component = "fetch",
            event = "fetch.rows.dropped",
            dropped_rows = page.dropped_rows,
            kept_rows = page.candles.len()
        );
    }

    Ok(page)
}

#[derive(Debug, Error, PartialEq, Eq)]
enum RowError {
    #[error("row is not an array")]
    NotArray,
    #[error("row has {found} columns, expected at least {KLINE_ROW_MIN_COLUMNS}")]
    TooShort { found: usize },
    #[error("failed to parse field {0}")]
    Field(&'static str),
}

fn parse_kline_row(value: &Value) -> Result<Candle, RowError> {
    let row = value.as_array().ok_or(RowError::NotArray)?;
    if row.len() < KLINE_ROW_MIN_COLUMNS {
        return Err(RowError::TooShort { found: row.len() });
    }

    Ok(Candle {
        timestamp: json_i64(&row[0]).ok_or(RowError::Field("open_time"))?,
        open: json_f64(&row[1]).ok_or(RowError::Field("open"))?,
        high: json_f64(&row[2]).ok_or(RowError::Field("high"))?,
        low: json_f64(&row[3]).ok_or(RowError::Field("low"))?,
        close: json_f64(&row[4]).ok_or(RowError::Field("close"))?,
        volume: json_f64(&row[5]).ok_or(RowError::Field("volume"))?,
        interpolated: false,
    })
}

fn json_i64(value: &Value) -> Option<i64> {
    value
        .as_i64()
        .or_else(|| value.as_str().and_then(|text| text.trim().parse().ok()))
}

fn json_f64(value: &Value) -> Option<f64> {
    value
        .as_f64()
        .or_else(|| value.as_str().and_then(|text| text.trim().parse().ok()))
}

fn transport_error(url: &str, err: &reqwest::Error) -> FetchError {
    FetchError::Transport {
        url: url.to_string(),
        message: err.to_string(),
        timed_out: err.is_timeout(),
    }
}

fn upstream_error(status: u16, body: &[u8]) -> FetchError {
    #[derive(Deserialize)]
    struct ErrorBody {
        code: Option<i64>,
        msg: Option<String>,
    }

    let parsed = serde_json::from_slice::<ErrorBody>(body).ok();
    let code = parsed.as_ref().and_then(|b| b.code);
    let message = parsed
        .and_then(|b| b.msg)
        .unwrap_or_else(|| format!("unexpected HTTP status {status}"));

    FetchError::Upstream {
        status,
        code,
        message,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const URL: &str = "http://localhost/api/v3/klines";

    #[test]
    fn payload_rows_map_positionally_from_strings_and_numbers() {
        let body = br#"[
            [1704067200000,"100.0","101.5","99.5","100.5","1500.25",1704070799999,"150000",42,"700","70000","0"],
            ["1704070800000",100.5,102,100,101.75,2000,1704074399999,"1","2","3","4","0"]
        ]"#;

        let page = parse_klines_payload(URL, body).unwrap();
        assert_eq!(page.dropped_rows, 0);
        assert_eq!(page.candles.len(), 2);
        assert_eq!(
            page.candles[0],
            Candle::new(1_704_067_200_000, 100.0, 101.5, 99.5, 100.5, 1500.25)
        );
        assert_eq!(page.candles[1].timestamp, 1_704_070_800_000);
        assert_eq!(page.candles[1].close, 101.75);
        assert!(!page.candles[1].interpolated);
    }

    #[test]
    fn malformed_rows_are_dropped_and_counted() {
        let body = br#"[
            [1704067200000,"100","101","99","100.5","10"],
            "not-a-row",
            [1704070800000,"100"],
            [1704074400000,"abc","101","99","100.5","10"],
            [1704078000000,"100","101","99","100.5","10"]
        ]"#;

        let page = parse_klines_payload(URL, body).unwrap();
        assert_eq!(page.candles.len(), 2);
        assert_eq!(page.dropped_rows, 3);
    }

    #[test]
    fn non_array_payload_fails_the_batch() {
        let err = parse_klines_payload(URL, br#"{"unexpected":true}"#).unwrap_err();
        assert!(matches!(err, FetchError::MalformedBody { .. }));
        assert!(err.is_retryable());
    }

    #[test]
    fn row_errors_name_the_failing_field() {
        let row: Value = serde_json::from_str(r#"[1,"1","x","1","1","1"]"#).unwrap();
        assert_eq!(parse_kline_row(&row), Err(RowError::Field("high")));
        let short: Value = serde_json::from_str("[1,2]").unwrap();
        assert_eq!(parse_kline_row(&short), Err(RowError::TooShort { found: 2 }));
    }

    #[test]
    fn upstream_error_uses_exchange_message_when_parseable() {
        let err = upstream_error(400, br#"{"code":-1121,"msg":"Invalid symbol."}"#);
        match &err {
            FetchError::Upstream {
                status,
                code,
                message,
            } => {
                assert_eq!(*status, 400);
                assert_eq!(*code, Some(-1121));
                assert_eq!(message, "Invalid symbol.");
            }
            other => panic!("unexpected error: {other:?}"),
        }
        assert!(!err.is_retryable());

        let opaque = upstream_error(502, b"<html>bad gateway</html>");
        assert!(opaque.to_string().contains("unexpected HTTP status 502"));
        assert!(opaque.is_retryable());
    }

    #[test]
    fn retry_classification_follows_status_class() {
        let status = |status| FetchError::Upstream {
            status,
            code: None,
            message: String::new(),
        };
        assert!(status(429).is_retryable());
        assert!(status(500).is_retryable());
        assert!(status(503).is_retryable());
        assert!(!status(400).is_retryable());
        assert!(!status(404).is_retryable());
        assert!(FetchError::Transport {
            url: URL.to_string(),
            message: "timeout".to_string(),
            timed_out: true,
        }
        .is_retryable());
    }

    #[test]
    fn klines_url_carries_window_interval_and_row_cap() {
        let client = BinanceRestClient::new(&FetchConfig {
            base_url: "http://127.0.0.1:9/".to_string(),
            ..FetchConfig::default()
        })
        .unwrap();

        let url = client.klines_url("BTCUSDT", Timeframe::H1, 10, 20);
        assert_eq!(
            url,
            "http://127.0.0.1:9/api/v3/klines?symbol=BTCUSDT&interval=1h&startTime=10&endTime=20&limit=1500"
        );
    }
}

use std::io;
use std::io::Write;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use axum::{
    body::Body,
    http::{Request, StatusCode},
};
use chrono::NaiveDate;
use histdata::{
    log_app_bind, log_app_start, log_app_stop, log_engine_config, run_pipeline, stats_router,
    CacheConfig, Candle, EngineConfig, FetchError, FixedJitter, HistoricalDataEngine,
    KlineFetcher, KlinePage, LoggingConfig, ManualClock, RateLimiter, RateLimiterConfig,
    Timeframe, ValidationConfig, ROUTES,
};
use tower::util::ServiceExt;
use tracing::dispatcher::with_default;
use tracing::Level;
use tracing_subscriber::fmt::writer::MakeWriter;

const T0: i64 = 1_704_067_200_000;

#[derive(Clone, Default)]
struct SharedWriter {
    inner: Arc<Mutex<Vec<u8>>>,
}

impl SharedWriter {
    fn output_string(&self) -> String {
        let bytes = self
            .inner
            .lock()
            .expect("writer lock should not be poisoned");
        String::from_utf8_lossy(&bytes).to_string()
    }
}

struct SharedWriterGuard {
    inner: Arc<Mutex<Vec<u8>>>,
}

impl<'a> MakeWriter<'a> for SharedWriter {
    type Writer = SharedWriterGuard;

    fn make_writer(&'a self) -> Self::Writer {
        SharedWriterGuard {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl Write for SharedWriterGuard {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let mut out = self
            .inner
            .lock()
            .expect("writer lock should not be poisoned");
        out.extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

fn capture_logs(max_level: Level, f: impl FnOnce()) -> String {
    let writer = SharedWriter::default();
    let subscriber = tracing_subscriber::fmt()
        .json()
        .with_ansi(false)
        .with_max_level(max_level)
        .with_writer(writer.clone())
        .finish();
    let dispatch = tracing::Dispatch::new(subscriber);

    with_default(&dispatch, f);
    writer.output_string()
}

fn block_on<F: std::future::Future>(fut: F) -> F::Output {
    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .expect("single-thread runtime should build")
        .block_on(fut)
}

struct RejectingExchange;

#[async_trait]
impl KlineFetcher for RejectingExchange {
    async fn fetch(
        &self,
        _symbol: &str,
        _timeframe: Timeframe,
        _start_ms: i64,
        _end_ms: i64,
    ) -> Result<KlinePage, FetchError> {
        Err(FetchError::Upstream {
            status: 400,
            code: Some(-1121),
            message: "Invalid symbol.".to_string(),
        })
    }

    async fn server_time(&self) -> Result<i64, FetchError> {
        Ok(T0)
    }
}

fn rejecting_engine(dir: &std::path::Path) -> Arc<HistoricalDataEngine> {
    let cfg = EngineConfig {
        cache: CacheConfig {
            cache_directory: dir.to_path_buf(),
            ..CacheConfig::default()
        },
        ..EngineConfig::default()
    };
    Arc::new(
        HistoricalDataEngine::with_components(
            cfg,
            Arc::new(RejectingExchange),
            Arc::new(ManualClock::new(T0)),
            Arc::new(FixedJitter),
        )
        .expect("engine should build"),
    )
}

#[test]
fn server_lifecycle_helpers_emit_baseline_events() {
    let logs = capture_logs(Level::INFO, || {
        log_app_start("histdata_server", &LoggingConfig::default());
        log_engine_config("histdata_server", &EngineConfig::default());
        log_app_bind(
            "histdata_server",
            SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 8080),
            &ROUTES,
        );
        log_app_stop("histdata_server", "ctrl_c");
    });

    assert!(logs.contains("\"event\":\"app.start\""));
    assert!(logs.contains("\"event\":\"config.loaded\""));
    assert!(logs.contains("\"event\":\"app.bind\""));
    assert!(logs.contains("\"routes\":\"/health,/stats,/klines\""));
    assert!(logs.contains("\"event\":\"app.stop\""));
    assert!(logs.contains("\"log_filter\":\"info,hyper=warn"));
    assert_eq!(logs.matches("\"component\":\"histdata_server\"").count(), 4);
}

#[test]
fn validation_warns_on_removed_rows_and_gaps() {
    let series = vec![
        Candle::new(T0, 100.0, 101.0, 99.0, 100.5, 5_000.0),
        Candle::new(T0 + 60_000, 100.0, 99.0, 101.0, 100.5, 5_000.0),
        Candle::new(T0 + 120_000, 100.0, 101.0, 99.0, 100.5, 5_000.0),
        Candle::new(T0 + 240_000, 100.0, 101.0, 99.0, 100.5, 5_000.0),
    ];

    let logs = capture_logs(Level::INFO, || {
        let (_, report) = run_pipeline(series, 0, Timeframe::M1, &ValidationConfig::default());
        assert_eq!(report.inconsistent_removed, 1);
    });

    assert!(logs.contains("\"event\":\"validation.stage\""));
    assert!(logs.contains("\"stage\":\"consistency\""));
    assert!(logs.contains("\"event\":\"validation.stage.gaps\""));
    assert!(!logs.contains("\"stage\":\"ordering\""));
}

#[test]
fn upstream_rejection_emits_request_failed_event() {
    let dir = tempfile::tempdir().unwrap();
    let engine = rejecting_engine(dir.path());

    let logs = capture_logs(Level::INFO, || {
        block_on(async {
            let err = engine
                .get_historical_data(
                    "BTCUSDT",
                    "1h",
                    NaiveDate::from_ymd_opt(2024, 1, 1).unwrap(),
                    NaiveDate::from_ymd_opt(2024, 1, 2).unwrap(),
                )
                .await
                .expect_err("rejected symbol should fail");
            assert!(!err.is_retryable());
        });
    });

    assert!(logs.contains("\"event\":\"engine.fetch.start\""));
    assert!(logs.contains("\"event\":\"engine.request.failed\""));
    assert!(!logs.contains("\"event\":\"engine.fetch.retry\""));
}

#[test]
fn exhausted_bucket_warns_once_per_wait() {
    let limiter = RateLimiter::new(
        RateLimiterConfig {
            max_tokens: 1,
            backoff_min_ms: 1,
            backoff_max_ms: 2,
            ..RateLimiterConfig::default()
        },
        Arc::new(FixedJitter),
    );

    let logs = capture_logs(Level::INFO, || {
        block_on(async {
            limiter.acquire(1).await;
            let blocked = tokio::time::timeout(Duration::from_millis(30), limiter.acquire(1)).await;
            assert!(blocked.is_err());
        });
    });

    assert_eq!(logs.matches("\"event\":\"rate_limit.exhausted\"").count(), 1);
}

#[test]
fn stats_route_emits_http_stats_event() {
    let dir = tempfile::tempdir().unwrap();
    let engine = rejecting_engine(dir.path());

    let logs = capture_logs(Level::INFO, || {
        block_on(async {
            let response = stats_router(engine)
                .oneshot(
                    Request::builder()
                        .uri("/stats")
                        .body(Body::empty())
                        .expect("request should build"),
                )
                .await
                .expect("stats request should succeed");

            assert_eq!(response.status(), StatusCode::OK);
        });
    });

    assert!(logs.contains("\"event\":\"http.stats.request\""));
}

#![cfg(feature = "live-binance-tests")]

use chrono::{Duration, Utc};
use histdata::{
    BinanceRestClient, CacheConfig, EngineConfig, FetchConfig, HistoricalDataEngine, KlineFetcher,
    Timeframe,
};
use tokio::time::{sleep, Duration as TokioDuration};

#[tokio::test]
async fn live_server_time_is_close_to_local_clock() {
    let client = BinanceRestClient::new(&FetchConfig::default()).expect("client should build");
    let server_ms = client.server_time().await.expect("server time should resolve");

    let skew = (server_ms - Utc::now().timestamp_millis()).abs();
    assert!(skew < 60_000, "clock skew too large: {skew}ms");
}

#[tokio::test]
async fn live_hourly_page_is_ordered_and_consistent() {
    let client = BinanceRestClient::new(&FetchConfig::default()).expect("client should build");
    let end_ms = Utc::now().timestamp_millis();
    let start_ms = end_ms - 24 * Timeframe::H1.interval_ms();

    let page = client
        .fetch("BTCUSDT", Timeframe::H1, start_ms, end_ms)
        .await
        .expect("klines should resolve");

    assert!(!page.candles.is_empty());
    assert_eq!(page.dropped_rows, 0);
    assert!(page
        .candles
        .windows(2)
        .all(|w| w[0].timestamp < w[1].timestamp));
    assert!(page.candles.iter().all(|c| c.is_consistent()));
}

#[tokio::test]
async fn live_engine_serves_second_request_from_cache() {
    let dir = tempfile::tempdir().unwrap();
    let engine = HistoricalDataEngine::new(EngineConfig {
        cache: CacheConfig {
            cache_directory: dir.path().to_path_buf(),
            ..CacheConfig::default()
        },
        ..EngineConfig::default()
    })
    .expect("engine should build");
    engine.initialize().await.expect("binance should be reachable");

    let end = Utc::now().date_naive() - Duration::days(2);
    let start = end - Duration::days(3);

    let first = engine
        .get_historical_data("ETHUSDT", "4h", start, end)
        .await
        .expect("live window should pass validation");
    sleep(TokioDuration::from_millis(50)).await;
    let second = engine
        .get_historical_data("ETHUSDT", "4h", start, end)
        .await
        .expect("cached window should be served");

    assert_eq!(first.len(), second.len());
    let stats = engine.get_system_stats();
    assert_eq!(stats.request_counts.cache_hits, 1);
    assert_eq!(stats.request_counts.cache_misses, 1);
}

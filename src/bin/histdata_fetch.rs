use chrono::NaiveDate;
use histdata::{
    engine_config_from_env, init_logging, log_app_start, log_engine_config, overlay_logging_env,
    HistoricalDataEngine, LogFormat, LoggingConfig,
};

const USAGE: &str = "usage: histdata_fetch SYMBOL TIMEFRAME START_DATE END_DATE (dates as YYYY-MM-DD)";

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let logging_cfg = overlay_logging_env(LoggingConfig {
        format: LogFormat::Compact,
        ..LoggingConfig::default()
    });
    init_logging(&logging_cfg)?;
    log_app_start("histdata_fetch", &logging_cfg);

    let args: Vec<String> = std::env::args().skip(1).collect();
    let [symbol, timeframe, start, end] = args.as_slice() else {
        return Err(USAGE.into());
    };
    let start = NaiveDate::parse_from_str(start, "%Y-%m-%d")?;
    let end = NaiveDate::parse_from_str(end, "%Y-%m-%d")?;

    let engine_cfg = engine_config_from_env();
    log_engine_config("histdata_fetch", &engine_cfg);
    let engine = HistoricalDataEngine::new(engine_cfg)?;
    engine.initialize().await?;

    let candles = engine
        .get_historical_data(symbol, timeframe, start, end)
        .await?;
    let stats = engine.get_system_stats();

    println!(
        "{} {} {}..{}: {} candles ({} interpolated)",
        symbol.to_ascii_uppercase(),
        timeframe,
        start,
        end,
        candles.len(),
        candles.iter().filter(|c| c.interpolated).count()
    );
    if let (Some(first), Some(last)) = (candles.first(), candles.last()) {
        println!("first open_time={} close={}", first.timestamp, first.close);
        println!("last  open_time={} close={}", last.timestamp, last.close);
    }
    println!(
        "upstream_calls={} retries={} cleaned_records={} dropped_rows={} cache_size_bytes={}",
        stats.request_counts.upstream_calls,
        stats.request_counts.retries,
        stats.cleaned_record_count,
        stats.dropped_row_count,
        stats.cache_size_bytes
    );

    Ok(())
}

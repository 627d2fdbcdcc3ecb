use std::{net::SocketAddr, sync::Arc};

use histdata::{
    engine_config_from_env, init_logging, log_app_bind, log_app_start, log_app_stop,
    log_engine_config, logging_config_from_env, stats_router, HistoricalDataEngine, ROUTES,
};
use tracing::warn;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let logging_cfg = logging_config_from_env();
    init_logging(&logging_cfg)?;
    log_app_start("histdata_server", &logging_cfg);

    let addr: SocketAddr = std::env::var("HISTDATA_SERVER_ADDR")
        .unwrap_or_else(|_| "127.0.0.1:8080".to_string())
        .parse()?;

    let engine_cfg = engine_config_from_env();
    log_engine_config("histdata_server", &engine_cfg);

    let engine = Arc::new(HistoricalDataEngine::new(engine_cfg)?);
    // A failed connectivity check leaves the service up; /health reports it.
    if let Err(err) = engine.initialize().await {
        warn!(
            component = "histdata_server",
            event = "engine.init.degraded",
            error = %err
        );
    }
    let _maintenance = engine.spawn_maintenance();

    let app = stats_router(Arc::clone(&engine));
    let listener = tokio::net::TcpListener::bind(addr).await?;
    let bound_addr = listener.local_addr()?;

    log_app_bind("histdata_server", bound_addr, &ROUTES);
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    log_app_stop("histdata_server", "ctrl_c");

    Ok(())
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        warn!(
            component = "histdata_server",
            event = "app.signal.failed",
            error = %err
        );
        std::future::pending::<()>().await;
    }
}

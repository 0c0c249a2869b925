use std::net::SocketAddr;
use std::process::ExitCode;

use tokio::net::TcpListener;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use mqtt_relay::config::LogFormat;
use mqtt_relay::{AppState, Config, broker, build_router, metrics, utils};

#[tokio::main]
async fn main() -> ExitCode {
    let config = Config::from_env();

    // Logging comes up before the config is checked so its errors are visible.
    let (log_level, log_format) = match &config {
        Ok(config) => (config.log_level.as_str(), config.log_format),
        Err(_) => ("info", LogFormat::Pretty),
    };
    init_tracing(log_level, log_format);

    info!("Starting MQTT relay v{}", env!("CARGO_PKG_VERSION"));

    let config = match config {
        Ok(config) => config,
        Err(e) => {
            error!("Configuration error: {e}");
            return ExitCode::from(exitcode::CONFIG as u8);
        }
    };

    match run(config).await {
        Ok(()) => ExitCode::from(exitcode::OK as u8),
        Err(exit_code) => ExitCode::from(exit_code as u8),
    }
}

fn init_tracing(log_level: &str, format: LogFormat) {
    let filter = EnvFilter::try_new(log_level).unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(true);

    match format {
        LogFormat::Pretty => builder.init(),
        LogFormat::Json => builder.json().init(),
    }
}

/// Run the application, returning an exit code on error.
async fn run(config: Config) -> Result<(), exitcode::ExitCode> {
    info!(
        host = %config.host,
        port = %config.port,
        broker_kind = ?config.broker_kind,
        broker = %config.broker_addr(),
        relay_topic = %config.relay_topic,
        consumer_topic = %config.consumer_topic,
        consumer_enabled = config.consumer_enabled,
        "Configuration loaded"
    );

    if let Some(metrics_addr) = config.metrics_addr() {
        metrics::try_init_metrics(metrics_addr);
    }

    let broker = broker::build_broker(&config);
    let state = AppState::new(broker, config.clone());
    let app = build_router(state.clone());

    let addr: SocketAddr = config.server_addr().parse().map_err(|e| {
        error!("Invalid server address: {e}");
        exitcode::CONFIG
    })?;
    let listener = TcpListener::bind(addr).await.map_err(|e| {
        error!("Failed to bind to {addr}: {e}");
        exitcode::UNAVAILABLE
    })?;

    info!("Server listening on http://{addr}");
    info!("API endpoints:");
    info!("  GET  /                      - Banner");
    info!("  GET  /health                - Health check");
    info!("  GET  /ready                 - Readiness check");
    info!("  POST /sendMessage           - Publish to the relay topic");
    info!("  GET  /messages              - Stream the relay topic (SSE)");
    info!("  GET  /publish/{{message}}     - Publish to the consumer topic");
    info!("  GET  /subscriber/messages   - Buffered consumer messages");
    info!("  GET  /subscriber/clear      - Clear the consumer buffer");
    info!("  GET  /subscriber/status     - Consumer connector status");
    info!("  POST /subscriber/restart    - Restart a stopped consumer");

    let result = axum::serve(listener, app)
        .with_graceful_shutdown({
            let state = state.clone();
            async move {
                utils::shutdown_signal().await;
                state.begin_shutdown();
            }
        })
        .await;

    info!("HTTP server stopped, shutting down background tasks...");
    state.shutdown().await;

    result.map_err(|e| {
        error!("Server error: {e}");
        exitcode::SOFTWARE
    })?;

    info!(uptime_secs = state.uptime_seconds(), "Server shutdown complete");
    Ok(())
}

//! Feed Multiplexer Binary
//!
//! Connects to the upstream market data feed, subscribes the configured
//! tickers and supervises the connection, reconnecting with backoff when the
//! upstream stream ends.
//!
//! # Usage
//!
//! ```bash
//! FEED_SYMBOLS=BTCUSDT,ETHUSDT cargo run --bin feed-multiplexer
//! ```
//!
//! # Environment Variables
//!
//! ## Required
//! - `FEED_SYMBOLS`: Comma separated tickers
//!
//! ## Optional
//! - `FEED_WS_URL`: Upstream endpoint (default: <wss://fstream.asterdex.com/ws>)
//! - `FEED_STREAMS`: Any of `bbo,book,trades` (default: bbo,trades)
//! - `FEED_HEALTH_PORT`: Health check HTTP port (default: 8083)
//! - `FEED_CONSUMER_CAPACITY`: Queue size per consumer (default: 4096)
//! - `FEED_RECONNECT_DELAY_INITIAL_MS`: First backoff delay (default: 500)
//! - `FEED_RECONNECT_DELAY_MAX_SECS`: Backoff cap (default: 30)
//! - `FEED_RECONNECT_DELAY_MULTIPLIER`: Backoff growth (default: 2.0)
//! - `FEED_MAX_RECONNECT_ATTEMPTS`: 0 for unlimited (default: 0)
//! - `OTEL_ENABLED`: Enable OpenTelemetry (default: true)
//! - `OTEL_EXPORTER_OTLP_ENDPOINT`: OTLP endpoint (default: <http://localhost:4318>)
//! - `OTEL_SERVICE_NAME`: Service name (default: feed-multiplexer)
//! - `RUST_LOG`: Log level (default: info)

use std::fmt::Debug;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use feed_multiplexer::infrastructure::metrics;
use feed_multiplexer::infrastructure::telemetry;
use feed_multiplexer::{
    AsterCodec, Clock, Consumer, ConsumerKind, ConsumerQueue, FeedCodec, FeedConfig,
    FeedMultiplexer, HealthServer, HealthServerState, MultiplexerError, ReconnectPolicy,
    StreamKey, SystemClock, Ticker, WebSocketTransport, init_metrics,
};
use tokio::signal;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Graceful shutdown timeout.
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(30);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    rustls::crypto::ring::default_provider()
        .install_default()
        .expect("Failed to install rustls crypto provider");

    load_dotenv();

    let telemetry_guard = telemetry::init();

    tracing::info!(
        otlp = telemetry_guard.is_exporting(),
        "Starting feed multiplexer"
    );

    let _metrics_handle = init_metrics();

    let config = FeedConfig::from_env().context("invalid feed configuration")?;
    log_config(&config);

    let shutdown_token = CancellationToken::new();

    let health_state = Arc::new(HealthServerState::new(
        env!("CARGO_PKG_VERSION").to_string(),
    ));
    let health_server = HealthServer::new(
        config.server.health_port,
        Arc::clone(&health_state),
        shutdown_token.clone(),
    );

    tokio::spawn(async move {
        if let Err(e) = health_server.run().await {
            tracing::error!(error = %e, "Health server error");
        }
    });

    tokio::spawn(await_shutdown(shutdown_token.clone()));

    let result = supervise(&config, &health_state, &shutdown_token).await;

    shutdown_token.cancel();

    match &result {
        Ok(()) => tracing::info!("Feed multiplexer stopped"),
        Err(e) => tracing::error!(error = %e, "Feed multiplexer stopped"),
    }
    result
}

/// Keep one multiplexer connected until shutdown.
async fn supervise(
    config: &FeedConfig,
    health: &HealthServerState,
    shutdown: &CancellationToken,
) -> anyhow::Result<()> {
    let codec: Arc<dyn FeedCodec> = Arc::new(AsterCodec::new());
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let mut reconnect_policy = ReconnectPolicy::new(config.websocket.reconnect_config());

    loop {
        let connected = tokio::select! {
            () = shutdown.cancelled() => return Ok(()),
            result = WebSocketTransport::connect(&config.websocket.url) => result,
        };

        match connected {
            Ok(transport) => {
                reconnect_policy.reset();
                health.set_reconnect_attempts(0);

                let multiplexer = Arc::new(FeedMultiplexer::start(
                    Arc::new(transport),
                    Arc::clone(&codec),
                    Arc::clone(&clock),
                ));
                health.set_multiplexer(Arc::clone(&multiplexer));

                subscribe_all(&multiplexer, config)?;
                tracing::info!(tickers = config.tickers.len(), "Feed multiplexer ready");

                let shutting_down = tokio::select! {
                    () = shutdown.cancelled() => true,
                    exit = multiplexer.loop_ended() => {
                        tracing::warn!(reason = ?exit.reason, at = %exit.at, "Upstream feed ended");
                        false
                    }
                };

                if shutting_down {
                    if tokio::time::timeout(SHUTDOWN_TIMEOUT, multiplexer.close())
                        .await
                        .is_err()
                    {
                        tracing::warn!(
                            timeout_secs = SHUTDOWN_TIMEOUT.as_secs(),
                            "Timed out closing feed multiplexer"
                        );
                    }
                    return Ok(());
                }

                multiplexer.close().await;
            }
            Err(e) => {
                metrics::record_transport_error("connect");
                tracing::warn!(error = %e, "Upstream connection failed");
            }
        }

        let delay = reconnect_policy.next_delay()?;
        let attempt = reconnect_policy.attempt_count();
        health.set_reconnect_attempts(attempt);
        metrics::record_reconnect();

        tracing::info!(
            attempt,
            delay_ms = delay.as_millis(),
            "Reconnecting to upstream feed"
        );

        tokio::select! {
            () = shutdown.cancelled() => return Ok(()),
            () = tokio::time::sleep(delay) => {}
        }
    }
}

/// Subscribe every configured ticker for every configured consumer kind.
fn subscribe_all(
    multiplexer: &FeedMultiplexer,
    config: &FeedConfig,
) -> Result<(), MultiplexerError> {
    let capacity = config.server.consumer_capacity;

    for ticker in &config.tickers {
        for kind in config.streams.kinds() {
            match kind {
                ConsumerKind::Bbo => attach(multiplexer, ticker, ConsumerQueue::bbo(capacity))?,
                ConsumerKind::BookQuote => {
                    attach(multiplexer, ticker, ConsumerQueue::book_quote(capacity))?;
                }
                ConsumerKind::TimeAndSale => {
                    attach(multiplexer, ticker, ConsumerQueue::time_and_sale(capacity))?;
                }
            }
        }
    }

    Ok(())
}

/// Subscribe one consumer and log what it receives.
fn attach<T: Debug + Send + 'static>(
    multiplexer: &FeedMultiplexer,
    ticker: &Ticker,
    (consumer, receiver): (Consumer, mpsc::Receiver<T>),
) -> Result<(), MultiplexerError> {
    let key = multiplexer.subscribe(ticker, consumer)?;
    tokio::spawn(log_values(key, receiver));
    Ok(())
}

async fn log_values<T: Debug>(key: StreamKey, mut receiver: mpsc::Receiver<T>) {
    while let Some(value) = receiver.recv().await {
        tracing::debug!(stream = %key, ?value, "Market data");
    }
    tracing::debug!(stream = %key, "Consumer finished");
}

/// Load .env file from current or ancestor directories.
fn load_dotenv() {
    if dotenvy::dotenv().is_err() {
        load_dotenv_from_ancestors();
    }
}

/// Log the parsed configuration.
fn log_config(config: &FeedConfig) {
    let tickers: Vec<&str> = config.tickers.iter().map(Ticker::symbol).collect();
    let streams: Vec<&str> = config
        .streams
        .kinds()
        .into_iter()
        .map(ConsumerKind::as_str)
        .collect();

    tracing::info!(
        url = %config.websocket.url,
        tickers = ?tickers,
        streams = ?streams,
        health_port = config.server.health_port,
        consumer_capacity = config.server.consumer_capacity,
        "Configuration loaded"
    );
    tracing::debug!(
        initial_delay_ms = config.websocket.reconnect_delay_initial.as_millis(),
        max_delay_secs = config.websocket.reconnect_delay_max.as_secs(),
        multiplier = config.websocket.reconnect_delay_multiplier,
        max_attempts = config.websocket.max_reconnect_attempts,
        "Reconnect policy"
    );
}

/// Load .env file from any ancestor directory.
fn load_dotenv_from_ancestors() {
    if let Ok(cwd) = std::env::current_dir() {
        let mut dir = cwd.as_path();
        while let Some(parent) = dir.parent() {
            let env_path = parent.join(".env");
            if env_path.exists() {
                let _ = dotenvy::from_path(&env_path);
                return;
            }
            dir = parent;
        }
    }
}

/// Wait for shutdown signal (SIGTERM or SIGINT).
#[allow(clippy::expect_used)]
async fn await_shutdown(shutdown_token: CancellationToken) {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("signal handler installation is critical for graceful shutdown");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("SIGTERM handler installation is critical for graceful shutdown")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {
            tracing::info!("Received Ctrl+C, initiating shutdown");
        }
        () = terminate => {
            tracing::info!("Received SIGTERM, initiating shutdown");
        }
    }

    shutdown_token.cancel();
}

//! Health Check and Metrics Endpoint
//!
//! Reports whether the supervised multiplexer is connected and reading, how
//! many consumers it serves, and exposes the Prometheus registry.
//!
//! # Endpoints
//!
//! - `GET /health` - Returns JSON health status
//! - `GET /healthz` - Kubernetes liveness probe (simple OK)
//! - `GET /readyz` - Kubernetes readiness probe (multiplexer open and reading)
//! - `GET /metrics` - Prometheus metrics in text format

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Instant;

use axum::extract::State;
use axum::http::{StatusCode, header};
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::Serialize;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use crate::application::services::{FeedMultiplexer, LifecycleState, ReceiveLoopState};
use crate::infrastructure::metrics::get_metrics_handle;

// =============================================================================
// Health Response Types
// =============================================================================

/// Health check response.
#[derive(Debug, Clone, Serialize)]
pub struct HealthResponse {
    /// Overall status: "healthy", "degraded", or "unhealthy".
    pub status: HealthStatus,
    /// Service version.
    pub version: String,
    /// Process uptime in seconds.
    pub uptime_secs: u64,
    /// Current time.
    pub current_time: DateTime<Utc>,
    /// Upstream feed status.
    pub feed: FeedStatus,
    /// Subscription statistics, absent while disconnected.
    pub subscriptions: Option<SubscriptionStatus>,
}

/// Overall health status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    /// Multiplexer open and reading.
    Healthy,
    /// Reconnecting to the upstream feed.
    Degraded,
    /// No usable connection.
    Unhealthy,
}

/// Upstream feed status.
#[derive(Debug, Clone, Serialize)]
pub struct FeedStatus {
    /// Multiplexer lifecycle, absent before the first connection.
    pub lifecycle: Option<LifecycleState>,
    /// Receive loop state, absent before the first connection.
    pub receive_loop: Option<ReceiveLoopState>,
    /// When the current connection was opened.
    pub connected_since: Option<DateTime<Utc>>,
    /// Consecutive failed reconnect attempts.
    pub reconnect_attempts: u32,
}

/// Subscription statistics.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct SubscriptionStatus {
    /// Subscribed upstream channels.
    pub active_channels: usize,
    /// BBO consumers.
    pub bbo_consumers: usize,
    /// Raw book quote consumers.
    pub book_quote_consumers: usize,
    /// Trade consumers.
    pub time_and_sale_consumers: usize,
    /// Live top-of-book aggregators.
    pub aggregators: usize,
}

// =============================================================================
// Health Server State
// =============================================================================

/// Shared state for the health server.
///
/// The supervisor swaps the multiplexer in on every (re)connect.
pub struct HealthServerState {
    version: String,
    started_at: Instant,
    multiplexer: RwLock<Option<Arc<FeedMultiplexer>>>,
    reconnect_attempts: AtomicU32,
}

impl HealthServerState {
    /// Create new health server state.
    #[must_use]
    pub fn new(version: String) -> Self {
        Self {
            version,
            started_at: Instant::now(),
            multiplexer: RwLock::new(None),
            reconnect_attempts: AtomicU32::new(0),
        }
    }

    /// Report the multiplexer of the current connection.
    pub fn set_multiplexer(&self, multiplexer: Arc<FeedMultiplexer>) {
        *self.multiplexer.write() = Some(multiplexer);
    }

    /// Record the current reconnect attempt count.
    pub fn set_reconnect_attempts(&self, attempts: u32) {
        self.reconnect_attempts.store(attempts, Ordering::Relaxed);
    }

    fn multiplexer(&self) -> Option<Arc<FeedMultiplexer>> {
        self.multiplexer.read().clone()
    }
}

// =============================================================================
// Health Server
// =============================================================================

/// Health check HTTP server.
pub struct HealthServer {
    port: u16,
    state: Arc<HealthServerState>,
    cancel: CancellationToken,
}

impl HealthServer {
    /// Create a health server bound to `port` on all interfaces.
    #[must_use]
    pub const fn new(port: u16, state: Arc<HealthServerState>, cancel: CancellationToken) -> Self {
        Self {
            port,
            state,
            cancel,
        }
    }

    /// Serve until the cancellation token fires.
    ///
    /// # Errors
    ///
    /// Returns `HealthServerError::Bind` if the port is unavailable and
    /// `HealthServerError::Serve` if axum stops with an error.
    pub async fn run(self) -> Result<(), HealthServerError> {
        let Self {
            port,
            state,
            cancel,
        } = self;

        let listener = TcpListener::bind(SocketAddr::from(([0, 0, 0, 0], port)))
            .await
            .map_err(|source| HealthServerError::Bind { port, source })?;
        tracing::info!(port, "Health server listening");

        axum::serve(listener, router(state))
            .with_graceful_shutdown(cancel.cancelled_owned())
            .await
            .map_err(HealthServerError::Serve)?;

        tracing::info!(port, "Health server stopped");
        Ok(())
    }
}

/// Routes served by [`HealthServer`].
#[must_use]
pub fn router(state: Arc<HealthServerState>) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/healthz", get(|| async { "OK" }))
        .route("/readyz", get(readiness_handler))
        .route("/metrics", get(metrics_handler))
        .with_state(state)
}

// =============================================================================
// HTTP Handlers
// =============================================================================

impl HealthStatus {
    const fn http_status(self) -> StatusCode {
        match self {
            Self::Healthy | Self::Degraded => StatusCode::OK,
            Self::Unhealthy => StatusCode::SERVICE_UNAVAILABLE,
        }
    }
}

async fn health_handler(State(state): State<Arc<HealthServerState>>) -> impl IntoResponse {
    let response = build_health_response(&state);
    (response.status.http_status(), Json(response))
}

async fn readiness_handler(State(state): State<Arc<HealthServerState>>) -> impl IntoResponse {
    match build_health_response(&state).status {
        HealthStatus::Healthy => (StatusCode::OK, "READY"),
        HealthStatus::Degraded | HealthStatus::Unhealthy => {
            (StatusCode::SERVICE_UNAVAILABLE, "NOT READY")
        }
    }
}

const PROMETHEUS_CONTENT_TYPE: &str = "text/plain; version=0.0.4; charset=utf-8";

async fn metrics_handler() -> impl IntoResponse {
    let Some(handle) = get_metrics_handle() else {
        return (
            StatusCode::SERVICE_UNAVAILABLE,
            [(header::CONTENT_TYPE, "text/plain")],
            "metrics recorder not installed".to_string(),
        );
    };
    (
        StatusCode::OK,
        [(header::CONTENT_TYPE, PROMETHEUS_CONTENT_TYPE)],
        handle.render(),
    )
}

fn build_health_response(state: &HealthServerState) -> HealthResponse {
    let multiplexer = state.multiplexer();

    let feed = FeedStatus {
        lifecycle: multiplexer.as_ref().map(|m| m.state()),
        receive_loop: multiplexer.as_ref().map(|m| m.loop_state()),
        connected_since: multiplexer.as_ref().map(|m| m.opened_at()),
        reconnect_attempts: state.reconnect_attempts.load(Ordering::Relaxed),
    };

    let subscriptions = multiplexer
        .as_ref()
        .and_then(|m| m.stats().ok())
        .map(|stats| SubscriptionStatus {
            active_channels: stats.channel_count,
            bbo_consumers: stats.bbo_consumers,
            book_quote_consumers: stats.book_quote_consumers,
            time_and_sale_consumers: stats.time_and_sale_consumers,
            aggregators: stats.aggregator_count,
        });

    HealthResponse {
        status: determine_health_status(&feed),
        version: state.version.clone(),
        uptime_secs: state.started_at.elapsed().as_secs(),
        current_time: Utc::now(),
        feed,
        subscriptions,
    }
}

fn determine_health_status(feed: &FeedStatus) -> HealthStatus {
    let open = feed.lifecycle == Some(LifecycleState::Open);
    let reading = feed.receive_loop.is_some_and(|state| state.is_running());

    match (open && reading, feed.reconnect_attempts) {
        (true, _) => HealthStatus::Healthy,
        (false, attempts) if attempts > 0 => HealthStatus::Degraded,
        (false, _) => HealthStatus::Unhealthy,
    }
}

// =============================================================================
// Errors
// =============================================================================

/// Health server errors.
#[derive(Debug, thiserror::Error)]
pub enum HealthServerError {
    /// The listening socket could not be bound.
    #[error("cannot bind health server to port {port}: {source}")]
    Bind {
        /// Requested port.
        port: u16,
        /// Underlying I/O error.
        source: std::io::Error,
    },

    /// axum returned an error while serving.
    #[error("health server failed: {0}")]
    Serve(std::io::Error),
}

// =============================================================================
// Tests
// =============================================================================

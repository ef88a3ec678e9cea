//! Infrastructure Layer - Adapters and external integrations.
//!
//! This layer contains the concrete implementations of the port interfaces
//! defined in the application layer.

/// Aster futures WebSocket API codec and wire messages.
pub mod aster;

/// WebSocket transport.
pub mod websocket;

/// Channel-backed consumer sinks.
pub mod sink;

/// Reconnection backoff policy.
pub mod reconnect;

/// Configuration loading.
pub mod config;

/// Health check HTTP endpoint.
pub mod health;

/// Prometheus metrics instrumentation.
pub mod metrics;

/// OpenTelemetry tracing integration.
pub mod telemetry;

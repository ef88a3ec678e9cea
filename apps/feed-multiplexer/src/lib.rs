#![cfg_attr(
    test,
    allow(
        clippy::unwrap_used,
        clippy::expect_used,
        clippy::float_cmp,
        clippy::significant_drop_tightening,
        clippy::too_many_lines,
        clippy::match_same_arms,
        clippy::needless_pass_by_value,
        clippy::needless_collect,
        clippy::option_if_let_else,
        clippy::default_trait_access,
        clippy::items_after_statements,
        clippy::or_fun_call
    )
)]

//! Feed Multiplexer - Market Data Ingestion and Fan-out
//!
//! Maintains one upstream WebSocket connection to a venue's market data feed
//! and multiplexes it to many local consumers. Upstream channels are
//! reference counted across consumers, and the best bid/offer of each ticker
//! is rebuilt from per-participant depth deltas.
//!
//! # Layers (inside → outside)
//!
//! - **Domain**: Market data types and pure logic
//!   - `market_data`: Quotes, BBO, trades
//!   - `top_of_book`: Best bid/offer aggregation
//!   - `subscription`: Consumer routing and upstream reference counts
//!
//! - **Application**: Use cases and port definitions
//!   - `ports`: Transport, codec, clock and sink capabilities
//!   - `services`: The feed multiplexer and its receive loop
//!
//! - **Infrastructure**: Adapters and external integrations
//!   - `aster`: Venue codec and wire messages
//!   - `websocket`: WebSocket transport
//!   - `sink`: Channel-backed consumer queues
//!   - `reconnect`: Backoff policy for the supervisor
//!   - `config`, `health`, `metrics`, `telemetry`: Service plumbing
//!
//! # Data Flow
//!
//! ```text
//!                  ┌──────────────┐   ┌──────────────┐ ──► BBO consumers
//! Upstream WS ───► │  FeedCodec   │──►│ Subscription │ ──► Book consumers
//!      ▲           │ classify +   │   │   Registry   │ ──► Trade consumers
//!      │           │   decode     │   └──────┬───────┘
//!      │           └──────────────┘          │ 0→1 / 1→0
//!      └──── SUBSCRIBE / UNSUBSCRIBE ◄───────┘
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::pedantic)]

// =============================================================================
// Module Declarations
// =============================================================================

/// Domain layer - Core market data types with no external dependencies.
pub mod domain;

/// Application layer - Use cases and port definitions.
pub mod application;

/// Infrastructure layer - Adapters and external integrations.
pub mod infrastructure;

// =============================================================================
// Re-exports
// =============================================================================

// Domain types
pub use domain::market_data::{
    BboQuote, BookQuote, ConditionKind, Quote, Side, Ticker, TimeAndSale, TradeCondition, Venue,
};
pub use domain::subscription::{
    ChannelClass, ChannelRequest, Consumer, ConsumerKind, RegistryStats, Sink, SinkClosed,
    StreamKey, SubscriptionRegistry, WireChannel,
};
pub use domain::top_of_book::TopOfBookAggregator;

// Ports
pub use application::ports::{
    Clock, CodecError, FeedCodec, FeedEvent, MessageClass, SystemClock, Transport,
    TransportError,
};

// Multiplexer
pub use application::services::{
    FeedMultiplexer, LifecycleState, LoopExit, LoopExitReason, MultiplexerError,
    ReceiveLoopState,
};

// Adapters
pub use infrastructure::aster::AsterCodec;
pub use infrastructure::sink::{BoundedSink, ConsumerQueue, Overflow};
pub use infrastructure::websocket::WebSocketTransport;

// Infrastructure config
pub use infrastructure::config::{
    ConfigError, FeedConfig, ServerSettings, StreamSelection, WebSocketSettings,
};
pub use infrastructure::reconnect::{ReconnectConfig, ReconnectError, ReconnectPolicy};

// Health server
pub use infrastructure::health::{HealthServer, HealthServerError, HealthServerState};

// Metrics
pub use infrastructure::metrics::init_metrics;

// Telemetry
pub use infrastructure::telemetry::{TelemetryConfig, TelemetryGuard, init as init_telemetry};

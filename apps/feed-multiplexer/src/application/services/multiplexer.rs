//! Feed Multiplexer Service
//!
//! Owns the upstream connection and the subscription registry, turns
//! reference-count transitions into SUBSCRIBE/UNSUBSCRIBE requests and runs
//! the receive loop that decodes upstream messages and dispatches them.
//!
//! # Design
//!
//! - One spawned task runs the receive loop for the lifetime of the connection
//! - Registry state and the lifecycle state share one `parking_lot` mutex, so
//!   subscribe calls and dispatches are linearizable
//! - Requests are sent while the lock is held, which keeps SUBSCRIBE and
//!   UNSUBSCRIBE for one channel in refcount order on the wire
//! - The end of the receive loop is published on a `watch` channel, also
//!   when dispatch panics; the multiplexer does not reconnect on its own
//!
//! # Lifecycle
//!
//! ```text
//! Open ──close()──▶ Closing ──loop joined, registry cleared──▶ Closed
//! ```

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use futures_util::FutureExt;
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::application::ports::{Clock, FeedCodec, FeedEvent, Transport};
use crate::domain::market_data::{BboQuote, BookQuote, Ticker, TimeAndSale};
use crate::domain::subscription::{
    ChannelClass, ChannelRequest, Consumer, DispatchOutcome, RegistryStats, Sink, StreamKey,
    SubscriptionRegistry,
};
use crate::infrastructure::metrics;

/// Longest prefix of an unrecognised message that is logged.
const LOGGED_MESSAGE_CHARS: usize = 256;

/// Pause after a non-terminal I/O error, scaled by the run of errors.
const IO_ERROR_DELAY: Duration = Duration::from_millis(10);

/// Longest pause between reads after repeated I/O errors.
const MAX_IO_ERROR_DELAY: Duration = Duration::from_secs(1);

// =============================================================================
// Types
// =============================================================================

/// Multiplexer error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum MultiplexerError {
    /// The multiplexer is closing or closed.
    #[error("feed multiplexer is closed")]
    Closed,
}

/// Lifecycle of a multiplexer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LifecycleState {
    /// Accepting subscriptions and dispatching.
    Open,
    /// `close()` in progress.
    Closing,
    /// Terminal.
    Closed,
}

impl LifecycleState {
    /// Short label for logs and health output.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Open => "open",
            Self::Closing => "closing",
            Self::Closed => "closed",
        }
    }
}

/// Why the receive loop stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LoopExitReason {
    /// The upstream connection ended on its own.
    EndOfStream,
    /// The multiplexer was closed.
    Closed,
    /// Dispatching a message panicked.
    Panicked,
}

/// Details of a finished receive loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct LoopExit {
    /// Why the loop stopped.
    pub reason: LoopExitReason,
    /// When the loop stopped.
    pub at: DateTime<Utc>,
}

/// Observable state of the receive loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ReceiveLoopState {
    /// Reading upstream messages.
    Running,
    /// Finished; the connection is no longer read.
    Ended(LoopExit),
}

impl ReceiveLoopState {
    /// Whether the loop is still reading.
    #[must_use]
    pub const fn is_running(&self) -> bool {
        matches!(self, Self::Running)
    }
}

// =============================================================================
// Shared State
// =============================================================================

struct Core {
    registry: SubscriptionRegistry,
    state: LifecycleState,
}

struct Shared {
    core: Mutex<Core>,
    transport: Arc<dyn Transport>,
    codec: Arc<dyn FeedCodec>,
    clock: Arc<dyn Clock>,
    next_request_id: AtomicU64,
    loop_state: watch::Sender<ReceiveLoopState>,
}

impl Shared {
    /// Frame and send one request. Failures are logged, never returned.
    fn send_request(&self, request: &ChannelRequest) {
        let id = self.next_request_id.fetch_add(1, Ordering::Relaxed);

        let message = match self.codec.encode_request(request, id) {
            Ok(message) => message,
            Err(e) => {
                metrics::record_request_failure(request);
                tracing::warn!(
                    channel = %request.channel(),
                    request_id = id,
                    error = %e,
                    "Failed to encode subscription request"
                );
                return;
            }
        };

        match self.transport.send(message) {
            Ok(()) => {
                metrics::record_request_sent(request);
                tracing::debug!(
                    channel = %request.channel(),
                    request_id = id,
                    method = request.label(),
                    "Sent subscription request"
                );
            }
            Err(e) => {
                metrics::record_request_failure(request);
                tracing::warn!(
                    channel = %request.channel(),
                    request_id = id,
                    method = request.label(),
                    error = %e,
                    "Failed to send subscription request"
                );
            }
        }
    }

    /// Classify, decode and dispatch one raw upstream message.
    fn handle_message(&self, raw: &str) {
        let Some(class) = self.codec.classify(raw) else {
            metrics::record_message_received(None);
            tracing::warn!(raw = truncate(raw), "Unrecognised upstream message");
            return;
        };
        metrics::record_message_received(Some(class));

        let started = Instant::now();
        match self.codec.decode(class, raw) {
            Ok(event) => self.dispatch(event),
            Err(e) => {
                metrics::record_decode_error(class);
                tracing::warn!(
                    class = class.as_str(),
                    error = %e,
                    raw = truncate(raw),
                    "Failed to decode upstream message"
                );
                return;
            }
        }
        metrics::record_dispatch_duration(class, started.elapsed());
    }

    fn dispatch(&self, event: FeedEvent) {
        let mut core = self.core.lock();
        if core.state != LifecycleState::Open {
            return;
        }

        let (channel, outcome) = match event {
            FeedEvent::Depth(update) => {
                let channel = update.channel.clone();
                let quotes = update.into_quotes();
                let outcome = core.registry.dispatch_book_update(&channel, &quotes);
                (channel, outcome)
            }
            FeedEvent::Trade(update) => {
                let outcome = core.registry.dispatch_trade(&update.channel, &update.trade);
                (update.channel, outcome)
            }
            FeedEvent::Response { id } => {
                tracing::debug!(request_id = ?id, "Subscription request acknowledged");
                return;
            }
        };

        let DispatchOutcome { removed, request } = outcome;
        if !removed.is_empty() {
            metrics::record_consumers_removed(&removed);
            tracing::debug!(
                channel = %channel,
                removed = removed.len(),
                "Removed closed consumers"
            );
        }

        if let Some(request) = request {
            self.send_request(&request);
            metrics::set_active_channels(core.registry.channel_count());
        }
    }
}

fn truncate(raw: &str) -> &str {
    raw.char_indices()
        .nth(LOGGED_MESSAGE_CHARS)
        .map_or(raw, |(index, _)| &raw[..index])
}

/// Pause after `consecutive` non-terminal I/O errors in a row.
fn io_error_delay(consecutive: u32) -> Duration {
    IO_ERROR_DELAY
        .saturating_mul(consecutive)
        .min(MAX_IO_ERROR_DELAY)
}

/// Run the receive loop, then publish why it ended. A panic while
/// dispatching ends the loop but is still published.
async fn run_receive_loop(shared: Arc<Shared>) {
    tracing::info!("Receive loop started");

    let completed = AssertUnwindSafe(read_until_end(&shared))
        .catch_unwind()
        .await
        .is_ok();

    let reason = if !completed {
        LoopExitReason::Panicked
    } else if shared.core.lock().state == LifecycleState::Open {
        LoopExitReason::EndOfStream
    } else {
        LoopExitReason::Closed
    };
    let exit = LoopExit {
        reason,
        at: shared.clock.now(),
    };

    if completed {
        tracing::info!(reason = ?exit.reason, "Receive loop ended");
    } else {
        tracing::error!("Receive loop panicked while dispatching");
    }
    shared.loop_state.send_replace(ReceiveLoopState::Ended(exit));
}

async fn read_until_end(shared: &Shared) {
    let mut consecutive_errors: u32 = 0;

    loop {
        match shared.transport.recv().await {
            Ok(raw) => {
                consecutive_errors = 0;
                shared.handle_message(&raw);
            }
            Err(e) if e.is_terminal() => {
                tracing::info!(error = %e, "Upstream connection ended");
                return;
            }
            Err(e) => {
                consecutive_errors = consecutive_errors.saturating_add(1);
                metrics::record_transport_error("io");
                tracing::warn!(error = %e, consecutive_errors, "Upstream I/O error");
                tokio::time::sleep(io_error_delay(consecutive_errors)).await;
            }
        }
    }
}

// =============================================================================
// Feed Multiplexer
// =============================================================================

/// Upstream feed multiplexer.
///
/// Consumers subscribe per ticker and value kind. The first consumer of a
/// wire channel triggers an upstream SUBSCRIBE, the channel losing its last
/// consumer triggers an UNSUBSCRIBE. There is no explicit unsubscribe call:
/// dropping the receiving end of a sink ends the subscription.
pub struct FeedMultiplexer {
    shared: Arc<Shared>,
    receive_task: Mutex<Option<JoinHandle<()>>>,
    opened_at: DateTime<Utc>,
}

impl FeedMultiplexer {
    /// Start a multiplexer over a connected transport.
    ///
    /// # Panics
    ///
    /// Panics if called outside a Tokio runtime.
    #[must_use]
    pub fn start(
        transport: Arc<dyn Transport>,
        codec: Arc<dyn FeedCodec>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let (loop_state, _) = watch::channel(ReceiveLoopState::Running);
        let opened_at = clock.now();

        let shared = Arc::new(Shared {
            core: Mutex::new(Core {
                registry: SubscriptionRegistry::new(),
                state: LifecycleState::Open,
            }),
            transport,
            codec,
            clock,
            next_request_id: AtomicU64::new(1),
            loop_state,
        });

        let receive_task = tokio::spawn(run_receive_loop(Arc::clone(&shared)));

        Self {
            shared,
            receive_task: Mutex::new(Some(receive_task)),
            opened_at,
        }
    }

    /// Subscribe a consumer to best bid/offer changes of a ticker.
    ///
    /// # Errors
    ///
    /// Returns [`MultiplexerError::Closed`] once `close()` has been called.
    pub fn subscribe_bbo(
        &self,
        ticker: &Ticker,
        sink: impl Sink<BboQuote> + 'static,
    ) -> Result<StreamKey, MultiplexerError> {
        self.subscribe(ticker, Consumer::bbo(sink))
    }

    /// Subscribe a consumer to raw book quotes of a ticker.
    ///
    /// # Errors
    ///
    /// Returns [`MultiplexerError::Closed`] once `close()` has been called.
    pub fn subscribe_book_quotes(
        &self,
        ticker: &Ticker,
        sink: impl Sink<BookQuote> + 'static,
    ) -> Result<StreamKey, MultiplexerError> {
        self.subscribe(ticker, Consumer::book_quote(sink))
    }

    /// Subscribe a consumer to trade prints of a ticker.
    ///
    /// # Errors
    ///
    /// Returns [`MultiplexerError::Closed`] once `close()` has been called.
    pub fn subscribe_time_and_sales(
        &self,
        ticker: &Ticker,
        sink: impl Sink<TimeAndSale> + 'static,
    ) -> Result<StreamKey, MultiplexerError> {
        self.subscribe(ticker, Consumer::time_and_sale(sink))
    }

    /// Subscribe a typed consumer to a ticker.
    ///
    /// # Errors
    ///
    /// Returns [`MultiplexerError::Closed`] once `close()` has been called.
    pub fn subscribe(
        &self,
        ticker: &Ticker,
        consumer: Consumer,
    ) -> Result<StreamKey, MultiplexerError> {
        let kind = consumer.kind();
        let channel = self.shared.codec.channel(ticker, kind.class());

        let mut core = self.shared.core.lock();
        if core.state != LifecycleState::Open {
            return Err(MultiplexerError::Closed);
        }

        if let Some(request) = core.registry.subscribe(channel.clone(), consumer) {
            self.shared.send_request(&request);
            metrics::set_active_channels(core.registry.channel_count());
        }

        tracing::debug!(
            ticker = %ticker,
            channel = %channel,
            kind = %kind,
            "Consumer subscribed"
        );

        Ok(StreamKey::new(channel, kind))
    }

    /// Current best bid/offer of a ticker, if it has BBO consumers.
    ///
    /// # Errors
    ///
    /// Returns [`MultiplexerError::Closed`] once `close()` has been called.
    pub fn bbo(&self, ticker: &Ticker) -> Result<Option<BboQuote>, MultiplexerError> {
        let channel = self.shared.codec.channel(ticker, ChannelClass::Depth);
        let core = self.shared.core.lock();
        if core.state != LifecycleState::Open {
            return Err(MultiplexerError::Closed);
        }
        Ok(core.registry.bbo(&channel))
    }

    /// Registry statistics.
    ///
    /// # Errors
    ///
    /// Returns [`MultiplexerError::Closed`] once `close()` has been called.
    pub fn stats(&self) -> Result<RegistryStats, MultiplexerError> {
        let core = self.shared.core.lock();
        if core.state != LifecycleState::Open {
            return Err(MultiplexerError::Closed);
        }
        Ok(core.registry.stats())
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn state(&self) -> LifecycleState {
        self.shared.core.lock().state
    }

    /// Current receive loop state.
    #[must_use]
    pub fn loop_state(&self) -> ReceiveLoopState {
        *self.shared.loop_state.borrow()
    }

    /// Watch the receive loop state.
    #[must_use]
    pub fn watch_loop_state(&self) -> watch::Receiver<ReceiveLoopState> {
        self.shared.loop_state.subscribe()
    }

    /// Wait until the receive loop has ended.
    pub async fn loop_ended(&self) -> LoopExit {
        let mut receiver = self.shared.loop_state.subscribe();
        let result = receiver
            .wait_for(|state| !state.is_running())
            .await
            .map(|state| *state);

        match result {
            Ok(ReceiveLoopState::Ended(exit)) => exit,
            // The sender lives as long as `self`
            Ok(ReceiveLoopState::Running) | Err(_) => LoopExit {
                reason: LoopExitReason::Closed,
                at: self.shared.clock.now(),
            },
        }
    }

    /// Time the multiplexer was started.
    #[must_use]
    pub const fn opened_at(&self) -> DateTime<Utc> {
        self.opened_at
    }

    /// Close the multiplexer.
    ///
    /// Tears down the transport, waits for the receive loop and drops every
    /// subscription without sending UNSUBSCRIBE requests. Calling it again is
    /// a no-op. If the returned future is dropped while waiting for the
    /// receive loop, the multiplexer still ends up `Closed`.
    pub async fn close(&self) {
        {
            let mut core = self.shared.core.lock();
            if core.state != LifecycleState::Open {
                return;
            }
            core.state = LifecycleState::Closing;
        }

        let _completion = CloseCompletion {
            shared: &self.shared,
        };

        tracing::info!("Closing feed multiplexer");
        self.shared.transport.close();

        let receive_task = self.receive_task.lock().take();
        if let Some(receive_task) = receive_task {
            if let Err(e) = receive_task.await {
                tracing::warn!(error = %e, "Receive loop task failed");
            }
        }
    }
}

/// Clears the registry and marks the multiplexer `Closed` when dropped.
struct CloseCompletion<'a> {
    shared: &'a Shared,
}

impl Drop for CloseCompletion<'_> {
    fn drop(&mut self) {
        let channels = {
            let mut core = self.shared.core.lock();
            let channels = core.registry.clear();
            core.state = LifecycleState::Closed;
            channels
        };
        metrics::set_active_channels(0);

        tracing::info!(channels, "Feed multiplexer closed");
    }
}

impl Drop for FeedMultiplexer {
    fn drop(&mut self) {
        if self.shared.core.lock().state == LifecycleState::Open {
            self.shared.transport.close();
        }
    }
}

impl std::fmt::Debug for FeedMultiplexer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FeedMultiplexer")
            .field("state", &self.state())
            .field("loop_state", &self.loop_state())
            .field("opened_at", &self.opened_at)
            .finish_non_exhaustive()
    }
}

// =============================================================================
// Tests
// =============================================================================

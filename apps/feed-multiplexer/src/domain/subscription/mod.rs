//! Subscription Registry
//!
//! Routes typed consumer subscriptions onto shared upstream wire channels and
//! dispatches decoded upstream events to the consumers of each channel.
//!
//! # Design
//!
//! The registry tracks, per wire channel:
//! - Consumers of each kind (BBO, raw book quotes, time and sales)
//! - One top-of-book aggregator, only while the channel has BBO consumers
//!
//! A wire channel may back several consumer kinds (BBO and raw book both ride
//! the depth channel), so the upstream reference count is the number of
//! consumers across all kinds. The registry never talks to the upstream
//! connection itself: transitions 0→1 and 1→0 are returned to the caller as
//! [`ChannelRequest`]s.
//!
//! Consumers are never removed explicitly. A consumer leaves when a push to
//! its sink fails with [`SinkClosed`], which is detected lazily on the next
//! event delivered to it.

use std::collections::HashMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::domain::market_data::{BboQuote, BookQuote, TimeAndSale};
use crate::domain::top_of_book::TopOfBookAggregator;

// =============================================================================
// Types
// =============================================================================

/// Name of one upstream subscription topic (e.g. `btcusdt@depth`).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct WireChannel(String);

impl WireChannel {
    /// Create a wire channel from its upstream name.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    /// The upstream channel name.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for WireChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for WireChannel {
    fn from(name: &str) -> Self {
        Self::new(name)
    }
}

/// Group of message types that share one upstream channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChannelClass {
    /// Order book deltas.
    Depth,
    /// Executed trades.
    Trade,
}

/// Type of value a consumer receives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConsumerKind {
    /// Aggregated best bid/offer.
    Bbo,
    /// Raw per-participant book quotes.
    BookQuote,
    /// Trade prints.
    TimeAndSale,
}

impl ConsumerKind {
    /// All consumer kinds.
    #[must_use]
    pub const fn all() -> &'static [Self] {
        &[Self::Bbo, Self::BookQuote, Self::TimeAndSale]
    }

    /// Channel class this kind of consumer is fed from.
    #[must_use]
    pub const fn class(self) -> ChannelClass {
        match self {
            Self::Bbo | Self::BookQuote => ChannelClass::Depth,
            Self::TimeAndSale => ChannelClass::Trade,
        }
    }

    /// Short label for logs and metrics.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Bbo => "bbo",
            Self::BookQuote => "book_quote",
            Self::TimeAndSale => "time_and_sale",
        }
    }
}

impl fmt::Display for ConsumerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One routing entry: a wire channel read as one consumer kind.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct StreamKey {
    /// Upstream channel.
    pub channel: WireChannel,
    /// Consumer kind reading the channel.
    pub kind: ConsumerKind,
}

impl StreamKey {
    /// Create a stream key.
    #[must_use]
    pub const fn new(channel: WireChannel, kind: ConsumerKind) -> Self {
        Self { channel, kind }
    }
}

impl fmt::Display for StreamKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.channel, self.kind)
    }
}

// =============================================================================
// Sinks
// =============================================================================

/// The receiving side of a consumer has gone away.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("consumer sink closed")]
pub struct SinkClosed;

/// Capability to deliver values to one consumer.
///
/// Returning [`SinkClosed`] removes the consumer from every future dispatch.
pub trait Sink<T>: Send {
    /// Deliver one value.
    ///
    /// # Errors
    ///
    /// Returns [`SinkClosed`] if the consumer can no longer receive values.
    fn push(&self, value: T) -> Result<(), SinkClosed>;
}

/// Owned, type-erased sink.
pub type BoxSink<T> = Box<dyn Sink<T>>;

/// A consumer sink tagged with the kind of value it receives.
pub enum Consumer {
    /// Receives a [`BboQuote`] whenever the best bid or offer changes.
    Bbo(BoxSink<BboQuote>),
    /// Receives every [`BookQuote`] of every depth update.
    BookQuote(BoxSink<BookQuote>),
    /// Receives every [`TimeAndSale`].
    TimeAndSale(BoxSink<TimeAndSale>),
}

impl Consumer {
    /// Wrap a BBO sink.
    pub fn bbo(sink: impl Sink<BboQuote> + 'static) -> Self {
        Self::Bbo(Box::new(sink))
    }

    /// Wrap a raw book quote sink.
    pub fn book_quote(sink: impl Sink<BookQuote> + 'static) -> Self {
        Self::BookQuote(Box::new(sink))
    }

    /// Wrap a trade sink.
    pub fn time_and_sale(sink: impl Sink<TimeAndSale> + 'static) -> Self {
        Self::TimeAndSale(Box::new(sink))
    }

    /// Kind of value this consumer receives.
    #[must_use]
    pub const fn kind(&self) -> ConsumerKind {
        match self {
            Self::Bbo(_) => ConsumerKind::Bbo,
            Self::BookQuote(_) => ConsumerKind::BookQuote,
            Self::TimeAndSale(_) => ConsumerKind::TimeAndSale,
        }
    }
}

impl fmt::Debug for Consumer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Consumer").field(&self.kind()).finish()
    }
}

// =============================================================================
// Upstream Requests
// =============================================================================

/// Upstream subscription change the caller must send.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ChannelRequest {
    /// First consumer of the channel arrived.
    Subscribe(WireChannel),
    /// Last consumer of the channel left.
    Unsubscribe(WireChannel),
}

impl ChannelRequest {
    /// The channel this request targets.
    #[must_use]
    pub const fn channel(&self) -> &WireChannel {
        match self {
            Self::Subscribe(channel) | Self::Unsubscribe(channel) => channel,
        }
    }

    /// Short label for logs and metrics.
    #[must_use]
    pub const fn label(&self) -> &'static str {
        match self {
            Self::Subscribe(_) => "subscribe",
            Self::Unsubscribe(_) => "unsubscribe",
        }
    }
}

/// Result of dispatching one event.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct DispatchOutcome {
    /// Kinds of the consumers removed because their sink closed.
    pub removed: Vec<ConsumerKind>,
    /// Unsubscribe to send when the channel lost its last consumer.
    pub request: Option<ChannelRequest>,
}

// =============================================================================
// Channel Entry
// =============================================================================

/// BBO consumers of a depth channel and the aggregator feeding them.
struct BboFanout {
    aggregator: TopOfBookAggregator,
    sinks: Vec<BoxSink<BboQuote>>,
}

/// All consumers of one wire channel.
#[derive(Default)]
struct ChannelEntry {
    bbo: Option<BboFanout>,
    book_quotes: Vec<BoxSink<BookQuote>>,
    time_and_sales: Vec<BoxSink<TimeAndSale>>,
}

impl ChannelEntry {
    fn add(&mut self, consumer: Consumer) {
        match consumer {
            Consumer::Bbo(sink) => self
                .bbo
                .get_or_insert_with(|| BboFanout {
                    aggregator: TopOfBookAggregator::new(),
                    sinks: Vec::new(),
                })
                .sinks
                .push(sink),
            Consumer::BookQuote(sink) => self.book_quotes.push(sink),
            Consumer::TimeAndSale(sink) => self.time_and_sales.push(sink),
        }
    }

    fn count(&self, kind: ConsumerKind) -> usize {
        match kind {
            ConsumerKind::Bbo => self.bbo.as_ref().map_or(0, |fanout| fanout.sinks.len()),
            ConsumerKind::BookQuote => self.book_quotes.len(),
            ConsumerKind::TimeAndSale => self.time_and_sales.len(),
        }
    }

    fn is_empty(&self) -> bool {
        self.bbo.is_none() && self.book_quotes.is_empty() && self.time_and_sales.is_empty()
    }
}

/// Push every value to every sink, dropping sinks whose push fails.
///
/// Returns the number of sinks dropped.
fn fan_out<T: Clone>(sinks: &mut Vec<BoxSink<T>>, values: &[T]) -> usize {
    let before = sinks.len();
    sinks.retain(|sink| values.iter().all(|value| sink.push(value.clone()).is_ok()));
    before - sinks.len()
}

// =============================================================================
// Subscription Registry
// =============================================================================

/// Reference-counted routing table from wire channels to consumers.
///
/// Not synchronised; the owner wraps it in a single lock so subscribe and
/// dispatch calls are linearizable.
///
/// # Example
///
/// ```rust
/// use feed_multiplexer::domain::market_data::TimeAndSale;
/// use feed_multiplexer::domain::subscription::{
///     ChannelRequest, Consumer, Sink, SinkClosed, SubscriptionRegistry, WireChannel,
/// };
///
/// struct Discard;
///
/// impl Sink<TimeAndSale> for Discard {
///     fn push(&self, _value: TimeAndSale) -> Result<(), SinkClosed> {
///         Ok(())
///     }
/// }
///
/// let mut registry = SubscriptionRegistry::new();
/// let channel = WireChannel::new("btcusdt@aggTrade");
///
/// // First consumer needs an upstream subscribe
/// let request = registry.subscribe(channel.clone(), Consumer::time_and_sale(Discard));
/// assert_eq!(request, Some(ChannelRequest::Subscribe(channel.clone())));
///
/// // Second consumer shares the channel
/// assert!(registry.subscribe(channel.clone(), Consumer::time_and_sale(Discard)).is_none());
/// assert_eq!(registry.stats().channel_count, 1);
/// ```
#[derive(Default)]
pub struct SubscriptionRegistry {
    entries: HashMap<WireChannel, ChannelEntry>,
}

impl SubscriptionRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a consumer to a wire channel.
    ///
    /// Returns a subscribe request when the channel had no consumers before.
    /// A BBO consumer joining a channel that already carries raw book
    /// consumers starts a fresh aggregator but needs no new subscribe.
    pub fn subscribe(&mut self, channel: WireChannel, consumer: Consumer) -> Option<ChannelRequest> {
        if let Some(entry) = self.entries.get_mut(&channel) {
            entry.add(consumer);
            return None;
        }

        let mut entry = ChannelEntry::default();
        entry.add(consumer);
        self.entries.insert(channel.clone(), entry);
        Some(ChannelRequest::Subscribe(channel))
    }

    /// Deliver the quotes of one depth update, in order.
    ///
    /// Raw book consumers receive every quote. The aggregator, if present,
    /// is fed every quote and BBO consumers receive one snapshot if any of
    /// them changed the best bid or offer.
    pub fn dispatch_book_update(
        &mut self,
        channel: &WireChannel,
        quotes: &[BookQuote],
    ) -> DispatchOutcome {
        let Some(entry) = self.entries.get_mut(channel) else {
            return DispatchOutcome::default();
        };

        let mut removed = Vec::new();
        let dropped = fan_out(&mut entry.book_quotes, quotes);
        removed.extend(std::iter::repeat_n(ConsumerKind::BookQuote, dropped));

        if let Some(fanout) = entry.bbo.as_mut() {
            let mut changed = false;
            for quote in quotes {
                changed |= fanout.aggregator.update(quote);
            }

            if changed {
                let snapshot = *fanout.aggregator.bbo();
                let dropped = fan_out(&mut fanout.sinks, &[snapshot]);
                removed.extend(std::iter::repeat_n(ConsumerKind::Bbo, dropped));
            }

            if fanout.sinks.is_empty() {
                entry.bbo = None;
            }
        }

        DispatchOutcome {
            removed,
            request: self.release_if_empty(channel),
        }
    }

    /// Deliver one trade print.
    pub fn dispatch_trade(&mut self, channel: &WireChannel, trade: &TimeAndSale) -> DispatchOutcome {
        let Some(entry) = self.entries.get_mut(channel) else {
            return DispatchOutcome::default();
        };

        let dropped = fan_out(&mut entry.time_and_sales, std::slice::from_ref(trade));

        DispatchOutcome {
            removed: vec![ConsumerKind::TimeAndSale; dropped],
            request: self.release_if_empty(channel),
        }
    }

    /// Drop every entry without producing unsubscribe requests.
    ///
    /// Returns the number of channels dropped.
    pub fn clear(&mut self) -> usize {
        let channels = self.entries.len();
        self.entries.clear();
        channels
    }

    /// Whether a wire channel has any consumer.
    #[must_use]
    pub fn contains(&self, channel: &WireChannel) -> bool {
        self.entries.contains_key(channel)
    }

    /// Number of consumers registered under a stream key.
    #[must_use]
    pub fn consumer_count(&self, key: &StreamKey) -> usize {
        self.entries
            .get(&key.channel)
            .map_or(0, |entry| entry.count(key.kind))
    }

    /// Current BBO of a channel, if it has BBO consumers.
    #[must_use]
    pub fn bbo(&self, channel: &WireChannel) -> Option<BboQuote> {
        self.entries
            .get(channel)
            .and_then(|entry| entry.bbo.as_ref())
            .map(|fanout| *fanout.aggregator.bbo())
    }

    /// Number of channels with at least one consumer.
    #[must_use]
    pub fn channel_count(&self) -> usize {
        self.entries.len()
    }

    /// All channels with at least one consumer.
    #[must_use]
    pub fn active_channels(&self) -> Vec<WireChannel> {
        self.entries.keys().cloned().collect()
    }

    /// Get registry statistics.
    #[must_use]
    pub fn stats(&self) -> RegistryStats {
        let mut stats = RegistryStats {
            channel_count: self.entries.len(),
            ..RegistryStats::default()
        };

        for entry in self.entries.values() {
            stats.bbo_consumers += entry.count(ConsumerKind::Bbo);
            stats.book_quote_consumers += entry.count(ConsumerKind::BookQuote);
            stats.time_and_sale_consumers += entry.count(ConsumerKind::TimeAndSale);
            stats.aggregator_count += usize::from(entry.bbo.is_some());
        }

        stats
    }

    fn release_if_empty(&mut self, channel: &WireChannel) -> Option<ChannelRequest> {
        if !self.entries.get(channel).is_some_and(ChannelEntry::is_empty) {
            return None;
        }

        self.entries.remove(channel);
        Some(ChannelRequest::Unsubscribe(channel.clone()))
    }
}

// =============================================================================
// Statistics
// =============================================================================

/// Registry statistics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RegistryStats {
    /// Number of subscribed wire channels.
    pub channel_count: usize,
    /// Number of BBO consumers.
    pub bbo_consumers: usize,
    /// Number of raw book quote consumers.
    pub book_quote_consumers: usize,
    /// Number of trade consumers.
    pub time_and_sale_consumers: usize,
    /// Number of live top-of-book aggregators.
    pub aggregator_count: usize,
}

impl RegistryStats {
    /// Total consumers across all kinds.
    #[must_use]
    pub const fn consumer_count(&self) -> usize {
        self.bbo_consumers + self.book_quote_consumers + self.time_and_sale_consumers
    }
}

// =============================================================================
// Tests
// =============================================================================

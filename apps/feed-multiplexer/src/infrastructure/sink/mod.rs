//! Consumer Sinks
//!
//! `Sink` implementations backed by `tokio::sync::mpsc` channels.
//!
//! Dropping the receiving half of a queue is how a consumer unsubscribes: the
//! next push fails with [`SinkClosed`] and the multiplexer removes the sink.
//!
//! # Full Queues
//!
//! The receive loop never waits on a consumer. What a full bounded queue
//! does depends on the value kind:
//!
//! - BBO snapshots supersede each other, so the newest one is dropped and
//!   the consumer stays subscribed
//! - Book quotes and trades are deltas; losing one would leave the consumer
//!   with a wrong book or tape, so the consumer is disconnected instead and
//!   its receiver ends once drained

use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;

use crate::domain::market_data::{BboQuote, BookQuote, TimeAndSale};
use crate::domain::subscription::{Consumer, ConsumerKind, Sink, SinkClosed};
use crate::infrastructure::metrics;

impl<T: Send> Sink<T> for mpsc::UnboundedSender<T> {
    fn push(&self, value: T) -> Result<(), SinkClosed> {
        self.send(value).map_err(|_| SinkClosed)
    }
}

/// What a bounded sink does when its queue is full.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Overflow {
    /// Drop the value, keep the consumer.
    DropValue,
    /// Report the sink closed so the consumer is removed.
    Disconnect,
}

impl Overflow {
    /// Overflow policy for values of `kind`.
    #[must_use]
    pub const fn for_kind(kind: ConsumerKind) -> Self {
        match kind {
            ConsumerKind::Bbo => Self::DropValue,
            ConsumerKind::BookQuote | ConsumerKind::TimeAndSale => Self::Disconnect,
        }
    }
}

/// Bounded queue sink.
///
/// Never blocks the receive loop; see [`Overflow`] for full queues.
#[derive(Debug, Clone)]
pub struct BoundedSink<T> {
    tx: mpsc::Sender<T>,
    kind: ConsumerKind,
}

impl<T> BoundedSink<T> {
    /// Wrap a bounded sender feeding a consumer of `kind`.
    #[must_use]
    pub const fn new(tx: mpsc::Sender<T>, kind: ConsumerKind) -> Self {
        Self { tx, kind }
    }
}

impl<T: Send> Sink<T> for BoundedSink<T> {
    fn push(&self, value: T) -> Result<(), SinkClosed> {
        match self.tx.try_send(value) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => {
                metrics::record_value_dropped(self.kind);
                match Overflow::for_kind(self.kind) {
                    Overflow::DropValue => {
                        tracing::warn!(kind = %self.kind, "Consumer queue full, dropping value");
                        Ok(())
                    }
                    Overflow::Disconnect => {
                        tracing::warn!(
                            kind = %self.kind,
                            "Consumer queue full, disconnecting lagging consumer"
                        );
                        Err(SinkClosed)
                    }
                }
            }
            Err(TrySendError::Closed(_)) => Err(SinkClosed),
        }
    }
}

/// Bounded queue feeding one consumer.
#[derive(Debug)]
pub struct ConsumerQueue<T> {
    /// Sending half, handed to the multiplexer.
    pub sink: BoundedSink<T>,
    /// Receiving half, kept by the consumer.
    pub receiver: mpsc::Receiver<T>,
}

impl<T> ConsumerQueue<T> {
    /// Create a queue holding up to `capacity` values.
    ///
    /// A zero capacity is raised to one.
    #[must_use]
    pub fn new(kind: ConsumerKind, capacity: usize) -> Self {
        let (tx, receiver) = mpsc::channel(capacity.max(1));
        Self {
            sink: BoundedSink::new(tx, kind),
            receiver,
        }
    }
}

impl ConsumerQueue<BboQuote> {
    /// BBO consumer and its receiver.
    #[must_use]
    pub fn bbo(capacity: usize) -> (Consumer, mpsc::Receiver<BboQuote>) {
        let queue = Self::new(ConsumerKind::Bbo, capacity);
        (Consumer::bbo(queue.sink), queue.receiver)
    }
}

impl ConsumerQueue<BookQuote> {
    /// Raw book quote consumer and its receiver.
    #[must_use]
    pub fn book_quote(capacity: usize) -> (Consumer, mpsc::Receiver<BookQuote>) {
        let queue = Self::new(ConsumerKind::BookQuote, capacity);
        (Consumer::book_quote(queue.sink), queue.receiver)
    }
}

impl ConsumerQueue<TimeAndSale> {
    /// Trade consumer and its receiver.
    #[must_use]
    pub fn time_and_sale(capacity: usize) -> (Consumer, mpsc::Receiver<TimeAndSale>) {
        let queue = Self::new(ConsumerKind::TimeAndSale, capacity);
        (Consumer::time_and_sale(queue.sink), queue.receiver)
    }
}

//! Port Interfaces
//!
//! Defines the interfaces (ports) for external systems following
//! the Hexagonal Architecture pattern. These are the contracts that
//! infrastructure adapters must implement.
//!
//! ## Driven Ports (Outbound)
//!
//! - `Transport`: Raw message connection to the upstream venue
//! - `FeedCodec`: Venue wire format (channel naming, decoding, request framing)
//! - `Clock`: Wall-clock time source
//!
//! ## Consumer Port
//!
//! - `Sink`: Delivery capability for one consumer, defined next to the
//!   subscription registry that owns the sinks

mod clock_port;
mod codec_port;
mod transport_port;

pub use clock_port::{Clock, SystemClock};
pub use codec_port::{CodecError, DepthUpdate, FeedCodec, FeedEvent, MessageClass, TradeUpdate};
pub use transport_port::{Transport, TransportError};

pub use crate::domain::subscription::{Sink, SinkClosed};

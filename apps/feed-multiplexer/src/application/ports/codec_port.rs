//! Feed Codec Port
//!
//! Translation between a venue's wire format and domain events.

use crate::domain::market_data::{BookQuote, Ticker, TimeAndSale};
use crate::domain::subscription::{ChannelClass, ChannelRequest, WireChannel};

/// Codec error.
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    /// Malformed JSON or unexpected shape.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// A numeric field could not be parsed.
    #[error("invalid number in field {field}: {value}")]
    InvalidNumber {
        /// Field name.
        field: &'static str,
        /// Offending value.
        value: String,
    },

    /// The message matches no known message class.
    #[error("unknown message")]
    UnknownMessage,
}

/// Structural class of an upstream message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageClass {
    /// Order book delta.
    Depth,
    /// Trade print.
    Trade,
    /// Response to a subscribe or unsubscribe request.
    Response,
}

impl MessageClass {
    /// Short label for logs and metrics.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Depth => "depth",
            Self::Trade => "trade",
            Self::Response => "response",
        }
    }
}

/// Book delta for one depth channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DepthUpdate {
    /// Channel the update arrived on.
    pub channel: WireChannel,
    /// Bid side quotes.
    pub bids: Vec<BookQuote>,
    /// Ask side quotes.
    pub asks: Vec<BookQuote>,
}

impl DepthUpdate {
    /// All quotes of the update, bids first.
    #[must_use]
    pub fn into_quotes(self) -> Vec<BookQuote> {
        let mut quotes = self.bids;
        quotes.extend(self.asks);
        quotes
    }
}

/// Trade print for one trade channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TradeUpdate {
    /// Channel the trade arrived on.
    pub channel: WireChannel,
    /// The trade.
    pub trade: TimeAndSale,
}

/// Decoded upstream message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FeedEvent {
    /// Order book delta.
    Depth(DepthUpdate),
    /// Trade print.
    Trade(TradeUpdate),
    /// Acknowledgement of a request.
    Response {
        /// Request id being answered, if the venue echoed one.
        id: Option<u64>,
    },
}

/// Venue wire format.
pub trait FeedCodec: Send + Sync {
    /// Wire channel carrying one class of messages for a ticker.
    fn channel(&self, ticker: &Ticker, class: ChannelClass) -> WireChannel;

    /// Classify a raw message. Classes are tried in a fixed priority order
    /// and the first match wins; `None` means unrecognised.
    fn classify(&self, raw: &str) -> Option<MessageClass>;

    /// Decode a raw message of a known class.
    ///
    /// # Errors
    ///
    /// Returns a [`CodecError`] if the message does not match its class.
    fn decode(&self, class: MessageClass, raw: &str) -> Result<FeedEvent, CodecError>;

    /// Frame a subscription request with its request id.
    ///
    /// # Errors
    ///
    /// Returns a [`CodecError`] if the request cannot be serialised.
    fn encode_request(&self, request: &ChannelRequest, id: u64) -> Result<String, CodecError>;
}

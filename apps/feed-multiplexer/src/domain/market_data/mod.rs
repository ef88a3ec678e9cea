//! Market Data Types
//!
//! Canonical internal representation of the values the multiplexer routes:
//! per-participant book quotes, the aggregated best bid/offer and executed
//! trade prints. These types are codec-agnostic; venue adapters translate
//! their wire formats into them.

use std::fmt;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

// =============================================================================
// Identifiers
// =============================================================================

/// A tradable instrument symbol as the venue names it (e.g. `BTCUSDT`).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Ticker {
    symbol: String,
}

impl Ticker {
    /// Create a ticker from its symbol.
    #[must_use]
    pub fn new(symbol: impl Into<String>) -> Self {
        Self {
            symbol: symbol.into(),
        }
    }

    /// The symbol as given.
    #[must_use]
    pub fn symbol(&self) -> &str {
        &self.symbol
    }
}

impl fmt::Display for Ticker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.symbol)
    }
}

/// Venue (market center) code.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Venue(pub String);

impl Venue {
    /// Create a venue from its code.
    #[must_use]
    pub fn new(code: impl Into<String>) -> Self {
        Self(code.into())
    }

    /// The venue code.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Venue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

// =============================================================================
// Quotes
// =============================================================================

/// Side of the book a quote rests on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Side {
    /// Buy interest.
    Bid,
    /// Sell interest.
    Ask,
}

/// A price and size on one side of the book.
///
/// A size of zero means "no quote".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Quote {
    /// Quoted price.
    pub price: Decimal,
    /// Quoted size, never negative.
    pub size: Decimal,
    /// Side of the book.
    pub side: Side,
}

impl Quote {
    /// Create a quote.
    #[must_use]
    pub const fn new(price: Decimal, size: Decimal, side: Side) -> Self {
        Self { price, size, side }
    }

    /// An empty quote (zero price, zero size) on the given side.
    #[must_use]
    pub const fn empty(side: Side) -> Self {
        Self {
            price: Decimal::ZERO,
            size: Decimal::ZERO,
            side,
        }
    }

    /// Whether this quote carries no interest.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.size.is_zero()
    }
}

/// One participant's resting interest at one price on one side.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BookQuote {
    /// Market participant identifier.
    pub participant_id: String,
    /// Whether the participant is the venue's primary participant.
    pub is_primary: bool,
    /// Venue the quote was published on.
    pub venue: Venue,
    /// Price, size and side. A size of zero deletes the participant's quote.
    pub quote: Quote,
    /// Time of the update that produced this quote.
    pub timestamp: DateTime<Utc>,
}

impl BookQuote {
    /// Create a book quote.
    #[must_use]
    pub fn new(
        participant_id: impl Into<String>,
        is_primary: bool,
        venue: Venue,
        quote: Quote,
        timestamp: DateTime<Utc>,
    ) -> Self {
        Self {
            participant_id: participant_id.into(),
            is_primary,
            venue,
            quote,
            timestamp,
        }
    }

    /// Whether this update removes the participant's quote.
    #[must_use]
    pub fn is_delete(&self) -> bool {
        self.quote.is_empty()
    }
}

/// Best bid and best offer for one symbol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BboQuote {
    /// Best bid; `side` is always [`Side::Bid`].
    pub bid: Quote,
    /// Best ask; `side` is always [`Side::Ask`].
    pub ask: Quote,
    /// Time of the update that last changed either side.
    pub timestamp: DateTime<Utc>,
}

impl BboQuote {
    /// Create a BBO from both sides.
    #[must_use]
    pub fn new(bid: Quote, ask: Quote, timestamp: DateTime<Utc>) -> Self {
        debug_assert_eq!(bid.side, Side::Bid);
        debug_assert_eq!(ask.side, Side::Ask);
        Self {
            bid,
            ask,
            timestamp,
        }
    }

    /// A BBO with no quote on either side.
    #[must_use]
    pub const fn empty() -> Self {
        Self {
            bid: Quote::empty(Side::Bid),
            ask: Quote::empty(Side::Ask),
            timestamp: DateTime::<Utc>::UNIX_EPOCH,
        }
    }

    /// The quote for one side.
    #[must_use]
    pub const fn side(&self, side: Side) -> &Quote {
        match side {
            Side::Bid => &self.bid,
            Side::Ask => &self.ask,
        }
    }
}

impl Default for BboQuote {
    fn default() -> Self {
        Self::empty()
    }
}

// =============================================================================
// Trades
// =============================================================================

/// Kind of sale condition attached to a trade print.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConditionKind {
    /// Regular trade.
    #[default]
    Regular,
    /// Opening print.
    Open,
    /// Closing print.
    Close,
}

/// Sale condition of a trade print.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TradeCondition {
    /// Condition kind.
    pub kind: ConditionKind,
    /// Venue-specific condition code, empty when not reported.
    pub code: String,
}

/// An executed trade print.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeAndSale {
    /// Execution time.
    pub timestamp: DateTime<Utc>,
    /// Execution price.
    pub price: Decimal,
    /// Executed size.
    pub size: Decimal,
    /// Sale condition.
    pub condition: TradeCondition,
    /// Market center that reported the trade.
    pub market_center: String,
}

// =============================================================================
// Tests
// =============================================================================

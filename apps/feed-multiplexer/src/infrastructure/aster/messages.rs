//! Aster WebSocket Message Types
//!
//! Wire format types for the Aster futures market data stream. Prices and
//! quantities arrive as decimal strings; times are milliseconds since the
//! Unix epoch.
//!
//! # Message Types
//!
//! - `DepthUpdateMessage`: Order book delta (`<symbol>@depth`)
//! - `AggTradeMessage`: Aggregated trade (`<symbol>@aggTrade`)
//! - `ResponseMessage`: Reply to a SUBSCRIBE/UNSUBSCRIBE request
//! - `RequestMessage`: Outbound SUBSCRIBE/UNSUBSCRIBE request

use serde::{Deserialize, Serialize};

// =============================================================================
// Market Data
// =============================================================================

/// Order book delta.
///
/// # Wire Format (JSON)
/// ```json
/// {
///   "e": "depthUpdate", "E": 1736935200123, "T": 1736935200120,
///   "s": "BTCUSDT", "U": 100, "u": 105, "pu": 99,
///   "b": [["97000.10", "1.500"]],
///   "a": [["97000.20", "0"]]
/// }
/// ```
///
/// A quantity of `"0"` removes the price level.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DepthUpdateMessage {
    /// Event type (always "depthUpdate")
    #[serde(rename = "e")]
    pub event: String,

    /// Event time (ms)
    #[serde(rename = "E")]
    pub event_time: i64,

    /// Transaction time (ms)
    #[serde(rename = "T", default)]
    pub transaction_time: i64,

    /// Symbol
    #[serde(rename = "s")]
    pub symbol: String,

    /// First update id in event
    #[serde(rename = "U", default)]
    pub first_update_id: u64,

    /// Final update id in event
    #[serde(rename = "u", default)]
    pub final_update_id: u64,

    /// Final update id of the previous event
    #[serde(rename = "pu", default)]
    pub previous_final_update_id: u64,

    /// Bid levels as `[price, quantity]`
    #[serde(rename = "b", default)]
    pub bids: Vec<[String; 2]>,

    /// Ask levels as `[price, quantity]`
    #[serde(rename = "a", default)]
    pub asks: Vec<[String; 2]>,
}

/// Aggregated trade.
///
/// # Wire Format (JSON)
/// ```json
/// {
///   "e": "aggTrade", "E": 1736935200123, "s": "BTCUSDT", "a": 5933014,
///   "p": "97000.10", "q": "0.010", "f": 100, "l": 105,
///   "T": 1736935200120, "m": true
/// }
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AggTradeMessage {
    /// Event type (always "aggTrade")
    #[serde(rename = "e")]
    pub event: String,

    /// Event time (ms)
    #[serde(rename = "E")]
    pub event_time: i64,

    /// Symbol
    #[serde(rename = "s")]
    pub symbol: String,

    /// Aggregate trade id
    #[serde(rename = "a", default)]
    pub aggregate_trade_id: u64,

    /// Price
    #[serde(rename = "p")]
    pub price: String,

    /// Quantity
    #[serde(rename = "q")]
    pub quantity: String,

    /// First trade id
    #[serde(rename = "f", default)]
    pub first_trade_id: u64,

    /// Last trade id
    #[serde(rename = "l", default)]
    pub last_trade_id: u64,

    /// Trade time (ms)
    #[serde(rename = "T")]
    pub trade_time: i64,

    /// Whether the buyer was the maker
    #[serde(rename = "m", default)]
    pub is_buyer_maker: bool,
}

// =============================================================================
// Requests and Responses
// =============================================================================

/// Subscription request method.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum RequestMethod {
    /// Start a stream
    Subscribe,
    /// Stop a stream
    Unsubscribe,
}

/// Outbound subscription request.
///
/// # Wire Format (JSON)
/// ```json
/// {"method": "SUBSCRIBE", "params": ["btcusdt@depth"], "id": 1}
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestMessage {
    /// Request method
    pub method: RequestMethod,

    /// Stream names
    pub params: Vec<String>,

    /// Request id, echoed in the response
    pub id: u64,
}

impl RequestMessage {
    /// Serialize to JSON string.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization fails.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

/// Reply to a subscription request.
///
/// # Wire Format (JSON)
/// ```json
/// {"result": null, "id": 1}
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResponseMessage {
    /// Result payload, `null` on success
    #[serde(default)]
    pub result: Option<serde_json::Value>,

    /// Request id being answered
    #[serde(default)]
    pub id: Option<u64>,
}

// =============================================================================
// Tests
// =============================================================================

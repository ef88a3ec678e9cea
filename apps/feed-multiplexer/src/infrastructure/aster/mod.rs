//! Aster Venue Adapter
//!
//! Wire types and codec for the Aster futures market data stream:
//!
//! - **Depth**: `<symbol>@depth` order book deltas, fed to book and BBO consumers
//! - **Trades**: `<symbol>@aggTrade` aggregated trades, fed to time and sales consumers
//! - **Requests**: `SUBSCRIBE` / `UNSUBSCRIBE` with a numeric request id

pub mod codec;
pub mod messages;

pub use codec::{AGG_TRADE_SUFFIX, ASTER_MPID, AsterCodec, DEPTH_SUFFIX};
pub use messages::{
    AggTradeMessage, DepthUpdateMessage, RequestMessage, RequestMethod, ResponseMessage,
};

/// Default Aster futures WebSocket endpoint.
pub const DEFAULT_WS_URL: &str = "wss://fstream.asterdex.com/ws";

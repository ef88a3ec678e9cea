//! Aster Codec
//!
//! `FeedCodec` implementation for the Aster futures WebSocket API.
//!
//! Messages are classified by their leading bytes against an ordered prefix
//! table before any JSON parsing happens; the first matching prefix wins.

use std::str::FromStr;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;

use crate::application::ports::{
    CodecError, DepthUpdate, FeedCodec, FeedEvent, MessageClass, TradeUpdate,
};
use crate::domain::market_data::{
    BookQuote, ConditionKind, Quote, Side, Ticker, TimeAndSale, TradeCondition, Venue,
};
use crate::domain::subscription::{ChannelClass, ChannelRequest, WireChannel};
use crate::infrastructure::aster::messages::{
    AggTradeMessage, DepthUpdateMessage, RequestMessage, RequestMethod, ResponseMessage,
};

/// Participant id, venue and market center reported for every Aster quote.
pub const ASTER_MPID: &str = "ASTR";

/// Stream suffix of depth channels.
pub const DEPTH_SUFFIX: &str = "@depth";

/// Stream suffix of trade channels.
pub const AGG_TRADE_SUFFIX: &str = "@aggTrade";

/// Message prefixes in priority order.
const PREFIXES: [(&str, MessageClass); 3] = [
    (r#"{"e":"depthUpdate""#, MessageClass::Depth),
    (r#"{"e":"aggTrade""#, MessageClass::Trade),
    (r#"{"result""#, MessageClass::Response),
];

/// JSON codec for the Aster market data stream.
#[derive(Debug, Default, Clone)]
pub struct AsterCodec;

impl AsterCodec {
    /// Create a new Aster codec.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }

    fn stream_name(symbol: &str, class: ChannelClass) -> WireChannel {
        let suffix = match class {
            ChannelClass::Depth => DEPTH_SUFFIX,
            ChannelClass::Trade => AGG_TRADE_SUFFIX,
        };
        WireChannel::new(format!("{}{suffix}", symbol.to_lowercase()))
    }

    fn decode_depth(raw: &str) -> Result<DepthUpdate, CodecError> {
        let msg: DepthUpdateMessage = serde_json::from_str(raw)?;
        let timestamp = parse_millis("E", msg.event_time)?;

        let bids = to_book_quotes(&msg.bids, Side::Bid, timestamp)?;
        let asks = to_book_quotes(&msg.asks, Side::Ask, timestamp)?;

        Ok(DepthUpdate {
            channel: Self::stream_name(&msg.symbol, ChannelClass::Depth),
            bids,
            asks,
        })
    }

    fn decode_trade(raw: &str) -> Result<TradeUpdate, CodecError> {
        let msg: AggTradeMessage = serde_json::from_str(raw)?;

        let trade = TimeAndSale {
            timestamp: parse_millis("T", msg.trade_time)?,
            price: parse_non_negative("p", &msg.price)?,
            size: parse_non_negative("q", &msg.quantity)?,
            condition: TradeCondition {
                kind: ConditionKind::Regular,
                code: String::new(),
            },
            market_center: ASTER_MPID.to_string(),
        };

        Ok(TradeUpdate {
            channel: Self::stream_name(&msg.symbol, ChannelClass::Trade),
            trade,
        })
    }
}

impl FeedCodec for AsterCodec {
    fn channel(&self, ticker: &Ticker, class: ChannelClass) -> WireChannel {
        Self::stream_name(ticker.symbol(), class)
    }

    fn classify(&self, raw: &str) -> Option<MessageClass> {
        PREFIXES
            .iter()
            .find(|(prefix, _)| raw.starts_with(prefix))
            .map(|(_, class)| *class)
    }

    fn decode(&self, class: MessageClass, raw: &str) -> Result<FeedEvent, CodecError> {
        match class {
            MessageClass::Depth => Self::decode_depth(raw).map(FeedEvent::Depth),
            MessageClass::Trade => Self::decode_trade(raw).map(FeedEvent::Trade),
            MessageClass::Response => {
                let msg: ResponseMessage = serde_json::from_str(raw)?;
                Ok(FeedEvent::Response { id: msg.id })
            }
        }
    }

    fn encode_request(&self, request: &ChannelRequest, id: u64) -> Result<String, CodecError> {
        let method = match request {
            ChannelRequest::Subscribe(_) => RequestMethod::Subscribe,
            ChannelRequest::Unsubscribe(_) => RequestMethod::Unsubscribe,
        };

        let msg = RequestMessage {
            method,
            params: vec![request.channel().as_str().to_string()],
            id,
        };

        Ok(msg.to_json()?)
    }
}

fn to_book_quotes(
    levels: &[[String; 2]],
    side: Side,
    timestamp: DateTime<Utc>,
) -> Result<Vec<BookQuote>, CodecError> {
    levels
        .iter()
        .map(|[price, quantity]| -> Result<BookQuote, CodecError> {
            let quote = Quote::new(
                parse_non_negative("price", price)?,
                parse_non_negative("quantity", quantity)?,
                side,
            );
            Ok(BookQuote::new(
                ASTER_MPID,
                true,
                Venue::new(ASTER_MPID),
                quote,
                timestamp,
            ))
        })
        .collect()
}

fn parse_decimal(field: &'static str, value: &str) -> Result<Decimal, CodecError> {
    Decimal::from_str(value).map_err(|_| CodecError::InvalidNumber {
        field,
        value: value.to_string(),
    })
}

/// Prices and sizes on the wire are never negative.
fn parse_non_negative(field: &'static str, value: &str) -> Result<Decimal, CodecError> {
    let number = parse_decimal(field, value)?;
    if number.is_sign_negative() && !number.is_zero() {
        return Err(CodecError::InvalidNumber {
            field,
            value: value.to_string(),
        });
    }
    Ok(number)
}

fn parse_millis(field: &'static str, millis: i64) -> Result<DateTime<Utc>, CodecError> {
    DateTime::from_timestamp_millis(millis).ok_or_else(|| CodecError::InvalidNumber {
        field,
        value: millis.to_string(),
    })
}

// =============================================================================
// Tests
// =============================================================================

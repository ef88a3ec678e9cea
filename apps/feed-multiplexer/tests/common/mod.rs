//! Shared fixtures for the integration tests.

#![allow(clippy::unwrap_used, clippy::expect_used, dead_code)]

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use feed_multiplexer::{
    AsterCodec, Clock, FeedMultiplexer, TimeAndSale, Ticker, Transport, TransportError,
};
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// How long a test waits for the receive loop.
pub const WAIT: Duration = Duration::from_secs(2);

/// Symbol used by [`Fence`].
pub const FENCE_SYMBOL: &str = "FENCEUSDT";

// =============================================================================
// In-memory transport
// =============================================================================

/// One SUBSCRIBE/UNSUBSCRIBE request captured from the outbound side.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SentRequest {
    pub method: String,
    pub channel: String,
    pub id: u64,
}

/// Transport double: inbound messages are scripted, outbound ones recorded.
pub struct MemoryTransport {
    inbound_tx: mpsc::UnboundedSender<Result<String, TransportError>>,
    inbound_rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<Result<String, TransportError>>>,
    sent: Mutex<Vec<String>>,
    closed: CancellationToken,
}

impl MemoryTransport {
    pub fn new() -> Arc<Self> {
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        Arc::new(Self {
            inbound_tx,
            inbound_rx: tokio::sync::Mutex::new(inbound_rx),
            sent: Mutex::new(Vec::new()),
            closed: CancellationToken::new(),
        })
    }

    /// Queue one raw upstream message.
    pub fn deliver(&self, raw: impl Into<String>) {
        self.inbound_tx.send(Ok(raw.into())).unwrap();
    }

    /// Queue a transport error.
    pub fn fail(&self, error: TransportError) {
        self.inbound_tx.send(Err(error)).unwrap();
    }

    /// Simulate the upstream hanging up.
    pub fn finish(&self) {
        self.fail(TransportError::EndOfStream);
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    /// Every outbound request, in send order.
    pub fn requests(&self) -> Vec<SentRequest> {
        self.sent
            .lock()
            .iter()
            .map(|raw| {
                let value: serde_json::Value = serde_json::from_str(raw).unwrap();
                SentRequest {
                    method: value["method"].as_str().unwrap().to_string(),
                    channel: value["params"][0].as_str().unwrap().to_string(),
                    id: value["id"].as_u64().unwrap(),
                }
            })
            .collect()
    }

    /// Outbound requests for one channel, fence traffic excluded.
    pub fn requests_for(&self, channel: &str) -> Vec<SentRequest> {
        self.requests()
            .into_iter()
            .filter(|request| request.channel == channel)
            .collect()
    }

    /// Number of requests with `method` for `channel`.
    pub fn count(&self, method: &str, channel: &str) -> usize {
        self.requests_for(channel)
            .iter()
            .filter(|request| request.method == method)
            .count()
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn recv(&self) -> Result<String, TransportError> {
        let mut inbound = self.inbound_rx.lock().await;
        tokio::select! {
            () = self.closed.cancelled() => Err(TransportError::EndOfStream),
            next = inbound.recv() => next.unwrap_or(Err(TransportError::EndOfStream)),
        }
    }

    fn send(&self, message: String) -> Result<(), TransportError> {
        if self.closed.is_cancelled() {
            return Err(TransportError::EndOfStream);
        }
        self.sent.lock().push(message);
        Ok(())
    }

    fn close(&self) {
        self.closed.cancel();
    }
}

// =============================================================================
// Clock
// =============================================================================

/// Clock frozen at [`fixed_time`].
pub struct FixedClock;

pub fn fixed_time() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2025, 1, 15, 10, 0, 0).unwrap()
}

impl Clock for FixedClock {
    fn now(&self) -> DateTime<Utc> {
        fixed_time()
    }
}

// =============================================================================
// Multiplexer
// =============================================================================

pub fn start(transport: &Arc<MemoryTransport>) -> FeedMultiplexer {
    FeedMultiplexer::start(
        Arc::clone(transport) as Arc<dyn Transport>,
        Arc::new(AsterCodec::new()),
        Arc::new(FixedClock),
    )
}

/// Receive one value or fail the test.
pub async fn recv<T>(receiver: &mut mpsc::UnboundedReceiver<T>) -> T {
    tokio::time::timeout(WAIT, receiver.recv())
        .await
        .expect("timed out waiting for value")
        .expect("sink closed")
}

/// Poll `condition` until it holds or fail the test.
pub async fn wait_until(mut condition: impl FnMut() -> bool) {
    tokio::time::timeout(WAIT, async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("condition not met in time");
}

/// Trade consumer on its own channel, used to wait until every message
/// delivered before it has been processed by the receive loop.
pub struct Fence {
    transport: Arc<MemoryTransport>,
    receiver: mpsc::UnboundedReceiver<TimeAndSale>,
}

impl Fence {
    pub fn attach(multiplexer: &FeedMultiplexer, transport: &Arc<MemoryTransport>) -> Self {
        let (tx, receiver) = mpsc::unbounded_channel();
        multiplexer
            .subscribe_time_and_sales(&Ticker::new(FENCE_SYMBOL), tx)
            .unwrap();
        Self {
            transport: Arc::clone(transport),
            receiver,
        }
    }

    pub async fn sync(&mut self) {
        self.transport
            .deliver(agg_trade(FENCE_SYMBOL, "1", "1", 1_736_935_200_000));
        recv(&mut self.receiver).await;
    }
}

// =============================================================================
// Wire messages
// =============================================================================

fn levels(levels: &[(&str, &str)]) -> String {
    let levels: Vec<[&str; 2]> = levels.iter().map(|(price, qty)| [*price, *qty]).collect();
    serde_json::to_string(&levels).unwrap()
}

/// Raw `depthUpdate` message.
pub fn depth_update(
    symbol: &str,
    event_time: i64,
    bids: &[(&str, &str)],
    asks: &[(&str, &str)],
) -> String {
    format!(
        r#"{{"e":"depthUpdate","E":{event_time},"T":{event_time},"s":"{symbol}","U":1,"u":2,"pu":0,"b":{},"a":{}}}"#,
        levels(bids),
        levels(asks)
    )
}

/// Raw `aggTrade` message.
pub fn agg_trade(symbol: &str, price: &str, qty: &str, trade_time: i64) -> String {
    format!(
        r#"{{"e":"aggTrade","E":{trade_time},"s":"{symbol}","a":1,"p":"{price}","q":"{qty}","f":1,"l":1,"T":{trade_time},"m":false}}"#
    )
}

//! Subscription Management Integration Tests
//!
//! Tests upstream reference counting, consumer fan-out and dead consumer
//! cleanup through the multiplexer, the Aster codec and an in-memory
//! transport.

#![allow(clippy::unwrap_used, clippy::expect_used)]

mod common;

use std::str::FromStr;
use std::sync::Arc;

use rust_decimal::Decimal;
use tokio::sync::mpsc;

use common::{MemoryTransport, Fence, agg_trade, depth_update, recv, start, wait_until};
use feed_multiplexer::{BboQuote, BookQuote, ConsumerQueue, Side, Ticker, TimeAndSale};

fn dec(value: &str) -> Decimal {
    Decimal::from_str(value).unwrap()
}

/// Receive until the value stamped `last` arrives, asserting that nothing is
/// skipped or reordered after the first value seen.
async fn drain_in_order<T>(
    receiver: &mut mpsc::UnboundedReceiver<T>,
    last: i64,
    millis: impl Fn(&T) -> i64,
) {
    let mut previous: Option<i64> = None;
    loop {
        let current = millis(&recv(receiver).await);
        if let Some(previous) = previous {
            assert_eq!(current, previous + 1, "gap or reorder after {previous}");
        }
        if current == last {
            return;
        }
        previous = Some(current);
    }
}

#[tokio::test]
async fn bbo_and_book_consumers_share_depth_channel() {
    let transport = MemoryTransport::new();
    let multiplexer = start(&transport);
    let mut fence = Fence::attach(&multiplexer, &transport);
    let xyz = Ticker::new("XYZ");

    let (bbo_tx, mut bbo_rx) = mpsc::unbounded_channel::<BboQuote>();
    let (book_tx, mut book_rx) = mpsc::unbounded_channel::<BookQuote>();
    multiplexer.subscribe_bbo(&xyz, bbo_tx).unwrap();
    multiplexer.subscribe_book_quotes(&xyz, book_tx).unwrap();

    assert_eq!(transport.count("SUBSCRIBE", "xyz@depth"), 1);

    transport.deliver(depth_update("XYZ", 1_000, &[("10.00", "100")], &[]));

    let quote = recv(&mut book_rx).await;
    assert_eq!(quote.quote.price, dec("10.00"));
    assert_eq!(quote.quote.size, dec("100"));
    assert_eq!(quote.quote.side, Side::Bid);

    let bbo = recv(&mut bbo_rx).await;
    assert_eq!(bbo.bid.price, dec("10.00"));
    assert_eq!(bbo.bid.size, dec("100"));
    assert!(bbo.ask.is_empty());

    transport.deliver(depth_update("XYZ", 2_000, &[("10.00", "0")], &[]));

    let delete = recv(&mut book_rx).await;
    assert!(delete.is_delete());

    let bbo = recv(&mut bbo_rx).await;
    assert!(bbo.bid.is_empty());
    assert!(bbo.ask.is_empty());
    assert_eq!(bbo.timestamp.timestamp_millis(), 2_000);

    // Both consumers leave; the next BBO-changing update notices.
    drop(bbo_rx);
    drop(book_rx);
    transport.deliver(depth_update("XYZ", 3_000, &[("11.00", "5")], &[]));
    wait_until(|| transport.count("UNSUBSCRIBE", "xyz@depth") == 1).await;

    transport.deliver(depth_update("XYZ", 4_000, &[("12.00", "5")], &[]));
    fence.sync().await;
    assert_eq!(transport.count("UNSUBSCRIBE", "xyz@depth"), 1);
    assert_eq!(multiplexer.stats().unwrap().channel_count, 1);
}

#[tokio::test]
async fn refcount_unsubscribes_exactly_once() {
    let transport = MemoryTransport::new();
    let multiplexer = start(&transport);
    let mut fence = Fence::attach(&multiplexer, &transport);
    let btc = Ticker::new("BTCUSDT");

    let mut receivers = Vec::new();
    for _ in 0..3 {
        let (tx, rx) = mpsc::unbounded_channel::<TimeAndSale>();
        multiplexer.subscribe_time_and_sales(&btc, tx).unwrap();
        receivers.push(rx);
    }
    assert_eq!(transport.count("SUBSCRIBE", "btcusdt@aggTrade"), 1);

    let mut survivor = receivers.pop().unwrap();
    drop(receivers);

    transport.deliver(agg_trade("BTCUSDT", "97000.1", "0.5", 1_000));
    let trade = recv(&mut survivor).await;
    assert_eq!(trade.price, dec("97000.1"));

    fence.sync().await;
    assert_eq!(transport.count("UNSUBSCRIBE", "btcusdt@aggTrade"), 0);

    drop(survivor);
    transport.deliver(agg_trade("BTCUSDT", "97000.2", "0.5", 2_000));
    transport.deliver(agg_trade("BTCUSDT", "97000.3", "0.5", 3_000));
    fence.sync().await;

    let requests = transport.requests_for("btcusdt@aggTrade");
    assert_eq!(transport.count("UNSUBSCRIBE", "btcusdt@aggTrade"), 1);
    assert_eq!(requests.len(), 2);
    assert!(requests[0].id < requests[1].id);
}

#[tokio::test]
async fn failing_consumer_is_isolated() {
    let transport = MemoryTransport::new();
    let multiplexer = start(&transport);
    let eth = Ticker::new("ETHUSDT");

    let (first_tx, mut first) = mpsc::unbounded_channel::<TimeAndSale>();
    let (second_tx, second) = mpsc::unbounded_channel::<TimeAndSale>();
    let (third_tx, mut third) = mpsc::unbounded_channel::<TimeAndSale>();
    multiplexer.subscribe_time_and_sales(&eth, first_tx).unwrap();
    multiplexer.subscribe_time_and_sales(&eth, second_tx).unwrap();
    multiplexer.subscribe_time_and_sales(&eth, third_tx).unwrap();

    drop(second);
    transport.deliver(agg_trade("ETHUSDT", "3300.5", "1", 1_000));

    assert_eq!(recv(&mut first).await.price, dec("3300.5"));
    assert_eq!(recv(&mut third).await.price, dec("3300.5"));

    let stats = multiplexer.stats().unwrap();
    assert_eq!(stats.time_and_sale_consumers, 2);
    assert_eq!(transport.count("UNSUBSCRIBE", "ethusdt@aggTrade"), 0);
}

#[tokio::test]
async fn bbo_consumer_joining_book_channel_does_not_resubscribe() {
    let transport = MemoryTransport::new();
    let multiplexer = start(&transport);
    let btc = Ticker::new("BTCUSDT");

    let (book_tx, _book_rx) = mpsc::unbounded_channel::<BookQuote>();
    multiplexer.subscribe_book_quotes(&btc, book_tx).unwrap();
    assert_eq!(multiplexer.bbo(&btc).unwrap(), None);

    let (bbo_tx, mut bbo_rx) = mpsc::unbounded_channel::<BboQuote>();
    multiplexer.subscribe_bbo(&btc, bbo_tx).unwrap();

    assert_eq!(transport.count("SUBSCRIBE", "btcusdt@depth"), 1);
    assert_eq!(multiplexer.stats().unwrap().aggregator_count, 1);
    assert_eq!(multiplexer.bbo(&btc).unwrap(), Some(BboQuote::empty()));

    transport.deliver(depth_update("BTCUSDT", 1_000, &[], &[("97000.2", "2")]));

    let bbo = recv(&mut bbo_rx).await;
    assert_eq!(bbo.ask.price, dec("97000.2"));
    assert_eq!(multiplexer.bbo(&btc).unwrap(), Some(bbo));
}

#[tokio::test]
async fn depth_update_fans_out_bids_before_asks_with_one_bbo() {
    let transport = MemoryTransport::new();
    let multiplexer = start(&transport);
    let mut fence = Fence::attach(&multiplexer, &transport);
    let btc = Ticker::new("BTCUSDT");

    let (bbo_tx, mut bbo_rx) = mpsc::unbounded_channel::<BboQuote>();
    let (book_tx, mut book_rx) = mpsc::unbounded_channel::<BookQuote>();
    multiplexer.subscribe_bbo(&btc, bbo_tx).unwrap();
    multiplexer.subscribe_book_quotes(&btc, book_tx).unwrap();

    transport.deliver(depth_update(
        "BTCUSDT",
        1_000,
        &[("100", "1"), ("99", "2")],
        &[("101", "3")],
    ));
    fence.sync().await;

    let sides: Vec<Side> = std::iter::from_fn(|| book_rx.try_recv().ok())
        .map(|quote| quote.quote.side)
        .collect();
    assert_eq!(sides, vec![Side::Bid, Side::Bid, Side::Ask]);

    let bbo = bbo_rx.try_recv().unwrap();
    assert_eq!(bbo.bid.price, dec("100"));
    assert_eq!(bbo.bid.size, dec("1"));
    assert_eq!(bbo.ask.price, dec("101"));
    assert!(bbo_rx.try_recv().is_err());
}

#[tokio::test]
async fn released_channel_can_be_subscribed_again() {
    let transport = MemoryTransport::new();
    let multiplexer = start(&transport);
    let sol = Ticker::new("SOLUSDT");

    let (tx, rx) = mpsc::unbounded_channel::<TimeAndSale>();
    multiplexer.subscribe_time_and_sales(&sol, tx).unwrap();
    drop(rx);

    transport.deliver(agg_trade("SOLUSDT", "180", "1", 1_000));
    wait_until(|| transport.count("UNSUBSCRIBE", "solusdt@aggTrade") == 1).await;

    let (tx, mut rx) = mpsc::unbounded_channel::<TimeAndSale>();
    multiplexer.subscribe_time_and_sales(&sol, tx).unwrap();
    assert_eq!(transport.count("SUBSCRIBE", "solusdt@aggTrade"), 2);

    transport.deliver(agg_trade("SOLUSDT", "181", "1", 2_000));
    assert_eq!(recv(&mut rx).await.price, dec("181"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_subscribers_race_dispatch() {
    const SUBSCRIBERS: usize = 16;
    const UPDATES: i64 = 200;

    let transport = MemoryTransport::new();
    let multiplexer = Arc::new(start(&transport));
    let mut fence = Fence::attach(&multiplexer, &transport);

    let feeder = {
        let transport = Arc::clone(&transport);
        tokio::spawn(async move {
            for millis in 1..=UPDATES {
                transport.deliver(depth_update("BTCUSDT", millis, &[("100", "1")], &[]));
                transport.deliver(agg_trade("BTCUSDT", "100", "1", millis));
                if millis % 10 == 0 {
                    tokio::task::yield_now().await;
                }
            }
        })
    };

    let subscribers: Vec<_> = (0..SUBSCRIBERS)
        .map(|_| {
            let multiplexer = Arc::clone(&multiplexer);
            tokio::spawn(async move {
                let btc = Ticker::new("BTCUSDT");
                let (book_tx, book_rx) = mpsc::unbounded_channel::<BookQuote>();
                let (trade_tx, trade_rx) = mpsc::unbounded_channel::<TimeAndSale>();
                multiplexer.subscribe_book_quotes(&btc, book_tx).unwrap();
                multiplexer.subscribe_time_and_sales(&btc, trade_tx).unwrap();
                (book_rx, trade_rx)
            })
        })
        .collect();

    let mut receivers = Vec::new();
    for subscriber in subscribers {
        receivers.push(subscriber.await.unwrap());
    }
    feeder.await.unwrap();

    // Every consumer is registered before this one is delivered.
    let last = UPDATES + 1;
    transport.deliver(depth_update("BTCUSDT", last, &[("100", "1")], &[]));
    transport.deliver(agg_trade("BTCUSDT", "100", "1", last));

    for (book_rx, trade_rx) in &mut receivers {
        drain_in_order(book_rx, last, |quote| quote.timestamp.timestamp_millis()).await;
        drain_in_order(trade_rx, last, |trade| trade.timestamp.timestamp_millis()).await;
    }

    assert_eq!(transport.count("SUBSCRIBE", "btcusdt@depth"), 1);
    assert_eq!(transport.count("SUBSCRIBE", "btcusdt@aggTrade"), 1);
    let stats = multiplexer.stats().unwrap();
    assert_eq!(stats.book_quote_consumers, SUBSCRIBERS);
    assert_eq!(stats.time_and_sale_consumers, SUBSCRIBERS + 1);

    drop(receivers);
    transport.deliver(depth_update("BTCUSDT", last + 1, &[("100", "2")], &[]));
    transport.deliver(agg_trade("BTCUSDT", "100", "1", last + 1));
    wait_until(|| {
        transport.count("UNSUBSCRIBE", "btcusdt@depth") == 1
            && transport.count("UNSUBSCRIBE", "btcusdt@aggTrade") == 1
    })
    .await;

    transport.deliver(depth_update("BTCUSDT", last + 2, &[("100", "3")], &[]));
    transport.deliver(agg_trade("BTCUSDT", "100", "1", last + 2));
    fence.sync().await;

    assert_eq!(transport.count("UNSUBSCRIBE", "btcusdt@depth"), 1);
    assert_eq!(transport.count("UNSUBSCRIBE", "btcusdt@aggTrade"), 1);
    assert_eq!(multiplexer.stats().unwrap().channel_count, 1);
}

#[tokio::test]
async fn lagging_book_consumer_is_disconnected() {
    let transport = MemoryTransport::new();
    let multiplexer = start(&transport);
    let btc = Ticker::new("BTCUSDT");

    let (consumer, mut receiver) = ConsumerQueue::book_quote(1);
    multiplexer.subscribe(&btc, consumer).unwrap();

    transport.deliver(depth_update(
        "BTCUSDT",
        1_000,
        &[("100", "1"), ("99", "2")],
        &[],
    ));

    let first = tokio::time::timeout(common::WAIT, receiver.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(first.quote.price, dec("100"));

    // The second quote overflowed the queue; the consumer was removed, so
    // its receiver ends instead of silently skipping a delta.
    let ended = tokio::time::timeout(common::WAIT, receiver.recv()).await.unwrap();
    assert!(ended.is_none());

    wait_until(|| transport.count("UNSUBSCRIBE", "btcusdt@depth") == 1).await;
}

#[tokio::test]
async fn lagging_bbo_consumer_keeps_its_subscription() {
    let transport = MemoryTransport::new();
    let multiplexer = start(&transport);
    let mut fence = Fence::attach(&multiplexer, &transport);
    let btc = Ticker::new("BTCUSDT");

    let (consumer, mut receiver) = ConsumerQueue::bbo(1);
    multiplexer.subscribe(&btc, consumer).unwrap();

    transport.deliver(depth_update("BTCUSDT", 1_000, &[("100", "1")], &[]));
    transport.deliver(depth_update("BTCUSDT", 2_000, &[("101", "1")], &[]));
    fence.sync().await;

    assert_eq!(receiver.recv().await.unwrap().bid.price, dec("100"));
    assert!(receiver.try_recv().is_err());
    assert_eq!(multiplexer.stats().unwrap().bbo_consumers, 1);
    assert_eq!(transport.count("UNSUBSCRIBE", "btcusdt@depth"), 0);

    transport.deliver(depth_update("BTCUSDT", 3_000, &[("102", "1")], &[]));
    let bbo = tokio::time::timeout(common::WAIT, receiver.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(bbo.bid.price, dec("102"));
}

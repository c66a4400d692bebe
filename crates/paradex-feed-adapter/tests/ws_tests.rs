/*
[INPUT]:  WebSocket session scenarios against a local mock exchange
[OUTPUT]: Test results for connection manager, heartbeat and receiver
[POS]:    Integration tests - WebSocket
[UPDATE]: When connection lifecycle or routing behavior changes
*/

mod common;

use std::sync::Arc;
use std::time::Duration;

use common::{
    BOOK_CHANNEL, MockExchange, SYMBOL, TRADES_CHANNEL, book_frame, test_config, trade_frame, within,
};
use paradex_feed_adapter::{
    ConnectionState, FeedError, FeedReceiver, FeedSink, Side, Snapshot, StreamKind, TradeEvent,
};
use rust_decimal::Decimal;
use serde_json::json;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_test::assert_ok;
use tokio_util::sync::CancellationToken;

struct ChannelSink {
    snapshots: mpsc::UnboundedSender<Snapshot>,
    trades: mpsc::UnboundedSender<TradeEvent>,
    states: mpsc::UnboundedSender<(StreamKind, ConnectionState)>,
}

impl FeedSink for ChannelSink {
    fn on_snapshot(&self, snapshot: Snapshot) {
        let _ = self.snapshots.send(snapshot);
    }

    fn on_trade(&self, trade: TradeEvent) {
        let _ = self.trades.send(trade);
    }

    fn on_state_change(&self, stream: StreamKind, state: ConnectionState) {
        let _ = self.states.send((stream, state));
    }
}

struct Harness {
    receiver: Arc<FeedReceiver>,
    stop: CancellationToken,
    task: JoinHandle<paradex_feed_adapter::Result<()>>,
    snapshots: mpsc::UnboundedReceiver<Snapshot>,
    trades: mpsc::UnboundedReceiver<TradeEvent>,
    states: mpsc::UnboundedReceiver<(StreamKind, ConnectionState)>,
}

impl Harness {
    fn start(config: paradex_feed_adapter::ReceiverConfig) -> Self {
        let (snapshot_tx, snapshots) = mpsc::unbounded_channel();
        let (trade_tx, trades) = mpsc::unbounded_channel();
        let (state_tx, states) = mpsc::unbounded_channel();
        let sink = Arc::new(ChannelSink {
            snapshots: snapshot_tx,
            trades: trade_tx,
            states: state_tx,
        });

        let receiver = Arc::new(assert_ok!(FeedReceiver::new(config, sink)));
        let stop = CancellationToken::new();
        let task = {
            let receiver = receiver.clone();
            let stop = stop.clone();
            tokio::spawn(async move { receiver.run(stop).await })
        };

        Self {
            receiver,
            stop,
            task,
            snapshots,
            trades,
            states,
        }
    }

    async fn wait_for_state(&mut self, expected: ConnectionState) {
        loop {
            let (_, state) = within(self.states.recv()).await.expect("sink dropped");
            if state == expected {
                return;
            }
        }
    }

    async fn next_snapshot(&mut self) -> Snapshot {
        within(self.snapshots.recv()).await.expect("sink dropped")
    }

    async fn shutdown(self) {
        self.stop.cancel();
        let joined = assert_ok!(within(self.task).await);
        assert_ok!(joined);
    }
}

fn book_config(url: &str) -> paradex_feed_adapter::ReceiverConfig {
    let mut config = test_config(url);
    config.book_symbols = vec![SYMBOL.to_string()];
    config
}

#[tokio::test]
async fn test_snapshot_and_delta_are_emitted() {
    let mut exchange = MockExchange::start().await;
    let mut harness = Harness::start(book_config(&exchange.url));

    let mut conn = exchange.next_connection().await;
    assert_eq!(conn.confirm_subscription().await, BOOK_CHANNEL);
    harness.wait_for_state(ConnectionState::Subscribed).await;

    conn.send_json(book_frame(
        1,
        "s",
        json!({"inserts": [
            {"side": "BUY", "price": "100", "size": "1"},
            {"side": "SELL", "price": "101", "size": "2"}
        ]}),
    ))
    .await;
    conn.send_json(book_frame(
        2,
        "d",
        json!({
            "inserts": [{"side": "BUY", "price": "99", "size": "5"}],
            "updates": [{"side": "BUY", "price": "100", "size": "0"}]
        }),
    ))
    .await;

    let first = harness.next_snapshot().await;
    assert_eq!(first.seq, 1);
    assert_eq!(first.bids[0].price, Decimal::from(100));

    let second = harness.next_snapshot().await;
    assert_eq!(second.seq, 2);
    assert_eq!(second.symbol, SYMBOL);
    assert_eq!(second.depth, 1);
    assert_eq!(second.bids.len(), 1);
    assert_eq!(second.bids[0].price, Decimal::from(99));
    assert_eq!(second.bids[0].amount, Decimal::from(5));
    assert_eq!(second.asks[0].price, Decimal::from(101));
    assert_eq!(second.timestamp, 1765418142002000);

    assert_eq!(harness.receiver.stats().snapshots_emitted, 2);
    harness.shutdown().await;
}

#[tokio::test]
async fn test_server_ping_answered_with_same_id() {
    let mut exchange = MockExchange::start().await;
    let mut harness = Harness::start(book_config(&exchange.url));

    let mut conn = exchange.next_connection().await;
    conn.confirm_subscription().await;
    harness.wait_for_state(ConnectionState::Subscribed).await;

    conn.send_json(json!({"jsonrpc": "2.0", "method": "ping", "id": 42}))
        .await;
    let pong = conn.expect_method("pong").await;
    assert_eq!(pong["id"], 42);
    assert_eq!(pong["jsonrpc"], "2.0");

    harness.shutdown().await;
}

#[tokio::test]
async fn test_sequence_gap_resubscribes_and_suppresses_output() {
    let mut exchange = MockExchange::start().await;
    let mut harness = Harness::start(book_config(&exchange.url));

    let mut conn = exchange.next_connection().await;
    conn.confirm_subscription().await;
    harness.wait_for_state(ConnectionState::Subscribed).await;

    conn.send_json(book_frame(
        10,
        "s",
        json!({"inserts": [{"side": "BUY", "price": "100", "size": "1"}]}),
    ))
    .await;
    assert_eq!(harness.next_snapshot().await.seq, 10);

    conn.send_json(book_frame(
        12,
        "d",
        json!({"inserts": [{"side": "BUY", "price": "98", "size": "1"}]}),
    ))
    .await;

    let unsubscribe = conn.expect_method("unsubscribe").await;
    assert_eq!(unsubscribe["params"]["channel"], BOOK_CHANNEL);
    let resubscribe = conn.expect_method("subscribe").await;
    assert_eq!(resubscribe["params"]["channel"], BOOK_CHANNEL);
    assert!(resubscribe["id"].as_u64().unwrap() > unsubscribe["id"].as_u64().unwrap());
    assert!(harness.snapshots.try_recv().is_err());

    conn.send_json(book_frame(
        13,
        "s",
        json!({"inserts": [{"side": "BUY", "price": "97", "size": "3"}]}),
    ))
    .await;
    let restored = harness.next_snapshot().await;
    assert_eq!(restored.seq, 13);
    assert_eq!(restored.bids[0].price, Decimal::from(97));
    assert_eq!(harness.receiver.stats().sequence_gaps, 1);

    harness.shutdown().await;
}

#[tokio::test]
async fn test_silence_triggers_exactly_one_reconnect() {
    let mut exchange = MockExchange::start().await;
    let mut config = book_config(&exchange.url);
    config.connection.heartbeat.heartbeat_timeout = Duration::from_millis(300);
    config.connection.reconnect.interval = Duration::from_millis(600);
    let mut harness = Harness::start(config);

    // Held open but silent after confirming.
    let mut silent = exchange.next_connection().await;
    silent.confirm_subscription().await;
    harness.wait_for_state(ConnectionState::Subscribed).await;

    harness.wait_for_state(ConnectionState::Reconnecting).await;
    tokio::time::sleep(Duration::from_millis(300)).await;

    let mut reconnecting = 0;
    while let Ok((_, state)) = harness.states.try_recv() {
        if state == ConnectionState::Reconnecting {
            reconnecting += 1;
        }
    }
    assert_eq!(reconnecting, 0, "stale session reconnected more than once");

    let stats = harness.receiver.stats();
    assert_eq!(stats.heartbeat_timeouts, 1);
    assert_eq!(stats.reconnects, 1);

    let mut fresh = exchange.next_connection().await;
    fresh.confirm_subscription().await;
    harness.wait_for_state(ConnectionState::Subscribed).await;

    drop(silent);
    harness.shutdown().await;
}

#[tokio::test]
async fn test_reconnect_resets_books() {
    let mut exchange = MockExchange::start().await;
    let mut harness = Harness::start(book_config(&exchange.url));

    let mut conn = exchange.next_connection().await;
    conn.confirm_subscription().await;
    conn.send_json(book_frame(
        1,
        "s",
        json!({"inserts": [{"side": "SELL", "price": "101", "size": "2"}]}),
    ))
    .await;
    assert_eq!(harness.next_snapshot().await.seq, 1);
    conn.close().await;

    let mut conn = exchange.next_connection().await;
    conn.confirm_subscription().await;
    harness.wait_for_state(ConnectionState::Subscribed).await;

    // Contiguous with the old session, but the book was dropped on reconnect.
    conn.send_json(book_frame(2, "d", json!({}))).await;
    conn.send_json(book_frame(
        5,
        "s",
        json!({"inserts": [{"side": "SELL", "price": "102", "size": "1"}]}),
    ))
    .await;

    let snapshot = harness.next_snapshot().await;
    assert_eq!(snapshot.seq, 5);
    assert_eq!(snapshot.asks[0].price, Decimal::from(102));

    harness.shutdown().await;
}

#[tokio::test]
async fn test_unanswered_app_ping_degrades_until_pong() {
    let mut exchange = MockExchange::start().await;
    let mut config = book_config(&exchange.url);
    config.connection.heartbeat.app_ping_interval = Duration::from_millis(100);
    config.connection.heartbeat.ping_timeout = Duration::from_millis(150);
    let mut harness = Harness::start(config);

    let mut conn = exchange.next_connection().await;
    conn.confirm_subscription().await;
    harness.wait_for_state(ConnectionState::Subscribed).await;

    let ping = conn.expect_method("ping").await;
    let first_id = ping["id"].as_u64().unwrap();
    harness.wait_for_state(ConnectionState::Degraded).await;

    let next = conn.expect_method("ping").await;
    assert!(next["id"].as_u64().unwrap() > first_id);

    conn.send_json(json!({"jsonrpc": "2.0", "method": "pong", "id": next["id"]}))
        .await;
    harness.wait_for_state(ConnectionState::Subscribed).await;

    harness.shutdown().await;
}

#[tokio::test]
async fn test_trades_are_normalized() {
    let mut exchange = MockExchange::start().await;
    let mut config = test_config(&exchange.url);
    config.trade_symbols = vec![SYMBOL.to_string()];
    let mut harness = Harness::start(config);

    let mut conn = exchange.next_connection().await;
    assert_eq!(conn.confirm_subscription().await, TRADES_CHANNEL);
    conn.send_json(trade_frame("t-1", "BUY", "0.012", "4241", 1765418142168))
        .await;
    conn.send_json(trade_frame("t-2", "HOLD", "1", "4241", 1765418142169))
        .await;
    conn.send_json(trade_frame("t-3", "sell", "2", "4240.5", 1765418142170))
        .await;

    let buy = within(harness.trades.recv()).await.unwrap();
    assert_eq!(buy.id, "t-1");
    assert_eq!(buy.side, Side::Buy);
    assert_eq!(buy.amount, "0.012".parse::<Decimal>().unwrap());
    assert_eq!(buy.price, Decimal::from(4241));
    assert_eq!(buy.timestamp, 1765418142168000);

    // The malformed trade is dropped without affecting its neighbours.
    let sell = within(harness.trades.recv()).await.unwrap();
    assert_eq!(sell.id, "t-3");
    assert_eq!(sell.side, Side::Sell);
    assert_eq!(harness.receiver.stats().protocol_errors, 1);

    harness.shutdown().await;
}

#[tokio::test]
async fn test_subscribe_timeout_reconnects() {
    let mut exchange = MockExchange::start().await;
    let mut config = book_config(&exchange.url);
    config.connection.subscribe_timeout = Duration::from_millis(200);
    let mut harness = Harness::start(config);

    // Never confirm the first subscription.
    let mut ignored = exchange.next_connection().await;
    ignored.expect_method("subscribe").await;
    harness.wait_for_state(ConnectionState::Reconnecting).await;

    let mut conn = exchange.next_connection().await;
    conn.confirm_subscription().await;
    harness.wait_for_state(ConnectionState::Subscribed).await;

    harness.shutdown().await;
}

#[tokio::test]
async fn test_auth_rejection_is_fatal_after_retries() {
    let mut exchange = MockExchange::start().await;
    let mut config = book_config(&exchange.url);
    config.connection.bearer_token = Some("expired-jwt".to_string());
    config.connection.max_auth_failures = 2;
    let harness = Harness::start(config);

    for _ in 0..2 {
        let mut conn = exchange.next_connection().await;
        let auth = conn.expect_method("auth").await;
        assert_eq!(auth["params"]["bearer"], "expired-jwt");
        assert_eq!(auth["id"], 0);
        conn.send_json(json!({
            "jsonrpc": "2.0",
            "id": 0,
            "error": {"code": 40110, "message": "invalid bearer JWT"}
        }))
        .await;
    }

    let err = within(harness.task).await.unwrap().unwrap_err();
    assert!(err.is_auth_error());
    assert!(matches!(err, FeedError::Auth { code: 40110, .. }));

    let states = harness.receiver.connection_states();
    assert_eq!(*states[&StreamKind::Book].borrow(), ConnectionState::Disconnected);
}

#[tokio::test]
async fn test_transport_failure_does_not_reset_auth_failures() {
    let mut exchange = MockExchange::start().await;
    let mut config = book_config(&exchange.url);
    config.connection.bearer_token = Some("expired-jwt".to_string());
    config.connection.max_auth_failures = 2;
    let harness = Harness::start(config);

    let reject = json!({
        "jsonrpc": "2.0",
        "id": 0,
        "error": {"code": 40110, "message": "invalid bearer JWT"}
    });

    let mut conn = exchange.next_connection().await;
    conn.expect_method("auth").await;
    conn.send_json(reject.clone()).await;

    // Dropped before answering; never reaches Subscribed.
    let mut conn = exchange.next_connection().await;
    conn.expect_method("auth").await;
    conn.close().await;

    let mut conn = exchange.next_connection().await;
    conn.expect_method("auth").await;
    conn.send_json(reject).await;

    let err = within(harness.task).await.unwrap().unwrap_err();
    assert!(matches!(err, FeedError::Auth { code: 40110, .. }));
    assert_eq!(harness.receiver.stats().reconnects, 2);
}

#[tokio::test]
async fn test_stop_closes_connection_and_disconnects() {
    let mut exchange = MockExchange::start().await;
    let mut harness = Harness::start(book_config(&exchange.url));

    let mut conn = exchange.next_connection().await;
    conn.confirm_subscription().await;
    harness.wait_for_state(ConnectionState::Subscribed).await;

    let states = harness.receiver.connection_states();
    harness.stop.cancel();
    let joined = assert_ok!(within(&mut harness.task).await);
    assert_ok!(joined);
    assert_eq!(*states[&StreamKind::Book].borrow(), ConnectionState::Disconnected);
    assert!(harness.snapshots.try_recv().is_err());

    let (_, last) = within(harness.states.recv()).await.unwrap();
    assert_eq!(last, ConnectionState::Disconnected);
    drop(conn);
}

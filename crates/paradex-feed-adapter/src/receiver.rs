/*
[INPUT]:  ReceiverConfig (url, symbols, depth, feed mode, timings) and a FeedSink
[OUTPUT]: Snapshot and trade callbacks; per-stream connection state; counters
[POS]:    Receiver façade - wires subscriptions, streams and frame routing
[UPDATE]: When adding stream kinds or changing how frames reach the sink
*/

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::book::{SequenceError, Sequencer};
use crate::error::{FeedError, Result};
use crate::sink::FeedSink;
use crate::snapshot::SnapshotEmitter;
use crate::stats::{FeedStats, FeedStatsSnapshot};
use crate::trade::TradeNormalizer;
use crate::types::{BookFeed, ConnectionState, StreamKind, Subscription};
use crate::ws::connection::{ConnectionConfig, ConnectionManager, FrameAction, FrameHandler};
use crate::ws::message::{BookMessage, InboundFrame};

pub const DEFAULT_DEPTH: usize = 15;
pub const DEFAULT_CADENCE: &str = "50ms";
pub const DEFAULT_PRICE_BUCKET: &str = "0_01";

#[derive(Debug, Clone)]
pub struct ReceiverConfig {
    pub connection: ConnectionConfig,
    /// Symbols for the order book stream. Empty disables the stream.
    pub book_symbols: Vec<String>,
    /// Symbols for the trade stream. Empty disables the stream.
    pub trade_symbols: Vec<String>,
    pub depth: usize,
    pub cadence: String,
    pub price_bucket: String,
    pub book_feed: BookFeed,
}

impl Default for ReceiverConfig {
    fn default() -> Self {
        Self {
            connection: ConnectionConfig::default(),
            book_symbols: Vec::new(),
            trade_symbols: Vec::new(),
            depth: DEFAULT_DEPTH,
            cadence: DEFAULT_CADENCE.to_string(),
            price_bucket: DEFAULT_PRICE_BUCKET.to_string(),
            book_feed: BookFeed::default(),
        }
    }
}

impl ReceiverConfig {
    pub fn book_subscriptions(&self) -> Vec<Subscription> {
        self.book_symbols
            .iter()
            .map(|symbol| {
                Subscription::book(
                    symbol.as_str(),
                    self.depth,
                    self.cadence.as_str(),
                    self.price_bucket.as_str(),
                    self.book_feed,
                )
            })
            .collect()
    }

    pub fn trade_subscriptions(&self) -> Vec<Subscription> {
        self.trade_symbols
            .iter()
            .map(|symbol| Subscription::trades(symbol.as_str()))
            .collect()
    }

    pub fn validate(&self) -> Result<()> {
        self.connection.validate()?;
        if self.book_symbols.is_empty() && self.trade_symbols.is_empty() {
            return Err(FeedError::Config("no symbols configured".to_string()));
        }
        let symbols = self.book_symbols.iter().chain(&self.trade_symbols);
        if symbols.into_iter().any(|symbol| symbol.trim().is_empty()) {
            return Err(FeedError::Config("symbol must not be empty".to_string()));
        }
        if !self.book_symbols.is_empty() && self.depth == 0 {
            return Err(FeedError::Config("depth must be at least 1".to_string()));
        }
        Ok(())
    }
}

#[derive(Debug, Clone)]
struct BookRoute {
    symbol: String,
    depth: usize,
}

/// Routes one stream's data frames into the sequencer or trade normalizer.
///
/// Owned by that stream's dispatch loop, which makes it the only writer of
/// the stream's books and the only emitter of its records.
pub struct FrameRouter {
    kind: StreamKind,
    routes: HashMap<String, BookRoute>,
    sequencer: Sequencer,
    emitter: SnapshotEmitter,
    normalizer: TradeNormalizer,
    sink: Arc<dyn FeedSink>,
    stats: Arc<FeedStats>,
}

impl FrameRouter {
    pub fn new(
        kind: StreamKind,
        subscriptions: &[Subscription],
        sink: Arc<dyn FeedSink>,
        stats: Arc<FeedStats>,
    ) -> Self {
        let routes = subscriptions
            .iter()
            .filter(|subscription| subscription.kind() == StreamKind::Book)
            .map(|subscription| {
                (
                    subscription.channel(),
                    BookRoute {
                        symbol: subscription.symbol().to_string(),
                        depth: subscription.depth(),
                    },
                )
            })
            .collect();

        Self {
            kind,
            routes,
            sequencer: Sequencer::new(),
            emitter: SnapshotEmitter::new(sink.clone(), stats.clone()),
            normalizer: TradeNormalizer,
            sink,
            stats,
        }
    }

    pub fn sequencer(&self) -> &Sequencer {
        &self.sequencer
    }

    fn route(&self, channel: &str) -> Option<BookRoute> {
        let route = self.routes.get(channel).cloned();
        if route.is_none() {
            debug!(stream = %self.kind, %channel, "book frame on unsubscribed channel skipped");
        }
        route
    }

    fn on_book_snapshot(&mut self, channel: &str, message: BookMessage, local_time_us: i64) {
        let Some(route) = self.route(channel) else {
            return;
        };
        self.sequencer
            .apply_snapshot(&route.symbol, message.seq_no, &message.inserts);
        self.emit(&route, message.seq_no, message.last_updated_at, local_time_us);
    }

    fn on_book_delta(&mut self, channel: String, message: BookMessage, local_time_us: i64) -> FrameAction {
        let Some(route) = self.route(&channel) else {
            return FrameAction::Continue;
        };
        let applied = self.sequencer.apply_delta(
            &route.symbol,
            message.seq_no,
            &message.inserts,
            &message.updates,
            &message.deletes,
        );

        match applied {
            Ok(()) => {
                self.emit(&route, message.seq_no, message.last_updated_at, local_time_us);
                FrameAction::Continue
            }
            Err(SequenceError::NoBaseline { received, .. }) => {
                debug!(symbol = %route.symbol, seq = received, "delta without baseline discarded");
                FrameAction::Continue
            }
            Err(gap @ SequenceError::Gap { .. }) => {
                self.stats.record_sequence_gap();
                let err = FeedError::from(gap);
                warn!(stream = %self.kind, %channel, error = %err, "requesting resync");
                FrameAction::Resync { channel }
            }
        }
    }

    fn emit(&self, route: &BookRoute, seq: u64, server_time_ms: i64, local_time_us: i64) {
        if let Some(top) = self.sequencer.extract_top_n(&route.symbol, route.depth) {
            self.emitter
                .emit(&route.symbol, seq, route.depth, server_time_ms, local_time_us, top);
        }
    }
}

impl FrameHandler for FrameRouter {
    fn on_frame(&mut self, frame: InboundFrame, local_time_us: i64) -> FrameAction {
        match frame {
            InboundFrame::BookSnapshot { channel, message } => {
                self.on_book_snapshot(&channel, message, local_time_us);
                FrameAction::Continue
            }
            InboundFrame::BookDelta { channel, message } => {
                self.on_book_delta(channel, message, local_time_us)
            }
            InboundFrame::Trade { channel, trade } => {
                match self.normalizer.normalize(&trade, local_time_us) {
                    Ok(event) => {
                        self.sink.on_trade(event);
                        self.stats.record_trade();
                    }
                    Err(err) => {
                        self.stats.record_protocol_error();
                        warn!(%channel, error = %err, "trade dropped");
                    }
                }
                FrameAction::Continue
            }
            InboundFrame::Ping { .. }
            | InboundFrame::Pong { .. }
            | InboundFrame::Response { .. }
            | InboundFrame::Error { .. }
            | InboundFrame::Unknown { .. } => FrameAction::Continue,
        }
    }

    fn on_reset(&mut self) {
        self.sequencer.reset_all();
        debug!(stream = %self.kind, "books reset");
    }

    fn on_state_change(&mut self, state: ConnectionState) {
        self.sink.on_state_change(self.kind, state);
    }
}

/// Public entry point: one supervised connection per stream kind.
pub struct FeedReceiver {
    book: Option<ConnectionManager>,
    trades: Option<ConnectionManager>,
    sink: Arc<dyn FeedSink>,
    stats: Arc<FeedStats>,
}

impl FeedReceiver {
    pub fn new(config: ReceiverConfig, sink: Arc<dyn FeedSink>) -> Result<Self> {
        config.validate()?;
        let stats = Arc::new(FeedStats::default());

        let manager = |kind: StreamKind, subscriptions: Vec<Subscription>| {
            (!subscriptions.is_empty()).then(|| {
                ConnectionManager::new(kind, config.connection.clone(), subscriptions, stats.clone())
            })
        };
        let book = manager(StreamKind::Book, config.book_subscriptions());
        let trades = manager(StreamKind::Trades, config.trade_subscriptions());

        Ok(Self {
            book,
            trades,
            sink,
            stats,
        })
    }

    /// State watchers for every enabled stream.
    pub fn connection_states(&self) -> HashMap<StreamKind, watch::Receiver<ConnectionState>> {
        self.managers()
            .map(|manager| (manager.kind(), manager.state()))
            .collect()
    }

    pub fn stats(&self) -> FeedStatsSnapshot {
        self.stats.snapshot()
    }

    fn managers(&self) -> impl Iterator<Item = &ConnectionManager> {
        self.book.iter().chain(self.trades.iter())
    }

    /// Run every enabled stream until `stop` fires.
    ///
    /// A fatal error on one stream stops the other and is returned.
    pub async fn run(&self, stop: CancellationToken) -> Result<()> {
        let streams = stop.child_token();
        info!(
            book_subscriptions = self.book.as_ref().map_or(0, |m| m.subscriptions().len()),
            trade_subscriptions = self.trades.as_ref().map_or(0, |m| m.subscriptions().len()),
            "feed receiver starting"
        );

        let (book, trades) = tokio::join!(
            self.run_stream(self.book.as_ref(), &streams),
            self.run_stream(self.trades.as_ref(), &streams),
        );

        let result = book.and(trades);
        match &result {
            Ok(()) => info!(stats = ?self.stats.snapshot(), "feed receiver stopped"),
            Err(err) => warn!(error = %err, "feed receiver failed"),
        }
        result
    }

    async fn run_stream(&self, manager: Option<&ConnectionManager>, streams: &CancellationToken) -> Result<()> {
        let Some(manager) = manager else {
            return Ok(());
        };
        let mut router = FrameRouter::new(
            manager.kind(),
            manager.subscriptions(),
            self.sink.clone(),
            self.stats.clone(),
        );
        let result = manager.run(&mut router, streams.clone()).await;
        if result.is_err() {
            streams.cancel();
        }
        result
    }
}

impl std::fmt::Debug for FeedReceiver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FeedReceiver")
            .field("book", &self.book)
            .field("trades", &self.trades)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Snapshot, TradeEvent};
    use crate::ws::message::BookEntry;
    use crate::types::Side;
    use rust_decimal::Decimal;
    use std::sync::Mutex;

    const SYMBOL: &str = "BTC-USD-PERP";
    const CHANNEL: &str = "order_book.BTC-USD-PERP.deltas";

    #[derive(Default)]
    struct Recording {
        snapshots: Mutex<Vec<Snapshot>>,
        trades: Mutex<Vec<TradeEvent>>,
        states: Mutex<Vec<(StreamKind, ConnectionState)>>,
    }

    impl FeedSink for Recording {
        fn on_snapshot(&self, snapshot: Snapshot) {
            self.snapshots.lock().unwrap().push(snapshot);
        }

        fn on_trade(&self, trade: TradeEvent) {
            self.trades.lock().unwrap().push(trade);
        }

        fn on_state_change(&self, stream: StreamKind, state: ConnectionState) {
            self.states.lock().unwrap().push((stream, state));
        }
    }

    fn entry(side: Side, price: i64, size: i64) -> BookEntry {
        BookEntry {
            side,
            price: Decimal::from(price),
            size: Decimal::from(size),
        }
    }

    fn book_message(seq: u64, update_type: &str, inserts: Vec<BookEntry>, updates: Vec<BookEntry>) -> BookMessage {
        BookMessage {
            market: SYMBOL.to_string(),
            seq_no: seq,
            last_updated_at: 1765418142000 + seq as i64,
            update_type: Some(update_type.to_string()),
            inserts,
            updates,
            deletes: Vec::new(),
        }
    }

    fn router(sink: Arc<Recording>) -> FrameRouter {
        let subscriptions = vec![Subscription::book(SYMBOL, 1, "50ms", "0_01", BookFeed::Deltas)];
        FrameRouter::new(StreamKind::Book, &subscriptions, sink, Arc::new(FeedStats::default()))
    }

    fn snapshot_frame(message: BookMessage) -> InboundFrame {
        InboundFrame::BookSnapshot {
            channel: CHANNEL.to_string(),
            message,
        }
    }

    fn delta_frame(message: BookMessage) -> InboundFrame {
        InboundFrame::BookDelta {
            channel: CHANNEL.to_string(),
            message,
        }
    }

    #[test]
    fn test_snapshot_then_delta_emits_top_of_book() {
        let sink = Arc::new(Recording::default());
        let mut router = router(sink.clone());

        let snapshot = book_message(
            1,
            "s",
            vec![entry(Side::Buy, 100, 1), entry(Side::Sell, 101, 2)],
            vec![],
        );
        assert_eq!(router.on_frame(snapshot_frame(snapshot), 7), FrameAction::Continue);

        let delta = book_message(2, "d", vec![entry(Side::Buy, 99, 5)], vec![entry(Side::Buy, 100, 0)]);
        assert_eq!(router.on_frame(delta_frame(delta), 8), FrameAction::Continue);

        let snapshots = sink.snapshots.lock().unwrap();
        assert_eq!(snapshots.len(), 2);
        let last = &snapshots[1];
        assert_eq!(last.seq, 2);
        assert_eq!(last.bids.len(), 1);
        assert_eq!(last.bids[0].price, Decimal::from(99));
        assert_eq!(last.bids[0].amount, Decimal::from(5));
        assert_eq!(last.asks[0].price, Decimal::from(101));
        assert_eq!(last.timestamp, 1765418142002000);
        assert_eq!(last.local_timestamp, 8);
    }

    #[test]
    fn test_gap_requests_resync_and_suppresses_emission() {
        let sink = Arc::new(Recording::default());
        let mut router = router(sink.clone());

        router.on_frame(snapshot_frame(book_message(10, "s", vec![entry(Side::Buy, 100, 1)], vec![])), 1);
        let action = router.on_frame(delta_frame(book_message(12, "d", vec![entry(Side::Buy, 98, 1)], vec![])), 2);
        assert_eq!(
            action,
            FrameAction::Resync {
                channel: CHANNEL.to_string()
            }
        );

        // Until a new snapshot arrives, deltas are dropped without another resync.
        let action = router.on_frame(delta_frame(book_message(13, "d", vec![], vec![])), 3);
        assert_eq!(action, FrameAction::Continue);
        assert_eq!(sink.snapshots.lock().unwrap().len(), 1);

        router.on_frame(snapshot_frame(book_message(13, "s", vec![entry(Side::Buy, 97, 3)], vec![])), 4);
        let snapshots = sink.snapshots.lock().unwrap();
        assert_eq!(snapshots.len(), 2);
        assert_eq!(snapshots[1].seq, 13);
    }

    #[test]
    fn test_reset_clears_books() {
        let sink = Arc::new(Recording::default());
        let mut router = router(sink.clone());
        router.on_frame(snapshot_frame(book_message(1, "s", vec![entry(Side::Buy, 100, 1)], vec![])), 1);

        router.on_reset();
        assert!(router.sequencer().extract_top_n(SYMBOL, 5).is_none());

        router.on_frame(delta_frame(book_message(2, "d", vec![], vec![])), 2);
        assert_eq!(sink.snapshots.lock().unwrap().len(), 1);
    }

    #[test]
    fn test_unsubscribed_channel_ignored() {
        let sink = Arc::new(Recording::default());
        let mut router = router(sink.clone());
        let frame = InboundFrame::BookSnapshot {
            channel: "order_book.ETH-USD-PERP.deltas".to_string(),
            message: book_message(1, "s", vec![entry(Side::Buy, 1, 1)], vec![]),
        };
        router.on_frame(frame, 1);
        assert!(sink.snapshots.lock().unwrap().is_empty());
    }

    #[test]
    fn test_state_changes_forwarded_to_sink() {
        let sink = Arc::new(Recording::default());
        let mut router = router(sink.clone());
        router.on_state_change(ConnectionState::Subscribed);
        assert_eq!(
            *sink.states.lock().unwrap(),
            vec![(StreamKind::Book, ConnectionState::Subscribed)]
        );
    }

    #[test]
    fn test_receiver_skips_empty_streams() {
        let config = ReceiverConfig {
            trade_symbols: vec![SYMBOL.to_string()],
            ..ReceiverConfig::default()
        };
        let receiver = FeedReceiver::new(config, Arc::new(Recording::default())).unwrap();
        let states = receiver.connection_states();
        assert_eq!(states.len(), 1);
        assert!(states.contains_key(&StreamKind::Trades));
        assert_eq!(receiver.stats(), FeedStatsSnapshot::default());
    }

    #[test]
    fn test_config_validation() {
        let empty = ReceiverConfig::default();
        assert!(matches!(empty.validate(), Err(FeedError::Config(_))));

        let zero_depth = ReceiverConfig {
            book_symbols: vec![SYMBOL.to_string()],
            depth: 0,
            ..ReceiverConfig::default()
        };
        assert!(matches!(zero_depth.validate(), Err(FeedError::Config(_))));

        let blank = ReceiverConfig {
            trade_symbols: vec!["  ".to_string()],
            ..ReceiverConfig::default()
        };
        assert!(blank.validate().is_err());
    }

    #[test]
    fn test_subscriptions_follow_feed_mode() {
        let config = ReceiverConfig {
            book_symbols: vec![SYMBOL.to_string()],
            book_feed: BookFeed::Snapshot,
            ..ReceiverConfig::default()
        };
        let subscriptions = config.book_subscriptions();
        assert_eq!(
            subscriptions[0].channel(),
            "order_book.BTC-USD-PERP.snapshot@15@50ms@0_01"
        );
    }
}

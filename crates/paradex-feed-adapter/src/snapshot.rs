/*
[INPUT]:  Top-N book projection plus sequence and timing metadata
[OUTPUT]: Immutable Snapshot records delivered to the FeedSink
[POS]:    Snapshot emitter - book state to output record
[UPDATE]: When snapshot record fields or emission side effects change
*/

use std::sync::Arc;

use tracing::warn;

use crate::book::TopOfBook;
use crate::sink::FeedSink;
use crate::stats::FeedStats;
use crate::time::server_micros;
use crate::types::{EXCHANGE, Snapshot};

#[derive(Clone)]
pub struct SnapshotEmitter {
    sink: Arc<dyn FeedSink>,
    stats: Arc<FeedStats>,
}

impl SnapshotEmitter {
    pub fn new(sink: Arc<dyn FeedSink>, stats: Arc<FeedStats>) -> Self {
        Self { sink, stats }
    }

    /// Build the record and hand it to the sink synchronously.
    pub fn emit(
        &self,
        symbol: &str,
        seq: u64,
        depth: usize,
        server_time_ms: i64,
        local_time_us: i64,
        top: TopOfBook,
    ) -> Snapshot {
        let snapshot = build_snapshot(symbol, seq, depth, server_time_ms, local_time_us, top);

        if let (Some(bid), Some(ask)) = (snapshot.best_bid(), snapshot.best_ask()) {
            if bid.price >= ask.price {
                warn!(
                    %symbol,
                    seq,
                    best_bid = %bid.price,
                    best_ask = %ask.price,
                    "crossed book"
                );
            }
        }

        self.sink.on_snapshot(snapshot.clone());
        self.stats.record_snapshot();
        snapshot
    }
}

impl std::fmt::Debug for SnapshotEmitter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SnapshotEmitter").finish_non_exhaustive()
    }
}

pub fn build_snapshot(
    symbol: &str,
    seq: u64,
    depth: usize,
    server_time_ms: i64,
    local_time_us: i64,
    top: TopOfBook,
) -> Snapshot {
    let TopOfBook { mut bids, mut asks } = top;
    bids.truncate(depth);
    asks.truncate(depth);

    Snapshot {
        exchange: EXCHANGE.to_string(),
        symbol: symbol.to_string(),
        timestamp: server_micros(server_time_ms, local_time_us),
        local_timestamp: local_time_us,
        seq,
        depth,
        bids,
        asks,
    }
}

/*
[INPUT]:  Emitted snapshots, trades and connection state changes
[OUTPUT]: Consumer callbacks
[POS]:    Consumer boundary - the only way records leave the adapter
[UPDATE]: When adding new record kinds or consumer notifications
*/

use crate::types::{ConnectionState, Snapshot, StreamKind, TradeEvent};

/// Receives normalized records.
///
/// Callbacks run synchronously on the dispatch task of the stream that produced
/// the record, so a slow implementation delays that stream's frame processing.
/// Hand records off to a channel if persistence can block.
pub trait FeedSink: Send + Sync {
    fn on_snapshot(&self, snapshot: Snapshot);

    fn on_trade(&self, trade: TradeEvent);

    fn on_state_change(&self, _stream: StreamKind, _state: ConnectionState) {}
}

type SnapshotFn = Box<dyn Fn(Snapshot) + Send + Sync>;
type TradeFn = Box<dyn Fn(TradeEvent) + Send + Sync>;

/// Closure-backed [`FeedSink`].
pub struct CallbackSink {
    on_snapshot: SnapshotFn,
    on_trade: TradeFn,
}

impl CallbackSink {
    pub fn new<S, T>(on_snapshot: S, on_trade: T) -> Self
    where
        S: Fn(Snapshot) + Send + Sync + 'static,
        T: Fn(TradeEvent) + Send + Sync + 'static,
    {
        Self {
            on_snapshot: Box::new(on_snapshot),
            on_trade: Box::new(on_trade),
        }
    }
}

impl FeedSink for CallbackSink {
    fn on_snapshot(&self, snapshot: Snapshot) {
        (self.on_snapshot)(snapshot)
    }

    fn on_trade(&self, trade: TradeEvent) {
        (self.on_trade)(trade)
    }
}

impl std::fmt::Debug for CallbackSink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CallbackSink").finish_non_exhaustive()
    }
}

/*
[INPUT]:  Crate modules and public type definitions
[OUTPUT]: Public Paradex feed adapter crate surface
[POS]:    Crate root - module wiring
[UPDATE]: When public modules or exports change
*/

pub mod book;
pub mod error;
pub mod receiver;
pub mod sink;
pub mod snapshot;
pub mod stats;
pub mod time;
pub mod trade;
pub mod types;
pub mod ws;

pub use book::{OrderBook, SequenceError, Sequencer, TopOfBook};
pub use error::{FeedError, Result};
pub use receiver::{FeedReceiver, FrameRouter, ReceiverConfig};
pub use sink::{CallbackSink, FeedSink};
pub use snapshot::SnapshotEmitter;
pub use stats::{FeedStats, FeedStatsSnapshot};
pub use trade::TradeNormalizer;

// Re-export all types
pub use types::*;

// Re-export commonly used types from ws
pub use ws::{
    ConnectionConfig,
    ConnectionManager,
    FrameAction,
    FrameHandler,
    HeartbeatConfig,
    InboundFrame,
    ReconnectConfig,
};

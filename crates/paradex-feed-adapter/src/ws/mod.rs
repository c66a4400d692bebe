/*
[INPUT]:  WebSocket configuration and subscription channels
[OUTPUT]: Supervised sessions delivering parsed frames in arrival order
[POS]:    WebSocket layer - connection, heartbeat and frame codec
[UPDATE]: When adding new frame kinds or changing connection logic
*/

pub mod connection;
pub mod heartbeat;
pub mod message;

pub use connection::{
    ConnectionConfig, ConnectionManager, FrameAction, FrameHandler, FrameSender, ReconnectConfig,
    calculate_backoff,
};
pub use heartbeat::{HeartbeatAction, HeartbeatClock, HeartbeatConfig, HeartbeatMonitor};
pub use message::{BookEntry, BookMessage, InboundFrame, RawTrade, RpcError};

/*
[INPUT]:  Feed schema definitions and serde requirements
[OUTPUT]: Typed Rust enums with serialization support
[POS]:    Data layer - shared enums for wire payloads and output records
[UPDATE]: When the wire schema changes or new kinds are added
*/

use std::fmt;

use serde::{Deserialize, Serialize};

/// Taker side of a trade in output records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Side {
    #[serde(alias = "BUY")]
    Buy,
    #[serde(alias = "SELL")]
    Sell,
}

impl Side {
    /// Parse the exchange's uppercase side tag (`BUY`/`SELL`), case-insensitively.
    pub fn from_wire(raw: &str) -> Option<Self> {
        if raw.eq_ignore_ascii_case("buy") {
            Some(Side::Buy)
        } else if raw.eq_ignore_ascii_case("sell") {
            Some(Side::Sell)
        } else {
            None
        }
    }

    /// Book side a resting order with this side sits on.
    pub fn book_side(self) -> BookSide {
        match self {
            Side::Buy => BookSide::Bid,
            Side::Sell => BookSide::Ask,
        }
    }
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Side::Buy => f.write_str("buy"),
            Side::Sell => f.write_str("sell"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BookSide {
    Bid,
    Ask,
}

/// Logical stream a subscription belongs to. One connection is kept per kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StreamKind {
    Book,
    Trades,
}

impl fmt::Display for StreamKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StreamKind::Book => f.write_str("book"),
            StreamKind::Trades => f.write_str("trades"),
        }
    }
}

/// How the exchange delivers order book data.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BookFeed {
    /// Initial snapshot followed by sequenced deltas.
    #[default]
    Deltas,
    /// Every message is a full throttled snapshot.
    Snapshot,
}

/// Connection supervisor state, published through a `watch` channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Subscribed,
    /// Heartbeat miss; session still up and being watched.
    Degraded,
    Reconnecting,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Subscribed => "subscribed",
            ConnectionState::Degraded => "degraded",
            ConnectionState::Reconnecting => "reconnecting",
        };
        f.write_str(label)
    }
}

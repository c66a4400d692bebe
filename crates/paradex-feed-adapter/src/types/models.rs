/*
[INPUT]:  Subscription parameters and reconstructed book / trade data
[OUTPUT]: Typed subscription descriptors and immutable output records
[POS]:    Data layer - records handed to feed consumers
[UPDATE]: When output record layout or channel naming changes
*/

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use super::enums::{BookFeed, BookSide, Side, StreamKind};

/// Exchange tag stamped on every output record.
pub const EXCHANGE: &str = "paradex";

/// One subscription per (symbol, stream kind). Immutable once built.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Subscription {
    symbol: String,
    kind: StreamKind,
    depth: usize,
    cadence: String,
    price_bucket: String,
    feed: BookFeed,
}

impl Subscription {
    /// Order book subscription.
    ///
    /// `cadence` (e.g. `50ms`) and `price_bucket` (e.g. `0_01`) are only sent on the
    /// wire for [`BookFeed::Snapshot`]; `depth` always bounds emitted snapshots.
    pub fn book(
        symbol: impl Into<String>,
        depth: usize,
        cadence: impl Into<String>,
        price_bucket: impl Into<String>,
        feed: BookFeed,
    ) -> Self {
        Self {
            symbol: symbol.into(),
            kind: StreamKind::Book,
            depth,
            cadence: cadence.into(),
            price_bucket: price_bucket.into(),
            feed,
        }
    }

    /// Public trades subscription.
    pub fn trades(symbol: impl Into<String>) -> Self {
        Self {
            symbol: symbol.into(),
            kind: StreamKind::Trades,
            depth: 0,
            cadence: String::new(),
            price_bucket: String::new(),
            feed: BookFeed::default(),
        }
    }

    pub fn symbol(&self) -> &str {
        &self.symbol
    }

    pub fn kind(&self) -> StreamKind {
        self.kind
    }

    pub fn depth(&self) -> usize {
        self.depth
    }

    pub fn cadence(&self) -> &str {
        &self.cadence
    }

    pub fn price_bucket(&self) -> &str {
        &self.price_bucket
    }

    pub fn feed(&self) -> BookFeed {
        self.feed
    }

    /// Wire channel name used in subscribe/unsubscribe requests.
    pub fn channel(&self) -> String {
        match (self.kind, self.feed) {
            (StreamKind::Trades, _) => format!("trades.{}", self.symbol),
            (StreamKind::Book, BookFeed::Deltas) => format!("order_book.{}.deltas", self.symbol),
            (StreamKind::Book, BookFeed::Snapshot) => format!(
                "order_book.{}.snapshot@{}@{}@{}",
                self.symbol, self.depth, self.cadence, self.price_bucket
            ),
        }
    }
}

/// Single price level in an output snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PriceLevel {
    #[serde(with = "rust_decimal::serde::str")]
    pub price: Decimal,
    #[serde(with = "rust_decimal::serde::str")]
    pub amount: Decimal,
}

impl PriceLevel {
    pub fn new(price: Decimal, amount: Decimal) -> Self {
        Self { price, amount }
    }
}

/// Top-N order book view emitted after every accepted snapshot or delta.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    pub exchange: String,
    pub symbol: String,
    /// Server time, microseconds since epoch.
    pub timestamp: i64,
    /// Local receipt time, microseconds since epoch.
    pub local_timestamp: i64,
    pub seq: u64,
    /// Requested depth N; `bids`/`asks` never exceed it.
    pub depth: usize,
    /// Highest price first.
    pub bids: Vec<PriceLevel>,
    /// Lowest price first.
    pub asks: Vec<PriceLevel>,
}

impl Snapshot {
    pub fn best_bid(&self) -> Option<&PriceLevel> {
        self.bids.first()
    }

    pub fn best_ask(&self) -> Option<&PriceLevel> {
        self.asks.first()
    }

    /// Exactly `depth` bid slots, `None` where the book is thinner than N.
    pub fn padded_bids(&self) -> Vec<Option<&PriceLevel>> {
        pad(&self.bids, self.depth)
    }

    /// Exactly `depth` ask slots, `None` where the book is thinner than N.
    pub fn padded_asks(&self) -> Vec<Option<&PriceLevel>> {
        pad(&self.asks, self.depth)
    }

    /// Expand into per-level rows flagged `is_snapshot`, bids first.
    pub fn to_level_updates(&self) -> Vec<LevelUpdate> {
        let bids = self.bids.iter().map(|level| (BookSide::Bid, level));
        let asks = self.asks.iter().map(|level| (BookSide::Ask, level));
        bids.chain(asks)
            .map(|(side, level)| LevelUpdate {
                exchange: self.exchange.clone(),
                symbol: self.symbol.clone(),
                timestamp: self.timestamp,
                local_timestamp: self.local_timestamp,
                is_snapshot: true,
                side,
                price: level.price,
                amount: level.amount,
            })
            .collect()
    }
}

fn pad(levels: &[PriceLevel], depth: usize) -> Vec<Option<&PriceLevel>> {
    (0..depth).map(|i| levels.get(i)).collect()
}

/// Incremental L2 row (amount zero means the level was removed).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LevelUpdate {
    pub exchange: String,
    pub symbol: String,
    pub timestamp: i64,
    pub local_timestamp: i64,
    pub is_snapshot: bool,
    pub side: BookSide,
    #[serde(with = "rust_decimal::serde::str")]
    pub price: Decimal,
    #[serde(with = "rust_decimal::serde::str")]
    pub amount: Decimal,
}

/// Normalized public trade.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TradeEvent {
    pub exchange: String,
    pub symbol: String,
    /// Server time, microseconds since epoch.
    pub timestamp: i64,
    /// Local receipt time, microseconds since epoch.
    pub local_timestamp: i64,
    pub id: String,
    pub side: Side,
    #[serde(with = "rust_decimal::serde::str")]
    pub price: Decimal,
    #[serde(with = "rust_decimal::serde::str")]
    pub amount: Decimal,
}

pub(crate) mod serde_helpers {
    use rust_decimal::Decimal;
    use serde::{Deserialize, Deserializer};
    use serde_json::Value;
    use std::str::FromStr;

    /// Accept a decimal encoded either as a JSON string or a JSON number.
    pub fn deserialize_decimal_lenient<'de, D>(deserializer: D) -> Result<Decimal, D::Error>
    where
        D: Deserializer<'de>,
    {
        let value = Value::deserialize(deserializer)?;

        if let Some(raw) = value.as_str() {
            return Decimal::from_str(raw.trim()).map_err(serde::de::Error::custom);
        }

        if value.is_number() {
            return Decimal::from_str(&value.to_string()).map_err(serde::de::Error::custom);
        }

        Err(serde::de::Error::custom("invalid decimal value"))
    }
}

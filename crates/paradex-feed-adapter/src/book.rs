/*
[INPUT]:  Book snapshots and sequenced deltas (inserts/updates/deletes) per symbol
[OUTPUT]: Current per-symbol book state and top-N projections; gap detection
[POS]:    Sequencer - single-writer incremental order book reconstruction
[UPDATE]: When delta semantics, sequencing rules, or projection shape change
*/

//! Incremental L2 order book per symbol.
//!
//! Bids are stored with [`Reverse`] keys so iteration over the [`BTreeMap`]
//! yields prices in descending order (highest bid first); asks use natural
//! ordering. A book only accepts deltas after a baseline snapshot, and only
//! when each delta's sequence number is exactly one above the last accepted.

use std::cmp::Reverse;
use std::collections::{BTreeMap, HashMap};

use rust_decimal::Decimal;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::types::{BookSide, PriceLevel};
use crate::ws::message::BookEntry;

/// Reasons a delta was not applied.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SequenceError {
    /// No snapshot has been accepted since subscribe, reconnect or the last gap.
    #[error("no baseline snapshot for {symbol}; delta {received} discarded")]
    NoBaseline { symbol: String, received: u64 },
    /// Delta sequence number not contiguous; the book has been discarded.
    #[error("sequence gap on {symbol}: expected {expected}, received {received}")]
    Gap {
        symbol: String,
        expected: u64,
        received: u64,
    },
}

/// Bids (descending) and asks (ascending), each truncated to the requested depth.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TopOfBook {
    pub bids: Vec<PriceLevel>,
    pub asks: Vec<PriceLevel>,
}

#[derive(Debug)]
pub struct OrderBook {
    symbol: String,
    bids: BTreeMap<Reverse<Decimal>, Decimal>,
    asks: BTreeMap<Decimal, Decimal>,
    /// `Some` only while the book holds a usable baseline.
    last_seq: Option<u64>,
    last_update: Option<Instant>,
}

impl OrderBook {
    pub fn new(symbol: impl Into<String>) -> Self {
        Self {
            symbol: symbol.into(),
            bids: BTreeMap::new(),
            asks: BTreeMap::new(),
            last_seq: None,
            last_update: None,
        }
    }

    pub fn symbol(&self) -> &str {
        &self.symbol
    }

    /// Returns `true` if a baseline snapshot is in place.
    pub fn is_initialized(&self) -> bool {
        self.last_seq.is_some()
    }

    pub fn last_seq(&self) -> Option<u64> {
        self.last_seq
    }

    pub fn last_update(&self) -> Option<Instant> {
        self.last_update
    }

    /// Replace the book with the given levels. Never gap-checked.
    pub fn apply_snapshot(&mut self, seq: u64, entries: &[BookEntry]) {
        self.bids.clear();
        self.asks.clear();
        for entry in entries {
            self.upsert(entry);
        }
        self.last_seq = Some(seq);
        self.last_update = Some(Instant::now());
    }

    /// Apply inserts, then updates, then deletes.
    ///
    /// On a sequence gap the book is cleared and left uninitialized until the
    /// next snapshot.
    pub fn apply_delta(
        &mut self,
        seq: u64,
        inserts: &[BookEntry],
        updates: &[BookEntry],
        deletes: &[BookEntry],
    ) -> Result<(), SequenceError> {
        let Some(last) = self.last_seq else {
            return Err(SequenceError::NoBaseline {
                symbol: self.symbol.clone(),
                received: seq,
            });
        };

        let expected = last.wrapping_add(1);
        if seq != expected {
            self.clear();
            return Err(SequenceError::Gap {
                symbol: self.symbol.clone(),
                expected,
                received: seq,
            });
        }

        for entry in inserts.iter().chain(updates) {
            self.upsert(entry);
        }
        for entry in deletes {
            self.remove(entry.side.book_side(), entry.price);
        }

        self.last_seq = Some(seq);
        self.last_update = Some(Instant::now());
        Ok(())
    }

    /// Drop all levels and the baseline.
    pub fn clear(&mut self) {
        self.bids.clear();
        self.asks.clear();
        self.last_seq = None;
    }

    /// Size <= 0 means the level is gone.
    fn upsert(&mut self, entry: &BookEntry) {
        let side = entry.side.book_side();
        if entry.size <= Decimal::ZERO {
            self.remove(side, entry.price);
            return;
        }
        match side {
            BookSide::Bid => {
                self.bids.insert(Reverse(entry.price), entry.size);
            }
            BookSide::Ask => {
                self.asks.insert(entry.price, entry.size);
            }
        }
    }

    fn remove(&mut self, side: BookSide, price: Decimal) {
        match side {
            BookSide::Bid => {
                self.bids.remove(&Reverse(price));
            }
            BookSide::Ask => {
                self.asks.remove(&price);
            }
        }
    }

    /// Top `n` bid levels, highest first.
    pub fn bid_depth(&self, n: usize) -> Vec<PriceLevel> {
        self.bids
            .iter()
            .take(n)
            .map(|(Reverse(price), size)| PriceLevel::new(*price, *size))
            .collect()
    }

    /// Top `n` ask levels, lowest first.
    pub fn ask_depth(&self, n: usize) -> Vec<PriceLevel> {
        self.asks
            .iter()
            .take(n)
            .map(|(price, size)| PriceLevel::new(*price, *size))
            .collect()
    }

    pub fn top_n(&self, n: usize) -> TopOfBook {
        TopOfBook {
            bids: self.bid_depth(n),
            asks: self.ask_depth(n),
        }
    }

    pub fn best_bid(&self) -> Option<PriceLevel> {
        self.bid_depth(1).into_iter().next()
    }

    pub fn best_ask(&self) -> Option<PriceLevel> {
        self.ask_depth(1).into_iter().next()
    }

    /// Returns `true` if best bid >= best ask.
    pub fn is_crossed(&self) -> bool {
        match (self.best_bid(), self.best_ask()) {
            (Some(bid), Some(ask)) => bid.price >= ask.price,
            _ => false,
        }
    }

    /// Returns `(bid_level_count, ask_level_count)`.
    pub fn level_count(&self) -> (usize, usize) {
        (self.bids.len(), self.asks.len())
    }
}

/// Per-symbol books for one connection. Owned by the dispatch path.
#[derive(Debug, Default)]
pub struct Sequencer {
    books: HashMap<String, OrderBook>,
}

impl Sequencer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Clear `symbol`'s book and rebuild it from `entries`.
    pub fn apply_snapshot(&mut self, symbol: &str, seq: u64, entries: &[BookEntry]) {
        let book = self
            .books
            .entry(symbol.to_string())
            .or_insert_with(|| OrderBook::new(symbol));
        book.apply_snapshot(seq, entries);
        debug!(%symbol, seq, levels = entries.len(), "book snapshot applied");
    }

    /// Apply a sequenced delta. On a gap the symbol's book is discarded.
    pub fn apply_delta(
        &mut self,
        symbol: &str,
        seq: u64,
        inserts: &[BookEntry],
        updates: &[BookEntry],
        deletes: &[BookEntry],
    ) -> Result<(), SequenceError> {
        let Some(book) = self.books.get_mut(symbol) else {
            return Err(SequenceError::NoBaseline {
                symbol: symbol.to_string(),
                received: seq,
            });
        };

        let result = book.apply_delta(seq, inserts, updates, deletes);
        if let Err(SequenceError::Gap { expected, received, .. }) = &result {
            warn!(%symbol, expected, received, "sequence gap; book discarded until next snapshot");
        }
        result
    }

    /// Top-N view, or `None` while the symbol has no usable baseline.
    pub fn extract_top_n(&self, symbol: &str, n: usize) -> Option<TopOfBook> {
        self.books
            .get(symbol)
            .filter(|book| book.is_initialized())
            .map(|book| book.top_n(n))
    }

    pub fn book(&self, symbol: &str) -> Option<&OrderBook> {
        self.books.get(symbol)
    }

    pub fn reset(&mut self, symbol: &str) {
        if let Some(book) = self.books.get_mut(symbol) {
            book.clear();
        }
    }

    pub fn reset_all(&mut self) {
        for book in self.books.values_mut() {
            book.clear();
        }
    }
}

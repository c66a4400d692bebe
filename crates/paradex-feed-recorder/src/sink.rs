/*
[INPUT]:  Snapshots, trades and state changes from the feed receiver
[OUTPUT]: JSON lines on an async writer (stdout in the binary)
[POS]:    Output layer - hands records from dispatch tasks to a single writer task
[UPDATE]: When record layout or output formats change
*/

use paradex_feed_adapter::{
    ConnectionState, FeedSink, LevelUpdate, Snapshot, StreamKind, TradeEvent,
};
use serde::Serialize;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::config::BookOutput;

/// One output line.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Record {
    Snapshot(Snapshot),
    Level(LevelUpdate),
    Trade(TradeEvent),
    State {
        stream: StreamKind,
        state: ConnectionState,
    },
}

/// Forwards records to the writer task without blocking the dispatch loop.
#[derive(Debug)]
pub struct JsonLinesSink {
    tx: mpsc::UnboundedSender<Record>,
    book_output: BookOutput,
}

impl JsonLinesSink {
    pub fn new(tx: mpsc::UnboundedSender<Record>, book_output: BookOutput) -> Self {
        Self { tx, book_output }
    }

    fn forward(&self, record: Record) {
        if self.tx.send(record).is_err() {
            debug!("record writer closed; record dropped");
        }
    }
}

impl FeedSink for JsonLinesSink {
    fn on_snapshot(&self, snapshot: Snapshot) {
        match self.book_output {
            BookOutput::Snapshot => self.forward(Record::Snapshot(snapshot)),
            BookOutput::Levels => {
                for level in snapshot.to_level_updates() {
                    self.forward(Record::Level(level));
                }
            }
        }
    }

    fn on_trade(&self, trade: TradeEvent) {
        self.forward(Record::Trade(trade));
    }

    fn on_state_change(&self, stream: StreamKind, state: ConnectionState) {
        self.forward(Record::State { stream, state });
    }
}

/// Drain `rx` into `writer`, one JSON object per line, until every sender is gone.
///
/// Flushes whenever the queue runs empty. Returns the number of lines written.
pub async fn write_records<W>(mut rx: mpsc::UnboundedReceiver<Record>, writer: &mut W) -> std::io::Result<u64>
where
    W: AsyncWrite + Unpin,
{
    let mut written = 0u64;
    while let Some(record) = rx.recv().await {
        let mut line = match serde_json::to_vec(&record) {
            Ok(line) => line,
            Err(err) => {
                warn!(error = %err, "record serialization failed");
                continue;
            }
        };
        line.push(b'\n');
        writer.write_all(&line).await?;
        written += 1;

        if rx.is_empty() {
            writer.flush().await?;
        }
    }
    writer.flush().await?;
    Ok(written)
}

/*
[INPUT]:  Dispatch loop and connection supervisor events
[OUTPUT]: Snapshot-friendly feed counters
[POS]:    Shared runtime counters between connection tasks and consumers
[UPDATE]: When adding/removing feed-level runtime signals
*/

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct FeedStatsSnapshot {
    pub frames_received: u64,
    pub protocol_errors: u64,
    pub snapshots_emitted: u64,
    pub trades_emitted: u64,
    pub sequence_gaps: u64,
    pub reconnects: u64,
    pub heartbeat_timeouts: u64,
}

/// Lock-free counters, shared as `Arc<FeedStats>` by every stream of a receiver.
#[derive(Debug, Default)]
pub struct FeedStats {
    frames_received: AtomicU64,
    protocol_errors: AtomicU64,
    snapshots_emitted: AtomicU64,
    trades_emitted: AtomicU64,
    sequence_gaps: AtomicU64,
    reconnects: AtomicU64,
    heartbeat_timeouts: AtomicU64,
}

impl FeedStats {
    pub fn snapshot(&self) -> FeedStatsSnapshot {
        FeedStatsSnapshot {
            frames_received: self.frames_received.load(Ordering::Relaxed),
            protocol_errors: self.protocol_errors.load(Ordering::Relaxed),
            snapshots_emitted: self.snapshots_emitted.load(Ordering::Relaxed),
            trades_emitted: self.trades_emitted.load(Ordering::Relaxed),
            sequence_gaps: self.sequence_gaps.load(Ordering::Relaxed),
            reconnects: self.reconnects.load(Ordering::Relaxed),
            heartbeat_timeouts: self.heartbeat_timeouts.load(Ordering::Relaxed),
        }
    }

    pub fn record_frame(&self) {
        self.frames_received.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_protocol_error(&self) {
        self.protocol_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_snapshot(&self) {
        self.snapshots_emitted.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_trade(&self) {
        self.trades_emitted.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_sequence_gap(&self) {
        self.sequence_gaps.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_reconnect(&self) {
        self.reconnects.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_heartbeat_timeout(&self) {
        self.heartbeat_timeouts.fetch_add(1, Ordering::Relaxed);
    }
}

/*
[INPUT]:  Raw exchange trade payloads
[OUTPUT]: Canonical TradeEvent records
[POS]:    Trade normalizer - stateless wire-to-record mapping
[UPDATE]: When trade wire fields or record layout change
*/

use crate::error::{FeedError, Result};
use crate::time::server_micros;
use crate::types::{EXCHANGE, Side, TradeEvent};
use crate::ws::message::RawTrade;

#[derive(Debug, Clone, Copy, Default)]
pub struct TradeNormalizer;

impl TradeNormalizer {
    /// Map one raw trade. Unknown side tags are rejected for this frame only.
    pub fn normalize(&self, raw: &RawTrade, local_time_us: i64) -> Result<TradeEvent> {
        let side = Side::from_wire(&raw.side).ok_or_else(|| {
            FeedError::Protocol(format!(
                "unrecognized trade side {:?} on {}",
                raw.side, raw.market
            ))
        })?;

        Ok(TradeEvent {
            exchange: EXCHANGE.to_string(),
            symbol: raw.market.clone(),
            timestamp: server_micros(raw.created_at, local_time_us),
            local_timestamp: local_time_us,
            id: raw.id.clone(),
            side,
            price: raw.price,
            amount: raw.size,
        })
    }
}

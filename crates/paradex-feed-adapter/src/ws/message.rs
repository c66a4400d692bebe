/*
[INPUT]:  Raw WebSocket text frames (JSON-RPC 2.0)
[OUTPUT]: Parsed InboundFrame variants and outbound request payloads
[POS]:    WebSocket layer - message parsing and request building
[UPDATE]: When adding new message types or changing format
*/

use std::sync::atomic::{AtomicUsize, Ordering};

use rust_decimal::Decimal;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use tracing::{debug, info};

use crate::error::{FeedError, Result};
use crate::types::Side;
use crate::types::models::serde_helpers::deserialize_decimal_lenient;

const BOOK_CHANNEL_PREFIX: &str = "order_book.";
const TRADES_CHANNEL_PREFIX: &str = "trades.";

const UNRECOGNIZED_LOG_LIMIT: usize = 3;
const PARSE_FAIL_LOG_LIMIT: usize = 3;
const RAW_LOG_MAX_BYTES: usize = 1024;

static UNRECOGNIZED_LOG_COUNT: AtomicUsize = AtomicUsize::new(0);
static PARSE_FAIL_LOG_COUNT: AtomicUsize = AtomicUsize::new(0);

/// One (side, price, size) item of a book message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
pub struct BookEntry {
    pub side: Side,
    #[serde(deserialize_with = "deserialize_decimal_lenient")]
    pub price: Decimal,
    #[serde(deserialize_with = "deserialize_decimal_lenient")]
    pub size: Decimal,
}

/// Order book payload of a `subscription` frame.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct BookMessage {
    pub market: String,
    #[serde(default)]
    pub seq_no: u64,
    /// Server time in milliseconds.
    #[serde(default)]
    pub last_updated_at: i64,
    /// `s` for a full snapshot, `d` for a delta. Absent means snapshot.
    #[serde(default)]
    pub update_type: Option<String>,
    #[serde(default)]
    pub inserts: Vec<BookEntry>,
    #[serde(default)]
    pub updates: Vec<BookEntry>,
    #[serde(default)]
    pub deletes: Vec<BookEntry>,
}

impl BookMessage {
    pub fn is_snapshot(&self) -> bool {
        !matches!(self.update_type.as_deref(), Some("d"))
    }
}

/// Trade payload of a `subscription` frame, as sent by the exchange.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct RawTrade {
    #[serde(default, deserialize_with = "deserialize_id")]
    pub id: String,
    pub market: String,
    /// Uppercase on the wire (`BUY`/`SELL`).
    pub side: String,
    #[serde(deserialize_with = "deserialize_decimal_lenient")]
    pub size: Decimal,
    #[serde(deserialize_with = "deserialize_decimal_lenient")]
    pub price: Decimal,
    /// Milliseconds since epoch.
    pub created_at: i64,
    #[serde(default)]
    pub trade_type: String,
}

/// JSON-RPC error body.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct RpcError {
    #[serde(default)]
    pub code: i64,
    #[serde(default)]
    pub message: String,
}

/// Every inbound frame, classified once at parse time.
#[derive(Debug, Clone, PartialEq)]
pub enum InboundFrame {
    BookSnapshot { channel: String, message: BookMessage },
    BookDelta { channel: String, message: BookMessage },
    Trade { channel: String, trade: RawTrade },
    /// Server liveness probe; must be answered with a pong carrying the same id.
    Ping { id: Value },
    /// Reply to one of our application pings.
    Pong { id: Value },
    Response { id: Option<u64>, result: Value },
    Error { id: Option<u64>, error: RpcError },
    Unknown { method: Option<String>, channel: Option<String> },
}

#[derive(Debug, Deserialize)]
struct RawFrame {
    #[serde(default)]
    method: Option<String>,
    #[serde(default)]
    id: Option<Value>,
    #[serde(default)]
    params: Option<RawParams>,
    #[serde(default, deserialize_with = "deserialize_present")]
    result: Option<Value>,
    #[serde(default)]
    error: Option<RpcError>,
}

#[derive(Debug, Deserialize)]
struct RawParams {
    #[serde(default)]
    channel: String,
    #[serde(default)]
    data: Value,
}

impl InboundFrame {
    /// Parse a text frame. Malformed JSON or payloads yield [`FeedError::Protocol`].
    pub fn parse(text: &str) -> Result<Self> {
        let raw: RawFrame = serde_json::from_str(text)
            .map_err(|err| FeedError::Protocol(format!("malformed frame: {err}")))?;

        match raw.method.as_deref() {
            Some("subscription") => {
                let params = raw.params.ok_or_else(|| {
                    FeedError::Protocol("subscription frame without params".to_string())
                })?;
                Self::classify_subscription(params)
            }
            Some("ping") => Ok(InboundFrame::Ping {
                id: raw.id.unwrap_or(Value::Null),
            }),
            Some("pong") => Ok(InboundFrame::Pong {
                id: raw.id.unwrap_or(Value::Null),
            }),
            Some(other) => Ok(InboundFrame::Unknown {
                method: Some(other.to_string()),
                channel: None,
            }),
            None => {
                let id = raw.id.as_ref().and_then(Value::as_u64);
                if let Some(error) = raw.error {
                    Ok(InboundFrame::Error { id, error })
                } else if let Some(result) = raw.result {
                    Ok(InboundFrame::Response { id, result })
                } else {
                    Ok(InboundFrame::Unknown {
                        method: None,
                        channel: None,
                    })
                }
            }
        }
    }

    fn classify_subscription(params: RawParams) -> Result<Self> {
        let RawParams { channel, data } = params;

        if channel.starts_with(BOOK_CHANNEL_PREFIX) {
            let message: BookMessage = serde_json::from_value(data).map_err(|err| {
                FeedError::Protocol(format!("invalid order book payload on {channel}: {err}"))
            })?;
            if message.is_snapshot() {
                Ok(InboundFrame::BookSnapshot { channel, message })
            } else {
                Ok(InboundFrame::BookDelta { channel, message })
            }
        } else if channel.starts_with(TRADES_CHANNEL_PREFIX) {
            let trade: RawTrade = serde_json::from_value(data).map_err(|err| {
                FeedError::Protocol(format!("invalid trade payload on {channel}: {err}"))
            })?;
            Ok(InboundFrame::Trade { channel, trade })
        } else {
            Ok(InboundFrame::Unknown {
                method: Some("subscription".to_string()),
                channel: Some(channel),
            })
        }
    }

    /// Short label for logs.
    pub fn kind(&self) -> &'static str {
        match self {
            InboundFrame::BookSnapshot { .. } => "book_snapshot",
            InboundFrame::BookDelta { .. } => "book_delta",
            InboundFrame::Trade { .. } => "trade",
            InboundFrame::Ping { .. } => "ping",
            InboundFrame::Pong { .. } => "pong",
            InboundFrame::Response { .. } => "response",
            InboundFrame::Error { .. } => "error",
            InboundFrame::Unknown { .. } => "unknown",
        }
    }
}

/// Outbound JSON-RPC requests.
pub mod request {
    use serde_json::{Value, json};

    pub fn auth(bearer: &str, id: u64) -> Value {
        json!({
            "jsonrpc": "2.0",
            "method": "auth",
            "params": { "bearer": bearer },
            "id": id
        })
    }

    pub fn subscribe(channel: &str, id: u64) -> Value {
        json!({
            "jsonrpc": "2.0",
            "method": "subscribe",
            "params": { "channel": channel },
            "id": id
        })
    }

    pub fn unsubscribe(channel: &str, id: u64) -> Value {
        json!({
            "jsonrpc": "2.0",
            "method": "unsubscribe",
            "params": { "channel": channel },
            "id": id
        })
    }

    pub fn ping(id: u64) -> Value {
        json!({
            "jsonrpc": "2.0",
            "method": "ping",
            "id": id
        })
    }

    /// Reply to a server ping, echoing its id verbatim.
    pub fn pong(id: &Value) -> Value {
        json!({
            "jsonrpc": "2.0",
            "method": "pong",
            "id": id
        })
    }
}

fn deserialize_present<'de, D>(deserializer: D) -> std::result::Result<Option<Value>, D::Error>
where
    D: Deserializer<'de>,
{
    Value::deserialize(deserializer).map(Some)
}

fn deserialize_id<'de, D>(deserializer: D) -> std::result::Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    match Value::deserialize(deserializer)? {
        Value::String(id) => Ok(id),
        Value::Null => Ok(String::new()),
        other => Ok(other.to_string()),
    }
}

pub(crate) fn log_unrecognized_once(frame: &InboundFrame, raw: &str) {
    let count = UNRECOGNIZED_LOG_COUNT.fetch_add(1, Ordering::Relaxed);
    if count < UNRECOGNIZED_LOG_LIMIT {
        if let InboundFrame::Unknown { method, channel } = frame {
            info!(
                sample_index = count + 1,
                sample_limit = UNRECOGNIZED_LOG_LIMIT,
                method = method.as_deref().unwrap_or("-"),
                channel = channel.as_deref().unwrap_or("-"),
                bytes = raw.len(),
                "ws frame unrecognized"
            );
        }
        let preview = truncate_for_log(raw, RAW_LOG_MAX_BYTES);
        debug!(
            sample_index = count + 1,
            sample_limit = UNRECOGNIZED_LOG_LIMIT,
            message = %preview,
            "ws frame unrecognized"
        );
    }
}

pub(crate) fn log_parse_fail_once(err: &FeedError, raw: &str) {
    let count = PARSE_FAIL_LOG_COUNT.fetch_add(1, Ordering::Relaxed);
    if count < PARSE_FAIL_LOG_LIMIT {
        info!(
            sample_index = count + 1,
            sample_limit = PARSE_FAIL_LOG_LIMIT,
            error = %err,
            bytes = raw.len(),
            "ws frame parse failed"
        );
        let preview = truncate_for_log(raw, RAW_LOG_MAX_BYTES);
        debug!(
            sample_index = count + 1,
            sample_limit = PARSE_FAIL_LOG_LIMIT,
            error = %err,
            message = %preview,
            "ws frame parse failed"
        );
    } else {
        debug!(error = %err, bytes = raw.len(), "ws frame parse failed");
    }
}

fn truncate_for_log(value: &str, max_len: usize) -> String {
    if value.len() <= max_len {
        return value.to_string();
    }
    let mut end = max_len;
    while !value.is_char_boundary(end) {
        end -= 1;
    }
    let mut out = String::with_capacity(end + 3);
    out.push_str(&value[..end]);
    out.push_str("...");
    out
}

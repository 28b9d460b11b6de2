//! Wire protocol spoken with the cmdbridge helper over its stdio.
//!
//! ## Wire format
//!
//! All messages are length-prefixed:
//!
//! ```text
//! ┌──────────────────┬──────────────────────────┐
//! │ 4 bytes BE u32   │  MessagePack payload      │
//! │ (payload length) │  (Request | Reply | …)    │
//! └──────────────────┴──────────────────────────┘
//! ```
//!
//! ## Message types
//!
//! - **Request** (client → helper): `{ version: "2.0", id: N, method: "...", params: {...} }`
//! - **Reply** (helper → client): `{ version: "2.0", id: N, status: "...", result: ..., error: {...} }`
//! - **Notification** (helper → client): `{ version: "2.0", method: "...", params: {...} }` (no `id`)
//!
//! A reply's `status` is one of `chunk` (one part of a streamed result),
//! `ok`, `error` or `cancelled`.  The last three are terminal: exactly one
//! of them ends every request.  Cancellation is itself a request (`cancel`
//! with `{ target: N }`) that never gets a reply of its own.

use rmpv::Value;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::errors::{BridgeError, BridgeResult};

pub const PROTOCOL_VERSION: &str = "2.0";

// ---------------------------------------------------------------------------
// Wire types
// ---------------------------------------------------------------------------

/// A request message sent from client to helper.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Request {
    pub version: String,
    pub id: u64,
    pub method: String,
    pub params: Value,
}

/// Where in its lifetime a request is, as reported by one reply frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReplyStatus {
    Chunk,
    Ok,
    Error,
    Cancelled,
}

impl ReplyStatus {
    pub fn is_terminal(self) -> bool {
        !matches!(self, ReplyStatus::Chunk)
    }
}

/// A reply frame from helper to client.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Reply {
    pub version: String,
    pub id: u64,
    pub status: ReplyStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<RpcErrorData>,
}

/// Error payload inside a [`Reply`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcErrorData {
    pub code: i32,
    pub message: String,
    /// OS error number on the helper's host, when the failure came from a
    /// system call.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub errno: Option<i32>,
}

/// An unsolicited notification from helper to client (no `id`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Notification {
    pub version: String,
    pub method: String,
    pub params: Value,
}

/// Well-known error codes.
pub mod error_code {
    pub const METHOD_NOT_FOUND: i32 = -32601;
    pub const INVALID_PARAMS: i32 = -32602;
    pub const NOT_FOUND: i32 = -32000;
    pub const PERMISSION_DENIED: i32 = -32001;
    pub const IO_ERROR: i32 = -32002;
}

impl Request {
    pub fn new(id: u64, method: impl Into<String>, params: Value) -> Self {
        Self {
            version: PROTOCOL_VERSION.into(),
            id,
            method: method.into(),
            params,
        }
    }
}

impl Reply {
    pub fn chunk(id: u64, result: Value) -> Self {
        Self::with_status(id, ReplyStatus::Chunk, Some(result), None)
    }

    pub fn ok(id: u64, result: Value) -> Self {
        Self::with_status(id, ReplyStatus::Ok, Some(result), None)
    }

    pub fn done(id: u64) -> Self {
        Self::with_status(id, ReplyStatus::Ok, None, None)
    }

    pub fn cancelled(id: u64) -> Self {
        Self::with_status(id, ReplyStatus::Cancelled, None, None)
    }

    pub fn err(id: u64, code: i32, message: impl Into<String>, errno: Option<i32>) -> Self {
        Self::with_status(
            id,
            ReplyStatus::Error,
            None,
            Some(RpcErrorData {
                code,
                message: message.into(),
                errno,
            }),
        )
    }

    fn with_status(
        id: u64,
        status: ReplyStatus,
        result: Option<Value>,
        error: Option<RpcErrorData>,
    ) -> Self {
        Self {
            version: PROTOCOL_VERSION.into(),
            id,
            status,
            result,
            error,
        }
    }
}

impl Notification {
    pub fn new(method: impl Into<String>, params: Value) -> Self {
        Self {
            version: PROTOCOL_VERSION.into(),
            method: method.into(),
            params,
        }
    }
}

// ---------------------------------------------------------------------------
// Incoming message (tagged union for the reader)
// ---------------------------------------------------------------------------

/// A message received from the helper.
#[derive(Debug, Clone)]
pub enum Incoming {
    Reply(Reply),
    Notification(Notification),
}

/// A payload that was framed correctly but could not be decoded.
///
/// `id` is set when the payload at least told us which request it belongs
/// to, so the failure can be routed to that request alone.
#[derive(Debug, Clone)]
pub struct DecodeError {
    pub id: Option<u64>,
    pub message: String,
}

// ---------------------------------------------------------------------------
// Framing
// ---------------------------------------------------------------------------

/// Read one length-prefixed payload.
///
/// Any error here leaves the stream at an unknown position and is therefore
/// fatal for the connection.
pub async fn read_frame<R: AsyncRead + Unpin>(
    reader: &mut R,
    max_size: u32,
) -> BridgeResult<Vec<u8>> {
    let mut len_buf = [0u8; 4];
    match reader.read_exact(&mut len_buf).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
            return Err(BridgeError::TransportLost(
                "helper closed its output (EOF)".to_string(),
            ));
        }
        Err(e) => {
            return Err(BridgeError::TransportLost(format!("read error: {e}")));
        }
    }
    let len = u32::from_be_bytes(len_buf);

    if len == 0 {
        return Err(BridgeError::TransportLost(
            "protocol error: zero-length payload".to_string(),
        ));
    }
    if len > max_size {
        return Err(BridgeError::TransportLost(format!(
            "payload too large: {len} bytes (max {max_size})"
        )));
    }

    let mut buf = vec![0u8; len as usize];
    reader
        .read_exact(&mut buf)
        .await
        .map_err(|e| BridgeError::TransportLost(format!("read error (payload): {e}")))?;
    Ok(buf)
}

/// Decode a payload read by [`read_frame`].
pub fn decode_incoming(buf: &[u8]) -> Result<Incoming, DecodeError> {
    let value: Value = rmp_serde::from_slice(buf).map_err(|e| DecodeError {
        id: None,
        message: format!("msgpack decode error: {e}"),
    })?;

    let map = value.as_map().ok_or_else(|| DecodeError {
        id: None,
        message: "expected a MsgPack map".to_string(),
    })?;

    let id = get_u64(map, "id");
    let has_method = get_str(map, "method").is_some();

    match (id, has_method) {
        (Some(id), false) => rmp_serde::from_slice::<Reply>(buf)
            .map(Incoming::Reply)
            .map_err(|e| DecodeError {
                id: Some(id),
                message: format!("reply decode error: {e}"),
            }),
        (None, true) => rmp_serde::from_slice::<Notification>(buf)
            .map(Incoming::Notification)
            .map_err(|e| DecodeError {
                id: None,
                message: format!("notification decode error: {e}"),
            }),
        (Some(id), true) => Err(DecodeError {
            id: Some(id),
            message: "received a request from the helper (unexpected)".to_string(),
        }),
        (None, false) => Err(DecodeError {
            id: None,
            message: "message has neither id nor method".to_string(),
        }),
    }
}

/// Serialize `msg` into a complete frame (length prefix + payload).
///
/// Payloads larger than `max_size` are refused, since the peer would drop
/// the connection on reading them.
pub fn encode_frame<T: Serialize>(msg: &T, max_size: u32) -> BridgeResult<Vec<u8>> {
    let payload = rmp_serde::to_vec_named(msg)
        .map_err(|e| BridgeError::Protocol(format!("encode error: {e}")))?;
    let len = u32::try_from(payload.len())
        .ok()
        .filter(|&len| len <= max_size)
        .ok_or_else(|| {
            BridgeError::Usage(format!(
                "request too large: {} bytes (max {max_size})",
                payload.len()
            ))
        })?;
    let mut frame = Vec::with_capacity(4 + payload.len());
    frame.extend_from_slice(&len.to_be_bytes());
    frame.extend_from_slice(&payload);
    Ok(frame)
}

/// Write a pre-encoded frame and flush.
pub async fn write_frame<W: AsyncWrite + Unpin>(writer: &mut W, frame: &[u8]) -> BridgeResult<()> {
    writer
        .write_all(frame)
        .await
        .map_err(|e| BridgeError::TransportLost(format!("write error: {e}")))?;
    writer
        .flush()
        .await
        .map_err(|e| BridgeError::TransportLost(format!("flush error: {e}")))?;
    Ok(())
}

// ---------------------------------------------------------------------------
// Helper constructors for MsgPack params
// ---------------------------------------------------------------------------

/// Build a MsgPack map from key-value pairs.
pub fn make_params(entries: Vec<(&str, Value)>) -> Value {
    Value::Map(
        entries
            .into_iter()
            .map(|(k, v)| (Value::String(k.into()), v))
            .collect(),
    )
}

pub fn val_str(s: &str) -> Value {
    Value::String(s.into())
}

pub fn val_bin(data: &[u8]) -> Value {
    Value::Binary(data.to_vec())
}

pub fn val_bool(b: bool) -> Value {
    Value::Boolean(b)
}

pub fn val_u64(n: u64) -> Value {
    Value::Integer(n.into())
}

pub fn val_i64(n: i64) -> Value {
    Value::Integer(n.into())
}

pub fn val_str_array(items: &[String]) -> Value {
    Value::Array(items.iter().map(|s| Value::String(s.as_str().into())).collect())
}

// ---------------------------------------------------------------------------
// Response value extraction helpers
// ---------------------------------------------------------------------------

fn field<'a>(map: &'a [(Value, Value)], key: &str) -> Option<&'a Value> {
    map.iter()
        .find(|(k, _)| k.as_str() == Some(key))
        .map(|(_, v)| v)
}

pub fn get_str<'a>(map: &'a [(Value, Value)], key: &str) -> Option<&'a str> {
    field(map, key).and_then(|v| v.as_str())
}

pub fn get_u64(map: &[(Value, Value)], key: &str) -> Option<u64> {
    field(map, key).and_then(|v| v.as_u64())
}

pub fn get_i64(map: &[(Value, Value)], key: &str) -> Option<i64> {
    field(map, key).and_then(|v| v.as_i64())
}

pub fn get_bin<'a>(map: &'a [(Value, Value)], key: &str) -> Option<&'a [u8]> {
    field(map, key).and_then(|v| v.as_slice())
}

/// Require the top-level value of a reply to be a map.
pub fn expect_map<'a>(value: &'a Value, method: &str) -> BridgeResult<&'a [(Value, Value)]> {
    value
        .as_map()
        .map(|m| m.as_slice())
        .ok_or_else(|| BridgeError::Protocol(format!("{method}: expected map result")))
}

// ---------------------------------------------------------------------------
// Error mapping
// ---------------------------------------------------------------------------

/// Convert a helper error payload into a [`BridgeError`].
pub fn rpc_error_to_bridge(err: RpcErrorData) -> BridgeError {
    match err.code {
        error_code::NOT_FOUND => BridgeError::NotFound(err.message),
        error_code::PERMISSION_DENIED => BridgeError::PermissionDenied(err.message),
        error_code::METHOD_NOT_FOUND => {
            BridgeError::Protocol(format!("helper does not support method: {}", err.message))
        }
        error_code::INVALID_PARAMS => {
            BridgeError::Protocol(format!("invalid parameters: {}", err.message))
        }
        code => BridgeError::Remote {
            code,
            errno: err.errno,
            message: err.message,
        },
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

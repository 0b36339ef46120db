//! JSON wire protocol for the collaboration connection.
//!
//! Every frame is a JSON record tagged by the action field `a`:
//!
//! ```text
//! client → server   {a:"f"|"s"|"u", c, d, v?}
//!                   {a:"op", c, d, v, src, seq, op?|create?|del?}
//!                   {a:"bf"|"bs"|"bu", c, b: [ids] | {id: v, …}}
//!                   {a:"qf"|"qs", id, c, q, …}
//! server → client   {a:"init", protocol, type, id}
//!                   {a:"qf"|"qs", id, data, extra}   {a:"q", id, diff?, extra?}
//!                   {a:"f"|"s"|"u"|"op", c, d, …}
//!                   {a:"bf"|"bs"|"bu", c, data?, b?, error?}
//! ```
//!
//! Any frame may carry an `error: {code, message}` envelope. Unknown action
//! tags fail to decode; the connection logs and drops them.

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::collections::BTreeMap;

/// The canonical default OT type the client and server must agree on at
/// handshake. Connections may be configured with a different type URI.
pub const DEFAULT_TYPE: &str = "json0";

/// Protocol version expected in the server `init` frame.
pub const PROTOCOL_VERSION: u64 = 1;

/// The `error` sub-record any frame may carry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorInfo {
    pub code: u32,
    pub message: String,
}

/// Server hello. Fields are kept as raw JSON so the dispatcher can validate
/// them and surface coded errors instead of a decode failure.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InitMessage {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub protocol: Option<JsonValue>,
    /// Server-declared default OT type.
    #[serde(default, rename = "type", skip_serializing_if = "Option::is_none")]
    pub default_type: Option<JsonValue>,
    /// Server-assigned client id; must be a JSON string.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<JsonValue>,
}

/// Single-document fetch/subscribe/unsubscribe frame, both directions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DocMessage {
    pub c: String,
    pub d: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub v: Option<u64>,
    /// Snapshot or subscription payload on server replies.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<JsonValue>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorInfo>,
}

impl DocMessage {
    pub fn new(collection: &str, id: &str, version: Option<u64>) -> Self {
        Self {
            c: collection.to_string(),
            d: id.to_string(),
            v: version,
            data: None,
            error: None,
        }
    }
}

/// Operation frame. `op`, `create` and `del` are carried verbatim.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OpMessage {
    pub c: String,
    pub d: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub v: Option<u64>,
    /// Source identity of the submitting session.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub src: Option<String>,
    /// Per-session operation sequence number.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seq: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub op: Option<JsonValue>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub create: Option<JsonValue>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub del: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorInfo>,
}

/// The `b` field of a bulk frame: a bare id list (no versions) or an
/// id → version mapping.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum BulkField {
    Ids(Vec<String>),
    Versions(BTreeMap<String, Option<u64>>),
}

/// Bulk fetch/subscribe/unsubscribe frame, both directions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BulkMessage {
    pub c: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub b: Option<BulkField>,
    /// Per-document reply payloads, keyed by document id.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<BTreeMap<String, JsonValue>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorInfo>,
}

/// Query fetch/subscribe request or reply. Query-specific request fields
/// ride in the flattened `rest` map.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryMessage {
    pub id: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub c: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub q: Option<JsonValue>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<JsonValue>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extra: Option<JsonValue>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorInfo>,
    #[serde(flatten)]
    pub rest: serde_json::Map<String, JsonValue>,
}

/// Query update frame (`a:"q"`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryUpdateMessage {
    pub id: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub diff: Option<JsonValue>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extra: Option<JsonValue>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorInfo>,
}

/// Top-level wire frame, tagged by the action field `a`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "a")]
pub enum Message {
    #[serde(rename = "init")]
    Init(InitMessage),
    #[serde(rename = "f")]
    Fetch(DocMessage),
    #[serde(rename = "s")]
    Subscribe(DocMessage),
    #[serde(rename = "u")]
    Unsubscribe(DocMessage),
    #[serde(rename = "op")]
    Op(OpMessage),
    #[serde(rename = "bf")]
    BulkFetch(BulkMessage),
    #[serde(rename = "bs")]
    BulkSubscribe(BulkMessage),
    #[serde(rename = "bu")]
    BulkUnsubscribe(BulkMessage),
    #[serde(rename = "qf")]
    QueryFetch(QueryMessage),
    #[serde(rename = "qs")]
    QuerySubscribe(QueryMessage),
    #[serde(rename = "qu")]
    QueryUnsubscribe(QueryMessage),
    #[serde(rename = "q")]
    QueryUpdate(QueryUpdateMessage),
}

impl Message {
    /// The action tag of this frame.
    pub fn action(&self) -> &'static str {
        match self {
            Message::Init(_) => "init",
            Message::Fetch(_) => "f",
            Message::Subscribe(_) => "s",
            Message::Unsubscribe(_) => "u",
            Message::Op(_) => "op",
            Message::BulkFetch(_) => "bf",
            Message::BulkSubscribe(_) => "bs",
            Message::BulkUnsubscribe(_) => "bu",
            Message::QueryFetch(_) => "qf",
            Message::QuerySubscribe(_) => "qs",
            Message::QueryUnsubscribe(_) => "qu",
            Message::QueryUpdate(_) => "q",
        }
    }

    /// The `error` envelope of this frame, if any.
    pub fn error(&self) -> Option<&ErrorInfo> {
        match self {
            Message::Init(_) => None,
            Message::Fetch(m) | Message::Subscribe(m) | Message::Unsubscribe(m) => {
                m.error.as_ref()
            }
            Message::Op(m) => m.error.as_ref(),
            Message::BulkFetch(m) | Message::BulkSubscribe(m) | Message::BulkUnsubscribe(m) => {
                m.error.as_ref()
            }
            Message::QueryFetch(m) | Message::QuerySubscribe(m) | Message::QueryUnsubscribe(m) => {
                m.error.as_ref()
            }
            Message::QueryUpdate(m) => m.error.as_ref(),
        }
    }
}

/// Serialize a frame to its wire form.
pub fn encode(message: &Message) -> Result<String, CodecError> {
    serde_json::to_string(message).map_err(|e| CodecError::Encode(e.to_string()))
}

/// Deserialize a frame from its wire form.
pub fn decode(raw: &str) -> Result<Message, CodecError> {
    serde_json::from_str(raw).map_err(|e| CodecError::Decode(e.to_string()))
}

/// Codec errors.
#[derive(Debug, Clone)]
pub enum CodecError {
    Encode(String),
    Decode(String),
}

impl std::fmt::Display for CodecError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CodecError::Encode(e) => write!(f, "frame encode error: {e}"),
            CodecError::Decode(e) => write!(f, "frame decode error: {e}"),
        }
    }
}

impl std::error::Error for CodecError {}

//! JSON-RPC 2.0 message family used by the MCP transports
//!
//! Every message on the wire is exactly one of Request, Notification,
//! Response or Error. Serialization is untagged; parsing goes through
//! [`JsonRpcMessage::from_value`] which enforces the shape rules instead of
//! relying on serde's untagged fallthrough.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use ts_rs::TS;

pub const JSONRPC_VERSION: &str = "2.0";

// ============================================================================
// Error codes
// ============================================================================

pub const PARSE_ERROR: i64 = -32700;
pub const INVALID_REQUEST: i64 = -32600;
pub const METHOD_NOT_FOUND: i64 = -32601;
pub const INVALID_PARAMS: i64 = -32602;
pub const INTERNAL_ERROR: i64 = -32603;
/// Generic transport-level failure (missing session header, transport mismatch)
pub const TRANSPORT_ERROR: i64 = -32000;
/// Session id does not map to an initialized session
pub const SESSION_NOT_FOUND: i64 = -32001;

// ============================================================================
// Messages
// ============================================================================

/// Request id: JSON-RPC allows strings and integers
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize, TS)]
#[ts(export, export_to = "../../clients/generated.ts")]
#[serde(untagged)]
pub enum RequestId {
    Number(i64),
    String(String),
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RequestId::Number(n) => write!(f, "{n}"),
            RequestId::String(s) => f.write_str(s),
        }
    }
}

impl From<i64> for RequestId {
    fn from(value: i64) -> Self {
        RequestId::Number(value)
    }
}

impl From<&str> for RequestId {
    fn from(value: &str) -> Self {
        RequestId::String(value.to_string())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JsonRpcRequest {
    pub jsonrpc: String,
    pub id: RequestId,
    pub method: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

impl JsonRpcRequest {
    pub fn new(id: impl Into<RequestId>, method: impl Into<String>, params: Option<Value>) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id: id.into(),
            method: method.into(),
            params,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JsonRpcNotification {
    pub jsonrpc: String,
    pub method: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

impl JsonRpcNotification {
    pub fn new(method: impl Into<String>, params: Option<Value>) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            method: method.into(),
            params,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JsonRpcResponse {
    pub jsonrpc: String,
    pub id: RequestId,
    pub result: Value,
}

impl JsonRpcResponse {
    pub fn new(id: RequestId, result: Value) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id,
            result,
        }
    }
}

/// The `error` member of an error response
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, TS)]
#[ts(export, export_to = "../../clients/generated.ts")]
pub struct JsonRpcError {
    pub code: i64,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[ts(type = "unknown")]
    pub data: Option<Value>,
}

/// Error response; `id` serializes as `null` when the request id is unknown
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JsonRpcErrorResponse {
    pub jsonrpc: String,
    pub id: Option<RequestId>,
    pub error: JsonRpcError,
}

impl JsonRpcErrorResponse {
    pub fn new(id: Option<RequestId>, code: i64, message: impl Into<String>) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id,
            error: JsonRpcError {
                code,
                message: message.into(),
                data: None,
            },
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum JsonRpcMessage {
    Request(JsonRpcRequest),
    Notification(JsonRpcNotification),
    Response(JsonRpcResponse),
    Error(JsonRpcErrorResponse),
}

/// Why a JSON value is not a valid JSON-RPC 2.0 message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShapeError(pub String);

impl fmt::Display for ShapeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl std::error::Error for ShapeError {}

fn shape(msg: impl Into<String>) -> ShapeError {
    ShapeError(msg.into())
}

fn parse_id(value: &Value) -> Result<RequestId, ShapeError> {
    match value {
        Value::String(s) => Ok(RequestId::String(s.clone())),
        Value::Number(n) => n
            .as_i64()
            .map(RequestId::Number)
            .ok_or_else(|| shape("id must be an integer or string")),
        _ => Err(shape("id must be an integer or string")),
    }
}

fn parse_params(obj: &Map<String, Value>) -> Result<Option<Value>, ShapeError> {
    match obj.get("params") {
        None | Some(Value::Null) => Ok(None),
        Some(p @ (Value::Object(_) | Value::Array(_))) => Ok(Some(p.clone())),
        Some(_) => Err(shape("params must be an object or array")),
    }
}

impl JsonRpcMessage {
    /// Strictly classify a single JSON value as a JSON-RPC message.
    pub fn from_value(value: Value) -> Result<Self, ShapeError> {
        let obj = value
            .as_object()
            .ok_or_else(|| shape("message must be a JSON object"))?;

        if obj.get("jsonrpc").and_then(Value::as_str) != Some(JSONRPC_VERSION) {
            return Err(shape("jsonrpc must be \"2.0\""));
        }

        if let Some(method) = obj.get("method") {
            let method = method
                .as_str()
                .ok_or_else(|| shape("method must be a string"))?
                .to_string();
            let params = parse_params(obj)?;
            return match obj.get("id") {
                None => Ok(JsonRpcMessage::Notification(JsonRpcNotification {
                    jsonrpc: JSONRPC_VERSION.to_string(),
                    method,
                    params,
                })),
                Some(id) => Ok(JsonRpcMessage::Request(JsonRpcRequest {
                    jsonrpc: JSONRPC_VERSION.to_string(),
                    id: parse_id(id)?,
                    method,
                    params,
                })),
            };
        }

        if let Some(result) = obj.get("result") {
            let id = obj
                .get("id")
                .ok_or_else(|| shape("response is missing id"))
                .and_then(parse_id)?;
            return Ok(JsonRpcMessage::Response(JsonRpcResponse {
                jsonrpc: JSONRPC_VERSION.to_string(),
                id,
                result: result.clone(),
            }));
        }

        if let Some(error) = obj.get("error") {
            let error: JsonRpcError = serde_json::from_value(error.clone())
                .map_err(|e| shape(format!("invalid error object: {e}")))?;
            let id = match obj.get("id") {
                None | Some(Value::Null) => None,
                Some(id) => Some(parse_id(id)?),
            };
            return Ok(JsonRpcMessage::Error(JsonRpcErrorResponse {
                jsonrpc: JSONRPC_VERSION.to_string(),
                id,
                error,
            }));
        }

        Err(shape("message is not a request, notification, response or error"))
    }

    /// Parse either a single message or a non-empty batch.
    pub fn parse_batch(value: Value) -> Result<Vec<Self>, ShapeError> {
        match value {
            Value::Array(items) => {
                if items.is_empty() {
                    return Err(shape("batch must not be empty"));
                }
                items.into_iter().map(Self::from_value).collect()
            }
            other => Ok(vec![Self::from_value(other)?]),
        }
    }

    pub fn id(&self) -> Option<&RequestId> {
        match self {
            JsonRpcMessage::Request(r) => Some(&r.id),
            JsonRpcMessage::Response(r) => Some(&r.id),
            JsonRpcMessage::Error(e) => e.id.as_ref(),
            JsonRpcMessage::Notification(_) => None,
        }
    }

    pub fn is_request(&self) -> bool {
        matches!(self, JsonRpcMessage::Request(_))
    }

    pub fn is_initialize(&self) -> bool {
        matches!(self, JsonRpcMessage::Request(r) if r.method == "initialize")
    }

    pub fn to_value(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }
}

impl From<JsonRpcResponse> for JsonRpcMessage {
    fn from(value: JsonRpcResponse) -> Self {
        JsonRpcMessage::Response(value)
    }
}

impl From<JsonRpcErrorResponse> for JsonRpcMessage {
    fn from(value: JsonRpcErrorResponse) -> Self {
        JsonRpcMessage::Error(value)
    }
}

impl From<JsonRpcNotification> for JsonRpcMessage {
    fn from(value: JsonRpcNotification) -> Self {
        JsonRpcMessage::Notification(value)
    }
}

impl From<JsonRpcRequest> for JsonRpcMessage {
    fn from(value: JsonRpcRequest) -> Self {
        JsonRpcMessage::Request(value)
    }
}

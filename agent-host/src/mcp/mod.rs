//! MCP bridging - one protocol server, three wire transports
//!
//! The [`McpBridge`] owns an agent's [`ProtocolServer`] and translates between
//! it and the agent's connections:
//!
//! - WebSocket: one socket per session, bidirectional
//! - SSE: one long-lived GET stream; client messages arrive on a separate POST
//! - Streamable HTTP: each POST opens its own response stream that closes once
//!   every request in the POST has been answered
//!
//! A session's transport kind is chosen by the request that creates it and is
//! persisted, so a session can never switch transports.

pub mod bridge;
pub mod server;
pub mod transport;

pub use bridge::McpBridge;
pub use server::{McpServer, McpTool, ProtocolServer, SUPPORTED_PROTOCOL_VERSIONS};
pub use transport::{McpTransport, Outbox};

use crate::agent::AgentError;
use crate::connection::ConnectionError;
use crate::storage::StorageError;
use serde::{Deserialize, Serialize};
use shared_types::jsonrpc;

/// Carried by every MCP connection
pub const MCP_TAG: &str = "mcp";
pub const MCP_SSE_TAG: &str = "mcp:sse";
pub const MCP_WS_TAG: &str = "mcp:ws";
/// A Streamable-HTTP POST response stream
pub const MCP_STREAMABLE_TAG: &str = "mcp:streamable";
/// The Streamable-HTTP standalone GET stream for server-initiated requests
pub const MCP_GET_TAG: &str = "mcp:get";

/// Response header carrying the Streamable-HTTP session id
pub const SESSION_HEADER: &str = "mcp-session-id";

pub(crate) const TRANSPORT_KEY: &str = "mcp:transport";
pub(crate) const INITIALIZE_KEY: &str = "mcp:initialize";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum McpTransportKind {
    #[serde(rename = "sse")]
    Sse,
    #[serde(rename = "streamable-http")]
    StreamableHttp,
    #[serde(rename = "websocket")]
    WebSocket,
}

impl McpTransportKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            McpTransportKind::Sse => "sse",
            McpTransportKind::StreamableHttp => "streamable-http",
            McpTransportKind::WebSocket => "websocket",
        }
    }

    /// Agent name for a session of this kind
    pub fn agent_name(&self, session_id: &str) -> String {
        match self {
            McpTransportKind::Sse => format!("sse:{session_id}"),
            McpTransportKind::StreamableHttp => format!("streamable-http:{session_id}"),
            McpTransportKind::WebSocket => format!("ws:{session_id}"),
        }
    }
}

impl std::fmt::Display for McpTransportKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum McpError {
    #[error("Session not found")]
    SessionNotFound,

    #[error("Session uses the {expected} transport, not {actual}")]
    TransportMismatch {
        expected: McpTransportKind,
        actual: McpTransportKind,
    },

    #[error("A standalone GET stream is already open for this session")]
    GetStreamExists,

    #[error("This agent does not serve MCP")]
    NotSupported,

    #[error("Invalid params: {0}")]
    InvalidParams(String),

    #[error("Tool error: {0}")]
    Tool(String),

    #[error(transparent)]
    Agent(#[from] AgentError),

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error(transparent)]
    Connection(#[from] ConnectionError),
}

impl McpError {
    /// JSON-RPC error code reported to the client
    pub fn code(&self) -> i64 {
        match self {
            McpError::SessionNotFound => jsonrpc::SESSION_NOT_FOUND,
            McpError::TransportMismatch { .. } | McpError::GetStreamExists => {
                jsonrpc::TRANSPORT_ERROR
            }
            McpError::InvalidParams(_) => jsonrpc::INVALID_PARAMS,
            McpError::NotSupported => jsonrpc::METHOD_NOT_FOUND,
            _ => jsonrpc::INTERNAL_ERROR,
        }
    }
}

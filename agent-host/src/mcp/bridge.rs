use super::{
    McpError, McpTransport, McpTransportKind, Outbox, ProtocolServer, INITIALIZE_KEY,
    MCP_GET_TAG, MCP_SSE_TAG, MCP_WS_TAG, TRANSPORT_KEY,
};
use crate::agent::AgentContext;
use crate::connection::CLOSE_NORMAL;
use crate::storage::AgentStorage;
use serde_json::Value;
use shared_types::jsonrpc::{JsonRpcErrorResponse, JsonRpcMessage};
use shared_types::RequestId;
use std::collections::{HashMap, HashSet};

/// Connects one protocol server to the agent's MCP connections.
///
/// For Streamable HTTP every request id is recorded against the POST stream
/// it arrived on; the reply is routed there and the stream is closed once all
/// of its requests are answered. Pending ids live only in memory and are
/// abandoned when their stream closes.
pub struct McpBridge {
    server: Box<dyn ProtocolServer>,
    kind: Option<McpTransportKind>,
    initialized: bool,
    pending: HashMap<RequestId, String>,
    outstanding: HashMap<String, HashSet<RequestId>>,
}

impl McpBridge {
    /// Restore the session's transport kind and replay its `initialize`
    /// request so a woken agent resumes the session where it left off.
    pub async fn start(
        server: Box<dyn ProtocolServer>,
        ctx: &mut AgentContext<'_>,
    ) -> Result<Self, McpError> {
        let kind = ctx.storage().kv_get::<McpTransportKind>(TRANSPORT_KEY).await?;
        let stored_init = ctx.storage().kv_get::<Value>(INITIALIZE_KEY).await?;

        let mut bridge = Self {
            server,
            kind,
            initialized: false,
            pending: HashMap::new(),
            outstanding: HashMap::new(),
        };

        if let Some(init) = stored_init {
            match JsonRpcMessage::from_value(init) {
                Ok(message) => {
                    let mut discard = Outbox::new();
                    bridge.server.on_message(ctx, message, &mut discard).await?;
                    bridge.initialized = true;
                    tracing::debug!(agent = %ctx.name(), "Replayed MCP initialize");
                }
                Err(e) => {
                    tracing::error!(agent = %ctx.name(), error = %e, "Stored initialize is invalid");
                }
            }
        }
        Ok(bridge)
    }

    pub fn kind(&self) -> Option<McpTransportKind> {
        self.kind
    }

    /// Whether this session has seen an `initialize` request
    pub fn is_initialized(&self) -> bool {
        self.initialized
    }

    /// Bind the session to `kind`, or fail if it is already bound elsewhere.
    pub async fn establish(
        &mut self,
        storage: &AgentStorage,
        kind: McpTransportKind,
    ) -> Result<(), McpError> {
        match self.kind {
            Some(existing) if existing == kind => Ok(()),
            Some(existing) => Err(McpError::TransportMismatch {
                expected: existing,
                actual: kind,
            }),
            None => {
                storage.kv_put(TRANSPORT_KEY, &kind).await?;
                self.kind = Some(kind);
                tracing::info!(transport = %kind, "MCP session established");
                Ok(())
            }
        }
    }

    /// Feed client messages to the server and route whatever it emits.
    /// `connection_id` is the Streamable-HTTP stream the messages arrived on.
    pub async fn deliver(
        &mut self,
        ctx: &mut AgentContext<'_>,
        connection_id: Option<&str>,
        messages: Vec<JsonRpcMessage>,
    ) -> Result<(), McpError> {
        for message in messages {
            if let (Some(conn), JsonRpcMessage::Request(request)) = (connection_id, &message) {
                if self.kind == Some(McpTransportKind::StreamableHttp) {
                    self.pending.insert(request.id.clone(), conn.to_string());
                    self.outstanding
                        .entry(conn.to_string())
                        .or_default()
                        .insert(request.id.clone());
                }
            }

            if message.is_initialize() {
                ctx.storage()
                    .kv_put(INITIALIZE_KEY, &message.to_value())
                    .await?;
                self.initialized = true;
            }

            let id = message.id().cloned();
            let is_request = message.is_request();
            let mut outbox = Outbox::new();
            if let Err(e) = self.server.on_message(ctx, message, &mut outbox).await {
                if is_request {
                    outbox.send(JsonRpcErrorResponse::new(id, e.code(), e.to_string()).into());
                } else {
                    tracing::warn!(agent = %ctx.name(), error = %e, "MCP message failed");
                }
            }

            for outbound in outbox.drain() {
                self.route(ctx, outbound)?;
            }
        }
        Ok(())
    }

    /// Forget requests whose response stream went away.
    pub fn on_close(&mut self, connection_id: &str) {
        if let Some(ids) = self.outstanding.remove(connection_id) {
            for id in ids {
                self.pending.remove(&id);
            }
        }
    }

    fn route(&mut self, ctx: &mut AgentContext<'_>, message: JsonRpcMessage) -> Result<(), McpError> {
        match self.kind {
            Some(McpTransportKind::WebSocket) => send_tagged(ctx, MCP_WS_TAG, &message),
            Some(McpTransportKind::Sse) => send_tagged(ctx, MCP_SSE_TAG, &message),
            Some(McpTransportKind::StreamableHttp) => self.route_streamable(ctx, message),
            None => {
                tracing::warn!(agent = %ctx.name(), "MCP message with no transport dropped");
                Ok(())
            }
        }
    }

    fn route_streamable(
        &mut self,
        ctx: &mut AgentContext<'_>,
        message: JsonRpcMessage,
    ) -> Result<(), McpError> {
        match &message {
            JsonRpcMessage::Response(_) | JsonRpcMessage::Error(_) => {
                let Some(id) = message.id().cloned() else {
                    tracing::warn!("Uncorrelated MCP error dropped");
                    return Ok(());
                };
                let Some(conn_id) = self.pending.remove(&id) else {
                    tracing::warn!(request_id = %id, "No stream is waiting for this response");
                    return Ok(());
                };

                let finished = match self.outstanding.get_mut(&conn_id) {
                    Some(ids) => {
                        ids.remove(&id);
                        ids.is_empty()
                    }
                    None => true,
                };

                match ctx.connection(&conn_id)? {
                    Some(conn) => {
                        if let Err(e) = conn.send_json(&message) {
                            tracing::warn!(connection_id = %conn_id, error = %e, "Response stream is gone");
                        }
                        if finished {
                            conn.close(CLOSE_NORMAL, "all requests answered");
                        }
                    }
                    None => {
                        tracing::warn!(connection_id = %conn_id, "Response stream closed before reply");
                    }
                }

                if finished {
                    self.outstanding.remove(&conn_id);
                    ctx.remove_connection(&conn_id);
                }
                Ok(())
            }
            JsonRpcMessage::Notification(n) => {
                tracing::debug!(method = %n.method, "Notification dropped on streamable-http");
                Ok(())
            }
            JsonRpcMessage::Request(r) => {
                let streams = ctx.connections(Some(MCP_GET_TAG))?;
                match streams.first() {
                    Some(conn) => {
                        if let Err(e) = conn.send_json(&message) {
                            tracing::warn!(connection_id = %conn.id(), error = %e, "GET stream is gone");
                        }
                    }
                    None => {
                        tracing::warn!(method = %r.method, "No GET stream; server request undeliverable")
                    }
                }
                Ok(())
            }
        }
    }
}

fn send_tagged(
    ctx: &AgentContext<'_>,
    tag: &str,
    message: &JsonRpcMessage,
) -> Result<(), McpError> {
    let conns = ctx.connections(Some(tag))?;
    let Some(conn) = conns.first() else {
        tracing::warn!(agent = %ctx.name(), tag, "No MCP connection; message dropped");
        return Ok(());
    };
    if let Err(e) = conn.send_json(message) {
        tracing::warn!(connection_id = %conn.id(), error = %e, "MCP send failed");
    }
    Ok(())
}

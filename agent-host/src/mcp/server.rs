//! Minimal MCP protocol server: lifecycle, ping and tools

use super::{McpError, McpTransport};
use crate::agent::AgentContext;
use async_trait::async_trait;
use serde_json::{json, Value};
use shared_types::jsonrpc::{
    self, JsonRpcErrorResponse, JsonRpcMessage, JsonRpcRequest, JsonRpcResponse,
};
use std::collections::BTreeMap;
use std::sync::Arc;

/// Newest first. Clients asking for anything else get the newest.
pub const SUPPORTED_PROTOCOL_VERSIONS: &[&str] = &["2025-03-26", "2024-11-05"];

/// A protocol server driven by the bridge. Every message the server emits,
/// replies included, goes through `transport`.
#[async_trait]
pub trait ProtocolServer: Send + Sync {
    async fn on_message(
        &mut self,
        ctx: &mut AgentContext<'_>,
        message: JsonRpcMessage,
        transport: &mut dyn McpTransport,
    ) -> Result<(), McpError>;
}

/// A tool exposed through `tools/list` and `tools/call`.
#[async_trait]
pub trait McpTool: Send + Sync {
    fn name(&self) -> &str;

    fn description(&self) -> &str;

    /// JSON Schema advertised to clients. Arguments are not validated against it.
    fn input_schema(&self) -> Value {
        json!({"type": "object"})
    }

    async fn call(
        &self,
        ctx: &mut AgentContext<'_>,
        arguments: Value,
        transport: &mut dyn McpTransport,
    ) -> Result<Value, McpError>;
}

pub struct McpServer {
    name: String,
    version: String,
    tools: BTreeMap<String, Arc<dyn McpTool>>,
    protocol_version: Option<String>,
}

impl McpServer {
    pub fn new(name: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            version: version.into(),
            tools: BTreeMap::new(),
            protocol_version: None,
        }
    }

    pub fn tool(mut self, tool: Arc<dyn McpTool>) -> Self {
        self.tools.insert(tool.name().to_string(), tool);
        self
    }

    /// Negotiated version, once `initialize` was handled
    pub fn protocol_version(&self) -> Option<&str> {
        self.protocol_version.as_deref()
    }

    fn initialize(&mut self, params: Option<&Value>) -> Value {
        let requested = params
            .and_then(|p| p.get("protocolVersion"))
            .and_then(Value::as_str);
        let version = match requested {
            Some(v) if SUPPORTED_PROTOCOL_VERSIONS.contains(&v) => v,
            _ => SUPPORTED_PROTOCOL_VERSIONS[0],
        };
        self.protocol_version = Some(version.to_string());

        json!({
            "protocolVersion": version,
            "capabilities": {
                "tools": {"listChanged": false}
            },
            "serverInfo": {
                "name": self.name,
                "version": self.version,
            }
        })
    }

    fn list_tools(&self) -> Value {
        let tools: Vec<Value> = self
            .tools
            .values()
            .map(|tool| {
                json!({
                    "name": tool.name(),
                    "description": tool.description(),
                    "inputSchema": tool.input_schema(),
                })
            })
            .collect();
        json!({ "tools": tools })
    }

    async fn call_tool(
        &self,
        ctx: &mut AgentContext<'_>,
        params: Option<&Value>,
        transport: &mut dyn McpTransport,
    ) -> Result<Value, McpError> {
        let name = params
            .and_then(|p| p.get("name"))
            .and_then(Value::as_str)
            .ok_or_else(|| McpError::InvalidParams("tools/call requires a tool name".into()))?;
        let tool = self
            .tools
            .get(name)
            .cloned()
            .ok_or_else(|| McpError::InvalidParams(format!("Unknown tool: {name}")))?;
        let arguments = params
            .and_then(|p| p.get("arguments"))
            .cloned()
            .unwrap_or_else(|| json!({}));

        let result = match tool.call(ctx, arguments, transport).await {
            Ok(value) => json!({
                "content": [{"type": "text", "text": text_content(&value)}],
            }),
            Err(e) => {
                tracing::warn!(tool = %name, error = %e, "MCP tool failed");
                json!({
                    "content": [{"type": "text", "text": e.to_string()}],
                    "isError": true,
                })
            }
        };
        Ok(result)
    }

    async fn handle_request(
        &mut self,
        ctx: &mut AgentContext<'_>,
        request: JsonRpcRequest,
        transport: &mut dyn McpTransport,
    ) -> JsonRpcMessage {
        let JsonRpcRequest {
            id, method, params, ..
        } = request;

        if self.protocol_version.is_none() && method != "initialize" && method != "ping" {
            return JsonRpcErrorResponse::new(
                Some(id),
                jsonrpc::INVALID_REQUEST,
                "Server not initialized",
            )
            .into();
        }

        let result = match method.as_str() {
            "initialize" => Ok(self.initialize(params.as_ref())),
            "ping" => Ok(json!({})),
            "tools/list" => Ok(self.list_tools()),
            "tools/call" => self.call_tool(ctx, params.as_ref(), transport).await,
            other => {
                return JsonRpcErrorResponse::new(
                    Some(id),
                    jsonrpc::METHOD_NOT_FOUND,
                    format!("Method not found: {other}"),
                )
                .into()
            }
        };

        match result {
            Ok(value) => JsonRpcResponse::new(id, value).into(),
            Err(e) => JsonRpcErrorResponse::new(Some(id), e.code(), e.to_string()).into(),
        }
    }
}

fn text_content(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

#[async_trait]
impl ProtocolServer for McpServer {
    async fn on_message(
        &mut self,
        ctx: &mut AgentContext<'_>,
        message: JsonRpcMessage,
        transport: &mut dyn McpTransport,
    ) -> Result<(), McpError> {
        match message {
            JsonRpcMessage::Request(request) => {
                let reply = self.handle_request(ctx, request, transport).await;
                transport.send(reply);
            }
            JsonRpcMessage::Notification(notification) => {
                tracing::debug!(method = %notification.method, "MCP notification");
            }
            JsonRpcMessage::Response(_) | JsonRpcMessage::Error(_) => {
                tracing::debug!(id = ?message.id(), "Ignoring client response");
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::MethodRegistry;
    use crate::connection::InMemoryRegistry;
    use crate::mcp::Outbox;
    use crate::scheduler::tests::RecordingAlarm;
    use crate::scheduler::Scheduler;
    use crate::storage::AgentStorage;
    use shared_types::RequestId;

    struct Echo;

    #[async_trait]
    impl McpTool for Echo {
        fn name(&self) -> &str {
            "echo"
        }

        fn description(&self) -> &str {
            "Echo the text argument"
        }

        async fn call(
            &self,
            _ctx: &mut AgentContext<'_>,
            arguments: Value,
            _transport: &mut dyn McpTransport,
        ) -> Result<Value, McpError> {
            match arguments.get("text") {
                Some(text) => Ok(text.clone()),
                None => Err(McpError::Tool("text is required".into())),
            }
        }
    }

    async fn run(server: &mut McpServer, messages: Vec<Value>) -> Vec<Value> {
        let storage = AgentStorage::in_memory().await.unwrap();
        let scheduler = Scheduler::new(
            storage.clone(),
            Arc::new(RecordingAlarm::default()),
            Arc::new(MethodRegistry::new()),
        );
        let mut registry = InMemoryRegistry::new();
        let initial = None;
        let mut ctx = AgentContext::new("mcp", &storage, &scheduler, &mut registry, &initial);

        let mut outbox = Outbox::new();
        for message in messages {
            let message = JsonRpcMessage::from_value(message).unwrap();
            server.on_message(&mut ctx, message, &mut outbox).await.unwrap();
        }
        outbox.drain().map(|m| m.to_value()).collect()
    }

    fn request(id: i64, method: &str, params: Value) -> Value {
        json!({"jsonrpc": "2.0", "id": id, "method": method, "params": params})
    }

    #[tokio::test]
    async fn test_requests_before_initialize_are_rejected() {
        let mut server = McpServer::new("test", "0.1.0").tool(Arc::new(Echo));
        let replies = run(
            &mut server,
            vec![request(1, "ping", json!({})), request(2, "tools/list", json!({}))],
        )
        .await;

        assert_eq!(replies[0]["result"], json!({}));
        assert_eq!(replies[1]["error"]["code"], jsonrpc::INVALID_REQUEST);
    }

    #[tokio::test]
    async fn test_version_negotiation() {
        let mut server = McpServer::new("test", "0.1.0");
        let replies = run(
            &mut server,
            vec![request(1, "initialize", json!({"protocolVersion": "2024-11-05"}))],
        )
        .await;
        assert_eq!(replies[0]["result"]["protocolVersion"], "2024-11-05");
        assert_eq!(replies[0]["result"]["serverInfo"]["name"], "test");

        let mut server = McpServer::new("test", "0.1.0");
        let replies = run(
            &mut server,
            vec![request(1, "initialize", json!({"protocolVersion": "1999-01-01"}))],
        )
        .await;
        assert_eq!(
            replies[0]["result"]["protocolVersion"],
            SUPPORTED_PROTOCOL_VERSIONS[0]
        );
    }

    #[tokio::test]
    async fn test_tools_list_and_call() {
        let mut server = McpServer::new("test", "0.1.0").tool(Arc::new(Echo));
        let replies = run(
            &mut server,
            vec![
                request(1, "initialize", json!({})),
                json!({"jsonrpc": "2.0", "method": "notifications/initialized"}),
                request(2, "tools/list", json!({})),
                request(3, "tools/call", json!({"name": "echo", "arguments": {"text": "hi"}})),
                request(4, "tools/call", json!({"name": "echo", "arguments": {}})),
                request(5, "tools/call", json!({"name": "missing"})),
                request(6, "resources/list", json!({})),
            ],
        )
        .await;

        assert_eq!(replies.len(), 6);
        assert_eq!(replies[1]["result"]["tools"][0]["name"], "echo");
        assert_eq!(replies[2]["result"]["content"][0]["text"], "hi");
        assert_eq!(replies[3]["result"]["isError"], true);
        assert_eq!(replies[4]["error"]["code"], jsonrpc::INVALID_PARAMS);
        assert_eq!(replies[5]["error"]["code"], jsonrpc::METHOD_NOT_FOUND);
        assert_eq!(
            JsonRpcMessage::from_value(replies[5].clone()).unwrap().id(),
            Some(&RequestId::Number(6))
        );
    }
}

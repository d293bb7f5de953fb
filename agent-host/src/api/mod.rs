//! HTTP API routes for the agent host
//!
//! Agents are reached over plain WebSockets at `/agents/{name}`; MCP sessions
//! over Streamable-HTTP (`/mcp`), SSE (`/sse`) or MCP-over-WebSocket
//! (`GET /mcp` with an upgrade).

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::json;
use shared_types::jsonrpc;

use crate::connection::CLOSE_GOING_AWAY;
use crate::host::{AgentHost, HostError, WakeMode};
use crate::mcp::McpError;

pub mod agents;
pub mod sse;
pub mod streamable;
pub mod websocket;

#[derive(Clone)]
pub struct ApiState {
    pub host: AgentHost,
    /// Largest accepted MCP POST body
    pub max_body_bytes: usize,
}

/// Configure all API routes
pub fn router() -> Router<ApiState> {
    Router::new()
        .route("/health", get(health_check))
        // Agent routes
        .route("/agents/{name}", get(agents::agent_websocket))
        .route("/agents/{name}/state", get(agents::get_state))
        .route("/agents/{name}/schedules", get(agents::list_schedules))
        .route("/agents/{name}/email", post(agents::deliver_email))
        // MCP transports
        .route(
            "/mcp",
            get(streamable::mcp_get)
                .post(streamable::mcp_post)
                .delete(streamable::mcp_delete),
        )
        .route("/sse", get(sse::sse_stream))
        .route("/sse/message", post(sse::sse_message))
}

async fn health_check() -> impl IntoResponse {
    Json(json!({
        "status": "healthy",
        "service": "agent-host",
        "version": env!("CARGO_PKG_VERSION")
    }))
}

/// `?sessionId=` on the SSE and MCP-over-WebSocket routes
#[derive(Debug, Deserialize)]
pub struct SessionQuery {
    #[serde(rename = "sessionId")]
    pub session_id: Option<String>,
}

pub(crate) fn new_session_id() -> String {
    uuid::Uuid::new_v4().simple().to_string()
}

/// Transport-establishment failure, answered with an HTTP status and a
/// JSON-RPC error body
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    code: i64,
    message: String,
}

impl ApiError {
    pub fn new(status: StatusCode, code: i64, message: impl Into<String>) -> Self {
        Self {
            status,
            code,
            message: message.into(),
        }
    }

    pub fn bad_request(code: i64, message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, code, message)
    }

    pub fn session_not_found() -> Self {
        Self::new(
            StatusCode::NOT_FOUND,
            jsonrpc::SESSION_NOT_FOUND,
            "Session not found",
        )
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (
            self.status,
            Json(json!({
                "jsonrpc": jsonrpc::JSONRPC_VERSION,
                "error": { "code": self.code, "message": self.message },
                "id": null
            })),
        )
            .into_response()
    }
}

impl From<McpError> for ApiError {
    fn from(err: McpError) -> Self {
        let status = match &err {
            McpError::SessionNotFound => return Self::session_not_found(),
            McpError::TransportMismatch { .. } => StatusCode::BAD_REQUEST,
            McpError::GetStreamExists => StatusCode::CONFLICT,
            McpError::NotSupported => StatusCode::NOT_FOUND,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        Self::new(status, err.code(), err.to_string())
    }
}

impl From<HostError> for ApiError {
    fn from(err: HostError) -> Self {
        match err {
            HostError::NotFound(_) => Self::session_not_found(),
            HostError::Mcp(e) => e.into(),
            HostError::Unavailable(reason) => Self::new(
                StatusCode::SERVICE_UNAVAILABLE,
                jsonrpc::TRANSPORT_ERROR,
                format!("Agent {reason} is unavailable"),
            ),
            other => Self::new(
                StatusCode::INTERNAL_SERVER_ERROR,
                jsonrpc::INTERNAL_ERROR,
                other.to_string(),
            ),
        }
    }
}

/// Keeps the agent informed when an HTTP stream is dropped by the client.
/// Disarmed when the agent closed the stream itself.
pub(crate) struct DisconnectGuard {
    host: AgentHost,
    agent: String,
    connection_id: String,
    armed: bool,
}

impl DisconnectGuard {
    pub(crate) fn new(host: AgentHost, agent: String, connection_id: String) -> Self {
        Self {
            host,
            agent,
            connection_id,
            armed: true,
        }
    }

    pub(crate) fn disarm(&mut self) {
        self.armed = false;
    }
}

impl Drop for DisconnectGuard {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            return;
        };
        let host = self.host.clone();
        let agent = std::mem::take(&mut self.agent);
        let connection_id = std::mem::take(&mut self.connection_id);
        runtime.spawn(async move {
            host.disconnect(
                &agent,
                &connection_id,
                CLOSE_GOING_AWAY,
                "stream closed".to_string(),
            )
            .await;
        });
    }
}

/// Wake mode for a new session (`Create`) or a continuing one (`Existing`)
pub(crate) fn wake_mode(creating: bool) -> WakeMode {
    if creating {
        WakeMode::Create
    } else {
        WakeMode::Existing
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::ConnectionStrategy;
    use crate::demo::DemoAgent;
    use crate::host::HostConfig;
    use axum::body::Body;
    use axum::http::Request;
    use http_body_util::BodyExt;
    use std::time::Duration;
    use tower::ServiceExt;

    async fn test_state() -> ApiState {
        let host = AgentHost::new(
            DemoAgent::class(1, ConnectionStrategy::Hibernating),
            HostConfig {
                data_dir: std::env::temp_dir(),
                in_memory: true,
                idle_timeout: Duration::from_secs(60),
            },
        )
        .await
        .unwrap();
        ApiState {
            host,
            max_body_bytes: 1024,
        }
    }

    async fn json_body(response: Response) -> serde_json::Value {
        let body = response.into_body().collect().await.unwrap().to_bytes();
        serde_json::from_slice(&body).unwrap()
    }

    #[tokio::test]
    async fn test_health_check() {
        let app = router().with_state(test_state().await);
        let response = app
            .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let body = json_body(response).await;
        assert_eq!(body["status"], "healthy");
        assert_eq!(body["service"], "agent-host");
    }

    #[tokio::test]
    async fn test_streamable_post_requires_both_accept_types() {
        let app = router().with_state(test_state().await);
        let response = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/mcp")
                    .header("accept", "text/event-stream")
                    .header("content-type", "application/json")
                    .body(Body::from("{}"))
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::NOT_ACCEPTABLE);
        assert_eq!(json_body(response).await["error"]["code"], -32000);
    }

    #[tokio::test]
    async fn test_oversized_body_without_length_is_rejected() {
        let app = router().with_state(test_state().await);
        let response = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/mcp")
                    .header("accept", "application/json, text/event-stream")
                    .header("content-type", "application/json")
                    .body(Body::from("x".repeat(4096)))
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::PAYLOAD_TOO_LARGE);
    }

    #[tokio::test]
    async fn test_sse_message_requires_session_id() {
        let app = router().with_state(test_state().await);
        let response = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/sse/message")
                    .header("content-type", "application/json")
                    .body(Body::from(r#"{"jsonrpc":"2.0","method":"ping","id":1}"#))
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_api_error_body_is_jsonrpc() {
        let response = ApiError::bad_request(jsonrpc::INVALID_REQUEST, "nope").into_response();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        let body = response.into_body().collect().await.unwrap().to_bytes();
        let value: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(value["jsonrpc"], "2.0");
        assert_eq!(value["error"]["code"], -32600);
        assert_eq!(value["error"]["message"], "nope");
        assert!(value["id"].is_null());
    }

    #[test]
    fn test_host_errors_map_to_statuses() {
        assert_eq!(
            ApiError::from(HostError::NotFound("x".into())).status(),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            ApiError::from(HostError::Mcp(McpError::SessionNotFound)).status(),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            ApiError::from(McpError::GetStreamExists).status(),
            StatusCode::CONFLICT
        );
    }
}

//! MCP over SSE: one long-lived GET stream per session plus a POST endpoint
//! for client messages

use std::convert::Infallible;

use axum::body::Body;
use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use futures_util::Stream;
use shared_types::jsonrpc::{self, JsonRpcMessage};

use crate::agent::AgentMsg;
use crate::api::{new_session_id, ApiError, ApiState, DisconnectGuard, SessionQuery};
use crate::connection::{socket_channel, SocketFrame, SocketReceiver};
use crate::host::WakeMode;
use crate::mcp::McpTransportKind;

/// Turn an agent's outbound frames into SSE `message` events. An `endpoint`
/// event, when given, is always emitted first.
pub(crate) fn frame_events(
    mut frames: SocketReceiver,
    mut guard: DisconnectGuard,
    endpoint: Option<String>,
) -> impl Stream<Item = Result<Event, Infallible>> {
    async_stream::stream! {
        if let Some(endpoint) = endpoint {
            yield Ok(Event::default().event("endpoint").data(endpoint));
        }
        while let Some(frame) = frames.recv().await {
            match frame {
                SocketFrame::Text(text) => yield Ok(Event::default().event("message").data(text)),
                SocketFrame::Close { .. } => {
                    guard.disarm();
                    break;
                }
            }
        }
    }
}

pub async fn sse_stream(
    Query(query): Query<SessionQuery>,
    State(state): State<ApiState>,
) -> Result<Response, ApiError> {
    let session_id = query
        .session_id
        .filter(|id| !id.is_empty())
        .unwrap_or_else(new_session_id);
    let agent = McpTransportKind::Sse.agent_name(&session_id);
    let connection_id = uuid::Uuid::new_v4().to_string();
    let (sender, frames) = socket_channel();

    state
        .host
        .call(&agent, WakeMode::Create, |reply| AgentMsg::McpConnect {
            connection_id: connection_id.clone(),
            sender: sender.clone(),
            kind: McpTransportKind::Sse,
            reply,
        })
        .await??;

    tracing::info!(session_id = %session_id, connection_id = %connection_id, "SSE session opened");
    let guard = DisconnectGuard::new(state.host.clone(), agent, connection_id);
    let endpoint = format!("/sse/message?sessionId={session_id}");
    Ok(Sse::new(frame_events(frames, guard, Some(endpoint)))
        .keep_alive(KeepAlive::default())
        .into_response())
}

pub async fn sse_message(
    Query(query): Query<SessionQuery>,
    State(state): State<ApiState>,
    body: Body,
) -> Result<StatusCode, ApiError> {
    let session_id = query.session_id.filter(|id| !id.is_empty()).ok_or_else(|| {
        ApiError::bad_request(jsonrpc::TRANSPORT_ERROR, "sessionId query parameter is required")
    })?;
    let messages = read_messages(body, state.max_body_bytes).await?;
    let agent = McpTransportKind::Sse.agent_name(&session_id);

    state
        .host
        .call(&agent, WakeMode::Existing, |reply| AgentMsg::McpMessage {
            kind: McpTransportKind::Sse,
            messages: messages.clone(),
            reply,
        })
        .await??;
    Ok(StatusCode::ACCEPTED)
}

/// Read a size-limited body and validate it as one JSON-RPC message or a
/// batch of them.
pub(crate) async fn read_messages(
    body: Body,
    limit: usize,
) -> Result<Vec<JsonRpcMessage>, ApiError> {
    let bytes = axum::body::to_bytes(body, limit).await.map_err(|_| {
        ApiError::new(
            StatusCode::PAYLOAD_TOO_LARGE,
            jsonrpc::INVALID_REQUEST,
            format!("Request body exceeds {limit} bytes"),
        )
    })?;
    let value: serde_json::Value = serde_json::from_slice(&bytes)
        .map_err(|e| ApiError::bad_request(jsonrpc::PARSE_ERROR, format!("Parse error: {e}")))?;
    JsonRpcMessage::parse_batch(value)
        .map_err(|e| ApiError::bad_request(jsonrpc::INVALID_REQUEST, format!("Invalid request: {e}")))
}

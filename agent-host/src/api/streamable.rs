//! MCP Streamable-HTTP transport on `/mcp`, plus MCP over WebSocket on the
//! same path when the GET carries an upgrade

use axum::body::Body;
use axum::extract::ws::WebSocketUpgrade;
use axum::extract::{FromRequest, Query, Request, State};
use axum::http::{header, HeaderMap, HeaderName, HeaderValue, StatusCode};
use axum::response::sse::{KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use shared_types::jsonrpc;

use crate::agent::AgentMsg;
use crate::api::sse::{frame_events, read_messages};
use crate::api::websocket::run_socket;
use crate::api::{new_session_id, wake_mode, ApiError, ApiState, DisconnectGuard, SessionQuery};
use crate::connection::socket_channel;
use crate::host::WakeMode;
use crate::mcp::{McpTransportKind, SESSION_HEADER};

fn header_values(headers: &HeaderMap, name: HeaderName) -> String {
    headers
        .get_all(name)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .collect::<Vec<_>>()
        .join(",")
}

fn session_header(headers: &HeaderMap) -> Option<String> {
    headers
        .get(SESSION_HEADER)
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(ToString::to_string)
}

fn missing_session() -> ApiError {
    ApiError::bad_request(
        jsonrpc::TRANSPORT_ERROR,
        "Bad Request: mcp-session-id header is required",
    )
}

fn require_session(headers: &HeaderMap) -> Result<String, ApiError> {
    session_header(headers).ok_or_else(missing_session)
}

fn with_session_header(mut response: Response, session_id: &str) -> Response {
    if let Ok(value) = HeaderValue::from_str(session_id) {
        response
            .headers_mut()
            .insert(HeaderName::from_static(SESSION_HEADER), value);
    }
    response
}

fn is_websocket_upgrade(headers: &HeaderMap) -> bool {
    headers
        .get(header::UPGRADE)
        .and_then(|value| value.to_str().ok())
        .is_some_and(|value| value.eq_ignore_ascii_case("websocket"))
}

fn not_acceptable(message: &str) -> ApiError {
    ApiError::new(
        StatusCode::NOT_ACCEPTABLE,
        jsonrpc::TRANSPORT_ERROR,
        message.to_string(),
    )
}

pub async fn mcp_post(
    State(state): State<ApiState>,
    headers: HeaderMap,
    body: Body,
) -> Result<Response, ApiError> {
    let accept = header_values(&headers, header::ACCEPT);
    if !accept.contains("application/json") || !accept.contains("text/event-stream") {
        return Err(not_acceptable(
            "Not Acceptable: Client must accept both application/json and text/event-stream",
        ));
    }

    let content_type = header_values(&headers, header::CONTENT_TYPE);
    if !content_type.starts_with("application/json") {
        return Err(ApiError::new(
            StatusCode::UNSUPPORTED_MEDIA_TYPE,
            jsonrpc::TRANSPORT_ERROR,
            "Unsupported Media Type: Content-Type must be application/json",
        ));
    }

    let declared = headers
        .get(header::CONTENT_LENGTH)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.parse::<usize>().ok());
    if declared.is_some_and(|len| len > state.max_body_bytes) {
        return Err(ApiError::new(
            StatusCode::PAYLOAD_TOO_LARGE,
            jsonrpc::INVALID_REQUEST,
            format!("Request body exceeds {} bytes", state.max_body_bytes),
        ));
    }

    let messages = read_messages(body, state.max_body_bytes).await?;

    let initializations = messages.iter().filter(|m| m.is_initialize()).count();
    let session = session_header(&headers);
    if initializations > 1 {
        return Err(ApiError::bad_request(
            jsonrpc::INVALID_REQUEST,
            "Invalid Request: Only one initialization request is allowed",
        ));
    }
    if initializations == 1 && session.is_some() {
        return Err(ApiError::bad_request(
            jsonrpc::INVALID_REQUEST,
            "Invalid Request: Initialization requests must not include a session ID",
        ));
    }

    let creating = initializations == 1;
    let session_id = match session {
        Some(id) => id,
        None if creating => new_session_id(),
        None => return Err(missing_session()),
    };
    let agent = McpTransportKind::StreamableHttp.agent_name(&session_id);
    let (sender, frames) = socket_channel();

    let accepted = state
        .host
        .call(&agent, wake_mode(creating), |reply| AgentMsg::StreamablePost {
            messages: messages.clone(),
            sender: sender.clone(),
            reply,
        })
        .await??;

    let Some(connection_id) = accepted.connection_id else {
        return Ok(with_session_header(
            StatusCode::ACCEPTED.into_response(),
            &session_id,
        ));
    };

    tracing::debug!(session_id = %session_id, connection_id = %connection_id, "Streamable-HTTP response stream opened");
    let guard = DisconnectGuard::new(state.host.clone(), agent, connection_id);
    let response = Sse::new(frame_events(frames, guard, None)).into_response();
    Ok(with_session_header(response, &session_id))
}

pub async fn mcp_get(State(state): State<ApiState>, req: Request) -> Response {
    if is_websocket_upgrade(req.headers()) {
        return mcp_websocket(state, req).await;
    }
    match standalone_stream(state, req.headers()).await {
        Ok(response) => response,
        Err(e) => e.into_response(),
    }
}

/// The server-initiated message stream of a Streamable-HTTP session
async fn standalone_stream(state: ApiState, headers: &HeaderMap) -> Result<Response, ApiError> {
    if !header_values(headers, header::ACCEPT).contains("text/event-stream") {
        return Err(not_acceptable(
            "Not Acceptable: Client must accept text/event-stream",
        ));
    }
    let session_id = require_session(headers)?;
    let agent = McpTransportKind::StreamableHttp.agent_name(&session_id);
    let (sender, frames) = socket_channel();

    let connection_id = state
        .host
        .call(&agent, WakeMode::Existing, |reply| AgentMsg::StreamableGet {
            sender: sender.clone(),
            reply,
        })
        .await??;

    tracing::debug!(session_id = %session_id, connection_id = %connection_id, "Streamable-HTTP GET stream opened");
    let guard = DisconnectGuard::new(state.host.clone(), agent, connection_id);
    let response = Sse::new(frame_events(frames, guard, None))
        .keep_alive(KeepAlive::default())
        .into_response();
    Ok(with_session_header(response, &session_id))
}

async fn mcp_websocket(state: ApiState, req: Request) -> Response {
    let session_id = Query::<SessionQuery>::try_from_uri(req.uri())
        .ok()
        .and_then(|Query(query)| query.session_id)
        .filter(|id| !id.is_empty())
        .unwrap_or_else(new_session_id);

    let ws = match WebSocketUpgrade::from_request(req, &()).await {
        Ok(ws) => ws,
        Err(_) => return StatusCode::BAD_REQUEST.into_response(),
    };

    let host = state.host.clone();
    let agent = McpTransportKind::WebSocket.agent_name(&session_id);
    let response = ws.on_upgrade(move |socket| async move {
        let connection_id = uuid::Uuid::new_v4().to_string();
        let (sender, frames) = socket_channel();
        let connected = host
            .call(&agent, WakeMode::Create, |reply| AgentMsg::McpConnect {
                connection_id: connection_id.clone(),
                sender: sender.clone(),
                kind: McpTransportKind::WebSocket,
                reply,
            })
            .await;
        match connected {
            Ok(Ok(())) => run_socket(socket, host, agent, connection_id, frames).await,
            Ok(Err(e)) => tracing::warn!(agent = %agent, error = %e, "MCP WebSocket refused"),
            Err(e) => tracing::error!(agent = %agent, error = %e, "Failed to reach MCP agent"),
        }
    });
    with_session_header(response, &session_id)
}

/// Terminate a Streamable-HTTP session and delete its storage
pub async fn mcp_delete(
    State(state): State<ApiState>,
    headers: HeaderMap,
) -> Result<StatusCode, ApiError> {
    let session_id = require_session(&headers)?;
    let agent = McpTransportKind::StreamableHttp.agent_name(&session_id);
    if !state.host.exists(&agent).await {
        return Err(ApiError::session_not_found());
    }
    state.host.destroy(&agent).await?;
    tracing::info!(session_id = %session_id, "Streamable-HTTP session terminated");
    Ok(StatusCode::OK)
}

//! Agent WebSocket and JSON views

use axum::extract::ws::WebSocketUpgrade;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Deserialize;
use serde_json::json;
use shared_types::InboundEmail;

use crate::agent::{AgentError, AgentMsg};
use crate::api::websocket::run_socket;
use crate::api::ApiState;
use crate::connection::{prepare_tags, socket_channel};
use crate::host::{HostError, WakeMode};
use crate::storage::ScheduleFilter;

#[derive(Debug, Deserialize)]
pub struct ConnectQuery {
    /// Comma separated connection tags
    pub tags: Option<String>,
    /// Client-chosen connection id
    pub id: Option<String>,
}

fn error_response(status: StatusCode, message: impl Into<String>) -> Response {
    (status, Json(json!({ "error": message.into() }))).into_response()
}

fn host_error(err: HostError) -> Response {
    match err {
        HostError::NotFound(_) => error_response(StatusCode::NOT_FOUND, "Agent not found"),
        HostError::Agent(AgentError::Unsupported(reason)) => {
            error_response(StatusCode::NOT_IMPLEMENTED, reason)
        }
        other => error_response(StatusCode::INTERNAL_SERVER_ERROR, other.to_string()),
    }
}

pub async fn agent_websocket(
    ws: WebSocketUpgrade,
    Path(name): Path<String>,
    Query(query): Query<ConnectQuery>,
    State(state): State<ApiState>,
) -> Response {
    let connection_id = query
        .id
        .filter(|id| !id.is_empty())
        .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
    let tags: Vec<String> = query
        .tags
        .as_deref()
        .map(|raw| {
            raw.split(',')
                .map(str::trim)
                .filter(|tag| !tag.is_empty())
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default();

    if let Err(e) = prepare_tags(&connection_id, &tags) {
        return error_response(StatusCode::BAD_REQUEST, e.to_string());
    }

    let host = state.host.clone();
    ws.on_upgrade(move |socket| async move {
        let (sender, outbound) = socket_channel();
        let accepted = host
            .call(&name, WakeMode::Create, |reply| AgentMsg::Connect {
                connection_id: connection_id.clone(),
                sender: sender.clone(),
                tags: tags.clone(),
                reply,
            })
            .await;
        match accepted {
            Ok(Ok(())) => run_socket(socket, host, name, connection_id, outbound).await,
            Ok(Err(e)) => {
                tracing::warn!(agent = %name, connection_id = %connection_id, error = %e, "Agent refused connection");
            }
            Err(e) => {
                tracing::error!(agent = %name, connection_id = %connection_id, error = %e, "Failed to reach agent");
            }
        }
    })
}

pub async fn get_state(Path(name): Path<String>, State(state): State<ApiState>) -> Response {
    match state
        .host
        .call(&name, WakeMode::Existing, |reply| AgentMsg::GetState { reply })
        .await
    {
        Ok(Ok(value)) => Json(json!({ "name": name, "state": value })).into_response(),
        Ok(Err(e)) => host_error(e.into()),
        Err(e) => host_error(e),
    }
}

pub async fn list_schedules(
    Path(name): Path<String>,
    Query(filter): Query<ScheduleFilter>,
    State(state): State<ApiState>,
) -> Response {
    match state
        .host
        .call(&name, WakeMode::Existing, |reply| AgentMsg::ListSchedules {
            filter: filter.clone(),
            reply,
        })
        .await
    {
        Ok(Ok(tasks)) => Json(json!({ "name": name, "schedules": tasks })).into_response(),
        Ok(Err(e)) => host_error(e.into()),
        Err(e) => host_error(e),
    }
}

pub async fn deliver_email(
    Path(name): Path<String>,
    State(state): State<ApiState>,
    Json(email): Json<InboundEmail>,
) -> Response {
    tracing::info!(agent = %name, from = %email.from, "Inbound email");
    match state
        .host
        .call(&name, WakeMode::Create, |reply| AgentMsg::Email {
            email: email.clone(),
            reply,
        })
        .await
    {
        Ok(Ok(())) => StatusCode::ACCEPTED.into_response(),
        Ok(Err(e)) => host_error(e.into()),
        Err(e) => host_error(e),
    }
}

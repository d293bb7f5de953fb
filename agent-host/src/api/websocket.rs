//! Socket pump shared by agent and MCP WebSockets
//!
//! Frames queued by the agent are written by a dedicated task; inbound text
//! frames are cast to the agent in arrival order.

use axum::extract::ws::{CloseFrame, Message, WebSocket};
use futures_util::{SinkExt, StreamExt};

use crate::agent::AgentMsg;
use crate::connection::{SocketFrame, SocketReceiver};
use crate::host::{AgentHost, WakeMode};

/// Close code for a socket that vanished without a close frame
const CLOSE_ABNORMAL: u16 = 1006;
/// Close code for a close frame without a status
const CLOSE_NO_STATUS: u16 = 1005;

pub(crate) async fn run_socket(
    socket: WebSocket,
    host: AgentHost,
    agent: String,
    connection_id: String,
    mut outbound: SocketReceiver,
) {
    let (mut sender, mut receiver) = socket.split();

    let mut writer = tokio::spawn(async move {
        while let Some(frame) = outbound.recv().await {
            match frame {
                SocketFrame::Text(text) => {
                    if sender.send(Message::Text(text.into())).await.is_err() {
                        break;
                    }
                }
                SocketFrame::Close { code, reason } => {
                    let _ = sender
                        .send(Message::Close(Some(CloseFrame {
                            code,
                            reason: reason.into(),
                        })))
                        .await;
                    break;
                }
            }
        }
    });

    let reader = async {
        loop {
            match receiver.next().await {
                Some(Ok(Message::Text(text))) => {
                    let message = AgentMsg::Message {
                        connection_id: connection_id.clone(),
                        text: text.to_string(),
                    };
                    if let Err(e) = host.cast(&agent, WakeMode::Create, message).await {
                        tracing::warn!(agent = %agent, connection_id = %connection_id, error = %e, "Failed to deliver message");
                    }
                }
                Some(Ok(Message::Close(frame))) => {
                    break frame
                        .map(|f| (f.code, f.reason.to_string()))
                        .unwrap_or((CLOSE_NO_STATUS, String::new()));
                }
                Some(Ok(Message::Binary(_))) => {
                    tracing::debug!(agent = %agent, connection_id = %connection_id, "Ignoring binary frame");
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    tracing::debug!(agent = %agent, connection_id = %connection_id, error = %e, "WebSocket read failed");
                    break (CLOSE_ABNORMAL, e.to_string());
                }
                None => break (CLOSE_ABNORMAL, String::new()),
            }
        }
    };

    tokio::select! {
        (code, reason) = reader => {
            writer.abort();
            tracing::debug!(agent = %agent, connection_id = %connection_id, code, "WebSocket closed by client");
            host.disconnect(&agent, &connection_id, code, reason).await;
        }
        _ = &mut writer => {
            tracing::debug!(agent = %agent, connection_id = %connection_id, "WebSocket closed by agent");
        }
    }
}

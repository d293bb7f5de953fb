//! AgentActor - one ractor actor per agent identity
//!
//! The actor owns the agent's storage handle, scheduler, connection registry,
//! behaviour and (optionally) its MCP bridge. ractor processes one message at
//! a time, so everything an agent does is serialized per identity without
//! locks.
//!
//! Bootstrap (`Zero -> Starting -> Started`) runs entirely inside
//! `pre_start`. ractor does not hand out the actor reference until
//! `pre_start` returns, so no message can observe a half-started agent.

use super::callable::StreamingResponse;
use super::context::AgentContext;
use super::{AgentBehavior, AgentClass, AgentError, MethodRegistry};
use crate::connection::{Connection, ConnectionRegistry, SocketSender, CLOSE_NORMAL};
use crate::mcp::{
    McpBridge, McpError, McpTransportKind, MCP_GET_TAG, MCP_SSE_TAG, MCP_STREAMABLE_TAG,
    MCP_TAG, MCP_WS_TAG,
};
use crate::scheduler::{Alarm, Schedule, Scheduler, TaskRunner};
use crate::storage::{AgentStorage, ScheduleFilter};
use async_trait::async_trait;
use ractor::{Actor, ActorProcessingErr, ActorRef, RpcReplyPort};
use serde_json::Value;
use shared_types::jsonrpc::{self, JsonRpcErrorResponse, JsonRpcMessage};
use shared_types::{AgentInbound, AgentOutbound, InboundEmail, RequestId, RpcReply, ScheduledTask};
use std::sync::Arc;

/// Actor that hosts one agent instance
#[derive(Debug, Default)]
pub struct AgentActor;

/// Arguments for spawning AgentActor
pub struct AgentArguments {
    /// Name the agent is addressed by
    pub name: String,
    pub class: AgentClass,
    pub storage: AgentStorage,
    pub registry: Box<dyn ConnectionRegistry>,
    pub alarm: Arc<dyn Alarm>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lifecycle {
    /// Constructed, storage untouched
    Zero,
    /// Running the bootstrap hook
    Starting,
    /// Serving
    Started,
}

impl Lifecycle {
    pub fn can_transition_to(&self, next: Lifecycle) -> bool {
        matches!(
            (self, next),
            (Lifecycle::Zero, Lifecycle::Starting) | (Lifecycle::Starting, Lifecycle::Started)
        )
    }
}

/// Result of a Streamable-HTTP POST. `connection_id` names the response
/// stream, `None` means nothing will be streamed back.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamableAccepted {
    pub connection_id: Option<String>,
}

// ============================================================================
// Messages
// ============================================================================

#[derive(Debug)]
pub enum AgentMsg {
    /// Register an agent-protocol connection
    Connect {
        connection_id: String,
        sender: SocketSender,
        tags: Vec<String>,
        reply: RpcReplyPort<Result<(), AgentError>>,
    },
    /// Text frame from a connection
    Message { connection_id: String, text: String },
    Close {
        connection_id: String,
        code: u16,
        reason: String,
    },
    /// The agent's alarm fired
    Alarm,
    GetState {
        reply: RpcReplyPort<Result<Option<Value>, AgentError>>,
    },
    SetState {
        state: Value,
        reply: RpcReplyPort<Result<(), AgentError>>,
    },
    Schedule {
        when: Schedule,
        callback: String,
        payload: Value,
        reply: RpcReplyPort<Result<ScheduledTask, AgentError>>,
    },
    CancelSchedule {
        id: String,
        reply: RpcReplyPort<Result<bool, AgentError>>,
    },
    ListSchedules {
        filter: ScheduleFilter,
        reply: RpcReplyPort<Result<Vec<ScheduledTask>, AgentError>>,
    },
    ConnectionCount {
        reply: RpcReplyPort<usize>,
    },
    Email {
        email: InboundEmail,
        reply: RpcReplyPort<Result<(), AgentError>>,
    },
    /// Open the single SSE or WebSocket connection of an MCP session
    McpConnect {
        connection_id: String,
        sender: SocketSender,
        kind: McpTransportKind,
        reply: RpcReplyPort<Result<(), McpError>>,
    },
    /// Client messages for an SSE session (the POST side)
    McpMessage {
        kind: McpTransportKind,
        messages: Vec<JsonRpcMessage>,
        reply: RpcReplyPort<Result<(), McpError>>,
    },
    /// A validated Streamable-HTTP POST body
    StreamablePost {
        messages: Vec<JsonRpcMessage>,
        sender: SocketSender,
        reply: RpcReplyPort<Result<StreamableAccepted, McpError>>,
    },
    /// The Streamable-HTTP standalone GET stream
    StreamableGet {
        sender: SocketSender,
        reply: RpcReplyPort<Result<String, McpError>>,
    },
}

// ============================================================================
// State
// ============================================================================

pub struct AgentRuntime {
    name: String,
    storage: AgentStorage,
    scheduler: Scheduler,
    connections: Box<dyn ConnectionRegistry>,
    behavior: Box<dyn AgentBehavior>,
    methods: Arc<MethodRegistry>,
    initial_state: Option<Value>,
    mcp: Option<McpBridge>,
    lifecycle: Lifecycle,
}

impl AgentRuntime {
    pub fn lifecycle(&self) -> Lifecycle {
        self.lifecycle
    }

    fn transition(&mut self, next: Lifecycle) -> Result<(), ActorProcessingErr> {
        if !self.lifecycle.can_transition_to(next) {
            return Err(ActorProcessingErr::from(format!(
                "Invalid lifecycle transition {:?} -> {:?}",
                self.lifecycle, next
            )));
        }
        self.lifecycle = next;
        Ok(())
    }

    /// Split borrows: the behaviour, the bridge and a context over the rest.
    fn parts(&mut self) -> (&mut dyn AgentBehavior, &mut Option<McpBridge>, AgentContext<'_>) {
        let ctx = AgentContext::new(
            &self.name,
            &self.storage,
            &self.scheduler,
            self.connections.as_mut(),
            &self.initial_state,
        );
        (self.behavior.as_mut(), &mut self.mcp, ctx)
    }

    async fn bootstrap(&mut self) -> Result<(), ActorProcessingErr> {
        let (behavior, mcp, mut ctx) = self.parts();

        if let Some(server) = behavior.mcp_server() {
            let bridge = McpBridge::start(server, &mut ctx)
                .await
                .map_err(ActorProcessingErr::from)?;
            *mcp = Some(bridge);
        }

        let result = behavior.on_start(&mut ctx).await;
        flush_state_updates(behavior, &mut ctx);
        escalate(behavior, None, result)?;

        self.scheduler
            .rearm()
            .await
            .map_err(ActorProcessingErr::from)?;
        Ok(())
    }

    // ------------------------------------------------------------------------
    // Agent protocol
    // ------------------------------------------------------------------------

    async fn connect(
        &mut self,
        connection_id: String,
        sender: SocketSender,
        tags: Vec<String>,
        reply: RpcReplyPort<Result<(), AgentError>>,
    ) -> Result<(), ActorProcessingErr> {
        let conn = match self.connections.accept(connection_id, sender, &tags) {
            Ok(conn) => conn,
            Err(e) => {
                let _ = reply.send(Err(e.into()));
                return Ok(());
            }
        };

        let (behavior, _, mut ctx) = self.parts();
        if let Err(e) = greet(&mut ctx, &conn).await {
            let _ = reply.send(Err(e));
            return Ok(());
        }
        let _ = reply.send(Ok(()));

        tracing::info!(agent = %ctx.name(), connection_id = %conn.id(), "Connection accepted");

        let result = behavior.on_connect(&mut ctx, &conn).await;
        flush_state_updates(behavior, &mut ctx);
        escalate(behavior, Some(conn.id()), result)
    }

    async fn message(&mut self, connection_id: String, text: String) -> Result<(), ActorProcessingErr> {
        let conn = match self.connections.get_connection(&connection_id)? {
            Some(conn) => conn,
            None => {
                tracing::warn!(agent = %self.name, connection_id = %connection_id, "Message for unknown connection");
                return Ok(());
            }
        };

        if conn.has_tag(MCP_WS_TAG) {
            return self.mcp_ws_message(&conn, text).await;
        }

        match serde_json::from_str::<AgentInbound>(&text) {
            Ok(AgentInbound::Rpc { id, method, args }) => {
                self.invoke_callable(&conn, id, method, args).await
            }
            Ok(AgentInbound::StateUpdate { state }) => {
                let (behavior, _, mut ctx) = self.parts();
                let result = ctx.set_state_from(state, Some(conn.id())).await;
                flush_state_updates(behavior, &mut ctx);
                escalate(behavior, Some(conn.id()), result)
            }
            Err(_) => {
                let (behavior, _, mut ctx) = self.parts();
                let result = behavior.on_message(&mut ctx, &conn, text).await;
                flush_state_updates(behavior, &mut ctx);
                escalate(behavior, Some(conn.id()), result)
            }
        }
    }

    /// Errors from callables always become a correlated error reply.
    async fn invoke_callable(
        &mut self,
        conn: &Connection,
        id: RequestId,
        method: String,
        args: Vec<Value>,
    ) -> Result<(), ActorProcessingErr> {
        let spec = match self.methods.get(&method) {
            Some(spec) if spec.callable => *spec,
            _ => {
                let error = AgentError::NotCallable(method);
                send_reply(conn, RpcReply::err(id, error.to_string()));
                return Ok(());
            }
        };

        let (behavior, _, mut ctx) = self.parts();
        if spec.streaming {
            let mut stream = StreamingResponse::new(id.clone(), conn.sender());
            let result = behavior
                .invoke(&mut ctx, &method, args, Some(&mut stream))
                .await;
            match result {
                Ok(value) if !stream.is_closed() => {
                    if let Err(e) = stream.end(value) {
                        tracing::warn!(connection_id = %conn.id(), error = %e, "Could not end stream");
                    }
                }
                Ok(_) => {}
                Err(e) if !stream.is_closed() => send_reply(conn, RpcReply::err(id, e.to_string())),
                Err(e) => {
                    tracing::warn!(method = %method, error = %e, "Streaming method failed after end");
                }
            }
        } else {
            let reply = match behavior.invoke(&mut ctx, &method, args, None).await {
                Ok(value) => RpcReply::ok(id, value, true),
                Err(e) => {
                    tracing::debug!(method = %method, error = %e, "Callable failed");
                    RpcReply::err(id, e.to_string())
                }
            };
            send_reply(conn, reply);
        }

        flush_state_updates(behavior, &mut ctx);
        Ok(())
    }

    async fn close(&mut self, connection_id: String, code: u16, reason: String) -> Result<(), ActorProcessingErr> {
        let removed = self.connections.remove(&connection_id);
        if let Some(bridge) = self.mcp.as_mut() {
            bridge.on_close(&connection_id);
        }

        let Some(conn) = removed else {
            return Ok(());
        };
        tracing::info!(agent = %self.name, connection_id = %connection_id, code, "Connection closed");
        if conn.has_tag(MCP_TAG) {
            return Ok(());
        }

        let (behavior, _, mut ctx) = self.parts();
        let result = behavior.on_close(&mut ctx, &connection_id, code, &reason).await;
        flush_state_updates(behavior, &mut ctx);
        escalate(behavior, Some(&connection_id), result)
    }

    async fn alarm(&mut self) -> Result<(), ActorProcessingErr> {
        let now = chrono::Utc::now().timestamp();
        let (behavior, _, mut ctx) = self.parts();
        let scheduler = ctx.scheduler;

        let mut runner = CallbackRunner {
            behavior: &mut *behavior,
            ctx: &mut ctx,
        };
        let result = scheduler.on_alarm(now, &mut runner).await;
        flush_state_updates(behavior, &mut ctx);

        match result {
            Ok(ran) => {
                tracing::debug!(agent = %ctx.name(), ran, "Alarm handled");
                Ok(())
            }
            Err(e) => escalate(behavior, None, Err(e.into())),
        }
    }

    async fn email(&mut self, email: InboundEmail) -> Result<(), AgentError> {
        let (behavior, _, mut ctx) = self.parts();
        let result = behavior.on_email(&mut ctx, email).await;
        flush_state_updates(behavior, &mut ctx);
        result
    }

    // ------------------------------------------------------------------------
    // MCP
    // ------------------------------------------------------------------------

    async fn mcp_connect(
        &mut self,
        connection_id: String,
        sender: SocketSender,
        kind: McpTransportKind,
    ) -> Result<(), McpError> {
        let bridge = self.mcp.as_mut().ok_or(McpError::NotSupported)?;
        bridge.establish(&self.storage, kind).await?;

        let tag = transport_tag(kind);
        for old in self.connections.get_connections(Some(tag))? {
            old.close(CLOSE_NORMAL, "replaced by a new connection");
            self.connections.remove(old.id());
        }
        self.connections
            .accept(connection_id, sender, &[MCP_TAG.to_string(), tag.to_string()])?;
        Ok(())
    }

    async fn mcp_ws_message(&mut self, conn: &Connection, text: String) -> Result<(), ActorProcessingErr> {
        let messages = match serde_json::from_str::<Value>(&text) {
            Ok(value) => match JsonRpcMessage::parse_batch(value) {
                Ok(messages) => messages,
                Err(e) => {
                    send_error(conn, jsonrpc::INVALID_REQUEST, e.to_string());
                    return Ok(());
                }
            },
            Err(e) => {
                send_error(conn, jsonrpc::PARSE_ERROR, e.to_string());
                return Ok(());
            }
        };

        let (behavior, mcp, mut ctx) = self.parts();
        let Some(bridge) = mcp.as_mut() else {
            send_error(conn, jsonrpc::METHOD_NOT_FOUND, McpError::NotSupported.to_string());
            return Ok(());
        };
        if let Err(e) = bridge.deliver(&mut ctx, None, messages).await {
            tracing::warn!(connection_id = %conn.id(), error = %e, "MCP delivery failed");
            send_error(conn, e.code(), e.to_string());
        }
        flush_state_updates(behavior, &mut ctx);
        Ok(())
    }

    async fn mcp_message(
        &mut self,
        kind: McpTransportKind,
        messages: Vec<JsonRpcMessage>,
    ) -> Result<(), McpError> {
        let (behavior, mcp, mut ctx) = self.parts();
        let bridge = mcp.as_mut().ok_or(McpError::NotSupported)?;
        match bridge.kind() {
            Some(existing) if existing == kind => {}
            Some(existing) => {
                return Err(McpError::TransportMismatch {
                    expected: existing,
                    actual: kind,
                })
            }
            None => return Err(McpError::SessionNotFound),
        }

        let result = bridge.deliver(&mut ctx, None, messages).await;
        flush_state_updates(behavior, &mut ctx);
        result
    }

    async fn streamable_post(
        &mut self,
        messages: Vec<JsonRpcMessage>,
        sender: SocketSender,
    ) -> Result<StreamableAccepted, McpError> {
        let (behavior, mcp, mut ctx) = self.parts();
        let bridge = mcp.as_mut().ok_or(McpError::NotSupported)?;

        if messages.iter().any(JsonRpcMessage::is_initialize) {
            bridge
                .establish(ctx.storage(), McpTransportKind::StreamableHttp)
                .await?;
        } else if bridge.kind() != Some(McpTransportKind::StreamableHttp)
            || !bridge.is_initialized()
        {
            return Err(McpError::SessionNotFound);
        }

        let connection_id = if messages.iter().any(JsonRpcMessage::is_request) {
            let id = uuid::Uuid::new_v4().to_string();
            ctx.connections.accept(
                id.clone(),
                sender,
                &[MCP_TAG.to_string(), MCP_STREAMABLE_TAG.to_string()],
            )?;
            Some(id)
        } else {
            None
        };

        let result = bridge
            .deliver(&mut ctx, connection_id.as_deref(), messages)
            .await;
        flush_state_updates(behavior, &mut ctx);
        result?;
        Ok(StreamableAccepted { connection_id })
    }

    async fn streamable_get(&mut self, sender: SocketSender) -> Result<String, McpError> {
        let bridge = self.mcp.as_ref().ok_or(McpError::NotSupported)?;
        if bridge.kind() != Some(McpTransportKind::StreamableHttp) || !bridge.is_initialized() {
            return Err(McpError::SessionNotFound);
        }
        if !self.connections.get_connections(Some(MCP_GET_TAG))?.is_empty() {
            return Err(McpError::GetStreamExists);
        }

        let id = uuid::Uuid::new_v4().to_string();
        self.connections
            .accept(id.clone(), sender, &[MCP_TAG.to_string(), MCP_GET_TAG.to_string()])?;
        Ok(id)
    }
}

fn transport_tag(kind: McpTransportKind) -> &'static str {
    match kind {
        McpTransportKind::Sse => MCP_SSE_TAG,
        McpTransportKind::WebSocket => MCP_WS_TAG,
        McpTransportKind::StreamableHttp => MCP_STREAMABLE_TAG,
    }
}

/// Push current state and the MCP server list to a new connection.
async fn greet(ctx: &mut AgentContext<'_>, conn: &Connection) -> Result<(), AgentError> {
    if let Some(state) = ctx.state().await? {
        conn.send_json(&AgentOutbound::State { state })?;
    }
    let servers = ctx.mcp_servers().await?;
    conn.send_json(&AgentOutbound::McpServers { servers })?;
    Ok(())
}

fn send_reply(conn: &Connection, reply: RpcReply) {
    if let Err(e) = conn.send_json(&AgentOutbound::Rpc(reply)) {
        tracing::warn!(connection_id = %conn.id(), error = %e, "RPC reply dropped");
    }
}

fn send_error(conn: &Connection, code: i64, message: String) {
    if let Err(e) = conn.send_json(&JsonRpcErrorResponse::new(None, code, message)) {
        tracing::warn!(connection_id = %conn.id(), error = %e, "MCP error dropped");
    }
}

fn flush_state_updates(behavior: &mut dyn AgentBehavior, ctx: &mut AgentContext<'_>) {
    for update in std::mem::take(&mut ctx.state_updates) {
        behavior.on_state_update(&update.state, update.source.as_deref());
    }
}

/// Route a hook error through `on_error`. An error it re-raises fails the actor.
fn escalate(
    behavior: &mut dyn AgentBehavior,
    connection_id: Option<&str>,
    result: Result<(), AgentError>,
) -> Result<(), ActorProcessingErr> {
    match result {
        Ok(()) => Ok(()),
        Err(e) => behavior
            .on_error(connection_id, e)
            .map_err(ActorProcessingErr::from),
    }
}

/// Runs scheduled callbacks through the behaviour's method dispatch
struct CallbackRunner<'r, 'a> {
    behavior: &'r mut dyn AgentBehavior,
    ctx: &'r mut AgentContext<'a>,
}

#[async_trait]
impl<'r, 'a> TaskRunner for CallbackRunner<'r, 'a> {
    async fn run(&mut self, task: &ScheduledTask) -> Result<(), String> {
        self.behavior
            .invoke(&mut *self.ctx, &task.callback, vec![task.payload.clone()], None)
            .await
            .map(|_| ())
            .map_err(|e| e.to_string())
    }
}

// ============================================================================
// Actor
// ============================================================================

#[async_trait]
impl Actor for AgentActor {
    type Msg = AgentMsg;
    type State = AgentRuntime;
    type Arguments = AgentArguments;

    async fn pre_start(
        &self,
        myself: ActorRef<Self::Msg>,
        args: Self::Arguments,
    ) -> Result<Self::State, ActorProcessingErr> {
        let AgentArguments {
            name,
            class,
            storage,
            registry,
            alarm,
        } = args;

        tracing::info!(
            actor_id = %myself.get_id(),
            agent = %name,
            class = %class.name(),
            strategy = ?registry.strategy(),
            "AgentActor starting"
        );

        let scheduler = Scheduler::new(storage.clone(), alarm, class.methods().clone());
        let behavior = class.create();
        let initial_state = behavior.initial_state();

        let mut runtime = AgentRuntime {
            name,
            storage,
            scheduler,
            connections: registry,
            behavior,
            methods: class.methods().clone(),
            initial_state,
            mcp: None,
            lifecycle: Lifecycle::Zero,
        };

        runtime.transition(Lifecycle::Starting)?;
        runtime.bootstrap().await?;
        runtime.transition(Lifecycle::Started)?;
        Ok(runtime)
    }

    async fn handle(
        &self,
        _myself: ActorRef<Self::Msg>,
        message: Self::Msg,
        state: &mut Self::State,
    ) -> Result<(), ActorProcessingErr> {
        match message {
            AgentMsg::Connect {
                connection_id,
                sender,
                tags,
                reply,
            } => state.connect(connection_id, sender, tags, reply).await?,
            AgentMsg::Message {
                connection_id,
                text,
            } => state.message(connection_id, text).await?,
            AgentMsg::Close {
                connection_id,
                code,
                reason,
            } => state.close(connection_id, code, reason).await?,
            AgentMsg::Alarm => state.alarm().await?,
            AgentMsg::GetState { reply } => {
                let (_, _, mut ctx) = state.parts();
                let _ = reply.send(ctx.state().await);
            }
            AgentMsg::SetState { state: value, reply } => {
                let (behavior, _, mut ctx) = state.parts();
                let result = ctx.set_state(value).await;
                flush_state_updates(behavior, &mut ctx);
                let _ = reply.send(result);
            }
            AgentMsg::Schedule {
                when,
                callback,
                payload,
                reply,
            } => {
                let result = state.scheduler.schedule(when, &callback, payload).await;
                let _ = reply.send(result.map_err(AgentError::from));
            }
            AgentMsg::CancelSchedule { id, reply } => {
                let result = state.scheduler.cancel(&id).await;
                let _ = reply.send(result.map_err(AgentError::from));
            }
            AgentMsg::ListSchedules { filter, reply } => {
                let result = state.scheduler.list(&filter).await;
                let _ = reply.send(result.map_err(AgentError::from));
            }
            AgentMsg::ConnectionCount { reply } => {
                let _ = reply.send(state.connections.count());
            }
            AgentMsg::Email { email, reply } => {
                let _ = reply.send(state.email(email).await);
            }
            AgentMsg::McpConnect {
                connection_id,
                sender,
                kind,
                reply,
            } => {
                let _ = reply.send(state.mcp_connect(connection_id, sender, kind).await);
            }
            AgentMsg::McpMessage {
                kind,
                messages,
                reply,
            } => {
                let _ = reply.send(state.mcp_message(kind, messages).await);
            }
            AgentMsg::StreamablePost {
                messages,
                sender,
                reply,
            } => {
                let _ = reply.send(state.streamable_post(messages, sender).await);
            }
            AgentMsg::StreamableGet { sender, reply } => {
                let _ = reply.send(state.streamable_get(sender).await);
            }
        }
        Ok(())
    }

    async fn post_stop(
        &self,
        myself: ActorRef<Self::Msg>,
        state: &mut Self::State,
    ) -> Result<(), ActorProcessingErr> {
        state.connections.shutdown();
        if !state.storage.is_in_memory() {
            state.storage.close().await;
        }
        tracing::info!(
            actor_id = %myself.get_id(),
            agent = %state.name,
            "AgentActor stopped"
        );
        Ok(())
    }
}

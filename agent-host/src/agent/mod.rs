//! Agents - durable, single-threaded actors with user-supplied behaviour
//!
//! An agent class is a behaviour factory plus a static [`MethodRegistry`].
//! The framework runs a fixed pipeline around the behaviour's hooks:
//! parse → dispatch → persist → broadcast. Behaviours never see the actor
//! itself, only an [`AgentContext`] scoped to the current event.

pub mod actor;
pub mod callable;
pub mod context;

pub use actor::{AgentActor, AgentArguments, AgentMsg, Lifecycle, StreamableAccepted};
pub use callable::{MethodRegistry, MethodSpec, StreamingResponse};
pub use context::AgentContext;

use crate::connection::{Connection, ConnectionError, ConnectionStrategy};
use crate::mcp::ProtocolServer;
use crate::scheduler::ScheduleError;
use crate::storage::StorageError;
use async_trait::async_trait;
use serde_json::Value;
use shared_types::InboundEmail;
use std::sync::Arc;

#[derive(Debug, Clone, thiserror::Error)]
pub enum AgentError {
    #[error("Method {0} is not callable")]
    NotCallable(String),

    #[error("Invalid arguments: {0}")]
    InvalidArguments(String),

    #[error("{0}")]
    Failed(String),

    #[error("Stream {0} is already closed")]
    StreamClosed(String),

    #[error("{0} is not supported by this agent")]
    Unsupported(String),

    #[error(transparent)]
    Schedule(#[from] ScheduleError),

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error(transparent)]
    Connection(#[from] ConnectionError),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl From<serde_json::Error> for AgentError {
    fn from(e: serde_json::Error) -> Self {
        AgentError::Serialization(e.to_string())
    }
}

/// Hooks an agent class implements. Every hook has a default.
#[async_trait]
pub trait AgentBehavior: Send + Sync + 'static {
    /// State returned (and persisted) when nothing was ever set
    fn initial_state(&self) -> Option<Value> {
        None
    }

    /// Protocol server bridged to the MCP transports, if this class speaks MCP
    fn mcp_server(&self) -> Option<Box<dyn ProtocolServer>> {
        None
    }

    /// Runs once per activation, before any other event is processed.
    async fn on_start(&mut self, _ctx: &mut AgentContext<'_>) -> Result<(), AgentError> {
        Ok(())
    }

    async fn on_connect(
        &mut self,
        _ctx: &mut AgentContext<'_>,
        _conn: &Connection,
    ) -> Result<(), AgentError> {
        Ok(())
    }

    /// Messages that are not part of the RPC sub-protocol
    async fn on_message(
        &mut self,
        _ctx: &mut AgentContext<'_>,
        _conn: &Connection,
        _message: String,
    ) -> Result<(), AgentError> {
        Ok(())
    }

    async fn on_close(
        &mut self,
        _ctx: &mut AgentContext<'_>,
        _connection_id: &str,
        _code: u16,
        _reason: &str,
    ) -> Result<(), AgentError> {
        Ok(())
    }

    /// Called after state is persisted and broadcast. `source` is the
    /// connection that sent the update, `None` for server-side updates.
    fn on_state_update(&mut self, _state: &Value, _source: Option<&str>) {}

    /// Errors from hooks land here. Returning the error fails the actor.
    fn on_error(&mut self, connection_id: Option<&str>, error: AgentError) -> Result<(), AgentError> {
        tracing::error!(
            connection_id = connection_id.unwrap_or("-"),
            error = %error,
            "Unhandled agent error"
        );
        Err(error)
    }

    async fn on_email(
        &mut self,
        _ctx: &mut AgentContext<'_>,
        _email: InboundEmail,
    ) -> Result<(), AgentError> {
        Err(AgentError::Unsupported("email".to_string()))
    }

    /// Dispatch a registered method by name. Used for RPC calls and for
    /// scheduled callbacks (which receive the payload as the only argument).
    async fn invoke(
        &mut self,
        _ctx: &mut AgentContext<'_>,
        method: &str,
        _args: Vec<Value>,
        _stream: Option<&mut StreamingResponse>,
    ) -> Result<Value, AgentError> {
        Err(AgentError::NotCallable(method.to_string()))
    }
}

type BehaviorFactory = dyn Fn() -> Box<dyn AgentBehavior> + Send + Sync;

/// A registered agent type
#[derive(Clone)]
pub struct AgentClass {
    name: String,
    methods: Arc<MethodRegistry>,
    strategy: ConnectionStrategy,
    factory: Arc<BehaviorFactory>,
}

impl AgentClass {
    pub fn new<F>(
        name: impl Into<String>,
        methods: MethodRegistry,
        strategy: ConnectionStrategy,
        factory: F,
    ) -> Self
    where
        F: Fn() -> Box<dyn AgentBehavior> + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            methods: Arc::new(methods),
            strategy,
            factory: Arc::new(factory),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn methods(&self) -> &Arc<MethodRegistry> {
        &self.methods
    }

    pub fn strategy(&self) -> ConnectionStrategy {
        self.strategy
    }

    pub fn create(&self) -> Box<dyn AgentBehavior> {
        (self.factory)()
    }
}

impl std::fmt::Debug for AgentClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AgentClass")
            .field("name", &self.name)
            .field("strategy", &self.strategy)
            .finish()
    }
}

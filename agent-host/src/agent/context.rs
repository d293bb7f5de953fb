//! AgentContext - the handle hooks, callables and tools act through

use super::AgentError;
use crate::connection::{Connection, ConnectionError, ConnectionRegistry};
use crate::mcp::MCP_TAG;
use crate::scheduler::{Schedule, Scheduler};
use crate::storage::{AgentStorage, ScheduleFilter};
use serde_json::Value;
use shared_types::{AgentOutbound, McpServerInfo, ScheduledTask};

/// A state change waiting for the behaviour's `on_state_update` hook
#[derive(Debug, Clone)]
pub(crate) struct PendingStateUpdate {
    pub state: Value,
    pub source: Option<String>,
}

pub struct AgentContext<'a> {
    pub(crate) name: &'a str,
    pub(crate) storage: &'a AgentStorage,
    pub(crate) scheduler: &'a Scheduler,
    pub(crate) connections: &'a mut dyn ConnectionRegistry,
    pub(crate) initial_state: &'a Option<Value>,
    pub(crate) state_updates: Vec<PendingStateUpdate>,
}

impl<'a> AgentContext<'a> {
    pub(crate) fn new(
        name: &'a str,
        storage: &'a AgentStorage,
        scheduler: &'a Scheduler,
        connections: &'a mut dyn ConnectionRegistry,
        initial_state: &'a Option<Value>,
    ) -> Self {
        Self {
            name,
            storage,
            scheduler,
            connections,
            initial_state,
            state_updates: Vec::new(),
        }
    }

    /// Name the agent was addressed by
    pub fn name(&self) -> &str {
        self.name
    }

    pub fn storage(&self) -> &AgentStorage {
        self.storage
    }

    // ========================================================================
    // State
    // ========================================================================

    /// Current state. When state was never set the initial state is
    /// persisted and returned, without broadcasting.
    pub async fn state(&mut self) -> Result<Option<Value>, AgentError> {
        if let Some(state) = self.storage.load_state().await? {
            return Ok(Some(state));
        }
        match self.initial_state {
            Some(initial) => {
                self.storage.save_state(initial).await?;
                Ok(Some(initial.clone()))
            }
            None => Ok(None),
        }
    }

    /// Persist and broadcast a server-side state change.
    pub async fn set_state(&mut self, state: Value) -> Result<(), AgentError> {
        self.set_state_from(state, None).await
    }

    /// Persist `state`, broadcast it to every agent connection except
    /// `source`, and queue the `on_state_update` hook.
    ///
    /// The hook runs after the current handler returns, once per change and
    /// in order, so it always observes the state already persisted.
    pub(crate) async fn set_state_from(
        &mut self,
        state: Value,
        source: Option<&str>,
    ) -> Result<(), AgentError> {
        self.storage.save_state(&state).await?;

        let message = serde_json::to_string(&AgentOutbound::State {
            state: state.clone(),
        })?;
        let exclude: Vec<&str> = source.into_iter().collect();
        self.broadcast_protocol(&message, &exclude)?;

        self.state_updates.push(PendingStateUpdate {
            state,
            source: source.map(str::to_string),
        });
        Ok(())
    }

    // ========================================================================
    // Scheduling
    // ========================================================================

    pub async fn schedule(
        &self,
        when: Schedule,
        callback: &str,
        payload: Value,
    ) -> Result<ScheduledTask, AgentError> {
        Ok(self.scheduler.schedule(when, callback, payload).await?)
    }

    pub async fn cancel_schedule(&self, id: &str) -> Result<bool, AgentError> {
        Ok(self.scheduler.cancel(id).await?)
    }

    pub async fn schedules(&self, filter: &ScheduleFilter) -> Result<Vec<ScheduledTask>, AgentError> {
        Ok(self.scheduler.list(filter).await?)
    }

    // ========================================================================
    // Connections
    // ========================================================================

    pub fn connection(&self, id: &str) -> Result<Option<Connection>, ConnectionError> {
        self.connections.get_connection(id)
    }

    pub fn connections(&self, tag: Option<&str>) -> Result<Vec<Connection>, ConnectionError> {
        self.connections.get_connections(tag)
    }

    pub fn connection_count(&self) -> usize {
        self.connections.count()
    }

    pub fn set_connection_state(&mut self, id: &str, state: Value) -> Result<(), ConnectionError> {
        self.connections.set_connection_state(id, state)
    }

    pub(crate) fn remove_connection(&mut self, id: &str) -> Option<Connection> {
        self.connections.remove(id)
    }

    /// Send `message` to every connection not in `exclude`. Dead connections
    /// are logged and skipped. Returns how many sends succeeded.
    pub fn broadcast(&self, message: &str, exclude: &[&str]) -> Result<usize, ConnectionError> {
        self.broadcast_filtered(message, exclude, |_| true)
    }

    /// Broadcast to agent connections only; MCP streams carry JSON-RPC and
    /// never receive agent protocol messages.
    pub(crate) fn broadcast_protocol(
        &self,
        message: &str,
        exclude: &[&str],
    ) -> Result<usize, ConnectionError> {
        self.broadcast_filtered(message, exclude, |conn| !conn.has_tag(MCP_TAG))
    }

    fn broadcast_filtered(
        &self,
        message: &str,
        exclude: &[&str],
        include: impl Fn(&Connection) -> bool,
    ) -> Result<usize, ConnectionError> {
        let mut sent = 0;
        for conn in self.connections.get_connections(None)? {
            if exclude.contains(&conn.id()) || !include(&conn) {
                continue;
            }
            match conn.send(message) {
                Ok(()) => sent += 1,
                Err(e) => tracing::warn!(
                    agent = %self.name,
                    connection_id = %conn.id(),
                    error = %e,
                    "Broadcast to dead connection skipped"
                ),
            }
        }
        Ok(sent)
    }

    // ========================================================================
    // MCP client servers
    // ========================================================================

    pub async fn mcp_servers(&self) -> Result<Vec<McpServerInfo>, AgentError> {
        Ok(self.storage.list_mcp_servers().await?)
    }

    /// Register (or update) an MCP server and push the new list to clients.
    pub async fn add_mcp_server(&mut self, server: McpServerInfo) -> Result<(), AgentError> {
        self.storage.upsert_mcp_server(&server).await?;
        self.broadcast_mcp_servers().await
    }

    pub async fn remove_mcp_server(&mut self, id: &str) -> Result<bool, AgentError> {
        let removed = self.storage.remove_mcp_server(id).await?;
        if removed {
            self.broadcast_mcp_servers().await?;
        }
        Ok(removed)
    }

    async fn broadcast_mcp_servers(&self) -> Result<(), AgentError> {
        let servers = self.storage.list_mcp_servers().await?;
        let message = serde_json::to_string(&AgentOutbound::McpServers { servers })?;
        self.broadcast_protocol(&message, &[])?;
        Ok(())
    }

    // ========================================================================
    // SQL
    // ========================================================================

    pub async fn query(&self, sql: &str, params: &[Value]) -> Result<Vec<Value>, AgentError> {
        Ok(self.storage.query(sql, params).await?)
    }

    pub async fn execute(&self, sql: &str, params: &[Value]) -> Result<u64, AgentError> {
        Ok(self.storage.execute(sql, params).await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::MethodRegistry;
    use crate::connection::{socket_channel, InMemoryRegistry, SocketFrame};
    use crate::scheduler::tests::RecordingAlarm;
    use serde_json::json;
    use std::sync::Arc;

    async fn fixture() -> (AgentStorage, Scheduler) {
        let storage = AgentStorage::in_memory().await.unwrap();
        let scheduler = Scheduler::new(
            storage.clone(),
            Arc::new(RecordingAlarm::default()),
            Arc::new(MethodRegistry::new()),
        );
        (storage, scheduler)
    }

    #[tokio::test]
    async fn test_initial_state_is_promoted_on_first_read() {
        let (storage, scheduler) = fixture().await;
        let mut registry = InMemoryRegistry::new();
        let initial = Some(json!({"count": 0}));
        let mut ctx = AgentContext::new("a", &storage, &scheduler, &mut registry, &initial);

        assert_eq!(storage.load_state().await.unwrap(), None);
        assert_eq!(ctx.state().await.unwrap(), Some(json!({"count": 0})));
        assert_eq!(
            storage.load_state().await.unwrap(),
            Some(json!({"count": 0}))
        );
        assert!(ctx.state_updates.is_empty());
    }

    #[tokio::test]
    async fn test_no_initial_state_reads_as_absent() {
        let (storage, scheduler) = fixture().await;
        let mut registry = InMemoryRegistry::new();
        let initial = None;
        let mut ctx = AgentContext::new("a", &storage, &scheduler, &mut registry, &initial);
        assert_eq!(ctx.state().await.unwrap(), None);
        assert_eq!(storage.load_state().await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_set_state_skips_source_and_mcp_connections() {
        let (storage, scheduler) = fixture().await;
        let mut registry = InMemoryRegistry::new();
        let (tx_a, mut rx_a) = socket_channel();
        let (tx_b, mut rx_b) = socket_channel();
        let (tx_m, mut rx_m) = socket_channel();
        registry.accept("a".into(), tx_a, &[]).unwrap();
        registry.accept("b".into(), tx_b, &[]).unwrap();
        registry
            .accept("m".into(), tx_m, &[MCP_TAG.to_string()])
            .unwrap();

        let initial = None;
        let mut ctx = AgentContext::new("a", &storage, &scheduler, &mut registry, &initial);
        ctx.set_state_from(json!({"x": 1}), Some("a")).await.unwrap();

        let frame = rx_b.try_recv().unwrap();
        let SocketFrame::Text(text) = frame else {
            panic!("expected text frame");
        };
        let value: Value = serde_json::from_str(&text).unwrap();
        assert_eq!(value, json!({"type": "cf_agent_state", "state": {"x": 1}}));
        assert!(rx_a.try_recv().is_err());
        assert!(rx_m.try_recv().is_err());

        assert_eq!(ctx.state_updates.len(), 1);
        assert_eq!(ctx.state_updates[0].source.as_deref(), Some("a"));
        assert_eq!(ctx.state().await.unwrap(), Some(json!({"x": 1})));
    }

    #[tokio::test]
    async fn test_state_updates_are_queued_in_order_after_persisting() {
        let (storage, scheduler) = fixture().await;
        let mut registry = InMemoryRegistry::new();
        let initial = None;
        let mut ctx = AgentContext::new("a", &storage, &scheduler, &mut registry, &initial);

        ctx.set_state(json!({"n": 1})).await.unwrap();
        ctx.set_state(json!({"n": 2})).await.unwrap();

        // Both writes are persisted before any hook could run
        assert_eq!(storage.load_state().await.unwrap(), Some(json!({"n": 2})));
        let queued: Vec<&Value> = ctx.state_updates.iter().map(|u| &u.state).collect();
        assert_eq!(queued, vec![&json!({"n": 1}), &json!({"n": 2})]);
        assert!(ctx.state_updates.iter().all(|u| u.source.is_none()));
    }
}

use super::{
    prepare_tags, Connection, ConnectionAttachment, ConnectionError, ConnectionRegistry,
    ConnectionStrategy, SocketSender, CLOSE_GOING_AWAY,
};
use serde_json::Value;
use std::collections::{BTreeSet, HashMap};

/// Connections held in actor memory. Lost when the actor stops.
#[derive(Debug, Default)]
pub struct InMemoryRegistry {
    connections: HashMap<String, Connection>,
    by_tag: HashMap<String, BTreeSet<String>>,
}

impl InMemoryRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Close every connection. Called when the owning actor stops.
    pub fn close_all(&mut self, reason: &str) {
        for (_, conn) in self.connections.drain() {
            conn.close(CLOSE_GOING_AWAY, reason);
        }
        self.by_tag.clear();
    }
}

impl ConnectionRegistry for InMemoryRegistry {
    fn accept(
        &mut self,
        id: String,
        sender: SocketSender,
        tags: &[String],
    ) -> Result<Connection, ConnectionError> {
        let tags = prepare_tags(&id, tags)?;
        for tag in &tags {
            self.by_tag
                .entry(tag.clone())
                .or_default()
                .insert(id.clone());
        }
        let conn = Connection::new(
            ConnectionAttachment {
                id: id.clone(),
                tags,
                state: None,
            },
            sender,
        );
        self.connections.insert(id, conn.clone());
        Ok(conn)
    }

    fn get_connection(&self, id: &str) -> Result<Option<Connection>, ConnectionError> {
        Ok(self.connections.get(id).cloned())
    }

    fn get_connections(&self, tag: Option<&str>) -> Result<Vec<Connection>, ConnectionError> {
        let conns = match tag {
            None => self.connections.values().cloned().collect(),
            Some(tag) => self
                .by_tag
                .get(tag)
                .map(|ids| {
                    ids.iter()
                        .filter_map(|id| self.connections.get(id).cloned())
                        .collect()
                })
                .unwrap_or_default(),
        };
        Ok(conns)
    }

    fn count(&self) -> usize {
        self.connections.len()
    }

    fn remove(&mut self, id: &str) -> Option<Connection> {
        let conn = self.connections.remove(id)?;
        for tag in conn.tags() {
            if let Some(ids) = self.by_tag.get_mut(tag) {
                ids.remove(id);
                if ids.is_empty() {
                    self.by_tag.remove(tag);
                }
            }
        }
        Some(conn)
    }

    fn set_connection_state(&mut self, id: &str, state: Value) -> Result<(), ConnectionError> {
        let conn = self
            .connections
            .get_mut(id)
            .ok_or_else(|| ConnectionError::NotFound(id.to_string()))?;
        conn.state = Some(state);
        Ok(())
    }

    fn strategy(&self) -> ConnectionStrategy {
        ConnectionStrategy::InMemory
    }

    fn shutdown(&mut self) {
        self.close_all("agent hibernated");
    }
}

use super::{
    prepare_tags, Connection, ConnectionAttachment, ConnectionError, ConnectionRegistry,
    ConnectionStrategy, SocketSender,
};
use dashmap::DashMap;
use serde_json::Value;
use std::sync::Arc;

/// Host-held socket: the outbound sender plus the serialized attachment.
#[derive(Debug, Clone)]
pub struct RawSocket {
    pub sender: SocketSender,
    pub attachment: String,
}

/// Sockets for one agent identity, owned by the host so they survive the
/// actor being stopped and restarted.
pub type SocketTable = Arc<DashMap<String, RawSocket>>;

/// Registry that keeps no connection objects in the actor.
///
/// Every lookup re-reads the socket table and deserializes attachments. A
/// socket whose attachment cannot be decoded is a host contract violation and
/// is reported as [`ConnectionError::CorruptAttachment`].
#[derive(Debug, Clone)]
pub struct HibernatingRegistry {
    sockets: SocketTable,
}

impl HibernatingRegistry {
    pub fn new(sockets: SocketTable) -> Self {
        Self { sockets }
    }

    fn wrap(id: &str, raw: &RawSocket) -> Result<Connection, ConnectionError> {
        let attachment: ConnectionAttachment =
            serde_json::from_str(&raw.attachment).map_err(|e| {
                ConnectionError::CorruptAttachment {
                    id: id.to_string(),
                    reason: e.to_string(),
                }
            })?;
        if attachment.id != id {
            return Err(ConnectionError::CorruptAttachment {
                id: id.to_string(),
                reason: format!("attachment belongs to '{}'", attachment.id),
            });
        }
        Ok(Connection::new(attachment, raw.sender.clone()))
    }

    fn store(&self, conn: &Connection) -> Result<(), ConnectionError> {
        let attachment = serde_json::to_string(&conn.attachment())
            .map_err(|e| ConnectionError::Serialization(e.to_string()))?;
        self.sockets.insert(
            conn.id().to_string(),
            RawSocket {
                sender: conn.sender.clone(),
                attachment,
            },
        );
        Ok(())
    }
}

impl ConnectionRegistry for HibernatingRegistry {
    fn accept(
        &mut self,
        id: String,
        sender: SocketSender,
        tags: &[String],
    ) -> Result<Connection, ConnectionError> {
        let tags = prepare_tags(&id, tags)?;
        let conn = Connection::new(
            ConnectionAttachment {
                id,
                tags,
                state: None,
            },
            sender,
        );
        self.store(&conn)?;
        Ok(conn)
    }

    fn get_connection(&self, id: &str) -> Result<Option<Connection>, ConnectionError> {
        match self.sockets.get(id) {
            Some(raw) => Self::wrap(id, raw.value()).map(Some),
            None => Ok(None),
        }
    }

    fn get_connections(&self, tag: Option<&str>) -> Result<Vec<Connection>, ConnectionError> {
        let mut conns = Vec::new();
        for entry in self.sockets.iter() {
            let conn = Self::wrap(entry.key(), entry.value())?;
            if tag.map_or(true, |t| conn.has_tag(t)) {
                conns.push(conn);
            }
        }
        Ok(conns)
    }

    fn count(&self) -> usize {
        self.sockets.len()
    }

    fn remove(&mut self, id: &str) -> Option<Connection> {
        let (id, raw) = self.sockets.remove(id)?;
        Self::wrap(&id, &raw).ok()
    }

    fn set_connection_state(&mut self, id: &str, state: Value) -> Result<(), ConnectionError> {
        let mut conn = self
            .get_connection(id)?
            .ok_or_else(|| ConnectionError::NotFound(id.to_string()))?;
        conn.state = Some(state);
        self.store(&conn)
    }

    fn strategy(&self) -> ConnectionStrategy {
        ConnectionStrategy::Hibernating
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::socket_channel;

    #[test]
    fn test_connections_survive_registry_recreation() {
        let table = SocketTable::default();
        let mut first = HibernatingRegistry::new(table.clone());
        let (tx, _rx) = socket_channel();
        first.accept("a".into(), tx, &["mcp".to_string()]).unwrap();
        first
            .set_connection_state("a", serde_json::json!({"n": 1}))
            .unwrap();
        drop(first);

        let second = HibernatingRegistry::new(table);
        let conn = second.get_connection("a").unwrap().unwrap();
        assert_eq!(conn.tags(), &["a".to_string(), "mcp".to_string()]);
        assert_eq!(conn.state(), Some(&serde_json::json!({"n": 1})));
    }

    #[test]
    fn test_corrupt_attachment_is_an_error() {
        let table = SocketTable::default();
        let (tx, _rx) = socket_channel();
        table.insert(
            "a".into(),
            RawSocket {
                sender: tx,
                attachment: "{not json".into(),
            },
        );

        let registry = HibernatingRegistry::new(table);
        assert!(matches!(
            registry.get_connection("a"),
            Err(ConnectionError::CorruptAttachment { .. })
        ));
        assert!(registry.get_connections(None).is_err());
    }
}

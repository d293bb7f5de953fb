//! Connections and the registries that track them
//!
//! A [`Connection`] is a value: an id, its ordered tags, a user-settable state
//! blob and the outbound half of the transport. Registries hand out fresh
//! copies on every lookup, so nothing keeps a connection alive across an
//! actor restart. Always re-resolve by id.
//!
//! Two strategies implement [`ConnectionRegistry`]:
//!
//! - [`InMemoryRegistry`] keeps connections in a map owned by the actor and
//!   loses them when the actor stops.
//! - [`HibernatingRegistry`] keeps nothing in the actor. Tags and state are
//!   serialized as an attachment next to the raw socket in a host-owned
//!   [`SocketTable`] that outlives actor instances.

mod hibernating;
mod memory;

pub use hibernating::{HibernatingRegistry, RawSocket, SocketTable};
pub use memory::InMemoryRegistry;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::mpsc;

pub const MAX_TAGS: usize = 10;
pub const MAX_TAG_LEN: usize = 256;

/// Close code sent when an actor stops while holding in-memory connections
pub const CLOSE_GOING_AWAY: u16 = 1001;
pub const CLOSE_NORMAL: u16 = 1000;

/// Frame written to a transport
#[derive(Debug, Clone, PartialEq)]
pub enum SocketFrame {
    Text(String),
    Close { code: u16, reason: String },
}

pub type SocketSender = mpsc::UnboundedSender<SocketFrame>;
pub type SocketReceiver = mpsc::UnboundedReceiver<SocketFrame>;

pub fn socket_channel() -> (SocketSender, SocketReceiver) {
    mpsc::unbounded_channel()
}

/// Which registry an agent class uses
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionStrategy {
    InMemory,
    Hibernating,
}

impl ConnectionStrategy {
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "memory" | "in-memory" | "in_memory" => Some(Self::InMemory),
            "hibernating" | "hibernate" => Some(Self::Hibernating),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConnectionError {
    #[error("A connection can only have {MAX_TAGS} tags, got {0}")]
    TooManyTags(usize),

    #[error("Connection tags must not be empty")]
    EmptyTag,

    #[error("Connection tag exceeds {MAX_TAG_LEN} characters: {0}")]
    TagTooLong(String),

    #[error("Connection not found: {0}")]
    NotFound(String),

    #[error("Connection {0} is closed")]
    Closed(String),

    #[error("Corrupt attachment on connection {id}: {reason}")]
    CorruptAttachment { id: String, reason: String },

    #[error("Serialization error: {0}")]
    Serialization(String),
}

/// Build the final tag list: the connection id first, then the given tags.
pub fn prepare_tags(id: &str, tags: &[String]) -> Result<Vec<String>, ConnectionError> {
    let mut final_tags = Vec::with_capacity(tags.len() + 1);
    final_tags.push(id.to_string());
    final_tags.extend(tags.iter().filter(|t| t.as_str() != id).cloned());

    if final_tags.len() > MAX_TAGS {
        return Err(ConnectionError::TooManyTags(final_tags.len()));
    }
    for tag in &final_tags {
        if tag.is_empty() {
            return Err(ConnectionError::EmptyTag);
        }
        if tag.chars().count() > MAX_TAG_LEN {
            return Err(ConnectionError::TagTooLong(tag.clone()));
        }
    }
    Ok(final_tags)
}

/// Serialized form of a connection's metadata
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConnectionAttachment {
    pub id: String,
    pub tags: Vec<String>,
    #[serde(default)]
    pub state: Option<Value>,
}

#[derive(Debug, Clone)]
pub struct Connection {
    id: String,
    tags: Vec<String>,
    state: Option<Value>,
    sender: SocketSender,
}

impl Connection {
    pub(crate) fn new(attachment: ConnectionAttachment, sender: SocketSender) -> Self {
        Self {
            id: attachment.id,
            tags: attachment.tags,
            state: attachment.state,
            sender,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn tags(&self) -> &[String] {
        &self.tags
    }

    pub fn has_tag(&self, tag: &str) -> bool {
        self.tags.iter().any(|t| t == tag)
    }

    pub fn state(&self) -> Option<&Value> {
        self.state.as_ref()
    }

    pub fn send(&self, text: impl Into<String>) -> Result<(), ConnectionError> {
        self.sender
            .send(SocketFrame::Text(text.into()))
            .map_err(|_| ConnectionError::Closed(self.id.clone()))
    }

    pub fn send_json<T: Serialize>(&self, value: &T) -> Result<(), ConnectionError> {
        let text = serde_json::to_string(value)
            .map_err(|e| ConnectionError::Serialization(e.to_string()))?;
        self.send(text)
    }

    pub fn close(&self, code: u16, reason: impl Into<String>) {
        let _ = self.sender.send(SocketFrame::Close {
            code,
            reason: reason.into(),
        });
    }

    pub(crate) fn sender(&self) -> SocketSender {
        self.sender.clone()
    }

    pub(crate) fn attachment(&self) -> ConnectionAttachment {
        ConnectionAttachment {
            id: self.id.clone(),
            tags: self.tags.clone(),
            state: self.state.clone(),
        }
    }
}

/// Tracks live connections to one agent
pub trait ConnectionRegistry: Send + Sync {
    /// Validate tags, bind metadata and register the connection.
    fn accept(
        &mut self,
        id: String,
        sender: SocketSender,
        tags: &[String],
    ) -> Result<Connection, ConnectionError>;

    fn get_connection(&self, id: &str) -> Result<Option<Connection>, ConnectionError>;

    /// All connections, or only those carrying `tag`.
    fn get_connections(&self, tag: Option<&str>) -> Result<Vec<Connection>, ConnectionError>;

    fn count(&self) -> usize;

    fn remove(&mut self, id: &str) -> Option<Connection>;

    fn set_connection_state(&mut self, id: &str, state: Value) -> Result<(), ConnectionError>;

    fn strategy(&self) -> ConnectionStrategy;

    /// Called when the owning actor stops.
    fn shutdown(&mut self) {}
}

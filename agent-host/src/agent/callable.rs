//! Static method registry and streaming replies
//!
//! Agent classes declare their methods once, at registration time. A method is
//! either internal (usable as a scheduled callback only) or callable over the
//! RPC sub-protocol, and a callable may stream partial results.

use super::AgentError;
use crate::connection::{SocketFrame, SocketSender};
use serde::Serialize;
use serde_json::Value;
use shared_types::{AgentOutbound, RequestId, RpcReply};
use std::collections::BTreeMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct MethodSpec {
    pub callable: bool,
    pub streaming: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<&'static str>,
}

#[derive(Debug, Clone, Default)]
pub struct MethodRegistry {
    methods: BTreeMap<String, MethodSpec>,
}

impl MethodRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Method usable as a scheduled callback but not over RPC
    pub fn method(mut self, name: &str) -> Self {
        self.methods.insert(
            name.to_string(),
            MethodSpec {
                callable: false,
                streaming: false,
                description: None,
            },
        );
        self
    }

    pub fn callable(mut self, name: &str, description: &'static str) -> Self {
        self.methods.insert(
            name.to_string(),
            MethodSpec {
                callable: true,
                streaming: false,
                description: Some(description),
            },
        );
        self
    }

    pub fn streaming(mut self, name: &str, description: &'static str) -> Self {
        self.methods.insert(
            name.to_string(),
            MethodSpec {
                callable: true,
                streaming: true,
                description: Some(description),
            },
        );
        self
    }

    pub fn get(&self, name: &str) -> Option<&MethodSpec> {
        self.methods.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.methods.contains_key(name)
    }

    pub fn callables(&self) -> impl Iterator<Item = (&str, &MethodSpec)> {
        self.methods
            .iter()
            .filter(|(_, spec)| spec.callable)
            .map(|(name, spec)| (name.as_str(), spec))
    }
}

/// Reply channel handed to a streaming callable.
///
/// Each `send` delivers a partial reply (`done: false`). The stream ends with
/// `end`, or with the method's return value if it never called `end`.
#[derive(Debug)]
pub struct StreamingResponse {
    id: RequestId,
    sender: SocketSender,
    closed: bool,
}

impl StreamingResponse {
    pub(crate) fn new(id: RequestId, sender: SocketSender) -> Self {
        Self {
            id,
            sender,
            closed: false,
        }
    }

    pub fn send(&mut self, chunk: Value) -> Result<(), AgentError> {
        self.deliver(RpcReply::ok(self.id.clone(), chunk, false))
    }

    pub fn end(&mut self, result: Value) -> Result<(), AgentError> {
        self.deliver(RpcReply::ok(self.id.clone(), result, true))?;
        self.closed = true;
        Ok(())
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    fn deliver(&mut self, reply: RpcReply) -> Result<(), AgentError> {
        if self.closed {
            return Err(AgentError::StreamClosed(self.id.to_string()));
        }
        let text = serde_json::to_string(&AgentOutbound::Rpc(reply))?;
        self.sender
            .send(SocketFrame::Text(text))
            .map_err(|_| AgentError::StreamClosed(self.id.to_string()))
    }
}

use shared_types::jsonrpc::JsonRpcMessage;

/// Outbound half of a protocol server's transport.
///
/// The server hands every message it produces to `send`; the bridge decides
/// which connection (if any) receives it.
pub trait McpTransport: Send {
    fn send(&mut self, message: JsonRpcMessage);
}

/// Collects outbound messages until the bridge routes them.
#[derive(Debug, Default)]
pub struct Outbox {
    messages: Vec<JsonRpcMessage>,
}

impl Outbox {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn drain(&mut self) -> std::vec::Drain<'_, JsonRpcMessage> {
        self.messages.drain(..)
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }
}

impl McpTransport for Outbox {
    fn send(&mut self, message: JsonRpcMessage) {
        self.messages.push(message);
    }
}

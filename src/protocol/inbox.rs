use std::fmt::{Debug, Formatter};
use std::sync::Arc;

use rustc_hash::FxHashMap;
use tokio::sync::RwLock;
use tracing::debug;

use crate::protocol::error::{ProtocolError, Result};
use crate::protocol::message::{Command, Message, MessageType};

/// Routing key of the typed inbox: the message type byte followed by the four command
///  bytes, e.g. `Cping` or `Qtime`. One handler per key.
#[derive(Clone, Copy, Eq, PartialEq, Hash)]
pub struct InboxKey([u8; 5]);

impl InboxKey {
    pub fn new(msg_type: MessageType, command: Command) -> InboxKey {
        let mut key = [0u8; 5];
        key[0] = msg_type.as_byte();
        key[1..].copy_from_slice(command.as_bytes());
        InboxKey(key)
    }

    pub fn of(msg: &Message) -> InboxKey {
        InboxKey::new(msg.msg_type, msg.command)
    }
}

impl Debug for InboxKey {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "InboxKey({:?})", String::from_utf8_lossy(&self.0))
    }
}

/// Application handler for one (type, command) pair.
///
/// This is a blocking call, holding up the central receive loop. Non-trivial work should
///  probably be offloaded to some asynchronous processing, but it is up to the handler
///  implementation to decide and do this.
#[async_trait::async_trait]
pub trait InboxHandler: 'static + Sync + Send {
    async fn on_message(&self, message: &Message);
}

/// The typed inbox: fully decoded messages are routed to the handler registered for
///  their (type, command) key. Messages without a matching handler are only visible on
///  the generic [Listeners] hub.
pub struct Inbox {
    handlers: RwLock<FxHashMap<InboxKey, Arc<dyn InboxHandler>>>,
}

impl Inbox {
    pub fn new() -> Inbox {
        Inbox {
            handlers: Default::default(),
        }
    }

    pub async fn register(&self, key: InboxKey, handler: Arc<dyn InboxHandler>) -> Result<()> {
        match self.handlers.write().await.entry(key) {
            std::collections::hash_map::Entry::Occupied(_) => Err(ProtocolError::Config(format!(
                "registering a second handler for {:?}",
                key
            ))),
            std::collections::hash_map::Entry::Vacant(e) => {
                let _ = e.insert(handler);
                Ok(())
            }
        }
    }

    pub async fn deregister(&self, key: InboxKey) -> Result<()> {
        let prev = self.handlers.write().await.remove(&key);
        if prev.is_none() {
            return Err(ProtocolError::Config(format!(
                "deregistering {:?} which was not registered",
                key
            )));
        }
        Ok(())
    }

    pub(crate) async fn dispatch(&self, message: &Message) {
        let handler = self.handlers.read().await.get(&InboxKey::of(message)).cloned();
        match handler {
            Some(handler) => handler.on_message(message).await,
            None => {
                debug!(
                    "no inbox handler for {:?} - message only visible to generic listeners",
                    InboxKey::of(message)
                );
            }
        }
    }
}

impl Default for Inbox {
    fn default() -> Inbox {
        Inbox::new()
    }
}

/// Observer of the engine's generic event stream: every fully decoded message, plus
///  socket-level errors. Where the typed inbox routes by key, listeners see everything.
#[async_trait::async_trait]
pub trait EngineListener: 'static + Sync + Send {
    async fn on_message(&self, message: &Message);

    async fn on_socket_error(&self, _error: &ProtocolError) {}
}

pub struct Listeners {
    listeners: RwLock<Vec<Arc<dyn EngineListener>>>,
}

impl Listeners {
    pub fn new() -> Listeners {
        Listeners {
            listeners: RwLock::new(Vec::new()),
        }
    }

    pub async fn add(&self, listener: Arc<dyn EngineListener>) {
        self.listeners.write().await.push(listener);
    }

    pub(crate) async fn emit_message(&self, message: &Message) {
        let listeners = self.listeners.read().await.clone();
        for listener in listeners {
            listener.on_message(message).await;
        }
    }

    pub(crate) async fn emit_socket_error(&self, error: &ProtocolError) {
        let listeners = self.listeners.read().await.clone();
        for listener in listeners {
            listener.on_socket_error(error).await;
        }
    }
}

impl Default for Listeners {
    fn default() -> Listeners {
        Listeners::new()
    }
}

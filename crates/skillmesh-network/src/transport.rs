//! The capability shared by every transport, and the observer list used to
//! fan inbound messages out to handlers.

use std::sync::{Arc, Mutex, Weak};

use async_trait::async_trait;
use skillmesh_protocol::TransportMessage;

use crate::NetworkError;

/// Callback invoked for each inbound message.
pub type MessageHandler = Arc<dyn Fn(TransportMessage) + Send + Sync>;

/// A way to move messages between this host and one remote host.
///
/// Implemented by [`crate::WebSocketTransport`] (persistent, duplex) and
/// [`crate::SecureHttpTransport`] (signed request/response).
#[async_trait]
pub trait Transport: Send + Sync {
    /// Short name reported in delivery results, e.g. `"http"`.
    fn name(&self) -> &'static str;

    /// Establish the connection or verify the peer is reachable.
    async fn connect(&self) -> Result<(), NetworkError>;

    /// Send `payload` to `path` on the peer and return its response.
    async fn send(
        &self,
        path: &str,
        payload: serde_json::Value,
    ) -> Result<serde_json::Value, NetworkError>;

    /// Register a handler for inbound messages.
    fn on_message(&self, handler: MessageHandler) -> Subscription;

    /// Whether the peer currently answers.
    async fn health_check(&self) -> bool;

    async fn disconnect(&self);
}

struct Slots {
    next_id: u64,
    handlers: Vec<(u64, MessageHandler)>,
}

/// Ordered list of message handlers.
///
/// Handlers run in registration order on the task that dispatches; the
/// list lock is not held while they run.
#[derive(Clone)]
pub struct HandlerRegistry {
    slots: Arc<Mutex<Slots>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self {
            slots: Arc::new(Mutex::new(Slots {
                next_id: 0,
                handlers: Vec::new(),
            })),
        }
    }

    pub fn subscribe(&self, handler: MessageHandler) -> Subscription {
        let mut slots = self.slots.lock().unwrap_or_else(|e| e.into_inner());
        let id = slots.next_id;
        slots.next_id += 1;
        slots.handlers.push((id, handler));
        Subscription {
            id,
            slots: Arc::downgrade(&self.slots),
        }
    }

    /// Invoke every registered handler with a clone of `message`.
    pub fn dispatch(&self, message: &TransportMessage) {
        let handlers: Vec<MessageHandler> = {
            let slots = self.slots.lock().unwrap_or_else(|e| e.into_inner());
            slots.handlers.iter().map(|(_, h)| Arc::clone(h)).collect()
        };
        for handler in handlers {
            handler(message.clone());
        }
    }

    pub fn len(&self) -> usize {
        self.slots.lock().unwrap_or_else(|e| e.into_inner()).handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for HandlerRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Disposer returned by `on_message`.
///
/// Dropping it leaves the handler registered; call
/// [`Subscription::unsubscribe`] to remove it.
#[must_use = "keep the subscription to be able to unsubscribe later"]
pub struct Subscription {
    id: u64,
    slots: Weak<Mutex<Slots>>,
}

impl Subscription {
    /// Remove the handler. Returns false if it was already gone or its
    /// registry no longer exists.
    pub fn unsubscribe(self) -> bool {
        let Some(slots) = self.slots.upgrade() else {
            return false;
        };
        let mut slots = slots.lock().unwrap_or_else(|e| e.into_inner());
        let before = slots.handlers.len();
        slots.handlers.retain(|(id, _)| *id != self.id);
        slots.handlers.len() != before
    }
}

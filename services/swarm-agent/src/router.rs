//! Message router: dispatches inbound overlay messages by tag.
//!
//! The table is built once before the overlay starts and is read-only
//! afterwards; the overlay owns it behind an `Arc` as its [`MessageSink`].
//! Handlers run on the overlay reactor thread and must not block.

use std::collections::HashMap;
use std::sync::Arc;

use swarm_overlay::{Body, MessageSink, OverlayError, OverlayHandle};
use tracing::{debug, info, warn};

use crate::messages;

/// A message handler: `(peer_id, body)`.
pub type Handler = Arc<dyn Fn(&str, &Body) + Send + Sync>;

/// Where handlers send their replies.
pub trait Outbox: Send + Sync {
    /// Queue a message without waiting for delivery.
    fn post(&self, to: &str, tag: &str, body: Body) -> Result<(), OverlayError>;
}

impl Outbox for OverlayHandle {
    fn post(&self, to: &str, tag: &str, body: Body) -> Result<(), OverlayError> {
        OverlayHandle::post(self, to, tag, body)
    }
}

/// Tag to handler table.
#[derive(Default, Clone)]
pub struct MessageRouter {
    handlers: HashMap<String, Handler>,
}

impl MessageRouter {
    pub fn new() -> Self {
        Self::default()
    }

    /// A router with the `MSG_GETSTATE` and `MSG_RESOURCE_RESPONSE` handlers.
    pub fn with_core_handlers(outbox: Arc<dyn Outbox>) -> Self {
        let mut router = Self::new();

        router.register(messages::MSG_GETSTATE, move |peer_id, body| {
            let Some(appid) = body.get("appid").cloned() else {
                warn!(peer_id = %peer_id, "MSG_GETSTATE without appid, ignoring");
                return;
            };
            info!(peer_id = %peer_id, appid = %appid, "Sending state for application");
            let reply = messages::state(appid, messages::STATE_RUNNING);
            if let Err(e) = outbox.post(peer_id, messages::MSG_STATE, reply) {
                warn!(peer_id = %peer_id, error = %e, "Failed to send state");
            }
        });

        router.register(messages::MSG_RESOURCE_RESPONSE, |peer_id, body| {
            info!(
                peer_id = %peer_id,
                appid = %messages::appid(body),
                "Resource response arrived"
            );
        });

        router
    }

    /// Register a handler for `tag`.
    ///
    /// A second registration under the same tag replaces the first.
    pub fn register<F>(&mut self, tag: impl Into<String>, handler: F)
    where
        F: Fn(&str, &Body) + Send + Sync + 'static,
    {
        let tag = tag.into();
        if self.handlers.insert(tag.clone(), Arc::new(handler)).is_some() {
            debug!(tag = %tag, "Replaced message handler");
        }
    }

    /// Invoke the handler for `tag`. Returns whether one was registered.
    pub fn dispatch(&self, peer_id: &str, tag: &str, body: &Body) -> bool {
        match self.handlers.get(tag) {
            Some(handler) => {
                handler(peer_id, body);
                true
            }
            None => {
                warn!(peer_id = %peer_id, tag = %tag, "No handler for message tag, dropping");
                false
            }
        }
    }

    /// Registered tags, sorted.
    pub fn tags(&self) -> Vec<&str> {
        let mut tags: Vec<&str> = self.handlers.keys().map(String::as_str).collect();
        tags.sort_unstable();
        tags
    }
}

impl MessageSink for MessageRouter {
    fn deliver(&self, from: &str, tag: &str, body: &Body) {
        self.dispatch(from, tag, body);
    }
}

impl std::fmt::Debug for MessageRouter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MessageRouter")
            .field("tags", &self.tags())
            .finish()
    }
}

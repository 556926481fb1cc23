//! Msg id → handler table.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use tidewire_core::MsgId;
use tracing::warn;

use crate::request::Request;

/// Handles one kind of message.
#[async_trait]
pub trait MsgHandler: Send + Sync + 'static {
    /// Process a request. Replies go through `request.conn()`.
    async fn handle(&self, request: Request);
}

/// A [`MsgHandler`] built from an async closure. See [`handler_fn`].
#[derive(Clone)]
pub struct HandlerFn<F> {
    f: F,
}

/// Wrap `f` as a [`MsgHandler`].
pub fn handler_fn<F, Fut>(f: F) -> HandlerFn<F>
where
    F: Fn(Request) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    HandlerFn { f }
}

#[async_trait]
impl<F, Fut> MsgHandler for HandlerFn<F>
where
    F: Fn(Request) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    async fn handle(&self, request: Request) {
        (self.f)(request).await;
    }
}

/// Maps msg ids to handlers. Built before the server starts and read-only
/// afterwards.
#[derive(Clone, Default)]
pub struct Router {
    handlers: HashMap<MsgId, Arc<dyn MsgHandler>>,
}

impl Router {
    /// An empty router.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `handler` for `msg_id`, replacing any earlier registration.
    pub fn add_route(&mut self, msg_id: MsgId, handler: impl MsgHandler) -> &mut Self {
        if self.handlers.insert(msg_id, Arc::new(handler)).is_some() {
            warn!(msg_id, "replacing existing handler");
        }
        self
    }

    /// Handler for `msg_id`.
    pub fn handler(&self, msg_id: MsgId) -> Option<Arc<dyn MsgHandler>> {
        self.handlers.get(&msg_id).cloned()
    }

    /// Whether `msg_id` has a handler.
    pub fn has_route(&self, msg_id: MsgId) -> bool {
        self.handlers.contains_key(&msg_id)
    }

    /// Registered ids, ascending.
    pub fn msg_ids(&self) -> Vec<MsgId> {
        let mut ids: Vec<MsgId> = self.handlers.keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    /// Number of routes.
    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    /// Whether no routes are registered.
    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

impl std::fmt::Debug for Router {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Router")
            .field("msg_ids", &self.msg_ids())
            .finish()
    }
}

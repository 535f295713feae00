use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::warn;

use crate::event::Envelope;
use crate::handler::{pipe, Handler, Middleware, ProcessStatus};

/// Maps route names to handlers and dispatches envelopes by their route key.
///
/// Registration happens once, before any stream starts; the router is
/// read-only afterwards and shared across consumer instances behind an `Arc`.
pub struct Router {
    routes: HashMap<String, Arc<dyn Handler>>,
    not_found: Arc<dyn Handler>,
}

/// Default not-found handler: log and skip, never a fatal error.
struct NotFound;

#[async_trait]
impl Handler for NotFound {
    async fn handle(&self, envelope: &mut Envelope) -> ProcessStatus {
        if envelope.route.is_empty() {
            warn!(
                topic = %envelope.topic,
                partition = envelope.partition,
                offset = envelope.offset,
                "record carries no route header, skipping"
            );
        } else {
            warn!(
                route = %envelope.route,
                topic = %envelope.topic,
                "no handler registered for route, skipping"
            );
        }
        ProcessStatus::Skip
    }
}

impl Router {
    pub fn new() -> Self {
        Self {
            routes: HashMap::new(),
            not_found: Arc::new(NotFound),
        }
    }

    /// Replace the default not-found handler.
    pub fn with_not_found(mut self, handler: Arc<dyn Handler>) -> Self {
        self.not_found = handler;
        self
    }

    /// Register a handler for a route. Registering the same route again
    /// overwrites the previous handler.
    pub fn register(&mut self, route: impl Into<String>, handler: Arc<dyn Handler>) {
        self.routes.insert(route.into(), handler);
    }

    /// Consume the router and wrap it in middleware, yielding the full
    /// handler chain that consumer instances dispatch into.
    pub fn compose(self, middlewares: Vec<Arc<dyn Middleware>>) -> Arc<dyn Handler> {
        pipe(middlewares, Arc::new(self))
    }
}

impl Default for Router {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Handler for Router {
    async fn handle(&self, envelope: &mut Envelope) -> ProcessStatus {
        match self.routes.get(&envelope.route) {
            Some(handler) => handler.handle(envelope).await,
            None => self.not_found.handle(envelope).await,
        }
    }
}

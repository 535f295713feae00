use std::sync::Arc;

use async_trait::async_trait;
use futures::future::BoxFuture;

use crate::event::Envelope;

/// Outcome of processing one envelope. Drives exactly one of commit or
/// retry-then-commit, never both.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessStatus {
    /// Handled; commit the offset.
    Success,
    /// Capture the record in the dead-letter store for later replay, then
    /// commit the offset.
    Retry,
    /// Not handled (e.g. no route matched); commit and move on.
    Skip,
}

/// The capability "process one envelope". Route handlers, the not-found
/// handler and every composed middleware chain all present this interface.
#[async_trait]
pub trait Handler: Send + Sync {
    async fn handle(&self, envelope: &mut Envelope) -> ProcessStatus;
}

/// Adapter turning a closure into a [`Handler`].
pub struct HandlerFn<F>(F);

impl<F> HandlerFn<F>
where
    F: for<'a> Fn(&'a mut Envelope) -> BoxFuture<'a, ProcessStatus> + Send + Sync,
{
    pub fn new(f: F) -> Self {
        Self(f)
    }
}

#[async_trait]
impl<F> Handler for HandlerFn<F>
where
    F: for<'a> Fn(&'a mut Envelope) -> BoxFuture<'a, ProcessStatus> + Send + Sync,
{
    async fn handle(&self, envelope: &mut Envelope) -> ProcessStatus {
        (self.0)(envelope).await
    }
}

/// Wraps a handler in another handler. Composition is pure function wrapping,
/// applied once at build time.
pub trait Middleware: Send + Sync {
    fn wrap(&self, next: Arc<dyn Handler>) -> Arc<dyn Handler>;
}

/// Compose middleware around a terminal handler.
///
/// Wrapping happens right-to-left so that execution order equals argument
/// order: the first middleware in the list sees the raw envelope first, the
/// last one sits closest to the terminal handler.
pub fn pipe(middlewares: Vec<Arc<dyn Middleware>>, terminal: Arc<dyn Handler>) -> Arc<dyn Handler> {
    middlewares
        .into_iter()
        .rev()
        .fold(terminal, |next, middleware| middleware.wrap(next))
}

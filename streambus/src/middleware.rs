use std::marker::PhantomData;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use tracing::{error, info};

use crate::event::Envelope;
use crate::handler::{Handler, Middleware, ProcessStatus};
use crate::metrics::{HANDLER_DURATION_SECONDS, HANDLER_EVENTS_TOTAL, HANDLER_FAILURES_TOTAL};

/// Attribute key the [`JsonDeserializer`] middleware stores the decoded value
/// under.
pub const DECODED_JSON_ATTRIBUTE: &str = "decoded_json";

/// Logs every dispatched envelope on entry, and its status plus elapsed time
/// on exit. Never alters the status it observes.
pub struct MessageLogger;

struct MessageLoggerHandler {
    next: Arc<dyn Handler>,
}

#[async_trait]
impl Handler for MessageLoggerHandler {
    async fn handle(&self, envelope: &mut Envelope) -> ProcessStatus {
        info!(
            route = %envelope.route,
            topic = %envelope.topic,
            partition = envelope.partition,
            offset = envelope.offset,
            "received message"
        );
        let start = Instant::now();
        let status = self.next.handle(envelope).await;
        info!(
            route = %envelope.route,
            status = ?status,
            elapsed_ms = start.elapsed().as_millis() as u64,
            "message handled"
        );
        status
    }
}

impl Middleware for MessageLogger {
    fn wrap(&self, next: Arc<dyn Handler>) -> Arc<dyn Handler> {
        Arc::new(MessageLoggerHandler { next })
    }
}

/// Publishes per-route handler metrics: an event counter, a failure counter
/// (a `Retry` outcome counts as a failure) and a duration histogram. The
/// observed status passes through untouched.
pub struct HandlerMetrics;

struct HandlerMetricsHandler {
    next: Arc<dyn Handler>,
}

#[async_trait]
impl Handler for HandlerMetricsHandler {
    async fn handle(&self, envelope: &mut Envelope) -> ProcessStatus {
        let start = Instant::now();
        let status = self.next.handle(envelope).await;

        let route = envelope.route.clone();
        metrics::histogram!(HANDLER_DURATION_SECONDS, "route" => route.clone())
            .record(start.elapsed().as_secs_f64());
        metrics::counter!(HANDLER_EVENTS_TOTAL, "route" => route.clone()).increment(1);
        if status == ProcessStatus::Retry {
            metrics::counter!(HANDLER_FAILURES_TOTAL, "route" => route).increment(1);
        }

        status
    }
}

impl Middleware for HandlerMetrics {
    fn wrap(&self, next: Arc<dyn Handler>) -> Arc<dyn Handler> {
        Arc::new(HandlerMetricsHandler { next })
    }
}

/// Decodes the envelope value as JSON into the [`DECODED_JSON_ATTRIBUTE`]
/// attribute.
///
/// On decode failure the pipeline degrades gracefully rather than aborting:
/// the error is logged, the decoded attribute is cleared, and the next
/// handler still runs with the raw bytes in place.
pub struct JsonDeserializer;

struct JsonDeserializerHandler {
    next: Arc<dyn Handler>,
}

#[async_trait]
impl Handler for JsonDeserializerHandler {
    async fn handle(&self, envelope: &mut Envelope) -> ProcessStatus {
        match serde_json::from_slice::<serde_json::Value>(&envelope.value) {
            Ok(value) => envelope.set_attribute(DECODED_JSON_ATTRIBUTE, value),
            Err(err) => {
                error!(
                    route = %envelope.route,
                    topic = %envelope.topic,
                    error = %err,
                    "failed to decode message value as json"
                );
                envelope.clear_attribute(DECODED_JSON_ATTRIBUTE);
            }
        }
        self.next.handle(envelope).await
    }
}

impl Middleware for JsonDeserializer {
    fn wrap(&self, next: Arc<dyn Handler>) -> Arc<dyn Handler> {
        Arc::new(JsonDeserializerHandler { next })
    }
}

/// Decodes the envelope value as a protobuf message `M` into the envelope's
/// typed extension slot, read back with `envelope.extension::<M>()`.
///
/// Degrades the same way [`JsonDeserializer`] does: on decode failure the
/// error is logged, the extension is cleared, and the next handler still runs
/// with the raw bytes in place.
pub struct ProtobufDeserializer<M> {
    _marker: PhantomData<fn() -> M>,
}

impl<M> ProtobufDeserializer<M> {
    pub fn new() -> Self {
        Self {
            _marker: PhantomData,
        }
    }
}

impl<M> Default for ProtobufDeserializer<M> {
    fn default() -> Self {
        Self::new()
    }
}

struct ProtobufDeserializerHandler<M> {
    next: Arc<dyn Handler>,
    _marker: PhantomData<fn() -> M>,
}

#[async_trait]
impl<M> Handler for ProtobufDeserializerHandler<M>
where
    M: prost::Message + Default + 'static,
{
    async fn handle(&self, envelope: &mut Envelope) -> ProcessStatus {
        match M::decode(&envelope.value[..]) {
            Ok(message) => envelope.set_extension(message),
            Err(err) => {
                error!(
                    route = %envelope.route,
                    topic = %envelope.topic,
                    error = %err,
                    "failed to decode message value as protobuf"
                );
                envelope.clear_extension::<M>();
            }
        }
        self.next.handle(envelope).await
    }
}

impl<M> Middleware for ProtobufDeserializer<M>
where
    M: prost::Message + Default + 'static,
{
    fn wrap(&self, next: Arc<dyn Handler>) -> Arc<dyn Handler> {
        Arc::new(ProtobufDeserializerHandler::<M> {
            next,
            _marker: PhantomData,
        })
    }
}

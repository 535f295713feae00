use std::sync::Arc;

use tracing::{error, info};

use crate::event::Envelope;
use crate::handler::{Handler, ProcessStatus};
use crate::retry::{RetryStore, RetryStoreError};

/// Re-injects drained dead-letter payloads through the handler chain.
///
/// Each payload goes through the same composed chain as a freshly polled
/// record sharing its route key, so deserialization and logging middleware
/// behave identically on replay as on first delivery. A handler that returns
/// `Retry` during replay gets its payload appended back to the store.
pub struct Replayer {
    store: Arc<dyn RetryStore>,
    handler: Arc<dyn Handler>,
}

impl Replayer {
    pub fn new(store: Arc<dyn RetryStore>, handler: Arc<dyn Handler>) -> Self {
        Self { store, handler }
    }

    /// Drain up to `max` payloads for `route` and dispatch each one. Returns
    /// the number of payloads replayed.
    pub async fn replay(&self, route: &str, max: usize) -> Result<usize, RetryStoreError> {
        let payloads = self.store.drain(route, max).await?;
        let count = payloads.len();
        info!(route, count, "replaying dead-letter payloads");

        for payload in payloads {
            let mut envelope = Envelope::from_retry(&payload);
            let status = self.handler.handle(&mut envelope).await;
            if status == ProcessStatus::Retry {
                if let Err(err) = self.store.append(payload).await {
                    error!(route, error = %err, "failed to re-append payload during replay");
                }
            }
        }

        Ok(count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handler::Middleware;
    use crate::middleware::{JsonDeserializer, DECODED_JSON_ATTRIBUTE};
    use crate::retry::{MemoryRetryStore, RetryPayload};
    use crate::router::Router;
    use crate::test_utils::{CallLog, ScriptedHandler};
    use bytes::Bytes;

    fn payload(route: &str, value: &[u8]) -> RetryPayload {
        RetryPayload {
            route: route.to_string(),
            key: Bytes::from_static(b"k"),
            value: Bytes::copy_from_slice(value),
        }
    }

    #[tokio::test]
    async fn replay_runs_payloads_through_the_middleware_chain() {
        let log = CallLog::new();
        let handler = ScriptedHandler::new(ProcessStatus::Success, log.clone());

        let mut router = Router::new();
        router.register("orders", handler.clone());
        let chain = JsonDeserializer.wrap(Arc::new(router));

        let store = Arc::new(MemoryRetryStore::new());
        store.append(payload("orders", b"{\"n\":1}")).await.unwrap();
        store.append(payload("orders", b"{\"n\":2}")).await.unwrap();

        let replayer = Replayer::new(store.clone(), chain);
        let replayed = replayer.replay("orders", 10).await.unwrap();

        assert_eq!(replayed, 2);
        assert_eq!(handler.calls(), 2);
        assert_eq!(store.len("orders").await, 0);
        assert_eq!(
            log.entries(),
            vec!["handle orders {\"n\":1}", "handle orders {\"n\":2}"]
        );
    }

    #[tokio::test]
    async fn retry_during_replay_re_appends_the_payload() {
        let log = CallLog::new();
        let handler = ScriptedHandler::new(ProcessStatus::Retry, log.clone());

        let mut router = Router::new();
        router.register("orders", handler);
        let chain: Arc<dyn Handler> = Arc::new(router);

        let store = Arc::new(MemoryRetryStore::new());
        store.append(payload("orders", b"abc")).await.unwrap();

        let replayer = Replayer::new(store.clone(), chain);
        let replayed = replayer.replay("orders", 10).await.unwrap();

        assert_eq!(replayed, 1);
        assert_eq!(store.len("orders").await, 1);
    }

    #[tokio::test]
    async fn replayed_envelopes_see_deserialization_middleware() {
        struct AssertDecoded(Arc<CallLog>);

        #[async_trait::async_trait]
        impl Handler for AssertDecoded {
            async fn handle(&self, envelope: &mut Envelope) -> ProcessStatus {
                if envelope.attribute(DECODED_JSON_ATTRIBUTE).is_some() {
                    self.0.record("decoded");
                }
                ProcessStatus::Success
            }
        }

        let log = CallLog::new();
        let mut router = Router::new();
        router.register("orders", Arc::new(AssertDecoded(log.clone())));
        let chain = JsonDeserializer.wrap(Arc::new(router));

        let store = Arc::new(MemoryRetryStore::new());
        store.append(payload("orders", b"{\"ok\":true}")).await.unwrap();

        Replayer::new(store, chain).replay("orders", 1).await.unwrap();
        assert_eq!(log.entries(), vec!["decoded"]);
    }
}

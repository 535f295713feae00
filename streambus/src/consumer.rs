use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tracing::{error, info, warn};

use crate::broker::BrokerClient;
use crate::config::{DispatchMode, StreamConfig};
use crate::event::Envelope;
use crate::handler::{Handler, ProcessStatus};
use crate::metrics::{CONSUMER_FATAL_ERRORS_TOTAL, RETRY_APPEND_FAILURES_TOTAL};
use crate::retry::{RetryPayload, RetryStore};
use crate::worker::WorkerPool;

/// How many times a dead-letter append is attempted before the record is
/// logged and dropped instead of being retried forever.
const RETRY_STORE_ATTEMPTS: usize = 3;

/// The per-record contract, shared between ordered dispatch and pool
/// workers: run the handler chain to a terminal status, then commit. On a
/// `Retry` outcome the payload is durably captured before the commit, so a
/// record is either fully handled or captured for replay, never silently
/// lost.
pub(crate) struct Pipeline {
    route: String,
    handler: Arc<dyn Handler>,
    retry_store: Arc<dyn RetryStore>,
    broker: Arc<dyn BrokerClient>,
}

impl Pipeline {
    pub(crate) async fn process(&self, mut envelope: Envelope) {
        let status = self.handler.handle(&mut envelope).await;
        if status == ProcessStatus::Retry {
            self.append_for_retry(&envelope).await;
        }
        self.commit(&envelope).await;
    }

    async fn append_for_retry(&self, envelope: &Envelope) {
        let payload = RetryPayload {
            route: self.route.clone(),
            key: envelope.key.clone(),
            value: envelope.value.clone(),
        };
        for attempt in 1..=RETRY_STORE_ATTEMPTS {
            match self.retry_store.append(payload.clone()).await {
                Ok(()) => return,
                Err(err) if attempt < RETRY_STORE_ATTEMPTS => {
                    warn!(
                        route = %self.route,
                        attempt,
                        error = %err,
                        "retry store append failed, trying again"
                    );
                }
                Err(err) => {
                    metrics::counter!(RETRY_APPEND_FAILURES_TOTAL, "route" => self.route.clone())
                        .increment(1);
                    error!(
                        route = %self.route,
                        error = %err,
                        "dropping record after repeated retry store append failures"
                    );
                }
            }
        }
    }

    async fn commit(&self, envelope: &Envelope) {
        if let Err(err) = self
            .broker
            .commit(&envelope.topic, envelope.partition, envelope.offset)
            .await
        {
            // Accepted redelivery risk: the record was handled, a crash
            // before the next successful commit redelivers it.
            warn!(
                route = %self.route,
                topic = %envelope.topic,
                partition = envelope.partition,
                offset = envelope.offset,
                error = %err,
                "offset commit failed"
            );
        }
    }
}

/// One poll/dispatch/commit loop bound to its own broker connection.
///
/// Shutdown is cooperative: the signal is observed between poll iterations or
/// after the current dispatch resolves, never mid-handler.
pub(crate) struct ConsumerInstance {
    id: String,
    dispatch: DispatchMode,
    poll_timeout: Duration,
    broker: Arc<dyn BrokerClient>,
    pipeline: Arc<Pipeline>,
    shutdown: watch::Receiver<bool>,
}

impl ConsumerInstance {
    pub(crate) fn new(
        config: &StreamConfig,
        id: String,
        broker: Arc<dyn BrokerClient>,
        handler: Arc<dyn Handler>,
        retry_store: Arc<dyn RetryStore>,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        let pipeline = Arc::new(Pipeline {
            route: config.route.clone(),
            handler,
            retry_store,
            broker: broker.clone(),
        });
        Self {
            id,
            dispatch: config.dispatch,
            poll_timeout: config.poll_timeout,
            broker,
            pipeline,
            shutdown,
        }
    }

    pub(crate) async fn run(mut self) {
        info!(instance_id = %self.id, "starting consumer instance");
        match self.dispatch {
            DispatchMode::Ordered => self.run_ordered().await,
            DispatchMode::Pooled { concurrency } => self.run_pooled(concurrency).await,
        }
        if let Err(err) = self.broker.close().await {
            warn!(instance_id = %self.id, error = %err, "error closing broker handle");
        }
        info!(instance_id = %self.id, "consumer instance stopped");
    }

    async fn run_ordered(&mut self) {
        while !*self.shutdown.borrow() {
            match self.broker.poll(self.poll_timeout).await {
                Ok(Some(record)) => {
                    let envelope = Envelope::from_record(&record);
                    self.pipeline.process(envelope).await;
                }
                Ok(None) => {}
                Err(err) if err.is_fatal() => {
                    self.log_fatal(&err);
                    break;
                }
                Err(err) => {
                    warn!(instance_id = %self.id, error = %err, "broker error, continuing to poll");
                }
            }
        }
    }

    async fn run_pooled(&mut self, concurrency: usize) {
        let pool = WorkerPool::new(concurrency);
        let pipeline = self.pipeline.clone();
        let (intake, drained) = pool.run(move |envelope| {
            let pipeline = pipeline.clone();
            async move { pipeline.process(envelope).await }
        });

        while !*self.shutdown.borrow() {
            match self.broker.poll(self.poll_timeout).await {
                Ok(Some(record)) => {
                    let envelope = Envelope::from_record(&record);
                    // A full intake blocks this poll loop: backpressure
                    // instead of unbounded buffering.
                    if intake.send(envelope).await.is_err() {
                        break;
                    }
                }
                Ok(None) => {}
                Err(err) if err.is_fatal() => {
                    self.log_fatal(&err);
                    break;
                }
                Err(err) => {
                    warn!(instance_id = %self.id, error = %err, "broker error, continuing to poll");
                }
            }
        }

        // Let in-flight dispatches reach a terminal status before the
        // broker handle is closed.
        drop(intake);
        if drained.await.is_err() {
            warn!(instance_id = %self.id, "worker pool exited without draining");
        }
    }

    fn log_fatal(&self, err: &crate::broker::BrokerError) {
        metrics::counter!(CONSUMER_FATAL_ERRORS_TOTAL, "instance" => self.id.clone()).increment(1);
        error!(instance_id = %self.id, error = %err, "fatal broker error, terminating instance");
    }
}

use std::future::Future;
use std::sync::Arc;

use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::task::JoinSet;
use tracing::debug;

use crate::event::Envelope;

/// A bounded set of concurrent workers draining one shared intake.
///
/// Pooling trades strict per-partition ordering for throughput: callers that
/// need ordering must dispatch inline instead. The intake is bounded, so a
/// saturated pool applies backpressure to the owning poll loop rather than
/// buffering without limit.
pub struct WorkerPool {
    concurrency: usize,
    capacity: usize,
}

impl WorkerPool {
    pub fn new(concurrency: usize) -> Self {
        let concurrency = concurrency.max(1);
        Self {
            concurrency,
            capacity: concurrency * 2,
        }
    }

    /// Spawn the workers. Each envelope pulled from the intake is run through
    /// `process` to a terminal status. Closing the intake lets in-flight
    /// items finish; the returned signal fires once every submitted envelope
    /// has been processed.
    pub fn run<F, Fut>(&self, process: F) -> (mpsc::Sender<Envelope>, oneshot::Receiver<()>)
    where
        F: Fn(Envelope) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let (intake, rx) = mpsc::channel(self.capacity);
        let rx = Arc::new(Mutex::new(rx));
        let process = Arc::new(process);

        let mut workers = JoinSet::new();
        for worker_id in 0..self.concurrency {
            let rx = rx.clone();
            let process = process.clone();
            workers.spawn(async move {
                loop {
                    // Hold the lock only while waiting for the next item, so
                    // other workers can pull while this one processes.
                    let next = { rx.lock().await.recv().await };
                    match next {
                        Some(envelope) => (*process)(envelope).await,
                        None => break,
                    }
                }
                debug!(worker_id, "worker drained");
            });
        }

        let (drained_tx, drained) = oneshot::channel();
        tokio::spawn(async move {
            while workers.join_next().await.is_some() {}
            let _send = drained_tx.send(());
        });

        (intake, drained)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex as StdMutex;
    use std::time::Duration;

    use super::*;
    use crate::event::Envelope;
    use crate::test_utils::routed_record;

    fn envelope_at(offset: i64) -> Envelope {
        Envelope::from_record(&routed_record("t", 0, offset, "r", b"x"))
    }

    #[tokio::test]
    async fn single_worker_preserves_submission_order() {
        let seen = Arc::new(StdMutex::new(Vec::new()));
        let pool = WorkerPool::new(1);
        let sink = seen.clone();
        let (intake, drained) = pool.run(move |envelope: Envelope| {
            let sink = sink.clone();
            async move {
                sink.lock().unwrap().push(envelope.offset);
            }
        });

        for offset in 0..100 {
            intake.send(envelope_at(offset)).await.unwrap();
        }
        drop(intake);
        drained.await.unwrap();

        let seen = seen.lock().unwrap();
        assert_eq!(*seen, (0..100).collect::<Vec<i64>>());
    }

    #[tokio::test]
    async fn drained_signal_waits_for_in_flight_items() {
        let seen = Arc::new(StdMutex::new(Vec::new()));
        let pool = WorkerPool::new(4);
        let sink = seen.clone();
        let (intake, drained) = pool.run(move |envelope: Envelope| {
            let sink = sink.clone();
            async move {
                tokio::time::sleep(Duration::from_millis(5)).await;
                sink.lock().unwrap().push(envelope.offset);
            }
        });

        for offset in 0..20 {
            intake.send(envelope_at(offset)).await.unwrap();
        }
        drop(intake);
        drained.await.unwrap();

        // No ordering guarantee, but nothing may be lost.
        let mut seen = seen.lock().unwrap().clone();
        seen.sort_unstable();
        assert_eq!(seen, (0..20).collect::<Vec<i64>>());
    }
}

//! Test doubles shared by unit and integration tests: a scripted broker, a
//! recording retry store, and a call log for asserting cross-component call
//! order.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::{sleep, Instant};

use crate::broker::{BrokerClient, BrokerError, BrokerFactory, Record};
use crate::config::StreamConfig;
use crate::event::{Envelope, ROUTE_HEADER};
use crate::handler::{Handler, ProcessStatus};
use crate::retry::{MemoryRetryStore, RetryPayload, RetryStore, RetryStoreError};

/// Shared, ordered log of observable calls across test doubles. Call-order
/// assertions (e.g. append-before-commit) read the whole log at once.
pub struct CallLog {
    entries: Mutex<Vec<String>>,
}

impl CallLog {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            entries: Mutex::new(Vec::new()),
        })
    }

    pub fn record(&self, entry: impl Into<String>) {
        self.entries.lock().unwrap().push(entry.into());
    }

    pub fn entries(&self) -> Vec<String> {
        self.entries.lock().unwrap().clone()
    }
}

/// Build a record whose headers carry the given route key.
pub fn routed_record(topic: &str, partition: i32, offset: i64, route: &str, value: &[u8]) -> Record {
    let mut headers = HashMap::new();
    headers.insert(ROUTE_HEADER.to_string(), route.to_string());
    Record {
        key: Some(b"key".to_vec()),
        value: Some(value.to_vec()),
        topic: topic.to_string(),
        partition,
        offset,
        timestamp_ms: Some(1_700_000_000_000),
        headers,
    }
}

/// Poll until `condition` holds or `timeout` elapses. Returns whether the
/// condition held.
pub async fn wait_until<F: Fn() -> bool>(condition: F, timeout: Duration) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        sleep(Duration::from_millis(5)).await;
    }
    condition()
}

enum ScriptItem {
    Record(Record),
    Error(BrokerError),
}

/// Scripted broker client: polls pop pre-loaded outcomes in order, and once
/// the script is exhausted every poll idles for the full timeout, like a
/// quiet topic.
pub struct FakeBroker {
    script: Mutex<VecDeque<ScriptItem>>,
    commits: Mutex<Vec<(String, i32, i64)>>,
    log: Arc<CallLog>,
}

impl FakeBroker {
    pub fn new(log: Arc<CallLog>) -> Self {
        Self {
            script: Mutex::new(VecDeque::new()),
            commits: Mutex::new(Vec::new()),
            log,
        }
    }

    pub fn push_record(&self, record: Record) {
        self.script.lock().unwrap().push_back(ScriptItem::Record(record));
    }

    pub fn push_error(&self, err: BrokerError) {
        self.script.lock().unwrap().push_back(ScriptItem::Error(err));
    }

    pub fn commits(&self) -> Vec<(String, i32, i64)> {
        self.commits.lock().unwrap().clone()
    }
}

#[async_trait]
impl BrokerClient for FakeBroker {
    async fn poll(&self, timeout: Duration) -> Result<Option<Record>, BrokerError> {
        let next = self.script.lock().unwrap().pop_front();
        match next {
            Some(ScriptItem::Record(record)) => Ok(Some(record)),
            Some(ScriptItem::Error(err)) => Err(err),
            None => {
                sleep(timeout).await;
                Ok(None)
            }
        }
    }

    async fn commit(&self, topic: &str, partition: i32, offset: i64) -> Result<(), BrokerError> {
        self.log
            .record(format!("commit {topic}:{partition}@{offset}"));
        self.commits
            .lock()
            .unwrap()
            .push((topic.to_string(), partition, offset));
        Ok(())
    }

    async fn close(&self) -> Result<(), BrokerError> {
        self.log.record("close");
        Ok(())
    }
}

/// Hands out pre-loaded [`FakeBroker`]s, or fresh idle ones once the queue is
/// empty. Can be told to fail the next N connects.
pub struct FakeFactory {
    brokers: Mutex<VecDeque<Arc<FakeBroker>>>,
    fail_connects: Mutex<usize>,
    log: Arc<CallLog>,
}

impl FakeFactory {
    pub fn new(log: Arc<CallLog>) -> Self {
        Self {
            brokers: Mutex::new(VecDeque::new()),
            fail_connects: Mutex::new(0),
            log,
        }
    }

    pub fn push(&self, broker: Arc<FakeBroker>) {
        self.brokers.lock().unwrap().push_back(broker);
    }

    pub fn fail_next_connects(&self, count: usize) {
        *self.fail_connects.lock().unwrap() = count;
    }
}

impl BrokerFactory for FakeFactory {
    fn connect(
        &self,
        _config: &StreamConfig,
        instance_id: &str,
    ) -> Result<Arc<dyn BrokerClient>, BrokerError> {
        {
            let mut fail = self.fail_connects.lock().unwrap();
            if *fail > 0 {
                *fail -= 1;
                return Err(BrokerError::Subscribe("scripted failure".to_string()));
            }
        }
        self.log.record(format!("connect {instance_id}"));
        let broker = self
            .brokers
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Arc::new(FakeBroker::new(self.log.clone())));
        Ok(broker)
    }
}

/// A [`MemoryRetryStore`] that records every append/drain in the shared call
/// log and can be told to fail the next N appends.
pub struct RecordingRetryStore {
    inner: MemoryRetryStore,
    fail_appends: Mutex<usize>,
    append_attempts: AtomicUsize,
    log: Arc<CallLog>,
}

impl RecordingRetryStore {
    pub fn new(log: Arc<CallLog>) -> Self {
        Self {
            inner: MemoryRetryStore::new(),
            fail_appends: Mutex::new(0),
            append_attempts: AtomicUsize::new(0),
            log,
        }
    }

    pub fn fail_next_appends(&self, count: usize) {
        *self.fail_appends.lock().unwrap() = count;
    }

    pub fn append_attempts(&self) -> usize {
        self.append_attempts.load(Ordering::SeqCst)
    }

    pub async fn len(&self, route: &str) -> usize {
        self.inner.len(route).await
    }

    pub async fn payloads(&self, route: &str) -> Vec<RetryPayload> {
        let drained = self.inner.drain(route, usize::MAX).await.unwrap_or_default();
        for payload in &drained {
            // Put them back so inspection is non-destructive.
            let _append = self.inner.append(payload.clone()).await;
        }
        drained
    }
}

#[async_trait]
impl RetryStore for RecordingRetryStore {
    async fn append(&self, payload: RetryPayload) -> Result<(), RetryStoreError> {
        self.append_attempts.fetch_add(1, Ordering::SeqCst);
        {
            let mut fail = self.fail_appends.lock().unwrap();
            if *fail > 0 {
                *fail -= 1;
                return Err(RetryStoreError::Unavailable);
            }
        }
        self.log.record(format!(
            "append {} {}",
            payload.route,
            String::from_utf8_lossy(&payload.value)
        ));
        self.inner.append(payload).await
    }

    async fn drain(&self, route: &str, max: usize) -> Result<Vec<RetryPayload>, RetryStoreError> {
        self.log.record(format!("drain {route}"));
        self.inner.drain(route, max).await
    }
}

/// Handler returning a fixed status, counting its calls and recording each
/// envelope it sees in the call log.
pub struct ScriptedHandler {
    status: ProcessStatus,
    delay: Option<Duration>,
    calls: AtomicUsize,
    log: Arc<CallLog>,
}

impl ScriptedHandler {
    pub fn new(status: ProcessStatus, log: Arc<CallLog>) -> Arc<Self> {
        Arc::new(Self {
            status,
            delay: None,
            calls: AtomicUsize::new(0),
            log,
        })
    }

    /// Like [`ScriptedHandler::new`], but each dispatch takes `delay` before
    /// resolving. Used to hold a dispatch in flight across a shutdown.
    pub fn with_delay(status: ProcessStatus, delay: Duration, log: Arc<CallLog>) -> Arc<Self> {
        Arc::new(Self {
            status,
            delay: Some(delay),
            calls: AtomicUsize::new(0),
            log,
        })
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Handler for ScriptedHandler {
    async fn handle(&self, envelope: &mut Envelope) -> ProcessStatus {
        if let Some(delay) = self.delay {
            sleep(delay).await;
        }
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.log.record(format!(
            "handle {} {}",
            envelope.route,
            String::from_utf8_lossy(&envelope.value)
        ));
        self.status
    }
}

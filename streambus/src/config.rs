use std::time::Duration;

use crate::manager::StartError;

/// Default bounded poll timeout. Short enough that shutdown is observed
/// promptly between poll iterations.
pub const DEFAULT_POLL_TIMEOUT: Duration = Duration::from_millis(100);

/// How a consumer instance hands records to the handler chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchMode {
    /// Await the terminal status of each record before polling the next one.
    /// Preserves per-partition ordering.
    Ordered,
    /// Submit records to a bounded worker pool. Higher throughput, but
    /// ordering across records is explicitly not guaranteed.
    Pooled { concurrency: usize },
}

/// Configuration for one stream: a named route fed by `instances` consumer
/// instances sharing a consumer group. Immutable once its stream starts.
#[derive(Debug, Clone)]
pub struct StreamConfig {
    /// Route name, used for handler registration and dead-letter keying.
    pub route: String,
    /// Comma-separated broker addresses.
    pub brokers: String,
    /// Topics this route consumes.
    pub topics: Vec<String>,
    /// Consumer group id shared by all instances of this stream, so the
    /// broker distributes partitions across them.
    pub group_id: String,
    /// Number of consumer instances to spawn.
    pub instances: usize,
    pub dispatch: DispatchMode,
    pub poll_timeout: Duration,
}

impl StreamConfig {
    pub fn new(
        route: impl Into<String>,
        brokers: impl Into<String>,
        topics: Vec<String>,
        group_id: impl Into<String>,
    ) -> Self {
        Self {
            route: route.into(),
            brokers: brokers.into(),
            topics,
            group_id: group_id.into(),
            instances: 1,
            dispatch: DispatchMode::Ordered,
            poll_timeout: DEFAULT_POLL_TIMEOUT,
        }
    }

    /// Start-time validation. These are the only errors that fail stream
    /// start outright; everything at runtime resolves to a per-record
    /// commit/retry outcome instead.
    pub(crate) fn validate(&self) -> Result<(), StartError> {
        if self.topics.is_empty() || self.topics.iter().any(|t| t.is_empty()) {
            return Err(StartError::EmptyTopics {
                route: self.route.clone(),
            });
        }
        if self.brokers.is_empty() {
            return Err(StartError::EmptyBrokers {
                route: self.route.clone(),
            });
        }
        if self.group_id.is_empty() {
            return Err(StartError::EmptyGroupId {
                route: self.route.clone(),
            });
        }
        if self.instances == 0 {
            return Err(StartError::NoInstances {
                route: self.route.clone(),
            });
        }
        Ok(())
    }
}

use std::collections::HashSet;
use std::sync::Arc;

use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{error, info};

use crate::broker::BrokerFactory;
use crate::config::StreamConfig;
use crate::consumer::ConsumerInstance;
use crate::handler::Handler;
use crate::retry::RetryStore;

#[derive(Debug, thiserror::Error)]
pub enum StartError {
    #[error("stream {route}: no topics configured")]
    EmptyTopics { route: String },
    #[error("stream {route}: no broker addresses configured")]
    EmptyBrokers { route: String },
    #[error("stream {route}: consumer group id is empty")]
    EmptyGroupId { route: String },
    #[error("stream {route}: instance count must be at least 1")]
    NoInstances { route: String },
    #[error("duplicate route: {route}")]
    DuplicateRoute { route: String },
}

/// Supervises all consumer instances across all routes: fans out start,
/// aggregates shutdown.
pub struct StreamManager {
    factory: Arc<dyn BrokerFactory>,
    retry_store: Arc<dyn RetryStore>,
}

impl StreamManager {
    pub fn new(factory: Arc<dyn BrokerFactory>, retry_store: Arc<dyn RetryStore>) -> Self {
        Self {
            factory,
            retry_store,
        }
    }

    /// Validate every config, then spawn `instances` consumer tasks per
    /// stream, all sharing one consumer group id per stream (broker-side
    /// rebalancing spreads partitions across them) and one shutdown signal.
    ///
    /// A broker connect/subscribe failure is fatal to that instance only: it
    /// is logged and the instance never enters its poll loop, but the join
    /// barrier still accounts for it, so shutdown is never blocked.
    pub fn start(
        &self,
        configs: Vec<StreamConfig>,
        handler: Arc<dyn Handler>,
    ) -> Result<StreamHandle, StartError> {
        let mut routes = HashSet::new();
        for config in &configs {
            config.validate()?;
            if !routes.insert(config.route.clone()) {
                return Err(StartError::DuplicateRoute {
                    route: config.route.clone(),
                });
            }
        }

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let mut instances = JoinSet::new();

        for config in configs {
            info!(
                route = %config.route,
                group_id = %config.group_id,
                instances = config.instances,
                topics = ?config.topics,
                "starting stream"
            );
            for index in 0..config.instances {
                let instance_id = format!("{}-{}-{}", config.route, config.group_id, index);
                let factory = self.factory.clone();
                let retry_store = self.retry_store.clone();
                let handler = handler.clone();
                let shutdown = shutdown_rx.clone();
                let config = config.clone();
                instances.spawn(async move {
                    let broker = match factory.connect(&config, &instance_id) {
                        Ok(broker) => broker,
                        Err(err) => {
                            error!(
                                instance_id = %instance_id,
                                error = %err,
                                "failed to connect consumer, instance will not start"
                            );
                            return;
                        }
                    };
                    ConsumerInstance::new(
                        &config,
                        instance_id,
                        broker,
                        handler,
                        retry_store,
                        shutdown,
                    )
                    .run()
                    .await;
                });
            }
        }

        Ok(StreamHandle {
            shutdown: shutdown_tx,
            instances,
        })
    }
}

/// Handle over a started set of streams: a global stop signal plus the join
/// barrier over every spawned consumer instance.
pub struct StreamHandle {
    shutdown: watch::Sender<bool>,
    instances: JoinSet<()>,
}

impl StreamHandle {
    /// Signal every consumer instance to stop. Global and idempotent:
    /// instances are never stopped individually, and repeated calls are
    /// harmless.
    pub fn stop(&self) {
        let _send = self.shutdown.send(true);
    }

    /// Resolves only once every consumer instance has stopped.
    pub async fn join(mut self) {
        while self.instances.join_next().await.is_some() {}
    }

    /// Stop then join.
    pub async fn shutdown(self) {
        self.stop();
        self.join().await;
    }
}

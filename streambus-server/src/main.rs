//! Control-plane binary: runs a demo stream end to end and exposes the
//! replay/liveness/metrics endpoints over HTTP.

use std::sync::Arc;

use async_trait::async_trait;
use envconfig::Envconfig;
use tokio::signal;
use tracing::info;

use streambus::broker::KafkaFactory;
use streambus::config::{DispatchMode, StreamConfig};
use streambus::event::Envelope;
use streambus::handler::{Handler, Middleware, ProcessStatus};
use streambus::manager::StreamManager;
use streambus::metrics::setup_metrics_recorder;
use streambus::middleware::{
    HandlerMetrics, JsonDeserializer, MessageLogger, DECODED_JSON_ATTRIBUTE,
};
use streambus::replay::Replayer;
use streambus::retry::{MemoryRetryStore, PgRetryStore, RetryStore};
use streambus::router::Router;

mod config;
mod handlers;

use config::Config;

/// Demo route handler: logs what it received and succeeds.
struct EchoHandler;

#[async_trait]
impl Handler for EchoHandler {
    async fn handle(&self, envelope: &mut Envelope) -> ProcessStatus {
        match envelope.attribute(DECODED_JSON_ATTRIBUTE) {
            Some(value) => info!(route = %envelope.route, %value, "handled decoded event"),
            None => info!(
                route = %envelope.route,
                bytes = envelope.value.len(),
                "handled raw event"
            ),
        }
        ProcessStatus::Success
    }
}

async fn shutdown() {
    let mut term = signal::unix::signal(signal::unix::SignalKind::terminate())
        .expect("failed to register SIGTERM handler");

    let mut interrupt = signal::unix::signal(signal::unix::SignalKind::interrupt())
        .expect("failed to register SIGINT handler");

    tokio::select! {
        _ = term.recv() => {},
        _ = interrupt.recv() => {},
    };

    tracing::info!("shutting down gracefully...");
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt::init();

    let config = Config::init_from_env().expect("failed to load configuration from env");

    let retry_store: Arc<dyn RetryStore> = match &config.database_url {
        Some(url) => {
            let store = PgRetryStore::new(url, config.max_pg_connections)
                .await
                .expect("failed to connect to the retry store database");
            store
                .ensure_schema()
                .await
                .expect("failed to prepare the dead_letters table");
            Arc::new(store)
        }
        None => Arc::new(MemoryRetryStore::new()),
    };

    let mut router = Router::new();
    router.register(&config.demo_route, Arc::new(EchoHandler));
    let middlewares: Vec<Arc<dyn Middleware>> = vec![
        Arc::new(MessageLogger),
        Arc::new(HandlerMetrics),
        Arc::new(JsonDeserializer),
    ];
    let chain = router.compose(middlewares);

    let mut stream = StreamConfig::new(
        config.demo_route.clone(),
        config.kafka_hosts.clone(),
        vec![config.demo_topic.clone()],
        config.consumer_group.clone(),
    );
    stream.instances = config.consumer_instances;
    if config.worker_concurrency > 0 {
        stream.dispatch = DispatchMode::Pooled {
            concurrency: config.worker_concurrency,
        };
    }

    let manager = StreamManager::new(Arc::new(KafkaFactory), retry_store.clone());
    let handle = manager
        .start(vec![stream], chain.clone())
        .expect("invalid stream configuration");

    let replayer = Arc::new(Replayer::new(retry_store, chain));
    let recorder_handle = setup_metrics_recorder();
    let app = handlers::app(replayer, Some(recorder_handle));

    let bind = config.bind();
    info!(%bind, "starting control-plane server");
    let listener = tokio::net::TcpListener::bind(&bind)
        .await
        .expect("failed to bind control-plane listener");

    if let Err(err) = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown())
        .await
    {
        tracing::error!(error = %err, "control-plane server error");
    }

    info!("stopping streams");
    handle.shutdown().await;
    info!("all consumer instances stopped");
}

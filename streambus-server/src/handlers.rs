use std::future::ready;
use std::sync::Arc;
use std::time::Instant;

use axum::body::Body;
use axum::extract::{MatchedPath, Path, State};
use axum::http::{Request, StatusCode};
use axum::middleware::Next;
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::Router;
use metrics_exporter_prometheus::PrometheusHandle;
use tower_http::trace::TraceLayer;

use streambus::replay::Replayer;

#[derive(Clone)]
pub struct AppState {
    pub replayer: Arc<Replayer>,
}

pub fn app(replayer: Arc<Replayer>, metrics: Option<PrometheusHandle>) -> Router {
    let state = AppState { replayer };

    let router = Router::new()
        .route("/", get(index))
        .route("/ping", get(ping))
        .route("/replay/:route/:count", post(replay))
        .layer(TraceLayer::new_for_http())
        .layer(axum::middleware::from_fn(track_metrics))
        .with_state(state);

    // Don't install the scrape route unless a recorder was set up; tests
    // build the app without one.
    match metrics {
        Some(handle) => router.route("/metrics", get(move || ready(handle.render()))),
        None => router,
    }
}

async fn index() -> &'static str {
    "streambus"
}

async fn ping() -> &'static str {
    "pong"
}

async fn replay(
    State(state): State<AppState>,
    Path((route, count)): Path<(String, usize)>,
) -> impl IntoResponse {
    match state.replayer.replay(&route, count).await {
        Ok(replayed) => (
            StatusCode::OK,
            format!("replayed {replayed} payloads for route {route}\n"),
        ),
        Err(err) => {
            tracing::error!(route = %route, error = %err, "replay failed");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                format!("replay failed: {err}\n"),
            )
        }
    }
}

/// Middleware to record some common HTTP metrics for the control-plane.
async fn track_metrics(req: Request<Body>, next: Next) -> impl IntoResponse {
    let start = Instant::now();

    let path = if let Some(matched_path) = req.extensions().get::<MatchedPath>() {
        matched_path.as_str().to_owned()
    } else {
        req.uri().path().to_owned()
    };

    let method = req.method().clone();

    let response = next.run(req).await;

    let latency = start.elapsed().as_secs_f64();
    let status = response.status().as_u16().to_string();

    let labels = [
        ("method", method.to_string()),
        ("path", path),
        ("status", status),
    ];

    metrics::counter!("streambus_http_requests_total", &labels).increment(1);
    metrics::histogram!("streambus_http_requests_duration_seconds", &labels).record(latency);

    response
}

//! HTTP and websocket front end for the Callbox signaling relay.

pub mod config;
pub mod handlers;
pub mod hub;
pub mod probe;
pub mod telemetry;
pub mod websocket;

use std::sync::Arc;

use axum::{http::Method, routing::get};
use callbox_core::{Router as SignalingRouter, RouterConfig};
use metrics_exporter_prometheus::PrometheusHandle;
use tower_http::{
    cors::{AllowOrigin, CorsLayer},
    trace::TraceLayer,
};

use crate::{
    config::{AllowedOrigins, ServerConfig},
    hub::ConnectionHub,
};

pub struct AppState {
    pub router: SignalingRouter,
    pub hub: ConnectionHub,
    metrics: PrometheusHandle,
}

impl AppState {
    pub fn new(config: &ServerConfig, metrics: PrometheusHandle) -> Arc<Self> {
        let hub = ConnectionHub::new(config.outbound_buffer);
        let router = SignalingRouter::new(
            RouterConfig {
                max_pending_candidates: config.max_pending_candidates,
            },
            Arc::new(hub.clone()),
        );
        Arc::new(Self {
            router,
            hub,
            metrics,
        })
    }

    pub fn render_metrics(&self) -> String {
        self.metrics.render()
    }
}

pub fn app(state: Arc<AppState>, origins: &AllowedOrigins) -> axum::Router {
    axum::Router::new()
        .route("/", get(handlers::health))
        .route("/health", get(handlers::health))
        .route("/users", get(handlers::users))
        .route("/debug/stats", get(handlers::stats))
        .route("/metrics", get(handlers::metrics))
        .route("/ws", get(websocket::ws_handler))
        .with_state(state)
        .layer(cors_layer(origins))
        .layer(TraceLayer::new_for_http())
}

fn cors_layer(origins: &AllowedOrigins) -> CorsLayer {
    let allow_origin = match origins {
        AllowedOrigins::Any => AllowOrigin::any(),
        AllowedOrigins::List(list) => AllowOrigin::list(list.iter().cloned()),
    };
    CorsLayer::new()
        .allow_origin(allow_origin)
        .allow_methods([Method::GET, Method::POST])
}

use std::sync::Arc;

use axum::{extract::State, http::header, response::IntoResponse, Json};
use callbox_core::User;
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::AppState;

#[derive(Debug, Serialize, Deserialize)]
pub struct UsersResponse {
    pub users: Vec<User>,
}

#[derive(Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct StatsResponse {
    pub connections: usize,
    pub registered_users: usize,
    pub attached_sockets: usize,
    pub sessions: SessionCounts,
}

#[derive(Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct SessionCounts {
    pub offering: usize,
    pub connected: usize,
}

pub async fn health() -> impl IntoResponse {
    Json(json!({ "status": "ok" }))
}

pub async fn users(State(state): State<Arc<AppState>>) -> Json<UsersResponse> {
    Json(UsersResponse {
        users: state.router.users(),
    })
}

pub async fn stats(State(state): State<Arc<AppState>>) -> Json<StatsResponse> {
    let stats = state.router.stats();
    Json(StatsResponse {
        connections: stats.connections,
        registered_users: stats.registered_users,
        attached_sockets: state.hub.len(),
        sessions: SessionCounts {
            offering: stats.calls_offering,
            connected: stats.calls_connected,
        },
    })
}

pub async fn metrics(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let body = state.render_metrics();
    ([(header::CONTENT_TYPE, "text/plain; version=0.0.4")], body)
}

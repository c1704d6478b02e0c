//! Administrative HTTP surface.
//!
//! A small axum router on the admin port: a status snapshot (clients,
//! uplinks, counters) and endpoint management: registering an uplink at
//! runtime and flipping its status (`up`, `down`, `migrate`). There is no
//! authentication layer here; the admin port is expected to be reachable
//! only from the operator network.

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use serde::Deserialize;
use std::sync::Arc;
use tether_core::{
    client::ConnectionManager,
    types::{Role, UplinkAction},
};

/// Builds the admin router over the shared connection manager.
pub fn router(manager: Arc<ConnectionManager>) -> Router {
    Router::new()
        .route("/", get(index))
        .route("/status", get(status))
        .route("/uplinks", post(add_uplink))
        .route("/uplinks/{uplink}/{action}", post(set_uplink_status))
        .with_state(manager)
}

async fn index() -> &'static str {
    "tether-proxy"
}

async fn status(State(manager): State<Arc<ConnectionManager>>) -> impl IntoResponse {
    Json(manager.status())
}

#[derive(Debug, Deserialize)]
struct AddUplinkRequest {
    role: Role,
    url: String,
}

async fn add_uplink(
    State(manager): State<Arc<ConnectionManager>>,
    Json(request): Json<AddUplinkRequest>,
) -> impl IntoResponse {
    if !request.url.starts_with("ws://") && !request.url.starts_with("wss://") {
        return (
            StatusCode::BAD_REQUEST,
            Json(serde_json::json!({"error": "url must be ws:// or wss://"})),
        );
    }
    manager.add_uplink(request.role, &request.url);
    tracing::info!(role = %request.role, url = %request.url, "admin registered uplink");
    (
        StatusCode::OK,
        Json(serde_json::json!({"role": request.role, "url": request.url, "healthy": false})),
    )
}

async fn set_uplink_status(
    State(manager): State<Arc<ConnectionManager>>,
    Path((uplink, action)): Path<(String, String)>,
) -> impl IntoResponse {
    let Ok(action) = action.parse::<UplinkAction>() else {
        return (
            StatusCode::BAD_REQUEST,
            Json(serde_json::json!({"error": "action must be up, down or migrate"})),
        );
    };
    match manager.set_uplink_status(&uplink, action) {
        Some(uri) => {
            tracing::info!(endpoint = %uri, ?action, "admin uplink status change");
            (StatusCode::OK, Json(serde_json::json!({"uplink": uri, "action": action})))
        }
        None => (
            StatusCode::NOT_FOUND,
            Json(serde_json::json!({"error": "unknown uplink"})),
        ),
    }
}

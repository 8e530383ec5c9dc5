//! HTTP boundary: health, admin notifications, and the websocket upgrade.

use axum::{
    Json, Router,
    extract::{Query, State, ws::WebSocketUpgrade},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
};
use bytes::Bytes;
use serde::Deserialize;
use serde_json::json;
use tower_http::trace::TraceLayer;

use crate::{
    config::{ConnectionSettings, scope_or_default},
    connection,
    hub::HubHandle,
};

#[derive(Clone)]
pub struct AppState {
    pub hub: HubHandle,
    pub settings: ConnectionSettings,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/stats", get(stats))
        .route("/notify/user", post(notify_user))
        .route("/notify/redis", post(notify_identities))
        .route("/ws", get(websocket))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

#[derive(Debug, Deserialize)]
struct ConnectQuery {
    id: Option<String>,
    group: Option<String>,
}

#[derive(Debug, Deserialize)]
struct NotifyUserQuery {
    id: Option<String>,
    message: Option<String>,
}

#[derive(Debug, Deserialize)]
struct NotifyIdentitiesQuery {
    ids: Option<String>,
    message: Option<String>,
}

async fn health() -> Json<serde_json::Value> {
    Json(json!({ "status": "ok" }))
}

async fn stats(State(state): State<AppState>) -> Response {
    match state.hub.stats().await {
        Some(stats) => Json(stats).into_response(),
        None => error(StatusCode::SERVICE_UNAVAILABLE, "hub stopped"),
    }
}

async fn notify_user(
    State(state): State<AppState>,
    Query(query): Query<NotifyUserQuery>,
) -> Response {
    let Some(identity) = query.id.filter(|id| !id.is_empty()) else {
        return error(StatusCode::BAD_REQUEST, "missing id");
    };
    let message = non_empty_or(query.message, "notification");

    if !state.hub.send_to_user(&identity, Bytes::from(message)).await {
        return error(StatusCode::SERVICE_UNAVAILABLE, "hub stopped");
    }
    Json(json!({ "status": "sent" })).into_response()
}

async fn notify_identities(
    State(state): State<AppState>,
    Query(query): Query<NotifyIdentitiesQuery>,
) -> Response {
    let Some(raw_ids) = query.ids.filter(|ids| !ids.is_empty()) else {
        return error(StatusCode::BAD_REQUEST, "missing ids");
    };
    let identities: Vec<&str> = raw_ids
        .split(',')
        .map(str::trim)
        .filter(|id| !id.is_empty())
        .collect();
    if identities.is_empty() {
        return error(StatusCode::BAD_REQUEST, "no valid ids");
    }
    let message = non_empty_or(query.message, "redis notification");

    let published = state
        .hub
        .publish_to_identities(&identities, message.as_bytes());
    Json(json!({
        "status": "sent",
        "count": identities.len(),
        "published": published,
    }))
    .into_response()
}

async fn websocket(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    Query(query): Query<ConnectQuery>,
) -> Response {
    let identity = scope_or_default(query.id);
    let group = scope_or_default(query.group);
    let AppState { hub, settings } = state;

    ws.max_message_size(settings.max_message_size)
        .on_upgrade(move |socket| connection::serve(socket, hub, identity, group, settings))
}

fn non_empty_or(value: Option<String>, fallback: &str) -> String {
    value
        .filter(|value| !value.is_empty())
        .unwrap_or_else(|| fallback.to_string())
}

fn error(status: StatusCode, message: &str) -> Response {
    (status, Json(json!({ "error": message }))).into_response()
}

//! HTTP + WebSocket bridge between the foreground app and the engine.
//!
//! The foreground app uses it to push the identity handshake, save reminder
//! settings and follow the delivery history live.

use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{
        Path, Query, State,
        ws::{Message, WebSocket, WebSocketUpgrade},
    },
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
};
use chrono::Utc;
use serde::Deserialize;
use tokio::sync::broadcast::error::RecvError;
use tower_http::cors::CorsLayer;
use tracing::{debug, error, info, warn};

use crate::error::Error;
use crate::reminders::settings::{self, ReminderSettings};
use crate::reminders::{DeliveryAgent, Identity, Reconciler};
use crate::store::Database;

/// Application state shared across handlers.
#[derive(Clone)]
pub struct AppState {
    pub db: Arc<dyn Database>,
    pub reconciler: Reconciler,
    pub agent: Arc<DeliveryAgent>,
}

/// Build the Axum router with the bridge REST and WebSocket routes.
pub fn reminder_routes(db: Arc<dyn Database>, agent: Arc<DeliveryAgent>) -> Router {
    let state = AppState {
        reconciler: Reconciler::new(Arc::clone(&db)),
        db,
        agent,
    };

    Router::new()
        .route("/health", get(health))
        .route("/ws/notifications", get(ws_handler))
        .route("/api/identity", post(set_identity).delete(clear_identity))
        .route(
            "/api/users/{user_id}/settings",
            get(get_settings).put(put_settings),
        )
        .route("/api/users/{user_id}/reminders", get(list_reminders))
        .route("/api/reconcile", post(reconcile_all))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

fn internal_error(context: &str, e: impl std::fmt::Display) -> (StatusCode, Json<serde_json::Value>) {
    error!("{context}: {e}");
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(serde_json::json!({"error": format!("{context}: {e}")})),
    )
}

// ── Health ──────────────────────────────────────────────────────────────

async fn health() -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok",
        "service": "health-reminders"
    }))
}

// ── Identity handshake ──────────────────────────────────────────────────

#[derive(Deserialize)]
struct IdentityRequest {
    user_id: String,
    #[serde(default)]
    access_token: String,
}

async fn set_identity(
    State(state): State<AppState>,
    Json(body): Json<IdentityRequest>,
) -> impl IntoResponse {
    let user_id = body.user_id.trim();
    if user_id.is_empty() {
        return (
            StatusCode::BAD_REQUEST,
            Json(serde_json::json!({"error": "user_id must not be empty"})),
        );
    }

    match state
        .agent
        .set_identity(Identity::new(user_id, body.access_token), Utc::now())
        .await
    {
        Ok(handshake) => (StatusCode::OK, Json(serde_json::json!(handshake))),
        Err(e) => internal_error("Handshake failed", e),
    }
}

async fn clear_identity(State(state): State<AppState>) -> impl IntoResponse {
    let cleared = state.agent.clear_identity().await;
    Json(serde_json::json!({"cleared": cleared}))
}

// ── Settings ────────────────────────────────────────────────────────────

async fn get_settings(
    State(state): State<AppState>,
    Path(user_id): Path<String>,
) -> impl IntoResponse {
    match settings::load_settings(state.db.as_ref(), &user_id).await {
        Ok(Some(stored)) => (
            StatusCode::OK,
            Json(serde_json::json!({"stored": true, "settings": stored})),
        ),
        Ok(None) => (
            StatusCode::OK,
            Json(serde_json::json!({"stored": false, "settings": ReminderSettings::default()})),
        ),
        Err(e) => internal_error("Failed to load settings", e),
    }
}

async fn put_settings(
    State(state): State<AppState>,
    Path(user_id): Path<String>,
    Json(body): Json<ReminderSettings>,
) -> impl IntoResponse {
    match state
        .reconciler
        .save_settings(&user_id, &body, Utc::now())
        .await
    {
        Ok(report) => {
            info!(
                user_id = %user_id,
                scheduled = report.scheduled.len(),
                errors = report.errors.len(),
                "Settings saved via API"
            );
            (StatusCode::OK, Json(serde_json::json!(report)))
        }
        Err(Error::Config(e)) => (
            StatusCode::BAD_REQUEST,
            Json(serde_json::json!({"error": e.to_string()})),
        ),
        Err(e) => internal_error("Failed to save settings", e),
    }
}

// ── Reminders ───────────────────────────────────────────────────────────

async fn list_reminders(
    State(state): State<AppState>,
    Path(user_id): Path<String>,
) -> impl IntoResponse {
    match state.db.list_reminders(&user_id).await {
        Ok(reminders) => (StatusCode::OK, Json(serde_json::json!(reminders))),
        Err(e) => internal_error("Failed to list reminders", e),
    }
}

async fn reconcile_all(State(state): State<AppState>) -> impl IntoResponse {
    match state.reconciler.reconcile_all(Utc::now()).await {
        Ok(batch) => (StatusCode::OK, Json(serde_json::json!(batch))),
        Err(e) => internal_error("Batch reconcile failed", e),
    }
}

// ── WebSocket history mirror ────────────────────────────────────────────

#[derive(Deserialize)]
struct HistoryQuery {
    #[serde(default)]
    token: String,
}

async fn ws_handler(
    ws: WebSocketUpgrade,
    Query(query): Query<HistoryQuery>,
    State(state): State<AppState>,
) -> Response {
    let Some(user_id) = state.agent.authorize(&query.token).await else {
        warn!("History client rejected: token does not match the current identity");
        return (
            StatusCode::UNAUTHORIZED,
            Json(serde_json::json!({"error": "unknown or expired token"})),
        )
            .into_response();
    };
    info!(user_id = %user_id, "History client connecting");
    ws.on_upgrade(move |socket| handle_socket(socket, state.agent, user_id))
}

async fn handle_socket(mut socket: WebSocket, agent: Arc<DeliveryAgent>, user_id: String) {
    let mut rx = agent.subscribe();
    info!(user_id = %user_id, "History client connected");

    loop {
        tokio::select! {
            result = rx.recv() => {
                match result {
                    Ok(event) => {
                        if event.user_id != user_id {
                            continue;
                        }
                        let Ok(json) = serde_json::to_string(&event) else {
                            continue;
                        };
                        if socket.send(Message::Text(json.into())).await.is_err() {
                            debug!("History client disconnected during send");
                            break;
                        }
                    }
                    Err(RecvError::Lagged(n)) => {
                        warn!(missed = n, "History client lagged behind broadcast");
                    }
                    Err(RecvError::Closed) => {
                        debug!("History broadcast closed");
                        break;
                    }
                }
            }

            result = socket.recv() => {
                match result {
                    Some(Ok(Message::Ping(data))) => {
                        if socket.send(Message::Pong(data)).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => {
                        info!("History client disconnected");
                        break;
                    }
                    Some(Err(e)) => {
                        warn!(error = %e, "WebSocket error");
                        break;
                    }
                    // The mirror is one-way; ignore anything else.
                    _ => {}
                }
            }
        }
    }
}

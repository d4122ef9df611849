/// Operational REST endpoints
///
/// Thin controls over the running engine: presence counts, dashboard-wide
/// reloads, client disconnects, screen pairing and per-widget refreshes.

use crate::{
    presence::{EventBus, PresenceRegistry},
    runtime::{OutcomeProcessor, WidgetScheduler},
    store::WidgetStore,
};
use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::Json,
    routing::{get, post},
    Router,
};
use serde::Serialize;
use serde_json::{json, Value};
use std::sync::Arc;

/// Application state containing shared resources
#[derive(Clone)]
pub struct AppState {
    /// Persistence collaborator
    pub store: Arc<dyn WidgetStore>,
    /// Viewer subscriptions
    pub presence: Arc<PresenceRegistry>,
    /// Per-widget recurring scheduler
    pub scheduler: WidgetScheduler,
    /// Out-of-band widget pushes
    pub outcomes: Arc<OutcomeProcessor>,
    /// Channel fan-out for socket sessions
    pub events: Arc<EventBus>,
}

/// Snapshot returned by GET /api/presence
#[derive(Debug, Serialize)]
pub struct PresenceResponse {
    pub subscribers: usize,
    pub scheduled_widgets: usize,
    pub dashboards: Vec<String>,
}

/// Create the operational routes
pub fn create_dashboard_routes() -> Router<AppState> {
    Router::new()
        .route("/healthz", get(health_check))
        .route("/api/presence", get(presence))
        .route("/api/dashboards/reload", post(reload_dashboards))
        .route("/api/sessions/{session}/disconnect", post(disconnect_session))
        .route("/api/screens/{code}/connect/{project_id}", post(connect_screen))
        .route("/api/projects/{project_id}/widgets/{id}/refresh", post(refresh_widget))
        .route("/api/widgets/{id}/reschedule", post(reschedule_widget))
}

/// Health check endpoint handler
async fn health_check() -> &'static str {
    "ok"
}

/// GET /api/presence
async fn presence(State(state): State<AppState>) -> Json<PresenceResponse> {
    Json(PresenceResponse {
        subscribers: state.presence.count_subscribers(),
        scheduled_widgets: state.scheduler.scheduled_count(),
        dashboards: state.presence.watched_dashboards(),
    })
}

/// POST /api/dashboards/reload
async fn reload_dashboards(State(state): State<AppState>) -> Result<Json<Value>, StatusCode> {
    match state.presence.reload_all_dashboards().await {
        Ok(delivered) => Ok(Json(json!({ "delivered": delivered }))),
        Err(e) => {
            tracing::error!("Failed to reload dashboards: {}", e);
            Err(StatusCode::INTERNAL_SERVER_ERROR)
        }
    }
}

/// POST /api/sessions/{session}/disconnect
async fn disconnect_session(State(state): State<AppState>, Path(session): Path<String>) -> Json<Value> {
    let delivered = state.presence.disconnect_client(&session);
    Json(json!({ "delivered": delivered }))
}

/// POST /api/screens/{code}/connect/{project_id}
async fn connect_screen(
    State(state): State<AppState>,
    Path((code, project_id)): Path<(String, i64)>,
) -> Result<Json<Value>, StatusCode> {
    match state.presence.connect_screen(&code, project_id).await {
        Ok(delivered) => Ok(Json(json!({ "delivered": delivered }))),
        Err(e) => {
            tracing::warn!("❌ Could not pair screen {} with project {}: {}", code, project_id, e);
            Err(StatusCode::NOT_FOUND)
        }
    }
}

/// POST /api/projects/{project_id}/widgets/{id}/refresh
///
/// Pushes the persisted payload without running the script.
async fn refresh_widget(
    State(state): State<AppState>,
    Path((project_id, id)): Path<(i64, i64)>,
) -> Result<StatusCode, StatusCode> {
    state
        .outcomes
        .notify_widget_updated(project_id, id)
        .await
        .map(|_| StatusCode::ACCEPTED)
        .map_err(|e| {
            tracing::error!("Failed to refresh widget {}: {}", id, e);
            StatusCode::INTERNAL_SERVER_ERROR
        })
}

/// POST /api/widgets/{id}/reschedule
///
/// Called by the CRUD layer after a widget's configuration changed. Widgets
/// nobody watches stay unscheduled.
async fn reschedule_widget(State(state): State<AppState>, Path(id): Path<i64>) -> Result<Json<Value>, StatusCode> {
    let descriptor = match state.store.execution_descriptor(id).await {
        Ok(Some(descriptor)) => descriptor,
        Ok(None) => return Err(StatusCode::NOT_FOUND),
        Err(e) => {
            tracing::error!("Failed to load widget {}: {}", id, e);
            return Err(StatusCode::INTERNAL_SERVER_ERROR);
        }
    };

    let token = match state.store.project_token(descriptor.project_id).await {
        Ok(token) => token,
        Err(e) => {
            tracing::error!("Failed to load project {}: {}", descriptor.project_id, e);
            return Err(StatusCode::INTERNAL_SERVER_ERROR);
        }
    };
    let watched = token.is_some_and(|token| state.presence.watched_dashboards().contains(&token));

    let scheduled = if watched {
        state.scheduler.cancel_and_reschedule(&descriptor)
    } else {
        state.scheduler.cancel(id);
        false
    };

    tracing::info!("🔄 Widget {} reconfigured (scheduled: {})", id, scheduled);
    Ok(Json(json!({ "scheduled": scheduled })))
}

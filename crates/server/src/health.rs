use std::sync::Arc;

use axum::{extract::State, http::StatusCode, routing::get, Json, Router};
use chrono::Utc;
use opsdesk_core::settings::SnapshotStore;
use serde::Serialize;

use crate::bootstrap::CHAT_PROFILE;

#[derive(Clone)]
pub struct HealthState {
    settings: Arc<SnapshotStore>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct HealthCheck {
    pub status: &'static str,
    pub detail: String,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub service: HealthCheck,
    pub settings: HealthCheck,
    pub checked_at: String,
}

pub fn router(settings: Arc<SnapshotStore>) -> Router {
    Router::new().route("/health", get(health)).with_state(HealthState { settings })
}

pub async fn health(State(state): State<HealthState>) -> (StatusCode, Json<HealthResponse>) {
    let settings = settings_check(&state.settings).await;
    let ready = settings.status == "ready";

    let payload = HealthResponse {
        status: if ready { "ready" } else { "degraded" },
        service: HealthCheck {
            status: "ready",
            detail: "opsdesk-server runtime initialized".to_string(),
        },
        settings,
        checked_at: Utc::now().to_rfc3339(),
    };

    let status_code = if ready { StatusCode::OK } else { StatusCode::SERVICE_UNAVAILABLE };
    (status_code, Json(payload))
}

async fn settings_check(store: &SnapshotStore) -> HealthCheck {
    let snapshot = store.current().await;
    let chat_tools = snapshot.settings.tools_for_profile(CHAT_PROFILE).count();
    if chat_tools == 0 {
        return HealthCheck {
            status: "degraded",
            detail: format!("settings v{} define no {CHAT_PROFILE} tools", snapshot.version),
        };
    }
    HealthCheck {
        status: "ready",
        detail: format!("settings v{} with {chat_tools} {CHAT_PROFILE} tools", snapshot.version),
    }
}

use std::time::Duration;

use axum::{
    Json, Router, debug_handler,
    extract::State,
    http::StatusCode,
    routing::get,
};
use serde_json::{Value, json};

use crate::{AppState, hub::HubHandle, store::SqliteStore};

const READY_TIMEOUT: Duration = Duration::from_secs(2);

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/health/live", get(live))
        .route("/health/ready", get(ready))
}

#[debug_handler(state = AppState)]
async fn live() -> Json<Value> {
    Json(json!({ "status": "live" }))
}

#[debug_handler(state = AppState)]
async fn ready(
    State(db): State<SqliteStore>,
    State(hub): State<HubHandle>,
) -> (StatusCode, Json<Value>) {
    let ping = sqlx::query("SELECT 1").execute(db.pool());
    let database = match tokio::time::timeout(READY_TIMEOUT, ping).await {
        Ok(Ok(_)) => true,
        Ok(Err(e)) => {
            tracing::warn!("readiness ping failed: {e}");
            false
        }
        Err(_) => {
            tracing::warn!("readiness ping timed out after {READY_TIMEOUT:?}");
            false
        }
    };
    let hub = hub.is_running();

    let (status, label) = if database && hub {
        (StatusCode::OK, "ready")
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "not_ready")
    };

    (
        status,
        Json(json!({
            "status": label,
            "database": database,
            "hub": hub,
        })),
    )
}

use axum::{extract::State, routing::get, Json, Router};
use tracing::warn;

use crate::db::health_check as database_health;
use crate::models::{AppState, HealthResponse};

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/api/health", get(health_check))
        .with_state(state)
}

async fn health_check(State(state): State<AppState>) -> Json<HealthResponse> {
    let database = match &state.pool {
        Some(pool) => match database_health(pool).await {
            Ok(_) => "connected".to_string(),
            Err(e) => {
                warn!(error = %e, "Database health check failed");
                "unavailable".to_string()
            }
        },
        None => "disabled".to_string(),
    };

    let status = if database == "unavailable" { "degraded" } else { "ok" };

    Json(HealthResponse {
        status: status.to_string(),
        timestamp: chrono::Utc::now().to_rfc3339(),
        database,
        store: state.orchestrator.store_backend().to_string(),
        llm_provider: state.config.llm.provider.clone(),
        llm_keys: state.llm.key_manager().key_count(),
    })
}

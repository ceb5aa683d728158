//! API Routes
//!
//! - `/api/deep-research/stream` - Research run as a server-sent event stream
//! - `/api/deep-research/keys` - Provider key usage
//! - `/api/health` - Health checks

pub mod deep_research;
pub mod health;

use axum::Router;
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::middleware::apply_cors;
use crate::models::AppState;

/// Create the main application router
pub fn create_router(state: AppState) -> Router {
    info!("Creating application router");

    let origins = state.config.server.cors_allowed_origins.clone();
    let router = Router::new()
        .merge(deep_research::router(state.clone()))
        .merge(health::router(state))
        .layer(TraceLayer::new_for_http());

    apply_cors(router, &origins)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{
        Config, DatabaseConfig, LLMConfig, LoggingConfig, ResearchConfig, SearchConfig, ServerConfig,
    };
    use crate::db::InMemoryConversationStore;
    use crate::research::ResearchOrchestrator;
    use crate::testing::{mock_llm, MockAdapter, MockTools};
    use axum::body::{to_bytes, Body};
    use axum::http::{Request, StatusCode};
    use std::sync::Arc;
    use tower::ServiceExt;

    fn state() -> AppState {
        let config = Config {
            server: ServerConfig {
                port: 0,
                host: "127.0.0.1".to_string(),
                cors_allowed_origins: vec!["*".to_string()],
            },
            database: DatabaseConfig {
                url: None,
                max_connections: 1,
                min_connections: 0,
            },
            llm: LLMConfig {
                provider: "openai".to_string(),
                model: "mock-model".to_string(),
                base_url: None,
                api_keys: vec!["test-key".to_string()],
                request_timeout_secs: 5,
            },
            search: SearchConfig {
                serpapi_key: String::new(),
                base_url: "http://localhost".to_string(),
                max_results: 5,
            },
            logging: LoggingConfig { log_dir: None },
            research: ResearchConfig {
                poll_interval_ms: 1,
                follow_up_enabled: false,
                ..ResearchConfig::default()
            },
        };

        let llm = mock_llm(Arc::new(MockAdapter::new()));
        let orchestrator = ResearchOrchestrator::new(
            llm.clone(),
            Arc::new(MockTools::new()),
            Arc::new(InMemoryConversationStore::new()),
            config.research.clone(),
        );

        AppState {
            orchestrator: Arc::new(orchestrator),
            llm,
            pool: None,
            config,
        }
    }

    async fn body_text(response: axum::response::Response) -> String {
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    #[tokio::test]
    async fn test_health_reports_memory_store() {
        let response = create_router(state())
            .oneshot(Request::get("/api/health").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let health: serde_json::Value = serde_json::from_str(&body_text(response).await).unwrap();
        assert_eq!(health["status"], "ok");
        assert_eq!(health["database"], "disabled");
        assert_eq!(health["store"], "memory");
        assert_eq!(health["llm_keys"], 1);
    }

    #[tokio::test]
    async fn test_empty_query_rejected() {
        let response = create_router(state())
            .oneshot(
                Request::post("/api/deep-research/stream")
                    .header("content-type", "application/json")
                    .body(Body::from(r#"{"query": "   "}"#))
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_stream_ends_with_done_event() {
        let response = create_router(state())
            .oneshot(
                Request::post("/api/deep-research/stream")
                    .header("content-type", "application/json")
                    .body(Body::from(r#"{"query": "chip cycle"}"#))
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let body = body_text(response).await;
        assert!(body.contains("event: research_phase"));
        assert!(body.contains("event: research_plan"));
        assert!(body.contains("\"type\":\"content\""));
        assert!(body.contains("event: done"));
    }

    #[tokio::test]
    async fn test_key_stats() {
        let response = create_router(state())
            .oneshot(Request::get("/api/deep-research/keys").body(Body::empty()).unwrap())
            .await
            .unwrap();

        let stats: serde_json::Value = serde_json::from_str(&body_text(response).await).unwrap();
        assert_eq!(stats["total_keys"], 1);
    }
}

// Deep Research - concurrent multi-agent research pipeline with streamed, cited reports

pub mod agents;
pub mod config;
pub mod db;
pub mod llm;
pub mod middleware;
pub mod models;
pub mod research;
pub mod routes;
pub mod tools;
pub mod types;
pub mod utils;

#[cfg(test)]
mod testing;

// Re-exports for convenience
pub use config::Config;
pub use models::AppState;
pub use research::{ResearchEvent, ResearchOrchestrator};
// Note: import specific items from types instead of a glob to avoid name conflicts
// e.g., use deep_research::types::{AppError, AppResult};

pub fn create_router(state: AppState) -> axum::Router {
    routes::create_router(state)
}

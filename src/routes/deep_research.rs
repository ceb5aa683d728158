use axum::{
    extract::State,
    http::StatusCode,
    response::sse::{Event, KeepAlive, Sse},
    routing::{get, post},
    Json, Router,
};
use futures::stream::{self, Stream};
use std::convert::Infallible;
use tracing::{info, warn};
use uuid::Uuid;

use crate::llm::KeyManagerStats;
use crate::models::{AppState, DeepResearchRequest, ErrorResponse};
use crate::research::ResearchEvent;

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/api/deep-research/stream", post(stream_research))
        .route("/api/deep-research/keys", get(key_stats))
        .with_state(state)
}

/// Start a research run and stream its events as SSE. Closing the
/// connection cancels the run.
async fn stream_research(
    State(state): State<AppState>,
    Json(request): Json<DeepResearchRequest>,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, (StatusCode, Json<ErrorResponse>)> {
    let query = request.query.trim().to_string();
    if query.is_empty() {
        return Err((
            StatusCode::BAD_REQUEST,
            Json(ErrorResponse {
                error: "query must not be empty".to_string(),
            }),
        ));
    }

    let conversation_id = request.conversation_id.unwrap_or_else(Uuid::new_v4);
    info!(conversation_id = %conversation_id, query_len = query.len(), "Deep research requested");

    let receiver = state.orchestrator.clone().spawn(conversation_id, query);
    let events = stream::unfold(receiver, |mut receiver| async move {
        let event = receiver.recv().await?;
        Some((Ok(to_sse(&event)), receiver))
    });

    Ok(Sse::new(events).keep_alive(KeepAlive::default()))
}

async fn key_stats(State(state): State<AppState>) -> Json<KeyManagerStats> {
    Json(state.llm.key_manager().get_stats())
}

pub(crate) fn to_sse(event: &ResearchEvent) -> Event {
    match Event::default().event(event.event_type()).json_data(event) {
        Ok(sse) => sse,
        Err(e) => {
            warn!(error = %e, event = event.event_type(), "Failed to encode research event");
            Event::default()
                .event("error")
                .data(r#"{"type":"error","message":"Failed to encode research event"}"#)
        }
    }
}

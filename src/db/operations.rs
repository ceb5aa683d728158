use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use std::sync::Mutex;
use tracing::{debug, info};
use uuid::Uuid;

use crate::research::{Reference, RunStats};
use crate::types::{AppError, AppResult};

/// Conversation titles are cut to this many characters
const MAX_TITLE_CHARS: usize = 100;

/// What one finished research run leaves behind
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResearchTranscript {
    pub conversation_id: Uuid,
    pub query: String,
    pub report: String,
    pub references: Vec<Reference>,
    pub stats: RunStats,
    pub completed_at: DateTime<Utc>,
}

impl ResearchTranscript {
    /// Report text followed by the numbered reference list
    pub fn assistant_content(&self) -> String {
        if self.references.is_empty() {
            return self.report.clone();
        }

        let mut content = self.report.trim_end().to_string();
        content.push_str("\n\n## References\n\n");
        for reference in &self.references {
            content.push_str(&format!(
                "[{}] {} - {}\n",
                reference.reference_number, reference.title, reference.url
            ));
        }
        content
    }

    pub fn title(&self) -> String {
        self.query.trim().chars().take(MAX_TITLE_CHARS).collect()
    }
}

/// Persists research transcripts
#[async_trait]
pub trait ConversationStore: Send + Sync {
    async fn save_transcript(&self, transcript: &ResearchTranscript) -> AppResult<()>;

    /// Backend name for health reporting
    fn backend(&self) -> &'static str;
}

pub struct PgConversationStore {
    pool: PgPool,
}

impl PgConversationStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl ConversationStore for PgConversationStore {
    async fn save_transcript(&self, transcript: &ResearchTranscript) -> AppResult<()> {
        let references = serde_json::to_value(&transcript.references)
            .map_err(|e| AppError::Internal(format!("Failed to encode references: {}", e)))?;
        let stats = serde_json::to_value(&transcript.stats)
            .map_err(|e| AppError::Internal(format!("Failed to encode stats: {}", e)))?;

        let mut tx = self.pool.begin().await?;

        sqlx::query(
            r#"
            INSERT INTO conversations (id, title)
            VALUES ($1, $2)
            ON CONFLICT (id) DO NOTHING
            "#,
        )
        .bind(transcript.conversation_id)
        .bind(transcript.title())
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            r#"
            INSERT INTO messages (id, conversation_id, role, content)
            VALUES ($1, $2, 'user', $3)
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(transcript.conversation_id)
        .bind(&transcript.query)
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            r#"
            INSERT INTO messages (id, conversation_id, role, content, "references", stats, created_at)
            VALUES ($1, $2, 'assistant', $3, $4, $5, $6)
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(transcript.conversation_id)
        .bind(transcript.assistant_content())
        .bind(references)
        .bind(stats)
        .bind(transcript.completed_at)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;

        info!(
            conversation_id = %transcript.conversation_id,
            references = transcript.references.len(),
            "Research transcript saved"
        );
        Ok(())
    }

    fn backend(&self) -> &'static str {
        "postgres"
    }
}

/// Keeps transcripts in memory; used without a database and in tests
#[derive(Default)]
pub struct InMemoryConversationStore {
    transcripts: Mutex<Vec<ResearchTranscript>>,
}

impl InMemoryConversationStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn transcripts(&self) -> Vec<ResearchTranscript> {
        match self.transcripts.lock() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }
}

#[async_trait]
impl ConversationStore for InMemoryConversationStore {
    async fn save_transcript(&self, transcript: &ResearchTranscript) -> AppResult<()> {
        let mut guard = self
            .transcripts
            .lock()
            .map_err(|_| AppError::Internal("Transcript store lock poisoned".to_string()))?;
        guard.push(transcript.clone());
        debug!(conversation_id = %transcript.conversation_id, "Transcript kept in memory");
        Ok(())
    }

    fn backend(&self) -> &'static str {
        "memory"
    }
}

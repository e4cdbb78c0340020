use async_trait::async_trait;
use serde_json::{Map, Value};
use thiserror::Error;

use aidgent_core::domain::message::HistoryLine;
use aidgent_core::domain::session::{
    CitationRecord, Session, SessionId, StoredMessage, Transcript, TranscriptMessage,
};
use aidgent_core::domain::state::{Citation, ConversationState};

pub mod memory;
pub mod message;
pub mod session;
pub mod summary;

pub use memory::InMemoryConversationStore;
pub use message::SqlMessageRepository;
pub use session::SqlSessionRepository;
pub use summary::SqlSummaryRepository;

#[derive(Debug, Error)]
pub enum RepositoryError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("decode error: {0}")]
    Decode(String),
}

/// One assistant reply together with what it produced. Stored atomically:
/// the message row, the clinical summary (when present) and one citation
/// row per cited document.
#[derive(Clone, Copy, Debug)]
pub struct AssistantTurn<'a> {
    pub session_id: &'a SessionId,
    pub text: &'a str,
    pub state: &'a ConversationState,
    pub summary: Option<&'a Map<String, Value>>,
    pub citations: &'a [Citation],
}

#[async_trait]
pub trait SessionRepository: Send + Sync {
    async fn create(&self, session: Session) -> Result<(), RepositoryError>;

    /// Opens the session if it does not exist yet. Returns `true` when a new
    /// row was written.
    async fn ensure(&self, id: &SessionId) -> Result<bool, RepositoryError>;

    async fn find_by_id(&self, id: &SessionId) -> Result<Option<Session>, RepositoryError>;
}

#[async_trait]
pub trait MessageRepository: Send + Sync {
    async fn append_user(
        &self,
        session_id: &SessionId,
        text: &str,
    ) -> Result<StoredMessage, RepositoryError>;

    async fn append_assistant(
        &self,
        turn: AssistantTurn<'_>,
    ) -> Result<StoredMessage, RepositoryError>;

    /// The last `2 * max_turns` messages, oldest first.
    async fn recent_history(
        &self,
        session_id: &SessionId,
        max_turns: usize,
    ) -> Result<Vec<HistoryLine>, RepositoryError>;

    /// State blob of the newest assistant message, `None` before the first
    /// assistant reply. A blob that cannot be read yields an empty state.
    async fn last_assistant_state(
        &self,
        session_id: &SessionId,
    ) -> Result<Option<ConversationState>, RepositoryError>;

    async fn list_messages(
        &self,
        session_id: &SessionId,
    ) -> Result<Vec<StoredMessage>, RepositoryError>;
}

#[async_trait]
pub trait SummaryRepository: Send + Sync {
    async fn list_summaries(&self, session_id: &SessionId) -> Result<Vec<Value>, RepositoryError>;

    async fn list_citations(
        &self,
        session_id: &SessionId,
    ) -> Result<Vec<CitationRecord>, RepositoryError>;
}

pub async fn load_transcript(
    messages: &dyn MessageRepository,
    summaries: &dyn SummaryRepository,
    session_id: &SessionId,
) -> Result<Transcript, RepositoryError> {
    let stored = messages.list_messages(session_id).await?;
    let soap_summaries = summaries.list_summaries(session_id).await?;
    let citations = summaries.list_citations(session_id).await?;

    Ok(Transcript {
        session_id: session_id.clone(),
        messages: stored
            .into_iter()
            .map(|message| TranscriptMessage {
                state: message.state_value(),
                role: message.role,
                text: message.text,
            })
            .collect(),
        soap_summaries,
        citations,
    })
}

pub(crate) fn decode_err(error: impl std::fmt::Display) -> RepositoryError {
    RepositoryError::Decode(error.to_string())
}

pub(crate) fn parse_timestamp(raw: &str) -> chrono::DateTime<chrono::Utc> {
    chrono::DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&chrono::Utc))
        .unwrap_or_else(|_| chrono::Utc::now())
}

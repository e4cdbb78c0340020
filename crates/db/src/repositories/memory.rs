use std::collections::HashMap;

use chrono::Utc;
use serde_json::Value;
use tokio::sync::RwLock;

use aidgent_core::domain::message::{HistoryLine, MessageRole};
use aidgent_core::domain::session::{CitationRecord, Session, SessionId, StoredMessage};
use aidgent_core::domain::state::ConversationState;

use super::{
    AssistantTurn, MessageRepository, RepositoryError, SessionRepository, SummaryRepository,
};

#[derive(Default)]
struct Tables {
    sessions: HashMap<String, Session>,
    messages: Vec<StoredMessage>,
    summaries: Vec<(SessionId, Value)>,
    citations: Vec<(SessionId, CitationRecord)>,
    next_message_id: i64,
}

/// All three repositories over one in-process store, for tests and for
/// running the server without a database file.
#[derive(Default)]
pub struct InMemoryConversationStore {
    tables: RwLock<Tables>,
}

impl InMemoryConversationStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn push_message(
        tables: &mut Tables,
        session_id: &SessionId,
        role: MessageRole,
        text: &str,
        state_json: String,
    ) -> StoredMessage {
        tables.next_message_id += 1;
        let message = StoredMessage {
            id: tables.next_message_id,
            session_id: session_id.clone(),
            role,
            text: text.to_string(),
            state_json,
            created_at: Utc::now(),
        };
        tables.messages.push(message.clone());
        message
    }
}

#[async_trait::async_trait]
impl SessionRepository for InMemoryConversationStore {
    async fn create(&self, session: Session) -> Result<(), RepositoryError> {
        let mut tables = self.tables.write().await;
        tables.sessions.insert(session.id.0.clone(), session);
        Ok(())
    }

    async fn ensure(&self, id: &SessionId) -> Result<bool, RepositoryError> {
        let mut tables = self.tables.write().await;
        if tables.sessions.contains_key(&id.0) {
            return Ok(false);
        }
        tables.sessions.insert(id.0.clone(), Session::open(id.clone(), None));
        Ok(true)
    }

    async fn find_by_id(&self, id: &SessionId) -> Result<Option<Session>, RepositoryError> {
        let tables = self.tables.read().await;
        Ok(tables.sessions.get(&id.0).cloned())
    }
}

#[async_trait::async_trait]
impl MessageRepository for InMemoryConversationStore {
    async fn append_user(
        &self,
        session_id: &SessionId,
        text: &str,
    ) -> Result<StoredMessage, RepositoryError> {
        let mut tables = self.tables.write().await;
        Ok(Self::push_message(&mut tables, session_id, MessageRole::User, text, "{}".to_string()))
    }

    async fn append_assistant(
        &self,
        turn: AssistantTurn<'_>,
    ) -> Result<StoredMessage, RepositoryError> {
        let mut tables = self.tables.write().await;
        let message = Self::push_message(
            &mut tables,
            turn.session_id,
            MessageRole::Assistant,
            turn.text,
            turn.state.to_persisted(),
        );

        if let Some(summary) = turn.summary.filter(|summary| !summary.is_empty()) {
            tables.summaries.push((turn.session_id.clone(), Value::Object(summary.clone())));
        }
        for citation in turn.citations {
            tables
                .citations
                .push((turn.session_id.clone(), CitationRecord::for_turn(message.id, citation)));
        }

        Ok(message)
    }

    async fn recent_history(
        &self,
        session_id: &SessionId,
        max_turns: usize,
    ) -> Result<Vec<HistoryLine>, RepositoryError> {
        let tables = self.tables.read().await;
        let mut history: Vec<HistoryLine> = tables
            .messages
            .iter()
            .rev()
            .filter(|message| &message.session_id == session_id)
            .take(max_turns.saturating_mul(2))
            .map(|message| HistoryLine { role: message.role, text: message.text.clone() })
            .collect();
        history.reverse();
        Ok(history)
    }

    async fn last_assistant_state(
        &self,
        session_id: &SessionId,
    ) -> Result<Option<ConversationState>, RepositoryError> {
        let tables = self.tables.read().await;
        Ok(tables
            .messages
            .iter()
            .rev()
            .find(|message| {
                &message.session_id == session_id && message.role == MessageRole::Assistant
            })
            .map(|message| ConversationState::from_persisted(&message.state_json)))
    }

    async fn list_messages(
        &self,
        session_id: &SessionId,
    ) -> Result<Vec<StoredMessage>, RepositoryError> {
        let tables = self.tables.read().await;
        Ok(tables
            .messages
            .iter()
            .filter(|message| &message.session_id == session_id)
            .cloned()
            .collect())
    }
}

#[async_trait::async_trait]
impl SummaryRepository for InMemoryConversationStore {
    async fn list_summaries(&self, session_id: &SessionId) -> Result<Vec<Value>, RepositoryError> {
        let tables = self.tables.read().await;
        Ok(tables
            .summaries
            .iter()
            .filter(|(owner, _)| owner == session_id)
            .map(|(_, summary)| summary.clone())
            .collect())
    }

    async fn list_citations(
        &self,
        session_id: &SessionId,
    ) -> Result<Vec<CitationRecord>, RepositoryError> {
        let tables = self.tables.read().await;
        Ok(tables
            .citations
            .iter()
            .filter(|(owner, _)| owner == session_id)
            .map(|(_, record)| record.clone())
            .collect())
    }
}

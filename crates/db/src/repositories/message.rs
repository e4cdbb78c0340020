use std::str::FromStr;

use chrono::Utc;
use serde_json::Value;
use sqlx::Row;

use aidgent_core::domain::message::{HistoryLine, MessageRole};
use aidgent_core::domain::session::{CitationRecord, SessionId, StoredMessage};
use aidgent_core::domain::state::ConversationState;

use super::{decode_err, parse_timestamp, AssistantTurn, MessageRepository, RepositoryError};
use crate::DbPool;

const EMPTY_STATE_JSON: &str = "{}";

pub struct SqlMessageRepository {
    pool: DbPool,
}

impl SqlMessageRepository {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

fn parse_role(raw: &str) -> Result<MessageRole, RepositoryError> {
    MessageRole::from_str(raw).map_err(RepositoryError::Decode)
}

fn row_to_message(row: &sqlx::sqlite::SqliteRow) -> Result<StoredMessage, RepositoryError> {
    let id: i64 = row.try_get("id").map_err(decode_err)?;
    let session_id: String = row.try_get("session_id").map_err(decode_err)?;
    let role: String = row.try_get("role").map_err(decode_err)?;
    let text: String = row.try_get("text").map_err(decode_err)?;
    let state_json: String = row.try_get("state_json").map_err(decode_err)?;
    let created_at: String = row.try_get("created_at").map_err(decode_err)?;

    Ok(StoredMessage {
        id,
        session_id: SessionId(session_id),
        role: parse_role(&role)?,
        text,
        state_json,
        created_at: parse_timestamp(&created_at),
    })
}

#[async_trait::async_trait]
impl MessageRepository for SqlMessageRepository {
    async fn append_user(
        &self,
        session_id: &SessionId,
        text: &str,
    ) -> Result<StoredMessage, RepositoryError> {
        let created_at = Utc::now();
        let result = sqlx::query(
            "INSERT INTO message (session_id, role, text, state_json, created_at)
             VALUES (?, 'user', ?, ?, ?)",
        )
        .bind(session_id.as_str())
        .bind(text)
        .bind(EMPTY_STATE_JSON)
        .bind(created_at.to_rfc3339())
        .execute(&self.pool)
        .await?;

        Ok(StoredMessage {
            id: result.last_insert_rowid(),
            session_id: session_id.clone(),
            role: MessageRole::User,
            text: text.to_string(),
            state_json: EMPTY_STATE_JSON.to_string(),
            created_at,
        })
    }

    async fn append_assistant(
        &self,
        turn: AssistantTurn<'_>,
    ) -> Result<StoredMessage, RepositoryError> {
        let created_at = Utc::now();
        let created_at_str = created_at.to_rfc3339();
        let state_json = turn.state.to_persisted();

        let mut tx = self.pool.begin().await?;

        let result = sqlx::query(
            "INSERT INTO message (session_id, role, text, state_json, created_at)
             VALUES (?, 'assistant', ?, ?, ?)",
        )
        .bind(turn.session_id.as_str())
        .bind(turn.text)
        .bind(&state_json)
        .bind(&created_at_str)
        .execute(&mut *tx)
        .await?;
        let turn_id = result.last_insert_rowid();

        if let Some(summary) = turn.summary.filter(|summary| !summary.is_empty()) {
            sqlx::query(
                "INSERT INTO soap_summary (session_id, soap_json, created_at) VALUES (?, ?, ?)",
            )
            .bind(turn.session_id.as_str())
            .bind(Value::Object(summary.clone()).to_string())
            .bind(&created_at_str)
            .execute(&mut *tx)
            .await?;
        }

        for citation in turn.citations {
            let record = CitationRecord::for_turn(turn_id, citation);
            sqlx::query(
                "INSERT INTO citation (session_id, turn_id, doc_id, snippet_ids)
                 VALUES (?, ?, ?, ?)",
            )
            .bind(turn.session_id.as_str())
            .bind(record.turn_id)
            .bind(&record.doc_id)
            .bind(record.joined_snippet_ids())
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;

        Ok(StoredMessage {
            id: turn_id,
            session_id: turn.session_id.clone(),
            role: MessageRole::Assistant,
            text: turn.text.to_string(),
            state_json,
            created_at,
        })
    }

    async fn recent_history(
        &self,
        session_id: &SessionId,
        max_turns: usize,
    ) -> Result<Vec<HistoryLine>, RepositoryError> {
        let limit = i64::try_from(max_turns.saturating_mul(2)).unwrap_or(i64::MAX);
        let rows = sqlx::query(
            "SELECT role, text FROM message
             WHERE session_id = ?
             ORDER BY id DESC
             LIMIT ?",
        )
        .bind(session_id.as_str())
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        let mut history = rows
            .iter()
            .map(|row| {
                let role: String = row.try_get("role").map_err(decode_err)?;
                let text: String = row.try_get("text").map_err(decode_err)?;
                Ok(HistoryLine { role: parse_role(&role)?, text })
            })
            .collect::<Result<Vec<_>, RepositoryError>>()?;
        history.reverse();
        Ok(history)
    }

    async fn last_assistant_state(
        &self,
        session_id: &SessionId,
    ) -> Result<Option<ConversationState>, RepositoryError> {
        let state_json: Option<String> = sqlx::query_scalar(
            "SELECT state_json FROM message
             WHERE session_id = ? AND role = 'assistant'
             ORDER BY id DESC
             LIMIT 1",
        )
        .bind(session_id.as_str())
        .fetch_optional(&self.pool)
        .await?;

        Ok(state_json.map(|raw| ConversationState::from_persisted(&raw)))
    }

    async fn list_messages(
        &self,
        session_id: &SessionId,
    ) -> Result<Vec<StoredMessage>, RepositoryError> {
        let rows = sqlx::query(
            "SELECT id, session_id, role, text, state_json, created_at
             FROM message WHERE session_id = ?
             ORDER BY id ASC",
        )
        .bind(session_id.as_str())
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(row_to_message).collect()
    }
}

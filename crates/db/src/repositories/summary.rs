use serde_json::Value;
use sqlx::Row;

use aidgent_core::domain::session::{CitationRecord, SessionId};

use super::{decode_err, RepositoryError, SummaryRepository};
use crate::DbPool;

pub struct SqlSummaryRepository {
    pool: DbPool,
}

impl SqlSummaryRepository {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

#[async_trait::async_trait]
impl SummaryRepository for SqlSummaryRepository {
    async fn list_summaries(&self, session_id: &SessionId) -> Result<Vec<Value>, RepositoryError> {
        let rows = sqlx::query(
            "SELECT soap_json FROM soap_summary WHERE session_id = ? ORDER BY id ASC",
        )
        .bind(session_id.as_str())
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| {
                let raw: String = row.try_get("soap_json").map_err(decode_err)?;
                serde_json::from_str(&raw).map_err(decode_err)
            })
            .collect()
    }

    async fn list_citations(
        &self,
        session_id: &SessionId,
    ) -> Result<Vec<CitationRecord>, RepositoryError> {
        let rows = sqlx::query(
            "SELECT turn_id, doc_id, snippet_ids FROM citation
             WHERE session_id = ?
             ORDER BY turn_id ASC, id ASC",
        )
        .bind(session_id.as_str())
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| {
                let turn_id: i64 = row.try_get("turn_id").map_err(decode_err)?;
                let doc_id: String = row.try_get("doc_id").map_err(decode_err)?;
                let snippet_ids: String = row.try_get("snippet_ids").map_err(decode_err)?;
                Ok(CitationRecord {
                    turn_id,
                    doc_id,
                    snippet_ids: CitationRecord::split_snippet_ids(&snippet_ids),
                })
            })
            .collect()
    }
}

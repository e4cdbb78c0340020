use chrono::Utc;
use serde_json::{Map, Value};
use sqlx::Row;

use aidgent_core::domain::session::{Session, SessionId, UNKNOWN_AGE_BUCKET};
use aidgent_core::domain::state::Intent;

use super::{decode_err, parse_timestamp, RepositoryError, SessionRepository};
use crate::DbPool;

pub struct SqlSessionRepository {
    pool: DbPool,
}

impl SqlSessionRepository {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

fn row_to_session(row: &sqlx::sqlite::SqliteRow) -> Result<Session, RepositoryError> {
    let id: String = row.try_get("id").map_err(decode_err)?;
    let created_at: String = row.try_get("created_at").map_err(decode_err)?;
    let age_bucket: String = row.try_get("age_bucket").map_err(decode_err)?;
    let consent_flags: String = row.try_get("consent_flags").map_err(decode_err)?;
    let intent_hint: Option<String> = row.try_get("intent_hint").map_err(decode_err)?;

    let consent_flags = match serde_json::from_str::<Value>(&consent_flags) {
        Ok(Value::Object(flags)) => flags,
        _ => Map::new(),
    };

    Ok(Session {
        id: SessionId(id),
        created_at: parse_timestamp(&created_at),
        age_bucket,
        consent_flags,
        intent_hint: intent_hint
            .map(|raw| Intent::parse(&raw))
            .filter(|intent| !intent.is_uncertain()),
    })
}

#[async_trait::async_trait]
impl SessionRepository for SqlSessionRepository {
    async fn create(&self, session: Session) -> Result<(), RepositoryError> {
        sqlx::query(
            "INSERT INTO session (id, created_at, age_bucket, consent_flags, intent_hint)
             VALUES (?, ?, ?, ?, ?)",
        )
        .bind(session.id.as_str())
        .bind(session.created_at.to_rfc3339())
        .bind(&session.age_bucket)
        .bind(Value::Object(session.consent_flags).to_string())
        .bind(session.intent_hint.as_ref().map(|intent| intent.as_str().to_string()))
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn ensure(&self, id: &SessionId) -> Result<bool, RepositoryError> {
        let result = sqlx::query(
            "INSERT OR IGNORE INTO session (id, created_at, age_bucket, consent_flags)
             VALUES (?, ?, ?, '{}')",
        )
        .bind(id.as_str())
        .bind(Utc::now().to_rfc3339())
        .bind(UNKNOWN_AGE_BUCKET)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn find_by_id(&self, id: &SessionId) -> Result<Option<Session>, RepositoryError> {
        let row = sqlx::query(
            "SELECT id, created_at, age_bucket, consent_flags, intent_hint
             FROM session WHERE id = ?",
        )
        .bind(id.as_str())
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(ref r) => Ok(Some(row_to_session(r)?)),
            None => Ok(None),
        }
    }
}

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::domain::message::MessageRole;
use crate::domain::state::{Citation, Intent};

pub const UNKNOWN_AGE_BUCKET: &str = "unknown";

#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(pub String);

impl SessionId {
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Session {
    pub id: SessionId,
    pub created_at: DateTime<Utc>,
    pub age_bucket: String,
    pub consent_flags: Map<String, Value>,
    pub intent_hint: Option<Intent>,
}

impl Session {
    pub fn open(id: SessionId, intent_hint: Option<Intent>) -> Self {
        Self {
            id,
            created_at: Utc::now(),
            age_bucket: UNKNOWN_AGE_BUCKET.to_string(),
            consent_flags: Map::new(),
            intent_hint: intent_hint.filter(|intent| !intent.is_uncertain()),
        }
    }
}

/// A stored utterance. User messages carry an empty state object.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct StoredMessage {
    pub id: i64,
    pub session_id: SessionId,
    pub role: MessageRole,
    pub text: String,
    pub state_json: String,
    pub created_at: DateTime<Utc>,
}

impl StoredMessage {
    /// The state blob as JSON; unreadable blobs show as an empty object.
    pub fn state_value(&self) -> Value {
        serde_json::from_str(&self.state_json).unwrap_or_else(|_| Value::Object(Map::new()))
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CitationRecord {
    pub turn_id: i64,
    pub doc_id: String,
    pub snippet_ids: Vec<String>,
}

impl CitationRecord {
    pub fn for_turn(turn_id: i64, citation: &Citation) -> Self {
        Self { turn_id, doc_id: citation.doc_id.clone(), snippet_ids: citation.snippet_ids.clone() }
    }

    /// Snippet ids as stored: comma-joined.
    pub fn joined_snippet_ids(&self) -> String {
        self.snippet_ids.join(",")
    }

    pub fn split_snippet_ids(raw: &str) -> Vec<String> {
        raw.split(',')
            .map(str::trim)
            .filter(|id| !id.is_empty())
            .map(str::to_string)
            .collect()
    }
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct TranscriptMessage {
    pub role: MessageRole,
    pub text: String,
    pub state: Value,
}

/// Everything recorded for one session, oldest first.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct Transcript {
    pub session_id: SessionId,
    pub messages: Vec<TranscriptMessage>,
    pub soap_summaries: Vec<Value>,
    pub citations: Vec<CitationRecord>,
}

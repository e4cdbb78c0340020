//! Conversation routes.
//!
//! - `POST /session`                   open a session, optionally with an intent hint
//! - `POST /chat/turn`                 run one turn; creates the session when absent
//! - `GET  /session/{id}/transcript`   messages with parsed state, summaries and citations
//! - `POST /rag/reindex`               rebuild the reference document index

use std::collections::HashMap;
use std::sync::Arc;

use aidgent_agent::{AgentError, AgentRuntime, IndexSummary, TurnRequest};
use aidgent_core::{
    ApplicationError, ConversationState, DomainError, Intent, InterfaceError, Session, SessionId,
    Transcript,
};
use aidgent_db::{
    load_transcript, AssistantTurn, MessageRepository, RepositoryError, SessionRepository,
    SummaryRepository,
};
use axum::{
    body::Bytes,
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Prior exchanges replayed to the model on every turn.
const HISTORY_TURNS: usize = 2;

#[derive(Clone)]
pub struct ChatState {
    runtime: Arc<AgentRuntime>,
    sessions: Arc<dyn SessionRepository>,
    messages: Arc<dyn MessageRepository>,
    summaries: Arc<dyn SummaryRepository>,
    locks: SessionLocks,
}

impl ChatState {
    pub fn new(
        runtime: Arc<AgentRuntime>,
        sessions: Arc<dyn SessionRepository>,
        messages: Arc<dyn MessageRepository>,
        summaries: Arc<dyn SummaryRepository>,
    ) -> Self {
        Self { runtime, sessions, messages, summaries, locks: SessionLocks::default() }
    }
}

/// One async mutex per session id. A turn holds its session's lock from the
/// state read until the assistant message is stored.
#[derive(Clone, Default)]
pub struct SessionLocks {
    inner: Arc<Mutex<HashMap<String, Arc<Mutex<()>>>>>,
}

impl SessionLocks {
    pub async fn acquire(&self, session_id: &SessionId) -> OwnedMutexGuard<()> {
        let lock = {
            let mut locks = self.inner.lock().await;
            // Entries only referenced by the map belong to idle sessions.
            locks.retain(|_, lock| Arc::strong_count(lock) > 1);
            locks.entry(session_id.0.clone()).or_default().clone()
        };
        lock.lock_owned().await
    }
}

// ---------------------------------------------------------------------------
// Request / Response types
// ---------------------------------------------------------------------------

#[derive(Debug, Default, Deserialize)]
pub struct OpenSessionRequest {
    #[serde(default)]
    pub intent_hint: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct OpenSessionResponse {
    pub session_id: String,
}

#[derive(Debug, Deserialize)]
pub struct ChatTurnRequest {
    #[serde(default)]
    pub session_id: Option<String>,
    #[serde(default)]
    pub user_text: String,
    #[serde(default)]
    pub locale: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct ChatTurnResponse {
    pub session_id: String,
    pub assistant_text: String,
    pub state: ConversationState,
}

#[derive(Debug, Serialize)]
pub struct ErrorBody {
    pub error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
    pub correlation_id: String,
}

/// Interface error rendered as a JSON response.
#[derive(Debug)]
pub struct ApiError(pub InterfaceError);

impl ApiError {
    fn new(error: impl Into<ApplicationError>, correlation_id: &str) -> Self {
        Self(error.into().into_interface(correlation_id))
    }

    fn bad_request(message: impl Into<String>, correlation_id: &str) -> Self {
        Self(InterfaceError::BadRequest {
            message: message.into(),
            correlation_id: correlation_id.to_string(),
        })
    }

    fn status(&self) -> StatusCode {
        match self.0 {
            InterfaceError::BadRequest { .. } => StatusCode::BAD_REQUEST,
            InterfaceError::NotFound { .. } => StatusCode::NOT_FOUND,
            InterfaceError::ServiceUnavailable { .. } => StatusCode::SERVICE_UNAVAILABLE,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        // Only client errors echo their detail back.
        let detail = match &self.0 {
            InterfaceError::BadRequest { message, .. }
            | InterfaceError::NotFound { message, .. } => Some(message.clone()),
            InterfaceError::ServiceUnavailable { .. } => None,
        };
        let body = ErrorBody {
            error: self.0.user_message().to_string(),
            detail,
            correlation_id: self.0.correlation_id().to_string(),
        };
        (status, Json(body)).into_response()
    }
}

fn persistence(error: RepositoryError) -> ApplicationError {
    ApplicationError::Persistence(error.to_string())
}

fn agent_failure(error: AgentError) -> ApplicationError {
    match error {
        AgentError::EmptyUserText => DomainError::EmptyUserText.into(),
        AgentError::Model(message) => ApplicationError::Integration(message),
        AgentError::EmptyReply => ApplicationError::Integration(error.to_string()),
    }
}

fn new_correlation_id() -> String {
    Uuid::new_v4().to_string()
}

// ---------------------------------------------------------------------------
// Router
// ---------------------------------------------------------------------------

pub fn router(state: ChatState) -> Router {
    Router::new()
        .route("/session", post(open_session))
        .route("/session/{session_id}/transcript", get(transcript))
        .route("/chat/turn", post(chat_turn))
        .route("/rag/reindex", post(reindex))
        .with_state(state)
}

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

/// Opens a session. The body is optional; an intent hint must name an intent
/// of the loaded slot policy.
pub async fn open_session(
    State(state): State<ChatState>,
    body: Bytes,
) -> Result<Json<OpenSessionResponse>, ApiError> {
    let correlation_id = new_correlation_id();
    let request = if body.iter().all(u8::is_ascii_whitespace) {
        OpenSessionRequest::default()
    } else {
        serde_json::from_slice::<OpenSessionRequest>(&body).map_err(|error| {
            ApiError::bad_request(format!("invalid request body: {error}"), &correlation_id)
        })?
    };

    let hint =
        request.intent_hint.as_deref().map(Intent::parse).filter(|hint| !hint.is_uncertain());
    if let Some(hint) = &hint {
        if state.runtime.bundle().slots.policy.intent(hint).is_none() {
            return Err(ApiError::bad_request(
                format!("unknown intent hint `{hint}`"),
                &correlation_id,
            ));
        }
    }

    let session = Session::open(SessionId::generate(), hint);
    let session_id = session.id.clone();
    state
        .sessions
        .create(session)
        .await
        .map_err(|error| ApiError::new(persistence(error), &correlation_id))?;

    info!(
        event_name = "server.session.opened",
        correlation_id = %correlation_id,
        session_id = %session_id,
        "session opened"
    );
    Ok(Json(OpenSessionResponse { session_id: session_id.0 }))
}

pub async fn chat_turn(
    State(state): State<ChatState>,
    Json(request): Json<ChatTurnRequest>,
) -> Result<Json<ChatTurnResponse>, ApiError> {
    let correlation_id = new_correlation_id();
    let user_text = request.user_text.trim();
    if user_text.is_empty() {
        return Err(ApiError::bad_request("user_text required", &correlation_id));
    }

    let session_id = request
        .session_id
        .filter(|id| !id.trim().is_empty())
        .map(|id| SessionId(id.trim().to_string()))
        .unwrap_or_else(SessionId::generate);
    if let Some(locale) = request.locale.as_deref() {
        debug!(
            event_name = "server.chat.locale",
            correlation_id = %correlation_id,
            session_id = %session_id,
            locale = %locale,
            "turn locale requested"
        );
    }

    let _turn_guard = state.locks.acquire(&session_id).await;
    let fail = |error: RepositoryError| ApiError::new(persistence(error), &correlation_id);

    if state.sessions.ensure(&session_id).await.map_err(fail)? {
        info!(
            event_name = "server.session.created",
            correlation_id = %correlation_id,
            session_id = %session_id,
            "session created on first turn"
        );
    }

    let history = state.messages.recent_history(&session_id, HISTORY_TURNS).await.map_err(fail)?;
    // The intent hint seeds every turn until the first assistant reply is stored.
    let previous = match state.messages.last_assistant_state(&session_id).await.map_err(fail)? {
        Some(previous) => previous,
        None => state
            .sessions
            .find_by_id(&session_id)
            .await
            .map_err(fail)?
            .and_then(|session| session.intent_hint)
            .map(ConversationState::with_intent)
            .unwrap_or_default(),
    };

    state.messages.append_user(&session_id, user_text).await.map_err(fail)?;

    let outcome = state
        .runtime
        .handle_turn(TurnRequest {
            session_id: session_id.as_str(),
            user_text,
            history: &history,
            previous: &previous,
        })
        .await
        .map_err(|error| {
            warn!(
                event_name = "server.chat.turn_failed",
                correlation_id = %correlation_id,
                session_id = %session_id,
                error = %error,
                "turn failed"
            );
            ApiError::new(agent_failure(error), &correlation_id)
        })?;

    state
        .messages
        .append_assistant(AssistantTurn {
            session_id: &session_id,
            text: &outcome.reply,
            state: &outcome.state,
            summary: outcome.summary_to_persist(),
            citations: &outcome.new_citations,
        })
        .await
        .map_err(fail)?;

    info!(
        event_name = "server.chat.turn_completed",
        correlation_id = %correlation_id,
        session_id = %session_id,
        kind = outcome.kind.as_str(),
        "turn stored"
    );

    Ok(Json(ChatTurnResponse {
        session_id: session_id.0,
        assistant_text: outcome.reply,
        state: outcome.state,
    }))
}

pub async fn transcript(
    State(state): State<ChatState>,
    Path(session_id): Path<String>,
) -> Result<Json<Transcript>, ApiError> {
    let correlation_id = new_correlation_id();
    let session_id = SessionId(session_id);
    let fail = |error: RepositoryError| ApiError::new(persistence(error), &correlation_id);

    if state.sessions.find_by_id(&session_id).await.map_err(fail)?.is_none() {
        return Err(ApiError::new(DomainError::UnknownSession(session_id.0), &correlation_id));
    }

    let transcript = load_transcript(state.messages.as_ref(), state.summaries.as_ref(), &session_id)
        .await
        .map_err(fail)?;
    Ok(Json(transcript))
}

pub async fn reindex(State(state): State<ChatState>) -> Result<Json<IndexSummary>, ApiError> {
    let correlation_id = new_correlation_id();
    let summary = state.runtime.retriever().reindex().await.map_err(|error| {
        warn!(
            event_name = "server.rag.reindex_failed",
            correlation_id = %correlation_id,
            error = %error,
            "document reindex failed"
        );
        ApiError::new(ApplicationError::Integration(error.to_string()), &correlation_id)
    })?;

    info!(
        event_name = "server.rag.reindexed",
        correlation_id = %correlation_id,
        indexed_docs = summary.indexed_docs,
        chunks = summary.chunks,
        "document index rebuilt"
    );
    Ok(Json(summary))
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;
    use std::sync::{Arc, Mutex};

    use aidgent_agent::{AgentRuntime, LlmClient, NoopRetriever};
    use aidgent_core::slots::QuestionBook;
    use aidgent_core::{PolicyBundle, SafetyConfig, SessionId, SlotConfig, SlotPolicy};
    use aidgent_db::InMemoryConversationStore;
    use anyhow::{anyhow, Result};
    use async_trait::async_trait;
    use axum::body::{to_bytes, Body, Bytes};
    use axum::extract::{Path, State};
    use axum::http::{Request, StatusCode};
    use axum::Json;
    use tower::ServiceExt;

    use super::*;

    const POLICY: &str = r#"
        [intents.resp_upper]
        required_slots = ["main_symptoms", "duration"]
        symptom_labels = ["ไข้", "ไอ", "เจ็บคอ", "น้ำมูก"]
    "#;

    const QUESTIONS: &str = "[resp_upper]\nduration = \"เป็นมากี่วันแล้วคะ\"\n";

    const SAFETY: &str = r#"
        [strings]
        emergency_main = "โทร 1669 ทันที"

        [[rules]]
        key = "chest"
        label = "เจ็บหน้าอก"
        patterns = ["เจ็บหน้าอก"]
    "#;

    #[derive(Default)]
    struct CannedLlm {
        replies: Mutex<VecDeque<String>>,
        calls: Mutex<usize>,
        outages: Mutex<usize>,
    }

    impl CannedLlm {
        fn new(replies: &[&str]) -> Arc<Self> {
            Arc::new(Self {
                replies: Mutex::new(replies.iter().map(|reply| reply.to_string()).collect()),
                calls: Mutex::new(0),
                outages: Mutex::new(0),
            })
        }

        /// Fails the first call, then replays `replies`.
        fn failing_once(replies: &[&str]) -> Arc<Self> {
            let llm = Self::new(replies);
            *llm.outages.lock().expect("outages lock") = 1;
            llm
        }

        fn calls(&self) -> usize {
            *self.calls.lock().expect("calls lock")
        }
    }

    #[async_trait]
    impl LlmClient for CannedLlm {
        async fn complete(&self, _system: &str, _user: &str) -> Result<String> {
            *self.calls.lock().expect("calls lock") += 1;
            {
                let mut outages = self.outages.lock().expect("outages lock");
                if *outages > 0 {
                    *outages -= 1;
                    return Err(anyhow!("model endpoint unavailable"));
                }
            }
            self.replies
                .lock()
                .expect("replies lock")
                .pop_front()
                .ok_or_else(|| anyhow!("no canned reply left"))
        }
    }

    fn chat_state(llm: Arc<CannedLlm>) -> (ChatState, Arc<InMemoryConversationStore>) {
        let bundle = PolicyBundle::new(
            "SYSTEM",
            SlotConfig::new(
                SlotPolicy::from_toml_str(POLICY, "inline").expect("policy"),
                QuestionBook::from_toml_str(QUESTIONS, "inline").expect("questions"),
            ),
            SafetyConfig::from_toml_str(SAFETY, "inline").expect("safety"),
        );
        let runtime = AgentRuntime::new(bundle.shared(), llm, Arc::new(NoopRetriever), None);
        let store = Arc::new(InMemoryConversationStore::new());
        let state = ChatState::new(Arc::new(runtime), store.clone(), store.clone(), store.clone());
        (state, store)
    }

    fn turn(session_id: Option<&str>, user_text: &str) -> Json<ChatTurnRequest> {
        Json(ChatTurnRequest {
            session_id: session_id.map(str::to_string),
            user_text: user_text.to_string(),
            locale: Some("th-TH".to_string()),
        })
    }

    #[tokio::test]
    async fn two_turns_ask_then_finalize_and_persist_summary() {
        let llm = CannedLlm::new(&[
            "[USER_VIEW] ดื่มน้ำเยอะ ๆ นะคะ [STATE_JSON] {\"intent\": \"resp_upper\", \"slots\": {}}",
            "[USER_VIEW] รับทราบค่ะ [STATE_JSON] {\"intent\": \"resp_upper\"}",
            "[USER_VIEW] สรุปอาการ: ไข้ 3 วัน [STATE_JSON] {\"soap_json\": {\"S\": \"ไข้ 3 วัน\"}, \"citations\": [{\"doc_id\": \"fever\", \"snippet_ids\": [\"s1\"]}]}",
        ]);
        let (state, _store) = chat_state(llm.clone());

        let Json(first) = chat_turn(State(state.clone()), turn(None, "มีไข้ค่ะ")).await.expect("first");
        assert_eq!(first.assistant_text, "เป็นมากี่วันแล้วคะ");
        assert_eq!(first.state.missing_slots, vec!["duration".to_string()]);
        assert!(!first.session_id.is_empty());

        let Json(second) = chat_turn(State(state.clone()), turn(Some(&first.session_id), "3 วันค่ะ"))
            .await
            .expect("second");
        assert_eq!(second.session_id, first.session_id);
        assert_eq!(second.assistant_text, "สรุปอาการ: ไข้ 3 วัน");
        assert!(second.state.soap_ready);
        assert_eq!(llm.calls(), 3);

        let Json(record) = transcript(State(state), Path(first.session_id.clone()))
            .await
            .expect("transcript");
        assert_eq!(record.messages.len(), 4);
        assert_eq!(record.messages[1].state["missing_slots"], serde_json::json!(["duration"]));
        assert_eq!(record.soap_summaries.len(), 1);
        assert_eq!(record.citations.len(), 1);
        assert_eq!(record.citations[0].doc_id, "fever");
    }

    #[tokio::test]
    async fn red_flag_turn_is_stored_without_model_call() {
        let llm = CannedLlm::new(&[]);
        let (state, store) = chat_state(llm.clone());

        let Json(response) =
            chat_turn(State(state), turn(Some("s-red"), "เจ็บหน้าอกมาก")).await.expect("turn");

        assert_eq!(response.assistant_text, "โทร 1669 ทันที");
        assert!(response.state.red_flag_detected);
        assert_eq!(response.state.red_flag_label.as_deref(), Some("เจ็บหน้าอก"));
        assert_eq!(llm.calls(), 0);

        let stored = store
            .last_assistant_state(&SessionId("s-red".to_string()))
            .await
            .expect("state")
            .expect("stored");
        assert!(stored.red_flag_detected);
    }

    #[tokio::test]
    async fn model_failure_maps_to_service_unavailable() {
        let (state, _store) = chat_state(CannedLlm::new(&[]));

        let error = chat_turn(State(state), turn(None, "ไอ")).await.expect_err("model failure");

        assert_eq!(error.status(), StatusCode::SERVICE_UNAVAILABLE);
    }

    #[tokio::test]
    async fn open_session_seeds_first_turn_with_hint() {
        let llm = CannedLlm::new(&["[USER_VIEW] โอเคค่ะ [STATE_JSON] {\"intent\": \"uncertain\"}"]);
        let (state, _store) = chat_state(llm);

        let Json(opened) = open_session(
            State(state.clone()),
            Bytes::from_static(br#"{"intent_hint": "resp_upper"}"#),
        )
        .await
        .expect("open");
        let Json(response) = chat_turn(State(state.clone()), turn(Some(&opened.session_id), "สวัสดีค่ะ"))
            .await
            .expect("turn");

        assert_eq!(response.state.intent, Some(Intent::named("resp_upper")));

        let unknown = open_session(State(state), Bytes::from_static(br#"{"intent_hint": "ortho"}"#))
            .await
            .expect_err("unknown hint");
        assert_eq!(unknown.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn hint_survives_a_failed_first_turn() {
        let llm =
            CannedLlm::failing_once(&["[USER_VIEW] โอเคค่ะ [STATE_JSON] {\"intent\": \"uncertain\"}"]);
        let (state, store) = chat_state(llm.clone());

        let Json(opened) = open_session(
            State(state.clone()),
            Bytes::from_static(br#"{"intent_hint": "resp_upper"}"#),
        )
        .await
        .expect("open");

        let failed = chat_turn(State(state.clone()), turn(Some(&opened.session_id), "สวัสดีค่ะ"))
            .await
            .expect_err("model outage");
        assert_eq!(failed.status(), StatusCode::SERVICE_UNAVAILABLE);

        let Json(retried) =
            chat_turn(State(state), turn(Some(&opened.session_id), "สวัสดีค่ะ อีกครั้ง"))
                .await
                .expect("retry");
        assert_eq!(retried.state.intent, Some(Intent::named("resp_upper")));
        assert_eq!(llm.calls(), 2);

        let stored = store
            .last_assistant_state(&SessionId(opened.session_id))
            .await
            .expect("state")
            .expect("stored");
        assert_eq!(stored.intent, Some(Intent::named("resp_upper")));
    }

    #[tokio::test]
    async fn router_rejects_blank_text_and_unknown_transcript() {
        let (state, _store) = chat_state(CannedLlm::new(&[]));
        let app = router(state);

        let response = app
            .clone()
            .oneshot(
                Request::post("/chat/turn")
                    .header("content-type", "application/json")
                    .body(Body::from(r#"{"user_text": "   "}"#))
                    .expect("request"),
            )
            .await
            .expect("response");
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let body = to_bytes(response.into_body(), usize::MAX).await.expect("body");
        let body: serde_json::Value = serde_json::from_slice(&body).expect("json");
        assert_eq!(body["detail"], "user_text required");
        assert!(body["correlation_id"].as_str().is_some_and(|id| !id.is_empty()));

        let response = app
            .oneshot(
                Request::get("/session/absent/transcript").body(Body::empty()).expect("request"),
            )
            .await
            .expect("response");
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn reindex_reports_index_summary() {
        let (state, _store) = chat_state(CannedLlm::new(&[]));

        let Json(summary) = reindex(State(state)).await.expect("reindex");

        assert_eq!(summary.indexed_docs, 0);
        assert_eq!(summary.chunks, 0);
    }

    #[tokio::test]
    async fn session_lock_is_exclusive_per_session() {
        let locks = SessionLocks::default();
        let first = SessionId("a".to_string());

        let guard = locks.acquire(&first).await;
        let other = locks.acquire(&SessionId("b".to_string())).await;
        let blocked = tokio::time::timeout(
            std::time::Duration::from_millis(50),
            locks.acquire(&first),
        )
        .await;
        assert!(blocked.is_err(), "second turn on the same session must wait");

        drop(guard);
        drop(other);
        let reacquired =
            tokio::time::timeout(std::time::Duration::from_millis(50), locks.acquire(&first)).await;
        assert!(reacquired.is_ok());
    }
}

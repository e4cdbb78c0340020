use std::sync::Arc;

use aidgent_core::prompt::{build_finalize_prompt, build_turn_prompt};
use aidgent_core::{
    enforce_turn, Citation, ConversationState, HistoryLine, PolicyBundle, SearchParams, Snippet,
    TurnDecision, TurnInput,
};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::guardrails::{GuardrailDecision, SafetyGuard};
use crate::llm::LlmClient;
use crate::reply::{parse_model_output, ModelOutput};
use crate::retrieval::Retriever;

#[derive(Debug, Error)]
pub enum AgentError {
    #[error("user text is empty")]
    EmptyUserText,
    #[error("model call failed: {0}")]
    Model(String),
    #[error("model output could not be turned into a reply")]
    EmptyReply,
}

/// What the runtime needs to know about the session before the turn.
#[derive(Clone, Copy, Debug)]
pub struct TurnRequest<'a> {
    pub session_id: &'a str,
    pub user_text: &'a str,
    /// Prior messages, oldest first, not including `user_text`.
    pub history: &'a [HistoryLine],
    pub previous: &'a ConversationState,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TurnKind {
    Emergency { label: String },
    AskedSlot { slot: String },
    PassThrough,
    Finalized,
}

impl TurnKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Emergency { .. } => "emergency",
            Self::AskedSlot { .. } => "asked_slot",
            Self::PassThrough => "pass_through",
            Self::Finalized => "finalized",
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct TurnOutcome {
    pub reply: String,
    pub state: ConversationState,
    pub kind: TurnKind,
    /// Citations introduced by this turn, as opposed to ones carried over.
    pub new_citations: Vec<Citation>,
    pub snippets: Vec<Snippet>,
}

impl TurnOutcome {
    /// Whether the turn produced a clinical summary worth storing.
    pub fn summary_to_persist(&self) -> Option<&serde_json::Map<String, serde_json::Value>> {
        (self.kind == TurnKind::Finalized && self.state.soap_ready && self.state.has_summary())
            .then_some(&self.state.soap_json)
    }
}

/// Runs one conversational turn: red-flag check, retrieval, model call,
/// slot enforcement and, when every required slot is in, the finalize pass.
pub struct AgentRuntime {
    bundle: Arc<PolicyBundle>,
    guard: SafetyGuard,
    llm: Arc<dyn LlmClient>,
    retriever: Arc<dyn Retriever>,
    search: Option<SearchParams>,
}

impl AgentRuntime {
    pub fn new(
        bundle: Arc<PolicyBundle>,
        llm: Arc<dyn LlmClient>,
        retriever: Arc<dyn Retriever>,
        search: Option<SearchParams>,
    ) -> Self {
        Self { guard: SafetyGuard::new(bundle.clone()), bundle, llm, retriever, search }
    }

    pub fn bundle(&self) -> &PolicyBundle {
        &self.bundle
    }

    pub fn retriever(&self) -> &Arc<dyn Retriever> {
        &self.retriever
    }

    pub async fn handle_turn(&self, request: TurnRequest<'_>) -> Result<TurnOutcome, AgentError> {
        let user_text = request.user_text.trim();
        if user_text.is_empty() {
            return Err(AgentError::EmptyUserText);
        }

        if let GuardrailDecision::Emergency { report, reply, state } =
            self.guard.evaluate(user_text)
        {
            warn!(
                event_name = "agent.turn.red_flag",
                session_id = %request.session_id,
                rule = %report.key,
                label = %report.label,
                "red flag detected, bypassing model"
            );
            return Ok(TurnOutcome {
                reply,
                state,
                kind: TurnKind::Emergency { label: report.label },
                new_citations: Vec::new(),
                snippets: Vec::new(),
            });
        }

        let snippets = self.search_snippets(request.session_id, user_text).await;

        let prompt =
            build_turn_prompt(&self.bundle.system_prompt, request.history, user_text, &snippets);
        let first = self.call_model(&prompt.system, &prompt.user).await?;
        if !first.state_parsed {
            debug!(
                event_name = "agent.turn.state_missing",
                session_id = %request.session_id,
                "model reply carried no parseable state block"
            );
        }

        let enforcement = enforce_turn(
            &self.bundle.slots,
            TurnInput {
                previous: request.previous,
                proposed: &first.proposed,
                draft_reply: &first.reply,
                user_text,
            },
        );
        if enforcement.reply.trim().is_empty() {
            return Err(AgentError::EmptyReply);
        }

        let mut outcome = TurnOutcome {
            kind: match &enforcement.decision {
                TurnDecision::AskSlot { slot } => TurnKind::AskedSlot { slot: slot.clone() },
                TurnDecision::PassThrough => TurnKind::PassThrough,
            },
            reply: enforcement.reply,
            state: enforcement.state,
            new_citations: Vec::new(),
            snippets,
        };

        if self.needs_finalize(&outcome.state) {
            self.finalize(request.session_id, &mut outcome).await;
        }

        info!(
            event_name = "agent.turn.completed",
            session_id = %request.session_id,
            kind = outcome.kind.as_str(),
            intent = %outcome.state.resolved_intent(),
            missing = outcome.state.missing_slots.len(),
            intent_changed = enforcement.intent_changed,
            "turn completed"
        );
        Ok(outcome)
    }

    fn needs_finalize(&self, state: &ConversationState) -> bool {
        state.required_slots_filled
            && !state.soap_ready
            && self.bundle.slots.policy.intent(&state.resolved_intent()).is_some()
    }

    /// Second model call asking for the clinical summary. A failed call keeps
    /// the pass-through reply and leaves `soap_ready` unset so the next turn
    /// tries again.
    async fn finalize(&self, session_id: &str, outcome: &mut TurnOutcome) {
        let prompt = build_finalize_prompt(
            &self.bundle.system_prompt,
            &outcome.state.slots,
            &outcome.snippets,
        );
        let output = match self.call_model(&prompt.system, &prompt.user).await {
            Ok(output) => output,
            Err(error) => {
                warn!(
                    event_name = "agent.turn.finalize_failed",
                    session_id = %session_id,
                    error = %error,
                    "finalize pass failed, keeping pass-through reply"
                );
                return;
            }
        };

        let state = &mut outcome.state;
        for (key, value) in &output.proposed.slots {
            if value.is_meaningful() {
                state.slots.insert(key.clone(), value.clone());
            }
        }
        if !output.proposed.soap_json.is_empty() {
            state.soap_json = output.proposed.soap_json.clone();
        }
        if !output.proposed.citations.is_empty() {
            state.citations = output.proposed.citations.clone();
            outcome.new_citations = output.proposed.citations.clone();
        }
        state.soap_ready = true;
        state.required_slots_filled = true;
        state.missing_slots.clear();
        if let Some(intent) = self.bundle.slots.policy.intent(&state.resolved_intent()) {
            state.asked_slots.extend(intent.required_slots.iter().cloned());
        }

        if !output.reply.trim().is_empty() {
            outcome.reply = output.reply;
        }
        outcome.kind = TurnKind::Finalized;

        debug!(
            event_name = "agent.turn.finalized",
            session_id = %session_id,
            has_summary = state.has_summary(),
            citations = outcome.new_citations.len(),
            "finalize pass applied"
        );
    }

    async fn search_snippets(&self, session_id: &str, user_text: &str) -> Vec<Snippet> {
        let Some(params) = self.search else {
            return Vec::new();
        };
        match self.retriever.search(user_text, params).await {
            Ok(snippets) => snippets,
            Err(error) => {
                warn!(
                    event_name = "agent.retrieval.failed",
                    session_id = %session_id,
                    error = %error,
                    "retrieval failed, continuing without snippets"
                );
                Vec::new()
            }
        }
    }

    async fn call_model(&self, system: &str, user: &str) -> Result<ModelOutput, AgentError> {
        let raw = self
            .llm
            .complete(system, user)
            .await
            .map_err(|error| AgentError::Model(format!("{error:#}")))?;
        Ok(parse_model_output(&raw))
    }
}

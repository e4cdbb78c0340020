//! Turn orchestration for the triage assistant.
//!
//! Each turn follows a fixed loop:
//! 1. **Red-flag check** (`guardrails`) - deterministic rules can end the turn
//!    with the emergency message before any model call
//! 2. **Retrieval** (`retrieval`) - reference snippets for the user's text
//! 3. **Model call** (`llm`, `reply`) - proposal of reply plus state
//! 4. **Slot enforcement** - the core decides whether to ask one more question
//! 5. **Finalize pass** - a second model call once every required slot is in
//!
//! The model never decides what is still missing or when collection is done.
//! Those decisions belong to the slot engine in `aidgent-core`.

pub mod guardrails;
pub mod llm;
pub mod reply;
pub mod retrieval;
pub mod runtime;

pub use guardrails::{GuardrailDecision, SafetyGuard};
pub use llm::{HttpApi, LlmClient, OpenAiCompatibleClient};
pub use reply::{parse_model_output, ModelOutput};
pub use retrieval::{
    Embedder, InMemoryRetriever, IndexSummary, NoopRetriever, OpenAiEmbedder, RetrievalError,
    Retriever,
};
pub use runtime::{AgentError, AgentRuntime, TurnKind, TurnOutcome, TurnRequest};

pub mod bundle;
pub mod config;
pub mod domain;
pub mod errors;
pub mod prompt;
pub mod retrieval;
pub mod safety;
pub mod slots;

pub use bundle::PolicyBundle;
pub use domain::message::{HistoryLine, MessageRole};
pub use domain::session::{
    CitationRecord, Session, SessionId, StoredMessage, Transcript, TranscriptMessage,
};
pub use domain::state::{Citation, ConversationState, Intent, ProposedState};
pub use errors::{ApplicationError, DomainError, InterfaceError};
pub use prompt::{build_finalize_prompt, build_turn_prompt, PromptPair};
pub use retrieval::{SearchParams, Snippet};
pub use safety::{RedFlagReport, SafetyConfig, SafetyStrings};
pub use slots::{enforce_turn, Enforcement, SlotConfig, SlotPolicy, TurnDecision, TurnInput};

//! Slot-filling engine: merge the model's proposal into the persisted state,
//! infer what the user already said, and decide whether to ask one more
//! question or let the model's reply through.

pub mod alias;
pub mod enforce;
pub mod extract;
pub mod merge;
pub mod policy;
pub mod predicate;
pub mod resolver;
pub mod value;

pub const MAIN_SYMPTOMS: &str = "main_symptoms";
pub const DURATION: &str = "duration";

pub use enforce::{enforce_turn, Enforcement, TurnDecision, TurnInput};
pub use extract::Lexicon;
pub use merge::{merge_states, MergeOutcome};
pub use policy::{IntentPolicy, PolicyError, PolicyReport, QuestionBook, SlotConfig, SlotPolicy};
pub use predicate::Predicate;
pub use value::{SlotMap, SlotValue};

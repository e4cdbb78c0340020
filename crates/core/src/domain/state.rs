use std::collections::BTreeSet;
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::slots::value::{SlotMap, SlotValue};

pub const STATE_VERSION: u32 = 1;

/// Classified concern of the conversation. Named intents are closed by the
/// loaded slot policy; `Uncertain` is the sentinel for "not yet classified".
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(from = "Option<String>", into = "String")]
pub enum Intent {
    #[default]
    Uncertain,
    Named(String),
}

impl Intent {
    pub const UNCERTAIN: &'static str = "uncertain";
    pub const EMERGENCY: &'static str = "emergency";

    pub fn parse(raw: &str) -> Self {
        let trimmed = raw.trim();
        if trimmed.is_empty() || trimmed.eq_ignore_ascii_case(Self::UNCERTAIN) {
            Self::Uncertain
        } else {
            Self::Named(trimmed.to_string())
        }
    }

    pub fn named(name: impl Into<String>) -> Self {
        Self::parse(&name.into())
    }

    pub fn emergency() -> Self {
        Self::Named(Self::EMERGENCY.to_string())
    }

    pub fn as_str(&self) -> &str {
        match self {
            Self::Uncertain => Self::UNCERTAIN,
            Self::Named(name) => name,
        }
    }

    pub fn is_uncertain(&self) -> bool {
        matches!(self, Self::Uncertain)
    }
}

impl fmt::Display for Intent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<Option<String>> for Intent {
    fn from(value: Option<String>) -> Self {
        value.map(|raw| Self::parse(&raw)).unwrap_or_default()
    }
}

impl From<Intent> for String {
    fn from(value: Intent) -> Self {
        value.as_str().to_string()
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Citation {
    pub doc_id: String,
    pub snippet_ids: Vec<String>,
}

impl Citation {
    fn from_model_json(value: &Value) -> Option<Self> {
        let object = value.as_object()?;
        let doc_id = object.get("doc_id").and_then(Value::as_str)?.trim().to_string();
        if doc_id.is_empty() {
            return None;
        }
        let snippet_ids = match object.get("snippet_ids") {
            Some(Value::Array(items)) => {
                items.iter().filter_map(Value::as_str).map(str::to_string).collect()
            }
            Some(Value::String(single)) => vec![single.clone()],
            _ => Vec::new(),
        };
        Some(Self { doc_id, snippet_ids })
    }
}

/// Per-session conversation record, persisted as an opaque versioned blob.
///
/// `missing_slots` and `required_slots_filled` are derived on every turn and
/// are never read back as input.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConversationState {
    pub version: u32,
    pub intent: Option<Intent>,
    pub slots: SlotMap,
    pub asked_slots: BTreeSet<String>,
    pub missing_slots: Vec<String>,
    pub required_slots_filled: bool,
    pub red_flag_detected: bool,
    pub red_flag_label: Option<String>,
    pub soap_ready: bool,
    pub soap_json: Map<String, Value>,
    pub citations: Vec<Citation>,
}

impl Default for ConversationState {
    fn default() -> Self {
        Self {
            version: STATE_VERSION,
            intent: None,
            slots: SlotMap::new(),
            asked_slots: BTreeSet::new(),
            missing_slots: Vec::new(),
            required_slots_filled: false,
            red_flag_detected: false,
            red_flag_label: None,
            soap_ready: false,
            soap_json: Map::new(),
            citations: Vec::new(),
        }
    }
}

impl ConversationState {
    /// Empty state seeded with an intent hint, used when a session is opened
    /// for a known concern.
    pub fn with_intent(intent: Intent) -> Self {
        Self { intent: Some(intent), ..Self::default() }
    }

    /// State recorded for a turn short-circuited by the emergency detector.
    pub fn emergency(label: impl Into<String>) -> Self {
        Self {
            intent: Some(Intent::emergency()),
            red_flag_detected: true,
            red_flag_label: Some(label.into()),
            ..Self::default()
        }
    }

    /// Reads a persisted blob. Anything unreadable starts the session over
    /// from an empty state.
    pub fn from_persisted(raw: &str) -> Self {
        if raw.trim().is_empty() {
            return Self::default();
        }
        serde_json::from_str(raw).unwrap_or_default()
    }

    pub fn to_persisted(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| "{}".to_string())
    }

    pub fn resolved_intent(&self) -> Intent {
        self.intent.clone().unwrap_or_default()
    }

    pub fn has_summary(&self) -> bool {
        !self.soap_json.is_empty()
    }
}

/// The model's structured proposal for this turn, parsed from its state block.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ProposedState {
    pub intent: Option<Intent>,
    pub slots: SlotMap,
    pub asked_slots: Vec<String>,
    pub soap_ready: Option<bool>,
    pub soap_json: Map<String, Value>,
    pub citations: Vec<Citation>,
}

impl ProposedState {
    /// Lenient read of whatever the model produced. Wrong shapes degrade to
    /// absent values instead of failing the turn.
    pub fn from_model_json(value: &Value) -> Self {
        let Some(object) = value.as_object() else {
            return Self::default();
        };

        let intent = object
            .get("intent")
            .and_then(Value::as_str)
            .filter(|raw| !raw.trim().is_empty())
            .map(Intent::parse);

        let slots = match object.get("slots") {
            Some(Value::Object(raw_slots)) => raw_slots
                .iter()
                .map(|(key, value)| (key.clone(), SlotValue::from(value.clone())))
                .collect(),
            _ => SlotMap::new(),
        };

        let asked_slots = match object.get("asked_slots") {
            Some(Value::Array(items)) => {
                items.iter().filter_map(Value::as_str).map(str::to_string).collect()
            }
            _ => Vec::new(),
        };

        let soap_json = match object.get("soap_json") {
            Some(Value::Object(summary)) => summary.clone(),
            _ => Map::new(),
        };

        let citations = match object.get("citations") {
            Some(Value::Array(items)) => {
                items.iter().filter_map(Citation::from_model_json).collect()
            }
            _ => Vec::new(),
        };

        Self {
            intent,
            slots,
            asked_slots,
            soap_ready: object.get("soap_ready").and_then(Value::as_bool),
            soap_json,
            citations,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.intent.is_none()
            && self.slots.is_empty()
            && self.asked_slots.is_empty()
            && self.soap_ready.is_none()
            && self.soap_json.is_empty()
            && self.citations.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::{ConversationState, Intent, ProposedState, STATE_VERSION};
    use crate::slots::value::SlotValue;

    #[test]
    fn intent_parsing_maps_blank_and_sentinel_to_uncertain() {
        assert_eq!(Intent::parse(""), Intent::Uncertain);
        assert_eq!(Intent::parse(" Uncertain "), Intent::Uncertain);
        assert_eq!(Intent::parse("resp_upper"), Intent::Named("resp_upper".to_string()));
    }

    #[test]
    fn proposed_state_tolerates_wrong_shapes() {
        let proposed = ProposedState::from_model_json(&json!({
            "intent": 42,
            "slots": ["not", "an", "object"],
            "asked_slots": "duration",
            "citations": [{"doc_id": ""}, {"doc_id": "urti-01", "snippet_ids": "s2"}]
        }));

        assert_eq!(proposed.intent, None);
        assert!(proposed.slots.is_empty());
        assert!(proposed.asked_slots.is_empty());
        assert_eq!(proposed.citations.len(), 1);
        assert_eq!(proposed.citations[0].snippet_ids, vec!["s2".to_string()]);

        assert!(ProposedState::from_model_json(&json!("raw text")).is_empty());
    }

    #[test]
    fn proposed_state_reads_slots_and_intent() {
        let proposed = ProposedState::from_model_json(&json!({
            "intent": "resp_upper",
            "slots": {"fever": true, "duration": "2 วัน", "fever_max_c": null}
        }));

        assert_eq!(proposed.intent, Some(Intent::named("resp_upper")));
        assert_eq!(proposed.slots.get("fever"), Some(&SlotValue::Bool(true)));
        assert_eq!(proposed.slots.get("fever_max_c"), Some(&SlotValue::Null));
    }

    #[test]
    fn unreadable_persisted_blob_starts_over() {
        let state = ConversationState::from_persisted("{not json");
        assert_eq!(state, ConversationState::default());
        assert_eq!(state.version, STATE_VERSION);

        let legacy = ConversationState::from_persisted(r#"{"intent":"derm_rash"}"#);
        assert_eq!(legacy.intent, Some(Intent::named("derm_rash")));
        assert_eq!(legacy.version, STATE_VERSION);
    }

    #[test]
    fn persisted_blob_keeps_state_fields() {
        let mut state = ConversationState::with_intent(Intent::named("resp_upper"));
        state.slots.insert("fever_measured".to_string(), SlotValue::Bool(false));
        state.asked_slots.insert("duration".to_string());

        let restored = ConversationState::from_persisted(&state.to_persisted());
        assert_eq!(restored, state);
    }
}

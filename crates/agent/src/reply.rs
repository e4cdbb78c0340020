use aidgent_core::ProposedState;
use serde_json::Value;

const USER_VIEW_MARKER: &str = "[USER_VIEW]";
const STATE_JSON_MARKER: &str = "[STATE_JSON]";
const CODE_FENCE: &str = "```";

/// A model completion split into the user-facing reply and its state block.
#[derive(Clone, Debug, PartialEq)]
pub struct ModelOutput {
    pub reply: String,
    pub proposed: ProposedState,
    /// Whether a state block was found and parsed as a JSON object.
    pub state_parsed: bool,
}

/// Splits `[USER_VIEW] ... [STATE_JSON] ...` output. Without both markers the
/// whole completion is the reply and the proposal is empty.
pub fn parse_model_output(raw: &str) -> ModelOutput {
    let (Some(view_start), Some(state_start)) =
        (raw.find(USER_VIEW_MARKER), raw.find(STATE_JSON_MARKER))
    else {
        return ModelOutput {
            reply: raw.to_string(),
            proposed: ProposedState::default(),
            state_parsed: false,
        };
    };

    let view_from = view_start + USER_VIEW_MARKER.len();
    let reply = if view_from <= state_start { raw[view_from..state_start].trim() } else { "" };
    let state_text = raw[state_start + STATE_JSON_MARKER.len()..].trim();

    let parsed = parse_state_block(state_text);
    ModelOutput {
        reply: reply.to_string(),
        proposed: parsed.as_ref().map(ProposedState::from_model_json).unwrap_or_default(),
        state_parsed: parsed.as_ref().is_some_and(Value::is_object),
    }
}

fn parse_state_block(text: &str) -> Option<Value> {
    let unfenced = strip_code_fence(text);
    if let Ok(value) = serde_json::from_str::<Value>(unfenced) {
        return Some(value);
    }

    let first = unfenced.find('{')?;
    let last = unfenced.rfind('}')?;
    if last <= first {
        return None;
    }
    serde_json::from_str::<Value>(&unfenced[first..=last]).ok()
}

fn strip_code_fence(text: &str) -> &str {
    let Some(rest) = text.strip_prefix(CODE_FENCE) else {
        return text;
    };
    match rest.find(CODE_FENCE) {
        Some(end) => rest[..end].trim(),
        None => rest.trim(),
    }
}

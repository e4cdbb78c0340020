use crate::domain::state::{ConversationState, Intent, ProposedState, STATE_VERSION};
use crate::slots::policy::SlotPolicy;
use crate::slots::MAIN_SYMPTOMS;

#[derive(Clone, Debug, PartialEq)]
pub struct MergeOutcome {
    pub state: ConversationState,
    pub intent_changed: bool,
}

/// Folds the model's proposal into the previous state.
///
/// Intent: a named proposed intent wins, otherwise the previous one is kept.
/// Slots: a proposed value replaces a stored one only when it is meaningful.
/// An intent change drops slots exclusive to other intents, clears the
/// derived symptom list and restarts question tracking. Summary fields are
/// carried from the previous state; red-flag fields never are.
pub fn merge_states(
    policy: &SlotPolicy,
    previous: &ConversationState,
    proposed: &ProposedState,
) -> MergeOutcome {
    let named_proposal = proposed.intent.clone().filter(|intent| !intent.is_uncertain());
    let intent = named_proposal
        .or_else(|| previous.intent.clone())
        .or_else(|| proposed.intent.clone())
        .unwrap_or(Intent::Uncertain);
    let intent_changed = previous.intent.as_ref().is_some_and(|before| *before != intent);

    let mut slots = previous.slots.clone();
    for (key, value) in &proposed.slots {
        if value.is_meaningful() {
            slots.insert(key.clone(), value.clone());
        }
    }

    let asked_slots = if intent_changed {
        let foreign = policy.foreign_exclusive_slots(&intent);
        slots.retain(|key, _| !foreign.contains(key.as_str()));
        slots.remove(MAIN_SYMPTOMS);
        Default::default()
    } else {
        let mut asked = previous.asked_slots.clone();
        asked.extend(proposed.asked_slots.iter().cloned());
        asked
    };

    let state = ConversationState {
        version: STATE_VERSION,
        intent: Some(intent),
        slots,
        asked_slots,
        missing_slots: Vec::new(),
        required_slots_filled: false,
        red_flag_detected: false,
        red_flag_label: None,
        soap_ready: previous.soap_ready,
        soap_json: previous.soap_json.clone(),
        citations: previous.citations.clone(),
    };

    MergeOutcome { state, intent_changed }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::merge_states;
    use crate::domain::state::{ConversationState, Intent, ProposedState};
    use crate::slots::policy::SlotPolicy;
    use crate::slots::value::SlotValue;

    fn policy() -> SlotPolicy {
        SlotPolicy::from_toml_str(
            r#"
            [intents.resp_upper]
            required_slots = ["main_symptoms", "duration"]
            exclusive_slots = ["fever", "fever_measured", "fever_max_c"]

            [intents.derm_rash]
            required_slots = ["main_symptoms", "rash_location_primary"]
            exclusive_slots = ["rash", "rash_location_primary", "meds_allergies"]
            "#,
            "inline",
        )
        .expect("policy")
    }

    fn previous(value: serde_json::Value) -> ConversationState {
        serde_json::from_value(value).expect("state")
    }

    fn proposal(value: serde_json::Value) -> ProposedState {
        ProposedState::from_model_json(&value)
    }

    #[test]
    fn explicit_false_replaces_absent_value() {
        let outcome = merge_states(
            &policy(),
            &previous(json!({"intent": "resp_upper"})),
            &proposal(json!({"slots": {"fever": false}})),
        );

        assert_eq!(outcome.state.slots.get("fever"), Some(&SlotValue::Bool(false)));
    }

    #[test]
    fn empty_proposals_never_erase_known_values() {
        let outcome = merge_states(
            &policy(),
            &previous(json!({"intent": "resp_upper", "slots": {"duration": "2 วัน", "cough": true}})),
            &proposal(json!({"slots": {"duration": "", "cough": null, "fever_max_c": []}})),
        );

        assert_eq!(outcome.state.slots.get("duration"), Some(&SlotValue::text("2 วัน")));
        assert_eq!(outcome.state.slots.get("cough"), Some(&SlotValue::Bool(true)));
        assert!(!outcome.state.slots.contains_key("fever_max_c"));
    }

    #[test]
    fn uncertain_proposal_keeps_previous_intent_and_progress() {
        let outcome = merge_states(
            &policy(),
            &previous(json!({"intent": "resp_upper", "asked_slots": ["duration"]})),
            &proposal(json!({"intent": "uncertain", "asked_slots": ["fever_measured"]})),
        );

        assert!(!outcome.intent_changed);
        assert_eq!(outcome.state.intent, Some(Intent::named("resp_upper")));
        assert_eq!(
            outcome.state.asked_slots.iter().map(String::as_str).collect::<Vec<_>>(),
            vec!["duration", "fever_measured"]
        );
    }

    #[test]
    fn intent_change_resets_tracking_and_foreign_slots() {
        let outcome = merge_states(
            &policy(),
            &previous(json!({
                "intent": "resp_upper",
                "slots": {
                    "fever": true,
                    "fever_measured": true,
                    "main_symptoms": ["ไข้"],
                    "risk_factors": "เบาหวาน",
                    "duration": "3 วัน"
                },
                "asked_slots": ["fever_measured"]
            })),
            &proposal(json!({"intent": "derm_rash", "slots": {"rash": true}})),
        );

        assert!(outcome.intent_changed);
        assert!(outcome.state.asked_slots.is_empty());
        assert!(!outcome.state.slots.contains_key("fever"));
        assert!(!outcome.state.slots.contains_key("fever_measured"));
        assert!(!outcome.state.slots.contains_key("main_symptoms"));
        assert_eq!(outcome.state.slots.get("risk_factors"), Some(&SlotValue::text("เบาหวาน")));
        assert_eq!(outcome.state.slots.get("duration"), Some(&SlotValue::text("3 วัน")));
        assert_eq!(outcome.state.slots.get("rash"), Some(&SlotValue::Bool(true)));
    }

    #[test]
    fn carry_over_slots_survive_a_pivot_even_when_exclusive() {
        let outcome = merge_states(
            &policy(),
            &previous(json!({"intent": "derm_rash", "slots": {"meds_allergies": "ไม่มี", "rash": true}})),
            &proposal(json!({"intent": "resp_upper"})),
        );

        assert!(outcome.intent_changed);
        assert_eq!(outcome.state.slots.get("meds_allergies"), Some(&SlotValue::text("ไม่มี")));
        assert!(!outcome.state.slots.contains_key("rash"));
    }

    #[test]
    fn first_classification_is_not_a_change() {
        let outcome = merge_states(
            &policy(),
            &ConversationState::default(),
            &proposal(json!({"intent": "resp_upper", "asked_slots": ["duration"]})),
        );

        assert!(!outcome.intent_changed);
        assert!(outcome.state.asked_slots.contains("duration"));

        let unclassified = merge_states(&policy(), &ConversationState::default(), &proposal(json!({})));
        assert_eq!(unclassified.state.intent, Some(Intent::Uncertain));
    }

    #[test]
    fn summary_is_carried_and_red_flags_are_cleared() {
        let outcome = merge_states(
            &policy(),
            &previous(json!({
                "intent": "resp_upper",
                "soap_ready": true,
                "soap_json": {"S": "ไข้ 3 วัน"},
                "red_flag_detected": true,
                "red_flag_label": "breathing"
            })),
            &proposal(json!({"soap_ready": false, "soap_json": {"S": "ignored"}})),
        );

        assert!(outcome.state.soap_ready);
        assert_eq!(outcome.state.soap_json.get("S"), Some(&json!("ไข้ 3 วัน")));
        assert!(!outcome.state.red_flag_detected);
        assert_eq!(outcome.state.red_flag_label, None);
    }
}

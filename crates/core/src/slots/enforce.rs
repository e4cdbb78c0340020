use tracing::debug;

use crate::domain::state::{ConversationState, ProposedState};
use crate::slots::alias::apply_aliases;
use crate::slots::extract::run_extractors;
use crate::slots::merge::merge_states;
use crate::slots::policy::SlotConfig;
use crate::slots::resolver::compute_missing;

/// One conversational turn as seen by the enforcement driver.
#[derive(Clone, Copy, Debug)]
pub struct TurnInput<'a> {
    pub previous: &'a ConversationState,
    pub proposed: &'a ProposedState,
    pub draft_reply: &'a str,
    pub user_text: &'a str,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TurnDecision {
    /// A single follow-up question replaced the model's reply.
    AskSlot { slot: String },
    /// Every required slot was filled or already asked; the model's reply
    /// went out unchanged.
    PassThrough,
}

#[derive(Clone, Debug, PartialEq)]
pub struct Enforcement {
    pub reply: String,
    pub state: ConversationState,
    pub decision: TurnDecision,
    pub intent_changed: bool,
}

impl Enforcement {
    pub fn asked_slot(&self) -> Option<&str> {
        match &self.decision {
            TurnDecision::AskSlot { slot } => Some(slot.as_str()),
            TurnDecision::PassThrough => None,
        }
    }
}

/// Runs merge, alias normalization, extraction, missing-slot computation and
/// the ask/pass-through decision for one turn. Never fails.
pub fn enforce_turn(config: &SlotConfig, input: TurnInput<'_>) -> Enforcement {
    let merged = merge_states(&config.policy, input.previous, input.proposed);
    let mut state = merged.state;
    let intent = state.resolved_intent();
    let intent_policy = config.policy.intent(&intent);

    apply_aliases(&config.policy.aliases, &mut state.slots);
    run_extractors(config.lexicon(), intent_policy, input.user_text, &mut state.slots);

    let missing: Vec<String> = compute_missing(intent_policy, &state.slots)
        .into_iter()
        .filter(|slot| !state.asked_slots.contains(slot))
        .collect();

    state.required_slots_filled = missing.is_empty();
    state.missing_slots = missing;

    let Some(next_slot) = state.missing_slots.first().cloned() else {
        debug!(
            event_name = "slots.enforce.pass_through",
            intent = %intent,
            intent_changed = merged.intent_changed,
            "required slots satisfied"
        );
        return Enforcement {
            reply: input.draft_reply.to_string(),
            state,
            decision: TurnDecision::PassThrough,
            intent_changed: merged.intent_changed,
        };
    };

    state.asked_slots.insert(next_slot.clone());
    state.soap_ready = false;
    state.soap_json.clear();
    let question = config.question(&intent, &next_slot).to_string();

    debug!(
        event_name = "slots.enforce.ask",
        intent = %intent,
        slot = %next_slot,
        remaining = state.missing_slots.len(),
        intent_changed = merged.intent_changed,
        "asking for next missing slot"
    );

    Enforcement {
        reply: question,
        state,
        decision: TurnDecision::AskSlot { slot: next_slot },
        intent_changed: merged.intent_changed,
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::{enforce_turn, TurnDecision, TurnInput};
    use crate::domain::state::{ConversationState, Intent, ProposedState};
    use crate::slots::policy::{QuestionBook, SlotConfig, SlotPolicy};
    use crate::slots::value::SlotValue;

    const POLICY: &str = r#"
        [intents.resp_upper]
        required_slots = ["main_symptoms", "duration", "fever_measured"]
        ask_order = ["main_symptoms", "duration", "fever_measured"]
        symptom_labels = ["ไข้", "ไอ", "เจ็บคอ", "น้ำมูก"]
        exclusive_slots = ["fever", "cough", "sore_throat", "runny_nose", "fever_measured", "fever_max_c", "fever_method"]

        [[intents.resp_upper.conditional_required]]
        if = "fever_measured == true"
        then = ["fever_max_c"]

        [intents.derm_rash]
        required_slots = ["main_symptoms", "rash_location_primary"]
        symptom_labels = ["ผื่น", "คัน"]
        defining_flag = { slot = "rash", label = "ผื่น" }
        exclusive_slots = ["rash", "rash_location_primary"]
    "#;

    const QUESTIONS: &str = r#"
        [resp_upper]
        duration = "เป็นมากี่วันแล้วคะ"
        fever_measured = "ได้วัดไข้ไหมคะ"

        [derm_rash]
        rash_location_primary = "ผื่นขึ้นที่ไหนคะ"
    "#;

    fn config() -> SlotConfig {
        SlotConfig::new(
            SlotPolicy::from_toml_str(POLICY, "inline").expect("policy"),
            QuestionBook::from_toml_str(QUESTIONS, "inline").expect("questions"),
        )
    }

    fn proposal(value: serde_json::Value) -> ProposedState {
        ProposedState::from_model_json(&value)
    }

    fn turn<'a>(
        previous: &'a ConversationState,
        proposed: &'a ProposedState,
        draft_reply: &'a str,
        user_text: &'a str,
    ) -> TurnInput<'a> {
        TurnInput { previous, proposed, draft_reply, user_text }
    }

    #[test]
    fn two_turn_fever_scenario_reaches_finalization() {
        let config = config();

        let first_proposal = proposal(json!({"intent": "resp_upper", "slots": {}}));
        let first = enforce_turn(
            &config,
            turn(&ConversationState::default(), &first_proposal, "สวัสดีค่ะ", "มีไข้ค่ะ"),
        );

        assert_eq!(first.state.slots.get("main_symptoms"), Some(&SlotValue::list(["ไข้"])));
        assert_eq!(first.decision, TurnDecision::AskSlot { slot: "duration".to_string() });
        assert_eq!(first.reply, "เป็นมากี่วันแล้วคะ");
        assert!(first.state.asked_slots.contains("duration"));
        assert!(!first.state.required_slots_filled);

        let second_proposal = proposal(json!({"intent": "resp_upper", "slots": {"fever_measured": false}}));
        let second = enforce_turn(
            &config,
            turn(&first.state, &second_proposal, "ขอบคุณค่ะ สรุปอาการ", "3 วันค่ะ"),
        );

        assert_eq!(second.state.slots.get("duration"), Some(&SlotValue::text("3 วัน")));
        assert_eq!(second.decision, TurnDecision::PassThrough);
        assert_eq!(second.reply, "ขอบคุณค่ะ สรุปอาการ");
        assert!(second.state.required_slots_filled);
        assert!(second.state.missing_slots.is_empty());
    }

    #[test]
    fn only_one_question_is_asked_per_turn() {
        let config = config();
        let proposed = proposal(json!({"intent": "resp_upper"}));
        let outcome =
            enforce_turn(&config, turn(&ConversationState::default(), &proposed, "draft", "สวัสดี"));

        assert_eq!(outcome.state.missing_slots, vec!["main_symptoms", "duration", "fever_measured"]);
        assert_eq!(outcome.state.asked_slots.len(), 1);
        assert_eq!(outcome.asked_slot(), Some("main_symptoms"));
        assert_eq!(outcome.reply, "ขอข้อมูลเพิ่มเติมเพื่อเก็บรายละเอียดอาการให้ครบค่ะ");
    }

    #[test]
    fn asked_slots_only_grow_while_intent_holds() {
        let config = config();
        let mut state = ConversationState::default();
        let mut previous_asked = state.asked_slots.clone();

        for text in ["ไอ", "ยังไม่แน่ใจ", "ไม่รู้", "ไม่ทราบค่ะ"] {
            let proposed = proposal(json!({"intent": "resp_upper"}));
            let outcome = enforce_turn(&config, turn(&state, &proposed, "draft", text));
            assert!(outcome.state.asked_slots.is_superset(&previous_asked));
            previous_asked = outcome.state.asked_slots.clone();
            state = outcome.state;
        }

        assert!(state.required_slots_filled);
    }

    #[test]
    fn asking_clears_any_summary_payload() {
        let config = config();
        let previous: ConversationState = serde_json::from_value(json!({
            "intent": "resp_upper",
            "soap_ready": true,
            "soap_json": {"S": "old"}
        }))
        .expect("state");
        let proposed = proposal(json!({}));
        let outcome = enforce_turn(&config, turn(&previous, &proposed, "draft", "ไอ"));

        assert_eq!(outcome.asked_slot(), Some("duration"));
        assert!(!outcome.state.soap_ready);
        assert!(outcome.state.soap_json.is_empty());
    }

    #[test]
    fn pivot_to_rash_restarts_collection_for_new_intent() {
        let config = config();
        let previous: ConversationState = serde_json::from_value(json!({
            "intent": "resp_upper",
            "slots": {"main_symptoms": ["ไข้"], "fever": true, "duration": "2 วัน"},
            "asked_slots": ["duration", "fever_measured"]
        }))
        .expect("state");
        let proposed = proposal(json!({"intent": "derm_rash", "slots": {"rash": true}}));
        let outcome = enforce_turn(&config, turn(&previous, &proposed, "draft", "มีผื่นขึ้นด้วย"));

        assert!(outcome.intent_changed);
        assert_eq!(outcome.state.intent, Some(Intent::named("derm_rash")));
        assert_eq!(outcome.state.slots.get("main_symptoms"), Some(&SlotValue::list(["ผื่น"])));
        assert!(!outcome.state.slots.contains_key("fever"));
        assert_eq!(outcome.asked_slot(), Some("rash_location_primary"));
        assert_eq!(outcome.reply, "ผื่นขึ้นที่ไหนคะ");
        assert_eq!(outcome.state.asked_slots.len(), 1);
    }

    #[test]
    fn aliases_apply_before_missing_computation() {
        let config = SlotConfig::new(
            SlotPolicy::from_toml_str(
                "[intents.general]\nrequired_slots = [\"severity_overall\"]\n",
                "inline",
            )
            .expect("policy"),
            QuestionBook::default(),
        );
        let proposed = proposal(json!({"intent": "general", "slots": {"severity": "mild"}}));
        let outcome =
            enforce_turn(&config, turn(&ConversationState::default(), &proposed, "draft", "ok"));

        assert_eq!(outcome.decision, TurnDecision::PassThrough);
        assert_eq!(outcome.state.slots.get("severity_overall"), Some(&SlotValue::text("mild")));
    }
}

use std::sync::Arc;

use aidgent_core::{ConversationState, PolicyBundle, RedFlagReport};

#[derive(Clone, Debug, PartialEq)]
pub enum GuardrailDecision {
    Proceed,
    /// The turn must stop here with the fixed emergency message.
    Emergency { report: RedFlagReport, reply: String, state: ConversationState },
}

impl GuardrailDecision {
    pub fn reason_code(&self) -> &'static str {
        match self {
            Self::Proceed => "proceed",
            Self::Emergency { .. } => "red_flag_emergency",
        }
    }
}

/// Deterministic pre-model check of the user's text against red-flag rules.
#[derive(Clone, Debug)]
pub struct SafetyGuard {
    bundle: Arc<PolicyBundle>,
}

impl SafetyGuard {
    pub fn new(bundle: Arc<PolicyBundle>) -> Self {
        Self { bundle }
    }

    pub fn evaluate(&self, user_text: &str) -> GuardrailDecision {
        match self.bundle.safety.detect(user_text) {
            Some(report) => GuardrailDecision::Emergency {
                reply: self.bundle.safety.strings.emergency_main.clone(),
                state: ConversationState::emergency(report.label.clone()),
                report,
            },
            None => GuardrailDecision::Proceed,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use aidgent_core::{Intent, PolicyBundle, SafetyConfig, SlotConfig, SlotPolicy};
    use aidgent_core::slots::QuestionBook;

    use super::{GuardrailDecision, SafetyGuard};

    fn guard() -> SafetyGuard {
        let safety = SafetyConfig::from_toml_str(
            "[strings]\nemergency_main = \"โทร 1669 ทันที\"\n\n[[rules]]\nkey = \"stroke\"\nlabel = \"อาการหลอดเลือดสมอง\"\npatterns = [\"ปากเบี้ยว\", \"แขนขาอ่อนแรง\"]\n",
            "inline",
        )
        .expect("safety");
        let slots = SlotConfig::new(SlotPolicy::from_toml_str("", "inline").expect("policy"), QuestionBook::default());
        SafetyGuard::new(Arc::new(PolicyBundle::new("SYS", slots, safety)))
    }

    #[test]
    fn red_flag_produces_emergency_state() {
        let decision = guard().evaluate("แม่ปากเบี้ยวพูดไม่ชัด");

        assert_eq!(decision.reason_code(), "red_flag_emergency");
        let GuardrailDecision::Emergency { report, reply, state } = decision else {
            panic!("expected emergency");
        };
        assert_eq!(report.triggers, vec!["ปากเบี้ยว".to_string()]);
        assert_eq!(reply, "โทร 1669 ทันที");
        assert_eq!(state.intent, Some(Intent::emergency()));
        assert!(state.red_flag_detected);
        assert_eq!(state.red_flag_label.as_deref(), Some("อาการหลอดเลือดสมอง"));
        assert!(state.slots.is_empty());
        assert!(!state.soap_ready);
    }

    #[test]
    fn ordinary_text_proceeds() {
        assert_eq!(guard().evaluate("ไอมา 2 วัน"), GuardrailDecision::Proceed);
    }
}

//! Best-effort heuristics that infer slot values from the raw user utterance.
//!
//! Every extractor is a no-op on empty text and never overwrites a filled slot,
//! except the unknown-marker pass which records an explicit "not measured".

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::slots::policy::IntentPolicy;
use crate::slots::value::{is_filled, SlotMap, SlotValue};
use crate::slots::{DURATION, MAIN_SYMPTOMS};

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeywordGroup {
    pub label: String,
    pub keywords: Vec<String>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SymptomFlag {
    pub slot: String,
    pub label: String,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct NumberWord {
    pub word: String,
    pub value: u32,
}

/// Language-specific vocabulary the extractors work from.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Lexicon {
    pub symptom_keywords: Vec<KeywordGroup>,
    pub symptom_flags: Vec<SymptomFlag>,
    pub number_words: Vec<NumberWord>,
    pub duration_units: Vec<String>,
    pub unknown_markers: Vec<String>,
    /// Set to `false` when the user says they could not measure.
    pub unknown_flag_slot: String,
    /// Cleared to null alongside `unknown_flag_slot`.
    pub unknown_cleared_slots: Vec<String>,
    pub fallback_question: String,
}

impl Default for Lexicon {
    fn default() -> Self {
        Self::thai()
    }
}

fn strings(items: &[&str]) -> Vec<String> {
    items.iter().map(|item| (*item).to_string()).collect()
}

impl Lexicon {
    pub fn thai() -> Self {
        let groups: [(&str, &[&str]); 6] = [
            ("ไข้", &["ไข้"]),
            ("ไอ", &["ไอ"]),
            ("เจ็บคอ", &["เจ็บคอ"]),
            ("น้ำมูก", &["น้ำมูก", "น้ำมูกไหล", "คัดจมูก"]),
            ("ผื่น", &["ผื่น", "ลมพิษ", "ตุ่ม", "ตุ่มน้ำ", "ปื้นแดง"]),
            ("คัน", &["คัน"]),
        ];
        let flags = [
            ("fever", "ไข้"),
            ("cough", "ไอ"),
            ("sore_throat", "เจ็บคอ"),
            ("runny_nose", "น้ำมูก"),
            ("rash", "ผื่น"),
        ];
        let numbers = [
            "ศูนย์", "หนึ่ง", "สอง", "สาม", "สี่", "ห้า", "หก", "เจ็ด", "แปด", "เก้า", "สิบ", "สิบเอ็ด",
            "สิบสอง",
        ];

        Self {
            symptom_keywords: groups
                .iter()
                .map(|(label, keywords)| KeywordGroup {
                    label: (*label).to_string(),
                    keywords: strings(keywords),
                })
                .collect(),
            symptom_flags: flags
                .iter()
                .map(|(slot, label)| SymptomFlag {
                    slot: (*slot).to_string(),
                    label: (*label).to_string(),
                })
                .collect(),
            number_words: numbers
                .iter()
                .zip(0u32..)
                .map(|(word, value)| NumberWord { word: (*word).to_string(), value })
                .collect(),
            duration_units: strings(&["วัน", "ชั่วโมง", "ชม.", "ช.ม.", "สัปดาห์", "อาทิตย์", "เดือน"]),
            unknown_markers: strings(&["ไม่ทราบ", "ไม่ได้วัด", "ไม่มีเทอร์โมมิเตอร์", "ไม่มีที่วัดไข้"]),
            unknown_flag_slot: "fever_measured".to_string(),
            unknown_cleared_slots: strings(&["fever_max_c", "fever_method"]),
            fallback_question: "ขอข้อมูลเพิ่มเติมเพื่อเก็บรายละเอียดอาการให้ครบค่ะ".to_string(),
        }
    }

    /// Replaces spelled-out numbers with digits, longest words first so that
    /// compounds win over their parts.
    pub fn normalize_numbers(&self, text: &str) -> String {
        let mut words: Vec<&NumberWord> = self.number_words.iter().collect();
        words.sort_by_key(|word| std::cmp::Reverse(word.word.chars().count()));

        let mut normalized = text.to_string();
        for word in words {
            if !word.word.is_empty() {
                normalized = normalized.replace(&word.word, &word.value.to_string());
            }
        }
        normalized
    }

    /// `<number> <unit>` over the configured units, longest unit first.
    /// `None` when no usable unit is configured.
    pub fn duration_pattern(&self) -> Option<Regex> {
        let mut units: Vec<&str> = self
            .duration_units
            .iter()
            .map(|unit| unit.trim())
            .filter(|unit| !unit.is_empty())
            .collect();
        if units.is_empty() {
            return None;
        }
        units.sort_by_key(|unit| std::cmp::Reverse(unit.chars().count()));

        let alternation =
            units.iter().map(|unit| regex::escape(unit)).collect::<Vec<_>>().join("|");
        Regex::new(&format!(r"(\d+(?:\.\d+)?)\s*({alternation})")).ok()
    }
}

/// Sets `main_symptoms` from keyword matches when it is not filled yet.
pub fn fill_main_symptoms_from_text(lexicon: &Lexicon, text: &str, slots: &mut SlotMap) {
    if is_filled(slots.get(MAIN_SYMPTOMS)) {
        return;
    }

    let text = text.trim();
    if text.is_empty() {
        return;
    }

    let mut found: Vec<String> = Vec::new();
    for group in &lexicon.symptom_keywords {
        let matched = group.keywords.iter().any(|keyword| text.contains(keyword.as_str()));
        if matched && !found.contains(&group.label) {
            found.push(group.label.clone());
        }
    }

    if !found.is_empty() {
        slots.insert(MAIN_SYMPTOMS.to_string(), SlotValue::List(found));
    }
}

/// Adds the label of every boolean symptom flag that is `true`.
pub fn fold_boolean_symptoms(lexicon: &Lexicon, slots: &mut SlotMap) {
    let mut labels = slots.get(MAIN_SYMPTOMS).map(SlotValue::labels).unwrap_or_default();

    for flag in &lexicon.symptom_flags {
        let raised = slots.get(&flag.slot).is_some_and(SlotValue::is_true);
        if raised && !labels.contains(&flag.label) {
            labels.push(flag.label.clone());
        }
    }

    if !labels.is_empty() {
        slots.insert(MAIN_SYMPTOMS.to_string(), SlotValue::List(labels));
    }
}

/// Narrows `main_symptoms` to the intent's symptom domain.
pub fn refine_symptoms_for_intent(intent: Option<&IntentPolicy>, slots: &mut SlotMap) {
    let Some(intent) = intent else {
        return;
    };

    let defining_label = intent
        .defining_flag
        .as_ref()
        .filter(|flag| slots.get(&flag.slot).is_some_and(SlotValue::is_true))
        .map(|flag| flag.label.clone());

    let labels = slots.get(MAIN_SYMPTOMS).map(SlotValue::labels).unwrap_or_default();
    if labels.is_empty() {
        if let Some(label) = defining_label {
            slots.insert(MAIN_SYMPTOMS.to_string(), SlotValue::List(vec![label]));
        }
        return;
    }

    if intent.symptom_labels.is_none() && defining_label.is_none() {
        return;
    }

    let mut refined: Vec<String> = match &intent.symptom_labels {
        Some(domain) => labels.into_iter().filter(|label| domain.contains(label)).collect(),
        None => labels,
    };
    if let Some(label) = defining_label {
        if !refined.contains(&label) {
            refined.push(label);
        }
    }

    slots.insert(MAIN_SYMPTOMS.to_string(), SlotValue::List(refined));
}

/// Fills `duration` with the first `<number> <unit>` in the text, verbatim.
pub fn fill_duration_from_text(lexicon: &Lexicon, text: &str, slots: &mut SlotMap) {
    if is_filled(slots.get(DURATION)) {
        return;
    }

    let text = text.trim();
    if text.is_empty() {
        return;
    }

    let Some(pattern) = lexicon.duration_pattern() else {
        return;
    };
    let normalized = lexicon.normalize_numbers(text);
    if let Some(captures) = pattern.captures(&normalized) {
        let duration = format!("{} {}", &captures[1], &captures[2]);
        slots.insert(DURATION.to_string(), SlotValue::Text(duration));
    }
}

/// Records an explicit "not measured" when the user says they do not know.
pub fn normalize_unknowns(lexicon: &Lexicon, text: &str, slots: &mut SlotMap) {
    let text = text.to_lowercase();
    if text.trim().is_empty() {
        return;
    }

    let declined = lexicon
        .unknown_markers
        .iter()
        .any(|marker| !marker.is_empty() && text.contains(&marker.to_lowercase()));
    if !declined {
        return;
    }

    slots.insert(lexicon.unknown_flag_slot.clone(), SlotValue::Bool(false));
    for slot in &lexicon.unknown_cleared_slots {
        slots.insert(slot.clone(), SlotValue::Null);
    }
}

/// Runs every extractor in dependency order: symptoms, boolean folding,
/// duration, unknown markers, then intent refinement.
pub fn run_extractors(
    lexicon: &Lexicon,
    intent: Option<&IntentPolicy>,
    text: &str,
    slots: &mut SlotMap,
) {
    fill_main_symptoms_from_text(lexicon, text, slots);
    fold_boolean_symptoms(lexicon, slots);
    fill_duration_from_text(lexicon, text, slots);
    normalize_unknowns(lexicon, text, slots);
    refine_symptoms_for_intent(intent, slots);
}

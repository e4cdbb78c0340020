//! Prompt assembly for the regular turn and the finalize pass.

use serde::Serialize;

use crate::domain::message::HistoryLine;
use crate::retrieval::Snippet;
use crate::slots::SlotMap;

/// Number of history lines shown to the model on a regular turn.
pub const HISTORY_WINDOW: usize = 4;

const SLOT_REMINDER: &[&str] = &[
    "นโยบาย Slot-complete (ย้ำสั้น ๆ):",
    "- ถ้าผู้ใช้ให้ข้อมูลบางช่องแล้ว ให้ยืนยันและข้าม",
    "- เก็บ Required slots ให้ครบก่อนให้คำแนะนำ",
    "- ครบแล้วให้คำแนะนำทั่วไปที่สอดคล้องกับ CITED_SNIPPETS และแนบ [STATE_JSON]",
];

const FINALIZE_INSTRUCTIONS: &str = "
[STRICT MODE FINALIZE]
- ขณะนี้ข้อมูลครบทุกช่องแล้ว ห้ามถามคำถามเพิ่ม
- ให้สรุปผู้ใช้แบบสั้น/ชัดเจนเป็นภาษาไทย และให้คำแนะนำทั่วไปอิง CITED_SNIPPETS เท่านั้น
- ต้องส่ง [STATE_JSON] โดยตั้ง soap_ready=true และกรอก soap_json ให้ครบ (S/O/A/P)
- ห้ามสร้างข้อเท็จจริงเกินเอกสารอ้างอิง
";

const FINALIZE_REQUEST: &str =
    "โปรดสรุปและให้คำแนะนำทั่วไปที่ปลอดภัย (แนบ footer ความปลอดภัย) พร้อม SOAP";

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct PromptPair {
    pub system: String,
    pub user: String,
}

/// `[CITED_SNIPPETS]` block, or an empty string when there is nothing to cite.
pub fn cited_block(snippets: &[Snippet]) -> String {
    if snippets.is_empty() {
        return String::new();
    }

    let entries: Vec<String> = snippets
        .iter()
        .map(|snippet| {
            format!(
                "- {}:{} (v{})\n  [id: {}] {}",
                snippet.doc_id, snippet.title, snippet.version, snippet.snippet_id, snippet.text
            )
        })
        .collect();
    format!("[CITED_SNIPPETS]\n{}\n[END_CITED_SNIPPETS]", entries.join("\n"))
}

pub fn build_turn_prompt(
    system_prompt: &str,
    history: &[HistoryLine],
    user_text: &str,
    snippets: &[Snippet],
) -> PromptPair {
    let system = format!("{system_prompt}\n\n{}\n", SLOT_REMINDER.join("\n"));

    let window_start = history.len().saturating_sub(HISTORY_WINDOW);
    let mut user = String::new();
    for line in &history[window_start..] {
        user.push_str(line.role.prompt_tag());
        user.push(' ');
        user.push_str(&line.text);
        user.push('\n');
    }
    user.push_str("[USER] ");
    user.push_str(user_text);
    user.push_str("\n\n");
    user.push_str(&cited_block(snippets));

    PromptPair { system, user }
}

pub fn build_finalize_prompt(
    system_prompt: &str,
    slots: &SlotMap,
    snippets: &[Snippet],
) -> PromptPair {
    let system = format!("{system_prompt}{FINALIZE_INSTRUCTIONS}");
    let slots_json = serde_json::to_string(slots).unwrap_or_else(|_| "{}".to_string());
    let user = format!(
        "[SLOTS_JSON]\n{slots_json}\n[END_SLOTS_JSON]\n\n{}\n{FINALIZE_REQUEST}",
        cited_block(snippets)
    );

    PromptPair { system, user }
}

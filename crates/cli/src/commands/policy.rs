use std::path::PathBuf;

use aidgent_core::bundle::PolicyBundle;
use aidgent_core::config::{AppConfig, LoadOptions};
use serde_json::json;

use crate::commands::CommandResult;

/// Loads the clinical policy bundle and reports what it contains, including
/// findings that load but will never take effect.
pub fn run(dir: Option<PathBuf>) -> CommandResult {
    let mut policy = match AppConfig::load(LoadOptions::default()) {
        Ok(config) => config.policy,
        // An explicit directory is enough to validate policy files alone.
        Err(_) if dir.is_some() => AppConfig::default().policy,
        Err(error) => {
            return CommandResult::failure(
                "policy",
                "config_validation",
                format!("configuration issue: {error}"),
                2,
            );
        }
    };
    if let Some(dir) = dir {
        policy.dir = dir;
    }

    let bundle = match PolicyBundle::load(&policy) {
        Ok(bundle) => bundle,
        Err(error) => {
            return CommandResult::failure("policy", "policy_validation", error.to_string(), 2);
        }
    };

    let report = bundle.slots.report();
    let intents: Vec<&str> = bundle.slots.policy.intent_names().collect();
    let intent_count = intents.len();
    let details = json!({
        "policy_dir": policy.dir.display().to_string(),
        "intents": intents,
        "red_flag_rules": bundle.safety.red_flags.len(),
        "unparseable_predicates": report
            .unparseable_predicates
            .iter()
            .map(|finding| json!({
                "intent": finding.intent,
                "expression": finding.expression,
                "reason": finding.reason,
            }))
            .collect::<Vec<_>>(),
        "unknown_question_targets": report
            .unknown_question_targets
            .iter()
            .map(|(intent, slot)| json!({ "intent": intent, "slot": slot }))
            .collect::<Vec<_>>(),
    });

    let message = if report.is_clean() {
        format!("policy bundle valid: {intent_count} intent(s)")
    } else {
        format!("policy bundle loaded with findings: {intent_count} intent(s)")
    };

    CommandResult::success_with_details("policy", message, Some(details))
}

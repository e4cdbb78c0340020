use std::fs;
use std::sync::Arc;

use tracing::info;

use crate::config::PolicyConfig;
use crate::safety::SafetyConfig;
use crate::slots::policy::{PolicyError, SlotConfig};

/// Everything clinical the agent needs for a turn, loaded once at startup.
#[derive(Clone, Debug)]
pub struct PolicyBundle {
    pub system_prompt: String,
    pub slots: SlotConfig,
    pub safety: SafetyConfig,
}

impl PolicyBundle {
    pub fn new(system_prompt: impl Into<String>, slots: SlotConfig, safety: SafetyConfig) -> Self {
        Self { system_prompt: system_prompt.into(), slots, safety }
    }

    pub fn load(config: &PolicyConfig) -> Result<Self, PolicyError> {
        let prompt_path = config.system_prompt_path();
        let system_prompt = fs::read_to_string(&prompt_path)
            .map_err(|source| PolicyError::ReadFile { path: prompt_path.clone(), source })?;
        if system_prompt.trim().is_empty() {
            return Err(PolicyError::Validation(format!(
                "system prompt `{}` is empty",
                prompt_path.display()
            )));
        }

        let slots = SlotConfig::load(&config.slot_policy_path(), &config.questions_path())?;
        let safety = SafetyConfig::load(&config.safety_path())?;

        info!(
            event_name = "policy.bundle.loaded",
            policy_dir = %config.dir.display(),
            intents = slots.policy.intents.len(),
            red_flag_rules = safety.red_flags.len(),
            "loaded clinical policy bundle"
        );

        Ok(Self { system_prompt, slots, safety })
    }

    pub fn shared(self) -> Arc<Self> {
        Arc::new(self)
    }
}

#[cfg(test)]
mod tests {
    use std::fs;
    use std::path::PathBuf;

    use tempfile::TempDir;

    use super::PolicyBundle;
    use crate::config::PolicyConfig;
    use crate::slots::policy::PolicyError;

    fn policy_config(dir: PathBuf) -> PolicyConfig {
        PolicyConfig {
            dir,
            system_prompt_file: "system_prompt_th.txt".to_string(),
            slot_policy_file: "slot_policy.toml".to_string(),
            questions_file: "slot_questions_th.toml".to_string(),
            safety_file: "safety_th.toml".to_string(),
        }
    }

    fn write_bundle(dir: &TempDir) {
        fs::write(dir.path().join("system_prompt_th.txt"), "คุณคือผู้ช่วยคัดกรอง").expect("prompt");
        fs::write(
            dir.path().join("slot_policy.toml"),
            "[intents.resp_upper]\nrequired_slots = [\"main_symptoms\", \"duration\"]\n",
        )
        .expect("policy");
        fs::write(
            dir.path().join("slot_questions_th.toml"),
            "[resp_upper]\nduration = \"กี่วันแล้วคะ\"\n",
        )
        .expect("questions");
        fs::write(
            dir.path().join("safety_th.toml"),
            "[strings]\nemergency_main = \"โทร 1669\"\n\n[[rules]]\nkey = \"chest\"\nlabel = \"เจ็บหน้าอก\"\npatterns = [\"เจ็บหน้าอก\"]\n",
        )
        .expect("safety");
    }

    #[test]
    fn loads_all_four_files_from_policy_dir() {
        let dir = TempDir::new().expect("tempdir");
        write_bundle(&dir);

        let bundle = PolicyBundle::load(&policy_config(dir.path().to_path_buf())).expect("bundle");

        assert_eq!(bundle.system_prompt, "คุณคือผู้ช่วยคัดกรอง");
        assert!(bundle.slots.policy.intents.contains_key("resp_upper"));
        assert_eq!(bundle.safety.red_flags.len(), 1);
        assert_eq!(bundle.safety.strings.emergency_main, "โทร 1669");
    }

    #[test]
    fn missing_file_reports_its_path() {
        let dir = TempDir::new().expect("tempdir");
        write_bundle(&dir);
        fs::remove_file(dir.path().join("safety_th.toml")).expect("remove");

        let error =
            PolicyBundle::load(&policy_config(dir.path().to_path_buf())).expect_err("missing");
        assert!(matches!(
            error,
            PolicyError::ReadFile { ref path, .. } if path.ends_with("safety_th.toml")
        ));
    }

    #[test]
    fn shipped_policy_directory_loads_cleanly() {
        let dir = PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("../../config");

        let bundle = PolicyBundle::load(&policy_config(dir)).expect("shipped bundle");

        assert!(bundle.slots.policy.intents.contains_key("resp_upper"));
        assert!(bundle.slots.policy.intents.contains_key("derm_rash"));
        assert!(bundle.slots.report().is_clean(), "{:?}", bundle.slots.report());
        assert!(bundle.safety.red_flags.detect("แน่นหน้าอกมากค่ะ").is_some());
        let report = bundle.safety.red_flags.detect("หายใจไม่ออกมากค่ะ").expect("breathing");
        assert_eq!(report.key, "breathing");
        assert!(bundle.safety.red_flags.detect("ไอมีเสมหะ 3 วัน").is_none());
    }
}

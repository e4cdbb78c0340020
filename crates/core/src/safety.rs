//! Deterministic red-flag detection.
//!
//! Rules are plain data loaded from TOML and evaluated in file order. Every
//! pattern is a case-insensitive regular expression compiled once at load. A
//! rule fires on the first of its patterns found in the user text or on an
//! `all_of` group whose every term matches.

use std::fs;
use std::path::Path;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::slots::policy::PolicyError;

#[derive(Clone, Debug)]
struct Pattern {
    source: String,
    regex: Regex,
}

impl Pattern {
    fn compile(source: &str) -> Result<Self, regex::Error> {
        let regex = Regex::new(&format!("(?i){source}"))?;
        Ok(Self { source: source.to_string(), regex })
    }

    fn is_match(&self, text: &str) -> bool {
        self.regex.is_match(text)
    }
}

#[derive(Deserialize)]
struct RedFlagRuleSpec {
    key: String,
    label: String,
    #[serde(default)]
    patterns: Vec<String>,
    #[serde(default)]
    all_of: Vec<Vec<String>>,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(try_from = "RedFlagRuleSpec")]
pub struct RedFlagRule {
    pub key: String,
    pub label: String,
    patterns: Vec<Pattern>,
    all_of: Vec<Vec<Pattern>>,
}

impl TryFrom<RedFlagRuleSpec> for RedFlagRule {
    type Error = String;

    fn try_from(spec: RedFlagRuleSpec) -> Result<Self, Self::Error> {
        let compile = |source: &String| {
            Pattern::compile(source).map_err(|error| {
                format!("red-flag rule `{}` has an invalid pattern `{source}`: {error}", spec.key)
            })
        };

        // Blank patterns would match every message.
        let patterns = spec
            .patterns
            .iter()
            .filter(|source| !source.trim().is_empty())
            .map(compile)
            .collect::<Result<Vec<_>, _>>()?;
        let all_of = spec
            .all_of
            .iter()
            .map(|group| {
                group
                    .iter()
                    .filter(|source| !source.trim().is_empty())
                    .map(compile)
                    .collect::<Result<Vec<_>, _>>()
            })
            .filter(|group| !matches!(group, Ok(terms) if terms.is_empty()))
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Self { key: spec.key, label: spec.label, patterns, all_of })
    }
}

impl RedFlagRule {
    fn has_patterns(&self) -> bool {
        !self.patterns.is_empty() || !self.all_of.is_empty()
    }

    fn first_trigger(&self, text: &str) -> Option<String> {
        if let Some(pattern) = self.patterns.iter().find(|pattern| pattern.is_match(text)) {
            return Some(pattern.source.clone());
        }

        self.all_of
            .iter()
            .find(|group| group.iter().all(|term| term.is_match(text)))
            .map(|group| {
                group.iter().map(|term| term.source.as_str()).collect::<Vec<_>>().join(" + ")
            })
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct RedFlagReport {
    pub key: String,
    pub label: String,
    pub triggers: Vec<String>,
}

#[derive(Clone, Debug, Default, Deserialize)]
pub struct RedFlagRules {
    #[serde(default)]
    pub rules: Vec<RedFlagRule>,
}

impl RedFlagRules {
    /// Returns the first rule that fires, or `None` for blank or benign text.
    pub fn detect(&self, text: &str) -> Option<RedFlagReport> {
        let trimmed = text.trim();
        if trimmed.is_empty() {
            return None;
        }
        self.rules.iter().find_map(|rule| {
            rule.first_trigger(trimmed).map(|trigger| RedFlagReport {
                key: rule.key.clone(),
                label: rule.label.clone(),
                triggers: vec![trigger],
            })
        })
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SafetyStrings {
    pub emergency_main: String,
    #[serde(default)]
    pub footer: String,
}

impl Default for SafetyStrings {
    fn default() -> Self {
        Self {
            emergency_main: "อาการของคุณอาจเป็นภาวะฉุกเฉิน กรุณาโทร 1669 หรือไปห้องฉุกเฉินที่ใกล้ที่สุดทันที"
                .to_string(),
            footer: "ข้อมูลนี้เป็นคำแนะนำทั่วไป ไม่ใช่การวินิจฉัยโรค หากอาการแย่ลงควรพบแพทย์"
                .to_string(),
        }
    }
}

#[derive(Clone, Debug, Default, Deserialize)]
pub struct SafetyConfig {
    #[serde(default)]
    pub strings: SafetyStrings,
    #[serde(default, flatten)]
    pub red_flags: RedFlagRules,
}

impl SafetyConfig {
    pub fn from_toml_str(raw: &str, origin: &str) -> Result<Self, PolicyError> {
        let config: Self = toml::from_str(raw).map_err(|error| PolicyError::Parse {
            origin: origin.to_string(),
            message: error.to_string(),
        })?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: &Path) -> Result<Self, PolicyError> {
        let raw = fs::read_to_string(path)
            .map_err(|source| PolicyError::ReadFile { path: path.to_path_buf(), source })?;
        Self::from_toml_str(&raw, &path.display().to_string())
    }

    pub fn detect(&self, text: &str) -> Option<RedFlagReport> {
        self.red_flags.detect(text)
    }

    fn validate(&self) -> Result<(), PolicyError> {
        if self.strings.emergency_main.trim().is_empty() {
            return Err(PolicyError::Validation(
                "strings.emergency_main must not be empty".to_string(),
            ));
        }

        let mut seen = std::collections::BTreeSet::new();
        for rule in &self.red_flags.rules {
            if rule.key.trim().is_empty() || rule.label.trim().is_empty() {
                return Err(PolicyError::Validation(
                    "every red-flag rule needs a key and a label".to_string(),
                ));
            }
            if !seen.insert(rule.key.as_str()) {
                return Err(PolicyError::Validation(format!(
                    "red-flag rule `{}` is defined more than once",
                    rule.key
                )));
            }
            if !rule.has_patterns() {
                return Err(PolicyError::Validation(format!(
                    "red-flag rule `{}` has no patterns",
                    rule.key
                )));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::SafetyConfig;
    use crate::slots::policy::PolicyError;

    const RULES: &str = r#"
        [strings]
        emergency_main = "โทร 1669 ทันที"
        footer = "ไม่ใช่การวินิจฉัย"

        [[rules]]
        key = "chest_pain"
        label = "เจ็บแน่นหน้าอก"
        patterns = ["เจ็บหน้าอก", "แน่นหน้าอก", "Chest Pain"]

        [[rules]]
        key = "breathing"
        label = "หายใจลำบาก"
        patterns = ["หายใจไม่ออก"]
        all_of = [["หอบ", "ปากเขียว"]]
    "#;

    fn config() -> SafetyConfig {
        SafetyConfig::from_toml_str(RULES, "inline").expect("safety rules")
    }

    #[test]
    fn first_matching_rule_wins_in_file_order() {
        let report = config().detect("แน่นหน้าอกและหายใจไม่ออก").expect("flagged");

        assert_eq!(report.key, "chest_pain");
        assert_eq!(report.label, "เจ็บแน่นหน้าอก");
        assert_eq!(report.triggers, vec!["แน่นหน้าอก".to_string()]);
    }

    #[test]
    fn matching_ignores_case() {
        let report = config().detect("sudden CHEST pain since noon").expect("flagged");
        assert_eq!(report.triggers, vec!["Chest Pain".to_string()]);
    }

    #[test]
    fn all_of_groups_need_every_term() {
        let config = config();

        assert!(config.detect("หอบมาก").is_none());
        let report = config.detect("ลูกหอบ ปากเขียว").expect("flagged");
        assert_eq!(report.key, "breathing");
        assert_eq!(report.triggers, vec!["หอบ + ปากเขียว".to_string()]);
    }

    #[test]
    fn blank_and_benign_text_never_flags() {
        let config = config();

        assert!(config.detect("").is_none());
        assert!(config.detect("   ").is_none());
        assert!(config.detect("ไอเล็กน้อย 2 วัน").is_none());
    }

    #[test]
    fn patterns_are_regular_expressions() {
        let raw = r#"
            [[rules]]
            key = "breathing"
            label = "หายใจลำบาก"
            patterns = ["หายใจ(ไม่ออก|ลำบาก)", "chest\\s*pain"]
        "#;
        let config = SafetyConfig::from_toml_str(raw, "inline").expect("safety rules");

        let report = config.detect("หายใจไม่ออกมากค่ะ").expect("alternation fires");
        assert_eq!(report.triggers, vec!["หายใจ(ไม่ออก|ลำบาก)".to_string()]);

        let report = config.detect("sudden Chest   Pain").expect("whitespace class fires");
        assert_eq!(report.triggers, vec!["chest\\s*pain".to_string()]);

        assert!(config.detect("หายใจได้ปกติ").is_none());
    }

    #[test]
    fn invalid_pattern_is_a_parse_error() {
        let raw = r#"
            [[rules]]
            key = "broken"
            label = "B"
            patterns = ["เจ็บ(หน้าอก"]
        "#;

        let error = SafetyConfig::from_toml_str(raw, "safety_th.toml").expect_err("bad regex");
        assert!(
            matches!(&error, PolicyError::Parse { message, .. } if message.contains("`broken`")),
            "{error}"
        );
    }

    #[test]
    fn blank_patterns_never_match_everything() {
        let raw = r#"
            [[rules]]
            key = "blank"
            label = "B"
            patterns = ["  "]
        "#;

        let error = SafetyConfig::from_toml_str(raw, "inline").expect_err("no usable pattern");
        assert!(matches!(error, PolicyError::Validation(message) if message.contains("no patterns")));
    }

    #[test]
    fn duplicate_rule_keys_are_rejected() {
        let raw = r#"
            [strings]
            emergency_main = "x"

            [[rules]]
            key = "a"
            label = "A"
            patterns = ["p"]

            [[rules]]
            key = "a"
            label = "A again"
            patterns = ["q"]
        "#;

        let error = SafetyConfig::from_toml_str(raw, "inline").expect_err("duplicate key");
        assert!(matches!(error, PolicyError::Validation(message) if message.contains("`a`")));
    }
}

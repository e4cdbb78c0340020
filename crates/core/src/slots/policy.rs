use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Deserializer};
use thiserror::Error;
use tracing::warn;

use crate::domain::state::Intent;
use crate::slots::extract::Lexicon;
use crate::slots::predicate::Predicate;

/// Per-intent slot requirements, loaded once and shared read-only.
#[derive(Clone, Debug, Deserialize)]
pub struct SlotPolicy {
    #[serde(default)]
    pub intents: BTreeMap<String, IntentPolicy>,
    /// Slots that survive an intent change.
    #[serde(default = "default_carry_over_slots")]
    pub carry_over_slots: BTreeSet<String>,
    #[serde(default = "default_aliases")]
    pub aliases: Vec<SlotAlias>,
    #[serde(default = "Lexicon::thai")]
    pub lexicon: Lexicon,
}

#[derive(Clone, Debug, Default, Deserialize)]
pub struct IntentPolicy {
    #[serde(default)]
    pub required_slots: Vec<String>,
    #[serde(default)]
    pub ask_order: Option<Vec<String>>,
    #[serde(default)]
    pub conditional_required: Vec<ConditionalRule>,
    /// Symptom labels relevant to this intent. `None` leaves the symptom
    /// list untouched.
    #[serde(default)]
    pub symptom_labels: Option<Vec<String>>,
    #[serde(default)]
    pub defining_flag: Option<DefiningFlag>,
    /// Slots that only make sense under this intent and are dropped when the
    /// conversation pivots to another one.
    #[serde(default)]
    pub exclusive_slots: BTreeSet<String>,
}

#[derive(Clone, Debug, Deserialize)]
pub struct ConditionalRule {
    #[serde(rename = "if", default = "never", deserialize_with = "deserialize_predicate")]
    pub when: Predicate,
    #[serde(default)]
    pub then: Vec<String>,
}

/// Boolean slot whose truth guarantees a symptom label, even without a
/// keyword match.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
pub struct DefiningFlag {
    pub slot: String,
    pub label: String,
}

#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
pub struct SlotAlias {
    pub from: String,
    pub to: String,
}

/// Question templates keyed by intent, then slot.
#[derive(Clone, Debug, Default, Deserialize)]
pub struct QuestionBook {
    #[serde(default)]
    pub fallback: Option<String>,
    #[serde(flatten)]
    pub by_intent: BTreeMap<String, BTreeMap<String, String>>,
}

/// Everything the enforcement driver needs besides the turn itself.
#[derive(Clone, Debug)]
pub struct SlotConfig {
    pub policy: SlotPolicy,
    pub questions: QuestionBook,
}

#[derive(Debug, Error)]
pub enum PolicyError {
    #[error("could not read policy file `{path}`: {source}")]
    ReadFile { path: PathBuf, source: std::io::Error },
    #[error("could not parse policy file `{origin}`: {message}")]
    Parse { origin: String, message: String },
    #[error("policy validation failed: {0}")]
    Validation(String),
}

/// Non-fatal findings surfaced by `aidgent policy` and logged at load.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PolicyReport {
    pub unparseable_predicates: Vec<UnparseablePredicate>,
    pub unknown_question_targets: Vec<(String, String)>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct UnparseablePredicate {
    pub intent: String,
    pub expression: String,
    pub reason: String,
}

impl PolicyReport {
    pub fn is_clean(&self) -> bool {
        self.unparseable_predicates.is_empty() && self.unknown_question_targets.is_empty()
    }
}

fn never() -> Predicate {
    Predicate::Always { value: false }
}

fn deserialize_predicate<'de, D>(deserializer: D) -> Result<Predicate, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum RawPredicate {
        Expression(String),
        Structured(Predicate),
    }

    Ok(match RawPredicate::deserialize(deserializer)? {
        RawPredicate::Expression(expression) => Predicate::from_expression(&expression),
        RawPredicate::Structured(predicate) => predicate,
    })
}

fn default_carry_over_slots() -> BTreeSet<String> {
    ["risk_factors", "meds_allergies"].into_iter().map(str::to_string).collect()
}

fn default_aliases() -> Vec<SlotAlias> {
    [
        ("severity", "severity_overall"),
        ("symptoms", "co_symptoms"),
        ("medications", "meds_allergies"),
    ]
    .into_iter()
    .map(|(from, to)| SlotAlias { from: from.to_string(), to: to.to_string() })
    .collect()
}

fn read_file(path: &Path) -> Result<String, PolicyError> {
    fs::read_to_string(path)
        .map_err(|source| PolicyError::ReadFile { path: path.to_path_buf(), source })
}

impl Default for SlotPolicy {
    fn default() -> Self {
        Self {
            intents: BTreeMap::new(),
            carry_over_slots: default_carry_over_slots(),
            aliases: default_aliases(),
            lexicon: Lexicon::thai(),
        }
    }
}

impl SlotPolicy {
    pub fn from_toml_str(raw: &str, origin: &str) -> Result<Self, PolicyError> {
        let policy: Self = toml::from_str(raw).map_err(|error| PolicyError::Parse {
            origin: origin.to_string(),
            message: error.to_string(),
        })?;
        policy.validate()?;
        Ok(policy)
    }

    pub fn load(path: &Path) -> Result<Self, PolicyError> {
        Self::from_toml_str(&read_file(path)?, &path.display().to_string())
    }

    pub fn intent(&self, intent: &Intent) -> Option<&IntentPolicy> {
        match intent {
            Intent::Uncertain => None,
            Intent::Named(name) => self.intents.get(name),
        }
    }

    pub fn intent_names(&self) -> impl Iterator<Item = &str> {
        self.intents.keys().map(String::as_str)
    }

    /// Exclusive slots of every intent except `keep`.
    pub fn foreign_exclusive_slots(&self, keep: &Intent) -> BTreeSet<&str> {
        self.intents
            .iter()
            .filter(|(name, _)| name.as_str() != keep.as_str())
            .flat_map(|(_, policy)| policy.exclusive_slots.iter().map(String::as_str))
            .filter(|slot| !self.carry_over_slots.contains(*slot))
            .collect()
    }

    fn validate(&self) -> Result<(), PolicyError> {
        let mut problems = Vec::new();

        for (name, intent) in &self.intents {
            if name == Intent::UNCERTAIN || name == Intent::EMERGENCY {
                problems.push(format!("intent name `{name}` is reserved"));
            }

            let mut seen = BTreeSet::new();
            for slot in &intent.required_slots {
                if !seen.insert(slot.as_str()) {
                    problems.push(format!("intent `{name}` lists required slot `{slot}` twice"));
                }
            }

            if let (Some(flag), Some(labels)) = (&intent.defining_flag, &intent.symptom_labels) {
                if !labels.contains(&flag.label) {
                    problems.push(format!(
                        "intent `{name}` defining flag label `{}` is not one of its symptom_labels",
                        flag.label
                    ));
                }
            }
        }

        for alias in &self.aliases {
            if alias.from == alias.to {
                problems.push(format!("alias `{}` maps onto itself", alias.from));
            }
        }

        if problems.is_empty() {
            Ok(())
        } else {
            Err(PolicyError::Validation(problems.join("; ")))
        }
    }
}

impl IntentPolicy {
    /// Question ordering: `ask_order` when configured, else `required_slots`.
    pub fn ask_order(&self) -> &[String] {
        self.ask_order.as_deref().unwrap_or(&self.required_slots)
    }

    /// Every slot this intent could ever ask about.
    pub fn known_slots(&self) -> BTreeSet<&str> {
        self.required_slots
            .iter()
            .chain(self.ask_order.iter().flatten())
            .chain(self.conditional_required.iter().flat_map(|rule| rule.then.iter()))
            .map(String::as_str)
            .collect()
    }
}

impl QuestionBook {
    pub fn from_toml_str(raw: &str, origin: &str) -> Result<Self, PolicyError> {
        toml::from_str(raw).map_err(|error| PolicyError::Parse {
            origin: origin.to_string(),
            message: error.to_string(),
        })
    }

    pub fn load(path: &Path) -> Result<Self, PolicyError> {
        Self::from_toml_str(&read_file(path)?, &path.display().to_string())
    }

    pub fn question_for(&self, intent: &Intent, slot: &str) -> Option<&str> {
        self.by_intent
            .get(intent.as_str())
            .and_then(|questions| questions.get(slot))
            .map(String::as_str)
            .filter(|question| !question.trim().is_empty())
    }
}

impl SlotConfig {
    pub fn new(policy: SlotPolicy, questions: QuestionBook) -> Self {
        Self { policy, questions }
    }

    pub fn load(policy_path: &Path, questions_path: &Path) -> Result<Self, PolicyError> {
        let config = Self::new(SlotPolicy::load(policy_path)?, QuestionBook::load(questions_path)?);
        config.log_report();
        Ok(config)
    }

    pub fn lexicon(&self) -> &Lexicon {
        &self.policy.lexicon
    }

    /// Templated question for `(intent, slot)`, else the generic prompt.
    pub fn question(&self, intent: &Intent, slot: &str) -> &str {
        self.questions
            .question_for(intent, slot)
            .or(self.questions.fallback.as_deref())
            .unwrap_or(&self.policy.lexicon.fallback_question)
    }

    pub fn report(&self) -> PolicyReport {
        let mut report = PolicyReport::default();

        for (name, intent) in &self.policy.intents {
            for rule in &intent.conditional_required {
                if let Predicate::Unparseable { expression, reason } = &rule.when {
                    report.unparseable_predicates.push(UnparseablePredicate {
                        intent: name.clone(),
                        expression: expression.clone(),
                        reason: reason.clone(),
                    });
                }
            }
        }

        for (intent_name, questions) in &self.questions.by_intent {
            let known = self.policy.intents.get(intent_name).map(IntentPolicy::known_slots);
            for slot in questions.keys() {
                let targeted = known.as_ref().is_some_and(|known| known.contains(slot.as_str()));
                if !targeted {
                    report.unknown_question_targets.push((intent_name.clone(), slot.clone()));
                }
            }
        }

        report
    }

    fn log_report(&self) {
        let report = self.report();
        for finding in &report.unparseable_predicates {
            warn!(
                event_name = "slots.policy.unparseable_predicate",
                intent = %finding.intent,
                expression = %finding.expression,
                reason = %finding.reason,
                "conditional requirement will never apply"
            );
        }
        for (intent, slot) in &report.unknown_question_targets {
            warn!(
                event_name = "slots.policy.unknown_question_target",
                intent = %intent,
                slot = %slot,
                "question template targets a slot the intent never asks"
            );
        }
    }
}

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::{Number, Value};

/// Slot values keyed by slot name.
pub type SlotMap = BTreeMap<String, SlotValue>;

/// A single collected answer.
///
/// Values arrive from the hosted model as arbitrary JSON and are coerced into
/// this closed set at the merge boundary. `Null` is a present-but-empty value:
/// it counts as "key present" for alias resolution while never counting as
/// filled. Shapes the triage flow does not model (objects, mixed arrays) are
/// kept verbatim in `Other` so nothing the model said is lost.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(from = "Value", into = "Value")]
pub enum SlotValue {
    Null,
    Bool(bool),
    Number(Number),
    Text(String),
    List(Vec<String>),
    Other(Value),
}

impl SlotValue {
    pub fn text(value: impl Into<String>) -> Self {
        Self::Text(value.into())
    }

    pub fn list<I, S>(items: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::List(items.into_iter().map(Into::into).collect())
    }

    /// Present and carrying information. Numbers and booleans are always
    /// filled, including `0` and `false`.
    pub fn is_filled(&self) -> bool {
        match self {
            Self::Null => false,
            Self::Bool(_) | Self::Number(_) => true,
            Self::Text(text) => !text.trim().is_empty() && text != "null",
            Self::List(items) => !items.is_empty(),
            Self::Other(Value::Array(items)) => !items.is_empty(),
            Self::Other(Value::Object(map)) => !map.is_empty(),
            Self::Other(Value::Null) => false,
            Self::Other(_) => true,
        }
    }

    /// Whether a newly proposed value may replace a stored one. Any boolean
    /// qualifies so that an explicit "no" overrides "not yet answered".
    pub fn is_meaningful(&self) -> bool {
        matches!(self, Self::Bool(_)) || self.is_filled()
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Bool(flag) => Some(*flag),
            _ => None,
        }
    }

    pub fn is_true(&self) -> bool {
        self.as_bool() == Some(true)
    }

    /// Label view used for symptom lists. A bare non-empty string is treated
    /// as a one-element list.
    pub fn labels(&self) -> Vec<String> {
        match self {
            Self::List(items) => items.clone(),
            Self::Text(text) if self.is_filled() => vec![text.clone()],
            _ => Vec::new(),
        }
    }
}

impl From<Value> for SlotValue {
    fn from(value: Value) -> Self {
        match value {
            Value::Null => Self::Null,
            Value::Bool(flag) => Self::Bool(flag),
            Value::Number(number) => Self::Number(number),
            Value::String(text) => Self::Text(text),
            Value::Array(items) if items.iter().all(Value::is_string) => Self::List(
                items
                    .into_iter()
                    .filter_map(|item| match item {
                        Value::String(text) => Some(text),
                        _ => None,
                    })
                    .collect(),
            ),
            other => Self::Other(other),
        }
    }
}

impl From<SlotValue> for Value {
    fn from(value: SlotValue) -> Self {
        match value {
            SlotValue::Null => Value::Null,
            SlotValue::Bool(flag) => Value::Bool(flag),
            SlotValue::Number(number) => Value::Number(number),
            SlotValue::Text(text) => Value::String(text),
            SlotValue::List(items) => Value::Array(items.into_iter().map(Value::String).collect()),
            SlotValue::Other(other) => other,
        }
    }
}

impl From<bool> for SlotValue {
    fn from(flag: bool) -> Self {
        Self::Bool(flag)
    }
}

impl From<&str> for SlotValue {
    fn from(text: &str) -> Self {
        Self::Text(text.to_string())
    }
}

/// `is_filled` over an optional lookup: absence is never filled.
pub fn is_filled(value: Option<&SlotValue>) -> bool {
    value.is_some_and(SlotValue::is_filled)
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::{is_filled, SlotValue};

    #[test]
    fn empty_shapes_are_not_filled() {
        assert!(!is_filled(None));
        assert!(!SlotValue::Null.is_filled());
        assert!(!SlotValue::text("   ").is_filled());
        assert!(!SlotValue::text("null").is_filled());
        assert!(!SlotValue::List(Vec::new()).is_filled());
        assert!(!SlotValue::from(json!({})).is_filled());
    }

    #[test]
    fn zero_and_false_are_filled_answers() {
        assert!(SlotValue::from(json!(0)).is_filled());
        assert!(SlotValue::Bool(false).is_filled());
        assert!(SlotValue::text("3 วัน").is_filled());
        assert!(SlotValue::list(["ไข้"]).is_filled());
    }

    #[test]
    fn booleans_are_always_meaningful() {
        assert!(SlotValue::Bool(false).is_meaningful());
        assert!(!SlotValue::Null.is_meaningful());
        assert!(!SlotValue::text("").is_meaningful());
    }

    #[test]
    fn json_coercion_keeps_unmodelled_shapes() {
        assert_eq!(SlotValue::from(json!(["a", "b"])), SlotValue::list(["a", "b"]));
        assert!(matches!(SlotValue::from(json!(["a", 1])), SlotValue::Other(_)));
        assert!(matches!(SlotValue::from(json!({"site": "arm"})), SlotValue::Other(_)));

        let encoded = serde_json::to_value(SlotValue::from(json!({"site": "arm"})))
            .expect("slot value serializes");
        assert_eq!(encoded, json!({"site": "arm"}));
    }

    #[test]
    fn bare_text_reads_as_single_label() {
        assert_eq!(SlotValue::text("ไข้").labels(), vec!["ไข้".to_string()]);
        assert!(SlotValue::Bool(true).labels().is_empty());
    }
}

use crate::slots::policy::IntentPolicy;
use crate::slots::value::{is_filled, SlotMap};

/// Ordered list of required slots that are still unfilled.
///
/// Required slots come first, then slots added by conditional rules whose
/// predicate holds. The result is stably sorted by position in the intent's
/// ask order; slots outside that order keep their encounter order at the end.
/// An intent without a policy has nothing missing.
pub fn compute_missing(intent: Option<&IntentPolicy>, slots: &SlotMap) -> Vec<String> {
    let Some(intent) = intent else {
        return Vec::new();
    };

    let mut missing: Vec<String> = intent
        .required_slots
        .iter()
        .filter(|slot| !is_filled(slots.get(slot.as_str())))
        .cloned()
        .collect();

    for rule in &intent.conditional_required {
        if !rule.when.holds(slots) {
            continue;
        }
        for slot in &rule.then {
            if !is_filled(slots.get(slot)) && !missing.contains(slot) {
                missing.push(slot.clone());
            }
        }
    }

    let order = intent.ask_order();
    missing.sort_by_key(|slot| {
        order.iter().position(|ordered| ordered == slot).unwrap_or(usize::MAX)
    });
    missing
}

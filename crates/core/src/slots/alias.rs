use crate::slots::policy::SlotAlias;
use crate::slots::value::SlotMap;

/// Copies alternate field names onto their canonical slot. A canonical key
/// that is already present, even as null, is never overwritten.
pub fn apply_aliases(aliases: &[SlotAlias], slots: &mut SlotMap) {
    for alias in aliases {
        if slots.contains_key(&alias.to) {
            continue;
        }
        if let Some(value) = slots.get(&alias.from).cloned() {
            slots.insert(alias.to.clone(), value);
        }
    }
}

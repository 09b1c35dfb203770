//! Merge a partial update into locally held state.
//!
//! Conflict rule: the patch wins; nested objects are merged key by key; arrays
//! and scalars are replaced wholesale. A `null` in the patch stores `null`.

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;

pub fn merge_patch(target: &mut Value, patch: &Value) {
    match (target, patch) {
        (Value::Object(target), Value::Object(patch)) => {
            for (key, incoming) in patch {
                let nested = incoming.is_object() && target.get(key).is_some_and(Value::is_object);
                match target.get_mut(key) {
                    Some(existing) if nested => merge_patch(existing, incoming),
                    _ => {
                        target.insert(key.clone(), incoming.clone());
                    }
                }
            }
        }
        (target, patch) => *target = patch.clone(),
    }
}

/// Typed variant: round-trips `local` through JSON, merges, and reads it back.
pub fn merged<T: Serialize + DeserializeOwned>(local: &T, patch: &Value) -> Result<T, serde_json::Error> {
    let mut value = serde_json::to_value(local)?;
    merge_patch(&mut value, patch);
    serde_json::from_value(value)
}

//! Small data recipes.

use serde_json::{Map, Value};

/// Merge `updater` into a copy of `receiver`, recursing into nested objects.
///
/// Keys present only in `receiver` are kept. When both sides hold an object
/// under the same key the objects are merged; any other value from
/// `updater` (lists included) replaces the receiver's value. A non-object
/// `receiver` or `updater` is treated as an empty object on the receiver
/// side and wins wholesale on the updater side.
///
/// ```
/// use serde_json::json;
/// use bi_utils::recipes::dict_merge;
///
/// let merged = dict_merge(&json!({"a": {"b": 1}}), &json!({"a": {"c": 2}}));
/// assert_eq!(merged, json!({"a": {"b": 1, "c": 2}}));
/// ```
#[must_use]
pub fn dict_merge(receiver: &Value, updater: &Value) -> Value {
    let Value::Object(updates) = updater else {
        return updater.clone();
    };
    let mut merged = match receiver {
        Value::Object(map) => map.clone(),
        _ => Map::new(),
    };
    for (key, update) in updates {
        let value = match (merged.get(key), update) {
            (Some(current @ Value::Object(_)), Value::Object(_)) => dict_merge(current, update),
            _ => update.clone(),
        };
        merged.insert(key.clone(), value);
    }
    Value::Object(merged)
}

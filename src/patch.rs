//! Status patch helper
//!
//! Builds a JSON merge patch from the live status of a resource and the
//! status the reconciler wants. Only top-level fields that differ are sent.
//! A merge patch replaces arrays wholesale, so `conditions` is rebuilt from
//! the live list: the reconciler's own condition types are replaced, every
//! other type is carried over untouched. The patch is pinned to the
//! resourceVersion that was read, so a writer slipping in between makes the
//! API server reject it instead of losing that write.

use crate::error::Result;
use serde::Serialize;
use serde_json::{json, Map, Value};

const CONDITIONS: &str = "conditions";

/// Merge patch for `status`, or `None` when nothing changed.
///
/// `owned` lists the condition types this reconciler writes. Conditions of
/// any other type are kept as found in `live`.
pub fn status_patch<S: Serialize>(
    live: Option<&Value>,
    resource_version: Option<&str>,
    desired: &S,
    owned: &[&str],
) -> Result<Option<Value>> {
    let mut desired = serde_json::to_value(desired)?;
    let live = live.cloned().unwrap_or(Value::Null);

    if let Some(conditions) = desired.get_mut(CONDITIONS) {
        *conditions = merge_conditions(live.get(CONDITIONS), conditions, owned);
    }

    let diff = match (&live, &desired) {
        (Value::Object(old), Value::Object(new)) => {
            let mut diff = Map::new();
            for (key, value) in new {
                if old.get(key) != Some(value) {
                    diff.insert(key.clone(), value.clone());
                }
            }
            for key in old.keys() {
                if !new.contains_key(key) {
                    diff.insert(key.clone(), Value::Null);
                }
            }
            Value::Object(diff)
        }
        _ => desired,
    };

    if matches!(&diff, Value::Object(map) if map.is_empty()) {
        return Ok(None);
    }
    Ok(Some(match resource_version {
        Some(rv) => json!({ "metadata": { "resourceVersion": rv }, "status": diff }),
        None => json!({ "status": diff }),
    }))
}

/// Live conditions with the owned types taken from `desired`, in live order.
fn merge_conditions(live: Option<&Value>, desired: &Value, owned: &[&str]) -> Value {
    let type_of = |c: &Value| c.get("type").and_then(Value::as_str).map(str::to_string);
    let is_owned = |c: &Value| type_of(c).is_some_and(|t| owned.contains(&t.as_str()));
    let desired: Vec<&Value> = desired
        .as_array()
        .map(|d| d.iter().filter(|c| is_owned(c)).collect())
        .unwrap_or_default();
    let find_desired = |t: &Option<String>| desired.iter().find(|c| type_of(c) == *t).copied();

    let mut merged = Vec::new();
    for condition in live.and_then(Value::as_array).into_iter().flatten() {
        if !is_owned(condition) {
            merged.push(condition.clone());
        } else if let Some(replacement) = find_desired(&type_of(condition)) {
            merged.push(replacement.clone());
        }
    }
    for condition in &desired {
        let t = type_of(condition);
        if !merged.iter().any(|c| type_of(c) == t) {
            merged.push((*condition).clone());
        }
    }
    Value::Array(merged)
}

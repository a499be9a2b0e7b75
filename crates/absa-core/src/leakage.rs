use serde_json::Value;

use crate::memory_contracts::ContractError;

pub const FORBIDDEN_RAW_KEYS: [&str; 7] = [
    "raw_text",
    "raw_text_hash",
    "gold",
    "gold_label",
    "gold_polarity",
    "cot",
    "chain_of_thought",
];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LeakageHit {
    pub key: String,
    pub path: String,
}

// Walk a JSON tree depth-first and report the first forbidden key, with the
// path of the object that holds it. Arrays are descended at any depth.
pub fn scan_for_forbidden_keys(value: &Value, forbidden: &[&str]) -> Option<LeakageHit> {
    walk(value, forbidden, "", false)
}

pub fn scan_for_nonempty_forbidden_keys(value: &Value, forbidden: &[&str]) -> Option<LeakageHit> {
    walk(value, forbidden, "", true)
}

pub fn ensure_no_leakage(value: &Value, forbidden: &[&str]) -> Result<(), ContractError> {
    match scan_for_forbidden_keys(value, forbidden) {
        Some(hit) => Err(ContractError::Leakage {
            key: hit.key,
            path: hit.path,
        }),
        None => Ok(()),
    }
}

fn walk(value: &Value, forbidden: &[&str], path: &str, skip_empty: bool) -> Option<LeakageHit> {
    match value {
        Value::Object(object) => {
            for (key, child) in object {
                if forbidden.contains(&key.as_str()) && !(skip_empty && is_empty_value(child)) {
                    return Some(LeakageHit {
                        key: key.clone(),
                        path: format!("{path}/{key}"),
                    });
                }
            }
            object.iter().find_map(|(key, child)| {
                walk(child, forbidden, &format!("{path}/{key}"), skip_empty)
            })
        }
        Value::Array(items) => items
            .iter()
            .enumerate()
            .find_map(|(index, item)| walk(item, forbidden, &format!("{path}/{index}"), skip_empty)),
        _ => None,
    }
}

fn is_empty_value(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::String(text) => text.is_empty(),
        Value::Array(items) => items.is_empty(),
        Value::Object(object) => object.is_empty(),
        _ => false,
    }
}

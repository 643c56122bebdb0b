use serde_json::{Map, Value};
use std::collections::BTreeMap;

/// Extract a value at a dotted path (`a.b.0.c`). Array segments are numeric
/// indices. An empty path returns the whole document.
pub fn extract_path<'a>(value: &'a Value, path: &str) -> Option<&'a Value> {
    if path.is_empty() {
        return Some(value);
    }
    let mut current = value;
    for segment in path.split('.') {
        current = match current {
            Value::Object(map) => map.get(segment)?,
            Value::Array(items) => items.get(segment.parse::<usize>().ok()?)?,
            _ => return None,
        };
    }
    Some(current)
}

/// Apply a response mapping: each output field is the extraction of its
/// dotted path, `null` when the path is absent.
pub fn apply_mapping(mapping: &BTreeMap<String, String>, response: &Value) -> Value {
    let mut mapped = Map::new();
    for (field, path) in mapping {
        let value = extract_path(response, path).cloned().unwrap_or(Value::Null);
        mapped.insert(field.clone(), value);
    }
    Value::Object(mapped)
}

/*
    merge.rs - Structural merge helpers

    Array union and object deep-merge used by the merge_values strategy.
    Both are commutative over element membership: merging [a,b] with
    [b,c] gives {a,b,c} regardless of operand order.
*/

use serde_json::{Map, Value};

/// Deduplicated union of two arrays. Elements are keyed and ordered by
/// their canonical JSON encoding, which makes the result independent of
/// operand order.
pub fn union_arrays(left: &[Value], right: &[Value]) -> Vec<Value> {
    let mut keyed: Vec<(String, Value)> = Vec::new();

    for value in left.iter().chain(right.iter()) {
        let key = value.to_string();
        if !keyed.iter().any(|(k, _)| *k == key) {
            keyed.push((key, value.clone()));
        }
    }

    keyed.sort_by(|(a, _), (b, _)| a.cmp(b));
    keyed.into_iter().map(|(_, v)| v).collect()
}

/// Recursive key-by-key merge of two objects. Where both sides hold an
/// object the merge recurses; where both hold arrays they are unioned;
/// any other collision takes the right-hand value.
pub fn deep_merge(left: &Map<String, Value>, right: &Map<String, Value>) -> Map<String, Value> {
    let mut merged = left.clone();

    for (key, right_value) in right {
        match (merged.get(key), right_value) {
            (Some(Value::Object(l)), Value::Object(r)) => {
                let nested = deep_merge(l, r);
                merged.insert(key.clone(), Value::Object(nested));
            }
            (Some(Value::Array(l)), Value::Array(r)) => {
                merged.insert(key.clone(), Value::Array(union_arrays(l, r)));
            }
            _ => {
                merged.insert(key.clone(), right_value.clone());
            }
        }
    }
    merged
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn arr(value: Value) -> Vec<Value> {
        value.as_array().unwrap().clone()
    }

    #[test]
    fn test_union_deduplicates() {
        let merged = union_arrays(&arr(json!(["a", "b"])), &arr(json!(["b", "c"])));
        assert_eq!(merged.len(), 3);
        assert!(merged.contains(&json!("a")));
        assert!(merged.contains(&json!("b")));
        assert!(merged.contains(&json!("c")));
    }

    #[test]
    fn test_union_is_commutative() {
        let ab = arr(json!(["a", "b"]));
        let bc = arr(json!(["b", "c"]));
        assert_eq!(union_arrays(&ab, &bc), union_arrays(&bc, &ab));
    }

    #[test]
    fn test_union_handles_non_string_elements() {
        let merged = union_arrays(&arr(json!([1, {"k": 2}])), &arr(json!([{"k": 2}, 3])));
        assert_eq!(merged.len(), 3);
    }

    #[test]
    fn test_deep_merge_nested_objects() {
        let left = json!({"profile": {"name": "a", "city": "x"}, "age": 1});
        let right = json!({"profile": {"name": "b"}, "active": true});

        let merged = deep_merge(
            left.as_object().unwrap(),
            right.as_object().unwrap(),
        );

        assert_eq!(merged["profile"]["name"], "b");
        assert_eq!(merged["profile"]["city"], "x");
        assert_eq!(merged["age"], 1);
        assert_eq!(merged["active"], true);
    }

    #[test]
    fn test_deep_merge_unions_nested_arrays() {
        let left = json!({"tags": ["a", "b"]});
        let right = json!({"tags": ["b", "c"]});

        let merged = deep_merge(left.as_object().unwrap(), right.as_object().unwrap());
        assert_eq!(merged["tags"].as_array().unwrap().len(), 3);
    }

    #[test]
    fn test_deep_merge_scalar_collision_takes_right() {
        let left = json!({"v": 1});
        let right = json!({"v": 2});
        let merged = deep_merge(left.as_object().unwrap(), right.as_object().unwrap());
        assert_eq!(merged["v"], 2);
    }
}

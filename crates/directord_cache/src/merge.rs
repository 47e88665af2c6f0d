//! Recursive value merge used for argument and environment updates.

use serde_json::Value;

/// Merge `new` into `base`.
///
/// Maps merge key-wise and recurse. Lists concatenate when `extend` is
/// set, otherwise the new list wins. Scalars are always overwritten.
pub fn merge_value(base: &mut Value, new: &Value, extend: bool) {
    match (base, new) {
        (Value::Object(base_map), Value::Object(new_map)) => {
            for (key, new_value) in new_map {
                match base_map.get_mut(key) {
                    Some(existing) => merge_value(existing, new_value, extend),
                    None => {
                        base_map.insert(key.clone(), new_value.clone());
                    }
                }
            }
        }
        (Value::Array(base_list), Value::Array(new_list)) if extend => {
            base_list.extend(new_list.iter().cloned());
        }
        (base_slot, new_value) => {
            *base_slot = new_value.clone();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_scalars_overwrite() {
        let mut base = json!({"a": 1, "b": "keep"});
        merge_value(&mut base, &json!({"a": 2}), false);
        assert_eq!(base, json!({"a": 2, "b": "keep"}));
    }

    #[test]
    fn test_nested_maps_merge() {
        let mut base = json!({"outer": {"x": 1, "y": 2}});
        merge_value(&mut base, &json!({"outer": {"y": 3, "z": 4}}), false);
        assert_eq!(base, json!({"outer": {"x": 1, "y": 3, "z": 4}}));
    }

    #[test]
    fn test_lists_concatenate_with_extend() {
        let mut base = json!({"items": [1, 2]});
        merge_value(&mut base, &json!({"items": [3]}), true);
        assert_eq!(base, json!({"items": [1, 2, 3]}));
    }

    #[test]
    fn test_lists_replace_without_extend() {
        let mut base = json!({"items": [1, 2]});
        merge_value(&mut base, &json!({"items": [3]}), false);
        assert_eq!(base, json!({"items": [3]}));
    }
}

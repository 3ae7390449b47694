//! Two-way strategic merge patches over plain JSON values.
//!
//! Objects diff key by key, with removed keys sent as `null`. Lists are atomic (replaced wholesale
//! on any change) unless the schema names a merge key for their path, in which case they are diffed
//! as a map keyed by that field:
//!
//! * changed or added entries carry their own diff plus the merge key
//! * removed entries are sent as `{<key>: <value>, "$patch": "delete"}`
//! * `$setElementOrder/<field>` lists every key of the modified list in order, so the receiver
//!   reproduces the modified ordering exactly
//!
//! Paths are JSON pointers without list indices, e.g. `/status/conditions`. Fields inside keyed
//! list entries continue from the list path (`/status/conditions/reason`).

use serde_json::{Map, Value};
use std::collections::{HashMap, HashSet};
use thiserror::Error;

const PATCH_DIRECTIVE: &str = "$patch";
const DELETE_DIRECTIVE: &str = "delete";
const SET_ELEMENT_ORDER_PREFIX: &str = "$setElementOrder/";

#[derive(Debug, Error, PartialEq)]
pub enum MergeError {
    #[error("{0} must be an object")]
    NotAnObject(String),
    #[error("entry of {path} has no merge key {key:?}")]
    MissingMergeKey { path: String, key: String },
    #[error("{path} has more than one entry with {key} {value}")]
    DuplicateMergeKey { path: String, key: String, value: String },
    #[error("unsupported patch directive {directive:?} at {path}")]
    UnknownDirective { path: String, directive: String },
}

/// Which lists merge by a discriminator field instead of being replaced wholesale
#[derive(Clone, Debug, Default)]
pub struct MergeSchema {
    merge_keys: HashMap<String, String>,
}

impl MergeSchema {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_merge_key(mut self, path: &str, key: &str) -> Self {
        self.merge_keys.insert(path.to_string(), key.to_string());
        self
    }

    pub fn merge_key(&self, path: &str) -> Option<&str> {
        self.merge_keys.get(path).map(String::as_str)
    }
}

/// Computes the patch that turns `original` into `modified`. An empty object means they are
/// equivalent.
pub fn create_two_way_merge_patch(original: &Value, modified: &Value, schema: &MergeSchema) -> Result<Value, MergeError> {
    let original = original.as_object().ok_or_else(|| MergeError::NotAnObject("original".to_string()))?;
    let modified = modified.as_object().ok_or_else(|| MergeError::NotAnObject("modified".to_string()))?;

    Ok(Value::Object(diff_maps(original, modified, "", schema)?))
}

fn diff_maps(
    original: &Map<String, Value>,
    modified: &Map<String, Value>,
    path: &str,
    schema: &MergeSchema,
) -> Result<Map<String, Value>, MergeError> {
    let mut patch = Map::new();

    for key in original.keys() {
        if !modified.contains_key(key) {
            patch.insert(key.clone(), Value::Null);
        }
    }

    for (key, modified_value) in modified {
        let original_value = match original.get(key) {
            Some(original_value) if original_value == modified_value => continue,
            Some(original_value) => original_value,
            None => {
                patch.insert(key.clone(), modified_value.clone());
                continue;
            }
        };

        let child_path = format!("{path}/{key}");

        match (original_value, modified_value) {
            (Value::Object(original_map), Value::Object(modified_map)) => {
                let child_patch = diff_maps(original_map, modified_map, &child_path, schema)?;
                if !child_patch.is_empty() {
                    patch.insert(key.clone(), Value::Object(child_patch));
                }
            }
            (Value::Array(original_list), Value::Array(modified_list)) => match schema.merge_key(&child_path) {
                Some(merge_key) => {
                    let list_diff = diff_keyed_lists(original_list, modified_list, merge_key, &child_path, schema)?;
                    if let Some((list_patch, element_order)) = list_diff {
                        patch.insert(key.clone(), Value::Array(list_patch));
                        patch.insert(format!("{SET_ELEMENT_ORDER_PREFIX}{key}"), Value::Array(element_order));
                    }
                }
                None => {
                    patch.insert(key.clone(), modified_value.clone());
                }
            },
            _ => {
                patch.insert(key.clone(), modified_value.clone());
            }
        }
    }

    Ok(patch)
}

// Indexes a keyed list by the JSON rendering of each entry's merge key, which is how lists are
// compared internally even though they travel as ordered sequences
fn index_keyed_list<'a>(
    list: &'a [Value],
    merge_key: &str,
    path: &str,
) -> Result<HashMap<String, &'a Map<String, Value>>, MergeError> {
    let mut index = HashMap::with_capacity(list.len());

    for element in list {
        let (key_value, element_map) = keyed_entry(element, merge_key, path)?;
        let rendered = key_value.to_string();

        if index.insert(rendered.clone(), element_map).is_some() {
            return Err(MergeError::DuplicateMergeKey {
                path: path.to_string(),
                key: merge_key.to_string(),
                value: rendered,
            });
        }
    }

    Ok(index)
}

fn keyed_entry<'a>(element: &'a Value, merge_key: &str, path: &str) -> Result<(&'a Value, &'a Map<String, Value>), MergeError> {
    let element_map = element.as_object().ok_or_else(|| MergeError::NotAnObject(format!("entry of {path}")))?;
    let key_value = element_map.get(merge_key).ok_or_else(|| MergeError::MissingMergeKey {
        path: path.to_string(),
        key: merge_key.to_string(),
    })?;

    Ok((key_value, element_map))
}

fn diff_keyed_lists(
    original: &[Value],
    modified: &[Value],
    merge_key: &str,
    path: &str,
    schema: &MergeSchema,
) -> Result<Option<(Vec<Value>, Vec<Value>)>, MergeError> {
    let original_index = index_keyed_list(original, merge_key, path)?;
    let modified_index = index_keyed_list(modified, merge_key, path)?;

    let mut list_patch = Vec::new();
    let mut element_order = Vec::with_capacity(modified.len());

    for element in modified {
        let (key_value, modified_map) = keyed_entry(element, merge_key, path)?;
        element_order.push(Value::Object(Map::from_iter([(merge_key.to_string(), key_value.clone())])));

        match original_index.get(&key_value.to_string()) {
            Some(original_map) => {
                let element_patch = diff_maps(original_map, modified_map, path, schema)?;
                if !element_patch.is_empty() {
                    let mut entry = Map::from_iter([(merge_key.to_string(), key_value.clone())]);
                    entry.extend(element_patch);
                    list_patch.push(Value::Object(entry));
                }
            }
            None => list_patch.push(element.clone()),
        }
    }

    for element in original {
        let (key_value, _) = keyed_entry(element, merge_key, path)?;
        if !modified_index.contains_key(&key_value.to_string()) {
            list_patch.push(Value::Object(Map::from_iter([
                (merge_key.to_string(), key_value.clone()),
                (PATCH_DIRECTIVE.to_string(), Value::String(DELETE_DIRECTIVE.to_string())),
            ])));
        }
    }

    let original_order = original
        .iter()
        .map(|element| keyed_entry(element, merge_key, path).map(|(key_value, _)| key_value))
        .collect::<Result<Vec<_>, _>>()?;
    let reordered = original_order.len() != element_order.len()
        || original_order
            .iter()
            .zip(&element_order)
            .any(|(original_key, order_entry)| order_entry.get(merge_key) != Some(*original_key));

    if list_patch.is_empty() && !reordered {
        return Ok(None);
    }

    Ok(Some((list_patch, element_order)))
}

/// Applies a patch produced by [`create_two_way_merge_patch`] to `target` in place
pub fn apply_merge_patch(target: &mut Value, patch: &Value, schema: &MergeSchema) -> Result<(), MergeError> {
    let patch = patch.as_object().ok_or_else(|| MergeError::NotAnObject("patch".to_string()))?;
    let target = target.as_object_mut().ok_or_else(|| MergeError::NotAnObject("patch target".to_string()))?;

    apply_map(target, patch, "", schema)
}

fn apply_map(
    target: &mut Map<String, Value>,
    patch: &Map<String, Value>,
    path: &str,
    schema: &MergeSchema,
) -> Result<(), MergeError> {
    for (key, patch_value) in patch {
        if let Some(field) = key.strip_prefix(SET_ELEMENT_ORDER_PREFIX) {
            // Only an order change without a list patch needs handling here; otherwise the list
            // patch below picks the order up
            if !patch.contains_key(field) {
                let child_path = format!("{path}/{field}");
                let merge_key = schema.merge_key(&child_path).ok_or_else(|| MergeError::UnknownDirective {
                    path: child_path.clone(),
                    directive: key.clone(),
                })?;
                if let Some(Value::Array(list)) = target.get_mut(field) {
                    let order = patch_value.as_array().ok_or_else(|| MergeError::NotAnObject(key.clone()))?;
                    reorder_keyed_list(list, order, merge_key, &child_path)?;
                }
            }
            continue;
        }

        if key.starts_with('$') {
            return Err(MergeError::UnknownDirective {
                path: path.to_string(),
                directive: key.clone(),
            });
        }

        let child_path = format!("{path}/{key}");

        match patch_value {
            Value::Null => {
                target.remove(key);
            }
            Value::Object(patch_map) => match target.get_mut(key) {
                Some(Value::Object(target_map)) => apply_map(target_map, patch_map, &child_path, schema)?,
                _ => {
                    let mut fresh = Map::new();
                    apply_map(&mut fresh, patch_map, &child_path, schema)?;
                    target.insert(key.clone(), Value::Object(fresh));
                }
            },
            Value::Array(patch_list) => match schema.merge_key(&child_path) {
                Some(merge_key) => {
                    let mut list = match target.remove(key) {
                        Some(Value::Array(list)) => list,
                        _ => Vec::new(),
                    };
                    merge_keyed_list(&mut list, patch_list, merge_key, &child_path, schema)?;

                    if let Some(order) = patch.get(&format!("{SET_ELEMENT_ORDER_PREFIX}{key}")) {
                        let order = order.as_array().ok_or_else(|| MergeError::NotAnObject(format!("{SET_ELEMENT_ORDER_PREFIX}{key}")))?;
                        reorder_keyed_list(&mut list, order, merge_key, &child_path)?;
                    }

                    target.insert(key.clone(), Value::Array(list));
                }
                None => {
                    target.insert(key.clone(), patch_value.clone());
                }
            },
            _ => {
                target.insert(key.clone(), patch_value.clone());
            }
        }
    }

    Ok(())
}

fn merge_keyed_list(
    list: &mut Vec<Value>,
    patch_list: &[Value],
    merge_key: &str,
    path: &str,
    schema: &MergeSchema,
) -> Result<(), MergeError> {
    for patch_element in patch_list {
        let (key_value, patch_map) = keyed_entry(patch_element, merge_key, path)?;

        let position = list
            .iter()
            .position(|element| element.as_object().and_then(|element| element.get(merge_key)) == Some(key_value));

        match patch_map.get(PATCH_DIRECTIVE) {
            Some(Value::String(directive)) if directive == DELETE_DIRECTIVE => {
                if let Some(position) = position {
                    list.remove(position);
                }
                continue;
            }
            Some(directive) => {
                return Err(MergeError::UnknownDirective {
                    path: path.to_string(),
                    directive: directive.to_string(),
                })
            }
            None => {}
        }

        match position.and_then(|position| list[position].as_object_mut()) {
            Some(element) => apply_map(element, patch_map, path, schema)?,
            None => {
                let mut fresh = Map::new();
                apply_map(&mut fresh, patch_map, path, schema)?;
                list.push(Value::Object(fresh));
            }
        }
    }

    Ok(())
}

// Entries named by the order come first, in that order; anything else keeps its relative position
// after them
fn reorder_keyed_list(list: &mut Vec<Value>, order: &[Value], merge_key: &str, path: &str) -> Result<(), MergeError> {
    let mut ordered = Vec::with_capacity(list.len());
    let mut placed = HashSet::new();

    for order_entry in order {
        let (key_value, _) = keyed_entry(order_entry, merge_key, path)?;
        let rendered = key_value.to_string();
        if placed.contains(&rendered) {
            continue;
        }

        if let Some(position) = list
            .iter()
            .position(|element| element.as_object().and_then(|element| element.get(merge_key)) == Some(key_value))
        {
            ordered.push(list.remove(position));
            placed.insert(rendered);
        }
    }

    ordered.append(list);
    *list = ordered;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn schema() -> MergeSchema {
        MergeSchema::new().with_merge_key("/status/conditions", "type")
    }

    fn round_trip(original: Value, modified: Value) -> Value {
        let patch = create_two_way_merge_patch(&original, &modified, &schema()).unwrap();
        let mut patched = original;
        apply_merge_patch(&mut patched, &patch, &schema()).unwrap();
        assert_eq!(patched, modified);
        patch
    }

    #[test]
    fn test_equal_values_produce_empty_patch() {
        let value = json!({"status": {
            "addresses": [{"type": "Hostname", "address": "w0"}],
            "conditions": [{"type": "Ready", "status": "True"}]
        }});

        assert_eq!(create_two_way_merge_patch(&value, &value, &schema()).unwrap(), json!({}));
    }

    #[test]
    fn test_scalars_and_removed_keys() {
        let patch = round_trip(
            json!({"status": {"phase": "Pending", "nodeInfo": {"kubeletVersion": "v1.26.0", "bootID": "a"}}}),
            json!({"status": {"nodeInfo": {"kubeletVersion": "v1.27.3", "bootID": "a"}}}),
        );

        assert_eq!(patch, json!({"status": {"phase": null, "nodeInfo": {"kubeletVersion": "v1.27.3"}}}));
    }

    #[test]
    fn test_atomic_list_replaced_on_reorder() {
        let patch = round_trip(
            json!({"status": {"addresses": [{"type": "InternalIP", "address": "1.2.3.1"}, {"type": "Hostname", "address": "w0"}]}}),
            json!({"status": {"addresses": [{"type": "Hostname", "address": "w0"}, {"type": "InternalIP", "address": "1.2.3.1"}]}}),
        );

        assert_eq!(
            patch,
            json!({"status": {"addresses": [{"type": "Hostname", "address": "w0"}, {"type": "InternalIP", "address": "1.2.3.1"}]}})
        );
    }

    #[test]
    fn test_keyed_list_replace_add_and_delete() {
        let patch = round_trip(
            json!({"status": {"conditions": [
                {"type": "MemoryPressure", "status": "False"},
                {"type": "Ready", "status": "False", "reason": "KubeletNotReady"},
                {"type": "DiskPressure", "status": "False"}
            ]}}),
            json!({"status": {"conditions": [
                {"type": "MemoryPressure", "status": "False"},
                {"type": "Ready", "status": "True", "reason": "KubeletReady"},
                {"type": "PIDPressure", "status": "False"}
            ]}}),
        );

        assert_eq!(
            patch,
            json!({"status": {
                "conditions": [
                    {"type": "Ready", "status": "True", "reason": "KubeletReady"},
                    {"type": "PIDPressure", "status": "False"},
                    {"type": "DiskPressure", "$patch": "delete"}
                ],
                "$setElementOrder/conditions": [{"type": "MemoryPressure"}, {"type": "Ready"}, {"type": "PIDPressure"}]
            }})
        );
    }

    #[test]
    fn test_keyed_list_reorder_only() {
        let patch = round_trip(
            json!({"status": {"conditions": [{"type": "Ready", "status": "True"}, {"type": "DiskPressure", "status": "False"}]}}),
            json!({"status": {"conditions": [{"type": "DiskPressure", "status": "False"}, {"type": "Ready", "status": "True"}]}}),
        );

        assert_eq!(
            patch,
            json!({"status": {"conditions": [], "$setElementOrder/conditions": [{"type": "DiskPressure"}, {"type": "Ready"}]}})
        );
    }

    #[test]
    fn test_keyed_list_appears_and_disappears() {
        round_trip(
            json!({"status": {}}),
            json!({"status": {"conditions": [{"type": "Ready", "status": "True"}]}}),
        );
        round_trip(
            json!({"status": {"conditions": [{"type": "Ready", "status": "True"}]}}),
            json!({"status": {}}),
        );
    }

    #[test]
    fn test_order_directive_without_list_patch() {
        let mut target = json!({"status": {"conditions": [{"type": "A"}, {"type": "B"}, {"type": "C"}]}});

        apply_merge_patch(
            &mut target,
            &json!({"status": {"$setElementOrder/conditions": [{"type": "C"}, {"type": "A"}]}}),
            &schema(),
        )
        .unwrap();

        assert_eq!(target, json!({"status": {"conditions": [{"type": "C"}, {"type": "A"}, {"type": "B"}]}}));
    }

    #[test]
    fn test_malformed_keyed_lists() {
        let duplicate = json!({"status": {"conditions": [{"type": "Ready"}, {"type": "Ready"}]}});
        let changed = json!({"status": {"conditions": [{"type": "Ready", "status": "True"}]}});
        assert!(matches!(
            create_two_way_merge_patch(&duplicate, &changed, &schema()),
            Err(MergeError::DuplicateMergeKey { .. })
        ));

        let mut target = changed.clone();
        assert!(matches!(
            apply_merge_patch(&mut target, &json!({"status": {"conditions": [{"status": "False"}]}}), &schema()),
            Err(MergeError::MissingMergeKey { .. })
        ));
        assert!(matches!(
            apply_merge_patch(&mut target, &json!({"status": {"conditions": [{"type": "Ready", "$patch": "replace"}]}}), &schema()),
            Err(MergeError::UnknownDirective { .. })
        ));
        assert!(matches!(
            apply_merge_patch(&mut target, &json!({"$retainKeys": []}), &schema()),
            Err(MergeError::UnknownDirective { .. })
        ));
    }
}

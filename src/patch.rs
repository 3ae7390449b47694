use crate::{
    error::NodeError,
    node::{Node, NodeStatus},
    node_store::NodeStore,
    strategic_merge::{create_two_way_merge_patch, MergeSchema},
};
use lazy_static::lazy_static;
use serde_json::{json, Value};
use std::fmt::Display;

lazy_static! {
    /// Conditions merge by their type. Addresses, like every other list on a node, are atomic so any
    /// reordering replaces them.
    pub(crate) static ref NODE_MERGE_SCHEMA: MergeSchema = MergeSchema::new().with_merge_key("/status/conditions", "type");
}

/// Serialized strategic merge patch for a single node
#[derive(Clone, Debug, PartialEq)]
pub struct Patch(Vec<u8>);

impl Patch {
    pub(crate) fn from_value(value: &Value) -> Result<Self, NodeError> {
        Ok(Self(serde_json::to_vec(value)?))
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub(crate) fn to_value(&self) -> Result<Value, NodeError> {
        serde_json::from_slice(&self.0).map_err(|err| NodeError::Fatal(format!("malformed patch: {err}")))
    }
}

impl From<Vec<u8>> for Patch {
    fn from(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }
}

impl Display for Patch {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", String::from_utf8_lossy(&self.0))
    }
}

/// The status as the store will hold it. A null field means "delete" in a merge patch, so a field
/// that is null is the same as a field that is absent.
pub(crate) fn settled_status(status: &NodeStatus) -> Result<Value, NodeError> {
    let mut value = serde_json::to_value(status)?;
    drop_nulls(&mut value);
    Ok(value)
}

fn drop_nulls(value: &mut Value) {
    match value {
        Value::Object(map) => {
            map.retain(|_, child| !child.is_null());
            map.values_mut().for_each(drop_nulls);
        }
        Value::Array(list) => list.iter_mut().for_each(drop_nulls),
        _ => {}
    }
}

/// Computes the status-only patch that moves `old` to `new`. `None` means the statuses are
/// identical and there is nothing to send.
///
/// The patch is pinned to `old`'s resourceVersion when it has one, so the store rejects it if the
/// node changed in the meantime.
pub fn compute_status_patch(old: &Node, new: &Node) -> Result<Option<Patch>, NodeError> {
    if old.name() != new.name() {
        return Err(NodeError::Fatal(format!(
            "refusing to patch node {:?} with the status of node {:?}",
            old.name(),
            new.name()
        )));
    }

    let old_status = json!({ "status": settled_status(&old.status)? });
    let new_status = json!({ "status": settled_status(&new.status)? });

    let mut patch = match create_two_way_merge_patch(&old_status, &new_status, &NODE_MERGE_SCHEMA) {
        Ok(Value::Object(patch)) => patch,
        Ok(patch) => return Err(NodeError::Serialization(format!("status diff is not an object: {patch}"))),
        Err(err) => return Err(NodeError::Serialization(format!("diffing status of node {}: {err}", old.name()))),
    };

    if patch.is_empty() {
        return Ok(None);
    }

    if let Some(resource_version) = old.resource_version() {
        patch.insert("metadata".to_string(), json!({ "resourceVersion": resource_version }));
    }

    Ok(Some(Patch::from_value(&Value::Object(patch))?))
}

/// Submits a status patch for `node_name`. A `None` patch is a no-op and hands back `old` without
/// contacting the store. Errors come back classified and are never retried here.
pub async fn apply_node_status_patch(store: &dyn NodeStore, node_name: &str, old: &Node, patch: Option<&Patch>) -> Result<Node, NodeError> {
    if old.name() != node_name {
        return Err(NodeError::Fatal(format!("node {:?} does not match patch target {:?}", old.name(), node_name)));
    }

    let patch = match patch {
        Some(patch) => patch,
        None => {
            log::debug!("status of node {} unchanged, skipping patch", node_name);
            return Ok(old.clone());
        }
    };

    log::debug!("patching status of node {}: {}", node_name, patch);

    store.patch_node(node_name, patch).await
}

/// Diffs and applies in one go. Also returns the patch that was sent, if any.
pub async fn patch_node_status(store: &dyn NodeStore, node_name: &str, old: &Node, new: &Node) -> Result<(Node, Option<Patch>), NodeError> {
    let patch = compute_status_patch(old, new)?;
    let patched = apply_node_status_patch(store, node_name, old, patch.as_ref()).await?;

    Ok((patched, patch))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        node::{ConditionStatus, NodeAddress, NodeAddressType::*, NodeCondition},
        node_store::{FailingStore, InMemoryNodeStore},
    };
    use anyhow::Result;

    fn condition(condition_type: &str, status: ConditionStatus, heartbeat: &str) -> NodeCondition {
        NodeCondition {
            last_heartbeat_time: Some(heartbeat.to_string()),
            last_transition_time: Some("2023-06-01T10:00:00Z".to_string()),
            ..NodeCondition::new(condition_type, status)
        }
    }

    fn kubelet_node() -> Node {
        let mut node = Node::new("testKubeletHostname");
        node.status.addresses = vec![
            NodeAddress::new(InternalIp, "1.2.3.1"),
            NodeAddress::new(InternalIp, "1.2.3.5"),
            NodeAddress::new(InternalIp, "1.2.3.6"),
            NodeAddress::new(Hostname, "testKubeletHostname"),
        ];
        node.status.conditions = vec![
            condition("MemoryPressure", ConditionStatus::False, "2023-06-01T10:00:00Z"),
            condition("DiskPressure", ConditionStatus::False, "2023-06-01T10:00:00Z"),
            condition("Ready", ConditionStatus::True, "2023-06-01T10:00:00Z"),
        ];
        node.status
            .other
            .insert("nodeInfo".to_string(), json!({"kubeletVersion": "v1.27.3"}));
        node
    }

    #[test]
    fn test_same_node_is_a_noop() -> Result<()> {
        let node = kubelet_node();
        assert_eq!(compute_status_patch(&node, &node)?, None);

        // Only the status subtree is compared
        let mut relabeled = node.clone();
        relabeled.metadata.labels.insert("node-role.kubernetes.io/worker".to_string(), String::new());
        relabeled.spec.pod_cidr = Some("10.128.0.0/23".to_string());
        assert_eq!(compute_status_patch(&node, &relabeled)?, None);

        Ok(())
    }

    #[test]
    fn test_identity_mismatch_is_fatal() {
        let old = kubelet_node();
        let mut new = kubelet_node();
        new.metadata.name = "someone-else".to_string();

        assert!(matches!(compute_status_patch(&old, &new), Err(NodeError::Fatal(_))));
    }

    #[test]
    fn test_patch_carries_only_status_and_version() -> Result<()> {
        let mut old = kubelet_node();
        old.metadata.resource_version = Some("17".to_string());
        let mut new = old.clone();
        new.status.addresses.insert(3, NodeAddress::new(InternalIp, "1.2.3.7"));

        let patch = compute_status_patch(&old, &new)?.expect("addresses changed");

        assert_eq!(
            serde_json::from_slice::<Value>(patch.as_bytes())?,
            json!({
                "metadata": {"resourceVersion": "17"},
                "status": {"addresses": [
                    {"type": "InternalIP", "address": "1.2.3.1"},
                    {"type": "InternalIP", "address": "1.2.3.5"},
                    {"type": "InternalIP", "address": "1.2.3.6"},
                    {"type": "InternalIP", "address": "1.2.3.7"},
                    {"type": "Hostname", "address": "testKubeletHostname"}
                ]}
            })
        );

        Ok(())
    }

    #[test]
    fn test_conditions_diff_by_type() -> Result<()> {
        let old = kubelet_node();
        let mut new = old.clone();
        new.status.conditions[2] = condition("Ready", ConditionStatus::False, "2023-06-01T10:05:00Z");

        let patch = compute_status_patch(&old, &new)?.expect("Ready changed");

        assert_eq!(
            serde_json::from_slice::<Value>(patch.as_bytes())?,
            json!({"status": {
                "conditions": [{"type": "Ready", "status": "False", "lastHeartbeatTime": "2023-06-01T10:05:00Z"}],
                "$setElementOrder/conditions": [{"type": "MemoryPressure"}, {"type": "DiskPressure"}, {"type": "Ready"}]
            }})
        );

        Ok(())
    }

    #[test]
    fn test_null_fields_count_as_absent() -> Result<()> {
        let old = kubelet_node();
        let mut new = old.clone();
        new.status.other.insert("phase".to_string(), Value::Null);

        assert_eq!(compute_status_patch(&old, &new)?, None);
        assert_eq!(compute_status_patch(&new, &old)?, None);

        Ok(())
    }

    #[tokio::test]
    async fn test_noop_patch_skips_the_store() -> Result<()> {
        let store = InMemoryNodeStore::new(None);
        let stored = store.insert(&kubelet_node()).await?;

        let (patched, patch) = patch_node_status(&store, "testKubeletHostname", &stored, &stored.clone()).await?;

        assert_eq!(patch, None);
        assert_eq!(patched, stored);
        assert_eq!(store.write_count(), 0);

        Ok(())
    }

    #[tokio::test]
    async fn test_applied_patch_reproduces_new_status() -> Result<()> {
        fn mutate(name: &str, node: &mut Node) {
            match name {
                "add address" => node.status.addresses.insert(3, NodeAddress::new(InternalIp, "1.2.3.7")),
                "reorder addresses" => node.status.addresses.reverse(),
                "drop addresses" => node.status.addresses.clear(),
                "replace condition" => node.status.conditions[1] = condition("DiskPressure", ConditionStatus::True, "2023-06-01T10:05:00Z"),
                "add condition" => node
                    .status
                    .conditions
                    .push(condition("PIDPressure", ConditionStatus::False, "2023-06-01T10:05:00Z")),
                "remove condition" => {
                    node.status.conditions.remove(0);
                }
                "reorder conditions" => node.status.conditions.rotate_left(1),
                "drop unmodeled field" => {
                    node.status.other.remove("nodeInfo");
                }
                "null unmodeled field" => {
                    node.status.other.insert("nodeInfo".to_string(), Value::Null);
                }
                "null nested field" => {
                    node.status
                        .other
                        .insert("nodeInfo".to_string(), json!({"kubeletVersion": "v1.28.1", "bootID": null}));
                }
                "everything at once" => {
                    node.status.addresses.truncate(1);
                    node.status.conditions.swap(0, 2);
                    node.status.conditions[0].reason = Some("KubeletReady".to_string());
                    node.status.conditions.remove(1);
                    node.status.other.insert("phase".to_string(), json!("Running"));
                }
                _ => unreachable!("unknown mutation {name}"),
            }
        }

        let mutations = [
            "add address",
            "reorder addresses",
            "drop addresses",
            "replace condition",
            "add condition",
            "remove condition",
            "reorder conditions",
            "drop unmodeled field",
            "null unmodeled field",
            "null nested field",
            "everything at once",
        ];

        for name in mutations {
            let store = InMemoryNodeStore::new(None);
            let old = store.insert(&kubelet_node()).await?;
            let mut new = old.clone();
            mutate(name, &mut new);

            let (patched, patch) = patch_node_status(&store, "testKubeletHostname", &old, &new).await?;

            assert!(patch.is_some(), "{name}");
            assert_eq!(settled_status(&patched.status)?, settled_status(&new.status)?, "{name}");
            assert_eq!(
                settled_status(&store.get_node("testKubeletHostname").await?.status)?,
                settled_status(&new.status)?,
                "{name}"
            );
            assert_eq!(store.write_count(), 1, "{name}");
        }

        Ok(())
    }

    #[tokio::test]
    async fn test_concurrent_writers_conflict() -> Result<()> {
        let store = InMemoryNodeStore::new(None);
        let old = store.insert(&kubelet_node()).await?;

        let mut first = old.clone();
        first.status.conditions[2].status = ConditionStatus::False;
        let mut second = old.clone();
        second.status.addresses.pop();

        patch_node_status(&store, "testKubeletHostname", &old, &first).await?;
        let result = patch_node_status(&store, "testKubeletHostname", &old, &second).await;

        assert!(matches!(result, Err(NodeError::Conflict(_))));
        assert_eq!(store.get_node("testKubeletHostname").await?.status, first.status);

        Ok(())
    }

    #[tokio::test]
    async fn test_store_failures_pass_through() -> Result<()> {
        let failures: [(fn(String) -> NodeError, &str); 2] = [
            (NodeError::Transient, "store unavailable: writing node testKubeletHostname"),
            (NodeError::Fatal, "writing node testKubeletHostname"),
        ];

        for (failure, expected) in failures {
            let store = FailingStore {
                inner: InMemoryNodeStore::new(None),
                failure,
            };
            let old = store.inner.insert(&kubelet_node()).await?;
            let mut new = old.clone();
            new.status.addresses.pop();

            let patch = compute_status_patch(&old, &new)?;
            let err = apply_node_status_patch(&store, "testKubeletHostname", &old, patch.as_ref())
                .await
                .unwrap_err();

            assert_eq!(err.to_string(), expected);
            assert_eq!(store.inner.write_count(), 0);
        }

        Ok(())
    }

    #[tokio::test]
    async fn test_wrong_target_is_fatal() -> Result<()> {
        let store = InMemoryNodeStore::new(None);
        let old = store.insert(&kubelet_node()).await?;

        let result = apply_node_status_patch(&store, "another-node", &old, None).await;

        assert!(matches!(result, Err(NodeError::Fatal(_))));
        Ok(())
    }
}

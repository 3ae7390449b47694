use crate::{
    error::NodeError,
    node::Node,
    patch::{Patch, NODE_MERGE_SCHEMA},
    strategic_merge::apply_merge_patch,
};
use async_trait::async_trait;
use etcd_client::{Client as EtcdClient, Compare, CompareOp, Txn, TxnOp};
use serde_json::Value;
use std::{
    collections::HashMap,
    sync::atomic::{AtomicUsize, Ordering::Relaxed},
};
use tokio::sync::Mutex;

const NODES_ETCD_PREFIX: &str = "/kubernetes.io/minions/";

pub(crate) fn node_etcd_key(name: &str) -> String {
    format!("{NODES_ETCD_PREFIX}{name}")
}

/// Fetch and partial-update access to node records in the shared cluster store.
///
/// `patch_node` takes a strategic merge patch. When the patch carries `metadata.resourceVersion`,
/// the store refuses it with [`NodeError::Conflict`] unless that still is the stored version.
#[async_trait]
pub trait NodeStore: Send + Sync {
    async fn get_node(&self, name: &str) -> Result<Node, NodeError>;
    async fn patch_node(&self, name: &str, patch: &Patch) -> Result<Node, NodeError>;
}

fn node_from_stored(value: &Value, revision: i64) -> Result<Node, NodeError> {
    let mut node: Node = serde_json::from_value(value.clone())?;
    node.metadata.resource_version = Some(revision.to_string());
    Ok(node)
}

// Checks the patch's version precondition against the stored revision, then merges it into the
// stored value. The version token itself is never persisted, it is derived from the revision.
fn patch_stored_node(stored: &Value, revision: i64, name: &str, patch: &Patch) -> Result<Value, NodeError> {
    let mut patch = patch.to_value()?;

    if let Some(metadata) = patch.get_mut("metadata").and_then(Value::as_object_mut) {
        if let Some(expected) = metadata.remove("resourceVersion") {
            let expected = expected
                .as_str()
                .ok_or_else(|| NodeError::Fatal(format!("patch for node {name} has a non-string resourceVersion")))?;

            if expected != revision.to_string() {
                return Err(NodeError::Conflict(format!(
                    "node {name} was modified, patch expects resourceVersion {expected} but the store has {revision}"
                )));
            }
        }

        if let Some(patched_name) = metadata.get("name") {
            if patched_name.as_str() != Some(name) {
                return Err(NodeError::Fatal(format!("patch may not rename node {name} to {patched_name}")));
            }
        }

        if metadata.is_empty() {
            if let Some(patch) = patch.as_object_mut() {
                patch.remove("metadata");
            }
        }
    }

    let mut patched = stored.clone();
    apply_merge_patch(&mut patched, &patch, &NODE_MERGE_SCHEMA).map_err(|err| NodeError::Fatal(format!("patching node {name}: {err}")))?;

    if let Some(metadata) = patched.get_mut("metadata").and_then(Value::as_object_mut) {
        metadata.remove("resourceVersion");
    }

    // Reject anything that no longer reads back as a node before it reaches the store
    let node: Node =
        serde_json::from_value(patched.clone()).map_err(|err| NodeError::Fatal(format!("patched node {name} is invalid: {err}")))?;
    if node.name() != name {
        return Err(NodeError::Fatal(format!("patched node is named {:?}, expected {:?}", node.name(), name)));
    }

    Ok(patched)
}

/// Nodes stored in etcd as JSON under `/kubernetes.io/minions/`, with the etcd mod revision serving
/// as resourceVersion
pub struct EtcdNodeStore {
    etcd_client: EtcdClient,
}

impl EtcdNodeStore {
    pub fn new(etcd_client: EtcdClient) -> Self {
        Self { etcd_client }
    }

    pub async fn connect(etcd_endpoint: &str) -> Result<Self, NodeError> {
        Ok(Self::new(EtcdClient::connect([etcd_endpoint], None).await?))
    }

    async fn get_raw(&self, name: &str) -> Result<Option<(Value, i64)>, NodeError> {
        let get_result = self.etcd_client.clone().get(node_etcd_key(name), None).await?;

        match get_result.kvs().first() {
            Some(kv) => Ok(Some((serde_json::from_slice(kv.value())?, kv.mod_revision()))),
            None => Ok(None),
        }
    }
}

#[async_trait]
impl NodeStore for EtcdNodeStore {
    async fn get_node(&self, name: &str) -> Result<Node, NodeError> {
        let (value, revision) = self
            .get_raw(name)
            .await?
            .ok_or_else(|| NodeError::Fatal(format!("node {name} not found")))?;

        node_from_stored(&value, revision)
    }

    async fn patch_node(&self, name: &str, patch: &Patch) -> Result<Node, NodeError> {
        let (stored, revision) = self
            .get_raw(name)
            .await?
            .ok_or_else(|| NodeError::Fatal(format!("node {name} not found")))?;

        let patched = patch_stored_node(&stored, revision, name, patch)?;

        // Someone else may have written between our read and this write, only commit if the key
        // is still at the revision the patch was checked against
        let key = node_etcd_key(name);
        let txn = Txn::new()
            .when([Compare::mod_revision(key.clone(), CompareOp::Equal, revision)])
            .and_then([TxnOp::put(key, serde_json::to_vec(&patched)?, None)]);

        let txn_result = self.etcd_client.clone().txn(txn).await?;
        if !txn_result.succeeded() {
            log::warn!("node {} changed underneath patch at revision {}", name, revision);
            return Err(NodeError::Conflict(format!("node {name} was modified concurrently")));
        }

        let new_revision = txn_result
            .header()
            .map(|header| header.revision())
            .ok_or_else(|| NodeError::Fatal("etcd transaction response has no header".to_string()))?;

        log::debug!("patched node {} from revision {} to {}", name, revision, new_revision);

        node_from_stored(&patched, new_revision)
    }
}

struct StoredNode {
    value: Value,
    revision: i64,
}

#[derive(Default)]
struct InMemoryNodeStoreInternal {
    nodes: HashMap<String, StoredNode>,
    revision: i64,
}

// A node store backed by an in-memory hashmap. Reads are served from memory, with fallback to an
// actual etcd when one is given. Writes are strictly to memory, which makes it suitable for dry
// runs against a live cluster as well as for tests.
#[derive(Default)]
pub struct InMemoryNodeStore {
    etcd: Option<EtcdNodeStore>,
    internal: Mutex<InMemoryNodeStoreInternal>,
    writes: AtomicUsize,
}

impl InMemoryNodeStore {
    pub fn new(etcd: Option<EtcdNodeStore>) -> Self {
        Self {
            etcd,
            ..Default::default()
        }
    }

    /// Seeds a node, replacing any previous value. Seeding does not count as a write.
    pub async fn insert(&self, node: &Node) -> Result<Node, NodeError> {
        let mut value = serde_json::to_value(node)?;
        if let Some(metadata) = value.get_mut("metadata").and_then(Value::as_object_mut) {
            metadata.remove("resourceVersion");
        }

        let mut internal = self.internal.lock().await;
        internal.revision += 1;
        let revision = internal.revision;
        let node = node_from_stored(&value, revision)?;
        internal.nodes.insert(node.name().to_string(), StoredNode { value, revision });

        Ok(node)
    }

    /// Number of patches committed so far
    pub fn write_count(&self) -> usize {
        self.writes.load(Relaxed)
    }

    async fn load(&self, internal: &mut InMemoryNodeStoreInternal, name: &str) -> Result<(), NodeError> {
        if internal.nodes.contains_key(name) {
            return Ok(());
        }

        let etcd = self.etcd.as_ref().ok_or_else(|| NodeError::Fatal(format!("node {name} not found")))?;
        let (value, revision) = etcd
            .get_raw(name)
            .await?
            .ok_or_else(|| NodeError::Fatal(format!("node {name} not found")))?;

        internal.revision = internal.revision.max(revision);
        internal.nodes.insert(name.to_string(), StoredNode { value, revision });

        Ok(())
    }
}

#[async_trait]
impl NodeStore for InMemoryNodeStore {
    async fn get_node(&self, name: &str) -> Result<Node, NodeError> {
        let mut internal = self.internal.lock().await;
        self.load(&mut internal, name).await?;

        match internal.nodes.get(name) {
            Some(stored) => node_from_stored(&stored.value, stored.revision),
            None => Err(NodeError::Fatal(format!("node {name} not found"))),
        }
    }

    async fn patch_node(&self, name: &str, patch: &Patch) -> Result<Node, NodeError> {
        let mut internal = self.internal.lock().await;
        self.load(&mut internal, name).await?;

        let stored = internal
            .nodes
            .get(name)
            .ok_or_else(|| NodeError::Fatal(format!("node {name} not found")))?;
        let patched = patch_stored_node(&stored.value, stored.revision, name, patch)?;

        internal.revision += 1;
        let revision = internal.revision;
        let node = node_from_stored(&patched, revision)?;
        internal.nodes.insert(name.to_string(), StoredNode { value: patched, revision });
        self.writes.fetch_add(1, Relaxed);

        log::debug!("patched in-memory node {} to revision {}", name, revision);

        Ok(node)
    }
}

/// Serves reads from memory and fails every write with the error `failure` builds
#[cfg(test)]
pub(crate) struct FailingStore {
    pub(crate) inner: InMemoryNodeStore,
    pub(crate) failure: fn(String) -> NodeError,
}

#[cfg(test)]
#[async_trait]
impl NodeStore for FailingStore {
    async fn get_node(&self, name: &str) -> Result<Node, NodeError> {
        self.inner.get_node(name).await
    }

    async fn patch_node(&self, name: &str, _patch: &Patch) -> Result<Node, NodeError> {
        Err((self.failure)(format!("writing node {name}")))
    }
}

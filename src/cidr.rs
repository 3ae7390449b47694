use crate::{error::NodeError, node_store::NodeStore, patch::Patch};
use serde_json::{json, Map, Value};

/// Points the node's spec.podCIDR at `cidr`. Nothing is written when it already is.
pub async fn patch_node_cidr(store: &dyn NodeStore, node_name: &str, cidr: &str) -> Result<(), NodeError> {
    let node = store.get_node(node_name).await?;

    if node.spec.pod_cidr.as_deref() == Some(cidr) {
        log::debug!("node {} already has pod CIDR {}", node_name, cidr);
        return Ok(());
    }

    let mut patch = Map::new();
    if let Some(resource_version) = node.resource_version() {
        patch.insert("metadata".to_string(), json!({ "resourceVersion": resource_version }));
    }
    patch.insert("spec".to_string(), json!({ "podCIDR": cidr }));

    store.patch_node(node_name, &Patch::from_value(&Value::Object(patch))?).await?;

    log::info!("set pod CIDR of node {} to {}", node_name, cidr);

    Ok(())
}

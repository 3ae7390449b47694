use crate::config::{NodeAction, NodeStatusConfig};
use anyhow::{Context, Result};
use futures_util::future::join_all;
use nodestatus::{
    get_node_host_ip, get_preferred_address, patch_node_cidr, set_node_condition, EtcdNodeStore, InMemoryNodeStore, NodeError, NodeStore,
};
use std::time::Duration;

#[derive(Debug, serde::Serialize)]
pub(crate) struct NodeOutcome {
    pub(crate) node: String,
    pub(crate) attempts: u32,
    pub(crate) output: Option<String>,
    pub(crate) error: Option<String>,
}

pub(crate) async fn run(config: &NodeStatusConfig) -> Result<Vec<NodeOutcome>> {
    let etcd_store = EtcdNodeStore::connect(&config.etcd_endpoint)
        .await
        .context("connecting to etcd")?;

    let store: Box<dyn NodeStore> = if config.dry_run {
        log::info!("dry run requested, all writes stay in memory");
        Box::new(InMemoryNodeStore::new(Some(etcd_store)))
    } else {
        Box::new(etcd_store)
    };

    Ok(run_with_store(store.as_ref(), config).await)
}

pub(crate) async fn run_with_store(store: &dyn NodeStore, config: &NodeStatusConfig) -> Vec<NodeOutcome> {
    join_all(config.nodes.iter().map(|node_name| run_node(store, config, node_name))).await
}

async fn run_action(store: &dyn NodeStore, action: &NodeAction, node_name: &str) -> Result<String, NodeError> {
    match action {
        NodeAction::PreferredAddress(preferences) => get_preferred_address(&store.get_node(node_name).await?, preferences),
        NodeAction::HostIp => Ok(get_node_host_ip(&store.get_node(node_name).await?)?.to_string()),
        NodeAction::SetCondition(condition) => {
            set_node_condition(store, node_name, condition.clone()).await?;
            Ok(format!("condition {} is {}", condition.condition_type, condition.status))
        }
        NodeAction::PatchCidr(cidr) => {
            patch_node_cidr(store, node_name, cidr).await?;
            Ok(format!("pod CIDR is {cidr}"))
        }
    }
}

// Every action starts from a fresh read of the node, so a conflict is retried by simply running
// the action again. Nothing else is retried.
async fn run_node(store: &dyn NodeStore, config: &NodeStatusConfig, node_name: &str) -> NodeOutcome {
    let timeout = Duration::from_secs(config.timeout_seconds);
    let mut attempts = 0;

    let result = loop {
        attempts += 1;

        let result = match tokio::time::timeout(timeout, run_action(store, &config.action, node_name)).await {
            Ok(result) => result,
            Err(_) => break Err(format!("timed out after {}s", config.timeout_seconds)),
        };

        match result {
            Err(err) if err.is_conflict() && attempts <= config.max_conflict_retries => {
                log::warn!("{} (attempt {}), retrying node {}", err, attempts, node_name);
            }
            result => break result.map_err(|err| err.to_string()),
        }
    };

    match &result {
        Ok(output) => log::info!("node {}: {}", node_name, output),
        Err(err) => log::error!("node {} failed after {} attempt(s): {}", node_name, attempts, err),
    }

    NodeOutcome {
        node: node_name.to_string(),
        attempts,
        output: result.as_ref().ok().cloned(),
        error: result.err(),
    }
}

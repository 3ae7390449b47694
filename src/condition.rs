use crate::{
    error::NodeError,
    node::NodeCondition,
    node_store::NodeStore,
    patch::patch_node_status,
};
use chrono::{DateTime, SecondsFormat, Utc};
use std::collections::HashMap;

pub(crate) fn format_time(time: DateTime<Utc>) -> String {
    time.to_rfc3339_opts(SecondsFormat::Secs, true)
}

/// Inserts `condition` or replaces the existing condition of the same type in place.
///
/// The heartbeat is always stamped with `now`. The transition time only moves when the status does,
/// otherwise the one already on record is kept.
pub fn upsert_condition(conditions: &mut Vec<NodeCondition>, mut condition: NodeCondition, now: DateTime<Utc>) {
    let now = format_time(now);
    let index: HashMap<&str, usize> = conditions
        .iter()
        .enumerate()
        .map(|(position, existing)| (existing.condition_type.as_str(), position))
        .collect();

    condition.last_heartbeat_time = Some(now.clone());

    match index.get(condition.condition_type.as_str()).copied() {
        Some(position) => {
            let existing = &conditions[position];
            condition.last_transition_time = if existing.status == condition.status {
                existing.last_transition_time.clone()
            } else {
                Some(now)
            };
            conditions[position] = condition;
        }
        None => {
            condition.last_transition_time = Some(now);
            conditions.push(condition);
        }
    }
}

/// Upserts a single condition on the stored node through a status patch
pub async fn set_node_condition(store: &dyn NodeStore, node_name: &str, condition: NodeCondition) -> Result<(), NodeError> {
    set_node_condition_at(store, node_name, condition, Utc::now()).await
}

pub(crate) async fn set_node_condition_at(
    store: &dyn NodeStore,
    node_name: &str,
    condition: NodeCondition,
    now: DateTime<Utc>,
) -> Result<(), NodeError> {
    let node = store.get_node(node_name).await?;

    let mut desired = node.clone();
    let condition_type = condition.condition_type.clone();
    upsert_condition(&mut desired.status.conditions, condition, now);

    let (_, patch) = patch_node_status(store, node_name, &node, &desired).await?;
    if patch.is_some() {
        log::info!("set condition {} on node {}", condition_type, node_name);
    }

    Ok(())
}

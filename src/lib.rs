//! Node status helpers for cluster controllers: pick a node's preferred address and move a node's
//! status in etcd from one observed value to another with minimal, version-checked patches.
//!
//! Nothing here retries. Operations that write hand back [`NodeError::Conflict`] when another writer
//! got there first, and the caller decides whether to re-read and try again.

mod address;
mod cidr;
mod condition;
mod error;
mod node;
mod node_store;
mod patch;
pub mod strategic_merge;

pub use address::{get_hostname, get_node_host_ip, get_preferred_address};
pub use cidr::patch_node_cidr;
pub use condition::{set_node_condition, upsert_condition};
pub use error::NodeError;
pub use node::{ConditionStatus, Node, NodeAddress, NodeAddressType, NodeCondition, NodeSpec, NodeStatus, ObjectMeta, LABEL_HOSTNAME};
pub use node_store::{EtcdNodeStore, InMemoryNodeStore, NodeStore};
pub use patch::{apply_node_status_patch, compute_status_patch, patch_node_status, Patch};

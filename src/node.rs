use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::{collections::BTreeMap, fmt::Display, str::FromStr};
use strum_macros::EnumString;

/// Well-known node label carrying the hostname the kubelet registered with
pub const LABEL_HOSTNAME: &str = "kubernetes.io/hostname";

/// Kind of a reported node address. The set is open: cloud providers report types of their own,
/// which are kept verbatim in `Other`.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum NodeAddressType {
    Hostname,
    InternalIp,
    ExternalIp,
    InternalDns,
    ExternalDns,
    Other(String),
}

impl NodeAddressType {
    const KNOWN: [NodeAddressType; 5] = [
        NodeAddressType::Hostname,
        NodeAddressType::InternalIp,
        NodeAddressType::ExternalIp,
        NodeAddressType::InternalDns,
        NodeAddressType::ExternalDns,
    ];

    pub fn as_str(&self) -> &str {
        match self {
            NodeAddressType::Hostname => "Hostname",
            NodeAddressType::InternalIp => "InternalIP",
            NodeAddressType::ExternalIp => "ExternalIP",
            NodeAddressType::InternalDns => "InternalDNS",
            NodeAddressType::ExternalDns => "ExternalDNS",
            NodeAddressType::Other(address_type) => address_type,
        }
    }
}

// The wire form is matched exactly so a stored type is written back byte for byte
impl From<String> for NodeAddressType {
    fn from(address_type: String) -> Self {
        Self::KNOWN
            .into_iter()
            .find(|known| known.as_str() == address_type)
            .unwrap_or(NodeAddressType::Other(address_type))
    }
}

impl From<NodeAddressType> for String {
    fn from(address_type: NodeAddressType) -> Self {
        match address_type {
            NodeAddressType::Other(address_type) => address_type,
            known => known.as_str().to_string(),
        }
    }
}

// Operator input: well-known types in any case, anything else non-empty as a custom type
impl FromStr for NodeAddressType {
    type Err = strum::ParseError;

    fn from_str(address_type: &str) -> Result<Self, Self::Err> {
        if address_type.trim().is_empty() {
            return Err(strum::ParseError::VariantNotFound);
        }

        Ok(Self::KNOWN
            .into_iter()
            .find(|known| known.as_str().eq_ignore_ascii_case(address_type))
            .unwrap_or_else(|| NodeAddressType::Other(address_type.to_string())))
    }
}

impl Display for NodeAddressType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeAddress {
    #[serde(rename = "type")]
    pub address_type: NodeAddressType,
    pub address: String,
}

impl NodeAddress {
    pub fn new(address_type: NodeAddressType, address: &str) -> Self {
        Self {
            address_type,
            address: address.to_string(),
        }
    }
}

// Rendered as {Type address}, the format operators already grep for in node diagnostics
impl Display for NodeAddress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{{{} {}}}", self.address_type, self.address)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize, EnumString, strum_macros::Display)]
#[strum(ascii_case_insensitive)]
pub enum ConditionStatus {
    True,
    False,
    Unknown,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeCondition {
    #[serde(rename = "type")]
    pub condition_type: String,
    pub status: ConditionStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_heartbeat_time: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_transition_time: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl NodeCondition {
    pub fn new(condition_type: &str, status: ConditionStatus) -> Self {
        Self {
            condition_type: condition_type.to_string(),
            status,
            last_heartbeat_time: None,
            last_transition_time: None,
            reason: None,
            message: None,
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct NodeStatus {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub addresses: Vec<NodeAddress>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<NodeCondition>,

    // Everything else the kubelet reports (capacity, nodeInfo, images...) rides along untouched
    #[serde(flatten)]
    pub other: Map<String, Value>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct NodeSpec {
    #[serde(rename = "podCIDR", default, skip_serializing_if = "Option::is_none")]
    pub pod_cidr: Option<String>,

    #[serde(flatten)]
    pub other: Map<String, Value>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ObjectMeta {
    #[serde(default)]
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uid: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource_version: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,

    #[serde(flatten)]
    pub other: Map<String, Value>,
}

/// Local copy of a cluster node record. The store owns the authoritative value.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Node {
    #[serde(default)]
    pub metadata: ObjectMeta,
    #[serde(default)]
    pub spec: NodeSpec,
    #[serde(default)]
    pub status: NodeStatus,

    #[serde(flatten)]
    pub other: Map<String, Value>,
}

impl Node {
    pub fn new(name: &str) -> Self {
        let mut other = Map::new();
        other.insert("apiVersion".to_string(), Value::String("v1".to_string()));
        other.insert("kind".to_string(), Value::String("Node".to_string()));

        Self {
            metadata: ObjectMeta {
                name: name.to_string(),
                ..Default::default()
            },
            other,
            ..Default::default()
        }
    }

    pub fn name(&self) -> &str {
        &self.metadata.name
    }

    pub fn resource_version(&self) -> Option<&str> {
        self.metadata.resource_version.as_deref()
    }
}

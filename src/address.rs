use crate::{
    error::NodeError,
    node::{Node, NodeAddress, NodeAddressType, LABEL_HOSTNAME},
};
use anyhow::{ensure, Context, Result};
use itertools::Itertools;
use std::{ffi::CStr, net::IpAddr};

fn known_addresses(addresses: &[NodeAddress]) -> String {
    format!("[{}]", addresses.iter().join(" "))
}

/// Returns the address of the first preferred type the node reports. Within a type, the node's own
/// report order decides.
///
/// A status-reported Hostname address wins over the hostname label. The label is only consulted
/// when Hostname is preferred and the node reports no Hostname address at all.
pub fn get_preferred_address(node: &Node, preferences: &[NodeAddressType]) -> Result<String, NodeError> {
    for preference in preferences {
        if let Some(address) = node
            .status
            .addresses
            .iter()
            .find(|address| address.address_type == *preference)
        {
            return Ok(address.address.clone());
        }

        if *preference == NodeAddressType::Hostname {
            if let Some(hostname) = node.metadata.labels.get(LABEL_HOSTNAME).filter(|hostname| !hostname.is_empty()) {
                return Ok(hostname.clone());
            }
        }
    }

    Err(NodeError::NotFound(format!(
        "no preferred addresses found; known addresses: {}",
        known_addresses(&node.status.addresses)
    )))
}

/// The IP the node is reached on: first parseable InternalIP, falling back to the first parseable
/// ExternalIP
pub fn get_node_host_ip(node: &Node) -> Result<IpAddr, NodeError> {
    for address_type in [NodeAddressType::InternalIp, NodeAddressType::ExternalIp] {
        let ip = node
            .status
            .addresses
            .iter()
            .filter(|address| address.address_type == address_type)
            .find_map(|address| address.address.parse::<IpAddr>().ok());

        if let Some(ip) = ip {
            return Ok(ip);
        }
    }

    Err(NodeError::NotFound(format!(
        "host IP unknown; known addresses: {}",
        known_addresses(&node.status.addresses)
    )))
}

/// The name a node registers under: the override when given, otherwise the kernel hostname.
/// Normalized to lowercase without surrounding whitespace.
pub fn get_hostname(hostname_override: Option<&str>) -> Result<String> {
    let hostname = match hostname_override.map(str::trim).filter(|hostname| !hostname.is_empty()) {
        Some(hostname) => hostname.to_string(),
        None => kernel_hostname().context("reading kernel hostname")?,
    };

    let hostname = hostname.trim().to_lowercase();
    ensure!(!hostname.is_empty(), "empty hostname is invalid");

    Ok(hostname)
}

fn kernel_hostname() -> Result<String> {
    let mut buffer = [0 as libc::c_char; 256];

    match unsafe { libc::gethostname(buffer.as_mut_ptr(), buffer.len()) } {
        0 => {}
        _ => anyhow::bail!("gethostname failed: {}", std::io::Error::last_os_error()),
    }

    // gethostname does not promise termination on truncation
    buffer[buffer.len() - 1] = 0;

    Ok(unsafe { CStr::from_ptr(buffer.as_ptr()) }.to_string_lossy().to_string())
}

//! Desired DNAT rules derived from the node list.
//!
//! Every node gets its addresses mapped into the node access network: the
//! first two octets come from the configured network, the last two from the
//! node's internal address. Only the address is rewritten, never the port.

use thiserror::Error;

use std::net::Ipv4Addr;

use crate::config::{Config, TranslatedAddresses};
use crate::node::Node;

#[derive(Debug, Error, PartialEq)]
pub enum Error {
    #[error("node {node} has no internal address")]
    NoInternalAddress { node: String },
    #[error("node {node} has an invalid internal address {address}")]
    InvalidInternalAddress { node: String, address: String },
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TranslationRule {
    pub original_address: Ipv4Addr,
    pub original_port: u16,
    pub translated_address: Ipv4Addr,
}

impl TranslationRule {
    pub fn translated_port(&self) -> u16 {
        self.original_port
    }

    /// Rule in `iptables-save` notation for `chain`.
    pub fn render(&self, chain: &str) -> String {
        format!(
            "-A {chain} -d {}/32 -p tcp -m tcp --dport {} -j DNAT --to-destination {}:{}",
            self.original_address,
            self.original_port,
            self.translated_address,
            self.translated_port()
        )
    }
}

/// Kubelet port reported by the node, or `default` if it is missing or not a valid port.
pub fn kubelet_port(node: &Node, default: u16) -> u16 {
    node.kubelet_port
        .filter(|port| *port > 0)
        .and_then(|port| u16::try_from(port).ok())
        .unwrap_or(default)
}

/// Translation rules for a single node, external addresses first.
pub fn node_rules(
    node: &Node,
    network_prefix: [u8; 2],
    default_port: u16,
    selection: TranslatedAddresses,
) -> Result<Vec<TranslationRule>, Error> {
    let port = kubelet_port(node, default_port);
    let internal = node.internal_address().ok_or_else(|| Error::NoInternalAddress {
        node: node.name.clone(),
    })?;
    let internal_ip = internal
        .parse::<Ipv4Addr>()
        .map_err(|_| Error::InvalidInternalAddress {
            node: node.name.clone(),
            address: internal.to_string(),
        })?;
    let [_, _, third, fourth] = internal_ip.octets();
    let translated = Ipv4Addr::new(network_prefix[0], network_prefix[1], third, fourth);

    let mut originals: Vec<Ipv4Addr> = node
        .external_addresses()
        .filter_map(|address| match address.parse::<Ipv4Addr>() {
            Ok(ip) => Some(ip),
            Err(_) => {
                tracing::debug!(%node, %address, "skipping non IPv4 external address");
                None
            }
        })
        .collect();
    if selection == TranslatedAddresses::All || originals.is_empty() {
        originals.push(internal_ip);
    }

    Ok(originals
        .into_iter()
        .map(|original_address| TranslationRule {
            original_address,
            original_port: port,
            translated_address: translated,
        })
        .collect())
}

/// Sorted rule lines for all nodes. Nodes that cannot be translated are logged and skipped.
pub fn desired_rules(nodes: &[Node], config: &Config) -> Vec<String> {
    let network_prefix = config.network_prefix();
    let mut rules: Vec<String> = nodes
        .iter()
        .filter_map(|node| {
            match node_rules(
                node,
                network_prefix,
                config.default_kubelet_port,
                config.translated_addresses,
            ) {
                Ok(rules) => Some(rules),
                Err(error) => {
                    tracing::warn!(%error, "skipping node while computing DNAT rules");
                    None
                }
            }
        })
        .flatten()
        .map(|rule| rule.render(&config.chain_name))
        .collect();
    rules.sort();
    rules
}

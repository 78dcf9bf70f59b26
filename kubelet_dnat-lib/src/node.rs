//! Cluster node model as seen by the DNAT controller.
//!
//! Nodes are read-only input: the controller lists them on every
//! reconciliation and watches them only to decide when to reconcile.

use async_trait::async_trait;
use k8s_openapi::api::core::v1::Node as CoreNode;
use thiserror::Error;

use std::collections::HashMap;
use std::fmt::{self, Display};

pub mod kubernetes;

#[derive(Debug, Error)]
pub enum Error {
    #[error("kubernetes api error: {0}")]
    Kube(#[from] kube::Error),
    #[error("node listing failed: {0}")]
    Listing(String),
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum AddressKind {
    InternalIp,
    ExternalIp,
    /// Hostnames and DNS entries, kept so address comparisons stay exact.
    Other(String),
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NodeAddress {
    pub kind: AddressKind,
    pub address: String,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Node {
    pub name: String,
    pub addresses: Vec<NodeAddress>,
    /// Port advertised in the node status, not validated.
    pub kubelet_port: Option<i32>,
}

/// On-demand access to the current node list.
#[async_trait]
pub trait NodeLister: Send + Sync {
    async fn list_nodes(&self) -> Result<Vec<Node>, Error>;
}

/// Change notification for a single node.
#[derive(Clone, Debug, PartialEq)]
pub enum NodeEvent {
    Added(Node),
    Updated { old: Node, new: Node },
    Removed(Node),
}

impl AddressKind {
    fn from_type(type_: &str) -> Self {
        match type_ {
            "InternalIP" => AddressKind::InternalIp,
            "ExternalIP" => AddressKind::ExternalIp,
            other => AddressKind::Other(other.to_string()),
        }
    }
}

impl NodeAddress {
    pub fn internal(address: &str) -> Self {
        NodeAddress {
            kind: AddressKind::InternalIp,
            address: address.to_string(),
        }
    }

    pub fn external(address: &str) -> Self {
        NodeAddress {
            kind: AddressKind::ExternalIp,
            address: address.to_string(),
        }
    }
}

impl Node {
    pub fn new(name: &str, addresses: Vec<NodeAddress>) -> Self {
        Node {
            name: name.to_string(),
            addresses,
            kubelet_port: None,
        }
    }

    pub fn with_kubelet_port(mut self, port: i32) -> Self {
        self.kubelet_port = Some(port);
        self
    }

    /// First address reported as `InternalIP`.
    pub fn internal_address(&self) -> Option<&str> {
        self.addresses
            .iter()
            .find(|a| a.kind == AddressKind::InternalIp)
            .map(|a| a.address.as_str())
    }

    pub fn external_addresses(&self) -> impl Iterator<Item = &str> {
        self.addresses
            .iter()
            .filter(|a| a.kind == AddressKind::ExternalIp)
            .map(|a| a.address.as_str())
    }
}

impl From<&CoreNode> for Node {
    fn from(node: &CoreNode) -> Self {
        let status = node.status.as_ref();
        let addresses = status
            .and_then(|s| s.addresses.as_ref())
            .map(|addrs| {
                addrs
                    .iter()
                    .map(|a| NodeAddress {
                        kind: AddressKind::from_type(&a.type_),
                        address: a.address.clone(),
                    })
                    .collect()
            })
            .unwrap_or_default();
        let kubelet_port = status
            .and_then(|s| s.daemon_endpoints.as_ref())
            .and_then(|d| d.kubelet_endpoint.as_ref())
            .map(|e| e.port);

        Node {
            name: node.metadata.name.clone().unwrap_or_default(),
            addresses,
            kubelet_port,
        }
    }
}

impl Display for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name)
    }
}

impl NodeEvent {
    /// Additions and removals always reconcile, updates only when the address list changed.
    pub fn triggers_reconcile(&self) -> bool {
        match self {
            NodeEvent::Added(_) | NodeEvent::Removed(_) => true,
            NodeEvent::Updated { old, new } => old.addresses != new.addresses,
        }
    }

    pub fn node(&self) -> &Node {
        match self {
            NodeEvent::Added(node) | NodeEvent::Removed(node) => node,
            NodeEvent::Updated { new, .. } => new,
        }
    }
}

/// Turns the snapshot style watch stream into add/update/remove events.
///
/// The watch API only delivers the current object, so the tracker keeps the
/// last seen version of every node to derive `Updated { old, new }`. A relist
/// (`begin_relist` .. `finish_relist`) is diffed against the previous snapshot.
#[derive(Debug, Default)]
pub struct NodeTracker {
    known: HashMap<String, Node>,
    relist: Option<HashMap<String, Node>>,
}

impl NodeTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn applied(&mut self, node: Node) -> NodeEvent {
        match self.known.insert(node.name.clone(), node.clone()) {
            Some(old) => NodeEvent::Updated { old, new: node },
            None => NodeEvent::Added(node),
        }
    }

    pub fn deleted(&mut self, node: Node) -> NodeEvent {
        self.known.remove(&node.name);
        NodeEvent::Removed(node)
    }

    pub fn begin_relist(&mut self) {
        self.relist = Some(HashMap::new());
    }

    pub fn relisted(&mut self, node: Node) {
        self.relist
            .get_or_insert_with(HashMap::new)
            .insert(node.name.clone(), node);
    }

    pub fn finish_relist(&mut self) -> Vec<NodeEvent> {
        let fresh = self.relist.take().unwrap_or_default();
        let mut previous = std::mem::take(&mut self.known);
        let mut events = Vec::new();

        for (name, node) in fresh.iter() {
            match previous.remove(name) {
                Some(old) if old == *node => (),
                Some(old) => events.push(NodeEvent::Updated {
                    old,
                    new: node.clone(),
                }),
                None => events.push(NodeEvent::Added(node.clone())),
            }
        }
        events.extend(previous.into_values().map(NodeEvent::Removed));

        self.known = fresh;
        events
    }

    pub fn len(&self) -> usize {
        self.known.len()
    }

    pub fn is_empty(&self) -> bool {
        self.known.is_empty()
    }
}

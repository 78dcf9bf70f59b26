//! Stateful mocks for the kernel and node source abstractions.
//!
//! [`MockIptablesOps`] keeps a NAT table as a list of `iptables-save` lines and
//! applies inserts and restores to it, so tests can assert on the resulting
//! table instead of call sequences.
//!
//! All mocks use `Arc<Mutex<_>>` for interior mutability in async contexts.

#![cfg(test)]

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use crate::iptables::{Error, IptablesOps};
use crate::node::{self, Node, NodeLister};

// ============================================================================
// MockIptablesOps
// ============================================================================

#[derive(Debug, Default)]
pub struct IptablesState {
    /// NAT table rule lines, `-A <chain> <spec>`.
    pub lines: Vec<String>,
    /// Number of successful inserts and restores.
    pub mutations: usize,
    pub saves: usize,
    /// Map of operation name -> error message. If set, the operation will fail.
    pub fail_on: HashMap<String, String>,
}

impl IptablesState {
    fn check_fail(&self, op: &str) -> Result<(), Error> {
        if let Some(msg) = self.fail_on.get(op) {
            Err(Error::General(msg.clone()))
        } else {
            Ok(())
        }
    }

    pub fn chain_rules(&self, chain: &str) -> Vec<String> {
        let prefix = format!("-A {chain} ");
        self.lines
            .iter()
            .filter(|l| l.starts_with(&prefix))
            .cloned()
            .collect()
    }
}

#[derive(Clone)]
pub struct MockIptablesOps {
    pub state: Arc<Mutex<IptablesState>>,
}

impl MockIptablesOps {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(IptablesState::default())),
        }
    }

    pub fn with_state(state: IptablesState) -> Self {
        Self {
            state: Arc::new(Mutex::new(state)),
        }
    }
}

#[async_trait]
impl IptablesOps for MockIptablesOps {
    async fn save_nat(&self) -> Result<String, Error> {
        let mut s = self.state.lock().unwrap();
        s.check_fail("save_nat")?;
        s.saves += 1;

        let mut dump = vec!["*nat".to_string()];
        dump.extend(s.lines.iter().cloned());
        dump.push("COMMIT".to_string());
        Ok(dump.join("\n"))
    }

    async fn insert_rule(&self, chain: &str, rule: &str) -> Result<(), Error> {
        let mut s = self.state.lock().unwrap();
        s.check_fail("insert_rule")?;
        s.lines.insert(0, format!("-A {chain} {rule}"));
        s.mutations += 1;
        Ok(())
    }

    async fn restore_nat(&self, payload: &str) -> Result<(), Error> {
        let mut s = self.state.lock().unwrap();
        s.check_fail("restore_nat")?;

        let declared: Vec<String> = payload
            .lines()
            .filter_map(|l| l.strip_prefix(':'))
            .filter_map(|l| l.split_whitespace().next())
            .map(str::to_string)
            .collect();
        // declared chains are flushed, everything else stays (--noflush)
        s.lines.retain(|line| {
            !declared
                .iter()
                .any(|chain| line.starts_with(&format!("-A {chain} ")))
        });
        s.lines
            .extend(payload.lines().filter(|l| l.starts_with("-A ")).map(str::to_string));
        s.mutations += 1;
        Ok(())
    }
}

// ============================================================================
// MockNodeLister
// ============================================================================

#[derive(Debug, Default)]
pub struct NodeListerState {
    pub nodes: Vec<Node>,
    pub fail_with: Option<String>,
    pub calls: usize,
}

#[derive(Clone)]
pub struct MockNodeLister {
    pub state: Arc<Mutex<NodeListerState>>,
}

impl MockNodeLister {
    pub fn with_nodes(nodes: Vec<Node>) -> Self {
        Self {
            state: Arc::new(Mutex::new(NodeListerState {
                nodes,
                ..Default::default()
            })),
        }
    }

    pub fn failing(msg: &str) -> Self {
        Self {
            state: Arc::new(Mutex::new(NodeListerState {
                fail_with: Some(msg.to_string()),
                ..Default::default()
            })),
        }
    }

    pub fn set_nodes(&self, nodes: Vec<Node>) {
        self.state.lock().unwrap().nodes = nodes;
    }
}

#[async_trait]
impl NodeLister for MockNodeLister {
    async fn list_nodes(&self) -> Result<Vec<Node>, node::Error> {
        let mut s = self.state.lock().unwrap();
        s.calls += 1;
        match &s.fail_with {
            Some(msg) => Err(node::Error::Listing(msg.clone())),
            None => Ok(s.nodes.clone()),
        }
    }
}

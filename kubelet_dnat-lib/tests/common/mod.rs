use async_trait::async_trait;
use kubelet_dnat_lib::iptables::{Error, IptablesOps};
use kubelet_dnat_lib::node::{self, Node, NodeAddress, NodeLister};

use std::sync::{Arc, Mutex};

/// NAT table kept as `iptables-save` lines, with every kernel call recorded.
#[derive(Clone, Default)]
pub struct FakeNatTable {
    pub lines: Arc<Mutex<Vec<String>>>,
    pub calls: Arc<Mutex<Vec<String>>>,
}

impl FakeNatTable {
    pub fn with_lines(lines: &[&str]) -> Self {
        let table = Self::default();
        table
            .lines
            .lock()
            .unwrap()
            .extend(lines.iter().map(|l| l.to_string()));
        table
    }

    pub fn mutating_calls(&self) -> usize {
        self.calls.lock().unwrap().iter().filter(|c| *c != "save").count()
    }
}

#[async_trait]
impl IptablesOps for FakeNatTable {
    async fn save_nat(&self) -> Result<String, Error> {
        self.calls.lock().unwrap().push("save".to_string());
        let lines = self.lines.lock().unwrap();
        Ok(format!("*nat\n{}\nCOMMIT", lines.join("\n")))
    }

    async fn insert_rule(&self, chain: &str, rule: &str) -> Result<(), Error> {
        self.calls.lock().unwrap().push(format!("insert {chain}"));
        self.lines.lock().unwrap().insert(0, format!("-A {chain} {rule}"));
        Ok(())
    }

    async fn restore_nat(&self, payload: &str) -> Result<(), Error> {
        self.calls.lock().unwrap().push("restore".to_string());
        let chain = payload
            .lines()
            .find_map(|l| l.strip_prefix(':'))
            .and_then(|l| l.split_whitespace().next())
            .ok_or_else(|| Error::General("payload declares no chain".to_string()))?
            .to_string();
        let prefix = format!("-A {chain} ");
        let mut lines = self.lines.lock().unwrap();
        lines.retain(|l| !l.starts_with(&prefix));
        lines.extend(payload.lines().filter(|l| l.starts_with("-A ")).map(str::to_string));
        Ok(())
    }
}

#[derive(Clone, Default)]
pub struct FakeNodes {
    pub nodes: Arc<Mutex<Vec<Node>>>,
}

impl FakeNodes {
    pub fn new(nodes: Vec<Node>) -> Self {
        Self {
            nodes: Arc::new(Mutex::new(nodes)),
        }
    }
}

#[async_trait]
impl NodeLister for FakeNodes {
    async fn list_nodes(&self) -> Result<Vec<Node>, node::Error> {
        Ok(self.nodes.lock().unwrap().clone())
    }
}

/// Three worker nodes, two of them with an external address.
pub fn create_test_nodes() -> Vec<Node> {
    vec![
        Node::new(
            "worker-1",
            vec![NodeAddress::internal("10.1.1.11"), NodeAddress::external("192.0.2.101")],
        ),
        Node::new("worker-2", vec![NodeAddress::internal("10.1.1.12")]),
        Node::new(
            "worker-3",
            vec![NodeAddress::internal("10.1.1.13"), NodeAddress::external("192.0.2.103")],
        ),
    ]
}

//! One reconciliation pass: desired rules from the node list, actual rules
//! from the kernel, an atomic chain replace when they diverge and the two
//! base rules that wire the chain into the packet path.

use async_trait::async_trait;
use thiserror::Error;

use crate::config::Config;
use crate::iptables::{self, ChainState, IptablesOps};
use crate::node::{self, NodeLister};
use crate::rules;

/// Every variant is transient, the pass is retried with backoff.
#[derive(Debug, Error)]
pub enum Error {
    #[error("listing nodes failed: {0}")]
    Nodes(#[from] node::Error),
    #[error(transparent)]
    Iptables(#[from] iptables::Error),
}

/// Kernel mutations performed by a pass.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Outcome {
    pub desired_rules: usize,
    pub chain_replaced: bool,
    pub jump_rule_inserted: bool,
    pub masquerade_rule_inserted: bool,
}

impl Outcome {
    pub fn mutated(&self) -> bool {
        self.chain_replaced || self.jump_rule_inserted || self.masquerade_rule_inserted
    }
}

#[async_trait]
pub trait Reconcile: Send + Sync {
    async fn reconcile(&self) -> Result<Outcome, Error>;
}

pub struct Reconciler<N, I> {
    config: Config,
    nodes: N,
    iptables: I,
}

impl<N, I> Reconciler<N, I>
where
    N: NodeLister,
    I: IptablesOps,
{
    pub fn new(config: Config, nodes: N, iptables: I) -> Self {
        Self { config, nodes, iptables }
    }

    async fn actual_state(&self) -> Result<ChainState, Error> {
        let dump = self.iptables.save_nat().await?;
        Ok(ChainState::from_dump(
            &dump,
            &self.config.chain_name,
            &self.config.vpn_interface,
        ))
    }

    async fn replace_chain(&self, desired: &[String]) -> Result<(), Error> {
        let payload = iptables::restore_payload(&self.config.chain_name, desired);
        self.iptables.restore_nat(&payload).await?;
        tracing::info!(chain = %self.config.chain_name, rules = desired.len(), "replaced DNAT chain");
        Ok(())
    }

    async fn ensure_base_rules(&self, desired: &[String], actual: &ChainState, outcome: &mut Outcome) -> Result<(), Error> {
        // an empty chain does not need to be wired in
        if !desired.is_empty() && !actual.has_jump_rule {
            self.iptables
                .insert_rule(iptables::OUTPUT_CHAIN, &iptables::jump_rule(&self.config.chain_name))
                .await?;
            tracing::info!(chain = %self.config.chain_name, "inserted jump rule into OUTPUT");
            outcome.jump_rule_inserted = true;
        }

        if !actual.has_masquerade_rule {
            self.iptables
                .insert_rule(
                    iptables::POSTROUTING_CHAIN,
                    &iptables::masquerade_rule(&self.config.vpn_interface),
                )
                .await?;
            tracing::info!(interface = %self.config.vpn_interface, "inserted masquerade rule into POSTROUTING");
            outcome.masquerade_rule_inserted = true;
        }
        Ok(())
    }
}

#[async_trait]
impl<N, I> Reconcile for Reconciler<N, I>
where
    N: NodeLister,
    I: IptablesOps,
{
    async fn reconcile(&self) -> Result<Outcome, Error> {
        let nodes = self.nodes.list_nodes().await?;
        let desired = rules::desired_rules(&nodes, &self.config);
        let actual = self.actual_state().await?;

        let mut outcome = Outcome {
            desired_rules: desired.len(),
            ..Default::default()
        };

        if desired != actual.rules {
            tracing::debug!(desired = ?desired, actual = ?actual.rules, "DNAT rules differ");
            self.replace_chain(&desired).await?;
            outcome.chain_replaced = true;
        }

        self.ensure_base_rules(&desired, &actual, &mut outcome).await?;
        Ok(outcome)
    }
}

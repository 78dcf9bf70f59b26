//! NAT table access through the iptables command line tools.
//!
//! Defines [`IptablesOps`] covering the three kernel interactions of the
//! controller: dumping the NAT table, inserting a single rule and atomically
//! restoring the managed chain. Production code uses [`RealIptablesOps`],
//! tests use stateful mocks.

use async_trait::async_trait;
use thiserror::Error;
use tokio::process::Command;

use crate::shell_command_ext::{self, Logs, ShellCommandExt};

const NAT_TABLE: &str = "nat";
pub const OUTPUT_CHAIN: &str = "OUTPUT";
pub const POSTROUTING_CHAIN: &str = "POSTROUTING";

#[derive(Debug, Error)]
pub enum Error {
    #[error("reading NAT table failed: {0}")]
    Save(#[source] shell_command_ext::Error),
    #[error("inserting rule into {chain} failed: {source}")]
    Insert {
        chain: String,
        #[source]
        source: shell_command_ext::Error,
    },
    #[error("restoring chain failed: {0}")]
    Restore(#[source] shell_command_ext::Error),
    #[error("{0} is not available: {1}")]
    ToolMissing(&'static str, #[source] shell_command_ext::Error),
    #[error("{0}")]
    General(String),
}

/// Abstraction over the iptables binaries, restricted to the NAT table.
#[async_trait]
pub trait IptablesOps: Send + Sync {
    /// Full NAT table dump in `iptables-save` notation.
    async fn save_nat(&self) -> Result<String, Error>;

    /// Insert `rule` at the head of the built-in `chain`.
    async fn insert_rule(&self, chain: &str, rule: &str) -> Result<(), Error>;

    /// Load `payload` without flushing chains it does not declare.
    async fn restore_nat(&self, payload: &str) -> Result<(), Error>;
}

/// Production [`IptablesOps`] that runs `iptables`, `iptables-save` and `iptables-restore`.
#[derive(Clone, Debug, Default)]
pub struct RealIptablesOps;

#[async_trait]
impl IptablesOps for RealIptablesOps {
    async fn save_nat(&self) -> Result<String, Error> {
        Command::new("iptables-save")
            .arg("-t")
            .arg(NAT_TABLE)
            .run_stdout(Logs::Print)
            .await
            .map_err(Error::Save)
    }

    async fn insert_rule(&self, chain: &str, rule: &str) -> Result<(), Error> {
        Command::new("iptables")
            .arg("-t")
            .arg(NAT_TABLE)
            .arg("-I")
            .arg(chain)
            .args(rule.split_whitespace())
            .run_stdout(Logs::Print)
            .await
            .map_err(|source| Error::Insert {
                chain: chain.to_string(),
                source,
            })?;
        Ok(())
    }

    async fn restore_nat(&self, payload: &str) -> Result<(), Error> {
        Command::new("iptables-restore")
            .arg("--noflush")
            .arg("--table")
            .arg(NAT_TABLE)
            .run_with_stdin(payload, Logs::Print)
            .await
            .map_err(Error::Restore)?;
        Ok(())
    }
}

/// Checks that every iptables binary the controller relies on can be executed.
pub async fn available() -> Result<(), Error> {
    for tool in ["iptables", "iptables-save", "iptables-restore"] {
        Command::new(tool)
            .arg("--version")
            .run_stdout(Logs::Suppress)
            .await
            .map_err(|e| Error::ToolMissing(tool, e))?;
    }
    Ok(())
}

/// Spec of the rule that routes locally generated traffic into the managed chain.
pub fn jump_rule(chain: &str) -> String {
    format!("-j {chain}")
}

/// Spec of the rule that masquerades traffic leaving through the VPN interface.
pub fn masquerade_rule(vpn_interface: &str) -> String {
    format!("-o {vpn_interface} -j MASQUERADE")
}

/// The part of the NAT table owned by the controller.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ChainState {
    /// Rule lines of the managed chain, sorted.
    pub rules: Vec<String>,
    pub has_jump_rule: bool,
    pub has_masquerade_rule: bool,
}

impl ChainState {
    /// Reduces an `iptables-save` dump to the managed chain and the two base rules.
    pub fn from_dump(dump: &str, chain: &str, vpn_interface: &str) -> Self {
        let chain_prefix = format!("-A {chain} ");
        let jump_line = format!("-A {OUTPUT_CHAIN} {}", jump_rule(chain));
        let masquerade_line = format!("-A {POSTROUTING_CHAIN} {}", masquerade_rule(vpn_interface));

        let mut state = ChainState::default();
        for line in dump.lines().map(str::trim) {
            if line.starts_with(&chain_prefix) {
                state.rules.push(line.to_string());
            } else if line == jump_line {
                state.has_jump_rule = true;
            } else if line == masquerade_line {
                state.has_masquerade_rule = true;
            }
        }
        state.rules.sort();
        state
    }
}

/// `iptables-restore` input that declares (and thereby flushes) `chain` and repopulates it with `rules`.
pub fn restore_payload(chain: &str, rules: &[String]) -> String {
    let mut payload = format!("*{NAT_TABLE}\n:{chain} - [0:0]\n");
    for rule in rules {
        payload.push_str(rule);
        payload.push('\n');
    }
    payload.push_str("COMMIT\n");
    payload
}

use cidr::Ipv4Cidr;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::fs;

use std::net::Ipv4Addr;
use std::path::Path;
use std::time::Duration;

pub const ENV_VAR: &str = "KUBELET_DNAT_CONFIG_PATH";

pub const DEFAULT_CHAIN_NAME: &str = "node-access-dnat";
pub const DEFAULT_VPN_INTERFACE: &str = "tun0";
pub const DEFAULT_KUBELET_PORT: u16 = 10250;
pub const DEFAULT_RESYNC_INTERVAL: Duration = Duration::from_secs(30);

const SUPPORTED_VERSION: i64 = 1;
// iptables limits chain names to 28 characters
const MAX_CHAIN_NAME_LEN: usize = 28;
// IFNAMSIZ minus the trailing NUL
const MAX_INTERFACE_NAME_LEN: usize = 15;
// restoring one of these would flush the built-in chain
const BUILTIN_NAT_CHAINS: [&str; 4] = ["PREROUTING", "INPUT", "OUTPUT", "POSTROUTING"];
const KNOWN_KEYS: [&str; 7] = [
    "version",
    "chain_name",
    "node_access_network",
    "vpn_interface",
    "default_kubelet_port",
    "resync_interval",
    "translated_addresses",
];

/// Which node addresses receive a DNAT rule.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TranslatedAddresses {
    /// Every external address, or the internal address if the node has no external one.
    #[default]
    ExternalOrInternal,
    /// Every external address plus the internal address.
    All,
}

#[derive(Clone, Debug, PartialEq)]
pub struct Config {
    pub chain_name: String,
    pub node_access_network: Ipv4Cidr,
    pub vpn_interface: String,
    pub default_kubelet_port: u16,
    pub resync_interval: Duration,
    pub translated_addresses: TranslatedAddresses,
}

/// Values taken from the command line, each one replacing the configured value when present.
#[derive(Clone, Debug, Default)]
pub struct Overrides {
    pub chain_name: Option<String>,
    pub node_access_network: Option<Ipv4Cidr>,
    pub vpn_interface: Option<String>,
    pub default_kubelet_port: Option<u16>,
    pub resync_interval: Option<Duration>,
    pub translated_addresses: Option<TranslatedAddresses>,
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("configuration file not found")]
    NoFile,
    #[error("unable to determine configuration version")]
    VersionNotFound,
    #[error("unsupported config version: {0}")]
    VersionMismatch(i64),
    #[error("io error: {0}")]
    IO(#[from] std::io::Error),
    #[error("deserialization error: {0}")]
    TomlDeserialization(#[from] toml::de::Error),
    #[error("chain name must not be empty")]
    EmptyChainName,
    #[error("chain name {0} exceeds 28 characters")]
    ChainNameTooLong(String),
    #[error("chain name {0:?} contains whitespace")]
    ChainNameWhitespace(String),
    #[error("chain name {0} is a built-in nat chain")]
    BuiltinChainName(String),
    #[error("vpn interface name must not be empty")]
    EmptyInterface,
    #[error("vpn interface name {0} exceeds 15 characters")]
    InterfaceTooLong(String),
    #[error("vpn interface name {0:?} contains whitespace")]
    InterfaceWhitespace(String),
    #[error("default kubelet port must not be 0")]
    ZeroKubeletPort,
    #[error("resync interval must not be zero")]
    ZeroResyncInterval,
}

#[derive(Clone, Debug, Deserialize)]
struct ConfigFile {
    chain_name: Option<String>,
    node_access_network: Option<Ipv4Cidr>,
    vpn_interface: Option<String>,
    default_kubelet_port: Option<u16>,
    #[serde(default, with = "humantime_serde::option")]
    resync_interval: Option<Duration>,
    translated_addresses: Option<TranslatedAddresses>,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            chain_name: DEFAULT_CHAIN_NAME.to_string(),
            node_access_network: default_node_access_network(),
            vpn_interface: DEFAULT_VPN_INTERFACE.to_string(),
            default_kubelet_port: DEFAULT_KUBELET_PORT,
            resync_interval: DEFAULT_RESYNC_INTERVAL,
            translated_addresses: TranslatedAddresses::default(),
        }
    }
}

fn default_node_access_network() -> Ipv4Cidr {
    // 10.254.0.0/16 is a valid network, host bits are zero
    match Ipv4Cidr::new(Ipv4Addr::new(10, 254, 0, 0), 16) {
        Ok(cidr) => cidr,
        Err(_) => unreachable!("static node access network is valid"),
    }
}

impl Config {
    pub fn with_overrides(self, overrides: Overrides) -> Self {
        Config {
            chain_name: overrides.chain_name.unwrap_or(self.chain_name),
            node_access_network: overrides.node_access_network.unwrap_or(self.node_access_network),
            vpn_interface: overrides.vpn_interface.unwrap_or(self.vpn_interface),
            default_kubelet_port: overrides.default_kubelet_port.unwrap_or(self.default_kubelet_port),
            resync_interval: overrides.resync_interval.unwrap_or(self.resync_interval),
            translated_addresses: overrides.translated_addresses.unwrap_or(self.translated_addresses),
        }
    }

    pub fn validate(&self) -> Result<(), Error> {
        if self.chain_name.is_empty() {
            return Err(Error::EmptyChainName);
        }
        if self.chain_name.len() > MAX_CHAIN_NAME_LEN {
            return Err(Error::ChainNameTooLong(self.chain_name.clone()));
        }
        if self.chain_name.chars().any(char::is_whitespace) {
            return Err(Error::ChainNameWhitespace(self.chain_name.clone()));
        }
        if BUILTIN_NAT_CHAINS.contains(&self.chain_name.as_str()) {
            return Err(Error::BuiltinChainName(self.chain_name.clone()));
        }
        if self.vpn_interface.is_empty() {
            return Err(Error::EmptyInterface);
        }
        if self.vpn_interface.len() > MAX_INTERFACE_NAME_LEN {
            return Err(Error::InterfaceTooLong(self.vpn_interface.clone()));
        }
        if self.vpn_interface.chars().any(char::is_whitespace) {
            return Err(Error::InterfaceWhitespace(self.vpn_interface.clone()));
        }
        if self.default_kubelet_port == 0 {
            return Err(Error::ZeroKubeletPort);
        }
        if self.resync_interval.is_zero() {
            return Err(Error::ZeroResyncInterval);
        }
        Ok(())
    }

    /// First two octets of the node access network.
    pub fn network_prefix(&self) -> [u8; 2] {
        let octets = self.node_access_network.first_address().octets();
        [octets[0], octets[1]]
    }
}

pub async fn read(path: &Path) -> Result<Config, Error> {
    let content = fs::read_to_string(path).await.map_err(|e| {
        if e.kind() == std::io::ErrorKind::NotFound {
            Error::NoFile
        } else {
            Error::IO(e)
        }
    })?;
    parse(&content)
}

fn parse(content: &str) -> Result<Config, Error> {
    let table = content.parse::<toml::Table>()?;
    let version = table
        .get("version")
        .and_then(|v| v.as_integer())
        .ok_or(Error::VersionNotFound)?;
    if version != SUPPORTED_VERSION {
        return Err(Error::VersionMismatch(version));
    }

    for key in table.keys().filter(|k| !KNOWN_KEYS.contains(&k.as_str())) {
        tracing::warn!(%key, "ignoring unsupported key in configuration file");
    }

    let file = toml::from_str::<ConfigFile>(content)?;
    let defaults = Config::default();
    Ok(Config {
        chain_name: file.chain_name.unwrap_or(defaults.chain_name),
        node_access_network: file.node_access_network.unwrap_or(defaults.node_access_network),
        vpn_interface: file.vpn_interface.unwrap_or(defaults.vpn_interface),
        default_kubelet_port: file.default_kubelet_port.unwrap_or(defaults.default_kubelet_port),
        resync_interval: file.resync_interval.unwrap_or(defaults.resync_interval),
        translated_addresses: file.translated_addresses.unwrap_or(defaults.translated_addresses),
    })
}

use cidr::Ipv4Cidr;
use clap::{Parser, ValueEnum};

use std::path::PathBuf;
use std::time::Duration;

use kubelet_dnat_lib::config::{self, Overrides, TranslatedAddresses};
use kubelet_dnat_lib::logging::LogFormat;

/// Keeps the node access DNAT chain in sync with the cluster's nodes
#[derive(Clone, Debug, Parser)]
#[command(version)]
pub struct Cli {
    /// Optional TOML configuration file, command line values take precedence
    #[arg(short, long, env = config::ENV_VAR)]
    pub config_path: Option<PathBuf>,

    /// Path to a single kubeconfig file, without it the in-cluster or KUBECONFIG discovery applies
    #[arg(long, env = "KUBELET_DNAT_KUBECONFIG")]
    pub kubeconfig: Option<PathBuf>,

    /// Kubernetes API server address, overrides the one in the kubeconfig
    #[arg(long)]
    pub master: Option<String>,

    /// Name of the NAT chain managed by this controller
    #[arg(long, env = "KUBELET_DNAT_CHAIN_NAME")]
    pub chain_name: Option<String>,

    /// Network the node addresses are translated into, only the first two octets are used
    #[arg(long, env = "KUBELET_DNAT_NODE_ACCESS_NETWORK")]
    pub node_access_network: Option<Ipv4Cidr>,

    /// Interface of the VPN tunnel into the user cluster
    #[arg(long, env = "KUBELET_DNAT_VPN_INTERFACE")]
    pub vpn_interface: Option<String>,

    /// Kubelet port used when a node does not advertise one
    #[arg(long, env = "KUBELET_DNAT_DEFAULT_KUBELET_PORT")]
    pub default_kubelet_port: Option<u16>,

    /// Interval of the unconditional resync, e.g. "30s" or "2m"
    #[arg(long, env = "KUBELET_DNAT_RESYNC_INTERVAL", value_parser = humantime::parse_duration)]
    pub resync_interval: Option<Duration>,

    /// Which node addresses get a DNAT rule
    #[arg(long, value_enum)]
    pub translated_addresses: Option<AddressSelection>,

    /// Log output format: console or json
    #[arg(long, env = "KUBELET_DNAT_LOG_FORMAT", default_value_t = LogFormat::Console)]
    pub log_format: LogFormat,

    /// Log at debug level unless RUST_LOG says otherwise
    #[arg(long)]
    pub log_debug: bool,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
pub enum AddressSelection {
    ExternalOrInternal,
    All,
}

pub fn parse() -> Cli {
    Cli::parse()
}

impl From<AddressSelection> for TranslatedAddresses {
    fn from(selection: AddressSelection) -> Self {
        match selection {
            AddressSelection::ExternalOrInternal => TranslatedAddresses::ExternalOrInternal,
            AddressSelection::All => TranslatedAddresses::All,
        }
    }
}

impl From<&Cli> for Overrides {
    fn from(cli: &Cli) -> Self {
        Overrides {
            chain_name: cli.chain_name.clone(),
            node_access_network: cli.node_access_network,
            vpn_interface: cli.vpn_interface.clone(),
            default_kubelet_port: cli.default_kubelet_port,
            resync_interval: cli.resync_interval,
            translated_addresses: cli.translated_addresses.map(Into::into),
        }
    }
}

use kube::Client;
use kube::config::{KubeConfigOptions, Kubeconfig};
use tokio::signal::unix::{SignalKind, signal};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use std::process;

use kubelet_dnat_lib::config::{self, Config, Overrides};
use kubelet_dnat_lib::controller::{Controller, pending_slot};
use kubelet_dnat_lib::iptables::{self, RealIptablesOps};
use kubelet_dnat_lib::logging;
use kubelet_dnat_lib::node::kubernetes::{self, KubeNodes};
use kubelet_dnat_lib::reconcile::Reconciler;

mod cli;

// Avoid musl's default allocator due to degraded performance
// https://nickb.dev/blog/default-musl-allocator-considered-harmful-to-performance
#[cfg(target_os = "linux")]
#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

/// Forwards SIGINT and SIGTERM into one channel, naming the signal received.
fn signal_channel() -> Result<mpsc::Receiver<&'static str>, exitcode::ExitCode> {
    let (sender, receiver) = mpsc::channel(4);
    for (kind, name) in [(SignalKind::interrupt(), "SIGINT"), (SignalKind::terminate(), "SIGTERM")] {
        let mut stream = signal(kind).map_err(|err| {
            tracing::error!(error = ?err, signal = name, "error setting up signal handler");
            exitcode::IOERR
        })?;
        let sender = sender.clone();
        tokio::spawn(async move {
            while stream.recv().await.is_some() {
                if sender.send(name).await.is_err() {
                    break;
                }
            }
        });
    }
    Ok(receiver)
}

async fn load_config(args: &cli::Cli) -> Result<Config, exitcode::ExitCode> {
    let base = match &args.config_path {
        Some(path) => config::read(path).await.map_err(|err| {
            tracing::error!(error = %err, path = %path.display(), "error reading configuration file");
            exitcode::CONFIG
        })?,
        None => Config::default(),
    };
    let config = base.with_overrides(Overrides::from(args));
    config.validate().map_err(|err| {
        tracing::error!(error = %err, "invalid configuration");
        exitcode::CONFIG
    })?;
    Ok(config)
}

async fn kube_client(args: &cli::Cli) -> Result<Client, exitcode::ExitCode> {
    let mut kube_config = match &args.kubeconfig {
        Some(path) => {
            let kubeconfig = Kubeconfig::read_from(path).map_err(|err| {
                tracing::error!(error = %err, path = %path.display(), "error reading kubeconfig");
                exitcode::NOINPUT
            })?;
            kube::Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default())
                .await
                .map_err(|err| {
                    tracing::error!(error = %err, "error loading kubeconfig");
                    exitcode::CONFIG
                })?
        }
        None => kube::Config::infer().await.map_err(|err| {
            tracing::error!(error = %err, "error inferring Kubernetes configuration");
            exitcode::CONFIG
        })?,
    };

    if let Some(master) = &args.master {
        kube_config.cluster_url = master.parse().map_err(|err| {
            tracing::error!(error = ?err, %master, "invalid API server address");
            exitcode::USAGE
        })?;
    }

    Client::try_from(kube_config).map_err(|err| {
        tracing::error!(error = %err, "error creating Kubernetes client");
        exitcode::UNAVAILABLE
    })
}

async fn daemon(args: cli::Cli) -> Result<(), exitcode::ExitCode> {
    let mut signals = signal_channel()?;

    let config = load_config(&args).await?;
    tracing::info!(
        chain = %config.chain_name,
        network = %config.node_access_network,
        interface = %config.vpn_interface,
        default_kubelet_port = config.default_kubelet_port,
        resync_interval = ?config.resync_interval,
        "configuration loaded"
    );

    // check iptables tooling
    iptables::available().await.map_err(|err| {
        tracing::error!(error = %err, "error checking iptables tools");
        exitcode::UNAVAILABLE
    })?;

    let client = kube_client(&args).await?;
    let nodes = KubeNodes::new(client);
    let resync_interval = config.resync_interval;
    let reconciler = Reconciler::new(config, nodes.clone(), RealIptablesOps);
    let controller = Controller::new(reconciler, resync_interval);

    let cancel = CancellationToken::new();
    let (trigger, pending) = pending_slot();
    let watch = tokio::spawn(kubernetes::watch_nodes(nodes, trigger.clone(), cancel.clone()));
    let mut worker = tokio::spawn(controller.run(trigger, pending, cancel.clone()));

    let mut shutdown_ongoing = false;
    loop {
        tokio::select! {
            Some(name) = signals.recv() => {
                if shutdown_ongoing {
                    tracing::info!(signal = name, "forcing shutdown");
                    return Err(exitcode::OK);
                }
                shutdown_ongoing = true;
                tracing::info!(signal = name, "shutting down after the running pass");
                cancel.cancel();
            },
            res = &mut worker => {
                if let Err(err) = res {
                    tracing::error!(error = ?err, "controller task failed");
                    return Err(exitcode::SOFTWARE);
                }
                if !shutdown_ongoing {
                    tracing::error!("controller stopped unexpectedly");
                    return Err(exitcode::SOFTWARE);
                }
                break;
            }
        }
    }

    if let Err(err) = watch.await {
        tracing::warn!(error = ?err, "node watch task failed");
    }
    Ok(())
}

#[tokio::main]
async fn main() {
    let args = cli::parse();

    logging::setup_stdout(args.log_format, args.log_debug);
    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        "starting {}",
        env!("CARGO_PKG_NAME")
    );

    match daemon(args).await {
        Ok(_) => (),
        Err(exitcode::OK) => (),
        Err(code) => {
            tracing::warn!("abnormal exit");
            process::exit(code);
        }
    }
}

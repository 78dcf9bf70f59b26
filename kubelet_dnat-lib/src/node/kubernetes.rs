//! Kubernetes backed node source.
//!
//! [`KubeNodes`] answers the on-demand listing, [`watch_nodes`] follows the
//! node watch stream and fires the reconcile trigger on relevant changes.

use async_trait::async_trait;
use futures::StreamExt;
use k8s_openapi::api::core::v1::Node as CoreNode;
use kube::api::{Api, ListParams};
use kube::runtime::WatchStreamExt;
use kube::runtime::watcher::{self, Event};
use kube::Client;
use tokio_util::sync::CancellationToken;

use super::{Error, Node, NodeEvent, NodeLister, NodeTracker};
use crate::controller::Trigger;

#[derive(Clone)]
pub struct KubeNodes {
    api: Api<CoreNode>,
}

impl KubeNodes {
    pub fn new(client: Client) -> Self {
        Self { api: Api::all(client) }
    }
}

#[async_trait]
impl NodeLister for KubeNodes {
    async fn list_nodes(&self) -> Result<Vec<Node>, Error> {
        let list = self.api.list(&ListParams::default()).await?;
        Ok(list.items.iter().map(Node::from).collect())
    }
}

/// Follows node changes until cancelled, firing `trigger` for every change
/// that can alter the desired rule set.
pub async fn watch_nodes(nodes: KubeNodes, trigger: Trigger, cancel: CancellationToken) {
    let stream = watcher::watcher(nodes.api, watcher::Config::default()).default_backoff();
    let mut stream = std::pin::pin!(stream);
    let mut tracker = NodeTracker::new();

    tracing::info!("node watch started");
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            event = stream.next() => match event {
                Some(Ok(event)) => {
                    for node_event in tracked_events(&mut tracker, event) {
                        if node_event.triggers_reconcile() {
                            tracing::debug!(node = %node_event.node(), "node change requires reconciliation");
                            trigger.fire();
                        }
                    }
                }
                Some(Err(error)) => {
                    tracing::warn!(%error, "node watch error, stream will retry");
                }
                None => {
                    tracing::warn!("node watch stream ended");
                    break;
                }
            }
        }
    }
    tracing::info!("node watch stopped");
}

fn tracked_events(tracker: &mut NodeTracker, event: Event<CoreNode>) -> Vec<NodeEvent> {
    match event {
        Event::Apply(node) => vec![tracker.applied(Node::from(&node))],
        Event::Delete(node) => vec![tracker.deleted(Node::from(&node))],
        Event::Init => {
            tracker.begin_relist();
            Vec::new()
        }
        Event::InitApply(node) => {
            tracker.relisted(Node::from(&node));
            Vec::new()
        }
        Event::InitDone => tracker.finish_relist(),
    }
}

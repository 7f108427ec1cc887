//! Node health tracking
//!
//! **Table:** every eval node that answered a status poll, keyed by registry
//! id, with its last reported idle/disabled flags.
//!
//! **Eviction:** a node that misses a poll stays in the table but is marked.
//! Missing the next poll too evicts it; answering clears the mark. So a node
//! is dropped after one full poll interval of silence.
//!
//! Passes are serialized by their own lock. The table lock is only held to
//! apply a finished pass, so snapshots never wait on the network.

use crate::clients::EvalClient;
use crate::metrics;
use crate::registry::{RegisteredNode, Registry};
use futures_util::future::join_all;
use gavel_common::types::NodeInfo;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

#[derive(Default)]
struct NodeTable {
    alive: HashMap<String, NodeInfo>,
    missed: HashSet<String>,
}

impl NodeTable {
    fn snapshot(&self) -> Vec<NodeInfo> {
        let mut nodes: Vec<NodeInfo> = self.alive.values().cloned().collect();
        nodes.sort_by(|a, b| a.id.cmp(&b.id));
        nodes
    }
}

pub struct HealthTracker {
    registry: Arc<dyn Registry>,
    client: Arc<dyn EvalClient>,
    poll_timeout: Duration,
    pass: Mutex<()>,
    table: Mutex<NodeTable>,
}

impl HealthTracker {
    pub fn new(registry: Arc<dyn Registry>, client: Arc<dyn EvalClient>, poll_timeout: Duration) -> Self {
        Self {
            registry,
            client,
            poll_timeout,
            pass: Mutex::new(()),
            table: Mutex::new(NodeTable::default()),
        }
    }

    /// Poll every registered node and return the alive set.
    pub async fn check(&self) -> Vec<NodeInfo> {
        let _pass = self.pass.lock().await;

        let nodes = self.registry.list_nodes().await;
        let polls = nodes.iter().map(|node| self.poll(node));
        let answers = join_all(polls).await;

        let mut table = self.table.lock().await;
        let mut responded = HashSet::new();
        for (node, answer) in nodes.iter().zip(answers) {
            let Some(status) = answer else { continue };
            responded.insert(node.id.clone());
            let entry = table.alive.entry(node.id.clone()).or_insert_with(|| {
                info!(node_id = %node.id, address = %node.address, "Eval node is alive");
                NodeInfo {
                    id: node.id.clone(),
                    ..NodeInfo::default()
                }
            });
            entry.name = status.name;
            entry.description = status.description;
            entry.address = node.address.clone();
            entry.idle = status.idle;
            entry.disabled = status.disabled;
        }

        let known: Vec<String> = table.alive.keys().cloned().collect();
        for id in known {
            if responded.contains(&id) {
                table.missed.remove(&id);
            } else if table.missed.remove(&id) {
                table.alive.remove(&id);
                warn!(node_id = %id, "Evicting eval node after two missed polls");
            } else {
                debug!(node_id = %id, "Eval node missed a poll");
                table.missed.insert(id);
            }
        }

        let snapshot = table.snapshot();
        metrics::ALIVE_NODES.set(snapshot.len() as i64);
        metrics::IDLE_NODES.set(snapshot.iter().filter(|n| n.is_available()).count() as i64);
        snapshot
    }

    /// The alive set from the last pass, without polling.
    pub async fn snapshot(&self) -> Vec<NodeInfo> {
        self.table.lock().await.snapshot()
    }

    async fn poll(&self, node: &RegisteredNode) -> Option<NodeInfo> {
        match tokio::time::timeout(self.poll_timeout, self.client.status(&node.address)).await {
            Ok(Ok(info)) => Some(info),
            Ok(Err(e)) => {
                warn!(node_id = %node.id, address = %node.address, error = %e, "Status poll failed");
                metrics::HEALTH_POLL_FAILURES.inc();
                None
            }
            Err(_) => {
                warn!(node_id = %node.id, address = %node.address, "Status poll timed out");
                metrics::HEALTH_POLL_FAILURES.inc();
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::StaticRegistry;
    use async_trait::async_trait;
    use gavel_common::types::Job;
    use std::sync::Mutex as StdMutex;

    /// Answers status polls from a per-address table; absent means down.
    #[derive(Default)]
    struct FakeNodes {
        up: StdMutex<HashMap<String, NodeInfo>>,
    }

    impl FakeNodes {
        fn set(&self, address: &str, idle: bool) {
            self.up.lock().unwrap().insert(
                address.to_string(),
                NodeInfo {
                    name: format!("node at {}", address),
                    idle,
                    ..NodeInfo::default()
                },
            );
        }

        fn down(&self, address: &str) {
            self.up.lock().unwrap().remove(address);
        }
    }

    #[async_trait]
    impl EvalClient for FakeNodes {
        async fn status(&self, address: &str) -> anyhow::Result<NodeInfo> {
            self.up
                .lock()
                .unwrap()
                .get(address)
                .cloned()
                .ok_or_else(|| anyhow::anyhow!("connection refused"))
        }

        async fn assign(&self, _address: &str, _job: &Job) -> anyhow::Result<()> {
            Ok(())
        }
    }

    /// Never answers; signals when the first poll is in flight.
    #[derive(Default)]
    struct StalledNodes {
        entered: tokio::sync::Notify,
    }

    #[async_trait]
    impl EvalClient for StalledNodes {
        async fn status(&self, _address: &str) -> anyhow::Result<NodeInfo> {
            self.entered.notify_one();
            std::future::pending().await
        }

        async fn assign(&self, _address: &str, _job: &Job) -> anyhow::Result<()> {
            Ok(())
        }
    }

    fn tracker(nodes: Arc<FakeNodes>) -> HealthTracker {
        let registry = StaticRegistry::new(vec![
            RegisteredNode::parse("eval-1=a:1").unwrap(),
            RegisteredNode::parse("eval-2=b:1").unwrap(),
        ]);
        HealthTracker::new(Arc::new(registry), nodes, Duration::from_secs(1))
    }

    fn ids(nodes: &[NodeInfo]) -> Vec<&str> {
        nodes.iter().map(|n| n.id.as_str()).collect()
    }

    #[tokio::test]
    async fn test_responding_nodes_are_alive() {
        let nodes = Arc::new(FakeNodes::default());
        nodes.set("a:1", true);
        nodes.set("b:1", false);
        let tracker = tracker(nodes);

        let alive = tracker.check().await;
        assert_eq!(ids(&alive), vec!["eval-1", "eval-2"]);
        assert!(alive[0].idle);
        assert_eq!(alive[0].address, "a:1");
        assert_eq!(alive[0].name, "node at a:1");
        assert!(!alive[1].idle);
    }

    #[tokio::test]
    async fn test_one_miss_keeps_node_two_evict() {
        let nodes = Arc::new(FakeNodes::default());
        nodes.set("a:1", true);
        nodes.set("b:1", true);
        let tracker = tracker(nodes.clone());
        tracker.check().await;

        nodes.down("b:1");
        let alive = tracker.check().await;
        assert_eq!(ids(&alive), vec!["eval-1", "eval-2"]);

        let alive = tracker.check().await;
        assert_eq!(ids(&alive), vec!["eval-1"]);
        assert_eq!(ids(&tracker.snapshot().await), vec!["eval-1"]);
    }

    #[tokio::test]
    async fn test_recovery_clears_the_miss() {
        let nodes = Arc::new(FakeNodes::default());
        nodes.set("a:1", true);
        let tracker = tracker(nodes.clone());
        tracker.check().await;

        nodes.down("a:1");
        tracker.check().await;
        nodes.set("a:1", false);
        tracker.check().await;
        nodes.down("a:1");
        // a fresh single miss after recovering
        let alive = tracker.check().await;
        assert_eq!(ids(&alive), vec!["eval-1"]);
        assert!(!alive[0].idle);
    }

    #[tokio::test]
    async fn test_status_refresh_updates_flags() {
        let nodes = Arc::new(FakeNodes::default());
        nodes.set("a:1", true);
        let tracker = tracker(nodes.clone());
        assert!(tracker.check().await[0].is_available());

        nodes.up.lock().unwrap().get_mut("a:1").unwrap().disabled = true;
        assert!(!tracker.check().await[0].is_available());
    }

    #[tokio::test]
    async fn test_snapshot_does_not_wait_for_polls() {
        let nodes = Arc::new(StalledNodes::default());
        let registry = StaticRegistry::new(vec![RegisteredNode::parse("eval-1=a:1").unwrap()]);
        let tracker = Arc::new(HealthTracker::new(
            Arc::new(registry),
            nodes.clone(),
            Duration::from_millis(300),
        ));

        let pass = tokio::spawn({
            let tracker = tracker.clone();
            async move { tracker.check().await }
        });
        nodes.entered.notified().await;

        let snapshot = tokio::time::timeout(Duration::from_millis(50), tracker.snapshot())
            .await
            .expect("snapshot blocked behind a poll pass");
        assert!(snapshot.is_empty());
        assert!(pass.await.unwrap().is_empty());
    }
}

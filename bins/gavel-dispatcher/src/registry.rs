// Eval node discovery: static nodes from config plus nodes that register
// themselves with a TTL.

use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegisteredNode {
    pub id: String,
    pub address: String,
}

impl RegisteredNode {
    /// Parse `id=address`. A bare address doubles as the id.
    pub fn parse(entry: &str) -> Option<Self> {
        let entry = entry.trim();
        if entry.is_empty() {
            return None;
        }
        let (id, address) = entry.split_once('=').unwrap_or((entry, entry));
        if id.is_empty() || address.is_empty() {
            return None;
        }
        Some(Self {
            id: id.to_string(),
            address: address.to_string(),
        })
    }
}

#[async_trait]
pub trait Registry: Send + Sync {
    async fn list_nodes(&self) -> Vec<RegisteredNode>;
}

pub struct StaticRegistry {
    nodes: Vec<RegisteredNode>,
}

impl StaticRegistry {
    pub fn new(nodes: Vec<RegisteredNode>) -> Self {
        Self { nodes }
    }
}

#[async_trait]
impl Registry for StaticRegistry {
    async fn list_nodes(&self) -> Vec<RegisteredNode> {
        self.nodes.clone()
    }
}

struct Lease {
    address: String,
    expires_at: Instant,
}

/// Nodes that heartbeat `register`. An entry is listed until its TTL runs out.
#[derive(Default)]
pub struct TtlRegistry {
    leases: Mutex<HashMap<String, Lease>>,
}

impl TtlRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, id: &str, address: &str, ttl: Duration) {
        let mut leases = self.leases.lock().unwrap_or_else(|e| e.into_inner());
        let lease = Lease {
            address: address.to_string(),
            expires_at: Instant::now() + ttl,
        };
        if leases.insert(id.to_string(), lease).is_none() {
            info!(node_id = id, address, ttl_secs = ttl.as_secs(), "Eval node registered");
        } else {
            debug!(node_id = id, "Eval node lease renewed");
        }
    }
}

#[async_trait]
impl Registry for TtlRegistry {
    async fn list_nodes(&self) -> Vec<RegisteredNode> {
        let now = Instant::now();
        let mut leases = self.leases.lock().unwrap_or_else(|e| e.into_inner());
        leases.retain(|id, lease| {
            let live = lease.expires_at > now;
            if !live {
                info!(node_id = %id, "Eval node lease expired");
            }
            live
        });
        let mut nodes: Vec<RegisteredNode> = leases
            .iter()
            .map(|(id, lease)| RegisteredNode {
                id: id.clone(),
                address: lease.address.clone(),
            })
            .collect();
        nodes.sort_by(|a, b| a.id.cmp(&b.id));
        nodes
    }
}

/// Union of several registries. The first source listing an id wins.
pub struct MergedRegistry {
    sources: Vec<Arc<dyn Registry>>,
}

impl MergedRegistry {
    pub fn new(sources: Vec<Arc<dyn Registry>>) -> Self {
        Self { sources }
    }
}

#[async_trait]
impl Registry for MergedRegistry {
    async fn list_nodes(&self) -> Vec<RegisteredNode> {
        let mut seen = HashSet::new();
        let mut nodes = Vec::new();
        for source in &self.sources {
            for node in source.list_nodes().await {
                if seen.insert(node.id.clone()) {
                    nodes.push(node);
                }
            }
        }
        nodes
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_node() {
        assert_eq!(
            RegisteredNode::parse("eval-1=10.0.0.5:7070"),
            Some(RegisteredNode {
                id: "eval-1".to_string(),
                address: "10.0.0.5:7070".to_string()
            })
        );
        assert_eq!(RegisteredNode::parse("10.0.0.5:7070").unwrap().id, "10.0.0.5:7070");
        assert_eq!(RegisteredNode::parse("  "), None);
        assert_eq!(RegisteredNode::parse("=addr"), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_ttl_entries_expire() {
        let registry = TtlRegistry::new();
        registry.register("eval-1", "a:1", Duration::from_secs(30));
        registry.register("eval-2", "b:1", Duration::from_secs(60));
        assert_eq!(registry.list_nodes().await.len(), 2);

        tokio::time::advance(Duration::from_secs(31)).await;
        let nodes = registry.list_nodes().await;
        assert_eq!(nodes.len(), 1);
        assert_eq!(nodes[0].id, "eval-2");
    }

    #[tokio::test(start_paused = true)]
    async fn test_heartbeat_renews_lease() {
        let registry = TtlRegistry::new();
        registry.register("eval-1", "a:1", Duration::from_secs(30));
        tokio::time::advance(Duration::from_secs(20)).await;
        registry.register("eval-1", "a:2", Duration::from_secs(30));
        tokio::time::advance(Duration::from_secs(20)).await;

        let nodes = registry.list_nodes().await;
        assert_eq!(nodes.len(), 1);
        assert_eq!(nodes[0].address, "a:2");
    }

    #[tokio::test]
    async fn test_merged_registry_dedupes_by_id() {
        let fixed = StaticRegistry::new(vec![RegisteredNode::parse("eval-1=static:1").unwrap()]);
        let dynamic = TtlRegistry::new();
        dynamic.register("eval-1", "dynamic:1", Duration::from_secs(30));
        dynamic.register("eval-2", "dynamic:2", Duration::from_secs(30));

        let merged = MergedRegistry::new(vec![Arc::new(fixed), Arc::new(dynamic)]);
        let nodes = merged.list_nodes().await;
        assert_eq!(nodes.len(), 2);
        assert_eq!(nodes[0].address, "static:1");
        assert_eq!(nodes[1].id, "eval-2");
    }
}

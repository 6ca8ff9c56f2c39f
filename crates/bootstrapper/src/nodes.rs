//! What the bootstrapper remembers about each node it has provisioned.

use std::collections::BTreeMap;
use std::sync::Arc;

use tokio::sync::RwLock;

use crate::config::Node;
use crate::constants::API_SERVER_PORT;

/// How to reach a node.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NodeInfo {
    /// Node IP.
    pub ip: String,
    /// API server port, for control-plane nodes.
    pub port: u16,
    /// Whether the node runs the control plane.
    pub control_plane: bool,
}

impl From<&Node> for NodeInfo {
    fn from(node: &Node) -> Self {
        NodeInfo {
            ip: node.ip.clone(),
            port: if node.port == 0 { API_SERVER_PORT } else { node.port },
            control_plane: node.control_plane,
        }
    }
}

/// Node addresses keyed by node name. Cheap to clone; clones share the same
/// cache.
#[derive(Clone, Debug, Default)]
pub struct NodeCache {
    nodes: Arc<RwLock<BTreeMap<String, NodeInfo>>>,
}

impl NodeCache {
    /// An empty cache.
    pub fn new() -> Self {
        NodeCache::default()
    }

    /// Records or replaces a node.
    pub async fn record(&self, node: &Node) {
        self.nodes
            .write()
            .await
            .insert(node.name.clone(), NodeInfo::from(node));
    }

    /// Forgets a node.
    pub async fn forget(&self, name: &str) -> Option<NodeInfo> {
        self.nodes.write().await.remove(name)
    }

    /// Looks a node up.
    pub async fn get(&self, name: &str) -> Option<NodeInfo> {
        self.nodes.read().await.get(name).cloned()
    }

    /// The first control-plane node, as `(name, info)`.
    pub async fn control_plane(&self) -> Option<(String, NodeInfo)> {
        self.nodes
            .read()
            .await
            .iter()
            .find(|(_, n)| n.control_plane)
            .map(|(k, v)| (k.clone(), v.clone()))
    }

    /// `https://<ip>:<port>` of the control plane.
    pub async fn api_server_url(&self) -> Option<String> {
        self.control_plane()
            .await
            .map(|(_, n)| format!("https://{}:{}", n.ip, n.port))
    }

    /// Number of nodes recorded.
    pub async fn len(&self) -> usize {
        self.nodes.read().await.len()
    }

    /// Whether nothing was recorded yet.
    pub async fn is_empty(&self) -> bool {
        self.nodes.read().await.is_empty()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn node(name: &str, ip: &str, control_plane: bool) -> Node {
        Node {
            name: name.to_string(),
            ip: ip.to_string(),
            control_plane,
            worker: true,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn records_and_finds_control_plane() {
        let cache = NodeCache::new();
        assert!(cache.is_empty().await);
        cache.record(&node("minikube-m02", "192.168.49.3", false)).await;
        cache.record(&node("minikube", "192.168.49.2", true)).await;

        let (name, info) = cache.control_plane().await.unwrap();
        assert_eq!(name, "minikube");
        assert_eq!(info.port, API_SERVER_PORT);
        assert_eq!(
            cache.api_server_url().await.unwrap(),
            "https://192.168.49.2:8443"
        );
        assert_eq!(cache.len().await, 2);
    }

    #[tokio::test]
    async fn concurrent_readers_see_the_write() {
        let cache = NodeCache::new();
        cache.record(&node("minikube", "192.168.49.2", true)).await;
        let readers: Vec<_> = (0..8)
            .map(|_| {
                let cache = cache.clone();
                tokio::spawn(async move { cache.get("minikube").await })
            })
            .collect();
        for r in readers {
            assert_eq!(r.await.unwrap().unwrap().ip, "192.168.49.2");
        }
        assert!(cache.forget("minikube").await.is_some());
        assert!(cache.get("minikube").await.is_none());
    }
}

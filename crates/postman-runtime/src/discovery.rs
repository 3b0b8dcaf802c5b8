//! Node discovery: which panes host which nodes.

use std::path::PathBuf;
use std::sync::{Arc, RwLock};

use postman_core::node::{qualify, NodeInfo, NodeMap};
use postman_core::Result;

use crate::pane::PaneTransport;

/// Source of the current node map. Called on every discovery tick and
/// before each delivery, so implementations should be cheap.
pub trait NodeDirectory: Send + Sync {
    fn discover(&self) -> Result<NodeMap>;
}

/// Discovers nodes from tmux: a pane is a node when its `@postman_node`
/// option is set. Each tmux session maps to `<context dir>/<session>`.
pub struct TmuxNodeDirectory {
    transport: Arc<dyn PaneTransport>,
    context_dir: PathBuf,
}

impl TmuxNodeDirectory {
    pub fn new(transport: Arc<dyn PaneTransport>, context_dir: impl Into<PathBuf>) -> Self {
        Self {
            transport,
            context_dir: context_dir.into(),
        }
    }
}

impl NodeDirectory for TmuxNodeDirectory {
    fn discover(&self) -> Result<NodeMap> {
        let mut nodes = NodeMap::new();
        for pane in self.transport.list_panes()? {
            let Some(node) = pane.node.filter(|n| !n.is_empty()) else {
                continue;
            };
            let key = qualify(&pane.session_name, &node);
            if let Some(existing) = nodes.get(&key) {
                tracing::warn!(
                    node = %key,
                    kept = %existing.pane_id,
                    ignored = %pane.pane_id,
                    "node name claimed by more than one pane"
                );
                continue;
            }
            nodes.insert(
                key,
                NodeInfo {
                    session_dir: self.context_dir.join(&pane.session_name),
                    pane_id: pane.pane_id,
                    session_name: pane.session_name,
                },
            );
        }
        Ok(nodes)
    }
}

/// A node map set by hand. Useful when panes are managed elsewhere.
#[derive(Default)]
pub struct StaticNodeDirectory {
    nodes: RwLock<NodeMap>,
}

impl StaticNodeDirectory {
    pub fn new(nodes: NodeMap) -> Self {
        Self {
            nodes: RwLock::new(nodes),
        }
    }

    pub fn insert(&self, key: &str, info: NodeInfo) {
        self.nodes
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(key.to_string(), info);
    }
}

impl NodeDirectory for StaticNodeDirectory {
    fn discover(&self) -> Result<NodeMap> {
        Ok(self.nodes.read().unwrap_or_else(|e| e.into_inner()).clone())
    }
}

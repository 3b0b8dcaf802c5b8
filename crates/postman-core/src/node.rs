//! Node identities and session-qualified name resolution.

use std::collections::HashMap;
use std::path::PathBuf;

use serde::Serialize;

/// Where a discovered node lives.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NodeInfo {
    /// Terminal-multiplexer pane handle (e.g. `%12`).
    pub pane_id: String,
    /// Multiplexer session hosting the pane.
    pub session_name: String,
    /// Bus session directory for that session.
    pub session_dir: PathBuf,
}

/// Discovered nodes keyed by session-qualified name (`session:node`).
pub type NodeMap = HashMap<String, NodeInfo>;

/// Join a session and node name into a qualified key.
pub fn qualify(session: &str, node: &str) -> String {
    format!("{session}:{node}")
}

/// The node part of a possibly session-qualified name.
pub fn simple_name(name: &str) -> &str {
    name.split_once(':').map_or(name, |(_, node)| node)
}

/// The session part of a qualified name, if any.
pub fn session_of(name: &str) -> Option<&str> {
    name.split_once(':').map(|(session, _)| session)
}

/// Resolve `name` to a key of `nodes`.
///
/// Qualified names are only checked for presence. Simple names prefer the
/// node in `source_session`; otherwise the first cross-session match in key
/// order wins so that resolution is deterministic.
pub fn resolve_node_name(name: &str, source_session: &str, nodes: &NodeMap) -> Option<String> {
    if name.contains(':') {
        return nodes.contains_key(name).then(|| name.to_string());
    }

    let same_session = qualify(source_session, name);
    if nodes.contains_key(&same_session) {
        return Some(same_session);
    }

    let mut candidates: Vec<&String> = nodes
        .keys()
        .filter(|key| simple_name(key) == name)
        .collect();
    candidates.sort();
    candidates.first().map(|key| (*key).clone())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node(session: &str) -> NodeInfo {
        NodeInfo {
            pane_id: "%1".to_string(),
            session_name: session.to_string(),
            session_dir: PathBuf::from(format!("/ctx/{session}")),
        }
    }

    fn nodes(keys: &[&str]) -> NodeMap {
        keys.iter()
            .map(|k| (k.to_string(), node(session_of(k).unwrap())))
            .collect()
    }

    #[test]
    fn test_simple_name_and_session() {
        assert_eq!(simple_name("main:worker"), "worker");
        assert_eq!(simple_name("worker"), "worker");
        assert_eq!(session_of("main:worker"), Some("main"));
        assert_eq!(session_of("worker"), None);
        assert_eq!(qualify("main", "worker"), "main:worker");
    }

    #[test]
    fn test_resolve_prefers_same_session() {
        let map = nodes(&["alpha:worker", "main:worker"]);
        assert_eq!(
            resolve_node_name("worker", "main", &map).as_deref(),
            Some("main:worker")
        );
    }

    #[test]
    fn test_resolve_falls_back_to_cross_session() {
        let map = nodes(&["zeta:critic", "beta:critic"]);
        assert_eq!(
            resolve_node_name("critic", "main", &map).as_deref(),
            Some("beta:critic")
        );
    }

    #[test]
    fn test_resolve_qualified_name_checked_directly() {
        let map = nodes(&["main:worker"]);
        assert_eq!(
            resolve_node_name("main:worker", "other", &map).as_deref(),
            Some("main:worker")
        );
        assert!(resolve_node_name("other:worker", "main", &map).is_none());
    }

    #[test]
    fn test_resolve_unknown_node() {
        let map = nodes(&["main:worker"]);
        assert!(resolve_node_name("unknown-node", "main", &map).is_none());
    }
}

//! Observer digests: nodes that `observes` another node get a one-line
//! summary pasted into their pane whenever that node sends or receives.

use std::collections::BTreeSet;
use std::time::Duration;

use postman_core::config::BusConfig;
use postman_core::node::{resolve_node_name, session_of, simple_name, NodeMap};
use postman_core::template::{expand, TemplateVars};

use crate::pane::{notify_pane, PaneTransport};

/// Paste the digest for a `from` → `to` delivery to every observer of either
/// endpoint. Returns the qualified keys of the observers that were notified.
pub fn send_digest(
    transport: &dyn PaneTransport,
    config: &BusConfig,
    nodes: &NodeMap,
    from: &str,
    to: &str,
    filename: &str,
) -> Vec<String> {
    let endpoints = [simple_name(from), simple_name(to)];
    let observers: BTreeSet<String> = config
        .observers_of(from)
        .into_iter()
        .chain(config.observers_of(to))
        .filter(|o| !endpoints.contains(&o.as_str()))
        .collect();

    let session = session_of(to).unwrap_or_default();
    let mut notified = Vec::new();

    for observer in observers {
        let Some(key) = resolve_node_name(&observer, session, nodes) else {
            tracing::debug!(observer = %observer, "observer not discovered; digest skipped");
            continue;
        };
        let Some(info) = nodes.get(&key) else {
            continue;
        };

        let vars = TemplateVars::new()
            .with("from", simple_name(from))
            .with("to", simple_name(to))
            .with("filename", filename)
            .with("observer", observer.as_str());
        let text = expand(&config.digest_template, &vars);

        match notify_pane(
            transport,
            &info.pane_id,
            &text,
            config.enter_count_for(&key),
            Duration::from_millis(config.enter_delay_ms),
        ) {
            Ok(()) => notified.push(key),
            Err(e) => tracing::warn!(observer = %key, error = %e, "failed to send digest"),
        }
    }

    notified
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pane::testing::RecordingTransport;
    use postman_core::config::NodeConfig;
    use postman_core::node::NodeInfo;
    use std::path::PathBuf;

    fn node(pane: &str) -> NodeInfo {
        NodeInfo {
            pane_id: pane.to_string(),
            session_name: "main".to_string(),
            session_dir: PathBuf::from("/ctx/main"),
        }
    }

    fn setup() -> (BusConfig, NodeMap) {
        let mut config = BusConfig {
            digest_template: "{observer}: {from}->{to} {filename}".to_string(),
            enter_delay_ms: 0,
            ..BusConfig::default()
        };
        config.nodes.insert(
            "critic".to_string(),
            NodeConfig {
                observes: vec!["worker".to_string()],
                ..Default::default()
            },
        );
        config.nodes.insert(
            "boss".to_string(),
            NodeConfig {
                observes: vec!["worker".to_string()],
                ..Default::default()
            },
        );

        let mut nodes = NodeMap::new();
        nodes.insert("main:critic".to_string(), node("%7"));
        nodes.insert("main:boss".to_string(), node("%1"));
        nodes.insert("main:worker".to_string(), node("%2"));
        (config, nodes)
    }

    #[test]
    fn test_digest_goes_to_observers() {
        let (config, nodes) = setup();
        let transport = RecordingTransport::default();

        let notified = send_digest(
            &transport,
            &config,
            &nodes,
            "main:worker",
            "main:critic2",
            "m.md",
        );

        assert_eq!(notified, vec!["main:boss".to_string(), "main:critic".to_string()]);
        assert!(transport
            .pastes()
            .contains(&("%7".to_string(), "critic: worker->critic2 m.md".to_string())));
    }

    #[test]
    fn test_digest_skips_observer_that_is_an_endpoint() {
        let (config, nodes) = setup();
        let transport = RecordingTransport::default();

        let notified = send_digest(&transport, &config, &nodes, "main:boss", "main:worker", "m.md");

        assert_eq!(notified, vec!["main:critic".to_string()]);
    }

    #[test]
    fn test_digest_without_observers() {
        let (config, nodes) = setup();
        let transport = RecordingTransport::default();
        assert!(send_digest(&transport, &config, &nodes, "main:boss", "main:critic", "m.md").is_empty());
        assert!(transport.pastes().is_empty());
    }
}

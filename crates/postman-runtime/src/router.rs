//! Message delivery.
//!
//! [`deliver`] takes one file from a session's `post/` directory and moves it
//! to exactly one destination: the recipient's inbox, `read/` for handshake
//! replies, or `dead-letter/`. Every branch ends in a single rename, so a
//! second watcher notification for the same file finds it gone and returns
//! [`DeliveryOutcome::Duplicate`].

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::Utc;
use postman_core::adjacency::Adjacency;
use postman_core::config::{BusConfig, WarningMode};
use postman_core::message::{MessageInfo, POSTMAN};
use postman_core::node::{resolve_node_name, session_of, simple_name, NodeMap};
use postman_core::template::{expand, TemplateVars};
use postman_core::{PostmanError, Result};

use crate::activity::ActivityTracker;
use crate::layout::{is_source_gone, relocate, SessionLayout};
use crate::pane::{notify_pane, PaneTransport};

// ── Types ─────────────────────────────────────────────────────────────────────

/// Everything a delivery needs besides the file itself. Built per event from
/// the daemon's current snapshot.
pub struct DeliveryContext<'a> {
    pub context_id: &'a str,
    pub nodes: &'a NodeMap,
    pub adjacency: &'a Adjacency,
    pub config: &'a BusConfig,
    pub session_enabled: &'a (dyn Fn(&str) -> bool + Send + Sync),
    pub transport: &'a dyn PaneTransport,
    pub activity: &'a ActivityTracker,
}

/// Why a message ended up in `dead-letter/`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeadLetterReason {
    MalformedFilename,
    UnknownRecipient,
    UnknownSender,
    SessionDisabled,
}

impl DeadLetterReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::MalformedFilename => "malformed filename",
            Self::UnknownRecipient => "unknown recipient",
            Self::UnknownSender => "unknown sender",
            Self::SessionDisabled => "session disabled",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeliveryOutcome {
    /// The file was already gone.
    Duplicate,
    /// A handshake reply, moved to `read/`.
    Acknowledged { from: String, path: PathBuf },
    /// No edge between sender and recipient.
    Denied {
        from: String,
        to: String,
        path: PathBuf,
        warning: Option<PathBuf>,
    },
    DeadLettered { reason: DeadLetterReason, path: PathBuf },
    /// Moved into the recipient's inbox. Names are session-qualified keys,
    /// except a `postman` sender.
    Delivered { from: String, to: String, path: PathBuf },
}

impl DeliveryOutcome {
    pub fn is_delivered(&self) -> bool {
        matches!(self, Self::Delivered { .. })
    }
}

// ── Delivery ──────────────────────────────────────────────────────────────────

/// Deliver one file from a `post/` directory.
///
/// Routing failures are outcomes, not errors. `Err` means a rename failed for
/// a reason other than the source already being gone.
pub fn deliver(post_path: &Path, ctx: &DeliveryContext<'_>) -> Result<DeliveryOutcome> {
    if !post_path.exists() {
        return Ok(DeliveryOutcome::Duplicate);
    }

    let source = SessionLayout::from_post_file(post_path).ok_or_else(|| {
        PostmanError::Io(std::io::Error::new(
            std::io::ErrorKind::InvalidInput,
            format!("not inside a post directory: {}", post_path.display()),
        ))
    })?;
    let source_session = source.session_name();

    let filename = post_path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let info = match MessageInfo::parse(&filename) {
        Ok(info) => info,
        Err(e) => {
            tracing::warn!(file = %filename, error = %e, "malformed message filename");
            return dead_letter(post_path, &source, DeadLetterReason::MalformedFilename);
        }
    };

    // Handshake replies never enter an inbox.
    if info.to == POSTMAN {
        let sender = resolve_node_name(&info.from, &source_session, ctx.nodes)
            .unwrap_or_else(|| info.from.clone());
        let path = match relocate(post_path, &source.read()) {
            Ok(path) => path,
            Err(e) if is_source_gone(&e) => return Ok(DeliveryOutcome::Duplicate),
            Err(e) => return Err(e),
        };
        ctx.activity.mark_pong_received(&sender);
        tracing::info!(from = %sender, "handshake reply received");
        return Ok(DeliveryOutcome::Acknowledged { from: sender, path });
    }

    let Some(recipient) = resolve_node_name(&info.to, &source_session, ctx.nodes) else {
        tracing::warn!(file = %filename, to = %info.to, "recipient not found");
        return dead_letter(post_path, &source, DeadLetterReason::UnknownRecipient);
    };

    let from_postman = info.from == POSTMAN;
    let sender = if from_postman {
        POSTMAN.to_string()
    } else {
        match resolve_node_name(&info.from, &source_session, ctx.nodes) {
            Some(sender) => sender,
            None => {
                tracing::warn!(file = %filename, from = %info.from, "sender not found");
                return dead_letter(post_path, &source, DeadLetterReason::UnknownSender);
            }
        }
    };

    if !from_postman && !edge_allows(ctx, &sender, &recipient, &source_session) {
        tracing::warn!(from = %sender, to = %recipient, "routing denied: no edge");
        let warning = write_edge_warning(ctx, &sender, &recipient)
            .map_err(|e| tracing::warn!(from = %sender, error = %e, "failed to write edge warning"))
            .ok();
        let path = match relocate(post_path, &source.dead_letter()) {
            Ok(path) => path,
            Err(e) if is_source_gone(&e) => return Ok(DeliveryOutcome::Duplicate),
            Err(e) => return Err(e),
        };
        return Ok(DeliveryOutcome::Denied {
            from: sender,
            to: recipient,
            path,
            warning,
        });
    }

    if !from_postman {
        let enabled = |key: &str| (ctx.session_enabled)(session_of(key).unwrap_or_default());
        if !enabled(&sender) || !enabled(&recipient) {
            tracing::info!(from = %sender, to = %recipient, "session disabled; message dead-lettered");
            return dead_letter(post_path, &source, DeadLetterReason::SessionDisabled);
        }
    }

    // The recipient's inbox lives in its own session directory.
    let recipient_layout = match ctx.nodes.get(&recipient) {
        Some(node) => SessionLayout::new(&node.session_dir),
        None => source.clone(),
    };
    let path = match relocate(post_path, &recipient_layout.inbox(&recipient)) {
        Ok(path) => path,
        Err(e) if is_source_gone(&e) => return Ok(DeliveryOutcome::Duplicate),
        Err(e) => return Err(e),
    };
    tracing::info!(from = %sender, to = %recipient, file = %filename, "message delivered");

    notify_recipient(ctx, &info, &sender, &recipient, &path);

    if !from_postman {
        ctx.activity.update_send_activity(&sender);
        ctx.activity.update_receive_activity(&recipient);
    }

    Ok(DeliveryOutcome::Delivered {
        from: sender,
        to: recipient,
        path,
    })
}

fn dead_letter(
    post_path: &Path,
    source: &SessionLayout,
    reason: DeadLetterReason,
) -> Result<DeliveryOutcome> {
    match relocate(post_path, &source.dead_letter()) {
        Ok(path) => Ok(DeliveryOutcome::DeadLettered { reason, path }),
        Err(e) if is_source_gone(&e) => Ok(DeliveryOutcome::Duplicate),
        Err(e) => Err(e),
    }
}

// ── Policy ────────────────────────────────────────────────────────────────────

/// Neighbours declared for `sender` under its simple or qualified name.
fn declared_neighbors(adjacency: &Adjacency, sender: &str) -> BTreeSet<String> {
    let mut neighbors: BTreeSet<String> = adjacency.neighbors(sender).into_iter().collect();
    neighbors.extend(adjacency.neighbors(simple_name(sender)));
    neighbors
}

fn edge_allows(ctx: &DeliveryContext<'_>, sender: &str, recipient: &str, source_session: &str) -> bool {
    declared_neighbors(ctx.adjacency, sender).iter().any(|neighbor| {
        neighbor == recipient
            || (!neighbor.contains(':') && neighbor == simple_name(recipient))
            || resolve_node_name(neighbor, source_session, ctx.nodes).as_deref() == Some(recipient)
    })
}

/// "You can talk to: …" listing the neighbours of `node` that have answered
/// the handshake.
pub fn talks_to_line(
    adjacency: &Adjacency,
    activity: &ActivityTracker,
    nodes: &NodeMap,
    node: &str,
) -> String {
    let session = session_of(node).unwrap_or_default();
    let confirmed: Vec<String> = declared_neighbors(adjacency, node)
        .into_iter()
        .filter(|neighbor| {
            resolve_node_name(neighbor, session, nodes)
                .is_some_and(|key| activity.is_pong_received(&key))
        })
        .map(|neighbor| simple_name(&neighbor).to_string())
        .collect();

    if confirmed.is_empty() {
        "You can talk to: (no confirmed nodes yet)".to_string()
    } else {
        format!("You can talk to: {}", confirmed.join(", "))
    }
}

fn reply_command(config: &BusConfig, context_id: &str, to: &str) -> String {
    let vars = TemplateVars::new()
        .with("context_id", context_id)
        .with("from", to);
    expand(&config.reply_command, &vars)
}

fn write_edge_warning(ctx: &DeliveryContext<'_>, sender: &str, recipient: &str) -> Result<PathBuf> {
    let node = ctx
        .nodes
        .get(sender)
        .ok_or_else(|| PostmanError::UnknownNode(sender.to_string()))?;

    let vars = TemplateVars::new()
        .with("from", simple_name(sender))
        .with("to", simple_name(recipient))
        .with("context_id", ctx.context_id)
        .with(
            "talks_to_line",
            talks_to_line(ctx.adjacency, ctx.activity, ctx.nodes, sender),
        );
    let mut body = expand(&ctx.config.edge_violation.template, &vars);

    if ctx.config.edge_violation.mode == WarningMode::Verbose {
        body.push_str("\n\nNext steps:\n");
        body.push_str(&format!(
            "1. Ask a node you can talk to to relay your message to {}.\n",
            simple_name(recipient)
        ));
        let neighbors = declared_neighbors(ctx.adjacency, sender);
        if neighbors.is_empty() {
            body.push_str("2. No edges are declared for you; ask the operator to add one.\n");
        } else {
            body.push_str("2. Send it with one of:\n");
            for neighbor in neighbors {
                body.push_str(&format!(
                    "   {}\n",
                    reply_command(ctx.config, ctx.context_id, simple_name(&neighbor))
                ));
            }
        }
    }

    SessionLayout::new(&node.session_dir).write_system_message(ctx.context_id, sender, &body, Utc::now())
}

// ── Notification ──────────────────────────────────────────────────────────────

fn notify_recipient(
    ctx: &DeliveryContext<'_>,
    info: &MessageInfo,
    sender: &str,
    recipient: &str,
    path: &Path,
) {
    let Some(node) = ctx.nodes.get(recipient) else {
        return;
    };
    let template = ctx
        .config
        .node(recipient)
        .map(|n| n.template.clone())
        .unwrap_or_default();

    let vars = TemplateVars::new()
        .with("from", simple_name(sender))
        .with("to", simple_name(recipient))
        .with("timestamp", info.timestamp.as_str())
        .with("filename", info.filename())
        .with("inbox_path", path.display().to_string())
        .with(
            "talks_to_line",
            talks_to_line(ctx.adjacency, ctx.activity, ctx.nodes, recipient),
        )
        .with(
            "reply_command",
            reply_command(ctx.config, ctx.context_id, simple_name(sender)),
        )
        .with("template", template)
        .with("context_id", ctx.context_id);
    let text = expand(&ctx.config.notification_template, &vars);

    if let Err(e) = notify_pane(
        ctx.transport,
        &node.pane_id,
        text.trim_end(),
        ctx.config.enter_count_for(recipient),
        Duration::from_millis(ctx.config.enter_delay_ms),
    ) {
        tracing::warn!(to = %recipient, pane = %node.pane_id, error = %e, "pane notification failed");
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pane::testing::RecordingTransport;
    use postman_core::config::NodeConfig;
    use postman_core::node::NodeInfo;
    use tempfile::TempDir;

    const MSG: &str = "20260201-120000-from-orchestrator-to-worker.md";

    struct Fixture {
        _tmp: TempDir,
        layout: SessionLayout,
        nodes: NodeMap,
        config: BusConfig,
        transport: RecordingTransport,
        activity: ActivityTracker,
    }

    impl Fixture {
        fn new(edges: &[&str]) -> Self {
            let tmp = TempDir::new().unwrap();
            let layout = SessionLayout::for_session(tmp.path(), "main");
            layout.ensure::<&str>(&[]).unwrap();

            let mut nodes = NodeMap::new();
            for (name, pane) in [("orchestrator", "%1"), ("worker", "%2")] {
                nodes.insert(
                    format!("main:{name}"),
                    NodeInfo {
                        pane_id: pane.to_string(),
                        session_name: "main".to_string(),
                        session_dir: layout.root().to_path_buf(),
                    },
                );
            }

            let config = BusConfig {
                edges: edges.iter().map(|e| e.to_string()).collect(),
                enter_delay_ms: 0,
                ..BusConfig::default()
            };

            Self {
                _tmp: tmp,
                layout,
                nodes,
                config,
                transport: RecordingTransport::default(),
                activity: ActivityTracker::new(),
            }
        }

        fn post(&self, name: &str) -> PathBuf {
            let path = self.layout.post().join(name);
            std::fs::write(&path, "hello").unwrap();
            path
        }

        fn deliver_with(&self, path: &Path, enabled: &(dyn Fn(&str) -> bool + Send + Sync)) -> DeliveryOutcome {
            let adjacency = self.config.adjacency().unwrap();
            let ctx = DeliveryContext {
                context_id: "ctx1",
                nodes: &self.nodes,
                adjacency: &adjacency,
                config: &self.config,
                session_enabled: enabled,
                transport: &self.transport,
                activity: &self.activity,
            };
            deliver(path, &ctx).unwrap()
        }

        fn deliver(&self, path: &Path) -> DeliveryOutcome {
            self.deliver_with(path, &|_: &str| true)
        }
    }

    #[test]
    fn test_delivers_into_recipient_inbox() {
        let fx = Fixture::new(&["orchestrator -- worker"]);
        let path = fx.post(MSG);

        let outcome = fx.deliver(&path);

        let expected = fx.layout.inbox("worker").join(MSG);
        assert_eq!(
            outcome,
            DeliveryOutcome::Delivered {
                from: "main:orchestrator".to_string(),
                to: "main:worker".to_string(),
                path: expected.clone(),
            }
        );
        assert!(!path.exists());
        assert_eq!(std::fs::read_to_string(expected).unwrap(), "hello");
        assert_eq!(fx.transport.pastes().len(), 1);
        assert_eq!(fx.transport.pastes()[0].0, "%2");
        assert_eq!(fx.transport.enter_count("%2"), 1);
    }

    #[test]
    fn test_notification_carries_reply_command() {
        let mut fx = Fixture::new(&["orchestrator -- worker"]);
        fx.config.notification_template = "{from}|{to}|{filename}|{reply_command}|{template}".to_string();
        fx.config.nodes.insert(
            "worker".to_string(),
            NodeConfig {
                template: "be brief".to_string(),
                enter_count: Some(2),
                ..Default::default()
            },
        );
        fx.deliver(&fx.post(MSG));

        let (_, text) = &fx.transport.pastes()[0];
        assert_eq!(
            text,
            &format!("orchestrator|worker|{MSG}|postman send --context-id ctx1 --to orchestrator|be brief")
        );
        assert_eq!(fx.transport.enter_count("%2"), 2);
    }

    #[test]
    fn test_unknown_recipient_is_dead_lettered() {
        let fx = Fixture::new(&["orchestrator -- worker"]);
        let name = "20260201-120000-from-orchestrator-to-unknown-node.md";
        let outcome = fx.deliver(&fx.post(name));

        assert!(matches!(
            outcome,
            DeliveryOutcome::DeadLettered { reason: DeadLetterReason::UnknownRecipient, .. }
        ));
        assert!(fx.layout.dead_letter().join(name).exists());
    }

    #[test]
    fn test_malformed_filename_is_dead_lettered() {
        let fx = Fixture::new(&[]);
        let outcome = fx.deliver(&fx.post("notes.md"));
        assert!(matches!(
            outcome,
            DeliveryOutcome::DeadLettered { reason: DeadLetterReason::MalformedFilename, .. }
        ));
        assert!(fx.layout.dead_letter().join("notes.md").exists());
    }

    #[test]
    fn test_unknown_sender_is_dead_lettered() {
        let fx = Fixture::new(&["orchestrator -- worker"]);
        let outcome = fx.deliver(&fx.post("20260201-120000-from-ghost-to-worker.md"));
        assert!(matches!(
            outcome,
            DeliveryOutcome::DeadLettered { reason: DeadLetterReason::UnknownSender, .. }
        ));
    }

    #[test]
    fn test_missing_edge_denies_and_warns_sender() {
        let fx = Fixture::new(&[]);
        let name = "20260201-120000-from-worker-to-orchestrator.md";
        let outcome = fx.deliver(&fx.post(name));

        let DeliveryOutcome::Denied { warning, path, .. } = outcome else {
            panic!("expected denial, got {outcome:?}");
        };
        assert_eq!(path, fx.layout.dead_letter().join(name));
        let warning = warning.unwrap();
        assert_eq!(warning.parent().unwrap(), fx.layout.inbox("worker"));
        let body = std::fs::read_to_string(warning).unwrap();
        assert!(body.contains("no edge between worker and orchestrator"));
        assert!(!body.contains("Next steps"));
        assert!(fx.transport.pastes().is_empty());
    }

    #[test]
    fn test_verbose_warning_lists_reply_steps() {
        let mut fx = Fixture::new(&["worker -- critic"]);
        fx.config.edge_violation.mode = WarningMode::Verbose;
        let outcome = fx.deliver(&fx.post("20260201-120000-from-worker-to-orchestrator.md"));

        let DeliveryOutcome::Denied { warning: Some(warning), .. } = outcome else {
            panic!("expected denial with warning");
        };
        let body = std::fs::read_to_string(warning).unwrap();
        assert!(body.contains("Next steps"));
        assert!(body.contains("postman send --context-id ctx1 --to critic"));
    }

    #[test]
    fn test_postman_sender_bypasses_adjacency() {
        let fx = Fixture::new(&[]);
        let outcome = fx.deliver(&fx.post("20260201-120000-from-postman-to-worker.md"));
        assert!(outcome.is_delivered());
        // System traffic does not touch ball-holding state.
        assert!(fx.activity.state("main:worker").is_none());
    }

    #[test]
    fn test_reply_to_postman_lands_in_read() {
        let fx = Fixture::new(&[]);
        let name = "20260201-120000-from-worker-to-postman.md";
        let outcome = fx.deliver(&fx.post(name));

        assert_eq!(
            outcome,
            DeliveryOutcome::Acknowledged {
                from: "main:worker".to_string(),
                path: fx.layout.read().join(name),
            }
        );
        assert!(fx.activity.is_pong_received("main:worker"));
        assert!(!fx.layout.inbox("postman").exists());
        assert_eq!(std::fs::read_dir(fx.layout.dead_letter()).unwrap().count(), 0);
    }

    #[test]
    fn test_disabled_session_dead_letters() {
        let fx = Fixture::new(&["orchestrator -- worker"]);
        let outcome = fx.deliver_with(&fx.post(MSG), &|session: &str| session != "main");
        assert!(matches!(
            outcome,
            DeliveryOutcome::DeadLettered { reason: DeadLetterReason::SessionDisabled, .. }
        ));
    }

    #[test]
    fn test_second_delivery_is_duplicate() {
        let fx = Fixture::new(&["orchestrator -- worker"]);
        let path = fx.post(MSG);
        assert!(fx.deliver(&path).is_delivered());
        assert_eq!(fx.deliver(&path), DeliveryOutcome::Duplicate);
    }

    #[test]
    fn test_delivery_updates_activity() {
        let fx = Fixture::new(&["orchestrator -- worker"]);
        fx.deliver(&fx.post(MSG));
        assert!(fx.activity.is_holding_ball("main:worker"));
        assert!(!fx.activity.is_holding_ball("main:orchestrator"));
    }

    #[test]
    fn test_pane_failure_does_not_fail_delivery() {
        let mut fx = Fixture::new(&["orchestrator -- worker"]);
        fx.transport = RecordingTransport::failing();
        assert!(fx.deliver(&fx.post(MSG)).is_delivered());
    }

    #[test]
    fn test_cross_session_recipient_uses_its_own_inbox() {
        let mut fx = Fixture::new(&["orchestrator -- reviewer"]);
        let other = SessionLayout::new(fx.layout.root().with_file_name("review"));
        fx.nodes.insert(
            "review:reviewer".to_string(),
            NodeInfo {
                pane_id: "%9".to_string(),
                session_name: "review".to_string(),
                session_dir: other.root().to_path_buf(),
            },
        );
        let name = "20260201-120000-from-orchestrator-to-reviewer.md";
        let outcome = fx.deliver(&fx.post(name));

        assert!(outcome.is_delivered());
        assert!(other.inbox("reviewer").join(name).exists());
    }

    #[test]
    fn test_talks_to_line_lists_confirmed_neighbors() {
        let fx = Fixture::new(&["orchestrator -- worker"]);
        let adjacency = fx.config.adjacency().unwrap();
        assert_eq!(
            talks_to_line(&adjacency, &fx.activity, &fx.nodes, "main:worker"),
            "You can talk to: (no confirmed nodes yet)"
        );
        fx.activity.mark_pong_received("main:orchestrator");
        assert_eq!(
            talks_to_line(&adjacency, &fx.activity, &fx.nodes, "main:worker"),
            "You can talk to: orchestrator"
        );
    }
}

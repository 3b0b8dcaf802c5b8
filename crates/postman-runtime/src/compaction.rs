//! Context-compaction detection.
//!
//! Agents print a recognisable line when their runtime compacts the
//! conversation. The monitor samples each node's pane tail on a fixed
//! interval and, on a fresh match, tells every node that observes the
//! compacting node, so that it can re-send anything that was lost.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};
use postman_core::config::BusConfig;
use postman_core::node::{resolve_node_name, session_of, simple_name, NodeMap};
use postman_core::template::{expand, TemplateVars};
use tokio_util::sync::CancellationToken;

use crate::layout::SessionLayout;
use crate::pane::{notify_pane, PaneTransport};
use crate::tasks::{run_blocking, spawn_supervised};

/// How often panes are sampled.
pub const CHECK_INTERVAL: Duration = Duration::from_secs(5);

/// A node is not reported twice within this window.
pub const SUPPRESSION_WINDOW: Duration = Duration::from_secs(30);

/// One observer to tell about one compaction. Owns its data so that it can
/// be moved into a delayed task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompactionNotice {
    pub node: String,
    pub observer: String,
    pub observer_pane: String,
    pub text: String,
    pub enter_count: u8,
    pub enter_delay: Duration,
}

pub struct CompactionMonitor {
    detections: Mutex<HashMap<String, DateTime<Utc>>>,
    transport: Arc<dyn PaneTransport>,
}

impl CompactionMonitor {
    pub fn new(transport: Arc<dyn PaneTransport>) -> Self {
        Self {
            detections: Mutex::new(HashMap::new()),
            transport,
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, DateTime<Utc>>> {
        self.detections.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn last_detection(&self, node: &str) -> Option<DateTime<Utc>> {
        self.lock().get(node).copied()
    }

    /// Sample every node once and return the notices to deliver.
    pub fn check_once_at(
        &self,
        config: &BusConfig,
        nodes: &NodeMap,
        now: DateTime<Utc>,
    ) -> Vec<CompactionNotice> {
        let compaction = &config.compaction;
        if !compaction.enabled || compaction.pattern.is_empty() {
            return Vec::new();
        }

        let mut keys: Vec<&String> = nodes.keys().collect();
        keys.sort();

        let mut notices = Vec::new();
        for key in keys {
            let info = &nodes[key];
            let tail = match self.transport.capture(&info.pane_id, compaction.tail_lines) {
                Ok(tail) => tail,
                Err(e) => {
                    tracing::debug!(node = %key, error = %e, "pane capture failed");
                    continue;
                }
            };
            if !tail.contains(&compaction.pattern) {
                continue;
            }
            if !self.record_detection(key, now) {
                continue;
            }

            tracing::info!(node = %key, "compaction detected");
            if let Err(e) = SessionLayout::new(&info.session_dir).write_capture(key, &tail, now) {
                tracing::warn!(node = %key, error = %e, "failed to save pane snapshot");
            }
            notices.extend(self.notices_for(config, nodes, key));
        }
        notices
    }

    /// Record a detection unless one was recorded inside the window.
    fn record_detection(&self, node: &str, now: DateTime<Utc>) -> bool {
        let mut detections = self.lock();
        if let Some(last) = detections.get(node) {
            if (now - *last).to_std().unwrap_or_default() < SUPPRESSION_WINDOW {
                return false;
            }
        }
        detections.insert(node.to_string(), now);
        true
    }

    fn notices_for(&self, config: &BusConfig, nodes: &NodeMap, node: &str) -> Vec<CompactionNotice> {
        let session = session_of(node).unwrap_or_default();
        config
            .observers_of(node)
            .into_iter()
            .filter(|observer| observer != simple_name(node))
            .filter_map(|observer| {
                let key = resolve_node_name(&observer, session, nodes)?;
                let info = nodes.get(&key)?;
                let vars = TemplateVars::new()
                    .with("node", simple_name(node))
                    .with("observer", observer.as_str());
                Some(CompactionNotice {
                    node: node.to_string(),
                    text: expand(&config.compaction.message_template, &vars),
                    observer_pane: info.pane_id.clone(),
                    enter_count: config.enter_count_for(&key),
                    enter_delay: Duration::from_millis(config.enter_delay_ms),
                    observer: key,
                })
            })
            .collect()
    }

    /// Paste one notice into its observer's pane.
    pub fn deliver_notice(&self, notice: &CompactionNotice) {
        match notify_pane(
            self.transport.as_ref(),
            &notice.observer_pane,
            &notice.text,
            notice.enter_count,
            notice.enter_delay,
        ) {
            Ok(()) => tracing::info!(
                node = %notice.node,
                observer = %notice.observer,
                "compaction notice sent"
            ),
            Err(e) => tracing::warn!(
                node = %notice.node,
                observer = %notice.observer,
                error = %e,
                "failed to send compaction notice"
            ),
        }
    }

    /// Periodic check loop. `snapshot` yields the current configuration and
    /// node map on every tick; the loop ends when `cancel` fires.
    pub async fn start_check<F>(self: Arc<Self>, snapshot: F, cancel: CancellationToken)
    where
        F: Fn() -> (Arc<BusConfig>, Arc<NodeMap>) + Send + Sync + 'static,
    {
        let mut interval = tokio::time::interval(CHECK_INTERVAL);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = interval.tick() => {}
            }

            let (config, nodes) = snapshot();
            let delay = Duration::from_secs(config.compaction.delay_seconds);
            let monitor = Arc::clone(&self);
            let notices = run_blocking("compaction-check", move || {
                monitor.check_once_at(&config, &nodes, Utc::now())
            })
            .await
            .unwrap_or_default();

            for notice in notices {
                self.dispatch(notice, delay, cancel.clone());
            }
        }
        tracing::debug!("compaction check stopped");
    }

    /// Deliver now, or from a one-shot task after `delay`.
    fn dispatch(self: &Arc<Self>, notice: CompactionNotice, delay: Duration, cancel: CancellationToken) {
        let monitor = Arc::clone(self);
        spawn_supervised("compaction-notice", async move {
            if !delay.is_zero() {
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    _ = tokio::time::sleep(delay) => {}
                }
            }
            run_blocking("compaction-notice", move || monitor.deliver_notice(&notice)).await;
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pane::testing::RecordingTransport;
    use chrono::TimeZone;
    use postman_core::config::NodeConfig;
    use postman_core::node::NodeInfo;
    use std::path::Path;
    use tempfile::TempDir;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 2, 1, 12, 0, 0).unwrap()
    }

    fn node(pane: &str, session_dir: &Path) -> NodeInfo {
        NodeInfo {
            pane_id: pane.to_string(),
            session_name: "main".to_string(),
            session_dir: session_dir.to_path_buf(),
        }
    }

    fn setup() -> (TempDir, Arc<RecordingTransport>, BusConfig, NodeMap) {
        let tmp = TempDir::new().unwrap();
        let session_dir = tmp.path().join("main");
        let transport = Arc::new(RecordingTransport::default());
        let mut config = BusConfig::default();
        config.enter_delay_ms = 0;
        config.compaction.message_template = "{node} compacted; {observer} take note".to_string();
        config.nodes.insert(
            "critic".to_string(),
            NodeConfig {
                observes: vec!["worker".to_string()],
                ..Default::default()
            },
        );
        let mut nodes = NodeMap::new();
        nodes.insert("main:worker".to_string(), node("%2", &session_dir));
        nodes.insert("main:critic".to_string(), node("%7", &session_dir));
        (tmp, transport, config, nodes)
    }

    #[test]
    fn test_detection_notifies_observer() {
        let (_tmp, transport, config, nodes) = setup();
        transport.set_capture("%2", "...\nCompacting conversation...\n");
        let monitor = CompactionMonitor::new(transport.clone());

        let notices = monitor.check_once_at(&config, &nodes, t0());

        assert_eq!(notices.len(), 1);
        assert_eq!(notices[0].observer, "main:critic");
        assert_eq!(notices[0].observer_pane, "%7");
        assert_eq!(notices[0].text, "worker compacted; critic take note");
        assert_eq!(monitor.last_detection("main:worker"), Some(t0()));

        monitor.deliver_notice(&notices[0]);
        assert_eq!(transport.pastes()[0].0, "%7");
    }

    #[test]
    fn test_detection_saves_pane_snapshot() {
        let (tmp, transport, config, nodes) = setup();
        transport.set_capture("%2", "Compacting conversation");
        let monitor = CompactionMonitor::new(transport);

        monitor.check_once_at(&config, &nodes, t0());

        let snapshot = tmp.path().join("main/capture/20260201-120000-worker.txt");
        assert_eq!(std::fs::read_to_string(snapshot).unwrap(), "Compacting conversation");
    }

    #[test]
    fn test_detection_suppressed_within_window() {
        let (_tmp, transport, config, nodes) = setup();
        transport.set_capture("%2", "Compacting conversation");
        let monitor = CompactionMonitor::new(transport);

        assert_eq!(monitor.check_once_at(&config, &nodes, t0()).len(), 1);
        assert!(monitor
            .check_once_at(&config, &nodes, t0() + chrono::Duration::seconds(29))
            .is_empty());
        assert_eq!(
            monitor
                .check_once_at(&config, &nodes, t0() + chrono::Duration::seconds(30))
                .len(),
            1
        );
    }

    #[test]
    fn test_no_match_no_notice() {
        let (_tmp, transport, config, nodes) = setup();
        transport.set_capture("%2", "all quiet");
        let monitor = CompactionMonitor::new(transport);
        assert!(monitor.check_once_at(&config, &nodes, t0()).is_empty());
        assert!(monitor.last_detection("main:worker").is_none());
    }

    #[test]
    fn test_disabled_monitor_skips_capture() {
        let (_tmp, transport, mut config, nodes) = setup();
        transport.set_capture("%2", "Compacting conversation");
        config.compaction.enabled = false;
        let monitor = CompactionMonitor::new(transport);
        assert!(monitor.check_once_at(&config, &nodes, t0()).is_empty());
    }

    #[tokio::test]
    async fn test_delayed_dispatch_fires_after_delay() {
        let (_tmp, transport, _config, _nodes) = setup();
        let monitor = Arc::new(CompactionMonitor::new(transport.clone()));
        let notice = CompactionNotice {
            node: "main:worker".to_string(),
            observer: "main:critic".to_string(),
            observer_pane: "%7".to_string(),
            text: "late".to_string(),
            enter_count: 1,
            enter_delay: Duration::ZERO,
        };

        monitor.dispatch(notice, Duration::from_millis(50), CancellationToken::new());
        assert!(transport.pastes().is_empty());

        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(transport.pastes(), vec![("%7".to_string(), "late".to_string())]);
    }

    #[tokio::test]
    async fn test_delayed_dispatch_cancelled() {
        let (_tmp, transport, _config, _nodes) = setup();
        let monitor = Arc::new(CompactionMonitor::new(transport.clone()));
        let cancel = CancellationToken::new();
        let notice = CompactionNotice {
            node: "main:worker".to_string(),
            observer: "main:critic".to_string(),
            observer_pane: "%7".to_string(),
            text: "late".to_string(),
            enter_count: 1,
            enter_delay: Duration::ZERO,
        };

        monitor.dispatch(notice, Duration::from_millis(100), cancel.clone());
        cancel.cancel();
        tokio::time::sleep(Duration::from_millis(250)).await;
        assert!(transport.pastes().is_empty());
    }
}

//! Per-node activity tracking.
//!
//! [`ActivityTracker`] records when each node last sent and received a
//! message, whether it has answered the handshake PING, and how its pane
//! output has been changing. Idle reminders, dropped-ball nudges and pane
//! liveness are all derived from that one table.
//!
//! "Holding the ball" compares the last receive against the last send. With
//! several senders feeding one node, a reply to any of them clears the flag
//! for all of them, so this can report false negatives and positives under
//! fan-in.

use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::path::PathBuf;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};
use postman_core::config::{BusConfig, WatchdogConfig};
use postman_core::node::{simple_name, NodeMap};
use postman_core::template::{expand, TemplateVars};
use serde::Serialize;

use crate::layout::SessionLayout;

// ── Public types ──────────────────────────────────────────────────────────────

/// Activity facts for one node key.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ActivityState {
    pub last_sent_at: Option<DateTime<Utc>>,
    pub last_received_at: Option<DateTime<Utc>>,
    pub pong_received: bool,
    pub last_dropped_ball_notified_at: Option<DateTime<Utc>>,
    pub last_idle_reminder_at: Option<DateTime<Utc>>,
}

impl ActivityState {
    /// Received something after its last send.
    pub fn is_holding_ball(&self) -> bool {
        match (self.last_received_at, self.last_sent_at) {
            (None, _) => false,
            (Some(_), None) => true,
            (Some(received), Some(sent)) => received > sent,
        }
    }

    /// The later of the last send and the last receive.
    pub fn last_activity(&self) -> Option<DateTime<Utc>> {
        self.last_sent_at.max(self.last_received_at)
    }
}

/// Pane liveness derived from successive captures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PaneStatus {
    /// Output changed recently.
    Active,
    /// Output unchanged for at least the idle threshold.
    Idle,
    /// Output unchanged for at least the stale threshold.
    Stale,
    /// Capture failed.
    Unknown,
}

#[derive(Debug, Clone)]
struct PaneObservation {
    fingerprint: u64,
    changed_at: DateTime<Utc>,
    status: PaneStatus,
}

#[derive(Default)]
struct TrackerState {
    nodes: HashMap<String, ActivityState>,
    panes: HashMap<String, PaneObservation>,
}

// ── ActivityTracker ───────────────────────────────────────────────────────────

/// Thread-safe activity table shared by the router and background checks.
#[derive(Default)]
pub struct ActivityTracker {
    inner: Mutex<TrackerState>,
}

impl ActivityTracker {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, TrackerState> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    // ── Recording ─────────────────────────────────────────────────────────

    pub fn update_send_activity(&self, key: &str) {
        self.update_send_activity_at(key, Utc::now());
    }

    pub fn update_send_activity_at(&self, key: &str, now: DateTime<Utc>) {
        self.lock().nodes.entry(key.to_string()).or_default().last_sent_at = Some(now);
    }

    pub fn update_receive_activity(&self, key: &str) {
        self.update_receive_activity_at(key, Utc::now());
    }

    pub fn update_receive_activity_at(&self, key: &str, now: DateTime<Utc>) {
        self.lock()
            .nodes
            .entry(key.to_string())
            .or_default()
            .last_received_at = Some(now);
    }

    /// Record that `key` answered the handshake.
    pub fn mark_pong_received(&self, key: &str) {
        self.lock().nodes.entry(key.to_string()).or_default().pong_received = true;
        tracing::debug!(node = key, "handshake confirmed");
    }

    pub fn mark_dropped_ball_notified(&self, key: &str) {
        self.mark_dropped_ball_notified_at(key, Utc::now());
    }

    pub fn mark_dropped_ball_notified_at(&self, key: &str, now: DateTime<Utc>) {
        self.lock()
            .nodes
            .entry(key.to_string())
            .or_default()
            .last_dropped_ball_notified_at = Some(now);
    }

    // ── Queries ───────────────────────────────────────────────────────────

    pub fn is_holding_ball(&self, key: &str) -> bool {
        self.lock()
            .nodes
            .get(key)
            .is_some_and(ActivityState::is_holding_ball)
    }

    pub fn is_pong_received(&self, key: &str) -> bool {
        self.lock().nodes.get(key).is_some_and(|s| s.pong_received)
    }

    /// Copy of the state for `key`.
    pub fn state(&self, key: &str) -> Option<ActivityState> {
        self.lock().nodes.get(key).cloned()
    }

    /// Copy of every tracked state.
    pub fn snapshot(&self) -> HashMap<String, ActivityState> {
        self.lock().nodes.clone()
    }

    // ── Dropped balls ─────────────────────────────────────────────────────

    /// Nodes that have held the ball past their timeout and are due a nudge,
    /// with how long they have held it.
    pub fn check_dropped_balls(&self, config: &BusConfig) -> HashMap<String, Duration> {
        self.check_dropped_balls_at(config, Utc::now())
    }

    pub fn check_dropped_balls_at(
        &self,
        config: &BusConfig,
        now: DateTime<Utc>,
    ) -> HashMap<String, Duration> {
        self.dropped_balls(config, now, true)
    }

    /// Like [`check_dropped_balls_at`](Self::check_dropped_balls_at) but
    /// ignoring the notification cooldown, for display.
    pub fn currently_dropped_balls_at(
        &self,
        config: &BusConfig,
        now: DateTime<Utc>,
    ) -> HashMap<String, Duration> {
        self.dropped_balls(config, now, false)
    }

    fn dropped_balls(
        &self,
        config: &BusConfig,
        now: DateTime<Utc>,
        apply_cooldown: bool,
    ) -> HashMap<String, Duration> {
        let inner = self.lock();
        let mut dropped = HashMap::new();

        for (key, state) in &inner.nodes {
            let Some(node_cfg) = config.node(key) else {
                continue;
            };
            let timeout = node_cfg.dropped_ball_timeout_seconds;
            if timeout == 0 || !state.pong_received || !state.is_holding_ball() {
                continue;
            }
            let Some(received) = state.last_received_at else {
                continue;
            };

            let holding = elapsed(received, now);
            if holding <= Duration::from_secs(timeout) {
                continue;
            }

            if apply_cooldown {
                let cooldown = Duration::from_secs(node_cfg.dropped_ball_cooldown_seconds());
                let cooled = state
                    .last_dropped_ball_notified_at
                    .map_or(true, |at| elapsed(at, now) > cooldown);
                if !cooled {
                    continue;
                }
            }

            dropped.insert(key.clone(), holding);
        }

        dropped
    }

    // ── Idle reminders ────────────────────────────────────────────────────

    /// Nodes idle past their configured timeout whose reminder cooldown has
    /// elapsed, with their idle duration.
    pub fn idle_nodes_due_at(&self, config: &BusConfig, now: DateTime<Utc>) -> Vec<(String, Duration)> {
        let inner = self.lock();
        let mut due: Vec<(String, Duration)> = inner
            .nodes
            .iter()
            .filter_map(|(key, state)| {
                let node_cfg = config.node(key)?;
                if node_cfg.idle_timeout_seconds == 0 {
                    return None;
                }
                let idle = elapsed(state.last_activity()?, now);
                if idle <= Duration::from_secs(node_cfg.idle_timeout_seconds) {
                    return None;
                }
                let cooldown = Duration::from_secs(node_cfg.idle_cooldown_seconds());
                let cooled = state
                    .last_idle_reminder_at
                    .map_or(true, |at| elapsed(at, now) > cooldown);
                cooled.then(|| (key.clone(), idle))
            })
            .collect();
        due.sort_by(|a, b| a.0.cmp(&b.0));
        due
    }

    pub fn mark_idle_reminded_at(&self, key: &str, now: DateTime<Utc>) {
        self.lock()
            .nodes
            .entry(key.to_string())
            .or_default()
            .last_idle_reminder_at = Some(now);
    }

    /// Write an idle reminder into the inbox of every node that is due one.
    ///
    /// Reminders are system messages, so they bypass routing entirely. Nodes
    /// missing from `nodes` are skipped because their inbox cannot be located.
    pub fn check_idle_nodes(
        &self,
        config: &BusConfig,
        nodes: &NodeMap,
        context_id: &str,
        now: DateTime<Utc>,
    ) -> Vec<PathBuf> {
        let mut written = Vec::new();
        for (key, idle) in self.idle_nodes_due_at(config, now) {
            let Some(info) = nodes.get(&key) else {
                tracing::debug!(node = %key, "idle node not discovered; skipping reminder");
                continue;
            };
            let vars = TemplateVars::new()
                .with("node", simple_name(&key))
                .with("idle_seconds", idle.as_secs().to_string())
                .with("context_id", context_id);
            let body = expand(config.idle_reminder_message_for(&key), &vars);
            match SessionLayout::new(&info.session_dir).write_system_message(context_id, &key, &body, now) {
                Ok(path) => {
                    tracing::info!(node = %key, idle_secs = idle.as_secs(), "idle reminder sent");
                    self.mark_idle_reminded_at(&key, now);
                    written.push(path);
                }
                Err(e) => {
                    tracing::warn!(node = %key, error = %e, "failed to write idle reminder");
                }
            }
        }
        written
    }

    // ── Pane liveness ─────────────────────────────────────────────────────

    /// Fold a fresh pane capture into the liveness table.
    pub fn observe_pane_at(
        &self,
        key: &str,
        capture: &str,
        watchdog: &WatchdogConfig,
        now: DateTime<Utc>,
    ) -> PaneStatus {
        let fingerprint = fingerprint(capture);
        let mut inner = self.lock();
        let observation = inner
            .panes
            .entry(key.to_string())
            .or_insert(PaneObservation {
                fingerprint,
                changed_at: now,
                status: PaneStatus::Active,
            });

        if observation.fingerprint != fingerprint {
            observation.fingerprint = fingerprint;
            observation.changed_at = now;
        }

        let unchanged = elapsed(observation.changed_at, now);
        observation.status = if unchanged >= Duration::from_secs(watchdog.stale_threshold_seconds) {
            PaneStatus::Stale
        } else if unchanged >= Duration::from_secs(watchdog.idle_threshold_seconds) {
            PaneStatus::Idle
        } else {
            PaneStatus::Active
        };
        observation.status
    }

    /// Record that a pane could not be captured.
    pub fn mark_pane_unknown(&self, key: &str, now: DateTime<Utc>) {
        let mut inner = self.lock();
        let observation = inner
            .panes
            .entry(key.to_string())
            .or_insert(PaneObservation {
                fingerprint: 0,
                changed_at: now,
                status: PaneStatus::Unknown,
            });
        observation.status = PaneStatus::Unknown;
    }

    /// Latest liveness per node key.
    pub fn pane_statuses(&self) -> HashMap<String, PaneStatus> {
        self.lock()
            .panes
            .iter()
            .map(|(key, obs)| (key.clone(), obs.status))
            .collect()
    }
}

// ── Private helpers ───────────────────────────────────────────────────────────

/// Non-negative time from `then` to `now`.
fn elapsed(then: DateTime<Utc>, now: DateTime<Utc>) -> Duration {
    (now - then).to_std().unwrap_or_default()
}

fn fingerprint(text: &str) -> u64 {
    let mut hasher = DefaultHasher::new();
    text.trim_end().hash(&mut hasher);
    hasher.finish()
}

// ── Tests ─────────────────────────────────────────────────────────────────────

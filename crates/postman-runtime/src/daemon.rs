//! Daemon coordinator.
//!
//! One tokio task owns the filesystem watcher and reacts to:
//! - new files in any watched `post/` directory (rediscover, then deliver),
//! - inbox changes (debounced rescan for the presentation layer),
//! - configuration file changes (debounced reload, swapped atomically),
//! - the periodic discovery tick,
//! - cancellation.
//!
//! Idle checks, compaction checks and the pane heartbeat run as separate
//! supervised tasks that share [`SharedState`] and the same cancellation
//! token. Events flow out through an `mpsc` channel that closes when the
//! coordinator and every background task have stopped.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use chrono::{DateTime, Utc};
use notify::{EventKind as FsEventKind, RecommendedWatcher, RecursiveMode, Watcher};
use postman_core::adjacency::Adjacency;
use postman_core::config::{load_layered, BusConfig, ConfigPaths};
use postman_core::message::POSTMAN;
use postman_core::node::{session_of, simple_name, NodeMap};
use postman_core::template::{expand, TemplateVars};
use postman_core::{PostmanError, Result};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use walkdir::WalkDir;

use crate::activity::{ActivityTracker, PaneStatus};
use crate::alert::AlertCooldown;
use crate::compaction::CompactionMonitor;
use crate::discovery::NodeDirectory;
use crate::edges::EdgeLedger;
use crate::events::{DaemonEvent, EventKind};
use crate::layout::{SessionLayout, INBOX_DIR, POST_DIR};
use crate::observer::send_digest;
use crate::pane::{notify_pane, PaneTransport};
use crate::reminder::ReminderCounter;
use crate::router::{deliver, talks_to_line, DeliveryContext, DeliveryOutcome};
use crate::sessions::SessionToggles;
use crate::tasks::{run_blocking, spawn_supervised};

pub const INBOX_DEBOUNCE: Duration = Duration::from_millis(200);
pub const CONFIG_DEBOUNCE: Duration = Duration::from_millis(500);
pub const IDLE_CHECK_INTERVAL: Duration = Duration::from_secs(10);

const EVENT_BUFFER: usize = 64;
const ALERT_STATE_FILE: &str = "alerts.json";

// ── Shared state ──────────────────────────────────────────────────────────────

/// Configuration and the adjacency graph built from it. Swapped as a unit.
#[derive(Clone)]
pub struct Routing {
    pub config: Arc<BusConfig>,
    pub adjacency: Arc<Adjacency>,
}

/// State shared by the coordinator and every background task. Built once
/// at startup.
pub struct SharedState {
    routing: RwLock<Routing>,
    nodes: RwLock<Arc<NodeMap>>,
    pub activity: ActivityTracker,
    pub reminders: ReminderCounter,
    pub compaction: Arc<CompactionMonitor>,
    pub edges: EdgeLedger,
    pub alerts: AlertCooldown,
    pub toggles: SessionToggles,
    transport: Arc<dyn PaneTransport>,
}

impl SharedState {
    pub fn new(config: BusConfig, transport: Arc<dyn PaneTransport>, alerts: AlertCooldown) -> Result<Self> {
        let adjacency = config.adjacency()?;
        Ok(Self {
            toggles: SessionToggles::new(&config.disabled_sessions),
            routing: RwLock::new(Routing {
                config: Arc::new(config),
                adjacency: Arc::new(adjacency),
            }),
            nodes: RwLock::new(Arc::new(NodeMap::new())),
            activity: ActivityTracker::new(),
            reminders: ReminderCounter::new(Arc::clone(&transport)),
            compaction: Arc::new(CompactionMonitor::new(Arc::clone(&transport))),
            edges: EdgeLedger::new(),
            alerts,
            transport,
        })
    }

    pub fn routing(&self) -> Routing {
        self.routing.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn nodes(&self) -> Arc<NodeMap> {
        Arc::clone(&self.nodes.read().unwrap_or_else(|e| e.into_inner()))
    }

    pub fn set_nodes(&self, nodes: NodeMap) {
        *self.nodes.write().unwrap_or_else(|e| e.into_inner()) = Arc::new(nodes);
    }

    /// Install a new configuration. An invalid edge list leaves the current
    /// one in place.
    pub fn replace_config(&self, config: BusConfig) -> Result<()> {
        let adjacency = config.adjacency()?;
        self.toggles.replace(&config.disabled_sessions);
        *self.routing.write().unwrap_or_else(|e| e.into_inner()) = Routing {
            config: Arc::new(config),
            adjacency: Arc::new(adjacency),
        };
        Ok(())
    }

    pub fn transport(&self) -> &dyn PaneTransport {
        self.transport.as_ref()
    }
}

// ── Daemon ────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct DaemonOptions {
    pub context_id: String,
    /// `<base dir>/<context id>`; session directories live below it.
    pub context_dir: PathBuf,
    pub config_paths: ConfigPaths,
    /// The node this process belongs to, if any. Narrows inbox rescans.
    pub node: Option<String>,
}

pub struct Daemon {
    options: DaemonOptions,
    shared: Arc<SharedState>,
    directory: Arc<dyn NodeDirectory>,
}

impl Daemon {
    pub fn new(
        options: DaemonOptions,
        config: BusConfig,
        transport: Arc<dyn PaneTransport>,
        directory: Arc<dyn NodeDirectory>,
    ) -> Result<Self> {
        let alerts = AlertCooldown::with_state_file(
            Duration::from_secs(config.watchdog.alert_cooldown_seconds),
            &options.context_dir.join(ALERT_STATE_FILE),
        );
        let shared = Arc::new(SharedState::new(config, transport, alerts)?);
        Ok(Self {
            options,
            shared,
            directory,
        })
    }

    pub fn shared(&self) -> Arc<SharedState> {
        Arc::clone(&self.shared)
    }

    /// Spawn the coordinator. Returns the event stream and a handle; the
    /// stream ends after `cancel` fires and every task has stopped.
    pub fn start(self, cancel: CancellationToken) -> (mpsc::Receiver<DaemonEvent>, DaemonHandle) {
        let (tx, rx) = mpsc::channel(EVENT_BUFFER);
        let token = cancel.clone();
        let handle = tokio::spawn(async move {
            Coordinator::new(self, tx, token).run().await;
        });
        (rx, DaemonHandle { handle, cancel })
    }
}

/// Handle to a running daemon.
pub struct DaemonHandle {
    handle: JoinHandle<()>,
    cancel: CancellationToken,
}

impl DaemonHandle {
    /// Ask every task to stop.
    pub fn shutdown(&self) {
        self.cancel.cancel();
    }

    /// Wait for the coordinator task to finish.
    pub async fn join(self) {
        if let Err(e) = self.handle.await {
            if e.is_panic() {
                tracing::error!("daemon coordinator panicked");
            }
        }
    }
}

// ── Coordinator ───────────────────────────────────────────────────────────────

enum FsTarget {
    Post(PathBuf),
    Inbox,
    Config,
    /// A configuration directory, or one of its parents, appeared.
    ConfigDir,
}

struct Coordinator {
    options: DaemonOptions,
    shared: Arc<SharedState>,
    directory: Arc<dyn NodeDirectory>,
    tx: mpsc::Sender<DaemonEvent>,
    cancel: CancellationToken,
    watcher: Option<RecommendedWatcher>,
    watched: HashSet<PathBuf>,
    config_watched: HashSet<PathBuf>,
    known: HashSet<String>,
}

impl Coordinator {
    fn new(daemon: Daemon, tx: mpsc::Sender<DaemonEvent>, cancel: CancellationToken) -> Self {
        Self {
            options: daemon.options,
            shared: daemon.shared,
            directory: daemon.directory,
            tx,
            cancel,
            watcher: None,
            watched: HashSet::new(),
            config_watched: HashSet::new(),
            known: HashSet::new(),
        }
    }

    async fn run(mut self) {
        let (fs_tx, mut fs_rx) = mpsc::unbounded_channel::<notify::Event>();
        match notify::recommended_watcher(move |res: notify::Result<notify::Event>| match res {
            Ok(event) => {
                let _ = fs_tx.send(event);
            }
            Err(e) => tracing::warn!(error = %e, "filesystem watch error"),
        }) {
            Ok(watcher) => self.watcher = Some(watcher),
            Err(e) => {
                tracing::error!(error = %e, "failed to create filesystem watcher; relying on discovery ticks");
                self.emit(DaemonEvent::error(format!("filesystem watcher unavailable: {e}")))
                    .await;
            }
        }

        self.watch_config();
        self.refresh_nodes().await;
        self.sweep_posts().await;
        self.spawn_background();
        self.emit_status("daemon started").await;
        tracing::info!(context = %self.options.context_id, "daemon started");

        let scan = Duration::from_secs(self.shared.routing().config.scan_interval_seconds.max(1));
        let mut discovery = tokio::time::interval(scan);
        discovery.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        discovery.tick().await;

        let mut inbox_pending = false;
        let mut config_pending = false;

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                Some(event) = fs_rx.recv() => {
                    for target in self.classify(&event) {
                        match target {
                            FsTarget::Post(path) => self.handle_post(path).await,
                            FsTarget::Inbox => inbox_pending = true,
                            FsTarget::Config => config_pending = true,
                            FsTarget::ConfigDir => {
                                self.watch_config();
                                config_pending = true;
                            }
                        }
                    }
                }
                _ = tokio::time::sleep(INBOX_DEBOUNCE), if inbox_pending => {
                    inbox_pending = false;
                    self.rescan_inbox().await;
                }
                _ = tokio::time::sleep(CONFIG_DEBOUNCE), if config_pending => {
                    config_pending = false;
                    self.reload_config().await;
                }
                _ = discovery.tick() => {
                    self.refresh_nodes().await;
                }
            }
        }

        self.emit_status("daemon stopped").await;
        tracing::info!(context = %self.options.context_id, "daemon stopped");
    }

    // ── Events ────────────────────────────────────────────────────────────

    async fn emit(&self, event: DaemonEvent) {
        send_event(&self.tx, event).await;
    }

    async fn emit_status(&self, message: &str) {
        let nodes = self.shared.nodes();
        let sessions: HashSet<&str> = nodes.values().map(|n| n.session_name.as_str()).collect();
        self.emit(DaemonEvent::status(message, nodes.len(), sessions.len()))
            .await;
    }

    async fn emit_outcome(&self, outcome: DeliveryOutcome) {
        let event = match outcome {
            DeliveryOutcome::Duplicate => return,
            DeliveryOutcome::Acknowledged { from, path } => {
                DaemonEvent::new(EventKind::MessageReceived, format!("handshake from {from}"))
                    .with("from", from)
                    .with("to", POSTMAN)
                    .with("path", path)
            }
            DeliveryOutcome::Denied { from, to, path, .. } => {
                DaemonEvent::error(format!("routing denied: {from} -> {to}"))
                    .with("from", from)
                    .with("to", to)
                    .with("path", path)
            }
            DeliveryOutcome::DeadLettered { reason, path } => {
                DaemonEvent::error(format!("dead-lettered: {}", reason.as_str()))
                    .with("reason", reason.as_str())
                    .with("path", path)
            }
            DeliveryOutcome::Delivered { from, to, path } => {
                let system = from == POSTMAN;
                self.emit(
                    DaemonEvent::new(EventKind::MessageReceived, format!("{from} -> {to}"))
                        .with("from", &from)
                        .with("to", &to)
                        .with("path", path),
                )
                .await;
                if system {
                    return;
                }
                DaemonEvent::new(EventKind::EdgeUpdate, "edge activity")
                    .with("edges", self.shared.edges.snapshot())
            }
        };
        self.emit(event).await;
    }

    // ── Watching ──────────────────────────────────────────────────────────

    /// Watch every configuration directory. One that does not exist yet is
    /// covered by watching its nearest existing ancestor; when it appears,
    /// the resulting `ConfigDir` event calls this again.
    fn watch_config(&mut self) {
        let Some(watcher) = self.watcher.as_mut() else {
            return;
        };
        for dir in self.options.config_paths.watch_dirs() {
            let Some(target) = dir.ancestors().find(|d| d.is_dir()).map(Path::to_path_buf) else {
                continue;
            };
            if self.config_watched.contains(&target) {
                continue;
            }
            match watcher.watch(&target, RecursiveMode::NonRecursive) {
                Ok(()) => {
                    if target != dir {
                        tracing::info!(
                            dir = %dir.display(),
                            watching = %target.display(),
                            "config directory missing; watching nearest parent"
                        );
                    }
                    self.config_watched.insert(target);
                }
                Err(e) => {
                    tracing::warn!(path = %target.display(), error = %e, "failed to watch config directory");
                }
            }
        }
    }

    fn watch_session(&mut self, root: &Path) {
        if !self.watched.insert(root.to_path_buf()) {
            return;
        }
        let layout = SessionLayout::new(root);
        let Some(watcher) = self.watcher.as_mut() else {
            return;
        };
        for (dir, mode) in [
            (layout.post(), RecursiveMode::NonRecursive),
            (layout.inbox_root(), RecursiveMode::Recursive),
        ] {
            if let Err(e) = watcher.watch(&dir, mode) {
                tracing::warn!(path = %dir.display(), error = %e, "failed to watch session directory");
            }
        }
        tracing::debug!(session = %root.display(), "watching session");
    }

    fn classify(&self, event: &notify::Event) -> Vec<FsTarget> {
        if matches!(event.kind, FsEventKind::Access(_)) {
            return Vec::new();
        }
        let arriving = matches!(
            event.kind,
            FsEventKind::Create(_) | FsEventKind::Modify(_) | FsEventKind::Any
        );

        event
            .paths
            .iter()
            .filter_map(|path| {
                if self.options.config_paths.is_config_file(path) {
                    Some(FsTarget::Config)
                } else if self.is_config_dir_or_parent(path) {
                    Some(FsTarget::ConfigDir)
                } else if is_post_file(path) {
                    arriving.then(|| FsTarget::Post(path.clone()))
                } else if path.components().any(|c| c.as_os_str() == INBOX_DIR) {
                    Some(FsTarget::Inbox)
                } else {
                    None
                }
            })
            .collect()
    }

    fn is_config_dir_or_parent(&self, path: &Path) -> bool {
        self.options
            .config_paths
            .watch_dirs()
            .iter()
            .any(|dir| dir.starts_with(path))
    }

    // ── Discovery ─────────────────────────────────────────────────────────

    /// Rediscover nodes. New nodes get their directories created and
    /// watched and a greeting scheduled.
    async fn refresh_nodes(&mut self) {
        let directory = Arc::clone(&self.directory);
        let discovered = match run_blocking("discovery", move || directory.discover()).await {
            Some(Ok(nodes)) => nodes,
            Some(Err(e)) => {
                tracing::warn!(error = %e, "node discovery failed; keeping previous map");
                self.emit(DaemonEvent::error(format!("node discovery failed: {e}")))
                    .await;
                return;
            }
            None => return,
        };

        let mut new_nodes: Vec<String> = discovered
            .keys()
            .filter(|key| !self.known.contains(*key))
            .cloned()
            .collect();
        new_nodes.sort();

        for key in &new_nodes {
            let root = discovered[key].session_dir.clone();
            if let Err(e) = SessionLayout::new(&root).ensure(&[key]) {
                tracing::warn!(node = %key, error = %e, "failed to create session directories");
            }
            self.watch_session(&root);
        }

        self.shared.set_nodes(discovered);

        if new_nodes.is_empty() {
            return;
        }
        for key in new_nodes {
            tracing::info!(node = %key, "node discovered");
            self.known.insert(key.clone());
            self.schedule_greeting(key);
        }
        self.emit_status("nodes discovered").await;
    }

    fn schedule_greeting(&self, key: String) {
        let shared = Arc::clone(&self.shared);
        let cancel = self.cancel.clone();
        let context_id = self.options.context_id.clone();
        let delay = Duration::from_secs(shared.routing().config.greeting_delay_seconds);

        spawn_supervised("greeting", async move {
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = tokio::time::sleep(delay) => {}
            }
            run_blocking("greeting", move || {
                if let Err(e) = send_greeting(&shared, &context_id, &key, Utc::now()) {
                    tracing::warn!(node = %key, error = %e, "failed to send greeting");
                }
            })
            .await;
        });
    }

    // ── Delivery ──────────────────────────────────────────────────────────

    /// Deliver files left in `post/` while no daemon was running.
    async fn sweep_posts(&mut self) {
        let mut roots: Vec<PathBuf> = self.watched.iter().cloned().collect();
        roots.sort();

        for root in roots {
            let post = SessionLayout::new(&root).post();
            let Ok(entries) = std::fs::read_dir(&post) else {
                continue;
            };
            let mut files: Vec<PathBuf> = entries
                .filter_map(|e| e.ok().map(|e| e.path()))
                .filter(|p| is_post_file(p))
                .collect();
            files.sort();
            if !files.is_empty() {
                tracing::info!(session = %root.display(), count = files.len(), "delivering pending posts");
            }
            for file in files {
                self.handle_post(file).await;
            }
        }
    }

    async fn handle_post(&mut self, path: PathBuf) {
        self.refresh_nodes().await;

        let shared = Arc::clone(&self.shared);
        let context_id = self.options.context_id.clone();
        let result = run_blocking("deliver", move || deliver_and_record(&shared, &context_id, &path)).await;

        match result {
            Some(Ok(outcome)) => self.emit_outcome(outcome).await,
            Some(Err(e)) => {
                tracing::error!(error = %e, "delivery failed");
                self.emit(DaemonEvent::error(format!("delivery failed: {e}"))).await;
            }
            None => {}
        }
    }

    // ── Inbox / config ────────────────────────────────────────────────────

    async fn rescan_inbox(&self) {
        let roots: Vec<PathBuf> = self.watched.iter().cloned().collect();
        let only = self.options.node.clone();
        let unread = run_blocking("inbox-rescan", move || count_unread(&roots, only.as_deref()))
            .await
            .unwrap_or_default();
        self.emit(DaemonEvent::new(EventKind::StatusUpdate, "inbox updated").with("unread", unread))
            .await;
    }

    async fn reload_config(&self) {
        let paths = self.options.config_paths.clone();
        let loaded = run_blocking("config-reload", move || load_layered(&paths)).await;
        let Some(loaded) = loaded else {
            return;
        };

        match loaded.and_then(|config| self.shared.replace_config(config)) {
            Ok(()) => {
                let routing = self.shared.routing();
                let edges: Vec<String> = routing
                    .adjacency
                    .edges()
                    .into_iter()
                    .map(|(a, b)| format!("{a} -- {b}"))
                    .collect();
                tracing::info!(edges = edges.len(), "configuration reloaded");
                self.emit(
                    DaemonEvent::new(EventKind::ConfigUpdate, "configuration reloaded")
                        .with("edges", edges)
                        .with("disabled_sessions", self.shared.toggles.disabled()),
                )
                .await;
            }
            Err(e) => {
                tracing::warn!(error = %e, "configuration reload failed; keeping previous configuration");
                self.emit(DaemonEvent::error(format!("configuration reload failed: {e}")))
                    .await;
            }
        }
    }

    // ── Background tasks ──────────────────────────────────────────────────

    fn spawn_background(&self) {
        let context_id = self.options.context_id.clone();
        spawn_supervised(
            "idle-check",
            idle_loop(
                Arc::clone(&self.shared),
                context_id,
                self.tx.clone(),
                self.cancel.clone(),
            ),
        );

        let snapshot_state = Arc::clone(&self.shared);
        let snapshot = move || (snapshot_state.routing().config, snapshot_state.nodes());
        spawn_supervised(
            "compaction-check",
            Arc::clone(&self.shared.compaction).start_check(snapshot, self.cancel.clone()),
        );

        if self.shared.routing().config.watchdog.enabled {
            spawn_supervised(
                "heartbeat",
                heartbeat_loop(Arc::clone(&self.shared), self.tx.clone(), self.cancel.clone()),
            );
        }
    }
}

async fn send_event(tx: &mpsc::Sender<DaemonEvent>, event: DaemonEvent) {
    if tx.send(event).await.is_err() {
        tracing::debug!("event receiver dropped");
    }
}

fn is_post_file(path: &Path) -> bool {
    path.extension().is_some_and(|ext| ext == "md")
        && path
            .parent()
            .and_then(Path::file_name)
            .is_some_and(|name| name == POST_DIR)
}

// ── Delivery with side effects ────────────────────────────────────────────────

/// Route one post file, then update the edge ledger, observers and reminder
/// counter for agent-to-agent deliveries.
pub fn deliver_and_record(shared: &SharedState, context_id: &str, path: &Path) -> Result<DeliveryOutcome> {
    let routing = shared.routing();
    let nodes = shared.nodes();
    let enabled = |session: &str| shared.toggles.is_enabled(session);
    let ctx = DeliveryContext {
        context_id,
        nodes: &nodes,
        adjacency: &routing.adjacency,
        config: &routing.config,
        session_enabled: &enabled,
        transport: shared.transport(),
        activity: &shared.activity,
    };

    let outcome = deliver(path, &ctx)?;

    if let DeliveryOutcome::Delivered { from, to, path } = &outcome {
        if from != POSTMAN {
            shared.edges.record_at(from, to, Utc::now());
            let filename = path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default();
            send_digest(shared.transport(), &routing.config, &nodes, from, to, &filename);
            shared.reminders.increment(to, &nodes, &routing.config);
        }
    }
    Ok(outcome)
}

// ── Greeting ──────────────────────────────────────────────────────────────────

/// Post a PING from postman to `key`. The file goes through `post/` so the
/// router delivers and announces it like any other message.
pub fn send_greeting(shared: &SharedState, context_id: &str, key: &str, now: DateTime<Utc>) -> Result<PathBuf> {
    let nodes = shared.nodes();
    let info = nodes
        .get(key)
        .ok_or_else(|| PostmanError::UnknownNode(key.to_string()))?;
    let routing = shared.routing();

    let reply = expand(
        &routing.config.reply_command,
        &TemplateVars::new()
            .with("context_id", context_id)
            .with("from", POSTMAN),
    );
    let vars = TemplateVars::new()
        .with("node", simple_name(key))
        .with("context_id", context_id)
        .with(
            "talks_to_line",
            talks_to_line(&routing.adjacency, &shared.activity, &nodes, key),
        )
        .with("reply_command", reply);
    let body = expand(&routing.config.ping_template, &vars);

    let posted = SessionLayout::new(&info.session_dir).post_message(context_id, POSTMAN, simple_name(key), &body, now)?;
    tracing::info!(node = %key, "greeting posted");
    Ok(posted)
}

// ── Idle / dropped-ball check ─────────────────────────────────────────────────

async fn idle_loop(
    shared: Arc<SharedState>,
    context_id: String,
    tx: mpsc::Sender<DaemonEvent>,
    cancel: CancellationToken,
) {
    let mut interval = tokio::time::interval(IDLE_CHECK_INTERVAL);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = interval.tick() => {}
        }

        let state = Arc::clone(&shared);
        let id = context_id.clone();
        let dropped = run_blocking("idle-check", move || run_idle_check(&state, &id, Utc::now()))
            .await
            .unwrap_or_default();
        if !dropped.is_empty() {
            send_event(
                &tx,
                DaemonEvent::new(EventKind::StatusUpdate, "dropped balls").with("dropped_balls", dropped),
            )
            .await;
        }
    }
    tracing::debug!("idle check stopped");
}

/// One idle pass: write due idle reminders, nudge nodes that dropped the
/// ball, and return every node currently holding a dropped ball with how
/// many seconds it has held it.
pub fn run_idle_check(shared: &SharedState, context_id: &str, now: DateTime<Utc>) -> BTreeMap<String, u64> {
    let routing = shared.routing();
    let nodes = shared.nodes();
    let config = &routing.config;

    shared.activity.check_idle_nodes(config, &nodes, context_id, now);

    let mut due: Vec<(String, Duration)> = shared.activity.check_dropped_balls_at(config, now).into_iter().collect();
    due.sort();
    for (key, held) in due {
        let Some(info) = nodes.get(&key) else {
            continue;
        };
        let vars = TemplateVars::new()
            .with("node", simple_name(&key))
            .with("holding_seconds", held.as_secs().to_string());
        let text = expand(config.dropped_ball_message_for(&key), &vars);
        match notify_pane(
            shared.transport(),
            &info.pane_id,
            &text,
            config.enter_count_for(&key),
            Duration::from_millis(config.enter_delay_ms),
        ) {
            Ok(()) => tracing::info!(node = %key, held_secs = held.as_secs(), "dropped-ball nudge sent"),
            Err(e) => tracing::warn!(node = %key, error = %e, "failed to send dropped-ball nudge"),
        }
        shared.activity.mark_dropped_ball_notified_at(&key, now);
    }

    shared
        .activity
        .currently_dropped_balls_at(config, now)
        .into_iter()
        .map(|(key, held)| (key, held.as_secs()))
        .collect()
}

// ── Heartbeat / pane watchdog ─────────────────────────────────────────────────

/// Result of one heartbeat pass.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct HeartbeatReport {
    pub statuses: BTreeMap<String, PaneStatus>,
    /// Alerts raised this pass, after cooldown filtering.
    pub alerts: Vec<String>,
}

async fn heartbeat_loop(shared: Arc<SharedState>, tx: mpsc::Sender<DaemonEvent>, cancel: CancellationToken) {
    let period = Duration::from_secs(
        shared
            .routing()
            .config
            .watchdog
            .heartbeat_interval_seconds
            .max(1),
    );
    let mut interval = tokio::time::interval(period);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = interval.tick() => {}
        }

        let state = Arc::clone(&shared);
        let Some(report) = run_blocking("heartbeat", move || run_heartbeat(&state, Utc::now())).await else {
            continue;
        };
        for alert in &report.alerts {
            send_event(&tx, DaemonEvent::error(alert.clone())).await;
        }
        let mut event = DaemonEvent::new(EventKind::PaneStatusUpdate, "pane status");
        for (key, status) in &report.statuses {
            event = event.with(key, status);
        }
        send_event(&tx, event).await;
    }
    tracing::debug!("heartbeat stopped");
}

/// Capture every pane once, classify it, and raise cooldown-limited alerts
/// for stale panes and for sessions in which no pane is active.
pub fn run_heartbeat(shared: &SharedState, now: DateTime<Utc>) -> HeartbeatReport {
    let routing = shared.routing();
    let nodes = shared.nodes();
    let watchdog = &routing.config.watchdog;
    let tail = routing.config.compaction.tail_lines;

    let mut report = HeartbeatReport::default();
    for (key, info) in nodes.iter() {
        let status = match shared.transport().capture(&info.pane_id, tail) {
            Ok(capture) => shared.activity.observe_pane_at(key, &capture, watchdog, now),
            Err(e) => {
                tracing::debug!(node = %key, error = %e, "heartbeat capture failed");
                shared.activity.mark_pane_unknown(key, now);
                PaneStatus::Unknown
            }
        };
        report.statuses.insert(key.clone(), status);
    }

    for (key, status) in &report.statuses {
        let alert_key = format!("pane:{key}");
        match status {
            PaneStatus::Stale => {
                if raise_alert(&shared.alerts, &alert_key, now) {
                    tracing::warn!(node = %key, "pane output is stale");
                    report.alerts.push(format!(
                        "{key}: pane output unchanged for {}s or more",
                        watchdog.stale_threshold_seconds
                    ));
                }
            }
            PaneStatus::Active => shared.alerts.clear(&alert_key),
            PaneStatus::Idle | PaneStatus::Unknown => {}
        }
    }

    let mut sessions: BTreeMap<&str, Vec<PaneStatus>> = BTreeMap::new();
    for (key, status) in &report.statuses {
        sessions
            .entry(session_of(key).unwrap_or_default())
            .or_default()
            .push(*status);
    }
    for (session, statuses) in sessions {
        let alert_key = format!("session:{session}");
        let all_quiet = statuses
            .iter()
            .all(|s| matches!(s, PaneStatus::Idle | PaneStatus::Stale));
        if !all_quiet {
            shared.alerts.clear(&alert_key);
            continue;
        }
        if raise_alert(&shared.alerts, &alert_key, now) {
            tracing::warn!(session, "every node in session is idle");
            report.alerts.push(format!("session {session}: every node is idle"));
        }
    }

    report
}

fn raise_alert(alerts: &AlertCooldown, key: &str, now: DateTime<Utc>) -> bool {
    if !alerts.should_send_alert_at(key, now) {
        return false;
    }
    alerts.mark_alert_sent_at(key, now);
    true
}

// ── Inbox counting ────────────────────────────────────────────────────────────

/// Messages waiting in each inbox under `roots`, keyed by `session:node`.
/// With `only` set, other nodes are left out.
pub fn count_unread(roots: &[PathBuf], only: Option<&str>) -> HashMap<String, usize> {
    let mut counts = HashMap::new();
    for root in roots {
        let layout = SessionLayout::new(root);
        let session = layout.session_name();
        for entry in WalkDir::new(layout.inbox_root())
            .min_depth(2)
            .max_depth(2)
            .into_iter()
            .filter_map(|e| e.ok())
        {
            if !entry.file_type().is_file() || !entry.path().extension().is_some_and(|ext| ext == "md") {
                continue;
            }
            let Some(node) = entry
                .path()
                .parent()
                .and_then(Path::file_name)
                .map(|n| n.to_string_lossy().into_owned())
            else {
                continue;
            };
            if only.is_some_and(|o| simple_name(o) != node) {
                continue;
            }
            *counts.entry(format!("{session}:{node}")).or_insert(0) += 1;
        }
    }
    counts
}

// ── Tests ─────────────────────────────────────────────────────────────────────

//! Bus configuration and its layered TOML loader.
//!
//! Layers, lowest precedence first:
//! 1. built-in defaults ([`BusConfig::default`]),
//! 2. the user file (`~/.config/postman/postman.toml`),
//! 3. per-node files (`~/.config/postman/nodes/<node>.toml`, merged under
//!    `[nodes.<node>]`),
//! 4. the project overlay (`./.postman/postman.toml`).
//!
//! Tables deep-merge; scalars and arrays from a later layer replace earlier
//! ones. The merged document is deserialised once, so missing keys fall back
//! to the defaults.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::adjacency::Adjacency;
use crate::error::{PostmanError, Result};
use crate::node::simple_name;

// ── Defaults ──────────────────────────────────────────────────────────────────

pub const DEFAULT_NOTIFICATION_TEMPLATE: &str = "New message from {from} ({timestamp}).\n\
Read it: {inbox_path}\n\
{talks_to_line}\n\
Reply with: {reply_command}\n\
{template}";

pub const DEFAULT_PING_TEMPLATE: &str = "PING from postman (context {context_id}). \
You are {node}. {talks_to_line} \
Confirm you are listening by replying to postman: {reply_command}";

pub const DEFAULT_DIGEST_TEMPLATE: &str = "[digest] {from} -> {to}: {filename}";

pub const DEFAULT_REPLY_COMMAND: &str = "postman send --context-id {context_id} --to {from}";

pub const DEFAULT_EDGE_VIOLATION_TEMPLATE: &str =
    "Message to {to} was not delivered: there is no edge between {from} and {to}. \
{talks_to_line}";

pub const DEFAULT_REMINDER_MESSAGE: &str =
    "Reminder for {node}: {count} messages have arrived since the last reminder. Check your inbox.";

pub const DEFAULT_IDLE_REMINDER_MESSAGE: &str =
    "You have been idle for {idle_seconds}s. If you are waiting on someone, say so; \
otherwise continue with your task.";

pub const DEFAULT_DROPPED_BALL_MESSAGE: &str =
    "You received a message {holding_seconds}s ago and have not replied. Please respond.";

pub const DEFAULT_COMPACTION_PATTERN: &str = "Compacting conversation";

pub const DEFAULT_COMPACTION_MESSAGE: &str =
    "{node} is compacting its context. Re-send anything it may have lost.";

// ── Config types ──────────────────────────────────────────────────────────────

/// How a routing-denied sender is told about the violation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WarningMode {
    /// One-line warning.
    #[default]
    Compact,
    /// Warning followed by reply-command steps.
    Verbose,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct EdgeViolationConfig {
    pub mode: WarningMode,
    pub template: String,
}

impl Default for EdgeViolationConfig {
    fn default() -> Self {
        Self {
            mode: WarningMode::Compact,
            template: DEFAULT_EDGE_VIOLATION_TEMPLATE.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct CompactionConfig {
    pub enabled: bool,
    /// Substring searched for in the captured pane tail.
    pub pattern: String,
    /// Seconds to wait before notifying observers; 0 notifies immediately.
    pub delay_seconds: u64,
    pub tail_lines: usize,
    pub message_template: String,
}

impl Default for CompactionConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            pattern: DEFAULT_COMPACTION_PATTERN.to_string(),
            delay_seconds: 0,
            tail_lines: 20,
            message_template: DEFAULT_COMPACTION_MESSAGE.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct WatchdogConfig {
    pub enabled: bool,
    pub heartbeat_interval_seconds: u64,
    /// Pane content unchanged this long counts as idle.
    pub idle_threshold_seconds: u64,
    /// Pane content unchanged this long counts as stale.
    pub stale_threshold_seconds: u64,
    pub alert_cooldown_seconds: u64,
}

impl Default for WatchdogConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            heartbeat_interval_seconds: 30,
            idle_threshold_seconds: 300,
            stale_threshold_seconds: 900,
            alert_cooldown_seconds: 600,
        }
    }
}

/// Per-node overrides, keyed by simple node name in [`BusConfig::nodes`].
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    /// Free text appended to this node's notifications.
    pub template: String,
    /// 0 disables idle reminders.
    pub idle_timeout_seconds: u64,
    pub idle_cooldown_seconds: Option<u64>,
    pub idle_reminder_message: Option<String>,
    /// 0 disables dropped-ball detection.
    pub dropped_ball_timeout_seconds: u64,
    pub dropped_ball_cooldown_seconds: Option<u64>,
    pub dropped_ball_message: Option<String>,
    pub reminder_interval: Option<u32>,
    pub reminder_message: Option<String>,
    /// Nodes whose traffic and compaction events this node is told about.
    pub observes: Vec<String>,
    pub enter_count: Option<u8>,
}

/// The complete, immutable bus configuration.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct BusConfig {
    pub scan_interval_seconds: u64,
    pub edges: Vec<String>,
    pub disabled_sessions: Vec<String>,
    pub notification_template: String,
    pub ping_template: String,
    pub digest_template: String,
    pub reply_command: String,
    /// Deliveries per reminder; 0 disables reminders.
    pub reminder_interval: u32,
    pub reminder_message: String,
    pub idle_reminder_message: String,
    pub dropped_ball_message: String,
    /// Enter keystrokes after a paste (1 or 2).
    pub enter_count: u8,
    pub enter_delay_ms: u64,
    pub greeting_delay_seconds: u64,
    pub edge_violation: EdgeViolationConfig,
    pub compaction: CompactionConfig,
    pub watchdog: WatchdogConfig,
    pub nodes: BTreeMap<String, NodeConfig>,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            scan_interval_seconds: 10,
            edges: Vec::new(),
            disabled_sessions: Vec::new(),
            notification_template: DEFAULT_NOTIFICATION_TEMPLATE.to_string(),
            ping_template: DEFAULT_PING_TEMPLATE.to_string(),
            digest_template: DEFAULT_DIGEST_TEMPLATE.to_string(),
            reply_command: DEFAULT_REPLY_COMMAND.to_string(),
            reminder_interval: 0,
            reminder_message: DEFAULT_REMINDER_MESSAGE.to_string(),
            idle_reminder_message: DEFAULT_IDLE_REMINDER_MESSAGE.to_string(),
            dropped_ball_message: DEFAULT_DROPPED_BALL_MESSAGE.to_string(),
            enter_count: 1,
            enter_delay_ms: 300,
            greeting_delay_seconds: 3,
            edge_violation: EdgeViolationConfig::default(),
            compaction: CompactionConfig::default(),
            watchdog: WatchdogConfig::default(),
            nodes: BTreeMap::new(),
        }
    }
}

impl BusConfig {
    /// Parse a single TOML document on top of the defaults.
    pub fn from_toml_str(content: &str) -> Result<Self> {
        let config: BusConfig = toml::from_str(content).map_err(|e| PostmanError::ConfigParse {
            path: PathBuf::from("<inline>"),
            source: e,
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Reject values the runtime cannot honour.
    pub fn validate(&self) -> Result<()> {
        if self.scan_interval_seconds == 0 {
            return Err(PostmanError::Config(
                "scan_interval_seconds must be at least 1".to_string(),
            ));
        }
        let counts = std::iter::once(("(global)", Some(self.enter_count))).chain(
            self.nodes
                .iter()
                .map(|(name, node)| (name.as_str(), node.enter_count)),
        );
        for (name, count) in counts {
            if let Some(count) = count {
                if !(1..=2).contains(&count) {
                    return Err(PostmanError::Config(format!(
                        "enter_count for {name} must be 1 or 2, got {count}"
                    )));
                }
            }
        }
        self.adjacency()?;
        Ok(())
    }

    /// Routing graph described by [`BusConfig::edges`].
    pub fn adjacency(&self) -> Result<Adjacency> {
        Adjacency::parse(&self.edges)
    }

    /// Overrides for `node` (simple or session-qualified name).
    pub fn node(&self, node: &str) -> Option<&NodeConfig> {
        self.nodes.get(simple_name(node))
    }

    pub fn reminder_interval_for(&self, node: &str) -> u32 {
        self.node(node)
            .and_then(|n| n.reminder_interval)
            .unwrap_or(self.reminder_interval)
    }

    pub fn reminder_message_for(&self, node: &str) -> &str {
        self.node(node)
            .and_then(|n| n.reminder_message.as_deref())
            .unwrap_or(&self.reminder_message)
    }

    pub fn enter_count_for(&self, node: &str) -> u8 {
        self.node(node)
            .and_then(|n| n.enter_count)
            .unwrap_or(self.enter_count)
            .clamp(1, 2)
    }

    pub fn idle_reminder_message_for(&self, node: &str) -> &str {
        self.node(node)
            .and_then(|n| n.idle_reminder_message.as_deref())
            .unwrap_or(&self.idle_reminder_message)
    }

    pub fn dropped_ball_message_for(&self, node: &str) -> &str {
        self.node(node)
            .and_then(|n| n.dropped_ball_message.as_deref())
            .unwrap_or(&self.dropped_ball_message)
    }

    /// Simple names of nodes whose `observes` list contains `node`.
    pub fn observers_of(&self, node: &str) -> Vec<String> {
        let target = simple_name(node);
        self.nodes
            .iter()
            .filter(|(_, cfg)| cfg.observes.iter().any(|o| simple_name(o) == target))
            .map(|(name, _)| name.clone())
            .collect()
    }
}

impl NodeConfig {
    /// Cooldown between idle reminders; defaults to the idle timeout.
    pub fn idle_cooldown_seconds(&self) -> u64 {
        self.idle_cooldown_seconds
            .unwrap_or(self.idle_timeout_seconds)
    }

    /// Cooldown between dropped-ball nudges; defaults to the timeout.
    pub fn dropped_ball_cooldown_seconds(&self) -> u64 {
        self.dropped_ball_cooldown_seconds
            .unwrap_or(self.dropped_ball_timeout_seconds)
    }
}

// ── Layered loading ───────────────────────────────────────────────────────────

/// Files consulted by [`load_layered`]; absent files are skipped.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConfigPaths {
    pub user: Option<PathBuf>,
    pub nodes_dir: Option<PathBuf>,
    pub project: Option<PathBuf>,
}

impl ConfigPaths {
    /// Standard locations: the user config directory and `<cwd>/.postman`.
    pub fn standard(cwd: &Path) -> Self {
        let config_dir = dirs::config_dir().map(|d| d.join("postman"));
        Self {
            user: config_dir.as_ref().map(|d| d.join("postman.toml")),
            nodes_dir: config_dir.map(|d| d.join("nodes")),
            project: Some(cwd.join(".postman").join("postman.toml")),
        }
    }

    /// Only `path` (plus its sibling `nodes/` directory).
    pub fn single(path: &Path) -> Self {
        Self {
            user: Some(path.to_path_buf()),
            nodes_dir: path.parent().map(|p| p.join("nodes")),
            project: None,
        }
    }

    /// Directories whose contents feed the configuration, whether or not
    /// they exist yet.
    pub fn watch_dirs(&self) -> Vec<PathBuf> {
        let mut dirs: Vec<PathBuf> = [
            self.user.as_deref().and_then(Path::parent),
            self.nodes_dir.as_deref(),
            self.project.as_deref().and_then(Path::parent),
        ]
        .into_iter()
        .flatten()
        .map(Path::to_path_buf)
        .collect();
        dirs.dedup();
        dirs
    }

    /// `true` when `path` is one of the configuration files.
    pub fn is_config_file(&self, path: &Path) -> bool {
        self.user.as_deref() == Some(path)
            || self.project.as_deref() == Some(path)
            || (self.nodes_dir.as_deref().is_some_and(|dir| path.parent() == Some(dir))
                && path.extension().is_some_and(|ext| ext == "toml"))
    }

    fn node_files(&self) -> Vec<PathBuf> {
        let Some(dir) = self.nodes_dir.as_ref() else {
            return Vec::new();
        };
        let Ok(entries) = std::fs::read_dir(dir) else {
            return Vec::new();
        };
        let mut files: Vec<PathBuf> = entries
            .filter_map(|e| e.ok().map(|e| e.path()))
            .filter(|p| p.extension().is_some_and(|ext| ext == "toml"))
            .collect();
        files.sort();
        files
    }
}

/// Merge every layer in `paths` and deserialise the result.
pub fn load_layered(paths: &ConfigPaths) -> Result<BusConfig> {
    let mut merged = toml::Table::new();

    if let Some(user) = paths.user.as_ref() {
        if let Some(table) = read_table(user)? {
            merge_tables(&mut merged, table);
        }
    }

    for file in paths.node_files() {
        let Some(name) = file.file_stem().and_then(|s| s.to_str()).map(str::to_string) else {
            continue;
        };
        if let Some(table) = read_table(&file)? {
            let mut nodes = toml::Table::new();
            nodes.insert(name, toml::Value::Table(table));
            let mut wrapper = toml::Table::new();
            wrapper.insert("nodes".to_string(), toml::Value::Table(nodes));
            merge_tables(&mut merged, wrapper);
        }
    }

    if let Some(project) = paths.project.as_ref() {
        if let Some(table) = read_table(project)? {
            merge_tables(&mut merged, table);
        }
    }

    let config: BusConfig = toml::Value::Table(merged)
        .try_into()
        .map_err(|e: toml::de::Error| PostmanError::Config(e.to_string()))?;
    config.validate()?;

    tracing::debug!(
        edges = config.edges.len(),
        nodes = config.nodes.len(),
        "configuration loaded"
    );
    Ok(config)
}

fn read_table(path: &Path) -> Result<Option<toml::Table>> {
    let content = match std::fs::read_to_string(path) {
        Ok(content) => content,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    let table = content
        .parse::<toml::Table>()
        .map_err(|source| PostmanError::ConfigParse {
            path: path.to_path_buf(),
            source,
        })?;
    Ok(Some(table))
}

fn merge_tables(base: &mut toml::Table, overlay: toml::Table) {
    for (key, value) in overlay {
        match (base.get_mut(&key), value) {
            (Some(toml::Value::Table(existing)), toml::Value::Table(incoming)) => {
                merge_tables(existing, incoming);
            }
            (_, value) => {
                base.insert(key, value);
            }
        }
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn write(path: &Path, content: &str) {
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(path, content).unwrap();
    }

    #[test]
    fn test_defaults() {
        let config = BusConfig::default();
        assert_eq!(config.scan_interval_seconds, 10);
        assert_eq!(config.enter_count, 1);
        assert_eq!(config.reminder_interval, 0);
        assert_eq!(config.edge_violation.mode, WarningMode::Compact);
        assert!(config.compaction.enabled);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_from_toml_str_partial() {
        let config = BusConfig::from_toml_str(
            r#"
            edges = ["orchestrator -- worker"]
            reminder_interval = 5

            [edge_violation]
            mode = "verbose"

            [nodes.worker]
            idle_timeout_seconds = 120
            observes = ["critic"]
            "#,
        )
        .unwrap();
        assert_eq!(config.edges.len(), 1);
        assert_eq!(config.reminder_interval, 5);
        assert_eq!(config.edge_violation.mode, WarningMode::Verbose);
        assert_eq!(
            config.edge_violation.template,
            DEFAULT_EDGE_VIOLATION_TEMPLATE
        );
        let worker = config.node("main:worker").unwrap();
        assert_eq!(worker.idle_timeout_seconds, 120);
        assert_eq!(worker.idle_cooldown_seconds(), 120);
    }

    #[test]
    fn test_validate_rejects_bad_enter_count() {
        let err = BusConfig::from_toml_str("enter_count = 3").unwrap_err();
        assert!(err.to_string().contains("enter_count"));

        let err = BusConfig::from_toml_str("[nodes.w]\nenter_count = 0").unwrap_err();
        assert!(err.to_string().contains("w"));
    }

    #[test]
    fn test_validate_rejects_bad_edges() {
        assert!(BusConfig::from_toml_str(r#"edges = ["solo"]"#).is_err());
    }

    #[test]
    fn test_per_node_fallbacks() {
        let config = BusConfig::from_toml_str(
            r#"
            reminder_interval = 4
            [nodes.worker]
            reminder_interval = 2
            enter_count = 2
            reminder_message = "custom {count}"
            "#,
        )
        .unwrap();
        assert_eq!(config.reminder_interval_for("s:worker"), 2);
        assert_eq!(config.reminder_interval_for("boss"), 4);
        assert_eq!(config.enter_count_for("worker"), 2);
        assert_eq!(config.enter_count_for("boss"), 1);
        assert_eq!(config.reminder_message_for("worker"), "custom {count}");
        assert_eq!(config.reminder_message_for("boss"), DEFAULT_REMINDER_MESSAGE);
    }

    #[test]
    fn test_observers_of() {
        let config = BusConfig::from_toml_str(
            r#"
            [nodes.critic]
            observes = ["worker", "main:planner"]
            [nodes.auditor]
            observes = ["worker"]
            [nodes.worker]
            "#,
        )
        .unwrap();
        assert_eq!(
            config.observers_of("main:worker"),
            vec!["auditor".to_string(), "critic".to_string()]
        );
        assert_eq!(config.observers_of("planner"), vec!["critic".to_string()]);
        assert!(config.observers_of("critic").is_empty());
    }

    #[test]
    fn test_dropped_ball_cooldown_defaults_to_timeout() {
        let node = NodeConfig {
            dropped_ball_timeout_seconds: 600,
            ..Default::default()
        };
        assert_eq!(node.dropped_ball_cooldown_seconds(), 600);
        let node = NodeConfig {
            dropped_ball_timeout_seconds: 600,
            dropped_ball_cooldown_seconds: Some(60),
            ..Default::default()
        };
        assert_eq!(node.dropped_ball_cooldown_seconds(), 60);
    }

    #[test]
    fn test_load_layered_merges_in_order() {
        let tmp = TempDir::new().unwrap();
        let user = tmp.path().join("config").join("postman.toml");
        let nodes_dir = tmp.path().join("config").join("nodes");
        let project = tmp.path().join("project").join(".postman").join("postman.toml");

        write(
            &user,
            r#"
            edges = ["a -- b"]
            scan_interval_seconds = 20
            [compaction]
            pattern = "user-pattern"
            "#,
        );
        write(
            &nodes_dir.join("worker.toml"),
            "idle_timeout_seconds = 90\nobserves = [\"a\"]\n",
        );
        write(
            &project,
            r#"
            scan_interval_seconds = 5
            [compaction]
            delay_seconds = 7
            [nodes.worker]
            idle_cooldown_seconds = 30
            "#,
        );

        let config = load_layered(&ConfigPaths {
            user: Some(user),
            nodes_dir: Some(nodes_dir),
            project: Some(project),
        })
        .unwrap();

        assert_eq!(config.edges, vec!["a -- b".to_string()]);
        assert_eq!(config.scan_interval_seconds, 5);
        assert_eq!(config.compaction.pattern, "user-pattern");
        assert_eq!(config.compaction.delay_seconds, 7);
        let worker = config.node("worker").unwrap();
        assert_eq!(worker.idle_timeout_seconds, 90);
        assert_eq!(worker.idle_cooldown_seconds(), 30);
        assert_eq!(worker.observes, vec!["a".to_string()]);
    }

    #[test]
    fn test_load_layered_missing_files_yield_defaults() {
        let tmp = TempDir::new().unwrap();
        let config = load_layered(&ConfigPaths::single(&tmp.path().join("absent.toml"))).unwrap();
        assert_eq!(config, BusConfig::default());
    }

    #[test]
    fn test_load_layered_reports_parse_errors_with_path() {
        let tmp = TempDir::new().unwrap();
        let user = tmp.path().join("postman.toml");
        write(&user, "edges = [");
        let err = load_layered(&ConfigPaths::single(&user)).unwrap_err();
        assert!(err.to_string().contains("postman.toml"));
    }

    #[test]
    fn test_watch_dirs_include_missing_directories() {
        let tmp = TempDir::new().unwrap();
        let user = tmp.path().join("cfg").join("postman.toml");
        let paths = ConfigPaths::single(&user);

        assert_eq!(
            paths.watch_dirs(),
            vec![tmp.path().join("cfg"), tmp.path().join("cfg").join("nodes")]
        );
    }

    #[test]
    fn test_is_config_file() {
        let paths = ConfigPaths::single(Path::new("/cfg/postman.toml"));
        assert!(paths.is_config_file(Path::new("/cfg/postman.toml")));
        assert!(paths.is_config_file(Path::new("/cfg/nodes/worker.toml")));
        assert!(!paths.is_config_file(Path::new("/cfg/nodes/notes.txt")));
        assert!(!paths.is_config_file(Path::new("/cfg/other.toml")));
    }
}

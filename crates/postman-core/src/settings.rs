use clap::{Parser, Subcommand};
use std::path::PathBuf;

use crate::config::ConfigPaths;

// ── Settings (CLI) ─────────────────────────────────────────────────────────────

/// File-based message bus for agents running in tmux panes
#[derive(Parser, Debug, Clone)]
#[command(
    name = "postman",
    about = "File-based message bus for agents running in tmux panes",
    version
)]
pub struct Settings {
    /// Conversation context identifier
    #[arg(long, env = "POSTMAN_CONTEXT_ID", default_value = "default", global = true)]
    pub context_id: String,

    /// Root directory holding one directory per context
    #[arg(long, env = "POSTMAN_BASE_DIR", global = true)]
    pub base_dir: Option<PathBuf>,

    /// Configuration file (replaces the user and project layers)
    #[arg(long, env = "POSTMAN_CONFIG", global = true)]
    pub config: Option<PathBuf>,

    /// Logging level
    #[arg(long, default_value = "INFO", value_parser = ["DEBUG", "INFO", "WARNING", "ERROR"], global = true)]
    pub log_level: String,

    /// Log file path
    #[arg(long, global = true)]
    pub log_file: Option<PathBuf>,

    /// Enable debug logging
    #[arg(long, global = true)]
    pub debug: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Run the delivery daemon for a context
    Run {
        /// Node name of the pane this daemon reports inbox changes for
        #[arg(long, env = "POSTMAN_NODE")]
        node: Option<String>,

        /// Print daemon events to stdout as JSON lines
        #[arg(long)]
        events_json: bool,
    },

    /// Post a message from one node to another
    Send {
        /// Sending node
        #[arg(long, env = "POSTMAN_NODE")]
        from: String,

        /// Receiving node (`node` or `session:node`)
        #[arg(long)]
        to: String,

        /// Sender's tmux session
        #[arg(long, env = "POSTMAN_SESSION")]
        session: String,

        /// Message body; read from stdin when omitted
        #[arg(long)]
        body: Option<String>,
    },
}

// ── Settings impl ──────────────────────────────────────────────────────────────

impl Settings {
    /// Base directory, defaulting to `<state dir>/postman`.
    pub fn resolved_base_dir(&self) -> PathBuf {
        self.base_dir.clone().unwrap_or_else(default_base_dir)
    }

    /// Directory for this context: `<base>/<context id>`.
    pub fn context_dir(&self) -> PathBuf {
        self.resolved_base_dir().join(&self.context_id)
    }

    /// Configuration files to load.
    pub fn config_paths(&self, cwd: &std::path::Path) -> ConfigPaths {
        match self.config.as_ref() {
            Some(path) => ConfigPaths::single(path),
            None => ConfigPaths::standard(cwd),
        }
    }

    /// Log level after applying `--debug`.
    pub fn effective_log_level(&self) -> &str {
        if self.debug {
            "DEBUG"
        } else {
            &self.log_level
        }
    }
}

/// `~/.local/state/postman` (or the platform equivalent), falling back to
/// `./.postman-state` when no home directory is known.
pub fn default_base_dir() -> PathBuf {
    dirs::state_dir()
        .or_else(dirs::data_local_dir)
        .map(|d| d.join("postman"))
        .unwrap_or_else(|| PathBuf::from(".postman-state"))
}

// ── Tests ──────────────────────────────────────────────────────────────────────

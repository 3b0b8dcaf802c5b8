//! Terminal-multiplexer pane operations.
//!
//! The runtime only needs four primitives: paste text, press Enter, capture
//! the visible tail of a pane, and list panes. [`PaneTransport`] abstracts
//! them so that routing can be tested without tmux; [`TmuxTransport`] is the
//! production implementation.

use std::io::Read;
use std::process::{Command, Stdio};
use std::thread;
use std::time::Duration;

use postman_core::{PostmanError, Result};
use wait_timeout::ChildExt;

/// Default upper bound for a single tmux invocation.
pub const DEFAULT_COMMAND_TIMEOUT: Duration = Duration::from_secs(5);

const PASTE_BUFFER: &str = "postman";
const NODE_OPTION: &str = "@postman_node";

// ── Public types ──────────────────────────────────────────────────────────────

/// One pane as reported by the multiplexer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PaneEntry {
    pub pane_id: String,
    pub session_name: String,
    /// Value of the pane's node option, when the pane hosts a node.
    pub node: Option<String>,
}

/// Primitive pane operations.
pub trait PaneTransport: Send + Sync {
    fn paste(&self, pane_id: &str, text: &str) -> Result<()>;
    fn send_enter(&self, pane_id: &str) -> Result<()>;
    /// The last `lines` lines of the pane.
    fn capture(&self, pane_id: &str, lines: usize) -> Result<String>;
    fn list_panes(&self) -> Result<Vec<PaneEntry>>;
}

/// Paste `text` into a pane and submit it with `enter_count` Enter presses,
/// `enter_delay` apart.
pub fn notify_pane(
    transport: &dyn PaneTransport,
    pane_id: &str,
    text: &str,
    enter_count: u8,
    enter_delay: Duration,
) -> Result<()> {
    transport.paste(pane_id, text)?;
    for _ in 0..enter_count.max(1) {
        if !enter_delay.is_zero() {
            thread::sleep(enter_delay);
        }
        transport.send_enter(pane_id)?;
    }
    Ok(())
}

// ── TmuxTransport ─────────────────────────────────────────────────────────────

/// [`PaneTransport`] backed by the `tmux` binary.
#[derive(Debug, Clone)]
pub struct TmuxTransport {
    binary: String,
    timeout: Duration,
}

impl TmuxTransport {
    pub fn new(timeout: Duration) -> Self {
        Self {
            binary: "tmux".to_string(),
            timeout,
        }
    }

    /// Run tmux with `args`, returning stdout.
    fn run(&self, args: &[&str]) -> Result<String> {
        let mut child = Command::new(&self.binary)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| PostmanError::Pane(format!("failed to spawn {}: {e}", self.binary)))?;

        let status = match child.wait_timeout(self.timeout)? {
            Some(status) => status,
            None => {
                let _ = child.kill();
                let _ = child.wait();
                return Err(PostmanError::Pane(format!(
                    "tmux {} timed out after {:?}",
                    args.first().copied().unwrap_or_default(),
                    self.timeout
                )));
            }
        };

        let mut stdout = String::new();
        if let Some(mut out) = child.stdout.take() {
            out.read_to_string(&mut stdout)?;
        }

        if !status.success() {
            let mut stderr = String::new();
            if let Some(mut err) = child.stderr.take() {
                let _ = err.read_to_string(&mut stderr);
            }
            return Err(PostmanError::Pane(format!(
                "tmux {} failed ({status}): {}",
                args.first().copied().unwrap_or_default(),
                stderr.trim()
            )));
        }

        Ok(stdout)
    }
}

impl Default for TmuxTransport {
    fn default() -> Self {
        Self::new(DEFAULT_COMMAND_TIMEOUT)
    }
}

impl PaneTransport for TmuxTransport {
    fn paste(&self, pane_id: &str, text: &str) -> Result<()> {
        self.run(&["set-buffer", "-b", PASTE_BUFFER, "--", text])?;
        self.run(&["paste-buffer", "-d", "-b", PASTE_BUFFER, "-t", pane_id])?;
        Ok(())
    }

    fn send_enter(&self, pane_id: &str) -> Result<()> {
        self.run(&["send-keys", "-t", pane_id, "Enter"])?;
        Ok(())
    }

    fn capture(&self, pane_id: &str, lines: usize) -> Result<String> {
        let start = format!("-{lines}");
        self.run(&["capture-pane", "-p", "-J", "-t", pane_id, "-S", &start])
    }

    fn list_panes(&self) -> Result<Vec<PaneEntry>> {
        let format = format!("#{{pane_id}}\t#{{session_name}}\t#{{{NODE_OPTION}}}");
        let output = self.run(&["list-panes", "-a", "-F", &format])?;
        Ok(parse_pane_list(&output))
    }
}

/// Parse `list-panes` output in `pane_id<TAB>session<TAB>node` form.
pub fn parse_pane_list(output: &str) -> Vec<PaneEntry> {
    output
        .lines()
        .filter_map(|line| {
            let mut fields = line.split('\t');
            let pane_id = fields.next()?.trim();
            let session_name = fields.next()?.trim();
            let node = fields.next().map(str::trim).unwrap_or_default();
            if pane_id.is_empty() || session_name.is_empty() {
                return None;
            }
            Some(PaneEntry {
                pane_id: pane_id.to_string(),
                session_name: session_name.to_string(),
                node: (!node.is_empty()).then(|| node.to_string()),
            })
        })
        .collect()
}

// ── Tests ─────────────────────────────────────────────────────────────────────

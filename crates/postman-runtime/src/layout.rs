//! Session directory contract.
//!
//! ```text
//! <context dir>/<session>/
//!     post/            outbound, written then renamed in
//!     inbox/<node>/    per-recipient
//!     draft/           staged by humans, not watched
//!     read/            handshake acknowledgements
//!     dead-letter/     undeliverable
//!     capture/         pane snapshots
//! ```
//!
//! A message only ever moves between these directories by `rename`, so a
//! successful rename is the proof that this handler delivered it.

use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use postman_core::message::{new_message, render_message, MessageInfo, POSTMAN, TIMESTAMP_FORMAT};
use postman_core::node::simple_name;
use postman_core::{PostmanError, Result};

pub const POST_DIR: &str = "post";
pub const INBOX_DIR: &str = "inbox";
pub const DRAFT_DIR: &str = "draft";
pub const READ_DIR: &str = "read";
pub const DEAD_LETTER_DIR: &str = "dead-letter";
pub const CAPTURE_DIR: &str = "capture";

/// Paths inside one session directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionLayout {
    root: PathBuf,
}

impl SessionLayout {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Layout for `session` under `context_dir`.
    pub fn for_session(context_dir: &Path, session: &str) -> Self {
        Self::new(context_dir.join(session))
    }

    /// Layout owning a file in `post/`, i.e. the grandparent of the file.
    pub fn from_post_file(post_file: &Path) -> Option<Self> {
        let post_dir = post_file.parent()?;
        if post_dir.file_name()? != POST_DIR {
            return None;
        }
        post_dir.parent().map(Self::new)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Session name, taken from the directory name.
    pub fn session_name(&self) -> String {
        self.root
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default()
    }

    pub fn post(&self) -> PathBuf {
        self.root.join(POST_DIR)
    }

    pub fn inbox_root(&self) -> PathBuf {
        self.root.join(INBOX_DIR)
    }

    /// `inbox/<node>/` for a simple or qualified node name.
    pub fn inbox(&self, node: &str) -> PathBuf {
        self.inbox_root().join(simple_name(node))
    }

    pub fn draft(&self) -> PathBuf {
        self.root.join(DRAFT_DIR)
    }

    pub fn read(&self) -> PathBuf {
        self.root.join(READ_DIR)
    }

    pub fn dead_letter(&self) -> PathBuf {
        self.root.join(DEAD_LETTER_DIR)
    }

    pub fn capture(&self) -> PathBuf {
        self.root.join(CAPTURE_DIR)
    }

    /// Create the fixed subdirectories plus an inbox per node in `nodes`.
    pub fn ensure<S: AsRef<str>>(&self, nodes: &[S]) -> Result<()> {
        for dir in [
            self.post(),
            self.inbox_root(),
            self.draft(),
            self.read(),
            self.dead_letter(),
            self.capture(),
        ] {
            std::fs::create_dir_all(&dir)?;
        }
        for node in nodes {
            std::fs::create_dir_all(self.inbox(node.as_ref()))?;
        }
        Ok(())
    }

    /// Write a postman-originated message straight into `recipient`'s inbox.
    ///
    /// The document is written to `draft/` first and renamed into place so
    /// that inbox watchers never observe a partial file.
    pub fn write_system_message(
        &self,
        context_id: &str,
        recipient: &str,
        body: &str,
        now: DateTime<Utc>,
    ) -> Result<PathBuf> {
        let info = new_message(POSTMAN, simple_name(recipient), now);
        let inbox = self.inbox(recipient);
        std::fs::create_dir_all(&inbox)?;
        let staged = self.stage(&info, &render_message(context_id, &info, body))?;
        relocate(&staged, &inbox)
    }

    /// Post a message from `from` to `to`: staged in `draft/`, then renamed
    /// into `post/` where the daemon picks it up.
    pub fn post_message(
        &self,
        context_id: &str,
        from: &str,
        to: &str,
        body: &str,
        now: DateTime<Utc>,
    ) -> Result<PathBuf> {
        let info = new_message(from, to, now);
        let staged = self.stage(&info, &render_message(context_id, &info, body))?;
        relocate(&staged, &self.post())
    }

    /// Save a pane snapshot as `capture/<timestamp>-<node>.txt`.
    pub fn write_capture(&self, node: &str, content: &str, now: DateTime<Utc>) -> Result<PathBuf> {
        let dir = self.capture();
        std::fs::create_dir_all(&dir)?;
        let name = format!("{}-{}.txt", now.format(TIMESTAMP_FORMAT), simple_name(node));
        let path = free_path(&dir, &name);
        std::fs::write(&path, content)?;
        Ok(path)
    }

    /// Stage `info` with `content` in `draft/` and return its path.
    pub fn stage(&self, info: &MessageInfo, content: &str) -> Result<PathBuf> {
        let draft = self.draft();
        std::fs::create_dir_all(&draft)?;
        let path = free_path(&draft, &info.filename());
        let mut file = std::fs::File::create(&path)?;
        file.write_all(content.as_bytes())?;
        file.sync_all()?;
        Ok(path)
    }
}

/// Move `file` into `dest_dir`, keeping its name unless a file of that name
/// is already there, in which case a `-N` suffix is added. An existing file
/// is never replaced.
pub fn relocate(file: &Path, dest_dir: &Path) -> Result<PathBuf> {
    let name = file
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .ok_or_else(|| PostmanError::FileMove {
            from: file.to_path_buf(),
            to: dest_dir.to_path_buf(),
            source: std::io::Error::new(std::io::ErrorKind::InvalidInput, "path has no file name"),
        })?;
    std::fs::create_dir_all(dest_dir)?;
    let dest = free_path(dest_dir, &name);
    std::fs::rename(file, &dest).map_err(|source| PostmanError::FileMove {
        from: file.to_path_buf(),
        to: dest.clone(),
        source,
    })?;
    Ok(dest)
}

/// `true` when `err` is a rename whose source had already disappeared.
pub fn is_source_gone(err: &PostmanError) -> bool {
    matches!(err, PostmanError::FileMove { source, .. } if source.kind() == std::io::ErrorKind::NotFound)
}

/// `dir/<name>`, or the first free variant of it.
///
/// Message filenames get `-N` appended to the timestamp so sender and
/// recipient stay parseable; any other name gets `-N` before the extension.
fn free_path(dir: &Path, name: &str) -> PathBuf {
    let candidate = dir.join(name);
    if !candidate.exists() {
        return candidate;
    }
    (1..)
        .map(|n| dir.join(numbered_name(name, n)))
        .find(|p| !p.exists())
        .unwrap_or(candidate)
}

fn numbered_name(name: &str, n: u32) -> String {
    if let Ok(info) = MessageInfo::parse(name) {
        return MessageInfo {
            timestamp: format!("{}-{n}", info.timestamp),
            ..info
        }
        .filename();
    }
    match name.rsplit_once('.') {
        Some((stem, ext)) if !stem.is_empty() => format!("{stem}-{n}.{ext}"),
        _ => format!("{name}-{n}"),
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

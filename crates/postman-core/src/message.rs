//! Message filename grammar and message body rendering.
//!
//! A message is a markdown file named
//! `{YYYYMMDD-HHMMSS}-from-{sender}-to-{recipient}.md`. Node names may contain
//! hyphens, so parsing looks for the literal `-from-` and `-to-` markers
//! instead of splitting on every hyphen.

use chrono::{DateTime, Utc};

use crate::error::{PostmanError, Result};

/// Timestamp layout used in message filenames.
pub const TIMESTAMP_FORMAT: &str = "%Y%m%d-%H%M%S";

/// Reserved name of the bus itself.
pub const POSTMAN: &str = "postman";

const FROM_MARKER: &str = "-from-";
const TO_MARKER: &str = "-to-";
const EXTENSION: &str = ".md";

// ── MessageInfo ───────────────────────────────────────────────────────────────

/// Routing facts carried by a message filename.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageInfo {
    pub timestamp: String,
    pub from: String,
    pub to: String,
}

impl MessageInfo {
    /// Parse a bare filename (no directory component).
    ///
    /// The first `-from-` ends the timestamp and the first `-to-` after it
    /// ends the sender, so a sender containing `-to-` is not representable.
    pub fn parse(filename: &str) -> Result<Self> {
        let invalid = || PostmanError::MessageFilename(filename.to_string());

        let stem = filename.strip_suffix(EXTENSION).ok_or_else(invalid)?;
        let (timestamp, rest) = stem.split_once(FROM_MARKER).ok_or_else(invalid)?;
        let (from, to) = rest.split_once(TO_MARKER).ok_or_else(invalid)?;

        if timestamp.is_empty() || from.is_empty() || to.is_empty() {
            return Err(invalid());
        }

        Ok(Self {
            timestamp: timestamp.to_string(),
            from: from.to_string(),
            to: to.to_string(),
        })
    }

    /// Canonical filename for this message.
    pub fn filename(&self) -> String {
        format!(
            "{}{FROM_MARKER}{}{TO_MARKER}{}{EXTENSION}",
            self.timestamp, self.from, self.to
        )
    }
}

/// Build a [`MessageInfo`] stamped with `now`.
pub fn new_message(from: &str, to: &str, now: DateTime<Utc>) -> MessageInfo {
    MessageInfo {
        timestamp: now.format(TIMESTAMP_FORMAT).to_string(),
        from: from.to_string(),
        to: to.to_string(),
    }
}

// ── Body rendering ────────────────────────────────────────────────────────────

/// Render a full message document: the header block followed by `body`.
pub fn render_message(context_id: &str, info: &MessageInfo, body: &str) -> String {
    format!(
        "---\n\
         method: message/send\n\
         params:\n  \
         contextId: {context_id}\n  \
         from: {}\n  \
         to: {}\n  \
         timestamp: {}\n\
         ---\n\n\
         {}\n",
        info.from,
        info.to,
        info.timestamp,
        body.trim_end()
    )
}

// ── Tests ─────────────────────────────────────────────────────────────────────

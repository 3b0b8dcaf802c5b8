//! Cooldown-based alert suppression.
//!
//! Watchdog alerts (stale panes, idle sessions) are rate-limited per key:
//! [`AlertCooldown::should_send_alert`] is true for a key that has never
//! fired or whose last firing is older than the cooldown. State can be
//! persisted to a JSON file so that a restarted daemon does not re-alert
//! immediately.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};

/// Per-key alert cooldowns.
pub struct AlertCooldown {
    cooldown: Duration,
    /// Optional JSON file mirroring `last_sent`.
    state_file: Option<PathBuf>,
    last_sent: Mutex<HashMap<String, DateTime<Utc>>>,
}

impl AlertCooldown {
    /// In-memory cooldowns.
    pub fn new(cooldown: Duration) -> Self {
        Self {
            cooldown,
            state_file: None,
            last_sent: Mutex::new(HashMap::new()),
        }
    }

    /// Cooldowns persisted to `path`. A missing or unreadable file starts
    /// empty; save errors are logged and otherwise ignored.
    pub fn with_state_file(cooldown: Duration, path: &Path) -> Self {
        Self {
            cooldown,
            state_file: Some(path.to_path_buf()),
            last_sent: Mutex::new(load_states(path)),
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, DateTime<Utc>>> {
        self.last_sent.lock().unwrap_or_else(|e| e.into_inner())
    }

    // ── Public API ────────────────────────────────────────────────────────

    pub fn should_send_alert(&self, key: &str) -> bool {
        self.should_send_alert_at(key, Utc::now())
    }

    /// True when `key` never fired, or fired more than the cooldown ago.
    pub fn should_send_alert_at(&self, key: &str, now: DateTime<Utc>) -> bool {
        match self.lock().get(key) {
            None => true,
            Some(last) => (now - *last).to_std().unwrap_or_default() > self.cooldown,
        }
    }

    pub fn mark_alert_sent(&self, key: &str) {
        self.mark_alert_sent_at(key, Utc::now());
    }

    pub fn mark_alert_sent_at(&self, key: &str, now: DateTime<Utc>) {
        let snapshot = {
            let mut states = self.lock();
            states.insert(key.to_string(), now);
            states.clone()
        };
        self.save_states(&snapshot);
    }

    /// Forget `key`, so its next alert fires immediately.
    pub fn clear(&self, key: &str) {
        let snapshot = {
            let mut states = self.lock();
            if states.remove(key).is_none() {
                return;
            }
            states.clone()
        };
        self.save_states(&snapshot);
    }

    pub fn last_sent(&self, key: &str) -> Option<DateTime<Utc>> {
        self.lock().get(key).copied()
    }

    // ── Private helpers ───────────────────────────────────────────────────

    fn save_states(&self, states: &HashMap<String, DateTime<Utc>>) {
        let Some(path) = self.state_file.as_ref() else {
            return;
        };
        match serde_json::to_string_pretty(states) {
            Ok(json) => {
                if let Err(e) = std::fs::write(path, json) {
                    tracing::warn!(
                        error = %e,
                        path = %path.display(),
                        "failed to save alert states"
                    );
                }
            }
            Err(e) => {
                tracing::warn!(error = %e, "failed to serialise alert states");
            }
        }
    }
}

fn load_states(path: &Path) -> HashMap<String, DateTime<Utc>> {
    let Ok(content) = std::fs::read_to_string(path) else {
        return HashMap::new();
    };
    match serde_json::from_str(&content) {
        Ok(states) => states,
        Err(e) => {
            tracing::warn!(
                error = %e,
                path = %path.display(),
                "failed to deserialise alert states; starting empty"
            );
            HashMap::new()
        }
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use tempfile::TempDir;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 2, 1, 12, 0, 0).unwrap()
    }

    #[test]
    fn test_should_send_alert_cooldown_boundaries() {
        let alerts = AlertCooldown::new(Duration::from_secs(600));
        let eps = chrono::Duration::milliseconds(1);
        let cooldown = chrono::Duration::seconds(600);

        assert!(alerts.should_send_alert_at("stale:main:worker", t0()));
        alerts.mark_alert_sent_at("stale:main:worker", t0());

        assert!(!alerts.should_send_alert_at("stale:main:worker", t0()));
        assert!(!alerts.should_send_alert_at("stale:main:worker", t0() + cooldown - eps));
        assert!(alerts.should_send_alert_at("stale:main:worker", t0() + cooldown + eps));
    }

    #[test]
    fn test_keys_are_independent() {
        let alerts = AlertCooldown::new(Duration::from_secs(60));
        alerts.mark_alert_sent_at("a", t0());
        assert!(!alerts.should_send_alert_at("a", t0()));
        assert!(alerts.should_send_alert_at("b", t0()));
    }

    #[test]
    fn test_clear_resets_key() {
        let alerts = AlertCooldown::new(Duration::from_secs(60));
        alerts.mark_alert_sent_at("a", t0());
        alerts.clear("a");
        assert!(alerts.should_send_alert_at("a", t0()));
        assert!(alerts.last_sent("a").is_none());
    }

    #[test]
    fn test_state_file_survives_restart() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("alert_states.json");

        let alerts = AlertCooldown::with_state_file(Duration::from_secs(60), &path);
        alerts.mark_alert_sent_at("a", t0());
        assert!(path.exists());

        let restored = AlertCooldown::with_state_file(Duration::from_secs(60), &path);
        assert_eq!(restored.last_sent("a"), Some(t0()));
        assert!(!restored.should_send_alert_at("a", t0()));
    }

    #[test]
    fn test_corrupt_state_file_starts_empty() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("alert_states.json");
        std::fs::write(&path, "{not json").unwrap();
        let alerts = AlertCooldown::with_state_file(Duration::from_secs(60), &path);
        assert!(alerts.should_send_alert_at("a", t0()));
    }
}

//! Per-session delivery switches.

use std::collections::BTreeSet;
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

/// Sessions that currently refuse agent-to-agent traffic. Sessions are
/// enabled unless listed here.
#[derive(Debug, Default)]
pub struct SessionToggles {
    disabled: RwLock<BTreeSet<String>>,
}

impl SessionToggles {
    pub fn new<S: AsRef<str>>(disabled: &[S]) -> Self {
        Self {
            disabled: RwLock::new(disabled.iter().map(|s| s.as_ref().to_string()).collect()),
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, BTreeSet<String>> {
        self.disabled.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, BTreeSet<String>> {
        self.disabled.write().unwrap_or_else(|e| e.into_inner())
    }

    pub fn is_enabled(&self, session: &str) -> bool {
        !self.read().contains(session)
    }

    /// Returns `true` when the state changed.
    pub fn set_enabled(&self, session: &str, enabled: bool) -> bool {
        let changed = if enabled {
            self.write().remove(session)
        } else {
            self.write().insert(session.to_string())
        };
        if changed {
            tracing::info!(session, enabled, "session toggled");
        }
        changed
    }

    /// Replace the disabled set, e.g. after a configuration reload.
    pub fn replace<S: AsRef<str>>(&self, disabled: &[S]) {
        *self.write() = disabled.iter().map(|s| s.as_ref().to_string()).collect();
    }

    pub fn disabled(&self) -> Vec<String> {
        self.read().iter().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sessions_enabled_by_default() {
        let toggles = SessionToggles::new(&["paused"]);
        assert!(toggles.is_enabled("main"));
        assert!(!toggles.is_enabled("paused"));
    }

    #[test]
    fn test_set_enabled_reports_changes() {
        let toggles = SessionToggles::default();
        assert!(toggles.set_enabled("main", false));
        assert!(!toggles.set_enabled("main", false));
        assert!(!toggles.is_enabled("main"));
        assert!(toggles.set_enabled("main", true));
        assert!(toggles.is_enabled("main"));
    }

    #[test]
    fn test_replace() {
        let toggles = SessionToggles::new(&["a", "b"]);
        toggles.replace(&["c"]);
        assert_eq!(toggles.disabled(), vec!["c".to_string()]);
    }
}

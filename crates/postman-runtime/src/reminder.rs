//! Delivery-count reminders.
//!
//! Every delivery increments the recipient's counter. When the counter
//! reaches the node's reminder interval (falling back to the global one) the
//! reminder template is pasted into the node's pane and the counter resets.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use postman_core::config::BusConfig;
use postman_core::node::{simple_name, NodeMap};
use postman_core::template::{expand, TemplateVars};

use crate::pane::{notify_pane, PaneTransport};

/// Per-node delivery counters.
pub struct ReminderCounter {
    counts: Mutex<HashMap<String, u32>>,
    transport: Arc<dyn PaneTransport>,
}

impl ReminderCounter {
    pub fn new(transport: Arc<dyn PaneTransport>) -> Self {
        Self {
            counts: Mutex::new(HashMap::new()),
            transport,
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, u32>> {
        self.counts.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Count one delivery to `node`. Returns the count that triggered a
    /// reminder, if one was due.
    ///
    /// The counter is reset under the lock; the pane paste happens after the
    /// lock is released.
    pub fn increment(&self, node: &str, nodes: &NodeMap, config: &BusConfig) -> Option<u32> {
        let interval = config.reminder_interval_for(node);
        let reached = {
            let mut counts = self.lock();
            let count = counts.entry(node.to_string()).or_insert(0);
            *count += 1;
            if interval > 0 && *count >= interval {
                let reached = *count;
                *count = 0;
                Some(reached)
            } else {
                None
            }
        }?;

        let Some(info) = nodes.get(node) else {
            tracing::warn!(node, "reminder due for undiscovered node; dropped");
            return Some(reached);
        };

        let vars = TemplateVars::new()
            .with("node", simple_name(node))
            .with("count", reached.to_string());
        let text = expand(config.reminder_message_for(node), &vars);
        if let Err(e) = notify_pane(
            self.transport.as_ref(),
            &info.pane_id,
            &text,
            config.enter_count_for(node),
            Duration::from_millis(config.enter_delay_ms),
        ) {
            tracing::warn!(node, error = %e, "failed to send reminder");
        } else {
            tracing::info!(node, count = reached, "reminder sent");
        }
        Some(reached)
    }

    pub fn count(&self, node: &str) -> u32 {
        self.lock().get(node).copied().unwrap_or(0)
    }
}

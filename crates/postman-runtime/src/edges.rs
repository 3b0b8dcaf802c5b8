//! Per-edge "last communicated" facts for dashboards.
//!
//! Each unordered pair is stored under its lexicographically sorted
//! endpoints `(a, b)`; a delivery from `a` to `b` is forward, from `b` to
//! `a` backward.

use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use postman_core::node::simple_name;
use serde::Serialize;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EdgeActivity {
    pub last_forward_at: Option<DateTime<Utc>>,
    pub last_backward_at: Option<DateTime<Utc>>,
}

/// Which way traffic has flowed over an edge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EdgeDirection {
    Forward,
    Backward,
    Bidirectional,
}

/// One edge as reported to the presentation layer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EdgeSnapshot {
    pub a: String,
    pub b: String,
    pub last_communicated_at: DateTime<Utc>,
    pub direction: EdgeDirection,
}

#[derive(Default)]
pub struct EdgeLedger {
    edges: Mutex<BTreeMap<(String, String), EdgeActivity>>,
}

impl EdgeLedger {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, BTreeMap<(String, String), EdgeActivity>> {
        self.edges.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Record a delivery from `from` to `to`. Names are reduced to their
    /// simple form so that the ledger matches configured edges.
    pub fn record_at(&self, from: &str, to: &str, now: DateTime<Utc>) {
        let (from, to) = (simple_name(from), simple_name(to));
        let forward = from <= to;
        let key = if forward {
            (from.to_string(), to.to_string())
        } else {
            (to.to_string(), from.to_string())
        };

        let mut edges = self.lock();
        let entry = edges.entry(key).or_default();
        if forward {
            entry.last_forward_at = Some(now);
        } else {
            entry.last_backward_at = Some(now);
        }
    }

    pub fn get(&self, a: &str, b: &str) -> Option<EdgeActivity> {
        let (a, b) = if a <= b { (a, b) } else { (b, a) };
        self.lock().get(&(a.to_string(), b.to_string())).copied()
    }

    /// Every edge with traffic, in key order.
    pub fn snapshot(&self) -> Vec<EdgeSnapshot> {
        self.lock()
            .iter()
            .filter_map(|((a, b), activity)| {
                let (direction, last) = match (activity.last_forward_at, activity.last_backward_at) {
                    (Some(f), Some(r)) => (EdgeDirection::Bidirectional, f.max(r)),
                    (Some(f), None) => (EdgeDirection::Forward, f),
                    (None, Some(r)) => (EdgeDirection::Backward, r),
                    (None, None) => return None,
                };
                Some(EdgeSnapshot {
                    a: a.clone(),
                    b: b.clone(),
                    last_communicated_at: last,
                    direction,
                })
            })
            .collect()
    }
}

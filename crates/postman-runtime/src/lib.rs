//! Runtime for the postman message bus.
//!
//! Moves message files between session directories, tracks node activity,
//! and runs the daemon coordinator that ties filesystem events, timers and
//! the tmux transport together.

pub mod activity;
pub mod alert;
pub mod compaction;
pub mod daemon;
pub mod discovery;
pub mod edges;
pub mod events;
pub mod layout;
pub mod lock;
pub mod observer;
pub mod pane;
pub mod reminder;
pub mod router;
pub mod sessions;
pub mod tasks;

pub use postman_core as core;

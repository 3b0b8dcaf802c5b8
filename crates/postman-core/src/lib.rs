//! Domain types for the postman message bus: message filenames, node names,
//! the routing graph, configuration and templates.

pub mod adjacency;
pub mod config;
pub mod error;
pub mod message;
pub mod node;
pub mod settings;
pub mod template;

pub use error::{PostmanError, Result};

use std::path::PathBuf;
use thiserror::Error;

/// All errors produced by the postman message bus.
#[derive(Error, Debug)]
pub enum PostmanError {
    /// A filename does not follow `{timestamp}-from-{sender}-to-{recipient}.md`.
    #[error("Invalid message filename: {0}")]
    MessageFilename(String),

    /// A node name could not be resolved against the discovered node map.
    #[error("Unknown node: {0}")]
    UnknownNode(String),

    /// An edge declaration could not be parsed.
    #[error("Invalid edge declaration: {0}")]
    InvalidEdge(String),

    /// A configuration value is missing or invalid.
    #[error("Configuration error: {0}")]
    Config(String),

    /// A TOML configuration document could not be parsed.
    #[error("Failed to parse config {path}: {source}")]
    ConfigParse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    /// A file could not be relocated between bus directories.
    #[error("Failed to move {from} to {to}: {source}")]
    FileMove {
        from: PathBuf,
        to: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// A terminal-multiplexer command failed or timed out.
    #[error("Pane transport error: {0}")]
    Pane(String),

    /// Another daemon already holds the context lock.
    #[error("Context directory is locked by another daemon: {0}")]
    Locked(PathBuf),

    /// Pass-through for any raw I/O error that does not carry a path.
    #[error(transparent)]
    Io(#[from] std::io::Error),

    /// Catch-all for errors from third-party crates via `anyhow`.
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Convenience alias used throughout the postman crates.
pub type Result<T> = std::result::Result<T, PostmanError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display_message_filename() {
        let err = PostmanError::MessageFilename("notes.txt".to_string());
        assert_eq!(err.to_string(), "Invalid message filename: notes.txt");
    }

    #[test]
    fn test_error_display_unknown_node() {
        let err = PostmanError::UnknownNode("ghost".to_string());
        assert_eq!(err.to_string(), "Unknown node: ghost");
    }

    #[test]
    fn test_error_display_file_move() {
        let err = PostmanError::FileMove {
            from: PathBuf::from("/ctx/s/post/a.md"),
            to: PathBuf::from("/ctx/s/inbox/w/a.md"),
            source: std::io::Error::new(std::io::ErrorKind::PermissionDenied, "denied"),
        };
        let msg = err.to_string();
        assert!(msg.contains("/ctx/s/post/a.md"));
        assert!(msg.contains("/ctx/s/inbox/w/a.md"));
        assert!(msg.contains("denied"));
    }

    #[test]
    fn test_error_display_locked() {
        let err = PostmanError::Locked(PathBuf::from("/ctx/postman.lock"));
        assert_eq!(
            err.to_string(),
            "Context directory is locked by another daemon: /ctx/postman.lock"
        );
    }

    #[test]
    fn test_error_from_io() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "gone");
        let err: PostmanError = io_err.into();
        assert!(err.to_string().contains("gone"));
    }

    #[test]
    fn test_error_config_parse_carries_path() {
        let source = toml::from_str::<toml::Table>("edges = [").unwrap_err();
        let err = PostmanError::ConfigParse {
            path: PathBuf::from("/home/u/.config/postman/postman.toml"),
            source,
        };
        assert!(err.to_string().contains("postman.toml"));
    }
}

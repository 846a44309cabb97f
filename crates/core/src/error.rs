//! Error taxonomy shared by the distributor, dispatcher and executor.

use std::path::PathBuf;

/// Result type for dagfleet operations.
pub type Result<T> = std::result::Result<T, DistError>;

/// Errors that can occur while distributing and executing work.
#[derive(Debug, thiserror::Error)]
pub enum DistError {
    /// Missing or unsupported worker, bad environment or plan shape.
    /// Raised before any cluster action is taken.
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// The dependency graph of a partition is not acyclic.
    #[error("Cycle detected in partition {partition} at node '{node}'")]
    Cycle { partition: usize, node: String },

    /// A remote install/build step exited with a non-zero status.
    #[error("Build step failed on {address}: `{command}` exited with {exit_code:?}")]
    Build {
        address: String,
        command: String,
        exit_code: Option<i32>,
        stderr: String,
    },

    /// Scheduler or destination unreachable, or a remote command timed out.
    #[error("Connection error ({address}): {message}")]
    Connection { address: String, message: String },

    /// Cleanup of a generated artifact failed, even after the permission retry.
    #[error("Filesystem error at {}: {source}", path.display())]
    Filesystem {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// A node of a partition returned an error from the worker.
    #[error("Node '{node}' failed: {message}")]
    NodeFailed { node: String, message: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML parsing error: {0}")]
    Toml(#[from] toml::de::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl DistError {
    pub fn config(message: impl Into<String>) -> Self {
        Self::Configuration(message.into())
    }

    pub fn connection(address: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Connection {
            address: address.into(),
            message: message.into(),
        }
    }
}

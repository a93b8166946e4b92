//! Error types for policy loading and evaluation

use std::path::PathBuf;

use thiserror::Error;

/// Result type for policy operations
pub type Result<T> = std::result::Result<T, PolicyError>;

/// Errors raised while loading, persisting, or watching policy
#[derive(Debug, Error)]
pub enum PolicyError {
    /// The model definition is malformed or unsupported
    #[error("invalid model: {0}")]
    ModelParse(String),

    /// A policy line could not be parsed
    #[error("invalid policy at line {line}: {message}")]
    PolicyParse {
        /// 1-based line number in the source
        line: usize,
        /// What was wrong with it
        message: String,
    },

    /// Reading or writing a policy file failed
    #[error("I/O error on {}: {source}", path.display())]
    Io {
        /// File involved
        path: PathBuf,
        /// Underlying error
        #[source]
        source: std::io::Error,
    },

    /// Listing rules from the cluster failed
    #[error("kubernetes API error: {0}")]
    Kube(#[from] kube::Error),

    /// Mutation attempted on a read-only source
    #[error("not implemented: {0}")]
    NotImplemented(String),

    /// Change notification setup failed
    #[error("watch error: {0}")]
    Watch(String),
}

impl PolicyError {
    /// Create an I/O error for a path
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    /// Create a parse error for a line
    pub fn parse(line: usize, message: impl Into<String>) -> Self {
        Self::PolicyParse {
            line,
            message: message.into(),
        }
    }

    /// Error returned by every mutating call on a read-only adapter
    pub fn read_only(operation: &str) -> Self {
        Self::NotImplemented(format!(
            "{} is not supported for GrafanaDataSourceRule sources: use the Kubernetes API to manage rules",
            operation
        ))
    }
}

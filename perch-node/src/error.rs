use perch_relay::RelayError;
use thiserror::Error;

/// Errors that can occur in the node.
#[derive(Debug, Error)]
#[allow(clippy::enum_variant_names)]
pub enum NodeError {
    #[error("config error: {reason}")]
    ConfigError { reason: String },

    #[error("relay error: {0}")]
    RelayError(#[from] RelayError),

    #[error("fatal error in {task}: {reason}")]
    Fatal { task: String, reason: String },

    #[error("io error: {0}")]
    IoError(#[from] std::io::Error),
}

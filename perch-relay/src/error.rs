use thiserror::Error;

/// Errors that can occur in the relay layer.
#[derive(Debug, Clone, Error)]
pub enum RelayError {
    /// The negotiated network options are incomplete or invalid.
    #[error("configuration error: {reason}")]
    Configuration { reason: String },

    /// No listen address could be bound.
    #[error("bind error: {reason}")]
    Bind { reason: String },

    /// A requested transport, security or multiplexer combination is unsupported.
    #[error("transport error: {reason}")]
    Transport { reason: String },

    /// The pub/sub topic could not be established.
    #[error("failed to join topic '{topic}': {reason}")]
    TopicJoin { topic: String, reason: String },

    /// A single publish attempt failed.
    #[error("failed to publish to '{topic}': {reason}")]
    Publish { topic: String, reason: String },

    /// Local-network discovery could not be initialised.
    #[error("discovery start error: {reason}")]
    DiscoveryStart { reason: String },

    /// Failed to establish a connection to a peer.
    #[error("connection error: {reason}")]
    Connection { reason: String },

    /// Failed to encode or decode a message.
    #[error("codec error: {reason}")]
    Codec { reason: String },

    /// Message exceeds maximum allowed size.
    #[error("message too large: {size} bytes (max {max})")]
    MessageTooLarge { size: usize, max: usize },

    /// The node's command channel is gone.
    #[error("channel error: {reason}")]
    Channel { reason: String },

    /// The operation was cancelled before it completed.
    #[error("operation cancelled")]
    Cancelled,
}

impl RelayError {
    pub(crate) fn node_closed() -> Self {
        RelayError::Channel {
            reason: "network node is closed".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_topic_join_display() {
        let err = RelayError::TopicJoin {
            topic: "perch-default".to_string(),
            reason: "node closed".to_string(),
        };
        let text = err.to_string();
        assert!(text.contains("perch-default"));
        assert!(text.contains("node closed"));
    }

    #[test]
    fn test_message_too_large_display() {
        let err = RelayError::MessageTooLarge { size: 10, max: 5 };
        assert_eq!(err.to_string(), "message too large: 10 bytes (max 5)");
    }
}

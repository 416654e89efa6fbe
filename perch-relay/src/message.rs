use serde::{Deserialize, Serialize};

/// A message published onto a pub/sub topic.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    /// Peer ID of the node that published the message.
    pub sender_peer_id: String,
    /// Free-form label describing where the message came from.
    pub sender_label: String,
    /// Message payload.
    pub body: String,
}

impl Message {
    pub fn new(
        sender_peer_id: impl Into<String>,
        sender_label: impl Into<String>,
        body: impl Into<String>,
    ) -> Self {
        Self {
            sender_peer_id: sender_peer_id.into(),
            sender_label: sender_label.into(),
            body: body.into(),
        }
    }
}

impl std::fmt::Display for Message {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "[{} {}] {}",
            self.sender_peer_id, self.sender_label, self.body
        )
    }
}

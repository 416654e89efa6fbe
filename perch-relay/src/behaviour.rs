use libp2p::gossipsub;
use libp2p::identify;
use libp2p::identity::Keypair;
use libp2p::mdns;
use libp2p::swarm::behaviour::toggle::Toggle;
use libp2p::swarm::NetworkBehaviour;

use crate::protocol::{AGENT_VERSION, GOSSIP_HEARTBEAT, GOSSIP_MAX_TRANSMIT_SIZE, IDENTIFY_PROTOCOL};

/// Combined network behaviour for a Perch node.
#[derive(NetworkBehaviour)]
pub struct PerchBehaviour {
    /// Gossipsub for topic-based pub/sub.
    pub gossipsub: gossipsub::Behaviour,
    /// Identify protocol for peer identification.
    pub identify: identify::Behaviour,
    /// Local-network discovery. Disabled until the discovery service starts.
    pub mdns: Toggle<mdns::tokio::Behaviour>,
}

/// Build a PerchBehaviour from a keypair.
///
/// Returns `Result<PerchBehaviour, Box<dyn Error + Send + Sync>>` to conform
/// to the `TryIntoBehaviour` trait expected by `SwarmBuilder::with_behaviour`.
pub fn build_behaviour(
    keypair: &Keypair,
) -> Result<PerchBehaviour, Box<dyn std::error::Error + Send + Sync>> {
    // --- Gossipsub ---
    // Heartbeats repeat the same body, so ids cover source and sequence number
    // as well as the payload.
    let message_id_fn = |message: &gossipsub::Message| {
        let mut hasher = blake3::Hasher::new();
        if let Some(source) = &message.source {
            hasher.update(&source.to_bytes());
        }
        if let Some(seqno) = message.sequence_number {
            hasher.update(&seqno.to_be_bytes());
        }
        hasher.update(&message.data);
        gossipsub::MessageId::from(hasher.finalize().as_bytes().to_vec())
    };

    let gossipsub_config = gossipsub::ConfigBuilder::default()
        .heartbeat_interval(GOSSIP_HEARTBEAT)
        .validation_mode(gossipsub::ValidationMode::Strict)
        .max_transmit_size(GOSSIP_MAX_TRANSMIT_SIZE)
        .message_id_fn(message_id_fn)
        .build()
        .map_err(|e| format!("gossipsub config: {}", e))?;

    let gossipsub = gossipsub::Behaviour::new(
        gossipsub::MessageAuthenticity::Signed(keypair.clone()),
        gossipsub_config,
    )
    .map_err(|e| format!("gossipsub behaviour: {}", e))?;

    // --- Identify ---
    let identify = identify::Behaviour::new(
        identify::Config::new(IDENTIFY_PROTOCOL.to_string(), keypair.public())
            .with_agent_version(AGENT_VERSION.to_string()),
    );

    Ok(PerchBehaviour {
        gossipsub,
        identify,
        mdns: Toggle::from(None),
    })
}

//! P2P networking for Perch nodes.
//!
//! Built on libp2p: a capability negotiator that assembles transports,
//! security and multiplexers, a network node driven by a single task that
//! owns the swarm, gossipsub-based topic pub/sub, and mDNS discovery of
//! peers on the local network segment.

pub mod behaviour;
pub mod codec;
pub mod discovery;
pub mod error;
pub mod message;
pub mod node;
pub mod options;
pub mod peer_manager;
pub mod protocol;
pub mod pubsub;
pub mod transport;

pub use discovery::{DiscoveryConfig, DiscoveryService};
pub use libp2p::{Multiaddr, PeerId};
pub use error::RelayError;
pub use message::Message;
pub use node::{NetworkNode, NodeHandle};
pub use options::{MuxerKind, NetworkOptions, NetworkOptionsBuilder, SecurityKind, TransportKind};
pub use peer_manager::PeerInfo;
pub use pubsub::{JoinOptions, PublishOptions, SelfDelivery, Subscription, TopicHandle};

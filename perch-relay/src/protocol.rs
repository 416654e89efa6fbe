use std::time::Duration;

/// Identify protocol version advertised to peers.
pub const IDENTIFY_PROTOCOL: &str = "/perch/1.0.0";

/// Agent string advertised through identify.
pub const AGENT_VERSION: &str = concat!("perch/", env!("CARGO_PKG_VERSION"));

/// Topic every node joins on startup.
pub const DEFAULT_TOPIC: &str = "perch-default";

/// Service tag used for local-network discovery.
pub const DISCOVERY_SERVICE_TAG: &str = "perch-mdns";

/// Interval between local-network discovery queries.
pub const DISCOVERY_INTERVAL: Duration = Duration::from_secs(5);

/// Interval between heartbeat publishes.
pub const PUBLISH_INTERVAL: Duration = Duration::from_secs(3);

/// Maximum encoded size of a single pub/sub message.
pub const MAX_MESSAGE_SIZE: usize = 65_536; // 64 KiB

/// Largest gossipsub frame accepted, leaving room for the signed envelope.
pub const GOSSIP_MAX_TRANSMIT_SIZE: usize = MAX_MESSAGE_SIZE + 4_096;

/// Gossipsub heartbeat interval.
pub const GOSSIP_HEARTBEAT: Duration = Duration::from_secs(1);

/// Connections with no active streams are closed after this long.
pub const IDLE_CONNECTION_TIMEOUT: Duration = Duration::from_secs(60);

/// Capacity of the command channel into the node driver.
pub const COMMAND_BUFFER: usize = 256;

/// Build the printable form of a listen address: `"{addr}/p2p/{peer}"`.
pub fn p2p_address(addr: &impl std::fmt::Display, peer: &impl std::fmt::Display) -> String {
    format!("{}/p2p/{}", addr, peer)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_p2p_address() {
        assert_eq!(
            p2p_address(&"/ip4/127.0.0.1/tcp/4001", &"12D3KooW"),
            "/ip4/127.0.0.1/tcp/4001/p2p/12D3KooW"
        );
    }

    #[test]
    fn test_agent_version_prefix() {
        assert!(AGENT_VERSION.starts_with("perch/"));
    }
}

use libp2p::{Multiaddr, PeerId};
use std::collections::HashMap;
use std::time::Instant;

/// Information about a connected peer.
#[derive(Debug, Clone)]
pub struct PeerInfo {
    /// The libp2p peer ID.
    pub peer_id: PeerId,
    /// Remote address of the first established connection.
    pub address: Multiaddr,
    /// The peer's agent string (set via identify).
    pub agent_version: Option<String>,
    /// When this peer connected.
    pub connected_at: Instant,
}

/// The node's connection set. Owned by the node driver task.
///
/// No connection limit is enforced; every peer that completes a connection
/// is tracked until its last connection closes.
#[derive(Debug, Default)]
pub struct PeerManager {
    peers: HashMap<PeerId, PeerInfo>,
}

impl PeerManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a peer. Returns false if it was already tracked.
    pub fn add_peer(&mut self, peer_id: PeerId, address: Multiaddr) -> bool {
        if self.peers.contains_key(&peer_id) {
            return false;
        }
        self.peers.insert(
            peer_id,
            PeerInfo {
                peer_id,
                address,
                agent_version: None,
                connected_at: Instant::now(),
            },
        );
        true
    }

    /// Remove a peer. Returns the removed entry, if any.
    pub fn remove_peer(&mut self, peer_id: &PeerId) -> Option<PeerInfo> {
        self.peers.remove(peer_id)
    }

    pub fn is_connected(&self, peer_id: &PeerId) -> bool {
        self.peers.contains_key(peer_id)
    }

    /// Number of currently connected peers.
    pub fn peer_count(&self) -> usize {
        self.peers.len()
    }

    /// Iterator over the peer IDs of all connected peers.
    pub fn connected_peers(&self) -> impl Iterator<Item = &PeerId> {
        self.peers.keys()
    }

    pub fn peer(&self, peer_id: &PeerId) -> Option<&PeerInfo> {
        self.peers.get(peer_id)
    }

    /// Copies of every tracked entry, oldest connection first.
    pub fn snapshot(&self) -> Vec<PeerInfo> {
        let mut peers: Vec<PeerInfo> = self.peers.values().cloned().collect();
        peers.sort_by_key(|info| info.connected_at);
        peers
    }

    /// Record the agent string a peer reported through identify.
    pub fn set_agent_version(&mut self, peer_id: &PeerId, agent_version: String) {
        if let Some(info) = self.peers.get_mut(peer_id) {
            info.agent_version = Some(agent_version);
        }
    }

    pub fn clear(&mut self) {
        self.peers.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr() -> Multiaddr {
        "/ip4/127.0.0.1/tcp/4001".parse().unwrap()
    }

    #[test]
    fn test_add_remove_peer() {
        let mut pm = PeerManager::new();
        let peer = PeerId::random();
        assert!(pm.add_peer(peer, addr()));
        assert_eq!(pm.peer_count(), 1);
        assert!(pm.is_connected(&peer));
        assert!(pm.remove_peer(&peer).is_some());
        assert_eq!(pm.peer_count(), 0);
        assert!(!pm.is_connected(&peer));
    }

    #[test]
    fn test_add_twice_keeps_first_entry() {
        let mut pm = PeerManager::new();
        let peer = PeerId::random();
        let other: Multiaddr = "/ip4/10.0.0.2/tcp/4001".parse().unwrap();
        assert!(pm.add_peer(peer, addr()));
        assert!(!pm.add_peer(peer, other));
        assert_eq!(pm.peer_count(), 1);
        assert_eq!(pm.peer(&peer).unwrap().address, addr());
    }

    #[test]
    fn test_no_connection_limit() {
        let mut pm = PeerManager::new();
        for _ in 0..500 {
            assert!(pm.add_peer(PeerId::random(), addr()));
        }
        assert_eq!(pm.peer_count(), 500);
    }

    #[test]
    fn test_connected_peers() {
        let mut pm = PeerManager::new();
        let p1 = PeerId::random();
        let p2 = PeerId::random();
        pm.add_peer(p1, addr());
        pm.add_peer(p2, addr());
        let peers: Vec<_> = pm.connected_peers().cloned().collect();
        assert_eq!(peers.len(), 2);
        assert!(peers.contains(&p1));
        assert!(peers.contains(&p2));
    }

    #[test]
    fn test_set_agent_version() {
        let mut pm = PeerManager::new();
        let peer = PeerId::random();
        pm.add_peer(peer, addr());
        assert_eq!(pm.peer(&peer).unwrap().agent_version, None);
        pm.set_agent_version(&peer, "perch/0.1.0".to_string());
        assert_eq!(
            pm.peer(&peer).unwrap().agent_version.as_deref(),
            Some("perch/0.1.0")
        );
    }

    #[test]
    fn test_set_agent_version_unknown_peer_is_noop() {
        let mut pm = PeerManager::new();
        let peer = PeerId::random();
        pm.set_agent_version(&peer, "perch/0.1.0".to_string());
        assert!(pm.peer(&peer).is_none());
    }

    #[test]
    fn test_snapshot_oldest_first() {
        let mut pm = PeerManager::new();
        let first = PeerId::random();
        let second = PeerId::random();
        pm.add_peer(first, addr());
        std::thread::sleep(std::time::Duration::from_millis(2));
        pm.add_peer(second, "/ip4/10.0.0.2/tcp/4001".parse().unwrap());
        pm.set_agent_version(&second, "perch/0.1.0".to_string());

        let snapshot = pm.snapshot();
        assert_eq!(snapshot.len(), 2);
        assert_eq!(snapshot[0].peer_id, first);
        assert_eq!(snapshot[1].peer_id, second);
        assert_eq!(snapshot[1].agent_version.as_deref(), Some("perch/0.1.0"));
        assert!(snapshot[0].connected_at <= snapshot[1].connected_at);
    }

    #[test]
    fn test_clear() {
        let mut pm = PeerManager::new();
        pm.add_peer(PeerId::random(), addr());
        pm.clear();
        assert_eq!(pm.peer_count(), 0);
    }
}

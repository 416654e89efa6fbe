use std::time::Duration;

use libp2p::{Multiaddr, PeerId};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::RelayError;
use crate::node::{Command, NodeHandle};
use crate::protocol::{DISCOVERY_INTERVAL, DISCOVERY_SERVICE_TAG};

/// Configuration for local-network peer discovery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveryConfig {
    /// How often the local network is queried for peers.
    pub interval: Duration,
    /// Name this node's discovery is announced under.
    pub service_tag: String,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            interval: DISCOVERY_INTERVAL,
            service_tag: DISCOVERY_SERVICE_TAG.to_string(),
        }
    }
}

impl DiscoveryConfig {
    pub fn validate(&self) -> Result<(), RelayError> {
        if self.interval.is_zero() {
            return Err(RelayError::Configuration {
                reason: "discovery interval must be greater than zero".to_string(),
            });
        }
        if self.service_tag.trim().is_empty() {
            return Err(RelayError::Configuration {
                reason: "discovery service tag must not be empty".to_string(),
            });
        }
        Ok(())
    }
}

/// A peer found on the local network, with every address it announced.
#[derive(Debug, Clone)]
pub struct DiscoveredPeer {
    pub peer_id: PeerId,
    pub addresses: Vec<Multiaddr>,
}

/// Feeds peers found by mDNS into the node's connection set.
pub struct DiscoveryService {
    config: DiscoveryConfig,
    node: NodeHandle,
    found: mpsc::UnboundedReceiver<DiscoveredPeer>,
}

impl DiscoveryService {
    /// Enable mDNS on `node` and spawn the service task.
    ///
    /// The task runs until `cancel` fires or the node closes. Fails only when
    /// local-network discovery cannot be initialised at all.
    pub async fn start(
        cancel: CancellationToken,
        node: &NodeHandle,
        config: DiscoveryConfig,
    ) -> Result<JoinHandle<()>, RelayError> {
        config.validate()?;

        let (found_tx, found_rx) = mpsc::unbounded_channel();
        node.request(|reply| Command::StartDiscovery {
            interval: config.interval,
            found: found_tx,
            reply,
        })
        .await
        .map_err(|e| RelayError::DiscoveryStart {
            reason: e.to_string(),
        })??;

        info!(
            service_tag = %config.service_tag,
            interval = ?config.interval,
            "local peer discovery started"
        );

        let service = DiscoveryService {
            config,
            node: node.clone(),
            found: found_rx,
        };
        Ok(tokio::spawn(service.run(cancel)))
    }

    async fn run(mut self, cancel: CancellationToken) {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                peer = self.found.recv() => match peer {
                    Some(peer) => self.connect(peer).await,
                    None => {
                        debug!("node stopped reporting discovered peers");
                        break;
                    }
                },
            }
        }
        self.node.notify(Command::StopDiscovery);
        info!(service_tag = %self.config.service_tag, "local peer discovery stopped");
    }

    async fn connect(&self, peer: DiscoveredPeer) {
        info!(
            peer_id = %peer.peer_id,
            addrs = ?peer.addresses,
            "discovered peer on local network"
        );
        let peer_id = peer.peer_id;
        if let Err(e) = self.node.connect(peer_id, peer.addresses).await {
            warn!(%peer_id, "failed to connect to discovered peer: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::NetworkNode;
    use crate::options::{MuxerKind, NetworkOptions, SecurityKind, TransportKind};

    async fn start_node() -> NodeHandle {
        start_node_on("/ip4/127.0.0.1/tcp/0").await
    }

    async fn start_node_on(listen_addr: &str) -> NodeHandle {
        let options = NetworkOptions::builder()
            .transport(TransportKind::Tcp)
            .security(SecurityKind::Noise)
            .muxer(MuxerKind::Yamux)
            .listen_addr(listen_addr)
            .build()
            .unwrap();
        NetworkNode::start(options, CancellationToken::new())
            .await
            .unwrap()
    }

    #[test]
    fn test_default_config() {
        let config = DiscoveryConfig::default();
        assert_eq!(config.interval, Duration::from_secs(5));
        assert_eq!(config.service_tag, "perch-mdns");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_zero_interval_rejected() {
        let config = DiscoveryConfig {
            interval: Duration::ZERO,
            ..Default::default()
        };
        assert!(matches!(
            config.validate(),
            Err(RelayError::Configuration { .. })
        ));
    }

    #[test]
    fn test_empty_tag_rejected() {
        let config = DiscoveryConfig {
            service_tag: "  ".to_string(),
            ..Default::default()
        };
        assert!(matches!(
            config.validate(),
            Err(RelayError::Configuration { .. })
        ));
    }

    #[tokio::test]
    async fn test_start_on_closed_node_fails() {
        let node = start_node().await;
        node.close().await.unwrap();
        let result =
            DiscoveryService::start(CancellationToken::new(), &node, DiscoveryConfig::default())
                .await;
        assert!(matches!(result, Err(RelayError::DiscoveryStart { .. })));
    }

    /// Requires a multicast-capable network interface.
    #[tokio::test]
    #[ignore]
    async fn test_service_stops_on_cancel() {
        let node = start_node().await;
        let cancel = CancellationToken::new();
        let task = DiscoveryService::start(cancel.clone(), &node, DiscoveryConfig::default())
            .await
            .unwrap();
        cancel.cancel();
        tokio::time::timeout(Duration::from_secs(1), task)
            .await
            .expect("discovery did not stop")
            .unwrap();
        node.close().await.unwrap();
    }

    /// Two nodes on the same host find each other through mDNS.
    ///
    /// mDNS only announces on non-loopback interfaces, so both nodes listen on
    /// the wildcard address. Requires a multicast-capable, non-loopback
    /// network interface.
    #[tokio::test]
    #[ignore]
    async fn test_peers_discovered_within_two_intervals() {
        use tokio::time::{sleep, timeout};

        let config = DiscoveryConfig {
            interval: Duration::from_secs(1),
            service_tag: "perch-mdns".to_string(),
        };
        let node_a = start_node_on("/ip4/0.0.0.0/tcp/0").await;
        let node_b = start_node_on("/ip4/0.0.0.0/tcp/0").await;
        let cancel = CancellationToken::new();
        let _task_a = DiscoveryService::start(cancel.clone(), &node_a, config.clone())
            .await
            .unwrap();
        let _task_b = DiscoveryService::start(cancel.clone(), &node_b, config.clone())
            .await
            .unwrap();

        let found = timeout(config.interval * 2, async {
            loop {
                if node_a
                    .connected_peers()
                    .await
                    .unwrap()
                    .contains(&node_b.identity())
                {
                    return;
                }
                sleep(Duration::from_millis(100)).await;
            }
        })
        .await;
        assert!(found.is_ok(), "peer not discovered within two intervals");

        cancel.cancel();
        node_a.close().await.unwrap();
        node_b.close().await.unwrap();
    }
}

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use futures::StreamExt;
use libp2p::core::transport::ListenerId;
use libp2p::gossipsub::{self, IdentTopic};
use libp2p::identity::Keypair;
use libp2p::mdns;
use libp2p::swarm::behaviour::toggle::Toggle;
use libp2p::swarm::behaviour::{FromSwarm, NewListenAddr};
use libp2p::swarm::dial_opts::DialOpts;
use libp2p::swarm::{NetworkBehaviour, SwarmEvent};
use libp2p::{identify, Multiaddr, PeerId, Swarm, SwarmBuilder};
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::behaviour::{build_behaviour, PerchBehaviour, PerchBehaviourEvent};
use crate::codec;
use crate::discovery::DiscoveredPeer;
use crate::error::RelayError;
use crate::message::Message;
use crate::options::NetworkOptions;
use crate::peer_manager::{PeerInfo, PeerManager};
use crate::protocol::{p2p_address, COMMAND_BUFFER};
use crate::pubsub::{PublishOptions, SelfDelivery};
use crate::transport;

/// Requests sent from [`NodeHandle`]s to the driver task.
pub(crate) enum Command {
    Subscribe {
        topic: String,
        sink: mpsc::UnboundedSender<Message>,
        self_delivery: SelfDelivery,
        reply: oneshot::Sender<Result<(), RelayError>>,
    },
    Unsubscribe {
        topic: String,
    },
    Publish {
        topic: String,
        message: Message,
        options: PublishOptions,
        reply: oneshot::Sender<Result<(), RelayError>>,
    },
    StartDiscovery {
        interval: Duration,
        found: mpsc::UnboundedSender<DiscoveredPeer>,
        reply: oneshot::Sender<Result<(), RelayError>>,
    },
    StopDiscovery,
    Dial {
        addr: Multiaddr,
        reply: oneshot::Sender<Result<(), RelayError>>,
    },
    Connect {
        peer_id: PeerId,
        addresses: Vec<Multiaddr>,
        reply: oneshot::Sender<Result<(), RelayError>>,
    },
    ConnectedPeers {
        reply: oneshot::Sender<Vec<PeerId>>,
    },
    Peers {
        reply: oneshot::Sender<Vec<PeerInfo>>,
    },
    Close {
        reply: oneshot::Sender<()>,
    },
}

/// Local subscription state for one topic.
struct TopicEntry {
    sink: mpsc::UnboundedSender<Message>,
    self_delivery: SelfDelivery,
}

/// Cloneable handle to a running network node.
///
/// All operations are forwarded to the driver task that owns the swarm.
#[derive(Clone)]
pub struct NodeHandle {
    peer_id: PeerId,
    addresses: Arc<RwLock<Vec<Multiaddr>>>,
    commands: mpsc::Sender<Command>,
}

impl NodeHandle {
    /// The node's peer identity.
    pub fn identity(&self) -> PeerId {
        self.peer_id
    }

    /// Addresses the node is currently listening on, in the order they were bound.
    pub fn addresses(&self) -> Vec<Multiaddr> {
        self.addresses
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Listen addresses in dialable `<address>/p2p/<peerID>` form.
    pub fn p2p_addresses(&self) -> Vec<String> {
        self.addresses()
            .iter()
            .map(|addr| p2p_address(addr, &self.peer_id))
            .collect()
    }

    /// Whether the driver task has stopped.
    pub fn is_closed(&self) -> bool {
        self.commands.is_closed()
    }

    /// Dial a peer at an explicit address.
    pub async fn dial(&self, addr: Multiaddr) -> Result<(), RelayError> {
        self.request(|reply| Command::Dial { addr, reply }).await?
    }

    /// Connect to a known peer unless a connection already exists.
    pub async fn connect(
        &self,
        peer_id: PeerId,
        addresses: Vec<Multiaddr>,
    ) -> Result<(), RelayError> {
        self.request(|reply| Command::Connect {
            peer_id,
            addresses,
            reply,
        })
        .await?
    }

    /// Snapshot of the connection set.
    pub async fn connected_peers(&self) -> Result<Vec<PeerId>, RelayError> {
        self.request(|reply| Command::ConnectedPeers { reply }).await
    }

    /// Address, agent string and connection time of every connected peer.
    pub async fn peers(&self) -> Result<Vec<PeerInfo>, RelayError> {
        self.request(|reply| Command::Peers { reply }).await
    }

    /// Release all transport resources. Calling this on a closed node is a no-op.
    pub async fn close(&self) -> Result<(), RelayError> {
        let (reply, done) = oneshot::channel();
        if self.commands.send(Command::Close { reply }).await.is_err() {
            return Ok(());
        }
        // The driver may exit through a concurrent close before answering us.
        let _ = done.await;
        Ok(())
    }

    pub(crate) async fn request<T>(
        &self,
        make: impl FnOnce(oneshot::Sender<T>) -> Command,
    ) -> Result<T, RelayError> {
        let (reply, response) = oneshot::channel();
        self.commands
            .send(make(reply))
            .await
            .map_err(|_| RelayError::node_closed())?;
        response.await.map_err(|_| RelayError::node_closed())
    }

    /// Send a command without waiting for capacity or a reply.
    pub(crate) fn notify(&self, command: Command) {
        if let Err(e) = self.commands.try_send(command) {
            debug!("node command dropped: {}", e);
        }
    }
}

impl std::fmt::Debug for NodeHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NodeHandle")
            .field("peer_id", &self.peer_id)
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// The network node driver. Owns the swarm and the connection set.
pub struct NetworkNode {
    swarm: Swarm<PerchBehaviour>,
    peer_manager: PeerManager,
    topics: HashMap<String, TopicEntry>,
    listen_addrs: Vec<(ListenerId, Multiaddr)>,
    addresses: Arc<RwLock<Vec<Multiaddr>>>,
    discovered: Option<mpsc::UnboundedSender<DiscoveredPeer>>,
    commands: mpsc::Receiver<Command>,
}

impl NetworkNode {
    /// Build the swarm, bind every listen address and spawn the driver task.
    ///
    /// `cancel` only bounds the binding phase; the node runs until [`NodeHandle::close`]
    /// or until every handle is dropped.
    pub async fn start(
        options: NetworkOptions,
        cancel: CancellationToken,
    ) -> Result<NodeHandle, RelayError> {
        transport::check_supported(&options)?;

        let keypair = match options.keypair_seed() {
            Some(mut seed) => Keypair::ed25519_from_bytes(&mut seed).map_err(|e| {
                RelayError::Configuration {
                    reason: format!("invalid keypair seed: {}", e),
                }
            })?,
            None => Keypair::generate_ed25519(),
        };

        let mut swarm = SwarmBuilder::with_existing_identity(keypair)
            .with_tokio()
            .with_other_transport(|key| {
                transport::build_transport(key, &options)
                    .map_err(|e| Box::new(e) as Box<dyn std::error::Error + Send + Sync>)
            })
            .map_err(|e| RelayError::Transport {
                reason: format!("transport: {}", e),
            })?
            .with_behaviour(build_behaviour)
            .map_err(|e| RelayError::Transport {
                reason: format!("behaviour: {}", e),
            })?
            .with_swarm_config(|cfg| {
                cfg.with_idle_connection_timeout(options.idle_connection_timeout())
            })
            .build();

        let listen_addrs = bind(&mut swarm, options.listen_addrs(), &cancel).await?;

        let peer_id = *swarm.local_peer_id();
        let addresses = Arc::new(RwLock::new(
            listen_addrs.iter().map(|(_, addr)| addr.clone()).collect(),
        ));
        let (commands_tx, commands_rx) = mpsc::channel(COMMAND_BUFFER);

        info!(
            %peer_id,
            listeners = listen_addrs.len(),
            transports = ?options.transports(),
            security = %options.security(),
            "network node started"
        );

        let node = NetworkNode {
            swarm,
            peer_manager: PeerManager::new(),
            topics: HashMap::new(),
            listen_addrs,
            addresses: addresses.clone(),
            discovered: None,
            commands: commands_rx,
        };
        tokio::spawn(node.run());

        Ok(NodeHandle {
            peer_id,
            addresses,
            commands: commands_tx,
        })
    }

    /// Main event loop. Processes commands and swarm events until closed.
    async fn run(mut self) {
        loop {
            tokio::select! {
                command = self.commands.recv() => match command {
                    Some(command) => {
                        if !self.handle_command(command) {
                            return;
                        }
                    }
                    None => {
                        debug!("all node handles dropped");
                        self.shutdown();
                        return;
                    }
                },
                event = self.swarm.select_next_some() => self.handle_swarm_event(event),
            }
        }
    }

    fn shutdown(&mut self) {
        // Dropping the sinks ends every open subscription.
        self.topics.clear();
        self.discovered = None;
        self.peer_manager.clear();
        self.addresses
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
        info!(peer_id = %self.swarm.local_peer_id(), "network node closed");
    }

    /// Returns false once the node has been closed.
    fn handle_command(&mut self, command: Command) -> bool {
        match command {
            Command::Subscribe {
                topic,
                sink,
                self_delivery,
                reply,
            } => {
                let _ = reply.send(self.subscribe(topic, sink, self_delivery));
            }
            Command::Unsubscribe { topic } => self.unsubscribe(&topic),
            Command::Publish {
                topic,
                message,
                options,
                reply,
            } => {
                let _ = reply.send(self.publish(&topic, message, options));
            }
            Command::StartDiscovery {
                interval,
                found,
                reply,
            } => {
                let _ = reply.send(self.start_discovery(interval, found));
            }
            Command::StopDiscovery => {
                self.swarm.behaviour_mut().mdns = Toggle::from(None);
                self.discovered = None;
                debug!("mdns disabled");
            }
            Command::Dial { addr, reply } => {
                let result = self
                    .swarm
                    .dial(addr.clone())
                    .map_err(|e| RelayError::Connection {
                        reason: format!("dial {}: {}", addr, e),
                    });
                let _ = reply.send(result);
            }
            Command::Connect {
                peer_id,
                addresses,
                reply,
            } => {
                let _ = reply.send(self.connect(peer_id, addresses));
            }
            Command::ConnectedPeers { reply } => {
                let _ = reply.send(self.peer_manager.connected_peers().copied().collect());
            }
            Command::Peers { reply } => {
                let _ = reply.send(self.peer_manager.snapshot());
            }
            Command::Close { reply } => {
                self.shutdown();
                let _ = reply.send(());
                return false;
            }
        }
        true
    }

    fn subscribe(
        &mut self,
        topic: String,
        sink: mpsc::UnboundedSender<Message>,
        self_delivery: SelfDelivery,
    ) -> Result<(), RelayError> {
        if self
            .topics
            .get(&topic)
            .is_some_and(|entry| !entry.sink.is_closed())
        {
            return Err(RelayError::TopicJoin {
                topic,
                reason: "topic already joined".to_string(),
            });
        }

        self.swarm
            .behaviour_mut()
            .gossipsub
            .subscribe(&IdentTopic::new(topic.as_str()))
            .map_err(|e| RelayError::TopicJoin {
                topic: topic.clone(),
                reason: e.to_string(),
            })?;

        debug!(%topic, ?self_delivery, "joined topic");
        self.topics.insert(
            topic,
            TopicEntry {
                sink,
                self_delivery,
            },
        );
        Ok(())
    }

    fn unsubscribe(&mut self, topic: &str) {
        // A newer subscription may have replaced the one being cancelled.
        let stale = self
            .topics
            .get(topic)
            .is_some_and(|entry| entry.sink.is_closed());
        if !stale {
            return;
        }
        self.topics.remove(topic);
        let _ = self
            .swarm
            .behaviour_mut()
            .gossipsub
            .unsubscribe(&IdentTopic::new(topic));
        debug!(%topic, "left topic");
    }

    fn publish(
        &mut self,
        topic: &str,
        message: Message,
        options: PublishOptions,
    ) -> Result<(), RelayError> {
        let data = codec::encode_message(&message)?;

        match self
            .swarm
            .behaviour_mut()
            .gossipsub
            .publish(IdentTopic::new(topic), data)
        {
            Ok(id) => debug!(%topic, %id, "published message"),
            Err(gossipsub::PublishError::InsufficientPeers) if !options.require_peers => {
                debug!(%topic, "no remote subscribers, message kept local");
            }
            Err(e) => {
                return Err(RelayError::Publish {
                    topic: topic.to_string(),
                    reason: e.to_string(),
                })
            }
        }

        if let Some(entry) = self.topics.get(topic) {
            if entry.self_delivery == SelfDelivery::Deliver {
                let _ = entry.sink.send(message);
            }
        }
        Ok(())
    }

    fn start_discovery(
        &mut self,
        interval: Duration,
        found: mpsc::UnboundedSender<DiscoveredPeer>,
    ) -> Result<(), RelayError> {
        if self.swarm.behaviour().mdns.is_enabled() {
            return Err(RelayError::DiscoveryStart {
                reason: "discovery is already running".to_string(),
            });
        }

        let config = mdns::Config {
            query_interval: interval,
            ..Default::default()
        };
        let local_peer_id = *self.swarm.local_peer_id();
        let behaviour = mdns::tokio::Behaviour::new(config, local_peer_id).map_err(|e| {
            RelayError::DiscoveryStart {
                reason: e.to_string(),
            }
        })?;
        self.swarm.behaviour_mut().mdns = Toggle::from(Some(behaviour));

        // Listeners were bound before mDNS existed, so it never saw their addresses.
        if let Some(mdns) = self.swarm.behaviour_mut().mdns.as_mut() {
            for (listener_id, addr) in &self.listen_addrs {
                mdns.on_swarm_event(FromSwarm::NewListenAddr(NewListenAddr {
                    listener_id: *listener_id,
                    addr,
                }));
            }
        }

        self.discovered = Some(found);
        debug!(?interval, "mdns enabled");
        Ok(())
    }

    fn connect(&mut self, peer_id: PeerId, addresses: Vec<Multiaddr>) -> Result<(), RelayError> {
        if self.swarm.is_connected(&peer_id) {
            return Ok(());
        }
        let opts = DialOpts::peer_id(peer_id).addresses(addresses).build();
        self.swarm.dial(opts).map_err(|e| RelayError::Connection {
            reason: format!("dial {}: {}", peer_id, e),
        })
    }

    fn handle_swarm_event(&mut self, event: SwarmEvent<PerchBehaviourEvent>) {
        match event {
            SwarmEvent::Behaviour(event) => self.handle_behaviour_event(event),
            SwarmEvent::ConnectionEstablished {
                peer_id, endpoint, ..
            } => {
                debug!(%peer_id, ?endpoint, "connection established");
                if self
                    .peer_manager
                    .add_peer(peer_id, endpoint.get_remote_address().clone())
                {
                    info!(
                        %peer_id,
                        peers = self.peer_manager.peer_count(),
                        "peer connected"
                    );
                }
            }
            SwarmEvent::ConnectionClosed {
                peer_id,
                cause,
                num_established,
                ..
            } => {
                debug!(%peer_id, ?cause, "connection closed");
                if num_established == 0 && self.peer_manager.remove_peer(&peer_id).is_some() {
                    info!(
                        %peer_id,
                        peers = self.peer_manager.peer_count(),
                        "peer disconnected"
                    );
                }
            }
            SwarmEvent::NewListenAddr {
                listener_id,
                address,
            } => {
                info!(%address, "listening on new address");
                self.addresses
                    .write()
                    .unwrap_or_else(PoisonError::into_inner)
                    .push(address.clone());
                self.listen_addrs.push((listener_id, address));
            }
            SwarmEvent::ExpiredListenAddr { address, .. } => {
                info!(%address, "listen address expired");
                self.addresses
                    .write()
                    .unwrap_or_else(PoisonError::into_inner)
                    .retain(|a| a != &address);
                self.listen_addrs.retain(|(_, a)| a != &address);
            }
            SwarmEvent::OutgoingConnectionError { peer_id, error, .. } => {
                warn!(?peer_id, "outgoing connection failed: {}", error);
            }
            other => {
                debug!(?other, "other swarm event");
            }
        }
    }

    fn handle_behaviour_event(&mut self, event: PerchBehaviourEvent) {
        match event {
            PerchBehaviourEvent::Gossipsub(gossipsub::Event::Message {
                propagation_source,
                message,
                ..
            }) => {
                let topic = message.topic.as_str().to_string();
                debug!(%propagation_source, %topic, "received gossipsub message");
                let decoded = match codec::decode_message(&message.data) {
                    Ok(msg) => msg,
                    Err(e) => {
                        warn!(%topic, "failed to decode gossipsub message: {}", e);
                        return;
                    }
                };
                let delivered = self
                    .topics
                    .get(&topic)
                    .map(|entry| entry.sink.send(decoded).is_ok());
                if delivered == Some(false) {
                    self.unsubscribe(&topic);
                }
            }
            PerchBehaviourEvent::Gossipsub(gossipsub::Event::Subscribed { peer_id, topic }) => {
                debug!(%peer_id, %topic, "peer subscribed");
            }
            PerchBehaviourEvent::Gossipsub(_) => {}
            PerchBehaviourEvent::Identify(identify::Event::Received { peer_id, info, .. }) => {
                debug!(
                    %peer_id,
                    protocol = %info.protocol_version,
                    agent = %info.agent_version,
                    "identified peer"
                );
                self.peer_manager
                    .set_agent_version(&peer_id, info.agent_version);
            }
            PerchBehaviourEvent::Identify(_) => {}
            PerchBehaviourEvent::Mdns(mdns::Event::Discovered(list)) => {
                let mut grouped: HashMap<PeerId, Vec<Multiaddr>> = HashMap::new();
                for (peer_id, addr) in list {
                    grouped.entry(peer_id).or_default().push(addr);
                }
                if let Some(found) = &self.discovered {
                    for (peer_id, addresses) in grouped {
                        if found
                            .send(DiscoveredPeer { peer_id, addresses })
                            .is_err()
                        {
                            self.discovered = None;
                            break;
                        }
                    }
                }
            }
            PerchBehaviourEvent::Mdns(mdns::Event::Expired(list)) => {
                for (peer_id, addr) in list {
                    debug!(%peer_id, %addr, "mdns record expired");
                }
            }
        }
    }
}

/// Start listening on every template and wait until each listener either
/// reported an address or failed.
async fn bind(
    swarm: &mut Swarm<PerchBehaviour>,
    templates: &[Multiaddr],
    cancel: &CancellationToken,
) -> Result<Vec<(ListenerId, Multiaddr)>, RelayError> {
    let mut pending = HashSet::new();
    for addr in templates {
        match swarm.listen_on(addr.clone()) {
            Ok(listener_id) => {
                pending.insert(listener_id);
            }
            Err(e) => warn!(%addr, "cannot listen on address: {}", e),
        }
    }

    let mut bound = Vec::new();
    while !pending.is_empty() {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(RelayError::Cancelled),
            event = swarm.select_next_some() => match event {
                SwarmEvent::NewListenAddr { listener_id, address } => {
                    pending.remove(&listener_id);
                    info!(%address, "listening on new address");
                    bound.push((listener_id, address));
                }
                SwarmEvent::ListenerClosed { listener_id, addresses, reason } => {
                    pending.remove(&listener_id);
                    warn!(?addresses, ?reason, "listener closed while binding");
                }
                SwarmEvent::ListenerError { listener_id, error } => {
                    pending.remove(&listener_id);
                    warn!("listener failed while binding: {}", error);
                }
                other => debug!(?other, "swarm event while binding"),
            }
        }
    }

    if bound.is_empty() {
        return Err(RelayError::Bind {
            reason: format!(
                "none of the {} listen address(es) could be bound",
                templates.len()
            ),
        });
    }
    Ok(bound)
}

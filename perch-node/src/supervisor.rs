//! Node lifecycle: `Starting → Running → ShuttingDown → Stopped`.
//!
//! The supervisor owns the network node, every background task it spawns and
//! the cleanup registry. Loops report back through a single tagged inbox that
//! the control loop drains alongside SIGINT and SIGTERM.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use perch_relay::pubsub::{self, Subscription, TopicHandle};
use perch_relay::{DiscoveryService, Message, NetworkNode, NodeHandle, PublishOptions, RelayError};
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::cleanup::{CleanupRegistry, CleanupResult};
use crate::config::NodeConfig;
use crate::error::NodeError;
use crate::metrics::NodeMetrics;
use crate::tasks::TaskRegistry;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
    Starting,
    Running,
    ShuttingDown,
    Stopped,
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LifecycleState::Starting => f.write_str("starting"),
            LifecycleState::Running => f.write_str("running"),
            LifecycleState::ShuttingDown => f.write_str("shutting down"),
            LifecycleState::Stopped => f.write_str("stopped"),
        }
    }
}

/// An error reported by a background loop.
#[derive(Debug, Clone, Error)]
#[error("{task}: {reason}")]
pub struct TaskError {
    pub task: &'static str,
    pub reason: String,
    /// Fatal errors stop the node.
    pub fatal: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownReason {
    Interrupt,
    Terminate,
    Requested,
}

impl fmt::Display for ShutdownReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ShutdownReason::Interrupt => f.write_str("SIGINT"),
            ShutdownReason::Terminate => f.write_str("SIGTERM"),
            ShutdownReason::Requested => f.write_str("shutdown request"),
        }
    }
}

/// Everything the control loop reacts to.
#[derive(Debug)]
pub enum SupervisorEvent {
    Message(Message),
    Error(TaskError),
    Shutdown(ShutdownReason),
}

/// Channels the supervisor feeds for outside consumers.
#[derive(Debug)]
pub struct SupervisorOutputs {
    /// Every message received on the joined topic.
    pub messages: mpsc::UnboundedReceiver<Message>,
    /// Every error reported by a background loop, fatal or not.
    pub errors: mpsc::UnboundedReceiver<TaskError>,
}

/// Requests shutdown of a running supervisor. Requests after it stopped are ignored.
#[derive(Debug, Clone)]
pub struct ShutdownHandle {
    inbox: mpsc::UnboundedSender<SupervisorEvent>,
}

impl ShutdownHandle {
    pub fn request_shutdown(&self) {
        if self
            .inbox
            .send(SupervisorEvent::Shutdown(ShutdownReason::Requested))
            .is_err()
        {
            debug!("shutdown requested after supervisor stopped");
        }
    }
}

pub struct Supervisor {
    config: NodeConfig,
    cancel: CancellationToken,
    inbox_tx: mpsc::UnboundedSender<SupervisorEvent>,
    inbox_rx: mpsc::UnboundedReceiver<SupervisorEvent>,
    messages: mpsc::UnboundedSender<Message>,
    errors: mpsc::UnboundedSender<TaskError>,
    state: watch::Sender<LifecycleState>,
    tasks: TaskRegistry,
    cleanup: CleanupRegistry,
    metrics: Arc<NodeMetrics>,
    node: Option<NodeHandle>,
}

impl Supervisor {
    pub fn new(config: NodeConfig) -> (Self, SupervisorOutputs) {
        let (inbox_tx, inbox_rx) = mpsc::unbounded_channel();
        let (messages_tx, messages_rx) = mpsc::unbounded_channel();
        let (errors_tx, errors_rx) = mpsc::unbounded_channel();
        let (state, _) = watch::channel(LifecycleState::Starting);

        let supervisor = Self {
            config,
            cancel: CancellationToken::new(),
            inbox_tx,
            inbox_rx,
            messages: messages_tx,
            errors: errors_tx,
            state,
            tasks: TaskRegistry::new(),
            cleanup: CleanupRegistry::new(),
            metrics: Arc::new(NodeMetrics::new()),
            node: None,
        };
        let outputs = SupervisorOutputs {
            messages: messages_rx,
            errors: errors_rx,
        };
        (supervisor, outputs)
    }

    pub fn shutdown_handle(&self) -> ShutdownHandle {
        ShutdownHandle {
            inbox: self.inbox_tx.clone(),
        }
    }

    /// Watch the lifecycle state.
    pub fn state(&self) -> watch::Receiver<LifecycleState> {
        self.state.subscribe()
    }

    pub fn metrics(&self) -> Arc<NodeMetrics> {
        self.metrics.clone()
    }

    /// The registry drained at shutdown. Clones may register from other tasks.
    pub fn cleanup_registry(&self) -> CleanupRegistry {
        self.cleanup.clone()
    }

    pub fn register_cleanup<F>(&self, name: impl Into<String>, action: F) -> bool
    where
        F: FnOnce() -> CleanupResult + Send + 'static,
    {
        self.cleanup.register(name, action)
    }

    /// The process-wide cancellation token threaded into every background task.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Start the node and supervise it until a signal, a shutdown request or a
    /// fatal error. Always ends in [`LifecycleState::Stopped`].
    pub async fn run(mut self) -> Result<(), NodeError> {
        // Listen before starting so a signal during a slow bind still tears down.
        let mut signals = TerminationSignals::install();
        let started = tokio::select! {
            started = self.start() => Some(started),
            reason = signals.recv() => {
                info!(%reason, "shutting down during startup");
                None
            }
        };

        let result = match started {
            Some(Ok(())) => {
                self.set_state(LifecycleState::Running);
                info!(tasks = self.tasks.len(), "node running");
                self.control_loop(&mut signals).await
            }
            Some(Err(e)) => {
                error!("startup failed: {}", e);
                Err(e)
            }
            None => Ok(()),
        };
        self.shutdown().await;
        result
    }

    async fn start(&mut self) -> Result<(), NodeError> {
        self.config.validate()?;
        let options = self.config.to_network_options()?;

        let node = NetworkNode::start(options, self.cancel.clone()).await?;
        self.node = Some(node.clone());
        for addr in node.p2p_addresses() {
            println!("Listening P2P on {}", addr);
        }

        let topic = &self.config.pubsub.topic;
        let (subscription, topic) =
            pubsub::join_with(&node, topic, self.config.join_options()).await?;
        info!(topic = %topic.name(), "joined topic");

        if self.config.discovery.enabled {
            match DiscoveryService::start(
                self.cancel.clone(),
                &node,
                self.config.discovery_config(),
            )
            .await
            {
                Ok(handle) => self.tasks.register("discovery", handle),
                Err(e) => warn!("continuing without local peer discovery: {}", e),
            }
        }

        for addr in self.config.boot_addrs()? {
            match node.dial(addr.clone()).await {
                Ok(()) => info!(%addr, "dialing boot node"),
                Err(e) => warn!(%addr, "failed to dial boot node: {}", e),
            }
        }

        let heartbeat = Message::new(
            node.identity().to_string(),
            self.config.pubsub.sender_label.as_str(),
            self.config.pubsub.body.as_str(),
        );
        self.tasks.spawn(
            "publish",
            publish_loop(
                self.cancel.clone(),
                topic,
                heartbeat,
                self.config.publish_interval(),
                self.config.publish_options(),
                self.inbox_tx.clone(),
                self.metrics.clone(),
            ),
        );
        self.tasks.spawn(
            "receive",
            receive_loop(self.cancel.clone(), subscription, self.inbox_tx.clone()),
        );
        Ok(())
    }

    async fn control_loop(&mut self, signals: &mut TerminationSignals) -> Result<(), NodeError> {
        loop {
            let event = tokio::select! {
                event = self.inbox_rx.recv() => match event {
                    Some(event) => event,
                    None => return Ok(()),
                },
                reason = signals.recv() => SupervisorEvent::Shutdown(reason),
            };

            match event {
                SupervisorEvent::Message(message) => {
                    self.metrics.messages_received.inc();
                    debug!(
                        sender = %message.sender_peer_id,
                        label = %message.sender_label,
                        "message received"
                    );
                    let _ = self.messages.send(message);
                }
                SupervisorEvent::Error(err) => {
                    let _ = self.errors.send(err.clone());
                    if err.fatal {
                        error!(task = err.task, "fatal error: {}", err.reason);
                        return Err(NodeError::Fatal {
                            task: err.task.to_string(),
                            reason: err.reason,
                        });
                    }
                    warn!(task = err.task, "{}", err.reason);
                }
                SupervisorEvent::Shutdown(reason) => {
                    info!(%reason, "shutting down");
                    return Ok(());
                }
            }
        }
    }

    async fn shutdown(&mut self) {
        if *self.state.borrow() == LifecycleState::Stopped {
            return;
        }
        self.set_state(LifecycleState::ShuttingDown);
        self.cancel.cancel();

        let tasks = self.tasks.join_all(self.config.shutdown_grace()).await;
        debug!(?tasks, "background tasks finished");

        let cleanup = self.cleanup.run_all();
        self.metrics
            .cleanup_failures
            .inc_by(cleanup.failed.len() as u64);
        info!(
            ran = cleanup.ran,
            failed = cleanup.failed.len(),
            "cleanup actions finished"
        );

        if let Some(node) = self.node.take() {
            if let Err(e) = node.close().await {
                warn!("failed to close network node: {}", e);
            }
        }

        match self.metrics.encode() {
            Ok(encoded) => debug!(metrics = %encoded, "final metrics"),
            Err(e) => debug!("failed to encode metrics: {}", e),
        }
        self.set_state(LifecycleState::Stopped);
        info!("node stopped");
    }

    fn set_state(&self, state: LifecycleState) {
        debug!(%state, "lifecycle state changed");
        self.state.send_replace(state);
    }
}

impl fmt::Debug for Supervisor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Supervisor")
            .field("state", &*self.state.borrow())
            .field("tasks", &self.tasks.len())
            .field("cleanup", &self.cleanup)
            .finish()
    }
}

fn report(inbox: &mpsc::UnboundedSender<SupervisorEvent>, err: TaskError) {
    if inbox.send(SupervisorEvent::Error(err)).is_err() {
        debug!("supervisor inbox closed, error dropped");
    }
}

async fn publish_loop(
    cancel: CancellationToken,
    topic: TopicHandle,
    heartbeat: Message,
    interval: Duration,
    options: PublishOptions,
    inbox: mpsc::UnboundedSender<SupervisorEvent>,
    metrics: Arc<NodeMetrics>,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {}
        }

        match pubsub::publish(&cancel, heartbeat.clone(), &topic, options).await {
            Ok(()) => {
                metrics.messages_published.inc();
            }
            Err(RelayError::Cancelled) => break,
            Err(e) => {
                metrics.publish_failures.inc();
                report(
                    &inbox,
                    TaskError {
                        task: "publish",
                        reason: e.to_string(),
                        fatal: false,
                    },
                );
            }
        };

        if let Ok(peers) = topic.node().peers().await {
            metrics.peer_count.set(peers.len() as i64);
            for peer in &peers {
                debug!(
                    peer_id = %peer.peer_id,
                    address = %peer.address,
                    agent = peer.agent_version.as_deref().unwrap_or("unknown"),
                    connected_secs = peer.connected_at.elapsed().as_secs(),
                    "connected peer"
                );
            }
        }
    }
    debug!("publish loop stopped");
}

async fn receive_loop(
    cancel: CancellationToken,
    mut subscription: Subscription,
    inbox: mpsc::UnboundedSender<SupervisorEvent>,
) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            next = subscription.next() => match next {
                Some(message) => {
                    if inbox.send(SupervisorEvent::Message(message)).is_err() {
                        break;
                    }
                }
                None => {
                    report(
                        &inbox,
                        TaskError {
                            task: "receive",
                            reason: format!(
                                "subscription to '{}' ended unexpectedly",
                                subscription.topic()
                            ),
                            fatal: true,
                        },
                    );
                    break;
                }
            },
        }
    }
    debug!("receive loop stopped");
}

/// SIGINT and SIGTERM listeners.
///
/// The OS handlers are registered on construction, so a signal that arrives
/// before the first `recv` is kept rather than killing the process.
#[cfg(unix)]
struct TerminationSignals {
    interrupt: Option<tokio::signal::unix::Signal>,
    terminate: Option<tokio::signal::unix::Signal>,
}

#[cfg(unix)]
impl TerminationSignals {
    fn install() -> Self {
        use tokio::signal::unix::{signal, SignalKind};

        let listen = |kind: SignalKind, name: &str| match signal(kind) {
            Ok(stream) => Some(stream),
            Err(e) => {
                warn!("cannot listen for {}: {}", name, e);
                None
            }
        };
        Self {
            interrupt: listen(SignalKind::interrupt(), "SIGINT"),
            terminate: listen(SignalKind::terminate(), "SIGTERM"),
        }
    }

    /// Wait for the next signal. Cancel safe.
    async fn recv(&mut self) -> ShutdownReason {
        tokio::select! {
            _ = next_signal(&mut self.interrupt) => ShutdownReason::Interrupt,
            _ = next_signal(&mut self.terminate) => ShutdownReason::Terminate,
        }
    }
}

#[cfg(unix)]
async fn next_signal(stream: &mut Option<tokio::signal::unix::Signal>) {
    if let Some(stream) = stream {
        if stream.recv().await.is_some() {
            return;
        }
    }
    std::future::pending::<()>().await
}

#[cfg(not(unix))]
struct TerminationSignals;

#[cfg(not(unix))]
impl TerminationSignals {
    fn install() -> Self {
        TerminationSignals
    }

    async fn recv(&mut self) -> ShutdownReason {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("cannot listen for ctrl-c: {}", e);
            std::future::pending::<()>().await;
        }
        ShutdownReason::Interrupt
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_task_error_display() {
        let err = TaskError {
            task: "publish",
            reason: "no peers".to_string(),
            fatal: false,
        };
        assert_eq!(err.to_string(), "publish: no peers");
    }

    #[test]
    fn test_state_display() {
        assert_eq!(LifecycleState::ShuttingDown.to_string(), "shutting down");
        assert_eq!(ShutdownReason::Terminate.to_string(), "SIGTERM");
    }

    #[test]
    fn test_new_supervisor_is_starting() {
        let (supervisor, _outputs) = Supervisor::new(NodeConfig::default());
        assert_eq!(*supervisor.state().borrow(), LifecycleState::Starting);
        assert!(supervisor.register_cleanup("noop", || Ok(())));
        assert_eq!(supervisor.cleanup_registry().len(), 1);
    }

    #[tokio::test]
    async fn test_fatal_error_stops_control_loop() {
        let (mut supervisor, mut outputs) = Supervisor::new(NodeConfig::default());
        report(
            &supervisor.inbox_tx,
            TaskError {
                task: "receive",
                reason: "gone".to_string(),
                fatal: true,
            },
        );
        let result = supervisor
            .control_loop(&mut TerminationSignals::install())
            .await;
        assert!(matches!(result, Err(NodeError::Fatal { .. })));
        assert!(outputs.errors.recv().await.unwrap().fatal);
    }

    #[tokio::test]
    async fn test_non_fatal_error_is_forwarded() {
        let (mut supervisor, mut outputs) = Supervisor::new(NodeConfig::default());
        report(
            &supervisor.inbox_tx,
            TaskError {
                task: "publish",
                reason: "no peers".to_string(),
                fatal: false,
            },
        );
        supervisor.shutdown_handle().request_shutdown();
        assert!(supervisor
            .control_loop(&mut TerminationSignals::install())
            .await
            .is_ok());
        let forwarded = outputs.errors.recv().await.unwrap();
        assert_eq!(forwarded.task, "publish");
        assert!(!forwarded.fatal);
    }

    #[tokio::test]
    async fn test_messages_forwarded_to_outputs() {
        let (mut supervisor, mut outputs) = Supervisor::new(NodeConfig::default());
        let msg = Message::new("peer", "from localhost", "hello world");
        supervisor
            .inbox_tx
            .send(SupervisorEvent::Message(msg.clone()))
            .unwrap();
        supervisor.shutdown_handle().request_shutdown();
        supervisor
            .control_loop(&mut TerminationSignals::install())
            .await
            .unwrap();
        assert_eq!(outputs.messages.recv().await.unwrap(), msg);
        assert_eq!(supervisor.metrics().messages_received.get(), 1);
    }

    #[tokio::test]
    async fn test_shutdown_without_start_reaches_stopped() {
        let (mut supervisor, _outputs) = Supervisor::new(NodeConfig::default());
        let state = supervisor.state();
        supervisor.shutdown().await;
        assert_eq!(*state.borrow(), LifecycleState::Stopped);
        assert!(supervisor.cancellation_token().is_cancelled());
        // A second request is a no-op.
        supervisor.shutdown().await;
        assert_eq!(*state.borrow(), LifecycleState::Stopped);
    }
}

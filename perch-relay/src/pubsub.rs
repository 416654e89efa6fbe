//! Topic-scoped publish/subscribe over the node's gossipsub behaviour.
//!
//! A node holds at most one live [`Subscription`] per topic. Whether a node
//! sees its own publishes is an explicit per-topic [`SelfDelivery`] policy;
//! the default delivers them, so a lone node observes its own traffic.

use std::pin::Pin;
use std::task::{Context, Poll};

use futures::Stream;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::error::RelayError;
use crate::message::Message;
use crate::node::{Command, NodeHandle};

/// Whether a node's own publishes are delivered to its own subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SelfDelivery {
    /// Own messages loop back to the local subscription.
    #[default]
    Deliver,
    /// Own messages are only sent to remote peers.
    Suppress,
}

/// Options applied when joining a topic.
#[derive(Debug, Clone, Copy, Default)]
pub struct JoinOptions {
    pub self_delivery: SelfDelivery,
}

/// Options applied to a single publish.
#[derive(Debug, Clone, Copy, Default)]
pub struct PublishOptions {
    /// Fail the publish when no remote peer is subscribed to the topic.
    pub require_peers: bool,
}

/// Handle used to publish onto a joined topic.
#[derive(Debug, Clone)]
pub struct TopicHandle {
    name: String,
    node: NodeHandle,
}

impl TopicHandle {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn node(&self) -> &NodeHandle {
        &self.node
    }
}

/// Incoming messages for one topic.
///
/// Yields messages until it is cancelled, dropped, or the node closes, at
/// which point the stream ends. Re-join the topic to resume.
#[derive(Debug)]
pub struct Subscription {
    topic: String,
    messages: mpsc::UnboundedReceiver<Message>,
    node: NodeHandle,
}

impl Subscription {
    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Leave the topic. Equivalent to dropping the subscription.
    pub fn cancel(self) {
        drop(self);
    }
}

impl Stream for Subscription {
    type Item = Message;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Message>> {
        self.get_mut().messages.poll_recv(cx)
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        // Close first so the driver sees this entry as stale.
        self.messages.close();
        self.node.notify(Command::Unsubscribe {
            topic: std::mem::take(&mut self.topic),
        });
    }
}

/// Join `topic` with the default options.
pub async fn join(
    node: &NodeHandle,
    topic: &str,
) -> Result<(Subscription, TopicHandle), RelayError> {
    join_with(node, topic, JoinOptions::default()).await
}

/// Join `topic`, returning the incoming message stream and a publish handle.
pub async fn join_with(
    node: &NodeHandle,
    topic: &str,
    options: JoinOptions,
) -> Result<(Subscription, TopicHandle), RelayError> {
    if topic.is_empty() {
        return Err(RelayError::TopicJoin {
            topic: String::new(),
            reason: "topic name must not be empty".to_string(),
        });
    }

    let (sink, messages) = mpsc::unbounded_channel();
    node.request(|reply| Command::Subscribe {
        topic: topic.to_string(),
        sink,
        self_delivery: options.self_delivery,
        reply,
    })
    .await
    .map_err(|e| RelayError::TopicJoin {
        topic: topic.to_string(),
        reason: e.to_string(),
    })??;

    let subscription = Subscription {
        topic: topic.to_string(),
        messages,
        node: node.clone(),
    };
    let handle = TopicHandle {
        name: topic.to_string(),
        node: node.clone(),
    };
    Ok((subscription, handle))
}

/// Publish `message` onto `topic`.
pub async fn publish(
    cancel: &CancellationToken,
    message: Message,
    topic: &TopicHandle,
    options: PublishOptions,
) -> Result<(), RelayError> {
    if cancel.is_cancelled() {
        return Err(RelayError::Cancelled);
    }

    let request = topic.node.request(|reply| Command::Publish {
        topic: topic.name.clone(),
        message,
        options,
        reply,
    });

    tokio::select! {
        _ = cancel.cancelled() => Err(RelayError::Cancelled),
        result = request => result
            .map_err(|e| RelayError::Publish {
                topic: topic.name.clone(),
                reason: e.to_string(),
            })?,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::NetworkNode;
    use crate::options::{MuxerKind, NetworkOptions, SecurityKind, TransportKind};
    use futures::StreamExt;
    use tokio::time::{sleep, timeout, Duration};

    async fn start_node() -> NodeHandle {
        let options = NetworkOptions::builder()
            .transport(TransportKind::Tcp)
            .security(SecurityKind::Noise)
            .muxer(MuxerKind::Yamux)
            .listen_addr("/ip4/127.0.0.1/tcp/0")
            .build()
            .unwrap();
        NetworkNode::start(options, CancellationToken::new())
            .await
            .unwrap()
    }

    fn heartbeat(node: &NodeHandle) -> Message {
        Message::new(node.identity().to_string(), "from localhost", "hello world")
    }

    #[tokio::test]
    async fn test_own_message_delivered_by_default() {
        let node = start_node().await;
        let (mut sub, topic) = join(&node, "perch-default").await.unwrap();
        let sent = heartbeat(&node);

        publish(
            &CancellationToken::new(),
            sent.clone(),
            &topic,
            PublishOptions::default(),
        )
        .await
        .unwrap();

        let received = timeout(Duration::from_secs(5), sub.next())
            .await
            .expect("message not delivered")
            .expect("subscription ended");
        assert_eq!(received, sent);
        node.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_own_message_suppressed() {
        let node = start_node().await;
        let options = JoinOptions {
            self_delivery: SelfDelivery::Suppress,
        };
        let (mut sub, topic) = join_with(&node, "perch-default", options).await.unwrap();

        publish(
            &CancellationToken::new(),
            heartbeat(&node),
            &topic,
            PublishOptions::default(),
        )
        .await
        .unwrap();

        let received = timeout(Duration::from_millis(300), sub.next()).await;
        assert!(received.is_err(), "own message should not loop back");
        node.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_publish_order_preserved() {
        let node = start_node().await;
        let (mut sub, topic) = join(&node, "ordered").await.unwrap();
        let cancel = CancellationToken::new();

        for i in 0..10 {
            let msg = Message::new(node.identity().to_string(), "from localhost", i.to_string());
            publish(&cancel, msg, &topic, PublishOptions::default())
                .await
                .unwrap();
        }
        for i in 0..10 {
            let msg = sub.next().await.unwrap();
            assert_eq!(msg.body, i.to_string());
        }
        node.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_require_peers_without_peers_fails() {
        let node = start_node().await;
        let (_sub, topic) = join(&node, "lonely").await.unwrap();
        let result = publish(
            &CancellationToken::new(),
            heartbeat(&node),
            &topic,
            PublishOptions {
                require_peers: true,
            },
        )
        .await;
        assert!(matches!(result, Err(RelayError::Publish { .. })));
        node.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_duplicate_join_rejected() {
        let node = start_node().await;
        let (_sub, _topic) = join(&node, "perch-default").await.unwrap();
        let second = join(&node, "perch-default").await;
        assert!(matches!(second, Err(RelayError::TopicJoin { .. })));
        node.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_rejoin_after_cancel() {
        let node = start_node().await;
        let (sub, _topic) = join(&node, "perch-default").await.unwrap();
        sub.cancel();
        let (mut sub, topic) = join(&node, "perch-default").await.unwrap();
        publish(
            &CancellationToken::new(),
            heartbeat(&node),
            &topic,
            PublishOptions::default(),
        )
        .await
        .unwrap();
        let received = timeout(Duration::from_secs(5), sub.next()).await.unwrap();
        assert!(received.is_some());
        node.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_empty_topic_rejected() {
        let node = start_node().await;
        let result = join(&node, "").await;
        assert!(matches!(result, Err(RelayError::TopicJoin { .. })));
        node.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_join_on_closed_node() {
        let node = start_node().await;
        node.close().await.unwrap();
        let result = join(&node, "perch-default").await;
        assert!(matches!(result, Err(RelayError::TopicJoin { .. })));
    }

    #[tokio::test]
    async fn test_subscription_ends_when_node_closes() {
        let node = start_node().await;
        let (mut sub, _topic) = join(&node, "perch-default").await.unwrap();
        node.close().await.unwrap();
        let next = timeout(Duration::from_secs(5), sub.next()).await.unwrap();
        assert!(next.is_none());
    }

    #[tokio::test]
    async fn test_publish_cancelled() {
        let node = start_node().await;
        let (_sub, topic) = join(&node, "perch-default").await.unwrap();
        let cancel = CancellationToken::new();
        cancel.cancel();
        let result = publish(&cancel, heartbeat(&node), &topic, PublishOptions::default()).await;
        assert!(matches!(result, Err(RelayError::Cancelled)));
        node.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_publish_on_closed_node() {
        let node = start_node().await;
        let (_sub, topic) = join(&node, "perch-default").await.unwrap();
        node.close().await.unwrap();
        let result = publish(
            &CancellationToken::new(),
            heartbeat(&node),
            &topic,
            PublishOptions::default(),
        )
        .await;
        assert!(matches!(result, Err(RelayError::Publish { .. })));
    }

    #[tokio::test]
    async fn test_message_crosses_between_nodes() {
        let node_a = start_node().await;
        let node_b = start_node().await;
        let (_sub_a, topic_a) = join(&node_a, "perch-default").await.unwrap();
        let (mut sub_b, _topic_b) = join(&node_b, "perch-default").await.unwrap();
        node_b.dial(node_a.addresses()[0].clone()).await.unwrap();

        let sent = heartbeat(&node_a);
        let cancel = CancellationToken::new();
        let received = timeout(Duration::from_secs(20), async {
            loop {
                publish(&cancel, sent.clone(), &topic_a, PublishOptions::default())
                    .await
                    .unwrap();
                tokio::select! {
                    msg = sub_b.next() => return msg,
                    _ = sleep(Duration::from_millis(250)) => {}
                }
            }
        })
        .await
        .expect("message not relayed within timeout")
        .expect("subscription ended");

        assert_eq!(received.sender_peer_id, node_a.identity().to_string());
        assert_eq!(received.sender_label, "from localhost");
        assert_eq!(received.body, "hello world");

        node_a.close().await.unwrap();
        node_b.close().await.unwrap();
    }
}

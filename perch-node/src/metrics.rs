use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::gauge::Gauge;
use prometheus_client::registry::Registry;

/// Node-wide Prometheus metrics.
pub struct NodeMetrics {
    pub peer_count: Gauge,
    pub messages_published: Counter,
    pub messages_received: Counter,
    pub publish_failures: Counter,
    pub cleanup_failures: Counter,
    pub registry: Registry,
}

impl NodeMetrics {
    /// Create a new metrics registry with all node metrics registered.
    pub fn new() -> Self {
        let mut registry = Registry::default();

        let peer_count = Gauge::default();
        let messages_published = Counter::default();
        let messages_received = Counter::default();
        let publish_failures = Counter::default();
        let cleanup_failures = Counter::default();

        registry.register(
            "perch_peer_count",
            "Number of connected peers",
            peer_count.clone(),
        );
        registry.register(
            "perch_messages_published",
            "Total heartbeat messages published",
            messages_published.clone(),
        );
        registry.register(
            "perch_messages_received",
            "Total messages received on the joined topic",
            messages_received.clone(),
        );
        registry.register(
            "perch_publish_failures",
            "Total failed publish attempts",
            publish_failures.clone(),
        );
        registry.register(
            "perch_cleanup_failures",
            "Cleanup actions that failed or panicked during shutdown",
            cleanup_failures.clone(),
        );

        Self {
            peer_count,
            messages_published,
            messages_received,
            publish_failures,
            cleanup_failures,
            registry,
        }
    }

    /// Encode all metrics in Prometheus text exposition format.
    pub fn encode(&self) -> Result<String, std::fmt::Error> {
        let mut buf = String::new();
        prometheus_client::encoding::text::encode(&mut buf, &self.registry)?;
        Ok(buf)
    }
}

impl Default for NodeMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for NodeMetrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NodeMetrics")
            .field("peer_count", &self.peer_count.get())
            .field("messages_published", &self.messages_published.get())
            .field("messages_received", &self.messages_received.get())
            .field("publish_failures", &self.publish_failures.get())
            .field("cleanup_failures", &self.cleanup_failures.get())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_creation() {
        let metrics = NodeMetrics::new();
        metrics.peer_count.set(5);
        metrics.messages_published.inc();
        metrics.messages_published.inc();

        let encoded = metrics.encode().unwrap();
        assert!(encoded.contains("perch_peer_count"));
        assert!(encoded.contains("perch_messages_published"));
        assert!(encoded.contains("perch_cleanup_failures"));
        assert_eq!(metrics.messages_published.get(), 2);
    }

    #[test]
    fn test_metrics_encode_format() {
        let metrics = NodeMetrics::new();
        metrics.peer_count.set(100);
        let encoded = metrics.encode().unwrap();
        assert!(encoded.contains("perch_peer_count"));
        assert!(encoded.contains("100"));
    }
}

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use crate::config::NodeConfig;
use crate::error::NodeError;
use crate::supervisor::Supervisor;

#[derive(Parser)]
#[command(
    name = "perch",
    about = "Perch P2P node: gossip pub/sub with local peer discovery",
    version
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand)]
pub enum Command {
    /// Run the node
    Run {
        /// Path to config file (built-in defaults when omitted)
        #[arg(short, long)]
        config: Option<String>,
        /// Topic to join and publish on
        #[arg(long)]
        topic: Option<String>,
        /// Listen address template (can be specified multiple times)
        #[arg(long = "listen")]
        listen_addrs: Vec<String>,
        /// Boot node multiaddr to dial at startup (can be specified multiple times)
        #[arg(long = "boot-node")]
        boot_nodes: Vec<String>,
        /// Milliseconds between heartbeat publishes
        #[arg(long)]
        publish_interval_ms: Option<u64>,
        /// Disable mDNS peer discovery
        #[arg(long)]
        no_discovery: bool,
        /// Do not deliver this node's own messages back to itself
        #[arg(long)]
        no_loopback: bool,
        /// Hex-encoded 32-byte seed for a deterministic peer identity
        #[arg(long)]
        keypair_seed: Option<String>,
    },
    /// Initialize a new node configuration
    Init {
        /// Output directory
        #[arg(short, long, default_value = ".")]
        dir: String,
    },
}

/// Install the global tracing subscriber. `RUST_LOG` wins over `default_level`.
pub fn init_tracing(default_level: &str) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
}

pub async fn run(cli: Cli) -> Result<(), NodeError> {
    match cli.command {
        Command::Run {
            config,
            topic,
            listen_addrs,
            boot_nodes,
            publish_interval_ms,
            no_discovery,
            no_loopback,
            keypair_seed,
        } => {
            let loaded = match config {
                Some(path) => NodeConfig::load(&path),
                None => Ok(NodeConfig::default()),
            };
            init_tracing(
                loaded
                    .as_ref()
                    .map(|c| c.logging.level.as_str())
                    .unwrap_or("info"),
            );
            let mut config = loaded?;

            // Apply CLI overrides.
            if let Some(topic) = topic {
                config.pubsub.topic = topic;
            }
            if !listen_addrs.is_empty() {
                config.network.listen_addrs = listen_addrs;
            }
            if !boot_nodes.is_empty() {
                config.network.boot_nodes.extend(boot_nodes);
            }
            if let Some(ms) = publish_interval_ms {
                config.pubsub.publish_interval_ms = ms;
            }
            if no_discovery {
                config.discovery.enabled = false;
            }
            if no_loopback {
                config.pubsub.loopback = false;
            }
            if let Some(seed) = keypair_seed {
                config.network.keypair_seed = Some(seed);
            }

            crate::banner::print_startup(&config);

            let (supervisor, mut outputs) = Supervisor::new(config);
            let consumer = tokio::spawn(async move {
                while let Some(msg) = outputs.messages.recv().await {
                    println!("{}", msg);
                }
            });
            let result = supervisor.run().await;
            // The supervisor dropped its senders, so the consumer drains and exits.
            let _ = consumer.await;
            result
        }
        Command::Init { dir } => {
            init_tracing("info");
            NodeConfig::init(&dir)?;
            tracing::info!("Node configuration initialized in {}", dir);
            Ok(())
        }
    }
}

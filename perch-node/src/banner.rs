use console::Style;

use crate::config::NodeConfig;

const BANNER: &str = r#"
 ██████╗  ███████╗ ██████╗   ██████╗ ██╗  ██╗
 ██╔══██╗ ██╔════╝ ██╔══██╗ ██╔════╝ ██║  ██║
 ██████╔╝ █████╗   ██████╔╝ ██║      ███████║
 ██╔═══╝  ██╔══╝   ██╔══██╗ ██║      ██╔══██║
 ██║      ███████╗ ██║  ██║ ╚██████╗ ██║  ██║
 ╚═╝      ╚══════╝ ╚═╝  ╚═╝  ╚═════╝ ╚═╝  ╚═╝"#;

/// Print the PERCH banner followed by a summary of what this node will run.
pub fn print_startup(config: &NodeConfig) {
    let cyan = Style::new().cyan().bold();
    let dim = Style::new().dim();
    let value = Style::new().cyan();

    println!("{}", cyan.apply_to(BANNER));
    println!(
        "  {}",
        dim.apply_to(format!(
            "v{} · gossip pub/sub over libp2p",
            env!("CARGO_PKG_VERSION")
        ))
    );
    println!();
    for (label, text) in summary(config) {
        println!("  {}  {}", dim.apply_to(format!("{:<8}", label)), value.apply_to(text));
    }
    println!();
}

/// Label/value rows shown under the banner.
fn summary(config: &NodeConfig) -> Vec<(&'static str, String)> {
    let network = &config.network;
    let mut rows = vec![
        (
            "Stack",
            format!(
                "{} · {} · {}",
                network.transports.join("+"),
                network.security,
                network.muxers.join("+")
            ),
        ),
        (
            "Topic",
            format!(
                "{} every {} ms",
                config.pubsub.topic, config.pubsub.publish_interval_ms
            ),
        ),
    ];

    let mut peers = Vec::new();
    if config.discovery.enabled {
        peers.push(format!(
            "mdns every {}s · {}",
            config.discovery.interval_secs, config.discovery.service_tag
        ));
    }
    if !network.boot_nodes.is_empty() {
        peers.push(format!("{} boot node(s)", network.boot_nodes.len()));
    }
    if peers.is_empty() {
        peers.push("none".to_string());
    }
    rows.push(("Peers", peers.join(" · ")));

    if !config.pubsub.loopback {
        rows.push(("Loopback", "off".to_string()));
    }
    rows
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_summary_for_defaults() {
        let rows = summary(&NodeConfig::default());
        assert_eq!(rows[0], ("Stack", "tcp+ws · noise · yamux".to_string()));
        assert_eq!(rows[1], ("Topic", "perch-default every 3000 ms".to_string()));
        assert_eq!(rows[2], ("Peers", "mdns every 5s · perch-mdns".to_string()));
        assert_eq!(rows.len(), 3);
    }

    #[test]
    fn test_summary_isolated_node() {
        let mut config = NodeConfig::default();
        config.discovery.enabled = false;
        config.pubsub.loopback = false;
        let rows = summary(&config);
        assert_eq!(rows[2], ("Peers", "none".to_string()));
        assert_eq!(rows[3], ("Loopback", "off".to_string()));
    }

    #[test]
    fn test_summary_counts_boot_nodes() {
        let mut config = NodeConfig::default();
        config.discovery.enabled = false;
        config.network.boot_nodes = vec![
            "/ip4/10.0.0.2/tcp/4001".to_string(),
            "/ip4/10.0.0.3/tcp/4001".to_string(),
        ];
        let rows = summary(&config);
        assert_eq!(rows[2], ("Peers", "2 boot node(s)".to_string()));
    }
}

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use libp2p::Multiaddr;

use crate::error::RelayError;
use crate::protocol::IDLE_CONNECTION_TIMEOUT;

/// Listen addresses used when the caller supplies none.
pub const DEFAULT_LISTEN_ADDRS: [&str; 2] = ["/ip4/0.0.0.0/tcp/0", "/ip6/::/tcp/0/ws"];

/// A transport the node can dial and listen on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransportKind {
    Tcp,
    WebSocket,
}

/// The security handshake applied to every connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SecurityKind {
    Noise,
    Tls,
    /// Legacy handshake; accepted by the parser but not supported by the transport stack.
    Secio,
}

/// A stream multiplexer offered during connection upgrade.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MuxerKind {
    Yamux,
    /// Legacy multiplexer; accepted by the parser but not supported by the transport stack.
    Mplex,
}

impl FromStr for TransportKind {
    type Err = RelayError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "tcp" => Ok(TransportKind::Tcp),
            "ws" | "websocket" => Ok(TransportKind::WebSocket),
            other => Err(RelayError::Configuration {
                reason: format!("unknown transport '{}', expected 'tcp' or 'ws'", other),
            }),
        }
    }
}

impl FromStr for SecurityKind {
    type Err = RelayError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "noise" => Ok(SecurityKind::Noise),
            "tls" => Ok(SecurityKind::Tls),
            "secio" => Ok(SecurityKind::Secio),
            other => Err(RelayError::Configuration {
                reason: format!(
                    "unknown security mechanism '{}', expected 'noise' or 'tls'",
                    other
                ),
            }),
        }
    }
}

impl FromStr for MuxerKind {
    type Err = RelayError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "yamux" => Ok(MuxerKind::Yamux),
            "mplex" => Ok(MuxerKind::Mplex),
            other => Err(RelayError::Configuration {
                reason: format!("unknown multiplexer '{}', expected 'yamux'", other),
            }),
        }
    }
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportKind::Tcp => f.write_str("tcp"),
            TransportKind::WebSocket => f.write_str("ws"),
        }
    }
}

impl fmt::Display for SecurityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SecurityKind::Noise => f.write_str("noise"),
            SecurityKind::Tls => f.write_str("tls"),
            SecurityKind::Secio => f.write_str("secio"),
        }
    }
}

impl fmt::Display for MuxerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MuxerKind::Yamux => f.write_str("yamux"),
            MuxerKind::Mplex => f.write_str("mplex"),
        }
    }
}

/// The capability set a node is started with.
///
/// Only [`NetworkOptionsBuilder::build`] and [`Default`] produce values, so every
/// instance carries at least one transport, exactly one security mechanism, at
/// least one multiplexer and at least one listen address.
#[derive(Debug, Clone)]
pub struct NetworkOptions {
    transports: Vec<TransportKind>,
    security: SecurityKind,
    muxers: Vec<MuxerKind>,
    listen_addrs: Vec<Multiaddr>,
    keypair_seed: Option<[u8; 32]>,
    idle_connection_timeout: Duration,
}

impl NetworkOptions {
    pub fn builder() -> NetworkOptionsBuilder {
        NetworkOptionsBuilder::default()
    }

    pub fn transports(&self) -> &[TransportKind] {
        &self.transports
    }

    pub fn security(&self) -> SecurityKind {
        self.security
    }

    pub fn muxers(&self) -> &[MuxerKind] {
        &self.muxers
    }

    pub fn listen_addrs(&self) -> &[Multiaddr] {
        &self.listen_addrs
    }

    pub fn keypair_seed(&self) -> Option<[u8; 32]> {
        self.keypair_seed
    }

    pub fn idle_connection_timeout(&self) -> Duration {
        self.idle_connection_timeout
    }
}

impl Default for NetworkOptions {
    fn default() -> Self {
        Self {
            transports: vec![TransportKind::Tcp, TransportKind::WebSocket],
            security: SecurityKind::Noise,
            muxers: vec![MuxerKind::Yamux],
            listen_addrs: DEFAULT_LISTEN_ADDRS
                .iter()
                .filter_map(|s| s.parse().ok())
                .collect(),
            keypair_seed: None,
            idle_connection_timeout: IDLE_CONNECTION_TIMEOUT,
        }
    }
}

/// Assembles [`NetworkOptions`] from caller preferences.
#[derive(Debug, Clone, Default)]
pub struct NetworkOptionsBuilder {
    transports: Vec<TransportKind>,
    security: Vec<SecurityKind>,
    muxers: Vec<MuxerKind>,
    listen_addrs: Vec<String>,
    keypair_seed: Option<[u8; 32]>,
    idle_connection_timeout: Option<Duration>,
}

impl NetworkOptionsBuilder {
    /// Append a transport. Duplicates are ignored; order is preserved.
    pub fn transport(mut self, kind: TransportKind) -> Self {
        if !self.transports.contains(&kind) {
            self.transports.push(kind);
        }
        self
    }

    /// Set the security mechanism. Calling this more than once is a configuration error.
    pub fn security(mut self, kind: SecurityKind) -> Self {
        self.security.push(kind);
        self
    }

    pub fn muxer(mut self, kind: MuxerKind) -> Self {
        if !self.muxers.contains(&kind) {
            self.muxers.push(kind);
        }
        self
    }

    pub fn listen_addr(mut self, addr: impl Into<String>) -> Self {
        self.listen_addrs.push(addr.into());
        self
    }

    pub fn keypair_seed(mut self, seed: [u8; 32]) -> Self {
        self.keypair_seed = Some(seed);
        self
    }

    pub fn idle_connection_timeout(mut self, timeout: Duration) -> Self {
        self.idle_connection_timeout = Some(timeout);
        self
    }

    /// Validate the collected preferences and produce the option set.
    pub fn build(self) -> Result<NetworkOptions, RelayError> {
        if self.transports.is_empty() {
            return Err(RelayError::Configuration {
                reason: "at least one transport is required".to_string(),
            });
        }

        let security = match self.security.as_slice() {
            [one] => *one,
            other => {
                return Err(RelayError::Configuration {
                    reason: format!(
                        "exactly one security mechanism is required, got {}",
                        other.len()
                    ),
                })
            }
        };

        if self.muxers.is_empty() {
            return Err(RelayError::Configuration {
                reason: "at least one stream multiplexer is required".to_string(),
            });
        }

        if self.listen_addrs.is_empty() {
            return Err(RelayError::Configuration {
                reason: "at least one listen address is required".to_string(),
            });
        }

        let listen_addrs = self
            .listen_addrs
            .iter()
            .map(|s| {
                s.parse::<Multiaddr>().map_err(|e| RelayError::Configuration {
                    reason: format!("invalid listen address '{}': {}", s, e),
                })
            })
            .collect::<Result<Vec<_>, _>>()?;

        Ok(NetworkOptions {
            transports: self.transports,
            security,
            muxers: self.muxers,
            listen_addrs,
            keypair_seed: self.keypair_seed,
            idle_connection_timeout: self
                .idle_connection_timeout
                .unwrap_or(IDLE_CONNECTION_TIMEOUT),
        })
    }
}

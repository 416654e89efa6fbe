use std::time::Duration;

use futures::{AsyncRead, AsyncWrite};
use libp2p::core::muxing::StreamMuxerBox;
use libp2p::core::transport::Boxed;
use libp2p::core::upgrade;
use libp2p::identity::Keypair;
use libp2p::{noise, tcp, tls, websocket, yamux, PeerId, Transport};

use crate::error::RelayError;
use crate::options::{MuxerKind, NetworkOptions, SecurityKind, TransportKind};

/// Upper bound on the security and multiplexer handshakes of a new connection.
const UPGRADE_TIMEOUT: Duration = Duration::from_secs(20);

/// Reject capability combinations the transport stack cannot provide.
///
/// Runs before any socket is opened.
pub fn check_supported(options: &NetworkOptions) -> Result<(), RelayError> {
    if options.security() == SecurityKind::Secio {
        return Err(RelayError::Transport {
            reason: "security mechanism 'secio' is not supported, use 'noise' or 'tls'"
                .to_string(),
        });
    }

    let unsupported: Vec<String> = options
        .muxers()
        .iter()
        .filter(|m| **m != MuxerKind::Yamux)
        .map(|m| m.to_string())
        .collect();
    if !unsupported.is_empty() {
        return Err(RelayError::Transport {
            reason: format!(
                "unsupported multiplexer(s) [{}], only 'yamux' is available",
                unsupported.join(", ")
            ),
        });
    }

    Ok(())
}

/// Build the authenticated, multiplexed transport described by `options`.
///
/// Each requested transport is upgraded on its own and the results are tried
/// in order when dialing.
pub fn build_transport(
    keypair: &Keypair,
    options: &NetworkOptions,
) -> Result<Boxed<(PeerId, StreamMuxerBox)>, RelayError> {
    check_supported(options)?;

    let mut combined: Option<Boxed<(PeerId, StreamMuxerBox)>> = None;
    for kind in options.transports() {
        let upgraded = match kind {
            TransportKind::Tcp => secure(base_tcp(), keypair, options.security())?,
            TransportKind::WebSocket => secure(
                websocket::WsConfig::new(base_tcp()),
                keypair,
                options.security(),
            )?,
        };
        combined = Some(match combined {
            None => upgraded,
            Some(previous) => previous
                .or_transport(upgraded)
                .map(|either, _| either.into_inner())
                .boxed(),
        });
    }

    combined.ok_or_else(|| RelayError::Configuration {
        reason: "at least one transport is required".to_string(),
    })
}

fn base_tcp() -> tcp::tokio::Transport {
    tcp::tokio::Transport::new(tcp::Config::default().nodelay(true))
}

fn secure<T>(
    transport: T,
    keypair: &Keypair,
    security: SecurityKind,
) -> Result<Boxed<(PeerId, StreamMuxerBox)>, RelayError>
where
    T: Transport + Send + Unpin + 'static,
    T::Output: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    T::Error: Send + Sync + 'static,
    T::Dial: Send + 'static,
    T::ListenerUpgrade: Send + 'static,
{
    let builder = transport.upgrade(upgrade::Version::V1);
    match security {
        SecurityKind::Noise => {
            let noise = noise::Config::new(keypair).map_err(|e| RelayError::Transport {
                reason: format!("noise: {}", e),
            })?;
            Ok(builder
                .authenticate(noise)
                .multiplex(yamux::Config::default())
                .timeout(UPGRADE_TIMEOUT)
                .boxed())
        }
        SecurityKind::Tls => {
            let tls = tls::Config::new(keypair).map_err(|e| RelayError::Transport {
                reason: format!("tls: {}", e),
            })?;
            Ok(builder
                .authenticate(tls)
                .multiplex(yamux::Config::default())
                .timeout(UPGRADE_TIMEOUT)
                .boxed())
        }
        SecurityKind::Secio => Err(RelayError::Transport {
            reason: "security mechanism 'secio' is not supported".to_string(),
        }),
    }
}

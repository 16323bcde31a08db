// src/server.rs
/* Accept loops: one spawned task per inbound connection, plain or TLS. */

use std::io;
use std::net::SocketAddr;
use std::time::Duration;

use log::{debug, error, info};
use tokio::net::{TcpListener, TcpStream};

use crate::config::TunnelSettings;
use crate::error::ProxyError;
use crate::tunnel::handle_connection;

#[cfg(feature = "tls")]
use tokio_rustls::TlsAcceptor;

/// Pause after running out of file descriptors before accepting again.
const EXHAUSTED_BACKOFF: Duration = Duration::from_millis(100);

pub async fn serve(listener: TcpListener, settings: TunnelSettings) -> io::Result<()> {
    info!("Listening on {}", listener.local_addr()?);
    loop {
        let (client, client_addr) = accept(&listener).await?;
        info!("New connection from {}", client_addr);

        tokio::spawn(async move {
            let peer = client_addr.to_string();
            if let Err(e) = handle_connection(client, &peer, settings).await {
                log_outcome(client_addr, &e);
            }
        });
    }
}

#[cfg(feature = "tls")]
pub async fn serve_tls(
    listener: TcpListener,
    acceptor: TlsAcceptor,
    settings: TunnelSettings,
) -> io::Result<()> {
    info!("Listening on {} (TLS)", listener.local_addr()?);
    loop {
        let (client, client_addr) = accept(&listener).await?;
        info!("New TLS connection from {}", client_addr);

        let acceptor = acceptor.clone();
        tokio::spawn(async move {
            let tls_stream = match acceptor.accept(client).await {
                Ok(stream) => stream,
                Err(e) => {
                    error!("TLS handshake failed for {}: {}", client_addr, e);
                    return;
                }
            };
            let peer = client_addr.to_string();
            if let Err(e) = handle_connection(tls_stream, &peer, settings).await {
                log_outcome(client_addr, &e);
            }
        });
    }
}

/// Waits for the next connection, riding out errors that only concern one peer.
async fn accept(listener: &TcpListener) -> io::Result<(TcpStream, SocketAddr)> {
    loop {
        match listener.accept().await {
            Ok((stream, addr)) => {
                if let Err(e) = stream.set_nodelay(true) {
                    debug!("set_nodelay failed for {}: {}", addr, e);
                }
                return Ok((stream, addr));
            }
            Err(e) if is_per_connection(&e) => {
                error!("Accept failed: {}", e);
            }
            Err(e) if is_exhausted(&e) => {
                error!("Accept failed, out of descriptors: {}", e);
                tokio::time::sleep(EXHAUSTED_BACKOFF).await;
            }
            Err(e) => return Err(e),
        }
    }
}

fn is_per_connection(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::ConnectionAborted
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionRefused
            | io::ErrorKind::Interrupted
            | io::ErrorKind::TimedOut
            | io::ErrorKind::WouldBlock
    )
}

// ENFILE / EMFILE share these values across Linux, macOS and the BSDs.
#[cfg(unix)]
fn is_exhausted(e: &io::Error) -> bool {
    const ENFILE: i32 = 23;
    const EMFILE: i32 = 24;
    matches!(e.raw_os_error(), Some(ENFILE) | Some(EMFILE))
}

#[cfg(not(unix))]
fn is_exhausted(_e: &io::Error) -> bool {
    false
}

/// A peer dropping mid-tunnel ends that tunnel, nothing more.
fn is_peer_gone(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::BrokenPipe
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::UnexpectedEof
    )
}

fn log_outcome(client_addr: SocketAddr, e: &ProxyError) {
    match e {
        ProxyError::Incomplete => debug!("{} left before sending a request", client_addr),
        ProxyError::Idle(limit) => info!("Tunnel for {} idle for {:?}, closed", client_addr, limit),
        ProxyError::Io(io) if is_peer_gone(io) => {
            info!("Tunnel for {} ended by peer: {}", client_addr, io)
        }
        _ => error!("Connection error for {}: {}", client_addr, e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_accept_errors() {
        assert!(is_per_connection(&io::ErrorKind::ConnectionAborted.into()));
        let fatal = io::Error::from(io::ErrorKind::PermissionDenied);
        assert!(!is_per_connection(&fatal) && !is_exhausted(&fatal));
    }

    #[cfg(unix)]
    #[test]
    fn descriptor_exhaustion_is_transient() {
        assert!(is_exhausted(&io::Error::from_raw_os_error(23)));
        assert!(is_exhausted(&io::Error::from_raw_os_error(24)));
        assert!(!is_exhausted(&io::Error::from_raw_os_error(13)));
    }

    #[test]
    fn peer_resets_are_not_server_errors() {
        assert!(is_peer_gone(&io::ErrorKind::ConnectionReset.into()));
        assert!(is_peer_gone(&io::ErrorKind::BrokenPipe.into()));
        assert!(!is_peer_gone(&io::ErrorKind::PermissionDenied.into()));
    }
}

// src/tunnel.rs
/* Turns one accepted connection into a CONNECT tunnel: parse the head, dial the target, acknowledge, relay. */

use std::future::Future;
use std::io;
use std::time::Duration;

use log::{debug, info, warn};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;

use crate::authority::Authority;
use crate::config::TunnelSettings;
use crate::error::{ProxyError, Result};
use crate::relay::{relay, RelayStats};
use crate::request::Request;

/// Sent once the target accepted the outbound connection.
pub const ESTABLISHED: &[u8] = b"HTTP/1.1 200 Connection Established\r\n\r\n";

/// Drives a single inbound connection from request head to tunnel teardown.
///
/// `peer` only labels log lines. On a failure that has a status (bad request,
/// dial failure) the status line is written before the connection is closed.
pub async fn handle_connection<C>(
    client: C,
    peer: &str,
    settings: TunnelSettings,
) -> Result<RelayStats>
where
    C: AsyncRead + AsyncWrite + Unpin,
{
    establish(client, peer, settings, connect).await
}

/// `handle_connection` with the outbound TCP connect supplied by the caller.
async fn establish<C, F, Fut>(
    mut client: C,
    peer: &str,
    settings: TunnelSettings,
    connect: F,
) -> Result<RelayStats>
where
    C: AsyncRead + AsyncWrite + Unpin,
    F: FnOnce(Authority) -> Fut,
    Fut: Future<Output = io::Result<TcpStream>>,
{
    let (authority, early) = match accept_request(&mut client).await {
        Ok(parsed) => parsed,
        Err(e) => return Err(reject(&mut client, peer, e).await),
    };
    debug!("{} asked for a tunnel to {}", peer, authority);

    let pending = connect(authority.clone());
    let mut target = match dial_with(&authority, settings.dial_timeout, pending).await {
        Ok(target) => target,
        Err(e) => return Err(reject(&mut client, peer, e).await),
    };

    client.write_all(ESTABLISHED).await?;
    client.flush().await?;
    info!("Tunnel {} <-> {} established", peer, authority);

    if !early.is_empty() {
        debug!("forwarding {} bytes sent ahead of the handshake", early.len());
        target.write_all(&early).await?;
    }

    let stats = relay(client, target, settings.buffer_size, settings.idle_timeout).await?;
    info!(
        "Tunnel {} <-> {} closed: {} bytes up, {} bytes down",
        peer, authority, stats.client_to_target, stats.target_to_client
    );
    Ok(stats)
}

/// Reads the head and resolves it to a tunnel target.
async fn accept_request<C>(client: &mut C) -> Result<(Authority, Vec<u8>)>
where
    C: AsyncRead + Unpin,
{
    let (request, early) = Request::read(client).await?;
    let authority = request.authority()?;
    if let Some(host) = request.header("host") {
        if host != request.target {
            debug!("Host header {:?} differs from target {:?}", host, request.target);
        }
    }
    Ok((authority, early))
}

async fn connect(authority: Authority) -> io::Result<TcpStream> {
    TcpStream::connect((authority.host.as_str(), authority.port)).await
}

/// Opens the outbound half of the tunnel, bounded by `timeout`.
pub async fn dial(authority: &Authority, timeout: Duration) -> Result<TcpStream> {
    dial_with(authority, timeout, connect(authority.clone())).await
}

async fn dial_with<F>(authority: &Authority, timeout: Duration, connect: F) -> Result<TcpStream>
where
    F: Future<Output = io::Result<TcpStream>>,
{
    debug!("Attempting to connect to target {}", authority);
    let stream = match tokio::time::timeout(timeout, connect).await {
        Ok(Ok(stream)) => stream,
        Ok(Err(source)) => {
            return Err(ProxyError::Dial {
                authority: authority.to_string(),
                source,
            })
        }
        Err(_) => {
            return Err(ProxyError::DialTimeout {
                authority: authority.to_string(),
                timeout,
            })
        }
    };
    stream.set_nodelay(true)?;
    info!("Connected to target {}", authority);
    Ok(stream)
}

/// Answers a failed request with its status line, if it has one, and hands the error back.
async fn reject<C>(client: &mut C, peer: &str, error: ProxyError) -> ProxyError
where
    C: AsyncWrite + Unpin,
{
    let Some((code, reason)) = error.status() else {
        return error;
    };
    warn!("Rejecting {} with {}: {}", peer, code, error);

    let mut response = format!("HTTP/1.1 {code} {reason}\r\n");
    if matches!(error, ProxyError::MethodNotAllowed(_)) {
        response.push_str("Allow: CONNECT\r\n");
    }
    response.push_str("Connection: close\r\n\r\n");

    let written = async {
        client.write_all(response.as_bytes()).await?;
        client.shutdown().await
    };
    if let Err(e) = written.await {
        debug!("could not deliver {} to {}: {}", code, peer, e);
    }
    error
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{duplex, AsyncReadExt};
    use tokio::net::TcpListener;

    async fn respond_to(request: &[u8]) -> (Result<RelayStats>, String) {
        let (proxy_side, mut client) = duplex(1024);
        let task = tokio::spawn(async move {
            handle_connection(proxy_side, "test", TunnelSettings::default()).await
        });
        client.write_all(request).await.unwrap();
        let mut response = String::new();
        client.read_to_string(&mut response).await.unwrap();
        (task.await.unwrap(), response)
    }

    #[tokio::test]
    async fn malformed_target_gets_400() {
        let (result, response) =
            respond_to(b"CONNECT example.com:80/x HTTP/1.1\r\nHost: example.com\r\n\r\n").await;
        assert!(matches!(result, Err(ProxyError::BadRequest(_))));
        assert!(response.starts_with("HTTP/1.1 400 Bad Request\r\n"));
    }

    #[tokio::test]
    async fn plain_get_gets_405() {
        let (result, response) = respond_to(b"GET / HTTP/1.1\r\nHost: example.com\r\n\r\n").await;
        assert!(matches!(result, Err(ProxyError::MethodNotAllowed(_))));
        assert!(response.starts_with("HTTP/1.1 405 Method Not Allowed\r\n"));
        assert!(response.contains("Allow: CONNECT\r\n"));
    }

    #[tokio::test(start_paused = true)]
    async fn stalled_dial_gets_504() {
        let (proxy_side, mut client) = duplex(1024);
        let settings = TunnelSettings {
            dial_timeout: Duration::from_secs(3),
            ..TunnelSettings::default()
        };
        let task = tokio::spawn(async move {
            establish(proxy_side, "test", settings, |_| {
                std::future::pending::<io::Result<TcpStream>>()
            })
            .await
        });

        client
            .write_all(b"CONNECT example.com:80 HTTP/1.1\r\nHost: example.com:80\r\n\r\n")
            .await
            .unwrap();
        let mut response = String::new();
        client.read_to_string(&mut response).await.unwrap();

        assert!(response.starts_with("HTTP/1.1 504 Gateway Timeout\r\n"));
        assert!(matches!(
            task.await.unwrap(),
            Err(ProxyError::DialTimeout { timeout, .. }) if timeout == Duration::from_secs(3)
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn dial_gives_up_after_timeout() {
        let authority: Authority = "example.com:80".parse().unwrap();
        let started = tokio::time::Instant::now();
        let result = dial_with(
            &authority,
            Duration::from_secs(2),
            std::future::pending::<io::Result<TcpStream>>(),
        )
        .await;
        assert!(matches!(result, Err(ProxyError::DialTimeout { .. })));
        assert!(started.elapsed() >= Duration::from_secs(2));
    }

    #[tokio::test]
    async fn refused_dial_gets_502() {
        let closed = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = closed.local_addr().unwrap();
        drop(closed);

        let request = format!("CONNECT {addr} HTTP/1.1\r\nHost: {addr}\r\n\r\n");
        let (result, response) = respond_to(request.as_bytes()).await;
        assert!(matches!(result, Err(ProxyError::Dial { .. })));
        assert!(response.starts_with("HTTP/1.1 502 Bad Gateway\r\n"));
    }
}

// src/relay.rs
/* Full-duplex byte pipe between the two halves of a tunnel. */

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use log::debug;
use tokio::io::{self, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::time::Instant;

use crate::error::{ProxyError, Result};

/// Bytes moved in each direction over the life of a tunnel.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RelayStats {
    pub client_to_target: u64,
    pub target_to_client: u64,
}

/// Last time either direction moved a byte.
struct Activity {
    started: Instant,
    last_ms: AtomicU64,
}

impl Activity {
    fn new() -> Self {
        Activity {
            started: Instant::now(),
            last_ms: AtomicU64::new(0),
        }
    }

    fn touch(&self) {
        let now = self.started.elapsed().as_millis() as u64;
        self.last_ms.store(now, Ordering::Relaxed);
    }

    fn idle_for(&self) -> Duration {
        let last = Duration::from_millis(self.last_ms.load(Ordering::Relaxed));
        self.started.elapsed().saturating_sub(last)
    }

    /// Resolves once nothing has moved for `limit`.
    async fn expired(&self, limit: Duration) {
        loop {
            let idle = self.idle_for();
            if idle >= limit {
                return;
            }
            tokio::time::sleep(limit - idle).await;
        }
    }
}

/// Relays bytes between `client` and `target` until both directions finish.
///
/// EOF on one side half-closes the opposite writer. An error in either
/// direction returns immediately; both streams are dropped with the futures,
/// which closes them. A zero `idle_timeout` means no idle limit.
pub async fn relay<C, T>(
    client: C,
    target: T,
    buffer_size: usize,
    idle_timeout: Option<Duration>,
) -> Result<RelayStats>
where
    C: AsyncRead + AsyncWrite + Unpin,
    T: AsyncRead + AsyncWrite + Unpin,
{
    let (client_reader, client_writer) = io::split(client);
    let (target_reader, target_writer) = io::split(target);
    let activity = Activity::new();

    let client_to_target = async {
        let result = pipe(client_reader, target_writer, buffer_size, &activity).await;
        debug!("client to target done: {:?}", result);
        result
    };
    let target_to_client = async {
        let result = pipe(target_reader, client_writer, buffer_size, &activity).await;
        debug!("target to client done: {:?}", result);
        result
    };
    let both = async { tokio::try_join!(client_to_target, target_to_client) };

    let (up, down) = match idle_timeout.filter(|limit| !limit.is_zero()) {
        None => both.await?,
        Some(limit) => tokio::select! {
            result = both => result?,
            _ = activity.expired(limit) => return Err(ProxyError::Idle(limit)),
        },
    };

    Ok(RelayStats {
        client_to_target: up,
        target_to_client: down,
    })
}

/// One direction of the tunnel: copy chunks until EOF, then half-close.
async fn pipe<R, W>(
    mut reader: R,
    mut writer: W,
    buffer_size: usize,
    activity: &Activity,
) -> io::Result<u64>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; buffer_size.max(1)];
    let mut total = 0u64;
    loop {
        let n = reader.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        writer.write_all(&buf[..n]).await?;
        writer.flush().await?;
        total += n as u64;
        activity.touch();
    }
    shutdown(&mut writer).await?;
    Ok(total)
}

/// Half-close; a peer that is already gone is not an error.
async fn shutdown<W: AsyncWrite + Unpin>(writer: &mut W) -> io::Result<()> {
    match writer.shutdown().await {
        Ok(()) => Ok(()),
        Err(e)
            if matches!(
                e.kind(),
                io::ErrorKind::NotConnected
                    | io::ErrorKind::BrokenPipe
                    | io::ErrorKind::ConnectionReset
            ) =>
        {
            debug!("shutdown on closed peer: {}", e);
            Ok(())
        }
        Err(e) => Err(e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::duplex;
    use tokio::time::timeout;

    #[tokio::test]
    async fn relays_both_ways_and_propagates_eof() {
        let (client, mut client_peer) = duplex(64);
        let (target, mut target_peer) = duplex(64);
        let tunnel = tokio::spawn(relay(client, target, 16, None));

        client_peer.write_all(b"ping over a small buffer").await.unwrap();
        let mut buf = [0u8; 24];
        target_peer.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping over a small buffer");

        target_peer.write_all(b"pong").await.unwrap();
        let mut buf = [0u8; 4];
        client_peer.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"pong");

        client_peer.shutdown().await.unwrap();
        let mut rest = Vec::new();
        target_peer.read_to_end(&mut rest).await.unwrap();
        assert!(rest.is_empty());

        drop(target_peer);
        let stats = timeout(Duration::from_secs(5), tunnel)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(
            stats,
            RelayStats {
                client_to_target: 24,
                target_to_client: 4,
            }
        );
    }

    #[tokio::test]
    async fn idle_tunnel_is_torn_down() {
        let (client, _client_peer) = duplex(64);
        let (target, _target_peer) = duplex(64);
        let result = timeout(
            Duration::from_secs(5),
            relay(client, target, 16, Some(Duration::from_millis(50))),
        )
        .await
        .unwrap();
        assert!(matches!(result, Err(ProxyError::Idle(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn flowing_tunnel_outlives_idle_limit() {
        let (client, mut client_peer) = duplex(64);
        let (target, mut target_peer) = duplex(64);
        let limit = Duration::from_secs(10);
        let tunnel = tokio::spawn(relay(client, target, 16, Some(limit)));

        // 30s of traffic, never 10s apart.
        for _ in 0..5 {
            tokio::time::sleep(Duration::from_secs(6)).await;
            client_peer.write_all(b"x").await.unwrap();
            let mut buf = [0u8; 1];
            target_peer.read_exact(&mut buf).await.unwrap();
            assert_eq!(&buf, b"x");
        }
        assert!(!tunnel.is_finished());

        tokio::time::sleep(limit + Duration::from_secs(1)).await;
        let result = tunnel.await.unwrap();
        assert!(matches!(result, Err(ProxyError::Idle(l)) if l == limit));
    }

    #[tokio::test]
    async fn zero_idle_limit_is_off() {
        let (client, mut client_peer) = duplex(64);
        let (target, mut target_peer) = duplex(64);
        let tunnel = tokio::spawn(relay(client, target, 16, Some(Duration::ZERO)));

        tokio::time::sleep(Duration::from_millis(50)).await;
        client_peer.write_all(b"x").await.unwrap();
        let mut buf = [0u8; 1];
        timeout(Duration::from_secs(5), target_peer.read_exact(&mut buf))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(&buf, b"x");

        client_peer.shutdown().await.unwrap();
        drop(target_peer);
        let stats = timeout(Duration::from_secs(5), tunnel)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(stats.client_to_target, 1);
    }
}

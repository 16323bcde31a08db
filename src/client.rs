// src/client.rs
/* Consumer side of the handshake: ask a proxy for a tunnel and wait for its answer. */

use log::debug;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::authority::Authority;
use crate::error::{ProxyError, Result};
use crate::request::MAX_HEAD_BYTES;

/// An established tunnel as seen by the client.
#[derive(Debug)]
pub struct Tunnel<S> {
    pub stream: S,
    /// Tunneled bytes that arrived in the same reads as the proxy's response head.
    pub early: Vec<u8>,
}

/// Sends `CONNECT` for `target` over `stream` and waits for a `200`.
pub async fn open_tunnel<S>(mut stream: S, target: &Authority) -> Result<Tunnel<S>>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    stream.write_all(target.connect_request().as_bytes()).await?;
    stream.flush().await?;

    let mut buf = Vec::with_capacity(256);
    let mut chunk = [0u8; 512];
    loop {
        let n = stream.read(&mut chunk).await?;
        if n == 0 {
            return Err(ProxyError::Incomplete);
        }
        buf.extend_from_slice(&chunk[..n]);

        if let Some((len, status, reason)) = parse_status(&buf)? {
            debug!("proxy answered {} {}", status, reason);
            if status != 200 {
                return Err(ProxyError::Refused { status, reason });
            }
            let early = buf.split_off(len);
            return Ok(Tunnel { stream, early });
        }
        if buf.len() >= MAX_HEAD_BYTES {
            return Err(ProxyError::HeadTooLarge(MAX_HEAD_BYTES));
        }
    }
}

fn parse_status(buf: &[u8]) -> Result<Option<(usize, u16, String)>> {
    let mut headers = [httparse::EMPTY_HEADER; 32];
    let mut res = httparse::Response::new(&mut headers);
    match res.parse(buf) {
        Ok(httparse::Status::Partial) => Ok(None),
        Ok(httparse::Status::Complete(len)) => {
            let status = res
                .code
                .ok_or_else(|| ProxyError::BadRequest("missing status code".into()))?;
            let reason = res.reason.unwrap_or_default().to_string();
            Ok(Some((len, status, reason)))
        }
        Err(e) => Err(ProxyError::BadRequest(format!("unparseable proxy response: {e}"))),
    }
}

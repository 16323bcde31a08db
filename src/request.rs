// src/request.rs
/* Reads the request line and header block off a freshly accepted connection. */

use log::debug;
use tokio::io::{AsyncRead, AsyncReadExt};

use crate::authority::Authority;
use crate::error::{ProxyError, Result};

/// Upper bound on the request line plus headers.
pub const MAX_HEAD_BYTES: usize = 8 * 1024;
const MAX_HEADERS: usize = 64;
const READ_CHUNK: usize = 1024;

/// A parsed request head.
#[derive(Debug, Clone)]
pub struct Request {
    pub method: String,
    pub target: String,
    pub headers: Vec<(String, String)>,
}

impl Request {
    /// Reads until the blank line ending the header block and parses it.
    ///
    /// Returns the request and whatever the peer sent after the head.
    pub async fn read<R: AsyncRead + Unpin>(reader: &mut R) -> Result<(Request, Vec<u8>)> {
        let mut buf = Vec::with_capacity(READ_CHUNK);
        let mut chunk = [0u8; READ_CHUNK];
        loop {
            let n = reader.read(&mut chunk).await?;
            if n == 0 {
                debug!("peer closed after {} bytes of request head", buf.len());
                return Err(ProxyError::Incomplete);
            }
            buf.extend_from_slice(&chunk[..n]);

            if let Some((len, request)) = Request::parse(&buf)? {
                let rest = buf.split_off(len);
                return Ok((request, rest));
            }
            if buf.len() >= MAX_HEAD_BYTES {
                return Err(ProxyError::HeadTooLarge(MAX_HEAD_BYTES));
            }
        }
    }

    /// Parses a head from `buf`, returning `None` while it is incomplete.
    pub fn parse(buf: &[u8]) -> Result<Option<(usize, Request)>> {
        let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
        let mut req = httparse::Request::new(&mut headers);
        let len = match req.parse(buf) {
            Ok(httparse::Status::Partial) => return Ok(None),
            Ok(httparse::Status::Complete(len)) => len,
            Err(httparse::Error::TooManyHeaders) => {
                return Err(ProxyError::HeadTooLarge(MAX_HEAD_BYTES))
            }
            Err(e) => return Err(ProxyError::BadRequest(e.to_string())),
        };
        if len > MAX_HEAD_BYTES {
            return Err(ProxyError::HeadTooLarge(MAX_HEAD_BYTES));
        }

        let method = req
            .method
            .ok_or_else(|| ProxyError::BadRequest("missing method".into()))?;
        let target = req
            .path
            .ok_or_else(|| ProxyError::BadRequest("missing request target".into()))?;
        let headers = req
            .headers
            .iter()
            .map(|h| {
                (
                    h.name.to_string(),
                    String::from_utf8_lossy(h.value).into_owned(),
                )
            })
            .collect();

        Ok(Some((
            len,
            Request {
                method: method.to_string(),
                target: target.to_string(),
                headers,
            },
        )))
    }

    pub fn is_connect(&self) -> bool {
        self.method.eq_ignore_ascii_case("CONNECT")
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// The tunnel target of a CONNECT request.
    pub fn authority(&self) -> Result<Authority> {
        if !self.is_connect() {
            return Err(ProxyError::MethodNotAllowed(self.method.clone()));
        }
        Authority::parse(&self.target)
    }
}

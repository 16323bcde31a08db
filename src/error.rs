// src/error.rs

use std::io;
use std::time::Duration;

use thiserror::Error;

pub type Result<T, E = ProxyError> = std::result::Result<T, E>;

/// Everything that can end a single proxied connection.
#[derive(Debug, Error)]
pub enum ProxyError {
    #[error("malformed request: {0}")]
    BadRequest(String),

    #[error("request head exceeds {0} bytes")]
    HeadTooLarge(usize),

    #[error("method {0} not allowed")]
    MethodNotAllowed(String),

    #[error("peer closed before the head was complete")]
    Incomplete,

    #[error("failed to connect to {authority}: {source}")]
    Dial {
        authority: String,
        #[source]
        source: io::Error,
    },

    #[error("timed out connecting to {authority} after {timeout:?}")]
    DialTimeout { authority: String, timeout: Duration },

    #[error("tunnel idle for {0:?}")]
    Idle(Duration),

    #[error("proxy refused tunnel: {status} {reason}")]
    Refused { status: u16, reason: String },

    #[error(transparent)]
    Io(#[from] io::Error),
}

impl ProxyError {
    /// Status line to send back before closing the inbound connection, if any.
    pub fn status(&self) -> Option<(u16, &'static str)> {
        match self {
            ProxyError::BadRequest(_) => Some((400, "Bad Request")),
            ProxyError::HeadTooLarge(_) => Some((431, "Request Header Fields Too Large")),
            ProxyError::MethodNotAllowed(_) => Some((405, "Method Not Allowed")),
            ProxyError::Dial { .. } => Some((502, "Bad Gateway")),
            ProxyError::DialTimeout { .. } => Some((504, "Gateway Timeout")),
            ProxyError::Incomplete
            | ProxyError::Idle(_)
            | ProxyError::Refused { .. }
            | ProxyError::Io(_) => None,
        }
    }
}

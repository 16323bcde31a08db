// src/authority.rs

use std::fmt;
use std::str::FromStr;

use crate::error::ProxyError;

const HTTP_PORT: u16 = 80;
const HTTPS_PORT: u16 = 443;

/// `host:port` named by a CONNECT request target.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Authority {
    pub host: String,
    pub port: u16,
}

impl Authority {
    /// Parses an authority-form request target.
    ///
    /// A leading `http://` or `https://` is stripped and picks the default port
    /// when none is given; without a scheme the default is 80. Paths are rejected.
    pub fn parse(target: &str) -> Result<Self, ProxyError> {
        let bad = |why: &str| ProxyError::BadRequest(format!("{why}: {target:?}"));

        let (rest, default_port) = if let Some(rest) = strip_scheme(target, "http://") {
            (rest, HTTP_PORT)
        } else if let Some(rest) = strip_scheme(target, "https://") {
            (rest, HTTPS_PORT)
        } else {
            (target, HTTP_PORT)
        };

        if rest.contains('/') || rest.contains('?') || rest.contains('#') {
            return Err(bad("target must not carry a path"));
        }
        if rest.contains('@') {
            return Err(bad("target must not carry userinfo"));
        }

        let (host, port) = if let Some(bracketed) = rest.strip_prefix('[') {
            let (host, after) = bracketed
                .split_once(']')
                .ok_or_else(|| bad("unterminated IPv6 literal"))?;
            let port = match after {
                "" => None,
                _ => Some(
                    after
                        .strip_prefix(':')
                        .ok_or_else(|| bad("junk after IPv6 literal"))?,
                ),
            };
            (host, port)
        } else {
            match rest.rsplit_once(':') {
                Some((host, _)) if host.contains(':') => {
                    return Err(bad("IPv6 literal must be bracketed"))
                }
                Some((host, port)) => (host, Some(port)),
                None => (rest, None),
            }
        };

        if host.is_empty() {
            return Err(bad("missing host"));
        }

        let port = match port {
            None => default_port,
            Some(port) => match port.parse::<u16>() {
                Ok(0) | Err(_) => return Err(bad("invalid port")),
                Ok(port) => port,
            },
        };

        Ok(Authority {
            host: host.to_string(),
            port,
        })
    }

    /// The request a client sends to ask a proxy for this tunnel.
    pub fn connect_request(&self) -> String {
        format!("CONNECT {self} HTTP/1.1\r\nHost: {self}\r\n\r\n")
    }
}

fn strip_scheme<'a>(target: &'a str, scheme: &str) -> Option<&'a str> {
    let head = target.get(..scheme.len())?;
    head.eq_ignore_ascii_case(scheme)
        .then(|| &target[scheme.len()..])
}

impl FromStr for Authority {
    type Err = ProxyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl fmt::Display for Authority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.host.contains(':') {
            write!(f, "[{}]:{}", self.host, self.port)
        } else {
            write!(f, "{}:{}", self.host, self.port)
        }
    }
}

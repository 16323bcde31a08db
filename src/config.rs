// clap to parse command-line arguments for the listen address, timeouts and optional TLS certificate/key.
/* This defines the CLI interface (--listen, --dial-timeout, --idle-timeout, --buffer-size, --tls-cert, --tls-key).
    The SocketAddr type ensures --listen is a valid address. TLS args are mutually required (enforced by requires).
 */
use clap::Parser;
use std::net::SocketAddr;
use std::time::Duration;

#[derive(Parser, Debug)]
#[command(about = "An HTTP CONNECT tunneling proxy written in Rust")]
pub struct Config {
    /// Local address to listen on (e.g., 0.0.0.0:8080)
    #[arg(long, default_value = "0.0.0.0:8080")]
    pub listen: SocketAddr,

    /// Seconds to wait for the target's TCP handshake
    #[arg(long, default_value_t = 10)]
    pub dial_timeout: u64,

    /// Tear down tunnels that moved no bytes for this many seconds
    #[arg(long, value_parser = clap::value_parser!(u64).range(1..))]
    pub idle_timeout: Option<u64>,

    /// Relay chunk size in bytes
    #[arg(long, default_value_t = 8192, value_parser = clap::value_parser!(u64).range(512..=1 << 20))]
    pub buffer_size: u64,

    /// Path to PEM certificate chain (enables the TLS front door)
    #[cfg(feature = "tls")]
    #[arg(long, requires = "tls_key")]
    pub tls_cert: Option<String>,

    /// Path to PEM private key
    #[cfg(feature = "tls")]
    #[arg(long, requires = "tls_cert")]
    pub tls_key: Option<String>,
}

impl Config {
    pub fn settings(&self) -> TunnelSettings {
        TunnelSettings {
            dial_timeout: Duration::from_secs(self.dial_timeout),
            idle_timeout: self.idle_timeout.map(Duration::from_secs),
            buffer_size: self.buffer_size as usize,
        }
    }
}

/// Per-connection knobs, copied into every connection task.
#[derive(Debug, Clone, Copy)]
pub struct TunnelSettings {
    pub dial_timeout: Duration,
    pub idle_timeout: Option<Duration>,
    pub buffer_size: usize,
}

impl Default for TunnelSettings {
    fn default() -> Self {
        TunnelSettings {
            dial_timeout: Duration::from_secs(10),
            idle_timeout: None,
            buffer_size: 8192,
        }
    }
}

pub fn parse() -> Config {
    Config::parse()
}


// ./target/release/ctunnel --listen 127.0.0.1:8080
// RUST_LOG=debug ./target/release/ctunnel --listen 127.0.0.1:8080 --idle-timeout 300
// curl -v -p -x http://127.0.0.1:8080 http://example.com/

/* HTTP CONNECT tunneling proxy: request head parsing, target dialing and a full-duplex relay. */

pub mod authority;
pub mod client;
pub mod config;
pub mod error;
pub mod logging;
pub mod relay;
pub mod request;
pub mod server;
#[cfg(feature = "tls")]
pub mod tls;
pub mod tunnel;

pub use authority::Authority;
pub use config::TunnelSettings;
pub use error::{ProxyError, Result};

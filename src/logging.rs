/* Connection and error logging */

use env_logger::{Builder, Env};

/// Honours `RUST_LOG`, defaulting to `info`.
pub fn init() {
    Builder::from_env(Env::default().default_filter_or("info"))
        .format_timestamp_millis()
        .init();
}

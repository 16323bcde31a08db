/* Tie everything together: parse CLI, initialize logging, and start the proxy. */

use std::process::ExitCode;

use ctunnel::{config::parse, logging::init, server};
use log::{error, info};
use tokio::net::TcpListener;

#[tokio::main]
async fn main() -> ExitCode {
    init();

    let config = parse();
    let settings = config.settings();

    // TLS material is checked before the port is taken.
    #[cfg(feature = "tls")]
    let tls_acceptor = if let (Some(cert), Some(key)) = (&config.tls_cert, &config.tls_key) {
        match ctunnel::tls::load_acceptor(cert, key) {
            Ok(acceptor) => Some(acceptor),
            Err(e) => {
                error!("Failed to load TLS config: {}", e);
                return ExitCode::FAILURE;
            }
        }
    } else {
        None
    };

    let listener = match TcpListener::bind(config.listen).await {
        Ok(listener) => listener,
        Err(e) => {
            error!("Failed to bind to {}: {}", config.listen, e);
            return ExitCode::FAILURE;
        }
    };

    #[cfg(feature = "tls")]
    let serving = async {
        match tls_acceptor {
            Some(acceptor) => server::serve_tls(listener, acceptor, settings).await,
            None => server::serve(listener, settings).await,
        }
    };
    #[cfg(not(feature = "tls"))]
    let serving = server::serve(listener, settings);

    tokio::select! {
        result = serving => {
            if let Err(e) = result {
                error!("Listener error: {}", e);
                return ExitCode::FAILURE;
            }
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Interrupted, shutting down");
        }
    }
    ExitCode::SUCCESS
}

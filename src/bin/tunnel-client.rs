/* Demo client: open a CONNECT tunnel through the proxy, send a GET, print the reply. */

use std::process::ExitCode;

use clap::Parser;
use ctunnel::client::open_tunnel;
use ctunnel::{logging, Authority, Result};
use log::{error, info};
use tokio::io::{self, AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;

#[derive(Parser, Debug)]
#[command(about = "Fetch a page through an HTTP CONNECT proxy")]
struct Args {
    /// Proxy address
    #[arg(long, default_value = "127.0.0.1:8080")]
    proxy: String,

    /// Tunnel target (host:port)
    #[arg(long, default_value = "example.com:80")]
    target: Authority,

    /// Path requested once the tunnel is up
    #[arg(long, default_value = "/")]
    path: String,

    /// PEM CA to trust when the proxy listens with TLS
    #[cfg(feature = "tls")]
    #[arg(long)]
    ca: Option<String>,

    /// Name expected on the proxy's certificate
    #[cfg(feature = "tls")]
    #[arg(long, default_value = "localhost", requires = "ca")]
    server_name: String,
}

#[tokio::main]
async fn main() -> ExitCode {
    logging::init();
    let args = Args::parse();

    match run(&args).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{}", e);
            ExitCode::FAILURE
        }
    }
}

async fn run(args: &Args) -> Result<()> {
    let stream = TcpStream::connect(&args.proxy).await?;

    #[cfg(feature = "tls")]
    {
        if let Some(ca) = &args.ca {
            let connector = ctunnel::tls::load_connector(ca)?;
            let name = rustls::pki_types::ServerName::try_from(args.server_name.clone())
                .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;
            let stream = connector.connect(name, stream).await?;
            return fetch(stream, args).await;
        }
    }

    fetch(stream, args).await
}

async fn fetch<S>(stream: S, args: &Args) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut tunnel = open_tunnel(stream, &args.target).await?;
    info!("Tunnel to {} established", args.target);

    let request = format!(
        "GET {} HTTP/1.1\r\nHost: {}\r\nConnection: close\r\n\r\n",
        args.path, args.target
    );
    tunnel.stream.write_all(request.as_bytes()).await?;
    tunnel.stream.flush().await?;

    let mut stdout = io::stdout();
    stdout.write_all(&tunnel.early).await?;
    io::copy(&mut tunnel.stream, &mut stdout).await?;
    stdout.flush().await?;
    info!("socket end.");
    Ok(())
}

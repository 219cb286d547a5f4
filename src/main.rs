//! mocknet demo
//!
//! Runs a client/server exchange entirely on the in-process mock network.
//!
//! ```text
//!   client                                   server (port 4000)
//!     connect ───────────────────────────────► accept
//!     ◄──────────────────────────── "Welcome!\n"
//!     "example\n" + FIN ─────────────────────► echo
//!     ◄──────────────────────────── "example\n" + FIN
//!     close                                    close
//! ```
//!
//! Scenarios:
//! - `echo`: TLS server, client trusts the server's issuer automatically
//! - `plain`: TLS server, client builds its TLS session over a plain connect
//! - `net`: no TLS

use std::error::Error;
use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use rustls::pki_types::ServerName;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio_rustls::TlsConnector;

use mocknet::config::{load_config, MockNetConfig};
use mocknet::net::{connect, ConnectOptions, Kernel, Server, SocketOptions};
use mocknet::observability::init_logging;
use mocknet::tls::{self, pem, CertOptions, CertificateAuthority, MockTlsServer, TlsConnectOptions};

#[derive(Parser)]
#[command(name = "mocknet")]
#[command(about = "Client/server exchange over the in-process mock network", long_about = None)]
struct Cli {
    /// TOML configuration file.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Port the server listens on.
    #[arg(short, long, default_value_t = 4000)]
    port: u16,

    #[command(subcommand)]
    scenario: Scenario,
}

#[derive(Subcommand)]
enum Scenario {
    /// TLS echo with trust-anchor discovery
    Echo,
    /// TLS echo with a hand-built client session
    Plain,
    /// Plain echo without TLS
    Net,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    let cli = Cli::parse();
    let config = match &cli.config {
        Some(path) => load_config(path)?,
        None => MockNetConfig::default(),
    };
    init_logging(&config.logging)?;

    tracing::info!("mocknet v{} starting", env!("CARGO_PKG_VERSION"));

    let kernel = Kernel::from_config(&config.kernel);
    let mut options = SocketOptions::from(&config.socket);
    if let Some(hook) = config.logging.trace_hook() {
        options = options.trace_hook(hook);
    }

    let received = match cli.scenario {
        Scenario::Echo => run_echo(&config, kernel, options, cli.port).await?,
        Scenario::Plain => run_plain(&config, kernel, options, cli.port).await?,
        Scenario::Net => run_net(kernel, options, cli.port).await?,
    };

    print!("{}", String::from_utf8_lossy(&received));
    tracing::info!(bytes = received.len(), "Exchange complete");
    Ok(())
}

async fn run_net(kernel: Kernel, options: SocketOptions, port: u16) -> Result<Vec<u8>, Box<dyn Error>> {
    let server = Server::builder()
        .kernel(kernel.clone())
        .socket_options(options.clone())
        .on_connection(|socket| {
            tokio::spawn(serve_echo(socket));
        })
        .build();
    let port = server.listen(port).listening().await?;

    let mut client = connect(
        ConnectOptions::new(port)
            .kernel(kernel)
            .socket_options(options),
    )?;
    client.connected().await?;
    client.write_all(b"example\n").await?;
    client.shutdown().await?;

    let received = read_all(&mut client).await?;
    client.closed().await;

    server.close();
    server.closed().await;
    Ok(received)
}

async fn run_echo(
    config: &MockNetConfig,
    kernel: Kernel,
    options: SocketOptions,
    port: u16,
) -> Result<Vec<u8>, Box<dyn Error>> {
    let server = tls_server(config, kernel.clone(), options.clone())?;
    let port = server.listen(port).listening().await?;

    let mut stream = tls::connect(
        TlsConnectOptions::new(port)
            .kernel(kernel)
            .socket_options(options)
            .server_name(server_name(config)),
    )?
    .await?;
    stream.write_all(b"example\n").await?;
    stream.shutdown().await?;
    let received = read_all(&mut stream).await?;

    server.close();
    server.closed().await;
    Ok(received)
}

async fn run_plain(
    config: &MockNetConfig,
    kernel: Kernel,
    options: SocketOptions,
    port: u16,
) -> Result<Vec<u8>, Box<dyn Error>> {
    let server = tls_server(config, kernel.clone(), options.clone())?;
    let port = server.listen(port).listening().await?;

    let socket = tls::plain_connect(
        ConnectOptions::new(port)
            .kernel(kernel)
            .socket_options(options),
    )?;
    socket.connected().await?;

    let connector = TlsConnector::from(pem::client_config(server.issuer_certificate())?);
    let name = ServerName::try_from(server_name(config))?;
    let mut stream = connector.connect(name, socket).await?;
    stream.write_all(b"plain example\n").await?;
    stream.shutdown().await?;
    let received = read_all(&mut stream).await?;

    server.close();
    server.closed().await;
    Ok(received)
}

fn tls_server(
    config: &MockNetConfig,
    kernel: Kernel,
    options: SocketOptions,
) -> Result<MockTlsServer, Box<dyn Error>> {
    let authority = Arc::new(CertificateAuthority::from_config(&config.certificate)?);
    let server = MockTlsServer::builder()
        .kernel(kernel)
        .authority(authority)
        .cert_options(CertOptions::from(&config.certificate))
        .socket_options(options)
        .on_secure_connection(|stream| {
            tokio::spawn(serve_echo(stream));
        })
        .build()?;
    Ok(server)
}

fn server_name(config: &MockNetConfig) -> String {
    config
        .certificate
        .names
        .first()
        .cloned()
        .unwrap_or_else(|| "localhost".to_string())
}

/// Greet, then echo everything back until the peer finishes.
async fn serve_echo<S>(stream: S)
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let (mut reader, mut writer) = tokio::io::split(stream);
    let result = async {
        writer.write_all(b"Welcome!\n").await?;
        tokio::io::copy(&mut reader, &mut writer).await?;
        writer.shutdown().await
    }
    .await;
    if let Err(e) = result {
        tracing::warn!(error = %e, "Echo connection failed");
    }
}

/// Read until end of stream. A peer that skips the TLS close_notify still
/// counts as a clean end.
async fn read_all<S>(stream: &mut S) -> io::Result<Vec<u8>>
where
    S: AsyncRead + Unpin,
{
    let mut received = Vec::new();
    match stream.read_to_end(&mut received).await {
        Ok(_) => Ok(received),
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => Ok(received),
        Err(e) => Err(e),
    }
}

//! TLS client connect.

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};

use rustls::pki_types::ServerName;
use tokio_rustls::client::TlsStream;
use tokio_rustls::TlsConnector;

use crate::net::{self, ConnectOptions, HalfSocket, Kernel, SocketOptions};
use crate::tls::{pem, TlsError};

/// Arguments to [`connect`].
#[derive(Debug, Clone)]
pub struct TlsConnectOptions {
    pub port: u16,
    /// PEM trust anchor. When unset, the issuer certificate published by the
    /// TLS server on `port` is trusted.
    pub ca: Option<String>,
    /// Name the server certificate is checked against.
    pub server_name: String,
    pub socket: SocketOptions,
    pub kernel: Option<Kernel>,
}

impl TlsConnectOptions {
    pub fn new(port: u16) -> Self {
        Self {
            port,
            ca: None,
            server_name: "localhost".to_string(),
            socket: SocketOptions::default(),
            kernel: None,
        }
    }

    pub fn ca(mut self, pem: impl Into<String>) -> Self {
        self.ca = Some(pem.into());
        self
    }

    pub fn server_name(mut self, name: impl Into<String>) -> Self {
        self.server_name = name.into();
        self
    }

    pub fn socket_options(mut self, options: SocketOptions) -> Self {
        self.socket = options;
        self
    }

    pub fn kernel(mut self, kernel: Kernel) -> Self {
        self.kernel = Some(kernel);
        self
    }
}

impl From<u16> for TlsConnectOptions {
    fn from(port: u16) -> Self {
        Self::new(port)
    }
}

/// A TLS connection in progress. Resolves once the handshake completes.
pub struct Connecting {
    inner: Pin<Box<dyn Future<Output = Result<TlsStream<HalfSocket>, TlsError>> + Send>>,
}

impl Future for Connecting {
    type Output = Result<TlsStream<HalfSocket>, TlsError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        self.inner.as_mut().poll(cx)
    }
}

impl fmt::Debug for Connecting {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Connecting(..)")
    }
}

/// Open a TLS connection to the mock server on `options.port`.
///
/// Option errors are returned straight away; network and handshake errors
/// come out of the returned future.
pub fn connect(options: impl Into<TlsConnectOptions>) -> Result<Connecting, TlsError> {
    let options = options.into();
    let port = options.port;
    let server_name = ServerName::try_from(options.server_name.clone())
        .map_err(|_| TlsError::InvalidServerName(options.server_name.clone()))?;
    let kernel = options.kernel.unwrap_or_else(Kernel::global);

    let ca = options.ca.or_else(|| {
        let anchor = kernel
            .lookup(port)
            .and_then(|server| server.issuer_certificate().map(str::to_owned));
        if anchor.is_some() {
            tracing::debug!(port, "Trusting issuer certificate of mock server");
        }
        anchor
    });
    let socket = net::connect(
        ConnectOptions::new(port)
            .kernel(kernel)
            .socket_options(options.socket),
    )?;

    Ok(Connecting {
        inner: Box::pin(async move {
            socket.connected().await?;
            let ca = ca.ok_or(TlsError::NoTrustAnchor { port })?;
            let connector = TlsConnector::from(pem::client_config(&ca)?);
            let stream = connector.connect(server_name, socket).await?;
            Ok(stream)
        }),
    })
}

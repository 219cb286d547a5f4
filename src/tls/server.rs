//! TLS-flavoured mock server.
//!
//! Wraps a plain [`Server`]: every accepted connection is handed to a
//! `TlsAcceptor` in its own task, and completed handshakes are delivered as
//! secure connections.

use std::fmt;
use std::ops::Deref;
use std::sync::Arc;

use parking_lot::RwLock;
use tokio::sync::mpsc;
use tokio_rustls::server::TlsStream;
use tokio_rustls::TlsAcceptor;

use crate::net::{HalfSocket, Kernel, Server, SocketOptions};
use crate::observability::hook::{self, TraceEvent, TraceHook};
use crate::tls::ca::{CertOptions, CertificateAuthority, IssuedCertificate};
use crate::tls::{pem, TlsError};

/// Callback receiving each connection once its handshake completed.
pub type SecureConnectionHandler = Arc<dyn Fn(TlsStream<HalfSocket>) + Send + Sync>;

struct SecureShared {
    acceptor: TlsAcceptor,
    handler: RwLock<Option<SecureConnectionHandler>>,
    secure_tx: mpsc::UnboundedSender<TlsStream<HalfSocket>>,
    secure_rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<TlsStream<HalfSocket>>>,
    trace: Option<TraceHook>,
}

impl SecureShared {
    fn handshake(self: &Arc<Self>, socket: HalfSocket) {
        let shared = Arc::clone(self);
        tokio::spawn(async move {
            let id = socket.id();
            let port = socket.remote_port().unwrap_or_default();
            match shared.acceptor.accept(socket).await {
                Ok(stream) => {
                    tracing::debug!(connection_id = %id, port, "TLS handshake complete");
                    hook::record(
                        shared.trace.as_ref(),
                        TraceEvent::new("tls", format!("mock:{port}"), "secure")
                            .with_detail(id),
                    );
                    let handler = shared.handler.read().clone();
                    match handler {
                        Some(handler) => handler(stream),
                        None => {
                            let _ = shared.secure_tx.send(stream);
                        }
                    }
                }
                Err(e) => {
                    tracing::warn!(connection_id = %id, port, error = %e, "TLS handshake failed");
                    hook::record(
                        shared.trace.as_ref(),
                        TraceEvent::new("tls", format!("mock:{port}"), "error").with_detail(e),
                    );
                }
            }
        });
    }
}

/// A mock server that speaks TLS on every accepted connection.
///
/// Derefs to the underlying [`Server`] for listening, closing and
/// inspection.
pub struct MockTlsServer {
    server: Server,
    shared: Arc<SecureShared>,
    credentials: IssuedCertificate,
}

impl MockTlsServer {
    /// A TLS server with a fresh authority and a certificate for `localhost`.
    pub fn new() -> Result<Self, TlsError> {
        Self::builder().build()
    }

    pub fn builder() -> MockTlsServerBuilder {
        MockTlsServerBuilder::default()
    }

    pub fn server(&self) -> &Server {
        &self.server
    }

    /// Listen on `port`, handing each secure connection to `handler`.
    pub fn listen_with<F>(&self, port: u16, handler: F) -> &Self
    where
        F: Fn(TlsStream<HalfSocket>) + Send + Sync + 'static,
    {
        *self.shared.handler.write() = Some(Arc::new(handler));
        self.server.listen(port);
        self
    }

    /// Next secure connection not taken by a handler, or `None` once the
    /// server is closed.
    pub async fn accept(&self) -> Option<TlsStream<HalfSocket>> {
        let mut rx = self.shared.secure_rx.lock().await;
        tokio::select! {
            biased;
            stream = rx.recv() => stream,
            _ = self.server.closed() => None,
        }
    }

    /// PEM certificate presented to clients.
    pub fn certificate(&self) -> &str {
        &self.credentials.certificate
    }

    /// PEM certificate of the issuing authority.
    pub fn issuer_certificate(&self) -> &str {
        &self.credentials.issuer_certificate
    }

    pub fn credentials(&self) -> &IssuedCertificate {
        &self.credentials
    }
}

impl Deref for MockTlsServer {
    type Target = Server;

    fn deref(&self) -> &Server {
        &self.server
    }
}

impl fmt::Debug for MockTlsServer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MockTlsServer")
            .field("server", &self.server)
            .finish()
    }
}

/// Builder for [`MockTlsServer`].
#[derive(Default)]
pub struct MockTlsServerBuilder {
    authority: Option<Arc<CertificateAuthority>>,
    cert_options: CertOptions,
    credentials: Option<IssuedCertificate>,
    kernel: Option<Kernel>,
    options: SocketOptions,
    handler: Option<SecureConnectionHandler>,
}

impl MockTlsServerBuilder {
    /// Issue the server certificate from `authority` instead of a fresh one.
    pub fn authority(mut self, authority: Arc<CertificateAuthority>) -> Self {
        self.authority = Some(authority);
        self
    }

    pub fn cert_options(mut self, options: CertOptions) -> Self {
        self.cert_options = options;
        self
    }

    /// Use ready-made certificate, key and issuer instead of issuing.
    pub fn credentials(mut self, credentials: IssuedCertificate) -> Self {
        self.credentials = Some(credentials);
        self
    }

    pub fn kernel(mut self, kernel: Kernel) -> Self {
        self.kernel = Some(kernel);
        self
    }

    pub fn socket_options(mut self, options: SocketOptions) -> Self {
        self.options = options;
        self
    }

    pub fn allow_half_open(mut self, allow: bool) -> Self {
        self.options.allow_half_open = allow;
        self
    }

    pub fn trace_hook(mut self, hook: TraceHook) -> Self {
        self.options.trace = Some(hook);
        self
    }

    pub fn on_secure_connection<F>(mut self, handler: F) -> Self
    where
        F: Fn(TlsStream<HalfSocket>) + Send + Sync + 'static,
    {
        self.handler = Some(Arc::new(handler));
        self
    }

    pub fn build(self) -> Result<MockTlsServer, TlsError> {
        let credentials = match self.credentials {
            Some(credentials) => credentials,
            None => {
                let authority = match self.authority {
                    Some(authority) => authority,
                    None => Arc::new(CertificateAuthority::new()?),
                };
                authority.issue(&self.cert_options)?
            }
        };
        let config = pem::server_config(&credentials.certificate, &credentials.private_key)?;

        let (secure_tx, secure_rx) = mpsc::unbounded_channel();
        let shared = Arc::new(SecureShared {
            acceptor: TlsAcceptor::from(config),
            handler: RwLock::new(self.handler),
            secure_tx,
            secure_rx: tokio::sync::Mutex::new(secure_rx),
            trace: self.options.trace.clone(),
        });

        let mut server = Server::builder()
            .socket_options(self.options)
            .issuer_certificate(credentials.issuer_certificate.clone());
        if let Some(kernel) = self.kernel {
            server = server.kernel(kernel);
        }
        let acceptor = Arc::clone(&shared);
        let server = server
            .on_connection(move |socket| acceptor.handshake(socket))
            .build();

        Ok(MockTlsServer {
            server,
            shared,
            credentials,
        })
    }
}

impl fmt::Debug for MockTlsServerBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MockTlsServerBuilder")
            .field("cert_options", &self.cert_options)
            .field("kernel", &self.kernel)
            .field("options", &self.options)
            .finish()
    }
}

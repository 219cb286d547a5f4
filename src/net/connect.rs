//! Client-side entry point.

use std::fmt;

use crate::net::defer::defer;
use crate::net::kernel::Kernel;
use crate::net::socket::{HalfSocket, MockSocket, SocketOptions};
use crate::net::NetError;
use crate::observability::hook::TraceHook;

/// Arguments to [`connect`].
#[derive(Default)]
pub struct ConnectOptions {
    pub port: u16,
    /// Options for the returned client half.
    pub socket: SocketOptions,
    /// Kernel to look the port up in; the global one when unset.
    pub kernel: Option<Kernel>,
    /// Runs on the next turn once the connection is registered with the server.
    pub on_connect: Option<Box<dyn FnOnce() + Send>>,
}

impl ConnectOptions {
    pub fn new(port: u16) -> Self {
        Self {
            port,
            ..Self::default()
        }
    }

    pub fn kernel(mut self, kernel: Kernel) -> Self {
        self.kernel = Some(kernel);
        self
    }

    pub fn socket_options(mut self, options: SocketOptions) -> Self {
        self.socket = options;
        self
    }

    pub fn allow_half_open(mut self, allow: bool) -> Self {
        self.socket.allow_half_open = allow;
        self
    }

    pub fn trace_hook(mut self, hook: TraceHook) -> Self {
        self.socket.trace = Some(hook);
        self
    }

    pub fn on_connect<F>(mut self, on_connect: F) -> Self
    where
        F: FnOnce() + Send + 'static,
    {
        self.on_connect = Some(Box::new(on_connect));
        self
    }
}

impl From<u16> for ConnectOptions {
    fn from(port: u16) -> Self {
        Self::new(port)
    }
}

impl fmt::Debug for ConnectOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectOptions")
            .field("port", &self.port)
            .field("socket", &self.socket)
            .field("kernel", &self.kernel)
            .field("on_connect", &self.on_connect.is_some())
            .finish()
    }
}

/// Open a connection to the server listening on `options.port`.
///
/// Returns the client half straight away. Whether the connection was accepted
/// is observed through [`HalfSocket::connected`]; a refused connection fails
/// every read and write with [`NetError::ConnectionRefused`].
pub fn connect(options: impl Into<ConnectOptions>) -> Result<HalfSocket, NetError> {
    let options = options.into();
    let port = options.port;
    if port == 0 {
        return Err(NetError::InvalidPort(port));
    }

    let kernel = options.kernel.unwrap_or_else(Kernel::global);
    let Some(server) = kernel.lookup(port) else {
        let MockSocket { client, server } =
            MockSocket::new(options.socket, SocketOptions::default());
        drop(server);
        tracing::debug!(port, "Connection refused");
        client.core().fail(NetError::ConnectionRefused { port });
        return Ok(client);
    };

    let MockSocket { client, server: half } =
        MockSocket::new(options.socket, server.socket_options().clone());
    match server.add_client(half) {
        Ok(()) => {
            client.core().set_remote_port(port);
            if let Some(on_connect) = options.on_connect {
                defer(on_connect);
            }
        }
        Err(err) => {
            tracing::debug!(port, error = %err, "Server rejected connection");
            client.core().fail(err);
        }
    }
    Ok(client)
}

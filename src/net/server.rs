//! Mock listening server.
//!
//! # Responsibilities
//! - Bind a port through the [`Kernel`]
//! - Track the server half of every accepted connection
//! - Sequence graceful shutdown: stop accepting, end every client, wait for
//!   the last one to close, release the port, raise `Close`

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::mem;
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tokio::sync::{watch, Notify};

use crate::net::connection::ConnectionId;
use crate::net::defer::defer;
use crate::net::kernel::{Kernel, PortLease};
use crate::net::socket::{HalfSocket, SocketCore, SocketOptions};
use crate::net::NetError;
use crate::observability::hook::{self, TraceEvent, TraceHook};

/// Callback receiving the server half of each accepted connection.
pub type ConnectionHandler = Arc<dyn Fn(HalfSocket) + Send + Sync>;

type Callback = Box<dyn FnOnce() + Send>;

/// Notifications raised by a [`Server`], in the order they happened.
#[derive(Debug)]
pub enum ServerEvent {
    Listening { port: u16 },
    /// A connection nobody handled yet. Only queued when the server has no
    /// connection handler.
    Connection(HalfSocket),
    Error(NetError),
    Close,
}

/// Where a server is in its life.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lifecycle {
    Unbound,
    Listening { port: u16 },
    /// Closing; waiting for the remaining clients to go away.
    Draining { port: u16 },
    Closed,
}

impl Lifecycle {
    pub fn port(&self) -> Option<u16> {
        match self {
            Lifecycle::Listening { port } | Lifecycle::Draining { port } => Some(*port),
            Lifecycle::Unbound | Lifecycle::Closed => None,
        }
    }
}

/// Address of a bound mock server. Renders as `mock:<port>`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MockAddr {
    port: u16,
}

impl MockAddr {
    pub fn new(port: u16) -> Self {
        Self { port }
    }

    pub fn port(&self) -> u16 {
        self.port
    }
}

impl fmt::Display for MockAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "mock:{}", self.port)
    }
}

/// Arguments to [`Server::listen`]. Port 0 asks the kernel for a free port.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ListenOptions {
    pub port: u16,
}

impl From<u16> for ListenOptions {
    fn from(port: u16) -> Self {
        Self { port }
    }
}

impl From<Option<u16>> for ListenOptions {
    fn from(port: Option<u16>) -> Self {
        Self {
            port: port.unwrap_or(0),
        }
    }
}

struct ServerState {
    lifecycle: Lifecycle,
    lease: Option<PortLease>,
    clients: HashMap<ConnectionId, Arc<SocketCore>>,
    close_callbacks: Vec<Callback>,
}

/// Queued notifications. No lock is held while a reader waits, so a
/// pending `accept` never hides other events.
#[derive(Default)]
struct EventQueue {
    events: Mutex<VecDeque<ServerEvent>>,
    ready: Notify,
}

impl EventQueue {
    fn push(&self, event: ServerEvent) {
        self.events.lock().push_back(event);
        self.ready.notify_waiters();
    }

    /// Remove the first queued event accepted by `wanted`, keeping the others.
    fn try_take<F>(&self, wanted: F) -> Option<ServerEvent>
    where
        F: Fn(&ServerEvent) -> bool,
    {
        let mut events = self.events.lock();
        let pos = events.iter().position(wanted)?;
        events.remove(pos)
    }

    async fn take<F>(&self, wanted: F) -> ServerEvent
    where
        F: Fn(&ServerEvent) -> bool,
    {
        loop {
            let notified = self.ready.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if let Some(event) = self.try_take(&wanted) {
                return event;
            }
            notified.await;
        }
    }
}

pub(crate) struct ServerInner {
    kernel: Kernel,
    options: SocketOptions,
    handler: Option<ConnectionHandler>,
    issuer_certificate: Option<String>,
    state: Mutex<ServerState>,
    events: EventQueue,
    lifecycle_tx: watch::Sender<Lifecycle>,
}

/// What is left to do after the draining → closed transition.
struct Closing {
    port: Option<u16>,
    callbacks: Vec<Callback>,
}

/// A listening endpoint on the mock network.
///
/// `Server` is a cheap handle; clones refer to the same server. The kernel
/// only holds a weak reference, so the port is released when the last handle
/// is dropped even if [`close`](Server::close) was never called.
#[derive(Clone)]
pub struct Server {
    inner: Arc<ServerInner>,
}

impl Server {
    /// A server on the global kernel with default socket options.
    pub fn new() -> Self {
        Self::builder().build()
    }

    pub fn builder() -> ServerBuilder {
        ServerBuilder::default()
    }

    pub(crate) fn inner(&self) -> &Arc<ServerInner> {
        &self.inner
    }

    pub(crate) fn from_inner(inner: Arc<ServerInner>) -> Self {
        Self { inner }
    }

    /// Whether both handles refer to the same server.
    pub fn ptr_eq(&self, other: &Server) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Bind to a port. The outcome is queued as `Listening` or `Error`.
    pub fn listen(&self, options: impl Into<ListenOptions>) -> &Self {
        let _ = self.bind(options.into().port);
        self
    }

    /// Bind to `port` and run `on_listening` with the bound port on the next
    /// turn. The callback does not run when binding fails.
    pub fn listen_with<F>(&self, port: u16, on_listening: F) -> &Self
    where
        F: FnOnce(u16) + Send + 'static,
    {
        if let Ok(port) = self.bind(port) {
            defer(move || on_listening(port));
        }
        self
    }

    fn bind(&self, port: u16) -> Result<u16, NetError> {
        let result = {
            let mut state = self.inner.state.lock();
            match state.lifecycle {
                Lifecycle::Listening { .. } | Lifecycle::Draining { .. } => {
                    Err(NetError::AlreadyListening)
                }
                Lifecycle::Unbound | Lifecycle::Closed => {
                    self.inner.kernel.open(port, self).map(|lease| {
                        let port = lease.port();
                        state.lease = Some(lease);
                        state.lifecycle = Lifecycle::Listening { port };
                        self.inner.lifecycle_tx.send_replace(state.lifecycle);
                        port
                    })
                }
            }
        };

        match &result {
            Ok(port) => {
                tracing::info!(address = %MockAddr::new(*port), "Listening for connections");
                self.record("listening", None);
                self.emit(ServerEvent::Listening { port: *port });
            }
            Err(err) => {
                tracing::warn!(requested_port = port, error = %err, "Listen failed");
                self.record("error", Some(err.to_string()));
                self.emit(ServerEvent::Error(err.clone()));
            }
        }
        result
    }

    /// Register the server half of a new connection.
    ///
    /// The socket is handed to the connection handler on the next turn, or
    /// queued as [`ServerEvent::Connection`] when there is no handler. When it
    /// closes it is removed from the client set.
    pub fn add_client(&self, socket: HalfSocket) -> Result<(), NetError> {
        let id = socket.id();
        let port = {
            let mut state = self.inner.state.lock();
            let Lifecycle::Listening { port } = state.lifecycle else {
                return Err(NetError::NotListening);
            };
            state.clients.insert(id, Arc::clone(socket.core()));
            port
        };

        socket.core().set_remote_port(port);
        let server = Arc::downgrade(&self.inner);
        socket
            .core()
            .on_close(Box::new(move || remove_client(&server, id)));

        tracing::debug!(connection_id = %id, port, "Connection accepted");
        self.record("connection", Some(id.to_string()));

        match &self.inner.handler {
            Some(handler) => {
                let handler = Arc::clone(handler);
                defer(move || handler(socket));
            }
            None => self.emit(ServerEvent::Connection(socket)),
        }
        Ok(())
    }

    fn remove_client(&self, id: ConnectionId) {
        let closing = {
            let mut state = self.inner.state.lock();
            if state.clients.remove(&id).is_none() {
                return;
            }
            tracing::debug!(connection_id = %id, remaining = state.clients.len(), "Client closed");
            self.check_closed(&mut state)
        };
        if let Some(closing) = closing {
            self.finish_close(closing);
        }
    }

    /// Draining with no clients left: release the port and become closed.
    fn check_closed(&self, state: &mut ServerState) -> Option<Closing> {
        let Lifecycle::Draining { port } = state.lifecycle else {
            return None;
        };
        if !state.clients.is_empty() {
            return None;
        }
        Some(self.enter_closed(state, Some(port)))
    }

    fn enter_closed(&self, state: &mut ServerState, port: Option<u16>) -> Closing {
        state.lifecycle = Lifecycle::Closed;
        state.lease = None;
        self.inner.lifecycle_tx.send_replace(Lifecycle::Closed);
        Closing {
            port,
            callbacks: mem::take(&mut state.close_callbacks),
        }
    }

    fn finish_close(&self, closing: Closing) {
        match closing.port {
            Some(port) => tracing::info!(address = %MockAddr::new(port), "Server closed"),
            None => tracing::debug!("Unbound server closed"),
        }
        self.record_at(closing.port, "close", None);
        self.emit(ServerEvent::Close);
        for callback in closing.callbacks {
            defer(callback);
        }
    }

    /// Stop accepting and end every connected client. `Close` is raised once
    /// the last client has closed.
    pub fn close(&self) -> &Self {
        self.shutdown(None);
        self
    }

    /// Like [`close`](Self::close), running `on_close` once the server is
    /// closed.
    pub fn close_with<F>(&self, on_close: F) -> &Self
    where
        F: FnOnce() + Send + 'static,
    {
        self.shutdown(Some(Box::new(on_close)));
        self
    }

    fn shutdown(&self, callback: Option<Callback>) {
        let mut run_now = None;
        let (clients, closing) = {
            let mut state = self.inner.state.lock();
            match state.lifecycle {
                Lifecycle::Listening { port } => {
                    state.lifecycle = Lifecycle::Draining { port };
                    self.inner.lifecycle_tx.send_replace(state.lifecycle);
                    state.close_callbacks.extend(callback);
                    tracing::info!(
                        address = %MockAddr::new(port),
                        clients = state.clients.len(),
                        "Server closing"
                    );
                    let clients: Vec<_> = state.clients.values().cloned().collect();
                    let closing = self.check_closed(&mut state);
                    (clients, closing)
                }
                Lifecycle::Unbound => {
                    state.close_callbacks.extend(callback);
                    (Vec::new(), Some(self.enter_closed(&mut state, None)))
                }
                Lifecycle::Draining { .. } => {
                    state.close_callbacks.extend(callback);
                    (Vec::new(), None)
                }
                Lifecycle::Closed => {
                    run_now = callback;
                    (Vec::new(), None)
                }
            }
        };

        for client in clients {
            client.end_write();
        }
        if let Some(closing) = closing {
            self.finish_close(closing);
        }
        if let Some(callback) = run_now {
            defer(callback);
        }
    }

    /// Report the number of connected clients on the next turn.
    pub fn get_connections<F>(&self, callback: F)
    where
        F: FnOnce(Result<usize, NetError>) + Send + 'static,
    {
        let server = self.clone();
        defer(move || callback(server.connection_count()));
    }

    /// Number of connected clients, observed on the next turn.
    pub async fn connections(&self) -> Result<usize, NetError> {
        tokio::task::yield_now().await;
        self.connection_count()
    }

    fn connection_count(&self) -> Result<usize, NetError> {
        let state = self.inner.state.lock();
        match state.lifecycle {
            Lifecycle::Listening { .. } => Ok(state.clients.len()),
            _ => Err(NetError::NotListening),
        }
    }

    /// Connected clients regardless of lifecycle.
    pub fn client_count(&self) -> usize {
        self.inner.state.lock().clients.len()
    }

    pub fn address(&self) -> Option<MockAddr> {
        self.port().map(MockAddr::new)
    }

    pub fn port(&self) -> Option<u16> {
        self.lifecycle().port()
    }

    pub fn lifecycle(&self) -> Lifecycle {
        self.inner.state.lock().lifecycle
    }

    pub fn is_listening(&self) -> bool {
        matches!(self.lifecycle(), Lifecycle::Listening { .. })
    }

    pub fn is_closing(&self) -> bool {
        matches!(self.lifecycle(), Lifecycle::Draining { .. })
    }

    pub fn kernel(&self) -> &Kernel {
        &self.inner.kernel
    }

    /// Options applied to the server half of each accepted connection.
    pub fn socket_options(&self) -> &SocketOptions {
        &self.inner.options
    }

    /// PEM issuer certificate of a TLS server.
    pub fn issuer_certificate(&self) -> Option<&str> {
        self.inner.issuer_certificate.as_deref()
    }

    /// Next queued notification.
    pub async fn next_event(&self) -> Option<ServerEvent> {
        Some(self.inner.events.take(|_| true).await)
    }

    /// Next queued notification, if one is ready.
    pub fn try_next_event(&self) -> Option<ServerEvent> {
        self.inner.events.try_take(|_| true)
    }

    /// Wait for the outcome of the pending `listen`.
    ///
    /// Other notifications stay queued.
    pub async fn listening(&self) -> Result<u16, NetError> {
        let event = self
            .inner
            .events
            .take(|e| matches!(e, ServerEvent::Listening { .. } | ServerEvent::Error(_)))
            .await;
        match event {
            ServerEvent::Listening { port } => Ok(port),
            ServerEvent::Error(err) => Err(err),
            _ => Err(NetError::NotListening),
        }
    }

    /// Next unhandled connection, or `None` once the server is closed.
    pub async fn accept(&self) -> Option<HalfSocket> {
        let next = self
            .inner
            .events
            .take(|e| matches!(e, ServerEvent::Connection(_)));
        tokio::select! {
            biased;
            event = next => match event {
                ServerEvent::Connection(socket) => Some(socket),
                _ => None,
            },
            _ = self.closed() => None,
        }
    }

    /// Wait until the server is closed.
    pub async fn closed(&self) {
        let mut rx = self.inner.lifecycle_tx.subscribe();
        let _ = rx.wait_for(|l| *l == Lifecycle::Closed).await;
    }

    fn emit(&self, event: ServerEvent) {
        self.inner.events.push(event);
    }

    fn record(&self, event: &'static str, detail: Option<String>) {
        self.record_at(self.port(), event, detail);
    }

    fn record_at(&self, port: Option<u16>, event: &'static str, detail: Option<String>) {
        let label = match port {
            Some(port) => MockAddr::new(port).to_string(),
            None => "unbound".to_string(),
        };
        let mut trace = TraceEvent::new("listener", label, event);
        trace.detail = detail;
        hook::record(self.inner.options.trace.as_ref(), trace);
    }
}

fn remove_client(server: &Weak<ServerInner>, id: ConnectionId) {
    if let Some(inner) = server.upgrade() {
        Server::from_inner(inner).remove_client(id);
    }
}

impl Default for Server {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Server {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.inner.state.lock();
        f.debug_struct("Server")
            .field("lifecycle", &state.lifecycle)
            .field("clients", &state.clients.len())
            .finish()
    }
}

/// Builder for [`Server`].
#[derive(Default)]
pub struct ServerBuilder {
    kernel: Option<Kernel>,
    options: SocketOptions,
    handler: Option<ConnectionHandler>,
    issuer_certificate: Option<String>,
}

impl ServerBuilder {
    /// Register on `kernel` instead of the global one.
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

    /// Handle each accepted connection with `handler` instead of queueing it.
    pub fn on_connection<F>(mut self, handler: F) -> Self
    where
        F: Fn(HalfSocket) + Send + Sync + 'static,
    {
        self.handler = Some(Arc::new(handler));
        self
    }

    pub(crate) fn issuer_certificate(mut self, pem: String) -> Self {
        self.issuer_certificate = Some(pem);
        self
    }

    pub fn build(self) -> Server {
        let (lifecycle_tx, _) = watch::channel(Lifecycle::Unbound);
        Server {
            inner: Arc::new(ServerInner {
                kernel: self.kernel.unwrap_or_else(Kernel::global),
                options: self.options,
                handler: self.handler,
                issuer_certificate: self.issuer_certificate,
                state: Mutex::new(ServerState {
                    lifecycle: Lifecycle::Unbound,
                    lease: None,
                    clients: HashMap::new(),
                    close_callbacks: Vec::new(),
                }),
                events: EventQueue::default(),
                lifecycle_tx,
            }),
        }
    }
}

impl fmt::Debug for ServerBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServerBuilder")
            .field("kernel", &self.kernel)
            .field("options", &self.options)
            .field("handler", &self.handler.is_some())
            .finish()
    }
}

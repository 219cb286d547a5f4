//! Half-sockets and the mock socket pair that cross-wires them.
//!
//! # Wiring
//! ```text
//!   client HalfSocket                         server HalfSocket
//!     write ──► transmitted ──► [to_server pipe] ──► read
//!     read  ◄────────────────── [to_client pipe] ◄── transmitted ◄── write
//!     shutdown ──► FIN into to_server        shutdown ──► FIN into to_client
//! ```
//!
//! A half-socket is closed once its read side has observed end-of-stream and
//! its write side has finished, or when it is dropped. With
//! `allow_half_open == false` observing end-of-stream finishes the write side
//! on the next scheduler turn, which is how a FIN from one peer ends up
//! closing both.

use std::fmt;
use std::io;
use std::mem;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{ready, Context, Poll};

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::sync::watch;

use crate::config::SocketConfig;
use crate::net::connection::ConnectionId;
use crate::net::defer::defer;
use crate::net::pipe::{Pipe, ReadOutcome};
use crate::net::NetError;
use crate::observability::hook::{self, TraceEvent, TraceHook};

/// Per-side socket options.
#[derive(Debug, Clone, Default)]
pub struct SocketOptions {
    /// Keep the write side open after the peer finished writing.
    pub allow_half_open: bool,
    /// Receives every notification this socket raises.
    pub trace: Option<TraceHook>,
}

impl SocketOptions {
    pub fn allow_half_open(mut self, allow: bool) -> Self {
        self.allow_half_open = allow;
        self
    }

    pub fn trace_hook(mut self, hook: TraceHook) -> Self {
        self.trace = Some(hook);
        self
    }
}

impl From<&SocketConfig> for SocketOptions {
    fn from(config: &SocketConfig) -> Self {
        Self {
            allow_half_open: config.allow_half_open,
            trace: None,
        }
    }
}

type CloseObserver = Box<dyn FnOnce() + Send>;

#[derive(Default)]
struct SideState {
    read_ended: bool,
    write_finished: bool,
    closed: bool,
    failure: Option<NetError>,
    remote_port: Option<u16>,
    bytes_written: u64,
    observers: Vec<CloseObserver>,
}

impl SideState {
    /// Transition to closed when both directions are done.
    fn settle(&mut self) -> Option<Vec<CloseObserver>> {
        if !self.closed && self.read_ended && self.write_finished {
            self.closed = true;
            Some(mem::take(&mut self.observers))
        } else {
            None
        }
    }
}

/// State shared between a [`HalfSocket`] and the server tracking it.
pub(crate) struct SocketCore {
    name: &'static str,
    id: ConnectionId,
    allow_half_open: bool,
    inbound: Arc<Pipe>,
    outbound: Arc<Pipe>,
    state: Mutex<SideState>,
    closed_tx: watch::Sender<bool>,
    trace: Option<TraceHook>,
}

impl SocketCore {
    fn new(
        name: &'static str,
        id: ConnectionId,
        options: SocketOptions,
        inbound: Arc<Pipe>,
        outbound: Arc<Pipe>,
    ) -> Self {
        let (closed_tx, _) = watch::channel(false);
        Self {
            name,
            id,
            allow_half_open: options.allow_half_open,
            inbound,
            outbound,
            state: Mutex::new(SideState::default()),
            closed_tx,
            trace: options.trace,
        }
    }

    fn record(&self, event: &'static str, detail: Option<String>) {
        let mut trace = TraceEvent::new(self.name, self.id, event);
        trace.detail = detail;
        hook::record(self.trace.as_ref(), trace);
    }

    pub(crate) fn set_remote_port(&self, port: u16) {
        self.state.lock().remote_port = Some(port);
    }

    /// Fail the connection: reads and writes return `err`, then close.
    pub(crate) fn fail(&self, err: NetError) {
        self.record("error", Some(err.to_string()));
        self.state.lock().failure.get_or_insert_with(|| err.clone());
        self.inbound.fail(err);
        self.destroy();
    }

    /// Finish the write side. Idempotent.
    pub(crate) fn end_write(&self) {
        let observers = {
            let mut state = self.state.lock();
            if state.write_finished {
                return;
            }
            state.write_finished = true;
            self.outbound.finish();
            state.settle()
        };
        self.record("finish", None);
        self.notify_closed(observers);
    }

    /// Mark the read side ended. Returns whether the write side still has to
    /// be finished because half-open connections are not allowed.
    fn on_read_eof(&self) -> bool {
        let (auto_finish, observers) = {
            let mut state = self.state.lock();
            if state.read_ended {
                return false;
            }
            state.read_ended = true;
            let auto_finish = !self.allow_half_open && !state.write_finished;
            (auto_finish, state.settle())
        };
        self.record("end", None);
        self.notify_closed(observers);
        auto_finish
    }

    /// Tear the socket down: FIN to the peer and close now.
    pub(crate) fn destroy(&self) {
        let observers = {
            let mut state = self.state.lock();
            if state.closed {
                return;
            }
            state.read_ended = true;
            state.write_finished = true;
            self.outbound.finish();
            state.settle()
        };
        self.notify_closed(observers);
    }

    fn notify_closed(&self, observers: Option<Vec<CloseObserver>>) {
        let Some(observers) = observers else {
            return;
        };
        self.record("close", None);
        self.closed_tx.send_replace(true);
        for observer in observers {
            observer();
        }
    }

    /// Run `observer` once this socket closes (immediately if it already has).
    pub(crate) fn on_close(&self, observer: CloseObserver) {
        let run_now = {
            let mut state = self.state.lock();
            if state.closed {
                Some(observer)
            } else {
                state.observers.push(observer);
                None
            }
        };
        if let Some(observer) = run_now {
            observer();
        }
    }

    fn write(&self, buf: &[u8]) -> io::Result<usize> {
        {
            let mut state = self.state.lock();
            if let Some(err) = &state.failure {
                return Err(err.clone().into());
            }
            if state.write_finished {
                return Err(io::Error::new(io::ErrorKind::BrokenPipe, "write after end"));
            }
            state.bytes_written += buf.len() as u64;
            self.outbound.push(Bytes::copy_from_slice(buf));
        }
        self.record("transmitted", Some(buf.len().to_string()));
        Ok(buf.len())
    }

    fn failure(&self) -> Option<NetError> {
        self.state.lock().failure.clone()
    }

    fn is_closed(&self) -> bool {
        self.state.lock().closed
    }
}

impl fmt::Debug for SocketCore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock();
        f.debug_struct("SocketCore")
            .field("name", &self.name)
            .field("id", &self.id)
            .field("read_ended", &state.read_ended)
            .field("write_finished", &state.write_finished)
            .field("closed", &state.closed)
            .finish()
    }
}

/// One endpoint of a [`MockSocket`].
///
/// Implements [`AsyncRead`] and [`AsyncWrite`]; writes never block and are
/// delivered to the peer's read buffer unchanged. Dropping a half-socket
/// destroys it.
pub struct HalfSocket {
    core: Arc<SocketCore>,
}

impl HalfSocket {
    fn from_core(core: SocketCore) -> Self {
        Self {
            core: Arc::new(core),
        }
    }

    pub(crate) fn core(&self) -> &Arc<SocketCore> {
        &self.core
    }

    /// Debug label: `"client"` or `"server"`.
    pub fn name(&self) -> &'static str {
        self.core.name
    }

    pub fn id(&self) -> ConnectionId {
        self.core.id
    }

    pub fn allow_half_open(&self) -> bool {
        self.core.allow_half_open
    }

    /// Port of the server this socket is connected to.
    pub fn remote_port(&self) -> Option<u16> {
        self.core.state.lock().remote_port
    }

    /// Resolves on the next scheduler turn with the connection outcome.
    pub async fn connected(&self) -> Result<(), NetError> {
        tokio::task::yield_now().await;
        match self.core.failure() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// Wait until the socket has closed.
    pub async fn closed(&self) {
        let mut rx = self.core.closed_tx.subscribe();
        let _ = rx.wait_for(|closed| *closed).await;
    }

    pub fn is_closed(&self) -> bool {
        self.core.is_closed()
    }

    pub fn is_read_ended(&self) -> bool {
        self.core.state.lock().read_ended
    }

    pub fn is_write_finished(&self) -> bool {
        self.core.state.lock().write_finished
    }

    /// Finish the write side without going through [`AsyncWriteExt::shutdown`](tokio::io::AsyncWriteExt::shutdown).
    pub fn end(&self) {
        self.core.end_write();
    }

    /// Close both directions immediately.
    pub fn destroy(self) {
        drop(self);
    }

    /// Bytes received but not yet read.
    pub fn buffered_len(&self) -> usize {
        self.core.inbound.buffered()
    }

    /// Total bytes transmitted to the peer.
    pub fn bytes_written(&self) -> u64 {
        self.core.state.lock().bytes_written
    }

    /// Whether the peer has finished writing.
    pub fn peer_finished(&self) -> bool {
        self.core.inbound.is_finished()
    }
}

impl fmt::Debug for HalfSocket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("HalfSocket").field(&self.core).finish()
    }
}

impl Drop for HalfSocket {
    fn drop(&mut self) {
        self.core.destroy();
    }
}

impl AsyncRead for HalfSocket {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        if ready!(self.core.inbound.poll_read(cx, buf))? == ReadOutcome::Eof
            && self.core.on_read_eof()
        {
            // Writes issued in the same turn still reach the peer.
            let core = Arc::clone(&self.core);
            defer(move || core.end_write());
        }
        Poll::Ready(Ok(()))
    }
}

impl AsyncWrite for HalfSocket {
    fn poll_write(
        self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Poll::Ready(self.core.write(buf))
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        self.core.end_write();
        Poll::Ready(Ok(()))
    }
}

/// Two cross-wired [`HalfSocket`]s simulating one TCP connection.
#[derive(Debug)]
pub struct MockSocket {
    pub client: HalfSocket,
    pub server: HalfSocket,
}

impl MockSocket {
    pub fn new(client: SocketOptions, server: SocketOptions) -> Self {
        let id = ConnectionId::new();
        let to_server = Arc::new(Pipe::new());
        let to_client = Arc::new(Pipe::new());

        let client = HalfSocket::from_core(SocketCore::new(
            "client",
            id,
            client,
            Arc::clone(&to_client),
            Arc::clone(&to_server),
        ));
        let server = HalfSocket::from_core(SocketCore::new(
            "server", id, server, to_server, to_client,
        ));

        tracing::trace!(connection_id = %id, "Mock socket created");
        Self { client, server }
    }

    /// A pair with default options on both sides.
    pub fn pair() -> Self {
        Self::new(SocketOptions::default(), SocketOptions::default())
    }

    pub fn into_split(self) -> (HalfSocket, HalfSocket) {
        (self.client, self.server)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[tokio::test]
    async fn bytes_cross_the_wire_in_order() {
        let (mut client, mut server) = MockSocket::pair().into_split();
        client.write_all(b"one ").await.unwrap();
        client.write_all(b"two ").await.unwrap();
        client.write_all(b"three").await.unwrap();
        client.shutdown().await.unwrap();

        let mut received = Vec::new();
        server.read_to_end(&mut received).await.unwrap();
        assert_eq!(received, b"one two three");
        assert_eq!(client.bytes_written(), 13);
    }

    #[tokio::test]
    async fn names_and_shared_id() {
        let socket = MockSocket::pair();
        assert_eq!(socket.client.name(), "client");
        assert_eq!(socket.server.name(), "server");
        assert_eq!(socket.client.id(), socket.server.id());
    }

    #[tokio::test]
    async fn fin_without_half_open_closes_both() {
        let (mut client, mut server) = MockSocket::pair().into_split();
        client.shutdown().await.unwrap();
        assert!(server.peer_finished());
        assert!(!client.is_closed());

        let mut buf = Vec::new();
        server.read_to_end(&mut buf).await.unwrap();
        assert!(server.is_read_ended());
        assert!(!server.is_write_finished());

        server.closed().await;
        assert!(server.is_write_finished());

        client.read_to_end(&mut buf).await.unwrap();
        client.closed().await;
        assert!(client.is_closed());
    }

    #[tokio::test]
    async fn half_open_side_keeps_writing() {
        let (mut client, mut server) = MockSocket::new(
            SocketOptions::default(),
            SocketOptions::default().allow_half_open(true),
        )
        .into_split();

        client.write_all(b"request").await.unwrap();
        client.shutdown().await.unwrap();

        let mut request = Vec::new();
        server.read_to_end(&mut request).await.unwrap();
        assert_eq!(request, b"request");
        assert!(!server.is_write_finished());

        server.write_all(b"response").await.unwrap();
        server.shutdown().await.unwrap();
        assert!(server.is_closed());

        let mut response = Vec::new();
        client.read_to_end(&mut response).await.unwrap();
        assert_eq!(response, b"response");
        assert!(client.is_closed());
    }

    #[tokio::test]
    async fn reply_in_same_turn_as_eof_is_delivered() {
        let (mut client, mut server) = MockSocket::pair().into_split();
        client.write_all(b"ping").await.unwrap();
        client.shutdown().await.unwrap();

        let mut request = Vec::new();
        server.read_to_end(&mut request).await.unwrap();
        server.write_all(b"pong").await.unwrap();

        let mut reply = Vec::new();
        client.read_to_end(&mut reply).await.unwrap();
        assert_eq!(reply, b"pong");
        server.closed().await;
    }

    #[tokio::test]
    async fn write_after_end_is_broken_pipe() {
        let (mut client, _server) = MockSocket::pair().into_split();
        client.end();
        let err = client.write_all(b"late").await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::BrokenPipe);
    }

    #[tokio::test]
    async fn drop_sends_fin_to_peer() {
        let (client, mut server) = MockSocket::pair().into_split();
        client.destroy();
        let mut buf = Vec::new();
        assert_eq!(server.read_to_end(&mut buf).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn close_observers_run_once() {
        let (client, server) = MockSocket::pair().into_split();
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        server
            .core()
            .on_close(Box::new(move || {
                counter.fetch_add(1, Ordering::SeqCst);
            }));

        server.core().destroy();
        server.core().destroy();
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        let counter = Arc::clone(&calls);
        server
            .core()
            .on_close(Box::new(move || {
                counter.fetch_add(1, Ordering::SeqCst);
            }));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        drop(client);
    }

    #[tokio::test]
    async fn failed_socket_errors_reads_and_writes() {
        let (mut client, _server) = MockSocket::pair().into_split();
        client.core().fail(NetError::ConnectionRefused { port: 7 });

        let err = client.connected().await.unwrap_err();
        assert_eq!(err.code(), "ECONNREFUSED");
        assert!(client.is_closed());

        let mut buf = [0u8; 4];
        let read = client.read(&mut buf).await.unwrap_err();
        assert_eq!(read.kind(), io::ErrorKind::ConnectionRefused);
        let write = client.write(b"x").await.unwrap_err();
        assert_eq!(write.kind(), io::ErrorKind::ConnectionRefused);
    }

    #[tokio::test]
    async fn trace_hook_sees_transmit_and_close() {
        let events = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&events);
        let hook = TraceHook::new(move |e| sink.lock().push(e.event));
        let (mut client, server) = MockSocket::new(
            SocketOptions::default().trace_hook(hook),
            SocketOptions::default(),
        )
        .into_split();

        client.write_all(b"hi").await.unwrap();
        client.shutdown().await.unwrap();
        drop(server);
        let mut buf = Vec::new();
        client.read_to_end(&mut buf).await.unwrap();

        let events = events.lock();
        assert_eq!(*events, vec!["transmitted", "finish", "end", "close"]);
    }
}

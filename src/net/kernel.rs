//! Port registry.
//!
//! The in-process stand-in for the bit of an OS kernel that maps port numbers
//! to listening endpoints. Each [`Kernel`] is an independent namespace;
//! [`Kernel::global`] is the shared default used when no kernel is injected.

use std::collections::BTreeMap;
use std::sync::{Arc, LazyLock, Weak};

use parking_lot::Mutex;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;

use crate::config::KernelConfig;
use crate::net::server::{Server, ServerInner};
use crate::net::NetError;

/// First port handed out when a caller asks for any free port.
pub const FIRST_PORT: u16 = 1024;

static GLOBAL: LazyLock<Kernel> = LazyLock::new(Kernel::new);

/// A registry of listening servers keyed by port.
#[derive(Debug, Clone)]
pub struct Kernel {
    state: Arc<Mutex<KernelState>>,
    first_port: u16,
}

#[derive(Debug, Default)]
struct KernelState {
    ports: BTreeMap<u16, Binding>,
    next_lease: u64,
    keepalive: Option<KeepAlive>,
}

#[derive(Debug)]
struct Binding {
    server: Weak<ServerInner>,
    lease: u64,
}

impl Binding {
    fn is_live(&self) -> bool {
        self.server.strong_count() > 0
    }
}

impl KernelState {
    fn is_bound(&self, port: u16) -> bool {
        self.ports.get(&port).is_some_and(Binding::is_live)
    }

    fn live_count(&self) -> usize {
        self.ports.values().filter(|b| b.is_live()).count()
    }
}

impl Kernel {
    pub fn new() -> Self {
        Self::with_first_port(FIRST_PORT)
    }

    /// A kernel that allocates free ports starting at `first_port`.
    pub fn with_first_port(first_port: u16) -> Self {
        Self {
            state: Arc::new(Mutex::new(KernelState::default())),
            first_port: first_port.max(1),
        }
    }

    pub fn from_config(config: &KernelConfig) -> Self {
        Self::with_first_port(config.first_port)
    }

    /// The process-wide default kernel.
    pub fn global() -> Kernel {
        GLOBAL.clone()
    }

    /// Register `server` on `port`, or on the lowest free port at or above
    /// the first port when `port` is 0.
    ///
    /// The mapping lives as long as the returned [`PortLease`].
    pub fn open(&self, port: u16, server: &Server) -> Result<PortLease, NetError> {
        let mut state = self.state.lock();

        let port = if port == 0 {
            (self.first_port..=u16::MAX)
                .find(|p| !state.is_bound(*p))
                .ok_or(NetError::PortsExhausted {
                    first_port: self.first_port,
                })?
        } else if state.is_bound(port) {
            return Err(NetError::AddressInUse { port });
        } else {
            port
        };

        state.next_lease += 1;
        let lease = state.next_lease;
        state.ports.insert(
            port,
            Binding {
                server: Arc::downgrade(server.inner()),
                lease,
            },
        );
        if state.keepalive.is_none() {
            state.keepalive = Some(KeepAlive::start());
        }

        tracing::debug!(port, active = state.live_count(), "Port opened");
        Ok(PortLease {
            kernel: self.clone(),
            port,
            lease,
        })
    }

    /// Find the server listening on `port`.
    pub fn lookup(&self, port: u16) -> Option<Server> {
        let inner = self
            .state
            .lock()
            .ports
            .get(&port)
            .and_then(|b| b.server.upgrade());
        inner.map(Server::from_inner)
    }

    /// Number of ports whose server is still alive.
    pub fn active_count(&self) -> usize {
        self.state.lock().live_count()
    }

    /// Whether the keep-alive task is held.
    pub fn is_kept_alive(&self) -> bool {
        self.state.lock().keepalive.is_some()
    }

    pub fn first_port(&self) -> u16 {
        self.first_port
    }

    fn release(&self, port: u16, lease: u64) {
        let keepalive = {
            let mut state = self.state.lock();
            if state.ports.get(&port).is_some_and(|b| b.lease == lease) {
                state.ports.remove(&port);
            }
            let active = state.live_count();
            tracing::debug!(port, active, "Port released");
            if active == 0 {
                state.keepalive.take()
            } else {
                None
            }
        };
        drop(keepalive);
    }
}

impl Default for Kernel {
    fn default() -> Self {
        Self::new()
    }
}

/// Ownership of a port mapping. Dropping it frees the port.
#[derive(Debug)]
pub struct PortLease {
    kernel: Kernel,
    port: u16,
    lease: u64,
}

impl PortLease {
    pub fn port(&self) -> u16 {
        self.port
    }
}

impl Drop for PortLease {
    fn drop(&mut self) {
        self.kernel.release(self.port, self.lease);
    }
}

/// Parked task held while any port is open.
///
/// It shows up in the runtime's alive-task count but does not extend the
/// runtime's life: a tokio runtime still shuts down when `main` returns.
#[derive(Debug)]
struct KeepAlive(Option<JoinHandle<()>>);

impl KeepAlive {
    fn start() -> Self {
        let task = Handle::try_current()
            .ok()
            .map(|rt| rt.spawn(std::future::pending::<()>()));
        Self(task)
    }
}

impl Drop for KeepAlive {
    fn drop(&mut self) {
        if let Some(task) = self.0.take() {
            task.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn endpoint(kernel: &Kernel) -> Server {
        Server::builder().kernel(kernel.clone()).build()
    }

    #[test]
    fn allocates_lowest_free_port() {
        let kernel = Kernel::new();
        let a = endpoint(&kernel);
        let b = endpoint(&kernel);

        let first = kernel.open(0, &a).unwrap();
        let second = kernel.open(0, &b).unwrap();
        assert_eq!(first.port(), 1024);
        assert_eq!(second.port(), 1025);

        drop(first);
        let c = endpoint(&kernel);
        let reused = kernel.open(0, &c).unwrap();
        assert_eq!(reused.port(), 1024);
    }

    #[test]
    fn conflict_leaves_mapping_untouched() {
        let kernel = Kernel::new();
        let owner = endpoint(&kernel);
        let intruder = endpoint(&kernel);

        let _lease = kernel.open(8000, &owner).unwrap();
        let err = kernel.open(8000, &intruder).unwrap_err();
        assert_eq!(err, NetError::AddressInUse { port: 8000 });
        assert_eq!(err.code(), "EADDRINUSE");

        let found = kernel.lookup(8000).unwrap();
        assert!(found.ptr_eq(&owner));
        assert_eq!(kernel.active_count(), 1);
    }

    #[test]
    fn explicit_ports_are_taken_verbatim() {
        let kernel = Kernel::new();
        let server = endpoint(&kernel);
        let lease = kernel.open(1, &server).unwrap();
        assert_eq!(lease.port(), 1);
        assert!(kernel.lookup(1).is_some());
    }

    #[test]
    fn dropping_lease_frees_port() {
        let kernel = Kernel::new();
        let server = endpoint(&kernel);
        let lease = kernel.open(5000, &server).unwrap();
        assert_eq!(kernel.active_count(), 1);

        drop(lease);
        assert!(kernel.lookup(5000).is_none());
        assert_eq!(kernel.active_count(), 0);
    }

    #[test]
    fn dead_server_does_not_hold_port() {
        let kernel = Kernel::new();
        let server = endpoint(&kernel);
        let lease = kernel.open(6000, &server).unwrap();
        drop(server);
        assert!(kernel.lookup(6000).is_none());
        assert_eq!(kernel.active_count(), 0);

        let other = endpoint(&kernel);
        let _second = kernel.open(6000, &other).unwrap();
        drop(lease);
        assert!(kernel.lookup(6000).unwrap().ptr_eq(&other));
    }

    #[test]
    fn custom_first_port() {
        let kernel = Kernel::with_first_port(40000);
        let server = endpoint(&kernel);
        assert_eq!(kernel.open(0, &server).unwrap().port(), 40000);
    }

    #[test]
    fn exhaustion_is_reported() {
        let kernel = Kernel::with_first_port(u16::MAX);
        let a = endpoint(&kernel);
        let b = endpoint(&kernel);
        let _lease = kernel.open(0, &a).unwrap();
        let err = kernel.open(0, &b).unwrap_err();
        assert_eq!(err.code(), "EADDRNOTAVAIL");
    }

    #[tokio::test]
    async fn keepalive_follows_active_count() {
        let kernel = Kernel::new();
        let a = endpoint(&kernel);
        let b = endpoint(&kernel);
        assert!(!kernel.is_kept_alive());

        let first = kernel.open(0, &a).unwrap();
        let second = kernel.open(0, &b).unwrap();
        assert!(kernel.is_kept_alive());

        drop(first);
        assert!(kernel.is_kept_alive());
        drop(second);
        assert!(!kernel.is_kept_alive());
    }

    #[tokio::test]
    async fn keepalive_released_when_only_dead_bindings_remain() {
        let kernel = Kernel::new();
        let a = endpoint(&kernel);
        let b = endpoint(&kernel);
        let stale = kernel.open(0, &a).unwrap();
        let live = kernel.open(0, &b).unwrap();

        drop(a);
        assert_eq!(kernel.active_count(), 1);
        drop(live);
        assert_eq!(kernel.active_count(), 0);
        assert!(!kernel.is_kept_alive());
        drop(stale);
    }

    #[test]
    fn kernels_are_isolated() {
        let one = Kernel::new();
        let two = Kernel::new();
        let a = endpoint(&one);
        let b = endpoint(&two);
        let _l1 = one.open(7000, &a).unwrap();
        let _l2 = two.open(7000, &b).unwrap();
        assert!(one.lookup(7000).unwrap().ptr_eq(&a));
        assert!(two.lookup(7000).unwrap().ptr_eq(&b));
    }
}

//! Mock network subsystem.
//!
//! # Data Flow
//! ```text
//! connect(port)
//!     → kernel.rs (port → server lookup)
//!     → socket.rs (new MockSocket: client half + server half)
//!     → server.rs (add_client: handler or Connection event)
//!     → pipe.rs (bytes and FIN cross between the halves)
//!
//! Server States:
//!     Unbound → Listening → Draining → Closed
//! ```
//!
//! # Design Decisions
//! - The kernel is an injectable value; `Kernel::global()` is only the default
//! - Notifications are queued or deferred to the next scheduler turn
//! - Buffering is unbounded; there is no backpressure

pub mod connect;
pub mod connection;
pub(crate) mod defer;
pub mod error;
pub mod kernel;
pub(crate) mod pipe;
pub mod server;
pub mod socket;

pub use connect::{connect, ConnectOptions};
pub use connection::ConnectionId;
pub use error::NetError;
pub use kernel::{Kernel, PortLease, FIRST_PORT};
pub use server::{
    ConnectionHandler, Lifecycle, ListenOptions, MockAddr, Server, ServerBuilder, ServerEvent,
};
pub use socket::{HalfSocket, MockSocket, SocketOptions};

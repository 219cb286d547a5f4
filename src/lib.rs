//! In-process mock network.
//!
//! Listen/connect semantics, half-closable duplex sockets and TLS, without a
//! real network stack.

pub mod config;
pub mod net;
pub mod observability;
pub mod tls;

pub use config::MockNetConfig;
pub use net::{
    connect, ConnectOptions, HalfSocket, Kernel, Lifecycle, MockSocket, NetError, Server,
    ServerEvent, SocketOptions,
};
pub use tls::{CertificateAuthority, MockTlsServer, TlsError};

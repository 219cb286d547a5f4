//! TLS layer on top of the mock network.
//!
//! # Data Flow
//! ```text
//! CertificateAuthority::issue (ca.rs)
//!     → PEM certificate + key + issuer certificate
//!     → pem.rs (rustls ServerConfig / ClientConfig)
//!
//! MockTlsServer (server.rs)
//!     → plain Server accepts HalfSocket
//!     → TlsAcceptor handshake task
//!     → secure connection handler or accept queue
//!
//! tls::connect (connect.rs)
//!     → trust anchor: explicit CA or the target server's issuer certificate
//!     → plain connect → TlsConnector handshake
//! ```
//!
//! # Design Decisions
//! - All cryptography is delegated to rustls with the ring provider
//! - No system trust store; the mock server publishes its issuer certificate

pub mod ca;
pub mod connect;
pub mod error;
pub mod pem;
pub mod server;

pub use crate::net::connect::connect as plain_connect;
pub use ca::{CertOptions, CertificateAuthority, IssuedCertificate, DEFAULT_AUTHORITY_SUBJECT};
pub use connect::{connect, Connecting, TlsConnectOptions};
pub use error::TlsError;
pub use server::{MockTlsServer, MockTlsServerBuilder, SecureConnectionHandler};

//! Network error definitions.

use std::io;

use thiserror::Error;

/// Errors raised by the mock network.
///
/// Every variant carries a machine-readable [`code`](NetError::code) matching
/// the codes a real socket layer would report.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum NetError {
    /// The requested port is already bound to another server.
    #[error("Address already in use: mock:{port}")]
    AddressInUse { port: u16 },

    /// `listen` was called on a server that is already bound.
    #[error("Server already listening")]
    AlreadyListening,

    /// No server is listening on the target port.
    #[error("connect ECONNREFUSED {port}")]
    ConnectionRefused { port: u16 },

    /// The server is not accepting connections.
    #[error("Server not listening")]
    NotListening,

    /// The port is not usable as a connection target.
    #[error("Invalid port: {0}")]
    InvalidPort(u16),

    /// Every port at or above the first allocatable port is taken.
    #[error("No free port at or above {first_port}")]
    PortsExhausted { first_port: u16 },
}

impl NetError {
    /// Machine-readable error code.
    pub fn code(&self) -> &'static str {
        match self {
            NetError::AddressInUse { .. } => "EADDRINUSE",
            NetError::AlreadyListening => "ERR_SERVER_ALREADY_LISTEN",
            NetError::ConnectionRefused { .. } => "ECONNREFUSED",
            NetError::NotListening => "ERR_SERVER_NOT_RUNNING",
            NetError::InvalidPort(_) => "ERR_INVALID_PORT",
            NetError::PortsExhausted { .. } => "EADDRNOTAVAIL",
        }
    }

    /// The port involved in the failure, if any.
    pub fn port(&self) -> Option<u16> {
        match self {
            NetError::AddressInUse { port } | NetError::ConnectionRefused { port } => Some(*port),
            NetError::InvalidPort(port) => Some(*port),
            _ => None,
        }
    }

    /// Closest standard I/O error kind.
    pub fn kind(&self) -> io::ErrorKind {
        match self {
            NetError::AddressInUse { .. } => io::ErrorKind::AddrInUse,
            NetError::ConnectionRefused { .. } => io::ErrorKind::ConnectionRefused,
            NetError::NotListening => io::ErrorKind::NotConnected,
            NetError::InvalidPort(_) => io::ErrorKind::InvalidInput,
            NetError::PortsExhausted { .. } => io::ErrorKind::AddrNotAvailable,
            NetError::AlreadyListening => io::ErrorKind::Other,
        }
    }
}

impl From<NetError> for io::Error {
    fn from(err: NetError) -> Self {
        io::Error::new(err.kind(), err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_match_socket_layer() {
        assert_eq!(NetError::AddressInUse { port: 8000 }.code(), "EADDRINUSE");
        assert_eq!(NetError::AlreadyListening.code(), "ERR_SERVER_ALREADY_LISTEN");
        assert_eq!(NetError::ConnectionRefused { port: 1 }.code(), "ECONNREFUSED");
    }

    #[test]
    fn io_error_keeps_source() {
        let err: io::Error = NetError::ConnectionRefused { port: 4000 }.into();
        assert_eq!(err.kind(), io::ErrorKind::ConnectionRefused);
        let inner = err
            .get_ref()
            .and_then(|e| e.downcast_ref::<NetError>())
            .cloned();
        assert_eq!(inner, Some(NetError::ConnectionRefused { port: 4000 }));
        assert_eq!(err.to_string(), "connect ECONNREFUSED 4000");
    }
}

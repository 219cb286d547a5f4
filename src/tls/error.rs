//! TLS layer error definitions.

use std::io;

use thiserror::Error;

use crate::net::NetError;

/// Errors raised while issuing certificates or setting up TLS.
#[derive(Debug, Error)]
pub enum TlsError {
    #[error("Certificate generation failed: {0}")]
    Certificate(#[from] rcgen::Error),

    #[error("TLS configuration failed: {0}")]
    Rustls(#[from] rustls::Error),

    #[error(transparent)]
    Net(#[from] NetError),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Neither a subject nor any name was given for a certificate.
    #[error("Certificate needs a subject or at least one name")]
    MissingSubject,

    #[error("Invalid subject: {0}")]
    InvalidSubject(String),

    #[error("Certificate validity ends before it starts")]
    InvalidValidity,

    #[error("No certificate found in PEM input")]
    MissingCertificate,

    #[error("No private key found in PEM input")]
    MissingPrivateKey,

    #[error("Invalid server name: {0}")]
    InvalidServerName(String),

    /// No CA was supplied and the server on the port does not publish one.
    #[error("No trust anchor for mock:{port}")]
    NoTrustAnchor { port: u16 },
}

impl TlsError {
    /// The network error code, when the failure came from the mock network.
    pub fn code(&self) -> Option<&'static str> {
        match self {
            TlsError::Net(err) => Some(err.code()),
            _ => None,
        }
    }
}

//! Configuration schema definitions.
//!
//! Every section and field has a default, so an empty file is a valid
//! configuration. All types derive Serde traits for deserialization from
//! TOML.

use serde::{Deserialize, Serialize};

use crate::observability::hook::TraceHook;

/// Root configuration for the mock network.
#[derive(Debug, Clone, Deserialize, Serialize, Default, PartialEq, Eq)]
#[serde(default)]
pub struct MockNetConfig {
    /// Port registry settings.
    pub kernel: KernelConfig,

    /// Defaults for sockets created by servers and clients.
    pub socket: SocketConfig,

    /// Certificate authority used by TLS servers.
    pub certificate: CertificateConfig,

    /// Logging settings.
    pub logging: LoggingConfig,
}

/// Port registry configuration.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
#[serde(default)]
pub struct KernelConfig {
    /// First port handed out when a server listens on port 0.
    pub first_port: u16,
}

impl Default for KernelConfig {
    fn default() -> Self {
        Self {
            first_port: crate::net::FIRST_PORT,
        }
    }
}

/// Socket defaults.
#[derive(Debug, Clone, Deserialize, Serialize, Default, PartialEq, Eq)]
#[serde(default)]
pub struct SocketConfig {
    /// Keep the write side open after the peer finished writing.
    pub allow_half_open: bool,
}

/// Certificate authority configuration.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
#[serde(default)]
pub struct CertificateConfig {
    /// Subject of the self-signed authority, in `K=V/K=V` form.
    pub authority_subject: String,

    /// Subject of issued server certificates. Derived from the first name
    /// when unset.
    pub subject: Option<String>,

    /// DNS names placed in issued certificates.
    pub names: Vec<String>,

    /// Lifetime of issued certificates.
    pub validity_secs: u64,

    /// How far `not_before` is moved into the past.
    pub backdate_secs: u64,
}

impl Default for CertificateConfig {
    fn default() -> Self {
        Self {
            authority_subject: crate::tls::ca::DEFAULT_AUTHORITY_SUBJECT.to_string(),
            subject: None,
            names: vec!["localhost".to_string()],
            validity_secs: 300,
            backdate_secs: 1,
        }
    }
}

/// Logging configuration.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
#[serde(default)]
pub struct LoggingConfig {
    /// `EnvFilter` directive used when `RUST_LOG` is not set.
    pub filter: String,

    /// Forward every socket and server notification to the log.
    pub trace_events: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            filter: "mocknet=info".to_string(),
            trace_events: false,
        }
    }
}

impl LoggingConfig {
    /// The logging trace hook when `trace_events` is enabled.
    pub fn trace_hook(&self) -> Option<TraceHook> {
        self.trace_events.then(TraceHook::logging)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_document_uses_defaults() {
        let config: MockNetConfig = toml::from_str("").unwrap();
        assert_eq!(config, MockNetConfig::default());
        assert_eq!(config.kernel.first_port, 1024);
        assert!(!config.socket.allow_half_open);
        assert_eq!(config.certificate.names, vec!["localhost"]);
        assert_eq!(config.certificate.validity_secs, 300);
        assert_eq!(config.logging.filter, "mocknet=info");
    }

    #[test]
    fn test_partial_sections() {
        let config: MockNetConfig = toml::from_str(
            r#"
            [socket]
            allow_half_open = true

            [certificate]
            names = ["example.test", "localhost"]
            "#,
        )
        .unwrap();
        assert!(config.socket.allow_half_open);
        assert_eq!(config.certificate.names.len(), 2);
        assert_eq!(config.certificate.backdate_secs, 1);
    }

    #[test]
    fn test_trace_hook_follows_flag() {
        let mut logging = LoggingConfig::default();
        assert!(logging.trace_hook().is_none());
        logging.trace_events = true;
        assert!(logging.trace_hook().is_some());
    }
}

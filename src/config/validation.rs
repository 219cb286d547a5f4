//! Configuration validation.
//!
//! # Responsibilities
//! - Semantic validation (serde handles syntactic)
//! - Validate value ranges (first port, certificate lifetime)
//! - Check that certificate subjects parse
//!
//! # Design Decisions
//! - Returns all validation errors, not just first
//! - Validation is pure function: MockNetConfig → Result<(), Vec<ValidationError>>

use crate::config::schema::MockNetConfig;
use crate::tls::ca::parse_subject;

/// A single semantic problem in a configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationError {
    /// Dotted path of the offending field, e.g. `kernel.first_port`.
    pub field: &'static str,
    pub message: String,
}

impl ValidationError {
    fn new(field: &'static str, message: impl Into<String>) -> Self {
        Self {
            field,
            message: message.into(),
        }
    }
}

impl std::fmt::Display for ValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.field, self.message)
    }
}

impl std::error::Error for ValidationError {}

/// Check a parsed configuration, collecting every problem.
pub fn validate_config(config: &MockNetConfig) -> Result<(), Vec<ValidationError>> {
    let mut errors = Vec::new();

    if config.kernel.first_port == 0 {
        errors.push(ValidationError::new(
            "kernel.first_port",
            "must be greater than 0",
        ));
    }

    let cert = &config.certificate;
    if cert.validity_secs == 0 {
        errors.push(ValidationError::new(
            "certificate.validity_secs",
            "must be greater than 0",
        ));
    }
    if cert.subject.is_none() && cert.names.is_empty() {
        errors.push(ValidationError::new(
            "certificate.names",
            "at least one name is required when no subject is set",
        ));
    }
    if let Err(e) = parse_subject(&cert.authority_subject) {
        errors.push(ValidationError::new(
            "certificate.authority_subject",
            e.to_string(),
        ));
    }
    if let Some(subject) = &cert.subject {
        if let Err(e) = parse_subject(subject) {
            errors.push(ValidationError::new("certificate.subject", e.to_string()));
        }
    }

    if config.logging.filter.trim().is_empty() {
        errors.push(ValidationError::new("logging.filter", "must not be empty"));
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}

//! Configuration management subsystem.
//!
//! # Data Flow
//! ```text
//! config file (TOML)
//!     → loader.rs (parse & deserialize)
//!     → validation.rs (semantic checks)
//!     → MockNetConfig (validated, immutable)
//!     → Kernel::from_config, SocketOptions::from, CertificateAuthority::from_config
//! ```
//!
//! # Design Decisions
//! - All fields have defaults to allow minimal configs
//! - Validation separates syntactic (serde) from semantic checks

pub mod loader;
pub mod schema;
pub mod validation;

pub use loader::{load_config, parse_config, ConfigError};
pub use schema::CertificateConfig;
pub use schema::KernelConfig;
pub use schema::LoggingConfig;
pub use schema::MockNetConfig;
pub use schema::SocketConfig;
pub use validation::{validate_config, ValidationError};

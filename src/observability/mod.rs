//! Observability subsystem.
//!
//! # Data Flow
//! ```text
//! Sockets, servers, TLS wrappers produce:
//!     → tracing events at state transitions (opened, listening, closed)
//!     → hook.rs TraceEvent for every notification
//!
//! Consumers:
//!     → logging.rs (fmt subscriber on stdout)
//!     → a caller-supplied TraceHook (tests, debugging)
//! ```
//!
//! # Design Decisions
//! - The trace hook is passed at construction time, never patched in later
//! - Notifications always reach `tracing` at TRACE level

pub mod hook;
pub mod logging;

pub use hook::{TraceEvent, TraceHook};
pub use logging::init_logging;

//! Construction-time trace hook.
//!
//! Sockets and servers report every notification they raise through
//! [`record`]. The notification always goes to `tracing` at TRACE level, and
//! to the component's [`TraceHook`] when one was supplied in its options.

use std::fmt;
use std::sync::Arc;

/// A single notification raised by a mock component.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TraceEvent {
    /// Component kind: `"client"`, `"server"`, `"listener"` or `"tls"`.
    pub component: &'static str,
    /// Instance label, e.g. `conn-3` or `mock:4000`.
    pub label: String,
    /// Notification name, e.g. `transmitted`, `end`, `close`.
    pub event: &'static str,
    /// Optional payload summary.
    pub detail: Option<String>,
}

impl TraceEvent {
    pub fn new(component: &'static str, label: impl fmt::Display, event: &'static str) -> Self {
        Self {
            component,
            label: label.to_string(),
            event,
            detail: None,
        }
    }

    pub fn with_detail(mut self, detail: impl fmt::Display) -> Self {
        self.detail = Some(detail.to_string());
        self
    }
}

/// Callback invoked for each [`TraceEvent`].
#[derive(Clone)]
pub struct TraceHook(Arc<dyn Fn(&TraceEvent) + Send + Sync>);

impl TraceHook {
    pub fn new<F>(f: F) -> Self
    where
        F: Fn(&TraceEvent) + Send + Sync + 'static,
    {
        Self(Arc::new(f))
    }

    /// A hook that forwards every notification to `tracing` at DEBUG level.
    pub fn logging() -> Self {
        Self::new(|event| {
            tracing::debug!(
                component = event.component,
                label = %event.label,
                detail = event.detail.as_deref().unwrap_or(""),
                "{}",
                event.event
            );
        })
    }

    fn call(&self, event: &TraceEvent) {
        (self.0)(event)
    }
}

impl fmt::Debug for TraceHook {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("TraceHook(..)")
    }
}

/// Report a notification.
pub(crate) fn record(hook: Option<&TraceHook>, event: TraceEvent) {
    tracing::trace!(
        component = event.component,
        label = %event.label,
        detail = ?event.detail,
        "{}",
        event.event
    );
    if let Some(hook) = hook {
        hook.call(&event);
    }
}

//! Next-turn dispatch for user callbacks.

use tokio::runtime::Handle;

/// Run `f` as its own task on the current runtime, after the caller returns
/// to the scheduler. Without a runtime `f` runs inline.
pub(crate) fn defer<F>(f: F)
where
    F: FnOnce() + Send + 'static,
{
    match Handle::try_current() {
        Ok(handle) => {
            handle.spawn(async move { f() });
        }
        Err(_) => f(),
    }
}

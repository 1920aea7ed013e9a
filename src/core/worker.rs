//! Per-worker ambient state.
//!
//! The simulator runs each host's events on a single worker at a time. While
//! a host's event or trapped syscall is being serviced, that host is made
//! available through a thread-local so that code deep in the file/descriptor
//! layers (listener callbacks, timers) can reach the clock and the event
//! queue without threading `&Host` through every callback signature.

use std::cell::RefCell;

use crate::core::support::emulated_time::EmulatedTime;
use crate::host::host::Host;

thread_local! {
    // A stack, since dispatching a syscall from within an event task re-enters
    // the scope with the same host.
    static ACTIVE_HOST: RefCell<Vec<*const Host>> = const { RefCell::new(Vec::new()) };
}

/// Accessors for the worker's active host.
pub struct Worker;

// Removes the pushed host pointer even if the scoped closure panics.
struct ScopeGuard;

impl Drop for ScopeGuard {
    fn drop(&mut self) {
        ACTIVE_HOST.with(|stack| {
            stack.borrow_mut().pop();
        });
    }
}

impl Worker {
    /// Run `f` with the active host, if one is set.
    pub fn with_active_host<F, R>(f: F) -> Option<R>
    where
        F: FnOnce(&Host) -> R,
    {
        let ptr = ACTIVE_HOST.with(|stack| stack.borrow().last().copied())?;
        // SAFETY: the pointer was pushed by `set_active_host`, whose scope
        // guard guarantees the referenced host outlives this call.
        let host = unsafe { &*ptr };
        Some(f(host))
    }

    /// Make `host` the active host for the duration of `f`.
    pub fn set_active_host<F, R>(host: &Host, f: F) -> R
    where
        F: FnOnce() -> R,
    {
        ACTIVE_HOST.with(|stack| stack.borrow_mut().push(std::ptr::from_ref(host)));
        let _guard = ScopeGuard;
        f()
    }

    /// The active host's current simulated time.
    pub fn current_time() -> Option<EmulatedTime> {
        Self::with_active_host(|host| host.current_time())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_no_active_host() {
        assert!(Worker::with_active_host(|_| ()).is_none());
        assert!(Worker::current_time().is_none());
    }

    #[test]
    fn test_scoped_host() {
        let host = Host::new();
        Worker::set_active_host(&host, || {
            assert_eq!(
                Worker::current_time(),
                Some(EmulatedTime::SIMULATION_START)
            );
            // reentrant scope
            Worker::set_active_host(&host, || {
                assert!(Worker::with_active_host(|_| ()).is_some());
            });
        });
        assert!(Worker::with_active_host(|_| ()).is_none());
    }
}

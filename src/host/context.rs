//! Bundles of the current objects in the hierarchy.
//!
//! Syscall handlers take a [`ThreadContext`] argument and use it to reach
//! anything on the host. Passing the current objects around explicitly
//! (instead of keeping them in globals) lets a handler hold borrows from
//! several of them simultaneously, since Rust can borrow each public field
//! independently.

use std::sync::Arc;

use crate::host::host::Host;
use crate::host::process::Process;
use crate::host::thread::Thread;

/// Represents the "current" Host, Process, and Thread during a trapped
/// syscall. The process and thread are shared handles so that wake-up
/// callbacks can keep weak references back to them.
pub struct ThreadContext<'a> {
    pub host: &'a Host,
    pub process: &'a Arc<Process>,
    pub thread: &'a Arc<Thread>,
}

impl<'a> ThreadContext<'a> {
    pub fn new(host: &'a Host, process: &'a Arc<Process>, thread: &'a Arc<Thread>) -> Self {
        Self {
            host,
            process,
            thread,
        }
    }
}

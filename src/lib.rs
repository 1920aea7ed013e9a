//! The process virtualization layer of a discrete-event network simulator.
//!
//! An unmodified network application (the *plugin*) runs with its libc entry
//! points redirected into the simulator. Each trapped syscall is handed,
//! unchanged in its six-register form, to [`host::process::Process::dispatch_syscall`],
//! which either completes it immediately against simulated semantics or
//! blocks the calling thread until a simulated event (file readiness or a
//! timer) resumes it.
//!
//! The three main pieces:
//!
//! * [`host::memory_manager::MemoryManager`] owns the plugin's emulated
//!   address space: a shadow region set backed by a shared-memory file, with
//!   zero-copy views into plugin memory and full emulation of the
//!   memory-mapping syscall family.
//! * [`host::syscall::handler::SyscallHandler`] is the per-thread dispatch
//!   and blocking/timeout state machine.
//! * [`host::descriptor::CompatDescriptor`] bridges the legacy
//!   reference-counted descriptor objects and the newer reference-counted
//!   posix-file objects.

// the mman-family entry points mirror the syscall ABI, which runs to seven
// arguments
#![allow(clippy::too_many_arguments)]

// defines macros, so must be included first
#[macro_use]
pub mod utility;

pub mod core;
pub mod host;

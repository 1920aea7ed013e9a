use atomic_refcell::{AtomicRef, AtomicRefCell, AtomicRefMut};
use nix::errno::Errno;

use crate::host::host::HostId;
use crate::host::process::ProcessId;
use crate::host::syscall::condition::SyscallCondition;
use crate::host::syscall::handler::SyscallHandler;
use crate::host::syscall::types::{SyscallArgs, SyscallReg};

#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ThreadId(u32);

impl From<u32> for ThreadId {
    fn from(val: u32) -> Self {
        ThreadId(val)
    }
}

impl std::fmt::Display for ThreadId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A syscall invocation suspended until a simulated event. Held by the
/// thread while it is parked in the scheduler.
pub struct BlockedSyscall {
    pub args: SyscallArgs,
    pub condition: SyscallCondition,
}

/// A monitored thread. Owns the thread's syscall handler and its
/// blocked-syscall state; shared (via `Arc`) with the wake-up paths that
/// need to find it again.
pub struct Thread {
    id: ThreadId,
    process_id: ProcessId,
    syscall_handler: AtomicRefCell<SyscallHandler>,
    blocked: AtomicRefCell<Option<BlockedSyscall>>,
    // the completed result of the last blocked syscall, once it resolves
    unblocked_result: AtomicRefCell<Option<Result<SyscallReg, Errno>>>,
}

impl Thread {
    pub(crate) fn new(
        host_id: HostId,
        process_id: ProcessId,
        id: ThreadId,
        count_syscalls: bool,
    ) -> Self {
        Self {
            id,
            process_id,
            syscall_handler: AtomicRefCell::new(SyscallHandler::new(
                host_id,
                process_id,
                id,
                count_syscalls,
            )),
            blocked: AtomicRefCell::new(None),
            unblocked_result: AtomicRefCell::new(None),
        }
    }

    pub fn id(&self) -> ThreadId {
        self.id
    }

    pub fn process_id(&self) -> ProcessId {
        self.process_id
    }

    pub fn syscall_handler_borrow(&self) -> AtomicRef<SyscallHandler> {
        self.syscall_handler.borrow()
    }

    pub fn syscall_handler_borrow_mut(&self) -> AtomicRefMut<SyscallHandler> {
        self.syscall_handler.borrow_mut()
    }

    /// The condition of the currently blocked syscall, if one is blocked.
    /// Re-dispatched syscall handlers use this to recover state from the
    /// invocation that blocked (the active file, the deadline).
    pub fn syscall_condition(&self) -> Option<AtomicRef<SyscallCondition>> {
        let blocked = self.blocked.borrow();
        if blocked.is_none() {
            return None;
        }
        Some(AtomicRef::map(blocked, |b| &b.as_ref().unwrap().condition))
    }

    pub fn is_blocked(&self) -> bool {
        self.blocked.borrow().is_some()
    }

    /// The trap arguments of the currently blocked syscall.
    pub fn blocked_args(&self) -> Option<SyscallArgs> {
        self.blocked.borrow().as_ref().map(|b| b.args)
    }

    pub(crate) fn set_blocked(&self, args: SyscallArgs, condition: SyscallCondition) {
        *self.blocked.borrow_mut() = Some(BlockedSyscall { args, condition });
    }

    /// Clears the blocked state, dropping (and thereby disarming) the old
    /// condition.
    pub(crate) fn take_blocked(&self) -> Option<BlockedSyscall> {
        self.blocked.borrow_mut().take()
    }

    pub(crate) fn set_unblocked_result(&self, result: Result<SyscallReg, Errno>) {
        *self.unblocked_result.borrow_mut() = Some(result);
    }

    /// The result of the last blocked syscall that has since resolved, if
    /// it hasn't been collected yet. This is how the trap boundary picks up
    /// the return value of a syscall that completed while the thread was
    /// parked.
    pub fn take_unblocked_result(&self) -> Option<Result<SyscallReg, Errno>> {
        self.unblocked_result.borrow_mut().take()
    }
}

impl std::fmt::Debug for Thread {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Thread")
            .field("id", &self.id)
            .field("process_id", &self.process_id)
            .field("blocked", &self.is_blocked())
            .finish()
    }
}

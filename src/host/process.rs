use std::collections::BTreeMap;
use std::sync::Arc;

use atomic_refcell::{AtomicRef, AtomicRefCell, AtomicRefMut};
use log::*;

use crate::core::worker::Worker;
use crate::host::context::ThreadContext;
use crate::host::descriptor::descriptor_table::DescriptorTable;
use crate::host::host::{Host, HostId};
use crate::host::memory_manager::MemoryManager;
use crate::host::syscall::types::{SyscallArgs, SyscallError, SyscallReturn};
use crate::host::thread::{Thread, ThreadId};
use crate::utility::callback_queue::CallbackQueue;
use crate::utility::{IsSend, IsSync};

#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ProcessId(u32);

impl From<u32> for ProcessId {
    fn from(val: u32) -> Self {
        ProcessId(val)
    }
}

impl std::fmt::Display for ProcessId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A monitored process: its memory manager, its descriptor table, and its
/// threads.
///
/// [`Process::dispatch_syscall`] is the trap boundary. The interposition
/// shim forwards each intercepted libc call here unchanged; the per-thread
/// syscall handler then decides whether it completes immediately or blocks
/// against simulated time.
pub struct Process {
    id: ProcessId,
    host_id: HostId,
    name: String,
    memory: AtomicRefCell<MemoryManager>,
    desc_table: AtomicRefCell<DescriptorTable>,
    threads: AtomicRefCell<BTreeMap<ThreadId, Arc<Thread>>>,
}

// will not compile if `Process` is not Send + Sync
impl IsSend for Process {}
impl IsSync for Process {}

impl Process {
    pub fn new(host: &Host, id: ProcessId, name: &str) -> Arc<Self> {
        Arc::new(Self {
            id,
            host_id: host.id(),
            name: name.to_string(),
            memory: AtomicRefCell::new(MemoryManager::new(id)),
            desc_table: AtomicRefCell::new(DescriptorTable::new()),
            threads: AtomicRefCell::new(BTreeMap::new()),
        })
    }

    pub fn id(&self) -> ProcessId {
        self.id
    }

    pub fn host_id(&self) -> HostId {
        self.host_id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn memory_borrow(&self) -> AtomicRef<MemoryManager> {
        self.memory.borrow()
    }

    pub fn memory_borrow_mut(&self) -> AtomicRefMut<MemoryManager> {
        self.memory.borrow_mut()
    }

    pub fn descriptor_table_borrow(&self) -> AtomicRef<DescriptorTable> {
        self.desc_table.borrow()
    }

    pub fn descriptor_table_borrow_mut(&self) -> AtomicRefMut<DescriptorTable> {
        self.desc_table.borrow_mut()
    }

    /// Create a thread of this process. `count_syscalls` enables the
    /// handler's per-syscall counter.
    pub fn add_thread(&self, id: ThreadId, count_syscalls: bool) -> Arc<Thread> {
        let thread = Arc::new(Thread::new(self.host_id, self.id, id, count_syscalls));
        let prev = self
            .threads
            .borrow_mut()
            .insert(id, Arc::clone(&thread));
        assert!(prev.is_none(), "thread {} already exists", id);
        thread
    }

    pub fn thread_borrow(&self, id: ThreadId) -> Option<Arc<Thread>> {
        self.threads.borrow().get(&id).cloned()
    }

    /// Destroy a thread. Its blocked syscall (if any) is abandoned: the
    /// condition detaches and the handler's timer is dropped, so neither can
    /// fire afterwards.
    pub fn kill_thread(&self, id: ThreadId) {
        let thread = self.threads.borrow_mut().remove(&id);
        if let Some(thread) = thread {
            // drop the blocked state first so the condition's listener
            // detaches while the thread object is still fully alive
            thread.take_blocked();
            debug!("killed thread {} of process {}", id, self.id);
        }
    }

    /// Destroy the process's descriptor table, closing every descriptor in
    /// it.
    pub fn close_descriptors(&self) {
        let descriptors: Vec<_> = self.desc_table.borrow_mut().remove_all().collect();
        CallbackQueue::queue_and_run(|cb_queue| {
            for desc in descriptors {
                desc.close(cb_queue);
            }
        });
    }

    /// The trap entry point: run one trapped syscall on thread `tid`.
    ///
    /// Returns `Done` with the syscall's return value, or `Block` if the
    /// thread is now parked; in the latter case the eventual result is
    /// published through [`Thread::take_unblocked_result`] once a wake event
    /// resolves the block.
    pub fn dispatch_syscall(
        self: &Arc<Self>,
        host: &Host,
        tid: ThreadId,
        args: &SyscallArgs,
    ) -> SyscallReturn {
        let thread = self
            .thread_borrow(tid)
            .unwrap_or_else(|| panic!("dispatch to unknown thread {}", tid));
        assert!(
            !thread.is_blocked(),
            "dispatching a new syscall to thread {} while one is blocked",
            tid
        );
        thread.take_unblocked_result();
        self.run_syscall(host, &thread, args)
    }

    /// Wake path: re-dispatch the blocked syscall of thread `tid`. Called by
    /// timer expirations and file-status listeners; a stale wake (the thread
    /// resolved or died in the meantime) is a no-op.
    pub fn resume(self: &Arc<Self>, host: &Host, tid: ThreadId) {
        let Some(thread) = self.thread_borrow(tid) else {
            trace!("wake-up for dead thread {}", tid);
            return;
        };
        let Some(args) = thread.blocked_args() else {
            trace!("wake-up for thread {} without a blocked syscall", tid);
            return;
        };

        let rv = self.run_syscall(host, &thread, &args);
        if let SyscallReturn::Done(result) = rv {
            thread.set_unblocked_result(result);
        }
    }

    fn run_syscall(
        self: &Arc<Self>,
        host: &Host,
        thread: &Arc<Thread>,
        args: &SyscallArgs,
    ) -> SyscallReturn {
        Worker::set_active_host(host, || {
            let ctx = ThreadContext::new(host, self, thread);
            let result = thread.syscall_handler_borrow_mut().syscall(&ctx, args);

            match result {
                Err(SyscallError::Blocked(mut blocked)) => {
                    // release the previous invocation's condition (if any)
                    // before arming the new one
                    thread.take_blocked();
                    blocked.condition.arm(host, self, thread.id());
                    thread.set_blocked(*args, blocked.condition);
                    SyscallReturn::Block
                }
                Ok(reg) => {
                    thread.take_blocked();
                    SyscallReturn::Done(Ok(reg))
                }
                Err(SyscallError::Failed(failed)) => {
                    thread.take_blocked();
                    SyscallReturn::Done(Err(failed.errno))
                }
            }
        })
    }
}

impl std::fmt::Debug for Process {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Process")
            .field("id", &self.id)
            .field("name", &self.name)
            .finish()
    }
}

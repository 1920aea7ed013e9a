use std::sync::atomic::Ordering;
use std::sync::Arc;

use log::*;
use nix::errno::Errno;

use crate::core::support::emulated_time::EmulatedTime;
use crate::host::context::ThreadContext;
use crate::host::descriptor::descriptor_table::DescriptorTable;
use crate::host::descriptor::CompatDescriptor;
use crate::host::host::HostId;
use crate::host::process::ProcessId;
use crate::host::syscall::condition::SyscallCondition;
use crate::host::syscall::types::{SyscallArgs, SyscallError, SyscallReg, SyscallResult};
use crate::host::syscall::SyscallNum;
use crate::host::thread::ThreadId;
use crate::host::timer::Timer;
use crate::utility::counter::Counter;

mod mman;
mod unistd;

/// The per-thread syscall state machine.
///
/// A dispatched syscall either completes (the thread returns to the
/// monitored process with a result) or blocks (the thread parks in the
/// scheduler). While blocked, `blocked_syscall` records which syscall is
/// suspended; the only legal next dispatch on this thread is a re-dispatch
/// of that same syscall, driven by a wake event. Every resolution path
/// (success, error, or timeout) clears `blocked_syscall` and disarms the
/// timer.
pub struct SyscallHandler {
    /// The host this `SyscallHandler` belongs to. Used for validation and
    /// logging.
    host_id: HostId,
    /// The process this `SyscallHandler` belongs to.
    process_id: ProcessId,
    /// The thread this `SyscallHandler` belongs to.
    thread_id: ThreadId,
    /// The total number of syscalls that we have handled.
    num_syscalls: u64,
    /// A counter for individual syscalls.
    syscall_counter: Option<Counter>,
    /// If we are currently blocking a specific syscall, i.e., waiting for a
    /// file to be readable/writable or waiting for a timeout, the syscall
    /// number of that function is stored here. `None` means no syscall is
    /// blocked.
    blocked_syscall: Option<SyscallNum>,
    /// Armed only while a blocked syscall with a deadline is outstanding;
    /// fires once at the deadline to resume the thread.
    timer: Option<Timer>,
}

impl SyscallHandler {
    pub fn new(
        host_id: HostId,
        process_id: ProcessId,
        thread_id: ThreadId,
        count_syscalls: bool,
    ) -> SyscallHandler {
        SyscallHandler {
            host_id,
            process_id,
            thread_id,
            num_syscalls: 0,
            syscall_counter: count_syscalls.then(Counter::new),
            blocked_syscall: None,
            timer: None,
        }
    }

    /// Did the last syscall result in `SyscallError::Blocked`? If called
    /// from a syscall handler and `is_blocked()` returns true, then the
    /// current invocation is a re-dispatch of that same blocked syscall.
    pub fn is_blocked(&self) -> bool {
        self.blocked_syscall.is_some()
    }

    /// The syscall currently suspended on this thread, if any.
    pub fn blocked_syscall(&self) -> Option<SyscallNum> {
        self.blocked_syscall
    }

    /// True if the blocked syscall's deadline has passed; the re-dispatched
    /// handler should resolve with its family's timeout result.
    pub fn did_listen_timeout_expire(&self) -> bool {
        self.timer
            .as_ref()
            .map(|t| t.expiration_count() > 0)
            .unwrap_or(false)
    }

    pub fn syscall(&mut self, ctx: &ThreadContext, args: &SyscallArgs) -> SyscallResult {
        // it wouldn't make sense if we were given a different host, process,
        // and thread
        assert_eq!(ctx.host.id(), self.host_id);
        assert_eq!(ctx.process.id(), self.process_id);
        assert_eq!(ctx.thread.id(), self.thread_id);

        let syscall = SyscallNum::new(args.number);
        let syscall_name = syscall.map(|s| s.to_str()).unwrap_or("unknown-syscall");

        // if we blocked a syscall, then that same syscall must be the one
        // re-dispatched when the thread wakes
        if let Some(blocked_syscall) = self.blocked_syscall {
            if blocked_syscall.raw() != args.number {
                panic!(
                    "We blocked syscall {} but syscall {} is unexpectedly being invoked",
                    blocked_syscall, args.number
                );
            }
        }

        // were we previously blocked on this same syscall?
        let was_blocked = self.blocked_syscall.is_some();

        trace!(
            "SYSCALL_HANDLER_PRE: {} ({}){} on thread {} of {}",
            syscall_name,
            args.number,
            if was_blocked {
                " (previously BLOCKed)"
            } else {
                ""
            },
            self.thread_id,
            ctx.process.name(),
        );

        // Count the frequency of each syscall, but only on the initial call.
        // This avoids double counting in the case where the initial call
        // blocked at first, but then later became unblocked and is now being
        // handled again here.
        if let Some(syscall_counter) = self.syscall_counter.as_mut() {
            if !was_blocked {
                syscall_counter.add_one(syscall_name);
            }
        }

        let rv = self.run_handler(ctx, args);

        if !matches!(rv, Err(SyscallError::Blocked(_))) {
            // the syscall completed
            self.num_syscalls += 1;
        }

        if log::log_enabled!(log::Level::Trace) {
            let rv_formatted = match &rv {
                Ok(reg) => format!("{}", i64::from(*reg)),
                Err(SyscallError::Failed(failed)) => {
                    format!("{} ({})", -(failed.errno as i64), failed.errno)
                }
                Err(SyscallError::Blocked(_)) => "<blocked>".to_string(),
            };

            trace!(
                "SYSCALL_HANDLER_POST: {} ({}) result {}{} on thread {} of {}",
                syscall_name,
                args.number,
                if was_blocked { "BLOCK -> " } else { "" },
                rv_formatted,
                self.thread_id,
                ctx.process.name(),
            );
        }

        // update the blocking state machine: record the suspended syscall
        // and arm the deadline timer when blocking, clear both otherwise
        match &rv {
            Err(SyscallError::Blocked(blocked)) => {
                self.blocked_syscall = syscall;
                match blocked.condition.timeout() {
                    Some(deadline) => self.arm_timer(ctx, &blocked.condition, deadline),
                    None => self.timer = None,
                }
            }
            _ => {
                self.blocked_syscall = None;
                self.timer = None;
            }
        }

        rv
    }

    // Arm the handler's single-shot timer to resume the thread at
    // `deadline`. A wake that already resolved the condition wins; the
    // timer's callback checks the condition's token and backs off.
    fn arm_timer(
        &mut self,
        ctx: &ThreadContext,
        condition: &SyscallCondition,
        deadline: EmulatedTime,
    ) {
        let token = condition.wake_token();
        let process = Arc::downgrade(ctx.process);
        let tid = self.thread_id;

        let mut timer = Timer::new(move |host| {
            if token.load(Ordering::Relaxed) {
                return;
            }
            if let Some(process) = process.upgrade() {
                process.resume(host, tid);
            }
        });
        timer.arm(ctx.host, deadline);
        self.timer = Some(timer);
    }

    fn run_handler(&mut self, ctx: &ThreadContext, args: &SyscallArgs) -> SyscallResult {
        let Some(syscall) = SyscallNum::new(args.number) else {
            warn!(
                "Detected unsupported syscall {} called from thread {} in process {} on host {}",
                args.number,
                ctx.thread.id(),
                ctx.process.name(),
                ctx.host.id(),
            );
            return Err(Errno::ENOSYS.into());
        };

        let mut ctx = SyscallContext {
            objs: ctx,
            args,
            handler: self,
        };

        macro_rules! handle {
            ($f:ident) => {{
                SyscallHandlerFn::call(Self::$f, &mut ctx)
            }};
        }

        match syscall {
            SyscallNum::Brk => handle!(brk),
            SyscallNum::Close => handle!(close),
            SyscallNum::Dup => handle!(dup),
            SyscallNum::Dup2 => handle!(dup2),
            SyscallNum::Mmap => handle!(mmap),
            SyscallNum::Mprotect => handle!(mprotect),
            SyscallNum::Mremap => handle!(mremap),
            SyscallNum::Munmap => handle!(munmap),
            SyscallNum::Pipe => handle!(pipe),
            SyscallNum::Pipe2 => handle!(pipe2),
            SyscallNum::Pread64 => handle!(pread64),
            SyscallNum::Pwrite64 => handle!(pwrite64),
            SyscallNum::Read => handle!(read),
            SyscallNum::Write => handle!(write),
        }
    }

    /// Internal helper that returns the [`CompatDescriptor`] for the fd if
    /// it exists, otherwise returns EBADF.
    fn get_descriptor(
        descriptor_table: &DescriptorTable,
        fd: impl TryInto<u32>,
    ) -> Result<&CompatDescriptor, Errno> {
        // check that fd is within bounds
        let fd = fd.try_into().or(Err(Errno::EBADF))?;

        descriptor_table.get(fd).ok_or(Errno::EBADF)
    }
}

impl std::ops::Drop for SyscallHandler {
    fn drop(&mut self) {
        debug!(
            "Handled {} syscalls on thread {}",
            self.num_syscalls, self.thread_id
        );

        if let Some(syscall_counter) = self.syscall_counter.as_mut() {
            // log the monitored-thread specific counts
            debug!(
                "Thread {} syscall counts: {}",
                self.thread_id, syscall_counter,
            );
        }
    }
}

pub struct SyscallContext<'a, 'b> {
    pub objs: &'a ThreadContext<'b>,
    pub args: &'a SyscallArgs,
    pub handler: &'a mut SyscallHandler,
}

pub trait SyscallHandlerFn<T> {
    fn call(self, ctx: &mut SyscallContext) -> SyscallResult;
}

impl<F, T0> SyscallHandlerFn<()> for F
where
    F: Fn(&mut SyscallContext) -> Result<T0, SyscallError>,
    T0: Into<SyscallReg>,
{
    fn call(self, ctx: &mut SyscallContext) -> SyscallResult {
        self(ctx).map(Into::into)
    }
}

impl<F, T0, T1> SyscallHandlerFn<(T1,)> for F
where
    F: Fn(&mut SyscallContext, T1) -> Result<T0, SyscallError>,
    T0: Into<SyscallReg>,
    T1: From<SyscallReg>,
{
    fn call(self, ctx: &mut SyscallContext) -> SyscallResult {
        self(ctx, ctx.args.get(0).into()).map(Into::into)
    }
}

impl<F, T0, T1, T2> SyscallHandlerFn<(T1, T2)> for F
where
    F: Fn(&mut SyscallContext, T1, T2) -> Result<T0, SyscallError>,
    T0: Into<SyscallReg>,
    T1: From<SyscallReg>,
    T2: From<SyscallReg>,
{
    fn call(self, ctx: &mut SyscallContext) -> SyscallResult {
        self(ctx, ctx.args.get(0).into(), ctx.args.get(1).into()).map(Into::into)
    }
}

impl<F, T0, T1, T2, T3> SyscallHandlerFn<(T1, T2, T3)> for F
where
    F: Fn(&mut SyscallContext, T1, T2, T3) -> Result<T0, SyscallError>,
    T0: Into<SyscallReg>,
    T1: From<SyscallReg>,
    T2: From<SyscallReg>,
    T3: From<SyscallReg>,
{
    fn call(self, ctx: &mut SyscallContext) -> SyscallResult {
        self(
            ctx,
            ctx.args.get(0).into(),
            ctx.args.get(1).into(),
            ctx.args.get(2).into(),
        )
        .map(Into::into)
    }
}

impl<F, T0, T1, T2, T3, T4> SyscallHandlerFn<(T1, T2, T3, T4)> for F
where
    F: Fn(&mut SyscallContext, T1, T2, T3, T4) -> Result<T0, SyscallError>,
    T0: Into<SyscallReg>,
    T1: From<SyscallReg>,
    T2: From<SyscallReg>,
    T3: From<SyscallReg>,
    T4: From<SyscallReg>,
{
    fn call(self, ctx: &mut SyscallContext) -> SyscallResult {
        self(
            ctx,
            ctx.args.get(0).into(),
            ctx.args.get(1).into(),
            ctx.args.get(2).into(),
            ctx.args.get(3).into(),
        )
        .map(Into::into)
    }
}

impl<F, T0, T1, T2, T3, T4, T5> SyscallHandlerFn<(T1, T2, T3, T4, T5)> for F
where
    F: Fn(&mut SyscallContext, T1, T2, T3, T4, T5) -> Result<T0, SyscallError>,
    T0: Into<SyscallReg>,
    T1: From<SyscallReg>,
    T2: From<SyscallReg>,
    T3: From<SyscallReg>,
    T4: From<SyscallReg>,
    T5: From<SyscallReg>,
{
    fn call(self, ctx: &mut SyscallContext) -> SyscallResult {
        self(
            ctx,
            ctx.args.get(0).into(),
            ctx.args.get(1).into(),
            ctx.args.get(2).into(),
            ctx.args.get(3).into(),
            ctx.args.get(4).into(),
        )
        .map(Into::into)
    }
}

impl<F, T0, T1, T2, T3, T4, T5, T6> SyscallHandlerFn<(T1, T2, T3, T4, T5, T6)> for F
where
    F: Fn(&mut SyscallContext, T1, T2, T3, T4, T5, T6) -> Result<T0, SyscallError>,
    T0: Into<SyscallReg>,
    T1: From<SyscallReg>,
    T2: From<SyscallReg>,
    T3: From<SyscallReg>,
    T4: From<SyscallReg>,
    T5: From<SyscallReg>,
    T6: From<SyscallReg>,
{
    fn call(self, ctx: &mut SyscallContext) -> SyscallResult {
        self(
            ctx,
            ctx.args.get(0).into(),
            ctx.args.get(1).into(),
            ctx.args.get(2).into(),
            ctx.args.get(3).into(),
            ctx.args.get(4).into(),
            ctx.args.get(5).into(),
        )
        .map(Into::into)
    }
}

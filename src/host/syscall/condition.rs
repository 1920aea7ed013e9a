use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use log::trace;

use crate::core::support::emulated_time::EmulatedTime;
use crate::core::support::simulation_time::SimulationTime;
use crate::core::work::task::TaskRef;
use crate::core::worker::Worker;
use crate::host::descriptor::{PosixFile, StateListenerFilter};
use crate::host::host::Host;
use crate::host::process::Process;
use crate::host::status_listener::StatusListener;
use crate::host::syscall::Trigger;
use crate::host::thread::ThreadId;

/// The wake contract of one blocked syscall invocation: the file state being
/// awaited, an optional absolute deadline, and the file retained for the
/// re-dispatched syscall to use (the fd may leave the descriptor table while
/// the thread is parked).
///
/// Arming attaches a [`StatusListener`] to the awaited file; the deadline is
/// enforced by the owning syscall handler's timer. Whichever fires first
/// schedules one thread resumption; the loser finds the condition already
/// resolved and does nothing. Dropping the condition (on any resolution path)
/// detaches the listener, so a condition can wake its thread at most once.
pub struct SyscallCondition {
    trigger: Option<Trigger>,
    timeout: Option<EmulatedTime>,
    active_file: Option<PosixFile>,
    listener: Option<(PosixFile, Arc<StatusListener>)>,
    // set once this condition has resolved (or been dropped); stale wake
    // events check it and back off
    resolved: Arc<AtomicBool>,
}

impl SyscallCondition {
    /// New condition waiting on a file-state trigger, with no timeout.
    pub fn new(trigger: Trigger) -> Self {
        Self {
            trigger: Some(trigger),
            timeout: None,
            active_file: None,
            listener: None,
            resolved: Arc::new(AtomicBool::new(false)),
        }
    }

    /// The absolute deadline, if any.
    pub fn timeout(&self) -> Option<EmulatedTime> {
        self.timeout
    }

    pub fn set_timeout(&mut self, timeout: Option<EmulatedTime>) {
        self.timeout = timeout;
    }

    /// The file the blocked syscall was operating on, if any.
    pub fn active_file(&self) -> Option<&PosixFile> {
        self.active_file.as_ref()
    }

    pub fn set_active_file(&mut self, file: PosixFile) {
        self.active_file = Some(file);
    }

    /// A token that wake sources check before scheduling a resumption; it
    /// flips once the condition resolves.
    pub fn wake_token(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.resolved)
    }

    /// Attach to the awaited file so that the matching state transition
    /// resumes `tid` of `process`. Must be called at most once.
    pub fn arm(&mut self, _host: &Host, process: &Arc<Process>, tid: ThreadId) {
        assert!(self.listener.is_none());

        let Some(trigger) = &self.trigger else {
            return;
        };

        let resolved = Arc::clone(&self.resolved);
        let process = Arc::downgrade(process);

        let listener = StatusListener::new(
            trigger.state(),
            StateListenerFilter::OffToOn,
            move |host| {
                if resolved.load(Ordering::Relaxed) {
                    return;
                }
                let process = process.clone();
                // Defer the continuation to a fresh event: the transition may
                // have been driven from inside another thread's syscall.
                host.schedule_task_with_delay(
                    TaskRef::new(move |host| {
                        if let Some(process) = process.upgrade() {
                            process.resume(host, tid);
                        }
                    }),
                    SimulationTime::ZERO,
                );
            },
        );

        trigger
            .file()
            .borrow_mut()
            .add_status_listener(&listener);
        self.listener = Some((trigger.file().clone(), listener));
    }
}

impl Drop for SyscallCondition {
    fn drop(&mut self) {
        self.resolved.store(true, Ordering::Relaxed);
        if let Some((file, listener)) = self.listener.take() {
            trace!("Detaching condition listener");
            file.borrow_mut().remove_status_listener(&listener);
        }
    }
}

impl std::fmt::Debug for SyscallCondition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyscallCondition")
            .field("trigger", &self.trigger)
            .field("timeout", &self.timeout)
            .field("armed", &self.listener.is_some())
            .finish()
    }
}

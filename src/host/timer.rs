use std::sync::{Arc, Weak};

use atomic_refcell::AtomicRefCell;
use log::trace;

use crate::core::support::emulated_time::EmulatedTime;
use crate::core::support::simulation_time::SimulationTime;
use crate::core::work::task::TaskRef;
use crate::core::worker::Worker;
use crate::host::host::Host;
use crate::utility::Magic;

/// A single-shot simulated-time timer.
///
/// The timer is owned exclusively by whoever armed it. Internals live in an
/// `Arc` so that scheduled expiration events can refer back to it through a
/// `Weak` reference; dropping the timer therefore guarantees that no pending
/// expiration event will fire.
pub struct Timer {
    magic: Magic<Self>,
    internal: Arc<AtomicRefCell<TimerInternal>>,
}

struct TimerInternal {
    next_expire_time: Option<EmulatedTime>,
    expiration_count: u64,
    next_expire_id: u64,
    min_valid_expire_id: u64,
    on_expire: Box<dyn Fn(&Host) + Send + Sync>,
}

impl Timer {
    /// Create a new unarmed Timer that executes `on_expire` on expiration.
    /// `on_expire` will cause a panic if it calls mutable methods of the
    /// enclosing Timer; if it needs to do so it should push a new task to the
    /// scheduler instead.
    pub fn new<F: 'static + Fn(&Host) + Send + Sync>(on_expire: F) -> Self {
        Self {
            magic: Magic::new(),
            internal: Arc::new(AtomicRefCell::new(TimerInternal {
                next_expire_time: None,
                expiration_count: 0,
                next_expire_id: 0,
                min_valid_expire_id: 0,
                on_expire: Box::new(on_expire),
            })),
        }
    }

    /// How many times this timer has expired since it was created.
    pub fn expiration_count(&self) -> u64 {
        self.magic.debug_check();
        self.internal.borrow().expiration_count
    }

    /// Whether the timer is armed and has not yet fired.
    pub fn is_armed(&self) -> bool {
        self.magic.debug_check();
        self.internal.borrow().next_expire_time.is_some()
    }

    /// Returns the remaining time until the next expiration if the timer is
    /// armed, or None otherwise.
    pub fn remaining_time(&self) -> Option<SimulationTime> {
        self.magic.debug_check();
        let t = self.internal.borrow().next_expire_time?;
        let now = Worker::current_time().unwrap();
        Some(t.saturating_duration_since(&now))
    }

    /// Cancel the timer. Any already-scheduled expiration event becomes a
    /// no-op.
    pub fn disarm(&mut self) {
        self.magic.debug_check();
        let mut internal = self.internal.borrow_mut();
        internal.next_expire_time = None;
        internal.min_valid_expire_id = internal.next_expire_id;
    }

    /// Arm the timer to fire once at `expire_time`. Re-arming an armed timer
    /// cancels the earlier expiration.
    pub fn arm(&mut self, host: &Host, expire_time: EmulatedTime) {
        self.magic.debug_check();
        debug_assert!(expire_time >= host.current_time());

        let mut internal = self.internal.borrow_mut();
        internal.min_valid_expire_id = internal.next_expire_id;
        internal.next_expire_time = Some(expire_time);

        let expire_id = internal.next_expire_id;
        internal.next_expire_id += 1;

        let internal_weak = Arc::downgrade(&self.internal);
        let task = TaskRef::new(move |host| Self::timer_expire(&internal_weak, host, expire_id));
        host.schedule_task_at_emulated_time(task, expire_time);
    }

    fn timer_expire(
        internal_weak: &Weak<AtomicRefCell<TimerInternal>>,
        host: &Host,
        expire_id: u64,
    ) {
        let internal = match Weak::upgrade(internal_weak) {
            Some(internal) => internal,
            None => {
                trace!("Expired Timer no longer exists.");
                return;
            }
        };

        let mut internal_brw = internal.borrow_mut();
        trace!(
            "timer expire check; expireID={} minValidExpireID={}",
            expire_id,
            internal_brw.min_valid_expire_id
        );
        if expire_id < internal_brw.min_valid_expire_id {
            // Cancelled.
            return;
        }

        internal_brw.expiration_count += 1;
        internal_brw.next_expire_time = None;

        // Re-borrow as an immutable reference while executing the callback.
        drop(internal_brw);
        let internal_brw = internal.borrow();
        (internal_brw.on_expire)(host);
    }
}

impl std::fmt::Debug for Timer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Timer")
            .field("armed", &self.is_armed())
            .field("expiration_count", &self.expiration_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU64, Ordering};

    #[test]
    fn test_fires_once_at_expire_time() {
        let host = Host::new();
        let fired_at = Arc::new(AtomicU64::new(u64::MAX));
        let fired_at_clone = Arc::clone(&fired_at);

        let mut timer = Timer::new(move |host| {
            fired_at_clone.store(
                host.current_time().duration_since_start().as_nanos() as u64,
                Ordering::Relaxed,
            );
        });
        timer.arm(&host, host.current_time() + SimulationTime::from_secs(5));
        assert!(timer.is_armed());

        host.run_until_idle();
        assert_eq!(
            fired_at.load(Ordering::Relaxed),
            SimulationTime::from_secs(5).as_nanos() as u64
        );
        assert_eq!(timer.expiration_count(), 1);
        assert!(!timer.is_armed());
    }

    #[test]
    fn test_disarm_prevents_fire() {
        let host = Host::new();
        let fired = Arc::new(AtomicU64::new(0));
        let fired_clone = Arc::clone(&fired);

        let mut timer = Timer::new(move |_| {
            fired_clone.fetch_add(1, Ordering::Relaxed);
        });
        timer.arm(&host, host.current_time() + SimulationTime::SECOND);
        timer.disarm();

        host.run_until_idle();
        assert_eq!(fired.load(Ordering::Relaxed), 0);
        assert_eq!(timer.expiration_count(), 0);
    }

    #[test]
    fn test_rearm_cancels_earlier_expiration() {
        let host = Host::new();
        let fired = Arc::new(AtomicU64::new(0));
        let fired_clone = Arc::clone(&fired);

        let mut timer = Timer::new(move |host| {
            assert_eq!(
                host.current_time().duration_since_start(),
                SimulationTime::from_secs(3)
            );
            fired_clone.fetch_add(1, Ordering::Relaxed);
        });
        timer.arm(&host, host.current_time() + SimulationTime::SECOND);
        timer.arm(&host, host.current_time() + SimulationTime::from_secs(3));

        host.run_until_idle();
        assert_eq!(fired.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn test_dropped_timer_never_fires() {
        let host = Host::new();
        let fired = Arc::new(AtomicU64::new(0));
        let fired_clone = Arc::clone(&fired);

        let mut timer = Timer::new(move |_| {
            fired_clone.fetch_add(1, Ordering::Relaxed);
        });
        timer.arm(&host, host.current_time() + SimulationTime::SECOND);
        drop(timer);

        host.run_until_idle();
        assert_eq!(fired.load(Ordering::Relaxed), 0);
    }
}

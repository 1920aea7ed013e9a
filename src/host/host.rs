use std::cell::{Cell, RefCell};
use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::sync::atomic::{AtomicU32, Ordering};

use log::trace;

use crate::core::support::emulated_time::EmulatedTime;
use crate::core::support::simulation_time::SimulationTime;
use crate::core::work::task::TaskRef;
use crate::core::worker::Worker;

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct HostId(u32);

impl std::fmt::Display for HostId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// The simulated host: the clock and the deterministic event queue that
/// drives it.
///
/// This is the scheduler boundary the virtualization layer talks to: "wake me
/// after duration D" is [`Host::schedule_task_with_delay`], and the event loop
/// ([`Host::run_until_idle`]) delivers each task exactly once, in
/// (time, scheduling order) order. The rest of the simulator's event engine
/// (cross-host routing, parallel workers) lives outside this crate.
pub struct Host {
    id: HostId,
    clock: Cell<EmulatedTime>,
    event_queue: RefCell<BinaryHeap<Reverse<Event>>>,
    // breaks ties between events scheduled for the same instant
    next_seq: Cell<u64>,
}

struct Event {
    time: EmulatedTime,
    seq: u64,
    task: TaskRef,
}

impl PartialEq for Event {
    fn eq(&self, other: &Self) -> bool {
        self.time == other.time && self.seq == other.seq
    }
}

impl Eq for Event {}

impl PartialOrd for Event {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Event {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        (self.time, self.seq).cmp(&(other.time, other.seq))
    }
}

static NEXT_HOST_ID: AtomicU32 = AtomicU32::new(0);

impl Host {
    #[allow(clippy::new_without_default)]
    pub fn new() -> Self {
        Self {
            id: HostId(NEXT_HOST_ID.fetch_add(1, Ordering::Relaxed)),
            clock: Cell::new(EmulatedTime::SIMULATION_START),
            event_queue: RefCell::new(BinaryHeap::new()),
            next_seq: Cell::new(0),
        }
    }

    pub fn id(&self) -> HostId {
        self.id
    }

    pub fn current_time(&self) -> EmulatedTime {
        self.clock.get()
    }

    /// Schedule `task` to run after `delay` of simulated time.
    pub fn schedule_task_with_delay(&self, task: TaskRef, delay: SimulationTime) {
        self.schedule_task_at_emulated_time(task, self.current_time() + delay)
    }

    /// Schedule `task` to run at the absolute time `t`. Panics if `t` is in
    /// the simulated past.
    pub fn schedule_task_at_emulated_time(&self, task: TaskRef, t: EmulatedTime) {
        assert!(t >= self.current_time());
        let seq = self.next_seq.get();
        self.next_seq.set(seq + 1);
        trace!(
            "host {}: scheduling task at +{:?}",
            self.id,
            t.duration_since_start()
        );
        self.event_queue
            .borrow_mut()
            .push(Reverse(Event { time: t, seq, task }));
    }

    /// The time of the earliest pending event, if any.
    pub fn next_event_time(&self) -> Option<EmulatedTime> {
        self.event_queue.borrow().peek().map(|e| e.0.time)
    }

    /// Pop and run the earliest pending event, advancing the clock to its
    /// time. Returns false when the queue is empty.
    pub fn run_next_event(&self) -> bool {
        let event = match self.event_queue.borrow_mut().pop() {
            Some(Reverse(e)) => e,
            None => return false,
        };
        debug_assert!(event.time >= self.current_time());
        self.clock.set(event.time);
        Worker::set_active_host(self, || event.task.execute(self));
        true
    }

    /// Run events until the queue is empty.
    pub fn run_until_idle(&self) {
        while self.run_next_event() {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn test_events_run_in_time_order() {
        let host = Host::new();
        let log = Arc::new(atomic_refcell::AtomicRefCell::new(Vec::new()));

        for delay_secs in [3u64, 1, 2] {
            let log = Arc::clone(&log);
            host.schedule_task_with_delay(
                TaskRef::new(move |host| {
                    log.borrow_mut()
                        .push(host.current_time().duration_since_start());
                }),
                SimulationTime::from_secs(delay_secs),
            );
        }

        host.run_until_idle();
        assert_eq!(
            *log.borrow(),
            vec![
                SimulationTime::from_secs(1),
                SimulationTime::from_secs(2),
                SimulationTime::from_secs(3)
            ]
        );
        assert_eq!(
            host.current_time().duration_since_start(),
            SimulationTime::from_secs(3)
        );
    }

    #[test]
    fn test_same_time_events_run_in_schedule_order() {
        let host = Host::new();
        let count = Arc::new(AtomicUsize::new(0));

        for expected in 0..5usize {
            let count = Arc::clone(&count);
            host.schedule_task_with_delay(
                TaskRef::new(move |_| {
                    assert_eq!(count.fetch_add(1, Ordering::Relaxed), expected);
                }),
                SimulationTime::SECOND,
            );
        }

        host.run_until_idle();
        assert_eq!(count.load(Ordering::Relaxed), 5);
    }

    #[test]
    fn test_task_scheduled_during_event_runs() {
        let host = Host::new();
        let ran = Arc::new(AtomicUsize::new(0));
        let ran_clone = Arc::clone(&ran);

        host.schedule_task_with_delay(
            TaskRef::new(move |host| {
                let ran = Arc::clone(&ran_clone);
                host.schedule_task_with_delay(
                    TaskRef::new(move |_| {
                        ran.fetch_add(1, Ordering::Relaxed);
                    }),
                    SimulationTime::SECOND,
                );
            }),
            SimulationTime::SECOND,
        );

        host.run_until_idle();
        assert_eq!(ran.load(Ordering::Relaxed), 1);
        assert_eq!(
            host.current_time().duration_since_start(),
            SimulationTime::from_secs(2)
        );
    }
}

use std::sync::Arc;

use crate::core::worker::Worker;
use crate::host::descriptor::{FileState, StateListenerFilter};
use crate::host::host::Host;

/// An observer of file status changes.
///
/// Listeners are reference-counted: attaching one to a file stores a clone of
/// the `Arc` (incrementing the count), and detaching it (or destroying the
/// file) releases that clone. The scheduler contract is that each attached
/// listener observes a given transition at most once.
pub struct StatusListener {
    /// The status bits we monitor for transitions.
    monitoring: FileState,
    /// Which transitions of the monitored bits trigger a notification.
    filter: StateListenerFilter,
    notify: Box<dyn Fn(&Host) + Send + Sync>,
}

impl StatusListener {
    pub fn new(
        monitoring: FileState,
        filter: StateListenerFilter,
        notify: impl Fn(&Host) + Send + Sync + 'static,
    ) -> Arc<Self> {
        Arc::new(Self {
            monitoring,
            filter,
            notify: Box::new(notify),
        })
    }

    /// Called by the status owner when a transition (bit flip) occurred on at
    /// least one of its status bits. Triggers the notification callback if
    /// the transition matches the monitored bits and filter.
    pub fn handle_status_change(&self, state: FileState, changed: FileState) {
        // true if any of the bits we're monitoring have changed
        let flipped = self.monitoring.intersects(changed);

        // true if any of the bits we're monitoring are set
        let on = self.monitoring.intersects(state);

        let notify = match self.filter {
            // at least one monitored bit is on, and at least one has changed
            StateListenerFilter::OffToOn => flipped && on,
            // all monitored bits are off, and at least one has changed
            StateListenerFilter::OnToOff => flipped && !on,
            // at least one monitored bit has changed
            StateListenerFilter::Always => flipped,
            StateListenerFilter::Never => false,
        };

        if !notify {
            return;
        }

        Worker::with_active_host(|host| (self.notify)(host))
            .expect("file status changed outside of any host's scope");
    }
}

impl std::fmt::Debug for StatusListener {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StatusListener")
            .field("monitoring", &self.monitoring)
            .field("filter", &self.filter)
            .finish()
    }
}

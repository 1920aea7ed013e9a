use std::sync::Arc;

use crate::host::host::Host;

/// A shareable unit of work, executed by the host's event loop.
#[derive(Clone)]
pub struct TaskRef {
    inner: Arc<dyn Fn(&Host) + Send + Sync>,
}

impl TaskRef {
    pub fn new<F: 'static + Fn(&Host) + Send + Sync>(f: F) -> Self {
        Self { inner: Arc::new(f) }
    }

    pub fn execute(&self, host: &Host) {
        (self.inner)(host)
    }
}

impl std::fmt::Debug for TaskRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskRef")
            .field("inner", &Arc::as_ptr(&self.inner))
            .finish()
    }
}

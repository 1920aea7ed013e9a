//! A buffer for files that need to share a buffer with other files, for
//! example the two ends of a pipe. The buffer notifies its files when data or
//! space becomes available, and when readers or writers come and go.

use nix::errno::Errno;

use crate::utility::byte_queue::ByteQueue;
use crate::utility::callback_queue::{CallbackQueue, EventSource, Handle};

pub struct SharedBuf {
    queue: ByteQueue,
    max_len: usize,
    state: BufferState,
    num_readers: u16,
    num_writers: u16,
    event_source: EventSource<(BufferState, BufferState)>,
}

impl SharedBuf {
    pub fn new(max_len: usize) -> Self {
        assert_ne!(max_len, 0);
        Self {
            queue: ByteQueue::new(4096),
            max_len,
            state: BufferState::WRITABLE | BufferState::NO_READERS | BufferState::NO_WRITERS,
            num_readers: 0,
            num_writers: 0,
            event_source: EventSource::new(),
        }
    }

    pub fn has_data(&self) -> bool {
        self.queue.has_bytes()
    }

    pub fn num_bytes(&self) -> usize {
        self.queue.num_bytes()
    }

    pub fn max_len(&self) -> usize {
        self.max_len
    }

    pub fn space_available(&self) -> usize {
        self.max_len - self.queue.num_bytes()
    }

    /// Register as a reader. The [`ReaderHandle`] must be returned to the
    /// buffer later with [`remove_reader()`](Self::remove_reader).
    pub fn add_reader(&mut self, cb_queue: &mut CallbackQueue) -> ReaderHandle {
        self.num_readers += 1;
        self.refresh_state(cb_queue);
        ReaderHandle {}
    }

    pub fn remove_reader(&mut self, handle: ReaderHandle, cb_queue: &mut CallbackQueue) {
        self.num_readers -= 1;
        // don't run the handle's drop impl
        std::mem::forget(handle);
        self.refresh_state(cb_queue);
    }

    pub fn num_readers(&self) -> u16 {
        self.num_readers
    }

    /// Register as a writer. The [`WriterHandle`] must be returned to the
    /// buffer later with [`remove_writer()`](Self::remove_writer).
    pub fn add_writer(&mut self, cb_queue: &mut CallbackQueue) -> WriterHandle {
        self.num_writers += 1;
        self.refresh_state(cb_queue);
        WriterHandle {}
    }

    pub fn remove_writer(&mut self, handle: WriterHandle, cb_queue: &mut CallbackQueue) {
        self.num_writers -= 1;
        // don't run the handle's drop impl
        std::mem::forget(handle);
        self.refresh_state(cb_queue);
    }

    pub fn num_writers(&self) -> u16 {
        self.num_writers
    }

    pub fn read<W: std::io::Write>(
        &mut self,
        bytes: W,
        cb_queue: &mut CallbackQueue,
    ) -> Result<usize, std::io::Error> {
        let num_copied = self.queue.pop(bytes)?;
        self.refresh_state(cb_queue);

        Ok(num_copied)
    }

    pub fn write_stream<R: std::io::Read>(
        &mut self,
        bytes: R,
        len: usize,
        cb_queue: &mut CallbackQueue,
    ) -> Result<usize, std::io::Error> {
        if len == 0 {
            return Ok(0);
        }

        if self.space_available() == 0 {
            return Err(std::io::Error::from_raw_os_error(Errno::EAGAIN as i32));
        }

        let written = self
            .queue
            .push(bytes.take(self.space_available().try_into().unwrap()))?;

        self.refresh_state(cb_queue);

        Ok(written)
    }

    pub fn add_listener(
        &mut self,
        monitoring: BufferState,
        notify_fn: impl Fn(BufferState, &mut CallbackQueue) + Send + Sync + 'static,
    ) -> BufferHandle {
        self.event_source
            .add_listener(move |(state, changed), cb_queue| {
                // true if any of the bits we're monitoring have changed
                if !monitoring.intersects(changed) {
                    return;
                }

                (notify_fn)(state, cb_queue)
            })
    }

    pub fn state(&self) -> BufferState {
        self.state
    }

    fn refresh_state(&mut self, cb_queue: &mut CallbackQueue) {
        let old_state = self.state;

        let mut new_state = BufferState::empty();
        new_state.set(BufferState::READABLE, self.has_data());
        new_state.set(BufferState::WRITABLE, self.space_available() > 0);
        new_state.set(BufferState::NO_READERS, self.num_readers() == 0);
        new_state.set(BufferState::NO_WRITERS, self.num_writers() == 0);

        self.state = new_state;
        self.handle_state_change(old_state, cb_queue);
    }

    fn handle_state_change(&mut self, old_state: BufferState, cb_queue: &mut CallbackQueue) {
        let states_changed = self.state ^ old_state;

        // if nothing changed
        if states_changed.is_empty() {
            return;
        }

        self.event_source
            .notify_listeners((self.state, states_changed), cb_queue);
    }
}

impl Drop for SharedBuf {
    fn drop(&mut self) {
        // don't show the following warning message if panicking
        if std::thread::panicking() {
            return;
        }

        // listeners waiting for `NO_READERS` or `NO_WRITERS` status changes
        // will never be notified
        if self.num_readers != 0 || self.num_writers != 0 {
            debug_panic!(
                "Dropping SharedBuf while it still has {} readers and {} writers.",
                self.num_readers,
                self.num_writers,
            );
        }
    }
}

bitflags::bitflags! {
    #[derive(Default, Copy, Clone, Debug, PartialEq, Eq)]
    pub struct BufferState: u8 {
        /// There is data waiting in the buffer.
        const READABLE = 0b00000001;
        /// There is available buffer space.
        const WRITABLE = 0b00000010;
        /// The buffer has no readers.
        const NO_READERS = 0b00000100;
        /// The buffer has no writers.
        const NO_WRITERS = 0b00001000;
    }
}

pub type BufferHandle = Handle<(BufferState, BufferState)>;

/// A handle that signifies that the owner is acting as a reader for the
/// buffer. The handle must be returned to the buffer later with
/// [`SharedBuf::remove_reader()`].
///
/// Handles aren't linked to specific buffers, so make sure to only return the
/// handle to the same buffer which you acquired the handle from.
// do not implement copy or clone
pub struct ReaderHandle;

/// See [`ReaderHandle`].
// do not implement copy or clone
pub struct WriterHandle;

impl Drop for ReaderHandle {
    fn drop(&mut self) {
        // don't show the following warning message if panicking
        if std::thread::panicking() {
            return;
        }

        debug_panic!("Dropping ReaderHandle without returning it to SharedBuf.");
    }
}

impl Drop for WriterHandle {
    fn drop(&mut self) {
        // don't show the following warning message if panicking
        if std::thread::panicking() {
            return;
        }

        debug_panic!("Dropping WriterHandle without returning it to SharedBuf.");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_tracks_data_and_parties() {
        CallbackQueue::queue_and_run(|cb_queue| {
            let mut buf = SharedBuf::new(8);
            assert!(buf.state().contains(BufferState::NO_READERS));
            assert!(buf.state().contains(BufferState::NO_WRITERS));
            assert!(!buf.state().contains(BufferState::READABLE));

            let r = buf.add_reader(cb_queue);
            let w = buf.add_writer(cb_queue);
            assert!(!buf.state().contains(BufferState::NO_READERS));
            assert!(!buf.state().contains(BufferState::NO_WRITERS));

            let written = buf.write_stream(&[1u8, 2, 3][..], 3, cb_queue).unwrap();
            assert_eq!(written, 3);
            assert!(buf.state().contains(BufferState::READABLE));

            // fill it up
            let written = buf.write_stream(&[0u8; 16][..], 16, cb_queue).unwrap();
            assert_eq!(written, 5);
            assert!(!buf.state().contains(BufferState::WRITABLE));

            // no space left
            let err = buf.write_stream(&[0u8; 1][..], 1, cb_queue).unwrap_err();
            assert_eq!(err.raw_os_error(), Some(Errno::EAGAIN as i32));

            let mut out = vec![];
            let num = buf.read(&mut out, cb_queue).unwrap();
            assert_eq!(num, 8);
            assert!(buf.state().contains(BufferState::WRITABLE));
            assert!(!buf.state().contains(BufferState::READABLE));

            buf.remove_reader(r, cb_queue);
            buf.remove_writer(w, cb_queue);
        });
    }
}

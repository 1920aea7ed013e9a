use std::sync::Arc;

use atomic_refcell::AtomicRefCell;
use nix::errno::Errno;

use crate::core::support::simulation_time::SimulationTime;
use crate::host::descriptor::shared_buf::{
    BufferHandle, BufferState, ReaderHandle, SharedBuf, WriterHandle,
};
use crate::host::descriptor::{
    FileMode, FileState, FileStatus, StateEventSource, StateListenerFilter,
};
use crate::host::status_listener::StatusListener;
use crate::host::syscall::types::SyscallResult;
use crate::utility::callback_queue::{CallbackQueue, Handle};
use crate::utility::stream_len::StreamLen;

/// Capacity of a pipe's shared buffer, matching the Linux default.
pub const PIPE_BUFFER_SIZE: usize = 65536;

/// One end of a pipe: a read or write view onto a shared buffer.
pub struct Pipe {
    buffer: Option<Arc<AtomicRefCell<SharedBuf>>>,
    event_source: StateEventSource,
    state: FileState,
    mode: FileMode,
    status: FileStatus,
    /// An optional deadline for blocking reads, analogous to a socket receive
    /// timeout. Consulted by the syscall handler when a read would block.
    recv_timeout: Option<SimulationTime>,
    /// Set once a read has observed end-of-stream.
    saw_eof: bool,
    // these handles are never used, but are stored so that the buffer knows
    // this end exists, and so registration is undone when we close
    buffer_event_handle: Option<BufferHandle>,
    reader_handle: Option<ReaderHandle>,
    writer_handle: Option<WriterHandle>,
}

impl Pipe {
    /// Create a new pipe end. The pipe must be connected to a buffer with
    /// [`connect_to_buffer`](Self::connect_to_buffer) before any I/O.
    pub fn new(mode: FileMode, status: FileStatus) -> Self {
        Self {
            buffer: None,
            event_source: StateEventSource::new(),
            state: FileState::ACTIVE,
            mode,
            status,
            recv_timeout: None,
            saw_eof: false,
            buffer_event_handle: None,
            reader_handle: None,
            writer_handle: None,
        }
    }

    pub fn get_status(&self) -> FileStatus {
        self.status
    }

    pub fn set_status(&mut self, status: FileStatus) {
        self.status = status;
    }

    pub fn mode(&self) -> FileMode {
        self.mode
    }

    pub fn state(&self) -> FileState {
        self.state
    }

    pub fn max_size(&self) -> usize {
        self.buffer.as_ref().unwrap().borrow().max_len()
    }

    pub fn recv_timeout(&self) -> Option<SimulationTime> {
        self.recv_timeout
    }

    pub fn set_recv_timeout(&mut self, timeout: Option<SimulationTime>) {
        self.recv_timeout = timeout;
    }

    pub fn supports_sa_restart(&self) -> bool {
        true
    }

    pub fn close(&mut self, cb_queue: &mut CallbackQueue) -> SyscallResult {
        if self.state.contains(FileState::CLOSED) {
            return Err(Errno::EBADF.into());
        }

        // drop the event handle before deregistering from the buffer so that
        // our own listener doesn't see the deregistration
        self.buffer_event_handle.take();

        let buffer = self.buffer.as_ref().unwrap();
        if let Some(handle) = self.reader_handle.take() {
            buffer.borrow_mut().remove_reader(handle, cb_queue);
        }
        if let Some(handle) = self.writer_handle.take() {
            buffer.borrow_mut().remove_writer(handle, cb_queue);
        }

        // set the closed flag and remove the active flag
        self.copy_state(
            FileState::CLOSED | FileState::ACTIVE,
            FileState::CLOSED,
            cb_queue,
        );
        Ok(0.into())
    }

    pub fn read<W>(
        &mut self,
        bytes: W,
        offset: libc::off_t,
        cb_queue: &mut CallbackQueue,
    ) -> SyscallResult
    where
        W: std::io::Write + std::io::Seek,
    {
        // pipes don't support seeking
        if offset != 0 {
            return Err(Errno::ESPIPE.into());
        }

        // if the file is not open for reading, return EBADF
        if !self.mode.contains(FileMode::READ) {
            return Err(Errno::EBADF.into());
        }

        let locally_closed = self.state.contains(FileState::CLOSED);
        let buffer = Arc::clone(self.buffer.as_ref().unwrap());

        // a closed end may still be drained, but once the data is exhausted
        // and end-of-stream has been observed the descriptor is dead
        if locally_closed && !buffer.borrow().has_data() && self.saw_eof {
            return Err(Errno::EBADF.into());
        }

        let mut bytes = bytes;
        let requested = bytes.stream_len_bp()?;
        let num_read = buffer.borrow_mut().read(&mut bytes, cb_queue)?;

        if num_read == 0 && requested != 0 {
            if buffer.borrow().num_writers() == 0 || locally_closed {
                // end-of-stream: no one can add more data
                self.saw_eof = true;
                return Ok(0.into());
            }
            return Err(Errno::EWOULDBLOCK.into());
        }

        Ok(num_read.into())
    }

    pub fn write<R>(
        &mut self,
        bytes: R,
        offset: libc::off_t,
        cb_queue: &mut CallbackQueue,
    ) -> SyscallResult
    where
        R: std::io::Read + std::io::Seek,
    {
        // pipes don't support seeking
        if offset != 0 {
            return Err(Errno::ESPIPE.into());
        }

        // if the file is not open for writing, return EBADF
        if !self.mode.contains(FileMode::WRITE) {
            return Err(Errno::EBADF.into());
        }

        if self.state.contains(FileState::CLOSED) {
            return Err(Errno::EBADF.into());
        }

        let buffer = Arc::clone(self.buffer.as_ref().unwrap());

        // no reader will ever drain the buffer
        if buffer.borrow().num_readers() == 0 {
            return Err(Errno::EPIPE.into());
        }

        let mut bytes = bytes;
        let len: usize = bytes.stream_len_bp()?.try_into().unwrap();
        let num_written = buffer
            .borrow_mut()
            .write_stream(bytes.by_ref(), len, cb_queue)?;

        Ok(num_written.into())
    }

    /// Connect this end to its buffer: register as a reader and/or writer
    /// according to the mode, and begin mirroring the buffer's state.
    pub fn connect_to_buffer(
        arc: &Arc<AtomicRefCell<Self>>,
        buffer: Arc<AtomicRefCell<SharedBuf>>,
        cb_queue: &mut CallbackQueue,
    ) {
        let weak = Arc::downgrade(arc);
        let pipe = &mut *arc.borrow_mut();

        pipe.buffer = Some(Arc::clone(&buffer));

        if pipe.mode.contains(FileMode::READ) {
            pipe.reader_handle = Some(buffer.borrow_mut().add_reader(cb_queue));
        }
        if pipe.mode.contains(FileMode::WRITE) {
            pipe.writer_handle = Some(buffer.borrow_mut().add_writer(cb_queue));
        }

        // remove any buffer state bits that aren't relevant to us
        let monitoring = pipe.filter_state(FileState::READABLE | FileState::WRITABLE);

        let handle = buffer.borrow_mut().add_listener(
            BufferState::READABLE | BufferState::WRITABLE | BufferState::NO_WRITERS,
            move |buffer_state, cb_queue| {
                // if the file hasn't been dropped
                if let Some(pipe) = weak.upgrade() {
                    let mut pipe = pipe.borrow_mut();
                    let mut file_state = FileState::empty();
                    file_state.set(
                        FileState::READABLE,
                        buffer_state
                            .intersects(BufferState::READABLE | BufferState::NO_WRITERS),
                    );
                    file_state
                        .set(FileState::WRITABLE, buffer_state.contains(BufferState::WRITABLE));
                    pipe.copy_state(monitoring, file_state, cb_queue);
                }
            },
        );
        pipe.buffer_event_handle = Some(handle);

        // seed the initial state from the buffer
        let buffer_state = buffer.borrow().state();
        let mut file_state = FileState::empty();
        file_state.set(
            FileState::READABLE,
            buffer_state.intersects(BufferState::READABLE | BufferState::NO_WRITERS),
        );
        file_state.set(FileState::WRITABLE, buffer_state.contains(BufferState::WRITABLE));
        pipe.copy_state(monitoring, file_state, cb_queue);
    }

    pub fn add_listener(
        &mut self,
        monitoring: FileState,
        filter: StateListenerFilter,
        notify_fn: impl Fn(FileState, FileState, &mut CallbackQueue) + Send + Sync + 'static,
    ) -> Handle<(FileState, FileState)> {
        self.event_source.add_listener(monitoring, filter, notify_fn)
    }

    pub fn add_status_listener(&mut self, listener: &Arc<StatusListener>) {
        self.event_source.add_status_listener(listener);
    }

    pub fn remove_status_listener(&mut self, listener: &Arc<StatusListener>) {
        self.event_source.remove_status_listener(listener);
    }

    fn filter_state(&self, mut state: FileState) -> FileState {
        // if not open for reading, remove the readable flag
        if !self.mode.contains(FileMode::READ) {
            state.remove(FileState::READABLE);
        }

        // if not open for writing, remove the writable flag
        if !self.mode.contains(FileMode::WRITE) {
            state.remove(FileState::WRITABLE);
        }

        state
    }

    fn copy_state(&mut self, mask: FileState, state: FileState, cb_queue: &mut CallbackQueue) {
        let old_state = self.state;

        // remove any flags that aren't relevant
        let state = self.filter_state(state);

        // remove the masked flags, then copy the masked flags
        self.state.remove(mask);
        self.state.insert(state & mask);

        self.handle_state_change(old_state, cb_queue);
    }

    fn handle_state_change(&mut self, old_state: FileState, cb_queue: &mut CallbackQueue) {
        let states_changed = self.state ^ old_state;

        // if nothing changed
        if states_changed.is_empty() {
            return;
        }

        self.event_source
            .notify_listeners(self.state, states_changed, cb_queue);
    }
}

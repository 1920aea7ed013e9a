use std::collections::HashMap;
use std::sync::atomic::{AtomicI32, AtomicU32, Ordering};
use std::sync::Arc;

use atomic_refcell::{AtomicRef, AtomicRefCell, AtomicRefMut};
use nix::fcntl::OFlag;
use static_assertions::assert_impl_all;

use crate::host::status_listener::StatusListener;
use crate::host::syscall::types::SyscallResult;
use crate::utility::callback_queue::{CallbackQueue, EventSource, Handle};
use crate::utility::{IsSend, IsSync};

use pipe::Pipe;

pub mod descriptor_table;
pub mod pipe;
pub mod shared_buf;

bitflags::bitflags! {
    /// These are flags that can potentially be changed from the monitored
    /// process (analogous to the Linux `filp->f_flags` status flags). Not all
    /// `O_` flags are valid here. For example file access mode flags (ex:
    /// `O_RDWR`) are stored elsewhere, and file creation flags (ex:
    /// `O_CREAT`) are not stored anywhere.
    #[derive(Copy, Clone, Debug, PartialEq, Eq)]
    pub struct FileStatus: libc::c_int {
        const NONBLOCK = libc::O_NONBLOCK;
        const APPEND = libc::O_APPEND;
        const ASYNC = libc::O_ASYNC;
        const DIRECT = libc::O_DIRECT;
        const NOATIME = libc::O_NOATIME;
    }
}

impl FileStatus {
    pub fn as_o_flags(&self) -> OFlag {
        OFlag::from_bits(self.bits()).unwrap()
    }

    /// Returns a tuple of the `FileStatus` and any remaining flags.
    pub fn from_o_flags(flags: OFlag) -> (Self, OFlag) {
        let status = Self::from_bits_truncate(flags.bits());
        let remaining = flags.bits() & !status.bits();
        (status, OFlag::from_bits(remaining).unwrap())
    }
}

bitflags::bitflags! {
    /// These are flags that should generally not change (analogous to the
    /// Linux `filp->f_mode`). Since the monitored process will never see
    /// these values and they're not exposed by the kernel, we don't match the
    /// kernel `FMODE_` values here.
    #[derive(Copy, Clone, Debug, PartialEq, Eq)]
    pub struct FileMode: u32 {
        const READ = 0b00000001;
        const WRITE = 0b00000010;
    }
}

impl FileMode {
    pub fn as_o_flags(&self) -> OFlag {
        const READ_AND_WRITE: FileMode = FileMode::READ.union(FileMode::WRITE);
        const EMPTY: FileMode = FileMode::empty();

        match *self {
            READ_AND_WRITE => OFlag::O_RDWR,
            Self::READ => OFlag::O_RDONLY,
            Self::WRITE => OFlag::O_WRONLY,
            // a linux-specific flag
            EMPTY => OFlag::O_PATH,
            _ => panic!("Invalid file mode flags"),
        }
    }

    /// Returns a tuple of the `FileMode` and any remaining flags, or an empty
    /// `Err` if the flags aren't valid (for example specifying both `O_RDWR`
    /// and `O_WRONLY`).
    pub fn from_o_flags(flags: OFlag) -> Result<(Self, OFlag), ()> {
        // apply the access mode mask (the O_PATH flag is not contained within
        // the access mode mask, so we need to add it separately)
        let mode = flags & (OFlag::O_ACCMODE | OFlag::O_PATH);
        let remaining = flags - (OFlag::O_ACCMODE | OFlag::O_PATH);

        let mode = match mode {
            OFlag::O_RDONLY => FileMode::READ,
            OFlag::O_WRONLY => FileMode::WRITE,
            OFlag::O_RDWR => FileMode::READ | FileMode::WRITE,
            OFlag::O_PATH => FileMode::empty(),
            _ => return Err(()),
        };

        Ok((mode, remaining))
    }
}

bitflags::bitflags! {
    #[derive(Default, Copy, Clone, Debug, PartialEq, Eq)]
    pub struct FileState: u8 {
        /// Has been initialized and it is now OK to unblock any monitored
        /// thread waiting on a particular state.
        const ACTIVE = 0b00000001;
        /// Can be read, i.e. there is data waiting for the user.
        const READABLE = 0b00000010;
        /// Can be written, i.e. there is available buffer space.
        const WRITABLE = 0b00000100;
        /// A close operation has run on the file.
        const CLOSED = 0b00001000;
    }
}

#[derive(Clone, Copy, Debug)]
pub enum StateListenerFilter {
    Never,
    OffToOn,
    OnToOff,
    Always,
}

/// An event source for file state transitions. Supports both closure
/// listeners and attached reference-counted [`StatusListener`] objects.
pub struct StateEventSource {
    inner: EventSource<(FileState, FileState)>,
    // attached listeners, keyed by the address of their shared allocation so
    // that attach/detach pairs match up without comparing trait objects
    status_listener_handles: HashMap<usize, Handle<(FileState, FileState)>>,
}

impl StateEventSource {
    pub fn new() -> Self {
        Self {
            inner: EventSource::new(),
            status_listener_handles: HashMap::new(),
        }
    }

    pub fn add_listener(
        &mut self,
        monitoring: FileState,
        filter: StateListenerFilter,
        notify_fn: impl Fn(FileState, FileState, &mut CallbackQueue) + Send + Sync + 'static,
    ) -> Handle<(FileState, FileState)> {
        self.inner.add_listener(move |(state, changed), cb_queue| {
            // true if any of the bits we're monitoring have changed
            let flipped = monitoring.intersects(changed);

            // true if any of the bits we're monitoring are set
            let on = monitoring.intersects(state);

            let notify = match filter {
                StateListenerFilter::OffToOn => flipped && on,
                StateListenerFilter::OnToOff => flipped && !on,
                StateListenerFilter::Always => flipped,
                StateListenerFilter::Never => false,
            };

            if !notify {
                return;
            }

            (notify_fn)(state, changed, cb_queue)
        })
    }

    /// Attach a status listener. The listener's reference count is
    /// incremented for as long as it stays attached.
    pub fn add_status_listener(&mut self, listener: &Arc<StatusListener>) {
        let key = Arc::as_ptr(listener) as usize;

        // if it's already attached, don't attach a second time
        if self.status_listener_handles.contains_key(&key) {
            return;
        }

        // the closure owns a clone of the listener; dropping the handle
        // releases it
        let listener = Arc::clone(listener);
        let handle = self.inner.add_listener(move |(state, changed), _cb_queue| {
            listener.handle_status_change(state, changed)
        });

        self.status_listener_handles.insert(key, handle);
    }

    pub fn remove_status_listener(&mut self, listener: &Arc<StatusListener>) {
        self.status_listener_handles
            .remove(&(Arc::as_ptr(listener) as usize));
    }

    pub fn notify_listeners(
        &mut self,
        state: FileState,
        changed: FileState,
        cb_queue: &mut CallbackQueue,
    ) {
        self.inner.notify_listeners((state, changed), cb_queue)
    }
}

impl Default for StateEventSource {
    fn default() -> Self {
        Self::new()
    }
}

/// Represents a POSIX file description, or a Linux "struct file". The inner
/// file object is reference-counted; cloning a `PosixFile` is acquiring a new
/// reference to the same open file.
#[derive(Clone)]
pub enum PosixFile {
    Pipe(Arc<AtomicRefCell<Pipe>>),
}

// will not compile if `PosixFile` is not Send + Sync
impl IsSend for PosixFile {}
impl IsSync for PosixFile {}
assert_impl_all!(PosixFile: Send, Sync);

impl PosixFile {
    pub fn borrow(&self) -> PosixFileRef {
        match self {
            Self::Pipe(f) => PosixFileRef::Pipe(f.borrow()),
        }
    }

    pub fn borrow_mut(&self) -> PosixFileRefMut {
        match self {
            Self::Pipe(f) => PosixFileRefMut::Pipe(f.borrow_mut()),
        }
    }

    /// The number of live references to the inner file object.
    pub fn ref_count(&self) -> usize {
        match self {
            Self::Pipe(f) => Arc::strong_count(f),
        }
    }

    /// Two posix file objects refer to the same underlying open file iff
    /// their canonical handles are equal.
    pub fn canonical_handle(&self) -> usize {
        match self {
            Self::Pipe(f) => Arc::as_ptr(f) as usize,
        }
    }
}

impl std::fmt::Debug for PosixFile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pipe(_) => write!(f, "Pipe")?,
        }
        let file = self.borrow();
        write!(
            f,
            "(state: {:?}, status: {:?})",
            file.state(),
            file.get_status()
        )
    }
}

pub enum PosixFileRef<'a> {
    Pipe(AtomicRef<'a, Pipe>),
}

impl PosixFileRef<'_> {
    pub fn state(&self) -> FileState {
        match self {
            Self::Pipe(f) => f.state(),
        }
    }

    pub fn mode(&self) -> FileMode {
        match self {
            Self::Pipe(f) => f.mode(),
        }
    }

    pub fn get_status(&self) -> FileStatus {
        match self {
            Self::Pipe(f) => f.get_status(),
        }
    }

    pub fn supports_sa_restart(&self) -> bool {
        match self {
            Self::Pipe(f) => f.supports_sa_restart(),
        }
    }

    pub fn recv_timeout(&self) -> Option<crate::core::support::simulation_time::SimulationTime> {
        match self {
            Self::Pipe(f) => f.recv_timeout(),
        }
    }
}

pub enum PosixFileRefMut<'a> {
    Pipe(AtomicRefMut<'a, Pipe>),
}

impl PosixFileRefMut<'_> {
    pub fn state(&self) -> FileState {
        match self {
            Self::Pipe(f) => f.state(),
        }
    }

    pub fn mode(&self) -> FileMode {
        match self {
            Self::Pipe(f) => f.mode(),
        }
    }

    pub fn get_status(&self) -> FileStatus {
        match self {
            Self::Pipe(f) => f.get_status(),
        }
    }

    pub fn set_status(&mut self, status: FileStatus) {
        match self {
            Self::Pipe(f) => f.set_status(status),
        }
    }

    pub fn close(&mut self, cb_queue: &mut CallbackQueue) -> SyscallResult {
        match self {
            Self::Pipe(f) => f.close(cb_queue),
        }
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
        match self {
            Self::Pipe(f) => f.read(bytes, offset, cb_queue),
        }
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
        match self {
            Self::Pipe(f) => f.write(bytes, offset, cb_queue),
        }
    }

    pub fn add_listener(
        &mut self,
        monitoring: FileState,
        filter: StateListenerFilter,
        notify_fn: impl Fn(FileState, FileState, &mut CallbackQueue) + Send + Sync + 'static,
    ) -> Handle<(FileState, FileState)> {
        match self {
            Self::Pipe(f) => f.add_listener(monitoring, filter, notify_fn),
        }
    }

    pub fn add_status_listener(&mut self, listener: &Arc<StatusListener>) {
        match self {
            Self::Pipe(f) => f.add_status_listener(listener),
        }
    }

    pub fn remove_status_listener(&mut self, listener: &Arc<StatusListener>) {
        match self {
            Self::Pipe(f) => f.remove_status_listener(listener),
        }
    }
}

bitflags::bitflags! {
    // Linux only supports a single descriptor flag:
    // https://www.gnu.org/software/libc/manual/html_node/Descriptor-Flags.html
    #[derive(Default, Copy, Clone, Debug, PartialEq, Eq)]
    pub struct DescriptorFlags: libc::c_int {
        const CLOEXEC = libc::FD_CLOEXEC;
    }
}

impl DescriptorFlags {
    pub fn as_o_flags(&self) -> OFlag {
        let mut flags = OFlag::empty();
        if self.contains(Self::CLOEXEC) {
            flags.insert(OFlag::O_CLOEXEC);
        }
        flags
    }

    /// Returns a tuple of the `DescriptorFlags` and any remaining flags.
    pub fn from_o_flags(flags: OFlag) -> (Self, OFlag) {
        let mut remaining = flags;
        let mut flags = Self::empty();

        if remaining.contains(OFlag::O_CLOEXEC) {
            remaining.remove(OFlag::O_CLOEXEC);
            flags.insert(Self::CLOEXEC);
        }

        (flags, remaining)
    }
}

/// A new-model descriptor: a file-table entry pointing at a reference-counted
/// posix file object.
#[derive(Clone, Debug)]
pub struct Descriptor {
    /// The PosixFile that this descriptor points to.
    file: PosixFile,
    /// Descriptor flags.
    flags: DescriptorFlags,
    /// A count of how many open descriptors there are with reference to this
    /// file. Since a reference to the file can be held by other objects (e.g.
    /// a blocked syscall's condition), it should be true that
    /// `Arc::strong_count(&self.open_count) <= file.ref_count()`.
    open_count: Arc<()>,
}

impl Descriptor {
    pub fn new(file: PosixFile) -> Self {
        Self {
            file,
            flags: DescriptorFlags::empty(),
            open_count: Arc::new(()),
        }
    }

    pub fn get_file(&self) -> &PosixFile {
        &self.file
    }

    pub fn get_flags(&self) -> DescriptorFlags {
        self.flags
    }

    pub fn set_flags(&mut self, flags: DescriptorFlags) {
        self.flags = flags;
    }

    /// Close the descriptor, and if this is the last descriptor pointing to
    /// its file, close the file as well.
    pub fn close(self, cb_queue: &mut CallbackQueue) -> Option<SyscallResult> {
        // this isn't subject to race conditions since we should never access
        // descriptors from multiple threads at the same time
        if Arc::<()>::strong_count(&self.open_count) == 1 {
            Some(self.file.borrow_mut().close(cb_queue))
        } else {
            None
        }
    }

    /// Duplicate the descriptor, with both descriptors pointing to the same
    /// file. In Linux the descriptor flags aren't typically copied to the new
    /// descriptor, so we explicitly require a flags value to avoid confusion.
    pub fn dup(&self, flags: DescriptorFlags) -> Self {
        let mut new_desc = self.clone();
        new_desc.set_flags(flags);
        new_desc
    }
}

/// The concrete kind of a legacy descriptor object.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum LegacyFileKind {
    File,
    TcpSocket,
    UdpSocket,
}

/// An older-generation descriptor object carrying its own explicit reference
/// count. The count is mutated only through [`OwnedLegacyFile`]; subsystems
/// outside this module hold owned or borrowed handles, never the count
/// itself.
#[derive(Debug)]
pub struct LegacyFile {
    kind: LegacyFileKind,
    ref_count: AtomicU32,
    // the OS-visible handle this object is registered under, or -1
    handle: AtomicI32,
}

impl LegacyFile {
    /// Create a legacy file with a reference count of one. The caller owns
    /// that reference; wrap it in an [`OwnedLegacyFile`] to release it.
    pub fn new(kind: LegacyFileKind) -> Arc<Self> {
        Arc::new(Self {
            kind,
            ref_count: AtomicU32::new(1),
            handle: AtomicI32::new(-1),
        })
    }

    pub fn kind(&self) -> LegacyFileKind {
        self.kind
    }

    pub fn ref_count(&self) -> u32 {
        self.ref_count.load(Ordering::Relaxed)
    }

    pub fn handle(&self) -> Option<u32> {
        let handle = self.handle.load(Ordering::Relaxed);
        u32::try_from(handle).ok()
    }

    pub fn set_handle(&self, handle: Option<u32>) {
        let handle = match handle {
            Some(x) => x.try_into().unwrap(),
            None => -1,
        };
        self.handle.store(handle, Ordering::Relaxed);
    }

    fn ref_inc(&self) {
        let prev = self.ref_count.fetch_add(1, Ordering::Relaxed);
        assert_ne!(prev, 0, "reviving a fully-released legacy file");
    }

    fn ref_dec(&self) {
        let prev = self.ref_count.fetch_sub(1, Ordering::Relaxed);
        assert_ne!(prev, 0, "releasing a legacy file reference twice");
    }
}

/// Represents an owned reference to a legacy file. Will decrement the file's
/// ref count when dropped.
#[derive(Debug)]
pub struct OwnedLegacyFile(Arc<LegacyFile>);

impl OwnedLegacyFile {
    /// Takes ownership of an existing reference to the legacy file; the
    /// file's ref count is *not* incremented, but will be decremented when
    /// dropped.
    pub fn new(file: Arc<LegacyFile>) -> Self {
        Self(file)
    }

    /// Acquire an additional owned reference, incrementing the ref count.
    pub fn new_ref(&self) -> Self {
        self.0.ref_inc();
        Self(Arc::clone(&self.0))
    }

    /// A non-owning borrow of the legacy file; must not outlive this owned
    /// reference.
    pub fn get(&self) -> &LegacyFile {
        &self.0
    }
}

impl Drop for OwnedLegacyFile {
    fn drop(&mut self) {
        self.0.ref_dec();
    }
}

/// A file-table entry in either descriptor representation.
// don't implement copy or clone without considering the legacy file's ref
// count
#[derive(Debug)]
pub enum CompatDescriptor {
    New(Descriptor),
    Legacy(OwnedLegacyFile),
}

// will not compile if `CompatDescriptor` is not Send + Sync
impl IsSend for CompatDescriptor {}
impl IsSync for CompatDescriptor {}
assert_impl_all!(CompatDescriptor: Send, Sync);

impl CompatDescriptor {
    /// Wrap a legacy file reference. Ownership of that one reference
    /// transfers to the new compat descriptor (no increment); the reference
    /// is released exactly once, when the compat descriptor is dropped.
    pub fn from_legacy(legacy: OwnedLegacyFile) -> Self {
        Self::Legacy(legacy)
    }

    /// If this is a legacy descriptor, a non-owning borrow of the legacy
    /// object. The ref count is not modified, so the borrow must not outlive
    /// the compat descriptor.
    pub fn as_legacy(&self) -> Option<&LegacyFile> {
        match self {
            Self::Legacy(f) => Some(f.get()),
            Self::New(_) => None,
        }
    }

    /// If this is a new descriptor, a non-owning borrow of the posix file
    /// object. The ref count is not modified, so the borrow must not outlive
    /// the compat descriptor.
    pub fn borrow_posix_file(&self) -> Option<&PosixFile> {
        match self {
            Self::New(d) => Some(d.get_file()),
            Self::Legacy(_) => None,
        }
    }

    /// If this is a new descriptor, an owned reference to the posix file
    /// object. The file's ref count is incremented; the count drops back when
    /// the returned file is dropped, which must happen exactly once.
    pub fn new_ref_posix_file(&self) -> Option<PosixFile> {
        match self {
            Self::New(d) => Some(d.get_file().clone()),
            Self::Legacy(_) => None,
        }
    }

    /// Update the OS-visible handle associated with the descriptor.
    /// This is a no-op for non-legacy descriptors.
    pub fn set_handle(&mut self, handle: Option<u32>) {
        if let CompatDescriptor::Legacy(f) = self {
            f.get().set_handle(handle)
        }
        // new descriptor types don't store their file handle, so do nothing
    }

    /// Duplicate the descriptor. For a new descriptor this shares the file
    /// and bumps the open count; for a legacy descriptor it acquires a new
    /// owned reference.
    pub fn dup(&self, flags: DescriptorFlags) -> Self {
        match self {
            Self::New(d) => Self::New(d.dup(flags)),
            Self::Legacy(f) => Self::Legacy(f.new_ref()),
        }
    }

    /// Close the descriptor, releasing one inner reference of whichever kind
    /// is present.
    pub fn close(self, cb_queue: &mut CallbackQueue) -> Option<SyscallResult> {
        match self {
            Self::New(d) => d.close(cb_queue),
            // the legacy object's teardown is run by the legacy subsystem
            // that owns it; this releases our reference (on drop)
            Self::Legacy(_) => Some(Ok(0.into())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::descriptor::shared_buf::SharedBuf;

    fn new_pipe_file(mode: FileMode) -> PosixFile {
        let buffer = Arc::new(AtomicRefCell::new(SharedBuf::new(1024)));
        let pipe = Arc::new(AtomicRefCell::new(Pipe::new(mode, FileStatus::empty())));
        CallbackQueue::queue_and_run(|cb_queue| {
            Pipe::connect_to_buffer(&pipe, buffer, cb_queue);
        });
        PosixFile::Pipe(pipe)
    }

    #[test]
    fn test_from_legacy_releases_exactly_once() {
        let legacy = LegacyFile::new(LegacyFileKind::TcpSocket);
        let probe = Arc::clone(&legacy);
        assert_eq!(probe.ref_count(), 1);

        let desc = CompatDescriptor::from_legacy(OwnedLegacyFile::new(legacy));
        // ownership transfer: no increment
        assert_eq!(probe.ref_count(), 1);
        assert_eq!(
            desc.as_legacy().unwrap().kind(),
            LegacyFileKind::TcpSocket
        );

        drop(desc);
        assert_eq!(probe.ref_count(), 0);
    }

    #[test]
    fn test_legacy_dup_balances_references() {
        let legacy = LegacyFile::new(LegacyFileKind::UdpSocket);
        let probe = Arc::clone(&legacy);

        let desc = CompatDescriptor::from_legacy(OwnedLegacyFile::new(legacy));
        let dup = desc.dup(DescriptorFlags::empty());
        assert_eq!(probe.ref_count(), 2);

        drop(dup);
        assert_eq!(probe.ref_count(), 1);
        drop(desc);
        assert_eq!(probe.ref_count(), 0);
    }

    #[test]
    fn test_set_handle_applies_to_legacy_only() {
        let legacy = LegacyFile::new(LegacyFileKind::File);
        let probe = Arc::clone(&legacy);
        let mut desc = CompatDescriptor::from_legacy(OwnedLegacyFile::new(legacy));

        desc.set_handle(Some(7));
        assert_eq!(probe.handle(), Some(7));
        desc.set_handle(None);
        assert_eq!(probe.handle(), None);

        // a no-op for new descriptors
        let mut desc = CompatDescriptor::New(Descriptor::new(new_pipe_file(FileMode::READ)));
        desc.set_handle(Some(3));
        assert!(desc.as_legacy().is_none());
    }

    #[test]
    fn test_new_ref_posix_file_counts() {
        let file = new_pipe_file(FileMode::READ);
        let base_count = file.ref_count();

        let desc = CompatDescriptor::New(Descriptor::new(file.clone()));
        assert_eq!(file.ref_count(), base_count + 1);

        // borrow: no count change
        assert!(desc.borrow_posix_file().is_some());
        assert_eq!(file.ref_count(), base_count + 1);

        // new ref + matching drop: net zero
        let new_ref = desc.new_ref_posix_file().unwrap();
        assert_eq!(file.ref_count(), base_count + 2);
        assert_eq!(new_ref.canonical_handle(), file.canonical_handle());
        drop(new_ref);
        assert_eq!(file.ref_count(), base_count + 1);

        // omitting the drop leaves the count incremented by one
        let leaked = desc.new_ref_posix_file().unwrap();
        assert_eq!(file.ref_count(), base_count + 2);
        std::mem::forget(leaked);
        assert_eq!(file.ref_count(), base_count + 2);
    }

    #[test]
    fn test_descriptor_close_runs_on_last_open() {
        let file = new_pipe_file(FileMode::READ);
        let desc = Descriptor::new(file.clone());
        let dup = desc.dup(DescriptorFlags::CLOEXEC);

        // not the last descriptor; the file stays open
        let rv = CallbackQueue::queue_and_run(|cb_queue| desc.close(cb_queue));
        assert!(rv.is_none());
        assert!(!file.borrow().state().contains(FileState::CLOSED));

        let rv = CallbackQueue::queue_and_run(|cb_queue| dup.close(cb_queue));
        assert!(rv.is_some());
        assert!(file.borrow().state().contains(FileState::CLOSED));
    }

    #[test]
    fn test_status_and_descriptor_o_flags() {
        let (status, remaining) =
            FileStatus::from_o_flags(OFlag::O_NONBLOCK | OFlag::O_APPEND | OFlag::O_CLOEXEC);
        assert_eq!(status, FileStatus::NONBLOCK | FileStatus::APPEND);
        assert_eq!(remaining, OFlag::O_CLOEXEC);
        assert_eq!(status.as_o_flags(), OFlag::O_NONBLOCK | OFlag::O_APPEND);

        let (flags, remaining) = DescriptorFlags::from_o_flags(OFlag::O_CLOEXEC | OFlag::O_APPEND);
        assert_eq!(flags, DescriptorFlags::CLOEXEC);
        assert_eq!(remaining, OFlag::O_APPEND);
        assert_eq!(flags.as_o_flags(), OFlag::O_CLOEXEC);
    }

    #[test]
    fn test_file_mode_o_flags() {
        // test from O flags to FileMode
        assert_eq!(
            FileMode::from_o_flags(OFlag::O_PATH),
            Ok((FileMode::empty(), OFlag::empty()))
        );
        assert_eq!(
            FileMode::from_o_flags(OFlag::O_WRONLY),
            Ok((FileMode::WRITE, OFlag::empty()))
        );
        assert_eq!(
            FileMode::from_o_flags(OFlag::O_RDWR),
            Ok((FileMode::READ | FileMode::WRITE, OFlag::empty()))
        );
        assert_eq!(
            FileMode::from_o_flags(OFlag::O_RDONLY),
            Ok((FileMode::READ, OFlag::empty()))
        );
        assert_eq!(
            FileMode::from_o_flags(OFlag::O_RDWR | OFlag::O_WRONLY),
            Err(())
        );
        assert_eq!(
            FileMode::from_o_flags(OFlag::O_PATH | OFlag::O_WRONLY),
            Err(())
        );
        assert_eq!(
            FileMode::from_o_flags(OFlag::O_WRONLY | OFlag::O_CLOEXEC),
            Ok((FileMode::WRITE, OFlag::O_CLOEXEC))
        );

        // test from FileMode to O flags
        assert_eq!(FileMode::as_o_flags(&FileMode::empty()), OFlag::O_PATH);
        assert_eq!(FileMode::as_o_flags(&FileMode::READ), OFlag::O_RDONLY);
        assert_eq!(FileMode::as_o_flags(&FileMode::WRITE), OFlag::O_WRONLY);
        assert_eq!(
            FileMode::as_o_flags(&(FileMode::READ | FileMode::WRITE)),
            OFlag::O_RDWR
        );
    }
}

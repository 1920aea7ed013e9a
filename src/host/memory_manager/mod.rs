//! Access and manage memory of a monitored process.
//!
//! The starting point for the public API is [`MemoryManager`], which can be
//! used to:
//!
//! * directly read or write monitored-process memory
//! * obtain smart pointers ([`ProcessMemoryRef`] and [`ProcessMemoryRefMut`])
//!   to monitored memory
//! * obtain cursors to monitored memory implementing `std::io::Seek` and
//!   either `std::io::Read` or `std::io::Write` ([`MemoryReaderCursor`] and
//!   [`MemoryWriterCursor`])
//!
//! For the [`MemoryManager`] to maintain a consistent view of the process's
//! address space, and for it to be able to enforce Rust's safety requirements
//! for references and sharing, all access to process memory must go through
//! it. This includes servicing the syscalls that modify the process address
//! space (such as `mmap`).

use std::fmt::Debug;

use log::*;
use nix::errno::Errno;
use nix::sys::mman::{MapFlags, ProtFlags};
use once_cell::sync::Lazy;

use bytemuck::{Pod, Zeroable};
use memory_copier::MemoryCopier;
use memory_mapper::MemoryMapper;

use crate::host::process::ProcessId;
use crate::host::syscall::types::{ForeignArrayPtr, ForeignPtr};
use crate::host::thread::Thread;

mod memory_copier;
mod memory_mapper;

pub(crate) fn page_size() -> usize {
    static PAGE_SIZE: Lazy<usize> = Lazy::new(|| {
        nix::unistd::sysconf(nix::unistd::SysconfVar::PAGE_SIZE)
            .unwrap()
            .unwrap()
            .try_into()
            .unwrap()
    });
    *PAGE_SIZE
}

pub(crate) fn round_up_page(x: usize) -> usize {
    x.next_multiple_of(page_size())
}

/// An object implementing std::io::Read and std::io::Seek for a range of
/// monitored-process memory.
pub struct MemoryReaderCursor<'a> {
    memory_manager: &'a MemoryManager,
    ptr: ForeignArrayPtr<u8>,
    offset: usize,
}

impl std::io::Read for MemoryReaderCursor<'_> {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        let ptr = self.ptr.slice(self.offset..);
        let toread = std::cmp::min(buf.len(), ptr.len());
        if toread == 0 {
            return Ok(0);
        }
        self.memory_manager
            .copy_from_ptr(&mut buf[..toread], ptr.slice(..toread))
            .map_err(|e| std::io::Error::from_raw_os_error(e as i32))?;
        self.offset += toread;
        Ok(toread)
    }
}

/// Shared implementation of seek for both MemoryReaderCursor and
/// MemoryWriterCursor.
fn seek_helper(offset: &mut usize, len: usize, pos: std::io::SeekFrom) -> std::io::Result<u64> {
    use std::io::SeekFrom;
    let new_offset = match pos {
        SeekFrom::Current(x) => *offset as i64 + x,
        SeekFrom::End(x) => len as i64 + x,
        SeekFrom::Start(x) => x as i64,
    };
    // Seeking before the beginning is an error (but seeking to or past the
    // end isn't).
    if new_offset < 0 {
        return Err(std::io::Error::from_raw_os_error(Errno::EFAULT as i32));
    }
    *offset = new_offset as usize;
    Ok(new_offset as u64)
}

impl std::io::Seek for MemoryReaderCursor<'_> {
    fn seek(&mut self, pos: std::io::SeekFrom) -> std::io::Result<u64> {
        seek_helper(&mut self.offset, self.ptr.len(), pos)
    }
}

/// An object implementing std::io::Write and std::io::Seek for a range of
/// monitored-process memory.
pub struct MemoryWriterCursor<'a> {
    memory_manager: &'a mut MemoryManager,
    ptr: ForeignArrayPtr<u8>,
    offset: usize,
}

impl std::io::Write for MemoryWriterCursor<'_> {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        let ptr = self.ptr.slice(self.offset..);
        let towrite = std::cmp::min(buf.len(), ptr.len());
        if towrite == 0 {
            return Ok(0);
        }
        self.memory_manager
            .copy_to_ptr(ptr.slice(..towrite), &buf[..towrite])
            .map_err(|e| std::io::Error::from_raw_os_error(e as i32))?;
        self.offset += towrite;
        Ok(towrite)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

impl std::io::Seek for MemoryWriterCursor<'_> {
    fn seek(&mut self, pos: std::io::SeekFrom) -> std::io::Result<u64> {
        seek_helper(&mut self.offset, self.ptr.len(), pos)
    }
}

#[derive(Debug)]
enum CopiedOrMapped<'a, T: Debug + Pod> {
    // data copied from monitored memory
    Copied(Vec<T>),
    // data mapped directly from monitored memory
    Mapped(&'a [T]),
}

/// An immutable reference to a slice of monitored-process memory. Implements
/// `Deref<[T]>`. The reference's validity is bounded by the borrow of the
/// [`MemoryManager`] that produced it.
#[derive(Debug)]
pub struct ProcessMemoryRef<'a, T: Debug + Pod>(CopiedOrMapped<'a, T>);

impl<T: Debug + Pod> ProcessMemoryRef<'_, T> {
    fn new_copied(v: Vec<T>) -> Self {
        Self(CopiedOrMapped::Copied(v))
    }

    fn new_mapped(s: &[T]) -> ProcessMemoryRef<'_, T> {
        ProcessMemoryRef(CopiedOrMapped::Mapped(s))
    }
}

impl<T> std::ops::Deref for ProcessMemoryRef<'_, T>
where
    T: Debug + Pod,
{
    type Target = [T];

    fn deref(&self) -> &Self::Target {
        match &self.0 {
            CopiedOrMapped::Copied(v) => v,
            CopiedOrMapped::Mapped(s) => s,
        }
    }
}

#[derive(Debug)]
enum CopiedOrMappedMut<'a, T: Debug + Pod> {
    // data copied from monitored memory, to be written back
    Copied(MemoryCopier, ForeignArrayPtr<T>, Vec<T>),
    // memory-mapped monitored memory
    Mapped(&'a mut [T]),
}

/// A mutable reference to a slice of monitored-process memory. Implements
/// `DerefMut<[T]>`.
///
/// The object must be disposed of by calling `flush` or `noflush`. Dropping
/// the object without doing so will result in a panic.
#[derive(Debug)]
pub struct ProcessMemoryRefMut<'a, T: Debug + Pod> {
    copied_or_mapped: CopiedOrMappedMut<'a, T>,
    dirty: bool,
}

impl<T: Debug + Pod> ProcessMemoryRefMut<'_, T> {
    fn new_copied(copier: MemoryCopier, ptr: ForeignArrayPtr<T>, v: Vec<T>) -> Self {
        Self {
            copied_or_mapped: CopiedOrMappedMut::Copied(copier, ptr, v),
            dirty: true,
        }
    }

    fn new_mapped(s: &mut [T]) -> ProcessMemoryRefMut<'_, T> {
        ProcessMemoryRefMut {
            copied_or_mapped: CopiedOrMappedMut::Mapped(s),
            dirty: true,
        }
    }

    /// Call to dispose of the reference while writing back the contents to
    /// monitored memory (if it hasn't already effectively been done).
    ///
    /// WARNING: if this reference was obtained via
    /// [`MemoryManager::memory_ref_mut_uninit`], and the contents haven't
    /// been overwritten, call `noflush` instead to avoid flushing back the
    /// uninitialized contents.
    pub fn flush(mut self) -> Result<(), Errno> {
        // Whether the flush succeeds or not, the buffer is no longer
        // considered dirty; the fact that it failed will be captured in an
        // error result.
        self.dirty = false;

        match &self.copied_or_mapped {
            CopiedOrMappedMut::Copied(copier, ptr, v) => {
                trace!(
                    "Flushing {} items to {:?}",
                    ptr.len(),
                    ptr.ptr()
                );
                copier.copy_to_ptr(*ptr, v)?;
            }
            CopiedOrMappedMut::Mapped(_) => (),
        };
        Ok(())
    }

    /// Disposes of the reference *without* writing back the contents. This
    /// should be used instead of `flush` if and only if the contents of this
    /// reference haven't been overwritten.
    pub fn noflush(mut self) {
        self.dirty = false;
    }
}

impl<T: Debug + Pod> Drop for ProcessMemoryRefMut<'_, T> {
    fn drop(&mut self) {
        // dropping without flushing is a bug
        assert!(!self.dirty);
    }
}

impl<T> std::ops::Deref for ProcessMemoryRefMut<'_, T>
where
    T: Debug + Pod,
{
    type Target = [T];

    fn deref(&self) -> &Self::Target {
        match &self.copied_or_mapped {
            CopiedOrMappedMut::Copied(_, _, v) => v,
            CopiedOrMappedMut::Mapped(s) => s,
        }
    }
}

impl<T> std::ops::DerefMut for ProcessMemoryRefMut<'_, T>
where
    T: Debug + Pod,
{
    fn deref_mut(&mut self) -> &mut Self::Target {
        match &mut self.copied_or_mapped {
            CopiedOrMappedMut::Copied(_, _, v) => v,
            CopiedOrMappedMut::Mapped(s) => s,
        }
    }
}

/// Provides accessors for reading and writing a monitored process's memory,
/// and emulation of its memory-mapping syscalls.
//
// For every access it tries to go through the more-efficient MemoryMapper
// view first, and falls back to the MemoryCopier if the access isn't
// satisfiable from a single aligned mapped region.
#[derive(Debug)]
pub struct MemoryManager {
    // memory accessor that works by copying data to and from the backing
    // file; always correct, but costs a copy
    memory_copier: MemoryCopier,

    // memory accessor that tracks the process's address space and maps its
    // regions into the simulator for direct access
    memory_mapper: MemoryMapper,

    // which process's address space this manages
    pid: ProcessId,
}

impl MemoryManager {
    pub fn new(pid: ProcessId) -> Self {
        let memory_mapper = MemoryMapper::new(pid);
        let memory_copier = MemoryCopier::new(pid, memory_mapper.backing_file());
        Self {
            memory_copier,
            memory_mapper,
            pid,
        }
    }

    /// Which process's address space this MemoryManager manages.
    pub fn pid(&self) -> ProcessId {
        self.pid
    }

    // Every handle_* and accessor call requires a thread of the owning
    // process; a thread of some other process is a caller bug.
    fn check_thread(&self, thread: &Thread) {
        assert_eq!(
            thread.process_id(),
            self.pid,
            "thread of process {} used with the memory manager of process {}",
            thread.process_id(),
            self.pid
        );
    }

    // Internal helper for getting a reference to memory via the
    // `memory_mapper`. Calling methods should fall back to the
    // `memory_copier` on failure.
    fn mapped_ref<T: Pod + Debug>(&self, ptr: ForeignArrayPtr<T>) -> Option<&[T]> {
        // SAFETY: no mutable refs to process memory exist; the simulator
        // runs at most one thread of the process inside a syscall at a time,
        // and all access goes through this manager.
        unsafe { self.memory_mapper.get_ref(ptr) }
    }

    // Internal helper for getting a mutable reference to memory via the
    // `memory_mapper`. Calling methods should fall back to the
    // `memory_copier` on failure.
    fn mapped_mut<T: Pod + Debug>(&mut self, ptr: ForeignArrayPtr<T>) -> Option<&mut [T]> {
        // SAFETY: no other refs to process memory exist; we have an
        // exclusive reference to the manager.
        unsafe { self.memory_mapper.get_mut(ptr) }
    }

    /// Returns a readable view of the given memory, copying to a local
    /// buffer if a direct mapping isn't available. Fails with `EFAULT` if the
    /// range isn't mapped readable.
    pub fn memory_ref<T: Pod + Debug>(
        &self,
        ptr: ForeignArrayPtr<T>,
    ) -> Result<ProcessMemoryRef<T>, Errno> {
        self.memory_mapper
            .check_access(ptr.cast_u8(), ProtFlags::PROT_READ)?;
        if let Some(mref) = self.mapped_ref(ptr) {
            Ok(ProcessMemoryRef::new_mapped(mref))
        } else {
            Ok(ProcessMemoryRef::new_copied(
                self.memory_copier.clone_mem(ptr)?,
            ))
        }
    }

    /// Creates a std::io::Read accessor for the specified monitored memory.
    /// Useful for handing the ability to read process memory to other APIs
    /// without copying it first.
    pub fn reader(&self, ptr: ForeignArrayPtr<u8>) -> MemoryReaderCursor {
        MemoryReaderCursor {
            memory_manager: self,
            ptr,
            offset: 0,
        }
    }

    /// Reads the memory into a local array. `memory_ref` is potentially more
    /// efficient, but this is useful to avoid borrowing from the
    /// MemoryManager.
    pub fn read_vals<T: Pod + Debug, const N: usize>(
        &self,
        ptr: ForeignArrayPtr<T>,
    ) -> Result<[T; N], Errno> {
        assert_eq!(ptr.len(), N);
        let mut res = [T::zeroed(); N];
        self.copy_from_ptr(&mut res, ptr)?;
        Ok(res)
    }

    /// Similar to `read_vals`, but saves a copy if you already have a `dst`
    /// to copy the data into.
    pub fn copy_from_ptr<T: Debug + Pod>(
        &self,
        dst: &mut [T],
        src: ForeignArrayPtr<T>,
    ) -> Result<(), Errno> {
        self.memory_mapper
            .check_access(src.cast_u8(), ProtFlags::PROT_READ)?;
        if let Some(src) = self.mapped_ref(src) {
            dst.copy_from_slice(src);
            return Ok(());
        }
        self.memory_copier.copy_from_ptr(dst, src)
    }

    /// Returns a writable view of the given memory. If the memory isn't
    /// mapped into the simulator, returns a local buffer with unspecified
    /// contents, which is written back into the process if and when the
    /// reference is flushed. Fails with `EFAULT` if the range isn't mapped
    /// writable.
    ///
    /// WARNING: if the reference is flushed without initializing its
    /// contents, the unspecified contents will be written back into process
    /// memory. This can be avoided by calling `noflush` on the reference.
    pub fn memory_ref_mut_uninit<T: Pod + Debug>(
        &mut self,
        ptr: ForeignArrayPtr<T>,
    ) -> Result<ProcessMemoryRefMut<T>, Errno> {
        self.memory_mapper
            .check_access(ptr.cast_u8(), ProtFlags::PROT_WRITE)?;
        let copier = self.memory_copier.try_clone();

        let mut mref = if let Some(mref) = self.mapped_mut(ptr) {
            ProcessMemoryRefMut::new_mapped(mref)
        } else {
            ProcessMemoryRefMut::new_copied(copier, ptr, vec![T::zeroed(); ptr.len()])
        };

        // In debug builds, overwrite with garbage to shake out bugs where
        // the caller treats the contents as initialized, e.g. by reading the
        // data or flushing it back without initializing it.
        if cfg!(debug_assertions) {
            bytemuck::cast_slice_mut::<T, u8>(&mut mref[..]).fill(0x42);
        }

        Ok(mref)
    }

    /// Returns a readable-and-writable view of the given memory. If the
    /// memory isn't mapped into the simulator, copies the data to a local
    /// buffer, which is written back into the process if and when the
    /// reference is flushed. Fails with `EFAULT` unless the range is mapped
    /// both readable and writable.
    pub fn memory_ref_mut<T: Pod + Debug>(
        &mut self,
        ptr: ForeignArrayPtr<T>,
    ) -> Result<ProcessMemoryRefMut<T>, Errno> {
        self.memory_mapper
            .check_access(ptr.cast_u8(), ProtFlags::PROT_READ | ProtFlags::PROT_WRITE)?;
        let copier = self.memory_copier.try_clone();

        if let Some(mref) = self.mapped_mut(ptr) {
            Ok(ProcessMemoryRefMut::new_mapped(mref))
        } else {
            let v = copier.clone_mem(ptr)?;
            Ok(ProcessMemoryRefMut::new_copied(copier, ptr, v))
        }
    }

    /// Writes the memory from a local copy. If `src` doesn't already exist,
    /// using `memory_ref_mut_uninit` and initializing the data in that
    /// reference saves a copy.
    pub fn copy_to_ptr<T: Pod + Debug>(
        &mut self,
        dst: ForeignArrayPtr<T>,
        src: &[T],
    ) -> Result<(), Errno> {
        self.memory_mapper
            .check_access(dst.cast_u8(), ProtFlags::PROT_WRITE)?;
        if let Some(dst) = self.mapped_mut(dst) {
            dst.copy_from_slice(src);
            return Ok(());
        }
        self.memory_copier.copy_to_ptr(dst, src)
    }

    /// Create a write accessor for the specified monitored memory.
    pub fn writer(&mut self, ptr: ForeignArrayPtr<u8>) -> MemoryWriterCursor {
        MemoryWriterCursor {
            memory_manager: self,
            ptr,
            offset: 0,
        }
    }

    /// Fully handles the `brk` syscall, keeping the heap mapped in the
    /// shared backing.
    pub fn handle_brk(
        &mut self,
        thread: &Thread,
        ptr: ForeignPtr<u8>,
    ) -> Result<ForeignPtr<u8>, Errno> {
        self.check_thread(thread);
        self.memory_mapper.handle_brk(ptr)
    }

    /// Fully handles the `mmap` syscall.
    pub fn handle_mmap(
        &mut self,
        thread: &Thread,
        addr: ForeignPtr<u8>,
        length: usize,
        prot: ProtFlags,
        flags: MapFlags,
        fd: i32,
        offset: i64,
    ) -> Result<ForeignPtr<u8>, Errno> {
        self.check_thread(thread);
        self.memory_mapper
            .handle_mmap(addr, length, prot, flags, fd, offset)
    }

    /// Fully handles the `munmap` syscall.
    pub fn handle_munmap(
        &mut self,
        thread: &Thread,
        addr: ForeignPtr<u8>,
        length: usize,
    ) -> Result<(), Errno> {
        self.check_thread(thread);
        self.memory_mapper.handle_munmap(addr, length)
    }

    /// Fully handles the `mremap` syscall.
    pub fn handle_mremap(
        &mut self,
        thread: &Thread,
        old_addr: ForeignPtr<u8>,
        old_size: usize,
        new_size: usize,
        flags: i32,
        new_addr: ForeignPtr<u8>,
    ) -> Result<ForeignPtr<u8>, Errno> {
        self.check_thread(thread);
        self.memory_mapper
            .handle_mremap(old_addr, old_size, new_size, flags, new_addr)
    }

    /// Fully handles the `mprotect` syscall.
    pub fn handle_mprotect(
        &mut self,
        thread: &Thread,
        addr: ForeignPtr<u8>,
        size: usize,
        prot: ProtFlags,
    ) -> Result<(), Errno> {
        self.check_thread(thread);
        self.memory_mapper.handle_mprotect(addr, size, prot)
    }

    #[cfg(test)]
    pub(crate) fn mapped_intervals(&self) -> Vec<crate::utility::interval_map::Interval> {
        self.memory_mapper.mapped_intervals()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use crate::host::host::Host;
    use crate::host::process::Process;
    use crate::host::thread::{Thread, ThreadId};

    fn test_setup() -> (Host, Arc<Process>, Arc<Thread>) {
        let host = Host::new();
        let process = Process::new(&host, ProcessId::from(1000), "test-proc");
        let thread = process.add_thread(ThreadId::from(1000), false);
        (host, process, thread)
    }

    fn anon_mmap(
        process: &Arc<Process>,
        thread: &Thread,
        hint: usize,
        len: usize,
        prot: ProtFlags,
    ) -> Result<usize, Errno> {
        process
            .memory_borrow_mut()
            .handle_mmap(
                thread,
                ForeignPtr::from(hint),
                len,
                prot,
                MapFlags::MAP_ANONYMOUS | MapFlags::MAP_PRIVATE,
                -1,
                0,
            )
            .map(usize::from)
    }

    const RW: ProtFlags = ProtFlags::PROT_READ.union(ProtFlags::PROT_WRITE);

    fn assert_no_overlaps(mm: &MemoryManager) {
        let intervals = mm.mapped_intervals();
        for w in intervals.windows(2) {
            assert!(w[0].end <= w[1].start, "overlapping regions {:?}", intervals);
        }
    }

    #[test]
    fn test_mmap_munmap_region_set_invariants() {
        let (_host, process, thread) = test_setup();
        let page = page_size();

        let a = anon_mmap(&process, &thread, 0, 4 * page, RW).unwrap();
        let b = anon_mmap(&process, &thread, 0, 2 * page, RW).unwrap();
        {
            let mm = process.memory_borrow();
            assert_no_overlaps(&mm);
            let intervals = mm.mapped_intervals();
            assert!(intervals.contains(&(a..a + 4 * page)));
            assert!(intervals.contains(&(b..b + 2 * page)));
        }

        // unmapping the middle splits the region into two remainders
        process
            .memory_borrow_mut()
            .handle_munmap(&thread, ForeignPtr::from(a + page), page)
            .unwrap();
        {
            let mm = process.memory_borrow();
            assert_no_overlaps(&mm);
            let intervals = mm.mapped_intervals();
            assert!(intervals.contains(&(a..a + page)));
            assert!(!intervals.iter().any(|i| i.contains(&(a + page))));
            assert!(intervals.contains(&(a + 2 * page..a + 4 * page)));
        }

        // unmapping everything leaves only the other mapping
        process
            .memory_borrow_mut()
            .handle_munmap(&thread, ForeignPtr::from(a), 4 * page)
            .unwrap();
        {
            let mm = process.memory_borrow();
            assert_no_overlaps(&mm);
            assert_eq!(mm.mapped_intervals(), vec![b..b + 2 * page]);
        }
    }

    #[test]
    fn test_mmap_rejects_bad_requests() {
        let (_host, process, thread) = test_setup();
        let mut mm = process.memory_borrow_mut();

        // zero length
        assert_eq!(
            mm.handle_mmap(
                &thread,
                ForeignPtr::null(),
                0,
                RW,
                MapFlags::MAP_ANONYMOUS | MapFlags::MAP_PRIVATE,
                -1,
                0
            )
            .unwrap_err(),
            Errno::EINVAL
        );

        // neither private nor shared
        assert_eq!(
            mm.handle_mmap(
                &thread,
                ForeignPtr::null(),
                page_size(),
                RW,
                MapFlags::MAP_ANONYMOUS,
                -1,
                0
            )
            .unwrap_err(),
            Errno::EINVAL
        );

        // file-backed mappings aren't supported
        assert_eq!(
            mm.handle_mmap(
                &thread,
                ForeignPtr::null(),
                page_size(),
                RW,
                MapFlags::MAP_PRIVATE,
                3,
                0
            )
            .unwrap_err(),
            Errno::ENODEV
        );
    }

    #[test]
    fn test_mmap_honors_free_hint() {
        let (_host, process, thread) = test_setup();
        let page = page_size();

        let first = anon_mmap(&process, &thread, 0, page, RW).unwrap();
        let hint = first + 16 * page;
        let hinted = anon_mmap(&process, &thread, hint, page, RW).unwrap();
        assert_eq!(hinted, hint);

        // an occupied hint falls back to first-fit placement
        let other = anon_mmap(&process, &thread, hint, page, RW).unwrap();
        assert_ne!(other, hint);
    }

    #[test]
    fn test_brk_is_idempotent() {
        let (_host, process, thread) = test_setup();
        let mut mm = process.memory_borrow_mut();
        let page = page_size();

        let base = usize::from(mm.handle_brk(&thread, ForeignPtr::null()).unwrap());

        let first = mm
            .handle_brk(&thread, ForeignPtr::from(base + 4 * page))
            .unwrap();
        let intervals = mm.mapped_intervals();

        // the same request again changes nothing
        let second = mm
            .handle_brk(&thread, ForeignPtr::from(base + 4 * page))
            .unwrap();
        assert_eq!(first, second);
        assert_eq!(mm.mapped_intervals(), intervals);
    }

    #[test]
    fn test_brk_grow_shrink_and_query() {
        let (_host, process, thread) = test_setup();
        let mut mm = process.memory_borrow_mut();
        let page = page_size();

        let base = usize::from(mm.handle_brk(&thread, ForeignPtr::null()).unwrap());

        let grown = usize::from(
            mm.handle_brk(&thread, ForeignPtr::from(base + 2 * page))
                .unwrap(),
        );
        assert_eq!(grown, base + 2 * page);

        // heap memory is usable
        let ptr = ForeignArrayPtr::new(ForeignPtr::<u8>::from(base), 2 * page);
        mm.copy_to_ptr(ptr, &vec![0xaa; 2 * page]).unwrap();

        // an invalid request is a no-op that reports the current break
        let rv = usize::from(mm.handle_brk(&thread, ForeignPtr::from(1usize)).unwrap());
        assert_eq!(rv, base + 2 * page);

        // shrink back down
        let shrunk = usize::from(
            mm.handle_brk(&thread, ForeignPtr::from(base + page))
                .unwrap(),
        );
        assert_eq!(shrunk, base + page);
        // the removed page is no longer accessible
        let gone = ForeignArrayPtr::new(ForeignPtr::<u8>::from(base + page), page);
        assert_eq!(mm.memory_ref(gone).unwrap_err(), Errno::EFAULT);
    }

    #[test]
    fn test_memory_ref_bounds() {
        let (_host, process, thread) = test_setup();
        let page = page_size();
        let base = anon_mmap(&process, &thread, 0, 2 * page, RW).unwrap();
        let mm = process.memory_borrow();

        // any length inside the mapping works
        for n in [1usize, 16, page, 2 * page] {
            let ptr = ForeignArrayPtr::new(ForeignPtr::<u8>::from(base), n);
            assert_eq!(mm.memory_ref(ptr).unwrap().len(), n);
        }
        let inner = ForeignArrayPtr::new(ForeignPtr::<u8>::from(base + page - 7), 7);
        assert!(mm.memory_ref(inner).is_ok());

        // extending past the end is rejected
        let past = ForeignArrayPtr::new(ForeignPtr::<u8>::from(base + page), page + 1);
        assert_eq!(mm.memory_ref(past).unwrap_err(), Errno::EFAULT);

        // unmapped memory is rejected
        let unmapped = ForeignArrayPtr::new(ForeignPtr::<u8>::from(64), 8);
        assert_eq!(mm.memory_ref(unmapped).unwrap_err(), Errno::EFAULT);
    }

    #[test]
    fn test_roundtrip_through_views_and_cursors() {
        let (_host, process, thread) = test_setup();
        let page = page_size();
        let base = anon_mmap(&process, &thread, 0, page, RW).unwrap();
        let mut mm = process.memory_borrow_mut();
        let ptr = ForeignArrayPtr::new(ForeignPtr::<u8>::from(base), 8);

        let mut mref = mm.memory_ref_mut_uninit(ptr).unwrap();
        mref.copy_from_slice(b"abcdefgh");
        mref.flush().unwrap();

        assert_eq!(&*mm.memory_ref(ptr).unwrap(), b"abcdefgh");

        // an unaligned wide read goes through the copier and still works
        let unaligned = ForeignArrayPtr::new(ForeignPtr::<u32>::from(base + 1), 1);
        let val = mm.memory_ref(unaligned).unwrap()[0];
        assert_eq!(val.to_le_bytes(), *b"bcde");

        // reader cursor sees the same bytes
        let mut out = [0u8; 8];
        std::io::Read::read_exact(&mut mm.reader(ptr), &mut out).unwrap();
        assert_eq!(&out, b"abcdefgh");
    }

    #[test]
    fn test_mprotect_read_only_rejects_writes() {
        let (_host, process, thread) = test_setup();
        let page = page_size();
        let base = anon_mmap(&process, &thread, 0, 2 * page, RW).unwrap();
        let mut mm = process.memory_borrow_mut();

        mm.handle_mprotect(
            &thread,
            ForeignPtr::from(base),
            2 * page,
            ProtFlags::PROT_READ,
        )
        .unwrap();

        let ptr = ForeignArrayPtr::new(ForeignPtr::<u8>::from(base), 16);
        assert_eq!(mm.memory_ref_mut_uninit(ptr).unwrap_err(), Errno::EFAULT);
        assert_eq!(mm.memory_ref_mut(ptr).unwrap_err(), Errno::EFAULT);
        assert_eq!(mm.copy_to_ptr(ptr, &[0u8; 16]).unwrap_err(), Errno::EFAULT);
        // still readable
        assert!(mm.memory_ref(ptr).is_ok());

        // restoring write access restores writability
        mm.handle_mprotect(&thread, ForeignPtr::from(base), 2 * page, RW)
            .unwrap();
        mm.copy_to_ptr(ptr, &[7u8; 16]).unwrap();
    }

    #[test]
    fn test_mprotect_splits_regions() {
        let (_host, process, thread) = test_setup();
        let page = page_size();
        let base = anon_mmap(&process, &thread, 0, 3 * page, RW).unwrap();
        let mut mm = process.memory_borrow_mut();

        // protect only the middle page
        mm.handle_mprotect(
            &thread,
            ForeignPtr::from(base + page),
            page,
            ProtFlags::PROT_READ,
        )
        .unwrap();
        assert_no_overlaps(&mm);

        // the outer pages stay writable, crossing into the middle does not
        let left = ForeignArrayPtr::new(ForeignPtr::<u8>::from(base), page);
        mm.copy_to_ptr(left, &vec![1u8; page]).unwrap();
        let right = ForeignArrayPtr::new(ForeignPtr::<u8>::from(base + 2 * page), page);
        mm.copy_to_ptr(right, &vec![2u8; page]).unwrap();
        let crossing = ForeignArrayPtr::new(ForeignPtr::<u8>::from(base), 2 * page);
        assert_eq!(
            mm.copy_to_ptr(crossing, &vec![3u8; 2 * page]).unwrap_err(),
            Errno::EFAULT
        );

        // contents written before and after the split are still visible
        // through a (copier-backed) read spanning all three pages
        let all = ForeignArrayPtr::new(ForeignPtr::<u8>::from(base), 3 * page);
        let data = mm.memory_ref(all).unwrap();
        assert_eq!(data[0], 1);
        assert_eq!(data[2 * page], 2);

        // an mprotect range touching unmapped memory is rejected
        assert_eq!(
            mm.handle_mprotect(
                &thread,
                ForeignPtr::from(base + 2 * page),
                2 * page,
                ProtFlags::PROT_READ
            )
            .unwrap_err(),
            Errno::ENOMEM
        );
    }

    #[test]
    fn test_mremap_grow_preserves_contents() {
        let (_host, process, thread) = test_setup();
        let page = page_size();
        let base = anon_mmap(&process, &thread, 0, 2 * page, RW).unwrap();

        let pattern: Vec<u8> = (0..2 * page).map(|i| (i % 251) as u8).collect();
        {
            let mut mm = process.memory_borrow_mut();
            let ptr = ForeignArrayPtr::new(ForeignPtr::<u8>::from(base), 2 * page);
            mm.copy_to_ptr(ptr, &pattern).unwrap();
        }

        // force a move by mapping something directly after the region
        let blocker = base + 2 * page;
        assert_eq!(anon_mmap(&process, &thread, blocker, page, RW).unwrap(), blocker);

        let mut mm = process.memory_borrow_mut();
        let new_base = usize::from(
            mm.handle_mremap(
                &thread,
                ForeignPtr::from(base),
                2 * page,
                4 * page,
                libc::MREMAP_MAYMOVE,
                ForeignPtr::null(),
            )
            .unwrap(),
        );
        assert_ne!(new_base, base);

        // the overlap is preserved byte-for-byte
        let moved = ForeignArrayPtr::new(ForeignPtr::<u8>::from(new_base), 2 * page);
        assert_eq!(&*mm.memory_ref(moved).unwrap(), &pattern[..]);

        // the old range is gone
        let old = ForeignArrayPtr::new(ForeignPtr::<u8>::from(base), 1);
        assert_eq!(mm.memory_ref(old).unwrap_err(), Errno::EFAULT);
        assert_no_overlaps(&mm);
    }

    #[test]
    fn test_mremap_grow_in_place_when_free() {
        let (_host, process, thread) = test_setup();
        let page = page_size();
        let base = anon_mmap(&process, &thread, 0, page, RW).unwrap();

        let mut mm = process.memory_borrow_mut();
        let ptr = ForeignArrayPtr::new(ForeignPtr::<u8>::from(base), page);
        mm.copy_to_ptr(ptr, &vec![0x5a; page]).unwrap();

        let new_base = usize::from(
            mm.handle_mremap(
                &thread,
                ForeignPtr::from(base),
                page,
                2 * page,
                0,
                ForeignPtr::null(),
            )
            .unwrap(),
        );
        assert_eq!(new_base, base);

        let grown = ForeignArrayPtr::new(ForeignPtr::<u8>::from(base), 2 * page);
        let data = mm.memory_ref(grown).unwrap();
        assert!(data[..page].iter().all(|b| *b == 0x5a));
        // the extension reads as zeros
        assert!(data[page..].iter().all(|b| *b == 0));
    }

    #[test]
    fn test_mremap_grow_without_maymove_fails_when_blocked() {
        let (_host, process, thread) = test_setup();
        let page = page_size();
        let base = anon_mmap(&process, &thread, 0, page, RW).unwrap();
        let blocker = base + page;
        assert_eq!(anon_mmap(&process, &thread, blocker, page, RW).unwrap(), blocker);

        let mut mm = process.memory_borrow_mut();
        assert_eq!(
            mm.handle_mremap(
                &thread,
                ForeignPtr::from(base),
                page,
                2 * page,
                0,
                ForeignPtr::null(),
            )
            .unwrap_err(),
            Errno::ENOMEM
        );
    }

    #[test]
    fn test_mremap_shrink_in_place() {
        let (_host, process, thread) = test_setup();
        let page = page_size();
        let base = anon_mmap(&process, &thread, 0, 4 * page, RW).unwrap();

        let mut mm = process.memory_borrow_mut();
        let new_base = usize::from(
            mm.handle_mremap(
                &thread,
                ForeignPtr::from(base),
                4 * page,
                page,
                0,
                ForeignPtr::null(),
            )
            .unwrap(),
        );
        assert_eq!(new_base, base);
        assert_eq!(mm.mapped_intervals(), vec![base..base + page]);
    }

    // pins the resolution of the underspecified old_size == 0 case: the
    // shared-pages duplication form of mremap is rejected outright
    #[test]
    fn test_mremap_old_size_zero_is_rejected() {
        let (_host, process, thread) = test_setup();
        let page = page_size();
        let base = anon_mmap(&process, &thread, 0, page, RW).unwrap();

        let mut mm = process.memory_borrow_mut();
        assert_eq!(
            mm.handle_mremap(
                &thread,
                ForeignPtr::from(base),
                0,
                page,
                libc::MREMAP_MAYMOVE,
                ForeignPtr::null(),
            )
            .unwrap_err(),
            Errno::EINVAL
        );
    }

    #[test]
    fn test_mremap_fixed_requires_maymove_and_no_overlap() {
        let (_host, process, thread) = test_setup();
        let page = page_size();
        let base = anon_mmap(&process, &thread, 0, 2 * page, RW).unwrap();
        let mut mm = process.memory_borrow_mut();

        assert_eq!(
            mm.handle_mremap(
                &thread,
                ForeignPtr::from(base),
                2 * page,
                2 * page,
                libc::MREMAP_FIXED,
                ForeignPtr::from(base + 16 * page),
            )
            .unwrap_err(),
            Errno::EINVAL
        );

        // overlapping destination
        assert_eq!(
            mm.handle_mremap(
                &thread,
                ForeignPtr::from(base),
                2 * page,
                2 * page,
                libc::MREMAP_FIXED | libc::MREMAP_MAYMOVE,
                ForeignPtr::from(base + page),
            )
            .unwrap_err(),
            Errno::EINVAL
        );

        // a valid fixed destination relocates the mapping
        let dst = base + 16 * page;
        let new_base = usize::from(
            mm.handle_mremap(
                &thread,
                ForeignPtr::from(base),
                2 * page,
                2 * page,
                libc::MREMAP_FIXED | libc::MREMAP_MAYMOVE,
                ForeignPtr::from(dst),
            )
            .unwrap(),
        );
        assert_eq!(new_base, dst);
    }

    #[test]
    #[should_panic]
    fn test_foreign_thread_is_a_contract_violation() {
        let (host, process, _thread) = test_setup();
        let other_process = Process::new(&host, ProcessId::from(2000), "other");
        let foreign_thread = other_process.add_thread(ThreadId::from(2000), false);
        let _ = process
            .memory_borrow_mut()
            .handle_brk(&foreign_thread, ForeignPtr::null());
    }
}

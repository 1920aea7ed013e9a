use std::fmt::Debug;
use std::fs::File;
use std::os::raw::c_void;
use std::os::unix::fs::FileExt;

use atomic_refcell::AtomicRefCell;
use bytemuck::Pod;
use log::*;
use nix::errno::Errno;
use nix::sys::mman::{MRemapFlags, MapFlags, ProtFlags};
use rustix::fs::{FallocateFlags, MemfdFlags};

use crate::host::memory_manager::{page_size, round_up_page};
use crate::host::process::ProcessId;
use crate::host::syscall::types::{ForeignArrayPtr, ForeignPtr};
use crate::utility::counter::Counter;
use crate::utility::interval_map::{Interval, IntervalMap, Mutation};

/// Used when mapping heap regions.
const HEAP_PROT: ProtFlags = ProtFlags::PROT_READ.union(ProtFlags::PROT_WRITE);

/// Where the emulated heap starts.
const HEAP_BASE: usize = 0x0800_0000;

/// The address range searched when placing anonymous mappings.
const MMAP_ARENA_BASE: usize = 0x1_0000_0000;
const MMAP_ARENA_END: usize = 0x10_0000_0000;

// Represents a region of monitored-process memory.
#[derive(Clone, Debug, Eq, PartialEq)]
struct Region {
    // Where the region is mapped into the simulator's address space, or NULL
    // if it isn't.
    shadow_base: *mut c_void,
    prot: ProtFlags,
    sharing: Sharing,
    kind: MappingKind,
}

// Safety: the Region owns the shadow_base mapping, and the mapper enforces
// Rust's aliasing rules for all access through it.
unsafe impl Send for Region {}
unsafe impl Sync for Region {}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
enum Sharing {
    Private,
    Shared,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
enum MappingKind {
    Heap,
    Anonymous,
}

fn sim_munmap(ptr: *mut c_void, len: usize) {
    unsafe { rustix::mm::munmap(ptr, len) }.unwrap_or_else(|e| warn!("munmap: {}", e));
}

fn sim_mprotect(ptr: *mut c_void, len: usize, prot: ProtFlags) {
    let flags = rustix::mm::MprotectFlags::from_bits_retain(prot.bits() as u32);
    unsafe { rustix::mm::mprotect(ptr, len, flags) }
        .unwrap_or_else(|e| warn!("mprotect({:?}, {}, {:?}): {}", ptr, len, prot, e));
}

/// Shared memory file into which the monitored process's address space is
/// materialized. File offsets equal monitored virtual addresses, so each
/// region's backing can be grown, shrunk, and revoked independently of every
/// other region.
#[derive(Debug)]
struct ShmFile {
    file: File,
    len: usize,
}

impl ShmFile {
    fn create(pid: ProcessId) -> Self {
        let name = format!("simproc_memory_manager_{}_{}", std::process::id(), pid);
        let fd = rustix::fs::memfd_create(&name, MemfdFlags::CLOEXEC).unwrap();
        ShmFile {
            file: File::from(fd),
            len: 0,
        }
    }

    /// Allocate space in the file for the given interval. Unlike calling
    /// fallocate or posix_fallocate, this does not pre-reserve any space; the
    /// OS allocates pages on demand as they're written.
    fn alloc(&mut self, interval: &Interval) {
        let needed_len = interval.end;
        if needed_len > self.len {
            rustix::fs::ftruncate(&self.file, u64::try_from(needed_len).unwrap()).unwrap();
            self.len = needed_len;
        }
    }

    /// De-allocate the file pages backing the given interval.
    fn dealloc(&self, interval: &Interval) {
        trace!("dealloc {:?}", interval);
        rustix::fs::fallocate(
            &self.file,
            FallocateFlags::PUNCH_HOLE | FallocateFlags::KEEP_SIZE,
            u64::try_from(interval.start).unwrap(),
            u64::try_from(interval.len()).unwrap(),
        )
        .unwrap();
    }

    /// Map the given interval of the file into the simulator's address space.
    fn mmap_into_sim(&self, interval: &Interval, prot: ProtFlags) -> *mut c_void {
        unsafe {
            rustix::mm::mmap(
                std::ptr::null_mut(),
                interval.len(),
                rustix::mm::ProtFlags::from_bits_retain(prot.bits() as u32),
                rustix::mm::MapFlags::SHARED,
                &self.file,
                u64::try_from(interval.start).unwrap(),
            )
        }
        .unwrap()
    }

    /// Copy `len` bytes of backing from offset `src` to offset `dst` through
    /// the file descriptor.
    fn copy_within(&self, src: usize, dst: usize, len: usize) {
        let mut buf = vec![0u8; std::cmp::min(len, 64 * 1024)];
        let mut copied = 0;
        while copied < len {
            let chunk = std::cmp::min(buf.len(), len - copied);
            self.file
                .read_exact_at(&mut buf[..chunk], (src + copied) as u64)
                .unwrap();
            self.file
                .write_all_at(&buf[..chunk], (dst + copied) as u64)
                .unwrap();
            copied += chunk;
        }
    }
}

/// Manages the address space of one monitored process.
///
/// The mapper tracks what the process believes its mappings are (the shadow
/// region set, analogous to /proc/<pid>/maps) and materializes every
/// anonymous mapping in a shared memory file that is also mapped into the
/// simulator, so that most accesses to monitored memory are direct loads and
/// stores. For the region set to stay consistent, all mman-family syscalls
/// must be delegated to the `handle_*` methods here; each of them updates the
/// region set before returning, on every return path.
#[derive(Debug)]
pub struct MemoryMapper {
    shm_file: ShmFile,
    regions: IntervalMap<Region>,

    /// Tally of accesses that had to fall back to the copying accessor.
    misses: AtomicRefCell<Counter>,

    /// The bounds of the heap. A zero-sized interval before the process's
    /// first `brk`.
    heap: Interval,

    pid: ProcessId,
}

impl MemoryMapper {
    pub fn new(pid: ProcessId) -> Self {
        Self {
            shm_file: ShmFile::create(pid),
            regions: IntervalMap::new(),
            misses: AtomicRefCell::new(Counter::new()),
            heap: HEAP_BASE..HEAP_BASE,
            pid,
        }
    }

    /// A second handle on the backing file, for the copying accessor.
    pub fn backing_file(&self) -> File {
        self.shm_file.file.try_clone().unwrap()
    }

    /// True if no region intersects `range`.
    fn range_is_free(&self, range: &Interval) -> bool {
        if range.is_empty() {
            return true;
        }
        self.regions
            .keys()
            .all(|k| k.start >= range.end || k.end <= range.start)
    }

    /// True if every byte of `range` is inside some region.
    fn range_fully_mapped(&self, range: &Interval) -> bool {
        let mut cursor = range.start;
        while cursor < range.end {
            match self.regions.get(cursor) {
                Some((interval, _)) => cursor = interval.end,
                None => return false,
            }
        }
        true
    }

    /// First-fit search of the mmap arena for a free interval of `length`
    /// bytes.
    fn find_free_interval(&self, length: usize) -> Option<Interval> {
        let mut candidate = MMAP_ARENA_BASE;
        for interval in self.regions.keys() {
            if interval.end <= candidate {
                continue;
            }
            if candidate + length <= interval.start {
                break;
            }
            candidate = interval.end;
        }
        (candidate + length <= MMAP_ARENA_END).then(|| candidate..candidate + length)
    }

    /// Processes the mutations returned by an IntervalMap::insert or
    /// IntervalMap::clear operation. Each mutation describes a mapping that
    /// has been partly or completely overwritten; for each affected piece the
    /// file backing is released and the simulator-side view is unmapped, with
    /// `shadow_base` adjusted on the surviving remainders.
    fn unmap_mutations(&mut self, mutations: Vec<Mutation<Region>>) {
        for mutation in mutations {
            match mutation {
                Mutation::ModifiedBegin(interval, new_start) => {
                    let (_, region) = self.regions.get_mut(new_start).unwrap();
                    if region.shadow_base.is_null() {
                        continue;
                    }
                    let removed = interval.start..new_start;

                    self.shm_file.dealloc(&removed);
                    sim_munmap(region.shadow_base, removed.len());

                    // the remainder's view begins after the removed prefix
                    region.shadow_base = unsafe { region.shadow_base.add(removed.len()) };
                }
                Mutation::ModifiedEnd(interval, new_end) => {
                    let (_, region) = self.regions.get(interval.start).unwrap();
                    if region.shadow_base.is_null() {
                        continue;
                    }
                    let removed = new_end..interval.end;

                    self.shm_file.dealloc(&removed);
                    sim_munmap(
                        unsafe { region.shadow_base.add(new_end - interval.start) },
                        removed.len(),
                    );
                }
                Mutation::Split(original, left, right) => {
                    let left_base = self.regions.get(left.start).unwrap().1.shadow_base;
                    let (_, right_region) = self.regions.get_mut(right.start).unwrap();
                    debug_assert_eq!(left_base, right_region.shadow_base);
                    if left_base.is_null() {
                        continue;
                    }
                    let removed = left.end..right.start;

                    self.shm_file.dealloc(&removed);
                    sim_munmap(unsafe { left_base.add(left.len()) }, removed.len());

                    right_region.shadow_base =
                        unsafe { right_region.shadow_base.add(right.start - original.start) };
                }
                Mutation::Removed(interval, region) => {
                    if region.shadow_base.is_null() {
                        continue;
                    }
                    self.shm_file.dealloc(&interval);
                    sim_munmap(region.shadow_base, interval.len());
                }
            }
        }
    }

    /// Execute the requested `brk` and update the region set accordingly. On
    /// an invalid request the current break is returned and nothing changes,
    /// mirroring kernel behavior.
    pub fn handle_brk(&mut self, ptr: ForeignPtr<u8>) -> Result<ForeignPtr<u8>, Errno> {
        let requested = usize::from(ptr);

        // any request below the heap base reports the current break; in
        // practice this is usually the NULL query for the break's position
        if requested < self.heap.start {
            return Ok(ForeignPtr::from(self.heap.end));
        }

        let requested = round_up_page(requested);
        if requested == self.heap.end {
            return Ok(ForeignPtr::from(requested));
        }

        if requested > self.heap.end {
            // grow the heap; refuse (reporting the current break) if another
            // mapping is in the way
            let extension = self.heap.end..requested;
            if !self.range_is_free(&extension) {
                return Ok(ForeignPtr::from(self.heap.end));
            }

            let new_heap = self.heap.start..requested;
            self.shm_file.alloc(&new_heap);

            // when the whole heap is still a single region, replace it with
            // one covering view; otherwise (e.g. after an mprotect split)
            // just append a region for the extension
            let old_view = match self.regions.get(self.heap.start) {
                Some((interval, region)) if interval == self.heap && region.prot == HEAP_PROT => {
                    Some((region.shadow_base, interval.len()))
                }
                _ => None,
            };
            if let Some((old_base, old_len)) = old_view {
                let shadow_base = self.shm_file.mmap_into_sim(&new_heap, HEAP_PROT);
                sim_munmap(old_base, old_len);
                let mutations = self.regions.insert(
                    new_heap.clone(),
                    Region {
                        shadow_base,
                        prot: HEAP_PROT,
                        sharing: Sharing::Private,
                        kind: MappingKind::Heap,
                    },
                );
                // only the old heap region is disturbed
                assert_eq!(mutations.len(), 1);
            } else {
                let shadow_base = self.shm_file.mmap_into_sim(&extension, HEAP_PROT);
                let mutations = self.regions.insert(
                    extension,
                    Region {
                        shadow_base,
                        prot: HEAP_PROT,
                        sharing: Sharing::Private,
                        kind: MappingKind::Heap,
                    },
                );
                assert!(mutations.is_empty());
            }
            self.heap = new_heap;
        } else {
            // shrink the heap, unmapping the now-excess pages
            let removed = requested..self.heap.end;
            let mutations = self.regions.clear(removed);
            self.unmap_mutations(mutations);
            self.heap = self.heap.start..requested;
        }

        Ok(ForeignPtr::from(requested))
    }

    /// Choose a placement for and record a new mapping. Only anonymous
    /// mappings can be materialized in the shared backing; file-backed
    /// requests are rejected the way the kernel rejects objects that don't
    /// support mapping.
    pub fn handle_mmap(
        &mut self,
        addr_hint: ForeignPtr<u8>,
        length: usize,
        prot: ProtFlags,
        flags: MapFlags,
        fd: i32,
        _offset: i64,
    ) -> Result<ForeignPtr<u8>, Errno> {
        if length == 0 {
            return Err(Errno::EINVAL);
        }
        let length = round_up_page(length);

        let private = flags.contains(MapFlags::MAP_PRIVATE);
        let shared = flags.contains(MapFlags::MAP_SHARED);
        if private == shared {
            return Err(Errno::EINVAL);
        }
        let sharing = if private {
            Sharing::Private
        } else {
            Sharing::Shared
        };

        if !flags.contains(MapFlags::MAP_ANONYMOUS) {
            debug!("refusing file-backed mmap of fd {}", fd);
            return Err(Errno::ENODEV);
        }

        let hint = usize::from(addr_hint);
        let interval = if flags.contains(MapFlags::MAP_FIXED) {
            if hint == 0 || hint % page_size() != 0 {
                return Err(Errno::EINVAL);
            }
            let interval = hint..hint + length;
            // fixed placement evicts anything already there
            let mutations = self.regions.clear(interval.clone());
            self.unmap_mutations(mutations);
            interval
        } else if hint != 0
            && hint % page_size() == 0
            && self.range_is_free(&(hint..hint + length))
        {
            // a free, aligned hint is honored
            hint..hint + length
        } else {
            self.find_free_interval(length).ok_or(Errno::ENOMEM)?
        };

        self.shm_file.alloc(&interval);
        let shadow_base = self.shm_file.mmap_into_sim(&interval, prot);
        let mutations = self.regions.insert(
            interval.clone(),
            Region {
                shadow_base,
                prot,
                sharing,
                kind: MappingKind::Anonymous,
            },
        );
        assert!(mutations.is_empty());

        trace!(
            "mmap'd {:#x}..{:#x} prot={:?} {:?}",
            interval.start,
            interval.end,
            prot,
            sharing
        );
        Ok(ForeignPtr::from(interval.start))
    }

    /// Remove the covered range from the region set (splitting regions as
    /// needed) and release the corresponding backing.
    pub fn handle_munmap(&mut self, addr: ForeignPtr<u8>, length: usize) -> Result<(), Errno> {
        let start = usize::from(addr);
        if start % page_size() != 0 || length == 0 {
            return Err(Errno::EINVAL);
        }
        let length = round_up_page(length);

        let mutations = self.regions.clear(start..start + length);
        self.unmap_mutations(mutations);
        Ok(())
    }

    /// Relocate/resize a mapping, following kernel `mremap` semantics for the
    /// MAYMOVE and FIXED flags. Contents are preserved byte-for-byte over the
    /// overlap of the old and new extents.
    pub fn handle_mremap(
        &mut self,
        old_addr: ForeignPtr<u8>,
        old_size: usize,
        new_size: usize,
        flags: i32,
        new_addr: ForeignPtr<u8>,
    ) -> Result<ForeignPtr<u8>, Errno> {
        let flags = MRemapFlags::from_bits(flags).ok_or(Errno::EINVAL)?;
        let may_move = flags.contains(MRemapFlags::MREMAP_MAYMOVE);
        let fixed = flags.contains(MRemapFlags::MREMAP_FIXED);
        if fixed && !may_move {
            return Err(Errno::EINVAL);
        }

        let old_start = usize::from(old_addr);
        if old_start % page_size() != 0 {
            return Err(Errno::EINVAL);
        }
        // old_size == 0 requests a second mapping of shared pages, which the
        // offset-equals-address backing layout cannot express
        if old_size == 0 || new_size == 0 {
            return Err(Errno::EINVAL);
        }
        let old_size = round_up_page(old_size);
        let new_size = round_up_page(new_size);
        let old_interval = old_start..old_start + old_size;

        // the old range must lie within a single mapping
        let (container, region) = match self.regions.get(old_start) {
            Some((i, r)) => (i, r.clone()),
            None => return Err(Errno::EFAULT),
        };
        if container.end < old_interval.end {
            return Err(Errno::EFAULT);
        }

        if fixed {
            let dst = usize::from(new_addr);
            if dst % page_size() != 0 {
                return Err(Errno::EINVAL);
            }
            let new_interval = dst..dst + new_size;
            // the kernel rejects a destination overlapping the source
            if new_interval.start < old_interval.end && old_interval.start < new_interval.end {
                return Err(Errno::EINVAL);
            }
            return self.mremap_move(old_interval, new_interval, &region);
        }

        if new_size <= old_size {
            // shrink (or keep) in place: drop the tail
            if new_size < old_size {
                let mutations = self.regions.clear(old_start + new_size..old_interval.end);
                self.unmap_mutations(mutations);
            }
            return Ok(old_addr);
        }

        // grow in place when the old range is a whole region and the space
        // after it is free
        let extension = old_interval.end..old_start + new_size;
        if container == old_interval && self.range_is_free(&extension) {
            let new_interval = old_start..old_start + new_size;
            self.shm_file.alloc(&new_interval);

            let mut mutations = self.regions.clear(old_interval.clone());
            assert_eq!(mutations.len(), 1);
            let old_region = match mutations.pop() {
                Some(Mutation::Removed(removed_interval, old_region)) => {
                    assert_eq!(removed_interval, old_interval);
                    old_region
                }
                other => panic!("Unexpected mutation {:?}", other),
            };

            let shadow_base = self.shm_file.mmap_into_sim(&new_interval, old_region.prot);
            if !old_region.shadow_base.is_null() {
                sim_munmap(old_region.shadow_base, old_interval.len());
            }

            let mutations = self.regions.insert(
                new_interval,
                Region {
                    shadow_base,
                    ..old_region
                },
            );
            assert!(mutations.is_empty());
            return Ok(old_addr);
        }

        if !may_move {
            return Err(Errno::ENOMEM);
        }
        let new_interval = self.find_free_interval(new_size).ok_or(Errno::ENOMEM)?;
        self.mremap_move(old_interval, new_interval, &region)
    }

    // Relocate `old_interval` to `new_interval` via allocate-copy-release.
    fn mremap_move(
        &mut self,
        old_interval: Interval,
        new_interval: Interval,
        region: &Region,
    ) -> Result<ForeignPtr<u8>, Errno> {
        // evict whatever occupies the destination
        let mutations = self.regions.clear(new_interval.clone());
        self.unmap_mutations(mutations);

        self.shm_file.alloc(&new_interval);

        // preserve the old contents across the overlap of the extents
        let preserved = std::cmp::min(old_interval.len(), new_interval.len());
        self.shm_file
            .copy_within(old_interval.start, new_interval.start, preserved);

        let shadow_base = self.shm_file.mmap_into_sim(&new_interval, region.prot);

        // release the old range; its contents were copied out above
        let mutations = self.regions.clear(old_interval);
        self.unmap_mutations(mutations);

        let mutations = self.regions.insert(
            new_interval.clone(),
            Region {
                shadow_base,
                prot: region.prot,
                sharing: region.sharing,
                kind: region.kind,
            },
        );
        assert!(mutations.is_empty());

        Ok(ForeignPtr::from(new_interval.start))
    }

    /// Update protection flags on the covered regions, splitting them as
    /// needed, and mirror the change onto the simulator-side views so that
    /// later view requests observe the new protection immediately.
    pub fn handle_mprotect(
        &mut self,
        addr: ForeignPtr<u8>,
        size: usize,
        prot: ProtFlags,
    ) -> Result<(), Errno> {
        let start = usize::from(addr);
        if start % page_size() != 0 {
            return Err(Errno::EINVAL);
        }
        if size == 0 {
            return Ok(());
        }
        let size = round_up_page(size);
        let range = start..start + size;

        // the kernel reports ENOMEM if any part of the range is unmapped
        if !self.range_fully_mapped(&range) {
            return Err(Errno::ENOMEM);
        }

        trace!("mprotect({:?}, {}, {:?})", addr, size, prot);

        // We remove the affected range, and then update and re-insert the
        // affected pieces.
        let mutations = self.regions.clear(range);
        for mutation in mutations {
            match mutation {
                Mutation::ModifiedBegin(interval, new_start) => {
                    // modified prot of the beginning of the region
                    let (_, extant_region) = self.regions.get_mut(new_start).unwrap();
                    let modified_interval = interval.start..new_start;
                    let mut modified_region = extant_region.clone();
                    modified_region.prot = prot;
                    if !extant_region.shadow_base.is_null() {
                        extant_region.shadow_base =
                            unsafe { extant_region.shadow_base.add(modified_interval.len()) };
                        sim_mprotect(
                            modified_region.shadow_base,
                            modified_interval.len(),
                            prot,
                        );
                    }
                    assert!(self
                        .regions
                        .insert(modified_interval, modified_region)
                        .is_empty());
                }
                Mutation::ModifiedEnd(interval, new_end) => {
                    // modified prot of the end of the region
                    let (_, extant_region) = self.regions.get_mut(new_end - 1).unwrap();
                    let modified_interval = new_end..interval.end;
                    let mut modified_region = extant_region.clone();
                    modified_region.prot = prot;
                    if !modified_region.shadow_base.is_null() {
                        modified_region.shadow_base =
                            unsafe { modified_region.shadow_base.add(new_end - interval.start) };
                        sim_mprotect(
                            modified_region.shadow_base,
                            modified_interval.len(),
                            prot,
                        );
                    }
                    assert!(self
                        .regions
                        .insert(modified_interval, modified_region)
                        .is_empty());
                }
                Mutation::Split(_original, left, right) => {
                    let right_region = self.regions.get_mut(right.start).unwrap().1;
                    let modified_interval = left.end..right.start;
                    let mut modified_region = right_region.clone();
                    modified_region.prot = prot;
                    if !modified_region.shadow_base.is_null() {
                        modified_region.shadow_base =
                            unsafe { modified_region.shadow_base.add(left.len()) };
                        right_region.shadow_base = unsafe {
                            right_region
                                .shadow_base
                                .add(left.len() + modified_interval.len())
                        };
                        sim_mprotect(
                            modified_region.shadow_base,
                            modified_interval.len(),
                            prot,
                        );
                    }
                    assert!(self
                        .regions
                        .insert(modified_interval, modified_region)
                        .is_empty());
                }
                Mutation::Removed(modified_interval, mut modified_region) => {
                    modified_region.prot = prot;
                    if !modified_region.shadow_base.is_null() {
                        sim_mprotect(
                            modified_region.shadow_base,
                            modified_interval.len(),
                            prot,
                        );
                    }
                    assert!(self
                        .regions
                        .insert(modified_interval, modified_region)
                        .is_empty());
                }
            }
        }
        Ok(())
    }

    /// Checks that the whole range is mapped with (at least) the required
    /// protection. Fails with EFAULT otherwise, like the kernel does for an
    /// inaccessible user buffer.
    pub fn check_access(
        &self,
        ptr: ForeignArrayPtr<u8>,
        required: ProtFlags,
    ) -> Result<(), Errno> {
        if ptr.is_empty() {
            return Ok(());
        }
        let start = usize::from(ptr.ptr());
        let end = start + ptr.len();
        let mut cursor = start;
        while cursor < end {
            let (interval, region) = self.regions.get(cursor).ok_or(Errno::EFAULT)?;
            if !region.prot.contains(required) {
                return Err(Errno::EFAULT);
            }
            cursor = interval.end;
        }
        Ok(())
    }

    // Get a raw pointer to the monitored process's memory, if the requested
    // range is contained in one simulator-mapped region. Panics if called
    // with a zero-length `src`.
    fn get_mapped_ptr<T: Pod + Debug>(&self, src: ForeignArrayPtr<T>) -> Option<*mut T> {
        assert!(!src.is_empty());

        if usize::from(src.ptr()) % std::mem::align_of::<T>() != 0 {
            // Creating a reference from an unaligned pointer is undefined
            // behavior in Rust. Instead of accessing such pointers directly,
            // we fall back to the memory *copier*, which uses a safely
            // aligned intermediate buffer.
            trace!("Can't map unaligned pointer {:?}", src);
            return None;
        }

        let (interval, region) = match self.regions.get(usize::from(src.ptr())) {
            Some((i, r)) => (i, r),
            None => {
                if !src.ptr().is_null() {
                    warn!("src {:?} isn't in any mapped region", src);
                }
                return None;
            }
        };
        if region.shadow_base.is_null() {
            trace!("src {:?} isn't mapped into the simulator", src);
            return None;
        }

        let end = usize::from(src.ptr()) + src.len() * std::mem::size_of::<T>();
        if end > interval.end {
            trace!("src {:?} extends beyond its mapped region", src);
            return None;
        }

        let offset = usize::from(src.ptr()) - interval.start;
        // base pointer + offset won't wrap around, by construction
        let ptr = unsafe { region.shadow_base.add(offset) } as *mut T;

        Some(ptr)
    }

    fn get_mapped_ptr_and_count<T: Pod + Debug>(&self, src: ForeignArrayPtr<T>) -> Option<*mut T> {
        let res = self.get_mapped_ptr(src);
        if res.is_none() {
            self.inc_misses(src);
        }
        res
    }

    /// # Safety
    /// No mutable references to the covered monitored memory may exist.
    pub unsafe fn get_ref<T: Debug + Pod>(&self, src: ForeignArrayPtr<T>) -> Option<&[T]> {
        if src.is_empty() {
            return Some(&[]);
        }
        let ptr = self.get_mapped_ptr_and_count(src)?;
        Some(unsafe { std::slice::from_raw_parts(ptr, src.len()) })
    }

    /// # Safety
    /// No other references to the covered monitored memory may exist.
    #[allow(clippy::mut_from_ref)]
    pub unsafe fn get_mut<T: Debug + Pod>(&self, src: ForeignArrayPtr<T>) -> Option<&mut [T]> {
        if src.is_empty() {
            return Some(&mut []);
        }
        let ptr = self.get_mapped_ptr_and_count(src)?;
        Some(unsafe { std::slice::from_raw_parts_mut(ptr, src.len()) })
    }

    /// Counts accesses where we had to fall back to the (slow) copying
    /// accessor.
    fn inc_misses<T: Debug + Pod>(&self, src: ForeignArrayPtr<T>) {
        let key = match self.regions.get(usize::from(src.ptr())) {
            Some((_, region)) => format!("{:?}", region.kind),
            None => "not found".to_string(),
        };
        self.misses.borrow_mut().add_one(&key);
    }

    #[cfg(test)]
    pub(super) fn mapped_intervals(&self) -> Vec<Interval> {
        self.regions.keys().collect()
    }
}

impl Drop for MemoryMapper {
    fn drop(&mut self) {
        let misses = self.misses.borrow().clone();
        if misses == Counter::new() {
            debug!("MemoryManager misses for process {}: None", self.pid);
        } else {
            debug!("MemoryManager misses for process {}: {}", self.pid, misses);
        }

        // Mappings are no longer valid. Clear out our map, and unmap the
        // regions from the simulator's address space.
        let mutations = self.regions.clear(usize::MIN..usize::MAX);
        for m in mutations {
            if let Mutation::Removed(interval, region) = m {
                if !region.shadow_base.is_null() {
                    sim_munmap(region.shadow_base, interval.len());
                }
            }
        }
    }
}

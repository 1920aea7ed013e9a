//! Types used in emulating syscalls.

use std::marker::PhantomData;
use std::mem::size_of;

use log::Level::Debug;
use log::*;
use nix::errno::Errno;

use crate::host::syscall::condition::SyscallCondition;

/// A pointer to memory inside the monitored process. It is never valid to
/// dereference directly; all access goes through the owning process's
/// [`MemoryManager`](crate::host::memory_manager::MemoryManager).
pub struct ForeignPtr<T> {
    val: usize,
    _phantom: PhantomData<T>,
}

impl<T> ForeignPtr<T> {
    pub const fn null() -> Self {
        Self::new_unchecked(0)
    }

    const fn new_unchecked(val: usize) -> Self {
        Self {
            val,
            _phantom: PhantomData,
        }
    }

    pub fn is_null(&self) -> bool {
        self.val == 0
    }

    /// Reinterpret as a pointer to `U`. The address is unchanged.
    pub fn cast<U>(&self) -> ForeignPtr<U> {
        ForeignPtr::new_unchecked(self.val)
    }

    /// Advance the pointer by `count` items of type `T`.
    pub fn add(&self, count: usize) -> Self {
        Self::new_unchecked(self.val + count * size_of::<T>())
    }
}

impl<T> Copy for ForeignPtr<T> {}

impl<T> Clone for ForeignPtr<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> PartialEq for ForeignPtr<T> {
    fn eq(&self, other: &Self) -> bool {
        self.val == other.val
    }
}

impl<T> Eq for ForeignPtr<T> {}

impl<T> std::fmt::Debug for ForeignPtr<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "ForeignPtr({:#x})", self.val)
    }
}

impl<T> From<usize> for ForeignPtr<T> {
    fn from(val: usize) -> Self {
        Self::new_unchecked(val)
    }
}

impl<T> From<ForeignPtr<T>> for usize {
    fn from(ptr: ForeignPtr<T>) -> Self {
        ptr.val
    }
}

/// Wrapper around a [`ForeignPtr`] that encapsulates its size.
#[derive(Copy, Clone)]
pub struct ForeignArrayPtr<T> {
    base: ForeignPtr<T>,
    count: usize,
}

impl<T> std::fmt::Debug for ForeignArrayPtr<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ForeignArrayPtr")
            .field("base", &self.base)
            .field("count", &self.count)
            .field("size_of::<T>", &size_of::<T>())
            .finish()
    }
}

impl<T> ForeignArrayPtr<T> {
    /// Creates a typed pointer. Note though that the pointer *isn't*
    /// guaranteed to be aligned for `T`.
    pub fn new(ptr: ForeignPtr<T>, count: usize) -> Self {
        if log_enabled!(Debug) && usize::from(ptr) % std::mem::align_of::<T>() != 0 {
            // Linux allows unaligned pointers from user-space; we support
            // them too via the copying accessor, but never hand out direct
            // references to them. A debug message here is a sign-post for
            // weirdness that happens afterwards.
            debug!(
                "Creating unaligned pointer {ptr:?}. This is legal, but could trigger latent bugs."
            );
        }
        ForeignArrayPtr { base: ptr, count }
    }

    /// Raw foreign pointer.
    pub fn ptr(&self) -> ForeignPtr<T> {
        self.base
    }

    /// Number of items pointed to.
    pub fn len(&self) -> usize {
        self.count
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    pub fn is_null(&self) -> bool {
        self.base.is_null()
    }

    /// Cast to type `U`. Fails if the total size isn't a multiple of
    /// `sizeof<U>`.
    pub fn cast<U>(&self) -> Option<ForeignArrayPtr<U>> {
        let count_bytes = self.count * size_of::<T>();
        if count_bytes % size_of::<U>() != 0 {
            return None;
        }
        Some(ForeignArrayPtr::new(
            self.base.cast::<U>(),
            count_bytes / size_of::<U>(),
        ))
    }

    /// Cast to u8. Infallible since `size_of<u8>` is 1.
    pub fn cast_u8(&self) -> ForeignArrayPtr<u8> {
        self.cast::<u8>().unwrap()
    }

    /// Return a slice of this pointer.
    pub fn slice<R: std::ops::RangeBounds<usize>>(&self, range: R) -> ForeignArrayPtr<T> {
        use std::ops::Bound;
        let excluded_end = match range.end_bound() {
            Bound::Included(e) => e + 1,
            Bound::Excluded(e) => *e,
            Bound::Unbounded => self.count,
        };
        let included_start = match range.start_bound() {
            Bound::Included(s) => *s,
            Bound::Excluded(s) => s + 1,
            Bound::Unbounded => 0,
        };
        assert!(included_start <= excluded_end);
        assert!(excluded_end <= self.count);
        // `<=` rather than `<`, to allow an empty slice at the end of the ptr
        assert!(included_start <= self.count);

        ForeignArrayPtr {
            base: self.base.add(included_start),
            count: excluded_end - included_start,
        }
    }
}

/// A value in one of the six syscall argument registers, or the syscall
/// return register.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct SyscallReg(u64);

impl From<u64> for SyscallReg {
    fn from(v: u64) -> Self {
        Self(v)
    }
}

impl From<SyscallReg> for u64 {
    fn from(r: SyscallReg) -> Self {
        r.0
    }
}

impl From<i64> for SyscallReg {
    fn from(v: i64) -> Self {
        Self(v as u64)
    }
}

impl From<SyscallReg> for i64 {
    fn from(r: SyscallReg) -> Self {
        r.0 as i64
    }
}

impl From<u32> for SyscallReg {
    fn from(v: u32) -> Self {
        Self(v.into())
    }
}

impl From<i32> for SyscallReg {
    fn from(v: i32) -> Self {
        Self::from(v as i64)
    }
}

impl From<SyscallReg> for i32 {
    fn from(r: SyscallReg) -> Self {
        r.0 as i32
    }
}

impl From<usize> for SyscallReg {
    fn from(v: usize) -> Self {
        Self(v as u64)
    }
}

impl From<SyscallReg> for usize {
    fn from(r: SyscallReg) -> Self {
        r.0 as usize
    }
}

impl<T> From<ForeignPtr<T>> for SyscallReg {
    fn from(ptr: ForeignPtr<T>) -> Self {
        Self(usize::from(ptr) as u64)
    }
}

impl<T> From<SyscallReg> for ForeignPtr<T> {
    fn from(r: SyscallReg) -> Self {
        ForeignPtr::from(r.0 as usize)
    }
}

/// A trapped syscall, exactly as the shim forwarded it: the syscall number
/// and the six argument registers.
#[derive(Copy, Clone, Debug)]
pub struct SyscallArgs {
    pub number: i64,
    pub args: [SyscallReg; 6],
}

impl SyscallArgs {
    pub fn new(number: i64, args: [SyscallReg; 6]) -> Self {
        Self { number, args }
    }

    pub fn get(&self, i: usize) -> SyscallReg {
        self.args[i]
    }
}

// Calling all of these errors is stretching the semantics of 'error' a bit,
// but it makes for fluent programming in syscall handlers using the `?`
// operator.
#[derive(Debug)]
pub enum SyscallError {
    Failed(Failed),
    Blocked(Blocked),
}

#[derive(Debug)]
pub struct Blocked {
    pub condition: SyscallCondition,
    /// True if the syscall is restartable in the case that it was interrupted
    /// by a signal. e.g. if the syscall was a `read` operation on a socket
    /// without a configured timeout. See socket(7).
    pub restartable: bool,
}

#[derive(Debug, PartialEq, Eq)]
pub struct Failed {
    pub errno: Errno,
    pub restartable: bool,
}

pub type SyscallResult = Result<SyscallReg, SyscallError>;

impl From<Errno> for SyscallError {
    fn from(e: Errno) -> Self {
        SyscallError::Failed(Failed {
            errno: e,
            restartable: false,
        })
    }
}

impl From<std::io::Error> for SyscallError {
    fn from(e: std::io::Error) -> Self {
        match std::io::Error::raw_os_error(&e) {
            Some(e) => SyscallError::Failed(Failed {
                errno: Errno::from_i32(e),
                restartable: false,
            }),
            None => {
                let default = Errno::ENOTSUP;
                warn!("Mapping error {} to {}", e, default);
                SyscallError::from(default)
            }
        }
    }
}

impl SyscallError {
    /// The errno for a failed syscall, if this is a failure.
    pub fn failed_errno(&self) -> Option<Errno> {
        match self {
            Self::Failed(Failed { errno, .. }) => Some(*errno),
            Self::Blocked(_) => None,
        }
    }

    /// Returns the [condition](SyscallCondition) that the syscall is blocked
    /// on.
    pub fn blocked_condition(&mut self) -> Option<&mut SyscallCondition> {
        if let Self::Blocked(Blocked { condition, .. }) = self {
            Some(condition)
        } else {
            None
        }
    }
}

/// The outcome of a trapped syscall, as reported back over the trap boundary.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum SyscallReturn {
    /// Done executing the syscall; ready to let the monitored thread resume.
    Done(Result<SyscallReg, Errno>),
    /// We don't have the result yet; the thread stays parked in the
    /// scheduler.
    Block,
}

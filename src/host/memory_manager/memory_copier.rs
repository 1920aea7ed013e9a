use std::fmt::Debug;
use std::fs::File;
use std::os::unix::fs::FileExt;

use bytemuck::{Pod, Zeroable};
use log::*;
use nix::errno::Errno;

use crate::host::process::ProcessId;
use crate::host::syscall::types::ForeignArrayPtr;

/// A utility for copying data to and from the monitored process's memory.
///
/// Copies go through the shared-memory backing file (whose offsets equal
/// monitored virtual addresses), one syscall-level round trip per access.
/// This is the most robust accessor: it works for any mapped range,
/// including unaligned pointers and ranges that span multiple regions, at
/// the cost of a copy.
#[derive(Debug)]
pub struct MemoryCopier {
    pid: ProcessId,
    backing: File,
}

impl MemoryCopier {
    pub fn new(pid: ProcessId, backing: File) -> Self {
        Self { pid, backing }
    }

    pub fn try_clone(&self) -> Self {
        Self {
            pid: self.pid,
            backing: self.backing.try_clone().unwrap(),
        }
    }

    /// Copy the region into a new local buffer.
    pub fn clone_mem<T: Pod + Debug>(&self, ptr: ForeignArrayPtr<T>) -> Result<Vec<T>, Errno> {
        let mut v = vec![T::zeroed(); ptr.len()];
        self.copy_from_ptr(&mut v, ptr)?;
        Ok(v)
    }

    /// Copy `src` of the monitored process into `dst`.
    pub fn copy_from_ptr<T: Pod + Debug>(
        &self,
        dst: &mut [T],
        src: ForeignArrayPtr<T>,
    ) -> Result<(), Errno> {
        assert_eq!(dst.len(), src.len());
        let buf: &mut [u8] = bytemuck::cast_slice_mut(dst);
        let offset = usize::from(src.ptr().cast::<u8>()) as u64;

        trace!(
            "copying {} bytes from process {} at {:#x}",
            buf.len(),
            self.pid,
            offset
        );
        self.backing.read_exact_at(buf, offset).map_err(|e| {
            warn!("Tried to read {} bytes at {:#x}: {}", buf.len(), offset, e);
            Errno::EFAULT
        })
    }

    /// Copy `src` into `dst` of the monitored process.
    pub fn copy_to_ptr<T: Pod + Debug>(
        &self,
        dst: ForeignArrayPtr<T>,
        src: &[T],
    ) -> Result<(), Errno> {
        assert_eq!(src.len(), dst.len());
        let buf: &[u8] = bytemuck::cast_slice(src);
        let offset = usize::from(dst.ptr().cast::<u8>()) as u64;

        trace!(
            "writing {} bytes to process {} at {:#x}",
            buf.len(),
            self.pid,
            offset
        );
        self.backing.write_all_at(buf, offset).map_err(|e| {
            warn!("Tried to write {} bytes at {:#x}: {}", buf.len(), offset, e);
            Errno::EFAULT
        })
    }
}

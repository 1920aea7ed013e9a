use nix::sys::mman::{MapFlags, ProtFlags};

use crate::host::syscall::handler::{SyscallContext, SyscallHandler};
use crate::host::syscall::types::{ForeignPtr, SyscallError};

impl SyscallHandler {
    pub fn brk(
        ctx: &mut SyscallContext,
        addr: ForeignPtr<u8>,
    ) -> Result<ForeignPtr<u8>, SyscallError> {
        ctx.objs
            .process
            .memory_borrow_mut()
            .handle_brk(ctx.objs.thread, addr)
            .map_err(Into::into)
    }

    pub fn mmap(
        ctx: &mut SyscallContext,
        addr: ForeignPtr<u8>,
        length: libc::size_t,
        prot: libc::c_int,
        flags: libc::c_int,
        fd: libc::c_int,
        offset: libc::off_t,
    ) -> Result<ForeignPtr<u8>, SyscallError> {
        // unknown bits are ignored, like the kernel ignores bits it doesn't
        // implement
        let prot = ProtFlags::from_bits_truncate(prot);
        let flags = MapFlags::from_bits_truncate(flags);

        ctx.objs
            .process
            .memory_borrow_mut()
            .handle_mmap(ctx.objs.thread, addr, length, prot, flags, fd, offset)
            .map_err(Into::into)
    }

    pub fn munmap(
        ctx: &mut SyscallContext,
        addr: ForeignPtr<u8>,
        length: libc::size_t,
    ) -> Result<libc::c_int, SyscallError> {
        ctx.objs
            .process
            .memory_borrow_mut()
            .handle_munmap(ctx.objs.thread, addr, length)?;
        Ok(0)
    }

    pub fn mremap(
        ctx: &mut SyscallContext,
        old_addr: ForeignPtr<u8>,
        old_size: libc::size_t,
        new_size: libc::size_t,
        flags: libc::c_int,
        new_addr: ForeignPtr<u8>,
    ) -> Result<ForeignPtr<u8>, SyscallError> {
        ctx.objs
            .process
            .memory_borrow_mut()
            .handle_mremap(ctx.objs.thread, old_addr, old_size, new_size, flags, new_addr)
            .map_err(Into::into)
    }

    pub fn mprotect(
        ctx: &mut SyscallContext,
        addr: ForeignPtr<u8>,
        length: libc::size_t,
        prot: libc::c_int,
    ) -> Result<libc::c_int, SyscallError> {
        let prot = ProtFlags::from_bits_truncate(prot);

        ctx.objs
            .process
            .memory_borrow_mut()
            .handle_mprotect(ctx.objs.thread, addr, length, prot)?;
        Ok(0)
    }
}

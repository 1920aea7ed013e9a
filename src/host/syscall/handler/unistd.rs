use std::sync::Arc;

use atomic_refcell::AtomicRefCell;
use log::*;
use nix::errno::Errno;

use crate::host::descriptor::pipe::{self, PIPE_BUFFER_SIZE};
use crate::host::descriptor::shared_buf::SharedBuf;
use crate::host::descriptor::{
    CompatDescriptor, Descriptor, DescriptorFlags, FileMode, FileState, FileStatus, PosixFile,
};
use crate::host::syscall::condition::SyscallCondition;
use crate::host::syscall::handler::{SyscallContext, SyscallHandler};
use crate::host::syscall::types::{
    Blocked, ForeignArrayPtr, ForeignPtr, SyscallError, SyscallResult,
};
use crate::host::syscall::{Trigger, SYSCALL_IO_BUFSIZE};
use crate::utility::callback_queue::CallbackQueue;

impl SyscallHandler {
    pub fn close(ctx: &mut SyscallContext, fd: libc::c_int) -> SyscallResult {
        trace!("Trying to close fd {}", fd);

        let fd: u32 = fd.try_into().or(Err(Errno::EBADF))?;

        // according to "man 2 close", in Linux any errors that may occur will
        // happen after the fd is released, so we should always deregister the
        // descriptor even if there's an error while closing
        let desc = ctx
            .objs
            .process
            .descriptor_table_borrow_mut()
            .deregister_descriptor(fd)
            .ok_or(Errno::EBADF)?;

        // if there are still valid descriptors to the open file, close()
        // will do nothing and return None
        CallbackQueue::queue_and_run(|cb_queue| desc.close(cb_queue))
            .unwrap_or(Ok(0.into()))
    }

    pub fn dup(ctx: &mut SyscallContext, fd: libc::c_int) -> SyscallResult {
        // get the descriptor, or return early if it doesn't exist
        let mut desc_table = ctx.objs.process.descriptor_table_borrow_mut();
        let desc = Self::get_descriptor(&desc_table, fd)?;

        // duplicate the descriptor
        let new_desc = desc.dup(DescriptorFlags::empty());
        let new_fd = desc_table.register_descriptor(new_desc);

        // return the new fd
        Ok(libc::c_int::try_from(new_fd).unwrap().into())
    }

    pub fn dup2(
        ctx: &mut SyscallContext,
        old_fd: libc::c_int,
        new_fd: libc::c_int,
    ) -> SyscallResult {
        // get the descriptor, or return early if it doesn't exist
        let mut desc_table = ctx.objs.process.descriptor_table_borrow_mut();
        let desc = Self::get_descriptor(&desc_table, old_fd)?;

        // from 'man 2 dup2': "If oldfd is a valid file descriptor, and newfd
        // has the same value as oldfd, then dup2() does nothing, and returns
        // newfd"
        if old_fd == new_fd {
            return Ok(new_fd.into());
        }

        let new_fd: u32 = new_fd.try_into().or(Err(Errno::EBADF))?;

        // duplicate the descriptor
        let new_desc = desc.dup(DescriptorFlags::empty());
        let replaced_desc = desc_table.register_descriptor_with_fd(new_desc, new_fd);

        // close the replaced descriptor
        if let Some(replaced_desc) = replaced_desc {
            // from 'man 2 dup2': "If newfd was open, any errors that would
            // have been reported at close(2) time are lost"
            CallbackQueue::queue_and_run(|cb_queue| replaced_desc.close(cb_queue));
        }

        // return the new fd
        Ok(libc::c_int::try_from(new_fd).unwrap().into())
    }

    pub fn read(
        ctx: &mut SyscallContext,
        fd: libc::c_int,
        buf_ptr: ForeignPtr<u8>,
        buf_size: libc::size_t,
    ) -> SyscallResult {
        let offset = 0;
        let file = Self::get_file_for_io(ctx, fd)?;
        Self::read_helper(ctx, fd, file, buf_ptr, buf_size, offset)
    }

    pub fn pread64(
        ctx: &mut SyscallContext,
        fd: libc::c_int,
        buf_ptr: ForeignPtr<u8>,
        buf_size: libc::size_t,
        offset: libc::off_t,
    ) -> SyscallResult {
        let file = Self::get_file_for_io(ctx, fd)?;
        Self::read_helper(ctx, fd, file, buf_ptr, buf_size, offset)
    }

    pub fn write(
        ctx: &mut SyscallContext,
        fd: libc::c_int,
        buf_ptr: ForeignPtr<u8>,
        buf_size: libc::size_t,
    ) -> SyscallResult {
        let offset = 0;
        let file = Self::get_file_for_io(ctx, fd)?;
        Self::write_helper(ctx, fd, file, buf_ptr, buf_size, offset)
    }

    pub fn pwrite64(
        ctx: &mut SyscallContext,
        fd: libc::c_int,
        buf_ptr: ForeignPtr<u8>,
        buf_size: libc::size_t,
        offset: libc::off_t,
    ) -> SyscallResult {
        let file = Self::get_file_for_io(ctx, fd)?;
        Self::write_helper(ctx, fd, file, buf_ptr, buf_size, offset)
    }

    /// Resolve the posix file for a stream I/O syscall: the file retained by
    /// the blocked invocation if this is a re-dispatch, else the descriptor
    /// table entry (validated for kind).
    fn get_file_for_io(ctx: &mut SyscallContext, fd: libc::c_int) -> Result<PosixFile, Errno> {
        // if we were previously blocked, get the active file from the last
        // syscall handler invocation since it may no longer exist in the
        // descriptor table
        let file = ctx
            .objs
            .thread
            .syscall_condition()
            .and_then(|x| x.active_file().cloned());

        if let Some(file) = file {
            // we were previously blocked, so re-use the file from the
            // previous syscall invocation
            return Ok(file);
        }

        // get the file from the descriptor table, or return early if it
        // doesn't exist
        let desc_table = ctx.objs.process.descriptor_table_borrow();
        match Self::get_descriptor(&desc_table, fd)? {
            CompatDescriptor::New(desc) => Ok(desc.get_file().clone()),
            // legacy objects have no stream I/O here; read(2) reports EINVAL
            // for objects unsuitable for reading
            CompatDescriptor::Legacy(_) => Err(Errno::EINVAL),
        }
    }

    fn read_helper(
        ctx: &mut SyscallContext,
        _fd: libc::c_int,
        file: PosixFile,
        buf_ptr: ForeignPtr<u8>,
        buf_size: libc::size_t,
        offset: libc::off_t,
    ) -> SyscallResult {
        // move at most one transfer ceiling's worth of bytes per invocation;
        // the remainder, if any, is left for a subsequent call
        let buf_size = std::cmp::min(buf_size, SYSCALL_IO_BUFSIZE);

        let (file_status, recv_timeout) = {
            let borrowed = file.borrow();
            (borrowed.get_status(), borrowed.recv_timeout())
        };

        // the deadline is fixed when the syscall first blocks; re-dispatches
        // of the same invocation keep it
        let deadline = if ctx.handler.is_blocked() {
            ctx.objs
                .thread
                .syscall_condition()
                .and_then(|c| c.timeout())
        } else {
            recv_timeout.map(|timeout| ctx.objs.host.current_time() + timeout)
        };

        let result =
            // call the file's read(), and run any resulting events
            CallbackQueue::queue_and_run(|cb_queue| {
                file.borrow_mut().read(
                    ctx.objs
                        .process
                        .memory_borrow_mut()
                        .writer(ForeignArrayPtr::new(buf_ptr, buf_size)),
                    offset,
                    cb_queue,
                )
            });

        let would_block = matches!(
            &result,
            Err(SyscallError::Failed(f)) if f.errno == Errno::EWOULDBLOCK
        );

        // if the syscall would block and it's a blocking descriptor
        if would_block && !file_status.contains(FileStatus::NONBLOCK) {
            // the deadline elapsed without the file becoming readable:
            // resolve with the timeout result instead of blocking again
            if ctx.handler.is_blocked() && ctx.handler.did_listen_timeout_expire() {
                return Err(Errno::EWOULDBLOCK.into());
            }

            let restartable = file.borrow().supports_sa_restart() && deadline.is_none();

            let trigger = Trigger::from_file(file.clone(), FileState::READABLE);
            let mut condition = SyscallCondition::new(trigger);
            condition.set_timeout(deadline);
            condition.set_active_file(file);

            return Err(SyscallError::Blocked(Blocked {
                condition,
                restartable,
            }));
        }

        result
    }

    fn write_helper(
        ctx: &mut SyscallContext,
        _fd: libc::c_int,
        file: PosixFile,
        buf_ptr: ForeignPtr<u8>,
        buf_size: libc::size_t,
        offset: libc::off_t,
    ) -> SyscallResult {
        // short writes mirror short reads: at most one ceiling per call
        let buf_size = std::cmp::min(buf_size, SYSCALL_IO_BUFSIZE);

        let file_status = file.borrow().get_status();

        let result =
            // call the file's write(), and run any resulting events
            CallbackQueue::queue_and_run(|cb_queue| {
                file.borrow_mut().write(
                    ctx.objs
                        .process
                        .memory_borrow()
                        .reader(ForeignArrayPtr::new(buf_ptr, buf_size)),
                    offset,
                    cb_queue,
                )
            });

        let would_block = matches!(
            &result,
            Err(SyscallError::Failed(f)) if f.errno == Errno::EWOULDBLOCK
        );

        // if the syscall would block and it's a blocking descriptor
        if would_block && !file_status.contains(FileStatus::NONBLOCK) {
            let restartable = file.borrow().supports_sa_restart();

            let trigger = Trigger::from_file(file.clone(), FileState::WRITABLE);
            let mut condition = SyscallCondition::new(trigger);
            condition.set_active_file(file);

            return Err(SyscallError::Blocked(Blocked {
                condition,
                restartable,
            }));
        }

        result
    }

    pub fn pipe(ctx: &mut SyscallContext, fd_ptr: ForeignPtr<libc::c_int>) -> SyscallResult {
        Self::pipe_helper(ctx, fd_ptr, 0)
    }

    pub fn pipe2(
        ctx: &mut SyscallContext,
        fd_ptr: ForeignPtr<libc::c_int>,
        flags: libc::c_int,
    ) -> SyscallResult {
        Self::pipe_helper(ctx, fd_ptr, flags)
    }

    fn pipe_helper(
        ctx: &mut SyscallContext,
        fd_ptr: ForeignPtr<libc::c_int>,
        flags: i32,
    ) -> SyscallResult {
        // make sure they didn't pass a NULL pointer
        if fd_ptr.is_null() {
            return Err(Errno::EFAULT.into());
        }

        let mut file_flags = FileStatus::empty();
        let mut descriptor_flags = DescriptorFlags::empty();

        // keep track of which flags we use
        let mut remaining_flags = flags;

        if flags & libc::O_NONBLOCK != 0 {
            file_flags.insert(FileStatus::NONBLOCK);
            remaining_flags &= !libc::O_NONBLOCK;
        }

        if flags & libc::O_DIRECT != 0 {
            file_flags.insert(FileStatus::DIRECT);
            remaining_flags &= !libc::O_DIRECT;
        }

        if flags & libc::O_CLOEXEC != 0 {
            descriptor_flags.insert(DescriptorFlags::CLOEXEC);
            remaining_flags &= !libc::O_CLOEXEC;
        }

        // the user requested flags that we don't support
        if remaining_flags != 0 {
            warn!("Ignoring pipe flags {:#x}", remaining_flags);
        }

        // reference-counted buffer for the pipe
        let buffer = SharedBuf::new(PIPE_BUFFER_SIZE);
        let buffer = Arc::new(AtomicRefCell::new(buffer));

        // reference-counted file object for read end of the pipe
        let reader = pipe::Pipe::new(FileMode::READ, file_flags);
        let reader = Arc::new(AtomicRefCell::new(reader));

        // reference-counted file object for write end of the pipe
        let writer = pipe::Pipe::new(FileMode::WRITE, file_flags);
        let writer = Arc::new(AtomicRefCell::new(writer));

        // set the file objects to listen for events on the buffer
        CallbackQueue::queue_and_run(|cb_queue| {
            pipe::Pipe::connect_to_buffer(&reader, Arc::clone(&buffer), cb_queue);
            pipe::Pipe::connect_to_buffer(&writer, Arc::clone(&buffer), cb_queue);
        });

        // file descriptors for the read and write file objects
        let mut reader_desc = Descriptor::new(PosixFile::Pipe(reader));
        let mut writer_desc = Descriptor::new(PosixFile::Pipe(writer));

        // set the file descriptor flags
        reader_desc.set_flags(descriptor_flags);
        writer_desc.set_flags(descriptor_flags);

        // register the file descriptors
        let mut dt = ctx.objs.process.descriptor_table_borrow_mut();
        let read_fd = dt.register_descriptor(CompatDescriptor::New(reader_desc));
        let write_fd = dt.register_descriptor(CompatDescriptor::New(writer_desc));

        // try to write them to the caller
        let fds = [
            i32::try_from(read_fd).unwrap(),
            i32::try_from(write_fd).unwrap(),
        ];
        let write_res = ctx
            .objs
            .process
            .memory_borrow_mut()
            .copy_to_ptr(ForeignArrayPtr::new(fd_ptr, 2), &fds);

        // clean up in case of error
        match write_res {
            Ok(_) => Ok(0.into()),
            Err(e) => {
                CallbackQueue::queue_and_run(|cb_queue| {
                    // ignore any errors when closing
                    dt.deregister_descriptor(read_fd)
                        .unwrap()
                        .close(cb_queue);
                    dt.deregister_descriptor(write_fd)
                        .unwrap()
                        .close(cb_queue);
                });
                Err(e.into())
            }
        }
    }
}

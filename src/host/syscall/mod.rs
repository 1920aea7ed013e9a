use crate::host::descriptor::{FileState, PosixFile};

pub mod condition;
pub mod handler;
pub mod types;

/// Amount of data to transfer between the simulator and the monitored
/// process for each send/recv or read/write syscall. It would be more
/// efficient to dynamically compute how much we can read/write rather than
/// using this static size.
pub const SYSCALL_IO_BUFSIZE: usize = 1024 * 16; // 16 KiB

/// The state a blocked syscall is waiting for on a file.
#[derive(Clone, Debug)]
pub struct Trigger {
    file: PosixFile,
    state: FileState,
}

impl Trigger {
    pub fn from_file(file: PosixFile, state: FileState) -> Self {
        Self { file, state }
    }

    pub fn file(&self) -> &PosixFile {
        &self.file
    }

    pub fn state(&self) -> FileState {
        self.state
    }
}

macro_rules! syscall_numbers {
    ($($variant:ident => $nr:ident, $name:literal;)*) => {
        /// The syscalls this crate's handler dispatches. Raw numbers follow
        /// the native Linux numbering so that trap arguments pass through
        /// unchanged.
        #[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
        pub enum SyscallNum {
            $($variant,)*
        }

        impl SyscallNum {
            /// Maps a raw syscall number, if it's one we dispatch.
            pub fn new(raw: i64) -> Option<Self> {
                $(
                    if raw == libc::$nr {
                        return Some(Self::$variant);
                    }
                )*
                None
            }

            pub fn raw(&self) -> i64 {
                match self {
                    $(Self::$variant => libc::$nr,)*
                }
            }

            pub fn to_str(&self) -> &'static str {
                match self {
                    $(Self::$variant => $name,)*
                }
            }
        }
    };
}

syscall_numbers! {
    Brk => SYS_brk, "brk";
    Close => SYS_close, "close";
    Dup => SYS_dup, "dup";
    Dup2 => SYS_dup2, "dup2";
    Mmap => SYS_mmap, "mmap";
    Mprotect => SYS_mprotect, "mprotect";
    Mremap => SYS_mremap, "mremap";
    Munmap => SYS_munmap, "munmap";
    Pipe => SYS_pipe, "pipe";
    Pipe2 => SYS_pipe2, "pipe2";
    Pread64 => SYS_pread64, "pread64";
    Pwrite64 => SYS_pwrite64, "pwrite64";
    Read => SYS_read, "read";
    Write => SYS_write, "write";
}

impl std::fmt::Display for SyscallNum {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.to_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_syscall_num_roundtrip() {
        assert_eq!(SyscallNum::new(libc::SYS_read), Some(SyscallNum::Read));
        assert_eq!(SyscallNum::Read.raw(), libc::SYS_read);
        assert_eq!(SyscallNum::Read.to_str(), "read");
        // a syscall we don't dispatch
        assert_eq!(SyscallNum::new(libc::SYS_ptrace), None);
    }
}

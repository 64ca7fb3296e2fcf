use super::ElfObject;
use crate::{Result, error::io_error};
use alloc::ffi::CString;
use core::ffi::{CStr, c_int};
use syscalls::Sysno;

const O_RDONLY: usize = 0;
const SEEK_SET: usize = 0;

/// An elf file backed by a file descriptor, read through raw system calls.
pub struct ElfFile {
    name: CString,
    fd: c_int,
}

impl ElfFile {
    /// Open `path` read-only. Fails with [`Error::Io`](crate::Error) when the
    /// file does not exist or is not accessible.
    pub fn open(path: CString) -> Result<ElfFile> {
        let fd = unsafe {
            syscalls::raw_syscall!(Sysno::open, path.as_ptr(), O_RDONLY, 0)
        };
        if fd > -4096isize as usize {
            return Err(io_error("cannot open file"));
        }
        Ok(ElfFile {
            name: path,
            fd: fd as c_int,
        })
    }
}

impl Drop for ElfFile {
    fn drop(&mut self) {
        unsafe {
            syscalls::raw_syscall!(Sysno::close, self.fd);
        }
    }
}

impl ElfObject for ElfFile {
    fn file_name(&self) -> &CStr {
        &self.name
    }

    fn read(&mut self, mut buf: &mut [u8], offset: usize) -> Result<()> {
        unsafe {
            let ret = syscalls::raw_syscall!(Sysno::lseek, self.fd, offset, SEEK_SET);
            if ret > -4096isize as usize {
                return Err(io_error("lseek failed"));
            }
        }
        // Short reads are legal; loop until the buffer is full.
        while !buf.is_empty() {
            let n = unsafe {
                syscalls::raw_syscall!(Sysno::read, self.fd, buf.as_mut_ptr(), buf.len())
            };
            if n == 0 || n > -4096isize as usize {
                return Err(io_error("read failed"));
            }
            let rest = buf;
            buf = &mut rest[n..];
        }
        Ok(())
    }

    fn as_fd(&self) -> Option<i32> {
        Some(self.fd)
    }
}

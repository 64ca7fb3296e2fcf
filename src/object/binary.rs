use super::ElfObject;
use crate::{Result, error::io_error};
use alloc::ffi::CString;
use core::ffi::CStr;

/// An elf file stored in memory.
pub struct ElfBinary<'bytes> {
    name: CString,
    bytes: &'bytes [u8],
}

impl<'bytes> ElfBinary<'bytes> {
    pub fn new(name: &str, bytes: &'bytes [u8]) -> Self {
        ElfBinary {
            name: CString::new(name).unwrap(),
            bytes,
        }
    }
}

impl ElfObject for ElfBinary<'_> {
    fn file_name(&self) -> &CStr {
        &self.name
    }

    fn read(&mut self, buf: &mut [u8], offset: usize) -> Result<()> {
        let end = offset
            .checked_add(buf.len())
            .filter(|end| *end <= self.bytes.len())
            .ok_or_else(|| io_error("read out of bounds"))?;
        buf.copy_from_slice(&self.bytes[offset..end]);
        Ok(())
    }

    fn as_fd(&self) -> Option<i32> {
        None
    }
}

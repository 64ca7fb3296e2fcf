//! The original elf object
use crate::Result;
use core::ffi::CStr;

mod binary;
mod file;

pub use binary::ElfBinary;
pub use file::ElfFile;

/// The original elf object
pub trait ElfObject {
    /// Returns the elf object name
    fn file_name(&self) -> &CStr;
    /// Read data from the elf object
    fn read(&mut self, buf: &mut [u8], offset: usize) -> Result<()>;
    /// Extracts the raw file descriptor.
    fn as_fd(&self) -> Option<i32>;
}

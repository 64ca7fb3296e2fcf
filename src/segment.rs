//! The memory mapping of an elf object

use crate::{
    Result,
    arch::Phdr,
    mmap::{Mmap, ProtFlags},
};
use core::ffi::c_void;
use core::fmt::Debug;
use core::ptr::NonNull;
use elf::abi::{PF_R, PF_W, PF_X};

/// Standard page size used for memory mapping operations
pub const PAGE_SIZE: usize = 0x1000;

/// Mask used to align addresses down to page boundaries
pub(crate) const MASK: usize = !(PAGE_SIZE - 1);

#[inline]
pub(crate) fn roundup(x: usize, align: usize) -> usize {
    (x + align - 1) & !(align - 1)
}

/// Convert segment permission bits into mapping protection flags.
pub(crate) fn map_prot(p_flags: u32) -> ProtFlags {
    let mut prot = ProtFlags::PROT_NONE;
    if p_flags & PF_R != 0 {
        prot |= ProtFlags::PROT_READ;
    }
    if p_flags & PF_W != 0 {
        prot |= ProtFlags::PROT_WRITE;
    }
    if p_flags & PF_X != 0 {
        prot |= ProtFlags::PROT_EXEC;
    }
    prot
}

/// The memory mapping of an elf object.
///
/// Every runtime address of the object is `base() + elf_vaddr`. The mapping
/// is released when the value is dropped, except for borrowed images (the
/// main executable, which the kernel mapped for us).
pub struct ElfSegments {
    /// Pointer to the mapped memory
    pub(crate) memory: NonNull<c_void>,

    /// Lowest page-aligned p_vaddr of the object; `base = memory - offset`
    pub(crate) offset: usize,

    /// Total length of the mapped memory
    pub(crate) len: usize,

    /// Function used to release the mapping
    pub(crate) munmap: unsafe fn(NonNull<c_void>, usize) -> Result<()>,
}

impl Debug for ElfSegments {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("ElfSegments")
            .field("memory", &self.memory)
            .field("offset", &self.offset)
            .field("len", &self.len)
            .finish()
    }
}

impl Drop for ElfSegments {
    fn drop(&mut self) {
        unsafe {
            (self.munmap)(self.memory, self.len).ok();
        }
    }
}

unsafe fn noop_munmap(_addr: NonNull<c_void>, _len: usize) -> Result<()> {
    Ok(())
}

impl ElfSegments {
    pub(crate) fn new(
        memory: NonNull<c_void>,
        offset: usize,
        len: usize,
        munmap: unsafe fn(NonNull<c_void>, usize) -> Result<()>,
    ) -> Self {
        ElfSegments {
            memory,
            offset,
            len,
            munmap,
        }
    }

    /// A view of an image someone else mapped (and owns), such as the main
    /// executable placed by the kernel.
    pub(crate) fn borrowed(base: usize, offset: usize, len: usize) -> Self {
        ElfSegments {
            memory: NonNull::new((base + offset) as *mut c_void).unwrap(),
            offset,
            len,
            munmap: noop_munmap,
        }
    }

    /// The load bias of the object.
    #[inline]
    pub fn base(&self) -> usize {
        unsafe { self.memory.as_ptr().cast::<u8>().sub(self.offset) as usize }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Get a typed pointer at an object-relative virtual address.
    #[inline]
    pub(crate) fn get_ptr<T>(&self, vaddr: usize) -> *const T {
        // The offset must point inside the mapped ELF segments.
        debug_assert!(vaddr - self.offset < self.len);
        (self.base() + vaddr) as *const T
    }

    #[inline]
    pub(crate) fn get_mut_ptr<T>(&self, vaddr: usize) -> *mut T {
        self.get_ptr::<T>(vaddr) as *mut T
    }

    /// Get a typed slice at an object-relative virtual address.
    #[inline]
    pub(crate) fn get_slice<T>(&self, vaddr: usize, len: usize) -> &'static [T] {
        // The slice must stay inside the mapped ELF segments.
        debug_assert!(vaddr + len - self.offset <= self.len);
        unsafe { core::slice::from_raw_parts(self.get_ptr::<T>(vaddr), len / size_of::<T>()) }
    }

    #[inline]
    pub(crate) fn get_slice_mut<T>(&self, vaddr: usize, len: usize) -> &'static mut [T] {
        debug_assert!(vaddr + len - self.offset <= self.len);
        unsafe {
            core::slice::from_raw_parts_mut(self.get_mut_ptr::<T>(vaddr), len / size_of::<T>())
        }
    }
}

/// A PT_GNU_RELRO segment, re-protected read-only once every relocation
/// targeting it has been applied.
pub(crate) struct ElfRelro {
    addr: usize,
    len: usize,
    mprotect: unsafe fn(NonNull<c_void>, usize, ProtFlags) -> Result<()>,
}

impl ElfRelro {
    pub(crate) fn new<M: Mmap>(phdr: &Phdr, base: usize) -> ElfRelro {
        ElfRelro {
            addr: base + phdr.p_vaddr as usize,
            len: phdr.p_memsz as usize,
            mprotect: M::mprotect,
        }
    }

    /// Freeze the relocated region.
    #[inline]
    pub(crate) fn apply(&self) -> Result<()> {
        let end = roundup(self.addr + self.len, PAGE_SIZE);
        let start = self.addr & MASK;
        let start_addr = unsafe { NonNull::new_unchecked(start as _) };
        unsafe {
            (self.mprotect)(start_addr, end - start, ProtFlags::PROT_READ)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prot_conversion() {
        assert_eq!(map_prot(PF_R), ProtFlags::PROT_READ);
        assert_eq!(map_prot(PF_R | PF_W), ProtFlags::PROT_READ | ProtFlags::PROT_WRITE);
        assert_eq!(
            map_prot(PF_R | PF_X),
            ProtFlags::PROT_READ | ProtFlags::PROT_EXEC
        );
        assert_eq!(map_prot(0), ProtFlags::PROT_NONE);
    }

    #[test]
    fn page_rounding() {
        assert_eq!(roundup(0, PAGE_SIZE), 0);
        assert_eq!(roundup(1, PAGE_SIZE), PAGE_SIZE);
        assert_eq!(roundup(PAGE_SIZE, PAGE_SIZE), PAGE_SIZE);
        assert_eq!((PAGE_SIZE + 1) & MASK, PAGE_SIZE);
        assert_eq!((PAGE_SIZE - 1) & MASK, 0);
    }

    #[test]
    fn base_accounts_for_offset() {
        let buf = [0u8; 32];
        let base = buf.as_ptr() as usize;
        let segments = ElfSegments::borrowed(base, 0x2000, 32);
        assert_eq!(segments.base(), base);
        assert_eq!(segments.get_ptr::<u8>(0x2000) as usize, base + 0x2000);
    }
}

//! Map memory to the address space

mod linux_syscall;

pub use linux_syscall::MmapImpl;

use crate::Result;
use bitflags::bitflags;
use core::{
    ffi::{c_int, c_void},
    ptr::NonNull,
};

bitflags! {
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    /// Desired memory protection of a memory mapping.
    pub struct ProtFlags: c_int {
        /// Pages cannot be accessed.
        const PROT_NONE = 0;
        /// Pages can be read.
        const PROT_READ = 1;
        /// Pages can be written.
        const PROT_WRITE = 2;
        /// Pages can be executed
        const PROT_EXEC = 4;
    }
}

bitflags! {
    #[derive(Clone, Copy)]
    /// Additional parameters for [`Mmap::mmap`].
    pub struct MapFlags: c_int {
        /// Create a private copy-on-write mapping.
        const MAP_PRIVATE = 2;
        /// Place the mapping at exactly the address specified in `addr`.
        const MAP_FIXED = 16;
        /// The mapping is not backed by any file.
        const MAP_ANONYMOUS = 32;
    }
}

/// Low-level memory mapping operations used by the loader.
///
/// The linker performs every address-space manipulation through this trait so
/// that the mapping backend can be swapped (raw syscalls in the real linker,
/// or a recording stub in tests).
pub trait Mmap {
    /// Map a file or bytes into memory at the given address.
    ///
    /// `need_copy` is set to false if the implementation can materialize the
    /// file content on its own, and to true when the caller has to copy the
    /// bytes into the mapping afterwards (anonymous backing).
    ///
    /// # Safety
    /// This depends on the correctness of the trait implementation.
    unsafe fn mmap(
        addr: Option<usize>,
        len: usize,
        prot: ProtFlags,
        flags: MapFlags,
        offset: usize,
        fd: Option<i32>,
        need_copy: &mut bool,
    ) -> Result<NonNull<c_void>>;

    /// Create a new anonymous mapping.
    ///
    /// # Safety
    /// This depends on the correctness of the trait implementation.
    unsafe fn mmap_anonymous(
        addr: usize,
        len: usize,
        prot: ProtFlags,
        flags: MapFlags,
    ) -> Result<NonNull<c_void>>;

    /// Release a previously mapped memory region.
    ///
    /// # Safety
    /// This depends on the correctness of the trait implementation.
    unsafe fn munmap(addr: NonNull<c_void>, len: usize) -> Result<()>;

    /// Change the protection of a memory region.
    ///
    /// # Safety
    /// This depends on the correctness of the trait implementation.
    unsafe fn mprotect(addr: NonNull<c_void>, len: usize, prot: ProtFlags) -> Result<()>;

    /// Reserve a region of the virtual address space without committing it.
    ///
    /// The reservation keeps the kernel's allocator from interleaving foreign
    /// mappings between the segments of one object; the individual segments
    /// are then placed over it with `MAP_FIXED`.
    ///
    /// # Safety
    /// This depends on the correctness of the trait implementation.
    unsafe fn mmap_reserve(addr: Option<usize>, len: usize) -> Result<NonNull<c_void>> {
        let mut need_copy = false;
        unsafe {
            Self::mmap(
                addr,
                len,
                ProtFlags::PROT_NONE,
                MapFlags::MAP_PRIVATE | MapFlags::MAP_ANONYMOUS,
                0,
                None,
                &mut need_copy,
            )
        }
    }
}

//! Static thread-local storage, Variant II layout.
//!
//! The thread pointer sits above all TLS data and the word it addresses
//! holds the thread pointer itself. The initialized part of the block is a
//! copy of the PT_TLS template; everything below it down to `tp - memsz`
//! is zero-filled BSS.

use crate::{
    Result,
    arch::{self, Phdr},
    mmap::{MapFlags, Mmap, ProtFlags},
};
use elf::abi::PT_TLS;

/// Size of the thread control block kept above the TLS data: just the
/// self-pointer word on this port.
const TCB_SIZE: usize = core::mem::size_of::<usize>();

/// Padding kept above the control block.
const TP_PAD: usize = 16;

/// The PT_TLS template of one object: the image to copy for every new
/// thread and the layout it requires.
#[derive(Clone, Copy, Debug)]
pub struct TlsTemplate {
    /// Runtime address of the initialization image.
    pub image: usize,
    /// Bytes to copy out of the image.
    pub filesz: usize,
    /// Total size of the block, including zero-initialized data.
    pub memsz: usize,
    /// Required alignment of the block.
    pub align: usize,
}

impl TlsTemplate {
    pub(crate) fn from_phdr(phdr: &Phdr, base: usize) -> Option<TlsTemplate> {
        if phdr.p_type != PT_TLS || phdr.p_memsz == 0 {
            return None;
        }
        Some(TlsTemplate {
            image: base + phdr.p_vaddr as usize,
            filesz: phdr.p_filesz as usize,
            memsz: phdr.p_memsz as usize,
            align: phdr.p_align as usize,
        })
    }

    /// Size of the data area below the thread pointer once alignment is
    /// applied.
    #[inline]
    pub(crate) fn aligned_memsz(&self) -> usize {
        align_up(self.memsz, self.align.max(16))
    }

    /// Offset of this module's data relative to the thread pointer. TLS data
    /// lives below the thread pointer, so the offset is negative.
    #[inline]
    pub(crate) fn static_offset(&self) -> isize {
        -(self.memsz as isize)
    }
}

/// The main thread's TLS block.
pub struct TlsBlock {
    block: usize,
    tp: usize,
    len: usize,
}

impl TlsBlock {
    /// Allocate and initialize a block for `template`, leaving the thread
    /// register untouched.
    pub fn allocate<M: Mmap>(template: &TlsTemplate) -> Result<TlsBlock> {
        let aligned = template.aligned_memsz();
        let len = aligned + TCB_SIZE + TP_PAD;
        let block = unsafe {
            M::mmap_anonymous(
                0,
                len,
                ProtFlags::PROT_READ | ProtFlags::PROT_WRITE,
                MapFlags::MAP_PRIVATE,
            )?
        }
        .as_ptr() as usize;
        let tp = block + aligned;
        unsafe {
            // Anonymous pages are zero; only the template copy and the
            // self-pointer need explicit writes.
            core::ptr::copy_nonoverlapping(
                template.image as *const u8,
                (tp - template.memsz) as *mut u8,
                template.filesz,
            );
            (tp as *mut usize).write(tp);
        }
        Ok(TlsBlock { block, tp, len })
    }

    /// The value the thread register will hold.
    #[inline]
    pub fn thread_pointer(&self) -> usize {
        self.tp
    }

    /// Lowest address of the block.
    #[inline]
    pub fn block(&self) -> usize {
        self.block
    }

    /// Total allocation size, including the control block and padding.
    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    /// Point the thread register at the block.
    ///
    /// # Safety
    /// Callers must not install a block while thread-local state from a
    /// previous block is still live.
    pub unsafe fn install(&self) -> Result<()> {
        unsafe { arch::set_thread_pointer(self.tp) }
    }
}

#[inline]
pub(crate) fn align_up(value: usize, align: usize) -> usize {
    (value + align - 1) & !(align - 1)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mmap::MmapImpl;

    #[test]
    fn block_layout_matches_variant_ii() {
        // filesz = 8, memsz = 24, align = 8
        let image: [u8; 8] = [1, 2, 3, 4, 5, 6, 7, 8];
        let template = TlsTemplate {
            image: image.as_ptr() as usize,
            filesz: 8,
            memsz: 24,
            align: 8,
        };
        let aligned = template.aligned_memsz();
        assert_eq!(aligned, 32);

        let block = TlsBlock::allocate::<MmapImpl>(&template).unwrap();
        let tp = block.thread_pointer();
        assert_eq!(tp, block.block() + aligned);
        // aligned data + control block + padding
        assert_eq!(block.len(), 32 + 8 + 16);
        // Self-pointer invariant.
        assert_eq!(unsafe { *(tp as *const usize) }, tp);
        // The template lands at tp - memsz.
        let data = unsafe { core::slice::from_raw_parts((tp - 24) as *const u8, 24) };
        assert_eq!(&data[..8], &image);
        // Zero-initialized tail of the block.
        assert!(data[8..].iter().all(|b| *b == 0));
        // BSS below the initialized image is zero as well.
        let below = unsafe { core::slice::from_raw_parts(block.block() as *const u8, aligned - 24) };
        assert!(below.iter().all(|b| *b == 0));
    }

    #[test]
    fn static_offset_is_negative_memsz() {
        let template = TlsTemplate {
            image: 0,
            filesz: 0,
            memsz: 24,
            align: 8,
        };
        assert_eq!(template.static_offset(), -24);
    }

    #[test]
    fn alignment_is_at_least_sixteen() {
        let template = TlsTemplate {
            image: 0,
            filesz: 0,
            memsz: 10,
            align: 4,
        };
        assert_eq!(template.aligned_memsz(), 16);
    }
}

//! Materializing PT_LOAD segments into the address space
use crate::{
    Result,
    arch::{Dyn, EHDR_SIZE, PHDR_SIZE, Phdr},
    ehdr::ElfHeader,
    error::parse_dynamic_error,
    mmap::{self, MapFlags, Mmap, ProtFlags},
    object::ElfObject,
    segment::{ElfRelro, ElfSegments, MASK, PAGE_SIZE, map_prot},
    tls::TlsTemplate,
};
use alloc::{borrow::ToOwned, ffi::CString, vec::Vec};
use core::{
    ffi::c_void,
    marker::PhantomData,
    mem::MaybeUninit,
    ptr::NonNull,
};
use elf::abi::{PT_DYNAMIC, PT_GNU_RELRO, PT_LOAD, PT_PHDR, PT_TLS};

/// An elf object mapped into memory but not yet linked into the process.
pub struct ElfImage {
    pub(crate) name: CString,
    pub(crate) segments: ElfSegments,
    /// `e_entry` as stored in the file; biased by the caller.
    pub(crate) entry: usize,
    pub(crate) phdrs: &'static [Phdr],
    pub(crate) dynamic: Option<NonNull<Dyn>>,
    pub(crate) relro: Option<ElfRelro>,
    pub(crate) tls: Option<TlsTemplate>,
}

impl ElfImage {
    #[inline]
    pub fn base(&self) -> usize {
        self.segments.base()
    }
}

/// The offset and length of the slice of the object mapped by one call.
struct MmapRange {
    len: usize,
    /// Offset of the mapped region in the elf object, page aligned.
    offset: usize,
}

struct MmapParam {
    addr: Option<usize>,
    len: usize,
    prot: ProtFlags,
    flags: MapFlags,
    range: MmapRange,
}

fn mmap_segment<M: Mmap>(param: &MmapParam, object: &mut impl ElfObject) -> Result<NonNull<c_void>> {
    let mut need_copy = false;
    let ptr = unsafe {
        M::mmap(
            param.addr,
            param.len,
            param.prot,
            param.flags,
            param.range.offset,
            object.as_fd(),
            &mut need_copy,
        )
    }?;
    if need_copy {
        let dest =
            unsafe { core::slice::from_raw_parts_mut(ptr.as_ptr().cast::<u8>(), param.range.len) };
        object.read(dest, param.range.offset)?;
        unsafe { M::mprotect(ptr, param.len, param.prot) }?;
    }
    Ok(ptr)
}

/// Compute the single mapping that reserves the whole extent of the object
/// and materializes the lowest PT_LOAD in the same call.
fn create_segments(phdrs: &[Phdr], is_pic: bool) -> Option<(MmapParam, usize)> {
    let mut min_vaddr = usize::MAX;
    let mut max_vaddr = 0;
    let mut min_off = 0;
    let mut min_filesz = 0;
    let mut min_prot = 0;

    for phdr in phdrs.iter() {
        if phdr.p_type == PT_LOAD && phdr.p_memsz > 0 {
            let vaddr_start = phdr.p_vaddr as usize;
            let vaddr_end = (phdr.p_vaddr + phdr.p_memsz) as usize;
            if vaddr_start < min_vaddr {
                min_vaddr = vaddr_start;
                min_off = phdr.p_offset as usize & MASK;
                min_prot = phdr.p_flags;
                min_filesz = (phdr.p_offset as usize - min_off) + phdr.p_filesz as usize;
            }
            if vaddr_end > max_vaddr {
                max_vaddr = vaddr_end;
            }
        }
    }
    if min_vaddr == usize::MAX {
        return None;
    }

    max_vaddr = (max_vaddr + PAGE_SIZE - 1) & MASK;
    min_vaddr &= MASK;
    let total_size = max_vaddr - min_vaddr;
    // The kernel picks the base of a position independent object; absolute
    // executables are pinned to their linked addresses.
    let (addr, flags) = if is_pic {
        (None, mmap::MapFlags::MAP_PRIVATE)
    } else {
        (
            Some(min_vaddr),
            mmap::MapFlags::MAP_PRIVATE | mmap::MapFlags::MAP_FIXED,
        )
    };
    Some((
        MmapParam {
            addr,
            len: total_size,
            prot: map_prot(min_prot),
            flags,
            range: MmapRange {
                len: min_filesz,
                offset: min_off,
            },
        },
        min_vaddr,
    ))
}

/// Mapping parameters for one PT_LOAD beyond the first.
fn load_segment(segments: &ElfSegments, phdr: &Phdr) -> Option<MmapParam> {
    let addr_min = segments.offset;
    let base = segments.base();
    // Mapped range is page aligned on both ends.
    let min_vaddr = phdr.p_vaddr as usize & MASK;
    let max_vaddr = (phdr.p_vaddr as usize + phdr.p_memsz as usize + PAGE_SIZE - 1) & MASK;
    let memsz = max_vaddr - min_vaddr;
    let prot = map_prot(phdr.p_flags);
    let real_addr = min_vaddr + base;
    let offset = phdr.p_offset as usize & MASK;
    // Reading starts at the rounded down offset, so the in-file alignment
    // slack has to be included in the length.
    let align_len = phdr.p_offset as usize - offset;
    let filesz = phdr.p_filesz as usize + align_len;
    // The lowest segment was materialized together with the reservation.
    if addr_min != min_vaddr {
        Some(MmapParam {
            addr: Some(real_addr),
            len: memsz,
            prot,
            flags: mmap::MapFlags::MAP_PRIVATE | mmap::MapFlags::MAP_FIXED,
            range: MmapRange { len: filesz, offset },
        })
    } else {
        None
    }
}

/// Zero the tail of the file-backed part of a segment and map fresh
/// anonymous pages for whatever BSS extends past it.
fn fill_bss<M: Mmap>(segments: &ElfSegments, phdr: &Phdr) -> Result<()> {
    if phdr.p_filesz < phdr.p_memsz {
        let prot = map_prot(phdr.p_flags);
        let max_vaddr = (phdr.p_vaddr as usize + phdr.p_memsz as usize + PAGE_SIZE - 1) & MASK;
        let zero_start = (phdr.p_vaddr + phdr.p_filesz) as usize;
        let zero_end = (zero_start + PAGE_SIZE - 1) & MASK;
        let zero_mem = segments.get_slice_mut::<u8>(zero_start, zero_end - zero_start);
        zero_mem.fill(0);

        if zero_end < max_vaddr {
            // The rest is whole pages; back them with anonymous memory.
            let zero_mmap_addr = segments.base() + zero_end;
            let zero_mmap_len = max_vaddr - zero_end;
            unsafe {
                M::mmap_anonymous(
                    zero_mmap_addr,
                    zero_mmap_len,
                    prot,
                    mmap::MapFlags::MAP_PRIVATE | mmap::MapFlags::MAP_FIXED,
                )?;
            }
        }
    }
    Ok(())
}

struct ElfBuf {
    stack_buf: MaybeUninit<[u8; EHDR_SIZE + 12 * PHDR_SIZE]>,
    heap_buf: Vec<u8>,
}

impl ElfBuf {
    const MAX_BUF_SIZE: usize = EHDR_SIZE + 12 * PHDR_SIZE;

    const fn new() -> Self {
        ElfBuf {
            stack_buf: MaybeUninit::uninit(),
            heap_buf: Vec::new(),
        }
    }

    #[inline]
    fn stack_buf(&mut self) -> &mut [u8] {
        unsafe { &mut *self.stack_buf.as_mut_ptr() }
    }

    /// The header table read together with the ELF header; only valid when
    /// it fits the stack buffer.
    #[inline]
    fn phdrs_from_stack(&self, phdr_start: usize, phdr_end: usize) -> &[Phdr] {
        debug_assert!(Self::MAX_BUF_SIZE >= phdr_end);
        unsafe {
            core::slice::from_raw_parts(
                self.stack_buf
                    .as_ptr()
                    .cast::<u8>()
                    .add(phdr_start)
                    .cast::<Phdr>(),
                (phdr_end - phdr_start) / PHDR_SIZE,
            )
        }
    }

    #[inline]
    fn heap_buf(&mut self, len: usize) -> &mut Vec<u8> {
        self.heap_buf.resize(len, 0);
        &mut self.heap_buf
    }

    #[inline]
    fn phdrs_from_heap(&self) -> &[Phdr] {
        unsafe {
            core::slice::from_raw_parts(
                self.heap_buf.as_ptr().cast::<Phdr>(),
                self.heap_buf.len() / PHDR_SIZE,
            )
        }
    }
}

/// The elf object loader.
///
/// Maps every PT_LOAD segment of an object, computes the load bias, and
/// collects the program headers that matter to the linker (PT_DYNAMIC,
/// PT_GNU_RELRO, PT_TLS, PT_PHDR).
pub struct Loader<M>
where
    M: Mmap,
{
    _marker: PhantomData<M>,
}

impl<M: Mmap> Default for Loader<M> {
    fn default() -> Self {
        Self::new()
    }
}

impl<M: Mmap> Loader<M> {
    /// Create a new loader
    pub const fn new() -> Self {
        Self {
            _marker: PhantomData,
        }
    }

    /// Map an elf object into memory and return the unlinked image.
    pub fn load(&self, mut object: impl ElfObject) -> Result<ElfImage> {
        let mut buf = ElfBuf::new();
        object.read(buf.stack_buf(), 0)?;
        let ehdr = ElfHeader::new(buf.stack_buf())?;
        ehdr.validate()?;
        let entry = ehdr.e_entry();
        let is_pic = ehdr.is_pic();
        let (phdr_start, phdr_end) = ehdr.phdr_range();
        let phdrs = if ElfBuf::MAX_BUF_SIZE >= phdr_end {
            buf.phdrs_from_stack(phdr_start, phdr_end)
        } else {
            object.read(buf.heap_buf(phdr_end - phdr_start), phdr_start)?;
            buf.phdrs_from_heap()
        };
        // Reserve the whole extent and materialize the lowest segment.
        let (param, min_vaddr) = create_segments(phdrs, is_pic)
            .ok_or_else(|| parse_dynamic_error("no loadable segments"))?;
        let memory = mmap_segment::<M>(&param, &mut object)?;
        let segments = ElfSegments::new(memory, min_vaddr, param.len, M::munmap);

        let mut dynamic = None;
        let mut relro = None;
        let mut tls = None;
        let mut phdr_mmap = None;
        for phdr in phdrs.iter() {
            match phdr.p_type {
                PT_LOAD => {
                    if phdr.p_memsz == 0 {
                        continue;
                    }
                    if let Some(param) = load_segment(&segments, phdr) {
                        mmap_segment::<M>(&param, &mut object)?;
                    }
                    fill_bss::<M>(&segments, phdr)?;
                }
                PT_DYNAMIC => {
                    dynamic =
                        NonNull::new((segments.base() + phdr.p_vaddr as usize) as *mut Dyn);
                }
                PT_GNU_RELRO => relro = Some(ElfRelro::new::<M>(phdr, segments.base())),
                PT_TLS => tls = TlsTemplate::from_phdr(phdr, segments.base()),
                PT_PHDR => {
                    phdr_mmap = Some(unsafe {
                        core::slice::from_raw_parts(
                            (segments.base() + phdr.p_vaddr as usize) as *const Phdr,
                            phdr.p_memsz as usize / PHDR_SIZE,
                        )
                    })
                }
                _ => {}
            }
        }
        let phdrs = phdr_mmap.unwrap_or_else(|| find_mapped_phdrs(&ehdr, phdrs, &segments));
        Ok(ElfImage {
            name: object.file_name().to_owned(),
            segments,
            entry,
            phdrs,
            dynamic,
            relro,
            tls,
        })
    }
}

/// Locate the program header table inside the mapped image when no PT_PHDR
/// entry names it.
fn find_mapped_phdrs(
    ehdr: &ElfHeader,
    phdrs: &[Phdr],
    segments: &ElfSegments,
) -> &'static [Phdr] {
    let (phdr_start, phdr_end) = ehdr.phdr_range();
    for phdr in phdrs {
        let cur_range = phdr.p_offset as usize..(phdr.p_offset + phdr.p_filesz) as usize;
        if cur_range.contains(&phdr_start) && cur_range.contains(&(phdr_end - 1)) {
            let vaddr = phdr.p_vaddr as usize + (phdr_start - cur_range.start);
            return segments.get_slice(vaddr, phdr_end - phdr_start);
        }
    }
    // Images without a mapped header table keep an empty slice; nothing in
    // the link path dereferences it for such objects.
    &[]
}

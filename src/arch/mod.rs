//! Contents related to the CPU instruction set
use elf::abi::{
    SHN_ABS, SHN_UNDEF, STB_GLOBAL, STB_GNU_UNIQUE, STB_LOCAL, STB_WEAK, STT_COMMON, STT_FUNC,
    STT_GNU_IFUNC, STT_NOTYPE, STT_OBJECT, STT_TLS,
};

cfg_if::cfg_if! {
    if #[cfg(target_arch = "x86_64")]{
        mod x86_64;
        pub use x86_64::*;
    } else {
        compile_error!("unsupported arch");
    }
}

pub const REL_NONE: u32 = 0;
const OK_BINDS: usize = 1 << STB_GLOBAL | 1 << STB_WEAK | 1 << STB_GNU_UNIQUE;
const OK_TYPES: usize = 1 << STT_NOTYPE
    | 1 << STT_OBJECT
    | 1 << STT_FUNC
    | 1 << STT_COMMON
    | 1 << STT_TLS
    | 1 << STT_GNU_IFUNC;

pub(crate) const E_CLASS: u8 = elf::abi::ELFCLASS64;
pub type Phdr = elf::segment::Elf64_Phdr;
pub type Dyn = elf::dynamic::Elf64_Dyn;
pub(crate) type Rela = elf::relocation::Elf64_Rela;
pub(crate) type Sym = elf::symbol::Elf64_Sym;
pub(crate) const REL_MASK: usize = 0xFFFFFFFF;
pub(crate) const REL_BIT: usize = 32;
pub(crate) const EHDR_SIZE: usize = core::mem::size_of::<elf::file::Elf64_Ehdr>();
pub(crate) const PHDR_SIZE: usize = core::mem::size_of::<Phdr>();

/// A relocation record with explicit addend, viewed in place.
#[repr(transparent)]
pub struct ElfRela {
    rela: Rela,
}

impl ElfRela {
    #[inline]
    pub fn r_type(&self) -> usize {
        self.rela.r_info as usize & REL_MASK
    }

    #[inline]
    pub fn r_symbol(&self) -> usize {
        self.rela.r_info as usize >> REL_BIT
    }

    #[inline]
    pub fn r_offset(&self) -> usize {
        self.rela.r_offset as usize
    }

    #[inline]
    pub fn r_addend(&self) -> isize {
        self.rela.r_addend as isize
    }
}

/// A symbol table entry, viewed in place.
#[repr(transparent)]
pub struct ElfSymbol {
    sym: Sym,
}

impl ElfSymbol {
    #[inline]
    pub fn st_value(&self) -> usize {
        self.sym.st_value as usize
    }

    /// STB_* constants describe the symbol binding (upper half of st_info).
    #[inline]
    pub fn st_bind(&self) -> u8 {
        self.sym.st_info >> 4
    }

    /// STT_* constants describe the symbol type (lower half of st_info).
    #[inline]
    pub fn st_type(&self) -> u8 {
        self.sym.st_info & 0xf
    }

    #[inline]
    pub fn st_shndx(&self) -> usize {
        self.sym.st_shndx as usize
    }

    #[inline]
    pub fn st_name(&self) -> usize {
        self.sym.st_name as usize
    }

    #[inline]
    pub fn st_size(&self) -> usize {
        self.sym.st_size as usize
    }

    #[inline]
    pub fn is_undef(&self) -> bool {
        self.st_shndx() == SHN_UNDEF as usize
    }

    #[inline]
    pub fn is_absolute(&self) -> bool {
        self.st_shndx() == SHN_ABS as usize
    }

    #[inline]
    pub fn is_ok_bind(&self) -> bool {
        (1 << self.st_bind()) & OK_BINDS != 0
    }

    #[inline]
    pub fn is_ok_type(&self) -> bool {
        (1 << self.st_type()) & OK_TYPES != 0
    }

    #[inline]
    pub fn is_local(&self) -> bool {
        self.st_bind() == STB_LOCAL
    }

    #[inline]
    pub fn is_weak(&self) -> bool {
        self.st_bind() == STB_WEAK
    }
}

/// Writes the metadata lazy binding needs into the reserved GOT slots:
/// the loaded object for slot 1 and the resolver entry for slot 2.
#[inline]
pub(crate) fn prepare_lazy_bind(got: *mut usize, object: usize) {
    // The object outlives the process; the GOT is writable until RELRO.
    unsafe {
        got.add(OBJECT_SLOT).write(object);
        got.add(RESOLVER_SLOT).write(dl_runtime_resolve as usize);
    }
}

//! Parsing and validating the elf header
use crate::{
    Result,
    arch::{E_CLASS, EHDR_SIZE, EM_ARCH},
    error::parse_ehdr_error,
};
use elf::{
    abi::{EI_NIDENT, ET_DYN, ET_EXEC},
    endian::NativeEndian,
    file::{Class, FileHeader, parse_ident},
};

pub(crate) struct ElfHeader {
    pub ehdr: FileHeader<NativeEndian>,
}

impl ElfHeader {
    pub(crate) fn new(data: &[u8]) -> Result<ElfHeader> {
        let ident_buf = &data[..EI_NIDENT];
        let tail_buf = &data[EI_NIDENT..EHDR_SIZE];
        let ident = parse_ident::<NativeEndian>(&ident_buf).map_err(parse_ehdr_error_from)?;
        let ehdr = FileHeader::parse_tail(ident, &tail_buf).map_err(parse_ehdr_error_from)?;
        Ok(ElfHeader { ehdr })
    }

    pub(crate) fn validate(&self) -> Result<()> {
        if self.ehdr.e_type != ET_DYN && self.ehdr.e_type != ET_EXEC {
            return Err(parse_ehdr_error("file type mismatch"));
        }

        if self.ehdr.e_machine != EM_ARCH {
            return Err(parse_ehdr_error("file arch mismatch"));
        }

        let class = match self.ehdr.class {
            Class::ELF32 => elf::abi::ELFCLASS32,
            Class::ELF64 => elf::abi::ELFCLASS64,
        };
        if class != E_CLASS {
            return Err(parse_ehdr_error("file class mismatch"));
        }

        Ok(())
    }

    /// Position independent objects get a kernel chosen base; ET_EXEC images
    /// must be mapped at their linked addresses.
    #[inline]
    pub(crate) fn is_pic(&self) -> bool {
        self.ehdr.e_type == ET_DYN
    }

    #[inline]
    pub(crate) fn e_entry(&self) -> usize {
        self.ehdr.e_entry as usize
    }

    #[inline]
    pub(crate) fn e_phnum(&self) -> usize {
        self.ehdr.e_phnum as usize
    }

    #[inline]
    pub(crate) fn e_phentsize(&self) -> usize {
        self.ehdr.e_phentsize as usize
    }

    #[inline]
    pub(crate) fn e_phoff(&self) -> usize {
        self.ehdr.e_phoff as usize
    }

    #[inline]
    pub(crate) fn phdr_range(&self) -> (usize, usize) {
        let phdrs_size = self.e_phentsize() * self.e_phnum();
        let phdr_start = self.e_phoff();
        let phdr_end = phdr_start + phdrs_size;
        (phdr_start, phdr_end)
    }
}

#[cold]
fn parse_ehdr_error_from<E: core::fmt::Display>(err: E) -> crate::Error {
    use alloc::string::ToString;
    parse_ehdr_error(err.to_string())
}

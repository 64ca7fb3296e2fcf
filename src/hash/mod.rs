//! Hash tables used for symbol lookup
use crate::{
    arch::ElfSymbol,
    dynamic::{ElfDynamic, ElfHashKind},
    symbol::{SymbolInfo, SymbolTable},
};

mod gnu;
mod sysv;

pub(crate) use gnu::GnuHash;
pub(crate) use sysv::SysvHash;

pub(crate) trait ElfHashTable {
    fn hash(name: &[u8]) -> u64;
    fn count_syms(&self) -> usize;
    fn lookup<'sym>(
        table: &'sym SymbolTable,
        symbol: &SymbolInfo,
        precompute: &mut PreCompute,
    ) -> Option<&'sym ElfSymbol>;
}

/// Hash values computed once per lookup and shared across all searched
/// objects.
pub struct PreCompute {
    pub(crate) gnuhash: u32,
    pub(crate) fofs: usize,
    pub(crate) fmask: usize,
    pub(crate) sysv_hash: Option<u32>,
}

pub(crate) enum HashTable {
    /// .gnu.hash
    Gnu(GnuHash),
    /// .hash
    Sysv(SysvHash),
    /// No hash table: linear scan over the symbol table.
    Linear(LinearScan),
}

impl HashTable {
    pub(crate) fn from_dynamic(dynamic: &ElfDynamic) -> Self {
        match &dynamic.hashtab {
            Some(ElfHashKind::Gnu(addr)) => HashTable::Gnu(GnuHash::parse(*addr as *const u8)),
            Some(ElfHashKind::Sysv(addr)) => HashTable::Sysv(SysvHash::parse(*addr as *const u8)),
            None => HashTable::Linear(LinearScan::count(dynamic.symtab as *const ElfSymbol)),
        }
    }

    #[inline]
    pub(crate) fn count_syms(&self) -> usize {
        match self {
            HashTable::Gnu(hashtab) => hashtab.count_syms(),
            HashTable::Sysv(hashtab) => hashtab.count_syms(),
            HashTable::Linear(scan) => scan.nsyms,
        }
    }

    pub(crate) fn lookup<'sym>(
        &self,
        table: &'sym SymbolTable,
        symbol: &SymbolInfo,
        precompute: &mut PreCompute,
    ) -> Option<&'sym ElfSymbol> {
        match self {
            HashTable::Gnu(_) => GnuHash::lookup(table, symbol, precompute),
            HashTable::Sysv(_) => SysvHash::lookup(table, symbol, precompute),
            HashTable::Linear(scan) => scan.lookup(table, symbol),
        }
    }

    pub(crate) fn as_gnu(&self) -> Option<&GnuHash> {
        match self {
            HashTable::Gnu(hashtab) => Some(hashtab),
            _ => None,
        }
    }

    pub(crate) fn as_sysv(&self) -> Option<&SysvHash> {
        match self {
            HashTable::Sysv(hashtab) => Some(hashtab),
            _ => None,
        }
    }
}

/// Fallback for objects carrying neither `DT_GNU_HASH` nor `DT_HASH`.
pub(crate) struct LinearScan {
    nsyms: usize,
}

impl LinearScan {
    /// Symbol count cannot come from a hash header here; the scan stops at
    /// the first all-zero entry past the reserved null symbol.
    fn count(symtab: *const ElfSymbol) -> Self {
        let mut nsyms = 1;
        loop {
            let sym = unsafe { &*symtab.add(nsyms) };
            if sym.st_name() == 0 && sym.st_value() == 0 && sym.st_shndx() == 0 {
                break;
            }
            nsyms += 1;
        }
        LinearScan { nsyms }
    }

    fn lookup<'sym>(
        &self,
        table: &'sym SymbolTable,
        symbol: &SymbolInfo,
    ) -> Option<&'sym ElfSymbol> {
        for idx in 1..self.nsyms {
            let sym = unsafe { &*table.symtab.add(idx) };
            let name = table.strtab.get_str(sym.st_name());
            if name == symbol.name() && table.check_match(idx, symbol.version()) {
                return Some(sym);
            }
        }
        None
    }
}

impl SymbolInfo<'_> {
    #[inline]
    pub(crate) fn precompute(&self) -> PreCompute {
        let gnuhash = GnuHash::hash(self.name().as_bytes()) as u32;
        PreCompute {
            gnuhash,
            fofs: gnuhash as usize / usize::BITS as usize,
            fmask: 1 << (gnuhash % (8 * size_of::<usize>() as u32)),
            sysv_hash: None,
        }
    }
}

//! ELF symbol and string tables
use crate::{
    arch::ElfSymbol,
    dynamic::ElfDynamic,
    hash::HashTable,
    version::{ElfVersion, SymbolVersion},
};
use core::ffi::CStr;

pub use crate::hash::PreCompute;

/// The dynamic string table of one object.
pub(crate) struct StringTable {
    data: *const u8,
}

impl StringTable {
    pub(crate) const fn new(data: *const u8) -> Self {
        StringTable { data }
    }

    /// Read the NUL-terminated string at `offset`.
    ///
    /// Offset zero names the empty string, which is a valid symbol name.
    #[inline]
    pub(crate) fn get_cstr(&self, offset: usize) -> &'static CStr {
        unsafe {
            let start = self.data.add(offset).cast();
            CStr::from_ptr(start)
        }
    }

    #[inline]
    pub(crate) fn get_str(&self, offset: usize) -> &'static str {
        Self::convert_cstr(self.get_cstr(offset))
    }

    #[inline]
    fn convert_cstr(s: &CStr) -> &str {
        unsafe { core::str::from_utf8_unchecked(s.to_bytes()) }
    }
}

/// The symbol table of one object: hash table, symbols, strings, and the
/// optional versioning tables.
pub struct SymbolTable {
    pub(crate) hashtab: HashTable,
    pub(crate) symtab: *const ElfSymbol,
    pub(crate) strtab: StringTable,
    pub(crate) version: Option<ElfVersion>,
}

/// What a lookup is searching for: a name, optionally pinned to a version.
pub struct SymbolInfo<'sym> {
    name: &'sym str,
    version: Option<SymbolVersion<'sym>>,
}

impl<'sym> SymbolInfo<'sym> {
    pub(crate) fn from_str(name: &'sym str, version: Option<&'sym str>) -> Self {
        SymbolInfo {
            name,
            version: version.map(SymbolVersion::new),
        }
    }

    #[inline]
    pub fn name(&self) -> &str {
        self.name
    }

    #[inline]
    pub(crate) fn version(&self) -> Option<&SymbolVersion<'sym>> {
        self.version.as_ref()
    }
}

impl SymbolTable {
    /// Build the symbol table of an object; `None` when its dynamic section
    /// names no symbol or string table.
    pub(crate) fn try_from_dynamic(dynamic: &ElfDynamic) -> Option<Self> {
        if dynamic.symtab == 0 || dynamic.strtab == 0 {
            return None;
        }
        let hashtab = HashTable::from_dynamic(dynamic);
        let symtab = dynamic.symtab as *const ElfSymbol;
        let strtab = StringTable::new(dynamic.strtab as *const u8);
        let version = ElfVersion::new(dynamic.versym, dynamic.verneed, dynamic.verdef);
        Some(SymbolTable {
            hashtab,
            symtab,
            strtab,
            version,
        })
    }

    pub(crate) fn strtab(&self) -> &StringTable {
        &self.strtab
    }

    /// Version check used while walking hash chains: does the definition at
    /// `sym_idx` satisfy the requested version?
    #[inline]
    pub(crate) fn check_match(
        &self,
        sym_idx: usize,
        requested: Option<&SymbolVersion<'_>>,
    ) -> bool {
        match &self.version {
            Some(version) => version.matches(sym_idx, requested, &self.strtab),
            None => true,
        }
    }

    /// Look up a symbol by name (and version).
    pub fn lookup(&self, symbol: &SymbolInfo, precompute: &mut PreCompute) -> Option<&ElfSymbol> {
        self.hashtab.lookup(self, symbol, precompute)
    }

    /// Look up a symbol that can satisfy a reference from another object:
    /// defined here, globally visible, of a linkable type.
    #[inline]
    pub fn lookup_filter(
        &self,
        symbol: &SymbolInfo,
        precompute: &mut PreCompute,
    ) -> Option<&ElfSymbol> {
        if let Some(sym) = self.lookup(symbol, precompute) {
            if !sym.is_undef() && sym.is_ok_bind() && sym.is_ok_type() {
                return Some(sym);
            }
        }
        None
    }

    /// The symbol at `idx` together with the lookup key it references
    /// (name plus the version requirement this object records for it).
    pub fn symbol_idx<'symtab>(&'symtab self, idx: usize) -> (&'symtab ElfSymbol, SymbolInfo<'symtab>) {
        let symbol = unsafe { &*self.symtab.add(idx) };
        let name = self.strtab.get_str(symbol.st_name());
        let version = self
            .version
            .as_ref()
            .and_then(|version| version.requirement(idx, &self.strtab));
        (symbol, SymbolInfo { name, version })
    }

    /// Number of entries in the symbol table.
    #[inline]
    pub fn count_syms(&self) -> usize {
        self.hashtab.count_syms()
    }
}

//! Parsing the `PT_DYNAMIC` segment
use crate::{
    Result,
    arch::{Dyn, ElfRela},
    segment::ElfSegments,
};
use alloc::vec::Vec;
use core::{num::NonZeroUsize, ptr::NonNull};
use elf::abi::*;

/// Which hash table the object carries for symbol lookup.
pub(crate) enum ElfHashKind {
    /// .gnu.hash
    Gnu(usize),
    /// .hash
    Sysv(usize),
}

/// Information extracted from an object's dynamic section.
///
/// All address-valued entries are already bias-adjusted. `DT_NEEDED` and
/// `DT_RUNPATH` stay as string table offsets; the caller resolves them once
/// the string table itself is known (they need the `DT_STRTAB` entry of the
/// same walk).
pub(crate) struct ElfDynamic {
    /// Hash table address, if any.
    pub hashtab: Option<ElfHashKind>,
    /// Symbol table address.
    pub symtab: usize,
    /// String table address.
    pub strtab: usize,
    /// Whether every PLT slot must be resolved at load time.
    pub bind_now: bool,
    /// PLT global offset table address.
    pub got: Option<NonNull<usize>>,
    /// Initialization function.
    pub init_fn: Option<extern "C" fn()>,
    /// Initialization function array.
    pub init_array_fn: Option<&'static [extern "C" fn()]>,
    /// Finalization function.
    pub fini_fn: Option<extern "C" fn()>,
    /// Finalization function array.
    pub fini_array_fn: Option<&'static [extern "C" fn()]>,
    /// PLT relocation entries.
    pub pltrel: Option<&'static [ElfRela]>,
    /// General relocation entries.
    pub dynrel: Option<&'static [ElfRela]>,
    /// Count of leading relative relocations in the general table.
    pub rela_count: Option<NonZeroUsize>,
    /// String table offsets of the required libraries.
    pub needed_libs: Vec<NonZeroUsize>,
    /// Symbol version index table address.
    pub versym: Option<NonZeroUsize>,
    /// Version requirement table address and entry count.
    pub verneed: Option<(NonZeroUsize, NonZeroUsize)>,
    /// Version definition table address and entry count.
    pub verdef: Option<(NonZeroUsize, NonZeroUsize)>,
    /// String table offset of the library search path of this object.
    pub runpath_off: Option<NonZeroUsize>,
}

impl ElfDynamic {
    /// Walk the dynamic array until `DT_NULL`, collecting everything the
    /// linker consumes.
    pub(crate) fn parse(dynamic_ptr: *const Dyn, segments: &ElfSegments) -> Result<Self> {
        let mut symtab_off = 0;
        let mut strtab_off = 0;
        let mut sysv_hash_off = None;
        let mut gnu_hash_off = None;
        let mut got_off = None;
        let mut pltrel_size = None;
        let mut pltrel_off = None;
        let mut rela_off = None;
        let mut rela_size = None;
        let mut rela_count = None;
        let mut init_off = None;
        let mut fini_off = None;
        let mut init_array_off = None;
        let mut init_array_size = None;
        let mut fini_array_off = None;
        let mut fini_array_size = None;
        let mut versym_off = None;
        let mut verneed_off = None;
        let mut verneed_num = None;
        let mut verdef_off = None;
        let mut verdef_num = None;
        let mut runpath_off = None;
        let mut bind_now = false;
        let mut flags = 0;
        let mut flags_1 = 0;
        let mut needed_libs = Vec::new();

        let mut cur_dyn_ptr = dynamic_ptr;
        let mut dynamic = unsafe { &*cur_dyn_ptr };
        let base = segments.base();

        unsafe {
            loop {
                match dynamic.d_tag {
                    DT_FLAGS => flags = dynamic.d_un as usize,
                    DT_FLAGS_1 => flags_1 = dynamic.d_un as usize,
                    DT_BIND_NOW => bind_now = true,
                    DT_PLTGOT => got_off = NonZeroUsize::new(dynamic.d_un as usize),
                    DT_NEEDED => {
                        if let Some(val) = NonZeroUsize::new(dynamic.d_un as usize) {
                            needed_libs.push(val);
                        }
                    }
                    DT_HASH => sysv_hash_off = Some(dynamic.d_un as usize),
                    DT_GNU_HASH => gnu_hash_off = Some(dynamic.d_un as usize),
                    DT_SYMTAB => symtab_off = dynamic.d_un as usize,
                    DT_STRTAB => strtab_off = dynamic.d_un as usize,
                    DT_PLTRELSZ => pltrel_size = NonZeroUsize::new(dynamic.d_un as usize),
                    DT_JMPREL => pltrel_off = NonZeroUsize::new(dynamic.d_un as usize),
                    DT_RELA => rela_off = NonZeroUsize::new(dynamic.d_un as usize),
                    DT_RELASZ => rela_size = NonZeroUsize::new(dynamic.d_un as usize),
                    DT_RELACOUNT => rela_count = NonZeroUsize::new(dynamic.d_un as usize),
                    DT_INIT => init_off = NonZeroUsize::new(dynamic.d_un as usize),
                    DT_FINI => fini_off = NonZeroUsize::new(dynamic.d_un as usize),
                    DT_INIT_ARRAY => init_array_off = NonZeroUsize::new(dynamic.d_un as usize),
                    DT_INIT_ARRAYSZ => {
                        init_array_size = NonZeroUsize::new(dynamic.d_un as usize)
                    }
                    DT_FINI_ARRAY => fini_array_off = NonZeroUsize::new(dynamic.d_un as usize),
                    DT_FINI_ARRAYSZ => {
                        fini_array_size = NonZeroUsize::new(dynamic.d_un as usize)
                    }
                    DT_VERSYM => versym_off = NonZeroUsize::new(dynamic.d_un as usize),
                    DT_VERNEED => verneed_off = NonZeroUsize::new(dynamic.d_un as usize),
                    DT_VERNEEDNUM => verneed_num = NonZeroUsize::new(dynamic.d_un as usize),
                    DT_VERDEF => verdef_off = NonZeroUsize::new(dynamic.d_un as usize),
                    DT_VERDEFNUM => verdef_num = NonZeroUsize::new(dynamic.d_un as usize),
                    DT_RUNPATH => runpath_off = NonZeroUsize::new(dynamic.d_un as usize),
                    DT_NULL => break,
                    _ => {}
                }
                cur_dyn_ptr = cur_dyn_ptr.add(1);
                dynamic = &*cur_dyn_ptr;
            }
        }

        // A dynamic section carrying only DT_NULL is legal (a static PIE);
        // such objects simply have no symbol table to offer.
        let has_symbols = symtab_off != 0 && strtab_off != 0;

        // Prefer the GNU table when the object carries both.
        let hashtab = if let Some(off) = gnu_hash_off {
            Some(ElfHashKind::Gnu(off + base))
        } else {
            sysv_hash_off.map(|off| ElfHashKind::Sysv(off + base))
        };

        let pltrel = pltrel_off.map(|pltrel_off| {
            segments.get_slice(
                pltrel_off.get(),
                pltrel_size.map(|s| s.get()).unwrap_or(0),
            )
        });
        let dynrel = rela_off.map(|rela_off| {
            segments.get_slice(rela_off.get(), rela_size.map(|s| s.get()).unwrap_or(0))
        });

        let init_fn = init_off
            .map(|off| unsafe { core::mem::transmute(segments.get_ptr::<fn()>(off.get())) });
        let init_array_fn = init_array_off.map(|off| {
            segments.get_slice(off.get(), init_array_size.map(|s| s.get()).unwrap_or(0))
        });
        let fini_fn = fini_off
            .map(|off| unsafe { core::mem::transmute(segments.get_ptr::<fn()>(off.get())) });
        let fini_array_fn = fini_array_off.map(|off| {
            segments.get_slice(off.get(), fini_array_size.map(|s| s.get()).unwrap_or(0))
        });

        let verneed = verneed_off
            .zip(verneed_num)
            .map(|(off, num)| (off.checked_add(base).unwrap(), num));
        let verdef = verdef_off
            .zip(verdef_num)
            .map(|(off, num)| (off.checked_add(base).unwrap(), num));
        let versym = versym_off.map(|off| off.checked_add(base).unwrap());

        Ok(ElfDynamic {
            hashtab,
            symtab: if has_symbols { symtab_off + base } else { 0 },
            strtab: if has_symbols { strtab_off + base } else { 0 },
            bind_now: bind_now
                || flags & DF_BIND_NOW as usize != 0
                || flags_1 & DF_1_NOW as usize != 0,
            got: got_off.and_then(|off| NonNull::new((base + off.get()) as *mut usize)),
            init_fn,
            init_array_fn,
            fini_fn,
            fini_array_fn,
            pltrel,
            dynrel,
            rela_count,
            needed_libs,
            versym,
            verneed,
            verdef,
            runpath_off,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::segment::ElfSegments;
    use alloc::vec;

    fn dyn_entry(tag: i64, val: u64) -> Dyn {
        Dyn {
            d_tag: tag,
            d_un: val,
        }
    }

    #[test]
    fn walk_stops_at_null_and_extracts_tables() {
        // A fake image: one page worth of backing data.
        let backing = vec![0u8; 0x1000];
        let base = backing.as_ptr() as usize;
        let segments = ElfSegments::borrowed(base, 0, backing.len());
        let entries = [
            dyn_entry(DT_STRTAB, 0x100),
            dyn_entry(DT_SYMTAB, 0x200),
            dyn_entry(DT_HASH, 0x300),
            dyn_entry(DT_NEEDED, 0x17),
            dyn_entry(DT_RELA, 0x400),
            dyn_entry(DT_RELASZ, 0x60),
            dyn_entry(DT_RELACOUNT, 2),
            dyn_entry(DT_RUNPATH, 0x42),
            dyn_entry(DT_NULL, 0),
            // Entries after the terminator must be ignored.
            dyn_entry(DT_NEEDED, 0x99),
        ];
        let dynamic = ElfDynamic::parse(entries.as_ptr(), &segments).unwrap();
        assert_eq!(dynamic.strtab, base + 0x100);
        assert_eq!(dynamic.symtab, base + 0x200);
        assert!(matches!(dynamic.hashtab, Some(ElfHashKind::Sysv(addr)) if addr == base + 0x300));
        assert_eq!(dynamic.needed_libs.len(), 1);
        assert_eq!(dynamic.needed_libs[0].get(), 0x17);
        assert_eq!(dynamic.rela_count.unwrap().get(), 2);
        assert_eq!(dynamic.dynrel.unwrap().len(), 0x60 / size_of::<ElfRela>());
        assert_eq!(dynamic.runpath_off.unwrap().get(), 0x42);
        assert!(!dynamic.bind_now);
    }

    #[test]
    fn bind_now_flags_are_recognized() {
        let backing = vec![0u8; 0x1000];
        let base = backing.as_ptr() as usize;
        let segments = ElfSegments::borrowed(base, 0, backing.len());
        for entries in [
            [
                dyn_entry(DT_STRTAB, 0x100),
                dyn_entry(DT_SYMTAB, 0x200),
                dyn_entry(DT_BIND_NOW, 1),
                dyn_entry(DT_NULL, 0),
            ],
            [
                dyn_entry(DT_STRTAB, 0x100),
                dyn_entry(DT_SYMTAB, 0x200),
                dyn_entry(DT_FLAGS, DF_BIND_NOW as u64),
                dyn_entry(DT_NULL, 0),
            ],
            [
                dyn_entry(DT_STRTAB, 0x100),
                dyn_entry(DT_SYMTAB, 0x200),
                dyn_entry(DT_FLAGS_1, DF_1_NOW as u64),
                dyn_entry(DT_NULL, 0),
            ],
        ] {
            let dynamic = ElfDynamic::parse(entries.as_ptr(), &segments).unwrap();
            assert!(dynamic.bind_now);
        }
    }

    #[test]
    fn null_only_dynamic_is_a_valid_empty_section() {
        let backing = vec![0u8; 0x1000];
        let segments = ElfSegments::borrowed(backing.as_ptr() as usize, 0, backing.len());
        let entries = [dyn_entry(DT_NULL, 0)];
        let dynamic = ElfDynamic::parse(entries.as_ptr(), &segments).unwrap();
        assert_eq!(dynamic.symtab, 0);
        assert!(dynamic.needed_libs.is_empty());
        assert!(dynamic.dynrel.is_none());
        assert!(dynamic.pltrel.is_none());
    }
}

//! Symbol versioning tables
//!
//! The linker performs the simple name+version check: a reference carrying a
//! version index only binds to definitions whose version name matches, with
//! unversioned and base-versioned entries matching anything. Unknown version
//! names match permissively, which is what keeps objects with partially
//! stripped version data loadable.

use crate::symbol::StringTable;
use core::num::NonZeroUsize;
use elf::abi::{VER_NDX_GLOBAL, VER_NDX_LOCAL};

/// Bit flagging a hidden version index; the index proper is the low 15 bits.
const VERSYM_IDX_MASK: u16 = 0x7fff;

#[repr(C)]
struct Verneed {
    vn_version: u16,
    vn_cnt: u16,
    vn_file: u32,
    vn_aux: u32,
    vn_next: u32,
}

#[repr(C)]
struct Vernaux {
    vna_hash: u32,
    vna_flags: u16,
    vna_other: u16,
    vna_name: u32,
    vna_next: u32,
}

#[repr(C)]
struct Verdef {
    vd_version: u16,
    vd_flags: u16,
    vd_ndx: u16,
    vd_cnt: u16,
    vd_hash: u32,
    vd_aux: u32,
    vd_next: u32,
}

#[repr(C)]
struct Verdaux {
    vda_name: u32,
    vda_next: u32,
}

/// A version attached to a symbol reference.
pub struct SymbolVersion<'a> {
    pub(crate) name: &'a str,
}

impl<'a> SymbolVersion<'a> {
    pub(crate) fn new(name: &'a str) -> Self {
        SymbolVersion { name }
    }
}

/// The versioning tables of one object.
pub(crate) struct ElfVersion {
    /// One version index per symbol table entry (.gnu.version).
    versym: *const u16,
    /// Version requirements (.gnu.version_r) and their entry count.
    verneed: Option<(usize, usize)>,
    /// Version definitions (.gnu.version_d) and their entry count.
    verdef: Option<(usize, usize)>,
}

impl ElfVersion {
    pub(crate) fn new(
        versym: Option<NonZeroUsize>,
        verneed: Option<(NonZeroUsize, NonZeroUsize)>,
        verdef: Option<(NonZeroUsize, NonZeroUsize)>,
    ) -> Option<Self> {
        versym.map(|versym| ElfVersion {
            versym: versym.get() as *const u16,
            verneed: verneed.map(|(addr, num)| (addr.get(), num.get())),
            verdef: verdef.map(|(addr, num)| (addr.get(), num.get())),
        })
    }

    #[inline]
    fn index(&self, sym_idx: usize) -> u16 {
        unsafe { self.versym.add(sym_idx).read() & VERSYM_IDX_MASK }
    }

    /// The version this object requires for its reference `sym_idx`, found
    /// by walking the requirement auxiliaries for the matching index.
    pub(crate) fn requirement(
        &self,
        sym_idx: usize,
        strtab: &StringTable,
    ) -> Option<SymbolVersion<'static>> {
        let idx = self.index(sym_idx);
        if idx <= VER_NDX_GLOBAL {
            return None;
        }
        let (mut verneed, num) = self.verneed?;
        for _ in 0..num {
            let entry = unsafe { &*(verneed as *const Verneed) };
            let mut aux = verneed + entry.vn_aux as usize;
            for _ in 0..entry.vn_cnt {
                let vernaux = unsafe { &*(aux as *const Vernaux) };
                if vernaux.vna_other & VERSYM_IDX_MASK == idx {
                    return Some(SymbolVersion::new(strtab.get_str(vernaux.vna_name as usize)));
                }
                if vernaux.vna_next == 0 {
                    break;
                }
                aux += vernaux.vna_next as usize;
            }
            if entry.vn_next == 0 {
                break;
            }
            verneed += entry.vn_next as usize;
        }
        // The index names a version this object has no requirement record
        // for; treat the reference as unversioned.
        None
    }

    /// The name this object defines for version index `idx`.
    fn definition_name(&self, idx: u16, strtab: &StringTable) -> Option<&'static str> {
        let (mut verdef, num) = self.verdef?;
        for _ in 0..num {
            let entry = unsafe { &*(verdef as *const Verdef) };
            if entry.vd_ndx & VERSYM_IDX_MASK == idx && entry.vd_cnt > 0 {
                let aux = unsafe { &*((verdef + entry.vd_aux as usize) as *const Verdaux) };
                return Some(strtab.get_str(aux.vda_name as usize));
            }
            if entry.vd_next == 0 {
                break;
            }
            verdef += entry.vd_next as usize;
        }
        None
    }

    /// Can the definition at `sym_idx` satisfy a reference asking for
    /// `requested`?
    pub(crate) fn matches(
        &self,
        sym_idx: usize,
        requested: Option<&SymbolVersion<'_>>,
        strtab: &StringTable,
    ) -> bool {
        let provided = self.index(sym_idx);
        // A local version never satisfies an external reference.
        if provided == VER_NDX_LOCAL {
            return false;
        }
        let Some(requested) = requested else {
            return true;
        };
        if provided <= VER_NDX_GLOBAL {
            return true;
        }
        match self.definition_name(provided, strtab) {
            Some(name) => name == requested.name,
            // Unknown version names match permissively.
            None => true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::vec;
    use alloc::vec::Vec;

    // Builds one buffer holding: strtab | versym | verneed(+aux) | verdef(+aux)
    struct VersionFixture {
        #[allow(dead_code)]
        backing: Vec<u8>,
        version: ElfVersion,
        strtab: StringTable,
    }

    fn push<T>(buf: &mut Vec<u8>, value: T) {
        let bytes = unsafe {
            core::slice::from_raw_parts(&value as *const T as *const u8, size_of::<T>())
        };
        buf.extend_from_slice(bytes);
    }

    fn fixture() -> VersionFixture {
        // strtab: \0 VERS_1 \0 VERS_2 \0
        let mut strtab = vec![0u8];
        let v1_off = strtab.len();
        strtab.extend_from_slice(b"VERS_1\0");
        let v2_off = strtab.len();
        strtab.extend_from_slice(b"VERS_2\0");

        // versym: [0]=local, [1]=global, [2]=index 2, [3]=index 3 | hidden
        let versym: Vec<u16> = vec![0, 1, 2, 3 | 0x8000];

        // verneed: one file entry with two auxiliaries (indices 2 and 3).
        let mut verneed = Vec::new();
        push(
            &mut verneed,
            Verneed {
                vn_version: 1,
                vn_cnt: 2,
                vn_file: 0,
                vn_aux: size_of::<Verneed>() as u32,
                vn_next: 0,
            },
        );
        push(
            &mut verneed,
            Vernaux {
                vna_hash: 0,
                vna_flags: 0,
                vna_other: 2,
                vna_name: v1_off as u32,
                vna_next: size_of::<Vernaux>() as u32,
            },
        );
        push(
            &mut verneed,
            Vernaux {
                vna_hash: 0,
                vna_flags: 0,
                vna_other: 3,
                vna_name: v2_off as u32,
                vna_next: 0,
            },
        );

        // verdef: index 2 defines VERS_1, index 3 defines VERS_2.
        let mut verdef = Vec::new();
        for (ndx, off) in [(2u16, v1_off), (3u16, v2_off)] {
            push(
                &mut verdef,
                Verdef {
                    vd_version: 1,
                    vd_flags: 0,
                    vd_ndx: ndx,
                    vd_cnt: 1,
                    vd_hash: 0,
                    vd_aux: size_of::<Verdef>() as u32,
                    vd_next: if ndx == 2 {
                        (size_of::<Verdef>() + size_of::<Verdaux>()) as u32
                    } else {
                        0
                    },
                },
            );
            push(
                &mut verdef,
                Verdaux {
                    vda_name: off as u32,
                    vda_next: 0,
                },
            );
        }

        let mut backing = strtab;
        while backing.len() % 8 != 0 {
            backing.push(0);
        }
        let versym_off = backing.len();
        for v in &versym {
            backing.extend_from_slice(&v.to_ne_bytes());
        }
        while backing.len() % 8 != 0 {
            backing.push(0);
        }
        let verneed_off = backing.len();
        backing.extend_from_slice(&verneed);
        let verdef_off = backing.len();
        backing.extend_from_slice(&verdef);

        let base = backing.as_ptr() as usize;
        let version = ElfVersion::new(
            NonZeroUsize::new(base + versym_off),
            Some((
                NonZeroUsize::new(base + verneed_off).unwrap(),
                NonZeroUsize::new(1).unwrap(),
            )),
            Some((
                NonZeroUsize::new(base + verdef_off).unwrap(),
                NonZeroUsize::new(2).unwrap(),
            )),
        )
        .unwrap();
        let strtab = StringTable::new(base as *const u8);
        VersionFixture {
            backing,
            version,
            strtab,
        }
    }

    #[test]
    fn requirement_resolves_aux_names() {
        let f = fixture();
        assert!(f.version.requirement(0, &f.strtab).is_none());
        assert!(f.version.requirement(1, &f.strtab).is_none());
        assert_eq!(f.version.requirement(2, &f.strtab).unwrap().name, "VERS_1");
        // The hidden bit is ignored.
        assert_eq!(f.version.requirement(3, &f.strtab).unwrap().name, "VERS_2");
    }

    #[test]
    fn local_definitions_never_match() {
        let f = fixture();
        assert!(!f.version.matches(0, None, &f.strtab));
    }

    #[test]
    fn base_indices_match_any_request() {
        let f = fixture();
        let want = SymbolVersion::new("VERS_1");
        assert!(f.version.matches(1, Some(&want), &f.strtab));
        assert!(f.version.matches(1, None, &f.strtab));
    }

    #[test]
    fn names_decide_versioned_matches() {
        let f = fixture();
        let want_v1 = SymbolVersion::new("VERS_1");
        let want_v2 = SymbolVersion::new("VERS_2");
        assert!(f.version.matches(2, Some(&want_v1), &f.strtab));
        assert!(!f.version.matches(2, Some(&want_v2), &f.strtab));
        assert!(f.version.matches(3, Some(&want_v2), &f.strtab));
        // Unversioned references accept any definition.
        assert!(f.version.matches(2, None, &f.strtab));
    }
}

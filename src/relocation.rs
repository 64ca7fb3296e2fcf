//! Applying the relocation tables of a loaded object
//!
//! Relocation runs after every dependency of the object has been
//! registered, so the global search order is complete by the time any
//! record needs a symbol. Unresolved non-weak references are diagnosed and
//! filled with zero rather than aborting the process; the reference will
//! fault at use, which matches what other dynamic loaders do and keeps
//! `dlsym`-style late binding possible.

use crate::{
    Result,
    arch::{
        ElfRela, REL_COPY, REL_DTPMOD, REL_DTPOFF, REL_GOT, REL_IRELATIVE, REL_JUMP_SLOT,
        REL_NONE, REL_RELATIVE, REL_SYMBOLIC, REL_TPOFF, prepare_lazy_bind,
    },
    linker::{Linker, LoadedObject},
    mmap::Mmap,
};
#[cfg(feature = "log")]
use crate::arch::rel_type_to_str;
use core::num::NonZeroUsize;
use core::sync::atomic::{AtomicUsize, Ordering};

/// TLS module id handed out for DTPMOD records. Static TLS supports one
/// module, so the id is constant.
const STATIC_TLS_MODULE_ID: usize = 1;

/// The relocation tables of one object, with the relative prefix split off
/// so the no-lookup fast path does not inspect record types.
pub(crate) struct ElfRelocation {
    /// Leading run of RELATIVE records of the general table.
    relative: &'static [ElfRela],
    /// The rest of the general table.
    dynrel: &'static [ElfRela],
    /// The PLT table.
    pub(crate) pltrel: &'static [ElfRela],
}

impl ElfRelocation {
    pub(crate) fn new(
        dynrel: Option<&'static [ElfRela]>,
        pltrel: Option<&'static [ElfRela]>,
        rela_count: Option<NonZeroUsize>,
    ) -> Self {
        // DT_RELACOUNT names the length of the relative prefix.
        let nrelative = rela_count.map(|count| count.get()).unwrap_or(0);
        let old_dynrel = dynrel.unwrap_or(&[]);
        let relative = &old_dynrel[..nrelative.min(old_dynrel.len())];
        let temp_dynrel = &old_dynrel[relative.len()..];
        let pltrel = pltrel.unwrap_or(&[]);
        // Some link editors emit the PLT table as the tail of the general
        // table; processing it twice would double-bind every slot.
        let dynrel = if unsafe {
            core::ptr::eq(
                old_dynrel.as_ptr().add(old_dynrel.len()),
                pltrel.as_ptr().add(pltrel.len()),
            )
        } {
            &temp_dynrel[..temp_dynrel.len() - pltrel.len()]
        } else {
            temp_dynrel
        };
        Self {
            relative,
            dynrel,
            pltrel,
        }
    }

    pub(crate) const fn empty() -> Self {
        Self {
            relative: &[],
            dynrel: &[],
            pltrel: &[],
        }
    }
}

/// Store a relocated value.
///
/// Targets always lie inside the object's own PT_LOAD mappings: `r_offset`
/// is an object-relative virtual address and the tables were produced for
/// this image by the link editor.
#[inline]
fn write_val(base: usize, offset: usize, val: usize) {
    unsafe {
        let ptr = (base + offset) as *mut usize;
        ptr.write(val);
    }
}

/// Global symbol scope used by [`dl_fixup`]. Lazy binding runs on a bare
/// trampoline with no linker reference at hand, so the lookup entry point is
/// published once the process link map is complete.
static GLOBAL_SCOPE: AtomicUsize = AtomicUsize::new(0);

/// Publish the lookup function lazy binding resolves through.
pub fn set_global_scope(find: fn(&str) -> Option<*const ()>) {
    GLOBAL_SCOPE.store(find as usize, Ordering::Release);
}

/// Lazy binding fixup called from the PLT resolver trampoline.
///
/// Looks up the JMPREL record at `rela_idx`, resolves its symbol through
/// the published global scope, patches the GOT slot, and returns the
/// address for the trampoline to tail-call.
#[unsafe(no_mangle)]
pub(crate) unsafe extern "C" fn dl_fixup(object: &LoadedObject, rela_idx: usize) -> usize {
    let rela = &object.relocation.pltrel[rela_idx];
    let r_type = rela.r_type();
    let r_sym = rela.r_symbol();
    assert!(r_type == REL_JUMP_SLOT as usize && r_sym != 0);

    let (_, syminfo) = object
        .symbols
        .as_ref()
        .expect("lazily bound object has a symbol table")
        .symbol_idx(r_sym);
    let scope = GLOBAL_SCOPE.load(Ordering::Acquire);
    assert!(scope != 0, "no global scope registered for lazy binding");
    let find: fn(&str) -> Option<*const ()> = unsafe { core::mem::transmute(scope) };
    let symbol = find(syminfo.name()).expect("lazy binding failed") as usize;

    write_val(object.base(), rela.r_offset(), symbol);
    symbol
}

impl<M: Mmap> Linker<M> {
    /// Apply every relocation table of object `idx`, then freeze its RELRO
    /// region. After this returns no record of the object remains
    /// unprocessed (JUMP_SLOT records of a lazily bound object have had
    /// their lazy setup applied instead).
    pub(crate) fn relocate_object(&mut self, idx: usize) -> Result<()> {
        self.relocate_relative(idx);
        self.relocate_dynrel(idx);
        self.relocate_pltrel(idx);
        let obj = &self.objects[idx];
        if let Some(relro) = &obj.relro {
            relro.apply()?;
        }
        Ok(())
    }

    /// `*target = base + addend`, no symbol involved.
    fn relocate_relative(&self, idx: usize) {
        let obj = &self.objects[idx];
        let base = obj.base();
        for rela in obj.relocation.relative {
            debug_assert!(rela.r_type() == REL_RELATIVE as usize);
            write_val(base, rela.r_offset(), base.wrapping_add_signed(rela.r_addend()));
        }
    }

    fn relocate_dynrel(&self, idx: usize) {
        /*
            Relocation value components:
            A = the addend of the record
            B = the base at which the object was loaded
            S = the value of the symbol named by the record
        */
        let obj = &self.objects[idx];
        let base = obj.base();
        for rela in obj.relocation.dynrel {
            let r_type = rela.r_type() as u32;
            let r_sym = rela.r_symbol();
            let r_addend = rela.r_addend();
            match r_type {
                REL_NONE => {}
                // RELATIVE records can also appear past the counted prefix.
                REL_RELATIVE => {
                    write_val(base, rela.r_offset(), base.wrapping_add_signed(r_addend))
                }
                REL_SYMBOLIC => {
                    let val = self.resolve_or_zero(idx, r_sym);
                    write_val(base, rela.r_offset(), val.wrapping_add_signed(r_addend));
                }
                // JUMP_SLOT shows up here when the link editor folded the
                // PLT table into the general one; binding is eager then.
                REL_GOT | REL_JUMP_SLOT => {
                    let val = self.resolve_or_zero(idx, r_sym);
                    write_val(base, rela.r_offset(), val);
                }
                REL_COPY => self.relocate_copy(idx, rela),
                REL_TPOFF => {
                    // The resolved value is the (negative) distance of the
                    // symbol from the thread pointer.
                    let val = match self.resolve_symbol(idx, r_sym) {
                        Some(def) => match def.sym {
                            Some(sym) => match self.objects[def.idx].tls_offset {
                                Some(offset) => (offset + sym.st_value() as isize) as usize,
                                None => {
                                    self.diagnose_unresolved(idx, rela);
                                    0
                                }
                            },
                            // A weak miss stays silent.
                            None => 0,
                        },
                        None => {
                            self.diagnose_unresolved(idx, rela);
                            0
                        }
                    };
                    write_val(base, rela.r_offset(), val.wrapping_add_signed(r_addend));
                }
                REL_DTPMOD => {
                    write_val(base, rela.r_offset(), STATIC_TLS_MODULE_ID);
                }
                REL_DTPOFF => {
                    let val = match self.resolve_symbol(idx, r_sym) {
                        Some(def) => def.sym.map(|sym| sym.st_value()).unwrap_or(0),
                        None => {
                            self.diagnose_unresolved(idx, rela);
                            0
                        }
                    };
                    write_val(base, rela.r_offset(), val.wrapping_add_signed(r_addend));
                }
                REL_IRELATIVE => {
                    let ifunc: extern "C" fn() -> usize =
                        unsafe { core::mem::transmute(base.wrapping_add_signed(r_addend)) };
                    write_val(base, rela.r_offset(), ifunc());
                }
                _ => {
                    #[cfg(feature = "log")]
                    log::warn!(
                        "skipping unknown relocation {} in [{}]",
                        rel_type_to_str(rela.r_type()),
                        obj.name()
                    );
                }
            }
        }
    }

    fn relocate_pltrel(&self, idx: usize) {
        let obj = &self.objects[idx];
        let base = obj.base();
        let lazy = !obj.bind_now && obj.got.is_some();
        if lazy {
            for rela in obj.relocation.pltrel {
                let r_type = rela.r_type() as u32;
                if r_type == REL_JUMP_SLOT {
                    // The slot holds the link-time address of the PLT stub;
                    // biasing it keeps the stub reachable until first call.
                    unsafe {
                        let ptr = (base + rela.r_offset()) as *mut usize;
                        ptr.write(ptr.read() + base);
                    }
                } else if r_type == REL_IRELATIVE {
                    let ifunc: extern "C" fn() -> usize =
                        unsafe { core::mem::transmute(base.wrapping_add_signed(rela.r_addend())) };
                    write_val(base, rela.r_offset(), ifunc());
                } else {
                    #[cfg(feature = "log")]
                    log::warn!(
                        "skipping unknown PLT relocation {} in [{}]",
                        rel_type_to_str(rela.r_type()),
                        obj.name()
                    );
                }
            }
            if !obj.relocation.pltrel.is_empty() {
                let got = obj.got.unwrap().as_ptr();
                let object_ptr = obj as *const LoadedObject as usize;
                prepare_lazy_bind(got, object_ptr);
            }
        } else {
            for rela in obj.relocation.pltrel {
                let r_type = rela.r_type() as u32;
                if r_type == REL_JUMP_SLOT {
                    let val = self.resolve_or_zero(idx, rela.r_symbol());
                    write_val(base, rela.r_offset(), val);
                } else if r_type == REL_IRELATIVE {
                    let ifunc: extern "C" fn() -> usize =
                        unsafe { core::mem::transmute(base.wrapping_add_signed(rela.r_addend())) };
                    write_val(base, rela.r_offset(), ifunc());
                } else {
                    #[cfg(feature = "log")]
                    log::warn!(
                        "skipping unknown PLT relocation {} in [{}]",
                        rel_type_to_str(rela.r_type()),
                        obj.name()
                    );
                }
            }
        }
    }

    /// Copy `st_size` bytes from the first definition in an object other
    /// than the requester. The requester's own (copy-reserved) definition
    /// must not satisfy the search.
    fn relocate_copy(&self, idx: usize, rela: &ElfRela) {
        let obj = &self.objects[idx];
        let Some(symbols) = obj.symbols.as_ref() else {
            return;
        };
        let (_, info) = symbols.symbol_idx(rela.r_symbol());
        let Some(def) = self.find_symdef(&info, Some(idx)) else {
            self.diagnose_unresolved(idx, rela);
            return;
        };
        let Some(sym) = def.sym else {
            return;
        };
        let len = sym.st_size();
        let src_obj = &self.objects[def.idx];
        unsafe {
            core::ptr::copy_nonoverlapping(
                (src_obj.base() + sym.st_value()) as *const u8,
                (obj.base() + rela.r_offset()) as *mut u8,
                len,
            );
        }
    }

    /// Resolve or diagnose-and-zero, per the error contract above.
    fn resolve_or_zero(&self, idx: usize, r_sym: usize) -> usize {
        match self.resolve_symbol(idx, r_sym) {
            Some(def) => self.symdef_value(&def),
            None => {
                let obj = &self.objects[idx];
                let _ = obj;
                #[cfg(feature = "log")]
                if let Some(symbols) = obj.symbols.as_ref() {
                    log::warn!(
                        "undefined symbol [{}] referenced by [{}]",
                        symbols.symbol_idx(r_sym).1.name(),
                        obj.name()
                    );
                }
                0
            }
        }
    }

    #[cold]
    fn diagnose_unresolved(&self, idx: usize, rela: &ElfRela) {
        let obj = &self.objects[idx];
        let _ = (obj, rela);
        #[cfg(feature = "log")]
        if let Some(symbols) = obj.symbols.as_ref() {
            log::warn!(
                "cannot apply {} for symbol [{}] in [{}]",
                rel_type_to_str(rela.r_type()),
                symbols.symbol_idx(rela.r_symbol()).1.name(),
                obj.name()
            );
        }
    }
}

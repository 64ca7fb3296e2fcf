//! The process-scoped link state: the object registry, the library search
//! order, and the `dl*` entry points.

use crate::{
    Error, Result,
    arch::{Dyn, ElfSymbol, Phdr},
    dynamic::ElfDynamic,
    error::{find_symbol_error, io_error, registry_error},
    loader::{ElfImage, Loader},
    mmap::Mmap,
    object::ElfFile,
    relocation::ElfRelocation,
    segment::{ElfRelro, ElfSegments, MASK, PAGE_SIZE},
    symbol::{SymbolInfo, SymbolTable},
    tls::{TlsBlock, TlsTemplate},
};
use alloc::{
    boxed::Box,
    ffi::CString,
    format,
    string::{String, ToString},
    vec::Vec,
};
use core::{ffi::CStr, marker::PhantomData, ptr::NonNull};
use delegate::delegate;
use elf::abi::{PT_DYNAMIC, PT_GNU_RELRO, PT_LOAD, PT_TLS, STT_GNU_IFUNC, STT_TLS};
use hashbrown::HashMap;

/// Capacity of the object registry. The vector is allocated once and never
/// grows, so pointers into it (handed to GOT slot 1 for lazy binding) stay
/// valid for the process lifetime.
pub const MAX_OBJECTS: usize = 64;

/// Directories searched when neither the environment nor the requesting
/// object names one.
const DEFAULT_SEARCH_PATHS: [&str; 2] = ["/lib", "/usr/lib"];

/// Process-wide link configuration, read once from the environment.
#[derive(Default)]
pub struct SearchConfig {
    /// Directories tried before the defaults.
    pub library_paths: Vec<String>,
    /// Objects loaded before any DT_NEEDED dependency; their symbols win
    /// interposition.
    pub preload: Vec<String>,
    /// Force eager PLT resolution everywhere.
    pub bind_now: bool,
    /// Diagnostics requested via the environment.
    pub debug: bool,
}

impl SearchConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse a colon separated directory list (`LD_LIBRARY_PATH`).
    pub fn set_library_path(&mut self, list: &str) {
        self.library_paths
            .extend(list.split(':').filter(|s| !s.is_empty()).map(String::from));
    }

    /// Parse a colon or space separated object list (`LD_PRELOAD`).
    pub fn set_preload(&mut self, list: &str) {
        self.preload.extend(
            list.split([':', ' '])
                .filter(|s| !s.is_empty())
                .map(String::from),
        );
    }
}

/// One ELF image linked into the process.
pub struct LoadedObject {
    pub(crate) name: CString,
    pub(crate) segments: ElfSegments,
    /// `e_entry` relative to the base.
    pub(crate) entry: usize,
    pub(crate) phdrs: &'static [Phdr],
    pub(crate) dyn_ptr: *const Dyn,
    pub(crate) symbols: Option<SymbolTable>,
    pub(crate) relocation: ElfRelocation,
    pub(crate) got: Option<NonNull<usize>>,
    pub(crate) bind_now: bool,
    pub(crate) relro: Option<ElfRelro>,
    pub(crate) init_fn: Option<extern "C" fn()>,
    pub(crate) init_array_fn: Option<&'static [extern "C" fn()]>,
    pub(crate) fini_fn: Option<extern "C" fn()>,
    pub(crate) fini_array_fn: Option<&'static [extern "C" fn()]>,
    pub(crate) needed_libs: Box<[&'static str]>,
    pub(crate) runpath: Option<&'static str>,
    pub(crate) tls: Option<TlsTemplate>,
    /// Offset of this module's TLS data from the thread pointer; negative.
    pub(crate) tls_offset: Option<isize>,
    pub(crate) initialized: bool,
}

impl LoadedObject {
    delegate! {
        to self.segments {
            /// The load bias of the object.
            pub fn base(&self) -> usize;
            /// Length of the mapped extent.
            #[call(len)]
            pub fn mapped_len(&self) -> usize;
        }
    }

    #[inline]
    pub fn name(&self) -> &str {
        // Object names come from the file system or strtabs; both are
        // expected to be UTF-8 on this system.
        self.name.to_str().unwrap_or("<non-utf8>")
    }

    #[inline]
    pub fn cname(&self) -> &CStr {
        &self.name
    }

    /// The runtime entry point of the object.
    #[inline]
    pub fn entry(&self) -> usize {
        self.base() + self.entry
    }

    #[inline]
    pub fn phdrs(&self) -> &[Phdr] {
        self.phdrs
    }

    /// The object's dynamic array.
    #[inline]
    pub fn dynamic(&self) -> *const Dyn {
        self.dyn_ptr
    }

    #[inline]
    pub fn needed_libs(&self) -> &[&str] {
        &self.needed_libs
    }

    /// Look up a defined symbol inside this object only.
    pub fn lookup(&self, name: &str) -> Option<*const ()> {
        let symbols = self.symbols.as_ref()?;
        let info = SymbolInfo::from_str(name, None);
        let mut precompute = info.precompute();
        let sym = symbols.lookup_filter(&info, &mut precompute)?;
        self.symbol_value(sym)
    }

    /// Convert a defined symbol to a runtime address. Absolute symbols skip
    /// the bias; indirect functions are resolved by calling them.
    pub(crate) fn symbol_value(&self, sym: &ElfSymbol) -> Option<*const ()> {
        if sym.st_type() == STT_TLS {
            return None;
        }
        if sym.is_absolute() {
            return Some(sym.st_value() as *const ());
        }
        let addr = self.base() + sym.st_value();
        if sym.st_type() == STT_GNU_IFUNC {
            let ifunc: extern "C" fn() -> usize = unsafe { core::mem::transmute(addr) };
            Some(ifunc() as *const ())
        } else {
            Some(addr as *const ())
        }
    }
}

/// A symbol definition found during resolution: the defining object's index
/// and the symbol, or `None` for a satisfied undefined weak reference.
pub(crate) struct SymDef<'lib> {
    pub sym: Option<&'lib ElfSymbol>,
    pub idx: usize,
}

/// The dynamic linker state.
///
/// One value owns everything: the ordered object registry (which defines
/// the global symbol search order), the search configuration, and the main
/// thread's TLS block.
pub struct Linker<M: Mmap> {
    pub(crate) objects: Vec<LoadedObject>,
    index: HashMap<String, usize, foldhash::fast::FixedState>,
    pub(crate) config: SearchConfig,
    tls: Option<TlsBlock>,
    last_error: Option<Error>,
    started: bool,
    _marker: PhantomData<M>,
}

impl<M: Mmap> Linker<M> {
    pub fn new(config: SearchConfig) -> Self {
        Linker {
            objects: Vec::with_capacity(MAX_OBJECTS),
            index: HashMap::with_hasher(foldhash::fast::FixedState::default()),
            config,
            tls: None,
            last_error: None,
            started: false,
            _marker: PhantomData,
        }
    }

    #[inline]
    pub fn objects(&self) -> &[LoadedObject] {
        &self.objects
    }

    #[inline]
    pub fn config(&self) -> &SearchConfig {
        &self.config
    }

    /// Register the executable the kernel already mapped, from its program
    /// headers. `entry` is the runtime entry address from the auxiliary
    /// vector.
    pub fn register_main(
        &mut self,
        name: &str,
        phdrs: &'static [Phdr],
        bias: usize,
        entry: usize,
    ) -> Result<usize> {
        let mut min_vaddr = usize::MAX;
        let mut max_vaddr = 0;
        let mut dynamic = None;
        let mut relro = None;
        let mut tls = None;
        for phdr in phdrs {
            match phdr.p_type {
                PT_LOAD => {
                    if phdr.p_memsz == 0 {
                        continue;
                    }
                    min_vaddr = min_vaddr.min(phdr.p_vaddr as usize & MASK);
                    max_vaddr =
                        max_vaddr.max(((phdr.p_vaddr + phdr.p_memsz) as usize + PAGE_SIZE - 1) & MASK);
                }
                PT_DYNAMIC => {
                    dynamic = NonNull::new((bias + phdr.p_vaddr as usize) as *mut Dyn);
                }
                PT_GNU_RELRO => relro = Some(ElfRelro::new::<M>(phdr, bias)),
                PT_TLS => tls = TlsTemplate::from_phdr(phdr, bias),
                _ => {}
            }
        }
        if min_vaddr == usize::MAX {
            return Err(io_error("main executable has no loadable segment"));
        }
        let image = ElfImage {
            name: CString::new(name).map_err(|_| io_error("name contains NUL"))?,
            segments: ElfSegments::borrowed(bias, min_vaddr, max_vaddr - min_vaddr),
            entry: entry.wrapping_sub(bias),
            phdrs,
            dynamic,
            relro,
            tls,
        };
        self.register_image(image, name)
    }

    /// Load `name` and everything it needs, relocate it, and protect its
    /// RELRO region. Idempotent in `name`.
    pub fn load_library(&mut self, name: &str) -> Result<usize> {
        self.load_library_from(name, None)
    }

    fn load_library_from(&mut self, name: &str, requester: Option<usize>) -> Result<usize> {
        if let Some(&idx) = self.index.get(name) {
            return Ok(idx);
        }
        let file = self.open_by_search(name, requester)?;
        let image = Loader::<M>::new().load(file)?;
        let idx = self.register_image(image, name)?;
        #[cfg(feature = "log")]
        log::debug!(
            "loaded [{}] at base 0x{:x}",
            self.objects[idx].name(),
            self.objects[idx].base()
        );
        // Dependencies come before relocation so that every referenced
        // symbol is already registered.
        self.load_dependencies(idx)?;
        self.relocate_object(idx)?;
        if self.started {
            self.run_initializers(idx);
        }
        Ok(idx)
    }

    /// Load the dependency tree of an already registered object (the main
    /// executable), then relocate the object itself and freeze its RELRO
    /// region. The dependencies relocate as they load.
    pub fn link_object(&mut self, idx: usize) -> Result<()> {
        self.load_dependencies(idx)?;
        self.relocate_object(idx)
    }

    /// Recursively pull in the DT_NEEDED entries of `idx`.
    pub fn load_dependencies(&mut self, idx: usize) -> Result<()> {
        let needed = self.objects[idx].needed_libs.clone();
        for dep in needed {
            self.load_library_from(dep, Some(idx))?;
        }
        Ok(())
    }

    fn register_image(&mut self, image: ElfImage, key: &str) -> Result<usize> {
        if self.objects.len() == MAX_OBJECTS {
            return Err(registry_error("too many loaded objects"));
        }
        let ElfImage {
            name,
            segments,
            entry,
            phdrs,
            dynamic,
            relro,
            tls,
        } = image;
        let (symbols, relocation, got, bind_now, needed_libs, runpath, dyn_ptr, inits) =
            if let Some(dyn_ptr) = dynamic {
                let dynamic = ElfDynamic::parse(dyn_ptr.as_ptr(), &segments)?;
                let symbols = SymbolTable::try_from_dynamic(&dynamic);
                let needed_libs: Vec<&'static str> = symbols
                    .as_ref()
                    .map(|symbols| {
                        dynamic
                            .needed_libs
                            .iter()
                            .map(|off| symbols.strtab().get_str(off.get()))
                            .collect()
                    })
                    .unwrap_or_default();
                let runpath = symbols.as_ref().and_then(|symbols| {
                    dynamic
                        .runpath_off
                        .map(|off| symbols.strtab().get_str(off.get()))
                });
                (
                    symbols,
                    ElfRelocation::new(dynamic.dynrel, dynamic.pltrel, dynamic.rela_count),
                    dynamic.got,
                    dynamic.bind_now || self.config.bind_now,
                    needed_libs,
                    runpath,
                    dyn_ptr.as_ptr() as *const Dyn,
                    (
                        dynamic.init_fn,
                        dynamic.init_array_fn,
                        dynamic.fini_fn,
                        dynamic.fini_array_fn,
                    ),
                )
            } else {
                (
                    None,
                    ElfRelocation::empty(),
                    None,
                    self.config.bind_now,
                    Vec::new(),
                    None,
                    core::ptr::null(),
                    (None, None, None, None),
                )
            };
        // Static TLS layout supports a single module, traditionally the
        // executable itself.
        let tls_offset = match &tls {
            Some(template) => {
                if self.objects.iter().any(|obj| obj.tls.is_some()) {
                    #[cfg(feature = "log")]
                    log::warn!(
                        "ignoring TLS segment of [{}]: static TLS is already claimed",
                        name.to_str().unwrap_or("<non-utf8>")
                    );
                    None
                } else {
                    Some(template.static_offset())
                }
            }
            None => None,
        };
        let idx = self.objects.len();
        self.objects.push(LoadedObject {
            name,
            segments,
            entry,
            phdrs,
            dyn_ptr,
            symbols,
            relocation,
            got,
            bind_now,
            relro,
            init_fn: inits.0,
            init_array_fn: inits.1,
            fini_fn: inits.2,
            fini_array_fn: inits.3,
            needed_libs: needed_libs.into_boxed_slice(),
            runpath,
            tls,
            tls_offset,
            initialized: false,
        });
        self.index.insert(key.to_string(), idx);
        Ok(idx)
    }

    /// Try every candidate path for `name` in the specified search order:
    /// explicit paths as-is, then the environment list, the requesting
    /// object's DT_RUNPATH, and finally the system defaults.
    fn open_by_search(&self, name: &str, requester: Option<usize>) -> Result<ElfFile> {
        if name.contains('/') {
            return self.try_open(name.to_string());
        }
        for dir in &self.config.library_paths {
            if let Ok(file) = self.try_open(format!("{dir}/{name}")) {
                return Ok(file);
            }
        }
        if let Some(runpath) = requester.and_then(|idx| self.objects[idx].runpath) {
            for dir in runpath.split(':').filter(|s| !s.is_empty()) {
                if let Ok(file) = self.try_open(format!("{dir}/{name}")) {
                    return Ok(file);
                }
            }
        }
        for dir in DEFAULT_SEARCH_PATHS {
            if let Ok(file) = self.try_open(format!("{dir}/{name}")) {
                return Ok(file);
            }
        }
        Err(io_error(format!("cannot find library: {name}")))
    }

    fn try_open(&self, path: String) -> Result<ElfFile> {
        let path = CString::new(path).map_err(|_| io_error("path contains NUL"))?;
        ElfFile::open(path)
    }

    /// Search every object in load order. The first global definition wins;
    /// a weak definition is remembered as the fallback.
    pub(crate) fn find_symdef(&self, info: &SymbolInfo, skip: Option<usize>) -> Option<SymDef<'_>> {
        let mut precompute = info.precompute();
        let mut weak = None;
        for (idx, obj) in self.objects.iter().enumerate() {
            if skip == Some(idx) {
                continue;
            }
            let Some(symbols) = &obj.symbols else {
                continue;
            };
            if let Some(sym) = symbols.lookup_filter(info, &mut precompute) {
                if sym.is_weak() {
                    if weak.is_none() {
                        weak = Some(SymDef {
                            sym: Some(sym),
                            idx,
                        });
                    }
                } else {
                    #[cfg(feature = "log")]
                    log::trace!("binding symbol [{}] to [{}]", info.name(), obj.name());
                    return Some(SymDef {
                        sym: Some(sym),
                        idx,
                    });
                }
            }
        }
        weak
    }

    /// Resolve the reference `r_sym` of object `idx` against the global
    /// search order.
    pub(crate) fn resolve_symbol(&self, idx: usize, r_sym: usize) -> Option<SymDef<'_>> {
        let symbols = self.objects[idx].symbols.as_ref()?;
        let (dynsym, info) = symbols.symbol_idx(r_sym);
        if dynsym.is_local() {
            return Some(SymDef {
                sym: Some(dynsym),
                idx,
            });
        }
        if let Some(def) = self.find_symdef(&info, None) {
            return Some(def);
        }
        // A satisfied weak reference resolves to zero without complaint.
        if dynsym.is_weak() && dynsym.is_undef() {
            return Some(SymDef { sym: None, idx });
        }
        None
    }

    /// Runtime address of a resolved definition, or zero for a weak miss.
    pub(crate) fn symdef_value(&self, def: &SymDef) -> usize {
        match def.sym {
            Some(sym) => self.objects[def.idx]
                .symbol_value(sym)
                .map(|ptr| ptr as usize)
                .unwrap_or(0),
            None => 0,
        }
    }

    /// Global symbol search for callers outside relocation (`dlsym` with a
    /// null handle, the lazy binding scope).
    pub fn find_symbol(&self, name: &str) -> Option<*const ()> {
        let info = SymbolInfo::from_str(name, None);
        let def = self.find_symdef(&info, None)?;
        def.sym
            .and_then(|sym| self.objects[def.idx].symbol_value(sym))
    }

    /// Allocate and install the main thread's TLS block, then run every
    /// pending initializer in load order. Called exactly once, after the
    /// whole startup dependency graph is relocated.
    pub fn finish_startup(&mut self) -> Result<()> {
        if let Some(template) = self.objects.iter().find_map(|obj| obj.tls) {
            let block = TlsBlock::allocate::<M>(&template)?;
            // Constructors may touch thread-local data, so the thread
            // pointer is set before any of them run.
            if let Err(err) = unsafe { block.install() } {
                #[cfg(feature = "log")]
                log::warn!("cannot set thread pointer: {err}");
                #[cfg(not(feature = "log"))]
                let _ = err;
            }
            self.tls = Some(block);
        }
        self.started = true;
        // Reverse registration order puts every dependency ahead of its
        // requester and the executable last.
        for idx in (0..self.objects.len()).rev() {
            self.run_initializers(idx);
        }
        Ok(())
    }

    /// The installed TLS block, if any.
    #[inline]
    pub fn tls_block(&self) -> Option<&TlsBlock> {
        self.tls.as_ref()
    }

    /// DT_INIT first, then DT_INIT_ARRAY in index order.
    pub fn run_initializers(&mut self, idx: usize) {
        let obj = &mut self.objects[idx];
        if obj.initialized {
            return;
        }
        obj.initialized = true;
        let (init_fn, init_array_fn) = (obj.init_fn, obj.init_array_fn);
        if let Some(init) = init_fn {
            init();
        }
        if let Some(array) = init_array_fn {
            for init in array {
                init();
            }
        }
    }

    /// DT_FINI_ARRAY in reverse, then DT_FINI. Exposed for an embedder that
    /// tears the process down without leaving the address space.
    pub fn run_finalizers(&mut self, idx: usize) {
        let obj = &mut self.objects[idx];
        if !obj.initialized {
            return;
        }
        obj.initialized = false;
        if let Some(array) = obj.fini_array_fn {
            for fini in array.iter().rev() {
                fini();
            }
        }
        if let Some(fini) = obj.fini_fn {
            fini();
        }
    }

    /// `dlopen(name, flags)`: flags are accepted and ignored beyond the
    /// object's own binding request.
    pub fn dlopen(&mut self, name: &str) -> Option<NonNull<LoadedObject>> {
        match self.load_library(name) {
            Ok(idx) => Some(NonNull::from(&self.objects[idx])),
            Err(err) => {
                self.last_error = Some(err);
                None
            }
        }
    }

    /// `dlsym`: search one object (falling back to the global order), or
    /// everything when `handle` is `None`.
    pub fn dlsym(&mut self, handle: Option<&LoadedObject>, name: &str) -> Option<*const ()> {
        let found = match handle {
            Some(obj) => obj.lookup(name).or_else(|| self.find_symbol(name)),
            None => self.find_symbol(name),
        };
        if found.is_none() {
            self.last_error = Some(find_symbol_error(format!("cannot find symbol: {name}")));
        }
        found
    }

    /// `dlclose` keeps objects resident; unloading is deliberately not
    /// performed.
    pub fn dlclose(&mut self, _handle: Option<&LoadedObject>) -> i32 {
        0
    }

    /// `dlerror`: the last diagnostic, cleared by the call.
    pub fn dlerror(&mut self) -> Option<Error> {
        self.last_error.take()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn search_config_splits_lists() {
        let mut config = SearchConfig::new();
        config.set_library_path("/opt/lib::/usr/local/lib");
        config.set_preload("a.so b.so:c.so");
        assert_eq!(config.library_paths, ["/opt/lib", "/usr/local/lib"]);
        assert_eq!(config.preload, ["a.so", "b.so", "c.so"]);
    }
}

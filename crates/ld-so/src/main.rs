//! The PT_INTERP runtime linker.
//!
//! The kernel maps this program next to a dynamically linked executable and
//! jumps to `_start`. From there: relocate ourselves, parse the initial
//! stack, load and link the executable's dependency tree, set up TLS, run
//! constructors, and transfer control with the stack exactly as the kernel
//! left it.
#![cfg_attr(not(test), no_std)]
#![cfg_attr(not(test), no_main)]
// The test harness only exercises the pure parsing logic; the runtime-only
// items are expectedly idle there.
#![cfg_attr(test, allow(dead_code, unused_imports))]

extern crate alloc;

#[macro_use]
pub(crate) mod diag;
#[cfg(not(test))]
pub(crate) mod api;
pub(crate) mod arch;

use core::{
    cell::UnsafeCell,
    ffi::{CStr, c_char},
    panic::PanicInfo,
    ptr::null,
};
use diag::print_str;
use linked_list_allocator::LockedHeap;
use rtld::{
    Linker, SearchConfig,
    abi::{DT_NULL, DT_RELA, DT_RELACOUNT, PT_DYNAMIC, PT_PHDR, R_X86_64_RELATIVE},
    arch::{Dyn, Phdr},
    mmap::MmapImpl,
};
use syscalls::Sysno;

const AT_NULL: u64 = 0;
const AT_PHDR: u64 = 3;
const AT_PHENT: u64 = 4;
const AT_PHNUM: u64 = 5;
const AT_BASE: u64 = 7;
const AT_ENTRY: u64 = 9;
const AT_EXECFN: u64 = 31;

/// Exit status for any fatal load failure.
const EXIT_LOAD_FAILURE: i32 = 127;

const HEAP_SIZE: usize = 512 * 1024;

#[cfg(not(test))]
#[global_allocator]
static ALLOCATOR: LockedHeap = LockedHeap::empty();

/// Working memory for the linker itself. It has to survive the transfer of
/// control because the `dl*` entry points keep using it; the initial stack
/// frame does not, so the arena lives in our BSS.
#[cfg(not(test))]
static mut HEAP: [u8; HEAP_SIZE] = [0; HEAP_SIZE];

/// The process linker instance, installed once startup linking is done.
/// There is exactly one thread until the application runs, and the dl*
/// interface stays single-threaded by the platform contract.
struct Process(UnsafeCell<Option<Linker<MmapImpl>>>);

unsafe impl Sync for Process {}

static PROCESS: Process = Process(UnsafeCell::new(None));

pub(crate) fn linker() -> Option<&'static mut Linker<MmapImpl>> {
    unsafe { (*PROCESS.0.get()).as_mut() }
}

fn exit(status: i32) -> ! {
    unsafe {
        syscalls::raw_syscall!(Sysno::exit, status);
    }
    unreachable!()
}

fn fatal(msg: &str) -> ! {
    print_str("ld-so: ");
    print_str(msg);
    print_str("\n");
    exit(EXIT_LOAD_FAILURE)
}

#[cfg(not(test))]
#[panic_handler]
fn panic(info: &PanicInfo) -> ! {
    print_str("ld-so: panic at ");
    if let Some(location) = info.location() {
        print_str(location.file());
        print_str(":");
        diag::print_dec(location.line() as usize);
    }
    print_str("\n");
    exit(EXIT_LOAD_FAILURE)
}

#[repr(C)]
struct Aux {
    tag: u64,
    val: u64,
}

fn global_find(name: &str) -> Option<*const ()> {
    linker().and_then(|linker| linker.find_symbol(name))
}

// Initial stack layout, in units of usize:
// auxv <--- sp + argc + 2 + env_count + 1
// 0    <--- sp + argc + 2 + env_count
// env  <--- sp + argc + 2
// 0    <--- sp + argc + 1
// argv <--- sp + 1
// argc <--- sp
#[cfg(not(test))]
#[unsafe(no_mangle)]
unsafe extern "C" fn rust_main(sp: *mut usize, dynv: *mut Dyn) -> ! {
    // Phase one runs before our own relocations are applied: locals only,
    // no calls that could touch a GOT, no statics.
    let mut rela_off = 0;
    let mut rela_count = 0;
    let mut cur_dyn_ptr = dynv;
    loop {
        let cur_dyn = unsafe { &*cur_dyn_ptr };
        match cur_dyn.d_tag {
            DT_NULL => break,
            DT_RELA => rela_off = cur_dyn.d_un as usize,
            DT_RELACOUNT => rela_count = cur_dyn.d_un as usize,
            _ => {}
        }
        cur_dyn_ptr = unsafe { cur_dyn_ptr.add(1) };
    }

    let argc = unsafe { sp.read() };
    let argv = unsafe { sp.add(1) };
    let env = unsafe { sp.add(argc + 2) };
    let mut env_count = 0;
    let mut cur_env = env;
    while unsafe { cur_env.read() } != 0 {
        env_count += 1;
        cur_env = unsafe { cur_env.add(1) };
    }
    let auxv = unsafe { env.add(env_count + 1).cast::<Aux>() };

    let mut at_phdr = null::<Phdr>();
    let mut at_phnum = 0usize;
    let mut at_phent = 0usize;
    let mut at_base = 0usize;
    let mut at_entry = 0usize;
    let mut at_execfn = 0usize;
    let mut cur_aux_ptr = auxv;
    loop {
        let cur_aux = unsafe { cur_aux_ptr.read() };
        match cur_aux.tag {
            AT_NULL => break,
            AT_PHDR => at_phdr = cur_aux.val as *const Phdr,
            AT_PHENT => at_phent = cur_aux.val as usize,
            AT_PHNUM => at_phnum = cur_aux.val as usize,
            AT_BASE => at_base = cur_aux.val as usize,
            AT_ENTRY => at_entry = cur_aux.val as usize,
            AT_EXECFN => at_execfn = cur_aux.val as usize,
            _ => {}
        }
        cur_aux_ptr = unsafe { cur_aux_ptr.add(1) };
    }

    // Our own load bias: the kernel reports it when it mapped us as the
    // interpreter; when absent, recover it from our dynamic segment.
    let mut own_base = at_base;
    if own_base == 0 && !at_phdr.is_null() {
        let phdrs = unsafe { core::slice::from_raw_parts(at_phdr, at_phnum) };
        for phdr in phdrs {
            if phdr.p_type == PT_DYNAMIC {
                own_base = dynv as usize - phdr.p_vaddr as usize;
                break;
            }
        }
    }

    // Bootstrap: apply our own relative relocations. After this loop
    // function pointers and statics work.
    let relas = unsafe {
        core::slice::from_raw_parts(
            (rela_off + own_base) as *const elf::relocation::Elf64_Rela,
            rela_count,
        )
    };
    for rela in relas {
        if rela.r_info as u32 != R_X86_64_RELATIVE {
            continue;
        }
        let ptr = (rela.r_offset as usize + own_base) as *mut usize;
        unsafe { ptr.write(own_base.wrapping_add_signed(rela.r_addend as isize)) };
    }

    unsafe {
        ALLOCATOR
            .lock()
            .init(&raw mut HEAP as *mut u8, HEAP_SIZE);
    }

    if at_base == 0 {
        fatal("this is the runtime linker; execute a dynamically linked program instead");
    }
    if at_phdr.is_null() || at_phnum == 0 {
        fatal("auxiliary vector carries no program headers");
    }
    if at_entry == 0 {
        fatal("auxiliary vector carries no entry point");
    }
    if at_phent != 0 && at_phent != size_of::<Phdr>() {
        fatal("unexpected program header entry size");
    }

    let mut config = SearchConfig::new();
    unsafe { parse_env(env, &mut config) };
    if config.debug {
        diag::init_logger();
    }

    let phdrs = unsafe { core::slice::from_raw_parts(at_phdr, at_phnum) };
    // The executable's bias: where its header table actually sits against
    // where it asked to sit.
    let mut bias = 0;
    for phdr in phdrs {
        if phdr.p_type == PT_PHDR {
            bias = at_phdr as usize - phdr.p_vaddr as usize;
            break;
        }
    }

    let name = unsafe { main_program_name(at_execfn, argv, argc) };

    let preloads = config.preload.clone();
    let mut linker = Linker::<MmapImpl>::new(config);
    let main_idx = match linker.register_main(name, phdrs, bias, at_entry) {
        Ok(idx) => idx,
        Err(err) => {
            println!("ld-so: cannot register {name}: {err}");
            exit(EXIT_LOAD_FAILURE)
        }
    };
    // Preloaded objects come right after the executable so their symbols
    // interpose everything later in the search order.
    for preload in &preloads {
        if let Err(err) = linker.load_library(preload) {
            println!("ld-so: cannot preload {preload}: {err}");
            exit(EXIT_LOAD_FAILURE)
        }
    }
    if let Err(err) = linker.link_object(main_idx) {
        println!("ld-so: cannot link {name}: {err}");
        exit(EXIT_LOAD_FAILURE)
    }

    // Publish the instance before any constructor can take a lazy-binding
    // or dlopen path into it.
    unsafe {
        *PROCESS.0.get() = Some(linker);
    }
    rtld::set_global_scope(global_find);

    let linker = self::linker().unwrap();
    if let Err(err) = linker.finish_startup() {
        println!("ld-so: startup failed: {err}");
        exit(EXIT_LOAD_FAILURE)
    }

    let entry = linker.objects()[main_idx].entry();
    if linker.config().debug {
        print_str("ld-so: transferring control to ");
        print_str(name);
        print_str(" at ");
        diag::print_hex(entry);
        print_str("\n");
    }
    unsafe { arch::enter(entry, sp) }
}

/// The name the main object is registered under: AT_EXECFN when the kernel
/// provides it, argv[0] otherwise.
unsafe fn main_program_name(
    at_execfn: usize,
    argv: *const usize,
    argc: usize,
) -> &'static str {
    let raw = if at_execfn != 0 {
        at_execfn as *const c_char
    } else if argc > 0 {
        unsafe { argv.read() as *const c_char }
    } else {
        null()
    };
    if raw.is_null() {
        return "main";
    }
    unsafe { CStr::from_ptr(raw) }.to_str().unwrap_or("main")
}

/// Read the recognized `LD_*` variables into the search configuration.
unsafe fn parse_env(env: *const usize, config: &mut SearchConfig) {
    let mut cur = env;
    while unsafe { cur.read() } != 0 {
        let entry = unsafe { CStr::from_ptr(cur.read() as *const c_char) };
        if let Ok(s) = entry.to_str() {
            if let Some(value) = s.strip_prefix("LD_LIBRARY_PATH=") {
                config.set_library_path(value);
            } else if let Some(value) = s.strip_prefix("LD_PRELOAD=") {
                config.set_preload(value);
            } else if let Some(value) = s.strip_prefix("LD_BIND_NOW=") {
                config.bind_now = !value.is_empty();
            } else if s.starts_with("LD_DEBUG=") {
                // Presence alone turns diagnostics on, even with an empty
                // value.
                config.debug = true;
            }
        }
        cur = unsafe { cur.add(1) };
    }
}

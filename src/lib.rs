//! # rtld
//!
//! A freestanding ELF64 runtime dynamic linker. The crate maps shared
//! objects with raw system calls, resolves their symbol graphs with binding
//! and versioning rules, applies the x86-64 relocation family, lays out
//! static thread-local storage, and exposes the `dl*` operations, all
//! without a libc in the address space.
//!
//! The [`Linker`] value owns the whole link state: the ordered object
//! registry (which is the global symbol search order), the search
//! configuration read from the environment, and the main thread's TLS
//! block. The `ld-so` binary built on this crate is the PT_INTERP program
//! a kernel hands control to for dynamically linked executables.
#![cfg_attr(not(test), no_std)]

extern crate alloc;

pub mod arch;
mod dynamic;
mod ehdr;
mod error;
mod hash;
mod linker;
mod loader;
pub mod mmap;
pub mod object;
mod relocation;
mod segment;
mod symbol;
pub mod tls;
mod version;

pub use elf::abi;

pub use error::Error;
pub use linker::{Linker, LoadedObject, MAX_OBJECTS, SearchConfig};
pub use loader::{ElfImage, Loader};
pub use relocation::set_global_scope;
pub use segment::PAGE_SIZE;
pub use symbol::{PreCompute, SymbolInfo, SymbolTable};

pub type Result<T> = core::result::Result<T, Error>;

//! x86-64 specific relocation constants, the PLT resolver trampoline and the
//! thread-pointer control.

use crate::Result;
use crate::error::map_error;
use elf::abi::*;
use syscalls::Sysno;

/// The ELF machine type for x86-64.
pub const EM_ARCH: u16 = EM_X86_64;

/// Relative relocation - add the load bias to the addend.
pub const REL_RELATIVE: u32 = R_X86_64_RELATIVE;
/// GOT entry relocation - store the symbol address.
pub const REL_GOT: u32 = R_X86_64_GLOB_DAT;
/// Symbolic relocation - store symbol address plus addend.
pub const REL_SYMBOLIC: u32 = R_X86_64_64;
/// PLT jump slot relocation - store the symbol address in the PLT GOT.
pub const REL_JUMP_SLOT: u32 = R_X86_64_JUMP_SLOT;
/// TLS module id relocation.
pub const REL_DTPMOD: u32 = R_X86_64_DTPMOD64;
/// TLS offset within the module's block.
pub const REL_DTPOFF: u32 = R_X86_64_DTPOFF64;
/// TLS offset relative to the thread pointer.
pub const REL_TPOFF: u32 = R_X86_64_TPOFF64;
/// Indirect function relocation - call the resolver to get the address.
pub const REL_IRELATIVE: u32 = R_X86_64_IRELATIVE;
/// Copy relocation - copy the definition's bytes into the target.
pub const REL_COPY: u32 = R_X86_64_COPY;

/// GOT slot holding the loaded object for the lazy resolver.
pub(crate) const OBJECT_SLOT: usize = 1;
/// GOT slot holding the resolver entry point.
pub(crate) const RESOLVER_SLOT: usize = 2;

/// `arch_prctl` code to set the %fs base, which is the x86-64 thread pointer.
const ARCH_SET_FS: usize = 0x1002;

/// Map an x86_64 relocation type value to a human readable name.
pub fn rel_type_to_str(r_type: usize) -> &'static str {
    match r_type as u32 {
        R_X86_64_NONE => "R_X86_64_NONE",
        R_X86_64_64 => "R_X86_64_64",
        R_X86_64_COPY => "R_X86_64_COPY",
        R_X86_64_GLOB_DAT => "R_X86_64_GLOB_DAT",
        R_X86_64_JUMP_SLOT => "R_X86_64_JUMP_SLOT",
        R_X86_64_RELATIVE => "R_X86_64_RELATIVE",
        R_X86_64_DTPMOD64 => "R_X86_64_DTPMOD64",
        R_X86_64_DTPOFF64 => "R_X86_64_DTPOFF64",
        R_X86_64_TPOFF64 => "R_X86_64_TPOFF64",
        R_X86_64_IRELATIVE => "R_X86_64_IRELATIVE",
        _ => "UNKNOWN",
    }
}

/// Point the thread register (%fs base) at `tp`.
///
/// # Safety
/// `tp` must be the self-pointer word of a fully initialized TLS block;
/// thread-local accesses are undefined until this returns.
pub unsafe fn set_thread_pointer(tp: usize) -> Result<()> {
    let ret = unsafe { syscalls::raw_syscall!(Sysno::arch_prctl, ARCH_SET_FS, tp) };
    if ret > -4096isize as usize {
        return Err(map_error("arch_prctl(ARCH_SET_FS) failed"));
    }
    Ok(())
}

/// Runtime resolver entered from PLT stubs on the first call through a lazily
/// bound slot.
///
/// The PLT header pushed the object pointer (GOT slot 1) and the stub pushed
/// the relocation index. All argument registers are preserved around the call
/// to [`dl_fixup`], then control tail-jumps to the resolved function.
///
/// # Safety
/// Must only be reached through a PLT stub whose GOT slots were prepared by
/// [`prepare_lazy_bind`](super::prepare_lazy_bind).
#[unsafe(naked)]
pub(crate) extern "C" fn dl_runtime_resolve() {
    core::arch::naked_asm!(
        "
    // Save caller-saved registers
    push rdi
    push rsi
    push rdx
    push rcx
    push r8
    push r9
    push r10
    push r11

    // Save xmm registers (arguments can be passed in xmm0-xmm7).
    // 128 bytes for xmm0-xmm7 + 8 bytes padding to keep rsp 16-aligned.
    sub rsp, 136
    movdqu [rsp + 0], xmm0
    movdqu [rsp + 16], xmm1
    movdqu [rsp + 32], xmm2
    movdqu [rsp + 48], xmm3
    movdqu [rsp + 64], xmm4
    movdqu [rsp + 80], xmm5
    movdqu [rsp + 96], xmm6
    movdqu [rsp + 112], xmm7

    // Stack layout at this point:
    // [rsp + 0..135]  : xmm0-xmm7 + padding
    // [rsp + 136..199]: r11, r10, r9, r8, rcx, rdx, rsi, rdi
    // [rsp + 200]     : object pointer (pushed by PLT0)
    // [rsp + 208]     : relocation index (pushed by the PLT entry)
    // [rsp + 216]     : return address into the caller
    mov rdi, [rsp + 200]
    mov rsi, [rsp + 208]

    call {0}

    // Restore xmm registers
    movdqu xmm0, [rsp + 0]
    movdqu xmm1, [rsp + 16]
    movdqu xmm2, [rsp + 32]
    movdqu xmm3, [rsp + 48]
    movdqu xmm4, [rsp + 64]
    movdqu xmm5, [rsp + 80]
    movdqu xmm6, [rsp + 96]
    movdqu xmm7, [rsp + 112]
    add rsp, 136

    // Restore caller-saved registers
    pop r11
    pop r10
    pop r9
    pop r8
    pop rcx
    pop rdx
    pop rsi
    pop rdi

    // Drop the object pointer and relocation index
    add rsp, 16

    // Jump to the resolved function
    jmp rax
    ",
        sym crate::relocation::dl_fixup,
    )
}

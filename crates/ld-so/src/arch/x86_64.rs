//! The only machine code of the linker: the process entry stub and the
//! control transfer into the application.

#[cfg(not(test))]
use core::arch::global_asm;

// The kernel enters with the stack pointer at argc. Hand the raw stack
// pointer and the address of our own dynamic array to `rust_main`, with the
// stack aligned for the call. `rust_main` never returns.
#[cfg(not(test))]
global_asm!(
    "
	.text
	.globl	_start
	.hidden	_start
	.type	_start,@function
_start:
	mov	rdi, rsp
.weak _DYNAMIC
.hidden _DYNAMIC
	lea	rsi, [rip + _DYNAMIC]
	and	rsp, -16
	call	rust_main
	hlt"
);

/// Transfer control to the application entry point.
///
/// Restores the kernel-provided stack pointer, zeroes every general purpose
/// register, and jumps. The application observes the exact initial process
/// state its runtime expects.
///
/// # Safety
/// `entry` must be the runtime entry address of a fully relocated and
/// initialized executable and `sp` the untouched initial stack pointer.
#[unsafe(naked)]
pub unsafe extern "C" fn enter(entry: usize, sp: *const usize) -> ! {
    core::arch::naked_asm!(
        "
	mov	rsp, rsi
	// The entry address rides on the stack so rdi can be zeroed too;
	// ret consumes it and leaves rsp exactly at the kernel layout.
	push	rdi
	xor	eax, eax
	xor	ebx, ebx
	xor	ecx, ecx
	xor	edx, edx
	xor	esi, esi
	xor	edi, edi
	xor	ebp, ebp
	xor	r8d, r8d
	xor	r9d, r9d
	xor	r10d, r10d
	xor	r11d, r11d
	xor	r12d, r12d
	xor	r13d, r13d
	xor	r14d, r14d
	xor	r15d, r15d
	ret
	/* Should not reach. */
	hlt"
    )
}

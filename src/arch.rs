//! Capturing and installing the registers of the running thread on x86_64.

use core::arch::asm;

use crate::registers::{Register, Registers, X86_64};

/// General purpose registers in DWARF order, then the return address.
const SAVED_WORDS: usize = 17;

/// The registers of the calling function, at the point of the call. Must be
/// inlined so that the captured frame is the caller's own.
#[inline(always)]
pub(crate) fn capture_context() -> Registers<X86_64> {
    let mut words = [0usize; SAVED_WORDS];

    unsafe {
        asm!(
            "mov [{regs}+0*8], rax",
            "mov [{regs}+1*8], rdx",
            "mov [{regs}+2*8], rcx",
            "mov [{regs}+3*8], rbx", // required callee-saved
            "mov [{regs}+4*8], rsi",
            "mov [{regs}+5*8], rdi",
            "mov [{regs}+6*8], rbp", // required callee-saved
            "mov [{regs}+7*8], rsp", // required callee-saved
            "mov [{regs}+8*8], r8",
            "mov [{regs}+9*8], r9",
            "mov [{regs}+10*8], r10",
            "mov [{regs}+11*8], r11",
            "mov [{regs}+12*8], r12", // required callee-saved
            "mov [{regs}+13*8], r13", // required callee-saved
            "mov [{regs}+14*8], r14", // required callee-saved
            "mov [{regs}+15*8], r15", // required callee-saved

            "lea rax, [rip + 0]", // must use rip as a base register
            "mov [{regs}+16*8], rax",

            out("rax") _, // clobbers rax
            regs = in(reg) words.as_mut_ptr(),
            options(nostack, preserves_flags),
        );
    }

    let mut registers = Registers::new();
    for (n, word) in words[..16].iter().enumerate() {
        registers = registers.with(Register(n as u16), *word);
    }
    registers.set_ip(words[16]);
    registers
}

/// Switches to `registers`: every general purpose register, the stack
/// pointer and the ip.
///
/// # Safety
/// The registers must describe a frame that is live on this thread's stack.
pub(crate) unsafe fn restore_context(registers: &Registers<X86_64>) -> ! {
    let mut words = [0usize; SAVED_WORDS];
    for (n, word) in words[..16].iter_mut().enumerate() {
        *word = registers.get(Register(n as u16)).unwrap_or_default();
    }
    words[16] = registers.ip();
    trace!(?registers, "jumping");

    // SAFETY: The caller promises a live frame. rdi and the ip are parked on
    // the new stack so they can be restored last.
    unsafe {
        asm!(
            "mov rax, [rdi+7*8]", // new rsp
            "sub rax, 16",
            "mov [rdi+7*8], rax",
            "mov rbx, [rdi+5*8]", // new rdi
            "mov [rax], rbx",
            "mov rbx, [rdi+16*8]", // new rip
            "mov [rax+8], rbx",

            "mov rax, [rdi+0*8]",
            "mov rdx, [rdi+1*8]",
            "mov rcx, [rdi+2*8]",
            "mov rbx, [rdi+3*8]",
            "mov rsi, [rdi+4*8]",
            "mov rbp, [rdi+6*8]",
            "mov r8, [rdi+8*8]",
            "mov r9, [rdi+9*8]",
            "mov r10, [rdi+10*8]",
            "mov r11, [rdi+11*8]",
            "mov r12, [rdi+12*8]",
            "mov r13, [rdi+13*8]",
            "mov r14, [rdi+14*8]",
            "mov r15, [rdi+15*8]",

            "mov rsp, [rdi+7*8]",
            "pop rdi",
            "ret",
            in("rdi") words.as_ptr(),
            options(noreturn),
        )
    }
}

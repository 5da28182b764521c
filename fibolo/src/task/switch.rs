//! Native stack switching.
//!
//! `fibolo_switch_context(save, to)` pushes the callee-saved registers on the
//! current stack, stores the resulting stack pointer into `*save`, loads `to`
//! as the new stack pointer, pops the registers saved there and returns into
//! whatever that stack was doing. A fresh fiber stack is laid out by
//! [`init_stack`] so that the first switch "returns" into
//! `fibolo_fiber_bootstrap`, which calls the entry function with its argument.

use std::arch::global_asm;

/// Entry point run on a fresh fiber stack. Must never return.
pub(crate) type EntryFn = extern "C" fn(*mut u8) -> !;

unsafe extern "C" {
    fn fibolo_switch_context(save: *mut usize, to: usize);
    fn fibolo_fiber_bootstrap();
}

#[cfg(target_arch = "x86_64")]
global_asm!(
    ".text",
    ".global fibolo_switch_context",
    ".p2align 4",
    "fibolo_switch_context:",
    "push rbp",
    "push rbx",
    "push r12",
    "push r13",
    "push r14",
    "push r15",
    "sub rsp, 8",
    "stmxcsr dword ptr [rsp]",
    "fnstcw word ptr [rsp + 4]",
    "mov qword ptr [rdi], rsp",
    "mov rsp, rsi",
    "ldmxcsr dword ptr [rsp]",
    "fldcw word ptr [rsp + 4]",
    "add rsp, 8",
    "pop r15",
    "pop r14",
    "pop r13",
    "pop r12",
    "pop rbx",
    "pop rbp",
    "ret",
    "",
    ".global fibolo_fiber_bootstrap",
    ".p2align 4",
    "fibolo_fiber_bootstrap:",
    ".cfi_startproc",
    ".cfi_undefined rip",
    "mov rdi, r12",
    "call r13",
    "ud2",
    ".cfi_endproc",
);

#[cfg(target_arch = "aarch64")]
global_asm!(
    ".text",
    ".global fibolo_switch_context",
    ".p2align 4",
    "fibolo_switch_context:",
    "sub sp, sp, #160",
    "stp x19, x20, [sp, #0]",
    "stp x21, x22, [sp, #16]",
    "stp x23, x24, [sp, #32]",
    "stp x25, x26, [sp, #48]",
    "stp x27, x28, [sp, #64]",
    "stp x29, x30, [sp, #80]",
    "stp d8, d9, [sp, #96]",
    "stp d10, d11, [sp, #112]",
    "stp d12, d13, [sp, #128]",
    "stp d14, d15, [sp, #144]",
    "mov x9, sp",
    "str x9, [x0]",
    "mov sp, x1",
    "ldp x19, x20, [sp, #0]",
    "ldp x21, x22, [sp, #16]",
    "ldp x23, x24, [sp, #32]",
    "ldp x25, x26, [sp, #48]",
    "ldp x27, x28, [sp, #64]",
    "ldp x29, x30, [sp, #80]",
    "ldp d8, d9, [sp, #96]",
    "ldp d10, d11, [sp, #112]",
    "ldp d12, d13, [sp, #128]",
    "ldp d14, d15, [sp, #144]",
    "add sp, sp, #160",
    "ret",
    "",
    ".global fibolo_fiber_bootstrap",
    ".p2align 4",
    "fibolo_fiber_bootstrap:",
    ".cfi_startproc",
    ".cfi_undefined x30",
    "mov x0, x19",
    "blr x20",
    "brk #1",
    ".cfi_endproc",
);

fn bootstrap_addr() -> usize {
    fibolo_fiber_bootstrap as unsafe extern "C" fn() as usize
}

/// Saves the current context into `save` and resumes the one stored at `to`.
///
/// # Safety
///
/// `to` must be a stack pointer produced by [`init_stack`] or saved by a
/// previous switch, and the stack it points into must still be alive.
#[inline]
pub(crate) unsafe fn switch(save: *mut usize, to: usize) {
    unsafe { fibolo_switch_context(save, to) }
}

/// Writes an initial frame at the top of a fresh stack, returns the stack
/// pointer to switch to.
///
/// # Safety
///
/// `top` must be the (exclusive) upper bound of a writable region of at least
/// a few hundred bytes.
#[cfg(target_arch = "x86_64")]
pub(crate) unsafe fn init_stack(top: usize, entry: EntryFn, arg: *mut u8) -> usize {
    // Default MXCSR in the low half, default x87 control word at offset 4.
    const CSR: usize = 0x1F80 | (0x037F << 32);

    // After `ret` into the bootstrap the stack pointer is back at `base`,
    // 16-byte aligned, and `call` leaves the entry with the ABI's -8 offset.
    let base = (top & !15) - 16;
    // Popped in order: csr, r15, r14, r13, r12, rbx, rbp, return address.
    let frame: [usize; 8] = [
        CSR,
        0,
        0,
        entry as usize,
        arg as usize,
        0,
        0,
        bootstrap_addr(),
    ];

    let sp = base - size_of_val(&frame);
    unsafe { (sp as *mut [usize; 8]).write(frame) };
    sp
}

#[cfg(target_arch = "aarch64")]
pub(crate) unsafe fn init_stack(top: usize, entry: EntryFn, arg: *mut u8) -> usize {
    let mut frame = [0usize; 20];
    frame[0] = arg as usize; // x19
    frame[1] = entry as usize; // x20
    frame[11] = bootstrap_addr(); // x30

    let sp = (top & !15) - size_of_val(&frame);
    unsafe { (sp as *mut [usize; 20]).write(frame) };
    sp
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::stack::Stack;
    use std::cell::Cell;

    thread_local! {
        static MAIN_SP: Cell<usize> = const { Cell::new(0) };
        static FIBER_SP: Cell<usize> = const { Cell::new(0) };
        static COUNTER: Cell<u64> = const { Cell::new(0) };
    }

    extern "C" fn ping(arg: *mut u8) -> ! {
        let step = arg as u64;
        loop {
            COUNTER.set(COUNTER.get() + step);
            unsafe { switch(FIBER_SP.with(|c| c.as_ptr()), MAIN_SP.get()) };
        }
    }

    #[test]
    fn test_switch_round_trips() {
        let stack = Stack::new(128 * 1024);
        let sp = unsafe { init_stack(stack.top(), ping, 3 as *mut u8) };
        FIBER_SP.set(sp);

        for i in 1..=4 {
            unsafe { switch(MAIN_SP.with(|c| c.as_ptr()), FIBER_SP.get()) };
            assert_eq!(COUNTER.get(), 3 * i);
        }
    }

    #[test]
    fn test_float_state_survives_switch() {
        let stack = Stack::new(128 * 1024);
        let sp = unsafe { init_stack(stack.top(), ping, 1 as *mut u8) };
        FIBER_SP.set(sp);

        let x = std::hint::black_box(1.5f64);
        unsafe { switch(MAIN_SP.with(|c| c.as_ptr()), FIBER_SP.get()) };
        assert_eq!(x * 2.0, 3.0);
    }
}

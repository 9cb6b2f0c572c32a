// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Architecture support for the ATmega644.
//!
//! # The tick interrupt
//!
//! Timer 2 runs in clear-on-compare mode with a /1024 prescaler and a
//! compare value of 60, which at 20 MHz fires roughly every 3.1 ms. Its
//! compare-match vector is the only interrupt that enters the scheduler;
//! everything else (buttons, secondary timers) is handled outside the
//! kernel and never causes a context switch.
//!
//! # The context switch
//!
//! The compare-match vector is *naked*: the hand-written entry sequence
//! below is the complete save of machine state; no compiler prologue
//! touches a register before it runs. The order is load-bearing,
//! because a fresh process's boot frame is synthesized to match it byte for
//! byte:
//!
//! 1. `r31` is pushed, freeing a scratch register.
//! 2. The status register is read into `r31`, interrupts are (re)cleared,
//!    and the status byte is pushed.
//! 3. `r30` down to `r0` follow, with `r1` zeroed on the way because the
//!    compiler's code assumes a zero register.
//!
//! That leaves 33 bytes of context on the interrupted process's stack, on
//! top of the 2-byte return address the hardware pushed at dispatch. The
//! stack pointer is then parked on the dispatcher's own stack while the
//! Rust side picks the next process, and the epilogue pops the mirror image
//! of the same sequence from whatever stack the dispatcher returned. The
//! closing `reti` re-enables interrupts and resumes the chosen process in
//! one step.
//!
//! Interrupts stay disabled from vector entry to `reti`; there is no window
//! in which a second tick could observe a half-switched stack pointer.

use core::arch::{asm, global_asm};

use abi::{Program, StackPtr, STACK_SIZE_ISR};

/// Log things from kernel context. This macro is made visible to the rest
/// of the kernel by a chain of `#[macro_use]` attributes, but its
/// implementation is very architecture-specific: with the `klog-uart`
/// feature it writes to USART0 (blocking, so only suitable for bring-up),
/// and otherwise it is stubbed out.
#[cfg(not(feature = "klog-uart"))]
macro_rules! klog {
    ($s:expr) => {};
    ($s:expr, $($tt:tt)*) => {};
}

#[cfg(feature = "klog-uart")]
macro_rules! klog {
    ($($tt:tt)*) => {{
        use core::fmt::Write;
        let _ = writeln!($crate::arch::Uart0, $($tt)*);
    }};
}

macro_rules! uassert {
    ($cond:expr) => {
        if !$cond {
            panic!("Assertion failed!");
        }
    };
}

macro_rules! uassert_eq {
    ($left:expr, $right:expr) => {
        if !($left == $right) {
            panic!("Assertion failed!");
        }
    };
}

/// Blocking writer over USART0 for `klog!`. Assumes the board code has set
/// up the baud rate.
#[cfg(feature = "klog-uart")]
pub struct Uart0;

#[cfg(feature = "klog-uart")]
impl core::fmt::Write for Uart0 {
    fn write_str(&mut self, s: &str) -> core::fmt::Result {
        // Manufactured access: the log channel belongs to the kernel.
        let usart = unsafe { &*avr_device::atmega644::USART0::ptr() };
        for &b in s.as_bytes() {
            while usart.ucsr0a.read().bits() & (1 << 5) == 0 {}
            usart.udr0.write(|w| unsafe { w.bits(b) });
        }
        Ok(())
    }
}

/// Dedicated stack for the dispatcher. The vector switches onto it after
/// saving the interrupted process's context, so scheduling never eats into
/// any process's stack budget.
#[no_mangle]
static mut ISR_STACK: [u8; STACK_SIZE_ISR] = [0; STACK_SIZE_ISR];

// Timer 2 compare-match A, vector 9 on the ATmega644. The hardware has
// already disabled interrupts and pushed the return address when this runs.
global_asm!(
    "
    .section .text.__vector_9
    .global __vector_9
    .type __vector_9, @function
__vector_9:
    push r31
    in r31, 0x3f
    cli
    push r31
    push r30
    push r29
    push r28
    push r27
    push r26
    push r25
    push r24
    push r23
    push r22
    push r21
    push r20
    push r19
    push r18
    push r17
    push r16
    push r15
    push r14
    push r13
    push r12
    push r11
    push r10
    push r9
    push r8
    push r7
    push r6
    push r5
    push r4
    push r3
    push r2
    push r1
    clr r1
    push r0
    ; the interrupted process's stack pointer is the dispatcher's argument
    in r24, 0x3d
    in r25, 0x3e
    ; run the scheduler on its own stack
    ldi r30, lo8(ISR_STACK + {isr_top})
    ldi r31, hi8(ISR_STACK + {isr_top})
    out 0x3d, r30
    out 0x3e, r31
    call {entry}
    ; returned: the stack pointer of the process to resume
    out 0x3d, r24
    out 0x3e, r25
    pop r0
    pop r1
    pop r2
    pop r3
    pop r4
    pop r5
    pop r6
    pop r7
    pop r8
    pop r9
    pop r10
    pop r11
    pop r12
    pop r13
    pop r14
    pop r15
    pop r16
    pop r17
    pop r18
    pop r19
    pop r20
    pop r21
    pop r22
    pop r23
    pop r24
    pop r25
    pop r26
    pop r27
    pop r28
    pop r29
    pop r30
    pop r31
    out 0x3f, r31
    pop r31
    reti
    ",
    isr_top = const STACK_SIZE_ISR - 1,
    entry = sym dispatch_tick,
);

// Entering the very first process reuses the vector's epilogue: load the
// prepared stack pointer, pop the synthesized context, reti into the entry
// point. The boot thread's own context is simply abandoned.
global_asm!(
    "
    .section .text.first_resume
    .global first_resume
    .type first_resume, @function
first_resume:
    cli
    out 0x3d, r24
    out 0x3e, r25
    pop r0
    pop r1
    pop r2
    pop r3
    pop r4
    pop r5
    pop r6
    pop r7
    pop r8
    pop r9
    pop r10
    pop r11
    pop r12
    pop r13
    pop r14
    pop r15
    pop r16
    pop r17
    pop r18
    pop r19
    pop r20
    pop r21
    pop r22
    pop r23
    pop r24
    pop r25
    pop r26
    pop r27
    pop r28
    pop r29
    pop r30
    pop r31
    out 0x3f, r31
    pop r31
    reti
    ",
);

extern "C" {
    fn first_resume(sp: u16) -> !;
}

/// The Rust side of the tick vector, running on the dispatcher stack with
/// interrupts disabled and every register of the interrupted process parked
/// on that process's stack.
#[no_mangle]
unsafe extern "C" fn dispatch_tick(old_sp: u16) -> u16 {
    crate::sched::preempt(StackPtr::new(old_sp as usize)).addr() as u16
}

fn sreg_read() -> u8 {
    let sreg: u8;
    unsafe {
        asm!("in {0}, 0x3f", out(reg) sreg, options(nomem, nostack, preserves_flags));
    }
    sreg
}

pub fn global_interrupts_enabled() -> bool {
    sreg_read() & 0x80 != 0
}

/// Forces the global interrupt enable bit.
///
/// # Safety
///
/// Enabling interrupts is only sound once the kernel's data structures are
/// consistent; this is meant for restoring a previously observed state.
pub unsafe fn set_global_interrupts(enabled: bool) {
    if enabled {
        avr_device::interrupt::enable();
    } else {
        avr_device::interrupt::disable();
    }
}

/// # Safety
///
/// See `set_global_interrupts`.
pub unsafe fn enable_global_interrupts() {
    avr_device::interrupt::enable();
}

/// Runs `f` with interrupts disabled, restoring the previous
/// interrupt-enable state on the way out.
pub fn with_interrupts_disabled<R>(f: impl FnOnce() -> R) -> R {
    avr_device::interrupt::free(|_| f())
}

const OCIE2A: u8 = 1 << 1;

fn tc2() -> &'static avr_device::atmega644::tc2::RegisterBlock {
    // We are manufacturing authority to interact with the timer here,
    // because the tick source belongs to the kernel and can't be threaded
    // through an architecture-independent API.
    unsafe { &*avr_device::atmega644::TC2::ptr() }
}

pub fn tick_interrupt_enabled() -> bool {
    tc2().timsk2.read().bits() & OCIE2A != 0
}

/// Masks or unmasks the tick interrupt, leaving every other interrupt
/// source alone.
pub fn set_tick_interrupt(enabled: bool) {
    let tc2 = tc2();
    if enabled {
        tc2.timsk2.modify(|r, w| unsafe { w.bits(r.bits() | OCIE2A) });
    } else {
        tc2.timsk2.modify(|r, w| unsafe { w.bits(r.bits() & !OCIE2A) });
    }
}

/// Configures timer 2 as the tick source and unmasks its compare-match
/// interrupt: clear-on-compare, /1024 prescaler, compare value 60.
pub fn arm_tick_timer() {
    let tc2 = tc2();
    tc2.tccr2a.write(|w| unsafe { w.bits(1 << 1) }); // WGM21: clear on compare match
    tc2.tccr2b.write(|w| unsafe { w.bits(0b0000_0111) }); // CS22|CS21|CS20: /1024
    tc2.ocr2a.write(|w| unsafe { w.bits(abi::TICK_COMPARE) });
    tc2.timsk2.modify(|r, w| unsafe { w.bits(r.bits() | OCIE2A) });
}

pub fn sp_read() -> StackPtr {
    let lo: u8;
    let hi: u8;
    unsafe {
        asm!(
            "in {0}, 0x3d",
            "in {1}, 0x3e",
            out(reg) lo,
            out(reg) hi,
            options(nomem, nostack, preserves_flags),
        );
    }
    StackPtr::new(usize::from(hi) << 8 | usize::from(lo))
}

/// Loads the CPU stack pointer.
///
/// # Safety
///
/// `sp` must point at usable stack. The two byte writes are bracketed by
/// disabled interrupts so a tick cannot fire between them and observe a
/// half-written pointer.
pub unsafe fn sp_write(sp: StackPtr) {
    let lo = sp.addr() as u8;
    let hi = (sp.addr() >> 8) as u8;
    avr_device::interrupt::free(|_| unsafe {
        asm!(
            "out 0x3d, {0}",
            "out 0x3e, {1}",
            in(reg) lo,
            in(reg) hi,
            options(nomem, nostack, preserves_flags),
        );
    });
}

/// The 16-bit word `reti` consumes to enter `program`: the entry address as
/// the hardware expects it on the stack.
pub fn entry_word(program: Program) -> u16 {
    program as usize as u16
}

/// Spins until the dispatcher takes the CPU away. Used by a process that
/// has just retired its own slot: the next tick switches away and never
/// comes back.
pub fn park_until_preempted() -> ! {
    loop {
        core::hint::spin_loop();
    }
}

/// Consumes the prepared frame at `sp` and enters the process it describes.
/// The caller's own context is abandoned.
pub fn resume_first(sp: StackPtr) -> ! {
    unsafe { first_resume(sp.addr() as u16) }
}

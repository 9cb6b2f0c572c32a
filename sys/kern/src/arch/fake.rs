// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Software stand-in for the AVR support, used when the kernel is built for
//! the host.
//!
//! The interrupt machinery is modeled as a handful of flags: the global
//! interrupt enable bit, the tick interrupt mask, and the CPU stack
//! pointer. That is enough for the rest of the kernel and its test
//! suite to observe exactly the state transitions the real hardware
//! would see, minus the actual context switching.

use core::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use abi::{Program, StackPtr};

macro_rules! klog {
    ($s:expr) => { println!($s) };
    ($s:expr, $($tt:tt)*) => { println!($s, $($tt)*) };
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

/// Simulated global interrupt enable bit (the I bit in SREG).
static GLOBAL_IE: AtomicBool = AtomicBool::new(true);
/// Simulated tick interrupt mask (OCIE2A in TIMSK2).
static TICK_IE: AtomicBool = AtomicBool::new(false);
/// Whether the tick timer has been armed at all.
static TICK_ARMED: AtomicBool = AtomicBool::new(false);
/// Simulated CPU stack pointer.
static SP: AtomicUsize = AtomicUsize::new(0);

pub fn global_interrupts_enabled() -> bool {
    GLOBAL_IE.load(Ordering::Relaxed)
}

/// Forces the simulated interrupt enable bit. Safe in the fake, unsafe in
/// the signature for parity with the real thing.
pub unsafe fn set_global_interrupts(enabled: bool) {
    GLOBAL_IE.store(enabled, Ordering::Relaxed);
}

pub unsafe fn enable_global_interrupts() {
    GLOBAL_IE.store(true, Ordering::Relaxed);
}

/// Runs `f` with the (simulated) global interrupt enable bit cleared,
/// restoring its previous value on the way out.
pub fn with_interrupts_disabled<R>(f: impl FnOnce() -> R) -> R {
    let was = GLOBAL_IE.swap(false, Ordering::Relaxed);
    let r = f();
    GLOBAL_IE.store(was, Ordering::Relaxed);
    r
}

pub fn tick_interrupt_enabled() -> bool {
    TICK_IE.load(Ordering::Relaxed)
}

pub fn set_tick_interrupt(enabled: bool) {
    TICK_IE.store(enabled, Ordering::Relaxed);
}

/// Configures and unmasks the tick source.
pub fn arm_tick_timer() {
    TICK_ARMED.store(true, Ordering::Relaxed);
    TICK_IE.store(true, Ordering::Relaxed);
}

pub fn tick_timer_armed() -> bool {
    TICK_ARMED.load(Ordering::Relaxed)
}

pub fn sp_read() -> StackPtr {
    StackPtr::new(SP.load(Ordering::Relaxed))
}

pub unsafe fn sp_write(sp: StackPtr) {
    SP.store(sp.addr(), Ordering::Relaxed);
}

/// The 16-bit word the resume path consumes to enter `program`. On the host
/// this is just the truncated function address; nothing resumes from it.
pub fn entry_word(program: Program) -> u16 {
    program as usize as u16
}

/// Parks the caller until the dispatcher takes the CPU away. There is no
/// dispatcher on the host.
pub fn park_until_preempted() -> ! {
    panic!("parked with no dispatcher to return to");
}

/// Consumes a prepared stack frame and enters the process it describes.
pub fn resume_first(_sp: StackPtr) -> ! {
    panic!("entering userland");
}

/// Test support: puts the simulated hardware back into its power-on state.
#[cfg(test)]
pub(crate) fn reset_for_test() {
    GLOBAL_IE.store(true, Ordering::Relaxed);
    TICK_IE.store(false, Ordering::Relaxed);
    TICK_ARMED.store(false, Ordering::Relaxed);
    SP.store(0, Ordering::Relaxed);
}

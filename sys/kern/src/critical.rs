// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Nested critical sections.
//!
//! A critical section masks the scheduler's tick interrupt and nothing
//! else: buttons and secondary timers keep firing, and the global interrupt
//! enable bit is never touched on behalf of the section. Sections nest up
//! to 255 deep; the outermost `enter` captures whether the tick was
//! unmasked, and the matching `leave` restores exactly that state.
//!
//! The counter itself is shared between process context and interrupt
//! handlers, and the ATmega644 has no compare-and-swap, so every
//! read-modify-write below is bracketed by disabled interrupts. Plain
//! atomic loads and stores are all the hardware needs beyond that.

use core::sync::atomic::{AtomicBool, AtomicU8, Ordering};

use abi::FatalError;

use crate::{arch, fail};

/// Current nesting depth, process-wide.
static DEPTH: AtomicU8 = AtomicU8::new(0);

/// Tick-interrupt-enable state captured when the outermost section was
/// entered.
static TICK_SHADOW: AtomicBool = AtomicBool::new(false);

/// Enters a critical section, masking the tick interrupt if this is the
/// outermost one.
pub fn enter() {
    arch::with_interrupts_disabled(|| {
        let depth = DEPTH.load(Ordering::Relaxed);
        if depth == u8::MAX {
            fail::fatal(FatalError::CriticalSectionOverflow);
            return;
        }
        if depth == 0 {
            TICK_SHADOW.store(arch::tick_interrupt_enabled(), Ordering::Relaxed);
            arch::set_tick_interrupt(false);
        }
        DEPTH.store(depth + 1, Ordering::Relaxed);
    });
}

/// Leaves a critical section, unmasking the tick interrupt when the
/// outermost one ends, but only if it was unmasked when that section
/// began.
pub fn leave() {
    arch::with_interrupts_disabled(|| {
        let depth = DEPTH.load(Ordering::Relaxed);
        if depth == 0 {
            fail::fatal(FatalError::CriticalSectionUnderflow);
            return;
        }
        let depth = depth - 1;
        DEPTH.store(depth, Ordering::Relaxed);
        if depth == 0 && TICK_SHADOW.load(Ordering::Relaxed) {
            arch::set_tick_interrupt(true);
        }
    });
}

/// Current nesting depth.
pub fn depth() -> u8 {
    DEPTH.load(Ordering::Relaxed)
}

/// Runs `f` inside a critical section.
pub fn with<R>(f: impl FnOnce() -> R) -> R {
    enter();
    let r = f();
    leave();
    r
}

#[cfg(test)]
pub(crate) fn reset_for_test() {
    DEPTH.store(0, Ordering::Relaxed);
    TICK_SHADOW.store(false, Ordering::Relaxed);
}

// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Spindle kernel.
//!
//! This is the application-independent portion of the operating system: the
//! process table, the preemptive dispatcher, and the services user programs
//! call into. Everything outside the `arch` module is portable; the `arch`
//! module carries the ATmega644 specifics plus a software fake that lets the
//! rest of the kernel build and test on the host.
//!
//! # Design principles
//!
//! 1. Static configuration. The process count, stack geometry, and timer
//!    setup are fixed at compile time; nothing is allocated at runtime.
//! 2. A strong preference for safe code where reasonable. The unavoidable
//!    `unsafe` is concentrated in `arch` and in the stack-frame plumbing of
//!    the process table.
//! 3. Pure decision logic lives outside the kernel (in `schedcore`), where
//!    it can be exercised without hardware.
//! 4. Preemption happens only at the tick interrupt. Other interrupt
//!    sources never call into the scheduler, which keeps the critical
//!    section a cheap mask of a single interrupt enable bit.

#![cfg_attr(target_os = "none", no_std)]
#![cfg_attr(target_arch = "avr", feature(asm_experimental_arch))]

#[macro_use]
pub mod arch;

pub mod autostart;
pub mod critical;
pub mod fail;
pub mod proctab;
pub mod sched;
pub mod startup;
pub mod time;

#[cfg(test)]
pub(crate) mod test_support;

// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Fatal-error reporting.
//!
//! This module defines the following binary interface to debuggers:
//!
//! - `kern::fail::KERNEL_HAS_FAILED` is a `bool`. It is cleared before the
//!   kernel starts and set once any fatal error is recorded.
//! - `kern::fail::KERNEL_EPITAPH` is a NUL-padded byte array holding the
//!   text of the most recent fatal error. Unlike a panic, a reported fatal
//!   error may be acknowledged and survived, so the buffer holds the most
//!   recent one rather than locking on the first.
//!
//! Beyond the debugger interface, fatal errors route through a hook the
//! board code registers at startup. The hook owns the user interaction
//! (on the reference board it prints the message on the character panel
//! and blocks until ENTER+ESCAPE) and may return, after which the system
//! resumes. [`fatal`] itself guarantees the global interrupt-enable bit
//! comes back exactly as the failing code left it, no matter what the hook
//! did with it.

use core::fmt::Write;

use abi::FatalError;

use crate::arch;

#[used]
static mut KERNEL_HAS_FAILED: bool = false;

/// Two panel lines worth of epitaph.
const EPITAPH_LEN: usize = 32;

#[used]
static mut KERNEL_EPITAPH: [u8; EPITAPH_LEN] = [0; EPITAPH_LEN];

/// Receives each fatal error. Expected to display it and block for user
/// acknowledgement; returning resumes the system.
pub type ErrorHook = fn(&FatalError);

static mut ERROR_HOOK: Option<ErrorHook> = None;

/// Registers the hook fatal errors are reported through. Normally invoked
/// exactly once during board startup, before interrupts are enabled.
pub fn set_error_hook(hook: ErrorHook) {
    arch::with_interrupts_disabled(|| {
        // Safety: plain store; concurrent readers are excluded because
        // interrupts are off and there is a single hardware thread.
        unsafe {
            *core::ptr::addr_of_mut!(ERROR_HOOK) = Some(hook);
        }
    });
}

/// Reports a fatal error: records it for debuggers, hands it to the hook,
/// and restores the interrupt-enable state the caller had.
pub fn fatal(err: FatalError) {
    let was_enabled = arch::global_interrupts_enabled();
    let hook = arch::with_interrupts_disabled(|| {
        record(&err);
        // Safety: see set_error_hook; interrupts are off here.
        unsafe { *core::ptr::addr_of!(ERROR_HOOK) }
    });
    match hook {
        Some(hook) => hook(&err),
        None => die(&err),
    }
    // Safety: restoring a previously observed state.
    unsafe { arch::set_global_interrupts(was_enabled) };
}

fn record(err: &FatalError) {
    // Safety: single hardware thread and interrupts are disabled by our
    // caller while these statics are written.
    unsafe {
        core::ptr::addr_of_mut!(KERNEL_HAS_FAILED).write(true);
        let buf = &mut *core::ptr::addr_of_mut!(KERNEL_EPITAPH);
        *buf = [0; EPITAPH_LEN];
        let mut writer = Eulogist { dest: &mut buf[..] };
        write!(writer, "{err}").ok();
    }
}

/// Last resort when no hook is registered: on hardware there is nobody to
/// ask for acknowledgement, so spin; on the host, surface the failure to
/// the test runner.
#[cfg(target_os = "none")]
fn die(_err: &FatalError) -> ! {
    loop {
        // Platform-independent NOP
        core::sync::atomic::fence(core::sync::atomic::Ordering::SeqCst);
    }
}

#[cfg(not(target_os = "none"))]
fn die(err: &FatalError) -> ! {
    panic!("fatal error with no hook registered: {err}");
}

struct Eulogist<'a> {
    dest: &'a mut [u8],
}

impl Write for Eulogist<'_> {
    fn write_str(&mut self, s: &str) -> core::fmt::Result {
        let s = s.as_bytes();
        let n = s.len().min(self.dest.len());
        let (dest, leftovers) = {
            let taken = core::mem::take(&mut self.dest);
            taken.split_at_mut(n)
        };
        dest.copy_from_slice(&s[..n]);
        self.dest = leftovers;
        Ok(())
    }
}

/// Whether any fatal error has been recorded since boot.
pub fn has_failed() -> bool {
    // Safety: single-byte read of a flag only ever flipped true.
    unsafe { core::ptr::addr_of!(KERNEL_HAS_FAILED).read() }
}

/// A copy of the epitaph buffer, NUL-padded.
pub fn epitaph() -> [u8; EPITAPH_LEN] {
    arch::with_interrupts_disabled(|| {
        // Safety: interrupts are off, so no writer is mid-update.
        unsafe { core::ptr::addr_of!(KERNEL_EPITAPH).read() }
    })
}

#[cfg(target_os = "none")]
#[panic_handler]
fn panic(info: &core::panic::PanicInfo<'_>) -> ! {
    // Safety: we are on our way down; nothing else will touch the epitaph.
    unsafe {
        core::ptr::addr_of_mut!(KERNEL_HAS_FAILED).write(true);
        let buf = &mut *core::ptr::addr_of_mut!(KERNEL_EPITAPH);
        *buf = [0; EPITAPH_LEN];
        let mut writer = Eulogist { dest: &mut buf[..] };
        write!(writer, "{info}").ok();
    }
    loop {
        core::sync::atomic::fence(core::sync::atomic::Ordering::SeqCst);
    }
}

#[cfg(test)]
pub(crate) fn reset_for_test() {
    arch::with_interrupts_disabled(|| unsafe {
        core::ptr::addr_of_mut!(KERNEL_HAS_FAILED).write(false);
        core::ptr::addr_of_mut!(KERNEL_EPITAPH).write([0; EPITAPH_LEN]);
        *core::ptr::addr_of_mut!(ERROR_HOOK) = None;
    });
}

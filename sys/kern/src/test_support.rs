// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Shared plumbing for the kernel's host-side tests.
//!
//! The kernel state under test (fake interrupt flags, critical-section
//! counter, failure statics, the singleton table) is process-global, so
//! tests that touch it serialize on one lock and start from a known state.

use std::sync::{Mutex, MutexGuard};

use abi::FatalError;

static LOCK: Mutex<()> = Mutex::new(());

static REPORTS: Mutex<Vec<FatalError>> = Mutex::new(Vec::new());

/// Error hook that records instead of displaying.
pub fn recording_hook(err: &FatalError) {
    REPORTS
        .lock()
        .unwrap_or_else(|e| e.into_inner())
        .push(*err);
}

/// Drains everything the recording hook has seen.
pub fn take_reports() -> Vec<FatalError> {
    std::mem::take(&mut *REPORTS.lock().unwrap_or_else(|e| e.into_inner()))
}

/// Serializes the test and resets the global kernel state: simulated
/// hardware to power-on, critical sections unwound, failure state cleared,
/// and the recording hook installed.
pub fn fresh() -> MutexGuard<'static, ()> {
    let guard = LOCK.lock().unwrap_or_else(|e| e.into_inner());
    crate::arch::reset_for_test();
    crate::critical::reset_for_test();
    crate::fail::reset_for_test();
    crate::fail::set_error_hook(recording_hook);
    take_reports();
    guard
}

// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Kernel startup and the kernel singleton.

use crate::autostart::AutostartNode;
use crate::proctab::ProcessTable;
use crate::sched;

/// The one process table. The table, the current pid, the active strategy,
/// and the strategies' accounting travel together in here; the
/// critical-section counter lives apart because it must stay reachable
/// with interrupts masked and nothing else borrowed.
static mut KERNEL: ProcessTable = ProcessTable::new();

/// Hands `f` the process table.
///
/// Safety rationale: there is a single hardware thread, and every caller
/// either runs inside the tick vector (interrupts disabled) or brackets
/// the call in a critical section, so the `&mut` handed out here can never
/// alias a live borrow. Nesting `with_proc_table` inside `f` would break
/// that reasoning; nothing in the kernel does.
pub fn with_proc_table<R>(f: impl FnOnce(&mut ProcessTable) -> R) -> R {
    // Safety: see above.
    unsafe { f(&mut *core::ptr::addr_of_mut!(KERNEL)) }
}

/// The main kernel entry point.
///
/// The board's reset path does its hardware bring-up (clock, panel, error
/// hook) and then calls this with the autostart chain. Initializes the
/// scheduler (idle in slot 0, the chain behind it) and hands the CPU
/// over; it does not return.
///
/// # Safety
///
/// This can be called exactly once per boot, before interrupts are
/// enabled.
pub unsafe fn start_kernel(autostart: Option<&'static AutostartNode>) -> ! {
    klog!("kern: scheduler init");
    with_proc_table(|table| sched::init_scheduler(table, autostart));
    klog!("kern: handing over");
    sched::start_scheduler()
}

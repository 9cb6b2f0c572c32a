// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Kernel time, counted in scheduler ticks.

use crate::critical;
use crate::startup::with_proc_table;

/// A moment in kernel time. One unit is one tick of the scheduler timer,
/// roughly 3.1 ms; the counter wraps after about five months, which
/// outlives any bench session this machine sees.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Default)]
pub struct Timestamp(pub u32);

/// Reads the current kernel time. Callable from process context; the
/// dispatcher advances the counter on every tick.
pub fn now() -> Timestamp {
    critical::with(|| with_proc_table(|table| Timestamp(table.ticks())))
}

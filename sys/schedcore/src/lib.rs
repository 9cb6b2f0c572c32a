// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Pure scheduling and integrity logic, factored out of the kernel.
//!
//! Nothing in this crate touches hardware or kernel globals: the strategies
//! are functions over a slice of slots plus explicit private state, and the
//! checksum is a function over bytes. That keeps the decision logic
//! testable on the host with `std` while the kernel stays `no_std` on the
//! target.

// Allow std-y things to be used in test. Note that this attribute is a bit of
// a trap for the programmer, because rust-analyzer by default seems to build
// things with test set. This means it's easy to introduce code incompatible
// with no_std without your editor hassling you about it. Beware.
#![cfg_attr(not(test), no_std)]

mod checksum;
mod strategy;

pub use checksum::fold_bytes;
pub use strategy::{next, ProcSlot, StrategyState};
pub use strategy::{
    select_even, select_inactive_aging, select_random, select_round_robin,
    select_run_to_completion,
};

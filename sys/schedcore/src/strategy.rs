// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The scheduling strategies.
//!
//! Each strategy is a function from `(slots, current, private state)` to the
//! pid that should run next. Strategies never mutate process state; the only
//! thing they may touch is their own accounting in [`StrategyState`]. The
//! idle slot (0) is selected exactly when no other slot is runnable.
//!
//! The strategy set is closed, so dispatch is a `match` on the
//! [`Strategy`] tag rather than anything dynamic.

use abi::{Age, Pid, Priority, Strategy, RANDOM_SEED};
use rand::rngs::SmallRng;
use rand::{RngCore, SeedableRng};

/// The slice of a process slot the strategies are allowed to see.
///
/// The kernel's process record implements this; tests implement it on a
/// two-field scratch type.
pub trait ProcSlot {
    fn is_runnable(&self) -> bool;
    fn priority(&self) -> Priority;
}

/// Private per-slot accounting, owned by whoever owns the strategy choice.
///
/// Opaque to the dispatcher: it hands the state to [`next`] and otherwise
/// leaves it alone.
pub struct StrategyState {
    /// Remaining Round-Robin time slice per slot, in ticks.
    slices: [u8; abi::MAX_PROCESSES],
    /// Inactive-Aging age per slot.
    ages: [Age; abi::MAX_PROCESSES],
    /// Generator for the Random strategy, seeded lazily so the state has a
    /// `const` initializer.
    rng: Option<SmallRng>,
}

impl StrategyState {
    pub const INIT: Self = Self {
        slices: [0; abi::MAX_PROCESSES],
        ages: [0; abi::MAX_PROCESSES],
        rng: None,
    };

    pub fn new() -> Self {
        Self::INIT
    }

    /// Clears the accounting of one slot, called when a process is placed
    /// into it.
    pub fn reset_slot(&mut self, pid: Pid, priority: Priority) {
        self.ages[pid.index()] = 0;
        self.slices[pid.index()] = priority.0;
    }

    /// Clears all accounting for a newly selected strategy and reseeds the
    /// generator, so a strategy change always starts from the same
    /// reproducible state.
    pub fn reset_all<P: ProcSlot>(&mut self, procs: &[P]) {
        for (i, p) in procs.iter().enumerate() {
            self.ages[i] = 0;
            self.slices[i] = p.priority().0;
        }
        self.rng = Some(SmallRng::seed_from_u64(RANDOM_SEED));
    }

    fn rng(&mut self) -> &mut SmallRng {
        self.rng
            .get_or_insert_with(|| SmallRng::seed_from_u64(RANDOM_SEED))
    }
}

impl Default for StrategyState {
    fn default() -> Self {
        Self::new()
    }
}

/// Selects the next runnable pid under `strategy`.
pub fn next<P: ProcSlot>(
    strategy: Strategy,
    procs: &[P],
    current: Pid,
    state: &mut StrategyState,
) -> Pid {
    match strategy {
        Strategy::Even => select_even(procs, current),
        Strategy::Random => select_random(procs, state),
        Strategy::RunToCompletion => select_run_to_completion(procs, current),
        Strategy::RoundRobin => select_round_robin(procs, current, state),
        Strategy::InactiveAging => select_inactive_aging(procs, current, state),
    }
}

/// Visits the non-idle slots in increasing pid order starting just after
/// `current`, wrapping around so `current` itself is visited last.
fn wrapping_order(current: Pid, len: usize) -> impl Iterator<Item = usize> {
    let cur = current.index().min(len - 1);
    (cur + 1..len).chain(1..=cur)
}

/// Even: rotate through the runnable non-idle slots in pid order, ignoring
/// priority.
pub fn select_even<P: ProcSlot>(procs: &[P], current: Pid) -> Pid {
    for i in wrapping_order(current, procs.len()) {
        if procs[i].is_runnable() {
            return Pid::from_index(i);
        }
    }
    Pid::IDLE
}

/// Random: uniform draw over the runnable non-idle slots.
pub fn select_random<P: ProcSlot>(procs: &[P], state: &mut StrategyState) -> Pid {
    let runnable = |(_, p): &(usize, &P)| p.is_runnable();
    let count = procs.iter().enumerate().skip(1).filter(runnable).count();
    if count == 0 {
        return Pid::IDLE;
    }
    let k = state.rng().next_u32() as usize % count;
    match procs.iter().enumerate().skip(1).filter(runnable).nth(k) {
        Some((i, _)) => Pid::from_index(i),
        None => Pid::IDLE,
    }
}

/// Round-Robin: the current process keeps the CPU while its time slice
/// lasts, then the rotation advances in Even order and the newcomer is
/// granted a slice equal to its priority. Each slot therefore owns exactly
/// `priority` consecutive ticks.
pub fn select_round_robin<P: ProcSlot>(
    procs: &[P],
    current: Pid,
    state: &mut StrategyState,
) -> Pid {
    let cur = current.index().min(procs.len() - 1);
    if cur != 0 && procs[cur].is_runnable() {
        let left = state.slices[cur].saturating_sub(1);
        state.slices[cur] = left;
        if left > 0 {
            return Pid::from_index(cur);
        }
    }
    let chosen = select_even(procs, current);
    state.slices[chosen.index()] = procs[chosen.index()].priority().0;
    chosen
}

/// Inactive-Aging: every runnable slot except the current one ages by its
/// priority, the oldest slot wins (smaller pid on ties), and the winner's
/// age restarts at its priority.
pub fn select_inactive_aging<P: ProcSlot>(
    procs: &[P],
    current: Pid,
    state: &mut StrategyState,
) -> Pid {
    let cur = current.index();
    for (i, p) in procs.iter().enumerate().skip(1) {
        if i != cur && p.is_runnable() {
            state.ages[i] = state.ages[i].saturating_add(Age::from(p.priority().0));
        }
    }

    let mut choice: Option<usize> = None;
    for (i, p) in procs.iter().enumerate().skip(1) {
        if !p.is_runnable() {
            continue;
        }
        match choice {
            Some(best) if state.ages[i] <= state.ages[best] => {}
            _ => choice = Some(i),
        }
    }

    match choice {
        Some(i) => {
            state.ages[i] = Age::from(procs[i].priority().0);
            Pid::from_index(i)
        }
        None => Pid::IDLE,
    }
}

/// Run-To-Completion: the current process keeps the CPU for as long as it is
/// runnable; once it is not, the lowest-pid runnable non-idle slot takes
/// over.
pub fn select_run_to_completion<P: ProcSlot>(procs: &[P], current: Pid) -> Pid {
    let cur = current.index();
    if cur != 0 && cur < procs.len() && procs[cur].is_runnable() {
        return current;
    }
    for (i, p) in procs.iter().enumerate().skip(1) {
        if p.is_runnable() {
            return Pid::from_index(i);
        }
    }
    Pid::IDLE
}

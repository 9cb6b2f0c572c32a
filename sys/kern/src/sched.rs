// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Scheduling: the process lifecycle, the strategy surface, and the tick
//! dispatcher.
//!
//! The functions that take a `&mut ProcessTable` are the real
//! implementations; the thin wrappers around them bracket the singleton
//! table in a critical section and are what user programs call. The
//! dispatcher enters through [`preempt`], from the tick vector, with
//! interrupts already disabled.

use abi::{
    ExecError, FatalError, Pid, Priority, ProcState, Program, StackChecksum, StackPtr, Strategy,
    DEFAULT_PRIORITY, MAX_PROCESSES,
};

use crate::autostart::{self, AutostartNode};
use crate::proctab::ProcessTable;
use crate::startup::with_proc_table;
use crate::{arch, critical, fail};

/// The idle program: an endless no-op loop that owns the CPU whenever no
/// other process wants it. Always occupies slot 0.
pub fn idle() -> ! {
    loop {
        core::hint::spin_loop();
    }
}

/// Registers `program` for execution with the given priority.
///
/// The lowest unused slot is claimed, a boot frame is synthesized on its
/// stack, and the slot becomes `Ready`; the pid is returned. Multitasking
/// safe: programs can spawn programs.
pub fn exec(program: Program, priority: Priority) -> Result<Pid, ExecError> {
    critical::with(|| with_proc_table(|table| exec_in(table, program, priority)))
}

/// Table-level `exec`. Callers hold a critical section or are the
/// dispatcher.
pub fn exec_in(
    table: &mut ProcessTable,
    program: Program,
    priority: Priority,
) -> Result<Pid, ExecError> {
    if program as usize == 0 {
        return Err(ExecError::NullProgram);
    }
    let pid = (0..MAX_PROCESSES)
        .map(Pid::from_index)
        .find(|&pid| table.slot(pid).state() == ProcState::Unused)
        .ok_or(ExecError::NoFreeSlot)?;
    table.place(pid, program, priority);
    Ok(pid)
}

/// Retires the process in `pid`'s slot. Returns `false` for the idle slot,
/// an invalid pid, or an already-empty slot.
///
/// A process may kill itself; the call then parks until the next tick
/// switches away for good, and never returns.
pub fn kill(pid: Pid) -> bool {
    let killed = critical::with(|| {
        with_proc_table(|table| {
            if !pid.is_valid() || pid.is_idle() || table.slot(pid).state() == ProcState::Unused {
                return None;
            }
            table.retire(pid);
            Some(table.current() == pid)
        })
    });
    match killed {
        None => false,
        Some(false) => true,
        // Our own slot is gone; hold still until the dispatcher notices.
        Some(true) => arch::park_until_preempted(),
    }
}

/// Ends the calling process.
pub fn exit() -> ! {
    kill(current_pid());
    // Only reachable if the slot refused to die (i.e. we are idle).
    arch::park_until_preempted()
}

/// Parks `pid` until [`unblock`]. A blocked process keeps the CPU until the
/// next tick if it happens to be running, but is skipped by every strategy
/// afterwards.
pub fn block(pid: Pid) -> bool {
    set_state_if(pid, ProcState::Blocked, |s| s.is_runnable())
}

/// Releases a process parked by [`block`].
pub fn unblock(pid: Pid) -> bool {
    set_state_if(pid, ProcState::Ready, |s| s == ProcState::Blocked)
}

fn set_state_if(pid: Pid, to: ProcState, accept_from: impl Fn(ProcState) -> bool) -> bool {
    if !pid.is_valid() {
        return false;
    }
    critical::with(|| {
        with_proc_table(|table| {
            let state = table.slot(pid).state();
            if accept_from(state) {
                table.slot_mut(pid).set_state(to);
                true
            } else {
                false
            }
        })
    })
}

/// The pid of the process that owns the CPU.
pub fn current_pid() -> Pid {
    critical::with(|| with_proc_table(|table| table.current()))
}

/// A copy of `pid`'s record, for status displays.
pub fn get_slot(pid: Pid) -> Option<crate::proctab::Process> {
    if !pid.is_valid() {
        return None;
    }
    Some(critical::with(|| with_proc_table(|table| *table.slot(pid))))
}

/// Changes the priority of a live process.
pub fn set_priority(pid: Pid, priority: Priority) -> bool {
    if !pid.is_valid() {
        return false;
    }
    critical::with(|| {
        with_proc_table(|table| {
            if table.slot(pid).state() == ProcState::Unused {
                return false;
            }
            table.slot_mut(pid).set_priority(priority);
            true
        })
    })
}

pub fn get_strategy() -> Strategy {
    critical::with(|| with_proc_table(|table| table.strategy()))
}

/// Selects the scheduling strategy and resets its per-slot accounting.
pub fn set_strategy(strategy: Strategy) {
    critical::with(|| with_proc_table(|table| table.set_strategy(strategy)));
}

/// Recomputes the live-stack fold of `pid` right now.
pub fn stack_checksum(pid: Pid) -> Option<StackChecksum> {
    if !pid.is_valid() {
        return None;
    }
    critical::with(|| {
        with_proc_table(|table| {
            if table.slot(pid).state() == ProcState::Unused {
                None
            } else {
                Some(table.stack_checksum(pid))
            }
        })
    })
}

/// Whether the task-manager UI is on screen. The menu subsystem maintains
/// the flag; the kernel only stores it.
pub fn is_taskmanager_open() -> bool {
    critical::with(|| with_proc_table(|table| table.taskman_open()))
}

pub fn set_taskmanager_open(open: bool) {
    critical::with(|| with_proc_table(|table| table.set_taskman_open(open)));
}

/// Readies the scheduler: clears every slot, places the idle program in
/// slot 0, walks the autostart chain in order, and selects the Even
/// strategy. Runs before interrupts are enabled, so no critical section.
pub fn init_scheduler(table: &mut ProcessTable, head: Option<&'static AutostartNode>) {
    table.clear();
    let idle_pid = exec_in(table, idle, DEFAULT_PRIORITY);
    uassert!(idle_pid == Ok(Pid::IDLE));
    for node in autostart::iter(head) {
        // A chain longer than the table quietly stops filling; the boot
        // display is the place to complain, not the scheduler.
        let _ = exec_in(table, node.program, DEFAULT_PRIORITY);
    }
    table.set_strategy(Strategy::Even);
}

/// Arms the tick timer and transfers the CPU to the idle process by
/// consuming its prepared boot frame. The boot thread's context is
/// abandoned; from here on, every instruction belongs to a process chosen
/// by the dispatcher.
pub fn start_scheduler() -> ! {
    let sp = with_proc_table(|table| {
        uassert!(table.slot(Pid::IDLE).state() == ProcState::Ready);
        table.set_current(Pid::IDLE);
        table.slot_mut(Pid::IDLE).set_state(ProcState::Running);
        uassert_eq!(
            table.stack_checksum(Pid::IDLE),
            table.slot(Pid::IDLE).checksum()
        );
        table.slot(Pid::IDLE).sp()
    });
    arch::arm_tick_timer();
    arch::resume_first(sp)
}

/// The Rust half of the tick vector: context is saved, we are on the
/// dispatcher stack, interrupts are disabled. Returns the stack pointer to
/// restore from.
pub fn preempt(old_sp: StackPtr) -> StackPtr {
    with_proc_table(|table| dispatch_in(table, old_sp))
}

/// One scheduling decision over an explicit table.
///
/// Suspends the outgoing process (stack pointer and checksum recorded,
/// `Running` demoted to `Ready`), asks the strategy for a successor, and
/// validates the successor's stack before handing its pointer back for the
/// context restore.
pub fn dispatch_in(table: &mut ProcessTable, old_sp: StackPtr) -> StackPtr {
    table.tick_elapsed();

    if let Err(err) = table.validate() {
        fail::fatal(err);
        if !table.current().is_valid() {
            // Whatever was running is unrecoverable; restart the rotation
            // from idle.
            table.set_current(Pid::IDLE);
        }
    }

    let current = table.current();
    // A slot that went Unused under us is a process that retired itself;
    // there is nothing to save.
    if table.slot(current).state() != ProcState::Unused {
        if !table.stack_region(current).contains(old_sp.addr()) {
            fail::fatal(FatalError::InvalidStackPointer(current));
            // The saved context is lost; the slot cannot run again.
            table.retire(current);
        } else {
            table.slot_mut(current).set_sp(old_sp);
            let sum = table.stack_checksum(current);
            table.slot_mut(current).set_checksum(sum);
            if table.slot(current).state() == ProcState::Running {
                table.slot_mut(current).set_state(ProcState::Ready);
            }
        }
    }

    let next = table.pick_next();
    table.set_current(next);
    table.slot_mut(next).set_state(ProcState::Running);

    if table.stack_checksum(next) != table.slot(next).checksum() {
        fail::fatal(FatalError::StackChecksumViolation(next));
    }
    let sp = table.slot(next).sp();
    if !table.stack_region(next).contains(sp.addr()) {
        fail::fatal(FatalError::InvalidStackPointer(next));
    }
    sp
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support;
    use abi::BOOT_FRAME_SIZE;

    fn looper() -> ! {
        loop {
            core::hint::spin_loop();
        }
    }

    fn looper_b() -> ! {
        loop {
            core::hint::spin_loop();
        }
    }

    /// A table initialized like the real one: idle in slot 0 plus `extra`
    /// programs at the given priorities, with pid 1 running.
    ///
    /// Boxed so the table's address (and therefore the absolute stack
    /// pointers `place` records into it) stays stable once this helper
    /// returns; a plain by-value return would move the inline stack arena.
    fn running_table(extra: &[u8]) -> Box<ProcessTable> {
        let mut table = Box::new(ProcessTable::new());
        init_scheduler(&mut table, None);
        for &priority in extra {
            exec_in(&mut table, looper, Priority(priority)).unwrap();
        }
        if !extra.is_empty() {
            table.set_current(Pid(1));
            table.slot_mut(Pid(1)).set_state(ProcState::Running);
        } else {
            table.slot_mut(Pid::IDLE).set_state(ProcState::Running);
        }
        table
    }

    /// Fakes one tick: hands the dispatcher the current process's stored
    /// stack pointer, exactly what the vector would pass after pushing
    /// context at the same spot it was last resumed from.
    fn tick(table: &mut ProcessTable) -> Pid {
        let old_sp = table.slot(table.current()).sp();
        let sp = dispatch_in(table, old_sp);
        assert_eq!(sp, table.slot(table.current()).sp());
        table.current()
    }

    #[test]
    fn exec_claims_slots_in_increasing_order() {
        let _guard = test_support::fresh();
        let mut table = ProcessTable::new();
        for expected in 0..MAX_PROCESSES {
            let pid = exec_in(&mut table, looper, DEFAULT_PRIORITY).unwrap();
            assert_eq!(pid, Pid::from_index(expected));
        }
        assert_eq!(
            exec_in(&mut table, looper, DEFAULT_PRIORITY),
            Err(ExecError::NoFreeSlot)
        );
    }

    #[test]
    fn exec_fills_the_lowest_gap() {
        let _guard = test_support::fresh();
        let mut table = ProcessTable::new();
        for _ in 0..MAX_PROCESSES {
            exec_in(&mut table, looper, DEFAULT_PRIORITY).unwrap();
        }
        table.retire(Pid(2));
        assert_eq!(exec_in(&mut table, looper, Priority(2)), Ok(Pid(2)));
    }

    #[test]
    fn exec_initializes_the_record() {
        let _guard = test_support::fresh();
        let mut table = ProcessTable::new();
        let pid = exec_in(&mut table, looper, Priority(10)).unwrap();
        let slot = table.slot(pid);
        assert_eq!(slot.state(), ProcState::Ready);
        assert_eq!(slot.priority(), Priority(10));
        assert_eq!(slot.program().map(|p| p as usize), Some(looper as usize));
        let region = table.stack_region(pid);
        assert_eq!(slot.sp().addr(), region.bottom - BOOT_FRAME_SIZE);
    }

    #[test]
    fn a_full_table_leaves_the_critical_depth_untouched() {
        let _guard = test_support::fresh();
        with_proc_table(|t| *t = ProcessTable::new());
        for _ in 0..MAX_PROCESSES {
            exec(looper, DEFAULT_PRIORITY).unwrap();
        }
        assert_eq!(exec(looper, DEFAULT_PRIORITY), Err(ExecError::NoFreeSlot));
        assert_eq!(critical::depth(), 0);
        assert!(test_support::take_reports().is_empty());
    }

    #[test]
    fn init_scheduler_places_idle_then_the_chain() {
        let _guard = test_support::fresh();
        static HEAD: Option<&AutostartNode> = crate::autostart_chain!(looper, looper_b);
        let mut table = ProcessTable::new();
        init_scheduler(&mut table, HEAD);

        assert_eq!(
            table.slot(Pid::IDLE).program().map(|p| p as usize),
            Some(idle as usize)
        );
        assert_eq!(
            table.slot(Pid(1)).program().map(|p| p as usize),
            Some(looper as usize)
        );
        assert_eq!(
            table.slot(Pid(2)).program().map(|p| p as usize),
            Some(looper_b as usize)
        );
        for pid in 0..3 {
            assert_eq!(table.slot(Pid(pid)).state(), ProcState::Ready);
            assert_eq!(table.slot(Pid(pid)).priority(), DEFAULT_PRIORITY);
        }
        assert_eq!(table.slot(Pid(3)).state(), ProcState::Unused);
        assert_eq!(table.strategy(), Strategy::Even);
        assert_eq!(table.current(), Pid::IDLE);
    }

    #[test]
    fn dispatch_rotates_ready_processes_and_keeps_one_runner() {
        let _guard = test_support::fresh();
        let mut table = running_table(&[2, 2, 2]);

        let mut seq = Vec::new();
        for _ in 0..32 {
            seq.push(tick(&mut table).0);
            let running = table
                .slots()
                .iter()
                .filter(|s| s.state() == ProcState::Running)
                .count();
            assert_eq!(running, 1);
        }
        let expected: Vec<u8> = [2u8, 3, 1].iter().copied().cycle().take(32).collect();
        assert_eq!(seq, expected);
        assert_eq!(table.ticks(), 32);
        assert!(test_support::take_reports().is_empty());
    }

    #[test]
    fn dispatch_reseeds_the_outgoing_checksum() {
        let _guard = test_support::fresh();
        let mut table = running_table(&[2, 2]);
        tick(&mut table);
        // The process that just lost the CPU carries a checksum matching
        // its live stack.
        assert_eq!(table.slot(Pid(1)).state(), ProcState::Ready);
        assert_eq!(table.slot(Pid(1)).checksum(), table.stack_checksum(Pid(1)));
    }

    #[test]
    fn a_flipped_stack_bit_is_fatal_at_resume() {
        let _guard = test_support::fresh();
        let mut table = running_table(&[2, 2]);

        // Pid 2 is selected next; corrupt one byte inside its live region
        // first.
        let victim_sp = table.slot(Pid(2)).sp().addr();
        unsafe {
            *((victim_sp + 5) as *mut u8) ^= 0x10;
        }
        assert_eq!(tick(&mut table), Pid(2));
        assert_eq!(
            test_support::take_reports(),
            [FatalError::StackChecksumViolation(Pid(2))]
        );

        // The system keeps scheduling after the report is acknowledged, and
        // the next suspend of the victim reseeds its checksum.
        assert_eq!(tick(&mut table), Pid(1));
        assert!(test_support::take_reports().is_empty());
        assert_eq!(table.slot(Pid(2)).checksum(), table.stack_checksum(Pid(2)));
    }

    #[test]
    fn a_flip_outside_the_live_region_is_not_reported() {
        let _guard = test_support::fresh();
        let mut table = running_table(&[2, 2]);
        let victim_sp = table.slot(Pid(2)).sp().addr();
        // At the stack pointer itself: one past the live bytes.
        unsafe {
            *(victim_sp as *mut u8) ^= 0x10;
        }
        assert_eq!(tick(&mut table), Pid(2));
        assert!(test_support::take_reports().is_empty());
    }

    #[test]
    fn a_self_retired_slot_is_skipped_without_complaint() {
        let _guard = test_support::fresh();
        let mut table = running_table(&[2, 2]);
        let dying_checksum = table.slot(Pid(2)).checksum();
        table.retire(Pid(1));
        assert_eq!(tick(&mut table), Pid(2));
        // The dead slot was not suspended into.
        assert_eq!(table.slot(Pid(1)).state(), ProcState::Unused);
        assert_eq!(table.slot(Pid(2)).checksum(), dying_checksum);
        assert!(test_support::take_reports().is_empty());
    }

    #[test]
    fn a_blocked_process_is_passed_over_until_released() {
        let _guard = test_support::fresh();
        let mut table = running_table(&[2, 2, 2]);
        table.slot_mut(Pid(2)).set_state(ProcState::Blocked);

        for _ in 0..8 {
            assert_ne!(tick(&mut table), Pid(2));
        }

        table.slot_mut(Pid(2)).set_state(ProcState::Ready);
        let mut seen = Vec::new();
        for _ in 0..3 {
            seen.push(tick(&mut table).0);
        }
        assert!(seen.contains(&2));
    }

    #[test]
    fn idle_runs_exactly_when_nothing_else_can() {
        let _guard = test_support::fresh();
        let mut table = running_table(&[2]);
        table.slot_mut(Pid(1)).set_state(ProcState::Blocked);
        assert_eq!(tick(&mut table), Pid::IDLE);
        assert_eq!(table.slot(Pid::IDLE).state(), ProcState::Running);

        table.slot_mut(Pid(1)).set_state(ProcState::Ready);
        assert_eq!(tick(&mut table), Pid(1));
    }

    #[test]
    fn a_wild_stack_pointer_retires_the_offender() {
        let _guard = test_support::fresh();
        let mut table = running_table(&[2, 2]);
        let foreign = table.stack_region(Pid(5)).bottom;
        let next = dispatch_in(&mut table, StackPtr::new(foreign));
        assert_eq!(
            test_support::take_reports(),
            [FatalError::InvalidStackPointer(Pid(1))]
        );
        assert_eq!(table.slot(Pid(1)).state(), ProcState::Unused);
        assert_eq!(next, table.slot(Pid(2)).sp());
    }

    #[test]
    fn two_running_slots_are_reported_as_table_corruption() {
        let _guard = test_support::fresh();
        let mut table = running_table(&[2, 2]);
        table.slot_mut(Pid(2)).set_state(ProcState::Running);
        tick(&mut table);
        assert_eq!(
            test_support::take_reports(),
            [FatalError::InvalidProcessTable]
        );
    }

    #[test]
    fn round_robin_rotation_survives_the_full_dispatch_path() {
        let _guard = test_support::fresh();
        let mut table = ProcessTable::new();
        init_scheduler(&mut table, None);
        exec_in(&mut table, looper, Priority(2)).unwrap();
        exec_in(&mut table, looper, Priority(5)).unwrap();
        exec_in(&mut table, looper, Priority(10)).unwrap();
        table.set_strategy(Strategy::RoundRobin);
        table.set_current(Pid(1));
        table.slot_mut(Pid(1)).set_state(ProcState::Running);

        let mut seq = vec![1u8];
        while seq.len() < 32 {
            seq.push(tick(&mut table).0);
        }
        let expected = [
            1, 1, 2, 2, 2, 2, 2, 3, 3, 3, 3, 3, 3, 3, 3, 3, 3, //
            1, 1, 2, 2, 2, 2, 2, 3, 3, 3, 3, 3, 3, 3, 3,
        ];
        assert_eq!(seq, expected);
    }

    #[test]
    fn public_api_round_trips_through_the_singleton() {
        let _guard = test_support::fresh();
        with_proc_table(|t| *t = ProcessTable::new());
        with_proc_table(|t| init_scheduler(t, None));

        assert_eq!(current_pid(), Pid::IDLE);
        assert_eq!(get_strategy(), Strategy::Even);
        set_strategy(Strategy::InactiveAging);
        assert_eq!(get_strategy(), Strategy::InactiveAging);

        assert!(!is_taskmanager_open());
        set_taskmanager_open(true);
        assert!(is_taskmanager_open());
        set_taskmanager_open(false);

        let pid = exec(looper, Priority(7)).unwrap();
        assert_eq!(pid, Pid(1));
        let slot = get_slot(pid).unwrap();
        assert_eq!(slot.priority(), Priority(7));
        assert_eq!(stack_checksum(pid), Some(slot.checksum()));
        assert!(get_slot(Pid::INVALID).is_none());
        assert_eq!(stack_checksum(Pid(6)), None);

        assert!(set_priority(pid, Priority(9)));
        assert_eq!(get_slot(pid).unwrap().priority(), Priority(9));

        assert!(block(pid));
        assert_eq!(get_slot(pid).unwrap().state(), ProcState::Blocked);
        assert!(!block(pid));
        assert!(unblock(pid));
        assert_eq!(get_slot(pid).unwrap().state(), ProcState::Ready);

        assert!(kill(pid));
        assert_eq!(get_slot(pid).unwrap().state(), ProcState::Unused);
        assert!(!kill(pid));
        assert!(!kill(Pid::IDLE));

        assert_eq!(critical::depth(), 0);
        assert!(test_support::take_reports().is_empty());
    }
}

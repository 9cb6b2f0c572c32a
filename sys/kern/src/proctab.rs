// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The process table: one record per slot, the stacks behind them, and the
//! bookkeeping the dispatcher relies on.
//!
//! The fields of [`Process`] are private to this module so the table can
//! maintain its invariants: outside of a context switch exactly one slot is
//! `Running`, every used slot's saved stack pointer lies inside that slot's
//! stack region, and every suspended slot's checksum matches its live stack
//! bytes. Mutation goes through the methods here, from inside a critical
//! section or the dispatcher.

use byteorder::{BigEndian, ByteOrder};
use core::cell::UnsafeCell;
use zerocopy::IntoBytes;
use zerocopy_derive::{Immutable, IntoBytes};

use abi::{
    FatalError, Pid, Priority, ProcState, Program, StackChecksum, StackPtr, Strategy,
    BOOT_FRAME_SIZE, CONTEXT_SIZE, MAX_PROCESSES, STACK_SIZE_PROC,
};
use schedcore::{fold_bytes, ProcSlot, StrategyState};

use crate::arch;

/// Internal representation of a process.
#[derive(Copy, Clone, Debug)]
pub struct Process {
    /// Lifecycle state used for status and scheduling decisions.
    state: ProcState,
    /// Entry point of the program occupying this slot.
    program: Option<Program>,
    /// Scheduling priority, honored by the strategies that look at it.
    priority: Priority,
    /// Stack pointer recorded at the last suspend (or synthesized at exec).
    sp: StackPtr,
    /// Fold of the live stack bytes recorded at the last suspend.
    checksum: StackChecksum,
}

impl Process {
    const UNUSED: Self = Self {
        state: ProcState::Unused,
        program: None,
        priority: Priority(0),
        sp: StackPtr::NULL,
        checksum: 0,
    };

    pub fn state(&self) -> ProcState {
        self.state
    }

    pub fn program(&self) -> Option<Program> {
        self.program
    }

    pub fn priority(&self) -> Priority {
        self.priority
    }

    pub fn sp(&self) -> StackPtr {
        self.sp
    }

    pub fn checksum(&self) -> StackChecksum {
        self.checksum
    }

    /// Checks if this process is in a potentially schedulable state.
    pub fn is_runnable(&self) -> bool {
        self.state.is_runnable()
    }

    pub(crate) fn set_state(&mut self, state: ProcState) {
        self.state = state;
    }

    pub(crate) fn set_priority(&mut self, priority: Priority) {
        self.priority = priority;
    }

    pub(crate) fn set_sp(&mut self, sp: StackPtr) {
        self.sp = sp;
    }

    pub(crate) fn set_checksum(&mut self, checksum: StackChecksum) {
        self.checksum = checksum;
    }
}

impl ProcSlot for Process {
    fn is_runnable(&self) -> bool {
        Process::is_runnable(self)
    }

    fn priority(&self) -> Priority {
        self.priority
    }
}

/// Byte range `[top, bottom]` of one process stack, both ends inclusive.
/// The stack grows from `bottom` toward `top`.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct StackRegion {
    pub top: usize,
    pub bottom: usize,
}

impl StackRegion {
    pub fn contains(&self, addr: usize) -> bool {
        self.top <= addr && addr <= self.bottom
    }
}

/// Backing storage for all process stacks, carved into pairwise disjoint
/// per-slot regions. Keeping it inside the table (instead of at fixed RAM
/// addresses) lets the linker place it and keeps it disjoint from the boot
/// and dispatcher stacks by construction.
#[repr(transparent)]
struct StackArena(UnsafeCell<[u8; MAX_PROCESSES * STACK_SIZE_PROC]>);

/// The frame synthesized for a fresh process, so that its first resume is
/// indistinguishable from resuming after preemption: a zeroed register
/// context (32 registers plus the status byte, in exactly the order the
/// restore sequence pops them) on top of the entry address in
/// return-address byte order.
#[derive(IntoBytes, Immutable)]
#[repr(C)]
struct BootFrame {
    context: [u8; CONTEXT_SIZE],
    entry: [u8; 2],
}

impl BootFrame {
    fn new(entry_word: u16) -> Self {
        let mut frame = Self {
            context: [0; CONTEXT_SIZE],
            entry: [0; 2],
        };
        BigEndian::write_u16(&mut frame.entry, entry_word);
        frame
    }
}

/// The process table. The kernel owns exactly one (see `startup`), but the
/// type is self-contained on purpose: tests build scratch tables, complete
/// with stacks, and run the real lifecycle and dispatch code against them.
pub struct ProcessTable {
    slots: [Process; MAX_PROCESSES],
    /// Index of the slot owning the CPU.
    current: Pid,
    /// Active scheduling strategy.
    strategy: Strategy,
    /// The strategies' private accounting; opaque here.
    strategy_state: StrategyState,
    /// Whether the task-manager UI is on screen.
    taskman_open: bool,
    /// Ticks dispatched since the scheduler started.
    ticks: u32,
    stacks: StackArena,
}

impl ProcessTable {
    pub const fn new() -> Self {
        Self {
            slots: [Process::UNUSED; MAX_PROCESSES],
            current: Pid::IDLE,
            strategy: Strategy::Even,
            strategy_state: StrategyState::INIT,
            taskman_open: false,
            ticks: 0,
            stacks: StackArena(UnsafeCell::new([0; MAX_PROCESSES * STACK_SIZE_PROC])),
        }
    }

    pub fn slot(&self, pid: Pid) -> &Process {
        &self.slots[pid.index()]
    }

    pub(crate) fn slot_mut(&mut self, pid: Pid) -> &mut Process {
        &mut self.slots[pid.index()]
    }

    pub fn slots(&self) -> &[Process] {
        &self.slots
    }

    pub fn current(&self) -> Pid {
        self.current
    }

    pub(crate) fn set_current(&mut self, pid: Pid) {
        self.current = pid;
    }

    pub fn strategy(&self) -> Strategy {
        self.strategy
    }

    /// Switches the strategy and clears all of its per-slot accounting, so
    /// the new strategy starts from a reproducible state.
    pub(crate) fn set_strategy(&mut self, strategy: Strategy) {
        self.strategy = strategy;
        self.strategy_state.reset_all(&self.slots);
    }

    pub fn taskman_open(&self) -> bool {
        self.taskman_open
    }

    pub(crate) fn set_taskman_open(&mut self, open: bool) {
        self.taskman_open = open;
    }

    pub fn ticks(&self) -> u32 {
        self.ticks
    }

    pub(crate) fn tick_elapsed(&mut self) {
        self.ticks = self.ticks.wrapping_add(1);
    }

    /// Puts the table back into its post-reset shape. Stack contents are
    /// left alone; they are re-synthesized when a slot is filled.
    pub(crate) fn clear(&mut self) {
        for slot in &mut self.slots {
            *slot = Process::UNUSED;
        }
        self.current = Pid::IDLE;
        self.taskman_open = false;
        self.ticks = 0;
    }

    /// The stack region owned by `pid`. Slot 0 sits at the high end of the
    /// arena and successive slots stack downward beneath it, mirroring the
    /// traditional layout of the upper half of SRAM.
    pub fn stack_region(&self, pid: Pid) -> StackRegion {
        let base = self.stacks.0.get() as usize;
        let bottom = base + MAX_PROCESSES * STACK_SIZE_PROC - 1 - pid.index() * STACK_SIZE_PROC;
        StackRegion {
            top: bottom + 1 - STACK_SIZE_PROC,
            bottom,
        }
    }

    /// Folds the live stack of `pid`, the bytes from just above the saved
    /// stack pointer down to the region bottom.
    pub fn stack_checksum(&self, pid: Pid) -> StackChecksum {
        let region = self.stack_region(pid);
        let sp = self.slots[pid.index()].sp.addr();
        uassert!(region.contains(sp));
        // In-bounds per the assert above; the arena cell makes the shared
        // read sound.
        let live = unsafe { core::slice::from_raw_parts((sp + 1) as *const u8, region.bottom - sp) };
        fold_bytes(live)
    }

    /// Fills `pid`'s slot with a fresh process: record fields, cleared
    /// strategy accounting, the synthesized boot frame, and the seed
    /// checksum over it.
    pub(crate) fn place(&mut self, pid: Pid, program: Program, priority: Priority) {
        let region = self.stack_region(pid);
        let frame = BootFrame::new(arch::entry_word(program));
        let dst = (region.bottom + 1 - BOOT_FRAME_SIZE) as *mut u8;
        // The destination is the top 35 bytes of a region this table owns
        // and is about to hand to `pid`.
        unsafe {
            core::ptr::copy_nonoverlapping(frame.as_bytes().as_ptr(), dst, BOOT_FRAME_SIZE);
        }

        let slot = &mut self.slots[pid.index()];
        slot.state = ProcState::Ready;
        slot.program = Some(program);
        slot.priority = priority;
        slot.sp = StackPtr::new(region.bottom - BOOT_FRAME_SIZE);
        self.strategy_state.reset_slot(pid, priority);
        let seed = self.stack_checksum(pid);
        self.slots[pid.index()].checksum = seed;
    }

    /// Returns `pid`'s slot to the unused pool.
    pub(crate) fn retire(&mut self, pid: Pid) {
        self.slots[pid.index()] = Process::UNUSED;
        self.strategy_state.reset_slot(pid, Priority(0));
    }

    /// Asks the active strategy for the next runnable pid.
    pub(crate) fn pick_next(&mut self) -> Pid {
        schedcore::next(
            self.strategy,
            &self.slots,
            self.current,
            &mut self.strategy_state,
        )
    }

    /// Checks the shape the dispatcher depends on: at most one slot
    /// `Running` and a current index inside the table.
    pub fn validate(&self) -> Result<(), FatalError> {
        if !self.current.is_valid() {
            return Err(FatalError::InvalidProcessTable);
        }
        let running = self
            .slots
            .iter()
            .filter(|s| s.state == ProcState::Running)
            .count();
        if running > 1 {
            return Err(FatalError::InvalidProcessTable);
        }
        Ok(())
    }
}

impl Default for ProcessTable {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spin() -> ! {
        loop {
            core::hint::spin_loop();
        }
    }

    #[test]
    fn stack_regions_are_disjoint_and_descend_from_the_arena_top() {
        let table = ProcessTable::new();
        let mut previous: Option<StackRegion> = None;
        for i in 0..MAX_PROCESSES {
            let region = table.stack_region(Pid::from_index(i));
            assert_eq!(region.bottom - region.top + 1, STACK_SIZE_PROC);
            if let Some(above) = previous {
                assert_eq!(region.bottom + 1, above.top, "slot {i} not adjacent");
            }
            previous = Some(region);
        }
    }

    #[test]
    fn place_lays_down_the_boot_frame() {
        let mut table = ProcessTable::new();
        let program: Program = spin;
        table.place(Pid(0), program, Priority(10));

        let slot = table.slot(Pid(0));
        assert_eq!(slot.state(), ProcState::Ready);
        assert_eq!(slot.priority(), Priority(10));
        assert_eq!(slot.program().map(|p| p as usize), Some(program as usize));

        let region = table.stack_region(Pid(0));
        let sp = slot.sp().addr();
        assert_eq!(sp, region.bottom - BOOT_FRAME_SIZE);

        let byte_at = |addr: usize| unsafe { *(addr as *const u8) };
        for offset in 1..=CONTEXT_SIZE {
            assert_eq!(byte_at(sp + offset), 0, "context byte {offset} not zero");
        }
        let entry = arch::entry_word(program);
        assert_eq!(byte_at(sp + 34), (entry >> 8) as u8);
        assert_eq!(byte_at(sp + 35), (entry & 0xff) as u8);

        assert_eq!(slot.checksum(), table.stack_checksum(Pid(0)));
    }

    #[test]
    fn place_leaves_the_neighbor_region_alone() {
        let mut table = ProcessTable::new();
        table.place(Pid(0), spin as Program, Priority(2));
        let neighbor = table.stack_region(Pid(1));
        for addr in neighbor.top..=neighbor.bottom {
            assert_eq!(unsafe { *(addr as *const u8) }, 0);
        }
    }

    #[test]
    fn checksum_sees_flips_in_the_live_region_only() {
        let mut table = ProcessTable::new();
        table.place(Pid(2), spin as Program, Priority(2));
        let recorded = table.slot(Pid(2)).checksum();
        let region = table.stack_region(Pid(2));
        let sp = table.slot(Pid(2)).sp().addr();

        let flip = |addr: usize, bit: u8| unsafe {
            let p = addr as *mut u8;
            *p ^= 1 << bit;
        };

        // Any single flip between sp+1 and the region bottom is caught.
        for (addr, bit) in [
            (sp + 1, 0),
            (sp + 1, 7),
            (sp + 17, 3),
            (region.bottom, 0),
            (region.bottom, 7),
        ] {
            flip(addr, bit);
            assert_ne!(table.stack_checksum(Pid(2)), recorded);
            flip(addr, bit); // restore
            assert_eq!(table.stack_checksum(Pid(2)), recorded);
        }

        // Flips at or below the stack pointer are dead bytes.
        flip(sp, 4);
        assert_eq!(table.stack_checksum(Pid(2)), recorded);
        flip(region.top, 1);
        assert_eq!(table.stack_checksum(Pid(2)), recorded);

        // Flips in a neighbor's region never show up here.
        let neighbor = table.stack_region(Pid(3));
        flip(neighbor.bottom, 2);
        assert_eq!(table.stack_checksum(Pid(2)), recorded);
    }

    #[test]
    fn validate_rejects_two_runners_and_a_wild_current() {
        let mut table = ProcessTable::new();
        table.place(Pid(0), spin as Program, Priority(2));
        table.place(Pid(1), spin as Program, Priority(2));
        assert_eq!(table.validate(), Ok(()));

        table.slot_mut(Pid(0)).set_state(ProcState::Running);
        table.slot_mut(Pid(1)).set_state(ProcState::Running);
        assert_eq!(table.validate(), Err(FatalError::InvalidProcessTable));

        table.slot_mut(Pid(1)).set_state(ProcState::Ready);
        assert_eq!(table.validate(), Ok(()));

        table.set_current(Pid::INVALID);
        assert_eq!(table.validate(), Err(FatalError::InvalidProcessTable));
    }

    #[test]
    fn retire_clears_the_record() {
        let mut table = ProcessTable::new();
        table.place(Pid(4), spin as Program, Priority(9));
        table.retire(Pid(4));
        let slot = table.slot(Pid(4));
        assert_eq!(slot.state(), ProcState::Unused);
        assert!(slot.program().is_none());
    }
}

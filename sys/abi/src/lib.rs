// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Kernel ABI definitions, shared between the kernel and application code.

#![cfg_attr(not(test), no_std)]

use zerocopy_derive::{FromBytes, Immutable, IntoBytes, Unaligned};

/// Maximum number of process slots, idle included. The menu UI packs slot
/// occupancy into a single byte, so this must not exceed 8.
pub const MAX_PROCESSES: usize = 8;
const _: () = assert!(MAX_PROCESSES <= 8);

/// Priority assigned to processes started without an explicit one (idle and
/// the autostart programs).
pub const DEFAULT_PRIORITY: Priority = Priority(2);

/// Total SRAM of the ATmega644.
pub const SRAM_SIZE: usize = 4096;

/// Bytes reserved for global initialization before the scheduler owns the
/// machine.
pub const STACK_SIZE_MAIN: usize = 32;

/// Bytes reserved for the dispatcher's own stack.
pub const STACK_SIZE_ISR: usize = 192;

/// Bytes of stack owned by each process. Half the SRAM, minus the boot and
/// dispatcher stacks, split evenly.
pub const STACK_SIZE_PROC: usize =
    ((SRAM_SIZE / 2) - STACK_SIZE_MAIN - STACK_SIZE_ISR) / MAX_PROCESSES;

/// Bytes of machine context saved on a process stack at preemption: the 32
/// general registers plus the status register.
pub const CONTEXT_SIZE: usize = 33;

/// Bytes of the synthesized frame a fresh process starts from: the saved
/// context plus the two-byte entry address underneath it.
pub const BOOT_FRAME_SIZE: usize = CONTEXT_SIZE + 2;

/// Tick timer prescaler. Together with [`TICK_COMPARE`] this yields a tick
/// period of roughly 3.1 ms at 20 MHz.
pub const TICK_PRESCALER: u16 = 1024;

/// Tick timer compare value.
pub const TICK_COMPARE: u8 = 60;

/// Seed for the Random strategy's generator, fixed so schedules are
/// reproducible.
pub const RANDOM_SEED: u64 = 1;

/// The type of a program entry point.
///
/// Programs never return; a process that wants to end itself asks the
/// scheduler to retire its slot.
pub type Program = fn() -> !;

/// Scheduler-private aging counter, large enough to accumulate many
/// priority-sized increments between selections.
pub type Age = u16;

/// Single-byte fold over a process's live stack bytes.
pub type StackChecksum = u8;

/// Identifies a process slot.
///
/// Valid slots are `0..MAX_PROCESSES`; slot 0 is always the idle process.
/// The reserved value [`Pid::INVALID`] is returned where C APIs would return
/// an error sentinel, e.g. to the menu UI.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
#[repr(transparent)]
pub struct Pid(pub u8);

impl Pid {
    /// The idle slot.
    pub const IDLE: Self = Self(0);

    /// Reserved sentinel for "no such process."
    pub const INVALID: Self = Self(255);

    pub const fn from_index(index: usize) -> Self {
        Self(index as u8)
    }

    pub const fn index(self) -> usize {
        self.0 as usize
    }

    pub const fn is_idle(self) -> bool {
        self.0 == 0
    }

    pub const fn is_valid(self) -> bool {
        (self.0 as usize) < MAX_PROCESSES
    }
}

/// Indicates the importance of a process to the strategies that honor it.
///
/// 0 is least favourable, 255 most favourable. This type deliberately does
/// not implement `PartialOrd`/`Ord`: comparing raw priorities invites
/// confusion about which end of the scale wins, so use
/// [`Priority::is_more_important_than`].
#[derive(
    Copy, Clone, Debug, Eq, PartialEq, FromBytes, IntoBytes, Immutable, Unaligned, Default,
)]
#[repr(transparent)]
pub struct Priority(pub u8);

impl Priority {
    /// Checks if `self` is strictly more important than `other`.
    pub fn is_more_important_than(self, other: Self) -> bool {
        self.0 > other.0
    }
}

/// State of a process slot.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Default)]
#[repr(u8)]
pub enum ProcState {
    /// Slot holds no process.
    #[default]
    Unused = 0,
    /// Process can be selected to run.
    Ready,
    /// Process owns the CPU right now. Exactly one slot is in this state
    /// whenever the dispatcher is quiescent.
    Running,
    /// Process is parked by some external subsystem and will not be selected
    /// until it is released.
    Blocked,
}

impl ProcState {
    /// Whether a process in this state may be handed the CPU.
    pub fn is_runnable(self) -> bool {
        matches!(self, ProcState::Ready | ProcState::Running)
    }
}

/// Selectable scheduling strategies.
///
/// The discriminants are wire-stable: the menu UI stores and transmits them
/// as raw bytes.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Default)]
#[repr(u8)]
pub enum Strategy {
    #[default]
    Even = 0,
    Random = 1,
    RunToCompletion = 2,
    RoundRobin = 3,
    InactiveAging = 4,
}

impl Strategy {
    /// Every strategy, in wire order.
    pub const ALL: [Self; 5] = [
        Self::Even,
        Self::Random,
        Self::RunToCompletion,
        Self::RoundRobin,
        Self::InactiveAging,
    ];

    pub const fn from_u8(raw: u8) -> Option<Self> {
        match raw {
            0 => Some(Self::Even),
            1 => Some(Self::Random),
            2 => Some(Self::RunToCompletion),
            3 => Some(Self::RoundRobin),
            4 => Some(Self::InactiveAging),
            _ => None,
        }
    }

    pub const fn as_u8(self) -> u8 {
        self as u8
    }
}

/// A process's saved stack pointer.
///
/// The dispatcher needs this both as an address to load into the CPU stack
/// pointer and as a byte pointer for walking the live stack; both views are
/// bit-identical, so it is one value with two accessors.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[repr(transparent)]
pub struct StackPtr(usize);

impl StackPtr {
    pub const NULL: Self = Self(0);

    pub const fn new(addr: usize) -> Self {
        Self(addr)
    }

    /// The address of the most recently pushed byte, minus one.
    pub const fn addr(self) -> usize {
        self.0
    }

    pub const fn as_mut_ptr(self) -> *mut u8 {
        self.0 as *mut u8
    }
}

/// Unrecoverable conditions, reported to the user through the registered
/// error hook.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum FatalError {
    /// A critical section was entered with the nesting counter already
    /// saturated.
    CriticalSectionOverflow,
    /// A critical section was left that was never entered.
    CriticalSectionUnderflow,
    /// A process's live stack no longer matches the checksum recorded at its
    /// last suspend.
    StackChecksumViolation(Pid),
    /// The process table lost its shape: more than one slot Running, or the
    /// current index out of range.
    InvalidProcessTable,
    /// A saved stack pointer points outside its process's stack region.
    InvalidStackPointer(Pid),
}

impl FatalError {
    /// Short fixed text for the two-line character panel.
    pub fn message(&self) -> &'static str {
        match self {
            Self::CriticalSectionOverflow => "CRITICAL NESTING OVERFLOW",
            Self::CriticalSectionUnderflow => "CRITICAL NESTING UNDERFLOW",
            Self::StackChecksumViolation(_) => "STACK CHECKSUM MISMATCH",
            Self::InvalidProcessTable => "PROCESS TABLE CORRUPT",
            Self::InvalidStackPointer(_) => "STACK POINTER OUT OF RANGE",
        }
    }

    /// The slot the error is attributed to, where one is known.
    pub fn pid(&self) -> Option<Pid> {
        match self {
            Self::StackChecksumViolation(pid) | Self::InvalidStackPointer(pid) => Some(*pid),
            _ => None,
        }
    }
}

impl core::fmt::Display for FatalError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.message())?;
        if let Some(pid) = self.pid() {
            write!(f, " P{}", pid.0)?;
        }
        Ok(())
    }
}

/// Recoverable failures of process creation, surfaced to the caller.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum ExecError {
    /// The entry address was null (only reachable through corrupted
    /// pointers; the type system rules it out in safe code).
    NullProgram,
    /// Every slot is occupied.
    NoFreeSlot,
}

bitflags::bitflags! {
    /// Bitmask of the four panel buttons, as reported by the input driver.
    #[derive(Copy, Clone, Debug, Eq, PartialEq)]
    pub struct Buttons: u8 {
        const ENTER = 1 << 0;
        const DOWN = 1 << 1;
        const UP = 1 << 2;
        const ESCAPE = 1 << 3;
    }
}

impl Buttons {
    /// The chord that acknowledges a fatal error report.
    pub const ACKNOWLEDGE: Self = Self::ENTER.union(Self::ESCAPE);
}

/// Contract of the 2x16 character panel the kernel's error hook writes to.
/// The driver lives outside the kernel.
pub trait CharSink {
    fn write_char(&mut self, c: u8);
    fn clear(&mut self);
    /// Move the cursor; lines and columns count from zero.
    fn cursor_to(&mut self, line: u8, col: u8);

    fn write_msg(&mut self, msg: &str) {
        for &c in msg.as_bytes() {
            self.write_char(c);
        }
    }
}

/// Contract of the debounced button driver.
pub trait InputPad {
    /// Bitmask of the buttons currently held.
    fn pressed(&mut self) -> Buttons;
    /// Blocks until at least one button is pressed; returns the mask.
    fn wait_for_input(&mut self) -> Buttons;
    /// Blocks until no button is pressed.
    fn wait_for_release(&mut self);
}

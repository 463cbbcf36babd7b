// Copyright 2023 Adam Greig
// Licensed under the Apache-2.0 and MIT licenses.

//! mdrflash
//!
//! Programming engine for the on-chip flash controller found in Milandr
//! MDR32Fx, MDR32F02 and MDR1206 microcontrollers.
//!
//! The controller is driven entirely through memory-mapped registers, so all
//! access goes through a [`Target`] implementation which provides register
//! reads and writes, working-area RAM, and the ability to run a small write
//! routine on the target CPU. [`FlashBank`] is the entry point: declare a bank,
//! `probe()` it, then `erase()`, `write()` and `read()` it.
//!
//! An in-memory [`Emulator`] of the controller implements [`Target`] for
//! testing and dry runs.

pub mod target;
pub mod controller;
pub mod profile;
pub mod sequencer;
pub mod working_area;
pub mod strategy;
pub mod bank;
pub mod emulator;

pub use target::{Target, WorkingArea, Architecture, AlgorithmArgs};
pub use profile::{ChipId, ChipProfile, MemoryRegion, WriteRoutine};
pub use bank::{FlashBank, BankConfig, Sector};
pub use emulator::{Emulator, EmulatedChip};

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("Target not halted.")]
    NotHalted,
    #[error("Offset 0x{offset:08X} breaks required 4-byte alignment.")]
    AlignmentError { offset: u32 },
    #[error("Flash controller clock not ready, target needs reset before flash operations.")]
    ClockNotReady,
    #[error("No large enough working area available.")]
    ResourceExhausted,
    #[error("Flash write routine failed at address 0x{address:08X}.")]
    ExecutionFailed { address: u32, status: Option<u32> },
    #[error("Unsupported chip with CHIP_ID = {0}.")]
    UnsupportedChip(u32),
    #[error("No memory available for write buffer.")]
    AllocationFailed,
    #[error("Access out of range for flash bank.")]
    OutOfRange,
    #[error("Invalid flash bank configuration: {0}")]
    InvalidConfig(&'static str),
    #[error("Target transaction failed")]
    TransactionFailed(#[from] anyhow::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

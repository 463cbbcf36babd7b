//! Register map of the MDR flash controller and its clock gate.

use crate::{Target, Error, Result};

/// Command register: operation mode and strobe bits.
pub const CMD: u32 = 0x00;
/// Address register.
pub const ADR: u32 = 0x04;
/// Data-in register.
pub const DI: u32 = 0x08;
/// Data-out register.
pub const DO: u32 = 0x0C;
/// Key register, unlocks CMD writes.
pub const KEY: u32 = 0x10;
/// Sub-pulse byte-lane selector, MDR1206 only.
pub const CTRL: u32 = 0x14;
/// Chip identifier, MDR1206 only.
pub const CHIP_ID: u32 = 0x18;

pub const UNLOCK_KEY: u32 = 0x8AAA_5551;
pub const LOCK_KEY: u32 = 0x0000_0000;

/// Written to KEY and read back to check the MDR1206 register map is present.
pub const PROBE_SENTINEL: u32 = 0xABAD_BABE;

/// CMD bits which hold the read-delay configuration and survive every operation.
pub const DELAY_MASK: u32 = 0b111 << 3;

/// CMD bits shared by every controller.
pub mod cmd {
    pub const CON: u32 = 1 << 0;
    pub const WR: u32 = 1 << 1;
    pub const RD: u32 = 1 << 2;
}

/// CMD bits of the classic MDR32 controller layout.
pub mod classic {
    pub const XE: u32 = 1 << 6;
    pub const YE: u32 = 1 << 7;
    pub const SE: u32 = 1 << 8;
    pub const IFREN: u32 = 1 << 9;
    pub const ERASE: u32 = 1 << 10;
    pub const MAS1: u32 = 1 << 11;
    pub const PROG: u32 = 1 << 12;
    pub const NVSTR: u32 = 1 << 13;
    pub const TMR: u32 = 1 << 14;
}

/// CMD bits of the row-addressed MDR1206AFI controller layout.
pub mod row {
    pub const CE: u32 = 1 << 6;
    pub const WE: u32 = 1 << 7;
    pub const RE: u32 = 1 << 8;
    pub const NVR: u32 = 1 << 9;
    pub const ERASE: u32 = 1 << 10;
    pub const CHIP: u32 = 1 << 11;
    pub const PROG: u32 = 1 << 12;
    pub const PROG2: u32 = 1 << 13;
    pub const TMEN: u32 = 1 << 14;
}

/// Peripheral clock register which gates the flash controller.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct ClockGate {
    pub register: u32,
    pub flash_enable: u32,
    pub reset_done: u32,
}

/// Location of one flash controller instance in the target address space.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct Controller {
    pub base: u32,
    pub clock: ClockGate,
}

impl Controller {
    /// Controller of the MDR32Fx and MDR32F02 families.
    pub const DEFAULT: Controller = Controller {
        base: 0x4001_8000,
        clock: ClockGate { register: 0x4002_001C, flash_enable: 1 << 3, reset_done: 1 << 4 },
    };

    /// Controller of the MDR1206 family.
    pub const MDR1206: Controller = Controller {
        base: 0x5001_8000,
        clock: ClockGate { register: 0x5002_001C, flash_enable: 1 << 3, reset_done: 1 << 4 },
    };

    /// Absolute address of the controller register at `offset`.
    pub fn reg(&self, offset: u32) -> u32 {
        self.base + offset
    }

    /// Check the reset controller has finished and switch on the flash clock.
    pub fn enable_clock<T: Target + ?Sized>(&self, target: &mut T) -> Result<()> {
        let per_clock = target.read_u32(self.clock.register)?;
        if per_clock & self.clock.reset_done == 0 {
            log::error!("Target needs reset before running flash operations");
            return Err(Error::ClockNotReady);
        }
        target.write_u32(self.clock.register, per_clock | self.clock.flash_enable)?;
        Ok(())
    }

    pub fn unlock<T: Target + ?Sized>(&self, target: &mut T) -> Result<()> {
        target.write_u32(self.reg(KEY), UNLOCK_KEY)?;
        Ok(())
    }

    pub fn lock<T: Target + ?Sized>(&self, target: &mut T) -> Result<()> {
        target.write_u32(self.reg(KEY), LOCK_KEY)?;
        Ok(())
    }

    /// Read the raw CHIP_ID register, then check the KEY register round-trips
    /// the probe sentinel, leaving the controller locked.
    ///
    /// Any failure means this controller layout is absent on the target.
    pub fn probe_identifier<T: Target + ?Sized>(&self, target: &mut T) -> Result<u32> {
        self.enable_clock(target)?;
        let raw = target.read_u32(self.reg(CHIP_ID))?;
        target.write_u32(self.reg(KEY), PROBE_SENTINEL)?;
        let key = target.read_u32(self.reg(KEY))?;
        if key != PROBE_SENTINEL {
            return Err(anyhow::anyhow!(
                "KEY register read back 0x{:08X}, expected 0x{:08X}", key, PROBE_SENTINEL).into());
        }
        self.lock(target)?;
        Ok(raw)
    }
}

#[test]
fn test_register_addresses() {
    assert_eq!(Controller::DEFAULT.reg(KEY), 0x4001_8010);
    assert_eq!(Controller::MDR1206.reg(CHIP_ID), 0x5001_8018);
    assert_eq!(DELAY_MASK, 0x38);
    assert_eq!(classic::NVSTR, row::PROG2);
}

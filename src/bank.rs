//! Flash bank driver.
//!
//! A [`FlashBank`] owns everything known about one declared bank: its
//! geometry, resolved chip profile, sector table and calibration snapshot.
//! Every operation takes the [`Target`] to act on, probing the bank first if
//! it has not yet been probed.

use crate::controller::{self, Controller};
use crate::profile::{self, CalibrationRegion, ChipId, ChipProfile, MemoryRegion, WriteRoutine,
                     CALIBRATION_SIZE};
use crate::sequencer::{DebugLink, Sequencer};
use crate::strategy::{self, WriteParams};
use crate::{Target, Architecture, Error, Result};

/// Declaration of a flash bank.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct BankConfig {
    /// Address of the first byte of the bank.
    pub base: u32,
    /// Total size in bytes.
    pub size: u32,
    /// Memory array holding the bank.
    pub region: MemoryRegion,
    /// Number of units erased separately during a mass erase.
    pub bank_count: u32,
    /// Number of sectors, the smallest erase unit.
    pub sector_count: u32,
}

/// One erase sector of a bank.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct Sector {
    /// Offset from the bank base.
    pub offset: u32,
    pub size: u32,
    pub erased: bool,
}

#[derive(Copy, Clone, Debug)]
struct Calibration {
    region: CalibrationRegion,
    snapshot: [u8; CALIBRATION_SIZE],
}

impl Calibration {
    fn bytes(&self) -> &[u8] {
        &self.snapshot[..self.region.size as usize]
    }
}

/// Flash bank on an MDR microcontroller.
pub struct FlashBank {
    arch: Architecture,
    declared: BankConfig,
    config: BankConfig,
    profile: ChipProfile,
    controller: Controller,
    calibration: Option<Calibration>,
    sectors: Vec<Sector>,
    routine: Option<WriteRoutine>,
    controller_read: bool,
    probed: bool,
}

/// Unlock/configure/restore/lock envelope around controller work.
#[derive(Copy, Clone, Debug)]
struct Envelope {
    profile: ChipProfile,
    controller: Controller,
    region: MemoryRegion,
}

impl Envelope {
    /// Gate the clock, unlock the controller and enter register access mode,
    /// then run `f` with the access-mode CMD value.
    ///
    /// Once unlocked, CMD is always restored to its delay bits and the
    /// controller locked again before returning, and the first error wins.
    fn run<T, R, F>(&self, target: &mut T, write: bool, f: F) -> Result<R>
        where T: Target + ?Sized,
              F: FnOnce(&mut T, u32) -> Result<R>,
    {
        let cmd_reg = self.controller.reg(controller::CMD);

        self.controller.enable_clock(target)?;
        self.controller.unlock(target)?;

        let mut baseline = 0;
        let result = match target.read_u32(cmd_reg) {
            Ok(cmd) => {
                baseline = cmd & controller::DELAY_MASK;
                let cmd = profile::access_mode(self.profile, self.region, cmd);
                self.configure(target, cmd, write).and_then(|_| f(target, cmd))
            },
            Err(e) => Err(e.into()),
        };

        let restore = target.write_u32(cmd_reg, baseline);
        let lock = self.controller.lock(target);

        if let Err(e) = &result {
            log::error!("Flash operation failed: {}", e);
        }
        let value = result?;
        restore?;
        lock?;
        Ok(value)
    }

    fn configure<T: Target + ?Sized>(&self, target: &mut T, cmd: u32, write: bool) -> Result<()> {
        target.write_u32(self.controller.reg(controller::CMD), cmd)?;
        if write && self.profile.has_ctrl() {
            target.write_u32(self.controller.reg(controller::CTRL), 0)?;
        }
        Ok(())
    }
}

impl FlashBank {
    /// Declare a new bank on a target of architecture `arch`.
    ///
    /// MDR1206 banks have their geometry replaced by the chip's own at probe.
    pub fn new(arch: Architecture, config: BankConfig) -> Self {
        let profile = match arch {
            Architecture::Arm => ChipProfile::Mdr32Fx,
            Architecture::RiscV => ChipProfile::Mdr32F02Fi,
        };
        FlashBank {
            arch,
            declared: config,
            config,
            profile,
            controller: Controller::DEFAULT,
            calibration: None,
            sectors: Vec::new(),
            routine: None,
            controller_read: false,
            probed: false,
        }
    }

    pub fn base(&self) -> u32 {
        self.config.base
    }

    pub fn size(&self) -> u32 {
        self.config.size
    }

    pub fn region(&self) -> MemoryRegion {
        self.config.region
    }

    pub fn bank_count(&self) -> u32 {
        self.config.bank_count
    }

    pub fn sectors(&self) -> &[Sector] {
        &self.sectors
    }

    pub fn profile(&self) -> ChipProfile {
        self.profile
    }

    pub fn chip_id(&self) -> Option<ChipId> {
        self.profile.chip_id()
    }

    pub fn is_probed(&self) -> bool {
        self.probed
    }

    /// Calibration bytes captured at the last probe, if the bank has any.
    pub fn calibration(&self) -> Option<&[u8]> {
        self.calibration.as_ref().map(|c| c.bytes())
    }

    /// Supply the write routine to use for accelerated writes, replacing
    /// any built-in routine. `None` restores the built-in routine, if any.
    pub fn set_write_routine(&mut self, routine: Option<WriteRoutine>) {
        self.routine = routine;
    }

    /// Read info-region banks through the controller data-out register
    /// instead of the memory bus.
    pub fn set_controller_read(&mut self, enabled: bool) {
        self.controller_read = enabled;
    }

    /// Short description of the bank.
    pub fn info(&self) -> String {
        let mut info = format!("{} - {}", self.arch.name(), self.config.region.name());
        if let Some(id) = self.chip_id() {
            info.push_str(&format!(" ({})", id.name()));
        }
        info
    }

    /// Resolve the chip profile and geometry, capture calibration data and
    /// rebuild the sector table.
    pub fn probe<T: Target + ?Sized>(&mut self, target: &mut T) -> Result<()> {
        self.probed = false;

        let resolution = profile::resolve(target, self.arch)?;
        let profile = resolution.profile;

        let mut config = self.declared;
        if let Some(g) = profile.geometry(config.region) {
            config.base = g.base;
            config.size = g.size;
            config.sector_count = g.sector_count;
            config.bank_count = g.bank_count;
            log::info!("{}: setting {} bank @0x{:08X} to {} KiB",
                       profile.name(), config.region.name(), config.base, config.size / 1024);
        }
        check_geometry(&config)?;

        let calibration = match profile.calibration(config.region) {
            Some(region) => {
                let address = config.base + region.offset;
                let mut snapshot = [0xFF; CALIBRATION_SIZE];
                if let Err(e) = target.read_memory(address, &mut snapshot[..region.size as usize]) {
                    log::error!("{}: failed to read calibration values @0x{:08X}, size {}",
                                profile.name(), address, region.size);
                    return Err(e.into());
                }
                log::debug!("Calibration base address = 0x{:08X}, size = {}", address, region.size);
                for (i, word) in snapshot.chunks(4).enumerate() {
                    log::debug!("calibration @0x{:08X} = {:02X?}", address + 4 * i as u32, word);
                }
                Some(Calibration { region, snapshot })
            },
            None => None,
        };

        let sector_size = config.size / config.sector_count;
        self.sectors = (0..config.sector_count)
            .map(|i| Sector { offset: i * sector_size, size: sector_size, erased: false })
            .collect();
        log::debug!("{} sectors of {} bytes, {} erase units",
                    config.sector_count, sector_size, config.bank_count);

        self.profile = profile;
        self.controller = resolution.controller;
        self.config = config;
        self.calibration = calibration;
        self.probed = true;
        Ok(())
    }

    /// Probe the bank unless it has already been probed.
    pub fn auto_probe<T: Target + ?Sized>(&mut self, target: &mut T) -> Result<()> {
        if self.probed {
            Ok(())
        } else {
            self.probe(target)
        }
    }

    /// Erase sectors `first` to `last` inclusive.
    ///
    /// Erasing every sector of a main-region bank uses mass erase.
    pub fn erase<T: Target + ?Sized>(&mut self, target: &mut T, first: usize, last: usize)
        -> Result<()>
    {
        self.erase_cb(target, first, last, |_| ())
    }

    /// Erase sectors `first` to `last` inclusive, calling `cb` with the
    /// number of sectors erased so far.
    pub fn erase_cb<T, F>(&mut self, target: &mut T, first: usize, last: usize, mut cb: F)
        -> Result<()>
        where T: Target + ?Sized,
              F: FnMut(usize),
    {
        check_halted(target)?;
        self.auto_probe(target)?;

        let count = self.sectors.len();
        if first > last || last >= count {
            log::error!("Sectors {}..={} outside bank of {} sectors", first, last, count);
            return Err(Error::OutOfRange);
        }

        let mass = first == 0 && last == count - 1 && self.config.region == MemoryRegion::Main;
        let env = self.envelope();
        let (size, bank_count) = (self.config.size, self.config.bank_count);
        let sectors = &mut self.sectors;

        env.run(target, false, |target, cmd| {
            let mut link = DebugLink(target);
            let mut seq = Sequencer::new(&mut link, env.profile, env.controller.base,
                                         env.region, cmd);
            if mass {
                log::debug!("Mass erasing {} bytes in {} units", size, bank_count);
                seq.mass_erase(size, bank_count)?;
                for sector in sectors.iter_mut() {
                    sector.erased = true;
                }
                cb(count);
            } else {
                for (i, sector) in sectors[first..=last].iter_mut().enumerate() {
                    seq.erase_sector(sector.offset, sector.size)?;
                    sector.erased = true;
                    cb(i + 1);
                }
            }
            Ok(())
        })?;

        if last == count - 1 {
            if let Some(calibration) = self.calibration {
                self.restore_calibration(target, &calibration);
            }
        }
        Ok(())
    }

    /// Rewrite the calibration bytes erased along with the last sector.
    ///
    /// Failure is only logged, since the erase itself succeeded.
    fn restore_calibration<T: Target + ?Sized>(&mut self, target: &mut T, calibration: &Calibration) {
        let offset = calibration.region.offset;
        let address = self.config.base + offset;
        let erased: Vec<bool> = self.sectors.iter().map(|s| s.erased).collect();

        match self.write(target, calibration.bytes(), offset) {
            Ok(()) => {
                log::info!("{}: restored erased calibration values in flash memory @0x{:08X}",
                           self.arch.name(), address);
            },
            Err(e) => {
                log::warn!("{}: failed to write calibration values in flash: {}",
                           self.arch.name(), e);
                for (i, word) in calibration.bytes().chunks(4).enumerate() {
                    log::warn!("{}: value @0x{:08X} = {:02X?}",
                               self.arch.name(), address + 4 * i as u32, word);
                }
            },
        }

        // Restored factory data does not make the sector dirty.
        for (sector, erased) in self.sectors.iter_mut().zip(erased) {
            sector.erased = erased;
        }
    }

    /// Program `data` at byte `offset` of the bank.
    ///
    /// `offset` must be 4-byte aligned. Data is padded with 0xFF to a whole
    /// number of words and calibration bytes are never overwritten.
    pub fn write<T: Target + ?Sized>(&mut self, target: &mut T, data: &[u8], offset: u32)
        -> Result<()>
    {
        self.write_cb(target, data, offset, |_| ())
    }

    /// Program `data` at byte `offset` of the bank, calling `cb` with the
    /// number of bytes written so far.
    pub fn write_cb<T, F>(&mut self, target: &mut T, data: &[u8], offset: u32, mut cb: F)
        -> Result<()>
        where T: Target + ?Sized,
              F: FnMut(usize),
    {
        if offset & 0x3 != 0 {
            log::error!("Offset 0x{:08X} breaks required 4-byte alignment", offset);
            return Err(Error::AlignmentError { offset });
        }
        check_halted(target)?;
        self.auto_probe(target)?;
        self.check_range(offset, data.len())?;
        if data.is_empty() {
            return Ok(());
        }

        let buffer = self.prepare_buffer(data, offset)?;
        let env = self.envelope();
        let params = WriteParams {
            profile: self.profile,
            controller: self.controller,
            region: self.config.region,
            bank_base: self.config.base,
        };
        let routine = self.routine.clone().or_else(|| self.profile.write_routine());
        let len = data.len();

        let result = env.run(target, true, |target, cmd| {
            strategy::write(target, &params, cmd, routine.as_ref(), offset, &buffer,
                            |n| cb(n.min(len)))
        });

        self.mark_written(offset, buffer.len() as u32);
        let strategy = result?;
        log::debug!("Wrote {} bytes at offset 0x{:08X} using {:?}", buffer.len(), offset, strategy);

        // Flush the flash accelerator's prefetch buffer, see errata 0007.
        if self.config.region == MemoryRegion::Main {
            let mut scratch = [0u8; 64];
            let n = scratch.len().min(self.config.size as usize);
            if let Err(e) = target.read_memory(self.config.base, &mut scratch[..n]) {
                log::debug!("Flash accelerator flush read failed: {}", e);
            }
        }

        Ok(())
    }

    /// Read `data.len()` bytes from byte `offset` of the bank.
    pub fn read<T: Target + ?Sized>(&mut self, target: &mut T, data: &mut [u8], offset: u32)
        -> Result<()>
    {
        self.auto_probe(target)?;
        self.check_range(offset, data.len())?;
        if self.controller_read && self.config.region == MemoryRegion::Info {
            self.read_controller(target, data, offset)
        } else {
            target.read_memory(self.config.base + offset, data)?;
            Ok(())
        }
    }

    fn read_controller<T: Target + ?Sized>(&mut self, target: &mut T, data: &mut [u8], offset: u32)
        -> Result<()>
    {
        check_halted(target)?;
        if offset & 0x3 != 0 {
            log::error!("Offset 0x{:08X} breaks required 4-byte alignment", offset);
            return Err(Error::AlignmentError { offset });
        }
        if data.len() & 0x3 != 0 {
            log::error!("Count 0x{:X} breaks required 4-byte alignment", data.len());
            return Err(Error::AlignmentError { offset: offset + data.len() as u32 });
        }

        let env = self.envelope();
        env.run(target, false, |target, cmd| {
            let mut link = DebugLink(target);
            let mut seq = Sequencer::new(&mut link, env.profile, env.controller.base,
                                         env.region, cmd);
            for (i, word) in data.chunks_mut(4).enumerate() {
                let value = seq.read_word(offset + 4 * i as u32)?;
                word.copy_from_slice(&value.to_le_bytes());
            }
            Ok(())
        })
    }

    /// Read back every sector and set its erased flag to whether it is blank.
    pub fn blank_check<T: Target + ?Sized>(&mut self, target: &mut T) -> Result<()> {
        self.auto_probe(target)?;
        let mut data = Vec::new();
        for i in 0..self.sectors.len() {
            let Sector { offset, size, .. } = self.sectors[i];
            data.resize(size as usize, 0);
            self.read(target, &mut data, offset)?;
            self.sectors[i].erased = data.iter().all(|&b| b == 0xFF);
        }
        Ok(())
    }

    fn envelope(&self) -> Envelope {
        Envelope {
            profile: self.profile,
            controller: self.controller,
            region: self.config.region,
        }
    }

    fn check_range(&self, offset: u32, len: usize) -> Result<()> {
        if offset as u64 + len as u64 > self.config.size as u64 {
            log::error!("Access of {} bytes at offset 0x{:08X} beyond bank of {} bytes",
                        len, offset, self.config.size);
            Err(Error::OutOfRange)
        } else {
            Ok(())
        }
    }

    /// Copy `data` into a whole number of words, padded with 0xFF, with any
    /// calibration bytes it covers replaced by the probed snapshot.
    fn prepare_buffer(&self, data: &[u8], offset: u32) -> Result<Vec<u8>> {
        let padded_len = (data.len() + 3) & !0x3;
        let mut buffer = Vec::new();
        if buffer.try_reserve_exact(padded_len).is_err() {
            log::error!("No memory for {} byte write buffer", padded_len);
            return Err(Error::AllocationFailed);
        }
        buffer.extend_from_slice(data);
        if padded_len != data.len() {
            log::info!("Odd number of bytes to write, padding with 0xFF");
            buffer.resize(padded_len, 0xFF);
        }

        if let Some(calibration) = &self.calibration {
            let region = calibration.region;
            let start = offset.max(region.offset);
            let end = (offset + padded_len as u32).min(region.offset + region.size);
            if start < end {
                log::info!("Preserving calibration bytes at offsets 0x{:08X}..0x{:08X}",
                           start, end);
                let src = &calibration.snapshot[(start - region.offset) as usize
                                                ..(end - region.offset) as usize];
                buffer[(start - offset) as usize..(end - offset) as usize].copy_from_slice(src);
            }
        }

        Ok(buffer)
    }

    /// Clear the erased flag of every sector overlapping `offset..offset+len`.
    fn mark_written(&mut self, offset: u32, len: u32) {
        let end = offset + len;
        for sector in self.sectors.iter_mut() {
            if sector.offset < end && offset < sector.offset + sector.size {
                sector.erased = false;
            }
        }
    }
}

fn check_halted<T: Target + ?Sized>(target: &mut T) -> Result<()> {
    if target.is_halted() {
        Ok(())
    } else {
        log::error!("Target not halted");
        Err(Error::NotHalted)
    }
}

fn check_geometry(config: &BankConfig) -> Result<()> {
    if config.size == 0 || config.size % 4 != 0 {
        Err(Error::InvalidConfig("bank size must be a non-zero multiple of 4 bytes"))
    } else if config.sector_count == 0 || config.size % config.sector_count != 0 {
        Err(Error::InvalidConfig("bank size must be a whole number of sectors"))
    } else if (config.size / config.sector_count) % 4 != 0 {
        Err(Error::InvalidConfig("sector size must be a multiple of 4 bytes"))
    } else if config.bank_count == 0 || config.size % config.bank_count != 0 {
        Err(Error::InvalidConfig("bank size must be a whole number of erase units"))
    } else {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::profile::BufferFraming;
    use crate::{Emulator, EmulatedChip};

    const KIB: u32 = 1024;

    fn arm_main() -> FlashBank {
        FlashBank::new(Architecture::Arm, BankConfig {
            base: 0x0800_0000,
            size: 512 * KIB,
            region: MemoryRegion::Main,
            bank_count: 2,
            sector_count: 128,
        })
    }

    fn riscv(region: MemoryRegion) -> FlashBank {
        FlashBank::new(Architecture::RiscV, BankConfig {
            base: 0x1000_0000,
            size: 256 * KIB,
            region,
            bank_count: 1,
            sector_count: 64,
        })
    }

    fn pattern(len: usize, seed: u8) -> Vec<u8> {
        (0..len).map(|i| (i as u8).wrapping_mul(31).wrapping_add(seed)).collect()
    }

    fn calibration_pattern() -> Vec<u8> {
        (0..32).map(|i| 0xC0 | i as u8).collect()
    }

    #[test]
    fn test_geometry_invariant() {
        let cases = [
            (EmulatedChip::Mdr32Fx, arm_main()),
            (EmulatedChip::Mdr32F02Fi, riscv(MemoryRegion::Main)),
            (EmulatedChip::Mdr1206Afi, riscv(MemoryRegion::Main)),
            (EmulatedChip::Mdr1206Afi, riscv(MemoryRegion::Info)),
            (EmulatedChip::Mdr1206Fi, riscv(MemoryRegion::Main)),
            (EmulatedChip::Mdr1206Fi, riscv(MemoryRegion::Info)),
        ];
        for (chip, mut bank) in cases {
            let mut emu = Emulator::new(chip);
            bank.probe(&mut emu).unwrap();
            assert_eq!(bank.profile(), chip.profile());
            let total: u32 = bank.sectors().iter().map(|s| s.size).sum();
            assert_eq!(total, bank.size());
            assert_eq!(bank.size() % bank.sectors()[0].size, 0);
            for (i, sector) in bank.sectors().iter().enumerate() {
                assert_eq!(sector.offset, i as u32 * sector.size);
            }
        }
    }

    #[test]
    fn test_probe_mdr1206afi() {
        let mut emu = Emulator::new(EmulatedChip::Mdr1206Afi);
        let mut bank = riscv(MemoryRegion::Main);
        bank.probe(&mut emu).unwrap();
        assert_eq!(bank.chip_id(), Some(ChipId::MDR1206AFI));
        assert_eq!(bank.base(), 0x1000_0000);
        assert_eq!(bank.size(), 512 * KIB);
        assert_eq!(bank.sectors().len(), 512);
        assert_eq!(bank.bank_count(), 2);
        assert_eq!(emu.key_writes(), &[controller::PROBE_SENTINEL, controller::LOCK_KEY]);
        assert_eq!(bank.info(), "MDR32RV - main memory (MDR1206AFI)");
    }

    #[test]
    fn test_probe_falls_back_to_default_profile() {
        let mut emu = Emulator::new(EmulatedChip::Mdr32F02Fi);
        let mut bank = riscv(MemoryRegion::Main);
        bank.probe(&mut emu).unwrap();
        assert_eq!(bank.profile(), ChipProfile::Mdr32F02Fi);
        assert_eq!(bank.size(), 256 * KIB);
        assert_eq!(bank.sectors().len(), 64);
        assert_eq!(bank.info(), "MDR32RV - main memory");

        // Writes then go to the default controller.
        bank.write(&mut emu, &[1, 2, 3, 4], 0).unwrap();
        assert_eq!(&emu.main()[..4], &[1, 2, 3, 4]);
        assert!(emu.violations().is_empty(), "{:?}", emu.violations());
    }

    #[test]
    fn test_probe_unsupported_chip() {
        let mut emu = Emulator::new(EmulatedChip::Mdr1206Fi);
        emu.set_chip_id(100);
        let mut bank = riscv(MemoryRegion::Main);
        assert!(matches!(bank.probe(&mut emu), Err(Error::UnsupportedChip(100))));
        assert!(!bank.is_probed());
        assert!(matches!(bank.write(&mut emu, &[0; 4], 0), Err(Error::UnsupportedChip(100))));
    }

    #[test]
    fn test_probe_zero_chip_id() {
        let mut emu = Emulator::new(EmulatedChip::Mdr1206Fi);
        emu.set_chip_id(0);
        let mut bank = riscv(MemoryRegion::Main);
        bank.probe(&mut emu).unwrap();
        assert_eq!(bank.profile(), ChipProfile::Mdr32F02Fi);
        assert_eq!(bank.size(), 256 * KIB);
    }

    #[test]
    fn test_invalid_geometry() {
        let mut emu = Emulator::new(EmulatedChip::Mdr32Fx);
        let mut bank = FlashBank::new(Architecture::Arm, BankConfig {
            base: 0x0800_0000, size: 100 * KIB, region: MemoryRegion::Main,
            bank_count: 1, sector_count: 3,
        });
        assert!(matches!(bank.probe(&mut emu), Err(Error::InvalidConfig(_))));
    }

    #[test]
    fn test_erase_write_flags() {
        let mut emu = Emulator::new(EmulatedChip::Mdr32Fx);
        emu.main_mut()[3 * 4096..6 * 4096].fill(0x00);
        let mut bank = arm_main();

        bank.erase(&mut emu, 3, 5).unwrap();
        for (i, sector) in bank.sectors().iter().enumerate() {
            assert_eq!(sector.erased, (3..=5).contains(&i));
        }
        assert!(emu.main()[3 * 4096..6 * 4096].iter().all(|&b| b == 0xFF));

        bank.write(&mut emu, &pattern(12, 1), 4 * 4096 + 100).unwrap();
        let erased: Vec<bool> = bank.sectors()[3..6].iter().map(|s| s.erased).collect();
        assert_eq!(erased, vec![true, false, true]);
        assert!(emu.violations().is_empty(), "{:?}", emu.violations());
        assert!(emu.is_locked());
    }

    #[test]
    fn test_erase_progress() {
        let mut emu = Emulator::new(EmulatedChip::Mdr32Fx);
        let mut bank = arm_main();
        let mut progress = Vec::new();
        bank.erase_cb(&mut emu, 10, 12, |n| progress.push(n)).unwrap();
        assert_eq!(progress, vec![1, 2, 3]);
    }

    #[test]
    fn test_strategy_equivalence() {
        let routine = WriteRoutine::new(vec![0x6f, 0x00, 0x00, 0x00], BufferFraming::Plain);
        let cases = [
            (EmulatedChip::Mdr32Fx, arm_main(), None),
            (EmulatedChip::Mdr32F02Fi, riscv(MemoryRegion::Main), Some(routine.clone())),
            (EmulatedChip::Mdr1206Fi, riscv(MemoryRegion::Main), Some(routine.clone())),
            (EmulatedChip::Mdr1206Afi, riscv(MemoryRegion::Main), Some(routine.clone())),
        ];
        let data = pattern(5000, 7);
        for (chip, bank, routine) in cases {
            let mut results = Vec::new();
            for accelerated in [true, false] {
                let mut emu = Emulator::new(chip);
                if !accelerated {
                    emu.set_ram_size(0);
                }
                let mut bank = FlashBank::new(chip.architecture(), bank.declared);
                bank.set_write_routine(routine.clone());
                bank.erase(&mut emu, 0, 3).unwrap();
                bank.write(&mut emu, &data, 0x3F0).unwrap();
                assert_eq!(emu.routine_runs() > 0, accelerated, "{:?}", chip);
                assert!(emu.violations().is_empty(), "{:?}: {:?}", chip, emu.violations());
                let flags: Vec<bool> = bank.sectors().iter().map(|s| s.erased).collect();
                results.push((emu.main().to_vec(), flags));
            }
            assert_eq!(results[0].0, results[1].0, "{:?}", chip);
            assert_eq!(results[0].1, results[1].1, "{:?}", chip);
            assert_eq!(&results[0].0[0x3F0..0x3F0 + data.len()], &data[..]);
        }
    }

    #[test]
    fn test_riscv_without_routine_uses_host() {
        let mut emu = Emulator::new(EmulatedChip::Mdr1206Fi);
        let mut bank = riscv(MemoryRegion::Main);
        bank.write(&mut emu, &pattern(64, 3), 0x40).unwrap();
        assert_eq!(emu.routine_runs(), 0);
        assert_eq!(&emu.main()[0x40..0x80], &pattern(64, 3)[..]);
    }

    #[test]
    fn test_alignment_rejected_before_traffic() {
        let mut emu = Emulator::new(EmulatedChip::Mdr32Fx);
        let mut bank = arm_main();
        let result = bank.write(&mut emu, &[0; 8], 2);
        assert!(matches!(result, Err(Error::AlignmentError { offset: 2 })));
        assert_eq!(emu.transactions(), 0);
    }

    #[test]
    fn test_padding() {
        let mut emu = Emulator::new(EmulatedChip::Mdr32Fx);
        let mut bank = arm_main();
        bank.probe(&mut emu).unwrap();

        let buffer = bank.prepare_buffer(&[1, 2, 3], 0).unwrap();
        assert_eq!(buffer, vec![1, 2, 3, 0xFF]);
        let buffer = bank.prepare_buffer(&[1, 2, 3, 4, 5], 0).unwrap();
        assert_eq!(buffer, vec![1, 2, 3, 4, 5, 0xFF, 0xFF, 0xFF]);

        bank.write(&mut emu, &[0x11, 0x22, 0x33, 0x44, 0x55, 0x66, 0x77], 0x20).unwrap();
        let mut readback = [0u8; 7];
        bank.read(&mut emu, &mut readback, 0x20).unwrap();
        assert_eq!(readback, [0x11, 0x22, 0x33, 0x44, 0x55, 0x66, 0x77]);
        assert_eq!(emu.main()[0x27], 0xFF);
    }

    #[test]
    fn test_spanning_write() {
        let mut emu = Emulator::new(EmulatedChip::Mdr32Fx);
        let mut bank = arm_main();
        bank.erase(&mut emu, 0, 1).unwrap();
        let data = pattern(4100, 9);

        // An unaligned start is rejected outright and touches no sector.
        assert!(matches!(bank.write(&mut emu, &data, 4094),
                         Err(Error::AlignmentError { offset: 4094 })));
        assert!(bank.sectors()[0].erased && bank.sectors()[1].erased);

        bank.write(&mut emu, &data, 4092).unwrap();
        assert!(!bank.sectors()[0].erased);
        assert!(!bank.sectors()[1].erased);
        assert!(bank.sectors()[2..].iter().all(|s| !s.erased));
        assert_eq!(&emu.main()[4092..4096], &data[..4]);
        assert_eq!(&emu.main()[4096..4100], &data[4..8]);
        assert_eq!(&emu.main()[4092..8192], &data[..]);
    }

    #[test]
    fn test_mass_erase_bank_count() {
        let mut emu = Emulator::new(EmulatedChip::Mdr32Fx);
        emu.set_mass_erase_unit(256 * KIB);
        emu.main_mut().fill(0x00);
        let mut bank = arm_main();
        bank.erase(&mut emu, 0, 127).unwrap();
        assert!(bank.sectors().iter().all(|s| s.erased));
        assert!(emu.main().iter().all(|&b| b == 0xFF));
        assert!(emu.violations().is_empty(), "{:?}", emu.violations());
    }

    #[test]
    fn test_mass_erase_row_layout() {
        let mut emu = Emulator::new(EmulatedChip::Mdr1206Afi);
        emu.main_mut().fill(0x00);
        let cal = calibration_pattern();
        emu.info_mut()[0x3BE0..0x3C00].copy_from_slice(&cal);
        let mut bank = riscv(MemoryRegion::Main);
        bank.erase(&mut emu, 0, 511).unwrap();
        assert!(bank.sectors().iter().all(|s| s.erased));
        assert!(emu.main().iter().all(|&b| b == 0xFF));
        assert_eq!(&emu.info()[0x3BE0..0x3C00], &cal[..]);
        assert!(emu.violations().is_empty(), "{:?}", emu.violations());
    }

    #[test]
    fn test_row_sector_erase() {
        let mut emu = Emulator::new(EmulatedChip::Mdr1206Afi);
        emu.main_mut().fill(0x00);
        let mut bank = riscv(MemoryRegion::Main);
        bank.erase(&mut emu, 5, 5).unwrap();
        assert!(emu.main()[5 * 1024..6 * 1024].iter().all(|&b| b == 0xFF));
        assert!(emu.main()[..5 * 1024].iter().all(|&b| b == 0x00));
        assert!(emu.main()[6 * 1024..].iter().all(|&b| b == 0x00));
    }

    #[test]
    fn test_calibration_restored_after_erase() {
        for (chip, offset) in [(EmulatedChip::Mdr1206Fi, 0x3FE0), (EmulatedChip::Mdr1206Afi, 0x3BE0)] {
            let mut emu = Emulator::new(chip);
            let cal = calibration_pattern();
            emu.info_mut()[offset..offset + 32].copy_from_slice(&cal);
            let mut bank = riscv(MemoryRegion::Info);
            bank.probe(&mut emu).unwrap();
            assert_eq!(bank.calibration(), Some(&cal[..]));

            let last = bank.sectors().len() - 1;
            bank.erase(&mut emu, 0, last).unwrap();
            assert_eq!(&emu.info()[offset..offset + 32], &cal[..]);
            assert!(emu.info()[..offset].iter().all(|&b| b == 0xFF));
            assert!(bank.sectors().iter().all(|s| s.erased));
            assert!(emu.violations().is_empty(), "{:?}", emu.violations());
            assert!(emu.is_locked());
        }
    }

    #[test]
    fn test_calibration_preserved_on_write() {
        let mut emu = Emulator::new(EmulatedChip::Mdr1206Fi);
        let cal = calibration_pattern();
        emu.info_mut()[0x3FE0..0x4000].copy_from_slice(&cal);
        let mut bank = riscv(MemoryRegion::Info);
        bank.erase(&mut emu, 3, 3).unwrap();

        // Overlapping the start of the region.
        bank.write(&mut emu, &[0x00; 64], 0x3FC0).unwrap();
        assert!(emu.info()[0x3FC0..0x3FE0].iter().all(|&b| b == 0x00));
        assert_eq!(&emu.info()[0x3FE0..0x4000], &cal[..]);

        // Starting inside the region.
        bank.write(&mut emu, &[0x00; 16], 0x3FF0).unwrap();
        assert_eq!(&emu.info()[0x3FE0..0x4000], &cal[..]);
    }

    #[test]
    fn test_restore_and_lock_on_write_failure() {
        let mut emu = Emulator::new(EmulatedChip::Mdr32Fx);
        emu.set_ram_size(0);
        let mut bank = arm_main();
        bank.probe(&mut emu).unwrap();
        emu.clear_key_writes();

        // Fail mid-waveform, with program mode asserted.
        emu.fail_write(Controller::DEFAULT.reg(controller::CMD), 4);
        let result = bank.write(&mut emu, &[0; 16], 0);
        assert!(matches!(result, Err(Error::TransactionFailed(_))));
        assert_eq!(emu.key_writes(), &[controller::UNLOCK_KEY, controller::LOCK_KEY]);
        assert_eq!(emu.cmd() & !controller::DELAY_MASK, 0);
        assert!(emu.is_locked());
        assert!(!bank.sectors()[0].erased);
    }

    #[test]
    fn test_restore_and_lock_on_erase_failure() {
        let mut emu = Emulator::new(EmulatedChip::Mdr1206Afi);
        let mut bank = riscv(MemoryRegion::Main);
        bank.probe(&mut emu).unwrap();
        emu.clear_key_writes();

        emu.fail_write(Controller::MDR1206.reg(controller::ADR), 2);
        let result = bank.erase(&mut emu, 0, 3);
        assert!(matches!(result, Err(Error::TransactionFailed(_))));
        assert_eq!(emu.key_writes(), &[controller::UNLOCK_KEY, controller::LOCK_KEY]);
        assert_eq!(emu.cmd(), 0);
        assert!(bank.sectors().iter().all(|s| !s.erased));
    }

    #[test]
    fn test_execution_failure_address() {
        let mut emu = Emulator::new(EmulatedChip::Mdr32Fx);
        emu.fail_routine_at_word(5);
        let mut bank = arm_main();
        bank.probe(&mut emu).unwrap();
        emu.clear_key_writes();
        match bank.write(&mut emu, &[0; 64], 0x100) {
            Err(Error::ExecutionFailed { address, .. }) => {
                assert_eq!(address, 0x0800_0000 + 0x100 + 5 * 4)
            },
            other => panic!("unexpected result {:?}", other),
        }
        assert_eq!(emu.key_writes(), &[controller::UNLOCK_KEY, controller::LOCK_KEY]);
        assert_eq!(emu.allocated_areas(), 0);
    }

    #[test]
    fn test_clock_not_ready() {
        let mut emu = Emulator::new(EmulatedChip::Mdr32Fx);
        emu.set_clock_ready(false);
        let mut bank = arm_main();
        assert!(matches!(bank.erase(&mut emu, 0, 0), Err(Error::ClockNotReady)));
        assert!(emu.key_writes().is_empty());
    }

    #[test]
    fn test_not_halted() {
        let mut emu = Emulator::new(EmulatedChip::Mdr32Fx);
        emu.set_halted(false);
        let mut bank = arm_main();
        assert!(matches!(bank.erase(&mut emu, 0, 0), Err(Error::NotHalted)));
        assert!(matches!(bank.write(&mut emu, &[0; 4], 0), Err(Error::NotHalted)));
        assert_eq!(emu.transactions(), 0);
    }

    #[test]
    fn test_out_of_range() {
        let mut emu = Emulator::new(EmulatedChip::Mdr32Fx);
        let mut bank = arm_main();
        assert!(matches!(bank.erase(&mut emu, 2, 1), Err(Error::OutOfRange)));
        assert!(matches!(bank.erase(&mut emu, 0, 128), Err(Error::OutOfRange)));
        assert!(matches!(bank.write(&mut emu, &[0; 8], 512 * KIB - 4), Err(Error::OutOfRange)));
        let mut data = [0u8; 8];
        assert!(matches!(bank.read(&mut emu, &mut data, 512 * KIB), Err(Error::OutOfRange)));
    }

    #[test]
    fn test_controller_read() {
        let mut emu = Emulator::new(EmulatedChip::Mdr32Fx);
        emu.info_mut()[..64].copy_from_slice(&pattern(64, 5));
        let mut bank = FlashBank::new(Architecture::Arm, BankConfig {
            base: 0, size: 4 * KIB, region: MemoryRegion::Info, bank_count: 1, sector_count: 1,
        });

        // The MDR32Fx info array is not on the memory bus.
        let mut data = [0u8; 16];
        assert!(matches!(bank.read(&mut emu, &mut data, 8), Err(Error::TransactionFailed(_))));

        bank.set_controller_read(true);
        bank.read(&mut emu, &mut data, 8).unwrap();
        assert_eq!(&data[..], &pattern(64, 5)[8..24]);
        assert!(emu.is_locked());
        assert_eq!(emu.cmd(), 0);

        let mut odd = [0u8; 6];
        assert!(matches!(bank.read(&mut emu, &mut odd, 8), Err(Error::AlignmentError { .. })));
    }

    #[test]
    fn test_calibration_restore_failure_keeps_erase() {
        let mut emu = Emulator::new(EmulatedChip::Mdr1206Fi);
        let cal = calibration_pattern();
        emu.info_mut()[0x3FE0..0x4000].copy_from_slice(&cal);
        let mut bank = riscv(MemoryRegion::Info);
        bank.probe(&mut emu).unwrap();
        emu.clear_key_writes();

        // Erase writes CMD six times, the restore fails on its mode assertion.
        emu.fail_write(Controller::MDR1206.reg(controller::CMD), 8);
        bank.erase(&mut emu, 3, 3).unwrap();

        assert!(emu.info()[0x3000..0x4000].iter().all(|&b| b == 0xFF));
        assert!(bank.sectors()[3].erased);
        assert_eq!(emu.key_writes(), &[controller::UNLOCK_KEY, controller::LOCK_KEY,
                                       controller::UNLOCK_KEY, controller::LOCK_KEY]);
        assert!(emu.is_locked());
        assert_eq!(emu.cmd(), 0);
        assert_eq!(bank.calibration(), Some(&cal[..]));
    }

    #[test]
    fn test_controller_read_row_layout() {
        let mut emu = Emulator::new(EmulatedChip::Mdr1206Afi);
        emu.info_mut()[..64].copy_from_slice(&pattern(64, 11));
        let mut bank = riscv(MemoryRegion::Info);
        bank.set_controller_read(true);
        let mut data = [0u8; 24];
        bank.read(&mut emu, &mut data, 4).unwrap();
        assert_eq!(&data[..], &pattern(64, 11)[4..28]);
        assert_eq!(&emu.info()[..64], &pattern(64, 11)[..]);
        assert!(emu.violations().is_empty(), "{:?}", emu.violations());
        assert!(emu.is_locked());
    }

    #[test]
    fn test_blank_check() {
        let mut emu = Emulator::new(EmulatedChip::Mdr1206Fi);
        emu.main_mut()[5 * 4096 + 17] = 0x7F;
        let mut bank = riscv(MemoryRegion::Main);
        bank.blank_check(&mut emu).unwrap();
        for (i, sector) in bank.sectors().iter().enumerate() {
            assert_eq!(sector.erased, i != 5);
        }
    }

    #[test]
    fn test_info_string() {
        let bank = arm_main();
        assert_eq!(bank.info(), "MDR32Fx - main memory");
        let bank = riscv(MemoryRegion::Info);
        assert_eq!(bank.info(), "MDR32RV - info memory");
    }
}

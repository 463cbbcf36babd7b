//! In-memory emulation of an MDR flash controller behind a debug port.
//!
//! [`Emulator`] implements [`Target`] for one emulated chip: the controller
//! registers and key lock, the peripheral clock gate, the main and info
//! flash arrays, working-area RAM, and on-target execution of the write
//! routine. Time is emulated, so dwells cost nothing.
//!
//! The controller model only commits a program or erase when the waveform
//! honours the chip's minimum dwells, and records every departure from the
//! waveform as a violation which tests can inspect.

use std::time::Duration;
use anyhow::{anyhow, bail};

use crate::controller::{self, classic, row, Controller};
use crate::profile::{ChipProfile, Layout, MemoryRegion};
use crate::sequencer::{ControllerBus, Sequencer};
use crate::{Target, WorkingArea, Architecture, AlgorithmArgs};

/// Chips which can be emulated.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum EmulatedChip {
    Mdr32Fx,
    Mdr32F02Fi,
    Mdr1206Afi,
    Mdr1206Fi,
}

/// Shortest dwells, in microseconds, for which the emulated array commits.
#[derive(Copy, Clone, Debug)]
struct MinimumDwell {
    nvs: u32,
    prog: u32,
    erase: u32,
    mass_erase: u32,
}

impl EmulatedChip {
    pub fn from_name(name: &str) -> Option<Self> {
        match name.to_ascii_lowercase().as_str() {
            "mdr32fx" => Some(EmulatedChip::Mdr32Fx),
            "mdr32f02fi" => Some(EmulatedChip::Mdr32F02Fi),
            "mdr1206afi" => Some(EmulatedChip::Mdr1206Afi),
            "mdr1206fi" => Some(EmulatedChip::Mdr1206Fi),
            _ => None,
        }
    }

    /// Profile the driver should resolve for this chip.
    pub fn profile(&self) -> ChipProfile {
        match self {
            EmulatedChip::Mdr32Fx => ChipProfile::Mdr32Fx,
            EmulatedChip::Mdr32F02Fi => ChipProfile::Mdr32F02Fi,
            EmulatedChip::Mdr1206Afi => ChipProfile::Mdr1206Afi,
            EmulatedChip::Mdr1206Fi => ChipProfile::Mdr1206Fi,
        }
    }

    pub fn architecture(&self) -> Architecture {
        self.profile().architecture()
    }

    pub fn controller(&self) -> Controller {
        match self {
            EmulatedChip::Mdr32Fx | EmulatedChip::Mdr32F02Fi => Controller::DEFAULT,
            EmulatedChip::Mdr1206Afi | EmulatedChip::Mdr1206Fi => Controller::MDR1206,
        }
    }

    pub fn main_base(&self) -> u32 {
        match self {
            EmulatedChip::Mdr32Fx => 0x0800_0000,
            _ => 0x1000_0000,
        }
    }

    pub fn main_size(&self) -> u32 {
        512 * 1024
    }

    /// Address at which the info array is memory mapped, if it is.
    pub fn info_base(&self) -> Option<u32> {
        match self {
            EmulatedChip::Mdr32Fx => None,
            _ => Some(0x0002_0000),
        }
    }

    pub fn info_size(&self) -> u32 {
        match self {
            EmulatedChip::Mdr32Fx | EmulatedChip::Mdr32F02Fi => 4 * 1024,
            EmulatedChip::Mdr1206Afi => 15 * 1024,
            EmulatedChip::Mdr1206Fi => 16 * 1024,
        }
    }

    pub fn ram_base(&self) -> u32 {
        match self.architecture() {
            Architecture::Arm => 0x2000_0000,
            Architecture::RiscV => 0x8000_0000,
        }
    }

    /// Native erase granularity of the array.
    fn erase_size(&self) -> u32 {
        match self {
            EmulatedChip::Mdr1206Afi => 1024,
            _ => 4096,
        }
    }

    fn minimum_dwell(&self) -> MinimumDwell {
        match self.profile().layout() {
            Layout::Classic => MinimumDwell { nvs: 5, prog: 20, erase: 20_000, mass_erase: 20_000 },
            Layout::Row => MinimumDwell { nvs: 20, prog: 4, erase: 2_000, mass_erase: 30_000 },
        }
    }
}

/// CMD bits with the same role in both layouts.
#[derive(Copy, Clone, Debug)]
struct Roles {
    enable: u32,
    program: u32,
    erase: u32,
    mass: u32,
    store: u32,
    strobe: u32,
}

impl Roles {
    fn for_layout(layout: Layout) -> Self {
        match layout {
            Layout::Classic => Roles {
                enable: classic::XE, program: classic::PROG, erase: classic::ERASE,
                mass: classic::MAS1, store: classic::NVSTR, strobe: classic::YE,
            },
            Layout::Row => Roles {
                enable: row::CE, program: row::PROG, erase: row::ERASE,
                mass: row::CHIP, store: row::WE, strobe: row::PROG2,
            },
        }
    }
}

/// Injected debug-port write failure.
#[derive(Copy, Clone, Debug)]
struct WriteFault {
    address: u32,
    remaining: usize,
}

/// Emulated target containing one MDR flash controller.
pub struct Emulator {
    chip: EmulatedChip,
    controller: Controller,
    roles: Roles,
    main: Vec<u8>,
    info: Vec<u8>,
    ram: Vec<u8>,
    areas: Vec<WorkingArea>,
    halted: bool,

    clock: u32,
    cmd: u32,
    adr: u32,
    di: u32,
    key: u32,
    ctrl: u32,

    /// Emulated time of the program/erase mode assertion, with its page.
    mode_since: Option<(u64, u32)>,
    store_since: Option<u64>,
    strobe_since: Option<u64>,
    now_us: u64,

    transactions: usize,
    key_writes: Vec<u32>,
    violations: Vec<String>,
    routine_runs: usize,
    routine_words: usize,
    write_fault: Option<WriteFault>,
    routine_fault: Option<usize>,
    mass_erase_unit: u32,
    chip_id: u32,
}

impl Emulator {
    /// Create a halted, freshly reset chip with erased flash and 32 KiB of RAM.
    pub fn new(chip: EmulatedChip) -> Self {
        let controller = chip.controller();
        Emulator {
            chip,
            controller,
            roles: Roles::for_layout(chip.profile().layout()),
            main: vec![0xFF; chip.main_size() as usize],
            info: vec![0xFF; chip.info_size() as usize],
            ram: vec![0; 32 * 1024],
            areas: Vec::new(),
            halted: true,
            clock: controller.clock.reset_done,
            cmd: 0,
            adr: 0,
            di: 0,
            key: controller::LOCK_KEY,
            ctrl: 0,
            mode_since: None,
            store_since: None,
            strobe_since: None,
            now_us: 0,
            transactions: 0,
            key_writes: Vec::new(),
            violations: Vec::new(),
            routine_runs: 0,
            routine_words: 0,
            write_fault: None,
            routine_fault: None,
            mass_erase_unit: chip.main_size(),
            chip_id: chip.profile().chip_id().map(|id| id as u32).unwrap_or(0),
        }
    }

    pub fn chip(&self) -> EmulatedChip {
        self.chip
    }

    pub fn main(&self) -> &[u8] {
        &self.main
    }

    pub fn main_mut(&mut self) -> &mut [u8] {
        &mut self.main
    }

    pub fn info(&self) -> &[u8] {
        &self.info
    }

    pub fn info_mut(&mut self) -> &mut [u8] {
        &mut self.info
    }

    pub fn set_halted(&mut self, halted: bool) {
        self.halted = halted;
    }

    /// Set or clear the reset-complete flag in the peripheral clock register.
    pub fn set_clock_ready(&mut self, ready: bool) {
        if ready {
            self.clock |= self.controller.clock.reset_done;
        } else {
            self.clock &= !self.controller.clock.reset_done;
        }
    }

    /// Limit the RAM available for working areas to `size` bytes.
    pub fn set_ram_size(&mut self, size: u32) {
        self.ram = vec![0; size as usize];
        self.areas.clear();
    }

    /// Set the bytes of main array erased by one classic mass-erase command.
    pub fn set_mass_erase_unit(&mut self, size: u32) {
        self.mass_erase_unit = size;
    }

    /// Report `id` in the CHIP_ID register of an MDR1206 controller.
    pub fn set_chip_id(&mut self, id: u32) {
        self.chip_id = id;
    }

    /// Make the `nth` (from 1) debug-port write to `address` fail.
    pub fn fail_write(&mut self, address: u32, nth: usize) {
        self.write_fault = Some(WriteFault { address, remaining: nth });
    }

    /// Make the write routine report failure on reaching its `n`th (from 0)
    /// word, counted across all runs.
    pub fn fail_routine_at_word(&mut self, n: usize) {
        self.routine_fault = Some(n);
    }

    /// Number of debug-port register and memory transactions so far.
    pub fn transactions(&self) -> usize {
        self.transactions
    }

    /// Every value written to the KEY register over the debug port.
    pub fn key_writes(&self) -> &[u32] {
        &self.key_writes
    }

    pub fn clear_key_writes(&mut self) {
        self.key_writes.clear();
    }

    /// Departures from the programming waveform observed so far.
    pub fn violations(&self) -> &[String] {
        &self.violations
    }

    pub fn now_us(&self) -> u64 {
        self.now_us
    }

    pub fn routine_runs(&self) -> usize {
        self.routine_runs
    }

    pub fn allocated_areas(&self) -> usize {
        self.areas.len()
    }

    pub fn is_locked(&self) -> bool {
        self.key != controller::UNLOCK_KEY
    }

    /// Current CMD register value.
    pub fn cmd(&self) -> u32 {
        self.cmd
    }

    fn violation(&mut self, msg: String) {
        log::trace!("Waveform violation: {}", msg);
        self.violations.push(msg);
    }

    fn has_ctrl(&self) -> bool {
        self.chip.profile().has_ctrl()
    }

    fn region(&self) -> MemoryRegion {
        if self.cmd & classic::IFREN != 0 {
            MemoryRegion::Info
        } else {
            MemoryRegion::Main
        }
    }

    fn array_mut(&mut self, region: MemoryRegion) -> &mut Vec<u8> {
        match region {
            MemoryRegion::Main => &mut self.main,
            MemoryRegion::Info => &mut self.info,
        }
    }

    fn array(&self, region: MemoryRegion) -> &[u8] {
        match region {
            MemoryRegion::Main => &self.main,
            MemoryRegion::Info => &self.info,
        }
    }

    /// Mask selecting the address bits decoded by `region`'s array.
    fn window(&self, region: MemoryRegion) -> u32 {
        self.array(region).len().next_power_of_two() as u32 - 1
    }

    /// Byte offset into the selected array addressed by ADR.
    fn decode_adr(&self) -> u32 {
        let region = self.region();
        let offset = match self.chip.profile().layout() {
            Layout::Classic => self.adr,
            Layout::Row => {
                let sel = self.chip.profile().half_select(region);
                let upper = if self.adr & sel != 0 { 4 } else { 0 };
                ((self.adr & !sel & !0x3) << 1) | upper
            },
        };
        offset & self.window(region)
    }

    fn read_word(&self, region: MemoryRegion, offset: u32) -> Option<u32> {
        let array = self.array(region);
        let offset = offset as usize;
        array.get(offset..offset + 4)
             .map(|w| u32::from_le_bytes([w[0], w[1], w[2], w[3]]))
    }

    fn bus_read(&mut self, address: u32) -> anyhow::Result<u32> {
        if address == self.controller.clock.register {
            return Ok(self.clock);
        }
        match address.wrapping_sub(self.controller.base) {
            controller::CMD => Ok(self.cmd),
            controller::ADR => Ok(self.adr),
            controller::DI => Ok(self.di),
            controller::KEY => Ok(self.key),
            controller::DO => {
                let sense = match self.chip.profile().layout() {
                    Layout::Classic => classic::XE | classic::YE | classic::SE,
                    Layout::Row => row::CE | row::RE,
                };
                if self.cmd & sense == sense {
                    let offset = self.decode_adr();
                    Ok(self.read_word(self.region(), offset).unwrap_or(0xFFFF_FFFF))
                } else {
                    Ok(0)
                }
            },
            controller::CTRL if self.has_ctrl() => Ok(self.ctrl),
            controller::CHIP_ID if self.has_ctrl() => Ok(self.chip_id << 2),
            _ => {
                let mut word = [0u8; 4];
                self.memory_read(address, &mut word)?;
                Ok(u32::from_le_bytes(word))
            },
        }
    }

    fn bus_write(&mut self, address: u32, value: u32) -> anyhow::Result<()> {
        if address == self.controller.clock.register {
            self.clock = value;
            return Ok(());
        }
        match address.wrapping_sub(self.controller.base) {
            controller::CMD => self.write_cmd(value),
            controller::ADR => self.adr = value,
            controller::DI => self.di = value,
            controller::KEY => self.key = value,
            controller::DO => (),
            controller::CTRL if self.has_ctrl() => self.ctrl = value,
            controller::CHIP_ID if self.has_ctrl() => (),
            _ => self.memory_write(address, &value.to_le_bytes())?,
        }
        Ok(())
    }

    /// Find the memory backing `len` bytes at `address`.
    fn locate(&self, address: u32, len: usize) -> Option<(MemoryKind, usize)> {
        let fits = |base: u32, size: usize| {
            address >= base && (address - base) as usize + len <= size
        };
        let main_base = self.chip.main_base();
        let ram_base = self.chip.ram_base();
        if fits(main_base, self.main.len()) {
            Some((MemoryKind::Main, (address - main_base) as usize))
        } else if fits(ram_base, self.ram.len()) {
            Some((MemoryKind::Ram, (address - ram_base) as usize))
        } else {
            match self.chip.info_base() {
                Some(base) if fits(base, self.info.len()) =>
                    Some((MemoryKind::Info, (address - base) as usize)),
                _ => None,
            }
        }
    }

    fn memory_read(&self, address: u32, data: &mut [u8]) -> anyhow::Result<()> {
        let (kind, offset) = self.locate(address, data.len())
            .ok_or_else(|| anyhow!("Bus error reading {} bytes at 0x{:08X}", data.len(), address))?;
        let src = match kind {
            MemoryKind::Main => &self.main,
            MemoryKind::Info => &self.info,
            MemoryKind::Ram => &self.ram,
        };
        data.copy_from_slice(&src[offset..offset + data.len()]);
        Ok(())
    }

    fn memory_write(&mut self, address: u32, data: &[u8]) -> anyhow::Result<()> {
        match self.locate(address, data.len()) {
            Some((MemoryKind::Ram, offset)) => {
                self.ram[offset..offset + data.len()].copy_from_slice(data);
                Ok(())
            },
            Some(_) => bail!("Flash at 0x{:08X} is not writable by the bus", address),
            None => bail!("Bus error writing {} bytes at 0x{:08X}", data.len(), address),
        }
    }

    fn write_cmd(&mut self, value: u32) {
        if self.is_locked() {
            self.violation(format!("CMD write 0x{:08X} while locked", value));
            return;
        }
        if self.clock & self.controller.clock.flash_enable == 0 {
            self.violation(format!("CMD write 0x{:08X} with flash clock gated", value));
        }

        let r = self.roles;
        let old = self.cmd;
        let rising = value & !old;
        let falling = old & !value;
        let now = self.now_us;
        let dwell = self.chip.minimum_dwell();
        let mode = |cmd: u32| cmd & r.enable != 0 && cmd & (r.program | r.erase) != 0;

        // Erase commits when the strobe which held it is released, so
        // evaluate with the old CMD before it is replaced.
        let erase_commit = match self.chip.profile().layout() {
            Layout::Classic => falling & r.erase != 0 && old & r.store != 0,
            Layout::Row => falling & r.store != 0 && old & r.erase != 0,
        };
        if erase_commit && old & r.enable != 0 {
            let held = now - self.store_since.unwrap_or(now);
            if old & r.mass != 0 {
                if held < dwell.mass_erase as u64 {
                    self.violation(format!("Mass erase held {}us", held));
                } else {
                    self.commit_mass_erase();
                }
            } else if held < dwell.erase as u64 {
                self.violation(format!("Sector erase held {}us", held));
            } else {
                self.commit_sector_erase();
            }
        }

        // Program pulses commit on the strobe's falling edge.
        if falling & r.strobe != 0 && old & r.store != 0 && old & r.program != 0 {
            let held = now - self.strobe_since.unwrap_or(now);
            if held < dwell.prog as u64 {
                self.violation(format!("Program pulse held {}us", held));
            } else {
                self.commit_program();
            }
        }

        self.cmd = value;

        if mode(value) && !mode(old) {
            let extra = self.chip.profile().extra_flags();
            if value & extra != extra {
                self.violation(format!("Program/erase mode 0x{:08X} without test-mode disable",
                                       value));
            }
            let page = self.decode_adr() / self.chip.profile().page_size();
            self.mode_since = Some((now, page));
        } else if !mode(value) {
            self.mode_since = None;
        }

        if rising & r.store != 0 && mode(value) {
            let setup = self.mode_since.map(|(t, _)| now - t).unwrap_or(0);
            if setup < dwell.nvs as u64 {
                self.violation(format!("Store strobe after {}us setup", setup));
            }
            self.store_since = Some(now);
        }

        if rising & r.strobe != 0 {
            self.strobe_since = Some(now);
        }
    }

    fn commit_program(&mut self) {
        let region = self.region();
        let offset = self.decode_adr();
        if let Some((_, page)) = self.mode_since {
            if offset / self.chip.profile().page_size() != page {
                self.violation(format!("Program at 0x{:08X} outside page {}", offset, page));
                return;
            }
        }
        let data = self.di.to_le_bytes();
        let lanes: Vec<usize> = match self.chip.profile().layout() {
            Layout::Classic => vec![0, 1, 2, 3],
            Layout::Row => match self.ctrl {
                0x1 => vec![0],
                0x2 => vec![1],
                0x4 => vec![2],
                0x8 => vec![3],
                ctrl => {
                    self.violation(format!("Sub-pulse with CTRL=0x{:X}", ctrl));
                    return;
                },
            },
        };
        let len = self.array(region).len();
        if offset as usize + 4 > len {
            self.violation(format!("Program at 0x{:08X} beyond array", offset));
            return;
        }
        log::trace!("Programming {:?} 0x{:08X} lanes {:?}", region, offset, lanes);
        let array = self.array_mut(region);
        for lane in lanes {
            array[offset as usize + lane] &= data[lane];
        }
    }

    fn commit_sector_erase(&mut self) {
        let region = self.region();
        let size = self.chip.erase_size();
        let start = self.decode_adr() & !(size - 1);
        let len = self.array(region).len() as u32;
        if start >= len {
            self.violation(format!("Sector erase at 0x{:08X} beyond array", start));
            return;
        }
        let end = (start + size).min(len);
        log::trace!("Erasing {:?} 0x{:08X}..0x{:08X}", region, start, end);
        match self.chip.profile().layout() {
            Layout::Classic => self.erase_range(region, start, end, None),
            Layout::Row => {
                let half = self.adr & self.chip.profile().half_select(region) != 0;
                self.erase_range(region, start, end, Some(half));
            },
        }
    }

    fn commit_mass_erase(&mut self) {
        let region = self.region();
        let len = self.array(region).len() as u32;
        match self.chip.profile().layout() {
            Layout::Classic => {
                let unit = match region {
                    MemoryRegion::Main => self.mass_erase_unit,
                    MemoryRegion::Info => len,
                };
                let start = (self.decode_adr() / unit) * unit;
                let end = (start + unit).min(len);
                log::trace!("Mass erasing {:?} 0x{:08X}..0x{:08X}", region, start, end);
                self.erase_range(region, start, end, None);
            },
            Layout::Row => {
                let half = self.adr & self.chip.profile().half_select(region) != 0;
                log::trace!("Mass erasing {:?} half {}", region, half as u8);
                self.erase_range(region, 0, len, Some(half));
            },
        }
    }

    /// Erase words in `start..end`, only those with offset bit 2 equal to
    /// `half` if given.
    fn erase_range(&mut self, region: MemoryRegion, start: u32, end: u32, half: Option<bool>) {
        let array = self.array_mut(region);
        for word in (start..end).step_by(4) {
            if half.map(|h| (word & 0x4 != 0) == h).unwrap_or(true) {
                let w = word as usize;
                array[w..w + 4].copy_from_slice(&[0xFF; 4]);
            }
        }
    }

    fn ram_u32(&self, address: u32) -> anyhow::Result<u32> {
        let mut word = [0u8; 4];
        self.memory_read(address, &mut word)?;
        Ok(u32::from_le_bytes(word))
    }

    /// Collect the words a FIFO-framed routine consumes, updating the read pointer.
    fn drain_fifo(&mut self, args: &AlgorithmArgs) -> anyhow::Result<Vec<u8>> {
        let fifo_start = args.buffer_start + 8;
        let wp = self.ram_u32(args.buffer_start)?;
        let mut rp = self.ram_u32(args.buffer_start + 4)?;
        if wp == 0 {
            bail!("Write routine aborted by host");
        }
        let mut data = Vec::with_capacity(args.count as usize * 4);
        for _ in 0..args.count {
            if rp == wp {
                bail!("Write routine starved of data at 0x{:08X}", rp);
            }
            let mut word = [0u8; 4];
            self.memory_read(rp, &mut word)?;
            data.extend_from_slice(&word);
            rp += 4;
            if rp >= args.buffer_end {
                rp = fifo_start;
            }
        }
        self.memory_write(args.buffer_start + 4, &rp.to_le_bytes())?;
        Ok(data)
    }

    /// Execute the write routine's semantics in place using the on-chip bus.
    fn execute_routine(&mut self, args: &mut AlgorithmArgs, timeout: Duration)
        -> anyhow::Result<()>
    {
        let data = match self.chip.architecture() {
            Architecture::Arm => self.drain_fifo(args)?,
            Architecture::RiscV => {
                let mut data = vec![0u8; args.count as usize * 4];
                if args.buffer_start + data.len() as u32 > args.buffer_end {
                    bail!("Write routine word count overruns its buffer");
                }
                self.memory_read(args.buffer_start, &mut data)?;
                data
            },
        };

        let start_us = self.now_us;
        let profile = self.chip.profile();
        let region = self.region();
        let window = self.window(region);
        let base = self.controller.base;
        let cmd = self.cmd;
        let first = self.routine_words;

        // Words to program before the injected failure, if it falls in this run.
        let words = data.len() / 4;
        let fail = self.routine_fault
            .filter(|n| *n >= first && *n < first + words)
            .map(|n| n - first);
        let good = fail.unwrap_or(words);

        let mut bus = OnChip { emu: self };
        let mut seq = Sequencer::new(&mut bus, profile, base, region, cmd);
        let result = match profile.architecture() {
            // The ARM routine runs the full program cycle for each word.
            Architecture::Arm => data[..good * 4].chunks(4).enumerate().try_for_each(|(i, w)| {
                seq.program((args.address + 4 * i as u32) & window, w, |_| ())
            }),
            Architecture::RiscV => seq.program(args.address & window, &data[..good * 4], |_| ()),
        };
        result?;

        self.routine_words += good;
        args.address += 4 * good as u32;
        args.base = if fail.is_some() { 1 } else { 0 };

        let elapsed = self.now_us - start_us;
        if elapsed > timeout.as_micros() as u64 {
            bail!("Write routine timed out after {}us", elapsed);
        }
        Ok(())
    }
}

#[derive(Copy, Clone, Debug)]
enum MemoryKind {
    Main,
    Info,
    Ram,
}

/// Controller access from code running on the emulated CPU: no debug-port
/// transactions, dwells advance emulated time directly.
struct OnChip<'a> {
    emu: &'a mut Emulator,
}

impl<'a> ControllerBus for OnChip<'a> {
    fn write_reg(&mut self, address: u32, value: u32) -> crate::Result<()> {
        Ok(self.emu.bus_write(address, value)?)
    }

    fn read_reg(&mut self, address: u32) -> crate::Result<u32> {
        Ok(self.emu.bus_read(address)?)
    }

    fn delay_us(&mut self, us: u32) {
        self.emu.now_us += us as u64;
    }
}

impl Target for Emulator {
    fn is_halted(&mut self) -> bool {
        self.halted
    }

    fn read_u32(&mut self, address: u32) -> anyhow::Result<u32> {
        self.transactions += 1;
        self.bus_read(address)
    }

    fn write_u32(&mut self, address: u32, value: u32) -> anyhow::Result<()> {
        self.transactions += 1;
        if let Some(fault) = self.write_fault.as_mut() {
            if fault.address == address {
                fault.remaining -= 1;
                if fault.remaining == 0 {
                    self.write_fault = None;
                    bail!("Injected fault writing 0x{:08X} to 0x{:08X}", value, address);
                }
            }
        }
        if address == self.controller.reg(controller::KEY) {
            self.key_writes.push(value);
        }
        self.bus_write(address, value)
    }

    fn read_memory(&mut self, address: u32, data: &mut [u8]) -> anyhow::Result<()> {
        self.transactions += 1;
        self.memory_read(address, data)
    }

    fn write_memory(&mut self, address: u32, data: &[u8]) -> anyhow::Result<()> {
        self.transactions += 1;
        self.memory_write(address, data)
    }

    fn alloc_working_area(&mut self, size: u32) -> anyhow::Result<WorkingArea> {
        let size = (size + 3) & !0x3;
        let base = self.chip.ram_base();
        let end = base + self.ram.len() as u32;
        let mut areas = self.areas.clone();
        areas.sort_by_key(|a| a.address);
        let mut address = base;
        for area in areas.iter() {
            if area.address >= address + size {
                break;
            }
            address = address.max(area.end());
        }
        if address + size > end {
            bail!("No {} byte working area available", size);
        }
        let area = WorkingArea { address, size };
        self.areas.push(area);
        Ok(area)
    }

    fn free_working_area(&mut self, area: WorkingArea) {
        self.areas.retain(|a| *a != area);
    }

    fn run_algorithm(&mut self, entry: u32, args: &mut AlgorithmArgs, timeout: Duration)
        -> anyhow::Result<()>
    {
        if !self.halted {
            bail!("Target not halted");
        }
        if !self.areas.iter().any(|a| a.address == entry) {
            bail!("No routine loaded at 0x{:08X}", entry);
        }
        self.routine_runs += 1;
        self.execute_routine(args, timeout)
    }

    fn sleep_us(&mut self, us: u32) {
        self.now_us += us as u64;
    }
}

//! Command sequencer for the program, sector erase and mass erase waveforms.
//!
//! The sequencer only issues register writes and dwells through a
//! [`ControllerBus`], so the same waveform can be driven from the host over
//! the debug link or executed in place by a target-resident routine.

use crate::controller::{self, classic, row};
use crate::profile::{ChipProfile, Layout, MemoryRegion};
use crate::{Target, Result};

/// Register-level access to the flash controller.
pub trait ControllerBus {
    fn write_reg(&mut self, address: u32, value: u32) -> Result<()>;
    fn read_reg(&mut self, address: u32) -> Result<u32>;
    /// Wait at least `us` microseconds.
    fn delay_us(&mut self, us: u32);
}

/// Host-sequenced bus: every register write is one debug-port transaction
/// and every dwell is a host-side sleep.
pub struct DebugLink<'a, T: Target + ?Sized>(pub &'a mut T);

impl<'a, T: Target + ?Sized> ControllerBus for DebugLink<'a, T> {
    fn write_reg(&mut self, address: u32, value: u32) -> Result<()> {
        log::trace!("write 0x{:08X} <- 0x{:08X}", address, value);
        Ok(self.0.write_u32(address, value)?)
    }

    fn read_reg(&mut self, address: u32) -> Result<u32> {
        let value = self.0.read_u32(address)?;
        log::trace!("read 0x{:08X} -> 0x{:08X}", address, value);
        Ok(value)
    }

    fn delay_us(&mut self, us: u32) {
        self.0.sleep_us(us);
    }
}

/// Drives one controller through the waveforms of a chip profile.
///
/// `cmd` shadows the CMD register and must hold its register access mode
/// value when the sequencer is created; every waveform returns CMD to it.
pub struct Sequencer<'a, B: ControllerBus + ?Sized> {
    bus: &'a mut B,
    profile: ChipProfile,
    base: u32,
    region: MemoryRegion,
    cmd: u32,
}

impl<'a, B: ControllerBus + ?Sized> Sequencer<'a, B> {
    pub fn new(bus: &'a mut B, profile: ChipProfile, base: u32, region: MemoryRegion, cmd: u32)
        -> Self
    {
        Sequencer { bus, profile, base, region, cmd }
    }

    /// Current value of the CMD shadow.
    pub fn cmd(&self) -> u32 {
        self.cmd
    }

    /// Program `data` at byte `offset` of the bank.
    ///
    /// `data.len()` must be a multiple of 4. Programming is split so no
    /// single program-mode assertion crosses a page boundary; `cb` is called
    /// with the number of bytes programmed after each page.
    pub fn program<F: FnMut(usize)>(&mut self, offset: u32, data: &[u8], mut cb: F)
        -> Result<()>
    {
        let page_size = self.profile.page_size();
        let mut done = 0;
        while done < data.len() {
            let address = offset + done as u32;
            let page_end = (address & !(page_size - 1)) + page_size;
            let n = ((page_end - address) as usize).min(data.len() - done);
            self.program_page(address, &data[done..done + n])?;
            done += n;
            cb(done);
        }
        Ok(())
    }

    fn program_page(&mut self, offset: u32, data: &[u8]) -> Result<()> {
        log::trace!("Programming {} bytes at offset 0x{:08X}", data.len(), offset);
        let t = self.profile.timings();

        // Latch the page address for the mode assertion.
        self.latch_address(offset)?;

        match self.profile.layout() {
            Layout::Classic => {
                self.set(classic::XE | classic::PROG)?;
                self.bus.delay_us(t.nvs);
                self.set(classic::NVSTR)?;
                self.bus.delay_us(t.pgs);
                for (i, word) in data.chunks_exact(4).enumerate() {
                    self.latch_word(offset + 4 * i as u32, word)?;
                    self.pulse(classic::YE, t.prog, t.adh)?;
                }
                self.clear(classic::PROG)?;
                self.bus.delay_us(t.nvh);
                self.clear(classic::XE | classic::NVSTR)?;
                self.bus.delay_us(t.rcv);
            },
            Layout::Row => {
                self.set(row::CE | row::PROG)?;
                self.bus.delay_us(t.nvs);
                self.set(row::WE)?;
                self.bus.delay_us(t.pgs);
                for (i, word) in data.chunks_exact(4).enumerate() {
                    self.latch_word(offset + 4 * i as u32, word)?;
                    // Each byte lane of the word is programmed by its own sub-pulse.
                    for lane in 0..4 {
                        self.bus.write_reg(self.reg(controller::CTRL), 1 << lane)?;
                        self.bus.delay_us(t.ads);
                        self.pulse(row::PROG2, t.prog, t.adh)?;
                    }
                }
                self.bus.delay_us(t.pgh);
                self.clear(row::WE)?;
                self.bus.delay_us(t.rcv);
                self.clear(row::CE | row::PROG)?;
                self.bus.delay_us(t.rw);
            },
        }
        Ok(())
    }

    /// Erase the sector of `size` bytes at byte `offset` of the bank.
    pub fn erase_sector(&mut self, offset: u32, size: u32) -> Result<()> {
        log::trace!("Erasing {} byte sector at offset 0x{:08X}", size, offset);
        let t = self.profile.timings();
        match self.profile.layout() {
            Layout::Classic => {
                self.bus.write_reg(self.reg(controller::ADR), offset)?;
                self.set(classic::XE | classic::ERASE)?;
                self.bus.delay_us(t.nvs);
                self.set(classic::NVSTR)?;
                self.bus.delay_us(t.erase);
                self.clear(classic::ERASE)?;
                self.bus.delay_us(t.nvh);
                self.clear(classic::XE | classic::NVSTR)?;
                self.bus.delay_us(t.rcv);
            },
            Layout::Row => {
                // Lower and upper halves of the sector are erased separately.
                for half in 0..2 {
                    let address = offset / 2 | half * self.profile.half_select(self.region);
                    self.bus.write_reg(self.reg(controller::ADR), address)?;
                    self.set(row::CE | row::ERASE)?;
                    self.bus.delay_us(t.nvs);
                    self.set(row::WE)?;
                    self.bus.delay_us(t.erase);
                    self.clear(row::WE)?;
                    self.bus.delay_us(t.rcv);
                    self.clear(row::CE | row::ERASE)?;
                    self.bus.delay_us(t.rcv);
                }
            },
        }
        Ok(())
    }

    /// Erase the whole array of `size` bytes, one erase unit of
    /// `size / bank_count` bytes at a time.
    pub fn mass_erase(&mut self, size: u32, bank_count: u32) -> Result<()> {
        let t = self.profile.timings();
        let unit = size / bank_count;
        for i in 0..bank_count {
            log::trace!("Mass erasing unit {} of {}", i, bank_count);
            match self.profile.layout() {
                Layout::Classic => {
                    self.bus.write_reg(self.reg(controller::ADR), i * unit)?;
                    self.set(classic::XE | classic::MAS1 | classic::ERASE)?;
                    self.bus.delay_us(t.nvs);
                    self.set(classic::NVSTR)?;
                    self.bus.delay_us(t.mass_erase);
                    self.clear(classic::ERASE)?;
                    self.bus.delay_us(t.nvh1);
                    self.clear(classic::XE | classic::MAS1 | classic::NVSTR)?;
                    self.bus.delay_us(t.rcv);
                },
                Layout::Row => {
                    let address = i * self.profile.half_select(self.region);
                    self.bus.write_reg(self.reg(controller::ADR), address)?;
                    self.set(row::CE | row::CHIP | row::ERASE)?;
                    self.bus.delay_us(t.nvs);
                    self.set(row::WE)?;
                    self.bus.delay_us(t.mass_erase);
                    self.clear(row::WE)?;
                    self.bus.delay_us(t.nvh1);
                    self.clear(row::CE | row::CHIP | row::ERASE)?;
                    self.bus.delay_us(t.rcv);
                },
            }
        }
        Ok(())
    }

    /// Read one word at byte `offset` through the controller's data-out register.
    pub fn read_word(&mut self, offset: u32) -> Result<u32> {
        self.latch_address(offset)?;
        let sense = match self.profile.layout() {
            Layout::Classic => classic::XE | classic::YE | classic::SE,
            Layout::Row => row::CE | row::RE,
        };
        self.bus.write_reg(self.reg(controller::CMD), self.cmd | sense)?;
        let value = self.bus.read_reg(self.reg(controller::DO))?;
        self.bus.write_reg(self.reg(controller::CMD), self.cmd)?;
        Ok(value)
    }

    fn reg(&self, offset: u32) -> u32 {
        self.base + offset
    }

    fn latch_address(&mut self, offset: u32) -> Result<()> {
        let address = self.profile.encode_address(offset, self.region);
        self.bus.write_reg(self.reg(controller::ADR), address)
    }

    fn latch_word(&mut self, offset: u32, word: &[u8]) -> Result<()> {
        self.latch_address(offset)?;
        let value = u32::from_le_bytes([word[0], word[1], word[2], word[3]]);
        self.bus.write_reg(self.reg(controller::DI), value)
    }

    fn pulse(&mut self, strobe: u32, width: u32, hold: u32) -> Result<()> {
        self.set(strobe)?;
        self.bus.delay_us(width);
        self.clear(strobe)?;
        self.bus.delay_us(hold);
        Ok(())
    }

    fn set(&mut self, bits: u32) -> Result<()> {
        self.cmd |= bits;
        self.bus.write_reg(self.reg(controller::CMD), self.cmd)
    }

    fn clear(&mut self, bits: u32) -> Result<()> {
        self.cmd &= !bits;
        self.bus.write_reg(self.reg(controller::CMD), self.cmd)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Eq, PartialEq)]
    enum Op {
        Write(u32, u32),
        Delay(u32),
    }

    #[derive(Default)]
    struct Recorder(Vec<Op>);

    impl ControllerBus for Recorder {
        fn write_reg(&mut self, address: u32, value: u32) -> Result<()> {
            self.0.push(Op::Write(address - 0x4001_8000, value));
            Ok(())
        }

        fn read_reg(&mut self, _address: u32) -> Result<u32> {
            Ok(0x1234_5678)
        }

        fn delay_us(&mut self, us: u32) {
            self.0.push(Op::Delay(us));
        }
    }

    const BASE: u32 = 0x4001_8000;

    #[test]
    fn test_classic_program_waveform() {
        use Op::*;
        let mut bus = Recorder::default();
        let cmd = controller::cmd::CON;
        let mut seq = Sequencer::new(&mut bus, ChipProfile::Mdr32Fx, BASE, MemoryRegion::Main, cmd);
        seq.program(0x100, &[1, 0, 0, 0], |_| ()).unwrap();
        assert_eq!(seq.cmd(), cmd);
        assert_eq!(bus.0, vec![
            Write(0x04, 0x100),
            Write(0x00, 0x1041), Delay(6),
            Write(0x00, 0x3041), Delay(11),
            Write(0x04, 0x100), Write(0x08, 1),
            Write(0x00, 0x30C1), Delay(30),
            Write(0x00, 0x3041), Delay(1),
            Write(0x00, 0x2041), Delay(6),
            Write(0x00, 0x0001), Delay(11),
        ]);
    }

    #[test]
    fn test_row_program_sub_pulses() {
        let mut bus = Recorder::default();
        let mut seq = Sequencer::new(&mut bus, ChipProfile::Mdr1206Afi, BASE,
                                     MemoryRegion::Info, row::TMEN);
        seq.program(0x8, &[0xAA; 8], |_| ()).unwrap();
        let lanes: Vec<u32> = bus.0.iter().filter_map(|op| match op {
            Op::Write(0x14, v) => Some(*v),
            _ => None,
        }).collect();
        assert_eq!(lanes, vec![1, 2, 4, 8, 1, 2, 4, 8]);
        let addresses: Vec<u32> = bus.0.iter().filter_map(|op| match op {
            Op::Write(0x04, v) => Some(*v),
            _ => None,
        }).collect();
        assert_eq!(addresses, vec![0x4, 0x4, 0x4 | 1 << 13]);
        let pulses = bus.0.iter().filter(|op| **op == Op::Delay(5)).count();
        assert_eq!(pulses, 8);
    }

    #[test]
    fn test_program_splits_pages() {
        let mut bus = Recorder::default();
        let mut seq = Sequencer::new(&mut bus, ChipProfile::Mdr1206Fi, BASE,
                                     MemoryRegion::Main, classic::TMR);
        let mut progress = Vec::new();
        seq.program(504, &[0u8; 16], |n| progress.push(n)).unwrap();
        assert_eq!(progress, vec![8, 16]);
        let modes = bus.0.iter().filter(|op| match op {
            Op::Write(0x00, v) => *v & classic::NVSTR != 0 && *v & classic::YE == 0
                                  && *v & classic::PROG != 0,
            _ => false,
        }).count();
        // One NVSTR assertion per page, plus restoring it after each YE pulse.
        assert_eq!(modes, 2 + 4);
    }

    #[test]
    fn test_row_erase_halves() {
        let mut bus = Recorder::default();
        let mut seq = Sequencer::new(&mut bus, ChipProfile::Mdr1206Afi, BASE,
                                     MemoryRegion::Main, 0);
        seq.erase_sector(3 * 1024, 1024).unwrap();
        assert_eq!(seq.cmd(), 0);
        let addresses: Vec<u32> = bus.0.iter().filter_map(|op| match op {
            Op::Write(0x04, v) => Some(*v),
            _ => None,
        }).collect();
        assert_eq!(addresses, vec![1536, 1536 | 1 << 18]);
    }

    #[test]
    fn test_mass_erase_units() {
        let mut bus = Recorder::default();
        let mut seq = Sequencer::new(&mut bus, ChipProfile::Mdr32Fx, BASE, MemoryRegion::Main, 0);
        seq.mass_erase(512 * 1024, 2).unwrap();
        let addresses: Vec<u32> = bus.0.iter().filter_map(|op| match op {
            Op::Write(0x04, v) => Some(*v),
            _ => None,
        }).collect();
        assert_eq!(addresses, vec![0, 256 * 1024]);
        assert_eq!(bus.0.iter().filter(|op| **op == Op::Delay(30_000)).count(), 2);
    }

    #[test]
    fn test_read_word_restores_cmd() {
        let mut bus = Recorder::default();
        let cmd = controller::cmd::CON | classic::IFREN;
        let mut seq = Sequencer::new(&mut bus, ChipProfile::Mdr32Fx, BASE, MemoryRegion::Info, cmd);
        assert_eq!(seq.read_word(0x10).unwrap(), 0x1234_5678);
        assert_eq!(bus.0, vec![
            Op::Write(0x04, 0x10),
            Op::Write(0x00, cmd | 0x1C0),
            Op::Write(0x00, cmd),
        ]);
    }

    #[test]
    fn test_row_read_word_uses_read_enable() {
        let mut bus = Recorder::default();
        let cmd = controller::cmd::CON | row::TMEN | row::NVR;
        let mut seq = Sequencer::new(&mut bus, ChipProfile::Mdr1206Afi, BASE,
                                     MemoryRegion::Info, cmd);
        assert_eq!(seq.read_word(0xC).unwrap(), 0x1234_5678);
        assert_eq!(bus.0, vec![
            Op::Write(0x04, 0x4 | 1 << 13),
            Op::Write(0x00, cmd | row::CE | row::RE),
            Op::Write(0x00, cmd),
        ]);
    }
}

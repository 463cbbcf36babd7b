//! Chip profile registry.
//!
//! Maps the target architecture and, for RISC-V parts, the probed CHIP_ID
//! onto the controller bit layout, address encoding, geometry, timings and
//! write routine used by every flash operation.

use std::borrow::Cow;
use std::convert::TryFrom;
use num_enum::TryFromPrimitive;

use crate::controller::{self, classic, row, Controller};
use crate::{Target, Architecture, Error, Result};

/// Known MDR1206 chip identifiers, as found in CHIP_ID bits 2..=9.
#[derive(Copy, Clone, Debug, Eq, PartialEq, TryFromPrimitive)]
#[allow(non_camel_case_types)]
#[repr(u32)]
pub enum ChipId {
    MDR1206AFI = 215,
    MDR1206FI = 217,
}

impl ChipId {
    /// Decode the raw CHIP_ID register value.
    ///
    /// Returns the extracted identifier on failure, zero meaning no identifier.
    pub fn from_register(raw: u32) -> std::result::Result<Self, u32> {
        let id = (raw >> 2) & 0xFF;
        Self::try_from(id).map_err(|_| id)
    }

    pub fn name(&self) -> &'static str {
        match self {
            ChipId::MDR1206AFI => "MDR1206AFI",
            ChipId::MDR1206FI => "MDR1206FI",
        }
    }
}

impl std::fmt::Display for ChipId {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{} (CHIP_ID = {})", self.name(), *self as u32)
    }
}

/// Memory array selected by a flash bank.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum MemoryRegion {
    /// Main program memory.
    Main,
    /// Information (boot/user) memory.
    Info,
}

impl MemoryRegion {
    pub fn name(&self) -> &'static str {
        match self {
            MemoryRegion::Main => "main memory",
            MemoryRegion::Info => "info memory",
        }
    }
}

/// Controller bit layout family.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Layout {
    /// XE/YE/NVSTR controller of MDR32Fx, MDR32F02FI and MDR1206FI.
    Classic,
    /// CE/WE/PROG2 row-addressed controller of MDR1206AFI.
    Row,
}

/// Waveform delays in microseconds.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct Timings {
    /// Mode setup before the store strobe.
    pub nvs: u32,
    /// Sector erase dwell.
    pub erase: u32,
    /// Mass erase dwell.
    pub mass_erase: u32,
    /// Hold after sector erase or program.
    pub nvh: u32,
    /// Hold after mass erase.
    pub nvh1: u32,
    /// Program pulse.
    pub prog: u32,
    /// Store strobe setup before the first program pulse.
    pub pgs: u32,
    /// Recovery after releasing the mode.
    pub rcv: u32,
    /// Program hold after the last pulse of a row.
    pub pgh: u32,
    /// Address and lane setup before a sub-pulse.
    pub ads: u32,
    /// Address hold after a pulse.
    pub adh: u32,
    /// Release after a row program.
    pub rw: u32,
}

/// MDR32F02 and MDR1206FI timings, with ~7% margin for HSI spread.
pub const CLASSIC_TIMINGS: Timings = Timings {
    nvs: 6, erase: 30_000, mass_erase: 30_000, nvh: 6, nvh1: 107,
    prog: 30, pgs: 11, rcv: 11, pgh: 1, ads: 1, adh: 1, rw: 1,
};

/// MDR1206AFI timings, with ~7% margin for HSI spread.
pub const ROW_TIMINGS: Timings = Timings {
    nvs: 86, erase: 2_500, mass_erase: 35_000, nvh: 6, nvh1: 214,
    prog: 5, pgs: 54, rcv: 54, pgh: 1, ads: 1, adh: 1, rw: 1,
};

/// How the write routine expects its data buffer to be laid out.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum BufferFraming {
    /// Data words from buffer start.
    Plain,
    /// Write pointer and read pointer words followed by data, consumed as a ring.
    Fifo,
}

/// A machine-code routine run on the target to program flash words.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct WriteRoutine {
    code: Cow<'static, [u8]>,
    framing: BufferFraming,
}

impl WriteRoutine {
    pub fn new(code: Vec<u8>, framing: BufferFraming) -> Self {
        WriteRoutine { code: Cow::Owned(code), framing }
    }

    pub const fn builtin(code: &'static [u8], framing: BufferFraming) -> Self {
        WriteRoutine { code: Cow::Borrowed(code), framing }
    }

    pub fn code(&self) -> &[u8] {
        &self.code
    }

    pub fn framing(&self) -> BufferFraming {
        self.framing
    }
}

/// Thumb routine for MDR32Fx, see contrib/loaders/flash/mdr32fx.S.
///
/// r0: controller base in, status out; r1: word count; r2: FIFO start;
/// r3: FIFO end; r4: target address.
static MDR32FX_WRITE_CODE: [u8; 132] = [
    0x07, 0x68, 0x16, 0x68, 0x00, 0x2e, 0x2e, 0xd0, 0x55, 0x68, 0xb5, 0x42,
    0xf9, 0xd0, 0x2e, 0x68, 0x44, 0x60, 0x86, 0x60, 0x17, 0x4e, 0x37, 0x43,
    0x07, 0x60, 0x05, 0x26, 0x00, 0xf0, 0x25, 0xf8, 0x15, 0x4e, 0x37, 0x43,
    0x07, 0x60, 0x0d, 0x26, 0x00, 0xf0, 0x1f, 0xf8, 0x80, 0x26, 0x37, 0x43,
    0x07, 0x60, 0x3d, 0x26, 0x00, 0xf0, 0x19, 0xf8, 0x80, 0x26, 0xb7, 0x43,
    0x07, 0x60, 0x0f, 0x4e, 0xb7, 0x43, 0x07, 0x60, 0x05, 0x26, 0x00, 0xf0,
    0x10, 0xf8, 0x0d, 0x4e, 0xb7, 0x43, 0x07, 0x60, 0x04, 0x35, 0x04, 0x34,
    0x9d, 0x42, 0x01, 0xd3, 0x15, 0x46, 0x08, 0x35, 0x55, 0x60, 0x01, 0x39,
    0x00, 0x29, 0x00, 0xd0, 0xcd, 0xe7, 0x30, 0x46, 0x00, 0xbe, 0x01, 0x3e,
    0x00, 0x2e, 0xfc, 0xd1, 0x70, 0x47, 0x00, 0x00, 0x40, 0x10, 0x00, 0x00,
    0x00, 0x20, 0x00, 0x00, 0x00, 0x10, 0x00, 0x00, 0x40, 0x20, 0x00, 0x00,
];

/// Fixed bank geometry assigned at probe time.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct Geometry {
    pub base: u32,
    pub size: u32,
    pub sector_count: u32,
    pub bank_count: u32,
}

/// Manufacturer calibration bytes which must survive erase and write.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct CalibrationRegion {
    /// Offset from the bank base.
    pub offset: u32,
    pub size: u32,
}

/// Size of every calibration region: 28 calibration and 4 protection bytes.
pub const CALIBRATION_SIZE: usize = 32;

/// Everything that differs between supported controllers.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum ChipProfile {
    /// ARM MDR32Fx.
    Mdr32Fx,
    /// RISC-V MDR32F02FI, also used when no CHIP_ID is available.
    Mdr32F02Fi,
    /// RISC-V MDR1206AFI, CHIP_ID 215.
    Mdr1206Afi,
    /// RISC-V MDR1206FI, CHIP_ID 217.
    Mdr1206Fi,
}

impl ChipProfile {
    pub fn name(&self) -> &'static str {
        match self {
            ChipProfile::Mdr32Fx => "MDR32Fx",
            ChipProfile::Mdr32F02Fi => "MDR32F02FI",
            ChipProfile::Mdr1206Afi => ChipId::MDR1206AFI.name(),
            ChipProfile::Mdr1206Fi => ChipId::MDR1206FI.name(),
        }
    }

    pub fn architecture(&self) -> Architecture {
        match self {
            ChipProfile::Mdr32Fx => Architecture::Arm,
            _ => Architecture::RiscV,
        }
    }

    pub fn chip_id(&self) -> Option<ChipId> {
        match self {
            ChipProfile::Mdr1206Afi => Some(ChipId::MDR1206AFI),
            ChipProfile::Mdr1206Fi => Some(ChipId::MDR1206FI),
            _ => None,
        }
    }

    pub fn layout(&self) -> Layout {
        match self {
            ChipProfile::Mdr1206Afi => Layout::Row,
            _ => Layout::Classic,
        }
    }

    pub fn timings(&self) -> Timings {
        match self {
            ChipProfile::Mdr1206Afi => ROW_TIMINGS,
            _ => CLASSIC_TIMINGS,
        }
    }

    /// Bytes programmed under one program-mode assertion.
    pub fn page_size(&self) -> u32 {
        match self {
            ChipProfile::Mdr32Fx | ChipProfile::Mdr32F02Fi => 4096,
            ChipProfile::Mdr1206Fi => 512,
            ChipProfile::Mdr1206Afi => 128,
        }
    }

    /// Test-mode-disable bits which must accompany register access mode.
    pub fn extra_flags(&self) -> u32 {
        match self {
            ChipProfile::Mdr32Fx => 0,
            ChipProfile::Mdr32F02Fi | ChipProfile::Mdr1206Fi => classic::TMR,
            ChipProfile::Mdr1206Afi => row::TMEN,
        }
    }

    /// CMD bit which selects the info array.
    pub fn region_flag(&self, region: MemoryRegion) -> u32 {
        match (region, self.layout()) {
            (MemoryRegion::Main, _) => 0,
            (MemoryRegion::Info, Layout::Classic) => classic::IFREN,
            (MemoryRegion::Info, Layout::Row) => row::NVR,
        }
    }

    /// Whether the controller has the CTRL lane selector.
    pub fn has_ctrl(&self) -> bool {
        self.chip_id().is_some()
    }

    /// Upper/lower half select bit of the row-addressed layout.
    pub fn half_select(&self, region: MemoryRegion) -> u32 {
        match region {
            MemoryRegion::Main => 1 << 18,
            MemoryRegion::Info => 1 << 13,
        }
    }

    /// Encode a byte offset within the bank for the ADR register.
    pub fn encode_address(&self, offset: u32, region: MemoryRegion) -> u32 {
        match self.layout() {
            Layout::Classic => offset,
            Layout::Row => {
                let mut address = (offset >> 1) & !0x3;
                if offset & (1 << 2) != 0 {
                    address |= self.half_select(region);
                }
                address
            },
        }
    }

    /// Built-in write routine, if one ships for this profile.
    ///
    /// RISC-V routines are not built in and must be supplied to the bank,
    /// otherwise RISC-V parts default to host-sequenced writes.
    pub fn write_routine(&self) -> Option<WriteRoutine> {
        match self {
            ChipProfile::Mdr32Fx =>
                Some(WriteRoutine::builtin(&MDR32FX_WRITE_CODE, BufferFraming::Fifo)),
            _ => None,
        }
    }

    /// Framing expected by routines for this profile.
    pub fn routine_framing(&self) -> BufferFraming {
        match self.architecture() {
            Architecture::Arm => BufferFraming::Fifo,
            Architecture::RiscV => BufferFraming::Plain,
        }
    }

    /// Fixed geometry, overriding the declared bank, for identified chips.
    pub fn geometry(&self, region: MemoryRegion) -> Option<Geometry> {
        match (self, region) {
            (ChipProfile::Mdr1206Afi, MemoryRegion::Main) => Some(Geometry {
                base: 0x1000_0000, size: 512 * 1024, sector_count: 512, bank_count: 2,
            }),
            (ChipProfile::Mdr1206Afi, MemoryRegion::Info) => Some(Geometry {
                base: 0x0002_0000, size: 15 * 1024, sector_count: 15, bank_count: 2,
            }),
            (ChipProfile::Mdr1206Fi, MemoryRegion::Main) => Some(Geometry {
                base: 0x1000_0000, size: 512 * 1024, sector_count: 128, bank_count: 2,
            }),
            (ChipProfile::Mdr1206Fi, MemoryRegion::Info) => Some(Geometry {
                base: 0x0002_0000, size: 16 * 1024, sector_count: 4, bank_count: 2,
            }),
            _ => None,
        }
    }

    pub fn calibration(&self, region: MemoryRegion) -> Option<CalibrationRegion> {
        let size = CALIBRATION_SIZE as u32;
        match (self, region) {
            (ChipProfile::Mdr1206Afi, MemoryRegion::Info) =>
                Some(CalibrationRegion { offset: 0x3BE0, size }),
            (ChipProfile::Mdr1206Fi, MemoryRegion::Info) =>
                Some(CalibrationRegion { offset: 0x3FE0, size }),
            _ => None,
        }
    }
}

/// A resolved profile and the controller instance it was found at.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct Resolution {
    pub profile: ChipProfile,
    pub controller: Controller,
}

/// Resolve the chip profile for a target of architecture `arch`.
///
/// ARM targets always use the MDR32Fx profile. RISC-V targets are probed for
/// the MDR1206 register map; if it is inaccessible the MDR32F02FI profile is
/// used at the default controller address. An unknown non-zero CHIP_ID is an
/// error.
pub fn resolve<T: Target + ?Sized>(target: &mut T, arch: Architecture) -> Result<Resolution> {
    if arch == Architecture::Arm {
        return Ok(Resolution { profile: ChipProfile::Mdr32Fx, controller: Controller::DEFAULT });
    }

    let controller = Controller::MDR1206;
    let raw = match controller.probe_identifier(target) {
        Ok(raw) => raw,
        Err(e) => {
            log::debug!("MDR1206 register probe failed: {}", e);
            log::info!("MDR32RV: CHIP_ID_CTRL register is not accessible, \
                        using MDR32F02FI register map.");
            return Ok(Resolution {
                profile: ChipProfile::Mdr32F02Fi,
                controller: Controller::DEFAULT,
            });
        },
    };

    match ChipId::from_register(raw) {
        Ok(id) => {
            log::info!("MDR32RV: found {}", id);
            let profile = match id {
                ChipId::MDR1206AFI => ChipProfile::Mdr1206Afi,
                ChipId::MDR1206FI => ChipProfile::Mdr1206Fi,
            };
            Ok(Resolution { profile, controller })
        },
        Err(0) => {
            log::warn!("MDR32RV: CHIP_ID is zero, using MDR32F02FI parameters");
            Ok(Resolution { profile: ChipProfile::Mdr32F02Fi, controller })
        },
        Err(id) => {
            log::error!("MDR32RV: CHIP_ID = {} is unsupported", id);
            Err(Error::UnsupportedChip(id))
        },
    }
}

/// Baseline CMD value for register access mode on `profile`.
pub fn access_mode(profile: ChipProfile, region: MemoryRegion, cmd: u32) -> u32 {
    (cmd & controller::DELAY_MASK) | controller::cmd::CON
        | profile.extra_flags() | profile.region_flag(region)
}

#[test]
fn test_chip_id_decode() {
    assert_eq!(ChipId::from_register(215 << 2), Ok(ChipId::MDR1206AFI));
    assert_eq!(ChipId::from_register((217 << 2) | 0x3 | 0xFFFF_0000),
               Ok(ChipId::MDR1206FI));
    assert_eq!(ChipId::from_register(0), Err(0));
    assert_eq!(ChipId::from_register(100 << 2), Err(100));
}

#[test]
fn test_row_address_encoding() {
    let p = ChipProfile::Mdr1206Afi;
    assert_eq!(p.encode_address(0x0, MemoryRegion::Main), 0x0);
    assert_eq!(p.encode_address(0x4, MemoryRegion::Main), 1 << 18);
    assert_eq!(p.encode_address(0x8, MemoryRegion::Main), 0x4);
    assert_eq!(p.encode_address(0xC, MemoryRegion::Info), 0x4 | 1 << 13);
    assert_eq!(p.encode_address(0x3BE0, MemoryRegion::Info), 0x1DF0);
    assert_eq!(ChipProfile::Mdr1206Fi.encode_address(0xC, MemoryRegion::Main), 0xC);
}

#[test]
fn test_geometry_consistent() {
    let profiles = [ChipProfile::Mdr32Fx, ChipProfile::Mdr32F02Fi,
                    ChipProfile::Mdr1206Afi, ChipProfile::Mdr1206Fi];
    for profile in profiles.iter() {
        for region in [MemoryRegion::Main, MemoryRegion::Info].iter() {
            if let Some(g) = profile.geometry(*region) {
                assert_eq!(g.size % g.sector_count, 0);
                assert_eq!(g.size % profile.page_size(), 0);
            }
            if let Some(c) = profile.calibration(*region) {
                let g = profile.geometry(*region).unwrap();
                assert!(c.offset + c.size <= g.size);
            }
        }
    }
}

#[test]
fn test_builtin_write_routines() {
    let routine = ChipProfile::Mdr32Fx.write_routine().unwrap();
    assert_eq!(routine.code().len(), 132);
    assert_eq!(routine.framing(), BufferFraming::Fifo);
    assert!(ChipProfile::Mdr32F02Fi.write_routine().is_none());
    assert!(ChipProfile::Mdr1206Afi.write_routine().is_none());
    assert!(ChipProfile::Mdr1206Fi.write_routine().is_none());
}

//! Execution strategies for programming a block of flash.
//!
//! The accelerated strategy uploads a write routine and streams data through
//! a working-area buffer, running the routine once per buffer. The
//! host-sequenced strategy drives every waveform step over the debug link.
//! Both program the same bytes at the same offsets.

use std::time::Duration;

use crate::controller::Controller;
use crate::profile::{BufferFraming, ChipProfile, MemoryRegion, WriteRoutine};
use crate::sequencer::{DebugLink, Sequencer};
use crate::working_area::with_algorithm_areas;
use crate::{Target, AlgorithmArgs, Error, Result};

/// Upper bound on one run of the write routine.
pub const ALGORITHM_TIMEOUT: Duration = Duration::from_millis(1000);

/// Size of the write and read pointer header of a FIFO buffer.
const FIFO_HEADER: u32 = 8;

/// Which strategy serviced a write.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Strategy {
    Accelerated,
    HostSequenced,
}

/// What both strategies need to know about the bank being written.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct WriteParams {
    pub profile: ChipProfile,
    pub controller: Controller,
    pub region: MemoryRegion,
    /// Absolute address of bank offset 0.
    pub bank_base: u32,
}

/// Program `data` at `offset`, using `routine` if one is given and working
/// areas are available, otherwise sequencing from the host.
///
/// The controller must already be unlocked and in register access mode,
/// with CMD equal to `cmd`.
pub fn write<T, F>(target: &mut T, params: &WriteParams, cmd: u32,
                   routine: Option<&WriteRoutine>, offset: u32, data: &[u8], mut cb: F)
    -> Result<Strategy>
    where T: Target + ?Sized,
          F: FnMut(usize),
{
    if let Some(routine) = routine {
        match write_accelerated(target, params, routine, offset, data, &mut cb) {
            Ok(()) => return Ok(Strategy::Accelerated),
            Err(Error::ResourceExhausted) => {
                log::warn!("Can't use block writes, falling back to single memory accesses");
            },
            Err(e) => return Err(e),
        }
    } else {
        log::info!("No write routine for {}, using host-sequenced writes",
                   params.profile.name());
    }
    write_host(target, params, cmd, offset, data, cb)?;
    Ok(Strategy::HostSequenced)
}

/// Program `data` at `offset` by running `routine` on the target.
///
/// Returns `Error::ResourceExhausted` without touching flash if the working
/// areas cannot be allocated.
pub fn write_accelerated<T, F>(target: &mut T, params: &WriteParams, routine: &WriteRoutine,
                               offset: u32, data: &[u8], mut cb: F)
    -> Result<()>
    where T: Target + ?Sized,
          F: FnMut(usize),
{
    with_algorithm_areas(target, routine.code(), |target, areas| {
        let buffer = areas.buffer;
        let header = match routine.framing() {
            BufferFraming::Fifo => FIFO_HEADER,
            BufferFraming::Plain => 0,
        };
        let chunk_size = ((buffer.size - header) & !0x3) as usize;
        let mut address = params.bank_base + offset;
        let mut done = 0;

        for chunk in data.chunks(chunk_size) {
            let mut frame = Vec::with_capacity(header as usize + chunk.len());
            if routine.framing() == BufferFraming::Fifo {
                // The read pointer trails the write pointer by exactly this chunk.
                let rp = buffer.address + FIFO_HEADER;
                let wp = rp + chunk.len() as u32;
                frame.extend_from_slice(&wp.to_le_bytes());
                frame.extend_from_slice(&rp.to_le_bytes());
            }
            frame.extend_from_slice(chunk);

            if let Err(e) = target.upload(&buffer, &frame) {
                log::error!("Flash data buffer write failed at address 0x{:08X}", buffer.address);
                return Err(e.into());
            }

            let mut args = AlgorithmArgs {
                base: params.controller.base,
                count: (chunk.len() / 4) as u32,
                buffer_start: buffer.address,
                buffer_end: buffer.end(),
                address,
            };
            log::debug!("Running write routine: {:08X?}", args);

            let run = target.run_algorithm(areas.code.address, &mut args, ALGORITHM_TIMEOUT);
            log::debug!("Write routine returned status=0x{:08X} address=0x{:08X}",
                        args.base, args.address);

            match run {
                Err(e) => {
                    log::error!("Flash write failed at address 0x{:08X}: {}", args.address, e);
                    return Err(Error::ExecutionFailed { address: args.address, status: None });
                },
                Ok(()) if args.base != 0 => {
                    log::error!("Flash write failed at address 0x{:08X}, status 0x{:08X}",
                                args.address, args.base);
                    return Err(Error::ExecutionFailed {
                        address: args.address, status: Some(args.base),
                    });
                },
                Ok(()) => (),
            }

            address += chunk.len() as u32;
            done += chunk.len();
            cb(done);
        }
        Ok(())
    })
}

/// Program `data` at `offset` with one debug-port transaction per waveform step.
pub fn write_host<T, F>(target: &mut T, params: &WriteParams, cmd: u32,
                        offset: u32, data: &[u8], cb: F)
    -> Result<()>
    where T: Target + ?Sized,
          F: FnMut(usize),
{
    let mut link = DebugLink(target);
    let mut seq = Sequencer::new(&mut link, params.profile, params.controller.base,
                                 params.region, cmd);
    seq.program(offset, data, cb)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::profile::access_mode;
    use crate::{Emulator, EmulatedChip};

    fn setup(chip: EmulatedChip) -> (Emulator, WriteParams, u32) {
        let mut emu = Emulator::new(chip);
        let profile = chip.profile();
        let controller = chip.controller();
        controller.enable_clock(&mut emu).unwrap();
        controller.unlock(&mut emu).unwrap();
        let cmd = access_mode(profile, MemoryRegion::Main, 0);
        emu.write_u32(controller.reg(crate::controller::CMD), cmd).unwrap();
        let params = WriteParams {
            profile, controller, region: MemoryRegion::Main, bank_base: chip.main_base(),
        };
        (emu, params, cmd)
    }

    #[test]
    fn test_accelerated_chunks_through_small_buffer() {
        let (mut emu, params, _) = setup(EmulatedChip::Mdr32Fx);
        emu.set_ram_size(1024);
        let routine = params.profile.write_routine().unwrap();
        let data: Vec<u8> = (0..3000u32).map(|x| x as u8).collect();
        let mut progress = Vec::new();
        write_accelerated(&mut emu, &params, &routine, 0x1000, &data, |n| progress.push(n))
            .unwrap();
        assert!(progress.len() > 1);
        assert_eq!(progress.last(), Some(&3000));
        assert_eq!(&emu.main()[0x1000..0x1000 + 3000], &data[..]);
        assert!(emu.violations().is_empty(), "{:?}", emu.violations());
        assert_eq!(emu.allocated_areas(), 0);
    }

    #[test]
    fn test_routine_failure_reports_address() {
        let (mut emu, params, _) = setup(EmulatedChip::Mdr32Fx);
        emu.fail_routine_at_word(10);
        let routine = params.profile.write_routine().unwrap();
        let result = write_accelerated(&mut emu, &params, &routine, 0x200, &[0u8; 64], |_| ());
        match result {
            Err(Error::ExecutionFailed { address, status }) => {
                assert_eq!(address, EmulatedChip::Mdr32Fx.main_base() + 0x200 + 40);
                assert!(status.is_some());
            },
            other => panic!("unexpected result {:?}", other),
        }
        assert_eq!(emu.allocated_areas(), 0);
    }

    #[test]
    fn test_fallback_when_no_working_area() {
        let (mut emu, params, cmd) = setup(EmulatedChip::Mdr32Fx);
        emu.set_ram_size(0);
        let routine = params.profile.write_routine();
        let strategy = write(&mut emu, &params, cmd, routine.as_ref(), 0, &[0x5A; 16], |_| ())
            .unwrap();
        assert_eq!(strategy, Strategy::HostSequenced);
        assert_eq!(emu.routine_runs(), 0);
        assert_eq!(&emu.main()[..16], &[0x5A; 16]);
    }

    #[test]
    fn test_plain_routine_on_riscv() {
        let (mut emu, params, cmd) = setup(EmulatedChip::Mdr1206Afi);
        let routine = WriteRoutine::new(vec![0x13, 0, 0, 0], BufferFraming::Plain);
        let data = [0x12, 0x34, 0x56, 0x78, 0x9A, 0xBC, 0xDE, 0xF0];
        let strategy = write(&mut emu, &params, cmd, Some(&routine), 0x80, &data, |_| ())
            .unwrap();
        assert_eq!(strategy, Strategy::Accelerated);
        assert_eq!(emu.routine_runs(), 1);
        assert_eq!(&emu.main()[0x80..0x88], &data);
        assert!(emu.violations().is_empty(), "{:?}", emu.violations());
    }
}

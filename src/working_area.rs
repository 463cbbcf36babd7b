//! Scratch RAM management for the accelerated write path.

use crate::{Target, WorkingArea, Error, Result};

/// Initial data buffer request in bytes.
pub const BUFFER_SIZE: u32 = 16384;

/// Data buffer sizes at or below this are not worth using.
pub const BUFFER_FLOOR: u32 = 256;

/// Working areas holding the write routine and its data buffer.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct AlgorithmAreas {
    pub code: WorkingArea,
    pub buffer: WorkingArea,
}

/// Allocate and fill a code area for `code`, then the largest data buffer
/// available from `BUFFER_SIZE` down, and run `f` with both.
///
/// Returns `Error::ResourceExhausted` if either area cannot be allocated.
/// All areas are released before returning, whatever `f` returns.
pub fn with_algorithm_areas<T, R, F>(target: &mut T, code: &[u8], f: F) -> Result<R>
    where T: Target + ?Sized,
          F: FnOnce(&mut T, &AlgorithmAreas) -> Result<R>,
{
    let code_area = match target.alloc_working_area(code.len() as u32) {
        Ok(area) => area,
        Err(e) => {
            log::debug!("Code area allocation failed: {}", e);
            log::warn!("No working area available, can't do block memory writes");
            return Err(Error::ResourceExhausted);
        },
    };

    let areas = target.upload(&code_area, code)
        .map_err(Error::from)
        .and_then(|_| alloc_buffer(target))
        .map(|buffer| AlgorithmAreas { code: code_area, buffer });

    let areas = match areas {
        Ok(areas) => areas,
        Err(e) => {
            target.free_working_area(code_area);
            return Err(e);
        },
    };

    log::debug!("Write routine at 0x{:08X}, {} byte buffer at 0x{:08X}",
                areas.code.address, areas.buffer.size, areas.buffer.address);

    let result = f(target, &areas);
    target.free_working_area(areas.buffer);
    target.free_working_area(areas.code);
    result
}

/// Allocate a data buffer, halving the request on each failure.
fn alloc_buffer<T: Target + ?Sized>(target: &mut T) -> Result<WorkingArea> {
    let mut size = BUFFER_SIZE;
    loop {
        match target.alloc_working_area(size) {
            Ok(area) => return Ok(area),
            Err(e) => log::trace!("Buffer allocation of {} bytes failed: {}", size, e),
        }
        size = (size / 2) & !0x3;
        if size <= BUFFER_FLOOR {
            log::warn!("No large enough working area available, can't do block memory writes");
            return Err(Error::ResourceExhausted);
        }
    }
}

//! The debug-port target abstraction which the flash driver is built on.
//!
//! Implementations provide word access to the target's address space, bulk
//! memory transfers, working-area allocation, and execution of a routine
//! uploaded to target RAM. All calls block until the debug-port transaction
//! has completed.

use std::time::Duration;

/// CPU architecture of the target, which selects the controller family.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Architecture {
    /// ARM Cortex-M based MDR32Fx parts, fixed controller layout.
    Arm,
    /// RISC-V based MDR32F02 and MDR1206 parts, extended controller layout.
    RiscV,
}

impl Architecture {
    pub fn name(&self) -> &'static str {
        match self {
            Architecture::Arm => "MDR32Fx",
            Architecture::RiscV => "MDR32RV",
        }
    }
}

/// Handle to scratch RAM allocated inside the target.
///
/// Working areas are acquired and released within a single flash operation
/// and never held across calls.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct WorkingArea {
    pub address: u32,
    pub size: u32,
}

impl WorkingArea {
    /// First address past the end of this area.
    pub fn end(&self) -> u32 {
        self.address + self.size
    }
}

/// Register arguments for a routine run on the target.
///
/// On entry the routine receives all five values. On exit `base` holds the
/// routine's status word (zero for success) and `address` holds the last
/// target address it reached.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub struct AlgorithmArgs {
    /// Flash controller base address in, status out.
    pub base: u32,
    /// Number of 32-bit words to program.
    pub count: u32,
    /// Start of the data buffer in target RAM.
    pub buffer_start: u32,
    /// End of the data buffer in target RAM.
    pub buffer_end: u32,
    /// Flash address to program in, final address out.
    pub address: u32,
}

/// Trait for objects which provide access to a halted target over a debug port.
///
/// Providers must implement all register, memory, working area and algorithm
/// methods. `upload()` and `sleep_us()` have default implementations in terms
/// of the other methods and `std::thread::sleep` respectively.
pub trait Target {
    /// Returns true if the target CPU is currently halted.
    fn is_halted(&mut self) -> bool;

    /// Read one 32-bit word from `address`.
    fn read_u32(&mut self, address: u32) -> anyhow::Result<u32>;

    /// Write one 32-bit word to `address`.
    fn write_u32(&mut self, address: u32, value: u32) -> anyhow::Result<()>;

    /// Read `data.len()` bytes starting at `address`.
    fn read_memory(&mut self, address: u32, data: &mut [u8]) -> anyhow::Result<()>;

    /// Write all of `data` starting at `address`.
    fn write_memory(&mut self, address: u32, data: &[u8]) -> anyhow::Result<()>;

    /// Allocate `size` bytes of scratch RAM in the target.
    fn alloc_working_area(&mut self, size: u32) -> anyhow::Result<WorkingArea>;

    /// Release a working area previously returned by `alloc_working_area()`.
    fn free_working_area(&mut self, area: WorkingArea);

    /// Run the routine at `entry` with `args` loaded into argument registers,
    /// waiting up to `timeout` for it to return.
    ///
    /// `args` is updated with the register values at exit.
    fn run_algorithm(&mut self, entry: u32, args: &mut AlgorithmArgs, timeout: Duration)
        -> anyhow::Result<()>;

    /// Copy `data` into the start of working area `area`.
    fn upload(&mut self, area: &WorkingArea, data: &[u8]) -> anyhow::Result<()> {
        if data.len() > area.size as usize {
            anyhow::bail!("{} bytes do not fit in working area of {} bytes at 0x{:08X}",
                          data.len(), area.size, area.address);
        }
        self.write_memory(area.address, data)
    }

    /// Block for at least `us` microseconds.
    fn sleep_us(&mut self, us: u32) {
        std::thread::sleep(Duration::from_micros(us as u64));
    }
}

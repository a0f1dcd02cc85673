//! Capability interfaces supplied by the host environment
//!
//! The driver never discovers PCI devices, maps BARs, allocates DMA
//! memory or blocks on interrupt lines itself; a [`NvmeHal`]
//! implementation provides those operations. Interrupt masking is not
//! here: mask/unmask are ordinary register writes the driver performs
//! on its own.

use x86_64::{PhysAddr, VirtAddr};

use crate::controller::NvmeError;

/// A physically-contiguous, DMA-visible memory region.
///
/// The physical address is what gets programmed into hardware address
/// registers and command data pointers; the virtual address is what the
/// driver dereferences. The allocator retains ownership of the backing
/// memory.
#[derive(Debug, Clone, Copy)]
pub struct DmaRegion {
    pub virt: VirtAddr,
    pub phys: PhysAddr,
    /// Region length in bytes
    pub len: usize,
}

/// Hardware services consumed by the driver.
pub trait NvmeHal {
    /// Map the controller's register block (BAR0) and return the base
    /// virtual address. The mapping must be uncached and stay valid for
    /// the lifetime of the controller.
    fn map_register_region(&self) -> Result<VirtAddr, NvmeError>;

    /// Allocate `len` bytes of zeroed, physically-contiguous memory
    /// addressable by the device.
    fn alloc_dma(&self, len: usize) -> Result<DmaRegion, NvmeError>;

    /// Block the calling thread until the device raises an interrupt.
    fn wait_for_interrupt(&self);

    /// Delay for roughly `us` microseconds. Paces the lifecycle
    /// ready-bit polls.
    fn delay_us(&self, us: u64);

    /// Let other tasks run; called between checks while a thread waits
    /// on a command's completion.
    fn yield_now(&self);
}

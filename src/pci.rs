//! PCI device capability surface provided by the platform backend.

use crate::error::Result;

/// A bound PCI function, as handed out by
/// [`IommuCtx::open_device`](crate::IommuCtx::open_device).
///
/// Implementations wrap the host facility that exposes the function's
/// configuration space, BARs and interrupts (VFIO or iommufd device fds on
/// Linux, the driver kit transport elsewhere).
pub trait PciDevice {
    /// The 24-bit class/subclass/programming-interface code.
    fn class_code(&self) -> Result<u32>;

    /// Read `buf.len()` bytes from configuration space at `offset`.
    fn read_config(&self, buf: &mut [u8], offset: usize) -> Result<()>;

    /// Write `buf.len()` bytes to configuration space at `offset`.
    fn write_config(&self, buf: &[u8], offset: usize) -> Result<()>;

    /// Map `len` bytes of BAR `bar` starting at `offset` into the process.
    fn map_bar(&self, bar: usize, len: usize, offset: usize) -> Result<*mut u8>;

    /// Unmap a region previously returned by [`PciDevice::map_bar`].
    fn unmap_bar(&self, ptr: *mut u8, len: usize);

    /// Route device interrupts to the given event descriptors.
    fn set_irq(&self, eventfds: &[i32]) -> Result<()>;

    /// Disable interrupt delivery.
    fn disable_irq(&self) -> Result<()>;

    /// Issue a function-level reset.
    fn reset(&self) -> Result<()>;
}

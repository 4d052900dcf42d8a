#![no_std]

extern crate alloc;

#[cfg(test)]
extern crate std;

pub mod cmd;
pub mod ctrl;
pub mod error;
pub mod events;
pub mod iommu;
pub mod iova;
pub mod mmio;
pub mod pci;
pub mod queues;
pub mod regs;
pub mod ticks;

#[cfg(test)]
pub(crate) mod testutil;

pub use cmd::{Command, Completion};
pub use ctrl::{Controller, ControllerInfo, CtrlOpts, Quirks};
pub use error::{Error, Result};
pub use iommu::{Dmabuf, IommuBackend, IommuCtx, MapFlags};
pub use iova::{IovaMap, IovaRange};
pub use queues::{CompQueue, CqeHandler, Iovec, Request, SubQueue};

/// Host page shift assumed by the driver core.
pub const PAGESHIFT: usize = 12;

/// Host page size assumed by the driver core.
pub const PAGESIZE: usize = 1 << PAGESHIFT;

pub(crate) fn align_up(v: usize, a: usize) -> usize {
    (v + a - 1) & !(a - 1)
}

pub(crate) fn aligned(v: u64, a: usize) -> bool {
    v & (a as u64 - 1) == 0
}

//! Shared fixtures for the unit test modules: a no-op IOMMU backend and
//! queue constructors over it.

use alloc::boxed::Box;
use alloc::sync::Arc;
use alloc::vec;
use alloc::vec::Vec;

use crate::PAGESIZE;
use crate::error::Result;
use crate::iommu::{Dmabuf, IommuBackend, IommuCtx, MapFlags};
use crate::iova::IovaRange;
use crate::pci::PciDevice;
use crate::queues::SubQueue;

pub(crate) struct NullBackend;

impl NullBackend {
    pub(crate) fn new() -> Self {
        Self
    }
}

impl IommuBackend for NullBackend {
    type Device = NullPci;

    fn open_device(&self, _bdf: &str) -> Result<NullPci> {
        Ok(NullPci)
    }

    fn dma_map(&self, _vaddr: usize, _len: usize, _iova: u64, _flags: MapFlags) -> Result<()> {
        Ok(())
    }

    fn dma_unmap(&self, _iova: u64, _len: usize) -> Result<()> {
        Ok(())
    }

    fn iova_ranges(&self) -> Vec<IovaRange> {
        vec![]
    }
}

pub(crate) struct NullPci;

impl PciDevice for NullPci {
    fn class_code(&self) -> Result<u32> {
        Ok(0x010802)
    }

    fn read_config(&self, _buf: &mut [u8], _offset: usize) -> Result<()> {
        Ok(())
    }

    fn write_config(&self, _buf: &[u8], _offset: usize) -> Result<()> {
        Ok(())
    }

    fn map_bar(&self, _bar: usize, len: usize, _offset: usize) -> Result<*mut u8> {
        Ok(Box::leak(vec![0u8; len].into_boxed_slice()).as_mut_ptr())
    }

    fn unmap_bar(&self, _ptr: *mut u8, _len: usize) {}

    fn set_irq(&self, _eventfds: &[i32]) -> Result<()> {
        Ok(())
    }

    fn disable_irq(&self) -> Result<()> {
        Ok(())
    }

    fn reset(&self) -> Result<()> {
        Ok(())
    }
}

pub(crate) fn test_ctx() -> Arc<IommuCtx<NullBackend>> {
    Arc::new(IommuCtx::new(NullBackend::new()))
}

pub(crate) fn leaked_u32(v: u32) -> *mut u32 {
    Box::leak(Box::new(v))
}

/// A submission queue over the null backend with an out-of-band doorbell
/// word.
pub(crate) fn test_sq(qsize: u16) -> SubQueue<NullBackend> {
    let ctx = test_ctx();

    let mem = Dmabuf::get(&ctx, qsize as usize * 64, MapFlags::empty()).unwrap();
    let pages = Dmabuf::get(&ctx, qsize as usize * PAGESIZE, MapFlags::empty()).unwrap();

    SubQueue::new(0, qsize, 0, mem, pages, leaked_u32(0), None)
}

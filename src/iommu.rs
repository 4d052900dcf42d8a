//! The IOMMU context: DMA mapping over an abstract platform backend.

use alloc::alloc::{alloc_zeroed, dealloc};
use alloc::sync::Arc;
use core::alloc::Layout;
use core::ptr::NonNull;
use core::slice;

use bitflags::bitflags;

use crate::error::{Error, Result};
use crate::iova::{IovaMap, IovaRange};
use crate::pci::PciDevice;
use crate::{PAGESIZE, align_up};

bitflags! {
    /// Flags for DMA map requests.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct MapFlags: u32 {
        /// Use the caller-supplied IOVA verbatim instead of allocating one.
        const FIXED_IOVA = 1 << 0;
        /// The device may not write through this mapping.
        const NOWRITE = 1 << 1;
        /// The device may not read through this mapping.
        const NOREAD = 1 << 2;
    }
}

bitflags! {
    /// Properties of an IOMMU context, reported by the backend.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct CtxFlags: u32 {
        /// The backend cannot allocate IOVAs; map requests must carry
        /// [`MapFlags::FIXED_IOVA`].
        const REQUIRE_IOVA = 1 << 0;
    }
}

/// The host isolation facility behind an [`IommuCtx`].
///
/// Two styles exist: container-style (one container fd, groups attached to
/// it, devices share an IOVA space) and per-device style (devices bound to
/// an I/O address space id). The context treats both identically; platform
/// glue probes for the per-device control node at startup and falls back to
/// the container flavor when it is absent.
pub trait IommuBackend {
    /// The PCI device handle type this backend hands out.
    type Device: PciDevice;

    /// Open and bind the function identified by `bdf` within this context.
    fn open_device(&self, bdf: &str) -> Result<Self::Device>;

    /// Program a translation from `iova` to `vaddr` for `len` bytes.
    fn dma_map(&self, vaddr: usize, len: usize, iova: u64, flags: MapFlags) -> Result<()>;

    /// Tear down a translation previously installed with
    /// [`IommuBackend::dma_map`].
    fn dma_unmap(&self, iova: u64, len: usize) -> Result<()>;

    /// The IOVA ranges the device is permitted to address.
    fn iova_ranges(&self) -> alloc::vec::Vec<IovaRange>;

    /// Context properties.
    fn flags(&self) -> CtxFlags {
        CtxFlags::empty()
    }
}

/// An I/O address space: the backend plus the map of everything installed
/// into it.
///
/// One context is created per device-owning process component and dropped
/// when the owning controller is closed; mappings are then released in bulk.
pub struct IommuCtx<B: IommuBackend> {
    backend: B,
    map: IovaMap,
    flags: CtxFlags,
}

impl<B: IommuBackend> IommuCtx<B> {
    pub fn new(backend: B) -> Self {
        let map = IovaMap::new(&backend.iova_ranges());
        let flags = backend.flags();

        Self {
            backend,
            map,
            flags,
        }
    }

    /// Open and bind a device within this context.
    pub fn open_device(&self, bdf: &str) -> Result<B::Device> {
        self.backend.open_device(bdf)
    }

    /// Map `len` bytes at `vaddr` for DMA and return the device address.
    ///
    /// If `vaddr` already falls within a mapped area, the existing
    /// translation is returned without contacting the backend. Otherwise an
    /// IOVA is drawn from the cursor, or taken from `iova` when
    /// [`MapFlags::FIXED_IOVA`] is set. `len` must be a multiple of the page
    /// size when the IOVA is cursor-allocated.
    pub fn map(
        &self,
        vaddr: usize,
        len: usize,
        iova: Option<u64>,
        flags: MapFlags,
    ) -> Result<u64> {
        if let Some(iova) = self.map.translate(vaddr) {
            return Ok(iova);
        }

        let iova = if flags.contains(MapFlags::FIXED_IOVA) {
            iova.ok_or(Error::InvalidArgument)?
        } else {
            if self.flags.contains(CtxFlags::REQUIRE_IOVA) {
                log::debug!("backend cannot allocate iovas");
                return Err(Error::InvalidArgument);
            }

            self.map.reserve(len)?
        };

        self.backend.dma_map(vaddr, len, iova, flags)?;
        self.map.add(vaddr, len, iova)?;

        Ok(iova)
    }

    /// Remove the mapping containing `vaddr`, returning its length.
    pub fn unmap(&self, vaddr: usize) -> Result<usize> {
        let m = self.map.find(vaddr).ok_or(Error::NotFound)?;

        self.backend.dma_unmap(m.iova, m.len)?;
        self.map.remove(m.vaddr)?;

        Ok(m.len)
    }

    /// Translate a virtual address inside any current mapping.
    pub fn translate(&self, vaddr: usize) -> Option<u64> {
        self.map.translate(vaddr)
    }

    /// The IOVA ranges this context allocates from.
    pub fn iova_ranges(&self) -> alloc::vec::Vec<IovaRange> {
        self.map.ranges()
    }
}

impl<B: IommuBackend> Drop for IommuCtx<B> {
    fn drop(&mut self) {
        let backend = &self.backend;

        self.map.clear_with(|m| {
            if backend.dma_unmap(m.iova, m.len).is_err() {
                log::error!("failed to unmap iova {:#x} len {:#x}", m.iova, m.len);
            }
        });
    }
}

/// A page-aligned, zero-initialized buffer mapped for DMA in an
/// [`IommuCtx`]. Dropping the buffer unmaps it and releases the pages.
pub struct Dmabuf<B: IommuBackend> {
    ctx: Arc<IommuCtx<B>>,
    vaddr: NonNull<u8>,
    len: usize,
    iova: u64,
}

unsafe impl<B: IommuBackend + Send + Sync> Send for Dmabuf<B> {}
unsafe impl<B: IommuBackend + Send + Sync> Sync for Dmabuf<B> {}

impl<B: IommuBackend> Dmabuf<B> {
    /// Allocate `len` bytes (rounded up to whole pages) and map them.
    pub fn get(ctx: &Arc<IommuCtx<B>>, len: usize, flags: MapFlags) -> Result<Self> {
        let len = align_up(len.max(1), PAGESIZE);
        let layout = Layout::from_size_align(len, PAGESIZE).map_err(|_| Error::InvalidArgument)?;

        let ptr = unsafe { alloc_zeroed(layout) };
        let vaddr = NonNull::new(ptr).ok_or(Error::NoMem)?;

        let iova = match ctx.map(vaddr.as_ptr() as usize, len, None, flags) {
            Ok(iova) => iova,
            Err(e) => {
                unsafe { dealloc(ptr, layout) };
                return Err(e);
            }
        };

        Ok(Self {
            ctx: ctx.clone(),
            vaddr,
            len,
            iova,
        })
    }

    pub fn vaddr(&self) -> *mut u8 {
        self.vaddr.as_ptr()
    }

    pub fn iova(&self) -> u64 {
        self.iova
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn as_slice(&self) -> &[u8] {
        unsafe { slice::from_raw_parts(self.vaddr.as_ptr(), self.len) }
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        unsafe { slice::from_raw_parts_mut(self.vaddr.as_ptr(), self.len) }
    }
}

impl<B: IommuBackend> Drop for Dmabuf<B> {
    fn drop(&mut self) {
        if self.ctx.unmap(self.vaddr.as_ptr() as usize).is_err() {
            log::error!("failed to unmap dmabuf at {:#x}", self.iova);
        }

        // layout was validated at construction
        let layout = unsafe { Layout::from_size_align_unchecked(self.len, PAGESIZE) };

        unsafe { dealloc(self.vaddr.as_ptr(), layout) };
    }
}

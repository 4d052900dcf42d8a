//! Controller lifecycle, admin command path and I/O queue management.

use alloc::string::String;
use alloc::sync::Arc;
use alloc::vec::Vec;

use bitflags::bitflags;
use core::time::Duration;

use crate::cmd::{CID_AER, Command, Completion, FeatureId, IdentifyType, QueueType};
use crate::error::{Error, Result};
use crate::events::AsyncEvent;
use crate::iommu::{Dmabuf, IommuBackend, IommuCtx, MapFlags};
use crate::pci::PciDevice;
use crate::queues::{CompQueue, CqeHandler, DbBuf, SubQueue};
use crate::regs::{CAP_CSS_ADMIN, CAP_CSS_CSI, CQES, Cap, DOORBELL_BASE, Register, SQES, cc,
                  cq_doorbell_offset, csts, sq_doorbell_offset};
use crate::{PAGESHIFT, PAGESIZE, align_up, mmio, ticks};

/// The admin queue identifier.
pub const AQ: u16 = 0;

/// Admin queue depth.
pub const AQ_QSIZE: u16 = 32;

/// Size of an Identify data buffer.
pub const IDENTIFY_DATA_SIZE: usize = 4096;

/// Trackers address 15 bits of cid space; the high bit marks AERs.
const MAX_QSIZE: u16 = 1 << 15;

/// Identify Controller OACS bit: Doorbell Buffer Config supported.
const OACS_DBBUF: u16 = 1 << 8;

bitflags! {
    /// Per-controller behavioral quirks, passed in by the caller for device
    /// identities that need them.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Quirks: u32 {
        /// The controller advertises Doorbell Buffer Config but misbehaves
        /// when it is used; stick to MMIO doorbells.
        const BROKEN_DBBUF = 1 << 0;
    }
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    struct CtrlFlags: u32 {
        /// Administrative controller; no I/O queues are negotiated.
        const ADMINISTRATIVE = 1 << 0;
    }
}

/// Controller construction options.
#[derive(Debug, Clone, Copy)]
pub struct CtrlOpts {
    /// Number of I/O submission queues to request (0-based).
    pub nsqr: u16,
    /// Number of I/O completion queues to request (0-based).
    pub ncqr: u16,
    pub quirks: Quirks,
}

impl Default for CtrlOpts {
    fn default() -> Self {
        Self {
            nsqr: 63,
            ncqr: 63,
            quirks: Quirks::empty(),
        }
    }
}

/// Negotiated run-time configuration.
#[derive(Debug, Default, Clone, Copy)]
pub struct Config {
    /// Number of I/O submission queues actually available (0-based).
    pub nsqa: u16,
    /// Number of I/O completion queues actually available (0-based).
    pub ncqa: u16,
}

/// Cached Identify Controller data.
#[derive(Debug, Default, Clone)]
pub struct ControllerInfo {
    /// PCI vendor identifier
    pub vid: u16,
    /// Serial number
    pub serial_number: String,
    /// Model number
    pub model_number: String,
    /// Firmware revision
    pub firmware_revision: String,
    /// Maximum data transfer size exponent (0 means unlimited)
    pub mdts: u8,
    /// Controller identifier
    pub cntlid: u16,
    /// Optional admin command support bitmap
    pub oacs: u16,
}

impl ControllerInfo {
    /// Largest transfer the controller accepts in bytes, given its minimum
    /// page size. `None` when the controller reports no limit.
    pub fn max_transfer_size(&self, min_pagesize: usize) -> Option<usize> {
        (self.mdts != 0).then(|| (1usize << self.mdts) * min_pagesize)
    }
}

struct DbbufPages<B: IommuBackend> {
    doorbells: Dmabuf<B>,
    eventidxs: Dmabuf<B>,
}

/// An NVMe controller owned by this process.
///
/// Owns the BAR mappings, the admin queue pair and the per-controller
/// submission/completion queue slots; index 0 is the admin queue. Dropping
/// the controller resets it and releases all queue memory.
pub struct Controller<B: IommuBackend> {
    iommu: Arc<IommuCtx<B>>,
    pci: B::Device,
    regs: *mut u8,
    doorbells: *mut u8,
    dstrd: u8,
    sq: Vec<Option<SubQueue<B>>>,
    cq: Vec<Option<CompQueue<B>>>,
    dbbuf: Option<DbbufPages<B>>,
    opts: CtrlOpts,
    config: Config,
    flags: CtrlFlags,
    info: Option<ControllerInfo>,
}

unsafe impl<B> Send for Controller<B>
where
    B: IommuBackend + Send + Sync,
    B::Device: Send,
{
}

impl<B: IommuBackend> Controller<B> {
    /// Bring the controller identified by `bdf` from reset to operational.
    ///
    /// Binds the device within `iommu`, maps its registers, performs the
    /// reset/enable handshake, bootstraps the admin queue pair, negotiates
    /// I/O queue counts and caches the Identify Controller data. The
    /// controller is ready for I/O queue creation when this returns.
    pub fn init(iommu: Arc<IommuCtx<B>>, bdf: &str, opts: CtrlOpts) -> Result<Self> {
        // 65535 is reserved by the protocol, not a valid 0-based count
        if opts.nsqr == u16::MAX || opts.ncqr == u16::MAX {
            return Err(Error::InvalidArgument);
        }

        let pci = iommu.open_device(bdf)?;

        let classcode = pci.class_code()?;
        log::info!("pci class code is {:#08x}", classcode);

        if classcode & 0xffff00 != 0x010800 {
            log::debug!("{} is not an NVMe device", bdf);
            return Err(Error::InvalidArgument);
        }

        let mut flags = CtrlFlags::empty();
        if classcode & 0xff == 0x03 {
            flags |= CtrlFlags::ADMINISTRATIVE;
        }

        let regs = pci.map_bar(0, 0x1000, 0)?;
        let doorbells = pci.map_bar(0, 0x1000, DOORBELL_BASE)?;

        let cap = Cap(unsafe { mmio::lh_read64(regs, Register::CAP as usize) });

        if cap.mpsmin() as usize + 12 > PAGESHIFT {
            log::debug!("controller minimum page size too large");
            return Err(Error::InvalidArgument);
        }

        let mut ctrl = Self {
            iommu,
            pci,
            regs,
            doorbells,
            dstrd: cap.dstrd(),
            sq: (0..opts.nsqr as usize + 2).map(|_| None).collect(),
            cq: (0..opts.ncqr as usize + 2).map(|_| None).collect(),
            dbbuf: None,
            opts,
            config: Config::default(),
            flags,
            info: None,
        };

        ctrl.reset()?;
        ctrl.configure_adminq()?;
        ctrl.enable()?;

        ctrl.identify_controller()?;

        if !ctrl.flags.contains(CtrlFlags::ADMINISTRATIVE) {
            ctrl.negotiate_queue_counts()?;
        }

        let dbbuf_supported = ctrl
            .info
            .as_ref()
            .is_some_and(|info| info.oacs & OACS_DBBUF != 0);

        if dbbuf_supported && !ctrl.opts.quirks.contains(Quirks::BROKEN_DBBUF) {
            ctrl.configure_dbbuf()?;
        }

        Ok(ctrl)
    }

    /// Read a 32-bit controller register.
    pub fn reg32(&self, reg: Register) -> u32 {
        unsafe { mmio::read32(self.regs, reg as usize) }
    }

    /// Read a 64-bit controller register.
    pub fn reg64(&self, reg: Register) -> u64 {
        unsafe { mmio::lh_read64(self.regs, reg as usize) }
    }

    fn reg_write32(&self, reg: Register, v: u32) {
        unsafe { mmio::write32(self.regs, reg as usize, v) }
    }

    fn reg_write64(&self, reg: Register, v: u64) {
        unsafe { mmio::hl_write64(self.regs, reg as usize, v) }
    }

    /// The controller version as `(major, minor, tertiary)`.
    pub fn version(&self) -> (u16, u8, u8) {
        let vs = self.reg32(Register::VS);

        ((vs >> 16) as u16, (vs >> 8) as u8, vs as u8)
    }

    /// The cached Identify Controller data.
    pub fn info(&self) -> Option<&ControllerInfo> {
        self.info.as_ref()
    }

    /// The negotiated queue counts.
    pub fn config(&self) -> Config {
        self.config
    }

    fn wait_rdy(&self, rdy: bool) -> Result<()> {
        let cap = Cap(self.reg64(Register::CAP));
        let timeout = Duration::from_millis(500 * (cap.to() as u64 + 1));
        let deadline = ticks::now().wrapping_add(ticks::from_duration(timeout));

        loop {
            let csts = self.reg32(Register::CSTS);

            if (csts & csts::RDY != 0) == rdy {
                return Ok(());
            }

            if ticks::now() >= deadline {
                log::debug!("timed out waiting for csts.rdy {}", rdy as u8);
                return Err(Error::Timeout);
            }

            core::hint::spin_loop();
        }
    }

    /// Clear `CC.EN` and wait for the controller to report not-ready.
    pub fn reset(&mut self) -> Result<()> {
        let cc = self.reg32(Register::CC);
        self.reg_write32(Register::CC, cc & !cc::EN);

        self.wait_rdy(false)
    }

    /// Compose `CC`, set `CC.EN` and wait for the controller to report
    /// ready.
    pub fn enable(&mut self) -> Result<()> {
        let cap = Cap(self.reg64(Register::CAP));
        let css = cap.css();

        let css_selected = if css & CAP_CSS_CSI != 0 {
            cc::CSS_CSI
        } else if css & CAP_CSS_ADMIN != 0 {
            cc::CSS_ADMIN
        } else {
            cc::CSS_NVM
        };

        let ctrl_config = ((PAGESHIFT as u32 - 12) << cc::MPS_SHIFT)
            | (css_selected << cc::CSS_SHIFT)
            | (cc::AMS_RR << cc::AMS_SHIFT)
            | (cc::SHN_NONE << cc::SHN_SHIFT)
            | (SQES << cc::IOSQES_SHIFT)
            | (CQES << cc::IOCQES_SHIFT)
            | cc::EN;

        self.reg_write32(Register::CC, ctrl_config);

        self.wait_rdy(true)
    }

    fn dbbuf_for(&self, qid: u16, cq: bool) -> Option<DbBuf> {
        // the admin queue predates the Doorbell Buffer Config command and
        // always uses MMIO
        if qid == AQ {
            return None;
        }

        let pages = self.dbbuf.as_ref()?;

        let offset = if cq {
            cq_doorbell_offset(qid, self.dstrd)
        } else {
            sq_doorbell_offset(qid, self.dstrd)
        };

        let doorbell = unsafe { pages.doorbells.vaddr().add(offset) } as *mut u32;
        let eventidx = unsafe { pages.eventidxs.vaddr().add(offset) } as *mut u32;

        Some(DbBuf::new(doorbell, eventidx))
    }

    /// Allocate and register the memory for a completion queue. Does not
    /// create the queue on the controller; see [`Controller::create_iocq`].
    pub fn configure_cq(&mut self, qid: u16, qsize: u16, vector: Option<u16>) -> Result<()> {
        if qid as usize >= self.cq.len() || qid > self.config.ncqa {
            log::debug!("cqid {} invalid; max is {}", qid, self.config.ncqa);
            return Err(Error::InvalidArgument);
        }

        if qsize < 2 || qsize > MAX_QSIZE {
            log::debug!("cq qsize {} out of range", qsize);
            return Err(Error::InvalidArgument);
        }

        if self.cq[qid as usize].is_some() {
            return Err(Error::Exists);
        }

        let mem = Dmabuf::get(
            &self.iommu,
            align_up(qsize as usize * 16, PAGESIZE),
            MapFlags::empty(),
        )?;

        let doorbell = unsafe {
            self.doorbells.add(cq_doorbell_offset(qid, self.dstrd))
        } as *mut u32;

        let dbbuf = self.dbbuf_for(qid, true);

        self.cq[qid as usize] = Some(CompQueue::new(qid, qsize, mem, doorbell, dbbuf, vector));

        Ok(())
    }

    /// Release a completion queue's memory. Does not delete the queue on
    /// the controller; see [`Controller::delete_iocq`].
    pub fn discard_cq(&mut self, qid: u16) {
        if let Some(slot) = self.cq.get_mut(qid as usize) {
            *slot = None;
        }
    }

    /// Allocate and register the memory, PRP pages and request trackers for
    /// a submission queue bound to completion queue `cq_id`. Does not
    /// create the queue on the controller; see [`Controller::create_iosq`].
    pub fn configure_sq(&mut self, qid: u16, qsize: u16, cq_id: u16) -> Result<()> {
        if qid as usize >= self.sq.len() || qid > self.config.nsqa {
            log::debug!("sqid {} invalid; max is {}", qid, self.config.nsqa);
            return Err(Error::InvalidArgument);
        }

        if qsize < 2 || qsize > MAX_QSIZE {
            log::debug!("sq qsize {} out of range", qsize);
            return Err(Error::InvalidArgument);
        }

        if self.sq[qid as usize].is_some() {
            return Err(Error::Exists);
        }

        if self.cq.get(cq_id as usize).is_none_or(|cq| cq.is_none()) {
            log::debug!("sq {} bound to nonexistent cq {}", qid, cq_id);
            return Err(Error::InvalidArgument);
        }

        let mem = Dmabuf::get(
            &self.iommu,
            align_up(qsize as usize * 64, PAGESIZE),
            MapFlags::empty(),
        )?;

        let pages = Dmabuf::get(&self.iommu, qsize as usize * PAGESIZE, MapFlags::empty())?;

        let doorbell = unsafe {
            self.doorbells.add(sq_doorbell_offset(qid, self.dstrd))
        } as *mut u32;

        let dbbuf = self.dbbuf_for(qid, false);

        self.sq[qid as usize] = Some(SubQueue::new(qid, qsize, cq_id, mem, pages, doorbell, dbbuf));

        Ok(())
    }

    /// Release a submission queue's memory and trackers. Does not delete
    /// the queue on the controller; see [`Controller::delete_iosq`].
    pub fn discard_sq(&mut self, qid: u16) {
        if let Some(slot) = self.sq.get_mut(qid as usize) {
            *slot = None;
        }
    }

    fn configure_adminq(&mut self) -> Result<()> {
        self.configure_cq(AQ, AQ_QSIZE, None)?;

        if let Err(e) = self.configure_sq(AQ, AQ_QSIZE, AQ) {
            self.discard_cq(AQ);
            return Err(e);
        }

        let aqa = (AQ_QSIZE as u32 - 1) << 16 | (AQ_QSIZE as u32 - 1);
        self.reg_write32(Register::AQA, aqa);

        let asq = self.sq[AQ as usize].as_ref().map(|sq| sq.iova());
        let acq = self.cq[AQ as usize].as_ref().map(|cq| cq.iova());

        if let (Some(asq), Some(acq)) = (asq, acq) {
            self.reg_write64(Register::ASQ, asq);
            self.reg_write64(Register::ACQ, acq);
        }

        Ok(())
    }

    fn identify_controller(&mut self) -> Result<()> {
        let buf = Dmabuf::get(&self.iommu, IDENTIFY_DATA_SIZE, MapFlags::empty())?;

        self.admin(Command::identify(IdentifyType::Controller), Some(&buf))?;

        let data = buf.as_slice();
        let ascii = |range: core::ops::Range<usize>| -> String {
            data[range]
                .iter()
                .map(|&b| b as char)
                .collect::<String>()
                .trim()
                .into()
        };

        self.info = Some(ControllerInfo {
            vid: u16::from_le_bytes([data[0], data[1]]),
            serial_number: ascii(4..24),
            model_number: ascii(24..64),
            firmware_revision: ascii(64..72),
            mdts: data[77],
            cntlid: u16::from_le_bytes([data[78], data[79]]),
            oacs: u16::from_le_bytes([data[256], data[257]]),
        });

        Ok(())
    }

    fn negotiate_queue_counts(&mut self) -> Result<()> {
        let cdw11 = (self.opts.nsqr as u32) | ((self.opts.ncqr as u32) << 16);
        let cmd = Command::set_features(FeatureId::NumberOfQueues, cdw11);

        let cqe = self.admin(cmd, None)?;

        let granted = cqe.dw0();
        self.config.nsqa = self.opts.nsqr.min((granted & 0xFFFF) as u16);
        self.config.ncqa = self.opts.ncqr.min((granted >> 16) as u16);

        log::info!(
            "negotiated {} submission and {} completion queues",
            self.config.nsqa as u32 + 1,
            self.config.ncqa as u32 + 1
        );

        Ok(())
    }

    fn configure_dbbuf(&mut self) -> Result<()> {
        let doorbells = Dmabuf::get(&self.iommu, PAGESIZE, MapFlags::empty())?;
        let eventidxs = Dmabuf::get(&self.iommu, PAGESIZE, MapFlags::empty())?;

        let cmd = Command::dbbuf_config(doorbells.iova(), eventidxs.iova());
        self.admin(cmd, None)?;

        log::debug!("shadow doorbells enabled");

        self.dbbuf = Some(DbbufPages {
            doorbells,
            eventidxs,
        });

        Ok(())
    }

    /// Create an I/O completion queue on the controller.
    ///
    /// One slot in the queue is reserved for the full condition, so for a
    /// command depth of `n`, pass `n + 1`.
    pub fn create_iocq(&mut self, qid: u16, qsize: u16, vector: Option<u16>) -> Result<()> {
        self.configure_cq(qid, qsize, vector)?;

        let iova = match self.cq[qid as usize].as_ref() {
            Some(cq) => cq.iova(),
            None => return Err(Error::InvalidArgument),
        };

        let cmd = Command::create_queue(qid, qsize, iova, QueueType::Completion, None);

        if let Err(e) = self.admin(cmd, None) {
            self.discard_cq(qid);
            return Err(e);
        }

        Ok(())
    }

    /// Delete an I/O completion queue and release its memory.
    pub fn delete_iocq(&mut self, qid: u16) -> Result<()> {
        self.admin(Command::delete_queue(qid, QueueType::Completion), None)?;
        self.discard_cq(qid);

        Ok(())
    }

    /// Create an I/O submission queue bound to completion queue `cq_id`.
    ///
    /// One slot in the queue is reserved for the full condition, so for a
    /// command depth of `n`, pass `n + 1`.
    pub fn create_iosq(&mut self, qid: u16, qsize: u16, cq_id: u16) -> Result<()> {
        self.configure_sq(qid, qsize, cq_id)?;

        let iova = match self.sq[qid as usize].as_ref() {
            Some(sq) => sq.iova(),
            None => return Err(Error::InvalidArgument),
        };

        let cmd = Command::create_queue(qid, qsize, iova, QueueType::Submission, Some(cq_id));

        if let Err(e) = self.admin(cmd, None) {
            self.discard_sq(qid);
            return Err(e);
        }

        Ok(())
    }

    /// Delete an I/O submission queue and release its memory.
    pub fn delete_iosq(&mut self, qid: u16) -> Result<()> {
        self.admin(Command::delete_queue(qid, QueueType::Submission), None)?;
        self.discard_sq(qid);

        Ok(())
    }

    /// Create an I/O queue pair sharing `qid`.
    pub fn create_ioqpair(&mut self, qid: u16, qsize: u16) -> Result<()> {
        self.create_iocq(qid, qsize, None)?;

        if let Err(e) = self.create_iosq(qid, qsize, qid) {
            let _ = self.delete_iocq(qid);
            return Err(e);
        }

        Ok(())
    }

    /// Delete an I/O queue pair; the submission queue goes first.
    pub fn delete_ioqpair(&mut self, qid: u16) -> Result<()> {
        self.delete_iosq(qid)?;
        self.delete_iocq(qid)?;

        Ok(())
    }

    pub fn sq(&self, qid: u16) -> Option<&SubQueue<B>> {
        self.sq.get(qid as usize)?.as_ref()
    }

    pub fn sq_mut(&mut self, qid: u16) -> Option<&mut SubQueue<B>> {
        self.sq.get_mut(qid as usize)?.as_mut()
    }

    pub fn cq_mut(&mut self, qid: u16) -> Option<&mut CompQueue<B>> {
        self.cq.get_mut(qid as usize)?.as_mut()
    }

    /// Both halves of the queue pair `qid`, for callers driving the data
    /// plane directly.
    pub fn queue_pair_mut(&mut self, qid: u16) -> Result<(&mut SubQueue<B>, &mut CompQueue<B>)> {
        let sq = self
            .sq
            .get_mut(qid as usize)
            .and_then(|s| s.as_mut())
            .ok_or(Error::InvalidArgument)?;

        let cq_id = sq.cq_id();

        let cq = self
            .cq
            .get_mut(cq_id as usize)
            .and_then(|c| c.as_mut())
            .ok_or(Error::InvalidArgument)?;

        Ok((sq, cq))
    }

    /// Submit one command on `qid` and spin for its completion.
    ///
    /// Intended for queues with no other commands in flight. Spurious
    /// completions are logged and ignored, except admin-queue AERs which
    /// are dispatched to their registered handler.
    pub fn oneshot(&mut self, qid: u16, mut cmd: Command, buf: Option<&Dmabuf<B>>) -> Result<Completion> {
        let sq = self
            .sq
            .get_mut(qid as usize)
            .and_then(|s| s.as_mut())
            .ok_or(Error::InvalidArgument)?;

        let cid = sq.acquire_atomic()?;

        if let Some(buf) = buf {
            if let Err(e) = sq.request(cid).map_prp(&mut cmd, buf.iova(), buf.len()) {
                sq.release_atomic(cid);
                return Err(e);
            }
        }

        sq.rq_exec(cid, &mut cmd);

        let cq_id = sq.cq_id();

        let cqe = loop {
            let cqe = match self.cq.get_mut(cq_id as usize).and_then(|c| c.as_mut()) {
                Some(cq) => cq.poll(),
                None => return Err(Error::InvalidArgument),
            };

            if cqe.cid() == cid {
                break cqe;
            }

            if qid == AQ && cqe.cid() & CID_AER != 0 {
                self.aen_handle(cqe);
                continue;
            }

            log::error!("spurious cqe (cq {} cid {})", cq_id, cqe.cid());
        };

        if let Some(sq) = self.sq.get(qid as usize).and_then(|s| s.as_ref()) {
            sq.release_atomic(cid);
        }

        if !cqe.is_ok() {
            log::debug!("cqe status {:#x}", cqe.status());
            return Err(Error::Device(cqe.status_code()));
        }

        Ok(cqe)
    }

    /// Submit an admin command and spin for its completion.
    pub fn admin(&mut self, cmd: Command, buf: Option<&Dmabuf<B>>) -> Result<Completion> {
        self.oneshot(AQ, cmd, buf)
    }

    /// Issue a standing Asynchronous Event Request whose completions are
    /// dispatched to `handler`. The request re-arms itself after every
    /// notification.
    pub fn aen_enable(&mut self, handler: CqeHandler) -> Result<()> {
        let sq = self
            .sq
            .get_mut(AQ as usize)
            .and_then(|s| s.as_mut())
            .ok_or(Error::InvalidArgument)?;

        let cid = sq.acquire_atomic()?;
        sq.request(cid).set_handler(handler);

        // the tracker cid is stamped manually so the AER marker survives
        let mut cmd = Command::async_event_request();
        cmd.set_cid(cid | CID_AER);

        sq.exec(&cmd);

        Ok(())
    }

    /// Dispatch an asynchronous event notification to its tracker's handler
    /// and re-arm the request.
    pub fn aen_handle(&mut self, cqe: Completion) {
        let cid = cqe.cid() & !CID_AER;

        let Some(sq) = self.sq.get_mut(AQ as usize).and_then(|s| s.as_mut()) else {
            return;
        };

        if cid >= sq.qsize() - 1 {
            log::error!("aen cid {} out of range", cid);
            return;
        }

        let mut cqe = cqe;
        cqe.set_cid(cid);

        match sq.request(cid).handler() {
            Some(handler) => handler(&cqe),
            None => {
                let dw0 = cqe.dw0();
                log::info!("unhandled aen {:#x}: {:?}", dw0, AsyncEvent::from_dw0(dw0));
            }
        }

        let mut cmd = Command::async_event_request();
        cmd.set_cid(cid | CID_AER);

        sq.exec(&cmd);
    }

    /// Shut the controller down and release its resources.
    ///
    /// Equivalent to dropping the controller, but surfaces a reset failure
    /// that [`Drop`] would only log. Queue memory and BAR mappings are
    /// released either way.
    pub fn close(mut self) -> Result<()> {
        self.reset()
    }

    /// Route controller interrupts to the given event descriptors.
    pub fn set_irq(&self, eventfds: &[i32]) -> Result<()> {
        self.pci.set_irq(eventfds)
    }

    /// Disable interrupt delivery.
    pub fn disable_irq(&self) -> Result<()> {
        self.pci.disable_irq()
    }
}

impl<B: IommuBackend> Drop for Controller<B> {
    fn drop(&mut self) {
        // stop the controller before tearing down queue memory it may still
        // be reading
        if self.reset().is_err() {
            log::error!("controller did not reset on close");
        }

        self.sq.clear();
        self.cq.clear();
        self.dbbuf = None;

        self.pci.unmap_bar(self.regs, 0x1000);
        self.pci.unmap_bar(self.doorbells, 0x1000);
    }
}

//! Submission and completion queue pairs, request trackers and doorbells.

use alloc::vec::Vec;
use core::cell::Cell;
use core::sync::atomic::{AtomicU16, AtomicU32, Ordering};
use core::time::Duration;

use crate::cmd::{Command, Completion};
use crate::error::{Error, Result};
use crate::iommu::{Dmabuf, IommuBackend};
use crate::{PAGESHIFT, PAGESIZE, aligned, mmio, ticks};

/// Called with the completion entry when an asynchronous event fires.
pub type CqeHandler = fn(&Completion);

/// Freelist terminator.
const RQ_NONE: u16 = u16::MAX;

/// A single segment of a DMA-mapped buffer, addressed by device address.
#[derive(Debug, Clone, Copy)]
pub struct Iovec {
    pub iova: u64,
    pub len: usize,
}

/// Per-slot request tracker.
///
/// One tracker exists per usable submission queue slot; its `cid` is the
/// slot index and is stamped into the entry just before posting, so at most
/// one command is ever in flight per tracker. Each tracker owns a dedicated
/// page for building PRP lists, carved out of the queue-wide page block.
pub struct Request {
    cid: u16,
    next: AtomicU16,
    handler: Cell<Option<CqeHandler>>,
    page_vaddr: *mut u64,
    page_iova: u64,
}

impl Request {
    pub(crate) fn new(cid: u16, next: u16, page_vaddr: *mut u64, page_iova: u64) -> Self {
        Self {
            cid,
            next: AtomicU16::new(next),
            handler: Cell::new(None),
            page_vaddr,
            page_iova,
        }
    }

    pub fn cid(&self) -> u16 {
        self.cid
    }

    /// Register a completion handler on this tracker (used by the
    /// asynchronous event machinery).
    pub fn set_handler(&self, handler: CqeHandler) {
        self.handler.set(Some(handler));
    }

    pub fn handler(&self) -> Option<CqeHandler> {
        self.handler.get()
    }

    fn reset(&self) {
        self.handler.set(None);
    }

    /// Number of controller pages touched by `[iova, iova + len)`.
    fn prp_count(iova: u64, len: usize) -> usize {
        ((iova as usize & (PAGESIZE - 1)) + len + PAGESIZE - 1) >> PAGESHIFT
    }

    /// Write the trailing page addresses of `[iova, iova + len)` into the
    /// PRP page, starting at list index `at`. Returns the page count.
    fn fill_pages(&self, at: usize, iova: u64, len: usize) -> usize {
        let prpcount = Self::prp_count(iova, len).max(1);
        let base = iova & !(PAGESIZE as u64 - 1);

        for i in 1..prpcount {
            unsafe {
                self.page_vaddr
                    .add(at + i - 1)
                    .write((base + ((i as u64) << PAGESHIFT)).to_le());
            }
        }

        prpcount
    }

    /// Set up the Physical Region Pages in the data pointer of `cmd` from a
    /// buffer contiguous in device address space.
    pub fn map_prp(&self, cmd: &mut Command, iova: u64, len: usize) -> Result<()> {
        let prpcount = Self::prp_count(iova, len).max(1);

        if prpcount > PAGESIZE / 8 {
            return Err(Error::InvalidArgument);
        }

        self.fill_pages(0, iova, len);

        let prp2 = match prpcount {
            1 => 0,
            2 => (iova & !(PAGESIZE as u64 - 1)) + PAGESIZE as u64,
            _ => self.page_iova,
        };

        cmd.set_dptr(iova, prp2);

        Ok(())
    }

    /// Set up the Physical Region Pages in the data pointer of `cmd` from a
    /// vector of segments.
    ///
    /// Only the first segment may start inside a page, and only the last may
    /// end inside one; every other boundary must be page aligned.
    pub fn mapv_prp(&self, cmd: &mut Command, iov: &[Iovec]) -> Result<()> {
        let first = *iov.first().ok_or(Error::InvalidArgument)?;
        let niov = iov.len();

        if niov > 1 && !aligned(first.iova + first.len as u64, PAGESIZE) {
            return Err(Error::InvalidArgument);
        }

        if Self::prp_count(first.iova, first.len) > PAGESIZE / 8 {
            return Err(Error::InvalidArgument);
        }

        let mut prpcount = self.fill_pages(0, first.iova, first.len);

        for (i, seg) in iov.iter().enumerate().skip(1) {
            if !aligned(seg.iova, PAGESIZE) || seg.len == 0 {
                return Err(Error::InvalidArgument);
            }

            if i != niov - 1 && !aligned(seg.iova + seg.len as u64, PAGESIZE) {
                return Err(Error::InvalidArgument);
            }

            let pages = (seg.len + PAGESIZE - 1) >> PAGESHIFT;

            if prpcount + pages > PAGESIZE / 8 {
                return Err(Error::InvalidArgument);
            }

            for k in 0..pages {
                unsafe {
                    self.page_vaddr
                        .add(prpcount - 1 + k)
                        .write((seg.iova + ((k as u64) << PAGESHIFT)).to_le());
                }
            }

            prpcount += pages;
        }

        let prp2 = match prpcount {
            1 => 0,
            2 => u64::from_le(unsafe { self.page_vaddr.read() }),
            _ => self.page_iova,
        };

        cmd.set_dptr(first.iova, prp2);

        Ok(())
    }
}

/// Shadow doorbell slots for one queue: the `doorbell` word the host writes
/// and the `eventidx` word the device advances to the value at which it
/// next needs a real MMIO kick.
pub(crate) struct DbBuf {
    doorbell: *mut u32,
    eventidx: *mut u32,
}

impl DbBuf {
    pub(crate) fn new(doorbell: *mut u32, eventidx: *mut u32) -> Self {
        Self { doorbell, eventidx }
    }

    /// 16-bit wrap-aware threshold test: the device needs a kick iff the
    /// update moved the doorbell across `eventidx`.
    fn need_mmio(eventidx: u16, v: u16, old: u16) -> bool {
        v.wrapping_sub(eventidx) <= v.wrapping_sub(old)
    }

    /// Publish `v` through the shadow doorbell. Returns `true` when the
    /// caller must still ring the MMIO doorbell.
    pub(crate) fn update(&self, v: u16) -> bool {
        // queue entry stores must be visible before the doorbell moves
        mmio::wmb();

        let db = unsafe { AtomicU32::from_ptr(self.doorbell) };
        let old = u32::from_le(db.swap((v as u32).to_le(), Ordering::AcqRel)) as u16;

        // do not reorder the eventidx load with the doorbell store
        mmio::mb();

        let eventidx = u32::from_le(unsafe { self.eventidx.read_volatile() }) as u16;

        Self::need_mmio(eventidx, v, old)
    }
}

/// An NVMe completion queue.
///
/// The consumer side of a queue pair: entries become valid when their phase
/// tag differs from the queue's current phase; the phase flips every time
/// the head wraps.
pub struct CompQueue<B: IommuBackend> {
    id: u16,
    qsize: u16,
    mem: Dmabuf<B>,
    head: u16,
    phase: bool,
    doorbell: *mut u32,
    dbbuf: Option<DbBuf>,
    vector: Option<u16>,
}

unsafe impl<B: IommuBackend + Send + Sync> Send for CompQueue<B> {}

impl<B: IommuBackend> CompQueue<B> {
    pub(crate) fn new(
        id: u16,
        qsize: u16,
        mem: Dmabuf<B>,
        doorbell: *mut u32,
        dbbuf: Option<DbBuf>,
        vector: Option<u16>,
    ) -> Self {
        Self {
            id,
            qsize,
            mem,
            head: 0,
            phase: false,
            doorbell,
            dbbuf,
            vector,
        }
    }

    pub fn id(&self) -> u16 {
        self.id
    }

    pub fn qsize(&self) -> u16 {
        self.qsize
    }

    pub fn iova(&self) -> u64 {
        self.mem.iova()
    }

    pub fn vector(&self) -> Option<u16> {
        self.vector
    }

    /// Pointer to the entry at the current head.
    pub fn head_ptr(&self) -> *const Completion {
        unsafe { (self.mem.vaddr() as *const Completion).add(self.head as usize) }
    }

    fn head_valid(&self) -> bool {
        // the compiler must not hoist this load out of polling loops
        let sfp = unsafe { ((self.head_ptr() as *const u8).add(14) as *const u16).read_volatile() };

        (u16::from_le(sfp) & 0x1 != 0) != self.phase
    }

    /// If the entry at the head is valid, advance the head (flipping the
    /// phase on wrap) and return a copy of it.
    ///
    /// Does not write the head doorbell; see [`CompQueue::update_head`].
    pub fn get_cqe(&mut self) -> Option<Completion> {
        if !self.head_valid() {
            return None;
        }

        // prevent load/load reordering between the phase tag and the entry
        mmio::dma_rmb();

        let cqe = unsafe { self.head_ptr().read_volatile() };

        log::trace!("cq {} cqe cid {}", self.id, cqe.cid());

        self.head += 1;
        if self.head == self.qsize {
            self.head = 0;
            self.phase = !self.phase;
        }

        Some(cqe)
    }

    /// Busy-wait until the entry at the head becomes valid.
    pub fn spin(&self) {
        while !self.head_valid() {
            core::hint::spin_loop();
        }
    }

    /// Busy-wait for the next entry, consume it and write the head doorbell.
    pub fn poll(&mut self) -> Completion {
        loop {
            if let Some(cqe) = self.get_cqe() {
                self.update_head();
                return cqe;
            }

            core::hint::spin_loop();
        }
    }

    /// Busy-wait until exactly `n` entries have been consumed, appending
    /// them to `out`.
    ///
    /// Does not write the head doorbell; see [`CompQueue::update_head`].
    pub fn get_cqes(&mut self, out: &mut Vec<Completion>, n: usize) {
        let mut got = 0;

        while got < n {
            match self.get_cqe() {
                Some(cqe) => {
                    out.push(cqe);
                    got += 1;
                }
                None => core::hint::spin_loop(),
            }
        }
    }

    /// Like [`CompQueue::get_cqes`] but gives up when `timeout` elapses,
    /// leaving the entries consumed so far in `out`.
    ///
    /// Does not write the head doorbell; see [`CompQueue::update_head`].
    pub fn wait_cqes(
        &mut self,
        out: &mut Vec<Completion>,
        n: usize,
        timeout: Duration,
    ) -> Result<usize> {
        let deadline = ticks::now().wrapping_add(ticks::from_duration(timeout));
        let mut got = 0;

        while got < n {
            match self.get_cqe() {
                Some(cqe) => {
                    out.push(cqe);
                    got += 1;
                }
                None => {
                    if ticks::now() >= deadline {
                        return Err(Error::Timeout);
                    }

                    core::hint::spin_loop();
                }
            }
        }

        Ok(got)
    }

    /// Write the current head to the doorbell, going through the shadow
    /// doorbell when one is attached.
    pub fn update_head(&mut self) {
        log::trace!("cq {} head {}", self.id, self.head);

        if let Some(dbbuf) = &self.dbbuf {
            if !dbbuf.update(self.head) {
                return;
            }
        }

        unsafe { self.doorbell.write_volatile((self.head as u32).to_le()) };
    }
}

/// An NVMe submission queue.
///
/// The producer side of a queue pair, bound to the completion queue the
/// controller posts its completions to. Carries one request tracker per
/// usable slot, threaded through a LIFO freelist.
pub struct SubQueue<B: IommuBackend> {
    id: u16,
    qsize: u16,
    cq_id: u16,
    mem: Dmabuf<B>,
    pages: Dmabuf<B>,
    tail: u16,
    ptail: u16,
    doorbell: *mut u32,
    dbbuf: Option<DbBuf>,
    rqs: Vec<Request>,
    rq_top: AtomicU16,
}

unsafe impl<B: IommuBackend + Send + Sync> Send for SubQueue<B> {}
unsafe impl<B: IommuBackend + Send + Sync> Sync for SubQueue<B> {}

impl<B: IommuBackend> SubQueue<B> {
    /// `mem` holds `qsize` entries; `pages` holds one PRP page per tracker.
    pub(crate) fn new(
        id: u16,
        qsize: u16,
        cq_id: u16,
        mem: Dmabuf<B>,
        pages: Dmabuf<B>,
        doorbell: *mut u32,
        dbbuf: Option<DbBuf>,
    ) -> Self {
        let mut rqs = Vec::with_capacity(qsize as usize - 1);

        for i in 0..qsize - 1 {
            let next = if i == 0 { RQ_NONE } else { i - 1 };
            let page_vaddr =
                unsafe { pages.vaddr().add((i as usize) << PAGESHIFT) } as *mut u64;
            let page_iova = pages.iova() + ((i as u64) << PAGESHIFT);

            rqs.push(Request::new(i, next, page_vaddr, page_iova));
        }

        Self {
            id,
            qsize,
            cq_id,
            mem,
            pages,
            tail: 0,
            ptail: 0,
            doorbell,
            dbbuf,
            rqs,
            rq_top: AtomicU16::new(qsize - 2),
        }
    }

    pub fn id(&self) -> u16 {
        self.id
    }

    pub fn qsize(&self) -> u16 {
        self.qsize
    }

    /// Identifier of the bound completion queue.
    pub fn cq_id(&self) -> u16 {
        self.cq_id
    }

    pub fn iova(&self) -> u64 {
        self.mem.iova()
    }

    pub fn tail(&self) -> u16 {
        self.tail
    }

    /// The tracker occupying slot `cid`.
    pub fn request(&self, cid: u16) -> &Request {
        &self.rqs[cid as usize]
    }

    /// Pop a tracker off the freelist.
    pub fn acquire(&mut self) -> Result<u16> {
        let top = self.rq_top.load(Ordering::Relaxed);

        if top == RQ_NONE {
            return Err(Error::Busy);
        }

        let next = self.rqs[top as usize].next.load(Ordering::Relaxed);
        self.rq_top.store(next, Ordering::Relaxed);

        Ok(top)
    }

    /// Reset the tracker and push it back on the freelist.
    pub fn release(&mut self, cid: u16) {
        let rq = &self.rqs[cid as usize];

        rq.reset();
        rq.next.store(self.rq_top.load(Ordering::Relaxed), Ordering::Relaxed);
        self.rq_top.store(cid, Ordering::Relaxed);
    }

    /// Lock-free (compare-and-swap) version of [`SubQueue::acquire`], for
    /// queues shared between a producer and a completer thread.
    pub fn acquire_atomic(&self) -> Result<u16> {
        let mut top = self.rq_top.load(Ordering::Acquire);

        loop {
            if top == RQ_NONE {
                return Err(Error::Busy);
            }

            let next = self.rqs[top as usize].next.load(Ordering::Relaxed);

            match self
                .rq_top
                .compare_exchange_weak(top, next, Ordering::Acquire, Ordering::Acquire)
            {
                Ok(_) => return Ok(top),
                Err(observed) => top = observed,
            }
        }
    }

    /// Lock-free (compare-and-swap) version of [`SubQueue::release`].
    pub fn release_atomic(&self, cid: u16) {
        let rq = &self.rqs[cid as usize];

        rq.reset();

        let mut top = self.rq_top.load(Ordering::Acquire);

        loop {
            rq.next.store(top, Ordering::Relaxed);

            match self
                .rq_top
                .compare_exchange_weak(top, cid, Ordering::Release, Ordering::Acquire)
            {
                Ok(_) => return,
                Err(observed) => top = observed,
            }
        }
    }

    /// Copy an entry into the slot at the tail and advance the tail.
    pub fn post(&mut self, cmd: &Command) {
        unsafe {
            (self.mem.vaddr() as *mut Command)
                .add(self.tail as usize)
                .write_volatile(*cmd);
        }

        log::trace!("sq {} post tail {}", self.id, self.tail);

        self.tail += 1;
        if self.tail == self.qsize {
            self.tail = 0;
        }
    }

    /// Write the tail doorbell if the tail moved since the last write,
    /// going through the shadow doorbell when one is attached.
    pub fn update_tail(&mut self) {
        if self.tail == self.ptail {
            return;
        }

        log::trace!("sq {} tail {}", self.id, self.tail);

        let need_mmio = match &self.dbbuf {
            Some(dbbuf) => dbbuf.update(self.tail),
            None => true,
        };

        if need_mmio {
            // do not reorder queue entry stores with the doorbell store
            mmio::wmb();

            unsafe { self.doorbell.write_volatile((self.tail as u32).to_le()) };
        }

        self.ptail = self.tail;
    }

    /// Post an entry and ring the doorbell.
    pub fn exec(&mut self, cmd: &Command) {
        self.post(cmd);
        self.update_tail();
    }

    /// Stamp the tracker's cid into the entry and post it.
    pub fn rq_post(&mut self, cid: u16, cmd: &mut Command) {
        cmd.set_cid(cid);
        self.post(cmd);
    }

    /// Stamp the tracker's cid into the entry, post it and ring the
    /// doorbell.
    pub fn rq_exec(&mut self, cid: u16, cmd: &mut Command) {
        self.rq_post(cid, cmd);
        self.update_tail();
    }
}

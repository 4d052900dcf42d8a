#![allow(dead_code)]

//! A software NVMe controller model for driving the framework end to end.
//!
//! The mock exposes a register file as BAR0, records DMA mappings installed
//! through the backend trait, and runs a device thread that latches the
//! admin queue configuration, consumes submission queue entries through the
//! recorded mappings and posts phase-tagged completions.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering, fence};
use std::sync::{Arc, Mutex, Once};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use unvme::{IommuBackend, IommuCtx, IovaRange, MapFlags, Result};
use unvme::pci::PciDevice;
use unvme::ticks;

pub const BAR_LEN: usize = 0x2000;
pub const DOORBELL_BASE: usize = 0x1000;

pub const MOCK_VID: u16 = 0x1AF4;
pub const MOCK_SERIAL: &str = "MOCKSN123";
pub const MOCK_MODEL: &str = "Mock NVMe Controller";

/// 0-based number of I/O queues the mock grants.
pub const MOCK_GRANTED_QUEUES: u16 = 7;

/// Byte written into buffers by mock reads.
pub const MOCK_READ_FILL: u8 = 0xA5;

const REG_CC: usize = 0x14;
const REG_CSTS: usize = 0x1C;
const REG_AQA: usize = 0x24;
const REG_ASQ: usize = 0x28;
const REG_ACQ: usize = 0x30;

pub struct MockState {
    bar: Vec<AtomicU32>,
    dma: Mutex<HashMap<u64, (usize, usize)>>,
    dbbuf: Mutex<Option<(u64, u64)>>,
    stop: AtomicBool,
    support_dbbuf: bool,
}

impl MockState {
    fn new(support_dbbuf: bool) -> Self {
        let bar = (0..BAR_LEN / 4).map(|_| AtomicU32::new(0)).collect();

        Self {
            bar,
            dma: Mutex::new(HashMap::new()),
            dbbuf: Mutex::new(None),
            stop: AtomicBool::new(false),
            support_dbbuf,
        }
    }

    fn bar_ptr(&self) -> *mut u8 {
        self.bar.as_ptr() as *mut u8
    }

    /// Device-side view of a 32-bit register.
    pub fn reg32(&self, offset: usize) -> u32 {
        self.bar[offset / 4].load(Ordering::Acquire)
    }

    pub fn reg64(&self, offset: usize) -> u64 {
        let lo = self.reg32(offset) as u64;
        let hi = self.reg32(offset + 4) as u64;

        (hi << 32) | lo
    }

    fn set_reg32(&self, offset: usize, v: u32) {
        self.bar[offset / 4].store(v, Ordering::Release);
    }

    /// Translate a device address through the recorded DMA mappings.
    fn translate(&self, iova: u64) -> Option<*mut u8> {
        let dma = self.dma.lock().unwrap();

        for (&start, &(vaddr, len)) in dma.iter() {
            if iova >= start && iova < start + len as u64 {
                return Some((vaddr + (iova - start) as usize) as *mut u8);
            }
        }

        None
    }
}

#[derive(Clone)]
pub struct MockBackend {
    st: Arc<MockState>,
}

impl IommuBackend for MockBackend {
    type Device = MockPci;

    fn open_device(&self, _bdf: &str) -> Result<MockPci> {
        Ok(MockPci {
            st: self.st.clone(),
        })
    }

    fn dma_map(&self, vaddr: usize, len: usize, iova: u64, _flags: MapFlags) -> Result<()> {
        self.st.dma.lock().unwrap().insert(iova, (vaddr, len));
        Ok(())
    }

    fn dma_unmap(&self, iova: u64, _len: usize) -> Result<()> {
        self.st.dma.lock().unwrap().remove(&iova);
        Ok(())
    }

    fn iova_ranges(&self) -> Vec<IovaRange> {
        vec![IovaRange {
            start: 0x10000,
            last: (1 << 39) - 1,
        }]
    }
}

pub struct MockPci {
    st: Arc<MockState>,
}

impl PciDevice for MockPci {
    fn class_code(&self) -> Result<u32> {
        Ok(0x010802)
    }

    fn read_config(&self, buf: &mut [u8], _offset: usize) -> Result<()> {
        buf.fill(0);
        Ok(())
    }

    fn write_config(&self, _buf: &[u8], _offset: usize) -> Result<()> {
        Ok(())
    }

    fn map_bar(&self, _bar: usize, _len: usize, offset: usize) -> Result<*mut u8> {
        Ok(unsafe { self.st.bar_ptr().add(offset) })
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

struct SqModel {
    iova: u64,
    qsize: u16,
    head: u16,
    cqid: u16,
}

struct CqModel {
    iova: u64,
    qsize: u16,
    tail: u16,
    phase: bool,
}

struct Model {
    st: Arc<MockState>,
    sqs: HashMap<u16, SqModel>,
    cqs: HashMap<u16, CqModel>,
    aer_cid: Option<u16>,
}

impl Model {
    fn new(st: Arc<MockState>) -> Self {
        Self {
            st,
            sqs: HashMap::new(),
            cqs: HashMap::new(),
            aer_cid: None,
        }
    }

    fn run(mut self) {
        while !self.st.stop.load(Ordering::Acquire) {
            let cc = self.st.reg32(REG_CC);
            let csts = self.st.reg32(REG_CSTS);

            if cc & 1 == 1 && csts & 1 == 0 {
                self.latch_admin_queue();
                self.st.set_reg32(REG_CSTS, csts | 1);
            } else if cc & 1 == 0 && csts & 1 == 1 {
                self.sqs.clear();
                self.cqs.clear();
                self.aer_cid = None;
                *self.st.dbbuf.lock().unwrap() = None;
                self.st.set_reg32(REG_CSTS, csts & !1);
            }

            if self.st.reg32(REG_CSTS) & 1 == 1 {
                let qids: Vec<u16> = self.sqs.keys().copied().collect();
                for qid in qids {
                    self.service_sq(qid);
                }
            }

            thread::yield_now();
        }
    }

    fn latch_admin_queue(&mut self) {
        let aqa = self.st.reg32(REG_AQA);
        let qsize = (aqa & 0xFFF) as u16 + 1;

        self.sqs.insert(
            0,
            SqModel {
                iova: self.st.reg64(REG_ASQ),
                qsize,
                head: 0,
                cqid: 0,
            },
        );
        self.cqs.insert(
            0,
            CqModel {
                iova: self.st.reg64(REG_ACQ),
                qsize,
                tail: 0,
                phase: true,
            },
        );
    }

    fn service_sq(&mut self, qid: u16) {
        let tail = self.st.reg32(DOORBELL_BASE + 8 * qid as usize) as u16;

        loop {
            let (head, qsize, iova, cqid) = {
                let sq = &self.sqs[&qid];
                (sq.head, sq.qsize, sq.iova, sq.cqid)
            };

            if head == tail {
                break;
            }

            let Some(sqe_ptr) = self.st.translate(iova + head as u64 * 64) else {
                break;
            };

            let mut sqe = [0u8; 64];
            unsafe { std::ptr::copy_nonoverlapping(sqe_ptr, sqe.as_mut_ptr(), 64) };

            let next_head = (head + 1) % qsize;
            if let Some(sq) = self.sqs.get_mut(&qid) {
                sq.head = next_head;
            }

            self.execute(qid, cqid, next_head, &sqe);
        }
    }

    fn execute(&mut self, qid: u16, cqid: u16, sq_head: u16, sqe: &[u8; 64]) {
        let opcode = sqe[0];
        let cid = u16::from_le_bytes([sqe[2], sqe[3]]);
        let prp1 = u64::from_le_bytes(sqe[24..32].try_into().unwrap());
        let prp2 = u64::from_le_bytes(sqe[32..40].try_into().unwrap());
        let cdw10 = u32::from_le_bytes(sqe[40..44].try_into().unwrap());
        let cdw11 = u32::from_le_bytes(sqe[44..48].try_into().unwrap());
        let cdw12 = u32::from_le_bytes(sqe[48..52].try_into().unwrap());

        let (dw0, sc) = if qid == 0 {
            match opcode {
                // identify
                0x06 => (0, self.identify(cdw10 & 0xFF, prp1)),
                // set features
                0x09 => match cdw10 & 0xFF {
                    0x07 => {
                        let granted =
                            (MOCK_GRANTED_QUEUES as u32) | ((MOCK_GRANTED_QUEUES as u32) << 16);
                        (granted, 0)
                    }
                    0x0B => {
                        // enabling async events fires one pending notification
                        self.fire_aen(cqid);
                        (0, 0)
                    }
                    _ => (0, 0),
                },
                // create io completion queue
                0x05 => {
                    let cq_qid = (cdw10 & 0xFFFF) as u16;
                    let qsize = ((cdw10 >> 16) & 0xFFFF) as u16 + 1;
                    self.cqs.insert(
                        cq_qid,
                        CqModel {
                            iova: prp1,
                            qsize,
                            tail: 0,
                            phase: true,
                        },
                    );
                    (0, 0)
                }
                // create io submission queue
                0x01 => {
                    let sq_qid = (cdw10 & 0xFFFF) as u16;
                    let qsize = ((cdw10 >> 16) & 0xFFFF) as u16 + 1;
                    self.sqs.insert(
                        sq_qid,
                        SqModel {
                            iova: prp1,
                            qsize,
                            head: 0,
                            cqid: (cdw11 >> 16) as u16,
                        },
                    );
                    (0, 0)
                }
                // delete io submission queue
                0x00 => {
                    self.sqs.remove(&((cdw10 & 0xFFFF) as u16));
                    (0, 0)
                }
                // delete io completion queue
                0x04 => {
                    self.cqs.remove(&((cdw10 & 0xFFFF) as u16));
                    (0, 0)
                }
                // async event request: held until an event fires
                0x0C => {
                    self.aer_cid = Some(cid);
                    return;
                }
                // doorbell buffer config
                0x7C => {
                    *self.st.dbbuf.lock().unwrap() = Some((prp1, prp2));
                    (0, 0)
                }
                _ => (0, 0x01),
            }
        } else {
            match opcode {
                // read: fill the buffer with a recognizable pattern
                0x02 => {
                    let nlb = (cdw12 & 0xFFFF) as usize + 1;
                    let len = (nlb * 512).min(4096);

                    match self.st.translate(prp1) {
                        Some(ptr) => {
                            unsafe { std::ptr::write_bytes(ptr, MOCK_READ_FILL, len) };
                            (0, 0)
                        }
                        None => (0, 0x04),
                    }
                }
                // write and flush always succeed
                0x01 | 0x00 => (0, 0),
                _ => (0, 0x01),
            }
        };

        self.post_cqe(cqid, qid, sq_head, cid, dw0, sc);
    }

    fn identify(&self, cns: u32, prp1: u64) -> u16 {
        let Some(ptr) = self.st.translate(prp1) else {
            return 0x04;
        };

        unsafe { std::ptr::write_bytes(ptr, 0, 4096) };

        let put = |offset: usize, bytes: &[u8]| unsafe {
            std::ptr::copy_nonoverlapping(bytes.as_ptr(), ptr.add(offset), bytes.len());
        };

        match cns {
            // identify controller
            0x01 => {
                put(0, &MOCK_VID.to_le_bytes());
                put(4, &pad_ascii::<20>(MOCK_SERIAL));
                put(24, &pad_ascii::<40>(MOCK_MODEL));
                put(64, &pad_ascii::<8>("1.0"));

                if self.st.support_dbbuf {
                    put(256, &(1u16 << 8).to_le_bytes());
                }

                0
            }
            // active namespace id list
            0x02 => {
                put(0, &1u32.to_le_bytes());
                0
            }
            // identify namespace
            0x00 => 0,
            _ => 0x02,
        }
    }

    fn fire_aen(&mut self, cqid: u16) {
        let Some(aer_cid) = self.aer_cid.take() else {
            return;
        };

        // notice / namespace attribute changed / changed namespace list
        let dw0 = (2 << 16) | 0x04;
        let sq_head = self.sqs.get(&0).map(|sq| sq.head).unwrap_or(0);

        self.post_cqe(cqid, 0, sq_head, aer_cid, dw0, 0);
    }

    fn post_cqe(&mut self, cqid: u16, sqid: u16, sq_head: u16, cid: u16, dw0: u32, sc: u16) {
        let Some(cq) = self.cqs.get_mut(&cqid) else {
            return;
        };

        let Some(ptr) = self.st.translate(cq.iova + cq.tail as u64 * 16) else {
            return;
        };

        let status = (sc << 1) | cq.phase as u16;

        unsafe {
            std::ptr::copy_nonoverlapping(dw0.to_le_bytes().as_ptr(), ptr, 4);
            std::ptr::write_bytes(ptr.add(4), 0, 4);
            std::ptr::copy_nonoverlapping(sq_head.to_le_bytes().as_ptr(), ptr.add(8), 2);
            std::ptr::copy_nonoverlapping(sqid.to_le_bytes().as_ptr(), ptr.add(10), 2);
            std::ptr::copy_nonoverlapping(cid.to_le_bytes().as_ptr(), ptr.add(12), 2);

            // the entry must be visible before the phase tag flips
            fence(Ordering::Release);
            std::ptr::copy_nonoverlapping(status.to_le_bytes().as_ptr(), ptr.add(14), 2);
        }

        cq.tail += 1;
        if cq.tail == cq.qsize {
            cq.tail = 0;
            cq.phase = !cq.phase;
        }
    }
}

fn pad_ascii<const N: usize>(s: &str) -> [u8; N] {
    let mut out = [b' '; N];
    out[..s.len()].copy_from_slice(s.as_bytes());
    out
}

pub struct Mock {
    pub state: Arc<MockState>,
    handle: Option<JoinHandle<()>>,
}

impl Mock {
    pub fn start() -> Self {
        Self::start_with(false)
    }

    pub fn start_with(support_dbbuf: bool) -> Self {
        calibrate_ticks();

        let state = Arc::new(MockState::new(support_dbbuf));

        // CAP: mqes = 63 (0-based), to = 1, dstrd = 0, css = nvm, mpsmin = 0
        let cap: u64 = 63 | (1 << 24) | (1 << 37);
        state.set_reg32(0x0, cap as u32);
        state.set_reg32(0x4, (cap >> 32) as u32);
        // VS 1.4
        state.set_reg32(0x8, 0x0001_0400);

        let model = Model::new(state.clone());
        let handle = thread::spawn(move || model.run());

        Self {
            state,
            handle: Some(handle),
        }
    }

    pub fn backend(&self) -> MockBackend {
        MockBackend {
            st: self.state.clone(),
        }
    }

    pub fn ctx(&self) -> Arc<IommuCtx<MockBackend>> {
        Arc::new(IommuCtx::new(self.backend()))
    }

    /// The shadow doorbell page addresses recorded by the Doorbell Buffer
    /// Config command, if one arrived.
    pub fn dbbuf_pages(&self) -> Option<(u64, u64)> {
        *self.state.dbbuf.lock().unwrap()
    }

    /// Read a word from the shadow doorbell page, device-side.
    pub fn shadow_doorbell(&self, offset: usize) -> Option<u32> {
        let (doorbells, _) = self.dbbuf_pages()?;
        let ptr = self.state.translate(doorbells + offset as u64)?;

        Some(u32::from_le(unsafe { (ptr as *const u32).read_volatile() }))
    }
}

impl Drop for Mock {
    fn drop(&mut self) {
        self.state.stop.store(true, Ordering::Release);

        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

/// Measure the tick frequency against the host clock once per process.
fn calibrate_ticks() {
    static ONCE: Once = Once::new();

    ONCE.call_once(|| {
        let t0 = Instant::now();
        let start = ticks::now();

        thread::sleep(Duration::from_millis(50));

        let elapsed = t0.elapsed();
        let delta = ticks::now() - start;

        let hz = (delta as f64 / elapsed.as_secs_f64()) as u64;
        ticks::set_freq(hz.max(1));
    });
}
